//! Prometheus HTTP service discovery backed by an LDAP directory
use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context};
use clap::Parser;
use ldap_sd::{
	cache::FileCache,
	config::Config,
	connection::LdapConnector,
	metrics::Metrics,
	server::{router, AppState, ShutdownTrigger},
	store::{DataStore, Store},
};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// Command line flags
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
	/// Path to the configuration file
	#[arg(long = "conf", default_value = "/etc/ldap-sd/server.yaml")]
	conf: PathBuf,
	/// Log at debug level
	#[arg(long)]
	debug: bool,
	/// Only validate the configuration, then exit
	#[arg(long)]
	validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let level = if args.debug { LevelFilter::DEBUG } else { LevelFilter::INFO };
	let filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();
	tracing_subscriber::fmt().json().with_env_filter(filter).init();

	let config = Config::load(&args.conf)
		.with_context(|| format!("could not load {}", args.conf.display()))?;
	if args.validate {
		info!(path = %args.conf.display(), "Configuration is valid");
		return Ok(());
	}
	let config = Arc::new(config);
	let ldap_config = Arc::new(config.ldap_config.clone());

	let metrics = Metrics::new().context("could not register metrics")?;
	let connector = LdapConnector::from_config(&ldap_config)?;
	let cache = FileCache::open(&ldap_config.cache_dir).await?;
	let store = Arc::new(Store::new(ldap_config, connector, cache, metrics.clone()));
	store.connect().await.context("could not connect to the directory")?;

	let shutdown = Arc::new(ShutdownTrigger::new());
	let state = AppState {
		store: store.clone(),
		config: config.clone(),
		metrics,
		shutdown: shutdown.clone(),
	};

	let address = format!("{}:{}", config.server_host, config.server_port);
	let listener =
		TcpListener::bind(&address).await.with_context(|| format!("could not listen on {address}"))?;
	info!(%address, "Serving service discovery");

	axum::serve(listener, router(state))
		.with_graceful_shutdown(shutdown_signal(shutdown.clone()))
		.await
		.context("HTTP server failed")?;

	store.shutdown().await;
	if shutdown.is_triggered() {
		bail!("shut down after exhausting directory reconnect attempts");
	}
	info!("Shut down");
	Ok(())
}

/// Resolves on SIGINT, SIGTERM or an escalated shutdown
async fn shutdown_signal(trigger: Arc<ShutdownTrigger>) {
	let ctrl_c = async {
		if let Err(err) = tokio::signal::ctrl_c().await {
			error!("Could not listen for SIGINT: {err}");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut signal) => {
				signal.recv().await;
			}
			Err(err) => {
				error!("Could not listen for SIGTERM: {err}");
				std::future::pending::<()>().await;
			}
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => info!("Received SIGINT"),
		() = terminate => info!("Received SIGTERM"),
		() = trigger.triggered() => error!("Shutting down because the directory is unreachable"),
	}
}
