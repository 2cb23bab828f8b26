//! Lifecycle of the single directory connection shared by all requests.
//!
//! Every directory operation, connecting and searching alike, runs while
//! holding the one connection lock, so concurrent requests queue up instead of
//! interleaving operations on the shared session.
use std::{
	fmt,
	sync::atomic::{AtomicBool, Ordering},
	time::Duration,
};

use async_trait::async_trait;
use ldap3::{
	adapters::{Adapter, EntriesOnly, PagedResults},
	LdapConnAsync, LdapConnSettings, Scope, SearchEntry,
};
use secrecy::{ExposeSecret, SecretString};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
	config::LdapConfig,
	error::{Error, ErrorKind},
	metrics::Metrics,
};

/// Number of entries requested per page of a paged search
pub const PAGE_SIZE: i32 = 100;

/// Opens authenticated sessions to a directory server
#[async_trait]
pub trait Connector: Send + Sync {
	/// The session type produced by this connector
	type Session: Session + 'static;

	/// Dial the server, upgrade the transport if configured and bind
	async fn connect(&self) -> Result<Self::Session, Error>;
}

/// A bound connection to a directory server
#[async_trait]
pub trait Session: Send {
	/// Perform a paged subtree search below `base`, returning all entries
	async fn search(
		&mut self,
		base: &str,
		filter: &str,
		attributes: &[String],
	) -> Result<Vec<SearchEntry>, Error>;

	/// Whether the underlying connection is known to be gone
	fn is_closed(&self) -> bool;

	/// Unbind and close the connection
	async fn close(&mut self) -> Result<(), Error>;
}

/// [`Connector`] for real LDAP servers, based on `ldap3`
#[derive(Debug, Clone)]
pub struct LdapConnector {
	/// The server to connect to
	url: Url,
	/// The DN to bind as
	bind_dn: String,
	/// Environment variable holding the bind password, `None` for
	/// unauthenticated binds
	password_env_var: Option<String>,
	/// Upgrade plain connections with StartTLS, skipping certificate checks
	starttls: bool,
	/// Connect timeout and timeout for each directory reply
	timeout: Duration,
}

impl LdapConnector {
	/// Create a connector from the LDAP configuration
	pub fn from_config(config: &LdapConfig) -> Result<Self, Error> {
		Ok(Self {
			url: config.url()?,
			bind_dn: config.bind_dn.clone(),
			password_env_var: config.authenticated.then(|| config.password_env_var.clone()),
			starttls: config.unsecured,
			timeout: config.operation_timeout(),
		})
	}

	/// Connection settings for `ldap3`
	fn settings(&self) -> LdapConnSettings {
		LdapConnSettings::new()
			.set_conn_timeout(self.timeout)
			.set_starttls(self.starttls)
			.set_no_tls_verify(self.starttls)
	}

	/// The password to bind with. Unauthenticated binds use an empty one.
	fn password(&self) -> Result<SecretString, Error> {
		let Some(var) = &self.password_env_var else {
			return Ok(SecretString::from(String::new()));
		};
		std::env::var(var).map(SecretString::from).map_err(|err| {
			Error::new(ErrorKind::InvalidConfig, "bind password is not available")
				.with_context("password_env_var", var.clone())
				.with_source(err)
		})
	}
}

#[async_trait]
impl Connector for LdapConnector {
	type Session = LdapSession;

	async fn connect(&self) -> Result<LdapSession, Error> {
		let password = self.password()?;

		debug!(url = %self.url, starttls = self.starttls, "Dialing LDAP host");
		let (conn, mut ldap) =
			LdapConnAsync::from_url_with_settings(self.settings(), &self.url).await?;
		let driver = tokio::spawn(async move {
			if let Err(err) = conn.drive().await {
				warn!("Ldap connection error {err}");
			}
		});

		let bind = ldap
			.with_timeout(self.timeout)
			.simple_bind(&self.bind_dn, password.expose_secret())
			.await
			.and_then(ldap3::LdapResult::success);
		if let Err(err) = bind {
			driver.abort();
			return Err(Error::from(err).with_context("bind_dn", self.bind_dn.clone()));
		}

		Ok(LdapSession { ldap, driver, timeout: self.timeout })
	}
}

/// A bound `ldap3` connection
pub struct LdapSession {
	/// Handle used to issue operations
	ldap: ldap3::Ldap,
	/// Task driving the connection, finishes when the connection closes
	driver: JoinHandle<()>,
	/// Timeout for each directory reply
	timeout: Duration,
}

impl fmt::Debug for LdapSession {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LdapSession")
			.field("closed", &self.is_closed())
			.field("timeout", &self.timeout)
			.finish_non_exhaustive()
	}
}

#[async_trait]
impl Session for LdapSession {
	async fn search(
		&mut self,
		base: &str,
		filter: &str,
		attributes: &[String],
	) -> Result<Vec<SearchEntry>, Error> {
		let adapters: Vec<Box<dyn Adapter<_, _>>> =
			vec![Box::new(EntriesOnly::new()), Box::new(PagedResults::new(PAGE_SIZE))];
		let mut search = self
			.ldap
			.with_timeout(self.timeout)
			.streaming_search_with(adapters, base, Scope::Subtree, filter, attributes.to_vec())
			.await?;

		let mut entries = Vec::new();
		while let Some(entry) = search.next().await? {
			entries.push(SearchEntry::construct(entry));
		}
		search.finish().await.success()?;
		Ok(entries)
	}

	fn is_closed(&self) -> bool {
		self.driver.is_finished()
	}

	async fn close(&mut self) -> Result<(), Error> {
		let result = self.ldap.unbind().await;
		self.driver.abort();
		result.map_err(Error::from)
	}
}

/// Lifecycle state of the directory connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	/// No session is open
	Disconnected,
	/// A connection attempt is in progress
	Connecting,
	/// A bound session is open
	Connected,
	/// The last reconnect loop exhausted its attempts
	Failed,
}

/// The session slot guarded by the connection lock
struct Link<S> {
	/// The open session, if any
	session: Option<S>,
	/// Current lifecycle state
	state: ConnectionState,
	/// Attempts made by the current (or last) reconnect loop
	attempts: u32,
}

/// Owns the single directory session, reconnecting with a bounded number of
/// attempts when it is missing or closed.
pub struct ConnectionManager<C: Connector> {
	/// Opens new sessions
	connector: C,
	/// Attempts per reconnect loop
	max_attempts: u32,
	/// Base delay between attempts
	backoff: Duration,
	/// The session and its state
	link: Mutex<Link<C::Session>>,
	/// Set after a successful connect, cleared on exhaustion and shutdown
	ready: AtomicBool,
	/// Connection attempt counter
	metrics: Metrics,
}

impl<C: Connector> fmt::Debug for ConnectionManager<C> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConnectionManager")
			.field("max_attempts", &self.max_attempts)
			.field("backoff", &self.backoff)
			.field("ready", &self.is_ready())
			.finish_non_exhaustive()
	}
}

impl<C: Connector> ConnectionManager<C> {
	/// Create a manager without connecting
	pub fn new(connector: C, config: &LdapConfig, metrics: Metrics) -> Self {
		Self {
			connector,
			max_attempts: config.max_reconnect_attempts,
			backoff: config.reconnect_backoff(),
			link: Mutex::new(Link {
				session: None,
				state: ConnectionState::Disconnected,
				attempts: 0,
			}),
			ready: AtomicBool::new(false),
			metrics,
		}
	}

	/// Whether a connection has been established and not given up on since
	#[must_use]
	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Acquire)
	}

	/// The current lifecycle state
	pub async fn state(&self) -> ConnectionState {
		self.link.lock().await.state
	}

	/// Make sure a live session exists, reconnecting if needed
	pub async fn ensure_connected(&self) -> Result<(), Error> {
		let mut link = self.link.lock().await;
		self.session(&mut link).await.map(|_| ())
	}

	/// Run a paged subtree search on the shared session. A network failure
	/// drops the session so the next operation reconnects.
	pub async fn search(
		&self,
		base: &str,
		filter: &str,
		attributes: &[String],
	) -> Result<Vec<SearchEntry>, Error> {
		let mut link = self.link.lock().await;
		let session = self.session(&mut link).await?;
		let result = session.search(base, filter, attributes).await;
		if let Err(err) = &result {
			if err.is_transient() {
				warn!("Directory connection failed during search: {err}");
				link.session = None;
				link.state = ConnectionState::Disconnected;
			}
		}
		result
	}

	/// Unbind and drop the session. Safe to call repeatedly.
	pub async fn shutdown(&self) {
		let mut link = self.link.lock().await;
		self.ready.store(false, Ordering::Release);
		if let Some(mut session) = link.session.take() {
			if let Err(err) = session.close().await {
				warn!("Failed to close directory connection: {err}");
			}
			info!("Closed directory connection");
		}
		link.state = ConnectionState::Disconnected;
	}

	/// The live session, reconnecting first if there is none or it closed
	async fn session<'a>(
		&self,
		link: &'a mut Link<C::Session>,
	) -> Result<&'a mut C::Session, Error> {
		match link.session.take() {
			Some(session) if !session.is_closed() => Ok(link.session.insert(session)),
			stale => {
				if stale.is_some() {
					warn!("Directory connection was closed, reconnecting");
				}
				link.state = ConnectionState::Disconnected;
				let session = self.reconnect(link).await?;
				Ok(link.session.insert(session))
			}
		}
	}

	/// Try to connect up to `max_attempts` times. Only network-class failures
	/// are retried.
	async fn reconnect(&self, link: &mut Link<C::Session>) -> Result<C::Session, Error> {
		link.state = ConnectionState::Connecting;
		link.attempts = 0;
		let mut last_error = None;

		while link.attempts < self.max_attempts {
			if link.attempts > 0 {
				tokio::time::sleep(self.backoff.saturating_mul(link.attempts)).await;
			}
			link.attempts += 1;
			self.metrics.reconnects.inc();

			match self.connector.connect().await {
				Ok(session) => {
					info!(attempt = link.attempts, "Connected to directory");
					link.state = ConnectionState::Connected;
					link.attempts = 0;
					self.ready.store(true, Ordering::Release);
					return Ok(session);
				}
				Err(err) if err.is_transient() => {
					warn!(
						attempt = link.attempts,
						max_attempts = self.max_attempts,
						"Could not connect to directory: {err}"
					);
					last_error = Some(err);
				}
				Err(err) => {
					error!("Could not bind to directory: {err}");
					link.state = ConnectionState::Disconnected;
					return Err(err);
				}
			}
		}

		link.state = ConnectionState::Failed;
		self.ready.store(false, Ordering::Release);
		let mut err = Error::new(
			ErrorKind::MaxReconnects,
			format!("gave up after {} connection attempts", self.max_attempts),
		);
		if let Some(last) = last_error {
			err = err.with_source(last);
		}
		error!("{err}");
		Err(err)
	}
}
