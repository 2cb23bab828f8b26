//! The store façade: cache-aside discovery of target groups
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::{
	cache::{Cache, CacheLookup},
	config::LdapConfig,
	connection::{ConnectionManager, Connector},
	discovery::{Discovery, QueryPlan},
	entry::DirectoryObject,
	error::Error,
	metrics::Metrics,
	serializer,
};

/// Source of serialized target groups, as used by the HTTP layer
#[async_trait]
pub trait DataStore: Send + Sync {
	/// The target groups of `target_group` as a JSON array in the Prometheus
	/// HTTP service discovery format
	async fn serialize(&self, target_group: &str) -> Result<String, Error>;

	/// Whether the directory connection is usable
	fn is_ready(&self) -> bool;

	/// Release the directory connection. Safe to call repeatedly.
	async fn shutdown(&self);
}

/// Serves target groups from a [`Cache`], refreshing expired or missing
/// entries from the directory
#[derive(Debug)]
pub struct Store<C: Connector, K: Cache> {
	/// Directory and target group configuration
	config: Arc<LdapConfig>,
	/// Runs live directory queries
	discovery: Discovery<C>,
	/// Previously discovered objects per target group
	cache: K,
	/// Serializes cache writes
	cache_lock: Mutex<()>,
	/// Cache counters
	metrics: Metrics,
}

impl<C: Connector, K: Cache> Store<C, K> {
	/// Create a store. No connection is made until [`Store::connect`] or the
	/// first cache miss.
	pub fn new(config: Arc<LdapConfig>, connector: C, cache: K, metrics: Metrics) -> Self {
		let connection = ConnectionManager::new(connector, &config, metrics.clone());
		let discovery = Discovery::new(config.clone(), connection, metrics.clone());
		Self { config, discovery, cache, cache_lock: Mutex::new(()), metrics }
	}

	/// Connect to the directory eagerly
	pub async fn connect(&self) -> Result<(), Error> {
		self.discovery.connection().ensure_connected().await?;
		info!(server = %self.config.server, "Connected to directory");
		Ok(())
	}

	/// The metrics updated by this store
	#[must_use]
	pub fn metrics(&self) -> &Metrics {
		&self.metrics
	}

	/// The cache backing this store
	#[must_use]
	pub fn cache(&self) -> &K {
		&self.cache
	}

	/// The objects of `target_group`, from the cache while they are fresh
	pub async fn discover(&self, target_group: &str) -> Result<Vec<DirectoryObject>, Error> {
		let plan = QueryPlan::resolve(&self.config, target_group)?;
		self.lookup(target_group, &plan).await
	}

	/// Cache-aside lookup of an already resolved plan
	async fn lookup(
		&self,
		target_group: &str,
		plan: &QueryPlan,
	) -> Result<Vec<DirectoryObject>, Error> {
		match self.cache.get(target_group).await? {
			CacheLookup::Found(objects) => {
				debug!(group_name = target_group, "Serving target group from cache");
				self.metrics.cache_hits.with_label_values(&[target_group]).inc();
				return Ok(objects);
			}
			CacheLookup::Expired => {
				debug!(group_name = target_group, "Cache entry expired");
			}
			CacheLookup::NotFound => {
				debug!(group_name = target_group, "No cache entry");
			}
		}
		self.metrics.cache_misses.with_label_values(&[target_group]).inc();

		let objects = self.discovery.execute(target_group, plan).await?;
		self.store(target_group, &objects).await?;
		Ok(objects)
	}

	/// Write freshly discovered objects to the cache
	async fn store(&self, target_group: &str, objects: &[DirectoryObject]) -> Result<(), Error> {
		let _guard = self.cache_lock.lock().await;
		match self.cache.put(target_group, objects, self.config.cache_ttl()).await {
			Ok(()) => {
				self.metrics.cache_update_success.with_label_values(&[target_group]).inc();
				Ok(())
			}
			Err(err) => {
				self.metrics.cache_update_fail.with_label_values(&[target_group]).inc();
				error!(group_name = target_group, "Failed to update cache: {err}");
				Err(err)
			}
		}
	}
}

#[async_trait]
impl<C: Connector, K: Cache> DataStore for Store<C, K> {
	async fn serialize(&self, target_group: &str) -> Result<String, Error> {
		let result = async {
			let plan = QueryPlan::resolve(&self.config, target_group)?;
			let objects = self.lookup(target_group, &plan).await?;
			serializer::serialize(&objects, plan.exporter_port)
		}
		.await;
		result.map_err(|err| err.with_context("target_group", target_group))
	}

	fn is_ready(&self) -> bool {
		self.discovery.connection().is_ready()
	}

	async fn shutdown(&self) {
		self.discovery.connection().shutdown().await;
	}
}
