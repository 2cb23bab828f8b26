//! Prometheus HTTP service discovery backed by an LDAP directory.
//!
//! Target groups are named sets of hosts, each defined by one or more base
//! DNs to search below and/or a custom search filter. When Prometheus asks
//! for a group, the [`Store`] answers from its cache while the cached entry
//! is fresh. Otherwise it searches the directory over a single shared
//! connection, caches the result for the configured TTL and returns it in the
//! [HTTP service discovery format][http_sd]: one target per discovered host,
//! labelled with the requested attributes of its directory entry.
//!
//! For a general primer on LDAP, the [introduction] in the `ldap3` crate which
//! is used here for interfacing with LDAP is an excellent resource.
//!
//! [http_sd]: https://prometheus.io/docs/prometheus/latest/http_sd/
//! [introduction]: https://github.com/inejge/ldap3/blob/master/LDAP-primer.md
//!
//! # Getting started
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::{path::Path, sync::Arc};
//!
//! use ldap_sd::{Config, DataStore, FileCache, LdapConnector, Metrics, Store};
//!
//! let config = Config::load(Path::new("/etc/ldap-sd/server.yaml"))?;
//! let ldap_config = Arc::new(config.ldap_config);
//!
//! let connector = LdapConnector::from_config(&ldap_config)?;
//! let cache = FileCache::open(&ldap_config.cache_dir).await?;
//! let store = Store::new(ldap_config, connector, cache, Metrics::new()?);
//! store.connect().await?;
//!
//! println!("{}", store.serialize("servers").await?);
//! store.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Limitations
//! * All directory operations share one connection and run one at a time.
//! * Concurrent requests for the same expired group each query the directory.
//! * Requests carry no deadline of their own, only each directory operation
//!   is bounded by `operation_timeout`.
//! * `unsecured: true` upgrades the connection with StartTLS *without*
//!   verifying the server certificate.

pub mod cache;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod entry;
pub mod error;
pub mod metrics;
pub mod serializer;
pub mod server;
pub mod store;

pub use ldap3::{self, SearchEntry};

pub use crate::{
	cache::{Cache, CacheLookup, FileCache},
	config::{Config, LdapConfig, TargetGroupQuery},
	connection::{ConnectionManager, ConnectionState, Connector, LdapConnector, Session},
	entry::{DirectoryObject, SearchEntryExt},
	error::{Error, ErrorKind},
	metrics::Metrics,
	serializer::TargetGroup,
	store::{DataStore, Store},
};
