#![allow(
	clippy::dbg_macro,
	clippy::expect_used,
	clippy::missing_docs_in_private_items,
	clippy::print_stderr,
	clippy::print_stdout,
	clippy::unwrap_used
)]
use std::{error::Error, sync::Arc, time::Duration};

use async_trait::async_trait;
use ldap_sd::{
	Cache, CacheLookup, DataStore, DirectoryObject, ErrorKind, FileCache, LdapConfig, Metrics,
	Store, TargetGroup, TargetGroupQuery,
};
use tempfile::TempDir;
use tokio::sync::Barrier;

mod common;

use common::{computer, entry, ldap_config, network_error, no_such_object, FakeConnector};

const SERVERS: &str = "OU=Servers,DC=x,DC=com";

async fn setup(
	cache_ttl: u64,
	customize: impl FnOnce(&mut LdapConfig),
) -> (Store<FakeConnector, FileCache>, FakeConnector, TempDir) {
	let dir = tempfile::tempdir().unwrap();
	let mut config = ldap_config(dir.path(), cache_ttl);
	customize(&mut config);
	let connector = FakeConnector::default();
	let cache = FileCache::open(dir.path()).await.unwrap();
	let store = Store::new(Arc::new(config), connector.clone(), cache, Metrics::new().unwrap());
	(store, connector, dir)
}

#[tokio::test]
async fn end_to_end_example() -> Result<(), Box<dyn Error>> {
	let (store, connector, _dir) = setup(60, |_| {}).await;
	connector.directory.set_entries(SERVERS, vec![computer("HOST1", "x.com", "Linux")]);

	assert_eq!(
		store.serialize("servers").await?,
		r#"[{"targets":["host1.x.com:9100"],"labels":{"__meta_ldap_operating_system":"Linux"}}]"#
	);
	assert_eq!(store.metrics().group_objects("servers"), 1);
	Ok(())
}

#[tokio::test]
async fn one_target_group_per_qualifying_entry() -> Result<(), Box<dyn Error>> {
	let (store, connector, _dir) = setup(60, |_| {}).await;
	let mut entries: Vec<_> =
		(1..=5).map(|i| computer(&format!("HOST{i}"), "x.com", "Windows Server 2022")).collect();
	entries.push(entry("CN=PRINTER,OU=Servers,DC=x,DC=com", &[("name", "PRINTER")]));
	entries.push(entry(
		"CN=EMPTY,OU=Servers,DC=x,DC=com",
		&[("name", "EMPTY"), ("dNSHostName", "")],
	));
	connector.directory.set_entries(SERVERS, entries);

	let groups: Vec<TargetGroup> = serde_json::from_str(&store.serialize("servers").await?)?;
	assert_eq!(groups.len(), 5, "entries without dNSHostName are skipped");
	for (i, group) in groups.iter().enumerate() {
		assert_eq!(group.targets, [format!("host{}.x.com:9100", i + 1)]);
		assert_eq!(
			group.labels.keys().collect::<Vec<_>>(),
			["__meta_ldap_operating_system"],
			"base attributes are never labels"
		);
	}
	Ok(())
}

#[tokio::test]
async fn cached_within_ttl() -> Result<(), Box<dyn Error>> {
	let (store, connector, _dir) = setup(60, |_| {}).await;
	connector.directory.set_entries(SERVERS, vec![computer("HOST1", "x.com", "Linux")]);

	let first = store.serialize("servers").await?;
	connector.directory.set_entries(SERVERS, vec![computer("HOST2", "x.com", "Linux")]);
	let second = store.serialize("servers").await?;

	assert_eq!(first, second);
	assert_eq!(connector.directory.searches(), 1, "only the first call queries the directory");
	assert_eq!(store.metrics().server_requests("servers"), 1);
	assert_eq!(store.metrics().cache_misses("servers"), 1);
	assert_eq!(store.metrics().cache_hits("servers"), 1);

	let objects = store.discover("servers").await?;
	assert_eq!(objects.len(), 1);
	assert_eq!(objects[0].hostname, "HOST1");
	assert_eq!(store.metrics().cache_hits("servers"), 2);
	Ok(())
}

#[tokio::test]
async fn refreshed_after_ttl() -> Result<(), Box<dyn Error>> {
	let (store, connector, _dir) = setup(1, |_| {}).await;
	connector.directory.set_entries(SERVERS, vec![computer("HOST1", "x.com", "Linux")]);
	let first = store.serialize("servers").await?;

	connector.directory.set_entries(SERVERS, vec![computer("HOST2", "x.com", "Linux")]);
	tokio::time::sleep(Duration::from_millis(1100)).await;
	assert_eq!(store.cache().get("servers").await?, CacheLookup::Expired);

	let second = store.serialize("servers").await?;
	assert_ne!(first, second);
	assert!(second.contains("host2.x.com:9100"));
	assert_eq!(connector.directory.searches(), 2, "exactly one fresh discovery");
	assert_eq!(store.metrics().cache_misses("servers"), 2);
	assert_eq!(store.metrics().cache_hits("servers"), 0);
	Ok(())
}

#[tokio::test]
async fn empty_results_are_cached() -> Result<(), Box<dyn Error>> {
	let (store, connector, _dir) = setup(60, |_| {}).await;

	assert_eq!(store.serialize("servers").await?, "[]");
	assert_eq!(store.serialize("servers").await?, "[]");
	assert_eq!(connector.directory.searches(), 1);
	Ok(())
}

#[tokio::test]
async fn unknown_group_touches_nothing() -> Result<(), Box<dyn Error>> {
	let (store, connector, dir) = setup(60, |_| {}).await;

	for group in ["doesnotexist", ""] {
		let err = store.serialize(group).await.expect_err("group is not configured");
		assert_eq!(err.kind(), ErrorKind::InvalidTargetGroup);
	}
	assert_eq!(connector.directory.connects(), 0);
	assert_eq!(connector.directory.searches(), 0);
	assert_eq!(std::fs::read_dir(dir.path())?.count(), 0, "no cache file is written");
	Ok(())
}

#[tokio::test]
async fn reconnect_attempts_are_bounded() -> Result<(), Box<dyn Error>> {
	let (store, connector, _dir) = setup(60, |_| {}).await;
	connector.directory.fail_connects(3);

	let err = store.serialize("servers").await.expect_err("directory is unreachable");
	assert_eq!(err.kind(), ErrorKind::MaxReconnects);
	assert_eq!(err.context("target_group"), Some("servers"));
	assert_eq!(connector.directory.connects(), 3);
	assert_eq!(connector.directory.searches(), 0);
	assert_eq!(store.metrics().reconnects(), 3);
	assert_eq!(store.metrics().server_requests("servers"), 0, "no refresh was attempted");
	assert!(!store.is_ready());

	// The directory is back, the next request starts a fresh budget
	store.serialize("servers").await?;
	assert_eq!(connector.directory.connects(), 4);
	assert!(store.is_ready());
	Ok(())
}

#[tokio::test]
async fn eager_connect_fails_fast() {
	let (store, connector, _dir) = setup(60, |_| {}).await;
	connector.directory.fail_connects(usize::MAX);

	let err = store.connect().await.expect_err("directory is unreachable");
	assert_eq!(err.kind(), ErrorKind::MaxReconnects);
	assert_eq!(connector.directory.connects(), 3);
}

#[tokio::test]
async fn failing_base_discards_the_whole_group() -> Result<(), Box<dyn Error>> {
	const WORKSTATIONS: &str = "OU=Workstations,DC=x,DC=com";
	let (store, connector, _dir) = setup(60, |config| {
		let servers = config.base_dn_mappings.get_mut("servers").unwrap();
		servers.base_dn_list.push(WORKSTATIONS.to_owned());
	})
	.await;
	connector.directory.set_entries(SERVERS, vec![computer("HOST1", "x.com", "Linux")]);
	connector.directory.fail_base(WORKSTATIONS, no_such_object);

	let err = store.serialize("servers").await.expect_err("second base fails");
	assert_eq!(err.kind(), ErrorKind::Directory);
	assert_eq!(err.context("base_dn"), Some(WORKSTATIONS));
	assert_eq!(store.cache().get("servers").await?, CacheLookup::NotFound, "nothing is cached");
	assert_eq!(store.metrics().server_requests("servers"), 1);
	assert_eq!(store.metrics().server_requests_failed("servers"), 1);
	assert_eq!(connector.directory.connects(), 1, "directory errors don't reconnect");

	connector.directory.heal_base(WORKSTATIONS);
	connector.directory.set_entries(WORKSTATIONS, vec![computer("WS1", "x.com", "Windows 11")]);
	let groups: Vec<TargetGroup> = serde_json::from_str(&store.serialize("servers").await?)?;
	assert_eq!(groups.len(), 2);

	// Successful requests are the attempts minus the failures
	assert_eq!(store.metrics().server_requests("servers"), 2);
	assert_eq!(store.metrics().server_requests_failed("servers"), 1);
	Ok(())
}

#[tokio::test]
async fn dropped_connection_is_replaced() -> Result<(), Box<dyn Error>> {
	let (store, connector, _dir) = setup(60, |_| {}).await;
	connector.directory.fail_base(SERVERS, network_error);

	let err = store.serialize("servers").await.expect_err("connection drops");
	assert_eq!(err.kind(), ErrorKind::Directory);
	assert!(err.is_transient());

	connector.directory.heal_base(SERVERS);
	store.serialize("servers").await?;
	assert_eq!(connector.directory.connects(), 2);
	Ok(())
}

#[tokio::test]
async fn custom_filter_searches_once() -> Result<(), Box<dyn Error>> {
	let (store, connector, _dir) = setup(60, |config| {
		config.search_base = "DC=x,DC=com".to_owned();
		config.base_dn_mappings.insert(
			"web".to_owned(),
			TargetGroupQuery {
				filter: Some("(&(objectClass=computer)(cn=web*))".to_owned()),
				exporter_port: 9182,
				attributes: vec!["location".to_owned()],
				..TargetGroupQuery::default()
			},
		);
	})
	.await;
	connector.directory.set_entries(
		"DC=x,DC=com",
		vec![entry(
			"CN=WEB1,OU=Web,DC=x,DC=com",
			&[("name", "WEB1"), ("dNSHostName", "web1.x.com"), ("location", "dc2")],
		)],
	);

	let groups: Vec<TargetGroup> = serde_json::from_str(&store.serialize("web").await?)?;
	assert_eq!(connector.directory.searches(), 1);
	assert_eq!(groups.len(), 1);
	assert_eq!(groups[0].targets, ["web1.x.com:9182"]);
	assert_eq!(groups[0].labels["__meta_ldap_location"], "dc2");
	assert_eq!(groups[0].labels["__meta_ldap_operating_system"], "", "missing attributes are empty");
	Ok(())
}

#[tokio::test]
async fn unscoped_default_filter_is_rejected() {
	let (store, connector, _dir) = setup(60, |config| {
		config.base_dn_mappings.insert(
			"everything".to_owned(),
			TargetGroupQuery {
				filter: Some("(&(objectClass=computer))".to_owned()),
				exporter_port: 9100,
				..TargetGroupQuery::default()
			},
		);
	})
	.await;

	let err = store.serialize("everything").await.expect_err("query is unscoped");
	assert_eq!(err.kind(), ErrorKind::InvalidQuery);
	assert_eq!(connector.directory.connects(), 0);
}

#[tokio::test]
async fn corrupt_cache_is_a_hard_failure() -> Result<(), Box<dyn Error>> {
	let (store, connector, dir) = setup(60, |_| {}).await;
	std::fs::write(dir.path().join("servers.json"), "not json")?;

	let err = store.serialize("servers").await.expect_err("cache is unreadable");
	assert_eq!(err.kind(), ErrorKind::CacheFetch);
	assert_eq!(connector.directory.searches(), 0, "no fallback to the directory");
	Ok(())
}

#[tokio::test]
async fn concurrent_requests_share_the_connection() -> Result<(), Box<dyn Error>> {
	let (store, connector, _dir) = setup(60, |config| {
		for group in ["a", "b", "c", "d"] {
			config.base_dn_mappings.insert(
				group.to_owned(),
				TargetGroupQuery {
					base_dn_list: vec![format!("OU={group},DC=x,DC=com")],
					exporter_port: 9100,
					..TargetGroupQuery::default()
				},
			);
		}
	})
	.await;
	let store = Arc::new(store);

	let tasks: Vec<_> = ["a", "b", "c", "d"]
		.into_iter()
		.map(|group| {
			let store = store.clone();
			tokio::spawn(async move { store.serialize(group).await })
		})
		.collect();
	for task in tasks {
		assert_eq!(task.await??, "[]");
	}
	assert_eq!(connector.directory.connects(), 1);
	assert_eq!(connector.directory.searches(), 4);
	Ok(())
}

#[tokio::test]
async fn readiness_and_shutdown() -> Result<(), Box<dyn Error>> {
	let (store, connector, _dir) = setup(60, |_| {}).await;
	assert!(!store.is_ready());

	store.connect().await?;
	assert!(store.is_ready());

	store.shutdown().await;
	store.shutdown().await;
	assert!(!store.is_ready());
	assert_eq!(connector.directory.closes(), 1);
	Ok(())
}

#[tokio::test]
async fn failed_cache_write_fails_the_request() -> Result<(), Box<dyn Error>> {
	let (store, connector, dir) = setup(60, |_| {}).await;
	connector.directory.set_entries(SERVERS, vec![computer("HOST1", "x.com", "Linux")]);
	std::fs::remove_dir_all(dir.path())?;

	let err = store.serialize("servers").await.expect_err("cache directory is gone");
	assert_eq!(err.kind(), ErrorKind::CacheUpdate);
	assert_eq!(err.context("target_group"), Some("servers"));
	assert_eq!(connector.directory.searches(), 1);
	assert_eq!(store.metrics().cache_update_failures("servers"), 1);
	assert_eq!(store.metrics().cache_updates("servers"), 0);
	Ok(())
}

#[tokio::test]
async fn unrepresentable_ttl_is_a_cache_update_error() -> Result<(), Box<dyn Error>> {
	let (store, connector, dir) = setup(1_000_000_000_000, |_| {}).await;
	connector.directory.set_entries(SERVERS, vec![computer("HOST1", "x.com", "Linux")]);

	let err = store.serialize("servers").await.expect_err("expiry overflows");
	assert_eq!(err.kind(), ErrorKind::CacheUpdate);
	assert_eq!(store.metrics().cache_update_failures("servers"), 1);
	assert_eq!(store.cache().get("servers").await?, CacheLookup::NotFound);

	let mut config = ldap_config(dir.path(), 1_000_000_000_000);
	let err = config.validate().expect_err("TTL exceeds the cap");
	assert_eq!(err.kind(), ErrorKind::InvalidConfig);
	Ok(())
}

/// Holds every lookup until `barrier` is full, so all callers see the same
/// cold cache
struct GatedCache {
	inner: FileCache,
	barrier: Barrier,
}

#[async_trait]
impl Cache for GatedCache {
	async fn get(&self, key: &str) -> Result<CacheLookup, ldap_sd::Error> {
		let lookup = self.inner.get(key).await?;
		self.barrier.wait().await;
		Ok(lookup)
	}

	async fn put(
		&self,
		key: &str,
		objects: &[DirectoryObject],
		ttl: Duration,
	) -> Result<(), ldap_sd::Error> {
		self.inner.put(key, objects, ttl).await
	}
}

#[tokio::test]
async fn concurrent_misses_each_query_the_directory() -> Result<(), Box<dyn Error>> {
	const CALLERS: usize = 4;
	let dir = tempfile::tempdir()?;
	let connector = FakeConnector::default();
	connector.directory.set_entries(SERVERS, vec![computer("HOST1", "x.com", "Linux")]);
	let cache =
		GatedCache { inner: FileCache::open(dir.path()).await?, barrier: Barrier::new(CALLERS) };
	let store = Arc::new(Store::new(
		Arc::new(ldap_config(dir.path(), 60)),
		connector.clone(),
		cache,
		Metrics::new()?,
	));

	let tasks: Vec<_> = (0..CALLERS)
		.map(|_| {
			let store = store.clone();
			tokio::spawn(async move { store.serialize("servers").await })
		})
		.collect();
	for task in tasks {
		assert!(task.await??.contains("host1.x.com:9100"));
	}
	assert_eq!(connector.directory.searches(), CALLERS, "misses are not coalesced");
	assert_eq!(connector.directory.connects(), 1);
	assert_eq!(store.metrics().cache_misses("servers"), CALLERS as u64);
	assert_eq!(store.metrics().cache_updates("servers"), CALLERS as u64);
	Ok(())
}
