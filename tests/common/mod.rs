#![allow(dead_code)]
use std::{
	collections::{BTreeMap, HashMap},
	error::Error,
	io,
	path::Path,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
};

use async_trait::async_trait;
use ldap3::{LdapConnAsync, SearchEntry};
use ldap_sd::{error::Error as StoreError, Connector, LdapConfig, Session, TargetGroupQuery};

/// A directory entry with the given single-valued attributes
pub fn entry(dn: &str, attributes: &[(&str, &str)]) -> SearchEntry {
	SearchEntry {
		dn: dn.to_owned(),
		attrs: attributes
			.iter()
			.map(|(key, value)| ((*key).to_owned(), vec![(*value).to_owned()]))
			.collect(),
		bin_attrs: HashMap::new(),
	}
}

/// A computer object as found in Active Directory
pub fn computer(name: &str, domain: &str, operating_system: &str) -> SearchEntry {
	let dns_host_name = format!("{}.{domain}", name.to_lowercase());
	entry(
		&format!("CN={name},OU=Servers,DC=x,DC=com"),
		&[("name", name), ("dNSHostName", &dns_host_name), ("operatingSystem", operating_system)],
	)
}

/// An error of the kind a dropped network connection produces
pub fn network_error() -> StoreError {
	StoreError::from(ldap3::LdapError::from(io::Error::new(
		io::ErrorKind::ConnectionReset,
		"connection reset by peer",
	)))
}

/// The error a server returns for a base DN which doesn't exist
pub fn no_such_object() -> StoreError {
	StoreError::from(ldap3::LdapError::LdapResult {
		result: ldap3::LdapResult {
			rc: 32,
			matched: String::new(),
			text: "no such object".to_owned(),
			refs: vec![],
			ctrls: vec![],
		},
	})
}

/// In-memory directory shared by all sessions of a [`FakeConnector`]
#[derive(Debug, Default)]
pub struct FakeDirectory {
	/// Entries below each base DN
	entries: Mutex<BTreeMap<String, Vec<SearchEntry>>>,
	/// Number of upcoming connection attempts which fail
	failing_connects: AtomicUsize,
	/// Errors returned by searches below a base DN instead of its entries
	failing_bases: Mutex<HashMap<String, fn() -> StoreError>>,
	/// Connection attempts made
	pub connects: AtomicUsize,
	/// Searches made
	pub searches: AtomicUsize,
	/// Sessions closed
	pub closes: AtomicUsize,
}

impl FakeDirectory {
	/// Replace the entries below `base`
	pub fn set_entries(&self, base: &str, entries: Vec<SearchEntry>) {
		self.entries.lock().unwrap().insert(base.to_owned(), entries);
	}

	/// Make the next `count` connection attempts fail with a network error
	pub fn fail_connects(&self, count: usize) {
		self.failing_connects.store(count, Ordering::SeqCst);
	}

	/// Make searches below `base` fail with the error produced by `error`
	pub fn fail_base(&self, base: &str, error: fn() -> StoreError) {
		self.failing_bases.lock().unwrap().insert(base.to_owned(), error);
	}

	/// Let searches below `base` succeed again
	pub fn heal_base(&self, base: &str) {
		self.failing_bases.lock().unwrap().remove(base);
	}

	pub fn connects(&self) -> usize {
		self.connects.load(Ordering::SeqCst)
	}

	pub fn searches(&self) -> usize {
		self.searches.load(Ordering::SeqCst)
	}

	pub fn closes(&self) -> usize {
		self.closes.load(Ordering::SeqCst)
	}
}

/// Connector handing out sessions on a [`FakeDirectory`]
#[derive(Debug, Clone, Default)]
pub struct FakeConnector {
	pub directory: Arc<FakeDirectory>,
}

#[async_trait]
impl Connector for FakeConnector {
	type Session = FakeSession;

	async fn connect(&self) -> Result<FakeSession, StoreError> {
		self.directory.connects.fetch_add(1, Ordering::SeqCst);
		let failing = self.directory.failing_connects.fetch_update(
			Ordering::SeqCst,
			Ordering::SeqCst,
			|remaining| remaining.checked_sub(1),
		);
		if failing.is_ok() {
			return Err(network_error());
		}
		Ok(FakeSession { directory: self.directory.clone(), closed: false })
	}
}

#[derive(Debug)]
pub struct FakeSession {
	directory: Arc<FakeDirectory>,
	closed: bool,
}

#[async_trait]
impl Session for FakeSession {
	async fn search(
		&mut self,
		base: &str,
		_filter: &str,
		_attributes: &[String],
	) -> Result<Vec<SearchEntry>, StoreError> {
		self.directory.searches.fetch_add(1, Ordering::SeqCst);
		if let Some(error) = self.directory.failing_bases.lock().unwrap().get(base) {
			return Err(error());
		}
		Ok(self.directory.entries.lock().unwrap().get(base).cloned().unwrap_or_default())
	}

	fn is_closed(&self) -> bool {
		self.closed
	}

	async fn close(&mut self) -> Result<(), StoreError> {
		self.closed = true;
		self.directory.closes.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

/// Configuration with a `servers` group below `OU=Servers,DC=x,DC=com`
/// exporting on port 9100
pub fn ldap_config(cache_dir: &Path, cache_ttl: u64) -> LdapConfig {
	LdapConfig {
		server: "localhost:1389".to_owned(),
		bind_dn: "cn=admin,dc=example,dc=org".to_owned(),
		base_dn_mappings: BTreeMap::from([(
			"servers".to_owned(),
			TargetGroupQuery {
				base_dn_list: vec!["OU=Servers,DC=x,DC=com".to_owned()],
				exporter_port: 9100,
				attributes: vec![],
				filter: None,
			},
		)]),
		filter: None,
		default_attributes: vec!["operatingSystem".to_owned()],
		password_env_var: String::new(),
		authenticated: false,
		unsecured: false,
		search_base: String::new(),
		cache_dir: cache_dir.to_path_buf(),
		cache_ttl,
		max_reconnect_attempts: 3,
		reconnect_backoff_ms: 0,
		operation_timeout: 5,
	}
}

pub async fn ldap_connect() -> Result<ldap3::Ldap, Box<dyn Error>> {
	let (conn, mut ldap) = LdapConnAsync::new("ldap://localhost:1389").await?;
	let _handle = tokio::spawn(async move {
		if let Err(err) = conn.drive().await {
			panic!("Ldap connection error {err}");
		}
	});
	ldap.simple_bind("cn=admin,dc=example,dc=org", "adminpassword").await?.success()?;
	Ok(ldap)
}

pub async fn ldap_add_organizational_unit(
	ldap: &mut ldap3::Ldap,
	ou: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.add(
		&format!("ou={ou},dc=example,dc=org"),
		vec![("objectClass", ["organizationalUnit"].into())],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn ldap_delete_organizational_unit(
	ldap: &mut ldap3::Ldap,
	ou: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.delete(&format!("ou={ou},dc=example,dc=org")).await?.success()?;
	Ok(())
}

pub async fn ldap_add_person(
	ldap: &mut ldap3::Ldap,
	ou: &str,
	cn: &str,
	sn: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.add(
		&format!("cn={cn},ou={ou},dc=example,dc=org"),
		vec![("objectClass", ["inetOrgPerson"].into()), ("sn", [sn].into())],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn ldap_delete_person(
	ldap: &mut ldap3::Ldap,
	ou: &str,
	cn: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.delete(&format!("cn={cn},ou={ou},dc=example,dc=org")).await?.success()?;
	Ok(())
}
