//! Config for the discovery server and its LDAP client.
use std::{
	collections::BTreeMap,
	path::{Path, PathBuf},
	time::Duration,
};

use figment::{
	providers::{Env, Format, Yaml},
	Figment,
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, ErrorKind};

/// The filter used when neither the target group nor the LDAP config sets
/// one. Also used to detect target groups which would scan the whole
/// directory.
pub const DEFAULT_FILTER: &str = "(&(objectClass=computer))";

/// Longest accepted cache TTL in seconds, one year
pub const MAX_CACHE_TTL: u64 = 31_536_000;

/// Prefix of environment variables which override configuration values.
pub const ENV_PREFIX: &str = "LDAP_SD_";

/// Top level configuration of the discovery server.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
	/// Address the HTTP server listens on
	#[serde(default = "default_server_host")]
	pub server_host: String,
	/// Port the HTTP server listens on
	#[serde(default = "default_server_port")]
	pub server_port: u16,
	/// Directory access and target group definitions
	pub ldap_config: LdapConfig,
}

/// LDAP configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct LdapConfig {
	/// The directory server, either as `host:port` or as a full `ldap://`,
	/// `ldaps://` or `ldapi://` URL
	pub server: String,
	/// The DN to bind as
	pub bind_dn: String,
	/// Target group name to query definition
	pub base_dn_mappings: BTreeMap<String, TargetGroupQuery>,
	/// Filter used by target groups which don't set their own
	#[serde(default)]
	pub filter: Option<String>,
	/// Attributes fetched for every target group
	pub default_attributes: Vec<String>,
	/// Name of the environment variable holding the bind password
	#[serde(default)]
	pub password_env_var: String,
	/// Bind with the password from `password_env_var` instead of an
	/// unauthenticated bind
	#[serde(default)]
	pub authenticated: bool,
	/// Upgrade the connection with StartTLS, without verifying the server
	/// certificate.
	///
	/// The name is historical: setting this makes the transport encrypted,
	/// not less secure than leaving it unset.
	#[serde(default)]
	pub unsecured: bool,
	/// Search root used by target groups that only define a custom filter
	#[serde(default)]
	pub search_base: String,
	/// Directory holding one cache file per target group
	#[serde(default = "default_cache_dir")]
	pub cache_dir: PathBuf,
	/// Seconds a discovered target group is served from cache. Zero is raised
	/// to one, there is no "never expire".
	#[serde(default)]
	pub cache_ttl: u64,
	/// Connection attempts before giving up
	#[serde(default = "default_max_reconnect_attempts")]
	pub max_reconnect_attempts: u32,
	/// Base delay between connection attempts in milliseconds, multiplied by
	/// the number of attempts made so far
	#[serde(default = "default_reconnect_backoff_ms")]
	pub reconnect_backoff_ms: u64,
	/// Timeout in seconds for establishing a connection and for each
	/// directory reply
	#[serde(default = "default_operation_timeout")]
	pub operation_timeout: u64,
}

/// How to discover the hosts of one target group.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct TargetGroupQuery {
	/// Subtree search roots. May be empty if `filter` is set.
	#[serde(default)]
	pub base_dn_list: Vec<String>,
	/// Port the exporter listens on for every host of the group
	pub exporter_port: u16,
	/// Attributes fetched in addition to the default ones
	#[serde(default)]
	pub attributes: Vec<String>,
	/// Custom filter overriding the default one
	#[serde(default)]
	pub filter: Option<String>,
}

impl TargetGroupQuery {
	/// The custom filter, ignoring blank values
	#[must_use]
	pub fn custom_filter(&self) -> Option<&str> {
		self.filter.as_deref().filter(|filter| !filter.trim().is_empty())
	}
}

/// Default for [`Config::server_host`]
fn default_server_host() -> String {
	"127.0.0.1".to_owned()
}

/// Default for [`Config::server_port`]
const fn default_server_port() -> u16 {
	8889
}

/// Default for [`LdapConfig::cache_dir`]
fn default_cache_dir() -> PathBuf {
	PathBuf::from("./.cache")
}

/// Default for [`LdapConfig::max_reconnect_attempts`]
const fn default_max_reconnect_attempts() -> u32 {
	3
}

/// Default for [`LdapConfig::reconnect_backoff_ms`]
const fn default_reconnect_backoff_ms() -> u64 {
	1000
}

/// Default for [`LdapConfig::operation_timeout`]
const fn default_operation_timeout() -> u64 {
	5
}

/// Shorthand for configuration errors
fn invalid(message: impl Into<String>) -> Error {
	Error::new(ErrorKind::InvalidConfig, message)
}

impl Config {
	/// Load the configuration from a YAML file, apply overrides from
	/// `LDAP_SD_`-prefixed environment variables (nested keys separated by
	/// `__`) and validate the result.
	pub fn load(path: &Path) -> Result<Self, Error> {
		if !path.is_file() {
			return Err(invalid(format!("config file {} does not exist", path.display())));
		}
		let figment =
			Figment::new().merge(Yaml::file(path)).merge(Env::prefixed(ENV_PREFIX).split("__"));
		Self::from_figment(figment)
	}

	/// Extract and validate the configuration from a prepared [`Figment`]
	pub fn from_figment(figment: Figment) -> Result<Self, Error> {
		let mut config: Config = figment
			.extract()
			.map_err(|err| invalid("could not parse configuration").with_source(err))?;
		config.validate()?;
		Ok(config)
	}

	/// Check the configuration for errors and fill in defaults
	pub fn validate(&mut self) -> Result<(), Error> {
		if self.server_host.trim().is_empty() {
			self.server_host = default_server_host();
		}
		if self.server_port == 0 {
			return Err(invalid("server_port must be between 1 and 65535"));
		}
		self.ldap_config.validate()
	}
}

impl LdapConfig {
	/// Check the LDAP configuration for errors and fill in defaults
	pub fn validate(&mut self) -> Result<(), Error> {
		if self.server.trim().is_empty() {
			return Err(invalid(
				"ldap_config.server must be set to a valid address (format: <LDAP_HOST>:<LDAP_PORT>)",
			));
		}
		self.url()?;
		if self.cache_dir.as_os_str().is_empty() {
			self.cache_dir = default_cache_dir();
		}
		if self.cache_ttl == 0 {
			self.cache_ttl = 1;
		}
		if self.cache_ttl > MAX_CACHE_TTL {
			return Err(invalid(format!(
				"ldap_config.cache_ttl must be at most {MAX_CACHE_TTL} seconds"
			)));
		}
		if self.bind_dn.trim().is_empty() {
			return Err(invalid("ldap_config.bind_dn must be set"));
		}
		if self.base_dn_mappings.is_empty() {
			return Err(invalid("ldap_config.base_dn_mappings must be set"));
		}
		for (name, group) in &self.base_dn_mappings {
			if name.trim().is_empty() {
				return Err(invalid("target group names must not be blank"));
			}
			if group.base_dn_list.is_empty() && group.custom_filter().is_none() {
				return Err(invalid(format!(
					"base_dn_list for {name} must have at least one base DN or custom filter must be set"
				)));
			}
			if group.exporter_port == 0 {
				return Err(invalid(format!("exporter_port for {name} must be between 1 and 65535")));
			}
		}
		if self.default_attributes.is_empty() {
			return Err(invalid("ldap_config.default_attributes must be set"));
		}
		if self.authenticated && self.password_env_var.trim().is_empty() {
			return Err(invalid("password_env_var must be specified when authenticated=true"));
		}
		if self.max_reconnect_attempts == 0 {
			return Err(invalid("ldap_config.max_reconnect_attempts must be at least 1"));
		}
		if self.operation_timeout == 0 {
			return Err(invalid("ldap_config.operation_timeout must be at least 1"));
		}
		Ok(())
	}

	/// The directory URL. Plain `host:port` values get the `ldap://` scheme.
	pub fn url(&self) -> Result<Url, Error> {
		let server = self.server.trim();
		let raw = if server.contains("://") { server.to_owned() } else { format!("ldap://{server}") };
		Url::parse(&raw)
			.map_err(|err| invalid(format!("invalid ldap_config.server {server:?}")).with_source(err))
	}

	/// How long discovered target groups stay cached
	#[must_use]
	pub fn cache_ttl(&self) -> Duration {
		Duration::from_secs(self.cache_ttl.max(1))
	}

	/// Base delay between reconnect attempts
	#[must_use]
	pub fn reconnect_backoff(&self) -> Duration {
		Duration::from_millis(self.reconnect_backoff_ms)
	}

	/// Timeout of a single directory operation
	#[must_use]
	pub fn operation_timeout(&self) -> Duration {
		Duration::from_secs(self.operation_timeout)
	}

	/// Returns an example configuration with a single `servers` group
	#[allow(dead_code)]
	pub(crate) fn example() -> Self {
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
			cache_dir: default_cache_dir(),
			cache_ttl: 60,
			max_reconnect_attempts: 3,
			reconnect_backoff_ms: 0,
			operation_timeout: 5,
		}
	}
}
