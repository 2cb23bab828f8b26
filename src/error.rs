//! Error codes

use std::fmt;

/// The closed set of failure categories the store can report.
///
/// Callers make control-flow decisions (HTTP status, process escalation) by
/// matching on the kind, never on the error's message or source type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	/// The requested target group is blank or not configured.
	InvalidTargetGroup,
	/// The query configuration of a target group is contradictory or would
	/// scan the directory unscoped.
	InvalidQuery,
	/// The reconnect budget was exhausted.
	MaxReconnects,
	/// A general local cache malfunction.
	Cache,
	/// Writing to the cache failed.
	CacheUpdate,
	/// Reading from the cache failed.
	CacheFetch,
	/// An underlying protocol, network or directory error.
	Directory,
	/// The configuration could not be loaded or failed validation.
	InvalidConfig,
	/// Discovered objects could not be encoded for the wire.
	Encoding,
}

impl ErrorKind {
	/// Stable machine-readable name of the kind
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::InvalidTargetGroup => "invalid_target_group",
			Self::InvalidQuery => "invalid_query",
			Self::MaxReconnects => "max_reconnects",
			Self::Cache => "cache",
			Self::CacheUpdate => "cache_update",
			Self::CacheFetch => "cache_fetch",
			Self::Directory => "directory",
			Self::InvalidConfig => "invalid_config",
			Self::Encoding => "encoding",
		}
	}

	/// Human-readable description of the kind
	const fn description(self) -> &'static str {
		match self {
			Self::InvalidTargetGroup => "Invalid or empty target group specified",
			Self::InvalidQuery => "Invalid LDAP query",
			Self::MaxReconnects => "Maximum reconnection attempts reached",
			Self::Cache => "A general cache error was encountered",
			Self::CacheUpdate => "The cache update operation failed",
			Self::CacheFetch => "The cache fetch operation failed",
			Self::Directory => "Directory operation failed",
			Self::InvalidConfig => "Invalid configuration",
			Self::Encoding => "Target groups could not be encoded",
		}
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.description())
	}
}

/// Errors that can occur when using this library
#[derive(thiserror::Error, Debug)]
#[error("{kind}: {message}{}", render_context(.context))]
pub struct Error {
	/// Category used for control flow
	kind: ErrorKind,
	/// Details about this particular failure
	message: String,
	/// Key/value pairs naming the objects involved, e.g. the target group
	context: Vec<(&'static str, String)>,
	/// The lower level error, if any
	#[source]
	source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

/// Formats the context pairs as ` (key=value, key=value)`
fn render_context(context: &[(&'static str, String)]) -> String {
	if context.is_empty() {
		return String::new();
	}
	let pairs: Vec<String> = context.iter().map(|(key, value)| format!("{key}={value}")).collect();
	format!(" ({})", pairs.join(", "))
}

impl Error {
	/// Create an error of the given kind
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self { kind, message: message.into(), context: Vec::new(), source: None }
	}

	/// Attach a piece of context. Keys which are already present keep their
	/// original value, so the innermost layer wins.
	#[must_use]
	pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
		if self.context(key).is_none() {
			self.context.push((key, value.into()));
		}
		self
	}

	/// Attach the lower level error that caused this one
	#[must_use]
	pub fn with_source(
		mut self,
		source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
	) -> Self {
		self.source = Some(source.into());
		self
	}

	/// The category of this error
	#[must_use]
	pub fn kind(&self) -> ErrorKind {
		self.kind
	}

	/// The message without kind or context
	#[must_use]
	pub fn message(&self) -> &str {
		&self.message
	}

	/// Look up a context value by key
	#[must_use]
	pub fn context(&self, key: &str) -> Option<&str> {
		self.context.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
	}

	/// Whether the failure is network-class (connection refused, reset,
	/// timed out, channel closed) and therefore worth reconnecting for.
	/// Directory result codes such as invalid credentials are not transient.
	#[must_use]
	pub fn is_transient(&self) -> bool {
		if self.kind != ErrorKind::Directory {
			return false;
		}
		let Some(source) = self.source.as_deref() else {
			return false;
		};
		match source.downcast_ref::<ldap3::LdapError>() {
			Some(
				ldap3::LdapError::Io { .. }
				| ldap3::LdapError::OpSend { .. }
				| ldap3::LdapError::ResultRecv { .. }
				| ldap3::LdapError::Timeout { .. }
				| ldap3::LdapError::EndOfStream,
			) => true,
			Some(_) => false,
			None => source.downcast_ref::<std::io::Error>().is_some(),
		}
	}
}

impl From<ldap3::LdapError> for Error {
	fn from(err: ldap3::LdapError) -> Self {
		Self::new(ErrorKind::Directory, err.to_string()).with_source(err)
	}
}
