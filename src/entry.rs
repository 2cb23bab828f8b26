//! Helper methods for extracting data from search results, and the host
//! objects built from them.
use std::collections::BTreeMap;

use ldap3::SearchEntry;
use serde::{Deserialize, Serialize};

/// Attribute holding the short name of a host
pub const NAME_ATTRIBUTE: &str = "name";

/// Attribute holding the fully qualified network name of a host
pub const NETWORK_NAME_ATTRIBUTE: &str = "dNSHostName";

/// Attributes fetched for every target group. They are used to build the
/// target address and never become labels.
pub const BASE_ATTRIBUTES: [&str; 2] = [NAME_ATTRIBUTE, NETWORK_NAME_ATTRIBUTE];

/// An extension trait for [`SearchEntry`] that provides convenience methods for
/// extracting data.
pub trait SearchEntryExt {
	/// Get the first value of an attribute. Attribute names are matched
	/// exactly first and case-insensitively otherwise, since directory servers
	/// may return a different capitalization than requested.
	fn attr_first(&self, attr: &str) -> Option<&str>;

	/// Get the first value of an attribute, treating empty values as absent
	fn non_empty_attr_first(&self, attr: &str) -> Option<&str> {
		self.attr_first(attr).filter(|value| !value.is_empty())
	}
}

impl SearchEntryExt for SearchEntry {
	fn attr_first(&self, attr: &str) -> Option<&str> {
		let values = match self.attrs.get(attr) {
			Some(values) => values,
			None => {
				self.attrs.iter().find(|(name, _)| name.eq_ignore_ascii_case(attr)).map(|(_, v)| v)?
			}
		};
		values.first().map(String::as_str)
	}
}

/// A host discovered in the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryObject {
	/// Value of the `name` attribute
	pub hostname: String,
	/// Requested attribute name to first value. Missing attributes map to an
	/// empty string.
	pub attributes: BTreeMap<String, String>,
}

impl DirectoryObject {
	/// Build an object from a search result, keeping every requested
	/// attribute except `name`. Returns `None` if the entry has no network
	/// name, such entries can't be scraped.
	#[must_use]
	pub fn from_search(entry: &SearchEntry, requested: &[String]) -> Option<Self> {
		entry.non_empty_attr_first(NETWORK_NAME_ATTRIBUTE)?;
		let hostname = entry.attr_first(NAME_ATTRIBUTE).unwrap_or_default().to_owned();
		let attributes = requested
			.iter()
			.filter(|attr| attr.as_str() != NAME_ATTRIBUTE)
			.map(|attr| (attr.clone(), entry.attr_first(attr).unwrap_or_default().to_owned()))
			.collect();
		Some(Self { hostname, attributes })
	}

	/// The fully qualified network name of the host
	#[must_use]
	pub fn network_name(&self) -> &str {
		self.attributes.get(NETWORK_NAME_ATTRIBUTE).map_or("", String::as_str)
	}
}
