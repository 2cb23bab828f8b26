//! Conversion of discovered objects into the Prometheus HTTP service
//! discovery format.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use self::patterns::{ALL_CAP, FIRST_CAP};
use crate::{
	entry::{DirectoryObject, BASE_ATTRIBUTES},
	error::{Error, ErrorKind},
};

/// Prefix of every label key. Prometheus drops `__meta_` labels after
/// relabeling unless they are explicitly kept.
pub const LABEL_PREFIX: &str = "__meta_ldap_";

/// Patterns of the snake case transform. They are literals, so compiling
/// them can't fail at runtime.
#[allow(clippy::expect_used)]
mod patterns {
	use lazy_static::lazy_static;
	use regex::Regex;

	lazy_static! {
		/// A character followed by a capitalized word
		pub(super) static ref FIRST_CAP: Regex =
			Regex::new("(.)([A-Z][a-z]+)").expect("valid regex");
		/// A lowercase letter or digit followed by a capital letter
		pub(super) static ref ALL_CAP: Regex = Regex::new("([a-z0-9])([A-Z])").expect("valid regex");
	}
}

/// One scrape target with its labels, as consumed by Prometheus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
	/// Always exactly one `host:port` address
	pub targets: Vec<String>,
	/// Label name to value
	pub labels: BTreeMap<String, String>,
}

impl TargetGroup {
	/// Build the target group of a single object
	#[must_use]
	pub fn from_object(object: &DirectoryObject, exporter_port: u16) -> Self {
		let mut labels = BTreeMap::new();
		for (key, value) in &object.attributes {
			if BASE_ATTRIBUTES.contains(&key.as_str()) {
				continue;
			}
			labels.entry(format!("{LABEL_PREFIX}{}", to_snake_case(key))).or_insert_with(|| value.clone());
		}
		Self { targets: vec![format!("{}:{exporter_port}", object.network_name())], labels }
	}
}

/// Convert a camel case attribute name to snake case, e.g. `operatingSystem`
/// to `operating_system`.
#[must_use]
pub fn to_snake_case(name: &str) -> String {
	let snake = FIRST_CAP.replace_all(name, "${1}_${2}");
	let snake = ALL_CAP.replace_all(&snake, "${1}_${2}");
	snake.to_lowercase()
}

/// Build one target group per object
#[must_use]
pub fn to_target_groups(objects: &[DirectoryObject], exporter_port: u16) -> Vec<TargetGroup> {
	objects.iter().map(|object| TargetGroup::from_object(object, exporter_port)).collect()
}

/// Serialize objects as a JSON array of target groups
pub fn serialize(objects: &[DirectoryObject], exporter_port: u16) -> Result<String, Error> {
	serde_json::to_string(&to_target_groups(objects, exporter_port)).map_err(|err| {
		Error::new(ErrorKind::Encoding, "could not encode target groups").with_source(err)
	})
}
