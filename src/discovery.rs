//! Resolving target groups into directory searches and shaping the results
//! into [`DirectoryObject`]s.
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::{
	config::{LdapConfig, DEFAULT_FILTER},
	connection::{ConnectionManager, Connector},
	entry::{DirectoryObject, SearchEntryExt, BASE_ATTRIBUTES, NAME_ATTRIBUTE},
	error::{Error, ErrorKind},
	metrics::Metrics,
};

/// The searches needed to discover one target group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
	/// One paged subtree search is made below each of these
	pub bases: Vec<String>,
	/// Filter used for every search
	pub filter: String,
	/// Attributes requested from the server, without duplicates
	pub attributes: Vec<String>,
	/// Port appended to every discovered host
	pub exporter_port: u16,
}

impl QueryPlan {
	/// Work out the searches for `target_group`.
	///
	/// Fails with [`ErrorKind::InvalidTargetGroup`] for blank or unknown
	/// groups and with [`ErrorKind::InvalidQuery`] for groups whose
	/// configuration would search the directory unscoped.
	pub fn resolve(config: &LdapConfig, target_group: &str) -> Result<Self, Error> {
		if target_group.trim().is_empty() {
			return Err(Error::new(ErrorKind::InvalidTargetGroup, "no target group specified"));
		}
		let Some(group) = config.base_dn_mappings.get(target_group) else {
			return Err(Error::new(ErrorKind::InvalidTargetGroup, "target group is not configured")
				.with_context("target_group", target_group));
		};

		let custom_filter = group.custom_filter().map(str::trim);
		let bases = match (group.base_dn_list.is_empty(), custom_filter) {
			(false, _) => group.base_dn_list.clone(),
			(true, Some(DEFAULT_FILTER)) => {
				return Err(Error::new(
					ErrorKind::InvalidQuery,
					"the default filter requires at least one base DN",
				)
				.with_context("target_group", target_group));
			}
			(true, Some(_)) => vec![config.search_base.clone()],
			(true, None) => {
				return Err(Error::new(
					ErrorKind::InvalidQuery,
					"neither base DNs nor a custom filter are configured",
				)
				.with_context("target_group", target_group));
			}
		};

		let filter = custom_filter
			.or_else(|| config.filter.as_deref().map(str::trim).filter(|f| !f.is_empty()))
			.unwrap_or(DEFAULT_FILTER)
			.to_owned();

		let mut attributes: Vec<String> = Vec::new();
		let requested = config
			.default_attributes
			.iter()
			.map(String::as_str)
			.chain(BASE_ATTRIBUTES)
			.chain(group.attributes.iter().map(String::as_str));
		for attribute in requested {
			if !attributes.iter().any(|known| known == attribute) {
				attributes.push(attribute.to_owned());
			}
		}

		Ok(Self { bases, filter, attributes, exporter_port: group.exporter_port })
	}
}

/// Runs the searches of a target group against the shared connection
#[derive(Debug)]
pub struct Discovery<C: Connector> {
	/// Target group definitions
	config: Arc<LdapConfig>,
	/// The shared directory connection
	connection: ConnectionManager<C>,
	/// Request counters and object gauges
	metrics: Metrics,
}

impl<C: Connector> Discovery<C> {
	/// Create a discovery engine using `connection`
	pub fn new(config: Arc<LdapConfig>, connection: ConnectionManager<C>, metrics: Metrics) -> Self {
		Self { config, connection, metrics }
	}

	/// The shared directory connection
	#[must_use]
	pub fn connection(&self) -> &ConnectionManager<C> {
		&self.connection
	}

	/// Discover all objects of `target_group`
	pub async fn run(&self, target_group: &str) -> Result<Vec<DirectoryObject>, Error> {
		let plan = QueryPlan::resolve(&self.config, target_group)?;
		self.execute(target_group, &plan).await
	}

	/// Run the searches of an already resolved plan. The result is all or
	/// nothing, a failing search discards whatever earlier searches found.
	pub async fn execute(
		&self,
		target_group: &str,
		plan: &QueryPlan,
	) -> Result<Vec<DirectoryObject>, Error> {
		self.connection
			.ensure_connected()
			.await
			.map_err(|err| err.with_context("target_group", target_group))?;

		debug!(group_name = target_group, "Refreshing object listing from LDAP");
		self.metrics.server_requests.with_label_values(&[target_group]).inc();

		let mut objects = Vec::new();
		for base in &plan.bases {
			debug!(base_dn = %base, filter = %plan.filter, "Getting LDAP objects corresponding to base DN");
			let entries = match self.connection.search(base, &plan.filter, &plan.attributes).await {
				Ok(entries) => entries,
				Err(err) => {
					self.metrics.server_requests_failed.with_label_values(&[target_group]).inc();
					error!(base_dn = %base, "Could not run search against LDAP: {err}");
					return Err(err
						.with_context("target_group", target_group)
						.with_context("base_dn", base.clone()));
				}
			};

			debug!(base_dn = %base, total_objects = entries.len(), "Building results from discovered objects");
			for entry in &entries {
				match DirectoryObject::from_search(entry, &plan.attributes) {
					Some(object) => objects.push(object),
					None => warn!(
						dn = %entry.dn,
						name = entry.attr_first(NAME_ATTRIBUTE).unwrap_or_default(),
						"Skipping object as it's missing the dNSHostName attribute"
					),
				}
			}
		}

		self.metrics
			.group_objects
			.with_label_values(&[target_group])
			.set(i64::try_from(objects.len()).unwrap_or(i64::MAX));
		Ok(objects)
	}
}
