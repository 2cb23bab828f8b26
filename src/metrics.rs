//! Prometheus metrics describing discovery, caching and the directory
//! connection.
//!
//! All metrics are registered in a [`Registry`] owned by [`Metrics`], not in
//! the process-wide default registry.
use std::fmt;

use prometheus::{
	Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
	TextEncoder,
};

/// Label naming the target group a sample belongs to
const GROUP_LABEL: &str = "group_name";

/// Commit the binary was built from, set by the build environment
const GIT_HASH: &str = match option_env!("LDAP_SD_GIT_HASH") {
	Some(hash) => hash,
	None => "unknown",
};

/// Handles to every metric, cheap to clone
#[derive(Clone)]
pub struct Metrics {
	/// Registry all metrics below are registered in
	registry: Registry,
	/// Live queries against the directory, counted before searching. The
	/// successful ones are this minus `server_requests_failed`.
	pub(crate) server_requests: IntCounterVec,
	/// Live queries which failed
	pub(crate) server_requests_failed: IntCounterVec,
	/// Requests answered from the cache
	pub(crate) cache_hits: IntCounterVec,
	/// Requests which found no valid cache entry
	pub(crate) cache_misses: IntCounterVec,
	/// Successful cache writes
	pub(crate) cache_update_success: IntCounterVec,
	/// Failed cache writes
	pub(crate) cache_update_fail: IntCounterVec,
	/// Connection attempts
	pub(crate) reconnects: IntCounter,
	/// Objects found by the last successful discovery
	pub(crate) group_objects: IntGaugeVec,
	/// Duration of HTTP requests per route
	pub(crate) request_duration: HistogramVec,
}

impl fmt::Debug for Metrics {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Metrics").finish_non_exhaustive()
	}
}

/// Create a counter family labelled by target group and register it
fn group_counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounterVec> {
	let counter = IntCounterVec::new(Opts::new(name, help), &[GROUP_LABEL])?;
	registry.register(Box::new(counter.clone()))?;
	Ok(counter)
}

impl Metrics {
	/// Create and register all metrics in a fresh registry
	pub fn new() -> prometheus::Result<Self> {
		let registry = Registry::new();

		let build_info = IntCounterVec::new(
			Opts::new("ldap_sd_build_info", "Build information of ldap-sd"),
			&["version", "git_hash"],
		)?;
		registry.register(Box::new(build_info.clone()))?;
		build_info.with_label_values(&[env!("CARGO_PKG_VERSION"), GIT_HASH]).inc();

		let reconnects = IntCounter::new(
			"ldap_sd_connect_total",
			"Number of times the connection to the remote LDAP server was (re-)established",
		)?;
		registry.register(Box::new(reconnects.clone()))?;

		let group_objects = IntGaugeVec::new(
			Opts::new(
				"ldap_sd_target_group_num_objects",
				"Number of objects last discovered for the target group",
			),
			&[GROUP_LABEL],
		)?;
		registry.register(Box::new(group_objects.clone()))?;

		let request_duration = HistogramVec::new(
			HistogramOpts::new("ldap_sd_req_duration_seconds", "Duration of HTTP requests."),
			&["path"],
		)?;
		registry.register(Box::new(request_duration.clone()))?;

		Ok(Self {
			server_requests: group_counter(
				&registry,
				"ldap_sd_server_requests_total",
				"Total number of requests to the remote LDAP server",
			)?,
			server_requests_failed: group_counter(
				&registry,
				"ldap_sd_server_requests_failed_total",
				"Total number of requests to the remote LDAP server which have failed",
			)?,
			cache_hits: group_counter(
				&registry,
				"ldap_sd_cache_hit_total",
				"Number of requests served directly from the local cache",
			)?,
			cache_misses: group_counter(
				&registry,
				"ldap_sd_cache_miss_total",
				"Number of requests which found no valid entry in the local cache",
			)?,
			cache_update_success: group_counter(
				&registry,
				"ldap_sd_cache_update_success_total",
				"Number of updates to the cache which have succeeded",
			)?,
			cache_update_fail: group_counter(
				&registry,
				"ldap_sd_cache_update_fail_total",
				"Number of updates to the cache which have failed",
			)?,
			reconnects,
			group_objects,
			request_duration,
			registry,
		})
	}

	/// Render all metrics in the Prometheus text exposition format
	pub fn encode(&self) -> prometheus::Result<String> {
		let mut buffer = Vec::new();
		TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
		String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
	}

	/// Number of live directory queries made for a group
	#[must_use]
	pub fn server_requests(&self, group: &str) -> u64 {
		self.server_requests.with_label_values(&[group]).get()
	}

	/// Number of failed live directory queries for a group
	#[must_use]
	pub fn server_requests_failed(&self, group: &str) -> u64 {
		self.server_requests_failed.with_label_values(&[group]).get()
	}

	/// Number of requests for a group answered from the cache
	#[must_use]
	pub fn cache_hits(&self, group: &str) -> u64 {
		self.cache_hits.with_label_values(&[group]).get()
	}

	/// Number of requests for a group which missed the cache
	#[must_use]
	pub fn cache_misses(&self, group: &str) -> u64 {
		self.cache_misses.with_label_values(&[group]).get()
	}

	/// Number of failed cache writes for a group
	#[must_use]
	pub fn cache_update_failures(&self, group: &str) -> u64 {
		self.cache_update_fail.with_label_values(&[group]).get()
	}

	/// Number of successful cache writes for a group
	#[must_use]
	pub fn cache_updates(&self, group: &str) -> u64 {
		self.cache_update_success.with_label_values(&[group]).get()
	}

	/// Number of HTTP requests timed for a route
	#[must_use]
	pub fn requests_timed(&self, path: &str) -> u64 {
		self.request_duration.with_label_values(&[path]).get_sample_count()
	}

	/// Number of connection attempts made
	#[must_use]
	pub fn reconnects(&self) -> u64 {
		self.reconnects.get()
	}

	/// Objects found by the last successful discovery of a group
	#[must_use]
	pub fn group_objects(&self, group: &str) -> i64 {
		self.group_objects.with_label_values(&[group]).get()
	}
}
