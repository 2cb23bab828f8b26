//! HTTP interface exposing the store to Prometheus
use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc,
};

use axum::{
	extract::{MatchedPath, Query, Request, State},
	http::{header, StatusCode},
	middleware::{self, Next},
	response::{IntoResponse, Response},
	routing::get,
	Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::{
	config::Config,
	error::{Error, ErrorKind},
	metrics::Metrics,
	store::DataStore,
};

/// Content type of the Prometheus text exposition format
const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Content type of the `/config` response
const CONFIG_CONTENT_TYPE: &str = "text/yaml";

/// Process-wide shutdown request raised when the directory is unreachable
#[derive(Debug, Default)]
pub struct ShutdownTrigger {
	/// Wakes the task waiting in [`ShutdownTrigger::triggered`]
	notify: Notify,
	/// Whether shutdown was requested
	escalated: AtomicBool,
}

impl ShutdownTrigger {
	/// Create an untriggered instance
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Request shutdown. Only the first call has an effect.
	pub fn trigger(&self) {
		if !self.escalated.swap(true, Ordering::AcqRel) {
			self.notify.notify_one();
		}
	}

	/// Whether shutdown was requested
	#[must_use]
	pub fn is_triggered(&self) -> bool {
		self.escalated.load(Ordering::Acquire)
	}

	/// Wait until shutdown is requested
	pub async fn triggered(&self) {
		if self.is_triggered() {
			return;
		}
		self.notify.notified().await;
	}
}

/// Shared state of all handlers
#[derive(Clone)]
pub struct AppState {
	/// Serves the target groups
	pub store: Arc<dyn DataStore>,
	/// Effective configuration, shown on `/config`
	pub config: Arc<Config>,
	/// Rendered on `/metrics`
	pub metrics: Metrics,
	/// Raised when the reconnect budget is exhausted
	pub shutdown: Arc<ShutdownTrigger>,
}

impl std::fmt::Debug for AppState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AppState")
			.field("ready", &self.store.is_ready())
			.field("shutdown", &self.shutdown)
			.finish_non_exhaustive()
	}
}

/// Build the router serving `/targets`, `/health`, `/config` and `/metrics`
pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/targets", get(targets))
		.route("/health", get(health))
		.route("/config", get(config))
		.route("/metrics", get(metrics))
		.route_layer(middleware::from_fn_with_state(state.clone(), record_duration))
		.with_state(state)
}

/// Observe the duration of every request, labelled by its route
async fn record_duration(State(state): State<AppState>, request: Request, next: Next) -> Response {
	let path = request
		.extensions()
		.get::<MatchedPath>()
		.map_or_else(|| request.uri().path().to_owned(), |path| path.as_str().to_owned());
	let timer = state.metrics.request_duration.with_label_values(&[&path]).start_timer();
	let response = next.run(request).await;
	timer.observe_duration();
	response
}

/// HTTP status reported for an error kind
#[must_use]
pub fn status_for(kind: ErrorKind) -> StatusCode {
	match kind {
		ErrorKind::InvalidTargetGroup | ErrorKind::InvalidQuery => StatusCode::BAD_REQUEST,
		ErrorKind::MaxReconnects => StatusCode::SERVICE_UNAVAILABLE,
		ErrorKind::Directory => StatusCode::BAD_GATEWAY,
		ErrorKind::Cache
		| ErrorKind::CacheUpdate
		| ErrorKind::CacheFetch
		| ErrorKind::InvalidConfig
		| ErrorKind::Encoding => StatusCode::INTERNAL_SERVER_ERROR,
	}
}

/// JSON body of error responses
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
	/// Machine-readable error kind
	pub error: String,
	/// Human-readable description
	pub message: String,
}

/// An [`Error`] rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let kind = self.0.kind();
		let body = ErrorBody { error: kind.as_str().to_owned(), message: self.0.to_string() };
		(status_for(kind), Json(body)).into_response()
	}
}

/// Query parameters of `/targets`
#[derive(Debug, Deserialize)]
struct TargetsQuery {
	/// Name of the requested target group
	#[serde(rename = "targetGroup", default)]
	target_group: String,
}

/// Serve the target groups of the requested group
async fn targets(State(state): State<AppState>, Query(query): Query<TargetsQuery>) -> Response {
	debug!(group_name = %query.target_group, "Serving target group");
	match state.store.serialize(&query.target_group).await {
		Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
		Err(err) => {
			if err.kind() == ErrorKind::MaxReconnects {
				error!("Directory is unreachable, shutting down: {err}");
				state.shutdown.trigger();
			} else {
				warn!(group_name = %query.target_group, "Request failed: {err}");
			}
			ApiError(err).into_response()
		}
	}
}

/// Readiness of the directory connection
async fn health(State(state): State<AppState>) -> Response {
	if state.store.is_ready() {
		(StatusCode::OK, "OK").into_response()
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "Not connected to the directory").into_response()
	}
}

/// The effective configuration, in the format of the configuration file
async fn config(State(state): State<AppState>) -> Response {
	match serde_saphyr::to_string(&*state.config) {
		Ok(body) => ([(header::CONTENT_TYPE, CONFIG_CONTENT_TYPE)], body).into_response(),
		Err(err) => ApiError(
			Error::new(ErrorKind::Encoding, "could not encode configuration").with_source(err),
		)
		.into_response(),
	}
}

/// All metrics in the Prometheus text format
async fn metrics(State(state): State<AppState>) -> Response {
	match state.metrics.encode() {
		Ok(body) => ([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], body).into_response(),
		Err(err) => {
			error!("Could not encode metrics: {err}");
			StatusCode::INTERNAL_SERVER_ERROR.into_response()
		}
	}
}
