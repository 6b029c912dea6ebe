use std::sync::Arc;

use aide::{
	axum::{
		routing::{get, post},
		ApiRouter,
	},
	openapi::OpenApi,
};
use axum::{
	http::StatusCode,
	response::{IntoResponse, Response},
	Extension,
};
use axum_jsonschema::Json;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use segserve_core::ClassTable;

use crate::{
	errors::HTTPError,
	prediction::Extension as ExtractPrediction,
	runner::{Health, Setup},
	shutdown::Shutdown,
};

pub fn handler() -> ApiRouter {
	ApiRouter::new()
		.api_route("/", get(root))
		.api_route("/health-check", get(health_check))
		.api_route("/shutdown", post(shutdown))
		.api_route("/classes", get(classes))
		.route("/openapi.json", axum::routing::get(openapi))
}

#[derive(Debug, serde::Serialize, JsonSchema)]
pub struct RootResponse {
	/// Relative URL to OpenAPI specification
	pub openapi_url: String,
}

#[allow(clippy::unused_async)]
pub async fn root() -> Json<RootResponse> {
	Json(RootResponse {
		openapi_url: "/openapi.json".to_string(),
	})
}

#[allow(clippy::unused_async)]
async fn openapi(Extension(api): Extension<Arc<OpenApi>>) -> Response {
	axum::Json(api.as_ref()).into_response()
}

#[derive(Debug, serde::Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SetupStatus {
	Starting,
	Succeeded,
	Failed,
}

#[derive(Debug, serde::Serialize, JsonSchema)]
pub struct HealthCheckSetup {
	/// Setup logs
	pub logs: String,
	/// Setup status
	pub status: SetupStatus,
	/// Setup started time
	pub started_at: Option<DateTime<Utc>>,
	/// Setup completed time
	pub completed_at: Option<DateTime<Utc>>,
}

impl From<Setup> for HealthCheckSetup {
	fn from(setup: Setup) -> Self {
		let status = match (&setup.completed_at, &setup.error) {
			(_, Some(_)) => SetupStatus::Failed,
			(Some(_), None) => SetupStatus::Succeeded,
			(None, None) => SetupStatus::Starting,
		};

		Self {
			status,
			logs: setup.error.unwrap_or_default(),
			started_at: setup.started_at,
			completed_at: setup.completed_at,
		}
	}
}

#[derive(Debug, serde::Serialize, JsonSchema)]
pub struct HealthCheck {
	/// Current health status
	pub status: Health,
	/// Setup information
	pub setup: HealthCheckSetup,
}

#[allow(clippy::unused_async)]
pub async fn health_check(Extension(prediction): ExtractPrediction) -> Json<HealthCheck> {
	let runner = prediction.runner();

	Json(HealthCheck {
		status: runner.health(),
		setup: runner.setup().into(),
	})
}

#[allow(clippy::unused_async)]
pub async fn shutdown(Extension(shutdown): Extension<Shutdown>) -> Json<String> {
	shutdown.start();

	Json(String::new())
}

/// Class names of the loaded model, in class-index order.
#[allow(clippy::unused_async)]
pub async fn classes(
	Extension(prediction): ExtractPrediction,
) -> Result<Json<ClassTable>, HTTPError> {
	prediction.runner().classes().cloned().map(Json).ok_or_else(|| {
		HTTPError::new("Model is not ready yet").with_status(StatusCode::SERVICE_UNAVAILABLE)
	})
}
