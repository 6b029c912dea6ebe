use aide::axum::{
	routing::{post, put},
	ApiRouter,
};
use axum::{extract::Path, http::StatusCode, Extension, TypedHeader};
use axum_jsonschema::Json;
use segserve_core::http::{Request, Response};

use crate::{
	errors::HTTPError,
	helpers::headers::Prefer,
	prediction::{Extension as ExtractPrediction, SyncGuard},
};

pub fn handler() -> ApiRouter {
	ApiRouter::new()
		.api_route("/predictions", post(create_prediction))
		.api_route("/predictions/:prediction_id", put(create_prediction))
		.api_route(
			"/predictions/:prediction_id/cancel",
			post(cancel_prediction),
		)
}

async fn create_prediction(
	id: Option<Path<String>>,
	prefer: Option<TypedHeader<Prefer>>,
	Extension(prediction): ExtractPrediction,
	Json(req): Json<Request>,
) -> Result<(StatusCode, Json<Response>), HTTPError> {
	let id = id.map(|Path(id)| id);
	let prefer = prefer.map(|TypedHeader(prefer)| prefer).unwrap_or_default();
	let respond_async = prefer.respond_async();

	tracing::debug!(
		"Received {}prediction request{}.",
		if respond_async { "async " } else { "" },
		id.as_ref()
			.map_or(String::new(), |id| format!(" with id {id}")),
	);
	tracing::trace!("{req:?}");

	// Re-submitting a named prediction attaches to it instead of starting a new one.
	if let Some(id) = id.as_deref() {
		if prediction.id().await.as_deref() == Some(id) {
			if respond_async {
				if let Some(response) = prediction.response().await {
					return Ok((StatusCode::ACCEPTED, Json(response)));
				}
			}

			return Ok((StatusCode::OK, Json(prediction.wait_for(id).await?)));
		}
	}

	let response = prediction.init(id, req).await?;

	if respond_async {
		tracing::debug!("Running prediction asynchronously: {:?}", response.id);
		prediction.spawn();

		return Ok((StatusCode::ACCEPTED, Json(response)));
	}

	match SyncGuard::new(prediction.clone()).run(prefer.wait()).await? {
		Some(response) => Ok((StatusCode::OK, Json(response))),
		None => Ok((
			StatusCode::ACCEPTED,
			Json(prediction.response().await.unwrap_or(response)),
		)),
	}
}

async fn cancel_prediction(
	Path(id): Path<String>,
	Extension(prediction): ExtractPrediction,
) -> Result<Json<()>, HTTPError> {
	prediction.cancel(&id).await?;

	Ok(Json(()))
}
