use aide::OperationOutput;
use axum::{
	http::StatusCode,
	response::{IntoResponse, Response},
	Json,
};
use jsonschema::ErrorIterator;
use serde_json::{json, Value};

use crate::prediction::Error as PredictionError;

#[derive(Debug)]
pub struct HTTPError {
	detail: Value,
	status_code: StatusCode,
}

impl HTTPError {
	pub fn new(detail: &str) -> Self {
		Self {
			detail: detail.into(),
			status_code: StatusCode::UNPROCESSABLE_ENTITY,
		}
	}

	pub const fn with_status(mut self, status_code: StatusCode) -> Self {
		self.status_code = status_code;
		self
	}

	#[cfg(test)]
	pub const fn status_code(&self) -> StatusCode {
		self.status_code
	}
}

impl IntoResponse for HTTPError {
	fn into_response(self) -> Response {
		(self.status_code, Json(json!({ "detail": self.detail }))).into_response()
	}
}

impl OperationOutput for HTTPError {
	type Inner = Self;
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationError {
	msg: String,
	loc: Vec<String>,
}

#[derive(Debug, Clone, thiserror::Error, serde::Serialize)]
#[error("Validation Errors")]
pub struct ValidationErrorSet {
	errors: Vec<ValidationError>,
}

impl ValidationErrorSet {
	/// Prefix every error location with `loc`, e.g. `["body", "input"]`.
	pub fn fill_loc(mut self, loc: &[&str]) -> Self {
		for error in &mut self.errors {
			error.loc = loc
				.iter()
				.map(ToString::to_string)
				.chain(error.loc.drain(..))
				.collect();
		}

		self
	}
}

impl From<ErrorIterator<'_>> for ValidationErrorSet {
	fn from(e: ErrorIterator<'_>) -> Self {
		Self {
			errors: e
				.map(|e| ValidationError {
					msg: e.to_string(),
					loc: e.instance_path.into_vec(),
				})
				.collect(),
		}
	}
}

impl From<ValidationErrorSet> for HTTPError {
	fn from(e: ValidationErrorSet) -> Self {
		Self {
			status_code: StatusCode::UNPROCESSABLE_ENTITY,
			detail: serde_json::to_value(e.errors).unwrap_or_default(),
		}
	}
}

impl From<PredictionError> for HTTPError {
	fn from(e: PredictionError) -> Self {
		let status_code = match e {
			PredictionError::Validation(e) => return e.into(),
			PredictionError::Unknown => StatusCode::NOT_FOUND,
			PredictionError::AlreadyRunning | PredictionError::NotRunning => StatusCode::CONFLICT,
			PredictionError::ReceiverError(_) | PredictionError::Task(_) => {
				StatusCode::INTERNAL_SERVER_ERROR
			},
		};

		Self {
			status_code,
			detail: e.to_string().into(),
		}
	}
}
