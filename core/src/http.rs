use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, time::Duration};
use url::Url;

use crate::adapter::DEFAULT_CONFIDENCE_THRESHOLD;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Status {
	#[serde(skip)]
	Idle,

	Failed,
	Starting,
	Canceled,
	Succeeded,
	Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEvent {
	Start,
	Output,
	Logs,
	Completed,
}

/// Input of a single prediction
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PredictionInput {
	/// Image to segment, as an http(s) URL or a data URL
	pub image: String,
	/// Minimum confidence for a detection to be reported (default: 0.8)
	#[validate(range(min = 0, max = 1))]
	pub confidence_threshold: Option<f32>,
}

impl PredictionInput {
	#[must_use]
	pub fn threshold(&self) -> f32 {
		self.confidence_threshold
			.unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD)
	}
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct Request<T = Value> {
	pub webhook: Option<Url>,
	pub webhook_event_filters: Option<Vec<WebhookEvent>>,

	pub input: T,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Response<Req = Value, Res = Value> {
	pub input: Option<Req>,
	pub output: Option<Res>,

	pub id: Option<String>,
	pub version: Option<String>,

	pub created_at: Option<DateTime<Utc>>,
	pub started_at: Option<DateTime<Utc>>,
	pub completed_at: Option<DateTime<Utc>>,

	pub logs: String,
	pub status: Status,
	pub error: Option<String>,

	pub metrics: Option<HashMap<String, Value>>,
}

impl Response {
	#[must_use]
	pub fn starting(id: Option<String>, req: Request) -> Self {
		Self {
			id,
			input: Some(req.input),
			status: Status::Processing,
			started_at: Some(Utc::now()),
			..Self::default()
		}
	}

	#[must_use]
	pub fn success(
		id: Option<String>,
		req: Request,
		output: Value,
		predict_time: Duration,
		started_at: DateTime<Utc>,
	) -> Self {
		Self {
			id,
			output: Some(output),
			input: Some(req.input),
			status: Status::Succeeded,
			started_at: Some(started_at),
			completed_at: Some(Utc::now()),
			metrics: Some(HashMap::from([(
				"predict_time".to_string(),
				predict_time.as_secs_f64().into(),
			)])),
			..Self::default()
		}
	}

	#[must_use]
	pub fn error(
		id: Option<String>,
		req: Request,
		error: &impl ToString,
		started_at: DateTime<Utc>,
	) -> Self {
		Self {
			id,
			input: Some(req.input),
			status: Status::Failed,
			started_at: Some(started_at),
			completed_at: Some(Utc::now()),
			error: Some(error.to_string()),
			..Self::default()
		}
	}

	#[must_use]
	pub fn canceled(id: Option<String>, req: Request, started_at: DateTime<Utc>) -> Self {
		Self {
			id,
			input: Some(req.input),
			status: Status::Canceled,
			started_at: Some(started_at),
			completed_at: Some(Utc::now()),
			..Self::default()
		}
	}
}

impl Default for Response {
	fn default() -> Self {
		Self {
			id: None,
			error: None,
			input: None,
			output: None,
			metrics: None,
			version: None,
			created_at: None,
			logs: String::new(),
			status: Status::Starting,
			started_at: None,
			completed_at: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn request() -> Request {
		serde_json::from_value(json!({
			"webhook": "https://example.com/hook",
			"webhook_event_filters": ["completed"],
			"input": { "image": "https://example.com/cat.jpg" }
		}))
		.unwrap()
	}

	#[test]
	fn request_is_deserialized() {
		let req = request();

		assert_eq!(req.webhook.unwrap().as_str(), "https://example.com/hook");
		assert_eq!(req.webhook_event_filters, Some(vec![WebhookEvent::Completed]));

		let input: PredictionInput = serde_json::from_value(req.input).unwrap();
		assert_eq!(input.threshold(), DEFAULT_CONFIDENCE_THRESHOLD);
	}

	#[test]
	fn success_response_records_predict_time() {
		let response = Response::success(
			Some("abc".to_string()),
			request(),
			json!([]),
			Duration::from_millis(1500),
			Utc::now(),
		);

		let value = serde_json::to_value(&response).unwrap();
		assert_eq!(value["status"], json!("succeeded"));
		assert_eq!(value["id"], json!("abc"));
		assert_eq!(value["metrics"]["predict_time"], json!(1.5));
		assert_eq!(value["input"]["image"], json!("https://example.com/cat.jpg"));
	}

	#[test]
	fn error_response_carries_message() {
		let response = Response::error(None, request(), &"boom", Utc::now());

		assert_eq!(response.status, Status::Failed);
		assert_eq!(response.error.as_deref(), Some("boom"));
		assert!(response.output.is_none());
	}
}
