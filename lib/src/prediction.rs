use chrono::Utc;
use segserve_core::{
	http::{Request, Response, Status},
	InstanceSegmentation, ModelConfig,
};
use serde_json::Value;
use std::{
	sync::{Arc, Mutex},
	time::Duration,
};
use tokio::{
	sync::{watch, RwLock},
	task::JoinHandle,
};

use crate::{
	errors::ValidationErrorSet,
	runner::{Error as RunnerError, Runner},
	shutdown::Shutdown,
	webhooks::WebhookSender,
};

pub type Extension = axum::Extension<Arc<Prediction>>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Already running a prediction")]
	AlreadyRunning,

	#[error("The prediction is not running")]
	NotRunning,

	#[error("The requested prediction does not exist")]
	Unknown,

	#[error("Failed to wait for prediction: {0}")]
	ReceiverError(#[from] watch::error::RecvError),

	#[error("Prediction task failed: {0}")]
	Task(#[from] tokio::task::JoinError),

	#[error("Failed to validate input")]
	Validation(#[from] ValidationErrorSet),
}

struct State {
	status: Status,
	id: Option<String>,
	request: Option<Request>,
	response: Option<Response>,
	cancel: Option<flume::Receiver<()>>,
	complete: Option<watch::Sender<Option<Response>>>,
}

impl Default for State {
	fn default() -> Self {
		Self {
			id: None,
			request: None,
			cancel: None,
			response: None,
			complete: None,
			status: Status::Idle,
		}
	}
}

/// The single prediction slot of the server.
///
/// A prediction moves `Idle -> Starting -> Processing -> Succeeded | Failed | Canceled`.
/// The last finished prediction stays around (so it can be fetched again by id) until the next one starts.
pub struct Prediction {
	runner: Runner,
	shutdown: Shutdown,
	webhooks: WebhookSender,
	/// Cancel signal of the current prediction, reachable without awaiting the state lock.
	cancel: Mutex<Option<flume::Sender<()>>>,
	state: RwLock<State>,
}

impl Prediction {
	/// Start loading the model and create an idle prediction slot.
	///
	/// # Errors
	///
	/// Returns an error if the runner or the webhook client cannot be created.
	pub fn setup<M: InstanceSegmentation>(
		config: ModelConfig,
		shutdown: Shutdown,
	) -> anyhow::Result<Self> {
		Ok(Self {
			cancel: Mutex::new(None),
			shutdown: shutdown.clone(),
			webhooks: WebhookSender::new()?,
			state: RwLock::new(State::default()),
			runner: Runner::new::<M>(config, shutdown)?,
		})
	}

	pub const fn runner(&self) -> &Runner {
		&self.runner
	}

	pub fn validate(&self, input: &Value) -> Result<(), ValidationErrorSet> {
		self.runner.validate(input)
	}

	pub async fn id(&self) -> Option<String> {
		self.state.read().await.id.clone()
	}

	#[cfg(test)]
	pub async fn status(&self) -> Status {
		self.state.read().await.status
	}

	pub async fn response(&self) -> Option<Response> {
		self.state.read().await.response.clone()
	}

	/// Claim the prediction slot for a new request. Returns the initial (processing) response.
	pub async fn init(&self, id: Option<String>, req: Request) -> Result<Response, Error> {
		let mut state = self.state.write().await;

		if matches!(state.status, Status::Starting | Status::Processing) {
			tracing::debug!("Attempted to re-initialize a prediction");
			return Err(Error::AlreadyRunning);
		}

		self.validate(&req.input)
			.map_err(|e| e.fill_loc(&["body", "input"]))?;

		tracing::debug!("Initializing prediction: {id:?}");

		let (cancel_tx, cancel_rx) = flume::unbounded();
		if let Ok(mut cancel) = self.cancel.lock() {
			*cancel = Some(cancel_tx);
		}

		let response = Response::starting(id.clone(), req.clone());
		*state = State {
			id,
			request: Some(req),
			status: Status::Starting,
			cancel: Some(cancel_rx),
			response: Some(response.clone()),
			complete: Some(watch::channel(None).0),
		};

		Ok(response)
	}

	/// Run the initialized prediction to completion.
	pub async fn process(&self) -> Result<Response, Error> {
		let (id, req, cancel) = {
			let mut state = self.state.write().await;

			if !matches!(state.status, Status::Starting) {
				tracing::debug!(
					"Attempted to process prediction while not ready: {:?}",
					state.id
				);
				return Err(Error::AlreadyRunning);
			}

			let req = state.request.clone().ok_or(Error::Unknown)?;
			let cancel = state.cancel.take().ok_or(Error::Unknown)?;
			state.status = Status::Processing;

			(state.id.clone(), req, cancel)
		};

		let started_at = Utc::now();
		tracing::debug!("Running prediction: {id:?}");

		if let Err(e) = self.webhooks.starting(id.clone(), &req).await {
			tracing::error!("Failed to send start webhook for prediction: {e:?}");
		}

		let response = tokio::select! {
			() = self.shutdown.handle() => {
				tracing::debug!("Shutdown requested. Cancelling running prediction: {id:?}");
				Response::canceled(id.clone(), req.clone(), started_at)
			},
			output = self.runner.run(req.input.clone(), cancel) => match output {
				Ok((output, predict_time)) => {
					Response::success(id.clone(), req.clone(), output, predict_time, started_at)
				},
				Err(RunnerError::Canceled) => Response::canceled(id.clone(), req.clone(), started_at),
				Err(error) => {
					tracing::debug!("Prediction {id:?} failed: {error}");
					Response::error(id.clone(), req.clone(), &error, started_at)
				},
			},
		};

		tracing::debug!("Prediction complete: {id:?} ({:?})", response.status);

		{
			let mut state = self.state.write().await;
			state.status = response.status;
			state.response = Some(response.clone());

			if let Some(complete) = &state.complete {
				complete.send_replace(Some(response.clone()));
			}
		}

		if let Err(e) = self.webhooks.finished(&req, response.clone()).await {
			tracing::error!("Failed to send finished webhook for prediction: {e:?}");
		}

		Ok(response)
	}

	/// Process the initialized prediction on a background task.
	pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<Response, Error>> {
		let prediction = Arc::clone(self);

		tokio::spawn(async move { prediction.process().await })
	}

	/// Wait for the prediction with the given id to finish.
	pub async fn wait_for(&self, id: &str) -> Result<Response, Error> {
		let mut complete = {
			let state = self.state.read().await;

			if state.id.as_deref() != Some(id) {
				tracing::debug!("Attempted to wait for prediction with unknown ID: {id:?}");
				return Err(Error::Unknown);
			}

			state
				.complete
				.as_ref()
				.map(watch::Sender::subscribe)
				.ok_or(Error::NotRunning)?
		};

		tracing::debug!("Waiting for prediction: {id:?}");
		loop {
			let response = complete.borrow_and_update().clone();
			if let Some(response) = response {
				return Ok(response);
			}

			complete.changed().await?;
		}
	}

	pub async fn cancel(&self, id: &str) -> Result<(), Error> {
		let state = self.state.read().await;

		if state.id.as_deref() != Some(id) {
			tracing::debug!("Attempted to cancel prediction with unknown ID: {id}");
			return Err(Error::Unknown);
		}

		if !matches!(state.status, Status::Processing) {
			tracing::debug!("Attempted to cancel prediction that is not running: {id}");
			return Err(Error::NotRunning);
		}

		tracing::debug!("Canceling prediction: {id}");
		self.signal_cancel();

		Ok(())
	}

	fn signal_cancel(&self) {
		if let Ok(cancel) = self.cancel.lock() {
			if let Some(cancel) = cancel.as_ref() {
				cancel.send(()).ok();
			}
		}
	}

	pub fn extension(self) -> Extension {
		axum::Extension(Arc::new(self))
	}
}

/// Runs a prediction on behalf of a synchronous request, canceling it if the request goes away first.
pub struct SyncGuard {
	prediction: Arc<Prediction>,
	armed: bool,
}

impl SyncGuard {
	pub fn new(prediction: Arc<Prediction>) -> Self {
		Self {
			prediction,
			armed: true,
		}
	}

	/// Process the initialized prediction, waiting at most `wait` for it.
	///
	/// Returns `None` if the prediction is still running after `wait`; it keeps running in the background.
	pub async fn run(mut self, wait: Option<Duration>) -> Result<Option<Response>, Error> {
		let task = self.prediction.spawn();

		let result = match wait {
			None => Some(task.await),
			Some(wait) => tokio::time::timeout(wait, task).await.ok(),
		};
		self.armed = false;

		match result {
			Some(response) => Ok(Some(response??)),
			None => {
				tracing::debug!("Prediction still running after {wait:?}, responding early");
				Ok(None)
			},
		}
	}
}

impl Drop for SyncGuard {
	fn drop(&mut self) {
		if self.armed {
			tracing::debug!("SyncGuard dropped, canceling prediction");
			self.prediction.signal_cancel();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::runner::{
		tests::{image_input, FakeModel},
		Health,
	};
	use segserve_core::Device;
	use serde_json::json;
	use std::time::Instant;

	async fn ready_prediction(model_dir: &str) -> Arc<Prediction> {
		let prediction = Arc::new(
			Prediction::setup::<FakeModel>(
				ModelConfig::new(model_dir, Device::Cpu),
				Shutdown::detached(),
			)
			.unwrap(),
		);

		let started = Instant::now();
		while !matches!(prediction.runner().health(), Health::Ready) {
			assert!(started.elapsed() < Duration::from_secs(5), "model never loaded");
			tokio::time::sleep(Duration::from_millis(10)).await;
		}

		prediction
	}

	fn request(input: Value) -> Request {
		serde_json::from_value(json!({ "input": input })).unwrap()
	}

	#[tokio::test]
	async fn synchronous_prediction_succeeds() {
		let prediction = ready_prediction("fast").await;

		let starting = prediction
			.init(Some("p1".to_string()), request(image_input(Some(0.5))))
			.await
			.unwrap();
		assert_eq!(starting.status, Status::Processing);

		let response = SyncGuard::new(prediction.clone())
			.run(None)
			.await
			.unwrap()
			.unwrap();

		assert_eq!(response.status, Status::Succeeded);
		assert_eq!(response.id.as_deref(), Some("p1"));
		assert_eq!(response.output.unwrap().as_array().unwrap().len(), 2);
		assert!(response.metrics.unwrap().contains_key("predict_time"));

		// the finished prediction can still be fetched by id
		assert_eq!(prediction.status().await, Status::Succeeded);
		assert_eq!(
			prediction.wait_for("p1").await.unwrap().status,
			Status::Succeeded
		);
	}

	#[tokio::test]
	async fn invalid_input_is_rejected_on_init() {
		let prediction = ready_prediction("fast").await;

		let result = prediction
			.init(None, request(json!({ "confidence_threshold": 0.5 })))
			.await;

		assert!(matches!(result, Err(Error::Validation(_))));
		assert_eq!(prediction.status().await, Status::Idle);
	}

	#[tokio::test]
	async fn failed_prediction_is_reported_in_response() {
		let prediction = ready_prediction("fast").await;

		prediction
			.init(None, request(json!({ "image": "data:text/plain;base64,aGVsbG8=" })))
			.await
			.unwrap();
		let response = prediction.process().await.unwrap();

		assert_eq!(response.status, Status::Failed);
		assert!(response.error.unwrap().contains("Failed to load input"));
	}

	#[tokio::test]
	async fn only_one_prediction_runs_at_a_time() {
		let prediction = ready_prediction("slow").await;

		prediction
			.init(Some("first".to_string()), request(image_input(None)))
			.await
			.unwrap();
		let task = prediction.spawn();

		assert!(matches!(
			prediction
				.init(Some("second".to_string()), request(image_input(None)))
				.await,
			Err(Error::AlreadyRunning)
		));
		assert!(matches!(prediction.cancel("second").await, Err(Error::Unknown)));

		let waited = prediction.wait_for("first").await.unwrap();
		let processed = task.await.unwrap().unwrap();
		assert_eq!(waited.status, Status::Succeeded);
		assert_eq!(processed.status, Status::Succeeded);

		// once finished, the slot can be reused
		prediction
			.init(Some("second".to_string()), request(image_input(None)))
			.await
			.unwrap();
		assert!(matches!(prediction.wait_for("first").await, Err(Error::Unknown)));
	}

	#[tokio::test]
	async fn running_prediction_can_be_canceled() {
		let prediction = ready_prediction("slow").await;

		prediction
			.init(Some("p1".to_string()), request(image_input(None)))
			.await
			.unwrap();
		let task = prediction.spawn();

		while !matches!(prediction.runner().health(), Health::Busy) {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		prediction.cancel("p1").await.unwrap();

		let response = task.await.unwrap().unwrap();
		assert_eq!(response.status, Status::Canceled);
		assert!(matches!(prediction.cancel("p1").await, Err(Error::NotRunning)));
	}

	/// Accepts webhooks, answering each after `delay`.
	fn slow_webhook(delay: Duration) -> String {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();

		let app = axum::Router::new().route(
			"/hook",
			axum::routing::post(move || async move {
				tokio::time::sleep(delay).await;
				axum::http::StatusCode::OK
			}),
		);
		tokio::spawn(axum::Server::from_tcp(listener).unwrap().serve(app.into_make_service()));

		format!("http://{addr}/hook")
	}

	#[tokio::test]
	async fn cancel_during_start_webhook_is_honored() {
		let prediction = ready_prediction("fast").await;
		let webhook = slow_webhook(Duration::from_millis(300));

		prediction
			.init(
				Some("p1".to_string()),
				serde_json::from_value(json!({ "input": image_input(None), "webhook": webhook }))
					.unwrap(),
			)
			.await
			.unwrap();
		let task = prediction.spawn();

		while prediction.status().await != Status::Processing {
			tokio::time::sleep(Duration::from_millis(1)).await;
		}
		// the runner hasn't been handed the prediction yet
		assert!(matches!(prediction.runner().health(), Health::Ready));
		prediction.cancel("p1").await.unwrap();

		let response = task.await.unwrap().unwrap();
		assert_eq!(response.status, Status::Canceled);
		assert_eq!(prediction.status().await, Status::Canceled);

		// the next prediction isn't affected by the earlier cancel
		prediction
			.init(Some("p2".to_string()), request(image_input(None)))
			.await
			.unwrap();
		assert_eq!(prediction.process().await.unwrap().status, Status::Succeeded);
	}

	#[tokio::test]
	async fn cancel_before_runner_pickup_is_honored() {
		let prediction = ready_prediction("fast").await;

		prediction
			.init(Some("p1".to_string()), request(image_input(None)))
			.await
			.unwrap();
		prediction.signal_cancel();

		assert_eq!(prediction.process().await.unwrap().status, Status::Canceled);
		assert!(matches!(prediction.runner().health(), Health::Ready));
	}

	#[tokio::test]
	async fn dropped_sync_request_cancels_prediction() {
		let prediction = ready_prediction("slow").await;

		prediction
			.init(Some("p1".to_string()), request(image_input(None)))
			.await
			.unwrap();

		let guard = SyncGuard::new(prediction.clone());
		assert!(
			tokio::time::timeout(Duration::from_millis(20), guard.run(None))
				.await
				.is_err()
		);

		let response = prediction.wait_for("p1").await.unwrap();
		assert_eq!(response.status, Status::Canceled);
	}

	#[tokio::test]
	async fn sync_run_can_respond_early() {
		let prediction = ready_prediction("slow").await;

		prediction
			.init(Some("p1".to_string()), request(image_input(None)))
			.await
			.unwrap();

		let early = SyncGuard::new(prediction.clone())
			.run(Some(Duration::from_millis(50)))
			.await
			.unwrap();
		assert!(early.is_none());

		// responding early doesn't cancel the prediction
		let response = prediction.wait_for("p1").await.unwrap();
		assert_eq!(response.status, Status::Succeeded);
	}
}
