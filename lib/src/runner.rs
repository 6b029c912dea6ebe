use anyhow::anyhow;
use atomic_enum::atomic_enum;
use chrono::{DateTime, Utc};
use jsonschema::JSONSchema;
use schemars::{schema_for, JsonSchema};
use segserve_core::{http::PredictionInput, ClassTable, InstanceSegmentation, ModelConfig};
use serde_json::Value;
use std::{
	sync::{atomic::Ordering, Arc, Mutex, OnceLock},
	time::Duration,
};
use tokio::sync::{mpsc, oneshot};

use crate::{errors::ValidationErrorSet, helpers::with_timing, input::load_image, shutdown::Shutdown};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Runner is busy")]
	Busy,

	#[error("Model is not ready ({0:?})")]
	NotReady(Health),

	#[error("Prediction was canceled")]
	Canceled,

	#[error("Failed to validate input.")]
	Validation(ValidationErrorSet),

	#[error("Failed to load input: {0}")]
	Input(anyhow::Error),

	#[error("Failed to run prediction: {0}")]
	Prediction(#[from] segserve_core::Error),

	#[error("Failed to serialize prediction output: {0}")]
	Output(#[from] serde_json::Error),
}

#[atomic_enum]
#[derive(serde::Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
	Unknown,
	Starting,
	Ready,
	Busy,
	SetupFailed,
}

/// Timing and outcome of the one-time model load.
#[derive(Debug, Clone, Default)]
pub struct Setup {
	pub started_at: Option<DateTime<Utc>>,
	pub completed_at: Option<DateTime<Utc>>,
	pub error: Option<String>,
}

type ResponseSender = oneshot::Sender<Result<(Value, Duration), Error>>;
type Job = (ResponseSender, Value, flume::Receiver<()>);

/// Owns the model on a dedicated task and feeds it one prediction at a time.
#[derive(Clone)]
pub struct Runner {
	schema: Arc<JSONSchema>,
	health: Arc<AtomicHealth>,
	setup: Arc<Mutex<Setup>>,
	classes: Arc<OnceLock<ClassTable>>,
	sender: mpsc::Sender<Job>,
}

impl Runner {
	/// Start loading the model in the background and return a handle to submit predictions.
	///
	/// # Errors
	///
	/// Returns an error if the input schema cannot be compiled.
	pub fn new<M: InstanceSegmentation>(config: ModelConfig, shutdown: Shutdown) -> anyhow::Result<Self> {
		let schema = JSONSchema::compile(&serde_json::to_value(schema_for!(PredictionInput))?)
			.map_err(|e| anyhow!("Failed to compile input schema: {e}"))?;

		let health = Arc::new(AtomicHealth::new(Health::Starting));
		let setup = Arc::new(Mutex::new(Setup::default()));
		let classes = Arc::new(OnceLock::new());
		let (sender, mut rx) = mpsc::channel::<Job>(1);

		let runner = Self {
			sender,
			schema: Arc::new(schema),
			health: health.clone(),
			setup: setup.clone(),
			classes: classes.clone(),
		};

		let handle_shutdown = shutdown.clone();
		let handle = tokio::spawn(async move {
			tracing::info!(
				"Loading model from {} on {}",
				config.model_dir.display(),
				config.device
			);
			set_setup(&setup, |setup| setup.started_at = Some(Utc::now()));

			let model = match M::load(&config).await {
				Ok(model) => Arc::new(model),
				Err(error) => {
					tracing::error!("Failed to load model: {error:?}");
					set_setup(&setup, |setup| {
						setup.completed_at = Some(Utc::now());
						setup.error = Some(format!("{error:#}"));
					});
					health.swap(Health::SetupFailed, Ordering::SeqCst);
					handle_shutdown.start();
					return;
				},
			};

			if classes.set(model.class_names().clone()).is_err() {
				tracing::debug!("Class table was already set, keeping the existing one");
			}
			set_setup(&setup, |setup| setup.completed_at = Some(Utc::now()));
			tracing::info!(
				"Model ready with {} classes",
				model.class_names().len()
			);
			health.swap(Health::Ready, Ordering::SeqCst);

			while let Some((tx, input, cancel)) = rx.recv().await {
				let result = if cancel.try_recv().is_ok() {
					tracing::debug!("Prediction canceled before it started");
					Err(Error::Canceled)
				} else {
					let model = model.clone();
					let prediction = tokio::task::spawn_blocking(move || {
						with_timing(|| predict(model.as_ref(), input))
					});

					tokio::select! {
						biased;

						Ok(()) = cancel.recv_async() => {
							tracing::debug!("Prediction canceled");
							Err(Error::Canceled)
						},
						output = prediction => match output {
							Ok((Ok(output), predict_time)) => Ok((output, predict_time)),
							Ok((Err(error), _)) => Err(error),
							Err(error) => Err(Error::Prediction(anyhow::Error::new(error).into())),
						},
					}
				};

				// The caller may submit the next prediction as soon as it sees this result.
				health.swap(Health::Ready, Ordering::SeqCst);
				if tx.send(result).is_err() {
					tracing::debug!("Prediction result dropped: nobody is waiting for it");
				}
			}
		});

		tokio::spawn(async move {
			shutdown.handle().await;
			handle.abort();
		});

		Ok(runner)
	}

	pub fn health(&self) -> Health {
		self.health.load(Ordering::SeqCst)
	}

	pub fn setup(&self) -> Setup {
		self.setup
			.lock()
			.map(|setup| setup.clone())
			.unwrap_or_default()
	}

	/// Class names of the loaded model, once setup has completed.
	pub fn classes(&self) -> Option<&ClassTable> {
		self.classes.get()
	}

	pub fn validate(&self, input: &Value) -> Result<(), ValidationErrorSet> {
		self.schema.validate(input)?;

		Ok(())
	}

	/// Run one prediction. A message on `cancel`, whether sent before or after the worker picks the job up, cancels it.
	pub async fn run(
		&self,
		input: Value,
		cancel: flume::Receiver<()>,
	) -> Result<(Value, Duration), Error> {
		self.validate(&input).map_err(Error::Validation)?;

		if let Err(health) = self.health.compare_exchange(
			Health::Ready,
			Health::Busy,
			Ordering::SeqCst,
			Ordering::SeqCst,
		) {
			return Err(match health {
				Health::Busy => Error::Busy,
				health => Error::NotReady(health),
			});
		}

		let (tx, rx) = oneshot::channel();

		if self.sender.send((tx, input, cancel)).await.is_err() {
			self.health.swap(Health::SetupFailed, Ordering::SeqCst);
			return Err(Error::NotReady(Health::SetupFailed));
		}

		rx.await.unwrap_or(Err(Error::Canceled))
	}
}

fn set_setup(setup: &Mutex<Setup>, update: impl FnOnce(&mut Setup)) {
	if let Ok(mut setup) = setup.lock() {
		update(&mut setup);
	}
}

fn predict<M: InstanceSegmentation>(model: &M, input: Value) -> Result<Value, Error> {
	let input: PredictionInput =
		serde_json::from_value(input).map_err(|e| Error::Input(e.into()))?;
	let image = load_image(&input.image).map_err(Error::Input)?;

	let records = model.predict(&image, input.threshold())?;
	tracing::debug!("Prediction produced {} records", records.len());

	Ok(serde_json::to_value(records)?)
}
