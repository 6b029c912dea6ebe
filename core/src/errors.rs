use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
	/// The model produced a class index the class table doesn't know about.
	#[error("Class index {index} is out of range for a class table of {classes} entries")]
	DataIntegrity { index: i64, classes: usize },

	/// The model handle produced detections that break the parallel sequence contract.
	#[error("Malformed detections: {0}")]
	ContractViolation(String),

	#[error("Invalid argument: {0}")]
	InvalidArgument(String),

	#[error("Invalid model configuration: {0}")]
	Config(String),

	#[error("Model inference failed: {0}")]
	Model(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
