#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod adapter;
pub mod config;
pub mod detections;
pub mod errors;
pub mod http;
mod model;

pub use adapter::{filter_predictions, validate_threshold, DEFAULT_CONFIDENCE_THRESHOLD};
pub use config::{Device, ModelConfig, ModelInfo};
pub use detections::{BinaryMask, BoundingBox, ClassTable, PredictionRecord, RawDetections};
pub use errors::Error;
pub use model::InstanceSegmentation;
