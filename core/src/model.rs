use anyhow::Result;
use async_trait::async_trait;
use image::RgbImage;

use crate::{
	adapter::{filter_predictions, validate_threshold},
	config::ModelConfig,
	detections::{ClassTable, PredictionRecord, RawDetections},
	errors::Error,
};

/// An instance segmentation model
#[async_trait]
pub trait InstanceSegmentation: Sized + Send + Sync + 'static {
	/// Load the model from its directory onto the configured device
	///
	/// # Errors
	///
	/// Returns an error if the model files cannot be read or the model fails to load.
	async fn load(config: &ModelConfig) -> Result<Self>;

	/// Class names, indexed by the class indices the model predicts
	fn class_names(&self) -> &ClassTable;

	/// Run the model on one image, without any filtering
	///
	/// # Errors
	///
	/// Returns an error if inference fails.
	fn raw_predict(&self, image: &RgbImage) -> Result<RawDetections>;

	/// Run the model on one image and keep the detections with `score >= threshold`
	///
	/// # Errors
	///
	/// Returns [`Error::InvalidArgument`] before running inference if the threshold is outside `[0, 1]`,
	/// [`Error::Model`] if inference fails, and the adapter's errors if the model output is malformed.
	fn predict(
		&self,
		image: &RgbImage,
		threshold: f32,
	) -> Result<Vec<PredictionRecord>, Error> {
		let threshold = validate_threshold(threshold)?;
		let raw = self.raw_predict(image)?;

		filter_predictions(raw, self.class_names(), threshold)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{config::Device, detections::BinaryMask};
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct FixedModel {
		classes: ClassTable,
		calls: AtomicUsize,
	}

	#[async_trait]
	impl InstanceSegmentation for FixedModel {
		async fn load(_: &ModelConfig) -> Result<Self> {
			Ok(Self {
				classes: ["cat", "dog"].into_iter().collect(),
				calls: AtomicUsize::new(0),
			})
		}

		fn class_names(&self) -> &ClassTable {
			&self.classes
		}

		fn raw_predict(&self, image: &RgbImage) -> Result<RawDetections> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			let (width, height) = (image.width() as usize, image.height() as usize);

			Ok(RawDetections {
				class_indices: vec![0, 1, 0],
				scores: vec![0.9, 0.4, 0.95],
				masks: vec![BinaryMask::new(width, height); 3],
			})
		}
	}

	#[tokio::test]
	async fn predict_filters_raw_output() {
		let model = FixedModel::load(&ModelConfig::new("unused", Device::Cpu))
			.await
			.unwrap();

		let records = model.predict(&RgbImage::new(4, 2), 0.8).unwrap();

		assert_eq!(records.len(), 2);
		assert!(records.iter().all(|r| r.class_name() == "cat"));
		assert_eq!(records[0].mask().width(), 4);
		assert_eq!(records[0].mask().height(), 2);
	}

	#[tokio::test]
	async fn invalid_threshold_skips_inference() {
		let model = FixedModel::load(&ModelConfig::new("unused", Device::Cpu))
			.await
			.unwrap();

		assert!(matches!(
			model.predict(&RgbImage::new(1, 1), 1.5),
			Err(Error::InvalidArgument(_))
		));
		assert_eq!(model.calls.load(Ordering::SeqCst), 0);
	}
}
