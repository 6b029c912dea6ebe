use anyhow::{Context, Result};
use segserve_core::{InstanceSegmentation, ModelConfig, PredictionRecord};
use std::path::Path;

use crate::helpers::with_timing;

/// Load the model, segment a single image from disk and return the kept records.
pub async fn predict<M: InstanceSegmentation>(
	config: &ModelConfig,
	image: &Path,
	threshold: f32,
) -> Result<Vec<PredictionRecord>> {
	tracing::info!(
		"Loading model from {} on {}",
		config.model_dir.display(),
		config.device
	);
	let model = M::load(config).await?;

	let image = image::open(image)
		.with_context(|| format!("Failed to open image {}", image.display()))?
		.to_rgb8();

	let (records, predict_time) = tokio::task::spawn_blocking(move || {
		with_timing(|| model.predict(&image, threshold))
	})
	.await?;
	let records = records?;

	tracing::info!(
		"Kept {} detections in {:.3}s",
		records.len(),
		predict_time.as_secs_f64()
	);

	Ok(records)
}
