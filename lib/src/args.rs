use clap::Parser;
use segserve_core::{Device, ModelConfig, DEFAULT_CONFIDENCE_THRESHOLD};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about = "Serve an instance segmentation model over HTTP")]
pub struct Args {
	/// Directory holding `model_info.json` and the model weights
	#[arg(
		long,
		env = "MODEL_DIR",
		required_unless_present = "dump_schema_and_exit"
	)]
	pub model_dir: Option<PathBuf>,

	/// Device to run the model on (`cpu`, `cuda` or `cuda:N`)
	#[arg(long, env = "DEVICE", default_value = "cpu")]
	pub device: Device,

	/// Port to listen on
	#[arg(long, env = "PORT", default_value_t = 5000)]
	pub port: u16,

	/// Print the OpenAPI schema and exit
	#[arg(long)]
	pub dump_schema_and_exit: bool,

	/// Run a single prediction on a local image, print the records and exit
	#[arg(long, value_name = "IMAGE")]
	pub predict: Option<PathBuf>,

	/// Confidence threshold used with `--predict`
	#[arg(long, default_value_t = DEFAULT_CONFIDENCE_THRESHOLD)]
	pub confidence_threshold: f32,
}

impl Args {
	pub fn model_config(&self) -> ModelConfig {
		ModelConfig::new(self.model_dir.clone().unwrap_or_default(), self.device)
	}
}
