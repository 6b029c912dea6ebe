#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

pub use args::Args;
pub use segserve_core::{
	BinaryMask, ClassTable, Device, Error, InstanceSegmentation, ModelConfig, ModelInfo,
	PredictionRecord, RawDetections,
};

mod args;
mod errors;
mod helpers;
mod input;
mod local;
mod prediction;
mod routes;
mod runner;
mod server;
mod shutdown;
mod webhooks;

/// Parse the command line and serve (or locally run) the model `M`.
///
/// # Errors
///
/// This function will return an error if the arguments are invalid, the local prediction fails, or the server fails to start.
pub async fn start<M: InstanceSegmentation>() -> Result<()> {
	let args = Args::parse();

	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.try_init()
		.ok();

	if args.dump_schema_and_exit {
		return server::dump_schema();
	}

	let config = args.model_config();

	if let Some(image) = &args.predict {
		let records = local::predict::<M>(&config, image, args.confidence_threshold).await?;
		println!("{}", serde_json::to_string_pretty(&records)?);

		return Ok(());
	}

	server::start::<M>(config, args.port).await
}

#[macro_export]
macro_rules! start {
	($struct_name:ident) => {
		#[tokio::main]
		async fn main() -> anyhow::Result<()> {
			segserve::start::<$struct_name>().await
		}
	};
}
