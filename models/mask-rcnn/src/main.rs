use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use image::RgbImage;
use ndarray::Array2;
use segserve::{BinaryMask, ClassTable, Device, InstanceSegmentation, ModelConfig, RawDetections};
use tch::{CModule, IValue, Kind, Tensor};

/// Pixels of a pasted mask with probability at least this are part of the instance.
const MASK_CUTOFF: f32 = 0.5;

/// Positions of the instance fields in the flattened output of the exported model.
const PRED_CLASSES: usize = 1;
const PRED_MASKS: usize = 2;
const SCORES: usize = 3;

/// A Detectron2 Mask R-CNN exported to TorchScript.
///
/// The module takes a `uint8` BGR image in CHW layout and returns the flattened instance fields
/// `(pred_boxes, pred_classes, pred_masks, scores, image_size)`, with masks pasted at image resolution.
struct MaskRcnn {
	classes: ClassTable,
	device: tch::Device,
	module: Mutex<CModule>,
}

#[async_trait]
impl InstanceSegmentation for MaskRcnn {
	async fn load(config: &ModelConfig) -> Result<Self> {
		let info = config.model_info()?;
		let weights = config.torchscript_path(&info)?;
		let classes = config.class_table(&info)?;
		let device = torch_device(config.device);

		tracing::info!(
			"Loading {} from {} ({} classes)",
			info.architecture,
			weights.display(),
			classes.len()
		);

		let mut module = CModule::load_on_device(&weights, device)
			.with_context(|| format!("Failed to load TorchScript module {}", weights.display()))?;
		module.set_eval();

		Ok(Self {
			classes,
			device,
			module: Mutex::new(module),
		})
	}

	fn class_names(&self) -> &ClassTable {
		&self.classes
	}

	fn raw_predict(&self, image: &RgbImage) -> Result<RawDetections> {
		let (width, height) = (i64::from(image.width()), i64::from(image.height()));
		let input = Tensor::from_slice(&to_bgr(image))
			.view([height, width, 3])
			.permute([2, 0, 1])
			.to_device(self.device);

		let output = {
			let module = self
				.module
				.lock()
				.map_err(|_| anyhow!("Model is poisoned by an earlier panic"))?;

			tch::no_grad(|| module.forward_is(&[IValue::Tensor(input)]))?
		};

		let fields = match output {
			IValue::Tuple(fields) => fields,
			other => bail!("Expected the model to return a tuple of instance fields, got {other:?}"),
		};

		let class_indices = Vec::<i64>::try_from(on_cpu(field(&fields, PRED_CLASSES)?, Kind::Int64))?;
		let scores = Vec::<f32>::try_from(on_cpu(field(&fields, SCORES)?, Kind::Float))?;
		let masks = masks(field(&fields, PRED_MASKS)?)?;

		tracing::debug!("Model returned {} instances", scores.len());

		Ok(RawDetections {
			class_indices,
			scores,
			masks,
		})
	}
}

fn field(fields: &[IValue], index: usize) -> Result<&Tensor> {
	match fields.get(index) {
		Some(IValue::Tensor(tensor)) => Ok(tensor),
		Some(other) => bail!("Expected a tensor at output {index}, got {other:?}"),
		None => bail!("Model returned {} outputs, expected at least {}", fields.len(), index + 1),
	}
}

fn on_cpu(tensor: &Tensor, kind: Kind) -> Tensor {
	tensor.to_kind(kind).to_device(tch::Device::Cpu)
}

/// Split an `[N, H, W]` (or `[N, 1, H, W]`) tensor of mask probabilities into binary masks.
fn masks(tensor: &Tensor) -> Result<Vec<BinaryMask>> {
	let tensor = on_cpu(tensor, Kind::Float);
	let size = tensor.size();

	let (count, height, width) = match size.as_slice() {
		[count, height, width] | [count, 1, height, width] => (*count, *height, *width),
		_ => bail!("Unexpected mask shape {size:?}"),
	};
	let shape = (usize::try_from(height)?, usize::try_from(width)?);

	(0..count)
		.map(|i| -> Result<BinaryMask> {
			let scores = Vec::<f32>::try_from(tensor.get(i).reshape([-1]))?;

			Ok(BinaryMask::from_scores(
				&Array2::from_shape_vec(shape, scores)?,
				MASK_CUTOFF,
			))
		})
		.collect()
}

fn to_bgr(image: &RgbImage) -> Vec<u8> {
	image
		.pixels()
		.flat_map(|pixel| {
			let [r, g, b] = pixel.0;
			[b, g, r]
		})
		.collect()
}

fn torch_device(device: Device) -> tch::Device {
	match device {
		Device::Cpu => tch::Device::Cpu,
		Device::Cuda(index) => tch::Device::Cuda(index.unwrap_or(0)),
	}
}

segserve::start!(MaskRcnn);
