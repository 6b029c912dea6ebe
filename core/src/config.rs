use serde::{Deserialize, Serialize};
use std::{
	fmt,
	path::{Path, PathBuf},
	str::FromStr,
};

use crate::{
	detections::ClassTable,
	errors::{Error, Result},
};

/// Metadata file describing the model, relative to the model directory.
pub const MODEL_INFO_FILE: &str = "model_info.json";

/// Weights file used when `model_info.json` doesn't name one.
pub const DEFAULT_WEIGHTS_FILE: &str = "model_weights.pkl";

/// TorchScript export looked up when `model_info.json` doesn't name the weights.
pub const DEFAULT_TORCHSCRIPT_FILE: &str = "model.ts";

/// Extensions of training checkpoints, which a TorchScript runtime can't load.
const CHECKPOINT_EXTENSIONS: [&str; 2] = ["pkl", "pth"];

/// Where inference runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
	#[default]
	Cpu,
	/// A CUDA device, optionally pinned to an ordinal.
	Cuda(Option<usize>),
}

impl FromStr for Device {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		match s.trim().to_lowercase().as_str() {
			"cpu" => Ok(Self::Cpu),
			"cuda" => Ok(Self::Cuda(None)),
			device => device
				.strip_prefix("cuda:")
				.and_then(|ordinal| ordinal.parse().ok())
				.map(|ordinal| Self::Cuda(Some(ordinal)))
				.ok_or_else(|| {
					Error::InvalidArgument(format!(
						"unknown device {s:?}, expected \"cpu\", \"cuda\" or \"cuda:N\""
					))
				}),
		}
	}
}

impl fmt::Display for Device {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Cpu => f.write_str("cpu"),
			Self::Cuda(None) => f.write_str("cuda"),
			Self::Cuda(Some(ordinal)) => write!(f, "cuda:{ordinal}"),
		}
	}
}

impl Serialize for Device {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for Device {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		String::deserialize(deserializer)?
			.parse()
			.map_err(serde::de::Error::custom)
	}
}

/// Contents of `model_info.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
	/// Model zoo config the checkpoint was trained with, e.g. `COCO-InstanceSegmentation/mask_rcnn_R_50_FPN_3x.yaml`.
	pub architecture: String,
	/// Weights file name, relative to the model directory.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub weights: Option<String>,
	/// Class names, when they differ from the training dataset's.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub classes: Option<Vec<String>>,
}

impl ModelInfo {
	#[must_use]
	pub fn is_coco(&self) -> bool {
		self.architecture.starts_with("COCO-")
	}
}

/// Everything a model needs to load itself. Passed explicitly; nothing is read from globals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
	pub device: Device,
	pub model_dir: PathBuf,
}

impl ModelConfig {
	#[must_use]
	pub fn new(model_dir: impl Into<PathBuf>, device: Device) -> Self {
		Self {
			device,
			model_dir: model_dir.into(),
		}
	}

	/// Read and parse `model_info.json` from the model directory.
	///
	/// # Errors
	///
	/// Returns [`Error::Config`] if the file cannot be read or isn't valid model metadata.
	pub fn model_info(&self) -> Result<ModelInfo> {
		let path = self.model_dir.join(MODEL_INFO_FILE);
		tracing::debug!("Reading model metadata from {}", path.display());

		let contents = std::fs::read_to_string(&path)
			.map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

		serde_json::from_str(&contents)
			.map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
	}

	/// Path of the weights file, checked for existence.
	///
	/// # Errors
	///
	/// Returns [`Error::Config`] if the weights file does not exist.
	pub fn weights_path(&self, info: &ModelInfo) -> Result<PathBuf> {
		let path = self
			.model_dir
			.join(info.weights.as_deref().unwrap_or(DEFAULT_WEIGHTS_FILE));

		if !path.is_file() {
			return Err(Error::Config(format!(
				"weights file {} does not exist",
				path.display()
			)));
		}

		Ok(path)
	}

	/// Path of the TorchScript export of the model, checked for existence.
	///
	/// Falls back to [`DEFAULT_TORCHSCRIPT_FILE`] when the metadata doesn't name the weights.
	///
	/// # Errors
	///
	/// Returns [`Error::Config`] if the weights are a training checkpoint rather than a TorchScript export,
	/// or if the file does not exist.
	pub fn torchscript_path(&self, info: &ModelInfo) -> Result<PathBuf> {
		let path = match &info.weights {
			Some(weights) => self.model_dir.join(weights),
			None if !self.model_dir.join(DEFAULT_TORCHSCRIPT_FILE).is_file()
				&& self.model_dir.join(DEFAULT_WEIGHTS_FILE).is_file() =>
			{
				self.model_dir.join(DEFAULT_WEIGHTS_FILE)
			},
			None => self.model_dir.join(DEFAULT_TORCHSCRIPT_FILE),
		};

		let is_checkpoint = path
			.extension()
			.and_then(|ext| ext.to_str())
			.is_some_and(|ext| CHECKPOINT_EXTENSIONS.contains(&ext));
		if is_checkpoint {
			return Err(Error::Config(format!(
				"{} is a training checkpoint; export the model to TorchScript and point `weights` in {MODEL_INFO_FILE} at the export",
				path.display()
			)));
		}

		if !path.is_file() {
			return Err(Error::Config(format!(
				"TorchScript file {} does not exist",
				path.display()
			)));
		}

		Ok(path)
	}

	/// Class names for the model: the ones listed in the metadata, or the dataset's for COCO zoo configs.
	///
	/// # Errors
	///
	/// Returns [`Error::Config`] if the metadata lists no classes and the architecture isn't a COCO config.
	pub fn class_table(&self, info: &ModelInfo) -> Result<ClassTable> {
		if let Some(classes) = &info.classes {
			return Ok(ClassTable::new(classes.clone()));
		}

		if info.is_coco() {
			return Ok(COCO_CLASSES.into_iter().collect());
		}

		Err(Error::Config(format!(
			"{} lists no classes and {:?} is not a COCO config",
			self.model_dir.join(MODEL_INFO_FILE).display(),
			info.architecture
		)))
	}

	#[must_use]
	pub fn model_dir(&self) -> &Path {
		&self.model_dir
	}
}

/// `thing_classes` of the COCO instance segmentation datasets.
pub const COCO_CLASSES: [&str; 80] = [
	"person",
	"bicycle",
	"car",
	"motorcycle",
	"airplane",
	"bus",
	"train",
	"truck",
	"boat",
	"traffic light",
	"fire hydrant",
	"stop sign",
	"parking meter",
	"bench",
	"bird",
	"cat",
	"dog",
	"horse",
	"sheep",
	"cow",
	"elephant",
	"bear",
	"zebra",
	"giraffe",
	"backpack",
	"umbrella",
	"handbag",
	"tie",
	"suitcase",
	"frisbee",
	"skis",
	"snowboard",
	"sports ball",
	"kite",
	"baseball bat",
	"baseball glove",
	"skateboard",
	"surfboard",
	"tennis racket",
	"bottle",
	"wine glass",
	"cup",
	"fork",
	"knife",
	"spoon",
	"bowl",
	"banana",
	"apple",
	"sandwich",
	"orange",
	"broccoli",
	"carrot",
	"hot dog",
	"pizza",
	"donut",
	"cake",
	"chair",
	"couch",
	"potted plant",
	"bed",
	"dining table",
	"toilet",
	"tv",
	"laptop",
	"mouse",
	"remote",
	"keyboard",
	"cell phone",
	"microwave",
	"oven",
	"toaster",
	"sink",
	"refrigerator",
	"book",
	"clock",
	"vase",
	"scissors",
	"teddy bear",
	"hair drier",
	"toothbrush",
];
