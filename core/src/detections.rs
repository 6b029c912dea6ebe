use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use ndarray::Array2;
use schemars::{gen::SchemaGenerator, schema::Schema, JsonSchema};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;

use crate::errors::{Error, Result};

/// A per-pixel boolean grid for one detected instance, stored row-major (`[y, x]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMask(Array2<bool>);

impl BinaryMask {
	/// An empty mask of the given dimensions.
	#[must_use]
	pub fn new(width: usize, height: usize) -> Self {
		Self(Array2::from_elem((height, width), false))
	}

	/// Wrap an existing `[height, width]` grid.
	#[must_use]
	pub const fn from_array(array: Array2<bool>) -> Self {
		Self(array)
	}

	/// Binarize a grid of per-pixel probabilities, keeping pixels `>= cutoff`.
	#[must_use]
	pub fn from_scores(scores: &Array2<f32>, cutoff: f32) -> Self {
		Self(scores.mapv(|score| score >= cutoff))
	}

	#[must_use]
	pub fn width(&self) -> usize {
		self.0.ncols()
	}

	#[must_use]
	pub fn height(&self) -> usize {
		self.0.nrows()
	}

	#[must_use]
	pub fn get(&self, x: usize, y: usize) -> Option<bool> {
		self.0.get((y, x)).copied()
	}

	/// Set a pixel, returning `false` if it lies outside the mask.
	pub fn set(&mut self, x: usize, y: usize, value: bool) -> bool {
		self.0.get_mut((y, x)).map_or(false, |pixel| {
			*pixel = value;
			true
		})
	}

	/// Number of set pixels.
	#[must_use]
	pub fn area(&self) -> usize {
		self.0.iter().filter(|pixel| **pixel).count()
	}

	/// The tightest box around every set pixel, or `None` for an empty mask.
	#[must_use]
	pub fn bounding_box(&self) -> Option<BoundingBox> {
		self.0
			.indexed_iter()
			.filter(|(_, pixel)| **pixel)
			.fold(None, |bbox: Option<BoundingBox>, ((y, x), _)| {
				Some(bbox.map_or_else(|| BoundingBox::point(x, y), |bbox| bbox.include(x, y)))
			})
	}

	#[must_use]
	pub const fn as_array(&self) -> &Array2<bool> {
		&self.0
	}

	fn row_bytes(width: usize) -> usize {
		(width + 7) / 8
	}

	fn pack(&self) -> Vec<u8> {
		let row_bytes = Self::row_bytes(self.width());
		let mut bytes = vec![0_u8; row_bytes * self.height()];

		for ((y, x), _) in self.0.indexed_iter().filter(|(_, pixel)| **pixel) {
			bytes[y * row_bytes + x / 8] |= 0x80 >> (x % 8);
		}

		bytes
	}

	fn unpack(width: usize, height: usize, bytes: &[u8]) -> Result<Self, String> {
		let row_bytes = Self::row_bytes(width);
		if bytes.len() != row_bytes * height {
			return Err(format!(
				"expected {} bytes for a {width}x{height} mask, got {}",
				row_bytes * height,
				bytes.len()
			));
		}

		Ok(Self(Array2::from_shape_fn((height, width), |(y, x)| {
			bytes[y * row_bytes + x / 8] & (0x80 >> (x % 8)) != 0
		})))
	}
}

/// Wire representation of a [`BinaryMask`]: rows packed 8 pixels per byte, MSB first, base64 encoded.
#[derive(Serialize, Deserialize, JsonSchema)]
#[schemars(rename = "BinaryMask")]
struct EncodedMask {
	/// Mask width in pixels
	width: usize,
	/// Mask height in pixels
	height: usize,
	/// Base64 of the row-major bit-packed mask, each row padded to a whole byte
	data: String,
}

impl Serialize for BinaryMask {
	fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		EncodedMask {
			width: self.width(),
			height: self.height(),
			data: Base64.encode(self.pack()),
		}
		.serialize(serializer)
	}
}

impl<'de> Deserialize<'de> for BinaryMask {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		let encoded = EncodedMask::deserialize(deserializer)?;
		let bytes = Base64
			.decode(encoded.data)
			.map_err(serde::de::Error::custom)?;

		Self::unpack(encoded.width, encoded.height, &bytes).map_err(serde::de::Error::custom)
	}
}

impl JsonSchema for BinaryMask {
	fn schema_name() -> String {
		"BinaryMask".to_string()
	}

	fn json_schema(gen: &mut SchemaGenerator) -> Schema {
		EncodedMask::json_schema(gen)
	}
}

/// Inclusive pixel bounds of a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
	pub x0: usize,
	pub y0: usize,
	pub x1: usize,
	pub y1: usize,
}

impl BoundingBox {
	const fn point(x: usize, y: usize) -> Self {
		Self {
			x0: x,
			y0: y,
			x1: x,
			y1: y,
		}
	}

	fn include(self, x: usize, y: usize) -> Self {
		Self {
			x0: self.x0.min(x),
			y0: self.y0.min(y),
			x1: self.x1.max(x),
			y1: self.y1.max(y),
		}
	}
}

impl Serialize for BoundingBox {
	fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		[self.x0, self.y0, self.x1, self.y1].serialize(serializer)
	}
}

impl JsonSchema for BoundingBox {
	fn schema_name() -> String {
		"BoundingBox".to_string()
	}

	fn json_schema(gen: &mut SchemaGenerator) -> Schema {
		<[usize; 4]>::json_schema(gen)
	}
}

/// Class names of a model, indexed by the class indices it predicts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassTable(Arc<[String]>);

impl ClassTable {
	#[must_use]
	pub fn new(names: Vec<String>) -> Self {
		Self(names.into())
	}

	/// Look up a class name. Negative or too-large indices yield `None`.
	#[must_use]
	pub fn get(&self, index: i64) -> Option<&str> {
		usize::try_from(index)
			.ok()
			.and_then(|index| self.0.get(index))
			.map(String::as_str)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.0.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &str> {
		self.0.iter().map(String::as_str)
	}
}

impl<S: Into<String>> FromIterator<S> for ClassTable {
	fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
		Self::new(iter.into_iter().map(Into::into).collect())
	}
}

impl Serialize for ClassTable {
	fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		serializer.collect_seq(self.0.iter())
	}
}

impl JsonSchema for ClassTable {
	fn schema_name() -> String {
		"ClassTable".to_string()
	}

	fn json_schema(gen: &mut SchemaGenerator) -> Schema {
		Vec::<String>::json_schema(gen)
	}
}

/// Unfiltered output of one inference call. Index `i` of every sequence describes the same instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDetections {
	pub class_indices: Vec<i64>,
	pub scores: Vec<f32>,
	pub masks: Vec<BinaryMask>,
}

impl RawDetections {
	#[must_use]
	pub fn empty() -> Self {
		Self::default()
	}

	/// Number of detected instances, or `None` if the parallel sequences disagree.
	#[must_use]
	pub fn len(&self) -> Option<usize> {
		let len = self.class_indices.len();

		(self.scores.len() == len && self.masks.len() == len).then_some(len)
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == Some(0)
	}

	/// Check the parallel sequences line up.
	///
	/// # Errors
	///
	/// Returns [`Error::ContractViolation`] if the three sequences have different lengths.
	pub fn validate(&self) -> Result<usize> {
		self.len().ok_or_else(|| {
			Error::ContractViolation(format!(
				"got {} class indices, {} scores and {} masks",
				self.class_indices.len(),
				self.scores.len(),
				self.masks.len()
			))
		})
	}
}

/// A detection that passed the confidence filter, as reported to the platform.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct PredictionRecord {
	/// Name of the predicted class
	class_name: String,
	/// Confidence of the prediction, in [0, 1]
	score: f32,
	/// Instance mask, same dimensions as the input image
	mask: BinaryMask,
	/// Inclusive `[x0, y0, x1, y1]` bounds of the mask, or null if the mask is empty
	bbox: Option<BoundingBox>,
	/// Number of pixels covered by the mask
	area: usize,
}

impl PredictionRecord {
	pub(crate) fn new(class_name: String, mask: BinaryMask, score: f32) -> Self {
		Self {
			bbox: mask.bounding_box(),
			area: mask.area(),
			class_name,
			score,
			mask,
		}
	}

	#[must_use]
	pub fn class_name(&self) -> &str {
		&self.class_name
	}

	#[must_use]
	pub const fn score(&self) -> f32 {
		self.score
	}

	#[must_use]
	pub const fn mask(&self) -> &BinaryMask {
		&self.mask
	}

	#[must_use]
	pub const fn bounding_box(&self) -> Option<BoundingBox> {
		self.bbox
	}

	#[must_use]
	pub const fn area(&self) -> usize {
		self.area
	}
}
