use crate::{
	detections::{ClassTable, PredictionRecord, RawDetections},
	errors::{Error, Result},
};

/// Confidence used when a caller doesn't specify one.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.8;

/// Reject thresholds outside `[0, 1]` (including NaN) instead of clamping them.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if the threshold is not a number in `[0, 1]`.
pub fn validate_threshold(threshold: f32) -> Result<f32> {
	if !(0.0..=1.0).contains(&threshold) {
		return Err(Error::InvalidArgument(format!(
			"confidence threshold must be within [0, 1], got {threshold}"
		)));
	}

	Ok(threshold)
}

/// Turn one batch of raw detections into platform prediction records.
///
/// Keeps every instance with `score >= threshold`, in the order the model produced them.
/// All inputs are checked before any record is built, so an error never comes with partial output.
///
/// # Errors
///
/// - [`Error::InvalidArgument`] if `threshold` is outside `[0, 1]`.
/// - [`Error::ContractViolation`] if the parallel sequences of `raw` have different lengths.
/// - [`Error::DataIntegrity`] if any class index doesn't exist in `classes`.
pub fn filter_predictions(
	raw: RawDetections,
	classes: &ClassTable,
	threshold: f32,
) -> Result<Vec<PredictionRecord>> {
	let threshold = validate_threshold(threshold)?;
	let len = raw.validate()?;

	let class_names = raw
		.class_indices
		.iter()
		.map(|&index| {
			classes.get(index).ok_or(Error::DataIntegrity {
				index,
				classes: classes.len(),
			})
		})
		.collect::<Result<Vec<_>>>()?;

	let records = class_names
		.into_iter()
		.zip(raw.scores)
		.zip(raw.masks)
		.filter(|((_, score), _)| *score >= threshold)
		.map(|((class_name, score), mask)| {
			PredictionRecord::new(class_name.to_string(), mask, score)
		})
		.collect::<Vec<_>>();

	tracing::debug!(
		"Kept {} of {len} detections at confidence >= {threshold}",
		records.len()
	);

	Ok(records)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::detections::BinaryMask;

	fn classes() -> ClassTable {
		["cat", "dog"].into_iter().collect()
	}

	/// A mask whose set pixel encodes `id`, so records can be traced back to their input position.
	fn mask(id: usize) -> BinaryMask {
		let mut mask = BinaryMask::new(8, 1);
		mask.set(id, 0, true);
		mask
	}

	fn detections(class_indices: &[i64], scores: &[f32]) -> RawDetections {
		RawDetections {
			class_indices: class_indices.to_vec(),
			scores: scores.to_vec(),
			masks: (0..class_indices.len()).map(mask).collect(),
		}
	}

	fn summary(records: &[PredictionRecord]) -> Vec<(&str, f32)> {
		records.iter().map(|r| (r.class_name(), r.score())).collect()
	}

	#[test]
	fn drops_low_confidence_detections_in_order() {
		let records =
			filter_predictions(detections(&[0, 1, 0], &[0.9, 0.4, 0.95]), &classes(), 0.8).unwrap();

		assert_eq!(summary(&records), vec![("cat", 0.9), ("cat", 0.95)]);
		assert_eq!(records[0].mask(), &mask(0));
		assert_eq!(records[1].mask(), &mask(2));
	}

	#[test]
	fn threshold_is_inclusive() {
		let records =
			filter_predictions(detections(&[0, 1, 0], &[0.9, 0.4, 0.95]), &classes(), 0.95).unwrap();

		assert_eq!(summary(&records), vec![("cat", 0.95)]);
		assert_eq!(records[0].mask(), &mask(2));
	}

	#[test]
	fn zero_threshold_keeps_everything() {
		let records =
			filter_predictions(detections(&[1, 0, 1], &[0.0, 0.3, 1.0]), &classes(), 0.0).unwrap();

		assert_eq!(
			summary(&records),
			vec![("dog", 0.0), ("cat", 0.3), ("dog", 1.0)]
		);
	}

	#[test]
	fn full_threshold_keeps_only_certain_detections() {
		let records =
			filter_predictions(detections(&[1, 0, 1], &[0.99, 1.0, 0.5]), &classes(), 1.0).unwrap();

		assert_eq!(summary(&records), vec![("cat", 1.0)]);
	}

	#[test]
	fn empty_detections_yield_empty_output() {
		let records = filter_predictions(RawDetections::empty(), &classes(), 0.5).unwrap();

		assert!(records.is_empty());
	}

	#[test]
	fn nothing_above_threshold_is_not_an_error() {
		let records = filter_predictions(detections(&[0, 1], &[0.1, 0.2]), &classes(), 0.5).unwrap();

		assert!(records.is_empty());
	}

	#[test]
	fn out_of_range_class_index_is_a_data_integrity_error() {
		let result = filter_predictions(detections(&[5], &[0.9]), &classes(), 0.5);

		assert!(matches!(
			result,
			Err(Error::DataIntegrity {
				index: 5,
				classes: 2
			})
		));
	}

	#[test]
	fn out_of_range_index_fails_even_below_threshold() {
		let result = filter_predictions(detections(&[0, -1], &[0.9, 0.1]), &classes(), 0.5);

		assert!(matches!(
			result,
			Err(Error::DataIntegrity { index: -1, .. })
		));
	}

	#[test]
	fn mismatched_lengths_are_a_contract_violation() {
		let mut raw = detections(&[0, 1], &[0.9, 0.9]);
		raw.masks.pop();

		assert!(matches!(
			filter_predictions(raw, &classes(), 0.5),
			Err(Error::ContractViolation(_))
		));
	}

	#[test]
	fn threshold_outside_unit_interval_is_rejected() {
		for threshold in [-0.1, 1.01, f32::NAN, f32::INFINITY] {
			assert!(
				matches!(
					filter_predictions(detections(&[0], &[0.9]), &classes(), threshold),
					Err(Error::InvalidArgument(_))
				),
				"threshold {threshold} was accepted"
			);
		}
	}

	#[test]
	fn raising_the_threshold_never_keeps_more() {
		let scores: [f32; 8] = [0.05, 0.8, 0.3, 0.8, 0.99, 0.5, 0.0, 1.0];
		let indices: [i64; 8] = [0, 1, 0, 1, 0, 1, 0, 1];

		let mut previous = usize::MAX;
		for step in 0..=20_u8 {
			let threshold = f32::from(step) / 20.0;
			let kept = filter_predictions(detections(&indices, &scores), &classes(), threshold)
				.unwrap()
				.len();

			assert!(kept <= previous, "threshold {threshold} kept {kept} > {previous}");
			previous = kept;
		}
	}

	#[test]
	fn filtering_is_idempotent_and_order_preserving() {
		let raw = detections(&[1, 0, 1, 0, 1], &[0.7, 0.2, 0.9, 0.75, 0.1]);
		let once = filter_predictions(raw.clone(), &classes(), 0.7).unwrap();

		// every kept mask points back to a strictly increasing input position
		let positions = once
			.iter()
			.map(|r| r.mask().bounding_box().unwrap().x0)
			.collect::<Vec<_>>();
		assert_eq!(positions, vec![0, 2, 3]);

		let rebuilt = RawDetections {
			class_indices: once
				.iter()
				.map(|r| if r.class_name() == "cat" { 0 } else { 1 })
				.collect(),
			scores: once.iter().map(PredictionRecord::score).collect(),
			masks: once.iter().map(|r| r.mask().clone()).collect(),
		};

		let twice = filter_predictions(rebuilt.clone(), &classes(), 0.7).unwrap();
		assert_eq!(twice, once);
		assert_eq!(filter_predictions(rebuilt, &classes(), 0.7).unwrap(), twice);
		assert_eq!(filter_predictions(raw, &classes(), 0.7).unwrap(), once);
	}
}
