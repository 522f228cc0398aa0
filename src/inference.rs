use crate::error::{DepthError, DepthResult};
use crate::network::{DepthDecoder, DepthEncoder, OutputKey};
use ndarray::Array4;

/// Runs encoder then decoder on a preprocessed tensor and returns the finest
/// disparity map, shape (1, 1, h', w').
///
/// Pure forward evaluation: the stages are only borrowed immutably.
pub fn infer(
	encoder: &dyn DepthEncoder,
	decoder: &dyn DepthDecoder,
	input: &Array4<f32>,
) -> DepthResult<Array4<f32>> {
	let expected = (1, 3, encoder.feed_height(), encoder.feed_width());
	if input.dim() != expected {
		return Err(DepthError::Inference(format!(
			"Input tensor shape {:?} does not match encoder input {:?}",
			input.dim(),
			expected
		)));
	}

	let start = std::time::Instant::now();
	let features = encoder.forward(input)?;
	if features.is_empty() {
		return Err(DepthError::Inference("Encoder produced no features".to_string()));
	}
	tracing::debug!(
		"Encoder produced {} feature maps in {:.1}ms",
		features.len(),
		start.elapsed().as_secs_f64() * 1000.0
	);

	let start = std::time::Instant::now();
	let mut outputs = decoder.forward(&features)?;
	tracing::debug!(
		"Decoder produced {} outputs in {:.1}ms",
		outputs.len(),
		start.elapsed().as_secs_f64() * 1000.0
	);

	let key = OutputKey::disparity(0);
	let disp = outputs.take(&key).ok_or_else(|| {
		DepthError::Inference(format!(
			"Decoder output {} missing; available: {}",
			key,
			outputs.keys().map(|k| k.to_string()).collect::<Vec<_>>().join(", ")
		))
	})?;

	let (batch, channels, height, width) = disp.dim();
	if batch != 1 || channels != 1 || height == 0 || width == 0 {
		return Err(DepthError::Inference(format!(
			"Disparity has shape {:?}, expected (1, 1, h, w)",
			disp.dim()
		)));
	}
	if disp.iter().any(|v| !v.is_finite()) {
		return Err(DepthError::Inference("Disparity contains non-finite values".to_string()));
	}

	Ok(disp)
}
