use crate::colormap::Colormap;
use crate::error::{DepthError, DepthResult};
use crate::pipeline::PipelineConfig;
use crate::raster::Raster;
use crate::resize::resize_bilinear;
use ndarray::{Array2, Array4, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// What a flat disparity field (max percentile equal to min) normalizes to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegeneratePolicy {
	/// Every pixel takes the colormap's zero-point color.
	#[default]
	Zero,
	/// Every pixel takes the colormap's mid-point color.
	Mid,
}

impl DegeneratePolicy {
	pub fn value(&self) -> f32 {
		match self {
			DegeneratePolicy::Zero => 0.0,
			DegeneratePolicy::Mid => 0.5,
		}
	}
}

/// `p`-th percentile with linear interpolation between the closest ranks.
///
/// Returns `None` for an empty slice.
pub fn percentile(values: &[f32], p: f64) -> Option<f32> {
	if values.is_empty() {
		return None;
	}

	let rank = (p / 100.0).clamp(0.0, 1.0) * (values.len() - 1) as f64;
	let lo = rank.floor() as usize;
	let frac = rank - lo as f64;

	let mut buf = values.to_vec();
	let (_, lo_val, upper) = buf.select_nth_unstable_by(lo, f32::total_cmp);
	let lo_val = *lo_val as f64;
	if frac == 0.0 {
		return Some(lo_val as f32);
	}

	let hi_val = upper.iter().copied().min_by(f32::total_cmp).map_or(lo_val, f64::from);
	Some((lo_val + (hi_val - lo_val) * frac) as f32)
}

/// Linear map `vmin -> 0`, `vmax -> 1`, clamped to [0, 1].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Normalizer {
	pub vmin: f32,
	pub vmax: f32,
}

impl Normalizer {
	/// `vmin` is the field minimum, `vmax` its `p`-th percentile.
	pub fn from_percentile(values: &[f32], p: f64) -> Option<Self> {
		let vmax = percentile(values, p)?;
		let vmin = values.iter().copied().fold(f32::INFINITY, f32::min);
		Some(Self { vmin, vmax })
	}

	/// True when the range is not finite or no wider than float rounding at
	/// the field's magnitude; such a field is treated as flat.
	pub fn is_degenerate(&self) -> bool {
		let range = self.vmax - self.vmin;
		let tolerance = 4.0 * f32::EPSILON * self.vmin.abs().max(self.vmax.abs()).max(1.0);
		!(range.is_finite() && range > tolerance)
	}

	pub fn apply(&self, value: f32, policy: DegeneratePolicy) -> f32 {
		if self.is_degenerate() {
			return policy.value();
		}
		((value - self.vmin) / (self.vmax - self.vmin)).clamp(0.0, 1.0)
	}
}

/// Maps each value through `normalizer` and `colormap` into a 3-channel raster.
pub fn colorize(
	field: &Array2<f32>,
	normalizer: &Normalizer,
	colormap: Colormap,
	policy: DegeneratePolicy,
) -> DepthResult<Raster> {
	let (height, width) = field.dim();
	if height == 0 || width == 0 {
		return Err(DepthError::Config(format!(
			"Cannot colorize an empty {}x{} field",
			width, height
		)));
	}
	let mut data = vec![0u8; height * width * 3];

	data.par_chunks_mut(width * 3)
		.zip(field.axis_iter(Axis(0)).into_par_iter())
		.for_each(|(out_row, in_row)| {
			for (px, &v) in out_row.chunks_exact_mut(3).zip(in_row.iter()) {
				px.copy_from_slice(&colormap.rgb8(normalizer.apply(v, policy)));
			}
		});

	Raster::new(height, width, 3, data)
}

/// Upsamples a (1, 1, h', w') disparity field to the original size,
/// normalizes it against its minimum and percentile, and colorizes it.
pub fn postprocess(
	disp: &Array4<f32>,
	original_width: usize,
	original_height: usize,
	config: &PipelineConfig,
) -> DepthResult<Raster> {
	let (batch, channels, _, _) = disp.dim();
	if batch != 1 || channels != 1 {
		return Err(DepthError::Inference(format!(
			"Disparity has shape {:?}, expected (1, 1, h, w)",
			disp.dim()
		)));
	}

	let field = disp.index_axis(Axis(0), 0).index_axis(Axis(0), 0).to_owned();
	let resized = resize_bilinear(&field, original_height, original_width);

	let values: Vec<f32> = resized.iter().copied().collect();
	let normalizer = Normalizer::from_percentile(&values, config.percentile).ok_or_else(|| {
		DepthError::Config(format!(
			"Cannot normalize an empty {}x{} field",
			original_width, original_height
		))
	})?;

	if normalizer.is_degenerate() {
		tracing::debug!(
			"Flat disparity field (vmin {}, vmax {}), using {:?} policy",
			normalizer.vmin,
			normalizer.vmax,
			config.degenerate
		);
	}

	colorize(&resized, &normalizer, config.colormap, config.degenerate)
}
