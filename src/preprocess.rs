use crate::error::{DepthError, DepthResult};
use crate::raster::Raster;
use image::imageops::FilterType;
use ndarray::Array4;

/// Spatial size of the raster before it was resized to the feed resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OriginalSize {
	pub width: usize,
	pub height: usize,
}

/// Resamples `raster` to the encoder feed resolution and lays it out as a
/// (1, 3, feed_height, feed_width) tensor with samples in [0, 1].
///
/// Channels beyond the third are ignored; fewer than three is an error.
pub fn preprocess(
	raster: &Raster,
	feed_width: usize,
	feed_height: usize,
) -> DepthResult<(Array4<f32>, OriginalSize)> {
	if raster.channels() < 3 {
		return Err(DepthError::UnsupportedFormat(format!(
			"Depth inference requires RGB input, got {} channel(s)",
			raster.channels()
		)));
	}
	if feed_width == 0 || feed_height == 0 {
		return Err(DepthError::Inference(format!(
			"Invalid feed resolution {}x{}",
			feed_width, feed_height
		)));
	}

	let original = OriginalSize {
		width: raster.width(),
		height: raster.height(),
	};

	let rgb = raster.to_rgb_image()?;
	let resized = if original.width == feed_width && original.height == feed_height {
		rgb
	} else {
		image::imageops::resize(&rgb, feed_width as u32, feed_height as u32, FilterType::Lanczos3)
	};

	// NCHW layout: all R, then G, then B
	let plane = feed_width * feed_height;
	let mut input_data = vec![0.0f32; 3 * plane];
	for (i, pixel) in resized.pixels().enumerate() {
		for c in 0..3 {
			input_data[c * plane + i] = pixel[c] as f32 / 255.0;
		}
	}

	let tensor = Array4::from_shape_vec((1, 3, feed_height, feed_width), input_data)
		.map_err(|e| DepthError::Inference(format!("Failed to shape input tensor: {}", e)))?;

	Ok((tensor, original))
}

#[cfg(test)]
mod tests {
	use super::*;
	use approx::assert_abs_diff_eq;

	#[test]
	fn shape_and_original_size() {
		let raster = Raster::filled(7, 13, 3, 0).unwrap();
		let (tensor, original) = preprocess(&raster, 32, 16).unwrap();
		assert_eq!(tensor.dim(), (1, 3, 16, 32));
		assert_eq!(
			original,
			OriginalSize {
				width: 13,
				height: 7
			}
		);
	}

	#[test]
	fn scales_to_unit_range_channel_first() {
		let data = vec![0, 128, 255, 255, 128, 0];
		let raster = Raster::new(1, 2, 3, data).unwrap();
		let (tensor, _) = preprocess(&raster, 2, 1).unwrap();

		assert_abs_diff_eq!(tensor[[0, 0, 0, 0]], 0.0);
		assert_abs_diff_eq!(tensor[[0, 1, 0, 0]], 128.0 / 255.0);
		assert_abs_diff_eq!(tensor[[0, 2, 0, 0]], 1.0);
		assert_abs_diff_eq!(tensor[[0, 0, 0, 1]], 1.0);
		assert_abs_diff_eq!(tensor[[0, 2, 0, 1]], 0.0);
	}

	#[test]
	fn uniform_image_stays_uniform_after_resampling() {
		let raster = Raster::filled(5, 9, 4, 128).unwrap();
		let (tensor, _) = preprocess(&raster, 16, 8).unwrap();
		for v in tensor.iter() {
			assert_abs_diff_eq!(*v, 128.0 / 255.0, epsilon = 1.0 / 255.0);
			assert!((0.0..=1.0).contains(v));
		}
	}

	#[test]
	fn rejects_gray_and_gray_alpha() {
		for channels in [1, 2] {
			let raster = Raster::filled(4, 4, channels, 10).unwrap();
			assert!(matches!(
				preprocess(&raster, 8, 8),
				Err(DepthError::UnsupportedFormat(_))
			));
		}
	}
}
