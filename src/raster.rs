use crate::error::{DepthError, DepthResult};
use image::{DynamicImage, RgbImage};

/// Row-major, interleaved 8-bit raster of shape (height, width, channels).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Raster {
	height: usize,
	width: usize,
	channels: usize,
	data: Vec<u8>,
}

impl Raster {
	pub fn new(height: usize, width: usize, channels: usize, data: Vec<u8>) -> DepthResult<Self> {
		if !(1..=4).contains(&channels) {
			return Err(DepthError::UnsupportedFormat(format!(
				"{} channels per pixel (expected 1 to 4)",
				channels
			)));
		}
		if height == 0 || width == 0 {
			return Err(DepthError::Config(format!(
				"Raster must not be empty: {}x{}",
				width, height
			)));
		}
		let expected = height * width * channels;
		if data.len() != expected {
			return Err(DepthError::Config(format!(
				"Raster data has {} samples, expected {} for {}x{}x{}",
				data.len(),
				expected,
				height,
				width,
				channels
			)));
		}

		Ok(Self {
			height,
			width,
			channels,
			data,
		})
	}

	/// Raster with every sample set to `value`.
	pub fn filled(height: usize, width: usize, channels: usize, value: u8) -> DepthResult<Self> {
		Self::new(height, width, channels, vec![value; height * width * channels])
	}

	pub fn height(&self) -> usize {
		self.height
	}

	pub fn width(&self) -> usize {
		self.width
	}

	pub fn channels(&self) -> usize {
		self.channels
	}

	/// (height, width, channels)
	pub fn shape(&self) -> (usize, usize, usize) {
		(self.height, self.width, self.channels)
	}

	pub fn as_slice(&self) -> &[u8] {
		&self.data
	}

	pub fn into_vec(self) -> Vec<u8> {
		self.data
	}

	/// Channels of the pixel at row `y`, column `x`; `None` outside the raster.
	pub fn pixel(&self, y: usize, x: usize) -> Option<&[u8]> {
		if y >= self.height || x >= self.width {
			return None;
		}
		let start = (y * self.width + x) * self.channels;
		self.data.get(start..start + self.channels)
	}

	/// First three channels as an RGB image; extra channels are dropped.
	pub fn to_rgb_image(&self) -> DepthResult<RgbImage> {
		if self.channels < 3 {
			return Err(DepthError::UnsupportedFormat(format!(
				"RGB input required, got {} channel(s)",
				self.channels
			)));
		}

		let rgb: Vec<u8> = if self.channels == 3 {
			self.data.clone()
		} else {
			self.data
				.chunks_exact(self.channels)
				.flat_map(|px| [px[0], px[1], px[2]])
				.collect()
		};

		RgbImage::from_raw(self.width as u32, self.height as u32, rgb).ok_or_else(|| {
			DepthError::Image("Failed to create RGB buffer from raster".to_string())
		})
	}

	pub fn into_rgb_image(self) -> DepthResult<RgbImage> {
		if self.channels != 3 {
			return self.to_rgb_image();
		}
		let (width, height) = (self.width as u32, self.height as u32);
		RgbImage::from_raw(width, height, self.data).ok_or_else(|| {
			DepthError::Image("Failed to create RGB buffer from raster".to_string())
		})
	}
}

impl From<RgbImage> for Raster {
	fn from(img: RgbImage) -> Self {
		let (width, height) = img.dimensions();
		Self {
			height: height as usize,
			width: width as usize,
			channels: 3,
			data: img.into_raw(),
		}
	}
}

impl From<DynamicImage> for Raster {
	fn from(img: DynamicImage) -> Self {
		let (width, height) = (img.width() as usize, img.height() as usize);
		let (channels, data) = match img {
			DynamicImage::ImageLuma8(buf) => (1, buf.into_raw()),
			DynamicImage::ImageLumaA8(buf) => (2, buf.into_raw()),
			DynamicImage::ImageRgb8(buf) => (3, buf.into_raw()),
			DynamicImage::ImageRgba8(buf) => (4, buf.into_raw()),
			other if other.color().has_alpha() => (4, other.to_rgba8().into_raw()),
			other => (3, other.to_rgb8().into_raw()),
		};
		Self {
			height,
			width,
			channels,
			data,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_mismatched_length() {
		let err = Raster::new(2, 2, 3, vec![0; 11]).unwrap_err();
		assert!(matches!(err, DepthError::Config(_)));
	}

	#[test]
	fn rejects_five_channels() {
		let err = Raster::new(1, 1, 5, vec![0; 5]).unwrap_err();
		assert!(matches!(err, DepthError::UnsupportedFormat(_)));
	}

	#[test]
	fn rgba_drops_alpha() {
		let raster = Raster::new(1, 2, 4, vec![1, 2, 3, 255, 4, 5, 6, 0]).unwrap();
		let rgb = raster.to_rgb_image().unwrap();
		assert_eq!(rgb.into_raw(), vec![1, 2, 3, 4, 5, 6]);
	}

	#[test]
	fn gray_is_not_rgb() {
		let raster = Raster::filled(2, 2, 1, 7).unwrap();
		assert!(matches!(
			raster.to_rgb_image(),
			Err(DepthError::UnsupportedFormat(_))
		));
	}

	#[test]
	fn dynamic_image_keeps_channel_count() {
		let gray = DynamicImage::new_luma8(3, 2);
		assert_eq!(Raster::from(gray).shape(), (2, 3, 1));
		let rgba = DynamicImage::new_rgba8(3, 2);
		assert_eq!(Raster::from(rgba).shape(), (2, 3, 4));
		let rgb16 = DynamicImage::new_rgb16(3, 2);
		assert_eq!(Raster::from(rgb16).shape(), (2, 3, 3));
	}

	#[test]
	fn pixel_is_none_outside_bounds() {
		let raster = Raster::new(2, 3, 2, (0..12).collect()).unwrap();
		assert_eq!(raster.pixel(1, 2), Some(&[10u8, 11][..]));
		assert_eq!(raster.pixel(0, 0), Some(&[0u8, 1][..]));
		assert_eq!(raster.pixel(2, 0), None);
		assert_eq!(raster.pixel(0, 3), None);
		assert_eq!(raster.pixel(usize::MAX, usize::MAX), None);
	}
}
