use crate::error::{DepthError, DepthResult};
use crate::raster::Raster;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageEncoding {
	Jpeg { quality: u8 },
	Png,
}

impl ImageEncoding {
	pub fn extension(&self) -> &'static str {
		match self {
			ImageEncoding::Jpeg { .. } => "jpg",
			ImageEncoding::Png => "png",
		}
	}

	/// JPEG for `.jpg`/`.jpeg`, PNG for everything else.
	pub fn from_path<P: AsRef<Path>>(path: P, quality: u8) -> Self {
		let ext = path
			.as_ref()
			.extension()
			.and_then(|e| e.to_str())
			.unwrap_or("")
			.to_lowercase();

		match ext.as_str() {
			"jpg" | "jpeg" => ImageEncoding::Jpeg {
				quality: quality.clamp(1, 100),
			},
			_ => ImageEncoding::Png,
		}
	}
}

/// `<dir>/<stem>-depth.png` next to the input.
pub fn default_output_path(input: &Path) -> PathBuf {
	let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
	let parent = input.parent().unwrap_or_else(|| Path::new("."));
	parent.join(format!("{}-depth.png", stem))
}

pub fn save_raster(
	raster: &Raster,
	output_path: impl AsRef<Path>,
	encoding: ImageEncoding,
) -> DepthResult<()> {
	let output_path = output_path.as_ref();

	if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
		std::fs::create_dir_all(parent).map_err(|e| {
			DepthError::Image(format!("Failed to create output directory: {}", e))
		})?;
	}

	let rgb = raster.to_rgb_image()?;
	match encoding {
		ImageEncoding::Jpeg { quality } => {
			let file = std::fs::File::create(output_path).map_err(|e| {
				DepthError::Image(format!("Failed to create output file: {}", e))
			})?;

			let mut jpeg_encoder =
				image::codecs::jpeg::JpegEncoder::new_with_quality(std::io::BufWriter::new(file), quality);
			jpeg_encoder
				.encode(
					rgb.as_raw(),
					rgb.width(),
					rgb.height(),
					image::ExtendedColorType::Rgb8,
				)
				.map_err(|e| DepthError::Image(format!("Failed to encode JPEG: {}", e)))?;
		}
		ImageEncoding::Png => {
			rgb.save_with_format(output_path, image::ImageFormat::Png)
				.map_err(|e| DepthError::Image(format!("Failed to save PNG: {}", e)))?;
		}
	}

	tracing::debug!("Wrote {:?} as {}", output_path, encoding.extension());
	Ok(())
}
