use crate::error::{DepthError, DepthResult};
use crate::raster::Raster;
use image::DynamicImage;
use std::path::Path;

/// Decodes an image file into a raster, keeping its channel count.
pub async fn load_image(path: impl AsRef<Path>) -> DepthResult<Raster> {
	let path = path.as_ref();

	if !path.exists() {
		return Err(DepthError::Image(format!("Image file not found: {:?}", path)));
	}

	let extension = path
		.extension()
		.and_then(|ext| ext.to_str())
		.map(|s| s.to_lowercase())
		.ok_or_else(|| DepthError::Image(format!("File has no extension: {:?}", path)))?;

	let img = match extension.as_str() {
		"jpg" | "jpeg" | "png" | "gif" | "bmp" | "tiff" | "tif" | "webp" => load_standard(path).await?,
		_ => {
			return Err(DepthError::Image(format!(
				"Unsupported image format: .{}",
				extension
			)))
		}
	};

	tracing::debug!(
		"Loaded {:?}: {}x{} {:?}",
		path,
		img.width(),
		img.height(),
		img.color()
	);
	Ok(Raster::from(img))
}

async fn load_standard(path: &Path) -> DepthResult<DynamicImage> {
	let bytes = tokio::fs::read(path).await?;
	let format = image::ImageFormat::from_path(path)
		.map_err(|e| DepthError::Image(format!("Unknown image format {:?}: {}", path, e)))?;
	image::load_from_memory_with_format(&bytes, format)
		.map_err(|e| DepthError::Image(format!("Failed to load image {:?}: {}", path, e)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use image::{Rgb, RgbImage, Rgba, RgbaImage};

	#[tokio::test]
	async fn loads_png_with_alpha() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("in.png");
		RgbaImage::from_pixel(4, 3, Rgba([10, 20, 30, 255])).save(&path).unwrap();

		let raster = load_image(&path).await.unwrap();
		assert_eq!(raster.shape(), (3, 4, 4));
		assert_eq!(raster.pixel(2, 3), Some(&[10u8, 20, 30, 255][..]));
	}

	#[tokio::test]
	async fn uppercase_extension_is_accepted() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("in.PNG");
		RgbImage::from_pixel(2, 2, Rgb([1, 2, 3])).save_with_format(&path, image::ImageFormat::Png).unwrap();
		assert_eq!(load_image(&path).await.unwrap().shape(), (2, 2, 3));
	}

	#[tokio::test]
	async fn missing_and_unknown_files_are_image_errors() {
		let tmp = tempfile::tempdir().unwrap();
		assert!(matches!(
			load_image(tmp.path().join("nope.png")).await,
			Err(DepthError::Image(_))
		));

		let odd = tmp.path().join("in.xyz");
		std::fs::write(&odd, b"data").unwrap();
		assert!(matches!(load_image(&odd).await, Err(DepthError::Image(_))));
	}
}
