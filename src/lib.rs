pub mod colormap;
pub mod device;
pub mod error;
pub mod image_loader;
pub mod inference;
pub mod model;
pub mod network;
pub mod output;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod raster;
pub mod resize;

#[cfg(feature = "onnx")]
pub mod depth;

pub use colormap::Colormap;
pub use device::{select_device, Device};
pub use error::{DepthError, DepthResult, ErrorClass};
pub use model::{ModelLoader, ModelPair, ModelProvider, ModelSource, PretrainedStore};
pub use network::{DecoderOutputs, DepthDecoder, DepthEncoder, FeatureSet, OutputKey};
pub use pipeline::{colorize_depth, DepthPipeline, PipelineConfig};
pub use postprocess::DegeneratePolicy;
pub use raster::Raster;

#[cfg(feature = "onnx")]
pub use depth::{OnnxDecoder, OnnxEncoder};
#[cfg(feature = "onnx")]
pub use model::OnnxModelLoader;

use std::path::Path;

/// Load an image file, estimate its depth and save the colorized map.
pub async fn process_photo(
	input_path: impl AsRef<Path>,
	output_path: impl AsRef<Path>,
	pipeline: &DepthPipeline,
	encoding: output::ImageEncoding,
) -> DepthResult<()> {
	let raster = image_loader::load_image(input_path).await?;
	let worker = pipeline.clone();
	let colorized = tokio::task::spawn_blocking(move || worker.run(&raster))
		.await
		.map_err(|e| DepthError::Inference(format!("Depth worker failed: {}", e)))??;
	output::save_raster(&colorized, output_path, encoding)
}
