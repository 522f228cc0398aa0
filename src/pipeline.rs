use crate::colormap::Colormap;
use crate::device::{select_device, Device};
use crate::error::{DepthError, DepthResult};
use crate::inference::infer;
use crate::model::ModelProvider;
use crate::postprocess::{postprocess, DegeneratePolicy};
use crate::preprocess::preprocess;
use crate::raster::Raster;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
	/// Percentile of the disparity field mapped to the top of the colormap.
	pub percentile: f64,
	pub colormap: Colormap,
	pub degenerate: DegeneratePolicy,
}

impl Default for PipelineConfig {
	fn default() -> Self {
		Self {
			percentile: 95.0,
			colormap: Colormap::Magma,
			degenerate: DegeneratePolicy::Zero,
		}
	}
}

impl PipelineConfig {
	pub fn validate(&self) -> DepthResult<()> {
		if !(self.percentile > 0.0 && self.percentile <= 100.0) {
			return Err(DepthError::Config(format!(
				"Percentile must be in (0, 100], got {}",
				self.percentile
			)));
		}
		Ok(())
	}

	pub fn from_json_str(json: &str) -> DepthResult<Self> {
		let config: Self = serde_json::from_str(json)
			.map_err(|e| DepthError::Config(format!("Invalid pipeline config: {}", e)))?;
		config.validate()?;
		Ok(config)
	}

	pub fn from_json_file(path: impl AsRef<Path>) -> DepthResult<Self> {
		let path = path.as_ref();
		let text = std::fs::read_to_string(path).map_err(|e| {
			DepthError::Config(format!("Failed to read config {:?}: {}", path, e))
		})?;
		Self::from_json_str(&text)
	}
}

/// Raster in, colorized disparity raster out.
///
/// Device selection, model loading, preprocessing, inference and
/// postprocessing run in that order; the first failure is returned unchanged.
pub fn colorize_depth(
	raster: &Raster,
	provider: &ModelProvider,
	device: Device,
	config: &PipelineConfig,
) -> DepthResult<Raster> {
	let models = provider.load(device)?;
	let encoder = models.encoder.as_ref();

	let start = std::time::Instant::now();
	let (input, original) = preprocess(raster, encoder.feed_width(), encoder.feed_height())?;
	let disp = infer(encoder, models.decoder.as_ref(), &input)?;
	let colorized = postprocess(&disp, original.width, original.height, config)?;

	tracing::debug!(
		"Colorized {}x{} depth on {} in {:.1}ms",
		original.width,
		original.height,
		device,
		start.elapsed().as_secs_f64() * 1000.0
	);
	Ok(colorized)
}

/// Reusable pipeline bound to a model provider and a device.
///
/// Cheap to clone and safe to share across threads; concurrent `run` calls
/// reuse the same loaded models.
#[derive(Clone)]
pub struct DepthPipeline {
	provider: Arc<ModelProvider>,
	device: Device,
	config: PipelineConfig,
}

impl DepthPipeline {
	/// Pipeline on the best available device.
	pub fn new(provider: Arc<ModelProvider>) -> Self {
		Self::on_device(provider, select_device())
	}

	pub fn on_device(provider: Arc<ModelProvider>, device: Device) -> Self {
		Self {
			provider,
			device,
			config: PipelineConfig::default(),
		}
	}

	/// Pipeline for the default pretrained parameter set.
	#[cfg(feature = "onnx")]
	pub fn pretrained() -> Self {
		let source = crate::model::ModelSource::from_env();
		Self::new(Arc::new(ModelProvider::pretrained(source)))
	}

	pub fn with_device(mut self, device: Device) -> Self {
		self.device = device;
		self
	}

	pub fn with_config(mut self, config: PipelineConfig) -> DepthResult<Self> {
		config.validate()?;
		self.config = config;
		Ok(self)
	}

	pub fn device(&self) -> Device {
		self.device
	}

	pub fn config(&self) -> &PipelineConfig {
		&self.config
	}

	pub fn provider(&self) -> &Arc<ModelProvider> {
		&self.provider
	}

	pub fn run(&self, raster: &Raster) -> DepthResult<Raster> {
		colorize_depth(raster, &self.provider, self.device, &self.config)
	}
}
