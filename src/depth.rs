//! ONNX Runtime backend for the encoder and decoder stages.

use crate::device::Device;
use crate::error::{DepthError, DepthResult};
use crate::network::{DecoderOutputs, DepthDecoder, DepthEncoder, FeatureSet, OutputKey};
use ndarray::Array4;
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
use ort::session::{builder::GraphOptimizationLevel, Session, SessionInputValue, SessionInputs, SessionOutputs};
use ort::value::TensorRef;
use std::borrow::Cow;
use std::path::Path;
use std::sync::Mutex;

const INTRA_THREADS: usize = 4;

/// Builds a session for `model_path` on `device`.
///
/// An accelerator that fails to register is reported as [`DepthError::Device`]
/// rather than silently running on the CPU.
pub fn create_session(model_path: &Path, device: Device) -> DepthResult<Session> {
	let builder = Session::builder()
		.map_err(|e| DepthError::ModelUnavailable(format!("Failed to create session: {}", e)))?
		.with_optimization_level(GraphOptimizationLevel::Level3)
		.map_err(|e| DepthError::ModelUnavailable(format!("Failed to set opt level: {}", e)))?
		.with_intra_threads(INTRA_THREADS)
		.map_err(|e| DepthError::ModelUnavailable(format!("Failed to set threads: {}", e)))?;

	let builder = match device {
		Device::Cpu => builder.with_execution_providers([CPUExecutionProvider::default().build()]),
		Device::Cuda(device_id) => builder.with_execution_providers([CUDAExecutionProvider::default()
			.with_device_id(device_id)
			.build()
			.error_on_failure()]),
	}
	.map_err(|e| DepthError::Device(format!("{} cannot host the model: {}", device, e)))?;

	builder.commit_from_file(model_path).map_err(|e| {
		DepthError::ModelUnavailable(format!("Failed to load ONNX model {:?}: {}", model_path, e))
	})
}

fn tensor_ref<'a>(name: &str, array: &'a Array4<f32>) -> DepthResult<TensorRef<'a, f32>> {
	let dims: Vec<i64> = array.shape().iter().map(|&d| d as i64).collect();
	let data = array.as_slice().ok_or_else(|| {
		DepthError::Inference(format!("Tensor '{}' is not contiguous in memory", name))
	})?;
	TensorRef::from_array_view((dims, data))
		.map_err(|e| DepthError::Inference(format!("Failed to create input '{}': {}", name, e)))
}

fn extract_array4(outputs: &SessionOutputs<'_>, name: &str) -> DepthResult<Array4<f32>> {
	let (shape, data) = outputs[name]
		.try_extract_tensor::<f32>()
		.map_err(|e| DepthError::Inference(format!("Failed to extract output '{}': {}", name, e)))?;

	let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
	if dims.len() != 4 {
		return Err(DepthError::Inference(format!(
			"Output '{}' has {} dimensions, expected 4",
			name,
			dims.len()
		)));
	}

	Array4::from_shape_vec((dims[0], dims[1], dims[2], dims[3]), data.to_vec())
		.map_err(|e| DepthError::Inference(format!("Failed to reshape output '{}': {}", name, e)))
}

fn io_names(session: &Session) -> (Vec<String>, Vec<String>) {
	let inputs = session.inputs().iter().map(|i| i.name().to_string()).collect();
	let outputs = session.outputs().iter().map(|o| o.name().to_string()).collect();
	(inputs, outputs)
}

pub struct OnnxEncoder {
	session: Mutex<Session>,
	input_name: String,
	output_names: Vec<String>,
	feed_width: usize,
	feed_height: usize,
}

impl OnnxEncoder {
	pub fn new(
		model_path: &Path,
		device: Device,
		feed_width: usize,
		feed_height: usize,
	) -> DepthResult<Self> {
		let session = create_session(model_path, device)?;
		let (inputs, output_names) = io_names(&session);
		let input_name = inputs.into_iter().next().ok_or_else(|| {
			DepthError::ModelUnavailable(format!("Encoder {:?} declares no inputs", model_path))
		})?;
		if output_names.is_empty() {
			return Err(DepthError::ModelUnavailable(format!(
				"Encoder {:?} declares no outputs",
				model_path
			)));
		}

		tracing::debug!(
			"Encoder loaded on {}: input '{}', {} feature maps, feed {}x{}",
			device,
			input_name,
			output_names.len(),
			feed_width,
			feed_height
		);

		Ok(Self {
			session: Mutex::new(session),
			input_name,
			output_names,
			feed_width,
			feed_height,
		})
	}
}

impl DepthEncoder for OnnxEncoder {
	fn feed_width(&self) -> usize {
		self.feed_width
	}

	fn feed_height(&self) -> usize {
		self.feed_height
	}

	fn forward(&self, input: &Array4<f32>) -> DepthResult<FeatureSet> {
		let tensor = tensor_ref(&self.input_name, input)?;

		let mut session = self
			.session
			.lock()
			.map_err(|_| DepthError::Inference("Encoder session lock poisoned".to_string()))?;
		let outputs = session
			.run(ort::inputs![self.input_name.as_str() => tensor])
			.map_err(|e| DepthError::Inference(format!("Encoder failed: {}", e)))?;

		let mut features = FeatureSet::new();
		for name in &self.output_names {
			features.push(name.clone(), extract_array4(&outputs, name)?);
		}
		Ok(features)
	}
}

pub struct OnnxDecoder {
	session: Mutex<Session>,
	input_names: Vec<String>,
	output_names: Vec<String>,
}

impl OnnxDecoder {
	pub fn new(model_path: &Path, device: Device) -> DepthResult<Self> {
		let session = create_session(model_path, device)?;
		let (input_names, output_names) = io_names(&session);
		if output_names.is_empty() {
			return Err(DepthError::ModelUnavailable(format!(
				"Decoder {:?} declares no outputs",
				model_path
			)));
		}

		tracing::debug!(
			"Decoder loaded on {}: {} inputs, outputs {:?}",
			device,
			input_names.len(),
			output_names
		);

		Ok(Self {
			session: Mutex::new(session),
			input_names,
			output_names,
		})
	}

	/// Pairs decoder inputs with feature maps: by name when every input has a
	/// same-named feature, otherwise by position.
	fn bind<'f>(&self, features: &'f FeatureSet) -> DepthResult<Vec<(&str, &'f Array4<f32>)>> {
		if let Some(bound) = self
			.input_names
			.iter()
			.map(|name| features.get(name).map(|t| (name.as_str(), t)))
			.collect::<Option<Vec<_>>>()
		{
			return Ok(bound);
		}

		if features.len() != self.input_names.len() {
			return Err(DepthError::Inference(format!(
				"Decoder expects {} feature maps, encoder produced {}",
				self.input_names.len(),
				features.len()
			)));
		}

		Ok(self
			.input_names
			.iter()
			.zip(features.iter())
			.map(|(name, map)| (name.as_str(), &map.tensor))
			.collect())
	}
}

impl DepthDecoder for OnnxDecoder {
	fn forward(&self, features: &FeatureSet) -> DepthResult<DecoderOutputs> {
		let mut inputs: Vec<(Cow<'_, str>, SessionInputValue<'_>)> = Vec::with_capacity(self.input_names.len());
		for (name, tensor) in self.bind(features)? {
			inputs.push((Cow::Owned(name.to_string()), tensor_ref(name, tensor)?.into()));
		}

		let mut session = self
			.session
			.lock()
			.map_err(|_| DepthError::Inference("Decoder session lock poisoned".to_string()))?;
		let outputs = session
			.run(SessionInputs::<'_, '_, 0>::ValueMap(inputs))
			.map_err(|e| DepthError::Inference(format!("Decoder failed: {}", e)))?;

		let mut decoded = DecoderOutputs::new();
		for name in &self.output_names {
			let key = OutputKey::parse(name).unwrap_or_else(|| OutputKey::new(name.as_str(), 0));
			decoded.insert(key, extract_array4(&outputs, name)?);
		}
		Ok(decoded)
	}
}
