//! Opaque interfaces to the two pretrained stages.
//!
//! The network architecture is not modelled here: an encoder turns the
//! normalized input tensor into a set of feature maps, and a decoder turns
//! those into disparity maps at several scales. Backends (ONNX Runtime in
//! [`crate::depth`], stubs in tests) implement the traits.

use crate::error::DepthResult;
use ndarray::Array4;
use std::collections::BTreeMap;
use std::fmt;

/// Feature-encoding stage.
pub trait DepthEncoder: Send + Sync {
	/// Width every input must be resized to.
	fn feed_width(&self) -> usize;

	/// Height every input must be resized to.
	fn feed_height(&self) -> usize;

	fn forward(&self, input: &Array4<f32>) -> DepthResult<FeatureSet>;
}

/// Disparity-decoding stage.
pub trait DepthDecoder: Send + Sync {
	fn forward(&self, features: &FeatureSet) -> DepthResult<DecoderOutputs>;
}

#[derive(Clone, Debug)]
pub struct FeatureMap {
	pub name: String,
	pub tensor: Array4<f32>,
}

/// Encoder output, in the order the encoder produced it.
#[derive(Clone, Debug, Default)]
pub struct FeatureSet {
	maps: Vec<FeatureMap>,
}

impl FeatureSet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, name: impl Into<String>, tensor: Array4<f32>) {
		self.maps.push(FeatureMap {
			name: name.into(),
			tensor,
		});
	}

	pub fn get(&self, name: &str) -> Option<&Array4<f32>> {
		self.maps.iter().find(|m| m.name == name).map(|m| &m.tensor)
	}

	pub fn iter(&self) -> impl Iterator<Item = &FeatureMap> {
		self.maps.iter()
	}

	pub fn len(&self) -> usize {
		self.maps.len()
	}

	pub fn is_empty(&self) -> bool {
		self.maps.is_empty()
	}
}

/// Decoder output key: an output name and its scale level (0 is finest).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputKey {
	pub name: String,
	pub scale: usize,
}

impl OutputKey {
	pub fn new(name: impl Into<String>, scale: usize) -> Self {
		Self {
			name: name.into(),
			scale,
		}
	}

	pub fn disparity(scale: usize) -> Self {
		Self::new("disp", scale)
	}

	/// Parses a flattened output name such as `disp_0`.
	pub fn parse(flat: &str) -> Option<Self> {
		let (name, scale) = flat.rsplit_once('_')?;
		if name.is_empty() {
			return None;
		}
		let scale = scale.parse().ok()?;
		Some(Self::new(name, scale))
	}
}

impl fmt::Display for OutputKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "(\"{}\", {})", self.name, self.scale)
	}
}

#[derive(Clone, Debug, Default)]
pub struct DecoderOutputs {
	entries: BTreeMap<OutputKey, Array4<f32>>,
}

impl DecoderOutputs {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, key: OutputKey, tensor: Array4<f32>) {
		self.entries.insert(key, tensor);
	}

	pub fn get(&self, key: &OutputKey) -> Option<&Array4<f32>> {
		self.entries.get(key)
	}

	pub fn take(&mut self, key: &OutputKey) -> Option<Array4<f32>> {
		self.entries.remove(key)
	}

	pub fn keys(&self) -> impl Iterator<Item = &OutputKey> {
		self.entries.keys()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_flat_output_names() {
		assert_eq!(OutputKey::parse("disp_0"), Some(OutputKey::disparity(0)));
		assert_eq!(
			OutputKey::parse("depth_map_3"),
			Some(OutputKey::new("depth_map", 3))
		);
		assert_eq!(OutputKey::parse("disp"), None);
		assert_eq!(OutputKey::parse("_1"), None);
		assert_eq!(OutputKey::parse("disp_x"), None);
	}

	#[test]
	fn keys_order_by_name_then_scale() {
		let mut outputs = DecoderOutputs::new();
		outputs.insert(OutputKey::disparity(2), Array4::zeros((1, 1, 2, 2)));
		outputs.insert(OutputKey::disparity(0), Array4::zeros((1, 1, 8, 8)));
		let keys: Vec<_> = outputs.keys().map(|k| k.scale).collect();
		assert_eq!(keys, vec![0, 2]);
		assert_eq!(outputs.take(&OutputKey::disparity(0)).unwrap().dim(), (1, 1, 8, 8));
		assert_eq!(outputs.len(), 1);
	}

	#[test]
	fn feature_lookup_by_name() {
		let mut features = FeatureSet::new();
		features.push("features_0", Array4::zeros((1, 64, 96, 320)));
		features.push("features_1", Array4::zeros((1, 64, 48, 160)));
		assert_eq!(features.len(), 2);
		assert_eq!(features.get("features_1").unwrap().dim(), (1, 64, 48, 160));
		assert!(features.get("features_9").is_none());
	}
}
