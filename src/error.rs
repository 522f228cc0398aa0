pub type DepthResult<T> = Result<T, DepthError>;

/// Failure categories reported to callers.
///
/// Each maps to what the caller has to do about it: fix the input, fix the
/// environment, retry later, or report a bug.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
	InvalidInput,
	Environment,
	Transient,
	Internal,
}

impl ErrorClass {
	pub fn name(&self) -> &'static str {
		match self {
			ErrorClass::InvalidInput => "invalid input",
			ErrorClass::Environment => "environment",
			ErrorClass::Transient => "transient",
			ErrorClass::Internal => "internal",
		}
	}
}

#[derive(thiserror::Error, Debug)]
pub enum DepthError {
	/// Pretrained parameters could not be fetched, found in the cache, or unpacked.
	#[error("Model unavailable: {0}")]
	ModelUnavailable(String),

	/// The requested compute device cannot host the model.
	#[error("Device error: {0}")]
	Device(String),

	#[error("Unsupported format: {0}")]
	UnsupportedFormat(String),

	/// Tensor shapes or decoder outputs did not match what the loaded model promises.
	#[error("Inference error: {0}")]
	Inference(String),

	#[error("Image error: {0}")]
	Image(String),

	#[error("Configuration error: {0}")]
	Config(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

impl DepthError {
	pub fn class(&self) -> ErrorClass {
		match self {
			DepthError::UnsupportedFormat(_) | DepthError::Image(_) | DepthError::Config(_) => {
				ErrorClass::InvalidInput
			}
			DepthError::Device(_) | DepthError::Io(_) => ErrorClass::Environment,
			DepthError::ModelUnavailable(_) => ErrorClass::Transient,
			DepthError::Inference(_) => ErrorClass::Internal,
		}
	}

	pub fn is_retryable(&self) -> bool {
		self.class() == ErrorClass::Transient
	}
}

impl From<image::ImageError> for DepthError {
	fn from(e: image::ImageError) -> Self {
		DepthError::Image(e.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classes_separate_input_environment_and_connectivity() {
		assert_eq!(
			DepthError::UnsupportedFormat("gray".into()).class(),
			ErrorClass::InvalidInput
		);
		assert_eq!(DepthError::Device("no cuda".into()).class(), ErrorClass::Environment);
		assert_eq!(
			DepthError::ModelUnavailable("offline".into()).class(),
			ErrorClass::Transient
		);
		assert_eq!(DepthError::Inference("shape".into()).class(), ErrorClass::Internal);
	}

	#[test]
	fn only_model_unavailable_is_retryable() {
		assert!(DepthError::ModelUnavailable("timeout".into()).is_retryable());
		assert!(!DepthError::Device("absent".into()).is_retryable());
		assert!(!DepthError::Inference("bad".into()).is_retryable());
		let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
		assert!(!DepthError::from(io).is_retryable());
	}

	#[test]
	fn io_and_image_errors_convert() {
		let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
		assert!(matches!(DepthError::from(io), DepthError::Io(_)));

		let decode = image::load_from_memory(b"not an image").unwrap_err();
		let err = DepthError::from(decode);
		assert!(matches!(err, DepthError::Image(_)));
		assert_eq!(err.class(), ErrorClass::InvalidInput);
	}

	#[test]
	fn display_names_the_category() {
		let err = DepthError::UnsupportedFormat("1 channel".into());
		assert_eq!(err.to_string(), "Unsupported format: 1 channel");
	}
}
