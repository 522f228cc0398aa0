use crate::device::Device;
use crate::error::{DepthError, DepthResult};
use crate::network::{DepthDecoder, DepthEncoder};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::io::AsyncWriteExt;

/// Pretrained parameter set used when none is configured.
pub const DEFAULT_PARAMETER_SET: &str = "mono+stereo_640x192";

pub const MODEL_DIR_ENV: &str = "MONODEPTH_MODEL_DIR";
pub const MODEL_URL_ENV: &str = "MONODEPTH_MODEL_URL";

pub const ENCODER_FILE: &str = "encoder.onnx";
pub const DECODER_FILE: &str = "depth.onnx";
pub const MANIFEST_FILE: &str = "model.json";

const DEFAULT_FEED_WIDTH: usize = 640;
const DEFAULT_FEED_HEIGHT: usize = 192;

/// Published constants of a parameter set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelManifest {
	pub feed_width: usize,
	pub feed_height: usize,
}

impl ModelManifest {
	/// Resolution encoded in a parameter-set name such as `mono_1024x320`,
	/// falling back to 640x192.
	pub fn for_parameter_set(parameter_set: &str) -> Self {
		let parsed = parameter_set
			.rsplit_once('_')
			.and_then(|(_, res)| res.split_once('x'))
			.and_then(|(w, h)| Some((w.parse::<usize>().ok()?, h.parse::<usize>().ok()?)))
			.filter(|&(w, h)| w > 0 && h > 0);

		match parsed {
			Some((feed_width, feed_height)) => Self {
				feed_width,
				feed_height,
			},
			None => Self {
				feed_width: DEFAULT_FEED_WIDTH,
				feed_height: DEFAULT_FEED_HEIGHT,
			},
		}
	}
}

/// Where a parameter set comes from and where it is cached.
#[derive(Clone, Debug)]
pub struct ModelSource {
	pub parameter_set: String,
	/// Archive host. Without one, only cached copies can be used.
	pub base_url: Option<String>,
	pub cache_roots: Vec<PathBuf>,
}

impl ModelSource {
	/// Default parameter set, with `MONODEPTH_MODEL_DIR` / `MONODEPTH_MODEL_URL` applied.
	///
	/// Cache roots are searched in order:
	/// 1. `MONODEPTH_MODEL_DIR`
	/// 2. Platform cache directory
	/// 3. `~/.monodepth/models`
	/// 4. `./models`
	pub fn from_env() -> Self {
		let mut cache_roots = Vec::new();
		if let Ok(dir) = std::env::var(MODEL_DIR_ENV) {
			cache_roots.push(PathBuf::from(dir));
		}
		if let Some(cache) = dirs::cache_dir() {
			cache_roots.push(cache.join("monodepth"));
		}
		if let Some(home) = dirs::home_dir() {
			cache_roots.push(home.join(".monodepth").join("models"));
		}
		cache_roots.push(PathBuf::from("models"));

		Self {
			parameter_set: DEFAULT_PARAMETER_SET.to_string(),
			base_url: std::env::var(MODEL_URL_ENV).ok().filter(|url| !url.trim().is_empty()),
			cache_roots,
		}
	}

	/// Source that caches only under `root`.
	pub fn with_cache_root(root: impl Into<PathBuf>) -> Self {
		Self {
			cache_roots: vec![root.into()],
			..Self::from_env()
		}
	}

	pub fn parameter_set(mut self, parameter_set: impl Into<String>) -> Self {
		self.parameter_set = parameter_set.into();
		self
	}

	pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
		self.base_url = Some(base_url.into());
		self
	}

	/// `<base_url>/<parameter_set>.tar.gz`, or `ModelUnavailable` when no
	/// archive host is configured.
	pub fn archive_url(&self) -> DepthResult<String> {
		let base_url = self.base_url.as_deref().ok_or_else(|| {
			DepthError::ModelUnavailable(format!(
				"Parameter set '{}' is not cached and no download source is configured. \
				 Set {} to the archive host, or place {} and {} in <{}>/{}",
				self.parameter_set,
				MODEL_URL_ENV,
				ENCODER_FILE,
				DECODER_FILE,
				MODEL_DIR_ENV,
				self.parameter_set
			))
		})?;
		Ok(format!(
			"{}/{}.tar.gz",
			base_url.trim_end_matches('/'),
			self.parameter_set
		))
	}
}

/// A complete cached copy of a parameter set.
#[derive(Clone, Debug)]
pub struct ModelFiles {
	pub dir: PathBuf,
	pub encoder: PathBuf,
	pub decoder: PathBuf,
	pub manifest: ModelManifest,
}

impl ModelFiles {
	fn open(dir: &Path, parameter_set: &str) -> DepthResult<Option<Self>> {
		let encoder = dir.join(ENCODER_FILE);
		let decoder = dir.join(DECODER_FILE);
		if !encoder.is_file() || !decoder.is_file() {
			return Ok(None);
		}

		let manifest_path = dir.join(MANIFEST_FILE);
		let manifest = if manifest_path.is_file() {
			let text = std::fs::read_to_string(&manifest_path)?;
			serde_json::from_str(&text).map_err(|e| {
				DepthError::ModelUnavailable(format!("Corrupt manifest {:?}: {}", manifest_path, e))
			})?
		} else {
			ModelManifest::for_parameter_set(parameter_set)
		};

		Ok(Some(Self {
			dir: dir.to_path_buf(),
			encoder,
			decoder,
			manifest,
		}))
	}
}

/// On-disk store of downloaded parameter sets.
#[derive(Clone, Debug)]
pub struct PretrainedStore {
	source: ModelSource,
}

impl PretrainedStore {
	pub fn new(source: ModelSource) -> Self {
		Self { source }
	}

	pub fn source(&self) -> &ModelSource {
		&self.source
	}

	/// First complete cached copy across the cache roots.
	pub fn find_cached(&self) -> DepthResult<Option<ModelFiles>> {
		for root in &self.source.cache_roots {
			let dir = root.join(&self.source.parameter_set);
			if let Some(files) = ModelFiles::open(&dir, &self.source.parameter_set)? {
				tracing::debug!("Using cached parameter set at {:?}", files.dir);
				return Ok(Some(files));
			}
		}
		Ok(None)
	}

	/// Returns the cached copy, downloading it first if needed.
	pub async fn fetch(&self) -> DepthResult<ModelFiles> {
		if let Some(files) = self.find_cached()? {
			return Ok(files);
		}

		let url = self.source.archive_url()?;
		let root = self.writable_root()?;
		let id = &self.source.parameter_set;
		let pid = std::process::id();
		let archive_path = root.join(format!(".{}.download-{}", id, pid));
		let staging = root.join(format!(".{}.partial-{}", id, pid));

		tracing::info!("Downloading parameter set '{}' from {}", id, url);
		let result = async {
			download(&url, &archive_path).await?;
			unpack_archive(&archive_path, &staging)?;
			ModelFiles::open(&staging, id)?.ok_or_else(|| {
				DepthError::ModelUnavailable(format!(
					"Archive {} is missing {} or {}",
					url, ENCODER_FILE, DECODER_FILE
				))
			})?;
			install(&staging, &root.join(id))
		}
		.await;

		let _ = std::fs::remove_file(&archive_path);
		let _ = std::fs::remove_dir_all(&staging);
		result?;

		self.find_cached()?.ok_or_else(|| {
			DepthError::ModelUnavailable(format!("Parameter set '{}' vanished after install", id))
		})
	}

	/// Blocking [`fetch`](Self::fetch). The download runs on its own thread and
	/// runtime, so this is safe to call from inside an async context.
	pub fn fetch_blocking(&self) -> DepthResult<ModelFiles> {
		if let Some(files) = self.find_cached()? {
			return Ok(files);
		}

		let store = self.clone();
		std::thread::spawn(move || -> DepthResult<ModelFiles> {
			let runtime = tokio::runtime::Builder::new_current_thread()
				.enable_all()
				.build()?;
			runtime.block_on(store.fetch())
		})
		.join()
		.map_err(|_| DepthError::ModelUnavailable("Model download thread panicked".to_string()))?
	}

	fn writable_root(&self) -> DepthResult<PathBuf> {
		for root in &self.source.cache_roots {
			match std::fs::create_dir_all(root) {
				Ok(()) => return Ok(root.clone()),
				Err(e) => tracing::debug!("Cache root {:?} not writable: {}", root, e),
			}
		}
		Err(DepthError::ModelUnavailable(format!(
			"No writable cache directory.\nSearched locations:\n{}",
			self.source
				.cache_roots
				.iter()
				.map(|p| format!("  - {}", p.display()))
				.collect::<Vec<_>>()
				.join("\n")
		)))
	}
}

async fn download(url: &str, dest: &Path) -> DepthResult<()> {
	let response = reqwest::get(url)
		.await
		.and_then(|r| r.error_for_status())
		.map_err(|e| DepthError::ModelUnavailable(format!("Failed to fetch {}: {}", url, e)))?;

	let total = response.content_length();
	let mut file = tokio::fs::File::create(dest).await?;
	let mut stream = response.bytes_stream();
	let mut downloaded: u64 = 0;
	let mut next_report: u64 = 0;

	while let Some(chunk) = stream.next().await {
		let chunk = chunk.map_err(|e| {
			DepthError::ModelUnavailable(format!("Download of {} interrupted: {}", url, e))
		})?;
		file.write_all(&chunk).await?;
		downloaded += chunk.len() as u64;

		if downloaded >= next_report {
			match total {
				Some(total) if total > 0 => tracing::info!(
					"Downloading model: {:.1}% ({} / {} bytes)",
					downloaded as f64 / total as f64 * 100.0,
					downloaded,
					total
				),
				_ => tracing::info!("Downloading model: {} bytes", downloaded),
			}
			next_report = downloaded + total.map_or(8 << 20, |t| (t / 10).max(1));
		}
	}

	file.flush().await?;
	Ok(())
}

/// Extracts the model files from a `.tar.gz` into `dest`, ignoring the
/// archive's directory structure and any unrelated entries.
pub fn unpack_archive(archive_path: &Path, dest: &Path) -> DepthResult<()> {
	let corrupt =
		|e: std::io::Error| DepthError::ModelUnavailable(format!("Corrupt archive {:?}: {}", archive_path, e));

	std::fs::create_dir_all(dest)?;
	let file = std::fs::File::open(archive_path)?;
	let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));

	for entry in archive.entries().map_err(corrupt)? {
		let mut entry = entry.map_err(corrupt)?;
		let path = entry.path().map_err(corrupt)?.into_owned();
		let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
			continue;
		};
		if !entry.header().entry_type().is_file() {
			continue;
		}
		if [ENCODER_FILE, DECODER_FILE, MANIFEST_FILE].contains(&name) {
			let target = dest.join(name);
			entry.unpack(&target).map_err(corrupt)?;
		}
	}
	Ok(())
}

fn install(staging: &Path, target: &Path) -> DepthResult<()> {
	match std::fs::rename(staging, target) {
		Ok(()) => Ok(()),
		// Another process installed the same set first.
		Err(_) if target.join(ENCODER_FILE).is_file() && target.join(DECODER_FILE).is_file() => Ok(()),
		Err(e) => Err(e.into()),
	}
}

/// Encoder and decoder handles for one device. Read-only once built.
#[derive(Clone)]
pub struct ModelPair {
	pub encoder: Arc<dyn DepthEncoder>,
	pub decoder: Arc<dyn DepthDecoder>,
}

impl ModelPair {
	pub fn new(encoder: impl DepthEncoder + 'static, decoder: impl DepthDecoder + 'static) -> Self {
		Self {
			encoder: Arc::new(encoder),
			decoder: Arc::new(decoder),
		}
	}
}

/// Builds the model pair for a device.
pub trait ModelLoader: Send + Sync {
	fn load(&self, device: Device) -> DepthResult<ModelPair>;
}

impl<F> ModelLoader for F
where
	F: Fn(Device) -> DepthResult<ModelPair> + Send + Sync,
{
	fn load(&self, device: Device) -> DepthResult<ModelPair> {
		self(device)
	}
}

/// Loads the pretrained ONNX parameter set, downloading it on first use.
#[cfg(feature = "onnx")]
pub struct OnnxModelLoader {
	store: PretrainedStore,
}

#[cfg(feature = "onnx")]
impl OnnxModelLoader {
	pub fn new(store: PretrainedStore) -> Self {
		Self { store }
	}
}

#[cfg(feature = "onnx")]
impl ModelLoader for OnnxModelLoader {
	fn load(&self, device: Device) -> DepthResult<ModelPair> {
		use crate::depth::{OnnxDecoder, OnnxEncoder};

		let files = self.store.fetch_blocking()?;
		let encoder = OnnxEncoder::new(
			&files.encoder,
			device,
			files.manifest.feed_width,
			files.manifest.feed_height,
		)?;
		let decoder = OnnxDecoder::new(&files.decoder, device)?;
		Ok(ModelPair::new(encoder, decoder))
	}
}

#[derive(Default)]
struct Slot {
	pair: OnceLock<Arc<ModelPair>>,
	loading: Mutex<()>,
}

/// Per-device cache of loaded model pairs.
///
/// Identical requests never load twice: each device has its own slot whose
/// load runs under that slot's lock. Other devices, `is_loaded` and
/// `invalidate` never wait on a load in progress.
pub struct ModelProvider {
	loader: Box<dyn ModelLoader>,
	slots: Mutex<HashMap<Device, Arc<Slot>>>,
}

impl ModelProvider {
	pub fn new(loader: impl ModelLoader + 'static) -> Self {
		Self {
			loader: Box::new(loader),
			slots: Mutex::new(HashMap::new()),
		}
	}

	/// Provider for the default pretrained parameter set.
	#[cfg(feature = "onnx")]
	pub fn pretrained(source: ModelSource) -> Self {
		Self::new(OnnxModelLoader::new(PretrainedStore::new(source)))
	}

	fn slot(&self, device: Device) -> Arc<Slot> {
		let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
		Arc::clone(slots.entry(device).or_default())
	}

	pub fn load(&self, device: Device) -> DepthResult<Arc<ModelPair>> {
		let slot = self.slot(device);
		if let Some(pair) = slot.pair.get() {
			tracing::debug!("Reusing models loaded on {}", device);
			return Ok(Arc::clone(pair));
		}

		let _loading = slot.loading.lock().unwrap_or_else(PoisonError::into_inner);
		if let Some(pair) = slot.pair.get() {
			return Ok(Arc::clone(pair));
		}

		let start = std::time::Instant::now();
		let loaded = Arc::new(self.loader.load(device)?);
		tracing::info!(
			"Models loaded on {} in {:.2}s",
			device,
			start.elapsed().as_secs_f64()
		);
		Ok(Arc::clone(slot.pair.get_or_init(|| loaded)))
	}

	pub fn is_loaded(&self, device: Device) -> bool {
		self.slots
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&device)
			.is_some_and(|slot| slot.pair.get().is_some())
	}

	/// Drops the cached pair for `device`; returns whether one was cached.
	pub fn invalidate(&self, device: Device) -> bool {
		self.slots
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&device)
			.is_some_and(|slot| slot.pair.get().is_some())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::network::{DecoderOutputs, FeatureSet};
	use ndarray::Array4;
	use std::io::Write;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Barrier;

	struct NullEncoder;

	impl DepthEncoder for NullEncoder {
		fn feed_width(&self) -> usize {
			8
		}

		fn feed_height(&self) -> usize {
			4
		}

		fn forward(&self, _input: &Array4<f32>) -> DepthResult<FeatureSet> {
			Ok(FeatureSet::new())
		}
	}

	struct NullDecoder;

	impl DepthDecoder for NullDecoder {
		fn forward(&self, _features: &FeatureSet) -> DepthResult<DecoderOutputs> {
			Ok(DecoderOutputs::new())
		}
	}

	fn write_archive(path: &Path, entries: &[(&str, &[u8])]) {
		let file = std::fs::File::create(path).unwrap();
		let gz = flate2::write::GzEncoder::new(file, flate2::Compression::default());
		let mut builder = tar::Builder::new(gz);
		for (name, data) in entries {
			let mut header = tar::Header::new_gnu();
			header.set_size(data.len() as u64);
			header.set_mode(0o644);
			header.set_cksum();
			builder.append_data(&mut header, name, *data).unwrap();
		}
		builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
	}

	#[test]
	fn resolution_from_parameter_set_name() {
		let m = ModelManifest::for_parameter_set("mono+stereo_640x192");
		assert_eq!((m.feed_width, m.feed_height), (640, 192));
		let m = ModelManifest::for_parameter_set("mono_1024x320");
		assert_eq!((m.feed_width, m.feed_height), (1024, 320));
		let m = ModelManifest::for_parameter_set("custom");
		assert_eq!((m.feed_width, m.feed_height), (640, 192));
	}

	#[test]
	fn archive_url_joins_base_and_set() {
		let source = ModelSource::with_cache_root("/tmp/none")
			.base_url("https://example.com/models/")
			.parameter_set("mono_640x192");
		assert_eq!(
			source.archive_url().unwrap(),
			"https://example.com/models/mono_640x192.tar.gz"
		);
	}

	#[test]
	fn missing_download_source_names_the_env_vars() {
		let tmp = tempfile::tempdir().unwrap();
		let store = PretrainedStore::new(ModelSource {
			parameter_set: DEFAULT_PARAMETER_SET.to_string(),
			base_url: None,
			cache_roots: vec![tmp.path().to_path_buf()],
		});

		let err = store.fetch_blocking().unwrap_err();
		let DepthError::ModelUnavailable(message) = &err else {
			panic!("unexpected error: {:?}", err);
		};
		assert!(message.contains(MODEL_URL_ENV), "{}", message);
		assert!(message.contains(MODEL_DIR_ENV), "{}", message);
		assert!(message.contains(DEFAULT_PARAMETER_SET), "{}", message);
		// Nothing is created in the cache when there is nowhere to fetch from.
		assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
	}

	#[test]
	fn download_scratch_files_are_per_process() {
		let tmp = tempfile::tempdir().unwrap();
		let store = PretrainedStore::new(
			ModelSource::with_cache_root(tmp.path()).base_url("http://127.0.0.1:9/models"),
		);
		let other = tmp.path().join(format!(".{}.download", DEFAULT_PARAMETER_SET));
		std::fs::write(&other, b"another process's partial archive").unwrap();

		assert!(store.fetch_blocking().is_err());
		assert_eq!(
			std::fs::read(&other).unwrap(),
			b"another process's partial archive"
		);
		let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
			.unwrap()
			.map(|e| e.unwrap().path())
			.filter(|p| *p != other)
			.collect();
		assert!(leftovers.is_empty(), "{:?}", leftovers);
	}

	#[test]
	fn unpack_flattens_and_filters_entries() {
		let tmp = tempfile::tempdir().unwrap();
		let archive = tmp.path().join("set.tar.gz");
		write_archive(
			&archive,
			&[
				("set/encoder.onnx", b"enc"),
				("set/depth.onnx", b"dec"),
				("set/model.json", br#"{"feed_width":320,"feed_height":96}"#),
				("set/README", b"ignored"),
			],
		);

		let dest = tmp.path().join("out");
		unpack_archive(&archive, &dest).unwrap();
		assert_eq!(std::fs::read(dest.join(ENCODER_FILE)).unwrap(), b"enc");
		assert!(!dest.join("README").exists());

		let files = ModelFiles::open(&dest, "set").unwrap().unwrap();
		assert_eq!(
			files.manifest,
			ModelManifest {
				feed_width: 320,
				feed_height: 96
			}
		);
	}

	#[test]
	fn corrupt_archive_is_model_unavailable() {
		let tmp = tempfile::tempdir().unwrap();
		let archive = tmp.path().join("bad.tar.gz");
		std::fs::write(&archive, b"definitely not gzip").unwrap();
		let err = unpack_archive(&archive, &tmp.path().join("out")).unwrap_err();
		assert!(matches!(err, DepthError::ModelUnavailable(_)));
	}

	#[test]
	fn finds_complete_cached_copy_only() {
		let tmp = tempfile::tempdir().unwrap();
		let store = PretrainedStore::new(ModelSource::with_cache_root(tmp.path()));
		let dir = tmp.path().join(DEFAULT_PARAMETER_SET);
		std::fs::create_dir_all(&dir).unwrap();
		std::fs::write(dir.join(ENCODER_FILE), b"enc").unwrap();
		assert!(store.find_cached().unwrap().is_none());

		std::fs::write(dir.join(DECODER_FILE), b"dec").unwrap();
		let files = store.find_cached().unwrap().unwrap();
		assert_eq!(files.dir, dir);
		assert_eq!(files.manifest.feed_width, 640);
	}

	#[test]
	fn unreachable_source_without_cache_is_model_unavailable() {
		let tmp = tempfile::tempdir().unwrap();
		let store = PretrainedStore::new(
			ModelSource::with_cache_root(tmp.path()).base_url("http://127.0.0.1:9/models"),
		);
		let err = store.fetch_blocking().unwrap_err();
		assert!(matches!(err, DepthError::ModelUnavailable(_)));
		assert!(err.is_retryable());
		assert!(store.find_cached().unwrap().is_none());
	}

	#[test]
	fn provider_loads_once_per_device() {
		let calls = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&calls);
		let provider = ModelProvider::new(move |_device: Device| -> DepthResult<ModelPair> {
			counter.fetch_add(1, Ordering::SeqCst);
			Ok(ModelPair::new(NullEncoder, NullDecoder))
		});

		let a = provider.load(Device::Cpu).unwrap();
		let b = provider.load(Device::Cpu).unwrap();
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(calls.load(Ordering::SeqCst), 1);

		provider.load(Device::Cuda(0)).unwrap();
		assert_eq!(calls.load(Ordering::SeqCst), 2);

		assert!(provider.invalidate(Device::Cpu));
		assert!(!provider.is_loaded(Device::Cpu));
		provider.load(Device::Cpu).unwrap();
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[test]
	fn slow_load_does_not_block_other_devices() {
		let entered = Arc::new(Barrier::new(2));
		let release = Arc::new(Barrier::new(2));
		let (entered_in, release_in) = (Arc::clone(&entered), Arc::clone(&release));
		let provider = ModelProvider::new(move |device: Device| -> DepthResult<ModelPair> {
			if device.is_accelerator() {
				entered_in.wait();
				release_in.wait();
			}
			Ok(ModelPair::new(NullEncoder, NullDecoder))
		});

		std::thread::scope(|scope| {
			let slow = scope.spawn(|| provider.load(Device::Cuda(0)));
			entered.wait();

			assert!(!provider.is_loaded(Device::Cuda(0)));
			provider.load(Device::Cpu).unwrap();
			assert!(provider.is_loaded(Device::Cpu));
			assert!(provider.invalidate(Device::Cpu));

			release.wait();
			slow.join().unwrap().unwrap();
		});
		assert!(provider.is_loaded(Device::Cuda(0)));
	}

	#[test]
	fn failed_load_is_not_cached() {
		let provider = ModelProvider::new(|device: Device| -> DepthResult<ModelPair> {
			Err(DepthError::Device(format!("{} absent", device)))
		});
		assert!(matches!(
			provider.load(Device::Cuda(0)),
			Err(DepthError::Device(_))
		));
		assert!(!provider.is_loaded(Device::Cuda(0)));
	}
}
