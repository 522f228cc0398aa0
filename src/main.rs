use clap::Parser;
use monodepth::output::{default_output_path, ImageEncoding};
use monodepth::{
	process_photo, Colormap, DepthError, DepthPipeline, Device, ModelProvider, ModelSource,
	PipelineConfig, PretrainedStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "monodepth")]
#[command(about = "Estimate a colorized depth map from a single image")]
#[command(version)]
struct Cli {
	/// Input image file
	input: PathBuf,

	/// Output file (defaults to <input>-depth.png)
	#[arg(short, long)]
	output: Option<PathBuf>,

	/// Compute device: auto, cpu, cuda or cuda:N
	#[arg(long, default_value = "auto")]
	device: String,

	/// Disparity percentile mapped to the top of the colormap
	#[arg(long)]
	percentile: Option<f64>,

	/// Colormap: magma or gray
	#[arg(long)]
	colormap: Option<Colormap>,

	/// JSON pipeline config; flags override its values
	#[arg(long)]
	config: Option<PathBuf>,

	/// Pretrained parameter set
	#[arg(long)]
	model: Option<String>,

	/// JPEG quality when writing .jpg output (1-100)
	#[arg(long, default_value = "95")]
	quality: u8,

	/// Log at debug level
	#[arg(short, long)]
	verbose: bool,
}

fn init_tracing(verbose: bool) {
	let default = if verbose { "monodepth=debug" } else { "monodepth=info" };
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.init();
}

async fn run(cli: Cli) -> Result<PathBuf, DepthError> {
	let mut config = match &cli.config {
		Some(path) => PipelineConfig::from_json_file(path)?,
		None => PipelineConfig::default(),
	};
	if let Some(percentile) = cli.percentile {
		config.percentile = percentile;
	}
	if let Some(colormap) = cli.colormap {
		config.colormap = colormap;
	}

	let mut source = ModelSource::from_env();
	if let Some(model) = cli.model {
		source = source.parameter_set(model);
	}

	// Fetch up front so the download happens on the async runtime.
	PretrainedStore::new(source.clone()).fetch().await?;

	let provider = Arc::new(ModelProvider::pretrained(source));
	let mut pipeline = DepthPipeline::new(provider).with_config(config)?;
	if cli.device != "auto" {
		pipeline = pipeline.with_device(cli.device.parse::<Device>()?);
	}

	let output = cli
		.output
		.unwrap_or_else(|| default_output_path(&cli.input));
	let encoding = ImageEncoding::from_path(&output, cli.quality);

	tracing::info!(
		"Processing {:?} on {} ({} colormap, p{})",
		cli.input,
		pipeline.device(),
		pipeline.config().colormap,
		pipeline.config().percentile
	);
	process_photo(&cli.input, &output, &pipeline, encoding).await?;
	Ok(output)
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	init_tracing(cli.verbose);

	let start = std::time::Instant::now();
	match run(cli).await {
		Ok(output) => {
			eprintln!("✓ Saved to: {:?}", output);
			eprintln!("Total time: {:.1}s", start.elapsed().as_secs_f64());
		}
		Err(e) => {
			eprintln!("error ({}): {}", e.class().name(), e);
			std::process::exit(1);
		}
	}
}
