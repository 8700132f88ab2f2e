use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
	/// Use config from bytes
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Parse and compile the configuration, then exit
	#[arg(long)]
	validate_only: bool,
}

fn main() -> anyhow::Result<()> {
	passctrl::telemetry::setup_logging();

	let Args {
		config,
		file,
		validate_only,
	} = Args::parse();

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			let (contents, filename) = match (config, file) {
				(Some(_), Some(_)) => {
					anyhow::bail!("only one of --config or --file")
				},
				(Some(config), None) => (config, None),
				(None, Some(file)) => {
					let contents = fs_err::read_to_string(&file)?;
					(contents, Some(file))
				},
				(None, None) => ("{}".to_string(), None),
			};
			let compiled = passctrl::config::parse_config(&contents)?;
			if validate_only {
				println!("Configuration is valid!");
				return Ok(());
			}
			info!(
				endpoints = compiled.endpoints.len(),
				rules = compiled.rules.len(),
				"configuration compiled"
			);
			passctrl::app::run(Arc::new(compiled), filename).await
		})
}
