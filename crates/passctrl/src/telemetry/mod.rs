use tracing_subscriber::EnvFilter;

/// Structured logging for the whole process; `RUST_LOG` overrides the
/// default `info` level.
pub fn setup_logging() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.init();
}

pub mod testing {
	use tracing_subscriber::EnvFilter;

	pub fn setup_test_logging() {
		let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
		let _ = tracing_subscriber::fmt()
			.with_env_filter(filter)
			.with_test_writer()
			.try_init();
	}
}
