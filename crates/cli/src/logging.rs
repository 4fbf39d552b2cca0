//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber; RUST_LOG wins over `default_filter`.
pub fn init(default_filter: &str) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
	tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}
