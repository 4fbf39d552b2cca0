//! Service binary: wires configuration, the driver factory, durable state,
//! and the HTTP API together.

use std::sync::Arc;

use anyhow::Context as _;
use bellhop::driver::cdp::CdpDriverFactory;
use bellhop::{AuthEngine, Config, DriverFactory, HttpMailSource, HttpSolver, JsonFileStore, LifecycleController, MemoryStore, SessionRegistry, SessionService, StateStore};
use clap::Parser;
use tracing::info;

mod cli;
mod http;
mod logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = cli::Cli::parse();
	logging::init(&args.log);

	let config = Config::from_env().context("loading configuration from environment")?;

	let store: Arc<dyn StateStore> = match &config.state_dir {
		Some(dir) => {
			info!(target = "bellhop.store", dir = %dir.display(), "using file-backed state store");
			Arc::new(JsonFileStore::new(dir.clone())?)
		}
		None => {
			info!(target = "bellhop.store", "no state directory configured; sessions will not survive restarts");
			Arc::new(MemoryStore::new())
		}
	};

	let factory: Arc<dyn DriverFactory> = match args.browser {
		Some(path) => Arc::new(CdpDriverFactory::with_executable(path)),
		None => Arc::new(CdpDriverFactory::new()),
	};

	let registry = Arc::new(SessionRegistry::new(factory, store));
	let lifecycle = Arc::new(LifecycleController::new(Arc::clone(&registry), config.sweep.clone()));

	if !args.no_recover {
		let recovered = lifecycle.recover_on_startup().await;
		info!(target = "bellhop.lifecycle", recovered, "startup recovery complete");
	}
	let sweeper = lifecycle.spawn_sweeper();

	let solver = Arc::new(HttpSolver::new(config.solver.clone())?);
	let otp = Arc::new(HttpMailSource::new(config.mailbox.clone())?);
	let engine = Arc::new(AuthEngine::new(solver, otp, config.portal.clone(), config.mailbox.identity.clone(), config.auth.clone()));
	let service = Arc::new(SessionService::new(registry, Arc::clone(&lifecycle), engine));

	let app = http::router(service);
	let listener = tokio::net::TcpListener::bind(&args.listen).await.with_context(|| format!("binding {}", args.listen))?;
	info!(target = "bellhop.registry", listen = %args.listen, "service ready");

	axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

	sweeper.abort();
	lifecycle.shutdown_drain().await;
	Ok(())
}

async fn shutdown_signal() {
	if let Err(err) = tokio::signal::ctrl_c().await {
		tracing::warn!(error = %err, "failed to listen for shutdown signal");
		return;
	}
	info!("shutdown signal received; draining sessions");
}
