use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::memory::MemoryDecisionCache;
use crate::client::Client;
use crate::server::{AppState, router};
use crate::store::Stores;
use crate::types::CompiledConfig;
use crate::{config, info, warn};

/// Bind, serve, and keep serving re-compiled configuration snapshots
/// until shutdown. The listen address is fixed at startup; everything
/// else hot-reloads on SIGHUP.
pub async fn run(initial: Arc<CompiledConfig>, config_file: Option<PathBuf>) -> anyhow::Result<()> {
	let stores = Stores::new(initial.clone());
	let state = AppState {
		stores: stores.clone(),
		cache: Arc::new(MemoryDecisionCache::new()),
		client: Client::new()?,
	};

	if let Some(path) = config_file {
		tokio::spawn(reload_on_hangup(stores.clone(), path));
	}

	let listener = tokio::net::TcpListener::bind(initial.server.bind).await?;
	info!(bind = %initial.server.bind, "listening");
	axum::serve(
		listener,
		router(state).into_make_service_with_connect_info::<SocketAddr>(),
	)
	.with_graceful_shutdown(shutdown_signal())
	.await?;
	info!("shut down");
	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		let _ = tokio::signal::ctrl_c().await;
	};
	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			},
			Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
	info!("shutdown signal received");
}

#[cfg(unix)]
async fn reload_on_hangup(stores: Stores, path: PathBuf) {
	let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
		Ok(sig) => sig,
		Err(e) => {
			warn!(error = %e, "failed to install SIGHUP handler; hot reload disabled");
			return;
		},
	};
	while hangup.recv().await.is_some() {
		// A bad configuration keeps the previous snapshot serving.
		match fs_err::read_to_string(&path) {
			Ok(contents) => match config::parse_config(&contents) {
				Ok(compiled) => {
					stores.swap(Arc::new(compiled));
					info!(file = %path.display(), "configuration reloaded");
				},
				Err(e) => warn!(error = %e, "configuration reload failed, keeping previous"),
			},
			Err(e) => warn!(error = %e, "configuration file unreadable, keeping previous"),
		}
	}
}

#[cfg(not(unix))]
async fn reload_on_hangup(_stores: Stores, _path: PathBuf) {}
