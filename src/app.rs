//! Service wiring: store, multiplexer and router from a [`ServiceConfig`].

use crate::config::{ServiceConfig, StorageBackend};
use crate::http::{build_router, AppState};
use crate::mux::{MuxConfig, Multiplexer};
use crate::store::{LogConfig, LogStore, StreamLog};
use anyhow::Context;
use std::future::Future;
use std::sync::Arc;

pub fn build_state(config: &ServiceConfig) -> anyhow::Result<AppState> {
    let store: Arc<dyn LogStore> = match config.storage {
        StorageBackend::Memory => Arc::new(StreamLog::in_memory()),
        StorageBackend::File => {
            let log = StreamLog::open(LogConfig {
                path: config.data_dir.clone(),
                create_if_missing: true,
                sync_interval: config.sync_interval,
            })
            .with_context(|| format!("open stream log at {}", config.data_dir.display()))?;
            Arc::new(log)
        }
    };

    let mux = Multiplexer::start(
        Arc::clone(&store),
        MuxConfig {
            read_timeout: config.read_timeout,
        },
    )
    .context("start multiplexer")?;

    Ok(AppState {
        store,
        mux: Arc::new(mux),
        poll_timeout: config.poll_timeout,
    })
}

/// Bind, serve until `shutdown` resolves, then stop the multiplexer.
pub async fn run_with_shutdown<F>(config: ServiceConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = build_state(&config)?;
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    serve(listener, state, shutdown).await
}

/// Serve on an already-bound listener.
pub async fn serve<F>(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    let mux = Arc::clone(&state.mux);
    let app = build_router(state);

    tracing::info!(%addr, "streampoll listening");
    tokio::pin!(shutdown);
    tokio::select! {
        result = axum::serve(listener, app.into_make_service()) => {
            result?;
        }
        _ = &mut shutdown => {
            tracing::info!("shutdown requested");
        }
    }

    // Joins the reader thread.
    tokio::task::spawn_blocking(move || mux.shutdown())
        .await
        .context("stop multiplexer")?;
    tracing::info!("streampoll stopped");
    Ok(())
}
