use std::{
    net::SocketAddr,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use tokio::{net::TcpListener, time::sleep};
use tower_http::services::ServeDir;

use crate::runner::Runner;

/// `GET /updateDb` starts a run in the background; every other path is served from `public_dir`.
pub fn router(runner: Arc<Runner>, public_dir: &Path) -> Router {
    Router::new()
        .route("/updateDb", get(update_db))
        .fallback_service(ServeDir::new(public_dir))
        .with_state(runner)
}

async fn update_db(State(runner): State<Arc<Runner>>) -> (StatusCode, &'static str) {
    let Some(permit) = runner.guard().try_acquire() else {
        warn!("update requested while a run is in progress");
        return (StatusCode::CONFLICT, "a run is already in progress\n");
    };

    tokio::spawn(async move {
        let _permit = permit;
        match runner.run_cycle().await {
            Ok(summary) => info!("requested run finished: {}", summary),
            Err(e) => error!("requested run failed: {:#}", e),
        }
    });

    (StatusCode::ACCEPTED, "run started\n")
}

pub async fn serve(
    addr: SocketAddr,
    runner: Arc<Runner>,
    public_dir: &Path,
    should_terminate: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .context(format!("could not bind {}", addr))?;
    serve_on(listener, runner, public_dir, should_terminate).await
}

/// Serves until `should_terminate` is set.
pub async fn serve_on(
    listener: TcpListener,
    runner: Arc<Runner>,
    public_dir: &Path,
    should_terminate: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    info!(
        "listening on {} serving {:?}",
        listener.local_addr()?,
        public_dir
    );
    axum::serve(listener, router(runner, public_dir))
        .with_graceful_shutdown(async move {
            while !should_terminate.load(Ordering::Relaxed) {
                sleep(Duration::from_millis(200)).await;
            }
            debug!("shutting down http server");
        })
        .await
        .context("http server failed")?;
    Ok(())
}
