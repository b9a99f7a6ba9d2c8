//! Signal handling and coordinated teardown. See `SPEC_FULL.md` §4.7,
//! grounded on `serve.rs`'s `run_hub` select loop (`ctrl_c()` plus a
//! `watch` shutdown channel) extended with `SIGTERM` on Unix to match
//! the original Python's handling of both signals.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::route_table::RouteTable;

/// Waits for `SIGINT` or (on Unix) `SIGTERM`, then cancels `shutdown` so
/// every task selecting on it unwinds.
pub async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }

    shutdown.cancel();
}

/// Closes every child session currently mounted in `table`, in parallel,
/// bounding total teardown time to whatever `ChildSession::close`'s own
/// grace period allows.
pub async fn drain_route_table(table: &Arc<RouteTable>) {
    let snapshot = table.snapshot().await;
    let handles: Vec<_> = snapshot
        .values()
        .cloned()
        .map(|route| tokio::spawn(async move { route.close().await }))
        .collect();
    for handle in handles {
        if let Err(error) = handle.await {
            tracing::debug!(error = %error, "child shutdown task panicked");
        }
    }
}
