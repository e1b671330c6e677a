//! HTTP surface: state, server wiring, deadline racing.

pub mod api;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use crate::config::HostConfig;
use crate::error::HostError;
use crate::manager::ScriptManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ScriptManager>,
    pub request_timeout: Duration,
    pub find_limit_default: usize,
}

impl AppState {
    pub fn new(manager: Arc<ScriptManager>, config: &HostConfig) -> AppState {
        AppState {
            manager,
            request_timeout: config.request_timeout,
            find_limit_default: config.find_limit_default,
        }
    }
}

pub fn router(state: AppState) -> Router {
    api::router().with_state(state)
}

/// Serves until `shutdown` resolves.
pub async fn serve(
    listen: SocketAddr,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), HostError> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| HostError::Internal(format!("failed to bind {listen}: {e}")))?;
    tracing::info!(addr = %listen, "http server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| HostError::Internal(format!("http server error: {e}")))
}

/// Races `work` against the request deadline.
///
/// The work is spawned, not aborted: a timed-out script keeps running on its
/// pooled VM and the VM is returned by its guard when the script completes;
/// only the result is discarded.
pub async fn with_deadline<T: Send + 'static>(
    timeout: Duration,
    what: &str,
    work: impl std::future::Future<Output = Result<T, HostError>> + Send + 'static,
) -> Result<T, HostError> {
    let handle = tokio::spawn(work);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(HostError::Internal(format!(
            "request worker failed: {join_err}"
        ))),
        Err(_) => Err(HostError::ContextTimeout(format!(
            "{what} did not finish before the deadline"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_elapses_to_context_timeout() {
        let err = with_deadline(Duration::from_millis(20), "sleep test", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), "context_timeout");
    }

    #[tokio::test]
    async fn fast_work_passes_through() {
        let out = with_deadline(Duration::from_secs(5), "quick", async { Ok(41 + 1) })
            .await
            .unwrap();
        assert_eq!(out, 42);
    }
}
