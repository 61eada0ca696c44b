//! Health, readiness and metrics HTTP endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use log::{error, info};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;

/// `/healthz` and `/readyz`.
pub fn health_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(metrics)
}

/// `/metrics`.
pub fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    if metrics.ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "waiting for first sync")
    }
}

async fn render_metrics(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    match metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        ),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Serve `router` on an already bound listener until `token` is cancelled.
pub async fn serve(listener: TcpListener, router: Router, token: CancellationToken) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!("HTTP endpoint listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    info!("HTTP endpoint on {} stopped", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::PassSummary;
    use crate::types::Subsystem;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn get_path(router: Router, path: &str) -> (StatusCode, String) {
        let resp = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_is_always_ok() {
        let (status, body) = get_path(health_router(Arc::new(Metrics::new().unwrap())), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn readyz_waits_for_first_passes() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (status, _) = get_path(health_router(metrics.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        for subsystem in Subsystem::ALL {
            metrics.pass_started(subsystem);
            metrics.pass_completed(subsystem, &PassSummary::default());
        }
        let (status, _) = get_path(health_router(metrics), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_counters() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.pass_started(Subsystem::Firewall);
        metrics.pass_abandoned(Subsystem::Firewall);

        let (status, body) = get_path(metrics_router(metrics), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body
            .lines()
            .any(|l| l.starts_with("meshsync_sync_passes_abandoned_total")
                && l.contains("subsystem=\"firewall\"")
                && l.ends_with(" 1")));
    }

    #[tokio::test]
    async fn serve_stops_on_cancel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let token = CancellationToken::new();
        let handle = tokio::spawn(serve(
            listener,
            health_router(Arc::new(Metrics::new().unwrap())),
            token.clone(),
        ));
        token.cancel();
        handle.await.unwrap().unwrap();
    }
}
