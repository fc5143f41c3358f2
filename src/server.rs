//! HTTP front end for the evaluator
//!
//! A single endpoint, `POST /vulnerabilities`, taking a system profile and
//! returning the CVE report. The evaluator cache is fully built before the
//! listener binds, so every handler sees immutable shared state and the
//! serving path needs no locks.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde_json::json;

use crate::evaluator::{Evaluator, SystemProfile};

pub fn router(evaluator: Arc<Evaluator>) -> Router {
    Router::new()
        .route("/vulnerabilities", post(vulnerabilities))
        .with_state(evaluator)
}

async fn vulnerabilities(State(evaluator): State<Arc<Evaluator>>, body: Bytes) -> Response {
    let profile: SystemProfile = match serde_json::from_slice(&body) {
        Ok(profile) => profile,
        Err(e) => {
            tracing::debug!(error = %e, "rejecting malformed request body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Request is not a JSON."})),
            )
                .into_response();
        }
    };

    // CPU-bound and short; runs inline without yielding.
    match evaluator.process_list(&profile) {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "evaluation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal server error."})),
            )
                .into_response()
        }
    }
}

/// Bind the listener and serve until ctrl-c.
pub async fn serve(port: u16, evaluator: Arc<Evaluator>) -> Result<()> {
    let app = router(evaluator);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => tracing::error!(error = %e, "Failed to install shutdown handler"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::cache::Cache;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn empty_app() -> Router {
        router(Arc::new(Evaluator::new(Cache::default())))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_empty_profile_returns_empty_report() {
        let response = empty_app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/vulnerabilities")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(axum::body::Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"cve_list": [], "unpatched_cve_list": []})
        );
    }

    #[tokio::test]
    async fn test_malformed_json_is_a_bad_request() {
        let response = empty_app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/vulnerabilities")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(axum::body::Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({"error": "Request is not a JSON."})
        );
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let response = empty_app()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/nonexistent")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
