//! Plain-HTTP health endpoint, answered from a one-item namespace list so
//! it reflects real API-server connectivity.

use axum::{extract, http::StatusCode, response, routing, Router};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams};
use serde_json::json;

/// Prepare health check router at the configured path
pub fn create_app(client: kube::Client, path: &str) -> Router {
    Router::new()
        .route(path, routing::get(health_handler))
        .with_state(client)
}

async fn health_handler(
    extract::State(client): extract::State<kube::Client>,
) -> (StatusCode, response::Json<serde_json::Value>) {
    let params = ListParams::default().limit(1);
    match Api::<Namespace>::all(client).list(&params).await {
        Ok(_) => (StatusCode::OK, response::Json(json!({ "healthy": true }))),
        Err(error) => {
            tracing::warn!(%error, "health check namespace list failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                response::Json(json!({ "healthy": false })),
            )
        }
    }
}
