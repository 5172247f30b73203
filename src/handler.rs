//! The admission dispatcher: one HTTPS endpoint per rule, each decoding an
//! AdmissionReview, running the rule evaluator and answering with an
//! AdmissionResponse. Evaluation failures always fail open; the registered
//! failure policy at the API server is the outer gate.

use std::sync::Arc;
use std::time::Duration;

use axum::{body::Bytes, extract, http::StatusCode, response, routing, Router};
use http::{header, HeaderMap, Method};
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    DynamicObject,
};

use crate::config::Registry;
use crate::nscache::NamespaceLookup;
use crate::rule::{MutateMode, MutationResult, Rule};

/// Matches the API server's default webhook timeout.
const ADMISSION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    registry: Arc<Registry>,
    namespaces: Arc<dyn NamespaceLookup>,
}

/// Prepare HTTP router
pub fn create_app(registry: Arc<Registry>, namespaces: Arc<dyn NamespaceLookup>) -> Router {
    let app_state = AppState {
        registry,
        namespaces,
    };

    Router::new()
        .route("/graffiti/:rule_name", routing::any(admission_handler))
        .with_state(app_state)
        .route("/ping", routing::get(ping))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Errors can be raised within HTTP handler
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid http method")]
    InvalidMethod,
    #[error("invalid request - payload is not json")]
    NotJson,
    #[error("invalid request - unable to decode admission review: {0}")]
    DecodeReview(#[source] serde_json::Error),
}

impl response::IntoResponse for Error {
    fn into_response(self) -> response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

async fn ping() -> &'static str {
    "ok"
}

async fn admission_handler(
    extract::State(state): extract::State<AppState>,
    extract::Path(rule_name): extract::Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<response::Json<AdmissionReview<DynamicObject>>, Error> {
    if method != Method::POST {
        return Err(Error::InvalidMethod);
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if content_type != "application/json" && !content_type.starts_with("application/json;") {
        return Err(Error::NotJson);
    }

    let review: AdmissionReview<DynamicObject> =
        serde_json::from_slice(&body).map_err(Error::DecodeReview)?;

    Ok(response::Json(
        review_admission(&state, &rule_name, review).await,
    ))
}

/// Dispatches one decoded review to the rule bound to the request path.
/// Requests for paths with no rule are allowed through unchanged.
async fn review_admission(
    state: &AppState,
    rule_name: &str,
    review: AdmissionReview<DynamicObject>,
) -> AdmissionReview<DynamicObject> {
    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(error) => {
            tracing::error!(%error, "invalid request");
            return AdmissionResponse::invalid(error.to_string()).into_review();
        }
    };

    let response = match state.registry.rule(rule_name) {
        Some(rule) => evaluate(rule, state.namespaces.as_ref(), &req).await,
        None => {
            tracing::debug!(%rule_name, "no rule bound to request path");
            AdmissionResponse::from(&req)
        }
    };
    response.into_review()
}

/// Runs the rule evaluator under the admission deadline and folds the
/// outcome into an AdmissionResponse carrying the request uid.
async fn evaluate(
    rule: &Rule,
    namespaces: &dyn NamespaceLookup,
    req: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let resp = AdmissionResponse::from(req);

    let Some(mut object) = req.object.clone() else {
        return with_message(resp, "admission request carries no object");
    };
    // The review envelope may know the name/namespace before the object
    // does, generateName creates being the common case.
    if object.metadata.name.is_none() && !req.name.is_empty() {
        object.metadata.name = Some(req.name.clone());
    }
    if object.metadata.namespace.is_none() {
        if let Some(namespace) = &req.namespace {
            object.metadata.namespace = Some(namespace.clone());
        }
    }

    let raw = match serde_json::to_vec(&object) {
        Ok(raw) => raw,
        Err(error) => {
            tracing::error!(rule = %rule.name, %error, "failed to serialize object");
            return with_message(resp, &format!("failed to serialize object: {error}"));
        }
    };

    let outcome = tokio::time::timeout(
        ADMISSION_TIMEOUT,
        rule.mutate(&raw, &req.kind.kind, namespaces, MutateMode::Admission),
    )
    .await;
    match outcome {
        Err(_) => {
            tracing::warn!(rule = %rule.name, "admission evaluation timed out");
            with_message(resp, "rule evaluation timed out")
        }
        Ok(Err(error)) => {
            tracing::error!(rule = %rule.name, %error, "failed to evaluate rule");
            with_message(resp, &error.to_string())
        }
        Ok(Ok(MutationResult::Unchanged)) => with_message(resp, "rule didn't match"),
        Ok(Ok(MutationResult::Blocked(message))) => {
            let mut resp = resp.deny(message);
            resp.result.reason = "Forbidden".to_string();
            resp.result.code = 403;
            resp
        }
        Ok(Ok(MutationResult::Patched(patch))) => match resp.with_patch(patch) {
            Ok(resp) => resp,
            Err(error) => {
                tracing::error!(rule = %rule.name, %error, "failed to serialize patch");
                AdmissionResponse::from(req)
            }
        },
    }
}

fn with_message(mut resp: AdmissionResponse, message: &str) -> AdmissionResponse {
    resp.result.message = message.to_string();
    resp
}
