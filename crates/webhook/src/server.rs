//! HTTP surface: `POST /mutate` and `GET /healthz`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap},
    routing::{get, post},
    Json, Router,
};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::WebhookError;
use crate::injector::{AdmissionInjector, FailureMode};

pub struct WebhookState {
    pub injector: AdmissionInjector,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new().route("/mutate", post(mutate)).route("/healthz", get(healthz)).with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn mutate(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AdmissionReview<DynamicObject>>, WebhookError> {
    counter!("admission_requests", 1u64);
    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or("");
    if !content_type.starts_with("application/json") {
        return Err(WebhookError::UnsupportedMediaType(content_type.to_string()));
    }
    if body.is_empty() {
        return Err(WebhookError::EmptyBody);
    }

    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return Ok(Json(undecodable(&state, format!("decoding admission review: {e}")))),
    };
    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => return Ok(Json(undecodable(&state, format!("admission review without request: {e}")))),
    };
    let resp = state.injector.review(&req).await;
    Ok(Json(resp.into_review()))
}

/// Answer for envelopes that carry no usable request.
fn undecodable(state: &WebhookState, message: String) -> AdmissionReview<DynamicObject> {
    error!(error = %message, "failed to parse admission request");
    counter!("admission_errors", 1u64, "mode" => state.injector.failure_mode().to_string());
    let mut resp = AdmissionResponse::invalid(message);
    if state.injector.failure_mode() == FailureMode::Open {
        resp.allowed = true;
    }
    resp.into_review()
}

/// Serve until `shutdown` fires; in-flight requests complete first.
pub async fn serve(addr: SocketAddr, state: Arc<WebhookState>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, mode = %state.injector.failure_mode(), "admission endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("serving admission endpoint")?;
    info!("admission endpoint stopped");
    Ok(())
}
