//! Webhook endpoints for Git providers.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use conveyor_core::Error;
use conveyor_core::repository::GitProvider;
use conveyor_trigger::{PushOutcome, WebhookStats};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/gitlab", post(gitlab_webhook))
        .route("/github", post(github_webhook))
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    status: &'static str,
    #[serde(flatten)]
    outcome: PushOutcome,
}

/// Handle GitLab push hooks.
async fn gitlab_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let event = header(&headers, "X-Gitlab-Event").unwrap_or("Push Hook");
    if event != "Push Hook" {
        info!(event = %event, "Ignoring GitLab event");
        return Ok(no_action("unsupported_event"));
    }

    let token = header(&headers, "X-Gitlab-Token");
    let secret = state.webhook.gitlab_secret.as_deref();
    process_push(&state, GitProvider::Gitlab, &body, token, secret).await
}

/// Handle GitHub push webhooks.
async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let event = header(&headers, "X-GitHub-Event").unwrap_or("push");
    match event {
        "push" => {}
        "ping" => {
            info!("Ping event received - webhook is configured correctly");
            return Ok(no_action("ping"));
        }
        _ => {
            info!(event = %event, "Ignoring GitHub event");
            return Ok(no_action("unsupported_event"));
        }
    }

    let signature = header(&headers, "X-Hub-Signature-256");
    let secret = state.webhook.github_secret.as_deref();
    process_push(&state, GitProvider::Github, &body, signature, secret).await
}

async fn process_push(
    state: &AppState,
    provider: GitProvider,
    body: &[u8],
    signature: Option<&str>,
    secret: Option<&str>,
) -> Result<Response, ApiError> {
    match state
        .gateway
        .handle_push(provider, body, signature, secret)
        .await
    {
        Ok(outcome) => Ok(Json(WebhookResponse {
            status: outcome.status(),
            outcome,
        })
        .into_response()),
        Err(Error::Authentication(msg)) if state.webhook.legacy_unauthorized => {
            Err(ApiError::Unauthorized(msg))
        }
        Err(Error::Authentication(_)) => Ok(no_action("authentication_failed")),
        Err(e) => Err(e.into()),
    }
}

/// Dedup cache statistics.
pub async fn stats(State(state): State<AppState>) -> Json<WebhookStats> {
    Json(state.gateway.stats().await)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn no_action(reason: &str) -> Response {
    Json(json!({ "status": "no_action", "reason": reason })).into_response()
}
