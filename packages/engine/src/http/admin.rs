//! Admin endpoints (spec §6): health checks and the campaign-trigger
//! surface, all gated by `Authorization: Bearer <ADMIN_API_KEY>`. The
//! bearer check mirrors `session_auth_middleware`'s header-extraction shape
//! in the teacher, adapted from a session-token lookup to a constant-time
//! compare against a single configured key.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use super::AppState;
use crate::config::Config;

/// Constant-time byte comparison so a timing side-channel can't leak the
/// admin key one byte at a time.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub async fn require_admin_bearer(
    State(config): State<Arc<Config>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = config.admin_api_key.as_deref() else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let Some(header) = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let Some(token) = header.strip_prefix("Bearer ") else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        return StatusCode::FORBIDDEN.into_response();
    }

    next.run(request).await
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/admin/tools/health-check", post(tools_health_check))
        .route(
            "/admin/credentials/health-check",
            post(credentials_health_check),
        )
        .route(
            "/admin/tenants/:id/campaigns/trigger",
            post(trigger_campaign),
        )
        .with_state(state)
}

async fn tools_health_check(State(_state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn credentials_health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Admin-triggered equivalent of an AUTO trigger firing, used to kick off a
/// one-off campaign message through the same execution path as any other
/// scheduled/triggered prompt. The request/response schema beyond
/// `{tenant_id, user_handle, prompt}` is out of scope (spec §6).
async fn trigger_campaign(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(body): Json<CampaignTriggerRequest>,
) -> impl IntoResponse {
    match state
        .processor
        .process_incoming(tenant_id, &body.user_handle, &body.prompt, None)
        .await
    {
        Ok(result) => (StatusCode::OK, Json(json!(result))).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": err.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, serde::Deserialize)]
struct CampaignTriggerRequest {
    user_handle: String,
    prompt: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_slices() {
        assert!(constant_time_eq(b"secret-key", b"secret-key"));
    }

    #[test]
    fn constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq(b"short", b"a-much-longer-value"));
    }

    #[test]
    fn constant_time_eq_rejects_different_content() {
        assert!(!constant_time_eq(b"secret-key", b"secret-kex"));
    }
}
