//! Inbound HTTP webhook receiver (C10). `POST /webhooks/trigger/{path}` is
//! looked up by `webhook_path`, signature-verified against the decrypted
//! `webhook_secret` when the trigger requires it, deduplicated by
//! `X-Idempotency-Key`, and handed off to `TriggerEngine::handle` without
//! blocking the HTTP response on execution — mirrors the teacher's
//! `domains/newsletter/webhook.rs` router shape (`Router::new().route(...)
//! .with_state(state)`, always-200 acknowledgement) generalized from a
//! single fixed route to a per-trigger dynamic path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde_json::{json, Value as Json_};
use sha1::Sha1;
use sha2::Sha256;
use tracing::{info, warn};

use crate::store::Store;
use crate::trigger_engine::{TriggerEngine, TriggerEvent, TriggerEventPayload};
use crate::vault::Vault;

const IDEMPOTENCY_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
pub struct WebhookState {
    pub store: Arc<dyn Store>,
    pub engine: Arc<TriggerEngine>,
    pub vault: Arc<Vault>,
    /// Fast-path in-memory dedup; `Store::idempotency_seen`/`_remember` back
    /// it with the durable table so a process restart doesn't reopen a
    /// window that had already closed (spec §3's `idempotency_keys` table).
    seen: Arc<DashMap<String, Instant>>,
}

impl WebhookState {
    pub fn new(store: Arc<dyn Store>, engine: Arc<TriggerEngine>, vault: Arc<Vault>) -> Self {
        Self {
            store,
            engine,
            vault,
            seen: Arc::new(DashMap::new()),
        }
    }
}

pub fn webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/trigger/:path", post(handle_webhook))
        .with_state(state)
}

fn strip_sensitive_headers(headers: &HeaderMap) -> serde_json::Map<String, Json_> {
    headers
        .iter()
        .filter(|(name, _)| {
            let lower = name.as_str().to_ascii_lowercase();
            lower != "authorization" && lower != "x-signature" && lower != "x-hub-signature-256"
        })
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                json!(value.to_str().unwrap_or("<binary>")),
            )
        })
        .collect()
}

fn verify_signature(algo: &str, secret: &str, body: &[u8], provided: &str) -> bool {
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
    let provided = provided.strip_prefix("sha1=").unwrap_or(provided);
    let Ok(provided_bytes) = hex::decode(provided) else {
        return false;
    };
    match algo {
        "hmac-sha256" => {
            let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
                return false;
            };
            mac.update(body);
            mac.verify_slice(&provided_bytes).is_ok()
        }
        "hmac-sha1" => {
            let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(secret.as_bytes()) else {
                return false;
            };
            mac.update(body);
            mac.verify_slice(&provided_bytes).is_ok()
        }
        _ => false,
    }
}

/// Extracts the JSON subtree at a dot-path, mirroring `template::extract_path`
/// but operating on the raw webhook body rather than a trigger-event context.
fn extract_subtree<'a>(body: &'a Json_, path: &str) -> Option<&'a Json_> {
    crate::template::extract_path(body, path)
}

async fn handle_webhook(
    State(state): State<WebhookState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let trigger = match state.store.get_trigger_by_webhook_path(&path).await {
        Ok(Some(t)) => t,
        Ok(None) => return (StatusCode::NOT_FOUND, "unknown webhook path").into_response(),
        Err(err) => {
            warn!(err = %err, path = %path, "store error looking up webhook trigger");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if let Some(algo) = trigger.signature_type.as_deref() {
        let config = &trigger.config;
        let header_name = config
            .get("signature_header")
            .and_then(|v| v.as_str())
            .unwrap_or("x-signature");
        let provided = headers
            .iter()
            .find(|(name, _)| name.as_str().eq_ignore_ascii_case(header_name))
            .and_then(|(_, value)| value.to_str().ok());

        let Some(provided) = provided else {
            return (StatusCode::UNAUTHORIZED, "missing signature header").into_response();
        };

        let secret = match &trigger.webhook_secret {
            Some(encrypted) => match state.vault.decrypt(encrypted) {
                Ok(plain) => plain,
                Err(err) => {
                    warn!(trigger = %trigger.id, err = %err, "failed to decrypt webhook secret");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            },
            None => {
                warn!(trigger = %trigger.id, "signature_type set but no webhook_secret stored");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        // `Mac::verify_slice` below does the constant-time comparison; this
        // is just branching on its result.
        if !verify_signature(algo, &secret, &body, provided) {
            return (StatusCode::FORBIDDEN, "signature mismatch").into_response();
        }
    }

    if let Some(key) = headers
        .get("x-idempotency-key")
        .and_then(|v| v.to_str().ok())
    {
        let dedup_key = format!("{path}:{key}");
        let now = Instant::now();
        if let Some(seen_at) = state.seen.get(&dedup_key) {
            if now.duration_since(*seen_at) < IDEMPOTENCY_TTL {
                return (
                    StatusCode::CONFLICT,
                    Json(json!({"success": true, "message": "Already processed"})),
                )
                    .into_response();
            }
        }
        let utc_now = chrono::Utc::now();
        match state.store.idempotency_seen(&dedup_key, utc_now).await {
            Ok(true) => {
                state.seen.insert(dedup_key, now);
                return (
                    StatusCode::CONFLICT,
                    Json(json!({"success": true, "message": "Already processed"})),
                )
                    .into_response();
            }
            Ok(false) => {}
            Err(err) => warn!(err = %err, "idempotency store check failed, proceeding without dedup"),
        }
        state.seen.insert(dedup_key.clone(), now);
        if let Err(err) = state.store.idempotency_remember(&dedup_key, utc_now).await {
            warn!(err = %err, "failed to persist idempotency key");
        }
    }

    let raw_body: Json_ = serde_json::from_slice(&body).unwrap_or(Json_::Null);
    let data = trigger
        .config
        .get("payload_path")
        .and_then(|v| v.as_str())
        .and_then(|p| extract_subtree(&raw_body, p))
        .cloned()
        .unwrap_or_else(|| raw_body.clone());

    let metadata = json!({
        "originalPayload": raw_body,
        "headers": strip_sensitive_headers(&headers),
    });

    let event = TriggerEvent {
        trigger_id: trigger.id,
        tenant_id: trigger.tenant_id,
        user_handle: trigger.user_handle.clone(),
        payload: TriggerEventPayload {
            source: "webhook".to_string(),
            data,
            metadata,
        },
    };

    info!(trigger = %trigger.id, path = %path, "accepted webhook trigger event");

    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(err) = engine.handle(event).await {
            warn!(err = %err, "webhook-triggered execution failed");
        }
    });

    Json(json!({"success": true, "message": "Accepted"})).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verification_accepts_matching_hmac_sha256() {
        let secret = "shh";
        let body = b"{\"hello\":\"world\"}";
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(verify_signature("hmac-sha256", secret, body, &sig));
    }

    #[test]
    fn signature_verification_rejects_tampered_body() {
        let secret = "shh";
        let body = b"{\"hello\":\"world\"}";
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(!verify_signature("hmac-sha256", secret, b"{\"hello\":\"mars\"}", &sig));
    }

    #[test]
    fn signature_verification_accepts_sha256_prefixed_header() {
        let secret = "shh";
        let body = b"payload";
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        assert!(verify_signature("hmac-sha256", secret, body, &sig));
    }

    #[test]
    fn extract_subtree_navigates_dot_path() {
        let body = json!({"order": {"id": "abc123"}});
        assert_eq!(extract_subtree(&body, "order.id"), Some(&json!("abc123")));
    }
}
