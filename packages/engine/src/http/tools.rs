//! Tool API the assistant subprocess calls back into to manage its own
//! scheduled tasks and triggers (spec §4.8/§6). Plain `axum` handlers over
//! `Store`, following the same router shape as the rest of C11.

use std::str::FromStr;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::AppState;
use crate::errors::{EngineError, ValidationError};
use crate::schedule_parser::{self, ParsedSchedule};
use crate::store::{
    Autonomy, NewScheduledTask, NewTrigger, Store, TaskType, TriggerStatus, TriggerType,
};

const MIN_RECURRING_SPACING_SECS: i64 = 60;
const MIN_ONE_SHOT_LEAD_SECS: i64 = 60;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tools/schedule-task", post(schedule_task))
        .route("/api/tools/cancel-schedule", post(cancel_schedule))
        .route("/api/tools/list-schedules", get(list_schedules))
        .route("/api/tools/create-trigger", post(create_trigger))
        .route("/api/tools/list-triggers", post(list_triggers))
        .route("/api/tools/manage-trigger", post(manage_trigger))
        .with_state(state)
}

fn error_response(err: EngineError) -> Response {
    let status = match &err {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "success": false, "error": err.to_string() }))).into_response()
}

#[derive(Debug, Deserialize)]
struct ScheduleTaskRequest {
    tenant_id: Uuid,
    user_handle: String,
    task_prompt: String,
    task_type: TaskType,
    timezone: String,
    schedule_text: String,
}

#[derive(Debug, Serialize)]
struct ScheduleTaskResponse {
    success: bool,
    id: Uuid,
    next_run_at: chrono::DateTime<Utc>,
}

/// Enforces the per-user cap of 10 enabled schedules, the 1-minute minimum
/// spacing for recurring schedules, and the 1-minute-in-the-future minimum
/// lead for one-shot schedules (spec §4.8), then parses and persists.
async fn schedule_task(
    State(state): State<AppState>,
    Json(req): Json<ScheduleTaskRequest>,
) -> Response {
    match schedule_task_inner(&state, req).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn schedule_task_inner(
    state: &AppState,
    req: ScheduleTaskRequest,
) -> Result<ScheduleTaskResponse, EngineError> {
    let cap = state.config.max_enabled_schedules_per_user;
    let enabled_count = state
        .store
        .count_enabled_schedules(req.tenant_id, &req.user_handle)
        .await?;
    if enabled_count >= cap {
        return Err(ValidationError::ScheduleCapReached { limit: cap }.into());
    }

    let tz = Tz::from_str(&req.timezone).map_err(|_| ValidationError::UnparseableSchedule)?;
    let now = Utc::now();
    let parsed = schedule_parser::parse(&req.schedule_text, tz, now)?;

    let (cron_expr, run_at, is_one_time, next_run_at) = match parsed {
        ParsedSchedule::Recurring { cron_expr } => {
            let next = schedule_parser::next_fire(&cron_expr, tz, now)?;
            if (next - now).num_seconds() < MIN_RECURRING_SPACING_SECS {
                return Err(ValidationError::ScheduleTooSoon {
                    min_seconds: MIN_RECURRING_SPACING_SECS,
                }
                .into());
            }
            (Some(cron_expr), None, false, next)
        }
        ParsedSchedule::Once { run_at } => {
            if (run_at - now).num_seconds() < MIN_ONE_SHOT_LEAD_SECS {
                return Err(ValidationError::ScheduleTooSoon {
                    min_seconds: MIN_ONE_SHOT_LEAD_SECS,
                }
                .into());
            }
            (None, Some(run_at), true, run_at)
        }
    };

    let task = state
        .store
        .insert_scheduled_task(NewScheduledTask {
            tenant_id: req.tenant_id,
            user_handle: req.user_handle,
            task_prompt: req.task_prompt,
            task_type: req.task_type,
            timezone: req.timezone,
            cron_expr,
            run_at,
            is_one_time,
            next_run_at,
        })
        .await?;

    Ok(ScheduleTaskResponse {
        success: true,
        id: task.id,
        next_run_at: task.next_run_at,
    })
}

#[derive(Debug, Deserialize)]
struct CancelScheduleRequest {
    id: Uuid,
}

async fn cancel_schedule(
    State(state): State<AppState>,
    Json(req): Json<CancelScheduleRequest>,
) -> Response {
    match state.store.delete_scheduled_task(req.id).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(EngineError::from(err)),
    }
}

#[derive(Debug, Deserialize)]
struct ListSchedulesQuery {
    tenant_id: Uuid,
}

async fn list_schedules(
    State(state): State<AppState>,
    Query(query): Query<ListSchedulesQuery>,
) -> Response {
    match state.store.list_scheduled_tasks(query.tenant_id).await {
        Ok(tasks) => Json(json!({ "success": true, "tasks": tasks })).into_response(),
        Err(err) => error_response(EngineError::from(err)),
    }
}

#[derive(Debug, Deserialize)]
struct CreateTriggerRequest {
    tenant_id: Uuid,
    user_handle: String,
    name: String,
    trigger_type: TriggerType,
    task_prompt: String,
    autonomy: Autonomy,
    config: serde_json::Value,
    cooldown_seconds: Option<i64>,
    max_errors: Option<i32>,
    /// Required (and secret-bearing) only for `trigger_type: WEBHOOK`.
    webhook_secret: Option<String>,
    signature_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateTriggerResponse {
    success: bool,
    id: Uuid,
    webhook_url: Option<String>,
}

async fn create_trigger(
    State(state): State<AppState>,
    Json(req): Json<CreateTriggerRequest>,
) -> Response {
    match create_trigger_inner(&state, req).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn create_trigger_inner(
    state: &AppState,
    req: CreateTriggerRequest,
) -> Result<CreateTriggerResponse, EngineError> {
    let (webhook_path, webhook_secret) = if matches!(req.trigger_type, TriggerType::Webhook) {
        let path = Uuid::new_v4().to_string();
        let secret = match &req.webhook_secret {
            Some(plain) => Some(
                state
                    .vault
                    .encrypt(plain)
                    .map_err(|e| EngineError::TriggerExecution(e.to_string()))?,
            ),
            None => None,
        };
        (Some(path), secret)
    } else {
        (None, None)
    };

    let trigger = state
        .store
        .create_trigger(NewTrigger {
            tenant_id: req.tenant_id,
            user_handle: req.user_handle,
            name: req.name,
            trigger_type: req.trigger_type,
            task_prompt: req.task_prompt,
            autonomy: req.autonomy,
            config: req.config,
            cooldown_seconds: req.cooldown_seconds.unwrap_or(0),
            max_errors: req.max_errors.unwrap_or(3),
            webhook_path: webhook_path.clone(),
            webhook_secret,
            signature_type: req.signature_type,
        })
        .await?;

    let webhook_url = webhook_path.map(|path| format!("{}/webhooks/trigger/{path}", state.config.public_url));

    Ok(CreateTriggerResponse {
        success: true,
        id: trigger.id,
        webhook_url,
    })
}

#[derive(Debug, Deserialize)]
struct ListTriggersRequest {
    tenant_id: Uuid,
}

async fn list_triggers(
    State(state): State<AppState>,
    Json(req): Json<ListTriggersRequest>,
) -> Response {
    match state.store.list_triggers(req.tenant_id).await {
        Ok(triggers) => Json(json!({ "success": true, "triggers": triggers })).into_response(),
        Err(err) => error_response(EngineError::from(err)),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TriggerAction {
    Enable,
    Disable,
    Delete,
}

#[derive(Debug, Deserialize)]
struct ManageTriggerRequest {
    id: Uuid,
    action: TriggerAction,
}

async fn manage_trigger(
    State(state): State<AppState>,
    Json(req): Json<ManageTriggerRequest>,
) -> Response {
    let result = match req.action {
        TriggerAction::Enable => state.store.set_trigger_status(req.id, TriggerStatus::Active).await,
        TriggerAction::Disable => state.store.set_trigger_status(req.id, TriggerStatus::Paused).await,
        TriggerAction::Delete => state.store.delete_trigger(req.id).await,
    };
    match result {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(EngineError::from(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::assistant::FakeAssistantProcess;
    use crate::config::Config;
    use crate::lock::FakeAdvisoryLock;
    use crate::message_processor::MessageProcessor;
    use crate::scheduler::Scheduler;
    use crate::session_pool::SessionPool;
    use crate::store::fake::InMemoryStore;
    use crate::transport::FakeTransport;
    use crate::trigger_engine::TriggerEngine;
    use crate::vault::Vault;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    fn app_state() -> (AppState, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let tenant_id = Uuid::new_v4();
        let assistant = Arc::new(FakeAssistantProcess::new());
        let session_pool = Arc::new(SessionPool::new(assistant, std::time::Duration::from_secs(900), false));
        let transport = Arc::new(FakeTransport::new());
        let processor = Arc::new(MessageProcessor::new(
            store.clone(),
            session_pool,
            transport.clone(),
            4096,
        ));
        let lock = Arc::new(FakeAdvisoryLock::new());
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            lock,
            processor.clone(),
            transport.clone(),
        ));
        let trigger_engine = Arc::new(TriggerEngine::new(store.clone(), processor.clone(), transport.clone()));
        let config = Config {
            database_url: "postgres://unused".to_string(),
            admin_api_key: None,
            credentials_encryption_key: None,
            public_url: "http://localhost:8080".to_string(),
            twilio_account_sid: String::new(),
            twilio_auth_token: String::new(),
            twilio_from_number: String::new(),
            server_port: 8080,
            idle_session_timeout_secs: 900,
            assistant_call_timeout_secs: 300,
            scheduler_lease_ttl_secs: 300,
            scheduler_claim_limit: 50,
            max_message_chars: 4096,
            max_enabled_schedules_per_user: 10,
        };
        let vault = Arc::new(Vault::new(&BASE64.encode([9u8; 32])).unwrap());

        let state = AppState {
            store,
            processor,
            scheduler,
            trigger_engine,
            config: Arc::new(config),
            vault,
        };
        (state, tenant_id)
    }

    fn req(schedule_text: &str) -> ScheduleTaskRequest {
        ScheduleTaskRequest {
            tenant_id: Uuid::new_v4(),
            user_handle: "alice".to_string(),
            task_prompt: "ping".to_string(),
            task_type: TaskType::Reminder,
            timezone: "UTC".to_string(),
            schedule_text: schedule_text.to_string(),
        }
    }

    #[tokio::test]
    async fn one_shot_59_seconds_out_is_rejected_as_too_soon() {
        let (state, _) = app_state();
        let err = schedule_task_inner(&state, req("in 59 seconds")).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::ScheduleTooSoon { min_seconds: 60 })));
    }

    #[tokio::test]
    async fn one_shot_61_seconds_out_is_accepted() {
        let (state, _) = app_state();
        let resp = schedule_task_inner(&state, req("in 61 seconds")).await.unwrap();
        assert!(resp.success);
    }

    #[tokio::test]
    async fn schedule_cap_rejects_an_eleventh_enabled_schedule() {
        let (state, _) = app_state();
        let tenant_id = Uuid::new_v4();
        for _ in 0..10 {
            let mut r = req("in 5 minutes");
            r.tenant_id = tenant_id;
            schedule_task_inner(&state, r).await.unwrap();
        }
        let mut eleventh = req("in 5 minutes");
        eleventh.tenant_id = tenant_id;
        let err = schedule_task_inner(&state, eleventh).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::ScheduleCapReached { limit: 10 })
        ));
    }

    #[tokio::test]
    async fn create_webhook_trigger_encrypts_secret_and_returns_url() {
        let (state, tenant_id) = app_state();
        let resp = create_trigger_inner(
            &state,
            CreateTriggerRequest {
                tenant_id,
                user_handle: "alice".to_string(),
                name: "deploy".to_string(),
                trigger_type: TriggerType::Webhook,
                task_prompt: "Deploy: {{data.env}}".to_string(),
                autonomy: Autonomy::Notify,
                config: serde_json::json!({}),
                cooldown_seconds: None,
                max_errors: None,
                webhook_secret: Some("top-secret".to_string()),
                signature_type: Some("sha256".to_string()),
            },
        )
        .await
        .unwrap();

        assert!(resp.success);
        let url = resp.webhook_url.expect("webhook trigger must return a url");
        assert!(url.contains("/webhooks/trigger/"));

        let triggers = state.store.list_triggers(tenant_id).await.unwrap();
        let created = triggers.into_iter().find(|t| t.id == resp.id).unwrap();
        let secret = created.webhook_secret.expect("secret must be persisted");
        assert_ne!(secret, "top-secret", "secret must be encrypted at rest");
        assert_eq!(state.vault.decrypt(&secret).unwrap(), "top-secret");
    }
}
