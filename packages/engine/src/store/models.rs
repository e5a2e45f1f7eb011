//! Typed row models for the tables in spec §3. Plain structs with
//! `sqlx::FromRow`, mirroring the teacher's `Member`/`Identifier` style —
//! no ORM, just typed rows plus an inherent-impl API (see `store/postgres.rs`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum TenantStatus {
    Active,
    Suspended,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub status: TenantStatus,
    pub messaging_channel: String,
    pub onboarding_status: String,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_handle: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub reset_timestamp: Option<DateTime<Utc>>,
}

impl ConversationSession {
    /// The key the assistant subprocess resumes/restarts on. A reset
    /// advances `reset_timestamp`, which changes this key, so the
    /// subprocess can no longer resume the pre-reset context.
    pub fn assistant_session_key(&self) -> String {
        match self.reset_timestamp {
            Some(ts) => format!("{}:{}", self.id, ts.timestamp()),
            None => self.id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_handle: String,
    pub session_id: Uuid,
    pub transport_message_id: Option<String>,
    pub direction: MessageDirection,
    pub content: String,
    pub delivery_status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum TaskType {
    Reminder,
    Execute,
    Trigger,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_handle: String,
    pub task_prompt: String,
    pub task_type: TaskType,
    pub timezone: String,
    pub cron_expr: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
    pub is_one_time: bool,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub error_count: i32,
    pub enabled: bool,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub execution_plan: Option<Json>,
}

impl ScheduledTask {
    /// Rolling window of up to the last 5 assistant outputs, used to build
    /// the "PREVIOUS OUTPUTS" section for recurring `execute` tasks.
    pub fn previous_outputs(&self) -> Vec<String> {
        self.execution_plan
            .as_ref()
            .and_then(|plan| plan.get("previousOutputs"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Append `reply` to `previous`, keeping at most the last 5 entries.
pub fn rolling_last5(previous: &[String], reply: &str) -> Json {
    let mut all: Vec<String> = previous.to_vec();
    all.push(reply.to_string());
    let start = all.len().saturating_sub(5);
    serde_json::json!({ "previousOutputs": all[start..].to_vec() })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum TriggerType {
    Webhook,
    Condition,
    Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum Autonomy {
    Notify,
    Confirm,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum TriggerStatus {
    Active,
    Paused,
    Error,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_handle: String,
    pub name: String,
    pub trigger_type: TriggerType,
    pub task_prompt: String,
    pub autonomy: Autonomy,
    pub config: Json,
    pub status: TriggerStatus,
    pub cooldown_seconds: i64,
    pub max_errors: i32,
    pub error_count: i32,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub next_check_at: Option<DateTime<Utc>>,
    pub webhook_path: Option<String>,
    pub webhook_secret: Option<String>,
    pub signature_type: Option<String>,
    pub execution_state: Option<Json>,
}

impl Trigger {
    pub fn previous_outputs(&self) -> Vec<String> {
        self.execution_state
            .as_ref()
            .and_then(|plan| plan.get("previousOutputs"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum TriggerExecutionStatus {
    Pending,
    Running,
    AwaitingConfirmation,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum ConfirmationStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct TriggerExecution {
    pub id: Uuid,
    pub trigger_id: Uuid,
    pub tenant_id: Uuid,
    pub status: TriggerExecutionStatus,
    pub confirmation_status: Option<ConfirmationStatus>,
    pub confirmation_deadline: Option<DateTime<Utc>>,
    pub triggered_by: String,
    pub input_context: Json,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}
