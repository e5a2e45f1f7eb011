//! Typed wrapper over the relational tables of spec §3 (C1).
//!
//! Modeled as an `async_trait`, following `kernel/traits.rs`'s `BaseX: Send +
//! Sync` shape in the teacher, so the engine can run against a real
//! `PgStore` in production and an `InMemoryStore` fake in tests.

pub mod fake;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use models::*;
pub use postgres::PgStore;

/// A new scheduled task as requested by a caller, before `next_run_at` has
/// been computed and persisted.
#[derive(Debug, Clone)]
pub struct NewScheduledTask {
    pub tenant_id: Uuid,
    pub user_handle: String,
    pub task_prompt: String,
    pub task_type: TaskType,
    pub timezone: String,
    pub cron_expr: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
    pub is_one_time: bool,
    pub next_run_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTrigger {
    pub tenant_id: Uuid,
    pub user_handle: String,
    pub name: String,
    pub trigger_type: TriggerType,
    pub task_prompt: String,
    pub autonomy: Autonomy,
    pub config: serde_json::Value,
    pub cooldown_seconds: i64,
    pub max_errors: i32,
    pub webhook_path: Option<String>,
    pub webhook_secret: Option<String>,
    pub signature_type: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // -- Tenants -----------------------------------------------------
    async fn get_tenant(&self, tenant_id: Uuid) -> sqlx::Result<Option<Tenant>>;
    async fn set_tenant_onboarding_status(
        &self,
        tenant_id: Uuid,
        status: &str,
    ) -> sqlx::Result<()>;

    // -- Sessions ------------------------------------------------------
    async fn find_active_session(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
    ) -> sqlx::Result<Option<ConversationSession>>;
    async fn create_session(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
    ) -> sqlx::Result<ConversationSession>;
    /// Ends the active session (sets `ended_at`) and starts a fresh one,
    /// advancing `reset_timestamp` so the assistant's session key changes.
    async fn reset_session(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
    ) -> sqlx::Result<ConversationSession>;
    async fn end_session(&self, session_id: Uuid) -> sqlx::Result<()>;

    // -- Messages --------------------------------------------------------
    #[allow(clippy::too_many_arguments)]
    async fn append_message(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
        session_id: Uuid,
        transport_message_id: Option<&str>,
        direction: MessageDirection,
        content: &str,
    ) -> sqlx::Result<Message>;

    // -- Scheduled tasks ---------------------------------------------------
    async fn count_enabled_schedules(&self, tenant_id: Uuid, user_handle: &str)
        -> sqlx::Result<i64>;
    async fn insert_scheduled_task(&self, task: NewScheduledTask) -> sqlx::Result<ScheduledTask>;
    async fn get_scheduled_task(&self, id: Uuid) -> sqlx::Result<Option<ScheduledTask>>;
    async fn list_scheduled_tasks(&self, tenant_id: Uuid) -> sqlx::Result<Vec<ScheduledTask>>;
    async fn delete_scheduled_task(&self, id: Uuid) -> sqlx::Result<()>;
    /// Atomically claims up to `limit` eligible tasks, setting
    /// `lease_owner`/`lease_expires_at`. See spec §4.1.
    async fn claim_due_tasks(
        &self,
        owner: &str,
        ttl_secs: i64,
        limit: i64,
        now: DateTime<Utc>,
    ) -> sqlx::Result<Vec<ScheduledTask>>;
    async fn release_task_lease(&self, id: Uuid) -> sqlx::Result<()>;
    async fn complete_one_shot_task(&self, id: Uuid) -> sqlx::Result<()>;
    async fn complete_recurring_task(
        &self,
        id: Uuid,
        next_run_at: DateTime<Utc>,
        execution_plan: serde_json::Value,
    ) -> sqlx::Result<()>;
    /// Records a failed tick for a task: bumps `error_count`, reschedules
    /// (or disables at `error_count >= 3`), releases the lease.
    async fn fail_task(
        &self,
        id: Uuid,
        new_error_count: i32,
        next_run_at: DateTime<Utc>,
        enabled: bool,
    ) -> sqlx::Result<()>;

    // -- Triggers ----------------------------------------------------------
    async fn get_trigger(&self, id: Uuid) -> sqlx::Result<Option<Trigger>>;
    async fn get_trigger_by_webhook_path(
        &self,
        path: &str,
    ) -> sqlx::Result<Option<Trigger>>;
    async fn list_triggers(&self, tenant_id: Uuid) -> sqlx::Result<Vec<Trigger>>;
    async fn create_trigger(&self, trigger: NewTrigger) -> sqlx::Result<Trigger>;
    async fn set_trigger_status(&self, id: Uuid, status: TriggerStatus) -> sqlx::Result<()>;
    async fn delete_trigger(&self, id: Uuid) -> sqlx::Result<()>;
    async fn find_due_condition_triggers(&self, now: DateTime<Utc>) -> sqlx::Result<Vec<Trigger>>;
    /// Same shape as `find_due_condition_triggers` but for `EVENT`-type
    /// triggers (the email/inbox poller), which share the `next_check_at`
    /// polling column.
    async fn find_due_event_triggers(&self, now: DateTime<Utc>) -> sqlx::Result<Vec<Trigger>>;
    async fn set_trigger_next_check(
        &self,
        id: Uuid,
        next_check_at: DateTime<Utc>,
    ) -> sqlx::Result<()>;
    async fn record_trigger_success(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        execution_state: Option<serde_json::Value>,
    ) -> sqlx::Result<()>;
    async fn record_trigger_failure(
        &self,
        id: Uuid,
        new_error_count: i32,
        status: TriggerStatus,
    ) -> sqlx::Result<()>;

    // -- Trigger executions -------------------------------------------------
    async fn insert_trigger_execution(
        &self,
        trigger_id: Uuid,
        tenant_id: Uuid,
        status: TriggerExecutionStatus,
        confirmation_status: Option<ConfirmationStatus>,
        confirmation_deadline: Option<DateTime<Utc>>,
        triggered_by: &str,
        input_context: serde_json::Value,
    ) -> sqlx::Result<TriggerExecution>;
    async fn get_trigger_execution(&self, id: Uuid) -> sqlx::Result<Option<TriggerExecution>>;
    /// Finds the most recent `AWAITING_CONFIRMATION` execution for a
    /// (tenant, user) pair, if any, via the owning trigger's user_handle.
    async fn find_pending_confirmation(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
    ) -> sqlx::Result<Option<TriggerExecution>>;
    /// Conditionally transitions a trigger execution's status, rejecting
    /// the write if `expected_status` no longer matches (spec §4.1: "reject
    /// late writes, e.g. approving an already-EXPIRED execution fails").
    /// Returns `true` if the transition was applied.
    #[allow(clippy::too_many_arguments)]
    async fn transition_trigger_execution(
        &self,
        id: Uuid,
        expected_status: TriggerExecutionStatus,
        new_status: TriggerExecutionStatus,
        confirmation_status: Option<ConfirmationStatus>,
        output: Option<&str>,
        error_message: Option<&str>,
        completed_at: Option<DateTime<Utc>>,
        duration_ms: Option<i64>,
    ) -> sqlx::Result<bool>;

    // -- Idempotency cache (durable fallback for the in-memory cache) ------
    async fn idempotency_seen(&self, key: &str, now: DateTime<Utc>) -> sqlx::Result<bool>;
    async fn idempotency_remember(&self, key: &str, now: DateTime<Utc>) -> sqlx::Result<()>;
}
