//! Postgres-backed `Store` implementation.
//!
//! Every query binds placeholders (`$1`, `$2`, ...) — no string
//! interpolation, mirroring every query in the teacher crate. `claim_due_tasks`
//! is the one operation whose correctness depends on a single statement; see
//! the `SELECT ... FOR UPDATE SKIP LOCKED` subquery below, grounded on the
//! equivalent shape in the pack's `scheduler-postgres.rs`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::models::*;
use super::{NewScheduledTask, NewTrigger, Store};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_tenant(&self, tenant_id: Uuid) -> sqlx::Result<Option<Tenant>> {
        sqlx::query_as::<_, Tenant>(
            "SELECT id, status, messaging_channel, onboarding_status FROM tenants WHERE id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn set_tenant_onboarding_status(
        &self,
        tenant_id: Uuid,
        status: &str,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE tenants SET onboarding_status = $1 WHERE id = $2")
            .bind(status)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_active_session(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
    ) -> sqlx::Result<Option<ConversationSession>> {
        sqlx::query_as::<_, ConversationSession>(
            r#"SELECT id, tenant_id, user_handle, started_at, ended_at, reset_timestamp
               FROM conversation_sessions
               WHERE tenant_id = $1 AND user_handle = $2 AND ended_at IS NULL"#,
        )
        .bind(tenant_id)
        .bind(user_handle)
        .fetch_optional(&self.pool)
        .await
    }

    async fn create_session(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
    ) -> sqlx::Result<ConversationSession> {
        sqlx::query_as::<_, ConversationSession>(
            r#"INSERT INTO conversation_sessions (id, tenant_id, user_handle, started_at)
               VALUES ($1, $2, $3, now())
               RETURNING id, tenant_id, user_handle, started_at, ended_at, reset_timestamp"#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(user_handle)
        .fetch_one(&self.pool)
        .await
    }

    async fn reset_session(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
    ) -> sqlx::Result<ConversationSession> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"UPDATE conversation_sessions SET ended_at = now()
               WHERE tenant_id = $1 AND user_handle = $2 AND ended_at IS NULL"#,
        )
        .bind(tenant_id)
        .bind(user_handle)
        .execute(&mut *tx)
        .await?;

        let session = sqlx::query_as::<_, ConversationSession>(
            r#"INSERT INTO conversation_sessions
                   (id, tenant_id, user_handle, started_at, reset_timestamp)
               VALUES ($1, $2, $3, now(), now())
               RETURNING id, tenant_id, user_handle, started_at, ended_at, reset_timestamp"#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(user_handle)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(session)
    }

    async fn end_session(&self, session_id: Uuid) -> sqlx::Result<()> {
        sqlx::query("UPDATE conversation_sessions SET ended_at = now() WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_message(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
        session_id: Uuid,
        transport_message_id: Option<&str>,
        direction: MessageDirection,
        content: &str,
    ) -> sqlx::Result<Message> {
        sqlx::query_as::<_, Message>(
            r#"INSERT INTO messages
                   (id, tenant_id, user_handle, session_id, transport_message_id,
                    direction, content, delivery_status, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, 'sent', now())
               RETURNING id, tenant_id, user_handle, session_id, transport_message_id,
                         direction, content, delivery_status, created_at"#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(user_handle)
        .bind(session_id)
        .bind(transport_message_id)
        .bind(direction)
        .bind(content)
        .fetch_one(&self.pool)
        .await
    }

    async fn count_enabled_schedules(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
    ) -> sqlx::Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"SELECT COUNT(*) FROM scheduled_tasks
               WHERE tenant_id = $1 AND user_handle = $2 AND enabled = true"#,
        )
        .bind(tenant_id)
        .bind(user_handle)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn insert_scheduled_task(&self, task: NewScheduledTask) -> sqlx::Result<ScheduledTask> {
        sqlx::query_as::<_, ScheduledTask>(
            r#"INSERT INTO scheduled_tasks
                   (id, tenant_id, user_handle, task_prompt, task_type, timezone,
                    cron_expr, run_at, is_one_time, next_run_at, error_count, enabled)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, true)
               RETURNING id, tenant_id, user_handle, task_prompt, task_type, timezone,
                         cron_expr, run_at, is_one_time, next_run_at, last_run_at,
                         error_count, enabled, lease_owner, lease_expires_at, execution_plan"#,
        )
        .bind(Uuid::new_v4())
        .bind(task.tenant_id)
        .bind(task.user_handle)
        .bind(task.task_prompt)
        .bind(task.task_type)
        .bind(task.timezone)
        .bind(task.cron_expr)
        .bind(task.run_at)
        .bind(task.is_one_time)
        .bind(task.next_run_at)
        .fetch_one(&self.pool)
        .await
    }

    async fn get_scheduled_task(&self, id: Uuid) -> sqlx::Result<Option<ScheduledTask>> {
        sqlx::query_as::<_, ScheduledTask>(
            r#"SELECT id, tenant_id, user_handle, task_prompt, task_type, timezone,
                      cron_expr, run_at, is_one_time, next_run_at, last_run_at,
                      error_count, enabled, lease_owner, lease_expires_at, execution_plan
               FROM scheduled_tasks WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn list_scheduled_tasks(&self, tenant_id: Uuid) -> sqlx::Result<Vec<ScheduledTask>> {
        sqlx::query_as::<_, ScheduledTask>(
            r#"SELECT id, tenant_id, user_handle, task_prompt, task_type, timezone,
                      cron_expr, run_at, is_one_time, next_run_at, last_run_at,
                      error_count, enabled, lease_owner, lease_expires_at, execution_plan
               FROM scheduled_tasks WHERE tenant_id = $1 ORDER BY next_run_at ASC"#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
    }

    async fn delete_scheduled_task(&self, id: Uuid) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM scheduled_tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_due_tasks(
        &self,
        owner: &str,
        ttl_secs: i64,
        limit: i64,
        now: DateTime<Utc>,
    ) -> sqlx::Result<Vec<ScheduledTask>> {
        let lease_expires_at = now + chrono::Duration::seconds(ttl_secs);
        sqlx::query_as::<_, ScheduledTask>(
            r#"UPDATE scheduled_tasks
               SET lease_owner = $1, lease_expires_at = $2
               WHERE id IN (
                   SELECT id FROM scheduled_tasks
                   WHERE enabled = true
                     AND next_run_at <= $3
                     AND (lease_expires_at IS NULL OR lease_expires_at < $3)
                   ORDER BY next_run_at ASC
                   LIMIT $4
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING id, tenant_id, user_handle, task_prompt, task_type, timezone,
                         cron_expr, run_at, is_one_time, next_run_at, last_run_at,
                         error_count, enabled, lease_owner, lease_expires_at, execution_plan"#,
        )
        .bind(owner)
        .bind(lease_expires_at)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn release_task_lease(&self, id: Uuid) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE scheduled_tasks SET lease_owner = NULL, lease_expires_at = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_one_shot_task(&self, id: Uuid) -> sqlx::Result<()> {
        self.delete_scheduled_task(id).await
    }

    async fn complete_recurring_task(
        &self,
        id: Uuid,
        next_run_at: DateTime<Utc>,
        execution_plan: serde_json::Value,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"UPDATE scheduled_tasks
               SET last_run_at = now(), next_run_at = $1, error_count = 0,
                   execution_plan = $2, lease_owner = NULL, lease_expires_at = NULL
               WHERE id = $3"#,
        )
        .bind(next_run_at)
        .bind(execution_plan)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_task(
        &self,
        id: Uuid,
        new_error_count: i32,
        next_run_at: DateTime<Utc>,
        enabled: bool,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"UPDATE scheduled_tasks
               SET error_count = $1, next_run_at = $2, enabled = $3,
                   lease_owner = NULL, lease_expires_at = NULL
               WHERE id = $4"#,
        )
        .bind(new_error_count)
        .bind(next_run_at)
        .bind(enabled)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_trigger(&self, id: Uuid) -> sqlx::Result<Option<Trigger>> {
        sqlx::query_as::<_, Trigger>(
            r#"SELECT id, tenant_id, user_handle, name, trigger_type, task_prompt, autonomy,
                      config, status, cooldown_seconds, max_errors, error_count,
                      last_triggered_at, next_check_at, webhook_path, webhook_secret,
                      signature_type, execution_state
               FROM triggers WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn get_trigger_by_webhook_path(&self, path: &str) -> sqlx::Result<Option<Trigger>> {
        sqlx::query_as::<_, Trigger>(
            r#"SELECT id, tenant_id, user_handle, name, trigger_type, task_prompt, autonomy,
                      config, status, cooldown_seconds, max_errors, error_count,
                      last_triggered_at, next_check_at, webhook_path, webhook_secret,
                      signature_type, execution_state
               FROM triggers WHERE webhook_path = $1"#,
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await
    }

    async fn list_triggers(&self, tenant_id: Uuid) -> sqlx::Result<Vec<Trigger>> {
        sqlx::query_as::<_, Trigger>(
            r#"SELECT id, tenant_id, user_handle, name, trigger_type, task_prompt, autonomy,
                      config, status, cooldown_seconds, max_errors, error_count,
                      last_triggered_at, next_check_at, webhook_path, webhook_secret,
                      signature_type, execution_state
               FROM triggers WHERE tenant_id = $1"#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
    }

    async fn create_trigger(&self, trigger: NewTrigger) -> sqlx::Result<Trigger> {
        sqlx::query_as::<_, Trigger>(
            r#"INSERT INTO triggers
                   (id, tenant_id, user_handle, name, trigger_type, task_prompt, autonomy,
                    config, status, cooldown_seconds, max_errors, error_count,
                    webhook_path, webhook_secret, signature_type)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'ACTIVE', $9, $10, 0, $11, $12, $13)
               RETURNING id, tenant_id, user_handle, name, trigger_type, task_prompt, autonomy,
                         config, status, cooldown_seconds, max_errors, error_count,
                         last_triggered_at, next_check_at, webhook_path, webhook_secret,
                         signature_type, execution_state"#,
        )
        .bind(Uuid::new_v4())
        .bind(trigger.tenant_id)
        .bind(trigger.user_handle)
        .bind(trigger.name)
        .bind(trigger.trigger_type)
        .bind(trigger.task_prompt)
        .bind(trigger.autonomy)
        .bind(trigger.config)
        .bind(trigger.cooldown_seconds)
        .bind(trigger.max_errors)
        .bind(trigger.webhook_path)
        .bind(trigger.webhook_secret)
        .bind(trigger.signature_type)
        .fetch_one(&self.pool)
        .await
    }

    async fn set_trigger_status(&self, id: Uuid, status: TriggerStatus) -> sqlx::Result<()> {
        sqlx::query("UPDATE triggers SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_trigger(&self, id: Uuid) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM triggers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_due_condition_triggers(&self, now: DateTime<Utc>) -> sqlx::Result<Vec<Trigger>> {
        sqlx::query_as::<_, Trigger>(
            r#"SELECT id, tenant_id, user_handle, name, trigger_type, task_prompt, autonomy,
                      config, status, cooldown_seconds, max_errors, error_count,
                      last_triggered_at, next_check_at, webhook_path, webhook_secret,
                      signature_type, execution_state
               FROM triggers
               WHERE trigger_type = 'CONDITION' AND status = 'ACTIVE'
                 AND (next_check_at IS NULL OR next_check_at <= $1)"#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
    }

    async fn find_due_event_triggers(&self, now: DateTime<Utc>) -> sqlx::Result<Vec<Trigger>> {
        sqlx::query_as::<_, Trigger>(
            r#"SELECT id, tenant_id, user_handle, name, trigger_type, task_prompt, autonomy,
                      config, status, cooldown_seconds, max_errors, error_count,
                      last_triggered_at, next_check_at, webhook_path, webhook_secret,
                      signature_type, execution_state
               FROM triggers
               WHERE trigger_type = 'EVENT' AND status = 'ACTIVE'
                 AND (next_check_at IS NULL OR next_check_at <= $1)"#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
    }

    async fn set_trigger_next_check(
        &self,
        id: Uuid,
        next_check_at: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE triggers SET next_check_at = $1 WHERE id = $2")
            .bind(next_check_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_trigger_success(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        execution_state: Option<serde_json::Value>,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"UPDATE triggers
               SET last_triggered_at = $1, error_count = 0,
                   execution_state = COALESCE($2, execution_state)
               WHERE id = $3"#,
        )
        .bind(now)
        .bind(execution_state)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_trigger_failure(
        &self,
        id: Uuid,
        new_error_count: i32,
        status: TriggerStatus,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE triggers SET error_count = $1, status = $2 WHERE id = $3")
            .bind(new_error_count)
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_trigger_execution(
        &self,
        trigger_id: Uuid,
        tenant_id: Uuid,
        status: TriggerExecutionStatus,
        confirmation_status: Option<ConfirmationStatus>,
        confirmation_deadline: Option<DateTime<Utc>>,
        triggered_by: &str,
        input_context: serde_json::Value,
    ) -> sqlx::Result<TriggerExecution> {
        sqlx::query_as::<_, TriggerExecution>(
            r#"INSERT INTO trigger_executions
                   (id, trigger_id, tenant_id, status, confirmation_status,
                    confirmation_deadline, triggered_by, input_context, started_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
               RETURNING id, trigger_id, tenant_id, status, confirmation_status,
                         confirmation_deadline, triggered_by, input_context, output,
                         error_message, started_at, completed_at, duration_ms"#,
        )
        .bind(Uuid::new_v4())
        .bind(trigger_id)
        .bind(tenant_id)
        .bind(status)
        .bind(confirmation_status)
        .bind(confirmation_deadline)
        .bind(triggered_by)
        .bind(input_context)
        .fetch_one(&self.pool)
        .await
    }

    async fn get_trigger_execution(&self, id: Uuid) -> sqlx::Result<Option<TriggerExecution>> {
        sqlx::query_as::<_, TriggerExecution>(
            r#"SELECT id, trigger_id, tenant_id, status, confirmation_status,
                      confirmation_deadline, triggered_by, input_context, output,
                      error_message, started_at, completed_at, duration_ms
               FROM trigger_executions WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn find_pending_confirmation(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
    ) -> sqlx::Result<Option<TriggerExecution>> {
        sqlx::query_as::<_, TriggerExecution>(
            r#"SELECT te.id, te.trigger_id, te.tenant_id, te.status, te.confirmation_status,
                      te.confirmation_deadline, te.triggered_by, te.input_context, te.output,
                      te.error_message, te.started_at, te.completed_at, te.duration_ms
               FROM trigger_executions te
               JOIN triggers t ON t.id = te.trigger_id
               WHERE te.tenant_id = $1 AND t.user_handle = $2
                 AND te.status = 'AWAITING_CONFIRMATION'
               ORDER BY te.started_at DESC
               LIMIT 1"#,
        )
        .bind(tenant_id)
        .bind(user_handle)
        .fetch_optional(&self.pool)
        .await
    }

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
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            r#"UPDATE trigger_executions
               SET status = $1, confirmation_status = COALESCE($2, confirmation_status),
                   output = COALESCE($3, output), error_message = COALESCE($4, error_message),
                   completed_at = COALESCE($5, completed_at),
                   duration_ms = COALESCE($6, duration_ms)
               WHERE id = $7 AND status = $8"#,
        )
        .bind(new_status)
        .bind(confirmation_status)
        .bind(output)
        .bind(error_message)
        .bind(completed_at)
        .bind(duration_ms)
        .bind(id)
        .bind(expected_status)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn idempotency_seen(&self, key: &str, now: DateTime<Utc>) -> sqlx::Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT key FROM idempotency_keys WHERE key = $1 AND expires_at > $2",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn idempotency_remember(&self, key: &str, now: DateTime<Utc>) -> sqlx::Result<()> {
        let expires_at = now + chrono::Duration::minutes(5);
        sqlx::query(
            r#"INSERT INTO idempotency_keys (key, expires_at)
               VALUES ($1, $2)
               ON CONFLICT (key) DO UPDATE SET expires_at = EXCLUDED.expires_at"#,
        )
        .bind(key)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
