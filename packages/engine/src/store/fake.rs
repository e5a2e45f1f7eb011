//! In-memory fake `Store`, used by unit tests so they never touch a real
//! Postgres instance. Mirrors the teacher's `test_dependencies.rs` mocks:
//! plain structs wrapping `Arc<Mutex<..>>`, no async I/O.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::*;
use super::{NewScheduledTask, NewTrigger, Store};

#[derive(Default)]
struct Inner {
    tenants: HashMap<Uuid, Tenant>,
    sessions: HashMap<Uuid, ConversationSession>,
    messages: Vec<Message>,
    tasks: HashMap<Uuid, ScheduledTask>,
    triggers: HashMap<Uuid, Trigger>,
    executions: HashMap<Uuid, TriggerExecution>,
    idempotency: HashMap<String, DateTime<Utc>>,
}

pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn seed_tenant(&self, tenant: Tenant) {
        self.inner.lock().unwrap().tenants.insert(tenant.id, tenant);
    }

    pub fn tasks_snapshot(&self) -> Vec<ScheduledTask> {
        self.inner.lock().unwrap().tasks.values().cloned().collect()
    }

    pub fn messages_snapshot(&self) -> Vec<Message> {
        self.inner.lock().unwrap().messages.clone()
    }

    /// Test-only hook: forces a task's `next_run_at` (and clears its
    /// lease), to simulate time passing between scheduler ticks without an
    /// actual wall-clock wait.
    pub fn force_next_run_at(&self, id: Uuid, at: DateTime<Utc>) {
        if let Some(t) = self.inner.lock().unwrap().tasks.get_mut(&id) {
            t.next_run_at = at;
            t.lease_owner = None;
            t.lease_expires_at = None;
        }
    }

    /// Test-only hook: backdates a `TriggerExecution`'s confirmation
    /// deadline, to simulate a user reply arriving after the 30-minute
    /// window without an actual wall-clock wait.
    pub fn force_confirmation_deadline(&self, id: Uuid, deadline: DateTime<Utc>) {
        if let Some(e) = self.inner.lock().unwrap().executions.get_mut(&id) {
            e.confirmation_deadline = Some(deadline);
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_tenant(&self, tenant_id: Uuid) -> sqlx::Result<Option<Tenant>> {
        Ok(self.inner.lock().unwrap().tenants.get(&tenant_id).cloned())
    }

    async fn set_tenant_onboarding_status(
        &self,
        tenant_id: Uuid,
        status: &str,
    ) -> sqlx::Result<()> {
        if let Some(t) = self.inner.lock().unwrap().tenants.get_mut(&tenant_id) {
            t.onboarding_status = status.to_string();
        }
        Ok(())
    }

    async fn find_active_session(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
    ) -> sqlx::Result<Option<ConversationSession>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .find(|s| s.tenant_id == tenant_id && s.user_handle == user_handle && s.ended_at.is_none())
            .cloned())
    }

    async fn create_session(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
    ) -> sqlx::Result<ConversationSession> {
        let session = ConversationSession {
            id: Uuid::new_v4(),
            tenant_id,
            user_handle: user_handle.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            reset_timestamp: None,
        };
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(session.id, session.clone());
        Ok(session)
    }

    async fn reset_session(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
    ) -> sqlx::Result<ConversationSession> {
        let mut inner = self.inner.lock().unwrap();
        for s in inner.sessions.values_mut() {
            if s.tenant_id == tenant_id && s.user_handle == user_handle && s.ended_at.is_none() {
                s.ended_at = Some(Utc::now());
            }
        }
        let session = ConversationSession {
            id: Uuid::new_v4(),
            tenant_id,
            user_handle: user_handle.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            reset_timestamp: Some(Utc::now()),
        };
        inner.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn end_session(&self, session_id: Uuid) -> sqlx::Result<()> {
        if let Some(s) = self.inner.lock().unwrap().sessions.get_mut(&session_id) {
            s.ended_at = Some(Utc::now());
        }
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
        let message = Message {
            id: Uuid::new_v4(),
            tenant_id,
            user_handle: user_handle.to_string(),
            session_id,
            transport_message_id: transport_message_id.map(str::to_string),
            direction,
            content: content.to_string(),
            delivery_status: "sent".to_string(),
            created_at: Utc::now(),
        };
        self.inner.lock().unwrap().messages.push(message.clone());
        Ok(message)
    }

    async fn count_enabled_schedules(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
    ) -> sqlx::Result<i64> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.tenant_id == tenant_id && t.user_handle == user_handle && t.enabled)
            .count() as i64)
    }

    async fn insert_scheduled_task(&self, task: NewScheduledTask) -> sqlx::Result<ScheduledTask> {
        let row = ScheduledTask {
            id: Uuid::new_v4(),
            tenant_id: task.tenant_id,
            user_handle: task.user_handle,
            task_prompt: task.task_prompt,
            task_type: task.task_type,
            timezone: task.timezone,
            cron_expr: task.cron_expr,
            run_at: task.run_at,
            is_one_time: task.is_one_time,
            next_run_at: task.next_run_at,
            last_run_at: None,
            error_count: 0,
            enabled: true,
            lease_owner: None,
            lease_expires_at: None,
            execution_plan: None,
        };
        self.inner.lock().unwrap().tasks.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_scheduled_task(&self, id: Uuid) -> sqlx::Result<Option<ScheduledTask>> {
        Ok(self.inner.lock().unwrap().tasks.get(&id).cloned())
    }

    async fn list_scheduled_tasks(&self, tenant_id: Uuid) -> sqlx::Result<Vec<ScheduledTask>> {
        let mut rows: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.tenant_id == tenant_id)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.next_run_at);
        Ok(rows)
    }

    async fn delete_scheduled_task(&self, id: Uuid) -> sqlx::Result<()> {
        self.inner.lock().unwrap().tasks.remove(&id);
        Ok(())
    }

    async fn claim_due_tasks(
        &self,
        owner: &str,
        ttl_secs: i64,
        limit: i64,
        now: DateTime<Utc>,
    ) -> sqlx::Result<Vec<ScheduledTask>> {
        let mut inner = self.inner.lock().unwrap();
        let mut eligible_ids: Vec<Uuid> = inner
            .tasks
            .values()
            .filter(|t| {
                t.enabled
                    && t.next_run_at <= now
                    && t.lease_expires_at.map(|exp| exp < now).unwrap_or(true)
            })
            .map(|t| t.id)
            .collect();
        eligible_ids.sort_by_key(|id| inner.tasks[id].next_run_at);
        eligible_ids.truncate(limit as usize);

        let lease_expires_at = now + chrono::Duration::seconds(ttl_secs);
        let mut claimed = Vec::new();
        for id in eligible_ids {
            let t = inner.tasks.get_mut(&id).unwrap();
            t.lease_owner = Some(owner.to_string());
            t.lease_expires_at = Some(lease_expires_at);
            claimed.push(t.clone());
        }
        Ok(claimed)
    }

    async fn release_task_lease(&self, id: Uuid) -> sqlx::Result<()> {
        if let Some(t) = self.inner.lock().unwrap().tasks.get_mut(&id) {
            t.lease_owner = None;
            t.lease_expires_at = None;
        }
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
        if let Some(t) = self.inner.lock().unwrap().tasks.get_mut(&id) {
            t.last_run_at = Some(Utc::now());
            t.next_run_at = next_run_at;
            t.error_count = 0;
            t.execution_plan = Some(execution_plan);
            t.lease_owner = None;
            t.lease_expires_at = None;
        }
        Ok(())
    }

    async fn fail_task(
        &self,
        id: Uuid,
        new_error_count: i32,
        next_run_at: DateTime<Utc>,
        enabled: bool,
    ) -> sqlx::Result<()> {
        if let Some(t) = self.inner.lock().unwrap().tasks.get_mut(&id) {
            t.error_count = new_error_count;
            t.next_run_at = next_run_at;
            t.enabled = enabled;
            t.lease_owner = None;
            t.lease_expires_at = None;
        }
        Ok(())
    }

    async fn get_trigger(&self, id: Uuid) -> sqlx::Result<Option<Trigger>> {
        Ok(self.inner.lock().unwrap().triggers.get(&id).cloned())
    }

    async fn get_trigger_by_webhook_path(&self, path: &str) -> sqlx::Result<Option<Trigger>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .triggers
            .values()
            .find(|t| t.webhook_path.as_deref() == Some(path))
            .cloned())
    }

    async fn list_triggers(&self, tenant_id: Uuid) -> sqlx::Result<Vec<Trigger>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .triggers
            .values()
            .filter(|t| t.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn create_trigger(&self, trigger: NewTrigger) -> sqlx::Result<Trigger> {
        let row = Trigger {
            id: Uuid::new_v4(),
            tenant_id: trigger.tenant_id,
            user_handle: trigger.user_handle,
            name: trigger.name,
            trigger_type: trigger.trigger_type,
            task_prompt: trigger.task_prompt,
            autonomy: trigger.autonomy,
            config: trigger.config,
            status: TriggerStatus::Active,
            cooldown_seconds: trigger.cooldown_seconds,
            max_errors: trigger.max_errors,
            error_count: 0,
            last_triggered_at: None,
            next_check_at: None,
            webhook_path: trigger.webhook_path,
            webhook_secret: trigger.webhook_secret,
            signature_type: trigger.signature_type,
            execution_state: None,
        };
        self.inner.lock().unwrap().triggers.insert(row.id, row.clone());
        Ok(row)
    }

    async fn set_trigger_status(&self, id: Uuid, status: TriggerStatus) -> sqlx::Result<()> {
        if let Some(t) = self.inner.lock().unwrap().triggers.get_mut(&id) {
            t.status = status;
        }
        Ok(())
    }

    async fn delete_trigger(&self, id: Uuid) -> sqlx::Result<()> {
        self.inner.lock().unwrap().triggers.remove(&id);
        Ok(())
    }

    async fn find_due_condition_triggers(&self, now: DateTime<Utc>) -> sqlx::Result<Vec<Trigger>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .triggers
            .values()
            .filter(|t| {
                t.trigger_type == TriggerType::Condition
                    && t.status == TriggerStatus::Active
                    && t.next_check_at.map(|nc| nc <= now).unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn find_due_event_triggers(&self, now: DateTime<Utc>) -> sqlx::Result<Vec<Trigger>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .triggers
            .values()
            .filter(|t| {
                t.trigger_type == TriggerType::Event
                    && t.status == TriggerStatus::Active
                    && t.next_check_at.map(|nc| nc <= now).unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn set_trigger_next_check(
        &self,
        id: Uuid,
        next_check_at: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        if let Some(t) = self.inner.lock().unwrap().triggers.get_mut(&id) {
            t.next_check_at = Some(next_check_at);
        }
        Ok(())
    }

    async fn record_trigger_success(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        execution_state: Option<serde_json::Value>,
    ) -> sqlx::Result<()> {
        if let Some(t) = self.inner.lock().unwrap().triggers.get_mut(&id) {
            t.last_triggered_at = Some(now);
            t.error_count = 0;
            if let Some(state) = execution_state {
                t.execution_state = Some(state);
            }
        }
        Ok(())
    }

    async fn record_trigger_failure(
        &self,
        id: Uuid,
        new_error_count: i32,
        status: TriggerStatus,
    ) -> sqlx::Result<()> {
        if let Some(t) = self.inner.lock().unwrap().triggers.get_mut(&id) {
            t.error_count = new_error_count;
            t.status = status;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
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
        let row = TriggerExecution {
            id: Uuid::new_v4(),
            trigger_id,
            tenant_id,
            status,
            confirmation_status,
            confirmation_deadline,
            triggered_by: triggered_by.to_string(),
            input_context,
            output: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        };
        self.inner
            .lock()
            .unwrap()
            .executions
            .insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_trigger_execution(&self, id: Uuid) -> sqlx::Result<Option<TriggerExecution>> {
        Ok(self.inner.lock().unwrap().executions.get(&id).cloned())
    }

    async fn find_pending_confirmation(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
    ) -> sqlx::Result<Option<TriggerExecution>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .executions
            .values()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && e.status == TriggerExecutionStatus::AwaitingConfirmation
                    && inner
                        .triggers
                        .get(&e.trigger_id)
                        .map(|t| t.user_handle == user_handle)
                        .unwrap_or(false)
            })
            .max_by_key(|e| e.started_at)
            .cloned())
    }

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
    ) -> sqlx::Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(e) = inner.executions.get_mut(&id) else {
            return Ok(false);
        };
        if e.status != expected_status {
            return Ok(false);
        }
        e.status = new_status;
        if let Some(cs) = confirmation_status {
            e.confirmation_status = Some(cs);
        }
        if let Some(o) = output {
            e.output = Some(o.to_string());
        }
        if let Some(err) = error_message {
            e.error_message = Some(err.to_string());
        }
        if let Some(c) = completed_at {
            e.completed_at = Some(c);
        }
        if let Some(d) = duration_ms {
            e.duration_ms = Some(d);
        }
        Ok(true)
    }

    async fn idempotency_seen(&self, key: &str, now: DateTime<Utc>) -> sqlx::Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .idempotency
            .get(key)
            .map(|expires| *expires > now)
            .unwrap_or(false))
    }

    async fn idempotency_remember(&self, key: &str, now: DateTime<Utc>) -> sqlx::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .idempotency
            .insert(key.to_string(), now + chrono::Duration::minutes(5));
        Ok(())
    }
}
