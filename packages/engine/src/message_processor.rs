//! Entry point for inbound user messages and for executing prompts on
//! behalf of the scheduler/trigger engine (C6). Two public entry points per
//! spec §4.6: `process_incoming` and `execute_scheduled_task`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::{EngineError, TransportError, ValidationError};
use crate::session_pool::SessionPool;
use crate::store::{
    rolling_last5, ConfirmationStatus, ConversationSession, MessageDirection, Store, TaskType,
    Trigger, TriggerExecutionStatus,
};
use crate::transport::BaseTransport;

const CONFIRMATION_WINDOW_MINUTES: i64 = 30;

#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub success: bool,
    pub reply_message_id: Option<Uuid>,
    pub error: Option<String>,
}

impl ProcessResult {
    fn ok(reply_message_id: Uuid) -> Self {
        Self {
            success: true,
            reply_message_id: Some(reply_message_id),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            reply_message_id: None,
            error: Some(error.into()),
        }
    }
}

pub struct MessageProcessor {
    store: Arc<dyn Store>,
    session_pool: Arc<SessionPool>,
    transport: Arc<dyn BaseTransport>,
    max_message_chars: usize,
}

impl MessageProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        session_pool: Arc<SessionPool>,
        transport: Arc<dyn BaseTransport>,
        max_message_chars: usize,
    ) -> Self {
        Self {
            store,
            session_pool,
            transport,
            max_message_chars,
        }
    }

    pub async fn process_incoming(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
        text: &str,
        transport_message_id: Option<&str>,
    ) -> Result<ProcessResult, EngineError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        if trimmed.len() > self.max_message_chars {
            return Err(ValidationError::MessageTooLong {
                max: self.max_message_chars,
            }
            .into());
        }

        let tenant = self
            .store
            .get_tenant(tenant_id)
            .await?
            .ok_or_else(|| ValidationError::UnknownTenant(tenant_id.to_string()))?;

        let command = trimmed.to_lowercase();
        if command == "/reset" || command == "/new" {
            let session = self.store.reset_session(tenant_id, user_handle).await?;
            self.session_pool.close(tenant_id, user_handle).await;
            return self
                .reply(tenant_id, user_handle, session.id, "Started a fresh conversation.")
                .await;
        }
        if command == "/reonboard" {
            self.store
                .set_tenant_onboarding_status(tenant_id, "DISCOVERY")
                .await?;
            let session_id = self.current_or_new_session(tenant_id, user_handle).await?.id;
            return self
                .reply(tenant_id, user_handle, session_id, "Onboarding restarted.")
                .await;
        }
        if command == "/cancel" {
            self.session_pool.close(tenant_id, user_handle).await;
            let session_id = self.current_or_new_session(tenant_id, user_handle).await?.id;
            return self
                .reply(tenant_id, user_handle, session_id, "Cancelled.")
                .await;
        }

        if let Some(execution_id) = self
            .store
            .find_pending_confirmation(tenant_id, user_handle)
            .await?
            .map(|e| e.id)
        {
            return self
                .handle_confirmation_reply(tenant_id, user_handle, execution_id, trimmed)
                .await;
        }

        let (session, resumed) = self.get_or_create_session(tenant_id, user_handle).await?;
        if !resumed {
            info!(tenant = %tenant_id, user = %user_handle, "renewed expired session");
        }

        let mut prompt = trimmed.to_string();
        let onboarding = tenant.onboarding_status.to_uppercase();
        if onboarding == "DISCOVERY" || onboarding == "BUILDING" {
            prompt = format!(
                "[ONBOARDING: {}]\n{}",
                tenant.onboarding_status, prompt
            );
        }

        let reply = match self
            .session_pool
            .send(
                tenant_id,
                user_handle,
                &session.assistant_session_key(),
                resumed,
                &prompt,
            )
            .await
        {
            Ok(reply) => reply,
            Err(EngineError::Assistant(crate::errors::AssistantError::Timeout)) => {
                return Ok(ProcessResult::failed("Request timed out"));
            }
            Err(EngineError::Assistant(_)) => {
                return Ok(ProcessResult::failed("Something went wrong processing your message."));
            }
            Err(err) => return Err(err),
        };

        self.store
            .append_message(
                tenant_id,
                user_handle,
                session.id,
                transport_message_id,
                MessageDirection::Inbound,
                trimmed,
            )
            .await?;

        self.reply(tenant_id, user_handle, session.id, &reply).await
    }

    /// Builds the prompt envelope for a scheduled task or AUTO-autonomy
    /// trigger and invokes the assistant. The caller owns persisting and
    /// delivering the outbound reply.
    pub async fn execute_scheduled_task(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
        prompt: &str,
        task_type: TaskType,
        previous_outputs: &[String],
    ) -> Result<String, EngineError> {
        let envelope = match task_type {
            TaskType::Reminder => format!("SCHEDULED REMINDER\n{prompt}"),
            TaskType::Execute | TaskType::Trigger => {
                let banner = if task_type == TaskType::Execute {
                    "SCHEDULED TASK - EXECUTE"
                } else {
                    "TRIGGERED TASK"
                };
                let mut envelope = format!("{banner}\n{prompt}");
                if !previous_outputs.is_empty() {
                    envelope.push_str("\n\nPREVIOUS OUTPUTS:\n");
                    for (i, output) in previous_outputs.iter().enumerate() {
                        envelope.push_str(&format!("{}. {}\n", i + 1, output));
                    }
                }
                envelope
            }
        };

        let (session, resumed) = self.get_or_create_session(tenant_id, user_handle).await?;
        let reply = self
            .session_pool
            .send(
                tenant_id,
                user_handle,
                &session.assistant_session_key(),
                resumed,
                &envelope,
            )
            .await?;
        Ok(reply)
    }

    async fn handle_confirmation_reply(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
        execution_id: Uuid,
        trimmed: &str,
    ) -> Result<ProcessResult, EngineError> {
        let execution = self
            .store
            .get_trigger_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::TriggerExecution("confirmation execution vanished".to_string()))?;

        let now = Utc::now();
        let session_id = self.current_or_new_session(tenant_id, user_handle).await?.id;

        if execution
            .confirmation_deadline
            .map(|deadline| now > deadline)
            .unwrap_or(false)
        {
            let _ = self
                .store
                .transition_trigger_execution(
                    execution_id,
                    TriggerExecutionStatus::AwaitingConfirmation,
                    TriggerExecutionStatus::Cancelled,
                    Some(ConfirmationStatus::Expired),
                    None,
                    Some("confirmation window expired"),
                    Some(now),
                    None,
                )
                .await?;
            return self
                .reply(tenant_id, user_handle, session_id, "That request has expired and can no longer be approved.")
                .await;
        }

        let reply_lower = trimmed.to_lowercase();
        if reply_lower == "yes" || reply_lower == "y" {
            let transitioned = self
                .store
                .transition_trigger_execution(
                    execution_id,
                    TriggerExecutionStatus::AwaitingConfirmation,
                    TriggerExecutionStatus::Running,
                    Some(ConfirmationStatus::Approved),
                    None,
                    None,
                    None,
                    None,
                )
                .await?;
            if !transitioned {
                return self
                    .reply(tenant_id, user_handle, session_id, "Already processing that request")
                    .await;
            }
            return self.run_approved_confirmation(tenant_id, user_handle, execution_id).await;
        }

        if reply_lower == "no" || reply_lower == "n" {
            self.store
                .transition_trigger_execution(
                    execution_id,
                    TriggerExecutionStatus::AwaitingConfirmation,
                    TriggerExecutionStatus::Cancelled,
                    Some(ConfirmationStatus::Rejected),
                    None,
                    None,
                    Some(now),
                    None,
                )
                .await?;
            return self
                .reply(tenant_id, user_handle, session_id, "Okay, cancelled.")
                .await;
        }

        self.reply(
            tenant_id,
            user_handle,
            session_id,
            "Please reply YES or NO to confirm the pending request.",
        )
        .await
    }

    async fn run_approved_confirmation(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
        execution_id: Uuid,
    ) -> Result<ProcessResult, EngineError> {
        let execution = self
            .store
            .get_trigger_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::TriggerExecution("execution vanished after approval".to_string()))?;
        let trigger = self
            .store
            .get_trigger(execution.trigger_id)
            .await?
            .ok_or_else(|| EngineError::TriggerExecution("trigger vanished after approval".to_string()))?;

        let started = Utc::now();
        let previous_outputs = trigger.previous_outputs();
        let outcome = self
            .execute_scheduled_task(
                tenant_id,
                user_handle,
                &crate::template::render(&trigger.task_prompt, &execution.input_context),
                TaskType::Trigger,
                &previous_outputs,
            )
            .await;

        let now = Utc::now();
        let duration_ms = (now - started).num_milliseconds();

        match outcome {
            Ok(reply) => {
                self.store
                    .transition_trigger_execution(
                        execution_id,
                        TriggerExecutionStatus::Running,
                        TriggerExecutionStatus::Completed,
                        None,
                        Some(&reply),
                        None,
                        Some(now),
                        Some(duration_ms),
                    )
                    .await?;
                self.store
                    .record_trigger_success(
                        trigger.id,
                        now,
                        Some(rolling_last5(&previous_outputs, &reply)),
                    )
                    .await?;
                let session_id = self.current_or_new_session(tenant_id, user_handle).await?.id;
                self.reply(tenant_id, user_handle, session_id, &reply).await
            }
            Err(err) => {
                self.store
                    .transition_trigger_execution(
                        execution_id,
                        TriggerExecutionStatus::Running,
                        TriggerExecutionStatus::Failed,
                        None,
                        None,
                        Some(&err.to_string()),
                        Some(now),
                        Some(duration_ms),
                    )
                    .await?;
                error!(trigger = %trigger.id, err = %err, "approved trigger confirmation failed to execute");
                Ok(ProcessResult::failed("The confirmed request failed to complete."))
            }
        }
    }

    async fn get_or_create_session(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
    ) -> Result<(ConversationSession, bool), EngineError> {
        if let Some(session) = self.store.find_active_session(tenant_id, user_handle).await? {
            return Ok((session, true));
        }
        let session = self.store.create_session(tenant_id, user_handle).await?;
        Ok((session, false))
    }

    async fn current_or_new_session(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
    ) -> Result<ConversationSession, EngineError> {
        Ok(self.get_or_create_session(tenant_id, user_handle).await?.0)
    }

    async fn reply(
        &self,
        tenant_id: Uuid,
        user_handle: &str,
        session_id: Uuid,
        text: &str,
    ) -> Result<ProcessResult, EngineError> {
        let message = self
            .store
            .append_message(
                tenant_id,
                user_handle,
                session_id,
                None,
                MessageDirection::Outbound,
                text,
            )
            .await?;

        let recipient = user_handle.to_string();
        match self.transport.send(&recipient, text).await {
            Ok(_) => Ok(ProcessResult::ok(message.id)),
            Err(TransportError::Network(_)) | Err(TransportError::Rejected(_)) => {
                warn!(tenant = %tenant_id, user = %user_handle, "failed to deliver reply");
                Ok(ProcessResult::failed("delivery failed"))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Resolves the appropriate `confirmation_deadline` for a freshly-dispatched
/// CONFIRM-autonomy trigger.
pub fn confirmation_deadline(now: DateTime<Utc>) -> DateTime<Utc> {
    now + chrono::Duration::minutes(CONFIRMATION_WINDOW_MINUTES)
}

/// Exposed for `TriggerEngine` so both modules agree on what "unchanged
/// trigger" rows look like when building a NOTIFY/AUTO prompt.
pub fn interpolated_prompt(trigger: &Trigger, payload: &serde_json::Value) -> String {
    crate::template::render(&trigger.task_prompt, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::FakeAssistantProcess;
    use crate::store::fake::InMemoryStore;
    use crate::store::{Tenant, TenantStatus};
    use crate::transport::FakeTransport;
    use std::time::Duration;

    fn processor() -> (MessageProcessor, Arc<InMemoryStore>, Arc<FakeTransport>, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let tenant_id = Uuid::new_v4();
        store.seed_tenant(Tenant {
            id: tenant_id,
            status: TenantStatus::Active,
            messaging_channel: "sms".to_string(),
            onboarding_status: "READY".to_string(),
        });
        let assistant = Arc::new(FakeAssistantProcess::new());
        let session_pool = Arc::new(SessionPool::new(assistant, Duration::from_secs(900), false));
        let transport = Arc::new(FakeTransport::new());
        let processor = MessageProcessor::new(store.clone(), session_pool, transport.clone(), 4096);
        (processor, store, transport, tenant_id)
    }

    #[tokio::test]
    async fn rejects_empty_message() {
        let (processor, _, _, tenant_id) = processor();
        let err = processor
            .process_incoming(tenant_id, "alice", "   ", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::EmptyMessage)));
    }

    #[tokio::test]
    async fn rejects_oversized_message() {
        let (processor, _, _, tenant_id) = processor();
        let big = "x".repeat(4097);
        let err = processor
            .process_incoming(tenant_id, "alice", &big, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::MessageTooLong { max: 4096 })
        ));
    }

    #[tokio::test]
    async fn routes_ordinary_message_to_assistant_and_delivers_reply() {
        let (processor, _, transport, tenant_id) = processor();
        let result = processor
            .process_incoming(tenant_id, "alice", "hello there", None)
            .await
            .unwrap();
        assert!(result.success);
        let sent = transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "echo: hello there");
    }

    #[tokio::test]
    async fn confirm_flow_approved_in_time_runs_and_completes() {
        use crate::store::{Autonomy, NewTrigger, TriggerExecutionStatus, TriggerType};

        let (processor, store, transport, tenant_id) = processor();
        let trigger = store
            .create_trigger(NewTrigger {
                tenant_id,
                user_handle: "alice".to_string(),
                name: "deploy".to_string(),
                trigger_type: TriggerType::Webhook,
                task_prompt: "Deploy requested".to_string(),
                autonomy: Autonomy::Confirm,
                config: serde_json::json!({}),
                cooldown_seconds: 0,
                max_errors: 3,
                webhook_path: Some("deploy".to_string()),
                webhook_secret: None,
                signature_type: None,
            })
            .await
            .unwrap();
        let execution = store
            .insert_trigger_execution(
                trigger.id,
                tenant_id,
                TriggerExecutionStatus::AwaitingConfirmation,
                Some(crate::store::ConfirmationStatus::Pending),
                Some(Utc::now() + chrono::Duration::minutes(10)),
                "webhook",
                serde_json::json!({}),
            )
            .await
            .unwrap();

        let result = processor
            .process_incoming(tenant_id, "alice", "yes", None)
            .await
            .unwrap();
        assert!(result.success);

        let completed = store.get_trigger_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(completed.status, TriggerExecutionStatus::Completed);
        assert_eq!(
            completed.confirmation_status,
            Some(crate::store::ConfirmationStatus::Approved)
        );
        assert!(transport.sent_messages().last().unwrap().1.contains("echo:"));
    }

    #[tokio::test]
    async fn confirm_flow_reply_after_deadline_is_expired_not_acted_upon() {
        use crate::store::{Autonomy, NewTrigger, TriggerExecutionStatus, TriggerType};

        let (processor, store, transport, tenant_id) = processor();
        let trigger = store
            .create_trigger(NewTrigger {
                tenant_id,
                user_handle: "alice".to_string(),
                name: "deploy".to_string(),
                trigger_type: TriggerType::Webhook,
                task_prompt: "Deploy requested".to_string(),
                autonomy: Autonomy::Confirm,
                config: serde_json::json!({}),
                cooldown_seconds: 0,
                max_errors: 3,
                webhook_path: Some("deploy".to_string()),
                webhook_secret: None,
                signature_type: None,
            })
            .await
            .unwrap();
        let execution = store
            .insert_trigger_execution(
                trigger.id,
                tenant_id,
                TriggerExecutionStatus::AwaitingConfirmation,
                Some(crate::store::ConfirmationStatus::Pending),
                Some(Utc::now() + chrono::Duration::minutes(30)),
                "webhook",
                serde_json::json!({}),
            )
            .await
            .unwrap();
        // Simulate the reply arriving at T0+31min: deadline was T0+30min.
        store.force_confirmation_deadline(execution.id, Utc::now() - chrono::Duration::minutes(1));

        let result = processor
            .process_incoming(tenant_id, "alice", "yes", None)
            .await
            .unwrap();
        assert!(result.success);

        let expired = store.get_trigger_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(expired.status, TriggerExecutionStatus::Cancelled);
        assert_eq!(
            expired.confirmation_status,
            Some(crate::store::ConfirmationStatus::Expired)
        );
        let sent = transport.sent_messages();
        assert!(sent.last().unwrap().1.contains("expired"), "too-late notice expected");
        assert!(
            !sent.iter().any(|m| m.1.contains("echo:")),
            "no task-result message should be sent for an expired confirmation"
        );
    }

    #[tokio::test]
    async fn reset_starts_a_fresh_session_without_calling_assistant() {
        let (processor, store, transport, tenant_id) = processor();
        processor
            .process_incoming(tenant_id, "alice", "hi", None)
            .await
            .unwrap();
        let result = processor
            .process_incoming(tenant_id, "alice", "/reset", None)
            .await
            .unwrap();
        assert!(result.success);
        let sessions = store.messages_snapshot();
        assert!(sessions.iter().any(|m| m.content.contains("fresh conversation")));
        assert_eq!(transport.sent_messages().last().unwrap().1, "Started a fresh conversation.");
    }
}
