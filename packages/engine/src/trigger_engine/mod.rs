//! Dispatches `TriggerEvent`s by autonomy level, owns the confirmation and
//! circuit-breaker bookkeeping (C9). Event-source adapters (C10) live in
//! `adapters/` and call `TriggerEngine::handle`.

pub mod adapters;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value as Json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::message_processor::{confirmation_deadline, MessageProcessor};
use crate::store::{
    rolling_last5, Autonomy, ConfirmationStatus, Store, TaskType, TriggerExecutionStatus,
    TriggerStatus,
};
use crate::transport::BaseTransport;

const BREAKER_FAILURE_THRESHOLD: u32 = 3;
const BREAKER_COOLDOWN_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct TriggerEventPayload {
    pub source: String,
    pub data: Json,
    pub metadata: Json,
}

#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub trigger_id: Uuid,
    pub tenant_id: Uuid,
    pub user_handle: String,
    pub payload: TriggerEventPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open,
}

struct BreakerEntry {
    state: BreakerState,
    opened_at: Option<Instant>,
}

pub struct TriggerEngine {
    store: Arc<dyn Store>,
    processor: Arc<MessageProcessor>,
    transport: Arc<dyn BaseTransport>,
    breakers: DashMap<Uuid, BreakerEntry>,
}

impl TriggerEngine {
    pub fn new(
        store: Arc<dyn Store>,
        processor: Arc<MessageProcessor>,
        transport: Arc<dyn BaseTransport>,
    ) -> Self {
        Self {
            store,
            processor,
            transport,
            breakers: DashMap::new(),
        }
    }

    fn breaker_open(&self, trigger_id: Uuid) -> bool {
        match self.breakers.get(&trigger_id) {
            Some(entry) => match entry.state {
                BreakerState::Open => {
                    let elapsed = entry
                        .opened_at
                        .map(|t| t.elapsed())
                        .unwrap_or(Duration::from_secs(0));
                    elapsed < Duration::from_secs(BREAKER_COOLDOWN_SECS)
                }
                BreakerState::Closed { .. } => false,
            },
            None => false,
        }
    }

    fn record_breaker_success(&self, trigger_id: Uuid) {
        self.breakers.insert(
            trigger_id,
            BreakerEntry {
                state: BreakerState::Closed {
                    consecutive_failures: 0,
                },
                opened_at: None,
            },
        );
    }

    fn record_breaker_failure(&self, trigger_id: Uuid) {
        let mut entry = self.breakers.entry(trigger_id).or_insert(BreakerEntry {
            state: BreakerState::Closed {
                consecutive_failures: 0,
            },
            opened_at: None,
        });
        match entry.state {
            BreakerState::Closed { consecutive_failures } => {
                let failures = consecutive_failures + 1;
                if failures >= BREAKER_FAILURE_THRESHOLD {
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(Instant::now());
                } else {
                    entry.state = BreakerState::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            BreakerState::Open => {
                entry.opened_at = Some(Instant::now());
            }
        }
    }

    pub async fn handle(&self, event: TriggerEvent) -> Result<(), EngineError> {
        if self.breaker_open(event.trigger_id) {
            info!(trigger = %event.trigger_id, "circuit breaker open, dropping event");
            return Ok(());
        }

        let trigger = match self.store.get_trigger(event.trigger_id).await? {
            Some(t) => t,
            None => {
                warn!(trigger = %event.trigger_id, "trigger vanished, dropping event");
                return Ok(());
            }
        };
        if trigger.status != TriggerStatus::Active {
            return Ok(());
        }

        let now = chrono::Utc::now();
        if let Some(last) = trigger.last_triggered_at {
            if last + chrono::Duration::seconds(trigger.cooldown_seconds) > now {
                info!(trigger = %trigger.id, "within cooldown, dropping event");
                return Ok(());
            }
        }

        let payload_json = serde_json::json!({
            "source": event.payload.source,
            "data": event.payload.data,
            "metadata": event.payload.metadata,
        });

        // CONFIRM-autonomy executions need their deadline set at insert time:
        // `transition_trigger_execution` has no column for it, so it can
        // only ever be recorded here, before the status-history starts.
        let initial_deadline = match trigger.autonomy {
            Autonomy::Confirm => Some(confirmation_deadline(now)),
            Autonomy::Notify | Autonomy::Auto => None,
        };

        let execution = self
            .store
            .insert_trigger_execution(
                trigger.id,
                event.tenant_id,
                TriggerExecutionStatus::Pending,
                None,
                initial_deadline,
                &event.payload.source,
                payload_json.clone(),
            )
            .await?;

        let result = match trigger.autonomy {
            Autonomy::Notify => self.dispatch_notify(&trigger, &execution.id, &payload_json).await,
            Autonomy::Confirm => {
                self.dispatch_confirm(&trigger, &execution.id, &event.user_handle, &payload_json)
                    .await
            }
            Autonomy::Auto => {
                self.dispatch_auto(&trigger, &execution.id, &event.user_handle, &payload_json)
                    .await
            }
        };

        match result {
            Ok(()) => {
                self.store.record_trigger_success(trigger.id, now, None).await?;
                self.record_breaker_success(trigger.id);
            }
            Err(ref err) => {
                let new_error_count = trigger.error_count + 1;
                let status = if new_error_count >= trigger.max_errors {
                    TriggerStatus::Error
                } else {
                    trigger.status
                };
                self.store
                    .record_trigger_failure(trigger.id, new_error_count, status)
                    .await?;
                self.record_breaker_failure(trigger.id);
                error!(trigger = %trigger.id, err = %err, "trigger dispatch failed");
            }
        }

        result
    }

    async fn dispatch_notify(
        &self,
        trigger: &crate::store::Trigger,
        execution_id: &Uuid,
        payload: &Json,
    ) -> Result<(), EngineError> {
        let text = crate::template::render(&trigger.task_prompt, payload);
        let notice = format!("Trigger fired: {text}");
        self.deliver_and_complete(trigger, *execution_id, &notice).await
    }

    async fn dispatch_confirm(
        &self,
        trigger: &crate::store::Trigger,
        execution_id: &Uuid,
        user_handle: &str,
        payload: &Json,
    ) -> Result<(), EngineError> {
        let text = crate::template::render(&trigger.task_prompt, payload);
        let prompt = format!("{text}\n\nReply YES to proceed or NO to cancel.");

        self.store
            .transition_trigger_execution(
                *execution_id,
                TriggerExecutionStatus::Pending,
                TriggerExecutionStatus::AwaitingConfirmation,
                Some(ConfirmationStatus::Pending),
                None,
                None,
                None,
                None,
            )
            .await?;

        self.deliver_direct(trigger, user_handle, &prompt).await
    }

    async fn dispatch_auto(
        &self,
        trigger: &crate::store::Trigger,
        execution_id: &Uuid,
        user_handle: &str,
        payload: &Json,
    ) -> Result<(), EngineError> {
        self.store
            .transition_trigger_execution(
                *execution_id,
                TriggerExecutionStatus::Pending,
                TriggerExecutionStatus::Running,
                None,
                None,
                None,
                None,
                None,
            )
            .await?;

        let interpolated = crate::template::render(&trigger.task_prompt, payload);
        let data_block = serde_json::to_string_pretty(payload.get("data").unwrap_or(payload))
            .unwrap_or_default();
        let prompt = format!(
            "[TRIGGERED BY: {}]\n{}\n{}",
            trigger.trigger_type_label(),
            data_block,
            interpolated
        );

        let previous_outputs = trigger.previous_outputs();
        let started = std::time::Instant::now();
        let outcome = self
            .processor
            .execute_scheduled_task(
                trigger.tenant_id,
                user_handle,
                &prompt,
                TaskType::Trigger,
                &previous_outputs,
            )
            .await;

        let now = chrono::Utc::now();
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(reply) => {
                self.store
                    .transition_trigger_execution(
                        *execution_id,
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
                self.deliver_direct(trigger, user_handle, &reply).await
            }
            Err(err) => {
                self.store
                    .transition_trigger_execution(
                        *execution_id,
                        TriggerExecutionStatus::Running,
                        TriggerExecutionStatus::Failed,
                        None,
                        None,
                        Some(&err.to_string()),
                        Some(now),
                        Some(duration_ms),
                    )
                    .await?;
                Err(err)
            }
        }
    }

    async fn deliver_and_complete(
        &self,
        trigger: &crate::store::Trigger,
        execution_id: Uuid,
        text: &str,
    ) -> Result<(), EngineError> {
        self.store
            .transition_trigger_execution(
                execution_id,
                TriggerExecutionStatus::Pending,
                TriggerExecutionStatus::Completed,
                None,
                Some(text),
                None,
                Some(chrono::Utc::now()),
                None,
            )
            .await?;
        self.deliver_direct(trigger, &trigger.user_handle, text).await
    }

    async fn deliver_direct(
        &self,
        trigger: &crate::store::Trigger,
        user_handle: &str,
        text: &str,
    ) -> Result<(), EngineError> {
        let session = self
            .store
            .find_active_session(trigger.tenant_id, user_handle)
            .await?;
        let session_id = match session {
            Some(s) => s.id,
            None => self.store.create_session(trigger.tenant_id, user_handle).await?.id,
        };
        self.store
            .append_message(
                trigger.tenant_id,
                user_handle,
                session_id,
                None,
                crate::store::MessageDirection::Outbound,
                text,
            )
            .await?;
        if let Err(err) = self.transport.send(user_handle, text).await {
            warn!(trigger = %trigger.id, user = %user_handle, err = %err, "failed to deliver trigger notice");
        }
        Ok(())
    }
}

impl crate::store::Trigger {
    fn trigger_type_label(&self) -> &'static str {
        match self.trigger_type {
            crate::store::TriggerType::Webhook => "webhook",
            crate::store::TriggerType::Condition => "condition",
            crate::store::TriggerType::Event => "event",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::FakeAssistantProcess;
    use crate::session_pool::SessionPool;
    use crate::store::fake::InMemoryStore;
    use crate::store::{NewTrigger, Tenant, TenantStatus, TriggerType};
    use crate::transport::FakeTransport;
    use std::time::Duration;

    fn engine() -> (TriggerEngine, Arc<InMemoryStore>, Arc<FakeTransport>, Uuid) {
        engine_with(FakeAssistantProcess::new())
    }

    fn engine_with(assistant: FakeAssistantProcess) -> (TriggerEngine, Arc<InMemoryStore>, Arc<FakeTransport>, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let tenant_id = Uuid::new_v4();
        store.seed_tenant(Tenant {
            id: tenant_id,
            status: TenantStatus::Active,
            messaging_channel: "sms".to_string(),
            onboarding_status: "READY".to_string(),
        });
        let assistant = Arc::new(assistant);
        let session_pool = Arc::new(SessionPool::new(assistant, Duration::from_secs(900), false));
        let transport = Arc::new(FakeTransport::new());
        let processor = Arc::new(MessageProcessor::new(
            store.clone(),
            session_pool,
            transport.clone(),
            4096,
        ));
        let engine = TriggerEngine::new(store.clone(), processor, transport.clone());
        (engine, store, transport, tenant_id)
    }

    async fn seed_trigger(store: &InMemoryStore, tenant_id: Uuid, autonomy: Autonomy) -> Uuid {
        let trigger = store
            .create_trigger(NewTrigger {
                tenant_id,
                user_handle: "alice".to_string(),
                name: "watch".to_string(),
                trigger_type: TriggerType::Webhook,
                task_prompt: "Something happened: {{data.thing}}".to_string(),
                autonomy,
                config: serde_json::json!({}),
                cooldown_seconds: 0,
                max_errors: 3,
                webhook_path: Some("watch".to_string()),
                webhook_secret: None,
                signature_type: None,
            })
            .await
            .unwrap();
        trigger.id
    }

    fn event(trigger_id: Uuid, tenant_id: Uuid) -> TriggerEvent {
        TriggerEvent {
            trigger_id,
            tenant_id,
            user_handle: "alice".to_string(),
            payload: TriggerEventPayload {
                source: "webhook".to_string(),
                data: serde_json::json!({"thing": "a deploy"}),
                metadata: serde_json::json!({}),
            },
        }
    }

    #[tokio::test]
    async fn notify_trigger_delivers_and_completes() {
        let (engine, store, transport, tenant_id) = engine();
        let trigger_id = seed_trigger(&store, tenant_id, Autonomy::Notify).await;
        engine.handle(event(trigger_id, tenant_id)).await.unwrap();

        let sent = transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("a deploy"));
        let trigger = store.get_trigger(trigger_id).await.unwrap().unwrap();
        assert!(trigger.last_triggered_at.is_some());
    }

    #[tokio::test]
    async fn confirm_trigger_sets_deadline_and_awaits_reply() {
        let (engine, store, transport, tenant_id) = engine();
        let trigger_id = seed_trigger(&store, tenant_id, Autonomy::Confirm).await;
        engine.handle(event(trigger_id, tenant_id)).await.unwrap();

        let sent = transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("Reply YES"));

        let pending = store
            .find_pending_confirmation(tenant_id, "alice")
            .await
            .unwrap()
            .expect("awaiting confirmation execution recorded");
        assert!(
            pending.confirmation_deadline.is_some(),
            "confirmation_deadline must be persisted before the autonomy branch runs"
        );
        assert_eq!(pending.status, TriggerExecutionStatus::AwaitingConfirmation);
    }

    #[tokio::test]
    async fn auto_trigger_runs_assistant_and_delivers_output() {
        let (engine, store, transport, tenant_id) = engine();
        let trigger_id = seed_trigger(&store, tenant_id, Autonomy::Auto).await;
        engine.handle(event(trigger_id, tenant_id)).await.unwrap();

        let sent = transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.starts_with("echo:"));
        let trigger = store.get_trigger(trigger_id).await.unwrap().unwrap();
        assert!(trigger.last_triggered_at.is_some());
    }

    #[tokio::test]
    async fn cooldown_drops_events_fired_too_soon() {
        let (engine, store, transport, tenant_id) = engine();
        let trigger = store
            .create_trigger(NewTrigger {
                tenant_id,
                user_handle: "alice".to_string(),
                name: "watch".to_string(),
                trigger_type: TriggerType::Webhook,
                task_prompt: "hi".to_string(),
                autonomy: Autonomy::Notify,
                config: serde_json::json!({}),
                cooldown_seconds: 3600,
                max_errors: 3,
                webhook_path: Some("watch".to_string()),
                webhook_secret: None,
                signature_type: None,
            })
            .await
            .unwrap();

        engine.handle(event(trigger.id, tenant_id)).await.unwrap();
        engine.handle(event(trigger.id, tenant_id)).await.unwrap();
        assert_eq!(transport.sent_messages().len(), 1, "second event within cooldown must be dropped");
    }

    #[tokio::test]
    async fn breaker_opens_after_repeated_failures() {
        let (engine, store, _transport, tenant_id) =
            engine_with(FakeAssistantProcess::new().with_always_fail());
        let trigger_id = seed_trigger(&store, tenant_id, Autonomy::Auto).await;
        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            let _ = engine.handle(event(trigger_id, tenant_id)).await;
        }
        assert!(engine.breaker_open(trigger_id));
    }
}
