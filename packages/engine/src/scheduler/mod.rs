//! Minute-cadence polling loop that claims, executes, and reschedules or
//! deletes due tasks (C7). Grounded on `other_examples`'s
//! `scheduler-postgres.rs`-style `clean_complete` tick loop: an eager first
//! `interval.tick().await`, an `AtomicBool` running-guard, and a
//! `Semaphore`/`Notify` pair for a bounded graceful-shutdown drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::lock::AdvisoryLock;
use crate::message_processor::MessageProcessor;
use crate::store::{ScheduledTask, Store};
use crate::transport::BaseTransport;

const TICK_INTERVAL_SECS: u64 = 60;
const LEASE_TTL_SECS: i64 = 300;
const CLAIM_LIMIT: i64 = 50;
const MAX_ERROR_COUNT: i32 = 3;
const OVERDUE_NOTICE_THRESHOLD_SECS: i64 = 300;
const SHUTDOWN_DRAIN_SECS: u64 = 30;

pub struct Scheduler {
    store: Arc<dyn Store>,
    lock: Arc<dyn AdvisoryLock>,
    processor: Arc<MessageProcessor>,
    transport: Arc<dyn BaseTransport>,
    owner_id: String,
    running: AtomicBool,
    shutting_down: AtomicBool,
    in_flight: Semaphore,
    drained: Notify,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        lock: Arc<dyn AdvisoryLock>,
        processor: Arc<MessageProcessor>,
        transport: Arc<dyn BaseTransport>,
    ) -> Self {
        Self {
            store,
            lock,
            processor,
            transport,
            owner_id: Uuid::new_v4().to_string(),
            running: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            in_flight: Semaphore::new(CLAIM_LIMIT as usize),
            drained: Notify::new(),
        }
    }

    /// Runs the tick loop forever. Intended to be spawned as its own task.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SECS));
        interval.tick().await; // eager first tick
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            self.tick().await;
            interval.tick().await;
        }
    }

    pub async fn tick(&self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("scheduler tick skipped: previous tick still running");
            return;
        }

        let acquired = match self.lock.try_acquire().await {
            Ok(acquired) => acquired,
            Err(e) => {
                error!(err = %e, "advisory lock backend unreachable, skipping tick");
                self.running.store(false, Ordering::SeqCst);
                return;
            }
        };
        if !acquired {
            self.running.store(false, Ordering::SeqCst);
            return;
        }

        if let Err(e) = self.run_claimed_tasks().await {
            error!(err = %e, "scheduler tick failed");
        }

        if let Err(e) = self.lock.release().await {
            error!(err = %e, "failed to release advisory lock");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn run_claimed_tasks(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let tasks = self
            .store
            .claim_due_tasks(&self.owner_id, LEASE_TTL_SECS, CLAIM_LIMIT, now)
            .await?;

        for task in tasks {
            if self.shutting_down.load(Ordering::SeqCst) {
                self.store.release_task_lease(task.id).await?;
                continue;
            }
            let _permit = self.in_flight.acquire().await.expect("semaphore not closed");
            self.run_one_task(task, now).await;
        }

        if self.shutting_down.load(Ordering::SeqCst) {
            self.drained.notify_waiters();
        }
        Ok(())
    }

    async fn run_one_task(&self, task: ScheduledTask, tick_now: chrono::DateTime<Utc>) {
        let previous_outputs = task.previous_outputs();
        let outcome = self
            .processor
            .execute_scheduled_task(
                task.tenant_id,
                &task.user_handle,
                &task.task_prompt,
                task.task_type,
                &previous_outputs,
            )
            .await;

        match outcome {
            Ok(mut reply) => {
                let overdue_secs = (tick_now - task.next_run_at).num_seconds();
                if overdue_secs > OVERDUE_NOTICE_THRESHOLD_SECS {
                    let minutes = overdue_secs / 60;
                    reply = format!("(Delayed {minutes} minutes)\n{reply}");
                }
                if let Err(e) = self.deliver(&task, &reply).await {
                    error!(task = %task.id, err = %e, "failed to deliver scheduled task reply");
                }
                if let Err(e) = self.complete_success(&task, &reply).await {
                    error!(task = %task.id, err = %e, "failed to persist scheduled task completion");
                }
            }
            Err(err) => {
                error!(task = %task.id, err = %err, "scheduled task execution failed");
                if let Err(e) = self.complete_failure(&task).await {
                    error!(task = %task.id, err = %e, "failed to persist scheduled task failure");
                }
            }
        }
    }

    async fn deliver(&self, task: &ScheduledTask, reply: &str) -> anyhow::Result<()> {
        self.store
            .append_message(
                task.tenant_id,
                &task.user_handle,
                self.store
                    .find_active_session(task.tenant_id, &task.user_handle)
                    .await?
                    .map(|s| s.id)
                    .unwrap_or(task.id),
                None,
                crate::store::MessageDirection::Outbound,
                reply,
            )
            .await?;
        self.transport.send(&task.user_handle, reply).await?;
        Ok(())
    }

    async fn complete_success(&self, task: &ScheduledTask, reply: &str) -> anyhow::Result<()> {
        if task.is_one_time {
            self.store.complete_one_shot_task(task.id).await?;
            return Ok(());
        }
        let cron_expr = task
            .cron_expr
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("recurring task {} missing cron_expr", task.id))?;
        let tz: chrono_tz::Tz = task
            .timezone
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid timezone {}", task.timezone))?;
        let next_run_at = crate::schedule_parser::next_fire(cron_expr, tz, Utc::now())?;
        let plan = crate::store::rolling_last5(&task.previous_outputs(), reply);
        self.store
            .complete_recurring_task(task.id, next_run_at, plan)
            .await?;
        Ok(())
    }

    async fn complete_failure(&self, task: &ScheduledTask) -> anyhow::Result<()> {
        let new_error_count = task.error_count + 1;

        if new_error_count == 1 {
            let _ = self
                .deliver(task, "Sorry, I ran into a problem running that task. I'll try again.")
                .await;
        }

        if new_error_count >= MAX_ERROR_COUNT {
            let prefix: String = task.task_prompt.chars().take(30).collect();
            let _ = self
                .deliver(
                    task,
                    &format!("I've disabled the scheduled task \"{prefix}\" after repeated failures."),
                )
                .await;
            self.store.fail_task(task.id, new_error_count, task.next_run_at, false).await?;
            return Ok(());
        }

        let next_run_at = if task.is_one_time {
            Utc::now() + chrono::Duration::minutes(1)
        } else {
            let cron_expr = task
                .cron_expr
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("recurring task {} missing cron_expr", task.id))?;
            let tz: chrono_tz::Tz = task
                .timezone
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid timezone {}", task.timezone))?;
            crate::schedule_parser::next_fire(cron_expr, tz, Utc::now())?
        };

        self.store
            .fail_task(task.id, new_error_count, next_run_at, true)
            .await?;
        Ok(())
    }

    /// Requests graceful shutdown: no new tasks are claimed, and this waits
    /// up to 30s for in-flight executions to finish. `force=true` returns
    /// immediately without waiting.
    pub async fn stop(&self, force: bool) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if force {
            return;
        }
        let wait = tokio::time::timeout(Duration::from_secs(SHUTDOWN_DRAIN_SECS), self.drained.notified());
        if wait.await.is_err() {
            warn!("scheduler shutdown drain timed out after {}s", SHUTDOWN_DRAIN_SECS);
        }
        info!("scheduler drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::FakeAssistantProcess;
    use crate::lock::FakeAdvisoryLock;
    use crate::message_processor::MessageProcessor;
    use crate::session_pool::SessionPool;
    use crate::store::fake::InMemoryStore;
    use crate::store::{NewScheduledTask, TaskType, Tenant, TenantStatus};
    use crate::transport::FakeTransport;
    use std::time::Duration as StdDuration;

    async fn setup() -> (Arc<Scheduler>, Arc<InMemoryStore>, Arc<FakeTransport>, Uuid) {
        setup_with(FakeAssistantProcess::new().with_response("SCHEDULED REMINDER\nCall Mom", "Don't forget to call Mom!")).await
    }

    async fn setup_with(assistant: FakeAssistantProcess) -> (Arc<Scheduler>, Arc<InMemoryStore>, Arc<FakeTransport>, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let tenant_id = Uuid::new_v4();
        store.seed_tenant(Tenant {
            id: tenant_id,
            status: TenantStatus::Active,
            messaging_channel: "sms".to_string(),
            onboarding_status: "READY".to_string(),
        });
        let session_pool = Arc::new(SessionPool::new(Arc::new(assistant), StdDuration::from_secs(900), false));
        let transport = Arc::new(FakeTransport::new());
        let processor = Arc::new(MessageProcessor::new(store.clone(), session_pool, transport.clone(), 4096));
        let lock = Arc::new(FakeAdvisoryLock::new());
        let scheduler = Arc::new(Scheduler::new(store.clone(), lock, processor, transport.clone()));
        (scheduler, store, transport, tenant_id)
    }

    #[tokio::test]
    async fn one_shot_task_delivers_and_is_deleted() {
        let (scheduler, store, transport, tenant_id) = setup().await;
        let task = store
            .insert_scheduled_task(NewScheduledTask {
                tenant_id,
                user_handle: "alice".to_string(),
                task_prompt: "Call Mom".to_string(),
                task_type: TaskType::Reminder,
                timezone: "UTC".to_string(),
                cron_expr: None,
                run_at: Some(Utc::now()),
                is_one_time: true,
                next_run_at: Utc::now() - chrono::Duration::seconds(1),
            })
            .await
            .unwrap();

        scheduler.tick().await;

        assert!(store.get_scheduled_task(task.id).await.unwrap().is_none());
        assert_eq!(transport.sent_messages().last().unwrap().1, "Don't forget to call Mom!");
    }

    #[tokio::test]
    async fn recurring_task_fails_three_times_then_disables() {
        let (scheduler, store, transport, tenant_id) =
            setup_with(FakeAssistantProcess::new().with_always_fail()).await;
        let task = store
            .insert_scheduled_task(NewScheduledTask {
                tenant_id,
                user_handle: "bob".to_string(),
                task_prompt: "unanswerable prompt".to_string(),
                task_type: TaskType::Execute,
                timezone: "UTC".to_string(),
                cron_expr: Some("0 * * * * *".to_string()),
                run_at: None,
                is_one_time: false,
                next_run_at: Utc::now() - chrono::Duration::seconds(1),
            })
            .await
            .unwrap();

        scheduler.tick().await;
        let after_first = store.get_scheduled_task(task.id).await.unwrap().unwrap();
        assert_eq!(after_first.error_count, 1);
        assert!(after_first.enabled);

        store.force_next_run_at(task.id, Utc::now() - chrono::Duration::seconds(1));
        scheduler.tick().await;
        let after_second = store.get_scheduled_task(task.id).await.unwrap().unwrap();
        assert_eq!(after_second.error_count, 2);
        assert!(after_second.enabled);

        store.force_next_run_at(task.id, Utc::now() - chrono::Duration::seconds(1));
        scheduler.tick().await;
        let after_third = store.get_scheduled_task(task.id).await.unwrap().unwrap();
        assert_eq!(after_third.error_count, 3);
        assert!(!after_third.enabled);

        let sent = transport.sent_messages();
        assert!(sent[0].1.contains("problem"), "first-failure apology expected");
        assert!(sent.last().unwrap().1.contains("disabled"), "disabled-notice expected");
    }
}
