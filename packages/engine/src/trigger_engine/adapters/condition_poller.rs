//! Polls active `CONDITION` triggers on a fixed cadence, evaluating a fixed
//! comparison grammar against a fetched value (C10). Structured like the
//! scheduler's tick loop (`tokio::time::interval` + `AtomicBool` guard), but
//! owns its own in-memory edge-detection state rather than sharing the
//! scheduler's `isRunning` flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use reqwest::Client;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::store::{Store, Trigger};
use crate::trigger_engine::{TriggerEngine, TriggerEvent, TriggerEventPayload};

const TICK_INTERVAL_SECS: u64 = 60;
const FETCH_TIMEOUT_SECS: u64 = 30;
const MIN_POLL_INTERVAL_MINUTES: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, PartialEq)]
enum Rhs {
    Number(f64),
    Bool(bool),
    Str(String),
}

/// Parses `<left> <op> <right>` per spec §4.10. No `eval` of any kind: this
/// is a fixed three-token grammar, not a scripting language.
fn parse_expression(expr: &str) -> Option<(Op, Rhs)> {
    let expr = expr.trim();
    const OPS: &[(&str, Op)] = &[
        ("<=", Op::Le),
        (">=", Op::Ge),
        ("==", Op::Eq),
        ("!=", Op::Ne),
        ("<", Op::Lt),
        (">", Op::Gt),
        ("contains", Op::Contains),
        ("startsWith", Op::StartsWith),
        ("endsWith", Op::EndsWith),
    ];
    for (token, op) in OPS {
        if let Some(idx) = expr.find(token) {
            let rhs_raw = expr[idx + token.len()..].trim();
            let rhs = parse_rhs(rhs_raw)?;
            return Some((*op, rhs));
        }
    }
    None
}

fn parse_rhs(raw: &str) -> Option<Rhs> {
    let raw = raw.trim();
    if raw == "true" {
        return Some(Rhs::Bool(true));
    }
    if raw == "false" {
        return Some(Rhs::Bool(false));
    }
    if let Some(stripped) = raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Some(Rhs::Str(stripped.to_string()));
    }
    if let Some(stripped) = raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return Some(Rhs::Str(stripped.to_string()));
    }
    if let Ok(n) = raw.parse::<f64>() {
        return Some(Rhs::Number(n));
    }
    None
}

/// Evaluates `left op right` against the extracted value. String ops
/// (`contains`/`startsWith`/`endsWith`) coerce `left` to its string form;
/// numeric ops require `left` to parse as a number.
fn evaluate(left: &serde_json::Value, op: Op, rhs: &Rhs) -> bool {
    match op {
        Op::Contains | Op::StartsWith | Op::EndsWith => {
            let left_str = value_as_string(left);
            let Rhs::Str(needle) = rhs else { return false };
            match op {
                Op::Contains => left_str.contains(needle.as_str()),
                Op::StartsWith => left_str.starts_with(needle.as_str()),
                Op::EndsWith => left_str.ends_with(needle.as_str()),
                _ => unreachable!(),
            }
        }
        Op::Eq | Op::Ne => {
            let equal = match rhs {
                Rhs::Bool(b) => left.as_bool() == Some(*b),
                Rhs::Number(n) => left.as_f64() == Some(*n),
                Rhs::Str(s) => value_as_string(left) == *s,
            };
            if op == Op::Eq {
                equal
            } else {
                !equal
            }
        }
        Op::Lt | Op::Gt | Op::Le | Op::Ge => {
            let (Some(left_n), Rhs::Number(right_n)) = (left.as_f64(), rhs) else {
                return false;
            };
            match op {
                Op::Lt => left_n < *right_n,
                Op::Gt => left_n > *right_n,
                Op::Le => left_n <= *right_n,
                Op::Ge => left_n >= *right_n,
                _ => unreachable!(),
            }
        }
    }
}

fn value_as_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct ConditionPoller {
    store: Arc<dyn Store>,
    engine: Arc<TriggerEngine>,
    http: Client,
    /// Last observed edge-detection state per trigger, kept in memory only
    /// (per Design Notes §9 — this is a noise suppressor, not correctness).
    last_state: DashMap<Uuid, bool>,
    /// Most recent extracted value and raw response body per trigger, read
    /// back by `fire` to build the event payload.
    last_fetch: DashMap<Uuid, (serde_json::Value, serde_json::Value)>,
    running: AtomicBool,
}

impl ConditionPoller {
    pub fn new(store: Arc<dyn Store>, engine: Arc<TriggerEngine>) -> Self {
        Self {
            store,
            engine,
            http: Client::builder()
                .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
                .build()
                .expect("failed to build condition poller http client"),
            last_state: DashMap::new(),
            last_fetch: DashMap::new(),
            running: AtomicBool::new(false),
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SECS));
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    pub async fn tick(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let now = Utc::now();
        match self.store.find_due_condition_triggers(now).await {
            Ok(triggers) => {
                for trigger in triggers {
                    self.poll_one(trigger, now).await;
                }
            }
            Err(err) => error!(err = %err, "failed to load due condition triggers"),
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn poll_one(&self, trigger: Trigger, now: chrono::DateTime<Utc>) {
        let poll_minutes = trigger
            .config
            .get("poll_interval_minutes")
            .and_then(|v| v.as_i64())
            .unwrap_or(MIN_POLL_INTERVAL_MINUTES)
            .max(MIN_POLL_INTERVAL_MINUTES);
        let next_check = now + chrono::Duration::minutes(poll_minutes);
        // Rescheduled unconditionally, success or failure, so a failing
        // data source can't spin the poller hot (spec §4.10).
        if let Err(err) = self.store.set_trigger_next_check(trigger.id, next_check).await {
            error!(trigger = %trigger.id, err = %err, "failed to reschedule condition trigger");
        }

        match self.fetch_and_evaluate(&trigger).await {
            Ok(Some(fired)) => {
                if fired {
                    self.fire(&trigger).await;
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(trigger = %trigger.id, err = %err, "condition evaluation failed");
            }
        }
    }

    async fn fetch_and_evaluate(&self, trigger: &Trigger) -> anyhow::Result<Option<bool>> {
        let config = &trigger.config;
        let data_source = config
            .get("data_source")
            .ok_or_else(|| anyhow::anyhow!("missing config.data_source"))?;
        let url = data_source
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing config.data_source.url"))?;
        let method = data_source
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();

        let mut request = match method.as_str() {
            "POST" => self.http.post(url),
            _ => self.http.get(url),
        };
        if let Some(body) = data_source.get("body") {
            request = request.json(body);
        }
        let response = request.send().await?;
        let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);

        let condition = config
            .get("condition")
            .ok_or_else(|| anyhow::anyhow!("missing config.condition"))?;
        let extract_path = condition
            .get("extract_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing config.condition.extract_path"))?;
        let expression = condition
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing config.condition.expression"))?;

        let extracted = crate::template::extract_path(&body, extract_path)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let (op, rhs) =
            parse_expression(expression).ok_or_else(|| anyhow::anyhow!("unparseable condition expression"))?;
        let raw_result = evaluate(&extracted, op, &rhs);

        let edge_only = config
            .get("trigger_on_change_only")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        self.last_fetch.insert(trigger.id, (extracted, body));

        if !edge_only {
            return Ok(Some(raw_result));
        }

        let previous = self.last_state.insert(trigger.id, raw_result);
        let fired = raw_result && previous != Some(true);
        Ok(Some(fired))
    }

    async fn fire(&self, trigger: &Trigger) {
        let (extracted, body) = self
            .last_fetch
            .get(&trigger.id)
            .map(|entry| entry.value().clone())
            .unwrap_or((serde_json::Value::Null, serde_json::Value::Null));

        let event = TriggerEvent {
            trigger_id: trigger.id,
            tenant_id: trigger.tenant_id,
            user_handle: trigger.user_handle.clone(),
            payload: TriggerEventPayload {
                source: "condition".to_string(),
                data: extracted,
                metadata: serde_json::json!({ "originalPayload": body }),
            },
        };
        info!(trigger = %trigger.id, "condition trigger fired");
        if let Err(err) = self.engine.handle(event).await {
            warn!(trigger = %trigger.id, err = %err, "condition-triggered execution failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_greater_than() {
        let (op, rhs) = parse_expression("value > 10").unwrap();
        assert_eq!(op, Op::Gt);
        assert_eq!(rhs, Rhs::Number(10.0));
    }

    #[test]
    fn parses_quoted_string_equality() {
        let (op, rhs) = parse_expression("status == \"ready\"").unwrap();
        assert_eq!(op, Op::Eq);
        assert_eq!(rhs, Rhs::Str("ready".to_string()));
    }

    #[test]
    fn evaluates_contains() {
        let (op, rhs) = parse_expression("value contains \"err\"").unwrap();
        assert!(evaluate(&serde_json::json!("an error occurred"), op, &rhs));
    }

    #[test]
    fn edge_detection_sequence_fires_once() {
        let values = [5, 5, 5];
        let mut last = None;
        let mut fires = 0;
        for v in values {
            let result = v > 3;
            let fired = result && last != Some(true);
            if fired {
                fires += 1;
            }
            last = Some(result);
        }
        assert_eq!(fires, 1);
    }

    #[test]
    fn edge_detection_full_sequence_fires_twice() {
        let values = [5, 8, 12, 15, 3, 20];
        let mut last = None;
        let mut fires = 0;
        for v in values {
            let result = v > 10;
            let fired = result && last != Some(true);
            if fired {
                fires += 1;
            }
            last = Some(result);
        }
        assert_eq!(fires, 2);
    }
}
