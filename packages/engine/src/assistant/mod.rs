//! Wraps the assistant CLI subprocess behind a typed request/response API
//! (C4). Spawns one child process per call, frames NDJSON over its stdin and
//! stdout, and enforces a hard timeout — mirroring the registry-of-live-
//! handles and drain-on-shutdown pattern in the teacher's session manager,
//! generalized from one handle per chat session to one handle per in-flight
//! subprocess call.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::errors::AssistantError;

/// One line of the NDJSON request sent on the subprocess's stdin:
/// `{type:"user", message:{role:"user", content:[{type:"text", text}]}}`.
#[derive(Debug, Serialize)]
struct UserEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: UserMessage<'a>,
}

#[derive(Debug, Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Debug, Serialize)]
struct ContentBlock<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

impl<'a> UserEnvelope<'a> {
    fn text(prompt: &'a str) -> Self {
        Self {
            kind: "user",
            message: UserMessage {
                role: "user",
                content: vec![ContentBlock { kind: "text", text: prompt }],
            },
        }
    }
}

/// One line of the NDJSON stream read from the subprocess's stdout.
/// `system`/`init` marks readiness, `assistant` carries streamed content
/// that is ignored for the final reply, and `result` is the terminal event:
/// `subtype="success"` with `result` text, or `is_error=true` with an error
/// string.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AssistantEvent {
    System {
        subtype: Option<String>,
    },
    Assistant {},
    Result {
        subtype: Option<String>,
        #[serde(default)]
        is_error: bool,
        result: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[async_trait]
pub trait AssistantProcess: Send + Sync {
    /// Sends `prompt` to the assistant under `session_key`, resuming prior
    /// context when `resume` is true (a fresh session otherwise), and
    /// returns its final reply text.
    async fn call(&self, session_key: &str, resume: bool, prompt: &str) -> Result<String, AssistantError>;

    /// Forcibly terminates any subprocess running for `session_key`, if one
    /// is in flight. Used when a user sends `/cancel` or a session is
    /// evicted while a call is outstanding.
    async fn kill(&self, session_key: &str);
}

/// Spawns `program` once per call with `args` plus `--session-key <key>`
/// (and `--resume` when continuing a session), feeding the request on
/// stdin and reading NDJSON events from stdout until a terminal `result` or
/// `error` event arrives.
pub struct CliAssistantProcess {
    program: String,
    args: Vec<String>,
    call_timeout: Duration,
    live: DashMap<String, Arc<tokio::sync::Mutex<Child>>>,
}

impl CliAssistantProcess {
    pub fn new(program: impl Into<String>, args: Vec<String>, call_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            call_timeout,
            live: DashMap::new(),
        }
    }

    async fn run(&self, session_key: &str, resume: bool, prompt: &str) -> Result<String, AssistantError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--session-key")
            .arg(session_key)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if resume {
            command.arg("--resume");
        }

        let mut child = command
            .spawn()
            .map_err(|e| AssistantError::SpawnFailed(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AssistantError::SpawnFailed("no stdin handle".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AssistantError::SpawnFailed("no stdout handle".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AssistantError::SpawnFailed("no stderr handle".to_string()))?;

        let envelope = UserEnvelope::text(prompt);
        let mut line = serde_json::to_string(&envelope)
            .map_err(|e| AssistantError::ProtocolError(e.to_string()))?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AssistantError::ProtocolError(e.to_string()))?;
        drop(stdin);

        let handle = Arc::new(tokio::sync::Mutex::new(child));
        self.live.insert(session_key.to_string(), handle.clone());

        let captured_stderr = Arc::new(tokio::sync::Mutex::new(String::new()));
        let stderr_task = tokio::spawn({
            let captured_stderr = captured_stderr.clone();
            let session_key = session_key.to_string();
            async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(session_key = %session_key, "assistant stderr: {line}");
                    let mut buf = captured_stderr.lock().await;
                    buf.push_str(&line);
                    buf.push('\n');
                }
            }
        });

        let mut reader = BufReader::new(stdout).lines();
        let outcome = loop {
            match reader.next_line().await {
                Ok(Some(raw)) => {
                    if raw.trim().is_empty() {
                        continue;
                    }
                    let event: AssistantEvent = match serde_json::from_str(&raw) {
                        Ok(e) => e,
                        Err(e) => {
                            warn!(err = %e, line = %raw, "unparseable assistant event, ignoring");
                            continue;
                        }
                    };
                    match event {
                        AssistantEvent::System { subtype } => {
                            if subtype.as_deref() == Some("init") {
                                info!(session_key, "assistant session ready");
                            }
                            continue;
                        }
                        AssistantEvent::Assistant {} => continue,
                        AssistantEvent::Result { is_error, result, .. } if is_error => {
                            break Err(AssistantError::ProcessError(
                                result.unwrap_or_else(|| "unknown error".to_string()),
                            ))
                        }
                        AssistantEvent::Result { result, .. } => {
                            break Ok(result.unwrap_or_default())
                        }
                        AssistantEvent::Other => continue,
                    }
                }
                Ok(None) => break Err(AssistantError::UnexpectedEof),
                Err(e) => break Err(AssistantError::ProtocolError(e.to_string())),
            }
        };

        self.live.remove(session_key);
        let mut guard = handle.lock().await;
        let exit_status = match guard.try_wait() {
            Ok(status) => status,
            Err(_) => None,
        };
        if exit_status.is_none() {
            let _ = guard.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(3), guard.wait()).await;
        }
        drop(guard);
        let _ = stderr_task.await;
        let stderr_text = captured_stderr.lock().await.trim().to_string();

        match (outcome, exit_status) {
            (Err(_), Some(status)) if !status.success() && !stderr_text.is_empty() => {
                Err(AssistantError::ProcessError(stderr_text))
            }
            (other, _) => other,
        }
    }
}

#[async_trait]
impl AssistantProcess for CliAssistantProcess {
    async fn call(&self, session_key: &str, resume: bool, prompt: &str) -> Result<String, AssistantError> {
        match tokio::time::timeout(self.call_timeout, self.run(session_key, resume, prompt)).await {
            Ok(result) => result,
            Err(_) => {
                self.kill(session_key).await;
                Err(AssistantError::Timeout)
            }
        }
    }

    async fn kill(&self, session_key: &str) {
        if let Some((_, handle)) = self.live.remove(session_key) {
            let mut child = handle.lock().await;
            // SIGTERM first, give it a moment, then SIGKILL if it's still
            // around. `start_kill` on Unix sends SIGKILL directly through
            // tokio, so the grace period is approximated by polling `try_wait`
            // rather than sending a distinct signal.
            if let Err(e) = child.start_kill() {
                error!(session_key, err = %e, "failed to signal assistant subprocess");
                return;
            }
            let _ = tokio::time::timeout(Duration::from_secs(3), child.wait()).await;
        }
    }
}

/// Fake assistant for tests: returns canned responses keyed by the prompt
/// text, or an echo of the prompt when no canned response matches.
#[derive(Default)]
pub struct FakeAssistantProcess {
    responses: std::sync::Mutex<HashMap<String, String>>,
    calls: std::sync::Mutex<Vec<(String, bool, String)>>,
    always_fail: std::sync::atomic::AtomicBool,
}

impl FakeAssistantProcess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, prompt: impl Into<String>, reply: impl Into<String>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(prompt.into(), reply.into());
        self
    }

    /// Makes every future `call` return an `AssistantError::ProcessError`,
    /// for exercising error-count/disable paths in tests.
    pub fn with_always_fail(self) -> Self {
        self.always_fail.store(true, std::sync::atomic::Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<(String, bool, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AssistantProcess for FakeAssistantProcess {
    async fn call(&self, session_key: &str, resume: bool, prompt: &str) -> Result<String, AssistantError> {
        self.calls
            .lock()
            .unwrap()
            .push((session_key.to_string(), resume, prompt.to_string()));
        if self.always_fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AssistantError::ProcessError("boom".to_string()));
        }
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(prompt)
            .cloned()
            .unwrap_or_else(|| format!("echo: {prompt}")))
    }

    async fn kill(&self, _session_key: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_assistant_echoes_unknown_prompts() {
        let assistant = FakeAssistantProcess::new();
        let reply = assistant.call("s1", false, "hello").await.unwrap();
        assert_eq!(reply, "echo: hello");
    }

    #[tokio::test]
    async fn fake_assistant_returns_canned_response() {
        let assistant = FakeAssistantProcess::new().with_response("ping", "pong");
        let reply = assistant.call("s1", true, "ping").await.unwrap();
        assert_eq!(reply, "pong");
        assert_eq!(assistant.calls(), vec![("s1".to_string(), true, "ping".to_string())]);
    }
}
