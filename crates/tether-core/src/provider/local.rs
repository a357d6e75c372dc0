//! Backend variant that owns a local long-running server process and drives
//! it over a line-delimited JSON session protocol on stdin/stdout.
//!
//! Requests go down stdin as `{"op": ..., "session": ...}` lines; the
//! process answers with tagged event lines carrying the session id, which a
//! single reader task routes to the per-query event stream.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

use tether_config::LocalProviderConfig;

use crate::provider::{Provider, ProviderEvent, QueryRequest};
use crate::session::{SessionKey, SessionRegistry};

type Routes = Arc<Mutex<HashMap<String, mpsc::Sender<ProviderEvent>>>>;

pub struct LocalProvider {
    config: LocalProviderConfig,
    sessions: Arc<SessionRegistry>,
    model: RwLock<String>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    routes: Routes,
    child: Mutex<Option<Child>>,
}

#[derive(Debug, Deserialize)]
struct ServerLine {
    session: String,
    #[serde(flatten)]
    event: LocalWireEvent,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LocalWireEvent {
    TextDelta { text: String },
    ThinkingDelta { text: String },
    ToolCall {
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    ToolResult {
        name: String,
        #[serde(default)]
        output: String,
    },
    ApprovalRequired {
        id: String,
        tool: String,
        #[serde(default)]
        detail: String,
    },
    Error { message: String },
    Aborted,
    Done,
}

/// Parse one stdout line into (backend session id, normalized event).
fn parse_server_line(line: &str) -> Option<(String, ProviderEvent)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let parsed: ServerLine = match serde_json::from_str(line) {
        Ok(p) => p,
        Err(e) => {
            warn!("Skipping malformed server line: {e}");
            return None;
        }
    };
    let event = match parsed.event {
        LocalWireEvent::TextDelta { text } => ProviderEvent::TextDelta(text),
        LocalWireEvent::ThinkingDelta { text } => ProviderEvent::Thinking(text),
        LocalWireEvent::ToolCall { name, arguments } => {
            ProviderEvent::ToolStart { name, arguments }
        }
        LocalWireEvent::ToolResult { name, output } => ProviderEvent::ToolResult { name, output },
        LocalWireEvent::ApprovalRequired { id, tool, detail } => {
            ProviderEvent::ApprovalRequest { id, tool, detail }
        }
        LocalWireEvent::Error { message } => ProviderEvent::Error(message),
        LocalWireEvent::Aborted => ProviderEvent::Aborted,
        LocalWireEvent::Done => ProviderEvent::Done,
    };
    Some((parsed.session, event))
}

impl LocalProvider {
    pub fn new(
        config: LocalProviderConfig,
        model: String,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        let model = if model.is_empty() {
            config.models.first().cloned().unwrap_or_default()
        } else {
            model
        };
        Self {
            config,
            sessions,
            model: RwLock::new(model),
            stdin: Arc::new(Mutex::new(None)),
            routes: Arc::new(Mutex::new(HashMap::new())),
            child: Mutex::new(None),
        }
    }

    /// Spawn the server process if it is not already running.
    async fn ensure_started(&self) -> Result<()> {
        let mut stdin_slot = self.stdin.lock().await;
        if stdin_slot.is_some() {
            return Ok(());
        }
        if self.config.command.is_empty() {
            anyhow::bail!("local provider has no command configured");
        }

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch '{}'", self.config.command))?;

        let stdin = child
            .stdin
            .take()
            .context("server process has no stdin")?;
        let stdout = child
            .stdout
            .take()
            .context("server process has no stdout")?;
        *stdin_slot = Some(stdin);
        *self.child.lock().await = Some(child);
        info!("Launched local backend: {}", self.config.command);

        let routes = self.routes.clone();
        let stdin_for_reader = self.stdin.clone();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Some((session, event)) = parse_server_line(&line) else {
                    continue;
                };
                let terminal = event.is_terminal();
                let tx = routes.lock().await.get(&session).cloned();
                match tx {
                    Some(tx) => {
                        if tx.send(event).await.is_err() || terminal {
                            routes.lock().await.remove(&session);
                        }
                    }
                    None => warn!("Event for unknown session {session}"),
                }
            }

            // Process went away: fail every open stream, drop the session
            // tokens it owned, and force a respawn on the next query.
            warn!("Local backend process exited");
            stdin_for_reader.lock().await.take();
            sessions.clear_backend_tokens().await;
            let mut routes = routes.lock().await;
            for (_, tx) in routes.drain() {
                let _ = tx
                    .send(ProviderEvent::Error("backend process exited".into()))
                    .await;
            }
        });

        Ok(())
    }

    async fn send_line(&self, value: serde_json::Value) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let writer = stdin
            .as_mut()
            .context("local backend is not running")?;
        let mut line = serde_json::to_vec(&value)?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .context("failed to write to backend process")?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn query(&self, request: QueryRequest) -> Result<mpsc::Receiver<ProviderEvent>> {
        self.ensure_started().await?;

        // Resume the backend session for this key, or open a fresh one.
        let token = match self.sessions.backend_token(&request.session_key).await {
            Some(t) => t,
            None => {
                let token = format!("s-{}", &uuid::Uuid::new_v4().to_string()[..8]);
                self.send_line(serde_json::json!({
                    "op": "open",
                    "session": token,
                }))
                .await?;
                self.sessions
                    .set_backend_token(&request.session_key, token.clone())
                    .await;
                token
            }
        };

        let model = match request.model {
            Some(m) => m,
            None => self.model.read().await.clone(),
        };

        let (tx, rx) = mpsc::channel(32);
        self.routes.lock().await.insert(token.clone(), tx);

        let mut msg = serde_json::json!({
            "op": "query",
            "session": token,
            "prompt": request.prompt,
            "model": model,
        });
        if let Some(ref sys) = request.system_prompt {
            msg["system"] = serde_json::Value::String(sys.clone());
        }
        if let Some(ref image) = request.image {
            use base64::Engine;
            msg["image"] = serde_json::json!({
                "mimeType": image.mime_type,
                "data": base64::engine::general_purpose::STANDARD.encode(&image.bytes),
            });
        }
        if let Err(e) = self.send_line(msg).await {
            self.routes.lock().await.remove(&token);
            return Err(e);
        }
        Ok(rx)
    }

    async fn abort(&self, session_key: &SessionKey) -> bool {
        let Some(token) = self.sessions.backend_token(session_key).await else {
            return false;
        };
        let active = self.routes.lock().await.contains_key(&token);
        if !active {
            return false;
        }
        let msg = serde_json::json!({ "op": "abort", "session": token });
        if self.send_line(msg).await.is_err() {
            // Process is gone; terminate the stream ourselves so the
            // coordinator is never left waiting.
            if let Some(tx) = self.routes.lock().await.remove(&token) {
                let _ = tx.send(ProviderEvent::Aborted).await;
            }
        }
        true
    }

    async fn resolve_approval(
        &self,
        session_key: &SessionKey,
        request_id: &str,
        approved: bool,
    ) -> Result<()> {
        let token = self
            .sessions
            .backend_token(session_key)
            .await
            .context("no backend session to resolve an approval for")?;
        self.send_line(serde_json::json!({
            "op": "approval",
            "session": token,
            "id": request_id,
            "approved": approved,
        }))
        .await
    }

    fn available_models(&self) -> Vec<String> {
        self.config.models.clone()
    }

    async fn model(&self) -> String {
        self.model.read().await.clone()
    }

    async fn set_model(&self, id: &str) -> Result<()> {
        if !self.config.models.is_empty() && !self.config.models.iter().any(|m| m == id) {
            anyhow::bail!(
                "unknown model '{id}' (available: {})",
                self.config.models.join(", ")
            );
        }
        *self.model.write().await = id.to_string();
        Ok(())
    }
}
