//! Backend variant that proxies to a remote managed inference service.
//!
//! The service speaks an SSE-style stream: each line is `data: {json}` with
//! a tagged event. Sessions are native server-side threads; the first event
//! of a new conversation carries the session token, which we store in the
//! registry and resume on later queries for the same key.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_config::RemoteProviderConfig;

use crate::provider::{Provider, ProviderEvent, QueryRequest};
use crate::session::{SessionKey, SessionRegistry};

pub struct RemoteProvider {
    config: RemoteProviderConfig,
    client: reqwest::Client,
    sessions: Arc<SessionRegistry>,
    model: RwLock<String>,
    inflight: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

/// Wire events as the service frames them. Some backends re-announce tool
/// calls and send cumulative text snapshots; normalization happens on our
/// side of the seam.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    SessionCreated { session: String },
    TextDelta { text: String },
    /// Cumulative snapshot of all text so far.
    TextSnapshot { text: String },
    ThinkingDelta { text: String },
    ToolCall {
        id: String,
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
    Done,
}

/// Converts cumulative text snapshots into incremental deltas.
#[derive(Default)]
struct DeltaNormalizer {
    accumulated: String,
}

impl DeltaNormalizer {
    fn delta(&mut self, text: &str) {
        self.accumulated.push_str(text);
    }

    /// Returns the new suffix for a snapshot, or None if nothing is new.
    /// A snapshot that does not extend the accumulated text is stale and
    /// produces nothing.
    fn snapshot(&mut self, full: &str) -> Option<String> {
        if full.len() > self.accumulated.len() && full.starts_with(&self.accumulated) {
            let new = full[self.accumulated.len()..].to_string();
            self.accumulated = full.to_string();
            Some(new)
        } else {
            None
        }
    }
}

/// Parse one SSE line; returns None for keep-alives and non-data lines.
fn parse_sse_line(line: &str) -> Option<WireEvent> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match serde_json::from_str(data) {
        Ok(ev) => Some(ev),
        Err(e) => {
            warn!("Skipping malformed stream event: {e}");
            None
        }
    }
}

impl RemoteProvider {
    pub fn new(
        config: RemoteProviderConfig,
        model: String,
        sessions: Arc<SessionRegistry>,
    ) -> Result<Self> {
        let model = if model.is_empty() {
            config.models.first().cloned().unwrap_or_default()
        } else {
            model
        };
        Ok(Self {
            config,
            client: reqwest::Client::new(),
            sessions,
            model: RwLock::new(model),
            inflight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn api_key(&self) -> Option<String> {
        self.config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("TETHER_API_KEY").ok().filter(|k| !k.is_empty()))
    }
}

#[async_trait]
impl Provider for RemoteProvider {
    fn name(&self) -> &str {
        "remote"
    }

    async fn query(&self, request: QueryRequest) -> Result<mpsc::Receiver<ProviderEvent>> {
        let key = request.session_key.to_string();
        let token = self.sessions.backend_token(&request.session_key).await;
        let model = match request.model {
            Some(m) => m,
            None => self.model.read().await.clone(),
        };

        let mut body = serde_json::json!({
            "input": request.prompt,
            "model": model,
            "stream": true,
        });
        if let Some(ref t) = token {
            body["session"] = serde_json::Value::String(t.clone());
        }
        if let Some(ref sys) = request.system_prompt {
            body["system"] = serde_json::Value::String(sys.clone());
        }
        if let Some(ref image) = request.image {
            use base64::Engine;
            body["image"] = serde_json::json!({
                "mimeType": image.mime_type,
                "data": base64::engine::general_purpose::STANDARD.encode(&image.bytes),
            });
        }

        let mut req = self
            .client
            .post(format!("{}/v1/messages/stream", self.config.api_base))
            .json(&body);
        if let Some(api_key) = self.api_key() {
            req = req.bearer_auth(api_key);
        }
        let response = req
            .send()
            .await
            .context("failed to reach inference service")?
            .error_for_status()
            .context("inference service rejected the request")?;

        let cancel = CancellationToken::new();
        self.inflight.lock().await.insert(key.clone(), cancel.clone());

        let (tx, rx) = mpsc::channel(32);
        let sessions = self.sessions.clone();
        let session_key = request.session_key.clone();
        let inflight = self.inflight.clone();
        let inflight_key = key;

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut normalizer = DeltaNormalizer::default();
            let mut seen_tool_ids: HashSet<String> = HashSet::new();
            let mut terminal_sent = false;

            'read: loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(ProviderEvent::Aborted).await;
                        terminal_sent = true;
                        break 'read;
                    }
                    chunk = stream.next() => chunk,
                };

                let bytes = match chunk {
                    Some(Ok(b)) => b,
                    Some(Err(e)) => {
                        let _ = tx.send(ProviderEvent::Error(e.to_string())).await;
                        terminal_sent = true;
                        break 'read;
                    }
                    None => break 'read,
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);

                    let Some(wire) = parse_sse_line(&line) else {
                        continue;
                    };
                    let event = match wire {
                        WireEvent::SessionCreated { session } => {
                            debug!("Backend session {session} assigned");
                            sessions.set_backend_token(&session_key, session).await;
                            continue;
                        }
                        WireEvent::TextDelta { text } => {
                            normalizer.delta(&text);
                            ProviderEvent::TextDelta(text)
                        }
                        WireEvent::TextSnapshot { text } => match normalizer.snapshot(&text) {
                            Some(delta) => ProviderEvent::TextDelta(delta),
                            None => continue,
                        },
                        WireEvent::ThinkingDelta { text } => ProviderEvent::Thinking(text),
                        WireEvent::ToolCall { id, name, arguments } => {
                            if !seen_tool_ids.insert(id) {
                                continue;
                            }
                            ProviderEvent::ToolStart { name, arguments }
                        }
                        WireEvent::ToolResult { name, output } => {
                            ProviderEvent::ToolResult { name, output }
                        }
                        WireEvent::ApprovalRequired { id, tool, detail } => {
                            ProviderEvent::ApprovalRequest { id, tool, detail }
                        }
                        WireEvent::Error { message } => ProviderEvent::Error(message),
                        WireEvent::Done => ProviderEvent::Done,
                    };

                    let is_terminal = event.is_terminal();
                    if tx.send(event).await.is_err() {
                        break 'read;
                    }
                    if is_terminal {
                        terminal_sent = true;
                        break 'read;
                    }
                }
            }

            // A stream that just stops is still terminated for the caller.
            if !terminal_sent {
                let _ = tx.send(ProviderEvent::Done).await;
            }
            inflight.lock().await.remove(&inflight_key);
        });

        Ok(rx)
    }

    async fn abort(&self, session_key: &SessionKey) -> bool {
        let mut inflight = self.inflight.lock().await;
        match inflight.remove(&session_key.to_string()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
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
        let mut req = self
            .client
            .post(format!("{}/v1/approvals", self.config.api_base))
            .json(&serde_json::json!({
                "session": token,
                "id": request_id,
                "approved": approved,
            }));
        if let Some(api_key) = self.api_key() {
            req = req.bearer_auth(api_key);
        }
        req.send()
            .await
            .context("failed to deliver approval decision")?
            .error_for_status()
            .context("inference service rejected the approval decision")?;
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_normalizes_to_incremental_deltas() {
        let mut n = DeltaNormalizer::default();
        assert_eq!(n.snapshot("Hello"), Some("Hello".into()));
        assert_eq!(n.snapshot("Hello, wor"), Some(", wor".into()));
        assert_eq!(n.snapshot("Hello, world"), Some("ld".into()));
        // Stale or repeated snapshot yields nothing
        assert_eq!(n.snapshot("Hello, world"), None);
        assert_eq!(n.snapshot("Hello"), None);
    }

    #[test]
    fn snapshots_mix_with_true_deltas() {
        let mut n = DeltaNormalizer::default();
        n.delta("Hi");
        assert_eq!(n.snapshot("Hi there"), Some(" there".into()));
    }

    #[test]
    fn sse_lines_parse_and_skip_noise() {
        assert!(parse_sse_line(": keep-alive").is_none());
        assert!(parse_sse_line("data: ").is_none());
        assert!(parse_sse_line("data: [DONE]").is_none());
        assert!(parse_sse_line("data: {not json").is_none());

        let ev = parse_sse_line(r#"data: {"type":"text_delta","text":"hi"}"#).unwrap();
        assert!(matches!(ev, WireEvent::TextDelta { text } if text == "hi"));

        let ev = parse_sse_line(
            r#"data: {"type":"approval_required","id":"a1","tool":"exec","detail":"rm -rf"}"#,
        )
        .unwrap();
        assert!(matches!(ev, WireEvent::ApprovalRequired { id, .. } if id == "a1"));
    }

    #[test]
    fn tool_calls_parse_without_arguments() {
        let ev = parse_sse_line(r#"data: {"type":"tool_call","id":"t1","name":"exec"}"#).unwrap();
        match ev {
            WireEvent::ToolCall { id, name, arguments } => {
                assert_eq!(id, "t1");
                assert_eq!(name, "exec");
                assert!(arguments.is_null());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn abort_with_nothing_active_returns_false() {
        let provider = RemoteProvider::new(
            RemoteProviderConfig::default(),
            "m".into(),
            Arc::new(SessionRegistry::new()),
        )
        .unwrap();
        let key = SessionKey::new("tether", "tg", "1");
        assert!(!provider.abort(&key).await);
    }

    #[tokio::test]
    async fn set_model_validates_against_catalog() {
        let config = RemoteProviderConfig {
            models: vec!["alpha".into(), "beta".into()],
            ..Default::default()
        };
        let provider =
            RemoteProvider::new(config, String::new(), Arc::new(SessionRegistry::new())).unwrap();
        assert_eq!(provider.model().await, "alpha");
        provider.set_model("beta").await.unwrap();
        assert_eq!(provider.model().await, "beta");
        assert!(provider.set_model("gamma").await.is_err());
    }
}
