//! Web channel: a minimal HTTP surface for browser or script clients.
//!
//! Clients POST messages in and poll a per-chat outbox for replies. The
//! routes are mounted on the gateway's HTTP server rather than a separate
//! listener.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use tether_config::WebChannelConfig;
use tether_core::bus::{InboundMessage, OutboundMessage};

use crate::base::Channel;

/// Replies kept per chat until the client polls them.
const OUTBOX_CAP: usize = 100;

pub struct WebChannel {
    config: WebChannelConfig,
    inbound_tx: Arc<Mutex<Option<mpsc::Sender<InboundMessage>>>>,
    outbox: Arc<Mutex<HashMap<String, VecDeque<OutboxEntry>>>>,
}

#[derive(Clone)]
struct AppState {
    allow_from: Vec<String>,
    inbound_tx: Arc<Mutex<Option<mpsc::Sender<InboundMessage>>>>,
    outbox: Arc<Mutex<HashMap<String, VecDeque<OutboxEntry>>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub content: String,
    pub timestamp: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostBody {
    chat_id: String,
    #[serde(default)]
    sender_id: String,
    content: String,
}

impl WebChannel {
    pub fn new(config: WebChannelConfig) -> Self {
        Self {
            config,
            inbound_tx: Arc::new(Mutex::new(None)),
            outbox: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Routes to mount on the gateway HTTP server.
    pub fn router(&self) -> Router {
        let state = AppState {
            allow_from: self.config.allow_from.clone(),
            inbound_tx: self.inbound_tx.clone(),
            outbox: self.outbox.clone(),
        };
        Router::new()
            .route("/web/messages", post(post_message))
            .route("/web/messages/{chat_id}", get(poll_messages))
            .with_state(state)
    }
}

#[async_trait]
impl Channel for WebChannel {
    fn name(&self) -> &str {
        "web"
    }

    async fn start(&self, inbound_tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        *self.inbound_tx.lock().await = Some(inbound_tx);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.inbound_tx.lock().await = None;
        self.outbox.lock().await.clear();
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let mut outbox = self.outbox.lock().await;
        let queue = outbox.entry(msg.chat_id.clone()).or_default();
        if queue.len() >= OUTBOX_CAP {
            warn!("Web outbox for chat {} full, dropping oldest", msg.chat_id);
            queue.pop_front();
        }
        queue.push_back(OutboxEntry {
            content: msg.content.clone(),
            timestamp: chrono::Local::now().to_rfc3339(),
        });
        Ok(())
    }

    fn is_allowed(&self, sender_id: &str) -> bool {
        self.config.allow_from.is_empty() || self.config.allow_from.iter().any(|a| a == sender_id)
    }

    fn is_connected(&self) -> bool {
        // Routes are served as soon as start() ran
        self.inbound_tx.try_lock().map(|g| g.is_some()).unwrap_or(false)
    }
}

async fn post_message(State(state): State<AppState>, Json(body): Json<PostBody>) -> StatusCode {
    if body.chat_id.is_empty() || body.content.trim().is_empty() {
        return StatusCode::BAD_REQUEST;
    }

    let sender_id = if body.sender_id.is_empty() {
        format!("web:{}", body.chat_id.chars().take(8).collect::<String>())
    } else {
        body.sender_id
    };

    if !state.allow_from.is_empty() && !state.allow_from.iter().any(|a| *a == sender_id) {
        warn!("Access denied for sender {sender_id} on web channel");
        return StatusCode::FORBIDDEN;
    }

    let tx = state.inbound_tx.lock().await.clone();
    let Some(tx) = tx else {
        return StatusCode::SERVICE_UNAVAILABLE;
    };

    debug!("Web message from {sender_id} for chat {}", body.chat_id);
    let inbound = InboundMessage::text("web", &sender_id, &body.chat_id, &body.content);
    match tx.send(inbound).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Drain and return all queued replies for a chat.
async fn poll_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Json<Vec<OutboxEntry>> {
    let mut outbox = state.outbox.lock().await;
    let entries = outbox
        .remove(&chat_id)
        .map(|q| q.into_iter().collect())
        .unwrap_or_default();
    Json(entries)
}
