//! Telegram channel implementation using teloxide.
//!
//! Long polling (no webhook or public IP needed), photo handling as
//! in-memory attachments, typing indicators while a run is in flight,
//! proxy support, and composite "id|username" allowlist matching.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{BotCommand, ChatAction, FileMeta, MediaKind, MessageKind};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use tether_config::TelegramConfig;
use tether_core::bus::{Attachment, InboundMessage, OutboundMessage};

use crate::base::Channel;

/// Telegram channel using long polling.
pub struct TelegramChannel {
    config: TelegramConfig,
    bot: Bot,
    connected: Arc<AtomicBool>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    typing_tasks: Arc<Mutex<HashMap<String, tokio::task::JoinHandle<()>>>>,
}

impl TelegramChannel {
    /// Create a new Telegram channel from config.
    pub fn new(config: TelegramConfig) -> Result<Self> {
        if config.token.is_empty() {
            return Err(anyhow::anyhow!("Telegram bot token not configured"));
        }

        // Build bot with optional proxy
        let bot = match config.proxy.as_deref() {
            Some(proxy_url) if !proxy_url.is_empty() => {
                let client = reqwest::Client::builder()
                    .proxy(reqwest::Proxy::all(proxy_url)?)
                    .build()?;
                Bot::with_client(&config.token, client)
            }
            _ => Bot::new(&config.token),
        };

        Ok(Self {
            config,
            bot,
            connected: Arc::new(AtomicBool::new(false)),
            shutdown_tx: Mutex::new(None),
            typing_tasks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Stop the typing indicator for a chat.
    async fn stop_typing(&self, chat_id_str: &str) {
        let mut tasks = self.typing_tasks.lock().await;
        if let Some(handle) = tasks.remove(chat_id_str) {
            handle.abort();
        }
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self, inbound_tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        info!("Starting Telegram bot (polling mode)...");

        let commands = vec![
            BotCommand::new("help", "Show available commands"),
            BotCommand::new("reset", "Start a fresh conversation"),
            BotCommand::new("status", "Agent, provider and session info"),
            BotCommand::new("stop", "Abort the active run"),
            BotCommand::new("model", "Show or change the model"),
            BotCommand::new("provider", "Show or change the backend"),
        ];
        if let Err(e) = self.bot.set_my_commands(commands).await {
            warn!("Failed to register bot commands: {e}");
        }

        match self.bot.get_me().await {
            Ok(me) => {
                info!(
                    "Telegram bot @{} connected",
                    me.username.as_deref().unwrap_or("unknown")
                );
                self.connected.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                error!("Failed to get bot info: {e}");
            }
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        {
            let mut tx_guard = self.shutdown_tx.lock().await;
            *tx_guard = Some(shutdown_tx);
        }

        let bot = self.bot.clone();
        let config = self.config.clone();
        let typing_tasks = self.typing_tasks.clone();

        // Delete webhook to ensure polling works
        if let Err(e) = bot.delete_webhook().await {
            warn!("Failed to delete webhook: {e}");
        }

        let handler = Update::filter_message().endpoint(
            move |bot: Bot, msg: Message, inbound_tx: mpsc::Sender<InboundMessage>| {
                let config = config.clone();
                let typing_tasks = typing_tasks.clone();
                async move {
                    handle_message(bot, msg, inbound_tx, config, typing_tasks).await;
                    respond(())
                }
            },
        );

        let mut dispatcher = Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![inbound_tx])
            .default_handler(|_upd| async {})
            .error_handler(LoggingErrorHandler::with_custom_text(
                "Error in telegram handler",
            ))
            .build();

        let shutdown_token = dispatcher.shutdown_token();
        let connected = self.connected.clone();
        tokio::spawn(async move {
            let _ = shutdown_rx.await;
            connected.store(false, Ordering::SeqCst);
            match shutdown_token.shutdown() {
                Ok(fut) => fut.await,
                Err(e) => warn!("Failed to shutdown dispatcher: {e:?}"),
            }
        });

        dispatcher.dispatch().await;

        self.connected.store(false, Ordering::SeqCst);
        info!("Telegram bot stopped");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("Stopping Telegram bot...");

        {
            let mut tasks = self.typing_tasks.lock().await;
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }

        let mut tx_guard = self.shutdown_tx.lock().await;
        if let Some(tx) = tx_guard.take() {
            let _ = tx.send(());
        }

        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        self.stop_typing(&msg.chat_id).await;

        let chat_id: i64 = msg
            .chat_id
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid chat_id: {}", msg.chat_id))?;

        if let Err(e) = self.bot.send_message(ChatId(chat_id), &msg.content).await {
            error!("Error sending Telegram message: {e}");
            return Err(e.into());
        }
        Ok(())
    }

    fn is_allowed(&self, sender_id: &str) -> bool {
        is_sender_allowed(sender_id, &self.config.allow_from)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Handle an incoming Telegram message.
async fn handle_message(
    bot: Bot,
    msg: Message,
    inbound_tx: mpsc::Sender<InboundMessage>,
    config: TelegramConfig,
    typing_tasks: Arc<Mutex<HashMap<String, tokio::task::JoinHandle<()>>>>,
) {
    let user = match msg.from {
        Some(ref u) => u,
        None => return,
    };

    // Build sender_id: "numeric_id" or "numeric_id|username"
    let sender_id = if let Some(ref username) = user.username {
        format!("{}|{}", user.id, username)
    } else {
        user.id.to_string()
    };

    if !is_sender_allowed(&sender_id, &config.allow_from) {
        warn!(
            "Access denied for sender {} on Telegram. Add to allowFrom to grant access.",
            sender_id
        );
        return;
    }

    let chat_id = msg.chat.id.0;
    let chat_id_str = chat_id.to_string();

    let mut content_parts: Vec<String> = Vec::new();
    if let Some(text) = msg.text() {
        content_parts.push(text.to_string());
    }
    if let Some(caption) = msg.caption() {
        content_parts.push(caption.to_string());
    }

    // Photos become in-memory attachments; the backend receives the bytes
    let mut image: Option<Attachment> = None;
    if let MessageKind::Common(ref common) = msg.kind {
        if let MediaKind::Photo(photo) = &common.media_kind {
            if let Some(largest) = photo.photo.last() {
                match download_photo(&bot, &largest.file).await {
                    Ok(bytes) => {
                        image = Some(Attachment {
                            bytes,
                            mime_type: "image/jpeg".to_string(),
                        });
                    }
                    Err(e) => {
                        error!("Failed to download photo: {e}");
                        content_parts.push("[image: download failed]".to_string());
                    }
                }
            }
        }
    }

    let content = if content_parts.is_empty() && image.is_none() {
        return;
    } else {
        content_parts.join("\n")
    };

    debug!(
        "Telegram message from {sender_id}: {}...",
        content.chars().take(50).collect::<String>()
    );

    // Typing indicator until the reply lands
    {
        let bot_clone = bot.clone();
        let key = chat_id_str.clone();

        let mut tasks = typing_tasks.lock().await;
        if let Some(old) = tasks.remove(&key) {
            old.abort();
        }
        let handle = tokio::spawn(async move {
            loop {
                if let Err(e) = bot_clone
                    .send_chat_action(ChatId(chat_id), ChatAction::Typing)
                    .await
                {
                    debug!("Typing indicator stopped for {key}: {e}");
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_secs(4)).await;
            }
        });
        tasks.insert(chat_id_str.clone(), handle);
    }

    let inbound = InboundMessage {
        channel: "telegram".to_string(),
        sender_id,
        chat_id: chat_id_str,
        content,
        image,
        is_group: msg.chat.is_group() || msg.chat.is_supergroup(),
        raw_ref: Some(serde_json::json!({
            "messageId": msg.id.0,
            "userId": user.id.0,
        })),
    };

    if let Err(e) = inbound_tx.send(inbound).await {
        error!("Failed to send inbound message: {e}");
    }
}

/// Check if a sender is allowed based on the allow_from list.
///
/// Matches against the full sender_id string, the numeric ID part,
/// and the username part (for composite "id|username" format).
fn is_sender_allowed(sender_id: &str, allow_from: &[String]) -> bool {
    if allow_from.is_empty() {
        return true;
    }

    if allow_from.contains(&sender_id.to_string()) {
        return true;
    }

    if sender_id.contains('|') {
        for part in sender_id.split('|') {
            if !part.is_empty() && allow_from.contains(&part.to_string()) {
                return true;
            }
        }
    }

    false
}

/// Download a photo from Telegram into memory.
async fn download_photo(bot: &Bot, file_meta: &FileMeta) -> Result<Vec<u8>> {
    let file = bot.get_file(file_meta.id.clone()).await?;
    let mut stream = bot.download_file_stream(&file.path);
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk?);
    }
    debug!("Downloaded photo ({} bytes)", bytes.len());
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowlist_allows_everyone() {
        assert!(is_sender_allowed("12345", &[]));
        assert!(is_sender_allowed("12345|alice", &[]));
    }

    #[test]
    fn allowlist_matches_id_or_username() {
        let allow = vec!["12345".to_string(), "bob".to_string()];
        assert!(is_sender_allowed("12345", &allow));
        assert!(is_sender_allowed("12345|alice", &allow));
        assert!(is_sender_allowed("99999|bob", &allow));
        assert!(!is_sender_allowed("99999|alice", &allow));
    }

    #[test]
    fn allowlist_matches_full_composite() {
        let allow = vec!["12345|alice".to_string()];
        assert!(is_sender_allowed("12345|alice", &allow));
        assert!(!is_sender_allowed("12345|mallory", &allow));
    }

    #[test]
    fn missing_token_is_an_error() {
        let result = TelegramChannel::new(TelegramConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn new_channel_starts_disconnected() {
        let ch = TelegramChannel::new(TelegramConfig {
            enabled: true,
            token: "123:abc".into(),
            allow_from: vec![],
            proxy: None,
        })
        .unwrap();
        assert!(!ch.is_connected());
    }
}
