use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Composite session identity: {agent id, channel, chat id}.
///
/// Scopes both run serialization and backend context resumption.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub agent: String,
    pub channel: String,
    pub chat_id: String,
}

impl SessionKey {
    pub fn new(agent: &str, channel: &str, chat_id: &str) -> Self {
        Self {
            agent: agent.into(),
            channel: channel.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Inverse of `Display`. Chat ids may themselves contain colons, so
    /// only the first two separators split.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        Some(Self::new(parts.next()?, parts.next()?, parts.next()?))
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.agent, self.channel, self.chat_id)
    }
}

/// Mutable per-conversation state. Owned exclusively by the registry.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Opaque backend-native session/thread token. None until the backend
    /// assigns one on the first query.
    pub backend_token: Option<String>,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl SessionState {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            backend_token: None,
            message_count: 0,
            created_at: now,
            last_active: now,
        }
    }
}

/// Maps session keys to per-conversation state. Sessions are created lazily
/// on first touch and live for the process lifetime unless explicitly reset.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionState>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message for a session, creating it if needed.
    pub async fn touch(&self, key: &SessionKey) {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .entry(key.to_string())
            .or_insert_with(SessionState::new);
        state.message_count += 1;
        state.last_active = Utc::now();
    }

    pub async fn get(&self, key: &SessionKey) -> Option<SessionState> {
        self.sessions.read().await.get(&key.to_string()).cloned()
    }

    pub async fn backend_token(&self, key: &SessionKey) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(&key.to_string())
            .and_then(|s| s.backend_token.clone())
    }

    pub async fn set_backend_token(&self, key: &SessionKey, token: String) {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .entry(key.to_string())
            .or_insert_with(SessionState::new);
        state.backend_token = Some(token);
    }

    /// Drop one session entirely (the /reset command).
    pub async fn reset(&self, key: &SessionKey) -> bool {
        self.sessions.write().await.remove(&key.to_string()).is_some()
    }

    /// Invalidate every backend token while keeping counters. Old tokens are
    /// meaningless after a provider switch.
    pub async fn clear_backend_tokens(&self) {
        let mut sessions = self.sessions.write().await;
        for state in sessions.values_mut() {
            state.backend_token = None;
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
