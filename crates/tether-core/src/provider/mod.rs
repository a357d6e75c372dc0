pub mod local;
pub mod remote;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::info;

use tether_config::{Config, SettingsStore};

use crate::bus::Attachment;
use crate::session::{SessionKey, SessionRegistry};

pub use local::LocalProvider;
pub use remote::RemoteProvider;

/// One backend query.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub session_key: SessionKey,
    pub prompt: String,
    pub image: Option<Attachment>,
    pub system_prompt: Option<String>,
    /// Model override for this query; None uses the provider's current model.
    pub model: Option<String>,
}

/// Normalized event vocabulary shared by all backends.
///
/// Adapters are responsible for mapping their native framing onto this:
/// cumulative snapshots become deltas, repeated tool-call announcements are
/// deduplicated, and every stream ends with exactly one of Done, Aborted,
/// or Error.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    TextDelta(String),
    Thinking(String),
    ToolStart {
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        name: String,
        output: String,
    },
    /// The backend wants authorization for a sensitive tool call and is
    /// paused until `resolve_approval` is called with this id.
    ApprovalRequest {
        id: String,
        tool: String,
        detail: String,
    },
    Error(String),
    Aborted,
    Done,
}

impl ProviderEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderEvent::Error(_) | ProviderEvent::Aborted | ProviderEvent::Done
        )
    }
}

/// Uniform streaming contract over an interchangeable AI backend.
///
/// A `session_key` maps to an opaque backend-native token held by the
/// session registry; adapters resume that token on subsequent queries for
/// the same key instead of opening a fresh context.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// One-time setup (process spawn, connectivity check). Optional.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Submit a prompt; returns a fresh, finite, non-restartable stream of
    /// events ending with a terminal event.
    async fn query(&self, request: QueryRequest) -> Result<mpsc::Receiver<ProviderEvent>>;

    /// Cooperative cancel of the in-flight request for this key. Idempotent:
    /// aborting a key with nothing active returns false, never an error.
    /// An aborted stream still terminates with `ProviderEvent::Aborted`.
    async fn abort(&self, session_key: &SessionKey) -> bool;

    /// Answer an outstanding `ApprovalRequest`.
    async fn resolve_approval(
        &self,
        session_key: &SessionKey,
        request_id: &str,
        approved: bool,
    ) -> Result<()>;

    fn available_models(&self) -> Vec<String>;
    async fn model(&self) -> String;
    async fn set_model(&self, id: &str) -> Result<()>;
}

pub const PROVIDER_KINDS: &[&str] = &["remote", "local"];

/// Holds the active provider and performs runtime switches.
///
/// Switching tears down all backend session tokens (old tokens mean nothing
/// to the new backend) and persists the choice through the settings store so
/// it survives restart.
pub struct ProviderManager {
    current: RwLock<Arc<dyn Provider>>,
    active_kind: RwLock<String>,
    config: Config,
    sessions: Arc<SessionRegistry>,
    settings: SettingsStore,
}

impl ProviderManager {
    pub fn new(
        config: Config,
        sessions: Arc<SessionRegistry>,
        config_path: PathBuf,
    ) -> Result<Self> {
        let kind = config.agent.provider.clone();
        let provider = Self::build(&kind, &config, sessions.clone())?;
        Ok(Self {
            current: RwLock::new(provider),
            active_kind: RwLock::new(kind),
            config,
            sessions,
            settings: SettingsStore::new(config_path),
        })
    }

    fn build(
        kind: &str,
        config: &Config,
        sessions: Arc<SessionRegistry>,
    ) -> Result<Arc<dyn Provider>> {
        match kind {
            "remote" => Ok(Arc::new(RemoteProvider::new(
                config.providers.remote.clone(),
                config.agent.model.clone(),
                sessions,
            )?)),
            "local" => Ok(Arc::new(LocalProvider::new(
                config.providers.local.clone(),
                config.agent.model.clone(),
                sessions,
            ))),
            other => anyhow::bail!(
                "unknown provider '{other}' (valid: {})",
                PROVIDER_KINDS.join(", ")
            ),
        }
    }

    pub async fn current(&self) -> Arc<dyn Provider> {
        self.current.read().await.clone()
    }

    pub async fn active_kind(&self) -> String {
        self.active_kind.read().await.clone()
    }

    /// Swap the backend. All session tokens are invalidated; configuration
    /// and counters are preserved.
    pub async fn switch(&self, kind: &str) -> Result<()> {
        let provider = Self::build(kind, &self.config, self.sessions.clone())?;
        provider.initialize().await?;

        self.sessions.clear_backend_tokens().await;
        *self.current.write().await = provider;
        *self.active_kind.write().await = kind.to_string();

        let kind_owned = kind.to_string();
        self.settings
            .update(move |c| c.agent.provider = kind_owned)?;
        info!("Switched provider to '{kind}'");
        Ok(())
    }

    pub async fn set_model(&self, id: &str) -> Result<()> {
        self.current.read().await.set_model(id).await?;
        let id_owned = id.to_string();
        self.settings.update(move |c| c.agent.model = id_owned)?;
        Ok(())
    }

    /// Install a scripted backend without going through `build`.
    #[cfg(test)]
    pub(crate) async fn install(&self, kind: &str, provider: Arc<dyn Provider>) {
        *self.current.write().await = provider;
        *self.active_kind.write().await = kind.to_string();
    }
}
