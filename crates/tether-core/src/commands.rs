use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::warn;

use crate::bus::{InboundMessage, OutboundMessage};
use crate::memory::MemoryStore;
use crate::provider::{ProviderManager, PROVIDER_KINDS};
use crate::reply::{ReplyBroker, ReplyOutcome};
use crate::runner::RunCoordinator;
use crate::session::{SessionKey, SessionRegistry};

const HELP_TEXT: &str = "Commands:\n\
/help - show this help\n\
/reset - start a fresh session for this chat\n\
/status - agent, provider and session info\n\
/queue - pending and active runs\n\
/stop - abort the active run for this chat\n\
/model [id] - show or change the model\n\
/provider [kind] - show or change the backend\n\
/memory [query] - show or search agent memory";

const MEMORY_PREVIEW_LIMIT: usize = 1500;
const MEMORY_SEARCH_LIMIT: usize = 10;

#[derive(Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The message was a command and has been answered.
    Handled,
    /// Not slash-prefixed; hand it to the agent.
    NotACommand,
}

/// Intercepts slash-prefixed messages before they become runs. Menu
/// commands park a pending selection on the conversation and answer from
/// a spawned task, so the caller's dispatch loop never waits on a user.
pub struct CommandInterpreter {
    agent_id: String,
    sessions: Arc<SessionRegistry>,
    coordinator: RunCoordinator,
    providers: Arc<ProviderManager>,
    selections: Arc<ReplyBroker>,
    selection_timeout: Duration,
    outbound_tx: broadcast::Sender<OutboundMessage>,
    memory: MemoryStore,
}

impl CommandInterpreter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: &str,
        sessions: Arc<SessionRegistry>,
        coordinator: RunCoordinator,
        providers: Arc<ProviderManager>,
        selections: Arc<ReplyBroker>,
        selection_timeout: Duration,
        outbound_tx: broadcast::Sender<OutboundMessage>,
        memory: MemoryStore,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            sessions,
            coordinator,
            providers,
            selections,
            selection_timeout,
            outbound_tx,
            memory,
        }
    }

    pub async fn handle(&self, msg: &InboundMessage) -> CommandOutcome {
        let content = msg.content.trim();
        if !content.starts_with('/') {
            return CommandOutcome::NotACommand;
        }

        let (command, arg) = match content.split_once(char::is_whitespace) {
            Some((c, rest)) => (c, Some(rest.trim())),
            None => (content, None),
        };

        let key = SessionKey::new(&self.agent_id, &msg.channel, &msg.chat_id);
        let reply = match command {
            "/help" | "/start" => HELP_TEXT.to_string(),
            "/reset" => {
                self.sessions.reset(&key).await;
                "Session reset. The next message starts a fresh conversation.".to_string()
            }
            "/status" => self.status(&key).await,
            "/queue" => self.queue(&key).await,
            "/stop" => {
                if self.coordinator.abort(&key).await {
                    "Stopped the active run.".to_string()
                } else {
                    "No active run for this chat.".to_string()
                }
            }
            "/model" => match arg {
                Some(id) if !id.is_empty() => match self.providers.set_model(id).await {
                    Ok(()) => format!("Model set to {id}."),
                    Err(e) => format!("Cannot set model: {e}"),
                },
                _ => {
                    self.model_menu(msg).await;
                    return CommandOutcome::Handled;
                }
            },
            "/provider" => match arg {
                Some(kind) if !kind.is_empty() => match self.providers.switch(kind).await {
                    Ok(()) => format!("Provider switched to {kind}. Sessions were reset."),
                    Err(e) => format!("Cannot switch provider: {e}"),
                },
                _ => {
                    self.provider_menu(msg).await;
                    return CommandOutcome::Handled;
                }
            },
            "/memory" => self.memory_report(arg),
            other => format!("Unknown command {other}. Try /help."),
        };

        self.send(msg, reply);
        CommandOutcome::Handled
    }

    async fn status(&self, key: &SessionKey) -> String {
        let kind = self.providers.active_kind().await;
        let model = self.providers.current().await.model().await;
        let stats = self.coordinator.global_stats().await;
        let mut out = format!(
            "Agent: {}\nProvider: {kind} ({model})\nSessions: {}\nActive runs: {}, queued: {}\nProcessed: {} ({} failed)",
            self.agent_id,
            self.sessions.count().await,
            stats.active_sessions,
            stats.queued_total,
            stats.total_processed,
            stats.total_failed,
        );
        if let Some(state) = self.sessions.get(key).await {
            out.push_str(&format!(
                "\nThis chat: {} message(s), {}",
                state.message_count,
                if state.backend_token.is_some() {
                    "session open"
                } else {
                    "no open session"
                }
            ));
        } else {
            out.push_str("\nThis chat: no session yet");
        }
        out
    }

    async fn queue(&self, key: &SessionKey) -> String {
        let stats = self.coordinator.global_stats().await;
        let lane = self.coordinator.queue_stats(key).await;
        format!(
            "Runs: {} active, {} queued across all chats.\nThis chat: {}{} queued.",
            stats.active_sessions,
            stats.queued_total,
            if lane.processing { "1 active, " } else { "" },
            lane.queued,
        )
    }

    fn memory_report(&self, query: Option<&str>) -> String {
        match query {
            Some(q) if !q.is_empty() => match self.memory.search(q) {
                Ok(hits) if hits.is_empty() => format!("No memory matches for \"{q}\"."),
                Ok(hits) => {
                    let mut out = format!("Memory matches for \"{q}\":\n");
                    out.push_str(
                        &hits
                            .iter()
                            .take(MEMORY_SEARCH_LIMIT)
                            .cloned()
                            .collect::<Vec<_>>()
                            .join("\n"),
                    );
                    if hits.len() > MEMORY_SEARCH_LIMIT {
                        out.push_str(&format!(
                            "\n... and {} more",
                            hits.len() - MEMORY_SEARCH_LIMIT
                        ));
                    }
                    out
                }
                Err(e) => format!("Memory search failed: {e}"),
            },
            _ => match self.memory.overview() {
                Ok(Some(text)) if text.len() > MEMORY_PREVIEW_LIMIT => {
                    let mut cut = MEMORY_PREVIEW_LIMIT;
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    format!("{}\n... (truncated)", &text[..cut])
                }
                Ok(Some(text)) => text,
                Ok(None) => "No memory recorded yet.".to_string(),
                Err(e) => format!("Memory read failed: {e}"),
            },
        }
    }

    async fn model_menu(&self, msg: &InboundMessage) {
        let provider = self.providers.current().await;
        let options = provider.available_models();
        if options.is_empty() {
            self.send(msg, "The active provider has no model catalog.".to_string());
            return;
        }
        let current = provider.model().await;
        let mut menu = String::from("Pick a model:\n");
        for (i, id) in options.iter().enumerate() {
            let marker = if *id == current { " (current)" } else { "" };
            menu.push_str(&format!("{}. {id}{marker}\n", i + 1));
        }
        menu.push_str("Reply with a number or name.");
        self.send(msg, menu);

        self.spawn_selection(msg, options, {
            let providers = self.providers.clone();
            move |choice| async move {
                match providers.set_model(&choice).await {
                    Ok(()) => format!("Model set to {choice}."),
                    Err(e) => format!("Cannot set model: {e}"),
                }
            }
        });
    }

    async fn provider_menu(&self, msg: &InboundMessage) {
        let current = self.providers.active_kind().await;
        let options: Vec<String> = PROVIDER_KINDS.iter().map(|k| k.to_string()).collect();
        let mut menu = String::from("Pick a provider:\n");
        for (i, kind) in options.iter().enumerate() {
            let marker = if *kind == current { " (current)" } else { "" };
            menu.push_str(&format!("{}. {kind}{marker}\n", i + 1));
        }
        menu.push_str("Reply with a number or name.");
        self.send(msg, menu);

        self.spawn_selection(msg, options, {
            let providers = self.providers.clone();
            move |choice| async move {
                match providers.switch(&choice).await {
                    Ok(()) => format!("Provider switched to {choice}. Sessions were reset."),
                    Err(e) => format!("Cannot switch provider: {e}"),
                }
            }
        });
    }

    /// Wait for the menu answer off the dispatch path. The next plain
    /// message in this conversation is consumed as the choice; a timeout
    /// leaves everything unchanged.
    fn spawn_selection<F, Fut>(&self, msg: &InboundMessage, options: Vec<String>, apply: F)
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = String> + Send,
    {
        let selections = self.selections.clone();
        let outbound_tx = self.outbound_tx.clone();
        let conversation = msg.conversation_key();
        let channel = msg.channel.clone();
        let chat_id = msg.chat_id.clone();
        let timeout = self.selection_timeout;

        tokio::spawn(async move {
            let outcome = selections.await_reply(&conversation, timeout).await;
            let reply = match outcome {
                ReplyOutcome::Answer(a) => match parse_choice(&a, &options) {
                    Some(choice) => apply(choice).await,
                    None => format!("\"{a}\" is not one of the options. Nothing changed."),
                },
                ReplyOutcome::Superseded => {
                    "Replaced by a newer menu. Nothing changed.".to_string()
                }
                ReplyOutcome::TimedOut => "Selection timed out. Nothing changed.".to_string(),
            };
            if outbound_tx
                .send(OutboundMessage::new(&channel, &chat_id, reply))
                .is_err()
            {
                warn!("No outbound listeners for selection result on {conversation}");
            }
        });
    }

    fn send(&self, msg: &InboundMessage, content: String) {
        let _ = self
            .outbound_tx
            .send(OutboundMessage::new(&msg.channel, &msg.chat_id, content));
    }
}

/// Match a menu answer against its options, by 1-based index or by
/// case-insensitive name.
fn parse_choice(answer: &str, options: &[String]) -> Option<String> {
    let answer = answer.trim();
    if let Ok(n) = answer.parse::<usize>() {
        if n >= 1 && n <= options.len() {
            return Some(options[n - 1].clone());
        }
        return None;
    }
    options
        .iter()
        .find(|o| o.eq_ignore_ascii_case(answer))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{Run, RunExecutor, RunOutcome};
    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::time::timeout as tokio_timeout;
    use tokio_util::sync::CancellationToken;

    struct IdleExecutor;

    #[async_trait]
    impl RunExecutor for IdleExecutor {
        async fn execute(&self, _run: &Run, _cancel: CancellationToken) -> Result<RunOutcome> {
            Ok(RunOutcome::Completed("ok".into()))
        }
    }

    struct Fixture {
        commands: CommandInterpreter,
        selections: Arc<ReplyBroker>,
        providers: Arc<ProviderManager>,
        outbound_rx: broadcast::Receiver<OutboundMessage>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tether_config::Config::default();
        config.providers.remote.models = vec!["atlas-mini".into(), "atlas-pro".into()];
        let config_path = dir.path().join("config.json");
        tether_config::save_config(&config_path, &config).unwrap();

        let sessions = Arc::new(SessionRegistry::new());
        let providers =
            Arc::new(ProviderManager::new(config, sessions.clone(), config_path).unwrap());
        let selections = Arc::new(ReplyBroker::new());
        let (outbound_tx, outbound_rx) = broadcast::channel(16);
        let coordinator = RunCoordinator::new(Arc::new(IdleExecutor));
        let memory = MemoryStore::new(dir.path().to_path_buf());

        let commands = CommandInterpreter::new(
            "tether",
            sessions,
            coordinator,
            providers.clone(),
            selections.clone(),
            Duration::from_millis(200),
            outbound_tx,
            memory,
        );
        Fixture {
            commands,
            selections,
            providers,
            outbound_rx,
            _dir: dir,
        }
    }

    fn inbound(content: &str) -> InboundMessage {
        InboundMessage::text("telegram", "77", "77", content)
    }

    async fn next_reply(rx: &mut broadcast::Receiver<OutboundMessage>) -> OutboundMessage {
        tokio_timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no reply in time")
            .unwrap()
    }

    #[tokio::test]
    async fn plain_text_is_not_a_command() {
        let f = fixture();
        let outcome = f.commands.handle(&inbound("hello there")).await;
        assert_eq!(outcome, CommandOutcome::NotACommand);
    }

    #[tokio::test]
    async fn help_lists_commands() {
        let mut f = fixture();
        assert_eq!(
            f.commands.handle(&inbound("/help")).await,
            CommandOutcome::Handled
        );
        let reply = next_reply(&mut f.outbound_rx).await;
        assert!(reply.content.contains("/reset"));
        assert!(reply.content.contains("/provider"));
    }

    #[tokio::test]
    async fn unknown_command_points_to_help() {
        let mut f = fixture();
        f.commands.handle(&inbound("/bogus")).await;
        let reply = next_reply(&mut f.outbound_rx).await;
        assert!(reply.content.contains("Unknown command /bogus"));
    }

    #[tokio::test]
    async fn stop_without_active_run_says_so() {
        let mut f = fixture();
        f.commands.handle(&inbound("/stop")).await;
        let reply = next_reply(&mut f.outbound_rx).await;
        assert!(reply.content.contains("No active run"));
    }

    #[tokio::test]
    async fn status_reports_provider_and_sessions() {
        let mut f = fixture();
        f.commands.handle(&inbound("/status")).await;
        let reply = next_reply(&mut f.outbound_rx).await;
        assert!(reply.content.contains("Provider: remote"));
        assert!(reply.content.contains("no session yet"));
    }

    #[tokio::test]
    async fn model_with_argument_applies_directly() {
        let mut f = fixture();
        let models = f.providers.current().await.available_models();
        let target = models.last().unwrap().clone();

        f.commands
            .handle(&inbound(&format!("/model {target}")))
            .await;
        let reply = next_reply(&mut f.outbound_rx).await;
        assert!(reply.content.contains(&target));
        assert_eq!(f.providers.current().await.model().await, target);
    }

    #[tokio::test]
    async fn model_with_unknown_argument_reports_error() {
        let mut f = fixture();
        f.commands.handle(&inbound("/model not-a-model")).await;
        let reply = next_reply(&mut f.outbound_rx).await;
        assert!(reply.content.contains("Cannot set model"));
    }

    #[tokio::test]
    async fn bare_model_shows_menu_and_applies_numeric_choice() {
        let mut f = fixture();
        let models = f.providers.current().await.available_models();
        assert!(models.len() >= 2);

        f.commands.handle(&inbound("/model")).await;
        let menu = next_reply(&mut f.outbound_rx).await;
        assert!(menu.content.starts_with("Pick a model:"));
        assert!(menu.content.contains("(current)"));

        // Give the spawned waiter time to park before answering
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.selections.resolve("telegram:77", "2").await);

        let confirm = next_reply(&mut f.outbound_rx).await;
        assert!(confirm.content.contains(&models[1]));
        assert_eq!(f.providers.current().await.model().await, models[1]);
    }

    #[tokio::test]
    async fn menu_timeout_leaves_model_unchanged() {
        let mut f = fixture();
        let before = f.providers.current().await.model().await;

        f.commands.handle(&inbound("/model")).await;
        let _menu = next_reply(&mut f.outbound_rx).await;

        let confirm = next_reply(&mut f.outbound_rx).await;
        assert!(confirm.content.contains("timed out"));
        assert_eq!(f.providers.current().await.model().await, before);
    }

    #[tokio::test]
    async fn reissued_menu_reports_replacement_not_timeout() {
        let mut f = fixture();

        f.commands.handle(&inbound("/model")).await;
        let _menu1 = next_reply(&mut f.outbound_rx).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.commands.handle(&inbound("/model")).await;
        let _menu2 = next_reply(&mut f.outbound_rx).await;

        let replaced = next_reply(&mut f.outbound_rx).await;
        assert!(replaced.content.contains("Replaced by a newer menu"));

        // The fresh menu still answers normally
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.selections.resolve("telegram:77", "1").await);
        let confirm = next_reply(&mut f.outbound_rx).await;
        assert!(confirm.content.contains("atlas-mini"));
        assert_eq!(f.providers.current().await.model().await, "atlas-mini");
    }

    #[tokio::test]
    async fn menu_rejects_out_of_range_choice() {
        let mut f = fixture();
        let before = f.providers.current().await.model().await;

        f.commands.handle(&inbound("/model")).await;
        let _menu = next_reply(&mut f.outbound_rx).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        f.selections.resolve("telegram:77", "99").await;

        let confirm = next_reply(&mut f.outbound_rx).await;
        assert!(confirm.content.contains("not one of the options"));
        assert_eq!(f.providers.current().await.model().await, before);
    }

    #[tokio::test]
    async fn reset_clears_session_state() {
        let mut f = fixture();
        let key = SessionKey::new("tether", "telegram", "77");
        f.commands.sessions.touch(&key).await;
        f.commands
            .sessions
            .set_backend_token(&key, "tok-1".into())
            .await;

        f.commands.handle(&inbound("/reset")).await;
        let reply = next_reply(&mut f.outbound_rx).await;
        assert!(reply.content.contains("Session reset"));
        assert!(f.commands.sessions.backend_token(&key).await.is_none());
    }

    #[tokio::test]
    async fn memory_search_reports_hits() {
        let f = fixture();
        std::fs::write(
            f._dir.path().join("MEMORY.md"),
            "# Notes\nthe deploy key lives in vault\n",
        )
        .unwrap();

        let report = f.commands.memory_report(Some("deploy key"));
        assert!(report.contains("MEMORY.md"));

        let miss = f.commands.memory_report(Some("nonexistent"));
        assert!(miss.contains("No memory matches"));
    }

    #[test]
    fn choice_parsing_by_index_and_name() {
        let options = vec!["alpha".to_string(), "beta".to_string()];
        assert_eq!(parse_choice("1", &options), Some("alpha".into()));
        assert_eq!(parse_choice(" BETA ", &options), Some("beta".into()));
        assert_eq!(parse_choice("0", &options), None);
        assert_eq!(parse_choice("3", &options), None);
        assert_eq!(parse_choice("gamma", &options), None);
    }
}
