use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use tether_config::{resolve_workspace, Config};

use crate::agent::AgentRunner;
use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::commands::{CommandInterpreter, CommandOutcome};
use crate::cron::{CronService, JobFired};
use crate::memory::MemoryStore;
use crate::provider::ProviderManager;
use crate::reply::ReplyBroker;
use crate::runner::{RunCoordinator, RunExecutor, RunOutcome, RunPayload};
use crate::session::{SessionKey, SessionRegistry};

const RUN_FAILURE_REPLY: &str = "Sorry, something went wrong handling that message.";

/// Central dispatcher. Owns the inbound queue and decides, per message,
/// whether it settles a pending approval or menu selection, is a command,
/// or becomes a run. Scheduled jobs arrive on their own channel and either
/// post their text verbatim or go through the same run path.
pub struct Gateway {
    config: Config,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    outbound_tx: broadcast::Sender<OutboundMessage>,
    sessions: Arc<SessionRegistry>,
    providers: Arc<ProviderManager>,
    coordinator: RunCoordinator,
    approvals: Arc<ReplyBroker>,
    selections: Arc<ReplyBroker>,
    commands: CommandInterpreter,
    cron: Arc<Mutex<CronService>>,
    fired_rx: mpsc::Receiver<JobFired>,
}

impl Gateway {
    pub fn new(config: Config, config_path: PathBuf, data_dir: &Path) -> Result<Self> {
        Self::build(config, config_path, data_dir, None)
    }

    #[cfg(test)]
    pub(crate) fn with_executor(
        config: Config,
        config_path: PathBuf,
        data_dir: &Path,
        executor: Arc<dyn RunExecutor>,
    ) -> Result<Self> {
        Self::build(config, config_path, data_dir, Some(executor))
    }

    fn build(
        config: Config,
        config_path: PathBuf,
        data_dir: &Path,
        executor: Option<Arc<dyn RunExecutor>>,
    ) -> Result<Self> {
        let bus = MessageBus::new(256);
        let sessions = Arc::new(SessionRegistry::new());
        let providers = Arc::new(ProviderManager::new(
            config.clone(),
            sessions.clone(),
            config_path,
        )?);
        let approvals = Arc::new(ReplyBroker::new());
        let selections = Arc::new(ReplyBroker::new());

        let (fired_tx, fired_rx) = mpsc::channel(64);
        let cron = Arc::new(Mutex::new(CronService::new(
            data_dir.join("cron").join("jobs.json"),
            fired_tx,
        )));

        let executor = match executor {
            Some(executor) => executor,
            None => Arc::new(AgentRunner::new(
                providers.clone(),
                sessions.clone(),
                approvals.clone(),
                bus.outbound_tx.clone(),
                cron.clone(),
                Duration::from_secs(config.approvals.timeout_secs),
                config.agent.system_prompt.clone(),
            )),
        };
        let coordinator = RunCoordinator::new(executor);

        let commands = CommandInterpreter::new(
            &config.agent.id,
            sessions.clone(),
            coordinator.clone(),
            providers.clone(),
            selections.clone(),
            Duration::from_secs(config.approvals.selection_timeout_secs),
            bus.outbound_tx.clone(),
            MemoryStore::new(resolve_workspace(&config.agent.workspace)),
        );

        Ok(Self {
            config,
            inbound_tx: bus.inbound_tx,
            inbound_rx: bus.inbound_rx,
            outbound_tx: bus.outbound_tx,
            sessions,
            providers,
            coordinator,
            approvals,
            selections,
            commands,
            cron,
            fired_rx,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Channels push received messages here.
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Channels subscribe here for messages to deliver.
    pub fn outbound_sender(&self) -> broadcast::Sender<OutboundMessage> {
        self.outbound_tx.clone()
    }

    pub fn providers(&self) -> Arc<ProviderManager> {
        self.providers.clone()
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        self.sessions.clone()
    }

    pub fn cron(&self) -> Arc<Mutex<CronService>> {
        self.cron.clone()
    }

    pub fn coordinator(&self) -> RunCoordinator {
        self.coordinator.clone()
    }

    /// Initialize the active provider and start the scheduler.
    pub async fn start(&self) -> Result<()> {
        self.providers.current().await.initialize().await?;
        self.cron.lock().await.start().await?;
        info!(
            "Gateway started (agent '{}', provider '{}')",
            self.config.agent.id,
            self.providers.active_kind().await
        );
        Ok(())
    }

    /// Main dispatch loop. Returns on Ctrl-C.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                Some(msg) = self.inbound_rx.recv() => {
                    self.handle_inbound(msg).await;
                }
                Some(fired) = self.fired_rx.recv() => {
                    self.handle_fired(fired).await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down");
                    self.cron.lock().await.stop();
                    return Ok(());
                }
            }
        }
    }

    /// Route one inbound message. Pending approvals and menu selections on
    /// the same conversation take the message first, then commands, and
    /// only then does it become a run. Never blocks on run execution.
    pub async fn handle_inbound(&self, msg: InboundMessage) {
        let conversation = msg.conversation_key();

        if self.approvals.resolve(&conversation, &msg.content).await {
            debug!("Message on {conversation} settled a pending approval");
            return;
        }
        if self.selections.resolve(&conversation, &msg.content).await {
            debug!("Message on {conversation} settled a pending selection");
            return;
        }
        if self.commands.handle(&msg).await == CommandOutcome::Handled {
            return;
        }

        let key = SessionKey::new(&self.config.agent.id, &msg.channel, &msg.chat_id);
        let payload = RunPayload {
            text: msg.content,
            image: msg.image,
        };
        self.dispatch_run(key, payload, msg.channel, msg.chat_id);
    }

    /// A scheduled job came due. Verbatim jobs post their message directly;
    /// agent jobs go through the normal run queue under the job's session.
    async fn handle_fired(&self, fired: JobFired) {
        if !fired.invoke_agent {
            if self
                .outbound_tx
                .send(OutboundMessage::new(
                    &fired.channel,
                    &fired.chat_id,
                    fired.message,
                ))
                .is_err()
            {
                warn!("Job {} fired but no channel is listening", fired.job_id);
            }
            return;
        }

        let key = SessionKey::parse(&fired.session_key).unwrap_or_else(|| {
            SessionKey::new(&self.config.agent.id, &fired.channel, &fired.chat_id)
        });
        info!("Job {} dispatching agent run on {key}", fired.job_id);
        self.dispatch_run(
            key,
            RunPayload::text(fired.message),
            fired.channel,
            fired.chat_id,
        );
    }

    /// Submit a run off the dispatch path and deliver its outcome.
    fn dispatch_run(&self, key: SessionKey, payload: RunPayload, channel: String, chat_id: String) {
        let coordinator = self.coordinator.clone();
        let outbound_tx = self.outbound_tx.clone();
        tokio::spawn(async move {
            let reply = match coordinator.submit(key.clone(), payload).await {
                Ok(RunOutcome::Completed(text)) => text,
                // /stop already confirmed; stay quiet
                Ok(RunOutcome::Aborted) => return,
                Err(e) => {
                    error!("Run on {key} failed: {e:#}");
                    RUN_FAILURE_REPLY.to_string()
                }
            };
            let _ = outbound_tx.send(OutboundMessage::new(&channel, &chat_id, reply));
        });
    }
}
