use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::OutboundMessage;
use crate::cron::{CronSchedule, CronService, JobTarget, NewJob};
use crate::provider::{ProviderEvent, ProviderManager, QueryRequest};
use crate::reply::{ReplyBroker, ReplyOutcome};
use crate::runner::{Run, RunExecutor, RunOutcome};
use crate::session::SessionRegistry;

const FALLBACK_RESPONSE: &str = "I finished processing but have nothing to say.";

/// Drives one run against the active provider: accumulates text, routes
/// approval requests through the broker, and applies gateway-side tool
/// calls (scheduling) intercepted from the stream.
pub struct AgentRunner {
    providers: Arc<ProviderManager>,
    sessions: Arc<SessionRegistry>,
    approvals: Arc<ReplyBroker>,
    outbound_tx: broadcast::Sender<OutboundMessage>,
    cron: Arc<Mutex<CronService>>,
    approval_timeout: Duration,
    system_prompt: Option<String>,
}

impl AgentRunner {
    pub fn new(
        providers: Arc<ProviderManager>,
        sessions: Arc<SessionRegistry>,
        approvals: Arc<ReplyBroker>,
        outbound_tx: broadcast::Sender<OutboundMessage>,
        cron: Arc<Mutex<CronService>>,
        approval_timeout: Duration,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            providers,
            sessions,
            approvals,
            outbound_tx,
            cron,
            approval_timeout,
            system_prompt,
        }
    }

    /// Ask the user to authorize a tool call; no answer within the deadline
    /// is a denial. Returns None when the run is stopped while the question
    /// is open.
    async fn request_approval(
        &self,
        run: &Run,
        id: &str,
        tool: &str,
        detail: &str,
        cancel: &CancellationToken,
    ) -> Option<bool> {
        let conversation = format!("{}:{}", run.session_key.channel, run.session_key.chat_id);
        let prompt = if detail.is_empty() {
            format!("The agent wants to run `{tool}`. Reply \"yes\" to allow or anything else to deny.")
        } else {
            format!(
                "The agent wants to run `{tool}`:\n{detail}\nReply \"yes\" to allow or anything else to deny."
            )
        };
        let _ = self.outbound_tx.send(OutboundMessage::new(
            &run.session_key.channel,
            &run.session_key.chat_id,
            prompt,
        ));

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                // The dropped wait leaves a dead slot; clear it so the next
                // message is not consumed as a stale answer.
                self.approvals.withdraw(&conversation).await;
                info!("Approval {id} for `{tool}` on {conversation} interrupted by stop");
                return None;
            }
            outcome = self.approvals.await_reply(&conversation, self.approval_timeout) => outcome,
        };
        let approved = matches!(&outcome, ReplyOutcome::Answer(a) if is_affirmative(a));
        info!(
            "Approval {id} for `{tool}` on {conversation}: {}",
            if approved { "granted" } else { "denied" }
        );
        Some(approved)
    }

    /// Apply a scheduling tool call intercepted from the stream, targeting
    /// the run's own conversation.
    async fn handle_schedule(&self, run: &Run, arguments: &serde_json::Value) {
        let Some(message) = arguments.get("message").and_then(|v| v.as_str()) else {
            warn!("schedule_message call without a message; ignoring");
            return;
        };

        let schedule = if let Some(at_ms) = arguments.get("atMs").and_then(|v| v.as_i64()) {
            CronSchedule::at(at_ms)
        } else if let Some(secs) = arguments.get("everySeconds").and_then(|v| v.as_i64()) {
            CronSchedule::every(secs * 1000)
        } else if let Some(expr) = arguments.get("cron").and_then(|v| v.as_str()) {
            CronSchedule::cron(expr)
        } else {
            warn!("schedule_message call without atMs/everySeconds/cron; ignoring");
            return;
        };

        let new = NewJob {
            name: arguments
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("scheduled message")
                .to_string(),
            schedule,
            message: message.to_string(),
            invoke_agent: arguments
                .get("invokeAgent")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
            target: JobTarget {
                channel: run.session_key.channel.clone(),
                chat_id: run.session_key.chat_id.clone(),
            },
            session_key: run.session_key.to_string(),
        };

        match self.cron.lock().await.add_job(new) {
            Ok(job) => info!("Run {} scheduled job {}", run.id, job.id),
            Err(e) => warn!("Run {} failed to schedule job: {e}", run.id),
        }
    }

    async fn handle_cancel_schedule(&self, arguments: &serde_json::Value) {
        let Some(job_id) = arguments.get("jobId").and_then(|v| v.as_str()) else {
            return;
        };
        if !self.cron.lock().await.remove_job(job_id) {
            warn!("cancel_schedule: no job {job_id}");
        }
    }
}

#[async_trait]
impl RunExecutor for AgentRunner {
    async fn execute(&self, run: &Run, cancel: CancellationToken) -> Result<RunOutcome> {
        self.sessions.touch(&run.session_key).await;

        let provider = self.providers.current().await;
        let mut events = provider
            .query(QueryRequest {
                session_key: run.session_key.clone(),
                prompt: run.payload.text.clone(),
                image: run.payload.image.clone(),
                system_prompt: self.system_prompt.clone(),
                model: None,
            })
            .await?;

        let mut text = String::new();
        let mut abort_requested = false;

        loop {
            let event = if abort_requested {
                // Abort already signalled; keep draining until the adapter's
                // terminal event so nothing is left mid-stream.
                events.recv().await
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        provider.abort(&run.session_key).await;
                        abort_requested = true;
                        continue;
                    }
                    event = events.recv() => event,
                }
            };

            let Some(event) = event else {
                // Stream closed without a terminal event
                break;
            };

            match event {
                ProviderEvent::TextDelta(delta) => text.push_str(&delta),
                ProviderEvent::Thinking(t) => debug!("Run {} thinking: {t}", run.id),
                ProviderEvent::ToolStart { name, arguments } => match name.as_str() {
                    "schedule_message" => self.handle_schedule(run, &arguments).await,
                    "cancel_schedule" => self.handle_cancel_schedule(&arguments).await,
                    other => debug!("Run {} tool started: {other}", run.id),
                },
                ProviderEvent::ToolResult { name, .. } => {
                    debug!("Run {} tool finished: {name}", run.id)
                }
                ProviderEvent::ApprovalRequest { id, tool, detail } => {
                    match self.request_approval(run, &id, &tool, &detail, &cancel).await {
                        Some(approved) => {
                            provider
                                .resolve_approval(&run.session_key, &id, approved)
                                .await?;
                        }
                        None => {
                            // Stopped mid-question: deny the outstanding call
                            // and wind the stream down like any other abort.
                            let _ = provider
                                .resolve_approval(&run.session_key, &id, false)
                                .await;
                            provider.abort(&run.session_key).await;
                            abort_requested = true;
                        }
                    }
                }
                ProviderEvent::Error(message) => anyhow::bail!("backend error: {message}"),
                ProviderEvent::Aborted => return Ok(RunOutcome::Aborted),
                ProviderEvent::Done => break,
            }
        }

        if abort_requested {
            return Ok(RunOutcome::Aborted);
        }
        if text.is_empty() {
            text = FALLBACK_RESPONSE.to_string();
        }
        Ok(RunOutcome::Completed(text))
    }
}

/// Interpret a free-text approval reply.
fn is_affirmative(answer: &str) -> bool {
    matches!(
        answer.trim().to_lowercase().as_str(),
        "y" | "yes" | "ok" | "okay" | "sure" | "allow" | "approve" | "approved"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Provider;
    use crate::runner::RunPayload;
    use crate::session::SessionKey;
    use std::time::Instant;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    /// Provider that plays back a fixed event script and records approvals.
    struct ScriptedProvider {
        script: Mutex<Vec<ProviderEvent>>,
        approvals: Mutex<Vec<(String, bool)>>,
        abort_tx: Mutex<Option<mpsc::Sender<ProviderEvent>>>,
        hold_open: bool,
    }

    impl ScriptedProvider {
        fn new(script: Vec<ProviderEvent>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                approvals: Mutex::new(Vec::new()),
                abort_tx: Mutex::new(None),
                hold_open: false,
            })
        }

        fn held_open() -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(Vec::new()),
                approvals: Mutex::new(Vec::new()),
                abort_tx: Mutex::new(None),
                hold_open: true,
            })
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn query(&self, _request: QueryRequest) -> Result<mpsc::Receiver<ProviderEvent>> {
            let (tx, rx) = mpsc::channel(32);
            if self.hold_open {
                // Stream stays open until abort() injects the terminal event
                *self.abort_tx.lock().await = Some(tx);
            } else {
                let script = std::mem::take(&mut *self.script.lock().await);
                tokio::spawn(async move {
                    for event in script {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                });
            }
            Ok(rx)
        }

        async fn abort(&self, _session_key: &SessionKey) -> bool {
            if let Some(tx) = self.abort_tx.lock().await.take() {
                let _ = tx.send(ProviderEvent::Aborted).await;
                true
            } else {
                false
            }
        }

        async fn resolve_approval(
            &self,
            _session_key: &SessionKey,
            request_id: &str,
            approved: bool,
        ) -> Result<()> {
            self.approvals
                .lock()
                .await
                .push((request_id.to_string(), approved));
            Ok(())
        }

        fn available_models(&self) -> Vec<String> {
            Vec::new()
        }

        async fn model(&self) -> String {
            String::new()
        }

        async fn set_model(&self, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        runner: AgentRunner,
        approvals: Arc<ReplyBroker>,
        outbound_rx: broadcast::Receiver<OutboundMessage>,
        cron: Arc<Mutex<CronService>>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(provider: Arc<ScriptedProvider>, approval_timeout: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionRegistry::new());
        let approvals = Arc::new(ReplyBroker::new());
        let (outbound_tx, outbound_rx) = broadcast::channel(16);
        let (fired_tx, _fired_rx) = mpsc::channel(4);
        let cron = Arc::new(Mutex::new(CronService::new(
            dir.path().join("jobs.json"),
            fired_tx,
        )));

        let config = tether_config::Config::default();
        let config_path = dir.path().join("config.json");
        tether_config::save_config(&config_path, &config).unwrap();
        let providers =
            Arc::new(ProviderManager::new(config, sessions.clone(), config_path).unwrap());
        providers.install("scripted", provider).await;

        let runner = AgentRunner::new(
            providers,
            sessions,
            approvals.clone(),
            outbound_tx,
            cron.clone(),
            approval_timeout,
            None,
        );
        Fixture {
            runner,
            approvals,
            outbound_rx,
            cron,
            _dir: dir,
        }
    }

    fn run(text: &str) -> Run {
        Run {
            id: "r1".into(),
            session_key: SessionKey::new("tether", "telegram", "42"),
            payload: RunPayload::text(text),
            enqueued_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn accumulates_text_until_done() {
        let provider = ScriptedProvider::new(vec![
            ProviderEvent::TextDelta("Hello".into()),
            ProviderEvent::TextDelta(", world".into()),
            ProviderEvent::Done,
        ]);
        let f = fixture(provider, Duration::from_secs(1)).await;
        let outcome = f
            .runner
            .execute(&run("hi"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed("Hello, world".into()));
    }

    #[tokio::test]
    async fn empty_response_gets_fallback_text() {
        let provider = ScriptedProvider::new(vec![ProviderEvent::Done]);
        let f = fixture(provider, Duration::from_secs(1)).await;
        let outcome = f
            .runner
            .execute(&run("hi"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed(FALLBACK_RESPONSE.into()));
    }

    #[tokio::test]
    async fn backend_error_fails_the_run() {
        let provider = ScriptedProvider::new(vec![ProviderEvent::Error("quota".into())]);
        let f = fixture(provider, Duration::from_secs(1)).await;
        let result = f.runner.execute(&run("hi"), CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn approval_reply_is_forwarded_to_backend() {
        let provider = ScriptedProvider::new(vec![
            ProviderEvent::ApprovalRequest {
                id: "a1".into(),
                tool: "exec".into(),
                detail: "rm -rf /tmp/x".into(),
            },
            ProviderEvent::TextDelta("done".into()),
            ProviderEvent::Done,
        ]);
        let mut f = fixture(provider.clone(), Duration::from_secs(5)).await;
        let runner = f.runner;
        let approvals = f.approvals.clone();

        let handle = tokio::spawn(async move {
            runner.execute(&run("hi"), CancellationToken::new()).await
        });

        // The explanatory prompt goes out first
        let prompt = timeout(Duration::from_secs(1), f.outbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(prompt.content.contains("exec"));

        // Answer on the same conversation channel
        sleep(Duration::from_millis(30)).await;
        assert!(approvals.resolve("telegram:42", "yes").await);

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Completed("done".into()));
        assert_eq!(*provider.approvals.lock().await, vec![("a1".into(), true)]);
    }

    #[tokio::test]
    async fn approval_timeout_is_a_denial() {
        let provider = ScriptedProvider::new(vec![
            ProviderEvent::ApprovalRequest {
                id: "a1".into(),
                tool: "exec".into(),
                detail: String::new(),
            },
            ProviderEvent::Done,
        ]);
        let f = fixture(provider.clone(), Duration::from_millis(50)).await;
        let outcome = f
            .runner
            .execute(&run("hi"), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert_eq!(*provider.approvals.lock().await, vec![("a1".into(), false)]);
    }

    #[tokio::test]
    async fn stop_during_approval_wait_aborts_without_waiting_out_the_deadline() {
        let provider = ScriptedProvider::new(vec![
            ProviderEvent::ApprovalRequest {
                id: "a1".into(),
                tool: "exec".into(),
                detail: String::new(),
            },
            ProviderEvent::Done,
        ]);
        let f = fixture(provider.clone(), Duration::from_secs(30)).await;
        let approvals = f.approvals.clone();
        let cancel = CancellationToken::new();
        let runner = f.runner;

        let c = cancel.clone();
        let handle = tokio::spawn(async move { runner.execute(&run("hi"), c).await });
        sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        // Returns promptly, not after the 30 s approval deadline
        let outcome = timeout(Duration::from_millis(500), handle)
            .await
            .expect("stop must interrupt the approval wait")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, RunOutcome::Aborted);

        // The outstanding call was denied and the question slot cleared
        assert_eq!(*provider.approvals.lock().await, vec![("a1".into(), false)]);
        assert!(!approvals.has_pending("telegram:42").await);
    }

    #[tokio::test]
    async fn cancellation_aborts_via_provider() {
        let provider = ScriptedProvider::held_open();
        let f = fixture(provider, Duration::from_secs(1)).await;
        let cancel = CancellationToken::new();
        let runner = f.runner;

        let c = cancel.clone();
        let handle = tokio::spawn(async move { runner.execute(&run("hi"), c).await });
        sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        let outcome = timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, RunOutcome::Aborted);
    }

    #[tokio::test]
    async fn schedule_tool_call_creates_job_for_own_conversation() {
        let provider = ScriptedProvider::new(vec![
            ProviderEvent::ToolStart {
                name: "schedule_message".into(),
                arguments: serde_json::json!({
                    "message": "take a break",
                    "everySeconds": 3600,
                    "invokeAgent": false,
                }),
            },
            ProviderEvent::TextDelta("Scheduled.".into()),
            ProviderEvent::Done,
        ]);
        let f = fixture(provider, Duration::from_secs(1)).await;
        f.runner
            .execute(&run("remind me hourly"), CancellationToken::new())
            .await
            .unwrap();

        let mut cron = f.cron.lock().await;
        let jobs = cron.list_jobs(true);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].message, "take a break");
        assert_eq!(jobs[0].target.chat_id, "42");
        assert!(!jobs[0].invoke_agent);
        assert_eq!(jobs[0].session_key, "tether:telegram:42");
    }

    #[test]
    fn affirmative_answers_recognized() {
        assert!(is_affirmative("yes"));
        assert!(is_affirmative(" OK "));
        assert!(!is_affirmative("no"));
        assert!(!is_affirmative("yes please")); // free text is not a bare yes
    }
}
