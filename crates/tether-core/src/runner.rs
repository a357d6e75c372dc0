use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::Attachment;
use crate::session::SessionKey;

/// What a run carries into execution.
#[derive(Debug, Clone)]
pub struct RunPayload {
    pub text: String,
    pub image: Option<Attachment>,
}

impl RunPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
        }
    }
}

/// One submitted message awaiting or undergoing backend execution.
#[derive(Debug)]
pub struct Run {
    pub id: String,
    pub session_key: SessionKey,
    pub payload: RunPayload,
    pub enqueued_at: Instant,
}

/// Terminal state of a run delivered back to the submitter.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(String),
    Aborted,
}

/// Executes a single run. The coordinator stays backend-agnostic; the
/// gateway plugs in an executor that drives the provider stream.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn execute(&self, run: &Run, cancel: CancellationToken) -> Result<RunOutcome>;
}

/// Monitoring events. No consumer action is required; dropping the
/// receiver loses nothing but visibility.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Queued {
        session_key: String,
        run_id: String,
        position: usize,
        depth: usize,
    },
    Processing {
        session_key: String,
        run_id: String,
        wait_ms: u128,
    },
    Completed {
        session_key: String,
        run_id: String,
        duration_ms: u128,
    },
    Failed {
        session_key: String,
        run_id: String,
        error: String,
    },
    Aborted {
        session_key: String,
        run_id: String,
    },
}

struct QueuedRun {
    run: Run,
    done: oneshot::Sender<Result<RunOutcome, String>>,
}

#[derive(Default)]
struct Lane {
    queue: VecDeque<QueuedRun>,
    processing: bool,
    active_cancel: Option<CancellationToken>,
}

#[derive(Default)]
struct Counters {
    processed: u64,
    failed: u64,
    seen: HashSet<String>,
}

/// Per-session queue depth and processing flag.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: bool,
}

/// Derived global counters, recomputed on read.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub total_processed: u64,
    pub total_failed: u64,
    pub active_sessions: usize,
    pub queued_total: usize,
    pub sessions_seen: usize,
}

/// Serializes runs per session key: at most one run is processing for a
/// given key at any time, later submissions queue in FIFO order, and
/// different keys never block each other.
#[derive(Clone)]
pub struct RunCoordinator {
    executor: Arc<dyn RunExecutor>,
    lanes: Arc<Mutex<HashMap<String, Lane>>>,
    counters: Arc<Mutex<Counters>>,
    events: broadcast::Sender<RunEvent>,
}

impl RunCoordinator {
    pub fn new(executor: Arc<dyn RunExecutor>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            executor,
            lanes: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Mutex::new(Counters::default())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Submit a message for a session and wait for its turn to complete.
    ///
    /// If no run is processing for this key the run starts immediately;
    /// otherwise it queues behind earlier submissions. Each caller gets its
    /// own run's result; a failure in one run never rejects another.
    pub async fn submit(&self, session_key: SessionKey, payload: RunPayload) -> Result<RunOutcome> {
        let key = session_key.to_string();
        let run = Run {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            session_key,
            payload,
            enqueued_at: Instant::now(),
        };
        let run_id = run.id.clone();
        let (done_tx, done_rx) = oneshot::channel();

        self.counters.lock().await.seen.insert(key.clone());

        {
            let mut lanes = self.lanes.lock().await;
            let lane = lanes.entry(key.clone()).or_default();
            if lane.processing {
                lane.queue.push_back(QueuedRun { run, done: done_tx });
                let position = lane.queue.len();
                debug!("Run {run_id} queued for {key} at position {position}");
                let _ = self.events.send(RunEvent::Queued {
                    session_key: key.clone(),
                    run_id,
                    position,
                    depth: position,
                });
            } else {
                lane.processing = true;
                let cancel = CancellationToken::new();
                lane.active_cancel = Some(cancel.clone());
                self.spawn_drive(key, run, done_tx, cancel);
            }
        }

        match done_rx.await {
            Ok(result) => result.map_err(|e| anyhow::anyhow!(e)),
            Err(_) => Err(anyhow::anyhow!("run dropped before completion")),
        }
    }

    /// Signal the currently processing run for a key. Returns whether a run
    /// was actually active. Queued runs are untouched; aborting only
    /// interrupts the in-flight one to unblock the queue.
    pub async fn abort(&self, session_key: &SessionKey) -> bool {
        let lanes = self.lanes.lock().await;
        match lanes.get(&session_key.to_string()) {
            Some(lane) if lane.processing => {
                if let Some(cancel) = &lane.active_cancel {
                    cancel.cancel();
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    pub async fn queue_stats(&self, session_key: &SessionKey) -> QueueStats {
        let lanes = self.lanes.lock().await;
        lanes
            .get(&session_key.to_string())
            .map(|lane| QueueStats {
                queued: lane.queue.len(),
                processing: lane.processing,
            })
            .unwrap_or_default()
    }

    pub async fn global_stats(&self) -> GlobalStats {
        let (active_sessions, queued_total) = {
            let lanes = self.lanes.lock().await;
            (
                lanes.values().filter(|l| l.processing).count(),
                lanes.values().map(|l| l.queue.len()).sum(),
            )
        };
        let counters = self.counters.lock().await;
        GlobalStats {
            total_processed: counters.processed,
            total_failed: counters.failed,
            active_sessions,
            queued_total,
            sessions_seen: counters.seen.len(),
        }
    }

    /// Drive a lane: run the given run, then keep popping queued runs until
    /// the lane drains, clearing the processing flag at the end.
    fn spawn_drive(
        &self,
        key: String,
        run: Run,
        done: oneshot::Sender<Result<RunOutcome, String>>,
        cancel: CancellationToken,
    ) {
        let executor = self.executor.clone();
        let lanes = self.lanes.clone();
        let counters = self.counters.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut current = (run, done, cancel);
            loop {
                let (run, done, cancel) = current;
                let _ = events.send(RunEvent::Processing {
                    session_key: key.clone(),
                    run_id: run.id.clone(),
                    wait_ms: run.enqueued_at.elapsed().as_millis(),
                });

                let started = Instant::now();
                let result = executor.execute(&run, cancel).await;

                match &result {
                    Ok(RunOutcome::Completed(_)) => {
                        counters.lock().await.processed += 1;
                        let _ = events.send(RunEvent::Completed {
                            session_key: key.clone(),
                            run_id: run.id.clone(),
                            duration_ms: started.elapsed().as_millis(),
                        });
                    }
                    Ok(RunOutcome::Aborted) => {
                        let _ = events.send(RunEvent::Aborted {
                            session_key: key.clone(),
                            run_id: run.id.clone(),
                        });
                    }
                    Err(e) => {
                        counters.lock().await.failed += 1;
                        warn!("Run {} for {key} failed: {e}", run.id);
                        let _ = events.send(RunEvent::Failed {
                            session_key: key.clone(),
                            run_id: run.id.clone(),
                            error: e.to_string(),
                        });
                    }
                }

                // Submitter may have gone away; the queue must advance anyway.
                let _ = done.send(result.map_err(|e| e.to_string()));

                let mut lanes = lanes.lock().await;
                let Some(lane) = lanes.get_mut(&key) else {
                    break;
                };
                match lane.queue.pop_front() {
                    Some(next) => {
                        let cancel = CancellationToken::new();
                        lane.active_cancel = Some(cancel.clone());
                        current = (next.run, next.done, cancel);
                    }
                    None => {
                        lane.processing = false;
                        lane.active_cancel = None;
                        break;
                    }
                }
            }
        });
    }
}
