use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use croner::Cron;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cron::types::*;

/// Durable store of time-triggered jobs with a single re-armed timer.
///
/// Jobs fire as `JobFired` events over the provided channel; the consumer
/// (the gateway) decides between agent invocation and verbatim delivery.
/// One-shot jobs are removed after firing; recurring jobs advance their
/// next fire time and persist.
pub struct CronService {
    store_path: PathBuf,
    jobs: Vec<CronJob>,
    timer_handle: Option<JoinHandle<()>>,
    fired_tx: mpsc::Sender<JobFired>,
}

impl CronService {
    pub fn new(store_path: PathBuf, fired_tx: mpsc::Sender<JobFired>) -> Self {
        Self {
            store_path,
            jobs: Vec::new(),
            timer_handle: None,
            fired_tx,
        }
    }

    /// Refresh in-memory jobs from disk.
    ///
    /// The timer loop updates persisted state independently, so API
    /// operations reload first to avoid acting on stale in-memory data.
    fn refresh_from_disk(&mut self) {
        if let Err(e) = self.load() {
            warn!("Failed to refresh cron store from disk: {e}");
        }
    }

    /// Load jobs from disk and start the timer.
    pub async fn start(&mut self) -> Result<()> {
        self.load()?;
        self.arm_timer();
        info!("Cron service started with {} jobs", self.jobs.len());
        Ok(())
    }

    /// Stop the timer.
    pub fn stop(&mut self) {
        if let Some(handle) = self.timer_handle.take() {
            handle.abort();
            info!("Cron service stopped");
        }
    }

    /// List all jobs (optionally including disabled).
    pub fn list_jobs(&mut self, include_disabled: bool) -> Vec<&CronJob> {
        self.refresh_from_disk();
        self.jobs
            .iter()
            .filter(|j| include_disabled || j.enabled)
            .collect()
    }

    /// Add a new job.
    pub fn add_job(&mut self, new: NewJob) -> Result<CronJob> {
        self.refresh_from_disk();
        let now_ms = Utc::now().timestamp_millis();
        let id = uuid::Uuid::new_v4().to_string()[..8].to_string();

        let next_run = compute_next_run(&new.schedule, now_ms)?;

        let job = CronJob {
            id: id.clone(),
            name: new.name.chars().take(30).collect(),
            enabled: true,
            schedule: new.schedule,
            target: new.target,
            session_key: new.session_key,
            message: new.message,
            invoke_agent: new.invoke_agent,
            state: CronJobState {
                next_run_at_ms: next_run,
                ..Default::default()
            },
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        };

        self.jobs.push(job.clone());
        self.save()?;
        self.arm_timer();

        info!("Added cron job '{}' (id: {})", job.name, id);
        Ok(job)
    }

    /// Remove a job by ID.
    pub fn remove_job(&mut self, job_id: &str) -> bool {
        self.refresh_from_disk();
        let len_before = self.jobs.len();
        self.jobs.retain(|j| j.id != job_id);
        let removed = self.jobs.len() < len_before;
        if removed {
            let _ = self.save();
            self.arm_timer();
            info!("Removed cron job {job_id}");
        }
        removed
    }

    /// Enable or disable a job.
    pub fn enable_job(&mut self, job_id: &str, enabled: bool) -> Option<&CronJob> {
        self.refresh_from_disk();
        if let Some(job) = self.jobs.iter_mut().find(|j| j.id == job_id) {
            job.enabled = enabled;
            job.updated_at_ms = Utc::now().timestamp_millis();
            if enabled {
                let now_ms = Utc::now().timestamp_millis();
                job.state.next_run_at_ms = compute_next_run(&job.schedule, now_ms).unwrap_or(None);
            }
            let _ = self.save();
            self.arm_timer();
            self.jobs.iter().find(|j| j.id == job_id)
        } else {
            None
        }
    }

    /// Emit fire events for due jobs (called by the timer).
    ///
    /// Re-reads the store first: API operations rewrite it between timer
    /// wakes, and persisting this task's snapshot over their changes would
    /// lose jobs across a restart. Returns the refreshed set.
    async fn execute_due_jobs(
        snapshot: Vec<CronJob>,
        store_path: &Path,
        fired_tx: &mpsc::Sender<JobFired>,
    ) -> Vec<CronJob> {
        let mut jobs = std::fs::read_to_string(store_path)
            .ok()
            .and_then(|c| serde_json::from_str::<CronStore>(&c).ok())
            .map(|s| s.jobs)
            .unwrap_or(snapshot);

        let now_ms = Utc::now().timestamp_millis();
        let mut fired_one_shots = Vec::new();

        for job in jobs.iter_mut() {
            if !job.enabled {
                continue;
            }
            let next = match job.state.next_run_at_ms {
                Some(t) => t,
                None => continue,
            };
            if now_ms < next {
                continue;
            }

            info!("Firing cron job '{}' (id: {})", job.name, job.id);

            let fired = JobFired {
                job_id: job.id.clone(),
                channel: job.target.channel.clone(),
                chat_id: job.target.chat_id.clone(),
                session_key: job.session_key.clone(),
                message: job.message.clone(),
                invoke_agent: job.invoke_agent,
            };

            let handed_off = match fired_tx.send(fired).await {
                Ok(()) => {
                    job.state.last_status = Some("ok".to_string());
                    job.state.last_error = None;
                    true
                }
                Err(e) => {
                    warn!("Failed to hand off cron job {}: {e}", job.id);
                    job.state.last_status = Some("error".to_string());
                    job.state.last_error = Some(format!("hand-off failed: {e}"));
                    false
                }
            };

            job.state.last_run_at_ms = Some(now_ms);
            job.updated_at_ms = now_ms;

            if job.schedule.kind == ScheduleKind::At {
                if handed_off {
                    fired_one_shots.push(job.id.clone());
                } else {
                    // Keep the record for inspection; it will not refire.
                    job.state.next_run_at_ms = None;
                }
            } else {
                job.state.next_run_at_ms = compute_next_run(&job.schedule, now_ms).unwrap_or(None);
            }
        }

        // One-shot jobs are removed after a successful fire
        jobs.retain(|j| !fired_one_shots.contains(&j.id));

        let store = CronStore {
            version: 1,
            jobs: jobs.clone(),
        };
        if let Ok(json) = serde_json::to_string_pretty(&store) {
            let _ = std::fs::write(store_path, json);
        }

        jobs
    }

    /// Arm the timer to wake at the next due job.
    ///
    /// Spawns a background loop that sleeps until the next job is due,
    /// fires it, and re-arms for the next one. The loop exits when no
    /// enabled job has a next fire time.
    fn arm_timer(&mut self) {
        if let Some(handle) = self.timer_handle.take() {
            handle.abort();
        }

        let mut jobs = self.jobs.clone();
        let store_path = self.store_path.clone();
        let fired_tx = self.fired_tx.clone();

        self.timer_handle = Some(tokio::spawn(async move {
            loop {
                let now_ms = Utc::now().timestamp_millis();
                let earliest = jobs
                    .iter()
                    .filter(|j| j.enabled)
                    .filter_map(|j| j.state.next_run_at_ms)
                    .min();

                let sleep_ms = match earliest {
                    Some(t) if t > now_ms => (t - now_ms) as u64,
                    Some(_) => 0,  // Already due
                    None => break, // Nothing to schedule
                };

                if sleep_ms > 0 {
                    tokio::time::sleep(tokio::time::Duration::from_millis(sleep_ms)).await;
                }

                jobs = Self::execute_due_jobs(jobs, &store_path, &fired_tx).await;

                let has_scheduled = jobs
                    .iter()
                    .any(|j| j.enabled && j.state.next_run_at_ms.is_some());
                if !has_scheduled {
                    break;
                }
            }
        }));
    }

    fn load(&mut self) -> Result<()> {
        if !self.store_path.exists() {
            self.jobs = Vec::new();
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.store_path)?;
        let store: CronStore = serde_json::from_str(&content)?;
        self.jobs = store.jobs;

        // Recompute next fire for enabled recurring jobs
        let now_ms = Utc::now().timestamp_millis();
        for job in &mut self.jobs {
            if job.enabled && job.schedule.kind != ScheduleKind::At {
                job.state.next_run_at_ms = compute_next_run(&job.schedule, now_ms).unwrap_or(None);
            }
        }

        Ok(())
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.store_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = CronStore {
            version: 1,
            jobs: self.jobs.clone(),
        };
        let json = serde_json::to_string_pretty(&store)?;
        std::fs::write(&self.store_path, json)?;
        Ok(())
    }
}

/// Compute the next fire time for a schedule.
pub(crate) fn compute_next_run(schedule: &CronSchedule, now_ms: i64) -> Result<Option<i64>> {
    match schedule.kind {
        ScheduleKind::At => {
            // One-time: schedulable only while in the future
            match schedule.at_ms {
                Some(t) if t > now_ms => Ok(Some(t)),
                _ => Ok(None),
            }
        }
        ScheduleKind::Every => match schedule.every_ms {
            Some(interval) if interval > 0 => Ok(Some(now_ms + interval)),
            _ => Ok(None),
        },
        ScheduleKind::Cron => {
            let expr = schedule
                .expr
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("cron schedule missing expr"))?;

            let cron = Cron::new(expr)
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid cron expression '{expr}': {e}"))?;

            let now = chrono::DateTime::from_timestamp_millis(now_ms).unwrap_or_else(Utc::now);

            match cron.find_next_occurrence(&now, false) {
                Ok(next) => Ok(Some(next.timestamp_millis())),
                Err(_) => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn new_job(schedule: CronSchedule, message: &str, invoke: bool) -> NewJob {
        NewJob {
            name: "test job".into(),
            schedule,
            message: message.into(),
            invoke_agent: invoke,
            target: JobTarget {
                channel: "telegram".into(),
                chat_id: "42".into(),
            },
            session_key: "tether:telegram:42".into(),
        }
    }

    // --- compute_next_run ---

    #[test]
    fn at_schedule_future_and_past() {
        let future = now_ms() + 60_000;
        assert_eq!(
            compute_next_run(&CronSchedule::at(future), now_ms()).unwrap(),
            Some(future)
        );
        assert_eq!(
            compute_next_run(&CronSchedule::at(now_ms() - 60_000), now_ms()).unwrap(),
            None
        );
    }

    #[test]
    fn every_schedule_advances_from_now() {
        let now = now_ms();
        assert_eq!(
            compute_next_run(&CronSchedule::every(30_000), now).unwrap(),
            Some(now + 30_000)
        );
        assert_eq!(compute_next_run(&CronSchedule::every(0), now).unwrap(), None);
    }

    #[test]
    fn daily_cron_advances_to_next_day_after_firing() {
        let schedule = CronSchedule::cron("0 9 * * *");
        let first = compute_next_run(&schedule, now_ms()).unwrap().unwrap();
        // Recompute as if we just fired at that instant
        let second = compute_next_run(&schedule, first).unwrap().unwrap();
        assert_eq!(second - first, 24 * 60 * 60 * 1000);
    }

    #[test]
    fn invalid_cron_expression_rejected() {
        assert!(compute_next_run(&CronSchedule::cron("not a cron"), now_ms()).is_err());
        let missing = CronSchedule {
            kind: ScheduleKind::Cron,
            at_ms: None,
            every_ms: None,
            expr: None,
        };
        assert!(compute_next_run(&missing, now_ms()).is_err());
    }

    // --- CronService ---

    #[tokio::test]
    async fn add_list_remove_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let mut svc = CronService::new(dir.path().join("cron/jobs.json"), tx);

        let job = svc
            .add_job(new_job(CronSchedule::every(60_000), "do stuff", false))
            .unwrap();
        assert!(job.enabled);
        assert!(job.state.next_run_at_ms.is_some());
        assert_eq!(svc.list_jobs(false).len(), 1);

        assert!(svc.remove_job(&job.id));
        assert!(svc.list_jobs(true).is_empty());
        assert!(!svc.remove_job("nonexistent"));
    }

    #[tokio::test]
    async fn disabled_jobs_filtered_from_listing() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let mut svc = CronService::new(dir.path().join("cron/jobs.json"), tx);

        let job = svc
            .add_job(new_job(CronSchedule::every(60_000), "m1", false))
            .unwrap();
        svc.add_job(new_job(CronSchedule::every(60_000), "m2", false))
            .unwrap();
        svc.enable_job(&job.id, false);

        assert_eq!(svc.list_jobs(false).len(), 1);
        assert_eq!(svc.list_jobs(true).len(), 2);
    }

    #[tokio::test]
    async fn one_shot_fires_once_and_is_removed_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("cron/jobs.json");
        let (tx, mut rx) = mpsc::channel(4);
        let mut svc = CronService::new(store_path.clone(), tx);
        svc.start().await.unwrap();

        svc.add_job(new_job(CronSchedule::at(now_ms() + 300), "ping", false))
            .unwrap();

        let fired = timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("job should fire within deadline")
            .unwrap();
        assert_eq!(fired.message, "ping");
        assert_eq!(fired.chat_id, "42");
        assert!(!fired.invoke_agent);

        // Nothing fires twice
        assert!(timeout(Duration::from_millis(700), rx.recv()).await.is_err());

        // Removed from the persisted store
        let store: CronStore =
            serde_json::from_str(&std::fs::read_to_string(&store_path).unwrap()).unwrap();
        assert!(store.jobs.is_empty());
    }

    #[tokio::test]
    async fn recurring_job_persists_with_advanced_next_fire() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("cron/jobs.json");
        let (tx, mut rx) = mpsc::channel(4);
        let mut svc = CronService::new(store_path.clone(), tx);
        svc.start().await.unwrap();

        svc.add_job(new_job(CronSchedule::every(300), "tick", true))
            .unwrap();

        let fired = timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("recurring job should fire")
            .unwrap();
        assert!(fired.invoke_agent);

        let store: CronStore =
            serde_json::from_str(&std::fs::read_to_string(&store_path).unwrap()).unwrap();
        assert_eq!(store.jobs.len(), 1, "recurring job record remains");
        let next = store.jobs[0].state.next_run_at_ms.unwrap();
        let last = store.jobs[0].state.last_run_at_ms.unwrap();
        assert_eq!(next - last, 300);
    }

    #[tokio::test]
    async fn timer_does_not_clobber_jobs_added_behind_its_back() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("cron/jobs.json");
        let (tx, mut rx) = mpsc::channel(4);
        let mut svc = CronService::new(store_path.clone(), tx);
        svc.start().await.unwrap();

        svc.add_job(new_job(CronSchedule::at(now_ms() + 400), "ping", false))
            .unwrap();

        // While the timer sleeps on its snapshot, write a second job
        // straight into the store, as a concurrent API call would.
        let mut store: CronStore =
            serde_json::from_str(&std::fs::read_to_string(&store_path).unwrap()).unwrap();
        store.jobs.push(CronJob {
            id: "late1234".into(),
            name: "added later".into(),
            enabled: true,
            schedule: CronSchedule::every(60_000),
            target: JobTarget {
                channel: "telegram".into(),
                chat_id: "42".into(),
            },
            session_key: "tether:telegram:42".into(),
            message: "still here".into(),
            invoke_agent: false,
            state: CronJobState {
                next_run_at_ms: Some(now_ms() + 60_000),
                ..Default::default()
            },
            created_at_ms: now_ms(),
            updated_at_ms: now_ms(),
        });
        std::fs::write(&store_path, serde_json::to_string_pretty(&store).unwrap()).unwrap();

        let fired = timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("one-shot should fire")
            .unwrap();
        assert_eq!(fired.message, "ping");

        // The timer must persist the refreshed set, not its stale snapshot.
        // The store write lands just after the fire event; poll briefly.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let store: CronStore =
                serde_json::from_str(&std::fs::read_to_string(&store_path).unwrap()).unwrap();
            if store.jobs.len() == 1 && store.jobs[0].id == "late1234" {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "store should settle to the job added behind the timer's back, got: {:?}",
                store.jobs.iter().map(|j| j.id.clone()).collect::<Vec<_>>()
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn persistence_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("cron/jobs.json");
        let (tx, _rx) = mpsc::channel(4);
        let mut svc = CronService::new(store_path.clone(), tx.clone());

        let job = svc
            .add_job(new_job(CronSchedule::every(60_000), "hello", true))
            .unwrap();

        let mut svc2 = CronService::new(store_path, tx);
        svc2.start().await.unwrap();

        let jobs = svc2.list_jobs(true);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);
        assert_eq!(jobs[0].message, "hello");
        assert!(jobs[0].invoke_agent);
        assert_eq!(jobs[0].session_key, "tether:telegram:42");
    }

    #[tokio::test]
    async fn job_name_truncated_to_thirty_chars() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let mut svc = CronService::new(dir.path().join("jobs.json"), tx);
        let mut nj = new_job(CronSchedule::every(60_000), "msg", false);
        nj.name = "a".repeat(50);
        let job = svc.add_job(nj).unwrap();
        assert_eq!(job.name.len(), 30);
    }
}
