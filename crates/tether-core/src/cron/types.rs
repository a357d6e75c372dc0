use serde::{Deserialize, Serialize};

/// Schedule type for a cron job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    At,
    Every,
    Cron,
}

/// Schedule definition for a cron job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronSchedule {
    pub kind: ScheduleKind,
    /// For "at": timestamp in milliseconds since epoch.
    pub at_ms: Option<i64>,
    /// For "every": interval in milliseconds.
    pub every_ms: Option<i64>,
    /// For "cron": cron expression (e.g. "0 9 * * *").
    pub expr: Option<String>,
}

impl CronSchedule {
    pub fn at(at_ms: i64) -> Self {
        Self {
            kind: ScheduleKind::At,
            at_ms: Some(at_ms),
            every_ms: None,
            expr: None,
        }
    }

    pub fn every(every_ms: i64) -> Self {
        Self {
            kind: ScheduleKind::Every,
            at_ms: None,
            every_ms: Some(every_ms),
            expr: None,
        }
    }

    pub fn cron(expr: &str) -> Self {
        Self {
            kind: ScheduleKind::Cron,
            at_ms: None,
            every_ms: None,
            expr: Some(expr.into()),
        }
    }
}

/// Where the fired message goes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTarget {
    pub channel: String,
    pub chat_id: String,
}

/// Execution state of a cron job.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CronJobState {
    pub next_run_at_ms: Option<i64>,
    pub last_run_at_ms: Option<i64>,
    pub last_status: Option<String>,
    pub last_error: Option<String>,
}

/// A persisted scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub schedule: CronSchedule,
    pub target: JobTarget,
    pub session_key: String,
    pub message: String,
    /// true: submit through the run coordinator and deliver the response;
    /// false: deliver the message text verbatim.
    #[serde(default)]
    pub invoke_agent: bool,
    pub state: CronJobState,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

fn default_true() -> bool {
    true
}

/// Parameters for creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub schedule: CronSchedule,
    pub message: String,
    pub invoke_agent: bool,
    pub target: JobTarget,
    pub session_key: String,
}

/// Fire event handed to the orchestrator. The scheduler knows nothing about
/// delivery mechanics.
#[derive(Debug, Clone)]
pub struct JobFired {
    pub job_id: String,
    pub channel: String,
    pub chat_id: String,
    pub session_key: String,
    pub message: String,
    pub invoke_agent: bool,
}

/// Persistence format for the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronStore {
    pub version: u32,
    pub jobs: Vec<CronJob>,
}

impl Default for CronStore {
    fn default() -> Self {
        Self {
            version: 1,
            jobs: Vec::new(),
        }
    }
}
