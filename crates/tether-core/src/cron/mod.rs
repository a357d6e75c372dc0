pub mod service;
pub mod types;

pub use service::CronService;
pub use types::{CronJob, CronJobState, CronSchedule, CronStore, JobFired, JobTarget, NewJob, ScheduleKind};
