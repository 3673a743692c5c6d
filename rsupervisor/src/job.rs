//! Jobs: the units of work the supervisor schedules.
//!
//! A [`Job`] is owned by the supervisor once submitted. Callers only ever see clones of it through
//! [`crate::Supervisor::job_status`], [`crate::Supervisor::query_jobs`] and the outcome stream.
use std::{collections::HashMap, fmt::Display, time::Duration};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::worker::WorkerId;

pub mod builder;
pub mod query;
pub(crate) mod runner;
pub(crate) mod table;

/// The opaque key/value payload handed to the handler.
pub type Payload = serde_json::Map<String, Value>;

/// The unique identifier of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// The lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Timeout,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        f.write_str(status)
    }
}

/// A unit of work.
///
/// Construct one with [`Job::new`] or [`builder::JobBuilder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Selects the handler and the workers able to run the job.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Higher is more urgent. Advisory only.
    pub priority: i32,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    /// Past this instant the job is no longer worth running.
    pub deadline: Option<DateTime<Utc>>,
    /// Per job execution timeout, capped by [`crate::config::SupervisorConfig::job_timeout`].
    pub timeout: Option<Duration>,
    /// When unset the supervisor's `retry_attempts` applies on submission.
    pub max_retries: Option<u32>,
    pub retry_count: u32,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub assigned_worker: Option<WorkerId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tags: HashMap<String, String>,
    /// Number of times the job has been handed to a worker.
    #[serde(default)]
    pub attempt: u32,
    /// One entry per finished attempt.
    #[serde(default)]
    pub executions: Vec<JobExecution>,
}

impl Job {
    pub fn new(id: impl Into<JobId>, job_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            job_type: job_type.into(),
            priority: 0,
            payload: Payload::new(),
            created_at: Utc::now(),
            deadline: None,
            timeout: None,
            max_retries: None,
            retry_count: 0,
            status: JobStatus::Pending,
            result: None,
            error: None,
            assigned_worker: None,
            started_at: None,
            completed_at: None,
            tags: HashMap::new(),
            attempt: 0,
            executions: Vec::new(),
        }
    }

    /// Decode the payload into a typed value.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }

    /// Decode the stored result into a typed value.
    pub fn result_as<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.result.clone().map(serde_json::from_value)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// The kind of failure recorded for an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// The handler returned an error.
    Handler,
    Panic,
    Timeout,
    Cancelled,
    CircuitOpen,
    NoHandler,
    /// The dispatcher could neither place nor requeue the job.
    Dropped,
    /// The deadline passed before the job could run.
    Expired,
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let error_type = match self {
            Self::Handler => "handler",
            Self::Panic => "panic",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::CircuitOpen => "circuit_open",
            Self::NoHandler => "no_handler",
            Self::Dropped => "dropped",
            Self::Expired => "expired",
        };
        f.write_str(error_type)
    }
}

/// A normalised execution failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub error_type: ErrorType,
    pub message: String,
}

impl ExecutionError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }
}

impl Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// The record of a single finished attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub attempt: u32,
    pub worker_id: Option<WorkerId>,
    /// One of completed, failed, timeout or cancelled.
    pub status: JobStatus,
    pub error: Option<ExecutionError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Published whenever a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub worker_id: Option<WorkerId>,
    /// Duration of the last attempt.
    pub duration: Duration,
    pub finished_at: DateTime<Utc>,
}

impl From<&Job> for JobOutcome {
    fn from(job: &Job) -> Self {
        let last = job.executions.last();
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            status: job.status,
            result: job.result.clone(),
            error: job.error.clone(),
            retry_count: job.retry_count,
            worker_id: last.and_then(|execution| execution.worker_id.clone()),
            duration: last.map_or(Duration::ZERO, |execution| execution.duration),
            finished_at: job.completed_at.unwrap_or_else(Utc::now),
        }
    }
}
