use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::{Supervisor, SupervisorError};

use super::{Job, JobId, Payload};

static JOB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fluent construction of a [`Job`].
///
/// # Example
///
/// ```
/// # use rsupervisor::job::builder::JobBuilder;
/// # use std::time::Duration;
/// let job = JobBuilder::new("verify")
///     .with_priority(5)
///     .with_field("model", "gpt")
///     .with_timeout(Duration::from_secs(30))
///     .with_tag("provider", "openai")
///     .build()
///     .unwrap();
///
/// assert!(job.id.as_str().starts_with("verify-"));
/// assert_eq!(job.payload["model"], "gpt");
/// ```
#[derive(Debug)]
pub struct JobBuilder {
    id: Option<JobId>,
    job_type: String,
    priority: i32,
    payload: Payload,
    data: Option<Result<Value, serde_json::Error>>,
    deadline: Option<DateTime<Utc>>,
    timeout: Option<Duration>,
    max_retries: Option<u32>,
    tags: HashMap<String, String>,
}

impl JobBuilder {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            id: None,
            job_type: job_type.into(),
            priority: 0,
            payload: Payload::new(),
            data: None,
            deadline: None,
            timeout: None,
            max_retries: None,
            tags: HashMap::new(),
        }
    }

    /// Use a caller supplied id instead of a generated one.
    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set a single payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload.extend(payload);
        self
    }

    /// Encode typed data as the payload.
    ///
    /// The data has to serialize to a JSON object; anything else fails in [`JobBuilder::build`].
    pub fn with_data<T: Serialize + ?Sized>(mut self, data: &T) -> Self {
        self.data = Some(serde_json::to_value(data));
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_tags<K, V>(mut self, tags: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tags
            .extend(tags.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn build(self) -> Result<Job, SupervisorError> {
        let mut payload = match self.data {
            Some(data) => match data? {
                Value::Object(map) => map,
                other => {
                    return Err(SupervisorError::InvalidJob(format!(
                        "job data must encode to a JSON object, got {other}"
                    )))
                }
            },
            None => Payload::new(),
        };
        payload.extend(self.payload);

        let id = self.id.unwrap_or_else(|| generate_id(&self.job_type));
        let mut job = Job::new(id, self.job_type);
        job.priority = self.priority;
        job.payload = payload;
        job.deadline = self.deadline;
        job.timeout = self.timeout;
        job.max_retries = self.max_retries;
        job.tags = self.tags;
        Ok(job)
    }

    /// Build the job and submit it.
    pub fn submit(self, supervisor: &Supervisor) -> Result<JobId, SupervisorError> {
        supervisor.submit_job(self.build()?)
    }
}

fn generate_id(job_type: &str) -> JobId {
    let sequence = JOB_COUNTER.fetch_add(1, Ordering::Relaxed);
    JobId::from(format!(
        "{job_type}-{}-{sequence}",
        Utc::now().timestamp_millis()
    ))
}
