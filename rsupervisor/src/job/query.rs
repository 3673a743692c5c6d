use std::collections::HashMap;

use super::{Job, JobStatus};

/// A filter over the live job table.
///
/// An empty query matches every job. Each added condition narrows the result.
///
/// ```
/// # use rsupervisor::job::{query::JobQuery, JobStatus};
/// let query = JobQuery::all()
///     .with_status(JobStatus::Failed)
///     .with_type("verify")
///     .tagged("provider", "openai");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    status: Option<JobStatus>,
    job_type: Option<String>,
    tags: HashMap<String, String>,
}

impl JobQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Only match jobs carrying this tag with this value.
    pub fn tagged(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |status| job.status == status)
            && self
                .job_type
                .as_ref()
                .map_or(true, |job_type| &job.job_type == job_type)
            && self
                .tags
                .iter()
                .all(|(key, value)| job.tags.get(key) == Some(value))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn job(job_type: &str, status: JobStatus, tags: &[(&str, &str)]) -> Job {
        let mut job = Job::new("job", job_type);
        job.status = status;
        job.tags = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        job
    }

    #[test]
    fn empty_query_matches_everything() {
        assert!(JobQuery::all().matches(&job("echo", JobStatus::Pending, &[])));
    }

    #[test]
    fn conditions_narrow_the_match() {
        let failed_verify = job("verify", JobStatus::Failed, &[("provider", "openai")]);
        let query = JobQuery::all()
            .with_status(JobStatus::Failed)
            .with_type("verify")
            .tagged("provider", "openai");

        assert!(query.matches(&failed_verify));
        assert!(!query.matches(&job("verify", JobStatus::Completed, &[("provider", "openai")])));
        assert!(!query.matches(&job("echo", JobStatus::Failed, &[("provider", "openai")])));
        assert!(!query.matches(&job("verify", JobStatus::Failed, &[("provider", "other")])));
        assert!(!query.matches(&job("verify", JobStatus::Failed, &[])));
    }
}
