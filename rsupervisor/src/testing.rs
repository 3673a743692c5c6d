//! Helpers for testing code that submits jobs to a [`Supervisor`].
use std::time::Duration;

use crate::{
    job::{Job, JobId},
    Supervisor,
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Wait until the job reaches a terminal state and return it.
///
/// # Panics
///
/// If the job cannot be found or is still not finished after `within`.
pub async fn wait_for_job(supervisor: &Supervisor, job_id: &JobId, within: Duration) -> Job {
    let poll = async {
        loop {
            match supervisor.job_status(job_id) {
                Ok(job) if job.is_terminal() => return job,
                Ok(_) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(err) => panic!("Failed to look up job {job_id}: {err}"),
            }
        }
    };
    match tokio::time::timeout(within, poll).await {
        Ok(job) => job,
        Err(_) => panic!(
            "Job {job_id} did not finish within {within:?}\n\nCurrent state:\n{:#?}",
            supervisor.job_status(job_id)
        ),
    }
}

/// A macro for making assertions about a job.
///
/// Assertions can be made on the status, the retry count and the error message.
///
/// # Example
///
/// ```
/// # use rsupervisor::prelude::*;
/// # use rsupervisor::testing::assert_job;
/// let mut job = Job::new("job-1", "verify");
/// job.status = JobStatus::Failed;
/// job.retry_count = 2;
/// job.error = Some("upstream returned 503".to_owned());
///
/// assert_job!(job, status: JobStatus::Failed, retry_count: 2, error_contains: "503");
/// ```
#[macro_export]
macro_rules! assert_job {
    (@check $job:ident;) => {};
    (@check $job:ident; status: $status:expr $(, $($tail:tt)*)?) => {
        assert_eq!(
            $job.status,
            $status,
            "Unexpected status of job {}\n\n{:#?}",
            $job.id,
            $job,
        );
        $($crate::assert_job!(@check $job; $($tail)*);)?
    };
    (@check $job:ident; retry_count: $count:expr $(, $($tail:tt)*)?) => {
        assert_eq!(
            $job.retry_count,
            $count,
            "Unexpected retry count of job {}\n\n{:#?}",
            $job.id,
            $job,
        );
        $($crate::assert_job!(@check $job; $($tail)*);)?
    };
    (@check $job:ident; error_contains: $text:expr $(, $($tail:tt)*)?) => {
        let error = $job.error.as_deref().unwrap_or_default();
        assert!(
            error.contains($text),
            "Error of job {} does not contain {:?}: {:?}",
            $job.id,
            $text,
            error,
        );
        $($crate::assert_job!(@check $job; $($tail)*);)?
    };
    ($job:expr, $($tail:tt)*) => {{
        let job: &$crate::job::Job = &$job;
        $crate::assert_job!(@check job; $($tail)*);
    }};
}

pub use assert_job;

#[cfg(test)]
mod test {
    use super::*;
    use crate::{config::SupervisorConfig, job::JobStatus};

    #[test]
    fn assert_job_checks_every_field() {
        let mut job = Job::new("job", "echo");
        job.status = JobStatus::Timeout;
        job.retry_count = 1;
        job.error = Some("deadline exceeded".to_owned());

        assert_job!(job, status: JobStatus::Timeout);
        assert_job!(job, retry_count: 1, error_contains: "deadline",);
        assert_job!(
            job,
            error_contains: "exceeded",
            status: JobStatus::Timeout,
            retry_count: 1
        );
    }

    #[test]
    #[should_panic(expected = "Unexpected status of job job")]
    fn assert_job_reports_mismatches() {
        let job = Job::new("job", "echo");
        assert_job!(job, status: JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    #[should_panic(expected = "did not finish")]
    async fn waiting_gives_up() {
        let supervisor = Supervisor::new(SupervisorConfig::default()).unwrap();
        let job_id = supervisor.submit_job(Job::new("job", "echo")).unwrap();

        wait_for_job(&supervisor, &job_id, Duration::from_secs(1)).await;
    }
}
