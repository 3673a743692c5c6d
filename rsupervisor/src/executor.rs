//! Typed executors.
//!
//! [`crate::handler::TaskHandler`] deals in untyped JSON. Most job kinds are better expressed with
//! a concrete payload and output type: implement [`Executor`] and register it with
//! [`crate::Supervisor::register_executor`]. The payload is decoded before [`Executor::execute`]
//! runs and the output encoded afterwards, so a malformed payload is an ordinary job failure.
//!
//! # Example
//!
//! ```
//! # use rsupervisor::prelude::*;
//! # use serde::{Deserialize, Serialize};
//! #[derive(Serialize, Deserialize)]
//! struct Resize {
//!     width: u32,
//!     height: u32,
//! }
//!
//! struct ResizeExecutor;
//!
//! #[async_trait::async_trait]
//! impl Executor for ResizeExecutor {
//!     type Data = Resize;
//!     type Output = u64;
//!     const NAME: &'static str = "resize";
//!     const MAX_RETRIES: Option<u32> = Some(1);
//!
//!     async fn execute(&self, _ctx: JobContext, data: Resize) -> Result<u64, HandlerError> {
//!         Ok(u64::from(data.width) * u64::from(data.height))
//!     }
//! }
//!
//! let job = ResizeExecutor::builder()
//!     .with_data(&Resize { width: 2, height: 3 })
//!     .build()
//!     .unwrap();
//! assert_eq!(job.job_type, "resize");
//! assert_eq!(job.max_retries, Some(1));
//! ```
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::{
    handler::{HandlerError, JobContext, TaskHandler},
    job::{builder::JobBuilder, Job},
};

/// A job kind with typed data.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// The payload type. It has to serialize to a JSON object.
    type Data: DeserializeOwned + Send;
    type Output: Serialize + Send;
    /// The job type this executor handles.
    const NAME: &'static str;
    /// Overrides the supervisor's default retry budget when set.
    const MAX_RETRIES: Option<u32> = None;
    /// Whether the circuit breaker guards this executor.
    const PROTECTED: bool = true;

    async fn execute(&self, ctx: JobContext, data: Self::Data)
        -> Result<Self::Output, HandlerError>;

    fn builder() -> JobBuilder
    where
        Self: Sized,
    {
        let builder = JobBuilder::new(Self::NAME);
        match Self::MAX_RETRIES {
            Some(max_retries) => builder.with_max_retries(max_retries),
            None => builder,
        }
    }
}

/// Adapts an [`Executor`] to the untyped handler contract.
pub(crate) struct ExecutorHandler<E>(pub E);

#[async_trait]
impl<E: Executor> TaskHandler for ExecutorHandler<E> {
    async fn handle(&self, ctx: JobContext, job: Job) -> Result<Value, HandlerError> {
        let data: E::Data = job.data()?;
        let output = self.0.execute(ctx, data).await?;
        Ok(serde_json::to_value(output)?)
    }

    fn is_protected(&self) -> bool {
        E::PROTECTED
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::time::Duration;

    use serde::Deserialize;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    pub(crate) struct Sum {
        pub values: Vec<i64>,
    }

    pub(crate) struct SumExecutor;

    #[async_trait]
    impl Executor for SumExecutor {
        type Data = Sum;
        type Output = i64;
        const NAME: &'static str = "sum";
        const PROTECTED: bool = false;

        async fn execute(&self, _ctx: JobContext, data: Sum) -> Result<i64, HandlerError> {
            Ok(data.values.iter().sum())
        }
    }

    fn context() -> JobContext {
        JobContext::new(
            "job".into(),
            1,
            "worker".into(),
            CancellationToken::new(),
            Instant::now() + Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn decodes_the_payload_and_encodes_the_output() {
        let job = SumExecutor::builder()
            .with_data(&Sum {
                values: vec![1, 2, 3],
            })
            .build()
            .unwrap();

        let result = ExecutorHandler(SumExecutor).handle(context(), job).await;

        assert_eq!(result.unwrap(), Value::from(6));
    }

    #[tokio::test]
    async fn malformed_payload_is_a_handler_error() {
        let mut job = Job::new("job", SumExecutor::NAME);
        job.payload.insert("values".to_owned(), "nope".into());

        let result = ExecutorHandler(SumExecutor).handle(context(), job).await;

        assert!(result.is_err());
    }

    #[test]
    fn protection_follows_the_executor() {
        assert!(!ExecutorHandler(SumExecutor).is_protected());
    }
}
