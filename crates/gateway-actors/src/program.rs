//! # ProgramClient Trait
//!
//! Type-erased view of a [`WorkerClient`] so a supervisor can keep clients of
//! different worker types in one collection.
use crate::{FrameworkError, PeriodicWorker, WorkerClient, WorkerStatus};
use async_trait::async_trait;

/// Operations a supervisor needs from any worker, whatever its report type.
#[async_trait]
pub trait ProgramClient: Send + Sync {
    /// Program name as used in logs and configuration.
    fn name(&self) -> &str;

    async fn status(&self) -> Result<WorkerStatus, FrameworkError>;

    async fn pause(&self) -> Result<(), FrameworkError>;

    async fn resume(&self) -> Result<(), FrameworkError>;
}

#[async_trait]
impl<T: PeriodicWorker> ProgramClient for WorkerClient<T> {
    fn name(&self) -> &str {
        T::NAME
    }

    #[tracing::instrument(skip(self), fields(program = T::NAME))]
    async fn status(&self) -> Result<WorkerStatus, FrameworkError> {
        WorkerClient::status(self).await
    }

    #[tracing::instrument(skip(self), fields(program = T::NAME))]
    async fn pause(&self) -> Result<(), FrameworkError> {
        tracing::debug!("Sending request");
        WorkerClient::pause(self).await
    }

    #[tracing::instrument(skip(self), fields(program = T::NAME))]
    async fn resume(&self) -> Result<(), FrameworkError> {
        tracing::debug!("Sending request");
        WorkerClient::resume(self).await
    }
}
