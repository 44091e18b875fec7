//! # Worker Client
//!
//! The handle used to talk to a running [`WorkerActor`](crate::WorkerActor).

use crate::error::FrameworkError;
use crate::message::WorkerRequest;
use crate::status::WorkerStatus;
use crate::worker::PeriodicWorker;
use tokio::sync::{mpsc, oneshot};

/// A type-safe client for a `WorkerActor<T>`.
///
/// Holds only a sender, so cloning is cheap. When the last clone is dropped
/// the actor finishes its current cycle and exits.
pub struct WorkerClient<T: PeriodicWorker> {
    sender: mpsc::Sender<WorkerRequest<T>>,
}

impl<T: PeriodicWorker> Clone for WorkerClient<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T: PeriodicWorker> WorkerClient<T> {
    pub fn new(sender: mpsc::Sender<WorkerRequest<T>>) -> Self {
        Self { sender }
    }

    pub fn name(&self) -> &'static str {
        T::NAME
    }

    pub async fn status(&self) -> Result<WorkerStatus, FrameworkError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(WorkerRequest::Status { respond_to })
            .await
            .map_err(|_| FrameworkError::ActorClosed)?;
        response.await.map_err(|_| FrameworkError::ActorDropped)?
    }

    /// Runs one cycle immediately and returns its report.
    pub async fn trigger(&self) -> Result<T::Report, FrameworkError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(WorkerRequest::Trigger { respond_to })
            .await
            .map_err(|_| FrameworkError::ActorClosed)?;
        response.await.map_err(|_| FrameworkError::ActorDropped)?
    }

    pub async fn pause(&self) -> Result<(), FrameworkError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(WorkerRequest::Pause { respond_to })
            .await
            .map_err(|_| FrameworkError::ActorClosed)?;
        response.await.map_err(|_| FrameworkError::ActorDropped)?
    }

    pub async fn resume(&self) -> Result<(), FrameworkError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(WorkerRequest::Resume { respond_to })
            .await
            .map_err(|_| FrameworkError::ActorClosed)?;
        response.await.map_err(|_| FrameworkError::ActorDropped)?
    }
}
