//! # Worker Messages
//!
//! Requests sent from a [`WorkerClient`](crate::WorkerClient) to its
//! [`WorkerActor`](crate::WorkerActor). Each carries a one-shot channel for
//! the reply; the actor answers between cycles, in arrival order.

use crate::error::FrameworkError;
use crate::status::WorkerStatus;
use crate::worker::PeriodicWorker;
use tokio::sync::oneshot;

/// Type alias for the one-shot response channel used by actors.
pub type Response<T> = oneshot::Sender<Result<T, FrameworkError>>;

/// Control requests understood by every worker actor.
///
/// - **Status**: snapshot of counters and state.
/// - **Trigger**: run one cycle now and return its report.
/// - **Pause** / **Resume**: suspend and re-arm the cycle timer.
#[derive(Debug)]
pub enum WorkerRequest<T: PeriodicWorker> {
    Status {
        respond_to: Response<WorkerStatus>,
    },
    Trigger {
        respond_to: Response<T::Report>,
    },
    Pause {
        respond_to: Response<()>,
    },
    Resume {
        respond_to: Response<()>,
    },
}
