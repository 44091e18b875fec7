//! # Worker Actor
//!
//! The server half of a periodic program. It owns the worker instance, the
//! receiving end of the request channel and the status counters, and drives
//! cycles on a timer.
//!
//! Requests and timer ticks are handled one at a time, so the worker never
//! needs interior locking. Each cycle is spawned onto its own Tokio task: a
//! panic inside a cycle only loses that worker instance, which the actor
//! rebuilds from its parameters after a backoff.

use crate::client::WorkerClient;
use crate::error::FrameworkError;
use crate::message::WorkerRequest;
use crate::status::{WorkerState, WorkerStatus};
use crate::worker::{PeriodicWorker, RestartPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

enum Event<T: PeriodicWorker> {
    Request(Option<WorkerRequest<T>>),
    Tick,
}

/// The generic actor that drives one [`PeriodicWorker`].
///
/// # Usage Pattern
///
/// 1. **Create**: `WorkerActor::new()` returns the actor and its client.
/// 2. **Wire & Run**: spawn `actor.run(context)` with the shared dependencies.
/// 3. **Use**: keep the client to query status, trigger or pause the worker;
///    drop every clone to shut it down.
pub struct WorkerActor<T: PeriodicWorker> {
    receiver: mpsc::Receiver<WorkerRequest<T>>,
    params: T::Params,
    policy: RestartPolicy,
    status: WorkerStatus,
    worker: Option<T>,
    start_failures: u32,
    next_at: Instant,
}

impl<T: PeriodicWorker> WorkerActor<T> {
    /// Creates a new `WorkerActor` and its associated `WorkerClient`.
    ///
    /// `buffer_size` bounds the number of queued requests; senders wait when
    /// the channel is full.
    pub fn new(
        params: T::Params,
        policy: RestartPolicy,
        buffer_size: usize,
    ) -> (Self, WorkerClient<T>) {
        let (sender, receiver) = mpsc::channel(buffer_size);
        let actor = Self {
            receiver,
            params,
            policy,
            status: WorkerStatus::new(T::NAME),
            worker: None,
            start_failures: 0,
            next_at: Instant::now(),
        };
        (actor, WorkerClient::new(sender))
    }

    /// Runs the actor's event loop until every client has been dropped.
    pub async fn run(mut self, context: T::Context) {
        let program = T::NAME;
        let ctx = Arc::new(context);
        info!(program, "Worker started");

        loop {
            let scheduled = self.status.state.is_scheduled();
            let event = tokio::select! {
                msg = self.receiver.recv() => Event::Request(msg),
                _ = sleep_until(self.next_at), if scheduled => Event::Tick,
            };

            match event {
                Event::Request(None) => break,
                Event::Request(Some(request)) => self.handle_request(request, &ctx).await,
                Event::Tick => self.tick(&ctx).await,
            }
        }

        info!(
            program,
            cycles = self.status.cycles,
            failed = self.status.failed_cycles,
            restarts = self.status.restarts,
            "Shutdown"
        );
    }

    async fn handle_request(&mut self, request: WorkerRequest<T>, ctx: &Arc<T::Context>) {
        let program = T::NAME;
        match request {
            WorkerRequest::Status { respond_to } => {
                let _ = respond_to.send(Ok(self.status.clone()));
            }
            WorkerRequest::Trigger { respond_to } => {
                debug!(program, "Trigger");
                let result = match self.status.state {
                    WorkerState::Paused => Err(FrameworkError::Paused),
                    WorkerState::Running if self.worker.is_some() => self.cycle(ctx).await,
                    _ => Err(FrameworkError::NotRunning),
                };
                let _ = respond_to.send(result);
            }
            WorkerRequest::Pause { respond_to } => {
                if self.status.state != WorkerState::Fatal {
                    self.status.state = WorkerState::Paused;
                    info!(program, "Paused");
                }
                let _ = respond_to.send(Ok(()));
            }
            WorkerRequest::Resume { respond_to } => {
                if self.status.state == WorkerState::Paused {
                    self.status.state = if self.worker.is_some() {
                        WorkerState::Running
                    } else {
                        WorkerState::Starting
                    };
                    self.next_at = Instant::now();
                    info!(program, "Resumed");
                }
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    async fn tick(&mut self, ctx: &Arc<T::Context>) {
        if self.worker.is_none() {
            self.start(ctx).await;
            return;
        }
        if let Err(e) = self.cycle(ctx).await {
            // already counted and logged in `cycle`
            debug!(program = T::NAME, error = %e, "Cycle did not complete");
        }
    }

    /// Builds the worker and runs its `on_start` hook on a separate task.
    async fn start(&mut self, ctx: &Arc<T::Context>) {
        let program = T::NAME;
        self.status.state = WorkerState::Starting;

        let params = self.params.clone();
        let task_ctx = Arc::clone(ctx);
        let outcome = tokio::spawn(async move {
            let mut worker = T::from_params(params)?;
            worker.on_start(&task_ctx).await?;
            Ok::<T, T::Error>(worker)
        })
        .await;

        let failure = match outcome {
            Ok(Ok(worker)) => {
                info!(program, "Started");
                self.worker = Some(worker);
                self.start_failures = 0;
                self.status.state = WorkerState::Running;
                self.next_at = Instant::now();
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(join_error) => panic_message(join_error),
        };

        self.start_failures += 1;
        self.status.last_error = Some(failure.clone());
        if self.start_failures > self.policy.max_start_retries {
            error!(program, error = %failure, attempts = self.start_failures, "Start failed, giving up");
            self.status.state = WorkerState::Fatal;
        } else {
            let delay = self.policy.delay_for(self.start_failures);
            warn!(program, error = %failure, attempt = self.start_failures, ?delay, "Start failed");
            self.enter_backoff(delay);
        }
    }

    /// Runs one cycle and schedules the next one according to the worker's pacing.
    async fn cycle(&mut self, ctx: &Arc<T::Context>) -> Result<T::Report, FrameworkError> {
        let program = T::NAME;
        let Some(mut worker) = self.worker.take() else {
            return Err(FrameworkError::NotRunning);
        };

        let started = Instant::now();
        let task_ctx = Arc::clone(ctx);
        let outcome = tokio::spawn(async move {
            let result = worker.run_cycle(&task_ctx).await;
            (worker, result)
        })
        .await;
        let elapsed = started.elapsed();

        match outcome {
            Ok((worker, result)) => {
                self.next_at = Instant::now() + worker.pacing().next_delay(elapsed);
                self.worker = Some(worker);
                self.status.last_cycle = Some(elapsed);
                match result {
                    Ok(report) => {
                        self.status.cycles += 1;
                        self.status.consecutive_failures = 0;
                        debug!(program, ?report, ?elapsed, "Cycle ok");
                        Ok(report)
                    }
                    Err(e) => {
                        self.status.cycles += 1;
                        self.status.failed_cycles += 1;
                        self.status.consecutive_failures += 1;
                        self.status.last_error = Some(e.to_string());
                        warn!(program, error = %e, "Cycle failed");
                        Err(FrameworkError::WorkerError(Box::new(e)))
                    }
                }
            }
            Err(join_error) => {
                let message = panic_message(join_error);
                self.status.failed_cycles += 1;
                self.status.consecutive_failures += 1;
                self.status.restarts += 1;
                self.status.last_error = Some(message.clone());
                let delay = self.policy.delay_for(self.status.consecutive_failures);
                error!(program, error = %message, ?delay, "Cycle panicked, restarting");
                self.enter_backoff(delay);
                Err(FrameworkError::Panicked(message))
            }
        }
    }

    fn enter_backoff(&mut self, delay: Duration) {
        self.worker = None;
        self.status.state = WorkerState::Backoff;
        self.next_at = Instant::now() + delay;
    }
}

fn panic_message(join_error: JoinError) -> String {
    if !join_error.is_panic() {
        return join_error.to_string();
    }
    let payload = join_error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
