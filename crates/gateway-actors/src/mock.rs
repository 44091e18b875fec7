//! # Mock Framework
//!
//! Utilities for testing code that holds a [`WorkerClient`] without spawning
//! a real [`WorkerActor`](crate::WorkerActor).
//!
//! | | MockClient | Real actor |
//! |---|---|---|
//! | Speed | in-memory | spawns tasks, runs real cycles |
//! | Determinism | scripted replies | subject to the timer |
//! | Use case | supervisor / CLI logic around a client | the worker itself |
//!
//! Two styles are available:
//! - [`MockClient`]: queue expectations up front, then [`verify`](MockClient::verify).
//! - [`create_mock_client`] with [`expect_status`] / [`expect_trigger`]: drive
//!   the receiving side by hand.

use crate::{FrameworkError, PeriodicWorker, WorkerClient, WorkerRequest, WorkerStatus};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

enum Expectation<T: PeriodicWorker> {
    Status(Result<WorkerStatus, FrameworkError>),
    Trigger(Result<T::Report, FrameworkError>),
    Pause(Result<(), FrameworkError>),
    Resume(Result<(), FrameworkError>),
}

type Expectations<T> = Arc<Mutex<VecDeque<Expectation<T>>>>;

/// A mock client answering requests from a queue of expectations, in order.
///
/// # Example
/// ```ignore
/// let mut mock = MockClient::<Collector>::new();
/// mock.expect_status().return_ok(status);
/// mock.expect_trigger().return_ok(report);
///
/// let client = mock.client();
/// // exercise code using `client` ...
/// mock.verify();
/// ```
pub struct MockClient<T: PeriodicWorker> {
    client: WorkerClient<T>,
    expectations: Expectations<T>,
    _handle: tokio::task::JoinHandle<()>,
}

impl<T: PeriodicWorker> MockClient<T> {
    /// Creates a new mock client with no expectations.
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::channel::<WorkerRequest<T>>(100);
        let expectations: Expectations<T> = Arc::new(Mutex::new(VecDeque::new()));
        let queue = Arc::clone(&expectations);

        let handle = tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                let next = queue.lock().expect("expectation queue poisoned").pop_front();
                match (request, next) {
                    (WorkerRequest::Status { respond_to }, Some(Expectation::Status(reply))) => {
                        let _ = respond_to.send(reply);
                    }
                    (WorkerRequest::Trigger { respond_to }, Some(Expectation::Trigger(reply))) => {
                        let _ = respond_to.send(reply);
                    }
                    (WorkerRequest::Pause { respond_to }, Some(Expectation::Pause(reply))) => {
                        let _ = respond_to.send(reply);
                    }
                    (WorkerRequest::Resume { respond_to }, Some(Expectation::Resume(reply))) => {
                        let _ = respond_to.send(reply);
                    }
                    _ => panic!("Unexpected request or expectation mismatch"),
                }
            }
        });

        Self {
            client: WorkerClient::new(sender),
            expectations,
            _handle: handle,
        }
    }

    /// Returns a client wired to this mock.
    pub fn client(&self) -> WorkerClient<T> {
        self.client.clone()
    }

    pub fn expect_status(&mut self) -> ExpectationBuilder<T, WorkerStatus> {
        ExpectationBuilder::new(&self.expectations, Expectation::Status)
    }

    pub fn expect_trigger(&mut self) -> ExpectationBuilder<T, T::Report> {
        ExpectationBuilder::new(&self.expectations, Expectation::Trigger)
    }

    pub fn expect_pause(&mut self) -> ExpectationBuilder<T, ()> {
        ExpectationBuilder::new(&self.expectations, Expectation::Pause)
    }

    pub fn expect_resume(&mut self) -> ExpectationBuilder<T, ()> {
        ExpectationBuilder::new(&self.expectations, Expectation::Resume)
    }

    /// Panics if any queued expectation was not consumed.
    pub fn verify(&self) {
        let remaining = self
            .expectations
            .lock()
            .expect("expectation queue poisoned")
            .len();
        if remaining != 0 {
            panic!("Not all expectations were met. {} remaining", remaining);
        }
    }
}

impl<T: PeriodicWorker> Default for MockClient<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder that queues the reply for one expected request.
pub struct ExpectationBuilder<T: PeriodicWorker, R> {
    expectations: Expectations<T>,
    wrap: fn(Result<R, FrameworkError>) -> Expectation<T>,
}

impl<T: PeriodicWorker, R> ExpectationBuilder<T, R> {
    fn new(
        expectations: &Expectations<T>,
        wrap: fn(Result<R, FrameworkError>) -> Expectation<T>,
    ) -> Self {
        Self {
            expectations: Arc::clone(expectations),
            wrap,
        }
    }

    /// Sets the expectation to return a successful result.
    pub fn return_ok(self, value: R) {
        self.push(Ok(value));
    }

    /// Sets the expectation to return an error.
    pub fn return_err(self, error: FrameworkError) {
        self.push(Err(error));
    }

    fn push(self, reply: Result<R, FrameworkError>) {
        self.expectations
            .lock()
            .expect("expectation queue poisoned")
            .push_back((self.wrap)(reply));
    }
}

/// Creates a client and the raw receiver, for tests that answer by hand.
pub fn create_mock_client<T: PeriodicWorker>(
    buffer_size: usize,
) -> (WorkerClient<T>, mpsc::Receiver<WorkerRequest<T>>) {
    let (sender, receiver) = mpsc::channel(buffer_size);
    (WorkerClient::new(sender), receiver)
}

/// Waits for the next request and returns its responder if it is a `Status`.
pub async fn expect_status<T: PeriodicWorker>(
    receiver: &mut mpsc::Receiver<WorkerRequest<T>>,
) -> Option<oneshot::Sender<Result<WorkerStatus, FrameworkError>>> {
    match receiver.recv().await {
        Some(WorkerRequest::Status { respond_to }) => Some(respond_to),
        _ => None,
    }
}

/// Waits for the next request and returns its responder if it is a `Trigger`.
pub async fn expect_trigger<T: PeriodicWorker>(
    receiver: &mut mpsc::Receiver<WorkerRequest<T>>,
) -> Option<oneshot::Sender<Result<T::Report, FrameworkError>>> {
    match receiver.recv().await {
        Some(WorkerRequest::Trigger { respond_to }) => Some(respond_to),
        _ => None,
    }
}
