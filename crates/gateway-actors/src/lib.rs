//! # Gateway Actors
//!
//! Building blocks for long-running, periodic programs supervised inside one
//! Tokio runtime. Each program is a [`PeriodicWorker`] driven by its own
//! [`WorkerActor`]; the rest of the application talks to it through a
//! cloneable [`WorkerClient`].
//!
//! ## Architecture Overview
//!
//! 1. **Worker Layer** ([`PeriodicWorker`]): what one cycle does, how the
//!    worker is built and started, how cycles are paced.
//! 2. **Runtime Layer** ([`WorkerActor`]): timer, request loop, restart and
//!    backoff, status counters.
//! 3. **Interface Layer** ([`WorkerClient`], [`ProgramClient`]): status,
//!    trigger, pause and resume over message passing.
//!
//! ## Supervision
//!
//! - A failed start is retried with exponential backoff up to
//!   [`RestartPolicy::max_start_retries`], then the worker is `FATAL`.
//! - A failed cycle is logged and counted; the next cycle runs as scheduled.
//! - A panicking cycle discards the worker instance, which is rebuilt from its
//!   parameters after a backoff.
//! - Dropping every client shuts the actor down after its current cycle.
//!
//! ## Example
//!
//! ```rust
//! use gateway_actors::{Pacing, PeriodicWorker, RestartPolicy, WorkerActor};
//! use async_trait::async_trait;
//! use std::time::Duration;
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("counter error")]
//! struct CounterError;
//!
//! struct Counter { ticks: u32 }
//!
//! #[async_trait]
//! impl PeriodicWorker for Counter {
//!     const NAME: &'static str = "counter";
//!     type Params = u32;
//!     type Context = ();
//!     type Report = u32;
//!     type Error = CounterError;
//!
//!     fn from_params(start: u32) -> Result<Self, CounterError> {
//!         Ok(Self { ticks: start })
//!     }
//!
//!     async fn run_cycle(&mut self, _ctx: &()) -> Result<u32, CounterError> {
//!         self.ticks += 1;
//!         Ok(self.ticks)
//!     }
//!
//!     fn pacing(&self) -> Pacing {
//!         Pacing::FixedDelay(Duration::from_secs(3600))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let (actor, client) = WorkerActor::<Counter>::new(10, RestartPolicy::default(), 8);
//!     let handle = tokio::spawn(actor.run(()));
//!
//!     // wait for the first scheduled cycle
//!     while client.status().await.unwrap().cycles == 0 {
//!         tokio::time::sleep(Duration::from_millis(5)).await;
//!     }
//!     assert_eq!(client.trigger().await.unwrap(), 12);
//!
//!     drop(client);
//!     handle.await.unwrap();
//! }
//! ```
//!
//! ## Testing
//!
//! The [`mock`] module provides a `MockClient` that answers worker requests
//! from queued expectations, for testing code that holds clients.

pub mod actor;
pub mod client;
pub mod error;
pub mod message;
pub mod mock;
pub mod program;
pub mod status;
pub mod tracing;
pub mod worker;

// Re-export core types for convenience
pub use actor::WorkerActor;
pub use client::WorkerClient;
pub use error::FrameworkError;
pub use message::{Response, WorkerRequest};
pub use program::ProgramClient;
pub use status::{WorkerState, WorkerStatus};
pub use worker::{Pacing, PeriodicWorker, RestartPolicy};
