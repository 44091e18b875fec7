//! # Program Lifecycle
//!
//! Starts the gateway programs, keeps them running and stops them.
//!
//! ## One Process, Many Programs
//!
//! Every program of the gateway is a [`PeriodicWorker`](gateway_actors::PeriodicWorker)
//! driven by its own actor task. [`GatewaySystem`] plays the part a process
//! supervisor would play in a container:
//!
//! 1. **Start** - build each configured [`Program`] with the shared
//!    [`Deps`](crate::context::Deps) and spawn its actor.
//! 2. **Restart** - a program whose start fails is retried with backoff; a
//!    failed cycle is logged and the program keeps its schedule.
//! 3. **Observe** - [`GatewaySystem::log_status`] reports state, cycle and
//!    restart counters of every program.
//! 4. **Stop** - [`GatewaySystem::shutdown`] drops the clients and awaits
//!    the actor tasks.
//!
//! ```rust,ignore
//! let deps = Deps::new(store, modbus, aggregator);
//! let system = GatewaySystem::start(&config.supervisor.programs, &config, deps);
//!
//! tokio::signal::ctrl_c().await?;
//! system.shutdown().await?;
//! ```
//!
//! ## Graceful Shutdown
//!
//! Dropping a client closes the actor's request channel. The actor finishes
//! the cycle in progress and returns. The control executor waits at most
//! `control.wait_secs` for a notification, so shutdown is bounded by that
//! wait plus the longest Modbus timeout.
//!
//! ## Single Cycles
//!
//! [`run_once`] builds a program, runs its start hook and one cycle in the
//! calling task, and returns the report. The CLI uses it for `once`.

pub mod gateway_system;
pub mod program;

pub use gateway_system::{run_once, GatewaySystem};
pub use program::Program;
