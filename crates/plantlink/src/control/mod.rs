//! # Control
//!
//! Controls flow from the aggregator to the batteries in three steps:
//!
//! 1. The [`sender`](crate::sender) and the [`fetcher`] store received
//!    controls in the inbox, one row per pod. A replaced row is reset to
//!    unapplied and its pod is announced on the notification channel.
//! 2. The [`executor`] picks up the announcement, computes the ESS setpoint
//!    from the target and the current plant output, and writes it to the
//!    unit over Modbus. The inbox row is marked applied in the same
//!    transaction, under an advisory lock per pod.
//! 3. For commissioning, the [`test_generator`] overwrites the inbox with a
//!    stepped setpoint sequence instead of waiting for the aggregator.

pub mod executor;
pub mod fetcher;
pub mod test_generator;

pub use executor::{plan_setpoint, ControlExecutor, ControlOutcome, ExecutorParams, Plan};
pub use fetcher::{ControlFetcher, FetchReport, FetcherParams};
pub use test_generator::{step_index, ControlTestGenerator, TestGeneratorParams, TestReport};

use crate::aggregator::AggregatorError;
use crate::db::DbError;
use crate::modbus::ModbusError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Modbus(#[from] ModbusError),

    #[error(transparent)]
    Aggregator(#[from] AggregatorError),

    #[error("SOC unknown for pod {0}")]
    UnknownSoc(String),

    #[error("test setpoint sequence is empty")]
    EmptySequence,
}
