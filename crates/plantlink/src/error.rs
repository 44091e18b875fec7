//! Errors raised by the polling and reporting programs.

use crate::aggregator::AggregatorError;
use crate::db::DbError;
use crate::modbus::ModbusError;
use crate::register_map::RegisterMapError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Modbus(#[from] ModbusError),

    #[error(transparent)]
    RegisterMap(#[from] RegisterMapError),

    #[error(transparent)]
    Aggregator(#[from] AggregatorError),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("missing required value: {0}")]
    MissingValue(&'static str),

    #[error("no readable registers")]
    NoData,
}
