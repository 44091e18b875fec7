//! # Plantlink
//!
//! Edge gateway between solar plants with battery storage and an energy
//! aggregator. The library holds every program of the gateway; the binary
//! in `main.rs` wires them to PostgreSQL, Modbus TCP and the aggregator API.
//!
//! - **[collector]**: plant output from the data loggers.
//! - **[ess_poller]**: battery state from the ESS units.
//! - **[env_poller]**: ambient temperature sensors.
//! - **[sender]**: telemetry upload; stores the controls in the response.
//! - **[control]**: control fetching, execution on the ESS and commissioning tests.
//! - **[lifecycle]**: starts, observes and stops the programs.
//!
//! Programs share nothing but the [`context::Deps`] handed to them: a
//! [`db::Store`], a [`modbus::ModbusConnector`] and an
//! [`aggregator::AggregatorApi`]. Tests swap in [`db::MemoryStore`],
//! [`modbus::SimulatedDevices`] and [`aggregator::ScriptedAggregator`].

pub mod aggregator;
pub mod breaker;
pub mod collector;
pub mod config;
pub mod context;
pub mod control;
pub mod db;
pub mod env_poller;
pub mod error;
pub mod ess_poller;
pub mod lifecycle;
pub mod modbus;
pub mod model;
pub mod register_map;
pub mod sender;
