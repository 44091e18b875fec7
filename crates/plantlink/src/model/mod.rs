//! # Domain Model
//!
//! Plain data shared by the programs and the storage layer: field devices,
//! the samples they produce, and the controls received from the aggregator.

pub mod control;
pub mod device;
pub mod sample;

pub use control::*;
pub use device::*;
pub use sample::*;

pub type PlantId = i32;
pub type SensorId = i32;
pub type ControlId = i64;
