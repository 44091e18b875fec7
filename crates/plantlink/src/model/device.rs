use super::{PlantId, SensorId};
use crate::modbus::ModbusEndpoint;
use crate::register_map::DeviceKind;

/// A plant under aggregator control, with its data logger and ESS units.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPlant {
    pub id: PlantId,
    pub pod_id: String,
    pub name: String,
    pub logger: ModbusEndpoint,
    pub logger_manufacturer: String,
    pub ess_units: Vec<EssRef>,
}

impl ControlPlant {
    pub fn logger_kind(&self) -> DeviceKind<'_> {
        DeviceKind::Logger {
            manufacturer: &self.logger_manufacturer,
        }
    }
}

/// ESS unit as listed under its plant.
#[derive(Debug, Clone, PartialEq)]
pub struct EssRef {
    pub id: i32,
    pub slave_id: u8,
    pub manufacturer: String,
    pub model: Option<String>,
}

/// An active ESS unit with its own Modbus endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EssUnit {
    pub id: i32,
    pub plant_id: PlantId,
    pub endpoint: ModbusEndpoint,
    pub manufacturer: String,
    pub model: Option<String>,
}

impl EssUnit {
    pub fn kind(&self) -> DeviceKind<'_> {
        DeviceKind::Ess {
            manufacturer: &self.manufacturer,
            model: self.model.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentSensor {
    pub id: SensorId,
    pub endpoint: ModbusEndpoint,
}
