use super::{PlantId, SensorId};
use crate::modbus::ModbusEndpoint;
use chrono::{DateTime, Utc};
use std::fmt;

/// One reading of a plant's data logger (`plant_data_term1`).
#[derive(Debug, Clone, PartialEq)]
pub struct PlantSample {
    pub plant_id: PlantId,
    pub pod_id: String,
    pub measured_at: DateTime<Utc>,
    pub sum_active_power: Option<f64>,
    pub cos_phi: Option<f64>,
    pub available_power_min: Option<f64>,
    pub available_power_max: Option<f64>,
    pub reference_power: Option<f64>,
    pub ghi: Option<f64>,
    pub panel_temp: Option<f64>,
}

/// One reading of an ESS unit (`ess_data_term1`).
#[derive(Debug, Clone, PartialEq)]
pub struct EssSample {
    pub plant_id: PlantId,
    pub measured_at: DateTime<Utc>,
    pub battery_temp: Stats,
    pub container_temp: Stats,
    pub available_capacity_charge: f64,
    pub available_capacity_discharge: f64,
    pub average_current_soc: f64,
    pub allowed_min_soc: f64,
    pub allowed_max_soc: f64,
}

impl EssSample {
    pub fn temperature(&self, which: EssTemperature) -> &Stats {
        match which {
            EssTemperature::Battery => &self.battery_temp,
            EssTemperature::Container => &self.container_temp,
        }
    }
}

/// Temperature reading of one sensor (`environment_data_term1`).
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentSample {
    pub sensor_id: SensorId,
    pub measured_at: DateTime<Utc>,
    pub temperature: f64,
}

/// Average, minimum and maximum of a set of readings.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stats {
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Stats {
    /// `None` entries are ignored; an empty input gives empty stats.
    pub fn of<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Option<f64>>,
    {
        let values: Vec<f64> = values.into_iter().flatten().collect();
        if values.is_empty() {
            return Self::default();
        }
        let sum: f64 = values.iter().sum();
        Self {
            avg: Some(sum / values.len() as f64),
            min: values.iter().copied().reduce(f64::min),
            max: values.iter().copied().reduce(f64::max),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.avg.is_none()
    }
}

/// Which ESS temperature column a statistic is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EssTemperature {
    Battery,
    Container,
}

impl EssTemperature {
    pub fn column(&self) -> &'static str {
        match self {
            EssTemperature::Battery => "avg_batt_temp",
            EssTemperature::Container => "avg_container_temp",
        }
    }
}

impl fmt::Display for EssTemperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// What the control executor needs to know about a pod's ESS.
#[derive(Debug, Clone, PartialEq)]
pub struct EssState {
    pub endpoint: ModbusEndpoint,
    pub soc: Option<f64>,
    pub capacity_charge: f64,
    pub capacity_discharge: f64,
}
