//! Telemetry report for one pod.

use crate::model::{EssSample, PlantSample, Stats};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every value is reported with good quality.
pub const QUALITY_GOOD: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodReport {
    pub pod: String,
    pub values: Vec<MeasurementValue>,
}

impl PodReport {
    pub fn value(&self, measurement: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|v| v.measurement == measurement)
            .map(|v| &v.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementValue {
    pub measurement: String,
    pub measured_at: String,
    pub value: Value,
    pub quality: u8,
}

/// Everything the sender gathered for one pod.
#[derive(Debug, Clone)]
pub struct ReportInputs<'a> {
    pub measurement: &'a PlantSample,
    pub ess: Option<&'a EssSample>,
    pub heartbeat: i64,
    pub battery_temp: Stats,
    pub container_temp: Stats,
    pub environment_temp: Stats,
}

/// UTC with millisecond precision and a `Z` suffix.
pub fn format_measured_at(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

struct Values {
    measured_at: String,
    values: Vec<MeasurementValue>,
}

impl Values {
    fn push(&mut self, measurement: &str, value: impl Into<Value>) {
        self.values.push(MeasurementValue {
            measurement: measurement.to_string(),
            measured_at: self.measured_at.clone(),
            value: value.into(),
            quality: QUALITY_GOOD,
        });
    }

    fn push_stats(&mut self, measurement: &str, stats: &Stats) {
        self.push(measurement, stats.avg);
        self.push(&format!("{measurement}MIN"), stats.min);
        self.push(&format!("{measurement}MAX"), stats.max);
    }
}

/// Builds the report, stamping every value with `now`.
///
/// ESS values are added only when an ESS sample exists, environment values
/// only when the window had readings. Missing numbers are sent as `null`.
pub fn build_report(inputs: &ReportInputs<'_>, now: DateTime<Utc>) -> PodReport {
    let m = inputs.measurement;
    let mut out = Values {
        measured_at: format_measured_at(now),
        values: Vec::with_capacity(20),
    };

    out.push("heartbeatMirrored", inputs.heartbeat);
    out.push("availablePowerMin", m.available_power_min);
    out.push("availablePowerMax", m.available_power_max);
    out.push("sumActivePower", m.sum_active_power);
    out.push("cosPhi", m.cos_phi);
    out.push("referencePower", m.reference_power);

    if let Some(ess) = inputs.ess {
        out.push("availableCapacityCharge", ess.available_capacity_charge);
        out.push("availableCapacityDischarge", ess.available_capacity_discharge);
        out.push_stats("averageBatterycellTemp", &inputs.battery_temp);
        out.push_stats("averageContainerInsideTemp", &inputs.container_temp);
        out.push("averageCurrentSOC", ess.average_current_soc);
        out.push("allowedMinSOC", ess.allowed_min_soc);
        out.push("allowedMaxSOC", ess.allowed_max_soc);
    }

    if !inputs.environment_temp.is_empty() {
        out.push_stats("averageEnvironmentTemp", &inputs.environment_temp);
    }

    PodReport {
        pod: m.pod_id.clone(),
        values: out.values,
    }
}
