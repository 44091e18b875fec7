use super::ControlId;
use serde::{Deserialize, Serialize};

/// A control as delivered by the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Control {
    pub pod: String,
    #[serde(default)]
    pub heartbeat: Option<i64>,
    #[serde(default)]
    pub sum_set_point: Option<f64>,
    #[serde(default)]
    pub scheduled_reference: Option<f64>,
    #[serde(default)]
    pub use_set_point: i32,
}

impl Control {
    /// Locally generated control with a dummy heartbeat.
    pub fn test_setpoint(pod: impl Into<String>, kw: f64) -> Self {
        Self {
            pod: pod.into(),
            heartbeat: Some(1),
            sum_set_point: Some(kw),
            scheduled_reference: Some(kw),
            use_set_point: 1,
        }
    }
}

/// How a received control replaces the stored one for its pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatPolicy {
    /// Only when the stored heartbeat is missing or older.
    Monotonic,
    /// Always.
    Overwrite,
}

/// An inbox row waiting to be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingControl {
    pub id: ControlId,
    pub target_kw: Option<f64>,
}

/// One request/response exchange with the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct SendLogEntry {
    pub pod: String,
    pub request: serde_json::Value,
    pub response: serde_json::Value,
    pub status: u16,
}
