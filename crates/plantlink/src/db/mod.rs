//! # Storage
//!
//! Every program shares state through PostgreSQL. The [`Store`] trait lists
//! the queries the programs run; [`PgStore`] implements it on a sqlx pool and
//! [`MemoryStore`] in memory for tests.
//!
//! The control executor additionally needs a connection of its own (advisory
//! locks and transactions are session scoped) and a notification feed; both
//! are obtained from the store as [`ControlSession`] and
//! [`ControlNotifications`].

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::DbError;
pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::model::{
    Control, ControlId, ControlPlant, EnvironmentSample, EnvironmentSensor, EssSample,
    EssState, EssTemperature, EssUnit, HeartbeatPolicy, PendingControl, PlantId, PlantSample,
    SendLogEntry, Stats,
};
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait Store: Send + Sync {
    /// Plants with `alteo_api_control` set, each with its active ESS units.
    async fn control_plants(&self) -> Result<Vec<ControlPlant>, DbError>;

    async fn active_ess_units(&self) -> Result<Vec<EssUnit>, DbError>;

    async fn active_environment_sensors(&self) -> Result<Vec<EnvironmentSensor>, DbError>;

    /// Distinct pods of the control plants.
    async fn active_pods(&self) -> Result<Vec<String>, DbError>;

    /// Inserts the batch in one statement. Returns the number of rows.
    async fn insert_plant_samples(&self, samples: &[PlantSample]) -> Result<u64, DbError>;

    async fn insert_ess_sample(&self, sample: &EssSample) -> Result<(), DbError>;

    /// Returns `false` when a sample for the same sensor and second exists.
    async fn insert_environment_sample(&self, sample: &EnvironmentSample)
        -> Result<bool, DbError>;

    /// Latest sample of every control plant.
    async fn latest_plant_measurements(&self) -> Result<Vec<PlantSample>, DbError>;

    async fn latest_ess_sample(&self, plant_id: PlantId) -> Result<Option<EssSample>, DbError>;

    /// Temperature statistics of the plant's environment sensors over `window`.
    async fn environment_window_stats(
        &self,
        plant_id: PlantId,
        window: Duration,
    ) -> Result<Stats, DbError>;

    /// Statistics of one ESS temperature column over `window`.
    async fn ess_window_stats(
        &self,
        plant_id: PlantId,
        column: EssTemperature,
        window: Duration,
    ) -> Result<Stats, DbError>;

    async fn last_heartbeat(&self, pod: &str) -> Result<Option<i64>, DbError>;

    /// Upserts each control into the inbox. A replaced row is reset to
    /// unapplied and its pod notified. Returns the pods that were replaced.
    async fn record_controls(
        &self,
        controls: &[Control],
        policy: HeartbeatPolicy,
    ) -> Result<Vec<String>, DbError>;

    async fn store_send_log(&self, entry: &SendLogEntry) -> Result<(), DbError>;

    async fn control_session(&self) -> Result<Box<dyn ControlSession>, DbError>;

    async fn control_notifications(
        &self,
        channel: &str,
    ) -> Result<Box<dyn ControlNotifications>, DbError>;
}

/// A dedicated connection for applying controls.
#[async_trait]
pub trait ControlSession: Send {
    /// Non-blocking advisory lock on the pod.
    async fn try_lock(&mut self, pod: &str) -> Result<bool, DbError>;

    async fn unlock(&mut self, pod: &str) -> Result<(), DbError>;

    async fn begin(&mut self) -> Result<(), DbError>;

    async fn commit(&mut self) -> Result<(), DbError>;

    async fn rollback(&mut self) -> Result<(), DbError>;

    async fn latest_unapplied_control(
        &mut self,
        pod: &str,
    ) -> Result<Option<PendingControl>, DbError>;

    /// Active power of the pod's latest plant sample.
    async fn latest_plant_power(&mut self, pod: &str) -> Result<Option<f64>, DbError>;

    async fn latest_ess_state(&mut self, pod: &str) -> Result<Option<EssState>, DbError>;

    async fn mark_applied(
        &mut self,
        id: ControlId,
        applied_kw: Option<f64>,
        note: Option<&str>,
    ) -> Result<(), DbError>;
}

/// Pods announced on the control channel.
#[async_trait]
pub trait ControlNotifications: Send {
    /// Next announced pod, or `None` when nothing arrived within `wait`.
    async fn next_pod(&mut self, wait: Duration) -> Result<Option<String>, DbError>;
}
