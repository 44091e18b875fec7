//! In-memory [`Store`] for tests.
//!
//! Mirrors the PostgreSQL semantics the programs rely on: duplicate
//! environment samples are ignored, heartbeat policies guard inbox upserts,
//! replaced controls are announced, advisory locks are shared between
//! sessions, and `mark_applied` only lands on commit.

use super::{ControlNotifications, ControlSession, DbError, Store};
use crate::model::{
    Control, ControlId, ControlPlant, EnvironmentSample, EnvironmentSensor, EssSample, EssState,
    EssTemperature, EssUnit, HeartbeatPolicy, PendingControl, PlantId, PlantSample, SendLogEntry,
    Stats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

/// One row of the controls inbox.
#[derive(Debug, Clone, PartialEq)]
pub struct InboxRow {
    pub id: ControlId,
    pub control: Control,
    pub received_at: DateTime<Utc>,
    pub applied: bool,
    pub applied_value: Option<f64>,
    pub note: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    plants: Vec<ControlPlant>,
    ess_units: Vec<EssUnit>,
    sensors: Vec<(EnvironmentSensor, Vec<PlantId>)>,
    plant_samples: Vec<PlantSample>,
    ess_samples: Vec<EssSample>,
    environment_samples: Vec<EnvironmentSample>,
    inbox: Vec<InboxRow>,
    send_log: Vec<SendLogEntry>,
    locks: HashSet<String>,
    next_control_id: ControlId,
    failing: bool,
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    notify: broadcast::Sender<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn window_start(window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl MemoryStore {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            notify,
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }

    fn check(&self) -> Result<MutexGuard<'_, MemoryState>, DbError> {
        let state = self.state();
        if state.failing {
            return Err(DbError::Connection("connection refused".to_string()));
        }
        Ok(state)
    }

    /// Adds a plant under aggregator control.
    pub fn add_plant(&self, plant: ControlPlant) {
        self.state().plants.push(plant);
    }

    pub fn add_ess_unit(&self, unit: EssUnit) {
        self.state().ess_units.push(unit);
    }

    /// Adds a sensor assigned to the given plants.
    pub fn add_sensor(&self, sensor: EnvironmentSensor, plants: &[PlantId]) {
        self.state().sensors.push((sensor, plants.to_vec()));
    }

    /// Makes every store call fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.state().failing = failing;
    }

    /// Takes the advisory lock of `pod` as if another process held it.
    pub fn hold_lock(&self, pod: &str) -> bool {
        self.state().locks.insert(pod.to_string())
    }

    pub fn release_lock(&self, pod: &str) {
        self.state().locks.remove(pod);
    }

    pub fn plant_samples(&self) -> Vec<PlantSample> {
        self.state().plant_samples.clone()
    }

    pub fn ess_samples(&self) -> Vec<EssSample> {
        self.state().ess_samples.clone()
    }

    pub fn environment_samples(&self) -> Vec<EnvironmentSample> {
        self.state().environment_samples.clone()
    }

    pub fn send_log(&self) -> Vec<SendLogEntry> {
        self.state().send_log.clone()
    }

    pub fn inbox(&self, pod: &str) -> Option<InboxRow> {
        self.state()
            .inbox
            .iter()
            .find(|row| row.control.pod == pod)
            .cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn control_plants(&self) -> Result<Vec<ControlPlant>, DbError> {
        let state = self.check()?;
        let mut plants = state.plants.clone();
        plants.sort_by_key(|p| p.id);
        Ok(plants)
    }

    async fn active_ess_units(&self) -> Result<Vec<EssUnit>, DbError> {
        Ok(self.check()?.ess_units.clone())
    }

    async fn active_environment_sensors(&self) -> Result<Vec<EnvironmentSensor>, DbError> {
        Ok(self
            .check()?
            .sensors
            .iter()
            .map(|(sensor, _)| sensor.clone())
            .collect())
    }

    async fn active_pods(&self) -> Result<Vec<String>, DbError> {
        let mut pods: Vec<String> = self
            .check()?
            .plants
            .iter()
            .map(|p| p.pod_id.clone())
            .collect();
        pods.sort();
        pods.dedup();
        Ok(pods)
    }

    async fn insert_plant_samples(&self, samples: &[PlantSample]) -> Result<u64, DbError> {
        let mut state = self.check()?;
        state.plant_samples.extend_from_slice(samples);
        Ok(samples.len() as u64)
    }

    async fn insert_ess_sample(&self, sample: &EssSample) -> Result<(), DbError> {
        self.check()?.ess_samples.push(sample.clone());
        Ok(())
    }

    async fn insert_environment_sample(
        &self,
        sample: &EnvironmentSample,
    ) -> Result<bool, DbError> {
        let mut state = self.check()?;
        let duplicate = state
            .environment_samples
            .iter()
            .any(|s| s.sensor_id == sample.sensor_id && s.measured_at == sample.measured_at);
        if duplicate {
            return Ok(false);
        }
        state.environment_samples.push(sample.clone());
        Ok(true)
    }

    async fn latest_plant_measurements(&self) -> Result<Vec<PlantSample>, DbError> {
        let state = self.check()?;
        let mut latest: Vec<PlantSample> = state
            .plants
            .iter()
            .filter_map(|plant| {
                state
                    .plant_samples
                    .iter()
                    .filter(|s| s.plant_id == plant.id)
                    .max_by_key(|s| s.measured_at)
                    .map(|s| PlantSample {
                        pod_id: plant.pod_id.clone(),
                        ..s.clone()
                    })
            })
            .collect();
        latest.sort_by_key(|s| s.plant_id);
        Ok(latest)
    }

    async fn latest_ess_sample(&self, plant_id: PlantId) -> Result<Option<EssSample>, DbError> {
        Ok(self
            .check()?
            .ess_samples
            .iter()
            .filter(|s| s.plant_id == plant_id)
            .max_by_key(|s| s.measured_at)
            .cloned())
    }

    async fn environment_window_stats(
        &self,
        plant_id: PlantId,
        window: Duration,
    ) -> Result<Stats, DbError> {
        let state = self.check()?;
        let since = window_start(window);
        let sensors: Vec<i32> = state
            .sensors
            .iter()
            .filter(|(_, plants)| plants.contains(&plant_id))
            .map(|(sensor, _)| sensor.id)
            .collect();
        Ok(Stats::of(
            state
                .environment_samples
                .iter()
                .filter(|s| sensors.contains(&s.sensor_id) && s.measured_at >= since)
                .map(|s| Some(s.temperature)),
        ))
    }

    async fn ess_window_stats(
        &self,
        plant_id: PlantId,
        column: EssTemperature,
        window: Duration,
    ) -> Result<Stats, DbError> {
        let state = self.check()?;
        let since = window_start(window);
        Ok(Stats::of(
            state
                .ess_samples
                .iter()
                .filter(|s| s.plant_id == plant_id && s.measured_at >= since)
                .map(|s| s.temperature(column).avg),
        ))
    }

    async fn last_heartbeat(&self, pod: &str) -> Result<Option<i64>, DbError> {
        Ok(self
            .check()?
            .inbox
            .iter()
            .find(|row| row.control.pod == pod)
            .and_then(|row| row.control.heartbeat))
    }

    async fn record_controls(
        &self,
        controls: &[Control],
        policy: HeartbeatPolicy,
    ) -> Result<Vec<String>, DbError> {
        let mut replaced = Vec::new();
        {
            let mut state = self.check()?;
            for control in controls {
                let now = Utc::now();
                match state.inbox.iter_mut().find(|r| r.control.pod == control.pod) {
                    Some(row) => {
                        let newer = match (row.control.heartbeat, control.heartbeat) {
                            (None, _) => true,
                            (Some(stored), Some(received)) => stored < received,
                            (Some(_), None) => false,
                        };
                        if policy == HeartbeatPolicy::Monotonic && !newer {
                            continue;
                        }
                        row.control = control.clone();
                        row.received_at = now;
                        row.applied = false;
                        row.applied_value = None;
                        row.note = None;
                    }
                    None => {
                        state.next_control_id += 1;
                        let id = state.next_control_id;
                        state.inbox.push(InboxRow {
                            id,
                            control: control.clone(),
                            received_at: now,
                            applied: false,
                            applied_value: None,
                            note: None,
                        });
                    }
                }
                replaced.push(control.pod.clone());
            }
        }
        for pod in &replaced {
            // no subscriber is fine
            let _ = self.notify.send(pod.clone());
        }
        Ok(replaced)
    }

    async fn store_send_log(&self, entry: &SendLogEntry) -> Result<(), DbError> {
        self.check()?.send_log.push(entry.clone());
        Ok(())
    }

    async fn control_session(&self) -> Result<Box<dyn ControlSession>, DbError> {
        drop(self.check()?);
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            in_transaction: false,
            staged: Vec::new(),
        }))
    }

    async fn control_notifications(
        &self,
        _channel: &str,
    ) -> Result<Box<dyn ControlNotifications>, DbError> {
        drop(self.check()?);
        Ok(Box::new(MemoryNotifications {
            receiver: self.notify.subscribe(),
        }))
    }
}

type StagedMark = (ControlId, Option<f64>, Option<String>);

struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    in_transaction: bool,
    staged: Vec<StagedMark>,
}

fn apply_mark(state: &mut MemoryState, (id, value, note): StagedMark) {
    if let Some(row) = state.inbox.iter_mut().find(|r| r.id == id) {
        row.applied = true;
        row.applied_value = value;
        row.note = note;
    }
}

#[async_trait]
impl ControlSession for MemorySession {
    async fn try_lock(&mut self, pod: &str) -> Result<bool, DbError> {
        Ok(lock(&self.state).locks.insert(pod.to_string()))
    }

    async fn unlock(&mut self, pod: &str) -> Result<(), DbError> {
        lock(&self.state).locks.remove(pod);
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        if self.in_transaction {
            return Err(DbError::Transaction("already in a transaction".to_string()));
        }
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        let mut state = lock(&self.state);
        for mark in self.staged.drain(..) {
            apply_mark(&mut state, mark);
        }
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.staged.clear();
        self.in_transaction = false;
        Ok(())
    }

    async fn latest_unapplied_control(
        &mut self,
        pod: &str,
    ) -> Result<Option<PendingControl>, DbError> {
        Ok(lock(&self.state)
            .inbox
            .iter()
            .find(|row| row.control.pod == pod && !row.applied)
            .map(|row| PendingControl {
                id: row.id,
                target_kw: row.control.sum_set_point,
            }))
    }

    async fn latest_plant_power(&mut self, pod: &str) -> Result<Option<f64>, DbError> {
        Ok(lock(&self.state)
            .plant_samples
            .iter()
            .filter(|s| s.pod_id == pod)
            .max_by_key(|s| s.measured_at)
            .and_then(|s| s.sum_active_power))
    }

    async fn latest_ess_state(&mut self, pod: &str) -> Result<Option<EssState>, DbError> {
        let state = lock(&self.state);
        let plants: Vec<PlantId> = state
            .plants
            .iter()
            .filter(|p| p.pod_id == pod)
            .map(|p| p.id)
            .collect();
        let Some(sample) = state
            .ess_samples
            .iter()
            .filter(|s| plants.contains(&s.plant_id))
            .max_by_key(|s| s.measured_at)
        else {
            return Ok(None);
        };
        let Some(unit) = state.ess_units.iter().find(|u| u.plant_id == sample.plant_id) else {
            return Ok(None);
        };
        Ok(Some(EssState {
            endpoint: unit.endpoint.clone(),
            soc: Some(sample.average_current_soc),
            capacity_charge: sample.available_capacity_charge,
            capacity_discharge: sample.available_capacity_discharge,
        }))
    }

    async fn mark_applied(
        &mut self,
        id: ControlId,
        applied_kw: Option<f64>,
        note: Option<&str>,
    ) -> Result<(), DbError> {
        let mark = (id, applied_kw, note.map(str::to_string));
        if self.in_transaction {
            self.staged.push(mark);
        } else {
            apply_mark(&mut lock(&self.state), mark);
        }
        Ok(())
    }
}

struct MemoryNotifications {
    receiver: broadcast::Receiver<String>,
}

#[async_trait]
impl ControlNotifications for MemoryNotifications {
    async fn next_pod(&mut self, wait: Duration) -> Result<Option<String>, DbError> {
        loop {
            return match tokio::time::timeout(wait, self.receiver.recv()).await {
                Err(_) => Ok(None),
                Ok(Ok(pod)) => Ok(Some(pod)),
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    Err(DbError::Connection("notification channel closed".to_string()))
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(pod: &str, heartbeat: i64, kw: f64) -> Control {
        Control {
            pod: pod.to_string(),
            heartbeat: Some(heartbeat),
            sum_set_point: Some(kw),
            scheduled_reference: None,
            use_set_point: 1,
        }
    }

    #[tokio::test]
    async fn monotonic_policy_ignores_stale_heartbeats() {
        let store = MemoryStore::new();
        let replaced = store
            .record_controls(&[control("HU-1", 5, 100.0)], HeartbeatPolicy::Monotonic)
            .await
            .unwrap();
        assert_eq!(replaced, vec!["HU-1".to_string()]);

        let replaced = store
            .record_controls(&[control("HU-1", 4, 50.0)], HeartbeatPolicy::Monotonic)
            .await
            .unwrap();
        assert!(replaced.is_empty());
        assert_eq!(store.last_heartbeat("HU-1").await.unwrap(), Some(5));

        store
            .record_controls(&[control("HU-1", 4, 50.0)], HeartbeatPolicy::Overwrite)
            .await
            .unwrap();
        let row = store.inbox("HU-1").unwrap();
        assert_eq!(row.control.heartbeat, Some(4));
        assert_eq!(row.control.sum_set_point, Some(50.0));
    }

    #[tokio::test]
    async fn replaced_controls_are_announced() {
        let store = MemoryStore::new();
        let mut notifications = store.control_notifications("alteo_control").await.unwrap();

        store
            .record_controls(&[control("HU-2", 1, 10.0)], HeartbeatPolicy::Overwrite)
            .await
            .unwrap();
        let pod = notifications.next_pod(Duration::from_millis(100)).await.unwrap();
        assert_eq!(pod.as_deref(), Some("HU-2"));

        let none = notifications.next_pod(Duration::from_millis(20)).await.unwrap();
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn marks_land_on_commit_only() {
        let store = MemoryStore::new();
        store
            .record_controls(&[control("HU-3", 1, 10.0)], HeartbeatPolicy::Overwrite)
            .await
            .unwrap();
        let mut session = store.control_session().await.unwrap();
        let pending = session.latest_unapplied_control("HU-3").await.unwrap().unwrap();

        session.begin().await.unwrap();
        session.mark_applied(pending.id, Some(10.0), None).await.unwrap();
        session.rollback().await.unwrap();
        assert!(!store.inbox("HU-3").unwrap().applied);

        session.begin().await.unwrap();
        session
            .mark_applied(pending.id, Some(0.0), Some("No charge capacity"))
            .await
            .unwrap();
        session.commit().await.unwrap();
        let row = store.inbox("HU-3").unwrap();
        assert!(row.applied);
        assert_eq!(row.note.as_deref(), Some("No charge capacity"));
        assert!(session.latest_unapplied_control("HU-3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn advisory_locks_are_shared() {
        let store = MemoryStore::new();
        let mut first = store.control_session().await.unwrap();
        let mut second = store.control_session().await.unwrap();

        assert!(first.try_lock("HU-4").await.unwrap());
        assert!(!second.try_lock("HU-4").await.unwrap());
        first.unlock("HU-4").await.unwrap();
        assert!(second.try_lock("HU-4").await.unwrap());
    }
}
