//! # Collector
//!
//! Polls the data logger of every plant under aggregator control and stores
//! one [`PlantSample`] per plant and cycle in a single batch insert.
//!
//! A plant whose poll fails is skipped for the breaker cooldown. Cycles run
//! at a fixed rate, so a slow poll shortens the following pause.

use crate::breaker::{CircuitBreaker, DEFAULT_COOLDOWN};
use crate::config::AppConfig;
use crate::context::Deps;
use crate::error::GatewayError;
use crate::modbus::{ModbusConnector, ModbusSession};
use crate::model::{ControlPlant, PlantId, PlantSample};
use crate::register_map::{combine_scaled, RegisterMap};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use futures::future::join_all;
use gateway_actors::{Pacing, PeriodicWorker, RestartPolicy, WorkerActor, WorkerClient};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CollectorParams {
    pub register_map_dir: PathBuf,
    pub timeout: Duration,
    pub cooldown: Duration,
    pub period: Duration,
}

impl CollectorParams {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            register_map_dir: config.modbus.register_map_dir.clone(),
            timeout: config.modbus.logger_timeout(),
            cooldown: DEFAULT_COOLDOWN,
            period: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectorReport {
    pub polled: usize,
    pub skipped: usize,
    pub failed: usize,
    pub stored: u64,
}

pub struct Collector {
    params: CollectorParams,
    plants: Vec<ControlPlant>,
    breaker: CircuitBreaker<PlantId>,
}

/// Creates the collector actor and its client.
pub fn new(
    params: CollectorParams,
    policy: RestartPolicy,
) -> (WorkerActor<Collector>, WorkerClient<Collector>) {
    WorkerActor::new(params, policy, 8)
}

#[async_trait]
impl PeriodicWorker for Collector {
    const NAME: &'static str = "collector";
    type Params = CollectorParams;
    type Context = Deps;
    type Report = CollectorReport;
    type Error = GatewayError;

    fn from_params(params: CollectorParams) -> Result<Self, GatewayError> {
        Ok(Self {
            breaker: CircuitBreaker::new(params.cooldown),
            params,
            plants: Vec::new(),
        })
    }

    async fn on_start(&mut self, ctx: &Deps) -> Result<(), GatewayError> {
        self.plants = ctx.store.control_plants().await?;
        let ess_units: usize = self.plants.iter().map(|p| p.ess_units.len()).sum();
        info!(plants = self.plants.len(), ess_units, "Running for control plants");
        Ok(())
    }

    async fn run_cycle(&mut self, ctx: &Deps) -> Result<CollectorReport, GatewayError> {
        let due: Vec<&ControlPlant> = self
            .plants
            .iter()
            .filter(|p| !self.breaker.should_skip(p.id))
            .collect();
        let mut report = CollectorReport {
            polled: due.len(),
            skipped: self.plants.len() - due.len(),
            ..Default::default()
        };

        let measured_at = Utc::now().trunc_subsecs(0);
        let results = join_all(
            due.iter()
                .map(|plant| poll_plant(ctx.modbus.as_ref(), &self.params, plant, measured_at)),
        )
        .await;

        let mut samples = Vec::with_capacity(due.len());
        for (plant, result) in due.iter().zip(results) {
            match result {
                Ok(sample) => {
                    self.breaker.on_success(plant.id);
                    samples.push(sample);
                }
                Err(e) => {
                    warn!(plant_id = plant.id, pod = %plant.pod_id, error = %e, "Plant poll failed");
                    self.breaker.on_failure(plant.id);
                    report.failed += 1;
                }
            }
        }

        report.stored = ctx.store.insert_plant_samples(&samples).await?;
        debug!(?report, "Cycle complete");
        Ok(report)
    }

    fn pacing(&self) -> Pacing {
        Pacing::FixedRate(self.params.period)
    }
}

async fn poll_plant(
    modbus: &dyn ModbusConnector,
    params: &CollectorParams,
    plant: &ControlPlant,
    measured_at: DateTime<Utc>,
) -> Result<PlantSample, GatewayError> {
    let map = RegisterMap::load(&params.register_map_dir, plant.logger_kind()).await?;
    let mut session = modbus.connect(&plant.logger, params.timeout).await?;
    let values = read_scaled(session.as_mut(), &map).await;
    session.close().await;
    Ok(plant_sample(plant, &values?, measured_at))
}

/// Reads every map entry from holding registers. An unreadable entry is
/// `None`; a map with no readable entry at all is an error.
async fn read_scaled(
    session: &mut dyn ModbusSession,
    map: &RegisterMap,
) -> Result<HashMap<String, Option<f64>>, GatewayError> {
    let mut values = HashMap::with_capacity(map.len());
    let mut failures = 0;
    for (key, spec) in map.iter() {
        let value = match session.read_holding(spec.address, spec.quantity).await {
            Ok(registers) => combine_scaled(
                &registers,
                spec.gain.unwrap_or(1.0),
                spec.signed.unwrap_or(true),
            ),
            Err(e) => {
                debug!(key, address = spec.address, error = %e, "Register read failed");
                failures += 1;
                None
            }
        };
        values.insert(key.to_string(), value);
    }
    if !map.is_empty() && failures == map.len() {
        return Err(GatewayError::NoData);
    }
    Ok(values)
}

/// Maps logger values onto a plant sample.
///
/// Available maximum and reference power both follow the magnitude of the
/// active power; a zero or missing reading leaves them empty.
pub fn plant_sample(
    plant: &ControlPlant,
    values: &HashMap<String, Option<f64>>,
    measured_at: DateTime<Utc>,
) -> PlantSample {
    let value = |key: &str| values.get(key).copied().flatten();
    let sum_active_power = value("sum_active_power");
    let magnitude = sum_active_power.filter(|p| *p != 0.0).map(f64::abs);

    PlantSample {
        plant_id: plant.id,
        pod_id: plant.pod_id.clone(),
        measured_at,
        sum_active_power,
        cos_phi: value("cos_phi"),
        available_power_min: Some(0.0),
        available_power_max: magnitude,
        reference_power: magnitude,
        ghi: None,
        panel_temp: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ScriptedAggregator;
    use crate::db::MemoryStore;
    use crate::modbus::{ModbusEndpoint, SimulatedDevices};
    use std::sync::Arc;

    const LOGGER_MAP: &str = r#"{
        "sum_active_power": {"address": 100, "quantity": 2, "gain": 10},
        "cos_phi": {"address": 110, "quantity": 1, "gain": 1000}
    }"#;

    fn plant(id: PlantId, host: &str) -> ControlPlant {
        ControlPlant {
            id,
            pod_id: format!("HU-{id}"),
            name: format!("Plant {id}"),
            logger: ModbusEndpoint::new(host, 502, 1),
            logger_manufacturer: "SolarLog".to_string(),
            ess_units: Vec::new(),
        }
    }

    fn setup() -> (tempfile::TempDir, MemoryStore, SimulatedDevices, Deps) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("logger")).unwrap();
        std::fs::write(dir.path().join("logger/solarlog.json"), LOGGER_MAP).unwrap();

        let store = MemoryStore::new();
        let devices = SimulatedDevices::new();
        let deps = Deps::new(
            Arc::new(store.clone()),
            Arc::new(devices.clone()),
            Arc::new(ScriptedAggregator::new()),
        );
        (dir, store, devices, deps)
    }

    fn params(dir: &tempfile::TempDir) -> CollectorParams {
        CollectorParams {
            register_map_dir: dir.path().to_path_buf(),
            timeout: Duration::from_millis(100),
            cooldown: Duration::from_secs(300),
            period: Duration::from_secs(2),
        }
    }

    #[test]
    fn sample_derives_power_limits_from_active_power() {
        let plant = plant(1, "10.0.0.1");
        let now = Utc::now().trunc_subsecs(0);
        let values = HashMap::from([
            ("sum_active_power".to_string(), Some(-250.0)),
            ("cos_phi".to_string(), Some(0.98)),
        ]);
        let sample = plant_sample(&plant, &values, now);
        assert_eq!(sample.available_power_min, Some(0.0));
        assert_eq!(sample.available_power_max, Some(250.0));
        assert_eq!(sample.reference_power, Some(250.0));
        assert_eq!(sample.ghi, None);

        let values = HashMap::from([("sum_active_power".to_string(), Some(0.0))]);
        let sample = plant_sample(&plant, &values, now);
        assert_eq!(sample.sum_active_power, Some(0.0));
        assert_eq!(sample.available_power_max, None);
        assert_eq!(sample.cos_phi, None);
    }

    #[tokio::test]
    async fn cycle_stores_reachable_plants_and_opens_breaker() {
        let (dir, store, devices, deps) = setup();
        let good = plant(1, "10.0.0.1");
        let down = plant(2, "10.0.0.2");
        // 0x0000_3039 = 12345 -> 1234.5 kW
        devices.set_holding(&good.logger, 100, &[0, 12_345]);
        devices.set_holding(&good.logger, 110, &[990]);
        store.add_plant(good.clone());
        store.add_plant(down.clone());

        let mut collector = Collector::from_params(params(&dir)).unwrap();
        collector.on_start(&deps).await.unwrap();

        let report = collector.run_cycle(&deps).await.unwrap();
        assert_eq!(
            report,
            CollectorReport {
                polled: 2,
                skipped: 0,
                failed: 1,
                stored: 1
            }
        );
        let samples = store.plant_samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].pod_id, "HU-1");
        assert_eq!(samples[0].sum_active_power, Some(1234.5));
        assert_eq!(samples[0].cos_phi, Some(0.99));
        assert_eq!(samples[0].measured_at.timestamp_subsec_nanos(), 0);

        // the failed plant sits out the cooldown even once it is back
        devices.add_device(&down.logger);
        let report = collector.run_cycle(&deps).await.unwrap();
        assert_eq!(report.polled, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.plant_samples().len(), 2);
    }

    #[tokio::test]
    async fn missing_register_map_fails_the_plant() {
        let (dir, store, devices, deps) = setup();
        let mut unknown = plant(3, "10.0.0.3");
        unknown.logger_manufacturer = "Fronius".to_string();
        devices.add_device(&unknown.logger);
        store.add_plant(unknown);

        let mut collector = Collector::from_params(params(&dir)).unwrap();
        collector.on_start(&deps).await.unwrap();
        let report = collector.run_cycle(&deps).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.stored, 0);
    }

    #[tokio::test]
    async fn partially_readable_logger_still_reports() {
        let (dir, store, devices, deps) = setup();
        let p = plant(4, "10.0.0.4");
        devices.set_holding(&p.logger, 100, &[0, 500]);
        devices.fail_reads_at(&p.logger, 110);
        store.add_plant(p);

        let mut collector = Collector::from_params(params(&dir)).unwrap();
        collector.on_start(&deps).await.unwrap();
        let report = collector.run_cycle(&deps).await.unwrap();
        assert_eq!(report.stored, 1);
        let sample = &store.plant_samples()[0];
        assert_eq!(sample.sum_active_power, Some(50.0));
        assert_eq!(sample.cos_phi, None);
    }
}
