//! # ESS Poller
//!
//! Reads every active ESS unit, aggregates the cell and container
//! temperature blocks and derives the capacity still available for charging
//! and discharging. One [`EssSample`] is stored per unit and cycle.
//!
//! Failures are tracked per plant in a [`CircuitBreaker`] for logging only;
//! a failing unit is still polled every cycle.

use crate::breaker::CircuitBreaker;
use crate::config::AppConfig;
use crate::context::Deps;
use crate::error::GatewayError;
use crate::modbus::ModbusSession;
use crate::model::{EssSample, EssUnit, PlantId, Stats};
use crate::register_map::{decode_each, RegisterMap, RegisterMapError};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use gateway_actors::{Pacing, PeriodicWorker, RestartPolicy, WorkerActor, WorkerClient};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const TOTAL_CAPACITY: &str = "totalCapacity";
const CURRENT_SOC: &str = "averageCurrentSOC";
const MIN_SOC: &str = "allowedMinSOC";
const MAX_SOC: &str = "allowedMaxSOC";
const BATTERY_TEMP: &str = "averageBatterycellTemp";
const CONTAINER_TEMP: &str = "averageContainerInsideTemp";

#[derive(Debug, Clone)]
pub struct EssPollerParams {
    pub register_map_dir: PathBuf,
    /// Map used for every unit, relative to `register_map_dir`.
    pub register_map: Option<PathBuf>,
    pub timeout: Duration,
    pub period: Duration,
}

impl EssPollerParams {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            register_map_dir: config.modbus.register_map_dir.clone(),
            register_map: config.ess.register_map.clone(),
            timeout: config.modbus.ess_timeout(),
            period: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EssPollerReport {
    pub polled: usize,
    pub failed: usize,
}

pub struct EssPoller {
    params: EssPollerParams,
    units: Vec<EssUnit>,
    maps: HashMap<PathBuf, Arc<RegisterMap>>,
    breaker: CircuitBreaker<PlantId>,
}

pub fn new(
    params: EssPollerParams,
    policy: RestartPolicy,
) -> (WorkerActor<EssPoller>, WorkerClient<EssPoller>) {
    WorkerActor::new(params, policy, 8)
}

impl EssPoller {
    fn map_path(&self, unit: &EssUnit) -> PathBuf {
        let relative = match &self.params.register_map {
            Some(path) => path.clone(),
            None => unit.kind().relative_path(),
        };
        self.params.register_map_dir.join(relative)
    }

    async fn map_for(&mut self, unit: &EssUnit) -> Result<Arc<RegisterMap>, RegisterMapError> {
        let path = self.map_path(unit);
        if let Some(map) = self.maps.get(&path) {
            return Ok(Arc::clone(map));
        }
        let map = Arc::new(RegisterMap::load_file(&path).await?);
        info!(path = %path.display(), entries = map.len(), "Loaded ESS register map");
        self.maps.insert(path, Arc::clone(&map));
        Ok(map)
    }
}

#[async_trait]
impl PeriodicWorker for EssPoller {
    const NAME: &'static str = "ess-poller";
    type Params = EssPollerParams;
    type Context = Deps;
    type Report = EssPollerReport;
    type Error = GatewayError;

    fn from_params(params: EssPollerParams) -> Result<Self, GatewayError> {
        Ok(Self {
            params,
            units: Vec::new(),
            maps: HashMap::new(),
            breaker: CircuitBreaker::default(),
        })
    }

    async fn on_start(&mut self, ctx: &Deps) -> Result<(), GatewayError> {
        self.units = ctx.store.active_ess_units().await?;
        info!(units = self.units.len(), "Polling ESS units");
        Ok(())
    }

    async fn run_cycle(&mut self, ctx: &Deps) -> Result<EssPollerReport, GatewayError> {
        let units = self.units.clone();
        let mut mapped = Vec::with_capacity(units.len());
        let mut failed_plants = Vec::new();
        for unit in &units {
            match self.map_for(unit).await {
                Ok(map) => mapped.push((unit, map)),
                Err(e) => {
                    warn!(plant_id = unit.plant_id, ess_id = unit.id, error = %e, "ESS poll failed");
                    failed_plants.push(unit.plant_id);
                }
            }
        }

        let params = &self.params;
        let results = join_all(
            mapped
                .into_iter()
                .map(|(unit, map)| poll_unit(ctx, params, unit, map)),
        )
        .await;
        let mut report = EssPollerReport {
            polled: units.len(),
            failed: failed_plants.len(),
        };
        for (plant_id, result) in results {
            match result {
                Ok(()) => self.breaker.on_success(plant_id),
                Err(e) => {
                    warn!(plant_id, error = %e, "ESS poll failed");
                    report.failed += 1;
                    self.breaker.on_failure(plant_id);
                }
            }
        }
        for plant_id in failed_plants {
            self.breaker.on_failure(plant_id);
        }
        Ok(report)
    }

    fn pacing(&self) -> Pacing {
        Pacing::FixedDelay(self.params.period)
    }
}

async fn poll_unit(
    ctx: &Deps,
    params: &EssPollerParams,
    unit: &EssUnit,
    map: Arc<RegisterMap>,
) -> (PlantId, Result<(), GatewayError>) {
    let result = async {
        let mut session = ctx.modbus.connect(&unit.endpoint, params.timeout).await?;
        let values = read_blocks(session.as_mut(), &map, unit.plant_id).await;
        session.close().await;

        let sample = ess_sample(unit.plant_id, &values)?;
        ctx.store.insert_ess_sample(&sample).await?;
        debug!(
            plant_id = unit.plant_id,
            soc = sample.average_current_soc,
            charge = sample.available_capacity_charge,
            discharge = sample.available_capacity_discharge,
            "ESS sample stored"
        );
        Ok::<(), GatewayError>(())
    }
    .await;
    (unit.plant_id, result)
}

/// Reads every map entry; a failed read leaves that entry empty.
async fn read_blocks(
    session: &mut dyn ModbusSession,
    map: &RegisterMap,
    plant_id: PlantId,
) -> HashMap<String, Vec<f64>> {
    let mut values = HashMap::with_capacity(map.len());
    for (key, spec) in map.iter() {
        let decoded = match session.read(spec.table(), spec.address, spec.quantity).await {
            Ok(registers) => decode_each(&registers, spec),
            Err(e) => {
                warn!(plant_id, key, error = %e, "ESS register read failed");
                Vec::new()
            }
        };
        values.insert(key.to_string(), decoded);
    }
    values
}

fn first(values: &HashMap<String, Vec<f64>>, key: &'static str) -> Result<f64, GatewayError> {
    values
        .get(key)
        .and_then(|v| v.first().copied())
        .ok_or(GatewayError::MissingValue(key))
}

fn stats(values: &HashMap<String, Vec<f64>>, key: &str) -> Stats {
    Stats::of(values.get(key).into_iter().flatten().map(|v| Some(*v)))
}

/// Builds an ESS sample from decoded register blocks.
pub fn ess_sample(
    plant_id: PlantId,
    values: &HashMap<String, Vec<f64>>,
) -> Result<EssSample, GatewayError> {
    let total = first(values, TOTAL_CAPACITY)?;
    let soc = first(values, CURRENT_SOC)?;
    let min_soc = first(values, MIN_SOC)?;
    let max_soc = first(values, MAX_SOC)?;
    let (charge, discharge) = available_capacity(total, soc, min_soc, max_soc);

    Ok(EssSample {
        plant_id,
        measured_at: Utc::now(),
        battery_temp: stats(values, BATTERY_TEMP),
        container_temp: stats(values, CONTAINER_TEMP),
        available_capacity_charge: charge,
        available_capacity_discharge: discharge,
        average_current_soc: soc,
        allowed_min_soc: min_soc,
        allowed_max_soc: max_soc,
    })
}

/// Energy that can still be charged and discharged within the SOC limits,
/// both clamped at zero.
pub fn available_capacity(total: f64, soc: f64, min_soc: f64, max_soc: f64) -> (f64, f64) {
    let current = total * soc / 100.0;
    let charge = total * max_soc / 100.0 - current;
    let discharge = current - total * min_soc / 100.0;
    (charge.max(0.0), discharge.max(0.0))
}
