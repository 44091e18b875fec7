//! # Environment Poller
//!
//! Reads the ambient temperature of every active sensor. Each sensor
//! exposes one input register at address 0 holding tenths of a degree.

use crate::config::AppConfig;
use crate::context::Deps;
use crate::error::GatewayError;
use crate::model::{EnvironmentSample, EnvironmentSensor};
use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use futures::future::join_all;
use gateway_actors::{Pacing, PeriodicWorker, RestartPolicy, WorkerActor, WorkerClient};
use std::time::Duration;
use tracing::{debug, info, warn};

const TEMPERATURE_REGISTER: u16 = 0;

#[derive(Debug, Clone)]
pub struct EnvPollerParams {
    pub timeout: Duration,
    pub period: Duration,
}

impl EnvPollerParams {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            timeout: config.modbus.sensor_timeout(),
            period: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvPollerReport {
    pub stored: usize,
    pub duplicates: usize,
    pub failed: usize,
}

pub struct EnvPoller {
    params: EnvPollerParams,
    sensors: Vec<EnvironmentSensor>,
}

pub fn new(
    params: EnvPollerParams,
    policy: RestartPolicy,
) -> (WorkerActor<EnvPoller>, WorkerClient<EnvPoller>) {
    WorkerActor::new(params, policy, 8)
}

/// Signed tenths of a degree to °C.
pub fn decode_temperature(raw: u16) -> f64 {
    f64::from(raw as i16) / 10.0
}

#[async_trait]
impl PeriodicWorker for EnvPoller {
    const NAME: &'static str = "env-poller";
    type Params = EnvPollerParams;
    type Context = Deps;
    type Report = EnvPollerReport;
    type Error = GatewayError;

    fn from_params(params: EnvPollerParams) -> Result<Self, GatewayError> {
        Ok(Self {
            params,
            sensors: Vec::new(),
        })
    }

    async fn on_start(&mut self, ctx: &Deps) -> Result<(), GatewayError> {
        self.sensors = ctx.store.active_environment_sensors().await?;
        info!(sensors = self.sensors.len(), "Polling environment sensors");
        Ok(())
    }

    async fn run_cycle(&mut self, ctx: &Deps) -> Result<EnvPollerReport, GatewayError> {
        let timeout = self.params.timeout;
        let results = join_all(self.sensors.iter().map(|s| poll_sensor(ctx, s, timeout))).await;

        let mut report = EnvPollerReport::default();
        for (sensor, result) in self.sensors.iter().zip(results) {
            match result {
                Ok(true) => report.stored += 1,
                Ok(false) => report.duplicates += 1,
                Err(e) => {
                    warn!(sensor_id = sensor.id, error = %e, "Sensor poll failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    fn pacing(&self) -> Pacing {
        Pacing::FixedDelay(self.params.period)
    }
}

async fn poll_sensor(
    ctx: &Deps,
    sensor: &EnvironmentSensor,
    timeout: Duration,
) -> Result<bool, GatewayError> {
    let mut session = ctx.modbus.connect(&sensor.endpoint, timeout).await?;
    let registers = session.read_input(TEMPERATURE_REGISTER, 1).await;
    session.close().await;

    let raw = registers?
        .first()
        .copied()
        .ok_or(GatewayError::NoData)?;
    let sample = EnvironmentSample {
        sensor_id: sensor.id,
        measured_at: Utc::now().trunc_subsecs(0),
        temperature: decode_temperature(raw),
    };
    let inserted = ctx.store.insert_environment_sample(&sample).await?;
    debug!(sensor_id = sensor.id, temperature = sample.temperature, inserted, "Sensor read");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ScriptedAggregator;
    use crate::db::MemoryStore;
    use crate::modbus::{ModbusEndpoint, SimulatedDevices};
    use std::sync::Arc;

    #[test]
    fn temperature_is_signed_tenths() {
        assert_eq!(decode_temperature(215), 21.5);
        assert_eq!(decode_temperature(0xFFEC), -2.0);
        assert_eq!(decode_temperature(0), 0.0);
    }

    #[tokio::test]
    async fn failing_sensor_does_not_affect_others() {
        let store = MemoryStore::new();
        let devices = SimulatedDevices::new();
        let deps = Deps::new(
            Arc::new(store.clone()),
            Arc::new(devices.clone()),
            Arc::new(ScriptedAggregator::new()),
        );

        let roof = EnvironmentSensor {
            id: 1,
            endpoint: ModbusEndpoint::new("10.0.2.1", 502, 1),
        };
        let yard = EnvironmentSensor {
            id: 2,
            endpoint: ModbusEndpoint::new("10.0.2.2", 502, 1),
        };
        devices.set_input(&roof.endpoint, 0, &[183]);
        store.add_sensor(roof, &[1]);
        store.add_sensor(yard, &[1]);

        let mut poller = EnvPoller::from_params(EnvPollerParams {
            timeout: Duration::from_millis(100),
            period: Duration::from_secs(30),
        })
        .unwrap();
        poller.on_start(&deps).await.unwrap();

        let report = poller.run_cycle(&deps).await.unwrap();
        assert_eq!(
            report,
            EnvPollerReport {
                stored: 1,
                duplicates: 0,
                failed: 1
            }
        );

        let samples = store.environment_samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].sensor_id, 1);
        assert_eq!(samples[0].temperature, 18.3);
        assert_eq!(samples[0].measured_at.timestamp_subsec_nanos(), 0);
    }
}
