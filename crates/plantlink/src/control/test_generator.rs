//! Commissioning aid: drives every pod through a fixed setpoint sequence.
//!
//! The sequence advances one element every `step` and then holds the last
//! element. Each cycle overwrites the inbox of every pod, which re-arms the
//! executor even when the value did not change.

use super::ControlError;
use crate::config::AppConfig;
use crate::context::Deps;
use crate::model::{Control, HeartbeatPolicy};
use async_trait::async_trait;
use gateway_actors::{Pacing, PeriodicWorker, RestartPolicy, WorkerActor, WorkerClient};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone)]
pub struct TestGeneratorParams {
    pub step: Duration,
    pub sequence: Vec<f64>,
    pub interval: Duration,
}

impl TestGeneratorParams {
    pub fn from_config(config: &AppConfig) -> Self {
        let generator = &config.test_generator;
        Self {
            step: Duration::from_secs(generator.step_minutes * 60),
            sequence: generator.sequence.clone(),
            interval: Duration::from_secs(generator.write_interval_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
    pub step: usize,
    pub setpoint_kw: f64,
    pub pods: usize,
}

pub struct ControlTestGenerator {
    params: TestGeneratorParams,
    pods: Vec<String>,
    started: Instant,
}

pub fn new(
    params: TestGeneratorParams,
    policy: RestartPolicy,
) -> (WorkerActor<ControlTestGenerator>, WorkerClient<ControlTestGenerator>) {
    WorkerActor::new(params, policy, 8)
}

/// Index into a sequence of `len` steps after `elapsed`, holding the last.
pub fn step_index(elapsed: Duration, step: Duration, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let index = if step.is_zero() {
        len - 1
    } else {
        (elapsed.as_secs_f64() / step.as_secs_f64()).floor() as usize
    };
    index.min(len - 1)
}

impl ControlTestGenerator {
    fn report_at(&self, elapsed: Duration) -> TestReport {
        let step = step_index(elapsed, self.params.step, self.params.sequence.len());
        TestReport {
            step,
            setpoint_kw: self.params.sequence[step],
            pods: self.pods.len(),
        }
    }
}

#[async_trait]
impl PeriodicWorker for ControlTestGenerator {
    const NAME: &'static str = "control-test-generator";
    type Params = TestGeneratorParams;
    type Context = Deps;
    type Report = TestReport;
    type Error = ControlError;

    fn from_params(params: TestGeneratorParams) -> Result<Self, ControlError> {
        if params.sequence.is_empty() {
            return Err(ControlError::EmptySequence);
        }
        Ok(Self {
            params,
            pods: Vec::new(),
            started: Instant::now(),
        })
    }

    async fn on_start(&mut self, ctx: &Deps) -> Result<(), ControlError> {
        self.pods = ctx.store.active_pods().await?;
        self.started = Instant::now();
        info!(pods = self.pods.len(), sequence = ?self.params.sequence, "Starting control test generator");
        Ok(())
    }

    async fn run_cycle(&mut self, ctx: &Deps) -> Result<TestReport, ControlError> {
        let report = self.report_at(self.started.elapsed());
        let controls: Vec<Control> = self
            .pods
            .iter()
            .map(|pod| Control::test_setpoint(pod.as_str(), report.setpoint_kw))
            .collect();
        ctx.store
            .record_controls(&controls, HeartbeatPolicy::Overwrite)
            .await?;
        for pod in &self.pods {
            info!(pod = %pod, setpoint_kw = report.setpoint_kw, "Forced test setpoint");
        }
        Ok(report)
    }

    fn pacing(&self) -> Pacing {
        Pacing::FixedDelay(self.params.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ScriptedAggregator;
    use crate::db::MemoryStore;
    use crate::model::ControlPlant;
    use crate::modbus::{ModbusEndpoint, SimulatedDevices};
    use std::sync::Arc;

    fn params() -> TestGeneratorParams {
        TestGeneratorParams {
            step: Duration::from_secs(300),
            sequence: vec![50.0, 100.0, 200.0, 300.0],
            interval: Duration::from_secs(30),
        }
    }

    #[test]
    fn steps_advance_and_hold_the_last_value() {
        let step = Duration::from_secs(300);
        assert_eq!(step_index(Duration::ZERO, step, 4), 0);
        assert_eq!(step_index(Duration::from_secs(299), step, 4), 0);
        assert_eq!(step_index(Duration::from_secs(300), step, 4), 1);
        assert_eq!(step_index(Duration::from_secs(901), step, 4), 3);
        assert_eq!(step_index(Duration::from_secs(86_400), step, 4), 3);
    }

    #[test]
    fn empty_sequence_is_rejected() {
        let mut params = params();
        params.sequence.clear();
        assert!(matches!(
            ControlTestGenerator::from_params(params),
            Err(ControlError::EmptySequence)
        ));
    }

    #[tokio::test]
    async fn cycle_overwrites_every_pod() {
        let store = MemoryStore::new();
        let deps = Deps::new(
            Arc::new(store.clone()),
            Arc::new(SimulatedDevices::new()),
            Arc::new(ScriptedAggregator::new()),
        );
        for id in [1, 2] {
            store.add_plant(ControlPlant {
                id,
                pod_id: format!("HU-{id}"),
                name: format!("Plant {id}"),
                logger: ModbusEndpoint::new("10.0.0.1", 502, id as u8),
                logger_manufacturer: "SolarLog".to_string(),
                ess_units: Vec::new(),
            });
        }

        let mut generator = ControlTestGenerator::from_params(params()).unwrap();
        generator.on_start(&deps).await.unwrap();
        let report = generator.run_cycle(&deps).await.unwrap();
        assert_eq!(
            report,
            TestReport {
                step: 0,
                setpoint_kw: 50.0,
                pods: 2
            }
        );
        assert_eq!(generator.report_at(Duration::from_secs(610)).setpoint_kw, 200.0);

        for pod in ["HU-1", "HU-2"] {
            let row = store.inbox(pod).unwrap();
            assert_eq!(row.control.heartbeat, Some(1));
            assert_eq!(row.control.sum_set_point, Some(50.0));
            assert_eq!(row.control.scheduled_reference, Some(50.0));
            assert_eq!(row.control.use_set_point, 1);
            assert!(!row.applied);
        }
    }
}
