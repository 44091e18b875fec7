//! Polls the aggregator for controls with an empty report.

use super::ControlError;
use crate::context::Deps;
use crate::model::HeartbeatPolicy;
use async_trait::async_trait;
use gateway_actors::{Pacing, PeriodicWorker, RestartPolicy, WorkerActor, WorkerClient};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct FetcherParams {
    pub period: Duration,
}

impl Default for FetcherParams {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub status: u16,
    pub received: usize,
    pub stored: usize,
}

pub struct ControlFetcher {
    params: FetcherParams,
}

pub fn new(
    params: FetcherParams,
    policy: RestartPolicy,
) -> (WorkerActor<ControlFetcher>, WorkerClient<ControlFetcher>) {
    WorkerActor::new(params, policy, 8)
}

#[async_trait]
impl PeriodicWorker for ControlFetcher {
    const NAME: &'static str = "control-fetcher";
    type Params = FetcherParams;
    type Context = Deps;
    type Report = FetchReport;
    type Error = ControlError;

    fn from_params(params: FetcherParams) -> Result<Self, ControlError> {
        Ok(Self { params })
    }

    async fn run_cycle(&mut self, ctx: &Deps) -> Result<FetchReport, ControlError> {
        let response = ctx.aggregator.post_reports(&[]).await?;
        let mut report = FetchReport {
            status: response.status,
            ..Default::default()
        };
        if !response.is_ok() {
            warn!(status = response.status, "Bad response");
            return Ok(report);
        }

        let controls = response.controls();
        report.received = controls.len();
        if controls.is_empty() {
            debug!("No controls received yet");
            return Ok(report);
        }

        // fetched controls always win over the stored ones
        let stored = ctx
            .store
            .record_controls(&controls, HeartbeatPolicy::Overwrite)
            .await?;
        for control in controls.iter().filter(|c| stored.contains(&c.pod)) {
            info!(pod = %control.pod, heartbeat = ?control.heartbeat, "Control stored");
        }
        report.stored = stored.len();
        Ok(report)
    }

    fn pacing(&self) -> Pacing {
        Pacing::FixedDelay(self.params.period)
    }
}
