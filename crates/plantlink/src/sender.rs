//! # Sender
//!
//! Reports the latest measurement of every control plant to the aggregator
//! and stores the control that comes back.
//!
//! Each pod is posted on its own, up to `max_concurrent` at a time. The
//! first control of a successful response is recorded only when its
//! heartbeat is newer than the stored one. Every exchange lands in the send
//! log.

use crate::aggregator::{build_report, ReportInputs};
use crate::config::AppConfig;
use crate::context::Deps;
use crate::error::GatewayError;
use crate::model::{EssTemperature, HeartbeatPolicy, PlantSample, SendLogEntry, Stats};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use gateway_actors::{Pacing, PeriodicWorker, RestartPolicy, WorkerActor, WorkerClient};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SenderParams {
    pub stats_window: Duration,
    pub max_concurrent: usize,
    pub period: Duration,
}

impl SenderParams {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            stats_window: Duration::from_secs(config.sender.stats_window_secs),
            max_concurrent: config.sender.max_concurrent.max(1),
            period: Duration::from_secs(2),
        }
    }
}

/// What happened to one pod's report.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// 200 from the aggregator; `control_stored` when a control replaced
    /// the stored one.
    Accepted { control_stored: bool },
    /// Any other status.
    Rejected(u16),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderReport {
    pub sent: usize,
    pub controls: usize,
    pub rejected: usize,
    pub failed: usize,
}

pub struct Sender {
    params: SenderParams,
}

pub fn new(params: SenderParams, policy: RestartPolicy) -> (WorkerActor<Sender>, WorkerClient<Sender>) {
    WorkerActor::new(params, policy, 8)
}

#[async_trait]
impl PeriodicWorker for Sender {
    const NAME: &'static str = "sender";
    type Params = SenderParams;
    type Context = Deps;
    type Report = SenderReport;
    type Error = GatewayError;

    fn from_params(params: SenderParams) -> Result<Self, GatewayError> {
        Ok(Self { params })
    }

    async fn run_cycle(&mut self, ctx: &Deps) -> Result<SenderReport, GatewayError> {
        let started = Instant::now();
        let measurements = ctx.store.latest_plant_measurements().await?;

        let window = self.params.stats_window;
        let pending: Vec<_> = measurements
            .iter()
            .map(|m| async move { (m.pod_id.clone(), send_pod(ctx, m, window).await) })
            .collect();
        let outcomes: Vec<(String, Result<SendOutcome, GatewayError>)> = stream::iter(pending)
            .buffer_unordered(self.params.max_concurrent)
            .collect()
            .await;

        let mut report = SenderReport::default();
        for (pod, outcome) in outcomes {
            match outcome {
                Ok(SendOutcome::Accepted { control_stored }) => {
                    report.sent += 1;
                    if control_stored {
                        report.controls += 1;
                    }
                }
                Ok(SendOutcome::Rejected(status)) => {
                    warn!(pod = %pod, status, "Aggregator rejected report");
                    report.rejected += 1;
                }
                Err(e) => {
                    warn!(pod = %pod, error = %e, "Send failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            pods = measurements.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cycle time"
        );
        Ok(report)
    }

    fn pacing(&self) -> Pacing {
        Pacing::FixedRate(self.params.period)
    }
}

/// Gathers the pod's inputs, posts its report and records the answer.
pub async fn send_pod(
    ctx: &Deps,
    measurement: &PlantSample,
    window: Duration,
) -> Result<SendOutcome, GatewayError> {
    let store = &ctx.store;
    let pod = &measurement.pod_id;
    let plant_id = measurement.plant_id;

    let heartbeat = store.last_heartbeat(pod).await?.unwrap_or(1);
    let ess = store.latest_ess_sample(plant_id).await?;
    let environment_temp = store.environment_window_stats(plant_id, window).await?;
    let (battery_temp, container_temp) = if ess.is_some() {
        (
            store
                .ess_window_stats(plant_id, EssTemperature::Battery, window)
                .await?,
            store
                .ess_window_stats(plant_id, EssTemperature::Container, window)
                .await?,
        )
    } else {
        (Stats::default(), Stats::default())
    };

    let reports = vec![build_report(
        &ReportInputs {
            measurement,
            ess: ess.as_ref(),
            heartbeat,
            battery_temp,
            container_temp,
            environment_temp,
        },
        Utc::now(),
    )];
    let response = ctx.aggregator.post_reports(&reports).await?;

    let mut control_stored = false;
    if response.is_ok() {
        if let Some(control) = response.first_control(pod) {
            let replaced = store
                .record_controls(&[control], HeartbeatPolicy::Monotonic)
                .await?;
            control_stored = !replaced.is_empty();
            debug!(pod = %pod, control_stored, "Control received");
        }
    }

    store
        .store_send_log(&SendLogEntry {
            pod: pod.clone(),
            request: serde_json::to_value(&reports)?,
            response: response.body.clone(),
            status: response.status,
        })
        .await?;

    Ok(if response.is_ok() {
        SendOutcome::Accepted { control_stored }
    } else {
        SendOutcome::Rejected(response.status)
    })
}
