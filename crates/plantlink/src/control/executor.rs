//! Applies inbox controls to the ESS units.
//!
//! Each cycle waits for one announced pod. Handling a pod:
//!
//! 1. take the pod's advisory lock, or leave the pod to whoever holds it;
//! 2. in one transaction, load the latest unapplied control, the plant's
//!    active power and the ESS state, and decide with [`plan_setpoint`];
//! 3. write the setpoint when the plan says so, mark the control applied and
//!    commit; on any error roll back;
//! 4. release the lock in every case.

use super::ControlError;
use crate::config::AppConfig;
use crate::context::Deps;
use crate::db::{ControlNotifications, ControlSession};
use crate::model::{ControlId, EssState, PendingControl};
use crate::modbus::encode_setpoint;
use async_trait::async_trait;
use gateway_actors::{Pacing, PeriodicWorker, RestartPolicy, WorkerActor, WorkerClient};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MISSING_STATE: &str = "Missing state data";
pub const MISSING_SETPOINT: &str = "Missing setpoint";
pub const NO_DISCHARGE_CAPACITY: &str = "No discharge capacity";
pub const NO_CHARGE_CAPACITY: &str = "No charge capacity";
pub const WITHIN_DEADBAND: &str = "Within deadband";

#[derive(Debug, Clone)]
pub struct ExecutorParams {
    pub channel: String,
    pub wait: Duration,
    pub setpoint_register: u16,
    pub scale: f64,
    pub deadband_kw: f64,
    pub write_timeout: Duration,
}

impl ExecutorParams {
    pub fn from_config(config: &AppConfig) -> Self {
        let control = &config.control;
        Self {
            channel: control.notify_channel.clone(),
            wait: Duration::from_secs(control.wait_secs.max(1)),
            setpoint_register: control.setpoint_register,
            scale: control.scale,
            deadband_kw: control.deadband_kw,
            write_timeout: config.modbus.ess_timeout(),
        }
    }
}

/// Decision for one control.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// Mark applied without writing.
    Skip {
        applied_kw: Option<f64>,
        note: &'static str,
    },
    /// Write this setpoint to the ESS.
    Write(f64),
}

/// Computes the ESS setpoint for a target plant output.
///
/// The setpoint is `target - current`; positive discharges the battery.
/// Nothing is written when the battery cannot move in that direction or when
/// the setpoint is within `deadband_kw` of the last value written.
pub fn plan_setpoint(
    pod: &str,
    target_kw: f64,
    current_kw: f64,
    ess: &EssState,
    last_written: Option<f64>,
    deadband_kw: f64,
) -> Result<Plan, ControlError> {
    if ess.soc.is_none() {
        return Err(ControlError::UnknownSoc(pod.to_string()));
    }
    let setpoint = target_kw - current_kw;

    if setpoint > 0.0 && ess.capacity_discharge <= 0.0 {
        return Ok(Plan::Skip {
            applied_kw: Some(0.0),
            note: NO_DISCHARGE_CAPACITY,
        });
    }
    if setpoint < 0.0 && ess.capacity_charge <= 0.0 {
        return Ok(Plan::Skip {
            applied_kw: Some(0.0),
            note: NO_CHARGE_CAPACITY,
        });
    }
    if let Some(last) = last_written {
        if (setpoint - last).abs() < deadband_kw {
            return Ok(Plan::Skip {
                applied_kw: Some(last),
                note: WITHIN_DEADBAND,
            });
        }
    }
    Ok(Plan::Write(setpoint))
}

/// Result of one executor cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOutcome {
    /// No announcement within the wait.
    Idle,
    /// Another session holds the pod's lock.
    Locked { pod: String },
    NothingPending { pod: String },
    Skipped { pod: String, note: &'static str },
    Written { pod: String, kw: f64 },
}

pub struct ControlExecutor {
    params: ExecutorParams,
    session: Option<Box<dyn ControlSession>>,
    notifications: Option<Box<dyn ControlNotifications>>,
    last_written: HashMap<String, f64>,
}

pub fn new(
    params: ExecutorParams,
    policy: RestartPolicy,
) -> (WorkerActor<ControlExecutor>, WorkerClient<ControlExecutor>) {
    WorkerActor::new(params, policy, 8)
}

impl ControlExecutor {
    /// Handles one announced pod.
    pub async fn handle_pod(&mut self, ctx: &Deps, pod: &str) -> Result<ControlOutcome, ControlError> {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => ctx.store.control_session().await?,
        };
        let result = locked(session.as_mut(), ctx, &self.params, &mut self.last_written, pod).await;
        match &result {
            // the session may be broken; dropping it releases its locks
            Err(ControlError::Db(e)) => warn!(pod, error = %e, "Discarding control session"),
            _ => self.session = Some(session),
        }
        result
    }
}

async fn locked(
    conn: &mut dyn ControlSession,
    ctx: &Deps,
    params: &ExecutorParams,
    last_written: &mut HashMap<String, f64>,
    pod: &str,
) -> Result<ControlOutcome, ControlError> {
    if !conn.try_lock(pod).await? {
        debug!(pod, "Pod locked elsewhere");
        return Ok(ControlOutcome::Locked {
            pod: pod.to_string(),
        });
    }

    let result = in_transaction(conn, ctx, params, last_written, pod).await;
    let unlocked = conn.unlock(pod).await;
    let outcome = result?;
    unlocked?;
    Ok(outcome)
}

async fn in_transaction(
    conn: &mut dyn ControlSession,
    ctx: &Deps,
    params: &ExecutorParams,
    last_written: &mut HashMap<String, f64>,
    pod: &str,
) -> Result<ControlOutcome, ControlError> {
    conn.begin().await?;
    match apply(conn, ctx, params, last_written.get(pod).copied(), pod).await {
        Ok(outcome) => {
            conn.commit().await?;
            if let ControlOutcome::Written { kw, .. } = &outcome {
                last_written.insert(pod.to_string(), *kw);
            }
            Ok(outcome)
        }
        Err(e) => {
            if let Err(rollback) = conn.rollback().await {
                warn!(pod, error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

async fn apply(
    conn: &mut dyn ControlSession,
    ctx: &Deps,
    params: &ExecutorParams,
    last_written: Option<f64>,
    pod: &str,
) -> Result<ControlOutcome, ControlError> {
    let Some(PendingControl { id, target_kw }) = conn.latest_unapplied_control(pod).await? else {
        return Ok(ControlOutcome::NothingPending {
            pod: pod.to_string(),
        });
    };

    let current_kw = conn.latest_plant_power(pod).await?;
    let ess = conn.latest_ess_state(pod).await?;
    let (Some(current_kw), Some(ess)) = (current_kw, ess) else {
        return skip(conn, pod, id, None, MISSING_STATE).await;
    };
    let Some(target_kw) = target_kw else {
        return skip(conn, pod, id, None, MISSING_SETPOINT).await;
    };

    match plan_setpoint(pod, target_kw, current_kw, &ess, last_written, params.deadband_kw)? {
        Plan::Skip { applied_kw, note } => skip(conn, pod, id, applied_kw, note).await,
        Plan::Write(kw) => {
            let registers = encode_setpoint(kw, params.scale);
            let mut device = ctx.modbus.connect(&ess.endpoint, params.write_timeout).await?;
            let written = device
                .write_multiple(params.setpoint_register, &registers)
                .await;
            device.close().await;
            written?;

            conn.mark_applied(id, Some(kw), None).await?;
            info!(pod, kw, ess = %ess.endpoint, "ESS setpoint written");
            Ok(ControlOutcome::Written {
                pod: pod.to_string(),
                kw,
            })
        }
    }
}

async fn skip(
    conn: &mut dyn ControlSession,
    pod: &str,
    id: ControlId,
    applied_kw: Option<f64>,
    note: &'static str,
) -> Result<ControlOutcome, ControlError> {
    conn.mark_applied(id, applied_kw, Some(note)).await?;
    info!(pod, note, "Control applied without write");
    Ok(ControlOutcome::Skipped {
        pod: pod.to_string(),
        note,
    })
}

#[async_trait]
impl PeriodicWorker for ControlExecutor {
    const NAME: &'static str = "control-executor";
    type Params = ExecutorParams;
    type Context = Deps;
    type Report = ControlOutcome;
    type Error = ControlError;

    fn from_params(params: ExecutorParams) -> Result<Self, ControlError> {
        Ok(Self {
            params,
            session: None,
            notifications: None,
            last_written: HashMap::new(),
        })
    }

    async fn on_start(&mut self, ctx: &Deps) -> Result<(), ControlError> {
        self.session = Some(ctx.store.control_session().await?);
        self.notifications = Some(ctx.store.control_notifications(&self.params.channel).await?);
        info!(channel = %self.params.channel, "Waiting for controls");
        Ok(())
    }

    async fn run_cycle(&mut self, ctx: &Deps) -> Result<ControlOutcome, ControlError> {
        let mut listener = match self.notifications.take() {
            Some(listener) => listener,
            None => ctx.store.control_notifications(&self.params.channel).await?,
        };
        let next = listener.next_pod(self.params.wait).await;
        if next.is_ok() {
            self.notifications = Some(listener);
        }
        match next? {
            Some(pod) => self.handle_pod(ctx, &pod).await,
            None => Ok(ControlOutcome::Idle),
        }
    }

    fn pacing(&self) -> Pacing {
        Pacing::FixedDelay(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::ModbusEndpoint;

    fn ess(soc: Option<f64>, charge: f64, discharge: f64) -> EssState {
        EssState {
            endpoint: ModbusEndpoint::new("10.0.1.1", 502, 3),
            soc,
            capacity_charge: charge,
            capacity_discharge: discharge,
        }
    }

    #[test]
    fn setpoint_is_target_minus_current() {
        let plan = plan_setpoint("HU-1", 500.0, 350.0, &ess(Some(60.0), 100.0, 100.0), None, 1.0);
        assert_eq!(plan.unwrap(), Plan::Write(150.0));

        let plan = plan_setpoint("HU-1", 100.0, 350.0, &ess(Some(60.0), 100.0, 100.0), None, 1.0);
        assert_eq!(plan.unwrap(), Plan::Write(-250.0));
    }

    #[test]
    fn unknown_soc_is_an_error() {
        let plan = plan_setpoint("HU-1", 500.0, 350.0, &ess(None, 100.0, 100.0), None, 1.0);
        assert!(matches!(plan, Err(ControlError::UnknownSoc(pod)) if pod == "HU-1"));
    }

    #[test]
    fn exhausted_capacity_applies_zero() {
        let full = ess(Some(95.0), 0.0, 800.0);
        assert_eq!(
            plan_setpoint("HU-1", 0.0, 200.0, &full, None, 1.0).unwrap(),
            Plan::Skip {
                applied_kw: Some(0.0),
                note: NO_CHARGE_CAPACITY
            }
        );
        // discharging a full battery is fine
        assert_eq!(
            plan_setpoint("HU-1", 400.0, 200.0, &full, None, 1.0).unwrap(),
            Plan::Write(200.0)
        );

        let empty = ess(Some(5.0), 800.0, 0.0);
        assert_eq!(
            plan_setpoint("HU-1", 400.0, 200.0, &empty, None, 1.0).unwrap(),
            Plan::Skip {
                applied_kw: Some(0.0),
                note: NO_DISCHARGE_CAPACITY
            }
        );
    }

    #[test]
    fn small_changes_stay_within_deadband() {
        let state = ess(Some(50.0), 500.0, 500.0);
        assert_eq!(
            plan_setpoint("HU-1", 300.5, 200.0, &state, Some(100.0), 1.0).unwrap(),
            Plan::Skip {
                applied_kw: Some(100.0),
                note: WITHIN_DEADBAND
            }
        );
        assert_eq!(
            plan_setpoint("HU-1", 301.0, 200.0, &state, Some(100.0), 1.0).unwrap(),
            Plan::Write(101.0)
        );
    }

    #[test]
    fn zero_setpoint_is_written() {
        let state = ess(Some(50.0), 0.0, 0.0);
        assert_eq!(
            plan_setpoint("HU-1", 200.0, 200.0, &state, None, 1.0).unwrap(),
            Plan::Write(0.0)
        );
    }
}
