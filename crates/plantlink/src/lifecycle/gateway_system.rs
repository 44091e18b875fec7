use super::Program;
use crate::collector::{self, Collector, CollectorParams};
use crate::config::AppConfig;
use crate::context::Deps;
use crate::control::{
    self, ControlExecutor, ControlFetcher, ControlTestGenerator, ExecutorParams, FetcherParams,
    TestGeneratorParams,
};
use crate::env_poller::{self, EnvPoller, EnvPollerParams};
use crate::ess_poller::{self, EssPoller, EssPollerParams};
use crate::sender::{self, Sender, SenderParams};
use gateway_actors::{
    FrameworkError, PeriodicWorker, ProgramClient, WorkerActor, WorkerClient, WorkerStatus,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Runs the configured programs side by side in one process.
///
/// Each program gets its own [`WorkerActor`] task sharing one [`Deps`]. A
/// failing program is restarted by its actor and never takes the others
/// down with it.
///
/// # Example
///
/// ```ignore
/// let system = GatewaySystem::start(&config.supervisor.programs, &config, deps);
/// system.log_status().await;
/// system.shutdown().await?;
/// ```
pub struct GatewaySystem {
    clients: Vec<(Program, Box<dyn ProgramClient>)>,
    handles: Vec<JoinHandle<()>>,
}

impl GatewaySystem {
    /// Spawns every program in `programs` once, in the given order.
    pub fn start(programs: &[Program], config: &AppConfig, deps: Deps) -> Self {
        let mut system = Self {
            clients: Vec::new(),
            handles: Vec::new(),
        };
        let policy = config.supervisor.restart_policy();

        for &program in programs {
            if system.clients.iter().any(|(p, _)| *p == program) {
                warn!(%program, "Program listed twice, starting it once");
                continue;
            }
            match program {
                Program::Collector => system.spawn(
                    program,
                    collector::new(CollectorParams::from_config(config), policy.clone()),
                    &deps,
                ),
                Program::EssPoller => system.spawn(
                    program,
                    ess_poller::new(EssPollerParams::from_config(config), policy.clone()),
                    &deps,
                ),
                Program::EnvPoller => system.spawn(
                    program,
                    env_poller::new(EnvPollerParams::from_config(config), policy.clone()),
                    &deps,
                ),
                Program::Sender => system.spawn(
                    program,
                    sender::new(SenderParams::from_config(config), policy.clone()),
                    &deps,
                ),
                Program::ControlFetcher => system.spawn(
                    program,
                    control::fetcher::new(FetcherParams::default(), policy.clone()),
                    &deps,
                ),
                Program::ControlExecutor => system.spawn(
                    program,
                    control::executor::new(ExecutorParams::from_config(config), policy.clone()),
                    &deps,
                ),
                Program::ControlTestGenerator => system.spawn(
                    program,
                    control::test_generator::new(
                        TestGeneratorParams::from_config(config),
                        policy.clone(),
                    ),
                    &deps,
                ),
            }
            info!(%program, "Program started");
        }
        system
    }

    fn spawn<W>(
        &mut self,
        program: Program,
        (actor, client): (WorkerActor<W>, WorkerClient<W>),
        deps: &Deps,
    ) where
        W: PeriodicWorker<Context = Deps>,
    {
        self.handles.push(tokio::spawn(actor.run(deps.clone())));
        self.clients.push((program, Box::new(client)));
    }

    pub fn programs(&self) -> Vec<Program> {
        self.clients.iter().map(|(program, _)| *program).collect()
    }

    pub fn client(&self, program: Program) -> Option<&dyn ProgramClient> {
        self.clients
            .iter()
            .find(|(p, _)| *p == program)
            .map(|(_, client)| client.as_ref())
    }

    /// Status of every program; a program whose actor is gone reports the error.
    pub async fn status(&self) -> Vec<(Program, Result<WorkerStatus, FrameworkError>)> {
        let mut statuses = Vec::with_capacity(self.clients.len());
        for (program, client) in &self.clients {
            statuses.push((*program, client.status().await));
        }
        statuses
    }

    pub async fn log_status(&self) {
        for (program, status) in self.status().await {
            match status {
                Ok(status) => info!(
                    %program,
                    state = %status.state,
                    cycles = status.cycles,
                    failed_cycles = status.failed_cycles,
                    restarts = status.restarts,
                    last_error = status.last_error.as_deref().unwrap_or(""),
                    "Program status"
                ),
                Err(e) => warn!(%program, error = %e, "Program unreachable"),
            }
        }
    }

    /// Stops every program after its current cycle.
    ///
    /// Dropping the clients closes the request channels; each actor notices
    /// and exits its loop. Returns an error if any actor task panicked.
    pub async fn shutdown(self) -> Result<(), String> {
        info!("Shutting down system...");

        drop(self.clients);

        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Program task failed: {:?}", e);
                return Err(format!("Program task failed: {:?}", e));
            }
        }

        info!("System shutdown complete.");
        Ok(())
    }
}

/// Builds, starts and runs one cycle of `program` in the calling task.
///
/// Returns the cycle report rendered with `{:#?}`.
pub async fn run_once(
    program: Program,
    config: &AppConfig,
    deps: &Deps,
) -> Result<String, FrameworkError> {
    match program {
        Program::Collector => once::<Collector>(CollectorParams::from_config(config), deps).await,
        Program::EssPoller => once::<EssPoller>(EssPollerParams::from_config(config), deps).await,
        Program::EnvPoller => once::<EnvPoller>(EnvPollerParams::from_config(config), deps).await,
        Program::Sender => once::<Sender>(SenderParams::from_config(config), deps).await,
        Program::ControlFetcher => once::<ControlFetcher>(FetcherParams::default(), deps).await,
        Program::ControlExecutor => {
            once::<ControlExecutor>(ExecutorParams::from_config(config), deps).await
        }
        Program::ControlTestGenerator => {
            once::<ControlTestGenerator>(TestGeneratorParams::from_config(config), deps).await
        }
    }
}

async fn once<W>(params: W::Params, deps: &Deps) -> Result<String, FrameworkError>
where
    W: PeriodicWorker<Context = Deps>,
{
    let boxed = |e: W::Error| FrameworkError::WorkerError(Box::new(e));
    let mut worker = W::from_params(params).map_err(boxed)?;
    worker.on_start(deps).await.map_err(boxed)?;
    let report = worker.run_cycle(deps).await.map_err(boxed)?;
    Ok(format!("{report:#?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ScriptedAggregator;
    use crate::db::MemoryStore;
    use crate::modbus::SimulatedDevices;
    use gateway_actors::mock::MockClient;
    use gateway_actors::WorkerState;
    use std::sync::Arc;
    use std::time::Duration;

    fn deps() -> Deps {
        Deps::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SimulatedDevices::new()),
            Arc::new(ScriptedAggregator::new()),
        )
    }

    #[tokio::test]
    async fn duplicate_programs_start_once() {
        let config = AppConfig::default();
        let system = GatewaySystem::start(
            &[Program::EnvPoller, Program::ControlFetcher, Program::EnvPoller],
            &config,
            deps(),
        );
        assert_eq!(
            system.programs(),
            vec![Program::EnvPoller, Program::ControlFetcher]
        );
        assert!(system.client(Program::Sender).is_none());
        system.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn paused_program_reports_its_state() {
        let config = AppConfig::default();
        let system = GatewaySystem::start(&[Program::EnvPoller], &config, deps());
        let client = system.client(Program::EnvPoller).unwrap();

        // wait until the worker is built
        tokio::time::timeout(Duration::from_secs(2), async {
            while client.status().await.unwrap().state == WorkerState::Starting {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        client.pause().await.unwrap();
        let statuses = system.status().await;
        assert_eq!(statuses.len(), 1);
        let (program, status) = &statuses[0];
        assert_eq!(*program, Program::EnvPoller);
        let status = status.as_ref().unwrap();
        assert_eq!(status.name, "env-poller");
        assert_eq!(status.state, WorkerState::Paused);

        system.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn status_keeps_program_order_and_unreachable_programs() {
        let mut sender = MockClient::<Sender>::new();
        let mut status = WorkerStatus::new("sender");
        status.state = WorkerState::Backoff;
        status.last_error = Some("database unavailable".to_string());
        // one answer for status(), one for log_status()
        sender.expect_status().return_ok(status.clone());
        sender.expect_status().return_ok(status.clone());

        let mut fetcher = MockClient::<ControlFetcher>::new();
        fetcher.expect_status().return_err(FrameworkError::ActorClosed);
        fetcher.expect_status().return_err(FrameworkError::ActorClosed);

        let system = GatewaySystem {
            clients: vec![
                (Program::Sender, Box::new(sender.client()) as Box<dyn ProgramClient>),
                (Program::ControlFetcher, Box::new(fetcher.client()) as Box<dyn ProgramClient>),
            ],
            handles: Vec::new(),
        };

        let statuses = system.status().await;
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].0, Program::Sender);
        assert_eq!(statuses[0].1.as_ref().unwrap(), &status);
        assert_eq!(statuses[1].0, Program::ControlFetcher);
        assert!(matches!(statuses[1].1, Err(FrameworkError::ActorClosed)));

        system.log_status().await;
        sender.verify();
        fetcher.verify();
        system.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn once_reports_start_failures() {
        let mut config = AppConfig::default();
        config.test_generator.sequence.clear();
        let result = run_once(Program::ControlTestGenerator, &config, &deps()).await;
        assert!(matches!(result, Err(FrameworkError::WorkerError(_))));
    }

    #[tokio::test]
    async fn once_renders_the_report() {
        let config = AppConfig::default();
        let report = run_once(Program::EnvPoller, &config, &deps()).await.unwrap();
        assert!(report.contains("EnvPollerReport"));
    }
}
