use gateway_actors::WorkerState;
use plantlink::aggregator::ScriptedAggregator;
use plantlink::config::AppConfig;
use plantlink::context::Deps;
use plantlink::db::MemoryStore;
use plantlink::lifecycle::{GatewaySystem, Program};
use plantlink::modbus::SimulatedDevices;
use std::sync::Arc;
use std::time::Duration;

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    // keep the executor's wait short so status requests are served promptly
    config.control.wait_secs = 1;
    config.supervisor.backoff_ms = 10;
    config
}

fn deps(store: &MemoryStore) -> Deps {
    Deps::new(
        Arc::new(store.clone()),
        Arc::new(SimulatedDevices::new()),
        Arc::new(ScriptedAggregator::new()),
    )
}

async fn wait_for<F>(system: &GatewaySystem, done: F)
where
    F: Fn(WorkerState) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let statuses = system.status().await;
            if statuses
                .iter()
                .all(|(_, status)| status.as_ref().map(|s| done(s.state)).unwrap_or(false))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("programs did not reach the expected state");
}

/// Every program starts against an empty site and shuts down cleanly.
#[tokio::test]
async fn all_programs_run_and_shut_down() {
    let store = MemoryStore::new();
    let system = GatewaySystem::start(&Program::ALL, &config(), deps(&store));
    assert_eq!(system.programs(), Program::ALL.to_vec());

    wait_for(&system, |state| state == WorkerState::Running).await;

    for (program, status) in system.status().await {
        let status = status.unwrap();
        assert_eq!(status.name, program.as_str());
        assert_eq!(status.restarts, 0);
    }

    system.shutdown().await.expect("shutdown failed");
}

/// A program that cannot start retries without affecting the others.
#[tokio::test]
async fn failing_start_backs_off_while_others_run() {
    let store = MemoryStore::new();
    store.set_failing(true);
    let system = GatewaySystem::start(
        &[Program::Collector, Program::ControlFetcher],
        &config(),
        deps(&store),
    );

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let collector = system
                .client(Program::Collector)
                .unwrap()
                .status()
                .await
                .unwrap();
            if collector.state == WorkerState::Backoff {
                assert!(collector.last_error.is_some());
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("collector never backed off");

    let fetcher = system
        .client(Program::ControlFetcher)
        .unwrap()
        .status()
        .await
        .unwrap();
    assert_ne!(fetcher.state, WorkerState::Fatal);
    assert_eq!(fetcher.restarts, 0);

    // once the database is back the collector comes up
    store.set_failing(false);
    wait_for(&system, |state| state == WorkerState::Running).await;

    system.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn paused_programs_resume() {
    let store = MemoryStore::new();
    let system = GatewaySystem::start(&[Program::Sender], &config(), deps(&store));
    let sender = system.client(Program::Sender).unwrap();

    sender.pause().await.unwrap();
    wait_for(&system, |state| state == WorkerState::Paused).await;

    sender.resume().await.unwrap();
    wait_for(&system, |state| state == WorkerState::Running).await;

    system.shutdown().await.expect("shutdown failed");
}
