use async_trait::async_trait;
use gateway_actors::{
    FrameworkError, Pacing, PeriodicWorker, ProgramClient, RestartPolicy, WorkerActor,
    WorkerClient, WorkerState, WorkerStatus,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Test Worker ---

#[derive(Debug, thiserror::Error)]
enum TickerError {
    #[error("start refused")]
    StartRefused,
    #[error("cycle {0} failed")]
    CycleFailed(u32),
}

/// Behaviour switches shared between the test and every worker incarnation.
#[derive(Debug, Default)]
struct Script {
    builds: AtomicU32,
    refuse_starts: AtomicU32,
    fail_cycle: AtomicU32,
    panic_in_first_build: AtomicU32,
}

struct Ticker {
    script: Arc<Script>,
    build: u32,
    cycles: u32,
}

#[async_trait]
impl PeriodicWorker for Ticker {
    const NAME: &'static str = "ticker";
    type Params = Arc<Script>;
    type Context = ();
    type Report = u32;
    type Error = TickerError;

    fn from_params(script: Arc<Script>) -> Result<Self, TickerError> {
        let build = script.builds.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Self {
            script,
            build,
            cycles: 0,
        })
    }

    async fn on_start(&mut self, _ctx: &()) -> Result<(), TickerError> {
        if self.build <= self.script.refuse_starts.load(Ordering::SeqCst) {
            return Err(TickerError::StartRefused);
        }
        Ok(())
    }

    async fn run_cycle(&mut self, _ctx: &()) -> Result<u32, TickerError> {
        self.cycles += 1;
        if self.build == 1 && self.script.panic_in_first_build.load(Ordering::SeqCst) == 1 {
            panic!("sensor table exploded");
        }
        if self.cycles == self.script.fail_cycle.load(Ordering::SeqCst) {
            return Err(TickerError::CycleFailed(self.cycles));
        }
        Ok(self.cycles)
    }

    fn pacing(&self) -> Pacing {
        Pacing::FixedDelay(Duration::from_secs(3600))
    }
}

fn fast_policy(max_start_retries: u32) -> RestartPolicy {
    RestartPolicy {
        max_start_retries,
        backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(20),
    }
}

async fn wait_for(
    client: &WorkerClient<Ticker>,
    predicate: impl Fn(&WorkerStatus) -> bool,
) -> WorkerStatus {
    for _ in 0..200 {
        let status = client.status().await.unwrap();
        if predicate(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker never reached the expected status");
}

// --- Tests ---

#[tokio::test]
async fn test_trigger_pause_and_resume() {
    let script = Arc::new(Script::default());
    let (actor, client) = WorkerActor::<Ticker>::new(script, fast_policy(3), 8);
    let handle = tokio::spawn(actor.run(()));

    // first scheduled cycle runs right after start
    wait_for(&client, |s| s.cycles == 1).await;
    assert_eq!(client.trigger().await.unwrap(), 2);

    client.pause().await.unwrap();
    let status = client.status().await.unwrap();
    assert_eq!(status.state, WorkerState::Paused);
    assert!(matches!(client.trigger().await, Err(FrameworkError::Paused)));

    client.resume().await.unwrap();
    let status = wait_for(&client, |s| s.state == WorkerState::Running).await;
    assert!(status.cycles >= 2);

    drop(client);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_failed_cycle_is_counted_and_worker_continues() {
    let script = Arc::new(Script::default());
    script.fail_cycle.store(2, Ordering::SeqCst);
    let (actor, client) = WorkerActor::<Ticker>::new(script, fast_policy(3), 8);
    let handle = tokio::spawn(actor.run(()));

    wait_for(&client, |s| s.cycles == 1).await;
    let failed = client.trigger().await;
    assert!(matches!(failed, Err(FrameworkError::WorkerError(_))));

    let status = client.status().await.unwrap();
    assert_eq!(status.failed_cycles, 1);
    assert_eq!(status.consecutive_failures, 1);
    assert_eq!(status.last_error.as_deref(), Some("cycle 2 failed"));

    assert_eq!(client.trigger().await.unwrap(), 3);
    let status = client.status().await.unwrap();
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.restarts, 0);

    drop(client);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_panicking_cycle_rebuilds_worker() {
    let script = Arc::new(Script::default());
    script.panic_in_first_build.store(1, Ordering::SeqCst);
    let (actor, client) = WorkerActor::<Ticker>::new(Arc::clone(&script), fast_policy(3), 8);
    let handle = tokio::spawn(actor.run(()));

    let status = wait_for(&client, |s| s.restarts == 1 && s.state == WorkerState::Running).await;
    assert_eq!(status.last_error.as_deref(), Some("sensor table exploded"));

    // the second incarnation counts from scratch
    let report = client.trigger().await.unwrap();
    assert!(report >= 1);
    assert_eq!(script.builds.load(Ordering::SeqCst), 2);

    drop(client);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_start_retries_exhausted_is_fatal() {
    let script = Arc::new(Script::default());
    script.refuse_starts.store(u32::MAX, Ordering::SeqCst);
    let (actor, client) = WorkerActor::<Ticker>::new(Arc::clone(&script), fast_policy(2), 8);
    let handle = tokio::spawn(actor.run(()));

    let status = wait_for(&client, |s| s.state == WorkerState::Fatal).await;
    assert_eq!(status.last_error.as_deref(), Some("start refused"));
    assert_eq!(script.builds.load(Ordering::SeqCst), 3);
    assert!(matches!(client.trigger().await, Err(FrameworkError::NotRunning)));

    let program: &dyn ProgramClient = &client;
    assert_eq!(program.name(), "ticker");

    drop(client);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_start_recovers_after_backoff() {
    let script = Arc::new(Script::default());
    script.refuse_starts.store(2, Ordering::SeqCst);
    let (actor, client) = WorkerActor::<Ticker>::new(Arc::clone(&script), fast_policy(5), 8);
    let handle = tokio::spawn(actor.run(()));

    let status = wait_for(&client, |s| s.cycles == 1).await;
    assert_eq!(status.state, WorkerState::Running);
    assert_eq!(script.builds.load(Ordering::SeqCst), 3);

    drop(client);
    handle.await.unwrap();
}
