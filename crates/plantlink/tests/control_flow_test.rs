use gateway_actors::PeriodicWorker;
use plantlink::aggregator::ScriptedAggregator;
use plantlink::collector::{Collector, CollectorParams};
use plantlink::context::Deps;
use plantlink::control::executor::WITHIN_DEADBAND;
use plantlink::control::{ControlExecutor, ControlOutcome, ExecutorParams};
use plantlink::db::MemoryStore;
use plantlink::ess_poller::{EssPoller, EssPollerParams};
use plantlink::modbus::{ModbusEndpoint, SimulatedDevices};
use plantlink::model::{ControlPlant, EssUnit};
use plantlink::sender::{Sender, SenderParams};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const LOGGER_MAP: &str = r#"{
    "sum_active_power": {"address": 100, "quantity": 2, "gain": 10},
    "cos_phi": {"address": 110, "quantity": 1, "gain": 1000}
}"#;

const ESS_MAP: &str = r#"{
    "totalCapacity": {"address": 1000, "quantity": 1, "fc": 4},
    "averageCurrentSOC": {"address": 1002, "quantity": 1, "gain": 10, "fc": 4},
    "allowedMinSOC": {"address": 1004, "quantity": 1, "fc": 4},
    "allowedMaxSOC": {"address": 1005, "quantity": 1, "fc": 4}
}"#;

/// One plant with one battery, wired to simulated devices.
struct Site {
    maps: TempDir,
    store: MemoryStore,
    devices: SimulatedDevices,
    aggregator: ScriptedAggregator,
    deps: Deps,
    ess: ModbusEndpoint,
}

fn site() -> Site {
    let maps = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(maps.path().join("logger")).unwrap();
    std::fs::create_dir_all(maps.path().join("ess")).unwrap();
    std::fs::write(maps.path().join("logger/solarlog.json"), LOGGER_MAP).unwrap();
    std::fs::write(maps.path().join("ess/hithium.json"), ESS_MAP).unwrap();

    let store = MemoryStore::new();
    let devices = SimulatedDevices::new();
    let aggregator = ScriptedAggregator::new();
    let deps = Deps::new(
        Arc::new(store.clone()),
        Arc::new(devices.clone()),
        Arc::new(aggregator.clone()),
    );

    let logger = ModbusEndpoint::new("10.0.0.1", 502, 1);
    let ess = ModbusEndpoint::new("10.0.1.1", 502, 3);
    store.add_plant(ControlPlant {
        id: 1,
        pod_id: "HU-1".to_string(),
        name: "Solar Park".to_string(),
        logger: logger.clone(),
        logger_manufacturer: "SolarLog".to_string(),
        ess_units: Vec::new(),
    });
    store.add_ess_unit(EssUnit {
        id: 10,
        plant_id: 1,
        endpoint: ess.clone(),
        manufacturer: "Hithium".to_string(),
        model: None,
    });

    // 1234.5 kW, cos phi 0.99
    devices.set_holding(&logger, 100, &[0, 12_345]);
    devices.set_holding(&logger, 110, &[990]);
    // 2000 kWh at 70 %, allowed 10..90 %
    devices.set_input(&ess, 1000, &[2000, 0, 700, 0, 10, 90]);

    Site {
        maps,
        store,
        devices,
        aggregator,
        deps,
        ess,
    }
}

fn executor_params() -> ExecutorParams {
    ExecutorParams {
        channel: "alteo_control".to_string(),
        wait: Duration::from_secs(1),
        setpoint_register: 600,
        scale: 10.0,
        deadband_kw: 1.0,
        write_timeout: Duration::from_millis(100),
    }
}

async fn measure(site: &Site) {
    let mut collector = Collector::from_params(CollectorParams {
        register_map_dir: site.maps.path().to_path_buf(),
        timeout: Duration::from_millis(100),
        cooldown: Duration::from_secs(300),
        period: Duration::from_secs(2),
    })
    .unwrap();
    collector.on_start(&site.deps).await.unwrap();
    assert_eq!(collector.run_cycle(&site.deps).await.unwrap().stored, 1);

    let mut poller = EssPoller::from_params(EssPollerParams {
        register_map_dir: site.maps.path().to_path_buf(),
        register_map: None,
        timeout: Duration::from_millis(100),
        period: Duration::from_secs(2),
    })
    .unwrap();
    poller.on_start(&site.deps).await.unwrap();
    assert_eq!(poller.run_cycle(&site.deps).await.unwrap().failed, 0);
}

fn sender() -> Sender {
    Sender::from_params(SenderParams {
        stats_window: Duration::from_secs(300),
        max_concurrent: 4,
        period: Duration::from_secs(2),
    })
    .unwrap()
}

#[tokio::test]
async fn control_from_sender_response_is_written_to_the_ess() {
    let site = site();
    measure(&site).await;

    // subscribe before any control is announced
    let mut executor = ControlExecutor::from_params(executor_params()).unwrap();
    executor.on_start(&site.deps).await.unwrap();

    site.aggregator.respond(
        200,
        json!({"controls": [{"pod": "HU-1", "heartbeat": 5, "sumSetPoint": 1500.0}]}),
    );
    let report = sender().run_cycle(&site.deps).await.unwrap();
    assert_eq!(report.controls, 1);

    let outcome = executor.run_cycle(&site.deps).await.unwrap();
    assert_eq!(
        outcome,
        ControlOutcome::Written {
            pod: "HU-1".to_string(),
            kw: 265.5
        }
    );
    // 265.5 kW * 10 = 2655, high word first
    assert_eq!(site.devices.writes(), vec![(site.ess.clone(), 600, vec![0, 2655])]);

    let row = site.store.inbox("HU-1").unwrap();
    assert!(row.applied);
    assert_eq!(row.applied_value, Some(265.5));
    assert_eq!(row.note, None);

    // the reported measurement carried the plant output
    let requests = site.aggregator.requests();
    assert_eq!(requests[0][0].value("sumActivePower"), Some(&json!(1234.5)));
}

#[tokio::test]
async fn small_correction_is_not_rewritten() {
    let site = site();
    measure(&site).await;
    let mut executor = ControlExecutor::from_params(executor_params()).unwrap();
    executor.on_start(&site.deps).await.unwrap();
    let mut sender = sender();

    site.aggregator.respond(
        200,
        json!({"controls": [{"pod": "HU-1", "heartbeat": 5, "sumSetPoint": 1500.0}]}),
    );
    sender.run_cycle(&site.deps).await.unwrap();
    executor.run_cycle(&site.deps).await.unwrap();

    site.aggregator.respond(
        200,
        json!({"controls": [{"pod": "HU-1", "heartbeat": 6, "sumSetPoint": 1500.5}]}),
    );
    sender.run_cycle(&site.deps).await.unwrap();
    let outcome = executor.run_cycle(&site.deps).await.unwrap();
    assert_eq!(
        outcome,
        ControlOutcome::Skipped {
            pod: "HU-1".to_string(),
            note: WITHIN_DEADBAND
        }
    );
    assert_eq!(site.devices.writes().len(), 1);

    let row = site.store.inbox("HU-1").unwrap();
    assert!(row.applied);
    assert_eq!(row.applied_value, Some(265.5));
    assert_eq!(row.note.as_deref(), Some(WITHIN_DEADBAND));
}

#[tokio::test]
async fn locked_pod_keeps_its_control_pending() {
    let site = site();
    measure(&site).await;
    let mut executor = ControlExecutor::from_params(executor_params()).unwrap();
    executor.on_start(&site.deps).await.unwrap();

    assert!(site.store.hold_lock("HU-1"));
    site.aggregator.respond(
        200,
        json!({"controls": [{"pod": "HU-1", "heartbeat": 5, "sumSetPoint": 1500.0}]}),
    );
    sender().run_cycle(&site.deps).await.unwrap();

    let outcome = executor.run_cycle(&site.deps).await.unwrap();
    assert_eq!(
        outcome,
        ControlOutcome::Locked {
            pod: "HU-1".to_string()
        }
    );
    assert!(site.devices.writes().is_empty());
    assert!(!site.store.inbox("HU-1").unwrap().applied);

    // once released, the next announcement is served
    site.store.release_lock("HU-1");
    let pod = "HU-1".to_string();
    let outcome = executor.handle_pod(&site.deps, &pod).await.unwrap();
    assert!(matches!(outcome, ControlOutcome::Written { .. }));
}

#[tokio::test]
async fn quiet_channel_is_idle() {
    let site = site();
    let mut executor = ControlExecutor::from_params(ExecutorParams {
        wait: Duration::from_millis(50),
        ..executor_params()
    })
    .unwrap();
    executor.on_start(&site.deps).await.unwrap();
    assert_eq!(
        executor.run_cycle(&site.deps).await.unwrap(),
        ControlOutcome::Idle
    );
}
