//! The files baked into the container image must load.

use plantlink::config::AppConfig;
use plantlink::lifecycle::Program;
use plantlink::register_map::{DeviceKind, RegisterMap, RegisterTable};
use std::path::PathBuf;

fn repo_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[test]
fn deployed_config_parses() {
    let config = AppConfig::from_file(&repo_root().join("deploy/plantlink.toml")).unwrap();
    assert!(!config.supervisor.programs.contains(&Program::ControlTestGenerator));
    assert_eq!(config.control.notify_channel, "alteo_control");
    assert_eq!(
        config.logging.log_file(),
        Some(PathBuf::from("/app/logs/plantlink.log"))
    );
    // credentials are injected at runtime
    assert!(config.database.password.is_none());
    assert!(config.aggregator.api_key.is_none());
}

#[tokio::test]
async fn shipped_register_maps_load() {
    let dir = repo_root().join("register_maps");

    let logger = RegisterMap::load(&dir, DeviceKind::Logger { manufacturer: "SolarLog" })
        .await
        .unwrap();
    assert!(logger.get("sum_active_power").is_some());

    let ess = RegisterMap::load(
        &dir,
        DeviceKind::Ess {
            manufacturer: "Hithium",
            model: None,
        },
    )
    .await
    .unwrap();
    for key in ["totalCapacity", "averageCurrentSOC", "allowedMinSOC", "allowedMaxSOC"] {
        let spec = ess.get(key).unwrap();
        assert_eq!(spec.table(), RegisterTable::Input, "{key}");
    }
}
