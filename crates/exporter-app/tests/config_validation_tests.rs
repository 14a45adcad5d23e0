use std::env;
use std::path::PathBuf;
use std::sync::Mutex;

use exporter_app::ExporterConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn toml_config_validates() {
    let _guard = ENV_LOCK.lock().expect("env lock");

    let config =
        ExporterConfig::load_with_path(Some(fixture_path("config-valid.toml"))).expect("load config");
    config.validate().expect("validate config");

    assert_eq!(config.inverter_address, "192.168.1.40");
    assert_eq!(config.inverter_port, 1_502);
    assert_eq!(config.num_meters, 2);
    assert_eq!(config.poll_interval_secs, 5);
    assert_eq!(config.listen_port, 2_112);
}

#[test]
fn json_config_validates() {
    let _guard = ENV_LOCK.lock().expect("env lock");

    let config =
        ExporterConfig::load_with_path(Some(fixture_path("config-valid.json"))).expect("load config");
    config.validate().expect("validate config");

    assert_eq!(config.inverter_address, "10.0.0.12");
    assert_eq!(config.num_meters, 1);
}

#[test]
fn missing_inverter_address_fails_validation() {
    let _guard = ENV_LOCK.lock().expect("env lock");

    let config = ExporterConfig::load_with_path(Some(fixture_path("config-invalid.toml")))
        .expect("load config");
    assert!(config.validate().is_err());
}

#[test]
fn env_overrides_take_precedence_over_file_values() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    env::set_var("INVERTER_ADDRESS", "172.16.0.9");
    env::set_var("NUM_METERS", "0");

    let config = ExporterConfig::load_with_path(Some(fixture_path("config-valid.toml")))
        .expect("load config");

    env::remove_var("INVERTER_ADDRESS");
    env::remove_var("NUM_METERS");

    assert_eq!(config.inverter_address, "172.16.0.9");
    assert_eq!(config.num_meters, 0);
    config.validate().expect("validate config");
}

#[test]
fn defaults_apply_without_a_config_file() {
    let _guard = ENV_LOCK.lock().expect("env lock");

    let config = ExporterConfig::load_with_path(None).expect("load config");
    assert_eq!(config.inverter_port, 1_502);
    assert_eq!(config.poll_interval_secs, 5);
    assert_eq!(config.retry_delay_secs, 7);
    // No inverter address configured: fatal before polling begins.
    assert!(config.validate().is_err());
}

fn fixture_path(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    path.to_string_lossy().to_string()
}
