//! Driver configuration files

use seacomm_core::core::coordinator::LifecycleCommand;
use seacomm_core::core::logger::LogFormat;
use seacomm_core::core::session::FramingMode;
use seacomm_core::{ConfigError, DriverConfig};
use std::time::Duration;

const DEPLOYMENT: &str = r#"
[port_agent]
host = "192.168.1.40"
data_port = 4001
command_port = 4002

[session]
framing = "port_agent"
response_timeout = 3000
traffic_log_format = "Hex"

[timebase]
tick_rate = 4.0
counter_width = 24
rollover_tolerance = 3.0

[coordinator]
order = ["profiler", "ctd"]
break_delay = 1000

[coordinator.overrides]
disconnect = ["ctd", "profiler"]

[[units]]
id = "profiler"

[[units]]
id = "ctd"
port_agent = { host = "192.168.1.41" }
"#;

#[test]
fn test_deployment_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("deployment.toml");
    std::fs::write(&path, DEPLOYMENT).unwrap();

    let config = DriverConfig::load(&path).unwrap();
    assert_eq!(config.session.framing, FramingMode::PortAgent);
    assert_eq!(config.session.response_timeout, Duration::from_secs(3));
    assert_eq!(config.session.traffic_log_format, LogFormat::Hex);
    assert_eq!(config.timebase.modulus(), 1 << 24);
    assert_eq!(
        config.coordinator.overrides.get(LifecycleCommand::Disconnect),
        Some(&["ctd".to_string(), "profiler".to_string()][..])
    );
    assert_eq!(config.unit_port_agent("ctd").unwrap().data_tcp().address(), "192.168.1.41:4001");
    assert_eq!(config.unit_port_agent("profiler").unwrap().command_tcp().address(), "192.168.1.40:4002");
    assert!(config.unit_port_agent("winch").is_none());

    let copy = dir.path().join("copy.toml");
    config.save(&copy).unwrap();
    assert_eq!(DriverConfig::load(&copy).unwrap(), config);
}

#[test]
fn test_missing_file_and_bad_syntax() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        DriverConfig::load(&dir.path().join("absent.toml")),
        Err(ConfigError::Io(_))
    ));
    assert!(matches!(
        DriverConfig::from_toml_str("[session\nframing ="),
        Err(ConfigError::Parse(_))
    ));
    assert!(matches!(
        DriverConfig::from_toml_str("[session]\nframing = \"carrier_pigeon\""),
        Err(ConfigError::Parse(_))
    ));
}
