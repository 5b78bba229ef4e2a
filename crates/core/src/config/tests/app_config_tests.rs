use crate::config::models::AppConfig;

#[test]
fn test_default_config() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());

    assert!(!config.remote.enabled);
    assert_eq!(config.remote.health_check_interval_seconds, 30);
    assert_eq!(config.dispatcher.heartbeat_miss_multiple, 3);
    assert_eq!(config.retry.default_max_retries, 3);
    assert!(config.checkpoint.directory.is_none());
    assert!(config.remote.pool.is_empty());
}

#[test]
fn test_config_from_toml() {
    let toml_content = r#"
[remote]
enabled = true
health_check_interval_seconds = 15
max_concurrent_tasks = 8

[remote.pool.gpu-box]
host = "10.0.0.5"
username = "dev"
key_ref = "~/.ssh/id_ed25519"
capabilities = ["code_generation", "testing"]
accelerator_count = 2
max_tasks = 4

[remote.pool.cpu-box]
host = "10.0.0.6"
port = 2222
capabilities = ["refactoring"]

[dispatcher]
queue_capacity = 128

[retry]
base_delay_ms = 200
max_delay_ms = 5000

[checkpoint]
directory = "/var/lib/devpool/checkpoints"

[observability]
log_level = "debug"
log_format = "json"
"#;

    let config = AppConfig::from_toml(toml_content).unwrap();
    assert!(config.remote.enabled);
    assert_eq!(config.remote.health_check_interval_seconds, 15);
    assert_eq!(config.remote.pool.len(), 2);

    let gpu = &config.remote.pool["gpu-box"];
    assert_eq!(gpu.port, 22);
    assert_eq!(gpu.accelerator_count, 2);
    assert_eq!(gpu.max_tasks, Some(4));

    let cpu = &config.remote.pool["cpu-box"];
    assert_eq!(cpu.port, 2222);
    assert!(cpu.max_tasks.is_none());

    assert_eq!(config.dispatcher.queue_capacity, 128);
    // 未写出的字段保留默认值
    assert_eq!(config.dispatcher.poll_interval_ms, 500);
    assert_eq!(config.retry.base_delay_ms, 200);
    assert_eq!(
        config.checkpoint.directory.as_deref(),
        Some("/var/lib/devpool/checkpoints")
    );
    assert_eq!(config.observability.log_format, "json");
}

#[test]
fn test_invalid_config_rejected() {
    let mut config = AppConfig::default();
    config.dispatcher.queue_capacity = 0;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.retry.jitter_factor = 1.5;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.retry.max_delay_ms = 10;
    config.retry.base_delay_ms = 100;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.observability.log_format = "xml".to_string();
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.dispatcher.heartbeat_miss_multiple = 1;
    assert!(config.validate().is_err());
}

#[test]
fn test_pool_entry_without_capabilities_rejected() {
    let toml_content = r#"
[remote.pool.bare]
host = "10.0.0.9"
"#;
    let err = AppConfig::from_toml(toml_content).unwrap_err();
    assert!(format!("{err:#}").contains("bare"));
}

#[test]
fn test_toml_roundtrip_preserves_pool() {
    let toml_content = r#"
[remote]
enabled = true

[remote.pool.w1]
host = "localhost"
capabilities = ["testing"]
"#;
    let config = AppConfig::from_toml(toml_content).unwrap();
    let serialized = config.to_toml().unwrap();
    let reparsed = AppConfig::from_toml(&serialized).unwrap();
    assert_eq!(config, reparsed);
}
