use std::io::Write;

use tempfile::NamedTempFile;

use crate::config::models::AppConfig;

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[remote]
enabled = true
task_timeout_seconds = 120

[remote.pool.local]
host = "127.0.0.1"
capabilities = ["testing", "code_generation"]
"#
    )
    .unwrap();

    let config = AppConfig::load(Some(file.path().to_str().unwrap())).unwrap();
    assert!(config.remote.enabled);
    assert_eq!(config.remote.task_timeout_seconds, 120);
    assert_eq!(
        config.remote.pool["local"].capabilities,
        vec!["testing".to_string(), "code_generation".to_string()]
    );
    assert_eq!(config.dispatcher.queue_capacity, 10_000);
}

#[test]
fn test_load_missing_file_fails() {
    let result = AppConfig::load(Some("/nonexistent/devpool.toml"));
    assert!(result.is_err());
}
