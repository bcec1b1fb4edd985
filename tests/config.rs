use std::fs;
use tempfile::TempDir;
use taskscope::{Jitter, OverflowPolicy, RunnerConfig, TaskScopeError};

#[test]
fn load_config_file() {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let path = temp_dir.path().join("taskscope.json");
    fs::write(
        &path,
        r#"{
            "pool": { "workers": 2, "queue_capacity": 8, "overflow": "reject" },
            "retry": { "max_attempts": 3, "base_delay_ms": 10, "jitter": "equal", "seed": 7 }
        }"#,
    )
    .unwrap();

    let config = RunnerConfig::from_path(&path).unwrap();
    assert_eq!(config.pool.workers, 2);
    assert_eq!(config.pool.queue_capacity, 8);
    assert_eq!(config.pool.overflow, OverflowPolicy::Reject);
    assert_eq!(config.pool.thread_name, "taskscope-worker");
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.jitter, Jitter::Equal);
    assert_eq!(config.retry.max_delay_ms, 30_000);
    assert_eq!(config.retry.to_policy().max_attempts(), 3);
}

#[test]
fn invalid_config_file() {
    let temp_dir = TempDir::new().expect("unable to create temporary working directory");
    let path = temp_dir.path().join("zero.json");
    fs::write(&path, r#"{ "pool": { "workers": 0 } }"#).unwrap();
    assert!(matches!(
        RunnerConfig::from_path(&path),
        Err(TaskScopeError::InvalidConfig(_))
    ));

    let path = temp_dir.path().join("broken.json");
    fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
        RunnerConfig::from_path(&path),
        Err(TaskScopeError::Serde(_))
    ));

    assert!(matches!(
        RunnerConfig::from_path(temp_dir.path().join("missing.json")),
        Err(TaskScopeError::Io(_))
    ));
}
