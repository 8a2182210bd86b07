//! Integration tests for relic-config
//!
//! These tests verify the full config loading pipeline with real file system operations.

use std::path::PathBuf;
use tempfile::tempdir;

use relic_config::{Config, ConfigError};

/// Test config loading from a real config file
#[test]
fn test_load_config_from_file() {
    let temp = tempdir().unwrap();
    let relic_dir = temp.path().join(".relic");
    std::fs::create_dir_all(&relic_dir).unwrap();

    let config_content = r#"
[registry]
root = "/srv/relic"

[walk]
threads = 4
ignore_dot = true
link_whitelist = ["/shared/datasets", "/opt/models"]

[locks]
timeout_secs = 10
"#;
    let path = relic_dir.join("config.toml");
    std::fs::write(&path, config_content).unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.registry.root, PathBuf::from("/srv/relic"));
    assert_eq!(config.walk.threads, Some(4));
    assert!(config.walk.ignore_dot);
    assert!(!config.walk.consume);
    assert_eq!(
        config.walk.link_whitelist,
        vec![PathBuf::from("/shared/datasets"), PathBuf::from("/opt/models")]
    );
    assert_eq!(config.locks.timeout_secs, 10);
}

/// Test config hierarchy: project config overrides global
#[test]
fn test_config_hierarchy_project_overrides_global() {
    let temp = tempdir().unwrap();

    let global_path = temp.path().join("global.toml");
    std::fs::write(
        &global_path,
        r#"
[registry]
root = "/srv/relic"

[walk]
threads = 2
link_whitelist = ["/shared"]
"#,
    )
    .unwrap();

    let project_path = temp.path().join("project.toml");
    std::fs::write(
        &project_path,
        r#"
[walk]
consume = true
link_whitelist = ["/project/shared"]
"#,
    )
    .unwrap();

    let mut config = Config::from_file(&global_path).unwrap();
    config.merge(Config::from_file(&project_path).unwrap());

    assert_eq!(config.registry.root, PathBuf::from("/srv/relic"));
    assert_eq!(config.walk.threads, Some(2));
    assert!(config.walk.consume);
    assert_eq!(config.walk.link_whitelist, vec![PathBuf::from("/project/shared")]);
}

/// Test config with environment variable override
#[test]
fn test_config_env_override_integration() {
    let mut config: Config = toml::from_str(
        r#"
[walk]
threads = 2
"#,
    )
    .unwrap();

    std::env::set_var(relic_config::ENV_REGISTRY, "/override/registry");
    std::env::set_var(relic_config::ENV_THREADS, "16");
    std::env::set_var(relic_config::ENV_LOCK_TIMEOUT, "not-a-number");

    config.apply_env_overrides();

    std::env::remove_var(relic_config::ENV_REGISTRY);
    std::env::remove_var(relic_config::ENV_THREADS);
    std::env::remove_var(relic_config::ENV_LOCK_TIMEOUT);

    assert_eq!(config.registry.root, PathBuf::from("/override/registry"));
    assert_eq!(config.walk.threads, Some(16));
    // Unparseable values leave the setting alone
    assert_eq!(config.locks.timeout_secs, 30);
}

/// Test partial config with defaults filling in
#[test]
fn test_partial_config_defaults_applied() {
    let config: Config = toml::from_str(
        r#"
[walk]
ignore_dot = true
"#,
    )
    .unwrap();

    assert!(config.walk.ignore_dot);
    assert_eq!(config.registry.root, PathBuf::from("~/.relic/registry"));
    assert_eq!(config.locks.timeout_secs, 30);
}

/// Test that parse errors name the offending file
#[test]
fn test_invalid_config_reports_path() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("broken.toml");
    std::fs::write(&path, "[walk\nthreads = ").unwrap();

    let err = Config::from_file(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Toml { .. }));
    assert!(err.to_string().contains("broken.toml"));

    let missing = Config::from_file(&temp.path().join("missing.toml")).unwrap_err();
    assert!(matches!(missing, ConfigError::Io { .. }));
}
