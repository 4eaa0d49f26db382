//! Configuration loading and root folder resolution
//!
//! Tests that touch LEGIS_ROOT / LEGIS_CONFIG are marked #[serial] so they
//! never race on the process environment.

use legis_common::config::{
    load_toml_config, resolve_config_path, resolve_root_folder, write_toml_config, FetchConfig,
    TomlConfig, CONFIG_ENV_VAR, ROOT_ENV_VAR,
};
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[test]
fn test_missing_config_file_yields_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config = load_toml_config(&temp_dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, TomlConfig::default());
    assert_eq!(config.fetch, FetchConfig::default());
}

#[test]
fn test_malformed_config_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("legis.toml");
    std::fs::write(&path, "[fetch\nconcurrency = ").unwrap();

    let err = load_toml_config(&path).unwrap_err();
    assert!(err.to_string().contains("Parse TOML failed"));
}

#[test]
fn test_write_then_load_preserves_sections() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("legis.toml");

    let mut config = TomlConfig::default();
    config.root_folder = Some(PathBuf::from("/srv/legis"));
    config.fetch.concurrency = 16;
    config.migration.batch_size = 250;
    config.sources.lda.username = Some("analyst".to_string());

    write_toml_config(&config, &path).unwrap();
    assert!(!path.with_extension("toml.tmp").exists());

    let loaded = load_toml_config(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
#[serial]
fn test_env_root_beats_toml() {
    env::set_var(ROOT_ENV_VAR, "/tmp/legis-env-root");
    let config = TomlConfig {
        root_folder: Some(PathBuf::from("/tmp/legis-toml-root")),
        ..Default::default()
    };

    let root = resolve_root_folder(None, ROOT_ENV_VAR, &config);
    env::remove_var(ROOT_ENV_VAR);

    assert_eq!(root, PathBuf::from("/tmp/legis-env-root"));
}

#[test]
#[serial]
fn test_toml_root_used_without_env() {
    env::remove_var(ROOT_ENV_VAR);
    let config = TomlConfig {
        root_folder: Some(PathBuf::from("/tmp/legis-toml-root")),
        ..Default::default()
    };

    let root = resolve_root_folder(None, ROOT_ENV_VAR, &config);
    assert_eq!(root, PathBuf::from("/tmp/legis-toml-root"));
}

#[test]
#[serial]
fn test_default_root_when_nothing_configured() {
    env::remove_var(ROOT_ENV_VAR);
    let root = resolve_root_folder(None, ROOT_ENV_VAR, &TomlConfig::default());
    assert_eq!(root, legis_common::config::default_root_folder());
}

#[test]
#[serial]
fn test_config_path_priority() {
    env::set_var(CONFIG_ENV_VAR, "/tmp/from-env.toml");
    assert_eq!(
        resolve_config_path(Some(Path::new("/tmp/from-cli.toml"))),
        Some(PathBuf::from("/tmp/from-cli.toml"))
    );
    assert_eq!(
        resolve_config_path(None),
        Some(PathBuf::from("/tmp/from-env.toml"))
    );
    env::remove_var(CONFIG_ENV_VAR);
}
