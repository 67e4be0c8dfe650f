//! Unit tests for configuration module
//!
//! Tests configuration parsing, validation, environment overlay and
//! serialization.

use super::*;
use anyhow::Result;
use std::collections::HashMap;
use std::fs;
use tempfile::tempdir;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| map.get(name).cloned()
}

#[test]
fn test_default_configuration_is_valid() {
    let config = CrosswayConfig::default();
    assert!(config.validate().is_ok());

    assert_eq!(config.bridge.socket, "wayland-0");
    assert_eq!(config.bridge.scale, 1.0);
    assert!(config.bridge.clipboard_manager);
    assert!(config.bridge.exit_with_child);
    assert_eq!(config.xwayland.path, "Xwayland");
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_default_frame_colors() -> Result<()> {
    let config = CrosswayConfig::default();
    assert_eq!(config.frame_colors()?, (0xfff2f2f2, 0xff323639));
    Ok(())
}

#[test]
fn test_configuration_serialization_roundtrip() -> Result<()> {
    let mut original = CrosswayConfig::default();
    original.bridge.dpi = vec![96, 160];
    original.bridge.shm_driver = Some("virtwl".into());
    original.xwayland.font_path = Some("/usr/share/fonts/X11".into());

    let toml_string = toml::to_string(&original)?;
    let restored: CrosswayConfig = toml::from_str(&toml_string)?;

    assert_eq!(original, restored);
    Ok(())
}

#[test]
fn test_configuration_from_file() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("crossway.toml");

    fs::write(
        &file_path,
        r#"
[bridge]
scale = 1.5
dpi = [96, 160, 240]
shm_driver = "virtwl-dmabuf"
accelerators = "<Alt>Tab,<Control><Alt>Delete"

[xwayland]
path = "/usr/bin/Xwayland"

[logging]
level = "debug"
"#,
    )?;

    let config = CrosswayConfig::load(&file_path)?;
    assert_eq!(config.bridge.scale, 1.5);
    assert_eq!(config.bridge.dpi, vec![96, 160, 240]);
    assert_eq!(config.bridge.shm_driver.as_deref(), Some("virtwl-dmabuf"));
    assert_eq!(config.xwayland.path, "/usr/bin/Xwayland");
    assert_eq!(config.logging.level, "debug");
    // untouched fields keep their defaults
    assert_eq!(config.bridge.frame_color, "#f2f2f2");
    Ok(())
}

#[test]
fn test_partial_file_uses_defaults() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("partial.toml");
    fs::write(&file_path, "[logging]\nlog_pid = true\n")?;

    let config = CrosswayConfig::load(&file_path)?;
    assert!(config.logging.log_pid);
    assert_eq!(config.bridge, BridgeConfig::default());
    Ok(())
}

#[test]
fn test_invalid_file_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("bad.toml");
    fs::write(&file_path, "[bridge]\nscale = 42.0\n")?;

    let err = CrosswayConfig::load(&file_path).unwrap_err();
    assert!(err.to_string().contains("scale"));

    fs::write(&file_path, "[bridge\nscale = ")?;
    assert!(CrosswayConfig::load(&file_path).is_err());
    Ok(())
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempdir().unwrap();
    let err = CrosswayConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_validation_rules() {
    let mut config = CrosswayConfig::default();
    config.bridge.scale = 0.05;
    assert!(config.validate().is_err());

    let mut config = CrosswayConfig::default();
    config.bridge.dpi = vec![96, 10_000];
    assert!(config.validate().is_err());

    let mut config = CrosswayConfig::default();
    config.bridge.frame_color = "f2f2f2".into();
    assert!(config.validate().is_err());

    let mut config = CrosswayConfig::default();
    config.bridge.shm_driver = Some("vulkan".into());
    assert!(config.validate().is_err());

    let mut config = CrosswayConfig::default();
    config.bridge.data_driver = Some("dmabuf".into());
    assert!(config.validate().is_err());

    let mut config = CrosswayConfig::default();
    config.bridge.socket = "../wayland-0".into();
    assert!(config.validate().is_err());
}

#[test]
fn test_parse_color() {
    assert_eq!(parse_color("#000000").unwrap(), 0xff000000);
    assert_eq!(parse_color("#12aBcD").unwrap(), 0xff12abcd);
    assert!(parse_color("#fff").is_err());
    assert!(parse_color("#gggggg").is_err());
    assert!(parse_color("").is_err());
}

#[test]
fn test_parse_dpi_list() {
    assert_eq!(parse_dpi_list("72, 96,160").unwrap(), vec![72, 96, 160]);
    assert_eq!(parse_dpi_list("").unwrap(), Vec::<i32>::new());
    assert!(parse_dpi_list("96,high").is_err());
}

#[test]
fn test_environment_overrides_file_values() -> Result<()> {
    let mut config = CrosswayConfig::default();
    config.bridge.scale = 2.0;

    config.apply_env_from(env(&[
        ("SCALE", "1.25"),
        ("DPI", "96,120"),
        ("SHM_DRIVER", "noop"),
        ("CLIPBOARD_MANAGER", "0"),
        ("GLAMOR", "1"),
        ("XWAYLAND_PATH", "/opt/Xwayland"),
        ("XAUTH_PATH", "/run/user/1000/xauth"),
        ("FRAME_COLOR", "#101010"),
        ("DISPLAY", "wayland-host"),
    ]))?;

    assert_eq!(config.bridge.display.as_deref(), Some("wayland-host"));

    assert_eq!(config.bridge.scale, 1.25);
    assert_eq!(config.bridge.dpi, vec![96, 120]);
    assert_eq!(config.bridge.shm_driver.as_deref(), Some("noop"));
    assert!(!config.bridge.clipboard_manager);
    assert!(config.bridge.glamor);
    assert_eq!(config.xwayland.path, "/opt/Xwayland");
    assert_eq!(
        config.xwayland.auth.as_deref(),
        Some(Path::new("/run/user/1000/xauth"))
    );
    assert_eq!(config.bridge.frame_color, "#101010");
    Ok(())
}

#[test]
fn test_environment_rejects_garbage() {
    let mut config = CrosswayConfig::default();
    assert!(config.apply_env_from(env(&[("SCALE", "big")])).is_err());
    assert!(config
        .apply_env_from(env(&[("CLIPBOARD_MANAGER", "maybe")]))
        .is_err());
}

#[test]
fn test_empty_environment_changes_nothing() -> Result<()> {
    let mut config = CrosswayConfig::default();
    config.apply_env_from(env(&[]))?;
    assert_eq!(config, CrosswayConfig::default());
    Ok(())
}

#[test]
#[serial_test::serial]
fn test_process_environment_overlay() -> Result<()> {
    std::env::set_var("CROSSWAY_APPLICATION_ID", "org.example.app");
    let mut config = CrosswayConfig::default();
    let result = config.apply_env();
    std::env::remove_var("CROSSWAY_APPLICATION_ID");
    result?;
    assert_eq!(config.bridge.application_id.as_deref(), Some("org.example.app"));
    Ok(())
}

#[test]
fn test_save_and_reload() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("saved.toml");

    let mut config = CrosswayConfig::default();
    config.bridge.accelerators = "<Super>l".into();
    config.logging.file = Some(dir.path().join("crossway.log"));
    config.save(&file_path)?;

    assert_eq!(CrosswayConfig::load(&file_path)?, config);
    Ok(())
}

#[test]
fn test_merge_partial_replaces_changed_sections() {
    let base = CrosswayConfig::default();
    let mut partial = CrosswayConfig::default();
    partial.logging.level = "trace".into();

    let merged = base.merge_partial(partial);
    assert_eq!(merged.logging.level, "trace");
    assert_eq!(merged.bridge, BridgeConfig::default());
    assert_eq!(merged.xwayland, XwaylandConfig::default());
}

#[test]
fn test_load_or_default_with_explicit_path() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("explicit.toml");
    fs::write(&file_path, "[bridge]\nsocket = \"wayland-7\"\n")?;

    let config = CrosswayConfig::load_or_default(Some(&file_path))?;
    assert_eq!(config.bridge.socket, "wayland-7");
    Ok(())
}
