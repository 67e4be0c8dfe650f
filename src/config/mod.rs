//! Configuration management for crossway
//!
//! Settings come from three layers, later ones winning: a TOML file, the
//! `CROSSWAY_*` environment, and command line flags. This module owns the
//! first two; `main` applies the flags on top.

use crate::surface::ShmDriverKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "~/.config/crossway/crossway.toml";

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "CROSSWAY_";

/// Main configuration struct containing all crossway settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CrosswayConfig {
    /// Bridge behaviour: scaling, drivers, window decoration
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// How Xwayland is started in `-X` mode
    #[serde(default)]
    pub xwayland: XwaylandConfig,

    /// Log filter and destination
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Socket name listened on in master mode
    pub socket: String,

    /// Host Wayland display; `$WAYLAND_DISPLAY` when unset
    pub display: Option<String>,

    /// Desired scale factor (clamped to 0.1..=10)
    pub scale: f64,

    /// DPI buckets advertised outputs snap to; empty disables snapping
    pub dpi: Vec<i32>,

    /// "noop", "dmabuf", "virtwl" or "virtwl-dmabuf"; picked automatically when unset
    pub shm_driver: Option<String>,

    /// "noop" or "virtwl"; picked automatically when unset
    pub data_driver: Option<String>,

    pub virtwl_device: Option<PathBuf>,

    /// Render node used by the `dmabuf` driver
    pub drm_device: Option<PathBuf>,

    /// Forced application id for every toplevel
    pub application_id: Option<String>,

    /// Key combinations withheld from the guest, e.g. `<Control><Alt>Delete`
    pub accelerators: String,

    /// Frame colour (#RRGGBB)
    pub frame_color: String,

    /// Frame colour for windows asking for the dark theme variant
    pub dark_frame_color: String,

    /// Own CLIPBOARD_MANAGER and bridge the X clipboard
    pub clipboard_manager: bool,

    /// Ask Xwayland for glamor acceleration
    pub glamor: bool,

    /// Exit with the spawned program
    pub exit_with_child: bool,

    /// Message sent to $NOTIFY_SOCKET once the child exits
    pub sd_notify: Option<String>,

    /// Command prepended to spawned peers in master mode
    pub peer_cmd_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct XwaylandConfig {
    /// Xwayland binary
    pub path: String,

    /// Exported as LIBGL_DRIVERS_PATH for Xwayland
    pub gl_driver_path: Option<PathBuf>,

    /// Xauthority file passed as `-auth`
    pub auth: Option<PathBuf>,

    /// Font path passed as `-fp`
    pub font_path: Option<String>,

    /// Command prepended to the Xwayland invocation
    pub cmd_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,

    /// Append logs to this file instead of stderr
    pub file: Option<PathBuf>,

    /// Prefix every line with the process id
    pub log_pid: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket: "wayland-0".to_string(),
            display: None,
            scale: 1.0,
            dpi: Vec::new(),
            shm_driver: None,
            data_driver: None,
            virtwl_device: None,
            drm_device: None,
            application_id: None,
            accelerators: String::new(),
            frame_color: "#f2f2f2".to_string(),
            dark_frame_color: "#323639".to_string(),
            clipboard_manager: true,
            glamor: false,
            exit_with_child: true,
            sd_notify: None,
            peer_cmd_prefix: None,
        }
    }
}

impl Default for XwaylandConfig {
    fn default() -> Self {
        Self {
            path: "Xwayland".to_string(),
            gl_driver_path: None,
            auth: None,
            font_path: None,
            cmd_prefix: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            log_pid: false,
        }
    }
}

/// Parse `#RRGGBB` into an opaque ARGB value.
pub fn parse_color(value: &str) -> Result<u32> {
    let hex = value
        .strip_prefix('#')
        .filter(|h| h.len() == 6)
        .with_context(|| format!("Invalid colour '{}': expected #RRGGBB", value))?;
    let rgb = u32::from_str_radix(hex, 16)
        .with_context(|| format!("Invalid colour '{}': not hexadecimal", value))?;
    Ok(0xff00_0000 | rgb)
}

/// Parse a comma separated DPI list such as `72,96,160`.
pub fn parse_dpi_list(value: &str) -> Result<Vec<i32>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i32>()
                .with_context(|| format!("Invalid DPI value '{}'", s))
        })
        .collect()
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => anyhow::bail!("Invalid value '{}' for {}{}", other, ENV_PREFIX, name),
    }
}

fn expand_home(path: &Path) -> Result<PathBuf> {
    if path.to_string_lossy().starts_with('~') {
        let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
        Ok(Path::new(&home).join(path.strip_prefix("~").unwrap_or(path)))
    } else {
        Ok(path.to_path_buf())
    }
}

impl CrosswayConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let expanded_path = expand_home(path.as_ref())?;

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: CrosswayConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load `path` when given, else the default file if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = expand_home(Path::new(DEFAULT_CONFIG_PATH))?;
                if default.exists() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let bridge = &self.bridge;

        if !(0.1..=10.0).contains(&bridge.scale) {
            anyhow::bail!("Invalid scale {}: must be between 0.1 and 10.0", bridge.scale);
        }

        if let Some(dpi) = bridge.dpi.iter().find(|d| !(72..=9600).contains(*d)) {
            anyhow::bail!("Invalid DPI {}: must be between 72 and 9600", dpi);
        }

        parse_color(&bridge.frame_color)?;
        parse_color(&bridge.dark_frame_color)?;

        if let Some(driver) = &bridge.shm_driver {
            driver
                .parse::<ShmDriverKind>()
                .with_context(|| format!("Invalid shm_driver '{}'", driver))?;
        }

        if let Some(driver) = &bridge.data_driver {
            if !["noop", "virtwl"].contains(&driver.as_str()) {
                anyhow::bail!("Invalid data_driver '{}': expected noop or virtwl", driver);
            }
        }

        if bridge.socket.is_empty() || bridge.socket.contains('/') {
            anyhow::bail!("Invalid socket name '{}'", bridge.socket);
        }

        if self.xwayland.path.is_empty() {
            anyhow::bail!("Xwayland path must not be empty");
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }

    /// Merge a partial configuration into this one
    /// Non-default sections from the partial config replace this config's
    pub fn merge_partial(mut self, partial: CrosswayConfig) -> Self {
        let default_config = CrosswayConfig::default();

        if partial.bridge != default_config.bridge {
            self.bridge = partial.bridge;
        }
        if partial.xwayland != default_config.xwayland {
            self.xwayland = partial.xwayland;
        }
        if partial.logging != default_config.logging {
            self.logging = partial.logging;
        }

        self
    }

    /// Overlay `CROSSWAY_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok())
    }

    /// Overlay variables looked up by their name without the prefix.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bridge = &mut self.bridge;

        if let Some(display) = lookup("DISPLAY") {
            bridge.display = Some(display);
        }
        if let Some(scale) = lookup("SCALE") {
            bridge.scale = scale
                .parse()
                .with_context(|| format!("Invalid {}SCALE '{}'", ENV_PREFIX, scale))?;
        }
        if let Some(dpi) = lookup("DPI") {
            bridge.dpi = parse_dpi_list(&dpi)?;
        }
        if let Some(driver) = lookup("SHM_DRIVER") {
            bridge.shm_driver = Some(driver);
        }
        if let Some(driver) = lookup("DATA_DRIVER") {
            bridge.data_driver = Some(driver);
        }
        if let Some(path) = lookup("VIRTWL_DEVICE") {
            bridge.virtwl_device = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("DRM_DEVICE") {
            bridge.drm_device = Some(PathBuf::from(path));
        }
        if let Some(list) = lookup("ACCELERATORS") {
            bridge.accelerators = list;
        }
        if let Some(id) = lookup("APPLICATION_ID") {
            bridge.application_id = Some(id);
        }
        if let Some(color) = lookup("FRAME_COLOR") {
            bridge.frame_color = color;
        }
        if let Some(color) = lookup("DARK_FRAME_COLOR") {
            bridge.dark_frame_color = color;
        }
        if let Some(value) = lookup("CLIPBOARD_MANAGER") {
            bridge.clipboard_manager = parse_flag("CLIPBOARD_MANAGER", &value)?;
        }
        if let Some(value) = lookup("GLAMOR") {
            bridge.glamor = parse_flag("GLAMOR", &value)?;
        }

        let xwayland = &mut self.xwayland;
        if let Some(path) = lookup("XWAYLAND_PATH") {
            xwayland.path = path;
        }
        if let Some(path) = lookup("XWAYLAND_GL_DRIVER_PATH") {
            xwayland.gl_driver_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("XAUTH_PATH") {
            xwayland.auth = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("XFONT_PATH") {
            xwayland.font_path = Some(path);
        }

        Ok(())
    }

    /// Frame colours as ARGB, `(normal, dark)`.
    pub fn frame_colors(&self) -> Result<(u32, u32)> {
        Ok((
            parse_color(&self.bridge.frame_color)?,
            parse_color(&self.bridge.dark_frame_color)?,
        ))
    }
}

#[cfg(test)]
mod tests;

#[cfg(test)]
mod property_tests;
