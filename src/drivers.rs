//! Driver selection and host connection setup
//!
//! Decides which shm and data drivers a bridge uses, opens the devices they
//! need and finds the host compositor.

use crate::config::BridgeConfig;
use crate::server::{DataDriver, HostLink};
use crate::surface::{BackingDriver, ShmDriverKind};
use crate::transport::VirtwlDevice;
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

/// Device tried when none is configured.
pub const DEFAULT_VIRTWL_DEVICE: &str = "/dev/wl0";

/// Pick the shm driver.
///
/// `virtwl` is `None` without a virtwl device, else whether it can allocate
/// dmabufs.
pub fn choose_shm_driver(
    requested: Option<&str>,
    have_drm: bool,
    virtwl: Option<bool>,
) -> Result<ShmDriverKind> {
    let kind = match requested {
        Some(name) => name.parse::<ShmDriverKind>()?,
        None if have_drm => ShmDriverKind::Dmabuf,
        None if virtwl.is_some() => ShmDriverKind::VirtwlDmabuf,
        None => ShmDriverKind::Noop,
    };
    match kind {
        ShmDriverKind::Dmabuf if !have_drm => bail!("the dmabuf driver needs a DRM device"),
        ShmDriverKind::Virtwl | ShmDriverKind::VirtwlDmabuf if virtwl.is_none() => {
            bail!("the {} driver needs a virtwl device", kind)
        }
        ShmDriverKind::VirtwlDmabuf if virtwl == Some(false) => {
            warn!("⚠️ Host cannot allocate virtwl dmabufs; using the virtwl driver");
            Ok(ShmDriverKind::Virtwl)
        }
        kind => Ok(kind),
    }
}

/// Pick the data driver: `true` for virtwl pipes.
pub fn choose_data_driver(requested: Option<&str>, have_virtwl: bool) -> Result<bool> {
    match requested {
        Some("virtwl") if !have_virtwl => bail!("the virtwl data driver needs a virtwl device"),
        Some("virtwl") => Ok(true),
        Some("noop") => Ok(false),
        Some(other) => bail!("unknown data driver '{}'", other),
        None => Ok(have_virtwl),
    }
}

/// Where the host socket lives for a display name.
pub fn host_socket_path(display: &str, runtime_dir: Option<&Path>) -> Result<PathBuf> {
    let display = Path::new(display);
    if display.is_absolute() {
        return Ok(display.to_path_buf());
    }
    let runtime_dir = runtime_dir.context("XDG_RUNTIME_DIR is not set")?;
    Ok(runtime_dir.join(display))
}

/// Resolved drivers of one bridge process.
#[derive(Debug, Clone)]
pub struct Drivers {
    pub shm: ShmDriverKind,
    pub virtwl_data: bool,
    pub virtwl: Option<VirtwlDevice>,
    pub drm_device: Option<PathBuf>,
}

impl Drivers {
    pub fn select(config: &BridgeConfig) -> Result<Self> {
        let virtwl = match &config.virtwl_device {
            Some(path) => Some(VirtwlDevice::open(path)?),
            None => match VirtwlDevice::open(DEFAULT_VIRTWL_DEVICE) {
                Ok(device) => Some(device),
                Err(err) => {
                    debug!("🔕 No virtwl device: {:#}", err);
                    None
                }
            },
        };
        let shm = choose_shm_driver(
            config.shm_driver.as_deref(),
            config.drm_device.is_some(),
            virtwl.as_ref().map(VirtwlDevice::supports_dmabuf),
        )?;
        let virtwl_data = choose_data_driver(config.data_driver.as_deref(), virtwl.is_some())?;
        info!(
            "🧰 shm driver {}, data driver {}",
            shm,
            if virtwl_data { "virtwl" } else { "noop" }
        );
        Ok(Self {
            shm,
            virtwl_data,
            virtwl,
            drm_device: config.drm_device.clone(),
        })
    }

    fn device(&self) -> Result<VirtwlDevice> {
        self.virtwl.clone().context("virtwl device is not open")
    }

    /// Open the backing driver. GBM devices are opened here, on the thread
    /// that uses them.
    pub fn backing(&self) -> Result<BackingDriver> {
        Ok(match self.shm {
            ShmDriverKind::Noop => BackingDriver::Noop,
            ShmDriverKind::Dmabuf => {
                let path = self.drm_device.as_ref().context("DRM device is not set")?;
                BackingDriver::open_gbm(path)?
            }
            ShmDriverKind::Virtwl => BackingDriver::Virtwl(self.device()?),
            ShmDriverKind::VirtwlDmabuf => BackingDriver::VirtwlDmabuf(self.device()?),
        })
    }

    pub fn data(&self) -> Result<DataDriver> {
        Ok(if self.virtwl_data {
            DataDriver::Virtwl(self.device()?)
        } else {
            DataDriver::Noop
        })
    }

    /// Connect to the host: through the virtwl device when there is one,
    /// else to `display` under `$XDG_RUNTIME_DIR`.
    pub fn host_link(&self, display: Option<&str>) -> Result<HostLink> {
        if let Some(device) = &self.virtwl {
            return Ok(HostLink::Virtwl(device.clone()));
        }
        let display = display
            .map(str::to_string)
            .or_else(|| std::env::var("WAYLAND_DISPLAY").ok())
            .unwrap_or_else(|| "wayland-0".to_string());
        let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from);
        let path = host_socket_path(&display, runtime_dir.as_deref())?;
        let stream = UnixStream::connect(&path)
            .with_context(|| format!("Failed to connect to {}", path.display()))?;
        info!("🔗 Connected to host compositor at {}", path.display());
        Ok(HostLink::Socket(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_automatic_shm_driver() {
        assert_eq!(choose_shm_driver(None, false, None).unwrap(), ShmDriverKind::Noop);
        assert_eq!(choose_shm_driver(None, true, Some(true)).unwrap(), ShmDriverKind::Dmabuf);
        assert_eq!(
            choose_shm_driver(None, false, Some(true)).unwrap(),
            ShmDriverKind::VirtwlDmabuf
        );
    }

    #[test]
    fn test_virtwl_dmabuf_degrades_without_host_support() {
        assert_eq!(
            choose_shm_driver(None, false, Some(false)).unwrap(),
            ShmDriverKind::Virtwl
        );
        assert_eq!(
            choose_shm_driver(Some("virtwl-dmabuf"), false, Some(false)).unwrap(),
            ShmDriverKind::Virtwl
        );
    }

    #[test]
    fn test_requested_driver_needs_its_device() {
        assert!(choose_shm_driver(Some("dmabuf"), false, None).is_err());
        assert!(choose_shm_driver(Some("virtwl"), true, None).is_err());
        assert!(choose_shm_driver(Some("bogus"), true, Some(true)).is_err());
        assert_eq!(
            choose_shm_driver(Some("noop"), true, Some(true)).unwrap(),
            ShmDriverKind::Noop
        );
    }

    #[test]
    fn test_data_driver() {
        assert!(choose_data_driver(None, true).unwrap());
        assert!(!choose_data_driver(None, false).unwrap());
        assert!(!choose_data_driver(Some("noop"), true).unwrap());
        assert!(choose_data_driver(Some("virtwl"), false).is_err());
        assert!(choose_data_driver(Some("pipe"), true).is_err());
    }

    #[test]
    fn test_host_socket_path() {
        let runtime = Path::new("/run/user/1000");
        assert_eq!(
            host_socket_path("wayland-1", Some(runtime)).unwrap(),
            Path::new("/run/user/1000/wayland-1")
        );
        assert_eq!(
            host_socket_path("/tmp/host.sock", None).unwrap(),
            Path::new("/tmp/host.sock")
        );
        assert!(host_socket_path("wayland-1", None).is_err());
    }
}
