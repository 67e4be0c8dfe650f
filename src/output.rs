//! Output/scale translation
//!
//! Host outputs are re-advertised to the guest with a mode, physical size and
//! scale that make the guest render at the density we want:
//!
//! - native Wayland guests get an integer output scale (capped at
//!   [`MAX_OUTPUT_SCALE`]) and the host's physical size;
//! - Xwayland is pinned to scale 1 and instead sees a smaller or larger
//!   resolution, with the physical size chosen for a target DPI.
//!
//! Everything here is pure arithmetic over [`HostOutputInfo`]; the server
//! glue feeds it host events and forwards the resulting [`OutputAnnouncement`].

use log::debug;

pub const MAX_OUTPUT_SCALE: i32 = 2;
pub const INCH_IN_MM: f64 = 25.4;
/// DPI of a "normal" scale as legacy applications understand it.
pub const DEFACTO_DPI: i32 = 96;
pub const MIN_SCALE: f64 = 0.1;
pub const MAX_SCALE: f64 = 10.0;
pub const XCURSOR_SIZE_BASE: f64 = 24.0;
/// `wl_output.mode` current flag.
pub const MODE_CURRENT: u32 = 0x1;

/// Default DPI buckets in Xwayland mode.
pub const DEFAULT_XWAYLAND_DPI: [i32; 6] = [72, 96, 160, 240, 320, 480];

/// Last known state of one host output.
#[derive(Debug, Clone, PartialEq)]
pub struct HostOutputInfo {
    pub physical_width: i32,
    pub physical_height: i32,
    pub subpixel: i32,
    pub make: String,
    pub model: String,
    pub transform: i32,
    pub flags: u32,
    pub width: i32,
    pub height: i32,
    pub refresh: i32,
    pub scale_factor: i32,
    pub internal: bool,
}

impl Default for HostOutputInfo {
    fn default() -> Self {
        Self {
            physical_width: 0,
            physical_height: 0,
            subpixel: 0,
            make: "unknown".to_string(),
            model: "unknown".to_string(),
            transform: 0,
            flags: 0,
            width: 1024,
            height: 768,
            refresh: 60000,
            scale_factor: 1,
            internal: false,
        }
    }
}

impl HostOutputInfo {
    /// Scale the host applies to this output.
    pub fn applied_scale(&self) -> f64 {
        self.scale_factor.max(1) as f64
    }
}

/// Proxy-wide parameters of the translation.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleContext {
    pub scale: f64,
    pub xwayland: bool,
    pub dpi_buckets: Vec<i32>,
}

/// Mode, size and scale advertised for one output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputState {
    pub scale: i32,
    pub physical_width: i32,
    pub physical_height: i32,
    pub width: i32,
    pub height: i32,
}

pub fn dpi_to_physical_mm(dpi: i32, px: i32) -> i32 {
    if dpi <= 0 {
        return 0;
    }
    (px as f64 * (INCH_IN_MM / dpi as f64)) as i32
}

/// Closest bucket to `target`; the first one wins ties.
pub fn snap_dpi(buckets: &[i32], target: i32) -> Option<i32> {
    let mut best = *buckets.first()?;
    for &b in buckets {
        if (b - target).abs() < (best - target).abs() {
            best = b;
        }
    }
    Some(best)
}

/// Compute the state of one output on its own.
pub fn output_state(host: &HostOutputInfo, ctx: &ScaleContext) -> OutputState {
    let applied = host.applied_scale();
    let mut state;
    let target_dpi;

    if ctx.xwayland {
        let width = (host.width as f64 * ctx.scale / applied) as i32;
        let height = (host.height as f64 * ctx.scale / applied) as i32;
        target_dpi = DEFACTO_DPI;
        state = OutputState {
            scale: 1,
            width,
            height,
            physical_width: dpi_to_physical_mm(target_dpi, width),
            physical_height: dpi_to_physical_mm(target_dpi, height),
        };
    } else {
        let s = ((applied / ctx.scale).ceil() as i32).min(MAX_OUTPUT_SCALE);
        let width = (host.width as f64 * ctx.scale * s as f64 / applied) as i32;
        let height = (host.height as f64 * ctx.scale * s as f64 / applied) as i32;
        target_dpi = if host.physical_width > 0 {
            (width as f64 * INCH_IN_MM / host.physical_width as f64) as i32
        } else {
            DEFACTO_DPI
        };
        state = OutputState {
            scale: s,
            width,
            height,
            physical_width: host.physical_width,
            physical_height: host.physical_height,
        };
    }

    if let Some(dpi) = snap_dpi(&ctx.dpi_buckets, target_dpi) {
        state.physical_width = dpi_to_physical_mm(dpi, state.width);
        state.physical_height = dpi_to_physical_mm(dpi, state.height);
    }
    state
}

/// State actually advertised for `host`.
///
/// For Xwayland every output reuses the density of the internal output, since
/// X11 clients rarely cope with density changing between outputs.
pub fn advertised_state(
    host: &HostOutputInfo,
    internal: Option<&HostOutputInfo>,
    ctx: &ScaleContext,
) -> OutputState {
    let mut state = output_state(host, ctx);
    if ctx.xwayland {
        if let Some(internal) = internal {
            let reference = output_state(internal, ctx);
            if reference.width > 0 && reference.height > 0 {
                state.physical_width = reference.physical_width * state.width / reference.width;
                state.physical_height = reference.physical_height * state.height / reference.height;
            }
        }
    }
    state
}

/// Events to send on a guest `wl_output`, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputAnnouncement {
    pub physical_width: i32,
    pub physical_height: i32,
    pub subpixel: i32,
    pub make: String,
    pub model: String,
    pub transform: i32,
    pub mode_flags: u32,
    pub width: i32,
    pub height: i32,
    pub refresh: i32,
    /// Sent for version 2 and later.
    pub scale: Option<i32>,
    /// Sent for version 2 and later.
    pub done: bool,
}

pub fn announcement(
    host: &HostOutputInfo,
    internal: Option<&HostOutputInfo>,
    ctx: &ScaleContext,
    version: u32,
) -> OutputAnnouncement {
    let state = advertised_state(host, internal, ctx);
    debug!(
        "🖥️ Output {}x{} ({}x{} mm) scale {}",
        state.width, state.height, state.physical_width, state.physical_height, state.scale
    );
    OutputAnnouncement {
        physical_width: state.physical_width,
        physical_height: state.physical_height,
        subpixel: host.subpixel,
        make: host.make.clone(),
        model: host.model.clone(),
        transform: host.transform,
        mode_flags: host.flags | MODE_CURRENT,
        width: state.width,
        height: state.height,
        refresh: host.refresh,
        scale: (version >= 2).then_some(state.scale),
        done: version >= 2,
    }
}

pub fn clamp_scale(scale: f64) -> f64 {
    scale.clamp(MIN_SCALE, MAX_SCALE)
}

/// Proxy scale once Xwayland is up, rounded unless the host supports
/// viewports.
pub fn xwayland_scale(desired: f64, have_viewporter: bool) -> f64 {
    let scale = if have_viewporter { desired } else { desired.round() };
    clamp_scale(scale)
}

pub fn xcursor_size(scale: f64) -> i32 {
    (XCURSOR_SIZE_BASE * scale + 0.5) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(scale: f64, xwayland: bool) -> ScaleContext {
        ScaleContext {
            scale,
            xwayland,
            dpi_buckets: Vec::new(),
        }
    }

    fn output(width: i32, height: i32, physical: (i32, i32), scale: i32) -> HostOutputInfo {
        HostOutputInfo {
            width,
            height,
            physical_width: physical.0,
            physical_height: physical.1,
            scale_factor: scale,
            ..Default::default()
        }
    }

    #[test]
    fn test_native_scale_capped() {
        let host = output(3840, 2160, (600, 340), 3);
        let state = output_state(&host, &ctx(1.0, false));
        assert_eq!(state.scale, 2);
        assert_eq!((state.width, state.height), (2560, 1440));
        assert_eq!(state.physical_width, 600);
    }

    #[test]
    fn test_xwayland_pinned_to_scale_one() {
        let host = output(1920, 1080, (295, 165), 2);
        let state = output_state(&host, &ctx(1.0, true));
        assert_eq!(state.scale, 1);
        assert_eq!((state.width, state.height), (960, 540));
        assert_eq!(state.physical_width, dpi_to_physical_mm(96, 960));
    }

    #[test]
    fn test_fractional_proxy_scale_on_hidpi_output() {
        let host = output(1920, 1080, (295, 165), 2);
        let state = output_state(&host, &ctx(0.625, true));
        assert_eq!(state.scale, 1);
        assert_eq!((state.width, state.height), (600, 337));
        assert_eq!(state.physical_width, dpi_to_physical_mm(96, 600));

        let native = output_state(&host, &ctx(0.625, false));
        // ceil(2 / 0.625) = 4, capped
        assert_eq!(native.scale, MAX_OUTPUT_SCALE);
        assert_eq!(native.width, 1200);
    }

    #[test]
    fn test_dpi_bucket_snapping() {
        assert_eq!(snap_dpi(&DEFAULT_XWAYLAND_DPI, 100), Some(96));
        assert_eq!(snap_dpi(&DEFAULT_XWAYLAND_DPI, 200), Some(160));
        assert_eq!(snap_dpi(&[], 96), None);
        let mut c = ctx(1.0, true);
        c.dpi_buckets = DEFAULT_XWAYLAND_DPI.to_vec();
        let host = output(1000, 1000, (0, 0), 1);
        assert_eq!(output_state(&host, &c).physical_width, dpi_to_physical_mm(96, 1000));
    }

    #[test]
    fn test_internal_density_shared() {
        let internal = output(1000, 500, (0, 0), 1);
        let external = output(2000, 1000, (0, 0), 1);
        let c = ctx(1.0, true);
        let reference = output_state(&internal, &c);
        let state = advertised_state(&external, Some(&internal), &c);
        assert_eq!(state.physical_width, reference.physical_width * 2);
    }

    #[test]
    fn test_announcement_version_gating() {
        let host = output(800, 600, (200, 150), 1);
        let v1 = announcement(&host, None, &ctx(1.0, false), 1);
        assert_eq!(v1.scale, None);
        assert!(!v1.done);
        assert_eq!(v1.mode_flags & MODE_CURRENT, MODE_CURRENT);
        let v3 = announcement(&host, None, &ctx(1.0, false), 3);
        assert_eq!(v3.scale, Some(1));
        assert!(v3.done);
    }

    #[test]
    fn test_native_without_physical_size() {
        let host = output(800, 600, (0, 0), 1);
        let state = output_state(&host, &ctx(1.0, false));
        assert_eq!(state.physical_width, 0);
    }

    #[test]
    fn test_xwayland_scale_rounding() {
        assert_eq!(xwayland_scale(1.4, false), 1.0);
        assert_eq!(xwayland_scale(1.4, true), 1.4);
        assert_eq!(xwayland_scale(0.01, true), MIN_SCALE);
        assert_eq!(xcursor_size(1.5), 36);
        assert_eq!(xcursor_size(1.0), 24);
    }
}
