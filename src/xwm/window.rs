//! Tracked X11 windows

use super::hints::{ANY_POSITION, P_MAX_SIZE, P_MIN_SIZE, P_POSITION};

/// Geometry fields of a `ConfigureWindow` request. `None` fields are left out
/// of the value mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowChanges {
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub border_width: Option<u32>,
}

impl WindowChanges {
    pub fn is_empty(&self) -> bool {
        *self == WindowChanges::default()
    }
}

/// One host configure, waiting to be applied or acked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub serial: u32,
    pub changes: WindowChanges,
    /// `_NET_WM_STATE` atoms to publish once applied.
    pub states: Vec<u32>,
}

impl Config {
    pub fn reset(&mut self) {
        *self = Config::default();
    }
}

/// Host shell objects created for the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    None,
    Toplevel,
    Popup,
}

#[derive(Debug, Clone)]
pub struct Window {
    pub id: u32,
    pub frame_id: Option<u32>,
    /// Guest `wl_surface` id from `WL_SURFACE_ID`, 0 while unpaired.
    pub host_surface_id: u32,
    /// Whether the surface id resolved to a live guest surface.
    pub paired: bool,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub border_width: u32,
    pub depth: u8,
    pub managed: bool,
    pub realized: bool,
    pub activated: bool,
    pub maximized: bool,
    pub allow_resize: bool,
    pub transient_for: Option<u32>,
    pub client_leader: Option<u32>,
    pub decorated: bool,
    pub name: Option<String>,
    pub class: Option<String>,
    pub startup_id: Option<String>,
    pub dark_frame: bool,
    pub size_flags: u32,
    pub min_size: (i32, i32),
    pub max_size: (i32, i32),
    pub shell: Shell,
    pub next: Config,
    pub pending: Config,
}

impl Window {
    pub fn new(id: u32, x: i32, y: i32, width: u32, height: u32, border_width: u32) -> Self {
        Self {
            id,
            frame_id: None,
            host_surface_id: 0,
            paired: false,
            x,
            y,
            width,
            height,
            border_width,
            depth: 0,
            managed: false,
            realized: false,
            activated: false,
            maximized: false,
            allow_resize: true,
            transient_for: None,
            client_leader: None,
            decorated: false,
            name: None,
            class: None,
            startup_id: None,
            dark_frame: false,
            size_flags: P_POSITION,
            min_size: (0, 0),
            max_size: (0, 0),
            shell: Shell::None,
            next: Config::default(),
            pending: Config::default(),
        }
    }

    /// Matches the client window or its frame.
    pub fn is(&self, id: u32) -> bool {
        self.id == id || self.frame_id == Some(id)
    }

    pub fn is_positioned(&self) -> bool {
        self.size_flags & ANY_POSITION != 0
    }

    pub fn min_size(&self) -> Option<(i32, i32)> {
        (self.size_flags & P_MIN_SIZE != 0).then_some(self.min_size)
    }

    pub fn max_size(&self) -> Option<(i32, i32)> {
        (self.size_flags & P_MAX_SIZE != 0).then_some(self.max_size)
    }

    /// The frame extents the host content must match before a configure is acked.
    pub fn framed_size(&self) -> (i32, i32) {
        (
            (self.width + 2 * self.border_width) as i32,
            (self.height + 2 * self.border_width) as i32,
        )
    }

    pub fn clamp_to_screen(&mut self, screen: (u32, u32)) {
        self.width = self.width.min(screen.0);
        self.height = self.height.min(screen.1);
    }

    pub fn center_on_screen(&mut self, screen: (u32, u32)) {
        self.x = (screen.0 / 2) as i32 - (self.width / 2) as i32;
        self.y = (screen.1 / 2) as i32 - (self.height / 2) as i32;
    }

    /// Application id for the host shell.
    ///
    /// `forced` wins. Override-redirect windows get none in Xwayland mode, so
    /// the host does not list them as applications.
    pub fn app_id(&self, forced: Option<&str>, xwayland: bool) -> Option<String> {
        if let Some(id) = forced {
            return Some(id.to_string());
        }
        if xwayland && !self.managed {
            return None;
        }
        Some(match (&self.class, self.client_leader) {
            (Some(class), _) => format!("org.crossway.wmclass.{}", class),
            (None, Some(leader)) => format!("org.crossway.wmclientleader.{}", leader),
            (None, None) => format!("org.crossway.xid.{}", self.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xwm::hints::US_POSITION;

    #[test]
    fn test_new_window_defaults() {
        let w = Window::new(0x200001, 5, 6, 100, 80, 1);
        assert!(w.is(0x200001));
        assert!(!w.is(0x400001));
        assert!(w.is_positioned());
        assert!(w.allow_resize);
        assert_eq!(w.framed_size(), (102, 82));
        assert_eq!(w.min_size(), None);
    }

    #[test]
    fn test_frame_matches() {
        let mut w = Window::new(1, 0, 0, 10, 10, 0);
        w.frame_id = Some(0x400002);
        assert!(w.is(0x400002));
    }

    #[test]
    fn test_screen_adjustment() {
        let mut w = Window::new(1, 0, 0, 3000, 500, 0);
        w.clamp_to_screen((1920, 1080));
        assert_eq!((w.width, w.height), (1920, 500));
        w.center_on_screen((1920, 1080));
        assert_eq!((w.x, w.y), (0, 290));
        w.size_flags = US_POSITION;
        assert!(w.is_positioned());
    }

    #[test]
    fn test_app_id_precedence() {
        let mut w = Window::new(42, 0, 0, 1, 1, 0);
        w.managed = true;
        assert_eq!(w.app_id(None, true).unwrap(), "org.crossway.xid.42");
        w.client_leader = Some(7);
        assert_eq!(w.app_id(None, true).unwrap(), "org.crossway.wmclientleader.7");
        w.class = Some("XTerm".into());
        assert_eq!(w.app_id(None, true).unwrap(), "org.crossway.wmclass.XTerm");
        assert_eq!(w.app_id(Some("forced"), true).unwrap(), "forced");
        w.managed = false;
        assert_eq!(w.app_id(None, true), None);
        assert!(w.app_id(None, false).is_some());
    }
}
