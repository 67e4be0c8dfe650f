//! Legacy window manager emulator
//!
//! Xwayland runs rootless and expects a real X11 window manager. This module
//! is that window manager. It tracks every top-level X window, reparents
//! managed windows into frames, pairs them with the guest `wl_surface` named
//! by the `WL_SURFACE_ID` client message, and drives the host shell
//! (`xdg_surface` + `xdg_toplevel`/`xdg_popup`) for them.
//!
//! # Design
//!
//! [`WindowManager`] is a pure state machine. Event handlers never talk to a
//! connection directly; they queue [`XRequest`]s for the X server and
//! [`HostRequest`]s for the host shell. [`conn::XConnection`] executes the
//! first kind, the bridge glue the second. Lookups of guest surfaces go
//! through [`SurfaceDirectory`].
//!
//! # Configure handshake
//!
//! A host configure lands in `next`. It is applied to the X window right
//! away when nothing is `pending`, then waits in `pending` until the guest
//! commits content of the configured size, at which point it is acked.
//! There are never more than two outstanding configures.

pub mod atoms;
pub mod conn;
pub mod hints;
pub mod window;

pub use conn::XConnection;
pub use hints::{MotifHints, SizeHints};
pub use window::{Config, Shell, Window, WindowChanges};

use crate::bridge::{Arena, Key};
use crate::error::{BridgeError, BridgeResult};
use hints::{ANY_POSITION, P_MAX_SIZE, P_MIN_SIZE, P_POSITION};
use log::{debug, info, trace};
use std::collections::HashMap;
use wayland_protocols::xdg::shell::client::xdg_toplevel::ResizeEdge;
use x11rb::protocol::xproto::StackMode;

pub const WM_STATE_WITHDRAWN: u32 = 0;
pub const WM_STATE_NORMAL: u32 = 1;
pub const WM_STATE_ICONIC: u32 = 3;

pub const NET_WM_STATE_REMOVE: u32 = 0;
pub const NET_WM_STATE_ADD: u32 = 1;
pub const NET_WM_STATE_TOGGLE: u32 = 2;

pub const NET_WM_MOVERESIZE_MOVE: u32 = 8;

/// Atoms the state machine itself needs to compare against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateAtoms {
    pub fullscreen: u32,
    pub maximized_horz: u32,
    pub maximized_vert: u32,
}

#[derive(Debug, Clone)]
pub struct WmSettings {
    pub root: u32,
    pub screen: (u32, u32),
    pub root_depth: u8,
    /// Our connection's resource id base and mask; ids in that range are ours.
    pub resource_base: u32,
    pub resource_mask: u32,
    pub scale: f64,
    pub xwayland: bool,
    pub application_id: Option<String>,
    pub frame_color: u32,
    pub dark_frame_color: u32,
    pub atoms: StateAtoms,
}

/// Requests for the X server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XRequest {
    /// Select property and focus changes on a new client window.
    SelectEvents { window: u32 },
    Configure {
        window: u32,
        changes: WindowChanges,
        stack_mode: Option<StackMode>,
        sibling: Option<u32>,
    },
    /// Synthetic ConfigureNotify reporting the window's root-relative geometry.
    SendConfigureNotify {
        window: u32,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        border_width: u32,
    },
    SetWmState { window: u32, state: u32 },
    SetNetWmState { window: u32, states: Vec<u32> },
    /// `_NET_FRAME_EXTENTS` = 0,0,0,0.
    SetFrameExtents { window: u32 },
    SetNorthWestGravity { window: u32 },
    CreateFrame {
        frame: u32,
        depth: u8,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    },
    /// Reparent `window` into `parent`, or back to the root when `None`.
    Reparent {
        window: u32,
        parent: Option<u32>,
        x: i32,
        y: i32,
    },
    DestroyWindow { window: u32 },
    MapWindow { window: u32 },
    /// `WM_PROTOCOLS` / `WM_TAKE_FOCUS`.
    TakeFocus { window: u32 },
    SetInputFocus { window: Option<u32> },
    /// `WM_PROTOCOLS` / `WM_DELETE_WINDOW`.
    DeleteWindow { window: u32 },
}

/// Requests for the host shell objects of a window, keyed by X window id.
#[derive(Debug, Clone, PartialEq)]
pub enum HostRequest {
    DestroyShell { window: u32 },
    CreateToplevel { window: u32, surface_id: u32 },
    CreatePopup {
        window: u32,
        surface_id: u32,
        parent: u32,
        anchor: (i32, i32),
    },
    SetParent { window: u32, parent: Option<u32> },
    SetTitle { window: u32, title: String },
    SetAppId { window: u32, app_id: String },
    SetMinSize { window: u32, size: (i32, i32) },
    SetMaxSize { window: u32, size: (i32, i32) },
    SetMaximized { window: u32, maximized: bool },
    SetFullscreen { window: u32, fullscreen: bool },
    SetMinimized { window: u32 },
    SetDecorated {
        window: u32,
        decorated: bool,
        frame_color: u32,
    },
    Move { window: u32 },
    Resize { window: u32, edge: ResizeEdge },
    AckConfigure { window: u32, serial: u32 },
    /// Commit the guest surface's host proxy.
    Commit { surface_id: u32 },
}

/// Host toplevel states the window manager reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToplevelState {
    Maximized,
    Fullscreen,
    Resizing,
    Activated,
}

/// What the window manager needs to know about a guest surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurfaceInfo {
    pub contents: (i32, i32),
    pub has_role: bool,
    pub last_event_serial: u32,
}

/// Resolves guest surface ids.
pub trait SurfaceDirectory {
    fn surface(&self, id: u32) -> Option<SurfaceInfo>;
}

impl SurfaceDirectory for HashMap<u32, SurfaceInfo> {
    fn surface(&self, id: u32) -> Option<SurfaceInfo> {
        self.get(&id).copied()
    }
}

/// Properties read on map-request, already decoded.
#[derive(Debug, Clone, Default)]
pub struct WindowProperties {
    pub name: Option<String>,
    pub class: Option<String>,
    pub transient_for: Option<u32>,
    pub size_hints: Option<SizeHints>,
    pub client_leader: Option<u32>,
    pub motif_hints: Option<MotifHints>,
    /// `_NET_STARTUP_ID`, or the client leader's.
    pub startup_id: Option<String>,
    pub maximized: bool,
    pub dark_frame: bool,
}

/// Geometry reply for a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub border_width: u32,
    pub depth: u8,
}

/// A `ConfigureRequest` as received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigureRequest {
    pub window: u32,
    pub changes: WindowChanges,
    pub sibling: Option<u32>,
    pub stack_mode: Option<StackMode>,
}

pub struct WindowManager {
    settings: WmSettings,
    windows: Arena<Window>,
    /// Client and frame ids to their window.
    ids: HashMap<u32, Key<Window>>,
    /// Pairing order, used to break ties in parent selection.
    pair_order: HashMap<Key<Window>, u64>,
    next_pair_seq: u64,
    host_focus: Option<Key<Window>>,
    needs_set_input_focus: bool,
    x_requests: Vec<XRequest>,
    host_requests: Vec<HostRequest>,
}

fn resize_edge(direction: u32) -> Option<ResizeEdge> {
    Some(match direction {
        0 => ResizeEdge::TopLeft,
        1 => ResizeEdge::Top,
        2 => ResizeEdge::TopRight,
        3 => ResizeEdge::Right,
        4 => ResizeEdge::BottomRight,
        5 => ResizeEdge::Bottom,
        6 => ResizeEdge::BottomLeft,
        7 => ResizeEdge::Left,
        _ => return None,
    })
}

impl WindowManager {
    pub fn new(settings: WmSettings) -> Self {
        info!(
            "🪟 Window manager ready, screen {}x{}, scale {}",
            settings.screen.0, settings.screen.1, settings.scale
        );
        Self {
            settings,
            windows: Arena::new(),
            ids: HashMap::new(),
            pair_order: HashMap::new(),
            next_pair_seq: 1,
            host_focus: None,
            needs_set_input_focus: false,
            x_requests: Vec::new(),
            host_requests: Vec::new(),
        }
    }

    pub fn settings(&self) -> &WmSettings {
        &self.settings
    }

    pub fn set_scale(&mut self, scale: f64) {
        self.settings.scale = scale;
    }

    pub fn screen(&self) -> (u32, u32) {
        self.settings.screen
    }

    pub fn drain_x_requests(&mut self) -> Vec<XRequest> {
        std::mem::take(&mut self.x_requests)
    }

    pub fn drain_host_requests(&mut self) -> Vec<HostRequest> {
        std::mem::take(&mut self.host_requests)
    }

    pub fn is_ours(&self, id: u32) -> bool {
        id & !self.settings.resource_mask == self.settings.resource_base
    }

    pub fn window(&self, id: u32) -> Option<&Window> {
        self.ids.get(&id).and_then(|key| self.windows.get(*key))
    }

    pub fn windows(&self) -> impl Iterator<Item = &Window> {
        self.windows.iter().map(|(_, w)| w)
    }

    pub fn focused_window(&self) -> Option<&Window> {
        self.host_focus.and_then(|key| self.windows.get(key))
    }

    pub fn needs_set_input_focus(&self) -> bool {
        self.needs_set_input_focus
    }

    fn lookup(&self, id: u32) -> Option<Key<Window>> {
        self.ids.get(&id).copied().filter(|key| self.windows.contains(*key))
    }

    fn find_paired(&self, surface_id: u32) -> Option<Key<Window>> {
        self.windows
            .find(|w| w.paired && w.host_surface_id == surface_id && surface_id != 0)
    }

    fn clear_focus_if(&mut self, key: Key<Window>) {
        if self.host_focus == Some(key) {
            self.host_focus = None;
            self.needs_set_input_focus = true;
        }
    }

    fn send_configure_notify(&mut self, key: Key<Window>) {
        if let Some(w) = self.windows.get(key) {
            self.x_requests.push(XRequest::SendConfigureNotify {
                window: w.id,
                x: w.x,
                y: w.y,
                width: w.width,
                height: w.height,
                border_width: w.border_width,
            });
        }
    }

    // ---- X events -------------------------------------------------------

    pub fn create_notify(&mut self, id: u32, x: i32, y: i32, width: u32, height: u32, border_width: u32) {
        if self.is_ours(id) {
            return;
        }
        self.track(Window::new(id, x, y, width, height, border_width));
    }

    fn track(&mut self, window: Window) {
        let id = window.id;
        trace!("➕ Tracking window {:#x}", id);
        let key = self.windows.insert(window);
        self.ids.insert(id, key);
        self.x_requests.push(XRequest::SelectEvents { window: id });
    }

    pub fn destroy_notify(&mut self, id: u32) {
        if self.is_ours(id) {
            return;
        }
        if let Some(key) = self.lookup(id) {
            self.destroy_window(key);
        }
    }

    fn destroy_window(&mut self, key: Key<Window>) {
        let Some(window) = self.windows.remove(key) else {
            return;
        };
        debug!("➖ Forgetting window {:#x}", window.id);
        if let Some(frame) = window.frame_id {
            self.x_requests.push(XRequest::DestroyWindow { window: frame });
            self.ids.remove(&frame);
        }
        self.ids.remove(&window.id);
        self.pair_order.remove(&key);
        self.clear_focus_if(key);
        if window.shell != Shell::None {
            self.host_requests
                .push(HostRequest::DestroyShell { window: window.id });
        }
    }

    /// `geometry` is queried only for windows reparented to the root that are
    /// not tracked yet.
    pub fn reparent_notify(
        &mut self,
        id: u32,
        parent: u32,
        x: i32,
        y: i32,
        geometry: impl FnOnce() -> Option<Geometry>,
    ) {
        if parent == self.settings.root {
            // a window we unmapped coming back to the root is already tracked
            if self.lookup(id).is_some() {
                return;
            }
            let (width, height, border_width) = geometry()
                .map(|g| (g.width, g.height, g.border_width))
                .unwrap_or((1, 1, 0));
            self.track(Window::new(id, x, y, width, height, border_width));
            return;
        }
        if self.is_ours(parent) {
            return;
        }
        if let Some(key) = self.lookup(id) {
            self.destroy_window(key);
        }
    }

    /// Take over a window that wants to be mapped: frame it, center it and map it.
    ///
    /// `geometry` is used only when the window has no frame yet. `new_frame`
    /// is called at most once, for the id of a frame to create.
    pub fn map_request(
        &mut self,
        id: u32,
        props: WindowProperties,
        geometry: Option<Geometry>,
        new_frame: impl FnOnce() -> u32,
    ) {
        let Some(key) = self.lookup(id) else {
            return;
        };
        let screen = self.settings.screen;
        let root_depth = self.settings.root_depth;
        let Some(w) = self.windows.get_mut(key) else {
            return;
        };

        w.managed = true;
        if w.frame_id.is_none() {
            if let Some(g) = geometry {
                w.x = g.x;
                w.y = g.y;
                w.width = g.width;
                w.height = g.height;
                w.depth = g.depth;
            }
        }

        w.name = props.name;
        w.class = props.class;
        w.startup_id = props.startup_id;
        w.transient_for = props.transient_for.filter(|t| *t != 0);
        w.client_leader = props.client_leader.filter(|l| *l != 0);
        w.decorated = true;
        w.size_flags = 0;
        w.dark_frame = props.dark_frame;
        w.maximized = props.maximized;

        if let Some(decorated) = props.motif_hints.and_then(|m| m.decorated()) {
            w.decorated = decorated;
        }

        let size_hints = props.size_hints.unwrap_or_default();
        // user/program position is honoured for transients only
        if w.transient_for.is_some() {
            w.size_flags |= size_hints.flags & ANY_POSITION;
        }
        w.size_flags |= size_hints.flags & (P_MIN_SIZE | P_MAX_SIZE);
        if w.size_flags & P_MIN_SIZE != 0 {
            w.min_size = (size_hints.min_width, size_hints.min_height);
        }
        if w.size_flags & P_MAX_SIZE != 0 {
            w.max_size = (size_hints.max_width, size_hints.max_height);
        }

        w.border_width = 0;
        w.clamp_to_screen(screen);
        if !w.is_positioned() {
            w.center_on_screen(screen);
        }

        info!(
            "🗺️ Mapping window {:#x} at {},{} {}x{}",
            w.id, w.x, w.y, w.width, w.height
        );

        let (window_id, x, y, width, height) = (w.id, w.x, w.y, w.width, w.height);
        let depth = if w.depth != 0 { w.depth } else { root_depth };
        let existing_frame = w.frame_id;

        self.x_requests.push(XRequest::Configure {
            window: window_id,
            changes: WindowChanges {
                width: Some(width),
                height: Some(height),
                border_width: Some(0),
                ..Default::default()
            },
            stack_mode: None,
            sibling: None,
        });
        self.x_requests.push(XRequest::SetFrameExtents { window: window_id });
        self.x_requests.push(XRequest::SetNorthWestGravity { window: window_id });

        let frame = match existing_frame {
            Some(frame) => {
                self.x_requests.push(XRequest::Configure {
                    window: frame,
                    changes: WindowChanges {
                        x: Some(x),
                        y: Some(y),
                        width: Some(width),
                        height: Some(height),
                        border_width: None,
                    },
                    stack_mode: Some(StackMode::BELOW),
                    sibling: None,
                });
                frame
            }
            None => {
                let frame = new_frame();
                self.x_requests.push(XRequest::CreateFrame {
                    frame,
                    depth,
                    x,
                    y,
                    width,
                    height,
                });
                self.x_requests.push(XRequest::Configure {
                    window: frame,
                    changes: WindowChanges::default(),
                    stack_mode: Some(StackMode::BELOW),
                    sibling: None,
                });
                self.x_requests.push(XRequest::Reparent {
                    window: window_id,
                    parent: Some(frame),
                    x: 0,
                    y: 0,
                });
                if let Some(w) = self.windows.get_mut(key) {
                    w.frame_id = Some(frame);
                }
                self.ids.insert(frame, key);
                frame
            }
        };

        self.x_requests.push(XRequest::SetWmState {
            window: window_id,
            state: WM_STATE_NORMAL,
        });
        self.send_configure_notify(key);
        self.x_requests.push(XRequest::MapWindow { window: window_id });
        self.x_requests.push(XRequest::MapWindow { window: frame });
    }

    /// `synthetic` is set for events carrying the SendEvent bit.
    pub fn unmap_notify<D: SurfaceDirectory + ?Sized>(&mut self, id: u32, synthetic: bool, dir: &D) {
        if self.is_ours(id) || synthetic {
            return;
        }
        let Some(key) = self.lookup(id) else {
            return;
        };
        self.clear_focus_if(key);

        let had_surface = self
            .windows
            .get_mut(key)
            .map(|w| std::mem::replace(&mut w.host_surface_id, 0) != 0)
            .unwrap_or(false);
        if had_surface {
            // a cleared surface id cannot hit the role check
            let _ = self.window_update(key, dir);
        }

        let Some(w) = self.windows.get_mut(key) else {
            return;
        };
        debug!("🙈 Unmapping window {:#x}", w.id);
        let (window_id, x, y) = (w.id, w.x, w.y);
        let frame = w.frame_id.take();
        w.managed = false;
        w.decorated = false;
        w.size_flags = P_POSITION;

        self.x_requests.push(XRequest::SetWmState {
            window: window_id,
            state: WM_STATE_WITHDRAWN,
        });
        if let Some(frame) = frame {
            self.x_requests.push(XRequest::Reparent {
                window: window_id,
                parent: None,
                x,
                y,
            });
            self.x_requests.push(XRequest::DestroyWindow { window: frame });
            self.ids.remove(&frame);
        }
    }

    pub fn configure_request<D: SurfaceDirectory + ?Sized>(
        &mut self,
        request: ConfigureRequest,
        dir: &D,
    ) -> BridgeResult<()> {
        let Some(key) = self.lookup(request.window) else {
            return Ok(());
        };
        let screen = self.settings.screen;
        let Some(w) = self.windows.get_mut(key) else {
            return Ok(());
        };

        if !w.managed {
            self.x_requests.push(XRequest::Configure {
                window: w.id,
                changes: request.changes,
                stack_mode: request.stack_mode,
                sibling: request.sibling,
            });
            return Ok(());
        }

        // Satisfying the request means matching content may never arrive,
        // so whatever the host sent is acked now.
        if w.shell == Shell::Toplevel {
            for config in [&mut w.pending, &mut w.next] {
                if config.serial != 0 {
                    self.host_requests.push(HostRequest::AckConfigure {
                        window: w.id,
                        serial: config.serial,
                    });
                    config.reset();
                }
            }
        }

        let (old_width, old_height) = (w.width, w.height);
        if let Some(x) = request.changes.x {
            w.x = x;
        }
        if let Some(y) = request.changes.y {
            w.y = y;
        }
        if w.allow_resize {
            if let Some(width) = request.changes.width {
                w.width = width;
            }
            if let Some(height) = request.changes.height {
                w.height = height;
            }
        }

        w.clamp_to_screen(screen);
        if w.is_positioned() {
            self.window_update(key, dir)?;
        } else if let Some(w) = self.windows.get_mut(key) {
            w.center_on_screen(screen);
        }

        let Some(w) = self.windows.get_mut(key) else {
            return Ok(());
        };
        if let Some(frame) = w.frame_id {
            self.x_requests.push(XRequest::Configure {
                window: frame,
                changes: WindowChanges {
                    x: Some(w.x),
                    y: Some(w.y),
                    width: Some(w.width),
                    height: Some(w.height),
                    border_width: None,
                },
                stack_mode: None,
                sibling: None,
            });
        }

        // X clients expect a ConfigureNotify either way; a real one comes
        // only when the size or border actually changes.
        if w.width != old_width || w.height != old_height || w.border_width != 0 {
            self.x_requests.push(XRequest::Configure {
                window: w.id,
                changes: WindowChanges {
                    width: Some(w.width),
                    height: Some(w.height),
                    border_width: Some(0),
                    ..Default::default()
                },
                stack_mode: None,
                sibling: None,
            });
            w.border_width = 0;
        } else {
            self.send_configure_notify(key);
        }
        Ok(())
    }

    /// The root window changed size: re-center every unpositioned window.
    pub fn root_resized(&mut self, width: u32, height: u32) {
        if (width, height) == self.settings.screen {
            return;
        }
        info!("🖥️ Screen resized to {}x{}", width, height);
        self.settings.screen = (width, height);
        for key in self.windows.keys() {
            let Some(w) = self.windows.get_mut(key) else {
                continue;
            };
            if !w.paired || w.is_positioned() {
                continue;
            }
            let (x, y) = (w.x, w.y);
            w.center_on_screen((width, height));
            if (w.x, w.y) == (x, y) {
                continue;
            }
            if let Some(frame) = w.frame_id {
                self.x_requests.push(XRequest::Configure {
                    window: frame,
                    changes: WindowChanges {
                        x: Some(w.x),
                        y: Some(w.y),
                        ..Default::default()
                    },
                    stack_mode: None,
                    sibling: None,
                });
            }
            self.send_configure_notify(key);
        }
    }

    /// ConfigureNotify for a client window. Only unmanaged windows are
    /// mirrored; managed ones are driven by the host.
    pub fn configure_notify<D: SurfaceDirectory + ?Sized>(
        &mut self,
        id: u32,
        geometry: Geometry,
        dir: &D,
    ) -> BridgeResult<()> {
        if self.is_ours(id) {
            return Ok(());
        }
        let Some(key) = self.lookup(id) else {
            return Ok(());
        };
        let Some(w) = self.windows.get_mut(key) else {
            return Ok(());
        };
        if w.managed {
            return Ok(());
        }
        w.width = geometry.width;
        w.height = geometry.height;
        w.border_width = geometry.border_width;
        if (geometry.x, geometry.y) != (w.x, w.y) {
            w.x = geometry.x;
            w.y = geometry.y;
            self.window_update(key, dir)?;
        }
        Ok(())
    }

    // ---- client messages ------------------------------------------------

    /// `WL_SURFACE_ID`: Xwayland names the guest surface backing `id`.
    pub fn surface_id_message<D: SurfaceDirectory + ?Sized>(
        &mut self,
        id: u32,
        surface_id: u32,
        dir: &D,
    ) -> BridgeResult<()> {
        let Some(key) = self.lookup(id) else {
            return Ok(());
        };
        let Some(w) = self.windows.get_mut(key) else {
            return Ok(());
        };
        if w.paired {
            return Ok(());
        }
        debug!("🔗 Window {:#x} names surface {}", w.id, surface_id);
        w.host_surface_id = surface_id;
        self.window_update(key, dir)
    }

    pub fn moveresize_message(&mut self, id: u32, direction: u32) {
        let Some(w) = self.window(id) else {
            return;
        };
        if w.shell != Shell::Toplevel {
            return;
        }
        let window = w.id;
        if direction == NET_WM_MOVERESIZE_MOVE {
            self.host_requests.push(HostRequest::Move { window });
        } else if let Some(edge) = resize_edge(direction) {
            self.host_requests.push(HostRequest::Resize { window, edge });
        }
    }

    pub fn net_wm_state_message(&mut self, id: u32, action: u32, first: u32, second: u32) {
        let Some(w) = self.window(id) else {
            return;
        };
        if w.shell != Shell::Toplevel {
            return;
        }
        let window = w.id;
        let atoms = self.settings.atoms;
        let changed = |atom: u32| first == atom || second == atom;
        let set = match action {
            NET_WM_STATE_ADD => Some(true),
            NET_WM_STATE_REMOVE => Some(false),
            _ => None,
        };
        let Some(set) = set else {
            trace!("Ignoring _NET_WM_STATE action {}", action);
            return;
        };
        if changed(atoms.fullscreen) {
            self.host_requests.push(HostRequest::SetFullscreen {
                window,
                fullscreen: set,
            });
        }
        if changed(atoms.maximized_vert) && changed(atoms.maximized_horz) {
            self.host_requests.push(HostRequest::SetMaximized {
                window,
                maximized: set,
            });
        }
    }

    pub fn change_state_message(&mut self, id: u32, state: u32) {
        if state != WM_STATE_ICONIC {
            return;
        }
        if let Some(w) = self.window(id).filter(|w| w.shell == Shell::Toplevel) {
            let window = w.id;
            self.host_requests.push(HostRequest::SetMinimized { window });
        }
    }

    /// FocusIn: re-assert the transient parent, which may have been realized
    /// after the window itself.
    pub fn focus_in(&mut self, id: u32) {
        let Some(w) = self.window(id) else {
            return;
        };
        let Some(parent) = w.transient_for.and_then(|t| self.window(t)) else {
            return;
        };
        if parent.shell == Shell::Toplevel && w.shell == Shell::Toplevel {
            let request = HostRequest::SetParent {
                window: w.id,
                parent: Some(parent.id),
            };
            self.host_requests.push(request);
        }
    }

    // ---- property changes -----------------------------------------------

    pub fn title_changed(&mut self, id: u32, title: Option<String>) {
        let Some(key) = self.lookup(id) else {
            return;
        };
        let Some(w) = self.windows.get_mut(key) else {
            return;
        };
        w.name = title;
        if w.shell == Shell::Toplevel {
            self.host_requests.push(HostRequest::SetTitle {
                window: w.id,
                title: w.name.clone().unwrap_or_default(),
            });
        }
    }

    pub fn normal_hints_changed(&mut self, id: u32, hints: Option<SizeHints>) {
        let scale = self.settings.scale;
        let Some(key) = self.lookup(id) else {
            return;
        };
        let Some(w) = self.windows.get_mut(key) else {
            return;
        };
        w.size_flags &= !(P_MIN_SIZE | P_MAX_SIZE);
        if let Some(hints) = hints {
            w.size_flags |= hints.flags & (P_MIN_SIZE | P_MAX_SIZE);
            if w.size_flags & P_MIN_SIZE != 0 {
                w.min_size = (hints.min_width, hints.min_height);
            }
            if w.size_flags & P_MAX_SIZE != 0 {
                w.max_size = (hints.max_width, hints.max_height);
            }
        }
        if w.shell != Shell::Toplevel {
            return;
        }
        let to_host = |(width, height): (i32, i32)| {
            ((width as f64 / scale) as i32, (height as f64 / scale) as i32)
        };
        let window = w.id;
        let min = w.min_size().map(to_host).unwrap_or((0, 0));
        let max = w.max_size().map(to_host).unwrap_or((0, 0));
        self.host_requests.push(HostRequest::SetMinSize { window, size: min });
        self.host_requests.push(HostRequest::SetMaxSize { window, size: max });
    }

    pub fn motif_hints_changed(&mut self, id: u32, hints: Option<MotifHints>) {
        let Some(key) = self.lookup(id) else {
            return;
        };
        let Some(w) = self.windows.get_mut(key) else {
            return;
        };
        // managed windows are decorated unless told otherwise
        w.decorated = hints
            .and_then(|h| h.decorated())
            .unwrap_or(w.managed);
        if w.shell == Shell::Toplevel {
            let request = self.decoration_request(key);
            self.host_requests.extend(request);
        }
    }

    pub fn theme_changed(&mut self, id: u32, dark: bool) {
        let Some(key) = self.lookup(id) else {
            return;
        };
        let Some(w) = self.windows.get_mut(key) else {
            return;
        };
        w.dark_frame = dark;
        if w.shell == Shell::Toplevel {
            let request = self.decoration_request(key);
            self.host_requests.extend(request);
        }
    }

    fn decoration_request(&self, key: Key<Window>) -> Option<HostRequest> {
        let w = self.windows.get(key)?;
        Some(HostRequest::SetDecorated {
            window: w.id,
            decorated: w.decorated,
            frame_color: if w.dark_frame {
                self.settings.dark_frame_color
            } else {
                self.settings.frame_color
            },
        })
    }

    // ---- guest surface lifecycle ----------------------------------------

    /// A guest surface was created; pair any window that was waiting for it.
    pub fn surface_created<D: SurfaceDirectory + ?Sized>(&mut self, surface_id: u32, dir: &D) -> BridgeResult<()> {
        match self
            .windows
            .find(|w| !w.paired && w.host_surface_id == surface_id)
        {
            Some(key) => self.window_update(key, dir),
            None => Ok(()),
        }
    }

    pub fn surface_destroyed<D: SurfaceDirectory + ?Sized>(&mut self, surface_id: u32, dir: &D) {
        if let Some(key) = self.find_paired(surface_id) {
            if let Some(w) = self.windows.get_mut(key) {
                w.host_surface_id = 0;
            }
            let _ = self.window_update(key, dir);
        }
    }

    /// A buffer was attached to the guest surface: ack every configure the
    /// content now satisfies.
    pub fn surface_attached<D: SurfaceDirectory + ?Sized>(&mut self, surface_id: u32, dir: &D) {
        if let Some(key) = self.find_paired(surface_id) {
            while self.process_pending_configure_acks(key, dir) {}
        }
    }

    /// The guest committed a role-less surface. Returns whether the host
    /// surface may be committed now.
    pub fn surface_committed(&mut self, surface_id: u32, has_contents: bool) -> bool {
        let Some(key) = self.find_paired(surface_id) else {
            return false;
        };
        match self.windows.get_mut(key) {
            Some(w) if w.shell != Shell::None => {
                if has_contents {
                    w.realized = true;
                }
                true
            }
            _ => false,
        }
    }

    /// Bring the host shell objects of a window in line with its pairing.
    pub fn window_update<D: SurfaceDirectory + ?Sized>(&mut self, key: Key<Window>, dir: &D) -> BridgeResult<()> {
        let Some(w) = self.windows.get_mut(key) else {
            return Ok(());
        };

        let surface = match w.host_surface_id {
            0 => None,
            id => dir.surface(id),
        };
        if w.host_surface_id != 0 {
            if surface.is_some() && !w.paired {
                w.paired = true;
                self.pair_order.insert(key, self.next_pair_seq);
                self.next_pair_seq += 1;
            }
        } else if w.paired {
            w.paired = false;
            self.pair_order.remove(&key);
        }

        let Some(surface) = surface else {
            if w.shell != Shell::None {
                debug!("🧹 Dropping shell objects of window {:#x}", w.id);
                self.host_requests.push(HostRequest::DestroyShell { window: w.id });
                w.shell = Shell::None;
            }
            w.realized = false;
            return Ok(());
        };

        if surface.has_role {
            return Err(BridgeError::protocol(
                format!("wl_surface@{}", w.host_surface_id),
                "surface already has a role",
            ));
        }

        let parent = self.select_parent(key, dir);
        let scale = self.settings.scale;
        let xwayland = self.settings.xwayland;
        let Some(w) = self.windows.get(key) else {
            return Ok(());
        };
        let (window, surface_id, shell) = (w.id, w.host_surface_id, w.shell);
        let mut requests = Vec::new();

        if xwayland || parent.is_none() {
            if shell == Shell::None {
                requests.push(HostRequest::CreateToplevel { window, surface_id });
            }
            if shell != Shell::Popup {
                let parent = parent
                    .and_then(|p| self.windows.get(p))
                    .filter(|p| p.shell == Shell::Toplevel)
                    .map(|p| p.id);
                if parent.is_some() {
                    requests.push(HostRequest::SetParent { window, parent });
                }
                if let Some(title) = &w.name {
                    requests.push(HostRequest::SetTitle {
                        window,
                        title: title.clone(),
                    });
                }
                if let Some(app_id) = w.app_id(self.settings.application_id.as_deref(), xwayland) {
                    requests.push(HostRequest::SetAppId { window, app_id });
                }
                let to_host = |(width, height): (i32, i32)| {
                    ((width as f64 / scale) as i32, (height as f64 / scale) as i32)
                };
                if let Some(size) = w.min_size() {
                    requests.push(HostRequest::SetMinSize {
                        window,
                        size: to_host(size),
                    });
                }
                if let Some(size) = w.max_size() {
                    requests.push(HostRequest::SetMaxSize {
                        window,
                        size: to_host(size),
                    });
                }
                if w.maximized {
                    requests.push(HostRequest::SetMaximized {
                        window,
                        maximized: true,
                    });
                }
                requests.extend(self.decoration_request(key));
            }
        } else if shell == Shell::None {
            if let Some(p) = parent.and_then(|p| self.windows.get(p)) {
                requests.push(HostRequest::CreatePopup {
                    window,
                    surface_id,
                    parent: p.id,
                    anchor: (
                        ((w.x - p.x) as f64 / scale) as i32,
                        ((w.y - p.y) as f64 / scale) as i32,
                    ),
                });
            }
        }
        requests.push(HostRequest::Commit { surface_id });

        let new_shell = match requests.first() {
            Some(HostRequest::CreateToplevel { .. }) => Shell::Toplevel,
            Some(HostRequest::CreatePopup { .. }) => Shell::Popup,
            _ => shell,
        };
        if new_shell != shell {
            debug!("🪟 Window {:#x} realized as {:?}", window, new_shell);
        }
        self.host_requests.extend(requests);

        if let Some(w) = self.windows.get_mut(key) {
            w.shell = new_shell;
            if surface.contents.0 != 0 && surface.contents.1 != 0 {
                w.realized = true;
            }
        }
        Ok(())
    }

    /// The transient-for target when it has a toplevel; otherwise the
    /// realized window that saw the last input event, never the window itself.
    fn select_parent<D: SurfaceDirectory + ?Sized>(&self, key: Key<Window>, dir: &D) -> Option<Key<Window>> {
        let w = self.windows.get(key)?;
        let mut parent = None;
        if w.managed {
            if let Some(transient_for) = w.transient_for {
                parent = self
                    .windows
                    .find(|s| s.paired && s.id == transient_for)
                    .filter(|p| self.windows.get(*p).map_or(false, |s| s.shell == Shell::Toplevel));
            }
        }
        if !w.managed || (parent.is_none() && w.transient_for.is_some()) {
            parent = self
                .windows
                .iter()
                .filter(|(_, s)| s.paired && s.realized && s.host_surface_id != w.host_surface_id)
                .filter_map(|(k, s)| {
                    let serial = dir.surface(s.host_surface_id)?.last_event_serial;
                    let order = self.pair_order.get(&k).copied().unwrap_or(0);
                    Some((k, serial, order))
                })
                // highest serial; on ties the window paired first
                .max_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)))
                .map(|(k, _, _)| k);
        }
        parent
    }

    // ---- host shell events ----------------------------------------------

    /// `xdg_toplevel.configure`.
    pub fn toplevel_configure(&mut self, id: u32, width: i32, height: i32, states: &[ToplevelState]) {
        let Some(key) = self.lookup(id) else {
            return;
        };
        let scale = self.settings.scale;
        let screen = self.settings.screen;
        let atoms = self.settings.atoms;
        let Some(w) = self.windows.get_mut(key) else {
            return;
        };
        if !w.managed {
            return;
        }

        if width != 0 && height != 0 {
            let width_px = (width as f64 * scale) as i32;
            let height_px = (height as f64 * scale) as i32;
            let mut changes = WindowChanges {
                width: Some(width_px.max(0) as u32),
                height: Some(height_px.max(0) as u32),
                border_width: Some(0),
                ..Default::default()
            };
            if w.size_flags & ANY_POSITION == 0 {
                changes.x = Some((screen.0 / 2) as i32 - width_px / 2);
                changes.y = Some((screen.1 / 2) as i32 - height_px / 2);
            }
            w.next.changes = changes;
        }

        w.allow_resize = true;
        w.next.states.clear();
        let mut activated = false;
        for state in states {
            match state {
                ToplevelState::Fullscreen => {
                    w.allow_resize = false;
                    w.next.states.push(atoms.fullscreen);
                }
                ToplevelState::Maximized => {
                    w.allow_resize = false;
                    w.next.states.push(atoms.maximized_vert);
                    w.next.states.push(atoms.maximized_horz);
                }
                ToplevelState::Resizing => w.allow_resize = false,
                ToplevelState::Activated => activated = true,
            }
        }

        if activated != w.activated {
            w.activated = activated;
            if activated != (self.host_focus == Some(key)) {
                self.host_focus = activated.then_some(key);
                self.needs_set_input_focus = true;
            }
        }
    }

    /// `xdg_surface.configure`.
    pub fn xdg_surface_configure<D: SurfaceDirectory + ?Sized>(&mut self, id: u32, serial: u32, dir: &D) {
        let Some(key) = self.lookup(id) else {
            return;
        };
        let Some(w) = self.windows.get_mut(key) else {
            return;
        };
        w.next.serial = serial;
        if w.pending.serial != 0 {
            return;
        }
        let surface_id = w.host_surface_id;
        self.configure_window(key);
        if self.process_pending_configure_acks(key, dir) && dir.surface(surface_id).is_some() {
            self.host_requests.push(HostRequest::Commit { surface_id });
        }
    }

    pub fn toplevel_close(&mut self, id: u32) {
        if let Some(w) = self.window(id) {
            let window = w.id;
            self.x_requests.push(XRequest::DeleteWindow { window });
        }
    }

    /// Apply `next` to the X window and move it to `pending`.
    fn configure_window(&mut self, key: Key<Window>) {
        let Some(w) = self.windows.get_mut(key) else {
            return;
        };
        if w.pending.serial != 0 {
            return;
        }

        let changes = w.next.changes;
        if !changes.is_empty() {
            if let Some(frame) = w.frame_id {
                self.x_requests.push(XRequest::Configure {
                    window: frame,
                    changes,
                    stack_mode: None,
                    sibling: None,
                });
            }
            let (x, y) = (changes.x.unwrap_or(w.x), changes.y.unwrap_or(w.y));
            w.width = changes.width.unwrap_or(w.width);
            w.height = changes.height.unwrap_or(w.height);
            w.border_width = changes.border_width.unwrap_or(w.border_width);
            self.x_requests.push(XRequest::Configure {
                window: w.id,
                changes: WindowChanges {
                    x: Some(0),
                    y: Some(0),
                    width: Some(w.width),
                    height: Some(w.height),
                    border_width: Some(w.border_width),
                },
                stack_mode: None,
                sibling: None,
            });
            if (x, y) != (w.x, w.y) {
                w.x = x;
                w.y = y;
                self.send_configure_notify(key);
            }
        }

        let Some(w) = self.windows.get_mut(key) else {
            return;
        };
        if w.managed {
            self.x_requests.push(XRequest::SetNetWmState {
                window: w.id,
                states: w.next.states.clone(),
            });
        }
        w.pending = std::mem::take(&mut w.next);
    }

    /// Ack `pending` once the guest content matches it. Returns whether an
    /// ack happened.
    fn process_pending_configure_acks<D: SurfaceDirectory + ?Sized>(&mut self, key: Key<Window>, dir: &D) -> bool {
        let Some(w) = self.windows.get_mut(key) else {
            return false;
        };
        if w.pending.serial == 0 {
            return false;
        }
        if w.managed {
            if let Some(surface) = dir.surface(w.host_surface_id) {
                if surface.contents != w.framed_size() {
                    return false;
                }
            }
        }
        if w.shell != Shell::None {
            trace!("✅ Acking configure {} for {:#x}", w.pending.serial, w.id);
            self.host_requests.push(HostRequest::AckConfigure {
                window: w.id,
                serial: w.pending.serial,
            });
        }
        w.pending.serial = 0;
        if w.next.serial != 0 {
            self.configure_window(key);
        }
        true
    }

    // ---- focus ----------------------------------------------------------

    /// Apply a focus change recorded by host activation. Called once per
    /// loop iteration before flushing the X connection.
    pub fn apply_input_focus(&mut self) {
        if !std::mem::take(&mut self.needs_set_input_focus) {
            return;
        }
        match self.host_focus.and_then(|key| self.windows.get(key)) {
            Some(w) if !w.managed => {}
            Some(w) => {
                let window = w.id;
                self.x_requests.push(XRequest::TakeFocus { window });
                self.x_requests.push(XRequest::SetInputFocus {
                    window: Some(window),
                });
            }
            None => self.x_requests.push(XRequest::SetInputFocus { window: None }),
        }
    }

    /// Raise the frame of the window showing `surface_id`, lower the rest.
    pub fn restack(&mut self, surface_id: u32) {
        let requests: Vec<_> = self
            .windows
            .iter()
            .filter(|(_, w)| w.paired && w.managed)
            .filter_map(|(_, w)| {
                let frame = w.frame_id?;
                let stack_mode = if w.host_surface_id == surface_id {
                    StackMode::ABOVE
                } else {
                    StackMode::BELOW
                };
                Some(XRequest::Configure {
                    window: frame,
                    changes: WindowChanges::default(),
                    stack_mode: Some(stack_mode),
                    sibling: None,
                })
            })
            .collect();
        self.x_requests.extend(requests);
    }
}
