//! The window manager's X connection
//!
//! Owns the x11rb connection to Xwayland, performs the [`XRequest`]s queued
//! by [`WindowManager`] and feeds X events back into it and into the
//! [`SelectionBridge`].

use super::atoms::Atoms;
use super::hints::{self, MotifHints, SizeHints};
use super::{
    ConfigureRequest, Geometry, SurfaceDirectory, WindowChanges, WindowManager, WindowProperties,
    WmSettings, XRequest,
};
use crate::error::{BridgeError, BridgeResult};
use crate::selection::{SelectionAction, SelectionBridge, SelectionRequest};
use anyhow::{bail, Context, Result};
use log::{debug, info, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use x11rb::connection::{Connection, RequestConnection};
use x11rb::errors::{ConnectionError, ReplyError, ReplyOrIdError};
use x11rb::protocol::composite::{self, ConnectionExt as _, Redirect};
use x11rb::protocol::xfixes::{self, ConnectionExt as _, SelectionEventMask};
use x11rb::protocol::xproto::{
    AtomEnum, ChangeWindowAttributesAux, ClientMessageEvent, ColormapAlloc, ConfigWindow,
    ConfigureNotifyEvent, ConfigureWindowAux, ConnectionExt as _, CreateWindowAux, EventMask,
    GetPropertyReply, Gravity, InputFocus, PropMode, Property, SelectionNotifyEvent, WindowClass,
    CONFIGURE_NOTIFY_EVENT, SELECTION_NOTIFY_EVENT,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::{DefaultStream, RustConnection};
use x11rb::wrapper::ConnectionExt as _;
use x11rb::{CURRENT_TIME, NONE};

const WM_NAME: &str = "crossway";
const SEND_EVENT_BIT: u8 = 0x80;
const MAX_PROPERTY_WORDS: u32 = 0x1fff_ffff;
const TEXT_PROPERTY_WORDS: u32 = 2048;

impl From<ConnectionError> for BridgeError {
    fn from(err: ConnectionError) -> Self {
        BridgeError::XConnectionLost(err.to_string())
    }
}

impl From<ReplyOrIdError> for BridgeError {
    fn from(err: ReplyOrIdError) -> Self {
        BridgeError::XConnectionLost(err.to_string())
    }
}

/// A reply whose X error means "absent"; only connection failures propagate.
fn optional<T>(result: std::result::Result<T, ReplyError>) -> BridgeResult<Option<T>> {
    match result {
        Ok(reply) => Ok(Some(reply)),
        Err(ReplyError::X11Error(err)) => {
            trace!("X error reply: {:?}", err.error_kind);
            Ok(None)
        }
        Err(ReplyError::ConnectionError(err)) => Err(err.into()),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    pub clipboard_manager: bool,
}

pub struct XConnection {
    conn: RustConnection,
    root: u32,
    root_depth: u8,
    screen_size: (u32, u32),
    atoms: Atoms,
    wm_window: u32,
    selection_window: Option<u32>,
    /// Visual and colormap for every depth the screen allows.
    visuals: HashMap<u8, (u32, u32)>,
}

impl XConnection {
    /// Take over the `-wm` socket handed to Xwayland and become its window
    /// manager.
    pub fn connect(stream: UnixStream, options: ConnectOptions) -> Result<Self> {
        let (stream, _) = DefaultStream::from_unix_stream(stream)
            .context("Failed to wrap the window manager socket")?;
        let conn = RustConnection::connect_to_stream(stream, 0)
            .context("Failed to connect to Xwayland")?;
        Self::setup(conn, options)
    }

    fn setup(conn: RustConnection, options: ConnectOptions) -> Result<Self> {
        let atoms = Atoms::new(&conn)?.reply().context("Failed to intern atoms")?;
        let screen = conn.setup().roots[0].clone();
        let root = screen.root;

        conn.change_window_attributes(
            root,
            &ChangeWindowAttributesAux::new().event_mask(
                EventMask::STRUCTURE_NOTIFY
                    | EventMask::SUBSTRUCTURE_NOTIFY
                    | EventMask::SUBSTRUCTURE_REDIRECT,
            ),
        )?
        .check()
        .context("Another window manager is running")?;

        if conn
            .extension_information(xfixes::X11_EXTENSION_NAME)?
            .is_none()
        {
            bail!("XFixes extension not available");
        }
        let xfixes_version = conn.xfixes_query_version(5, 0)?.reply()?;
        if xfixes_version.major_version < 5 {
            bail!(
                "XFixes {}.{} is too old, 5.0 required",
                xfixes_version.major_version,
                xfixes_version.minor_version
            );
        }
        if conn
            .extension_information(composite::X11_EXTENSION_NAME)?
            .is_none()
        {
            bail!("Composite extension not available");
        }
        conn.composite_redirect_subwindows(root, Redirect::MANUAL)?
            .check()
            .context("Failed to redirect subwindows")?;

        let wm_window = conn.generate_id()?;
        conn.create_window(
            0,
            wm_window,
            root,
            0,
            0,
            1,
            1,
            0,
            WindowClass::INPUT_ONLY,
            x11rb::COPY_FROM_PARENT,
            &CreateWindowAux::new(),
        )?;

        let mut visuals = HashMap::new();
        for depth in &screen.allowed_depths {
            let Some(visual) = depth.visuals.first() else {
                continue;
            };
            if depth.depth == screen.root_depth {
                visuals.insert(depth.depth, (screen.root_visual, screen.default_colormap));
                continue;
            }
            let colormap = conn.generate_id()?;
            conn.create_colormap(ColormapAlloc::NONE, colormap, root, visual.visual_id)?;
            visuals.insert(depth.depth, (visual.visual_id, colormap));
        }
        if !visuals.contains_key(&screen.root_depth) {
            bail!("Root depth {} has no visual", screen.root_depth);
        }

        let selection_window = if options.clipboard_manager {
            let window = conn.generate_id()?;
            conn.create_window(
                x11rb::COPY_DEPTH_FROM_PARENT,
                window,
                root,
                0,
                0,
                1,
                1,
                0,
                WindowClass::INPUT_OUTPUT,
                screen.root_visual,
                &CreateWindowAux::new().event_mask(EventMask::PROPERTY_CHANGE),
            )?;
            conn.set_selection_owner(window, atoms.CLIPBOARD_MANAGER, CURRENT_TIME)?;
            conn.xfixes_select_selection_input(
                window,
                atoms.CLIPBOARD,
                SelectionEventMask::SET_SELECTION_OWNER
                    | SelectionEventMask::SELECTION_WINDOW_DESTROY
                    | SelectionEventMask::SELECTION_CLIENT_CLOSE,
            )?;
            Some(window)
        } else {
            None
        };

        for window in [wm_window, root] {
            conn.change_property32(
                PropMode::REPLACE,
                window,
                atoms._NET_SUPPORTING_WM_CHECK,
                AtomEnum::WINDOW,
                &[wm_window],
            )?;
        }
        conn.change_property8(
            PropMode::REPLACE,
            wm_window,
            atoms._NET_WM_NAME,
            atoms.UTF8_STRING,
            WM_NAME.as_bytes(),
        )?;
        conn.set_selection_owner(wm_window, atoms.WM_S0, CURRENT_TIME)?;
        conn.set_input_focus(InputFocus::NONE, NONE, CURRENT_TIME)?;
        conn.flush()?;

        info!(
            "🪟 Window manager connected: root {:#x}, {}x{}, depth {}",
            root, screen.width_in_pixels, screen.height_in_pixels, screen.root_depth
        );

        Ok(Self {
            conn,
            root,
            root_depth: screen.root_depth,
            screen_size: (
                screen.width_in_pixels as u32,
                screen.height_in_pixels as u32,
            ),
            atoms,
            wm_window,
            selection_window,
            visuals,
        })
    }

    pub fn atoms(&self) -> &Atoms {
        &self.atoms
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    pub fn wm_window(&self) -> u32 {
        self.wm_window
    }

    pub fn selection_window(&self) -> Option<u32> {
        self.selection_window
    }

    /// Settings for a [`WindowManager`] driving this connection.
    pub fn wm_settings(
        &self,
        scale: f64,
        xwayland: bool,
        application_id: Option<String>,
        frame_color: u32,
        dark_frame_color: u32,
    ) -> WmSettings {
        let setup = self.conn.setup();
        WmSettings {
            root: self.root,
            screen: self.screen_size,
            root_depth: self.root_depth,
            resource_base: setup.resource_id_base,
            resource_mask: setup.resource_id_mask,
            scale,
            xwayland,
            application_id,
            frame_color,
            dark_frame_color,
            atoms: self.atoms.state_atoms(),
        }
    }

    pub fn flush(&self) -> BridgeResult<()> {
        self.conn.flush()?;
        Ok(())
    }

    /// Round trip to the server: everything sent before has been processed
    /// once this returns.
    pub fn sync(&self) -> BridgeResult<()> {
        self.conn
            .get_input_focus()?
            .reply()
            .map_err(|err| BridgeError::XConnectionLost(err.to_string()))?;
        Ok(())
    }

    pub fn poll_for_event(&self) -> BridgeResult<Option<Event>> {
        Ok(self.conn.poll_for_event()?)
    }

    pub fn intern_atom(&self, name: &str) -> BridgeResult<u32> {
        Ok(self
            .conn
            .intern_atom(false, name.as_bytes())?
            .reply()
            .map_err(|err| BridgeError::XConnectionLost(err.to_string()))?
            .atom)
    }

    fn new_id(&self) -> BridgeResult<u32> {
        Ok(self.conn.generate_id()?)
    }

    // ---- requests -------------------------------------------------------

    pub fn execute(&self, requests: Vec<XRequest>) -> BridgeResult<()> {
        for request in requests {
            self.execute_one(request)?;
        }
        Ok(())
    }

    fn execute_one(&self, request: XRequest) -> BridgeResult<()> {
        let atoms = &self.atoms;
        match request {
            XRequest::SelectEvents { window } => {
                self.conn.change_window_attributes(
                    window,
                    &ChangeWindowAttributesAux::new()
                        .event_mask(EventMask::PROPERTY_CHANGE | EventMask::FOCUS_CHANGE),
                )?;
            }
            XRequest::Configure {
                window,
                changes,
                stack_mode,
                sibling,
            } => {
                let aux = ConfigureWindowAux {
                    x: changes.x,
                    y: changes.y,
                    width: changes.width,
                    height: changes.height,
                    border_width: changes.border_width,
                    sibling,
                    stack_mode,
                };
                self.conn.configure_window(window, &aux)?;
            }
            XRequest::SendConfigureNotify {
                window,
                x,
                y,
                width,
                height,
                border_width,
            } => {
                let event = ConfigureNotifyEvent {
                    response_type: CONFIGURE_NOTIFY_EVENT,
                    sequence: 0,
                    event: window,
                    window,
                    above_sibling: NONE,
                    x: x as i16,
                    y: y as i16,
                    width: width as u16,
                    height: height as u16,
                    border_width: border_width as u16,
                    override_redirect: false,
                };
                self.conn
                    .send_event(false, window, EventMask::STRUCTURE_NOTIFY, event)?;
            }
            XRequest::SetWmState { window, state } => {
                self.conn.change_property32(
                    PropMode::REPLACE,
                    window,
                    atoms.WM_STATE,
                    atoms.WM_STATE,
                    &[state, NONE],
                )?;
            }
            XRequest::SetNetWmState { window, states } => {
                self.conn.change_property32(
                    PropMode::REPLACE,
                    window,
                    atoms._NET_WM_STATE,
                    AtomEnum::ATOM,
                    &states,
                )?;
            }
            XRequest::SetFrameExtents { window } => {
                self.conn.change_property32(
                    PropMode::REPLACE,
                    window,
                    atoms._NET_FRAME_EXTENTS,
                    AtomEnum::CARDINAL,
                    &[0, 0, 0, 0],
                )?;
            }
            XRequest::SetNorthWestGravity { window } => {
                self.conn.change_window_attributes(
                    window,
                    &ChangeWindowAttributesAux::new().win_gravity(Gravity::NORTH_WEST),
                )?;
            }
            XRequest::CreateFrame {
                frame,
                depth,
                x,
                y,
                width,
                height,
            } => {
                let (depth, (visual, colormap)) = match self.visuals.get(&depth) {
                    Some(v) => (depth, *v),
                    None => {
                        warn!("⚠️ No visual for depth {}, using root depth", depth);
                        let root = self.visuals.get(&self.root_depth).copied().ok_or_else(|| {
                            BridgeError::XConnectionLost("root depth has no visual".into())
                        })?;
                        (self.root_depth, root)
                    }
                };
                self.conn.create_window(
                    depth,
                    frame,
                    self.root,
                    x as i16,
                    y as i16,
                    width.max(1) as u16,
                    height.max(1) as u16,
                    0,
                    WindowClass::INPUT_OUTPUT,
                    visual,
                    &CreateWindowAux::new()
                        .border_pixel(0)
                        .event_mask(
                            EventMask::SUBSTRUCTURE_NOTIFY | EventMask::SUBSTRUCTURE_REDIRECT,
                        )
                        .colormap(colormap),
                )?;
            }
            XRequest::Reparent {
                window,
                parent,
                x,
                y,
            } => {
                self.conn.reparent_window(
                    window,
                    parent.unwrap_or(self.root),
                    x as i16,
                    y as i16,
                )?;
            }
            XRequest::DestroyWindow { window } => {
                self.conn.destroy_window(window)?;
            }
            XRequest::MapWindow { window } => {
                self.conn.map_window(window)?;
            }
            XRequest::TakeFocus { window } => {
                let event = ClientMessageEvent::new(
                    32,
                    window,
                    atoms.WM_PROTOCOLS,
                    [atoms.WM_TAKE_FOCUS, CURRENT_TIME, 0, 0, 0],
                );
                self.conn
                    .send_event(false, window, EventMask::NO_EVENT, event)?;
            }
            XRequest::SetInputFocus { window } => {
                self.conn.set_input_focus(
                    InputFocus::NONE,
                    window.unwrap_or(NONE),
                    CURRENT_TIME,
                )?;
            }
            XRequest::DeleteWindow { window } => {
                let event = ClientMessageEvent::new(
                    32,
                    window,
                    atoms.WM_PROTOCOLS,
                    [atoms.WM_DELETE_WINDOW, CURRENT_TIME, 0, 0, 0],
                );
                self.conn
                    .send_event(false, window, EventMask::NO_EVENT, event)?;
            }
        }
        Ok(())
    }

    // ---- property reads -------------------------------------------------

    fn get_geometry(&self, window: u32) -> BridgeResult<Option<Geometry>> {
        let reply = optional(self.conn.get_geometry(window)?.reply())?;
        Ok(reply.map(|g| Geometry {
            x: g.x as i32,
            y: g.y as i32,
            width: g.width as u32,
            height: g.height as u32,
            border_width: g.border_width as u32,
            depth: g.depth,
        }))
    }

    fn get_property(
        &self,
        delete: bool,
        window: u32,
        property: impl Into<u32>,
        words: u32,
    ) -> BridgeResult<Option<GetPropertyReply>> {
        let reply = optional(
            self.conn
                .get_property(delete, window, property, AtomEnum::ANY, 0, words)?
                .reply(),
        )?;
        Ok(reply.filter(|r| r.type_ != NONE))
    }

    fn words(reply: &GetPropertyReply) -> Vec<u32> {
        reply.value32().map(|v| v.collect()).unwrap_or_default()
    }

    fn read_text(&self, window: u32, property: impl Into<u32>) -> BridgeResult<Option<String>> {
        Ok(self
            .get_property(false, window, property, TEXT_PROPERTY_WORDS)?
            .map(|r| hints::text(&r.value)))
    }

    fn read_size_hints(&self, window: u32) -> BridgeResult<Option<SizeHints>> {
        let Some(reply) = self.get_property(false, window, AtomEnum::WM_NORMAL_HINTS, 18)? else {
            return Ok(None);
        };
        match SizeHints::parse(&Self::words(&reply)) {
            Ok(hints) => Ok(Some(hints)),
            Err(err) => {
                debug!("Ignoring hints of {:#x}: {}", window, err);
                Ok(None)
            }
        }
    }

    fn read_motif_hints(&self, window: u32) -> BridgeResult<Option<MotifHints>> {
        let Some(reply) = self.get_property(false, window, self.atoms._MOTIF_WM_HINTS, 5)? else {
            return Ok(None);
        };
        match MotifHints::parse(&Self::words(&reply)) {
            Ok(hints) => Ok(Some(hints)),
            Err(err) => {
                debug!("Ignoring hints of {:#x}: {}", window, err);
                Ok(None)
            }
        }
    }

    fn read_window_id(&self, window: u32, property: impl Into<u32>) -> BridgeResult<Option<u32>> {
        let Some(reply) = self.get_property(false, window, property, 1)? else {
            return Ok(None);
        };
        match hints::window_id(&Self::words(&reply)) {
            Ok(id) => Ok(Some(id)),
            Err(err) => {
                debug!("Ignoring property of {:#x}: {}", window, err);
                Ok(None)
            }
        }
    }

    /// Everything map-request needs, requested in one pipelined batch.
    fn read_window_properties(&self, window: u32) -> BridgeResult<WindowProperties> {
        let atoms = &self.atoms;
        let any = AtomEnum::ANY;
        let c = &self.conn;
        let name = c.get_property(false, window, AtomEnum::WM_NAME, any, 0, TEXT_PROPERTY_WORDS)?;
        let class = c.get_property(false, window, AtomEnum::WM_CLASS, any, 0, TEXT_PROPERTY_WORDS)?;
        let transient =
            c.get_property(false, window, AtomEnum::WM_TRANSIENT_FOR, any, 0, 1)?;
        let normal = c.get_property(false, window, AtomEnum::WM_NORMAL_HINTS, any, 0, 18)?;
        let leader = c.get_property(false, window, atoms.WM_CLIENT_LEADER, any, 0, 1)?;
        let motif = c.get_property(false, window, atoms._MOTIF_WM_HINTS, any, 0, 5)?;
        let startup =
            c.get_property(false, window, atoms._NET_STARTUP_ID, any, 0, TEXT_PROPERTY_WORDS)?;
        let state =
            c.get_property(false, window, atoms._NET_WM_STATE, any, 0, MAX_PROPERTY_WORDS)?;
        let theme =
            c.get_property(false, window, atoms._GTK_THEME_VARIANT, any, 0, TEXT_PROPERTY_WORDS)?;

        type Reply = std::result::Result<GetPropertyReply, ReplyError>;
        let present = |reply: Reply| -> BridgeResult<Option<GetPropertyReply>> {
            Ok(optional(reply)?.filter(|r| r.type_ != NONE))
        };
        let malformed = |err: BridgeError| {
            debug!("Ignoring property of {:#x}: {}", window, err);
        };

        let mut props = WindowProperties::default();
        if let Some(r) = present(name.reply())? {
            props.name = Some(hints::text(&r.value));
        }
        if let Some(r) = present(class.reply())? {
            props.class = hints::wm_class(&r.value);
        }
        if let Some(r) = present(transient.reply())? {
            props.transient_for = hints::window_id(&Self::words(&r)).map_err(malformed).ok();
        }
        if let Some(r) = present(normal.reply())? {
            props.size_hints = SizeHints::parse(&Self::words(&r)).map_err(malformed).ok();
        }
        if let Some(r) = present(leader.reply())? {
            props.client_leader = hints::window_id(&Self::words(&r)).map_err(malformed).ok();
        }
        if let Some(r) = present(motif.reply())? {
            props.motif_hints = MotifHints::parse(&Self::words(&r)).map_err(malformed).ok();
        }
        if let Some(r) = present(startup.reply())? {
            props.startup_id = Some(hints::text(&r.value));
        }
        if let Some(r) = present(state.reply())? {
            props.maximized = hints::is_maximized(
                &Self::words(&r),
                atoms._NET_WM_STATE_MAXIMIZED_HORZ,
                atoms._NET_WM_STATE_MAXIMIZED_VERT,
            );
        }
        if let Some(r) = present(theme.reply())? {
            props.dark_frame = hints::is_dark_variant(&r.value);
        }

        if props.startup_id.is_none() {
            if let Some(leader) = props.client_leader.filter(|l| *l != NONE) {
                props.startup_id = self.read_text(leader, atoms._NET_STARTUP_ID)?;
            }
        }
        Ok(props)
    }

    // ---- events ---------------------------------------------------------

    /// Dispatch one X event. Returns selection actions for the host side.
    ///
    /// A [`BridgeError::ProtocolViolation`] names a guest surface that was
    /// given a second role; the caller disconnects its client.
    pub fn handle_event<D, W>(
        &self,
        event: Event,
        wm: &mut WindowManager,
        mut selection: Option<&mut SelectionBridge<W>>,
        dir: &D,
    ) -> BridgeResult<Vec<SelectionAction>>
    where
        D: SurfaceDirectory + ?Sized,
        W: Write,
    {
        let atoms = &self.atoms;
        let mut actions = Vec::new();
        let mut result = Ok(());

        match event {
            Event::CreateNotify(ev) => {
                if ev.window != self.wm_window && Some(ev.window) != self.selection_window {
                    wm.create_notify(
                        ev.window,
                        ev.x as i32,
                        ev.y as i32,
                        ev.width as u32,
                        ev.height as u32,
                        ev.border_width as u32,
                    );
                }
            }
            Event::DestroyNotify(ev) => wm.destroy_notify(ev.window),
            Event::ReparentNotify(ev) => {
                let geometry = if ev.parent == self.root && wm.window(ev.window).is_none() {
                    self.get_geometry(ev.window)?
                } else {
                    None
                };
                wm.reparent_notify(ev.window, ev.parent, ev.x as i32, ev.y as i32, || geometry);
            }
            Event::MapRequest(ev) => {
                if let Some(w) = wm.window(ev.window) {
                    let geometry = if w.frame_id.is_none() {
                        self.get_geometry(ev.window)?
                    } else {
                        None
                    };
                    let props = self.read_window_properties(ev.window)?;
                    let frame = self.new_id()?;
                    wm.map_request(ev.window, props, geometry, || frame);
                }
            }
            Event::UnmapNotify(ev) => {
                let synthetic = ev.response_type & SEND_EVENT_BIT != 0;
                wm.unmap_notify(ev.window, synthetic, dir);
            }
            Event::ConfigureRequest(ev) => {
                let mask = u16::from(ev.value_mask);
                let has = |flag: ConfigWindow| mask & u16::from(flag) != 0;
                let request = ConfigureRequest {
                    window: ev.window,
                    changes: WindowChanges {
                        x: has(ConfigWindow::X).then_some(ev.x as i32),
                        y: has(ConfigWindow::Y).then_some(ev.y as i32),
                        width: has(ConfigWindow::WIDTH).then_some(ev.width as u32),
                        height: has(ConfigWindow::HEIGHT).then_some(ev.height as u32),
                        border_width: has(ConfigWindow::BORDER_WIDTH)
                            .then_some(ev.border_width as u32),
                    },
                    sibling: has(ConfigWindow::SIBLING).then_some(ev.sibling),
                    stack_mode: has(ConfigWindow::STACK_MODE).then_some(ev.stack_mode),
                };
                result = wm.configure_request(request, dir);
            }
            Event::ConfigureNotify(ev) => {
                if ev.window == self.root {
                    wm.root_resized(ev.width as u32, ev.height as u32);
                } else {
                    let geometry = Geometry {
                        x: ev.x as i32,
                        y: ev.y as i32,
                        width: ev.width as u32,
                        height: ev.height as u32,
                        border_width: ev.border_width as u32,
                        depth: 0,
                    };
                    result = wm.configure_notify(ev.window, geometry, dir);
                }
            }
            Event::ClientMessage(ev) => {
                let data = ev.data.as_data32();
                if ev.type_ == atoms.WL_SURFACE_ID {
                    result = wm.surface_id_message(ev.window, data[0], dir);
                } else if ev.type_ == atoms._NET_WM_MOVERESIZE {
                    wm.moveresize_message(ev.window, data[2]);
                } else if ev.type_ == atoms._NET_WM_STATE {
                    wm.net_wm_state_message(ev.window, data[0], data[1], data[2]);
                } else if ev.type_ == atoms.WM_CHANGE_STATE {
                    wm.change_state_message(ev.window, data[0]);
                }
            }
            Event::FocusIn(ev) => wm.focus_in(ev.event),
            Event::PropertyNotify(ev) => {
                let deleted = ev.state == Property::DELETE;
                if ev.atom == u32::from(AtomEnum::WM_NAME) {
                    let title = if deleted {
                        None
                    } else {
                        self.read_text(ev.window, AtomEnum::WM_NAME)?
                    };
                    wm.title_changed(ev.window, title);
                } else if ev.atom == u32::from(AtomEnum::WM_NORMAL_HINTS) {
                    let hints = if deleted {
                        None
                    } else {
                        self.read_size_hints(ev.window)?
                    };
                    wm.normal_hints_changed(ev.window, hints);
                } else if ev.atom == atoms._MOTIF_WM_HINTS {
                    let hints = if deleted {
                        None
                    } else {
                        self.read_motif_hints(ev.window)?
                    };
                    wm.motif_hints_changed(ev.window, hints);
                } else if ev.atom == atoms._GTK_THEME_VARIANT {
                    let dark = !deleted
                        && self
                            .get_property(false, ev.window, ev.atom, TEXT_PROPERTY_WORDS)?
                            .map_or(false, |r| hints::is_dark_variant(&r.value));
                    wm.theme_changed(ev.window, dark);
                } else if let Some(bridge) = selection.as_deref_mut() {
                    if ev.state == Property::NEW_VALUE && bridge.expects_chunk(ev.window, ev.atom) {
                        let data = self
                            .get_property(false, ev.window, ev.atom, MAX_PROPERTY_WORDS)?
                            .map(|r| r.value)
                            .unwrap_or_default();
                        actions = bridge.chunk_received(data);
                    } else if deleted {
                        actions = bridge.property_deleted(ev.window, ev.atom);
                    }
                }
            }
            Event::SelectionRequest(ev) => {
                if let Some(bridge) = selection.as_deref_mut() {
                    actions = bridge.selection_request(SelectionRequest {
                        time: ev.time,
                        requestor: ev.requestor,
                        selection: ev.selection,
                        target: ev.target,
                        property: ev.property,
                    });
                }
            }
            Event::SelectionNotify(ev) => {
                if let Some(bridge) = selection.as_deref_mut() {
                    actions = bridge.selection_notify(ev.target, ev.property);
                }
            }
            Event::XfixesSelectionNotify(ev) => {
                if let Some(bridge) = selection.as_deref_mut() {
                    if ev.selection == atoms.CLIPBOARD {
                        actions = bridge.owner_changed(ev.owner, ev.timestamp);
                    }
                }
            }
            Event::Error(err) => {
                debug!("X error: {:?} (request {})", err.error_kind, err.major_opcode);
            }
            other => trace!("Unhandled X event {:?}", other),
        }

        let host_actions = match selection {
            Some(bridge) => self.run_selection(bridge, actions)?,
            None => Vec::new(),
        };
        result?;
        Ok(host_actions)
    }

    /// Perform the X side of selection actions, feeding replies back into the
    /// bridge, and return what is left for the host side.
    pub fn run_selection<W: Write>(
        &self,
        bridge: &mut SelectionBridge<W>,
        actions: Vec<SelectionAction>,
    ) -> BridgeResult<Vec<SelectionAction>> {
        let mut queue: VecDeque<_> = actions.into();
        let mut host = Vec::new();
        let window = bridge.window();
        let atoms = *bridge.atoms();

        while let Some(action) = queue.pop_front() {
            match action {
                SelectionAction::SetOwner {
                    selection,
                    owner,
                    time,
                } => {
                    self.conn
                        .set_selection_owner(owner.unwrap_or(NONE), selection, time)?;
                }
                SelectionAction::ChangeProperty {
                    window,
                    property,
                    kind,
                    format,
                    data,
                } => {
                    let units = data.len() as u32 / (u32::from(format) / 8).max(1);
                    self.conn.change_property(
                        PropMode::REPLACE,
                        window,
                        property,
                        kind,
                        format,
                        units,
                        &data,
                    )?;
                }
                SelectionAction::Notify { request, property } => {
                    let event = SelectionNotifyEvent {
                        response_type: SELECTION_NOTIFY_EVENT,
                        sequence: 0,
                        time: request.time,
                        requestor: request.requestor,
                        selection: request.selection,
                        target: request.target,
                        property,
                    };
                    self.conn
                        .send_event(false, request.requestor, EventMask::NO_EVENT, event)?;
                }
                SelectionAction::Convert { target, time } => {
                    self.conn.convert_selection(
                        window,
                        atoms.clipboard,
                        target,
                        atoms.wl_selection,
                        time,
                    )?;
                }
                SelectionAction::DeleteProperty { window, property } => {
                    self.conn.delete_property(window, property)?;
                }
                SelectionAction::FetchTargets => {
                    let targets = self
                        .get_property(false, window, atoms.wl_selection, MAX_PROPERTY_WORDS)?
                        .map(|r| Self::words(&r))
                        .unwrap_or_default();
                    let cookies = targets
                        .iter()
                        .map(|atom| self.conn.get_atom_name(*atom))
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    let mut names = Vec::new();
                    for cookie in cookies {
                        if let Some(reply) = optional(cookie.reply())? {
                            names.push(String::from_utf8_lossy(&reply.name).into_owned());
                        }
                    }
                    debug!("📋 X selection targets: {:?}", names);
                    queue.extend(bridge.targets_received(names));
                }
                SelectionAction::FetchData => {
                    if let Some(reply) =
                        self.get_property(true, window, atoms.wl_selection, MAX_PROPERTY_WORDS)?
                    {
                        queue.extend(bridge.property_received(reply.type_, reply.value));
                    }
                }
                other => host.push(other),
            }
        }
        Ok(host)
    }
}

impl AsFd for XConnection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.conn.stream().as_fd()
    }
}
