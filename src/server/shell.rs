//! `xdg_wm_base` for native guests and host shells for X windows
//!
//! Native xdg objects are paired one to one with their host counterparts and
//! forwarded with geometry scaled. X windows get their host shell from the
//! window manager's [`HostRequest`]s, applied by
//! [`Bridge::apply_host_requests`].

use super::registry::{bind_guest, BoundGlobal, GlobalData};
use super::{Bridge, SurfaceKey};
use crate::bridge::{PairKey, PairTable, Teardown};
use crate::xwm::{HostRequest, ToplevelState};
use log::{debug, trace, warn};
use std::collections::HashMap;
use wayland_client::protocol::wl_seat::WlSeat as HostSeat;
use wayland_client::{delegate_noop, Connection, Dispatch as ClientDispatch, Proxy, QueueHandle};
use wayland_protocols::xdg::decoration::zv1::client::zxdg_toplevel_decoration_v1::{
    self as host_decoration, ZxdgToplevelDecorationV1,
};
use wayland_protocols::xdg::shell::client::xdg_popup::{self as host_popup, XdgPopup as HostPopup};
use wayland_protocols::xdg::shell::client::xdg_positioner::{
    self as host_positioner, XdgPositioner as HostPositioner,
};
use wayland_protocols::xdg::shell::client::xdg_surface::{self as host_xdg_surface, XdgSurface as HostXdgSurface};
use wayland_protocols::xdg::shell::client::xdg_toplevel::{self as host_toplevel, XdgToplevel as HostToplevel};
use wayland_protocols::xdg::shell::server::{xdg_popup, xdg_positioner, xdg_surface, xdg_toplevel, xdg_wm_base};
use wayland_server::backend::ClientId;
use wayland_server::protocol::wl_seat;
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource, WEnum};

pub type XdgSurfaceKey = PairKey<xdg_surface::XdgSurface, HostXdgSurface>;
pub type ToplevelKey = PairKey<xdg_toplevel::XdgToplevel, HostToplevel>;
pub type PopupKey = PairKey<xdg_popup::XdgPopup, HostPopup>;

/// User data of host shell objects created for an X window.
#[derive(Debug, Clone, Copy)]
pub struct XWindowShell(pub u32);

/// Host shell objects of one X window.
struct WindowShell {
    surface_id: u32,
    xdg_surface: HostXdgSurface,
    toplevel: Option<HostToplevel>,
    popup: Option<HostPopup>,
    decoration: Option<ZxdgToplevelDecorationV1>,
}

impl WindowShell {
    fn destroy(self) {
        if let Some(decoration) = self.decoration {
            decoration.destroy();
        }
        if let Some(toplevel) = self.toplevel {
            toplevel.destroy();
        }
        if let Some(popup) = self.popup {
            popup.destroy();
        }
        self.xdg_surface.destroy();
    }
}

#[derive(Default)]
pub struct Shells {
    xdg_surfaces: PairTable<xdg_surface::XdgSurface, HostXdgSurface>,
    toplevels: PairTable<xdg_toplevel::XdgToplevel, HostToplevel>,
    popups: PairTable<xdg_popup::XdgPopup, HostPopup>,
    windows: HashMap<u32, WindowShell>,
}

/// Decode the `xdg_toplevel.configure` state array.
pub fn toplevel_states(raw: &[u8]) -> Vec<ToplevelState> {
    raw.chunks_exact(4)
        .filter_map(|chunk| {
            let value = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            match value {
                1 => Some(ToplevelState::Maximized),
                2 => Some(ToplevelState::Fullscreen),
                3 => Some(ToplevelState::Resizing),
                4 => Some(ToplevelState::Activated),
                _ => None,
            }
        })
        .collect()
}

fn convert<A: Into<u32>, B: TryFrom<u32>>(value: WEnum<A>) -> Option<B> {
    let raw = match value {
        WEnum::Value(value) => value.into(),
        WEnum::Unknown(raw) => raw,
    };
    B::try_from(raw).ok()
}

impl Bridge {
    fn host_seat_of(&self, seat: &wl_seat::WlSeat) -> Option<HostSeat> {
        let name = seat.data::<BoundGlobal>()?.host_name()?;
        self.seats.by_name(name)
    }

    fn host_xdg_surface(&self, guest: &xdg_surface::XdgSurface) -> Option<HostXdgSurface> {
        let key = guest.data::<Option<XdgSurfaceKey>>()?.as_ref()?;
        self.shell.xdg_surfaces.proxy(*key).cloned()
    }

    fn host_toplevel(&self, guest: &xdg_toplevel::XdgToplevel) -> Option<HostToplevel> {
        let key = guest.data::<Option<ToplevelKey>>()?.as_ref()?;
        self.shell.toplevels.proxy(*key).cloned()
    }

    fn window_toplevel(&self, window: u32) -> Option<&HostToplevel> {
        self.shell.windows.get(&window)?.toplevel.as_ref()
    }

    /// Apply shell requests queued by the window manager.
    pub(crate) fn apply_host_requests(&mut self, requests: Vec<HostRequest>) {
        for request in requests {
            trace!("🪟 {:?}", request);
            self.apply_host_request(request);
        }
    }

    fn create_window_shell(&mut self, window: u32, surface_id: u32) -> Option<HostXdgSurface> {
        let wm_base = self.host.xdg_wm_base.as_ref()?;
        let Some(surface) = self.surfaces.host_by_id(surface_id) else {
            warn!("⚠️ Window {:#x} names unknown surface {}", window, surface_id);
            return None;
        };
        if let Some(previous) = self.shell.windows.remove(&window) {
            previous.destroy();
        }
        let xdg_surface = wm_base.get_xdg_surface(&surface, &self.qh, XWindowShell(window));
        self.shell.windows.insert(
            window,
            WindowShell {
                surface_id,
                xdg_surface: xdg_surface.clone(),
                toplevel: None,
                popup: None,
                decoration: None,
            },
        );
        Some(xdg_surface)
    }

    fn apply_host_request(&mut self, request: HostRequest) {
        let qh = self.qh.clone();
        match request {
            HostRequest::DestroyShell { window } => {
                if let Some(shell) = self.shell.windows.remove(&window) {
                    debug!("🪟 Host shell of {:#x} (surface {}) destroyed", window, shell.surface_id);
                    shell.destroy();
                }
            }
            HostRequest::CreateToplevel { window, surface_id } => {
                let Some(xdg_surface) = self.create_window_shell(window, surface_id) else {
                    return;
                };
                let toplevel = xdg_surface.get_toplevel(&qh, XWindowShell(window));
                let decoration = self
                    .host
                    .decoration
                    .as_ref()
                    .map(|manager| manager.get_toplevel_decoration(&toplevel, &qh, ()));
                if let Some(shell) = self.shell.windows.get_mut(&window) {
                    shell.toplevel = Some(toplevel);
                    shell.decoration = decoration;
                }
            }
            HostRequest::CreatePopup {
                window,
                surface_id,
                parent,
                anchor,
            } => {
                let Some(parent_surface) = self.shell.windows.get(&parent).map(|s| s.xdg_surface.clone())
                else {
                    warn!("⚠️ Popup {:#x} has no parent shell", window);
                    return;
                };
                let size = self
                    .wm
                    .as_ref()
                    .and_then(|wm| wm.window(window))
                    .map(|w| (self.to_host(w.width as i32), self.to_host(w.height as i32)))
                    .unwrap_or((1, 1));
                let Some(wm_base) = self.host.xdg_wm_base.clone() else {
                    return;
                };
                let Some(xdg_surface) = self.create_window_shell(window, surface_id) else {
                    return;
                };
                let positioner = wm_base.create_positioner(&qh, ());
                positioner.set_size(size.0.max(1), size.1.max(1));
                positioner.set_anchor_rect(anchor.0, anchor.1, 1, 1);
                positioner.set_anchor(host_positioner::Anchor::TopLeft);
                positioner.set_gravity(host_positioner::Gravity::BottomRight);
                let popup = xdg_surface.get_popup(Some(&parent_surface), &positioner, &qh, XWindowShell(window));
                positioner.destroy();
                if let Some(shell) = self.shell.windows.get_mut(&window) {
                    shell.popup = Some(popup);
                }
            }
            HostRequest::SetParent { window, parent } => {
                let parent = parent.and_then(|p| self.window_toplevel(p).cloned());
                if let Some(toplevel) = self.window_toplevel(window) {
                    toplevel.set_parent(parent.as_ref());
                }
            }
            HostRequest::SetTitle { window, title } => {
                if let Some(toplevel) = self.window_toplevel(window) {
                    toplevel.set_title(title);
                }
            }
            HostRequest::SetAppId { window, app_id } => {
                if let Some(toplevel) = self.window_toplevel(window) {
                    toplevel.set_app_id(app_id);
                }
            }
            HostRequest::SetMinSize { window, size } => {
                if let Some(toplevel) = self.window_toplevel(window) {
                    toplevel.set_min_size(size.0, size.1);
                }
            }
            HostRequest::SetMaxSize { window, size } => {
                if let Some(toplevel) = self.window_toplevel(window) {
                    toplevel.set_max_size(size.0, size.1);
                }
            }
            HostRequest::SetMaximized { window, maximized } => {
                if let Some(toplevel) = self.window_toplevel(window) {
                    if maximized {
                        toplevel.set_maximized();
                    } else {
                        toplevel.unset_maximized();
                    }
                }
            }
            HostRequest::SetFullscreen { window, fullscreen } => {
                if let Some(toplevel) = self.window_toplevel(window) {
                    if fullscreen {
                        toplevel.set_fullscreen(None);
                    } else {
                        toplevel.unset_fullscreen();
                    }
                }
            }
            HostRequest::SetMinimized { window } => {
                if let Some(toplevel) = self.window_toplevel(window) {
                    toplevel.set_minimized();
                }
            }
            HostRequest::SetDecorated {
                window,
                decorated,
                frame_color,
            } => {
                let Some(decoration) = self.shell.windows.get(&window).and_then(|s| s.decoration.as_ref())
                else {
                    return;
                };
                debug!(
                    "🎨 Window {:#x} decorated={} frame {:#08x}",
                    window, decorated, frame_color
                );
                decoration.set_mode(if decorated {
                    host_decoration::Mode::ServerSide
                } else {
                    host_decoration::Mode::ClientSide
                });
            }
            HostRequest::Move { window } => {
                if let (Some(toplevel), Some(seat)) = (self.window_toplevel(window), self.seats.first()) {
                    toplevel._move(seat, self.seats.last_serial);
                }
            }
            HostRequest::Resize { window, edge } => {
                if let (Some(toplevel), Some(seat)) = (self.window_toplevel(window), self.seats.first()) {
                    toplevel.resize(seat, self.seats.last_serial, edge);
                }
            }
            HostRequest::AckConfigure { window, serial } => {
                if let Some(shell) = self.shell.windows.get(&window) {
                    shell.xdg_surface.ack_configure(serial);
                }
            }
            HostRequest::Commit { surface_id } => {
                if let Some(surface) = self.surfaces.host_by_id(surface_id) {
                    surface.commit();
                }
            }
        }
    }
}

impl ClientDispatch<HostXdgSurface, XWindowShell> for Bridge {
    fn event(
        state: &mut Self,
        _proxy: &HostXdgSurface,
        event: host_xdg_surface::Event,
        data: &XWindowShell,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let host_xdg_surface::Event::Configure { serial } = event {
            if let Some(wm) = state.wm.as_mut() {
                wm.xdg_surface_configure(data.0, serial, &state.surfaces);
            }
        }
    }
}

impl ClientDispatch<HostToplevel, XWindowShell> for Bridge {
    fn event(
        state: &mut Self,
        _proxy: &HostToplevel,
        event: host_toplevel::Event,
        data: &XWindowShell,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(wm) = state.wm.as_mut() else {
            return;
        };
        match event {
            host_toplevel::Event::Configure {
                width,
                height,
                states,
            } => wm.toplevel_configure(data.0, width, height, &toplevel_states(&states)),
            host_toplevel::Event::Close => wm.toplevel_close(data.0),
            _ => {}
        }
    }
}

impl ClientDispatch<HostPopup, XWindowShell> for Bridge {
    fn event(
        _state: &mut Self,
        _proxy: &HostPopup,
        event: host_popup::Event,
        data: &XWindowShell,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let host_popup::Event::PopupDone = event {
            debug!("🪟 Host dismissed popup {:#x}", data.0);
        }
    }
}

impl GlobalDispatch<xdg_wm_base::XdgWmBase, GlobalData> for Bridge {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<xdg_wm_base::XdgWmBase>,
        global: &GlobalData,
        data_init: &mut DataInit<'_, Self>,
    ) {
        bind_guest(state, resource, global, data_init);
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, BoundGlobal> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &xdg_wm_base::XdgWmBase,
        request: xdg_wm_base::Request,
        _data: &BoundGlobal,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let wm_base = state.host.xdg_wm_base.clone();
        let qh = state.qh.clone();
        match request {
            xdg_wm_base::Request::CreatePositioner { id } => {
                data_init.init(id, wm_base.map(|base| base.create_positioner(&qh, ())));
            }
            xdg_wm_base::Request::GetXdgSurface { id, surface } => {
                let host_surface = state.surfaces.host(&surface);
                let (Some(wm_base), Some(host_surface)) = (wm_base, host_surface) else {
                    data_init.init(id, None);
                    return;
                };
                state.shell.xdg_surfaces.insert_with(|key| {
                    let guest = data_init.init(id, Some(key));
                    (guest, wm_base.get_xdg_surface(&host_surface, &qh, key), ())
                });
                if let Some(key) = surface.data::<SurfaceKey>() {
                    if let Some(data) = state.surfaces.pairs.data_mut(*key) {
                        data.state.has_role = true;
                    }
                }
            }
            // the host's pings are answered by the bridge itself
            xdg_wm_base::Request::Pong { .. } => {}
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &xdg_wm_base::XdgWmBase,
        data: &BoundGlobal,
    ) {
        state.unbind(data);
    }
}

impl Dispatch<xdg_positioner::XdgPositioner, Option<HostPositioner>> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &xdg_positioner::XdgPositioner,
        request: xdg_positioner::Request,
        host: &Option<HostPositioner>,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        let Some(host) = host else {
            return;
        };
        match request {
            xdg_positioner::Request::SetSize { width, height } => {
                host.set_size(state.to_host(width).max(1), state.to_host(height).max(1))
            }
            xdg_positioner::Request::SetAnchorRect {
                x,
                y,
                width,
                height,
            } => host.set_anchor_rect(
                state.to_host(x),
                state.to_host(y),
                state.to_host(width).max(1),
                state.to_host(height).max(1),
            ),
            xdg_positioner::Request::SetAnchor { anchor } => {
                if let Some(anchor) = convert(anchor) {
                    host.set_anchor(anchor);
                }
            }
            xdg_positioner::Request::SetGravity { gravity } => {
                if let Some(gravity) = convert(gravity) {
                    host.set_gravity(gravity);
                }
            }
            xdg_positioner::Request::SetConstraintAdjustment {
                constraint_adjustment,
            } => host.set_constraint_adjustment(constraint_adjustment),
            xdg_positioner::Request::SetOffset { x, y } => {
                host.set_offset(state.to_host(x), state.to_host(y))
            }
            _ => {}
        }
    }

    fn destroyed(
        _state: &mut Self,
        _client: ClientId,
        _resource: &xdg_positioner::XdgPositioner,
        host: &Option<HostPositioner>,
    ) {
        if let Some(host) = host {
            host.destroy();
        }
    }
}

impl Dispatch<xdg_surface::XdgSurface, Option<XdgSurfaceKey>> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &xdg_surface::XdgSurface,
        request: xdg_surface::Request,
        key: &Option<XdgSurfaceKey>,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let host = key.and_then(|key| state.shell.xdg_surfaces.proxy(key)).cloned();
        let qh = state.qh.clone();
        match request {
            xdg_surface::Request::GetToplevel { id } => {
                let Some(host) = host else {
                    data_init.init(id, None);
                    return;
                };
                let app_id = state.options.application_id.clone();
                state.shell.toplevels.insert_with(|key| {
                    let guest = data_init.init(id, Some(key));
                    let toplevel = host.get_toplevel(&qh, key);
                    if let Some(app_id) = app_id {
                        toplevel.set_app_id(app_id);
                    }
                    (guest, toplevel, ())
                });
            }
            xdg_surface::Request::GetPopup {
                id,
                parent,
                positioner,
            } => {
                let host_parent = parent.as_ref().and_then(|p| state.host_xdg_surface(p));
                let host_positioner = positioner.data::<Option<HostPositioner>>().cloned().flatten();
                let (Some(host), Some(host_positioner)) = (host, host_positioner) else {
                    data_init.init(id, None);
                    return;
                };
                state.shell.popups.insert_with(|key| {
                    let guest = data_init.init(id, Some(key));
                    let popup = host.get_popup(host_parent.as_ref(), &host_positioner, &qh, key);
                    (guest, popup, ())
                });
            }
            xdg_surface::Request::SetWindowGeometry {
                x,
                y,
                width,
                height,
            } => {
                if let Some(host) = host {
                    host.set_window_geometry(
                        state.to_host(x),
                        state.to_host(y),
                        state.to_host(width),
                        state.to_host(height),
                    );
                }
            }
            xdg_surface::Request::AckConfigure { serial } => {
                if let Some(host) = host {
                    host.ack_configure(serial);
                }
            }
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &xdg_surface::XdgSurface,
        key: &Option<XdgSurfaceKey>,
    ) {
        if let Some(key) = key {
            if let Teardown::Sever { other, .. } = state.shell.xdg_surfaces.resource_destroyed(*key) {
                other.destroy();
            }
        }
    }
}

impl ClientDispatch<HostXdgSurface, XdgSurfaceKey> for Bridge {
    fn event(
        state: &mut Self,
        _proxy: &HostXdgSurface,
        event: host_xdg_surface::Event,
        key: &XdgSurfaceKey,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let host_xdg_surface::Event::Configure { serial } = event {
            if let Some(guest) = state.shell.xdg_surfaces.resource(*key) {
                guest.configure(serial);
            }
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, Option<ToplevelKey>> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &xdg_toplevel::XdgToplevel,
        request: xdg_toplevel::Request,
        key: &Option<ToplevelKey>,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        let Some(host) = key.and_then(|key| state.shell.toplevels.proxy(key)).cloned() else {
            return;
        };
        match request {
            xdg_toplevel::Request::SetParent { parent } => {
                let parent = parent.as_ref().and_then(|p| state.host_toplevel(p));
                host.set_parent(parent.as_ref());
            }
            xdg_toplevel::Request::SetTitle { title } => host.set_title(title),
            xdg_toplevel::Request::SetAppId { app_id } => {
                if state.options.application_id.is_none() {
                    host.set_app_id(app_id);
                }
            }
            xdg_toplevel::Request::ShowWindowMenu { seat, serial, x, y } => {
                if let Some(seat) = state.host_seat_of(&seat) {
                    host.show_window_menu(&seat, serial, state.to_host(x), state.to_host(y));
                }
            }
            xdg_toplevel::Request::Move { seat, serial } => {
                if let Some(seat) = state.host_seat_of(&seat) {
                    host._move(&seat, serial);
                }
            }
            xdg_toplevel::Request::Resize {
                seat,
                serial,
                edges,
            } => {
                if let (Some(seat), Some(edges)) = (state.host_seat_of(&seat), convert(edges)) {
                    host.resize(&seat, serial, edges);
                }
            }
            xdg_toplevel::Request::SetMaxSize { width, height } => {
                host.set_max_size(state.to_host(width), state.to_host(height))
            }
            xdg_toplevel::Request::SetMinSize { width, height } => {
                host.set_min_size(state.to_host(width), state.to_host(height))
            }
            xdg_toplevel::Request::SetMaximized => host.set_maximized(),
            xdg_toplevel::Request::UnsetMaximized => host.unset_maximized(),
            xdg_toplevel::Request::SetFullscreen { output } => {
                let output = output.as_ref().and_then(|o| state.outputs.host_for(o));
                host.set_fullscreen(output.as_ref());
            }
            xdg_toplevel::Request::UnsetFullscreen => host.unset_fullscreen(),
            xdg_toplevel::Request::SetMinimized => host.set_minimized(),
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &xdg_toplevel::XdgToplevel,
        key: &Option<ToplevelKey>,
    ) {
        if let Some(key) = key {
            if let Teardown::Sever { other, .. } = state.shell.toplevels.resource_destroyed(*key) {
                other.destroy();
            }
        }
    }
}

impl ClientDispatch<HostToplevel, ToplevelKey> for Bridge {
    fn event(
        state: &mut Self,
        _proxy: &HostToplevel,
        event: host_toplevel::Event,
        key: &ToplevelKey,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(guest) = state.shell.toplevels.resource(*key) else {
            return;
        };
        match event {
            host_toplevel::Event::Configure {
                width,
                height,
                states,
            } => guest.configure(state.to_guest(width), state.to_guest(height), states),
            host_toplevel::Event::Close => guest.close(),
            _ => {}
        }
    }
}

impl Dispatch<xdg_popup::XdgPopup, Option<PopupKey>> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &xdg_popup::XdgPopup,
        request: xdg_popup::Request,
        key: &Option<PopupKey>,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        let Some(host) = key.and_then(|key| state.shell.popups.proxy(key)).cloned() else {
            return;
        };
        if let xdg_popup::Request::Grab { seat, serial } = request {
            if let Some(seat) = state.host_seat_of(&seat) {
                host.grab(&seat, serial);
            }
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &xdg_popup::XdgPopup,
        key: &Option<PopupKey>,
    ) {
        if let Some(key) = key {
            if let Teardown::Sever { other, .. } = state.shell.popups.resource_destroyed(*key) {
                other.destroy();
            }
        }
    }
}

impl ClientDispatch<HostPopup, PopupKey> for Bridge {
    fn event(
        state: &mut Self,
        _proxy: &HostPopup,
        event: host_popup::Event,
        key: &PopupKey,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(guest) = state.shell.popups.resource(*key) else {
            return;
        };
        match event {
            host_popup::Event::Configure {
                x,
                y,
                width,
                height,
            } => guest.configure(
                state.to_guest(x),
                state.to_guest(y),
                state.to_guest(width),
                state.to_guest(height),
            ),
            host_popup::Event::PopupDone => guest.popup_done(),
            _ => {}
        }
    }
}

impl ClientDispatch<ZxdgToplevelDecorationV1, ()> for Bridge {
    fn event(
        _state: &mut Self,
        proxy: &ZxdgToplevelDecorationV1,
        event: host_decoration::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let host_decoration::Event::Configure { mode } = event {
            trace!("🎨 Host decoration mode {:?} for {}", mode, proxy.id());
        }
    }
}

delegate_noop!(Bridge: HostPositioner);

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(states: &[u32]) -> Vec<u8> {
        states.iter().flat_map(|s| s.to_ne_bytes()).collect()
    }

    #[test]
    fn test_toplevel_states_decode() {
        let states = toplevel_states(&encode(&[4, 1, 3]));
        assert_eq!(
            states,
            vec![
                ToplevelState::Activated,
                ToplevelState::Maximized,
                ToplevelState::Resizing
            ]
        );
    }

    #[test]
    fn test_unknown_states_and_trailing_bytes_are_dropped() {
        let mut raw = encode(&[2, 9]);
        raw.push(0xff);
        assert_eq!(toplevel_states(&raw), vec![ToplevelState::Fullscreen]);
    }
}
