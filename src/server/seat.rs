//! `wl_seat` forwarding
//!
//! Input devices are created per guest request on the host seat the guest
//! global came from. Coordinates are scaled into guest space; key events pass
//! the accelerator filter.

use super::registry::{bind_guest, BoundGlobal, GlobalData};
use super::Bridge;
use crate::bridge::{PairKey, PairTable, Teardown};
use crate::seat::{to_guest, Accelerator, KeyFilter, KeyVerdict, KeymapState};
use log::{debug, trace, warn};
use std::os::fd::AsFd;
use wayland_client::protocol::wl_keyboard::{self as host_keyboard, WlKeyboard as HostKeyboard};
use wayland_client::protocol::wl_pointer::{self as host_pointer, WlPointer as HostPointer};
use wayland_client::protocol::wl_seat::{self as host_seat, WlSeat as HostSeat};
use wayland_client::protocol::wl_touch::{self as host_touch, WlTouch as HostTouch};
use wayland_client::{Connection, Dispatch as ClientDispatch, Proxy, QueueHandle, WEnum};
use wayland_server::backend::ClientId;
use wayland_server::protocol::{wl_keyboard, wl_pointer, wl_seat, wl_surface, wl_touch};
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource};
use xkbcommon::xkb;

pub type PointerKey = PairKey<wl_pointer::WlPointer, HostPointer, PointerData>;
pub type KeyboardKey = PairKey<wl_keyboard::WlKeyboard, HostKeyboard, KeyboardData>;
pub type TouchKey = PairKey<wl_touch::WlTouch, HostTouch, u32>;

pub struct SeatEntry {
    pub host_name: u32,
    pub proxy: HostSeat,
    capabilities: u32,
    name: Option<String>,
    guests: Vec<wl_seat::WlSeat>,
}

/// Per-pointer state. `seat` is the host registry name of the seat the
/// pointer was created from.
pub struct PointerData {
    seat: u32,
    focus: Option<wl_surface::WlSurface>,
}

pub struct KeyboardData {
    seat: u32,
    filter: KeyFilter,
    keymap: Option<KeymapState>,
    focus: Option<wl_surface::WlSurface>,
}

pub struct Seats {
    entries: Vec<SeatEntry>,
    pointers: PairTable<wl_pointer::WlPointer, HostPointer, PointerData>,
    keyboards: PairTable<wl_keyboard::WlKeyboard, HostKeyboard, KeyboardData>,
    /// Touch pairs carry the host name of their seat.
    touches: PairTable<wl_touch::WlTouch, HostTouch, u32>,
    accelerators: Vec<Accelerator>,
    xkb: xkb::Context,
    /// Serial of the latest input event, for requests that need one.
    pub last_serial: u32,
}

impl Seats {
    pub fn new(accelerators: Vec<Accelerator>) -> Self {
        Self {
            entries: Vec::new(),
            pointers: PairTable::new(),
            keyboards: PairTable::new(),
            touches: PairTable::new(),
            accelerators,
            xkb: xkb::Context::new(xkb::CONTEXT_NO_FLAGS),
            last_serial: 0,
        }
    }

    pub fn add(&mut self, host_name: u32, proxy: HostSeat) {
        self.entries.push(SeatEntry {
            host_name,
            proxy,
            capabilities: 0,
            name: None,
            guests: Vec::new(),
        });
    }

    /// The host seat went away. Guest seats bound from it lose every
    /// capability and the input devices created on it are severed; their
    /// guest resources stay until the guest destroys them but no longer
    /// forward anything. Returns how many devices were severed.
    pub fn remove(&mut self, host_name: u32) -> usize {
        let Some(index) = self.entries.iter().position(|e| e.host_name == host_name) else {
            return 0;
        };
        let entry = self.entries.remove(index);
        for guest in &entry.guests {
            guest.capabilities(wl_seat::Capability::empty());
        }

        let mut severed = 0;
        for pair in self.pointers.sever_where(|p| p.data.seat == host_name) {
            if pair.proxy.version() >= 3 {
                pair.proxy.release();
            }
            severed += 1;
        }
        for pair in self.keyboards.sever_where(|p| p.data.seat == host_name) {
            if pair.proxy.version() >= 3 {
                pair.proxy.release();
            }
            severed += 1;
        }
        for pair in self.touches.sever_where(|p| p.data == host_name) {
            if pair.proxy.version() >= 3 {
                pair.proxy.release();
            }
            severed += 1;
        }
        if entry.proxy.version() >= 5 {
            entry.proxy.release();
        }
        severed
    }

    /// The seat used for window moves, resizes and the selection.
    pub fn first(&self) -> Option<&HostSeat> {
        self.entries.first().map(|e| &e.proxy)
    }

    pub fn by_name(&self, host_name: u32) -> Option<HostSeat> {
        self.by_host_name(Some(host_name)).map(|e| e.proxy.clone())
    }

    /// Host pointer behind a guest pointer, while the pair is alive.
    pub fn host_pointer(&self, guest: &wl_pointer::WlPointer) -> Option<HostPointer> {
        let key = guest.data::<Option<PointerKey>>()?.as_ref()?;
        self.pointers.proxy(*key).cloned()
    }

    fn by_host_name(&self, host_name: Option<u32>) -> Option<&SeatEntry> {
        self.entries.iter().find(|e| Some(e.host_name) == host_name)
    }
}

fn raw<T: Into<u32>>(value: WEnum<T>) -> u32 {
    match value {
        WEnum::Value(value) => value.into(),
        WEnum::Unknown(raw) => raw,
    }
}

fn guest_capabilities(raw: u32) -> wl_seat::Capability {
    wl_seat::Capability::from_bits_truncate(raw)
}

impl Bridge {
    /// Record `serial` as the latest event on `surface`.
    fn input_serial(&mut self, surface: &wl_surface::WlSurface, serial: u32) {
        self.seats.last_serial = serial;
        if let Some(key) = surface.data::<super::SurfaceKey>() {
            if let Some(data) = self.surfaces.pairs.data_mut(*key) {
                data.state.last_event_serial = serial;
            }
        }
    }

    /// In X mode the window under a new pointer or touch focus is raised and
    /// the X server caught up before the guest sees the event.
    fn raise_for_input(&mut self, surface: &wl_surface::WlSurface) {
        if let Some(wm) = self.wm.as_mut() {
            wm.restack(surface.id().protocol_id());
            self.forced_roundtrip();
        }
    }
}

impl ClientDispatch<HostSeat, ()> for Bridge {
    fn event(
        state: &mut Self,
        proxy: &HostSeat,
        event: host_seat::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(entry) = state.seats.entries.iter_mut().find(|e| &e.proxy == proxy) else {
            return;
        };
        match event {
            host_seat::Event::Capabilities { capabilities } => {
                entry.capabilities = match capabilities {
                    WEnum::Value(caps) => caps.bits(),
                    WEnum::Unknown(raw) => raw,
                };
                debug!("🖱️ Host seat {} capabilities {:#x}", entry.host_name, entry.capabilities);
                for guest in &entry.guests {
                    guest.capabilities(guest_capabilities(entry.capabilities));
                }
            }
            host_seat::Event::Name { name } => {
                for guest in entry.guests.iter().filter(|g| g.version() >= 2) {
                    guest.name(name.clone());
                }
                entry.name = Some(name);
            }
            _ => {}
        }
    }
}

impl GlobalDispatch<wl_seat::WlSeat, GlobalData> for Bridge {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_seat::WlSeat>,
        global: &GlobalData,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let Some((seat, binding)) = bind_guest(state, resource, global, data_init) else {
            return;
        };
        let Some(entry) = state
            .seats
            .entries
            .iter_mut()
            .find(|e| Some(e.host_name) == binding.host_name)
        else {
            return;
        };
        seat.capabilities(guest_capabilities(entry.capabilities));
        if let (Some(name), true) = (&entry.name, seat.version() >= 2) {
            seat.name(name.clone());
        }
        entry.guests.push(seat);
    }
}

impl Dispatch<wl_seat::WlSeat, BoundGlobal> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_seat::WlSeat,
        request: wl_seat::Request,
        data: &BoundGlobal,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let Some((seat, host)) = state
            .seats
            .by_host_name(data.host_name())
            .map(|e| (e.host_name, e.proxy.clone()))
        else {
            // the host seat is gone; devices requested now are inert
            match request {
                wl_seat::Request::GetPointer { id } => {
                    data_init.init(id, None);
                }
                wl_seat::Request::GetKeyboard { id } => {
                    data_init.init(id, None);
                }
                wl_seat::Request::GetTouch { id } => {
                    data_init.init(id, None);
                }
                _ => {}
            }
            return;
        };
        let qh = state.qh.clone();
        match request {
            wl_seat::Request::GetPointer { id } => {
                state.seats.pointers.insert_with(|key| {
                    let guest = data_init.init(id, Some(key));
                    let data = PointerData { seat, focus: None };
                    (guest, host.get_pointer(&qh, key), data)
                });
            }
            wl_seat::Request::GetKeyboard { id } => {
                let filter = KeyFilter::new(state.seats.accelerators.clone());
                state.seats.keyboards.insert_with(|key| {
                    let guest = data_init.init(id, Some(key));
                    let data = KeyboardData {
                        seat,
                        filter,
                        keymap: None,
                        focus: None,
                    };
                    (guest, host.get_keyboard(&qh, key), data)
                });
            }
            wl_seat::Request::GetTouch { id } => {
                state.seats.touches.insert_with(|key| {
                    let guest = data_init.init(id, Some(key));
                    (guest, host.get_touch(&qh, key), seat)
                });
            }
            _ => {}
        }
    }

    fn destroyed(state: &mut Self, _client: ClientId, resource: &wl_seat::WlSeat, data: &BoundGlobal) {
        for entry in &mut state.seats.entries {
            entry.guests.retain(|g| g != resource);
        }
        state.unbind(data);
    }
}

impl Dispatch<wl_pointer::WlPointer, Option<PointerKey>> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_pointer::WlPointer,
        request: wl_pointer::Request,
        key: &Option<PointerKey>,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        let Some(host) = key.and_then(|key| state.seats.pointers.proxy(key)).cloned() else {
            return;
        };
        if let wl_pointer::Request::SetCursor {
            serial,
            surface,
            hotspot_x,
            hotspot_y,
        } = request
        {
            let host_surface = surface.as_ref().and_then(|s| state.surfaces.host(s));
            if let Some(key) = surface.as_ref().and_then(|s| s.data::<super::SurfaceKey>()) {
                if let Some(data) = state.surfaces.pairs.data_mut(*key) {
                    data.state.has_role = true;
                }
            }
            host.set_cursor(
                serial,
                host_surface.as_ref(),
                state.to_host(hotspot_x),
                state.to_host(hotspot_y),
            );
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &wl_pointer::WlPointer,
        key: &Option<PointerKey>,
    ) {
        let Some(key) = key else {
            return;
        };
        if let Teardown::Sever { other, .. } = state.seats.pointers.resource_destroyed(*key) {
            if other.version() >= 3 {
                other.release();
            }
        }
    }
}

impl ClientDispatch<HostPointer, PointerKey> for Bridge {
    fn event(
        state: &mut Self,
        _proxy: &HostPointer,
        event: host_pointer::Event,
        key: &PointerKey,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(guest) = state.seats.pointers.resource(*key).cloned() else {
            return;
        };
        let scale = state.scale;
        match event {
            host_pointer::Event::Enter {
                serial,
                surface,
                surface_x,
                surface_y,
            } => {
                let Some(target) = state.surfaces.guest(&surface) else {
                    return;
                };
                state.input_serial(&target, serial);
                state.raise_for_input(&target);
                guest.enter(
                    serial,
                    &target,
                    to_guest(surface_x, scale),
                    to_guest(surface_y, scale),
                );
                if let Some(data) = state.seats.pointers.data_mut(*key) {
                    data.focus = Some(target);
                }
            }
            host_pointer::Event::Leave { serial, .. } => {
                let focus = state
                    .seats
                    .pointers
                    .data_mut(*key)
                    .and_then(|data| data.focus.take());
                if let Some(focus) = focus.filter(|f| f.is_alive()) {
                    guest.leave(serial, &focus);
                }
            }
            host_pointer::Event::Motion {
                time,
                surface_x,
                surface_y,
            } => guest.motion(time, to_guest(surface_x, scale), to_guest(surface_y, scale)),
            host_pointer::Event::Button {
                serial,
                time,
                button,
                state: button_state,
            } => {
                let focus = state.seats.pointers.data(*key).and_then(|d| d.focus.clone());
                match focus {
                    Some(focus) => state.input_serial(&focus, serial),
                    None => state.seats.last_serial = serial,
                }
                if let Ok(button_state) = wl_pointer::ButtonState::try_from(raw(button_state)) {
                    guest.button(serial, time, button, button_state);
                }
            }
            host_pointer::Event::Axis { time, axis, value } => {
                if let Ok(axis) = wl_pointer::Axis::try_from(raw(axis)) {
                    guest.axis(time, axis, to_guest(value, scale));
                }
            }
            host_pointer::Event::Frame if guest.version() >= 5 => guest.frame(),
            host_pointer::Event::AxisSource { axis_source } if guest.version() >= 5 => {
                if let Ok(source) = wl_pointer::AxisSource::try_from(raw(axis_source)) {
                    guest.axis_source(source);
                }
            }
            host_pointer::Event::AxisStop { time, axis } if guest.version() >= 5 => {
                if let Ok(axis) = wl_pointer::Axis::try_from(raw(axis)) {
                    guest.axis_stop(time, axis);
                }
            }
            host_pointer::Event::AxisDiscrete { axis, discrete } if guest.version() >= 5 => {
                if let Ok(axis) = wl_pointer::Axis::try_from(raw(axis)) {
                    guest.axis_discrete(axis, discrete);
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_keyboard::WlKeyboard, Option<KeyboardKey>> for Bridge {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_keyboard::WlKeyboard,
        _request: wl_keyboard::Request,
        _key: &Option<KeyboardKey>,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &wl_keyboard::WlKeyboard,
        key: &Option<KeyboardKey>,
    ) {
        let Some(key) = key else {
            return;
        };
        if let Teardown::Sever { other, .. } = state.seats.keyboards.resource_destroyed(*key) {
            if other.version() >= 3 {
                other.release();
            }
        }
    }
}

impl ClientDispatch<HostKeyboard, KeyboardKey> for Bridge {
    fn event(
        state: &mut Self,
        _proxy: &HostKeyboard,
        event: host_keyboard::Event,
        key: &KeyboardKey,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(guest) = state.seats.keyboards.resource(*key).cloned() else {
            return;
        };
        match event {
            host_keyboard::Event::Keymap { format, fd, size } => {
                let format = raw(format);
                if let Ok(guest_format) = wl_keyboard::KeymapFormat::try_from(format) {
                    guest.keymap(guest_format, fd.as_fd(), size);
                }
                if format != u32::from(host_keyboard::KeymapFormat::XkbV1) {
                    return;
                }
                let keymap = match fd.try_clone() {
                    Ok(dup) => KeymapState::from_fd(&state.seats.xkb, dup, size),
                    Err(err) => Err(err.into()),
                };
                let keymap = match keymap {
                    Ok(keymap) => Some(keymap),
                    Err(err) => {
                        warn!("⚠️ Accelerators disabled: {:#}", err);
                        None
                    }
                };
                if let Some(data) = state.seats.keyboards.data_mut(*key) {
                    data.keymap = keymap;
                }
            }
            host_keyboard::Event::Enter {
                serial,
                surface,
                keys,
            } => {
                let Some(target) = state.surfaces.guest(&surface) else {
                    return;
                };
                state.input_serial(&target, serial);
                guest.enter(serial, &target, keys);
                if let Some(data) = state.seats.keyboards.data_mut(*key) {
                    data.focus = Some(target);
                }
            }
            host_keyboard::Event::Leave { serial, .. } => {
                let focus = state
                    .seats
                    .keyboards
                    .data_mut(*key)
                    .and_then(|data| data.focus.take());
                if let Some(focus) = focus.filter(|f| f.is_alive()) {
                    guest.leave(serial, &focus);
                }
            }
            host_keyboard::Event::Key {
                serial,
                time,
                key: code,
                state: key_state,
            } => {
                let Some(data) = state.seats.keyboards.data_mut(*key) else {
                    return;
                };
                let pressed = raw(key_state) == u32::from(host_keyboard::KeyState::Pressed);
                let verdict = if pressed {
                    let keysym = data.keymap.as_ref().and_then(|k| k.keysym(code));
                    data.filter.press(code, keysym)
                } else {
                    data.filter.release(code)
                };
                let focus = data.focus.clone();
                if let Some(focus) = focus {
                    state.input_serial(&focus, serial);
                }
                if verdict == KeyVerdict::Withhold {
                    trace!("⌨️ Withholding key {}", code);
                    return;
                }
                let key_state = if pressed {
                    wl_keyboard::KeyState::Pressed
                } else {
                    wl_keyboard::KeyState::Released
                };
                guest.key(serial, time, code, key_state);
            }
            host_keyboard::Event::Modifiers {
                serial,
                mods_depressed,
                mods_latched,
                mods_locked,
                group,
            } => {
                if let Some(data) = state.seats.keyboards.data_mut(*key) {
                    if let Some(keymap) = data.keymap.as_mut() {
                        let modifiers =
                            keymap.update_modifiers(mods_depressed, mods_latched, mods_locked, group);
                        data.filter.set_modifiers(modifiers);
                    }
                }
                guest.modifiers(serial, mods_depressed, mods_latched, mods_locked, group);
            }
            host_keyboard::Event::RepeatInfo { rate, delay } if guest.version() >= 4 => {
                guest.repeat_info(rate, delay)
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_touch::WlTouch, Option<TouchKey>> for Bridge {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_touch::WlTouch,
        _request: wl_touch::Request,
        _key: &Option<TouchKey>,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &wl_touch::WlTouch,
        key: &Option<TouchKey>,
    ) {
        let Some(key) = key else {
            return;
        };
        if let Teardown::Sever { other, .. } = state.seats.touches.resource_destroyed(*key) {
            if other.version() >= 3 {
                other.release();
            }
        }
    }
}

impl ClientDispatch<HostTouch, TouchKey> for Bridge {
    fn event(
        state: &mut Self,
        _proxy: &HostTouch,
        event: host_touch::Event,
        key: &TouchKey,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(guest) = state.seats.touches.resource(*key).cloned() else {
            return;
        };
        let scale = state.scale;
        match event {
            host_touch::Event::Down {
                serial,
                time,
                surface,
                id,
                x,
                y,
            } => {
                let Some(target) = state.surfaces.guest(&surface) else {
                    return;
                };
                state.input_serial(&target, serial);
                state.raise_for_input(&target);
                guest.down(serial, time, &target, id, to_guest(x, scale), to_guest(y, scale));
            }
            host_touch::Event::Up { serial, time, id } => {
                state.seats.last_serial = serial;
                guest.up(serial, time, id);
            }
            host_touch::Event::Motion { time, id, x, y } => {
                guest.motion(time, id, to_guest(x, scale), to_guest(y, scale))
            }
            host_touch::Event::Frame => guest.frame(),
            host_touch::Event::Cancel => guest.cancel(),
            _ => {}
        }
    }
}
