//! `wl_output` forwarding
//!
//! Every host output is bound once. Its state is collected until `done` and
//! then announced, translated, to every guest output bound from it.

use super::registry::{bind_guest, BoundGlobal, GlobalData};
use super::Bridge;
use crate::output::{self, HostOutputInfo, OutputAnnouncement, ScaleContext, MODE_CURRENT};
use log::debug;
use wayland_client::protocol::wl_output::{self as host_output, WlOutput as HostOutput};
use wayland_client::{Connection, Dispatch as ClientDispatch, Proxy, QueueHandle, WEnum};
use wayland_server::protocol::wl_output;
use wayland_server::backend::ClientId;
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource};

pub struct OutputEntry {
    pub host_name: u32,
    pub proxy: HostOutput,
    /// State as of the last `done`.
    pub info: HostOutputInfo,
    pending: HostOutputInfo,
    pub guests: Vec<wl_output::WlOutput>,
}

#[derive(Default)]
pub struct Outputs {
    entries: Vec<OutputEntry>,
}

impl Outputs {
    pub fn add(&mut self, host_name: u32, proxy: HostOutput) {
        // without a shell extension naming it, the first output is the internal one
        let info = HostOutputInfo {
            internal: self.entries.is_empty(),
            ..HostOutputInfo::default()
        };
        self.entries.push(OutputEntry {
            host_name,
            proxy,
            pending: info.clone(),
            info,
            guests: Vec::new(),
        });
    }

    pub fn remove(&mut self, host_name: u32) {
        if let Some(index) = self.entries.iter().position(|e| e.host_name == host_name) {
            let entry = self.entries.remove(index);
            if entry.proxy.version() >= 3 {
                entry.proxy.release();
            }
        }
    }

    pub fn internal(&self) -> Option<&HostOutputInfo> {
        self.entries
            .iter()
            .map(|e| &e.info)
            .find(|info| info.internal)
    }

    fn entry_mut(&mut self, proxy: &HostOutput) -> Option<&mut OutputEntry> {
        self.entries.iter_mut().find(|e| &e.proxy == proxy)
    }

    /// Guest outputs bound from `proxy` that belong to `client`.
    pub fn guests_for(&self, proxy: &HostOutput, client: &Client) -> Vec<wl_output::WlOutput> {
        self.entries
            .iter()
            .filter(|e| &e.proxy == proxy)
            .flat_map(|e| e.guests.iter())
            .filter(|o| o.client().map_or(false, |c| c.id() == client.id()))
            .cloned()
            .collect()
    }

    /// Host output a guest output was bound from.
    pub fn host_for(&self, guest: &wl_output::WlOutput) -> Option<HostOutput> {
        self.entries
            .iter()
            .find(|e| e.guests.contains(guest))
            .map(|e| e.proxy.clone())
    }

    /// Guest outputs of the internal output that belong to `client`.
    pub fn internal_guests(&self, client: &Client) -> Vec<wl_output::WlOutput> {
        match self.entries.iter().find(|e| e.info.internal) {
            Some(entry) => self.guests_for(&entry.proxy, client),
            None => Vec::new(),
        }
    }
}

fn wenum<T: Into<u32>>(value: WEnum<T>) -> u32 {
    match value {
        WEnum::Value(value) => value.into(),
        WEnum::Unknown(raw) => raw,
    }
}

fn send_announcement(guest: &wl_output::WlOutput, a: &OutputAnnouncement) {
    guest.geometry(
        0,
        0,
        a.physical_width,
        a.physical_height,
        wl_output::Subpixel::try_from(a.subpixel as u32).unwrap_or(wl_output::Subpixel::Unknown),
        a.make.clone(),
        a.model.clone(),
        wl_output::Transform::try_from(a.transform as u32).unwrap_or(wl_output::Transform::Normal),
    );
    guest.mode(
        wl_output::Mode::from_bits_truncate(a.mode_flags),
        a.width,
        a.height,
        a.refresh,
    );
    if let Some(scale) = a.scale {
        guest.scale(scale);
    }
    if a.done {
        guest.done();
    }
}

impl Bridge {
    fn scale_context(&self) -> ScaleContext {
        ScaleContext {
            scale: self.scale,
            xwayland: self.options.xwayland,
            dpi_buckets: self.options.dpi.clone(),
        }
    }

    /// Send the current state of every output to every guest output.
    pub(crate) fn announce_outputs(&self) {
        let ctx = self.scale_context();
        let internal = self.outputs.internal();
        for entry in &self.outputs.entries {
            for guest in &entry.guests {
                let a = output::announcement(&entry.info, internal, &ctx, guest.version());
                send_announcement(guest, &a);
            }
        }
    }

    fn output_done(&mut self, proxy: &HostOutput) {
        let Some(entry) = self.outputs.entry_mut(proxy) else {
            return;
        };
        entry.info = entry.pending.clone();
        debug!(
            "🖥️ Host output {} is {}x{} at scale {}",
            entry.host_name,
            entry.info.width,
            entry.info.height,
            entry.info.applied_scale()
        );
        // the internal output's density feeds every other output
        self.announce_outputs();
    }
}

impl ClientDispatch<HostOutput, ()> for Bridge {
    fn event(
        state: &mut Self,
        proxy: &HostOutput,
        event: host_output::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(entry) = state.outputs.entry_mut(proxy) else {
            return;
        };
        let pending = &mut entry.pending;
        match event {
            host_output::Event::Geometry {
                physical_width,
                physical_height,
                subpixel,
                make,
                model,
                transform,
                ..
            } => {
                pending.physical_width = physical_width;
                pending.physical_height = physical_height;
                pending.subpixel = wenum(subpixel) as i32;
                pending.make = make;
                pending.model = model;
                pending.transform = wenum(transform) as i32;
            }
            host_output::Event::Mode {
                flags,
                width,
                height,
                refresh,
            } => {
                let flags = match flags {
                    WEnum::Value(mode) => mode.bits(),
                    WEnum::Unknown(raw) => raw,
                };
                if flags & MODE_CURRENT == 0 {
                    return;
                }
                pending.flags = flags;
                pending.width = width;
                pending.height = height;
                pending.refresh = refresh;
            }
            host_output::Event::Scale { factor } => pending.scale_factor = factor,
            host_output::Event::Done => {
                state.output_done(proxy);
                return;
            }
            _ => return,
        }
        // version 1 outputs never send done
        if proxy.version() < 2 {
            state.output_done(proxy);
        }
    }
}

impl GlobalDispatch<wl_output::WlOutput, GlobalData> for Bridge {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_output::WlOutput>,
        global: &GlobalData,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let Some((output, binding)) = bind_guest(state, resource, global, data_init) else {
            return;
        };
        let ctx = state.scale_context();
        let internal = state.outputs.internal().cloned();
        let Some(entry) = state
            .outputs
            .entries
            .iter_mut()
            .find(|e| Some(e.host_name) == binding.host_name)
        else {
            return;
        };
        let a = output::announcement(&entry.info, internal.as_ref(), &ctx, output.version());
        send_announcement(&output, &a);
        entry.guests.push(output);
    }
}

impl Dispatch<wl_output::WlOutput, BoundGlobal> for Bridge {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_output::WlOutput,
        _request: wl_output::Request,
        _data: &BoundGlobal,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        resource: &wl_output::WlOutput,
        data: &BoundGlobal,
    ) {
        for entry in &mut state.outputs.entries {
            entry.guests.retain(|o| o != resource);
        }
        state.unbind(data);
    }
}
