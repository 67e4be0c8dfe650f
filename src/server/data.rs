//! `wl_data_device_manager` forwarding for native guests
//!
//! Sources and devices are paired one to one. Host offers are created by the
//! host as children of a device event; the guest offer is created alongside
//! and the two point at each other through user data.

use super::registry::{bind_guest, BoundGlobal, GlobalData};
use super::{Bridge, SurfaceKey};
use crate::bridge::{PairKey, PairTable, Teardown};
use crate::seat::to_guest;
use log::{debug, trace};
use std::os::fd::AsFd;
use std::sync::{Mutex, OnceLock};
use wayland_client::protocol::wl_data_device::{self as host_device, WlDataDevice as HostDataDevice};
use wayland_client::protocol::wl_data_device_manager::DndAction as HostDndAction;
use wayland_client::protocol::wl_data_offer::{self as host_offer, WlDataOffer as HostDataOffer};
use wayland_client::protocol::wl_data_source::{self as host_source, WlDataSource as HostDataSource};
use wayland_client::{event_created_child, Connection, Dispatch as ClientDispatch, Proxy, QueueHandle, WEnum};
use wayland_server::backend::ClientId;
use wayland_server::protocol::wl_data_device_manager::DndAction;
use wayland_server::protocol::{wl_data_device, wl_data_device_manager, wl_data_offer, wl_data_source};
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource};

pub type SourceKey = PairKey<wl_data_source::WlDataSource, HostDataSource>;
pub type DeviceKey = PairKey<wl_data_device::WlDataDevice, HostDataDevice>;

#[derive(Default)]
pub struct DataDevices {
    sources: PairTable<wl_data_source::WlDataSource, HostDataSource>,
    devices: PairTable<wl_data_device::WlDataDevice, HostDataDevice>,
}

/// User data of a host `wl_data_offer`.
#[derive(Debug, Default)]
pub struct HostOfferData {
    /// The guest offer, for offers forwarded to a native guest.
    pub guest: OnceLock<wl_data_offer::WlDataOffer>,
    /// Mime types announced so far.
    pub mimes: Mutex<Vec<String>>,
}

impl HostOfferData {
    pub fn mimes(&self) -> Vec<String> {
        self.mimes.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

pub(crate) fn host_actions(actions: WEnum<DndAction>) -> HostDndAction {
    let bits = match actions {
        WEnum::Value(actions) => actions.bits(),
        WEnum::Unknown(raw) => raw,
    };
    HostDndAction::from_bits_truncate(bits)
}

pub(crate) fn guest_actions(actions: WEnum<HostDndAction>) -> DndAction {
    let bits = match actions {
        WEnum::Value(actions) => actions.bits(),
        WEnum::Unknown(raw) => raw,
    };
    DndAction::from_bits_truncate(bits)
}

impl Bridge {
    fn host_source(&self, source: Option<&wl_data_source::WlDataSource>) -> Option<HostDataSource> {
        let key = source?.data::<Option<SourceKey>>()?.as_ref()?;
        self.data.sources.proxy(*key).cloned()
    }

    /// Give a freshly announced host offer its guest counterpart.
    fn forward_offer(&mut self, device: &wl_data_device::WlDataDevice, offer: &HostDataOffer) {
        let (Some(client), Some(data)) = (device.client(), offer.data::<HostOfferData>()) else {
            return;
        };
        match client.create_resource::<wl_data_offer::WlDataOffer, HostDataOffer, Bridge>(
            &self.display,
            device.version(),
            offer.clone(),
        ) {
            Ok(guest) => {
                device.data_offer(&guest);
                let _ = data.guest.set(guest);
            }
            Err(err) => debug!("🔇 Guest went away before a data offer: {}", err),
        }
    }
}

fn guest_offer(offer: Option<&HostDataOffer>) -> Option<wl_data_offer::WlDataOffer> {
    offer?.data::<HostOfferData>()?.guest.get().cloned()
}

impl GlobalDispatch<wl_data_device_manager::WlDataDeviceManager, GlobalData> for Bridge {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_data_device_manager::WlDataDeviceManager>,
        global: &GlobalData,
        data_init: &mut DataInit<'_, Self>,
    ) {
        bind_guest(state, resource, global, data_init);
    }
}

impl Dispatch<wl_data_device_manager::WlDataDeviceManager, BoundGlobal> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_data_device_manager::WlDataDeviceManager,
        request: wl_data_device_manager::Request,
        _data: &BoundGlobal,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let manager = state.host.data_device_manager.clone();
        let qh = state.qh.clone();
        match request {
            wl_data_device_manager::Request::CreateDataSource { id } => {
                let Some(manager) = manager else {
                    data_init.init(id, None);
                    return;
                };
                state.data.sources.insert_with(|key| {
                    let guest = data_init.init(id, Some(key));
                    (guest, manager.create_data_source(&qh, key), ())
                });
            }
            wl_data_device_manager::Request::GetDataDevice { id, seat } => {
                let host_seat = seat
                    .data::<BoundGlobal>()
                    .and_then(BoundGlobal::host_name)
                    .and_then(|name| state.seats.by_name(name));
                let (Some(manager), Some(host_seat)) = (manager, host_seat) else {
                    data_init.init(id, None);
                    return;
                };
                state.data.devices.insert_with(|key| {
                    let guest = data_init.init(id, Some(key));
                    (guest, manager.get_data_device(&host_seat, &qh, key), ())
                });
            }
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &wl_data_device_manager::WlDataDeviceManager,
        data: &BoundGlobal,
    ) {
        state.unbind(data);
    }
}

impl Dispatch<wl_data_source::WlDataSource, Option<SourceKey>> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_data_source::WlDataSource,
        request: wl_data_source::Request,
        key: &Option<SourceKey>,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        let Some(host) = key.and_then(|key| state.data.sources.proxy(key)) else {
            return;
        };
        match request {
            wl_data_source::Request::Offer { mime_type } => host.offer(mime_type),
            wl_data_source::Request::SetActions { dnd_actions } if host.version() >= 3 => {
                host.set_actions(host_actions(dnd_actions))
            }
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &wl_data_source::WlDataSource,
        key: &Option<SourceKey>,
    ) {
        if let Some(key) = key {
            if let Teardown::Sever { other, .. } = state.data.sources.resource_destroyed(*key) {
                other.destroy();
            }
        }
    }
}

impl ClientDispatch<HostDataSource, SourceKey> for Bridge {
    fn event(
        state: &mut Self,
        _proxy: &HostDataSource,
        event: host_source::Event,
        key: &SourceKey,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(guest) = state.data.sources.resource(*key) else {
            return;
        };
        let version = guest.version();
        match event {
            host_source::Event::Target { mime_type } => guest.target(mime_type),
            host_source::Event::Send { mime_type, fd } => {
                trace!("📤 Guest source asked for {}", mime_type);
                guest.send(mime_type, fd.as_fd());
            }
            host_source::Event::Cancelled => guest.cancelled(),
            host_source::Event::DndDropPerformed if version >= 3 => guest.dnd_drop_performed(),
            host_source::Event::DndFinished if version >= 3 => guest.dnd_finished(),
            host_source::Event::Action { dnd_action } if version >= 3 => {
                guest.action(guest_actions(dnd_action))
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_data_device::WlDataDevice, Option<DeviceKey>> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_data_device::WlDataDevice,
        request: wl_data_device::Request,
        key: &Option<DeviceKey>,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        let Some(host) = key.and_then(|key| state.data.devices.proxy(key)).cloned() else {
            return;
        };
        match request {
            wl_data_device::Request::StartDrag {
                source,
                origin,
                icon,
                serial,
            } => {
                let Some(origin) = state.surfaces.host(&origin) else {
                    return;
                };
                if let Some(key) = icon.as_ref().and_then(|i| i.data::<SurfaceKey>()) {
                    if let Some(data) = state.surfaces.pairs.data_mut(*key) {
                        data.state.has_role = true;
                    }
                }
                let icon = icon.as_ref().and_then(|i| state.surfaces.host(i));
                let source = state.host_source(source.as_ref());
                host.start_drag(source.as_ref(), &origin, icon.as_ref(), serial);
            }
            wl_data_device::Request::SetSelection { source, serial } => {
                let source = state.host_source(source.as_ref());
                host.set_selection(source.as_ref(), serial);
            }
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &wl_data_device::WlDataDevice,
        key: &Option<DeviceKey>,
    ) {
        if let Some(key) = key {
            if let Teardown::Sever { other, .. } = state.data.devices.resource_destroyed(*key) {
                if other.version() >= 2 {
                    other.release();
                }
            }
        }
    }
}

impl ClientDispatch<HostDataDevice, DeviceKey> for Bridge {
    fn event(
        state: &mut Self,
        _proxy: &HostDataDevice,
        event: host_device::Event,
        key: &DeviceKey,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(guest) = state.data.devices.resource(*key).cloned() else {
            return;
        };
        let scale = state.scale;
        match event {
            host_device::Event::DataOffer { id } => state.forward_offer(&guest, &id),
            host_device::Event::Enter {
                serial,
                surface,
                x,
                y,
                id,
            } => {
                let Some(target) = state.surfaces.guest(&surface) else {
                    return;
                };
                guest.enter(
                    serial,
                    &target,
                    to_guest(x, scale),
                    to_guest(y, scale),
                    guest_offer(id.as_ref()).as_ref(),
                );
            }
            host_device::Event::Leave => guest.leave(),
            host_device::Event::Motion { time, x, y } => {
                guest.motion(time, to_guest(x, scale), to_guest(y, scale))
            }
            host_device::Event::Drop => guest.drop(),
            host_device::Event::Selection { id } => guest.selection(guest_offer(id.as_ref()).as_ref()),
            _ => {}
        }
    }

    event_created_child!(Bridge, HostDataDevice, [
        host_device::EVT_DATA_OFFER_OPCODE => (HostDataOffer, HostOfferData::default()),
    ]);
}

impl Dispatch<wl_data_offer::WlDataOffer, HostDataOffer> for Bridge {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_data_offer::WlDataOffer,
        request: wl_data_offer::Request,
        host: &HostDataOffer,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_data_offer::Request::Accept { serial, mime_type } => host.accept(serial, mime_type),
            wl_data_offer::Request::Receive { mime_type, fd } => {
                trace!("📥 Guest receives {}", mime_type);
                host.receive(mime_type, fd.as_fd());
            }
            wl_data_offer::Request::Finish if host.version() >= 3 => host.finish(),
            wl_data_offer::Request::SetActions {
                dnd_actions,
                preferred_action,
            } if host.version() >= 3 => {
                host.set_actions(host_actions(dnd_actions), host_actions(preferred_action))
            }
            _ => {}
        }
    }

    fn destroyed(
        _state: &mut Self,
        _client: ClientId,
        _resource: &wl_data_offer::WlDataOffer,
        host: &HostDataOffer,
    ) {
        host.destroy();
    }
}

impl ClientDispatch<HostDataOffer, HostOfferData> for Bridge {
    fn event(
        _state: &mut Self,
        _proxy: &HostDataOffer,
        event: host_offer::Event,
        data: &HostOfferData,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let guest = data.guest.get();
        match event {
            host_offer::Event::Offer { mime_type } => {
                if let Some(guest) = guest {
                    guest.offer(mime_type.clone());
                }
                if let Ok(mut mimes) = data.mimes.lock() {
                    mimes.push(mime_type);
                }
            }
            host_offer::Event::SourceActions { source_actions } => {
                if let Some(guest) = guest.filter(|g| g.version() >= 3) {
                    guest.source_actions(guest_actions(source_actions));
                }
            }
            host_offer::Event::Action { dnd_action } => {
                if let Some(guest) = guest.filter(|g| g.version() >= 3) {
                    guest.action(guest_actions(dnd_action));
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actions_cross_sides_unchanged() {
        let both = DndAction::Copy | DndAction::Move;
        assert_eq!(host_actions(WEnum::Value(both)).bits(), both.bits());
        assert_eq!(guest_actions(WEnum::Unknown(0b100)), DndAction::Ask);
        assert!(host_actions(WEnum::Unknown(0x80)).is_empty());
    }

    #[test]
    fn test_offer_mimes_accumulate() {
        let data = HostOfferData::default();
        data.mimes.lock().unwrap().push("text/plain".into());
        data.mimes.lock().unwrap().push("UTF8_STRING".into());
        assert_eq!(data.mimes(), vec!["text/plain", "UTF8_STRING"]);
        assert!(data.guest.get().is_none());
    }
}
