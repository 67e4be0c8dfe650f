//! Relative pointer and pointer constraint forwarding
//!
//! Both extensions hang off a guest `wl_pointer`. Each guest object gets one
//! host object created on the host pointer behind it; the host object carries
//! the guest resource so its events can be relayed. When the host side is
//! missing (no host extension, or a severed pointer) the guest object stays
//! inert.

use super::registry::{bind_guest, BoundGlobal, GlobalData};
use super::Bridge;
use crate::seat::{position_to_host, to_guest};
use log::debug;
use std::sync::OnceLock;
use wayland_client::protocol::wl_pointer::WlPointer as HostPointer;
use wayland_client::protocol::wl_region::WlRegion as HostRegion;
use wayland_client::protocol::wl_surface::WlSurface as HostSurface;
use wayland_client::{delegate_noop, Connection, Dispatch as ClientDispatch, QueueHandle};
use wayland_protocols::wp::pointer_constraints::zv1::client::zwp_confined_pointer_v1::{
    self as host_confined, ZwpConfinedPointerV1 as HostConfinedPointer,
};
use wayland_protocols::wp::pointer_constraints::zv1::client::zwp_locked_pointer_v1::{
    self as host_locked, ZwpLockedPointerV1 as HostLockedPointer,
};
use wayland_protocols::wp::pointer_constraints::zv1::client::zwp_pointer_constraints_v1::{
    self as host_constraints, ZwpPointerConstraintsV1 as HostPointerConstraints,
};
use wayland_protocols::wp::pointer_constraints::zv1::server::{
    zwp_confined_pointer_v1, zwp_locked_pointer_v1, zwp_pointer_constraints_v1,
};
use wayland_protocols::wp::relative_pointer::zv1::client::zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1 as HostRelativePointerManager;
use wayland_protocols::wp::relative_pointer::zv1::client::zwp_relative_pointer_v1::{
    self as host_relative, ZwpRelativePointerV1 as HostRelativePointer,
};
use wayland_protocols::wp::relative_pointer::zv1::server::{
    zwp_relative_pointer_manager_v1, zwp_relative_pointer_v1,
};
use wayland_server::backend::ClientId;
use wayland_server::protocol::{wl_pointer, wl_region, wl_surface};
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource, WEnum};

/// User data of a forwarded guest object: its host object, once created.
pub type HostSide<P> = OnceLock<P>;

fn host_region(region: Option<&wl_region::WlRegion>) -> Option<HostRegion> {
    region.and_then(|r| r.data::<HostRegion>()).cloned()
}

fn host_lifetime(lifetime: WEnum<zwp_pointer_constraints_v1::Lifetime>) -> host_constraints::Lifetime {
    let raw = match lifetime {
        WEnum::Value(value) => u32::from(value),
        WEnum::Unknown(raw) => raw,
    };
    host_constraints::Lifetime::try_from(raw).unwrap_or(host_constraints::Lifetime::Persistent)
}

impl GlobalDispatch<zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1, GlobalData>
    for Bridge
{
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1>,
        global: &GlobalData,
        data_init: &mut DataInit<'_, Self>,
    ) {
        bind_guest(state, resource, global, data_init);
    }
}

impl Dispatch<zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1, BoundGlobal>
    for Bridge
{
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1,
        request: zwp_relative_pointer_manager_v1::Request,
        _data: &BoundGlobal,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let zwp_relative_pointer_manager_v1::Request::GetRelativePointer { id, pointer } = request
        else {
            return;
        };
        let guest = data_init.init(id, HostSide::<HostRelativePointer>::new());
        let manager = state.host.relative_pointer_manager.clone();
        let (Some(manager), Some(host_pointer)) = (manager, state.seats.host_pointer(&pointer))
        else {
            debug!("🔕 Relative pointer without a host side");
            return;
        };
        let host = manager.get_relative_pointer(&host_pointer, &state.qh, guest.clone());
        if let Some(slot) = guest.data::<HostSide<HostRelativePointer>>() {
            let _ = slot.set(host);
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1,
        data: &BoundGlobal,
    ) {
        state.unbind(data);
    }
}

impl Dispatch<zwp_relative_pointer_v1::ZwpRelativePointerV1, HostSide<HostRelativePointer>>
    for Bridge
{
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &zwp_relative_pointer_v1::ZwpRelativePointerV1,
        _request: zwp_relative_pointer_v1::Request,
        _data: &HostSide<HostRelativePointer>,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }

    fn destroyed(
        _state: &mut Self,
        _client: ClientId,
        _resource: &zwp_relative_pointer_v1::ZwpRelativePointerV1,
        host: &HostSide<HostRelativePointer>,
    ) {
        if let Some(host) = host.get() {
            host.destroy();
        }
    }
}

impl ClientDispatch<HostRelativePointer, zwp_relative_pointer_v1::ZwpRelativePointerV1> for Bridge {
    fn event(
        state: &mut Self,
        _proxy: &HostRelativePointer,
        event: host_relative::Event,
        guest: &zwp_relative_pointer_v1::ZwpRelativePointerV1,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let host_relative::Event::RelativeMotion {
            utime_hi,
            utime_lo,
            dx,
            dy,
            dx_unaccel,
            dy_unaccel,
        } = event
        {
            let scale = state.scale;
            guest.relative_motion(
                utime_hi,
                utime_lo,
                to_guest(dx, scale),
                to_guest(dy, scale),
                to_guest(dx_unaccel, scale),
                to_guest(dy_unaccel, scale),
            );
        }
    }
}

impl GlobalDispatch<zwp_pointer_constraints_v1::ZwpPointerConstraintsV1, GlobalData> for Bridge {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<zwp_pointer_constraints_v1::ZwpPointerConstraintsV1>,
        global: &GlobalData,
        data_init: &mut DataInit<'_, Self>,
    ) {
        bind_guest(state, resource, global, data_init);
    }
}

impl Bridge {
    /// Host constraint manager plus the host objects a constraint on
    /// `surface` through `pointer` is created from.
    fn constraint_targets(
        &self,
        surface: &wl_surface::WlSurface,
        pointer: &wl_pointer::WlPointer,
    ) -> Option<(HostPointerConstraints, HostSurface, HostPointer)> {
        let manager = self.host.pointer_constraints.clone()?;
        let host_surface = self.surfaces.host(surface)?;
        let host_pointer = self.seats.host_pointer(pointer)?;
        Some((manager, host_surface, host_pointer))
    }
}

impl Dispatch<zwp_pointer_constraints_v1::ZwpPointerConstraintsV1, BoundGlobal> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &zwp_pointer_constraints_v1::ZwpPointerConstraintsV1,
        request: zwp_pointer_constraints_v1::Request,
        _data: &BoundGlobal,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let qh = state.qh.clone();
        match request {
            zwp_pointer_constraints_v1::Request::LockPointer {
                id,
                surface,
                pointer,
                region,
                lifetime,
            } => {
                let guest = data_init.init(id, HostSide::<HostLockedPointer>::new());
                let Some((manager, host_surface, host_pointer)) =
                    state.constraint_targets(&surface, &pointer)
                else {
                    debug!("🔕 Pointer lock without a host side");
                    return;
                };
                let host = manager.lock_pointer(
                    &host_surface,
                    &host_pointer,
                    host_region(region.as_ref()).as_ref(),
                    host_lifetime(lifetime),
                    &qh,
                    guest.clone(),
                );
                if let Some(slot) = guest.data::<HostSide<HostLockedPointer>>() {
                    let _ = slot.set(host);
                }
            }
            zwp_pointer_constraints_v1::Request::ConfinePointer {
                id,
                surface,
                pointer,
                region,
                lifetime,
            } => {
                let guest = data_init.init(id, HostSide::<HostConfinedPointer>::new());
                let Some((manager, host_surface, host_pointer)) =
                    state.constraint_targets(&surface, &pointer)
                else {
                    debug!("🔕 Pointer confinement without a host side");
                    return;
                };
                let host = manager.confine_pointer(
                    &host_surface,
                    &host_pointer,
                    host_region(region.as_ref()).as_ref(),
                    host_lifetime(lifetime),
                    &qh,
                    guest.clone(),
                );
                if let Some(slot) = guest.data::<HostSide<HostConfinedPointer>>() {
                    let _ = slot.set(host);
                }
            }
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &zwp_pointer_constraints_v1::ZwpPointerConstraintsV1,
        data: &BoundGlobal,
    ) {
        state.unbind(data);
    }
}

impl Dispatch<zwp_locked_pointer_v1::ZwpLockedPointerV1, HostSide<HostLockedPointer>> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &zwp_locked_pointer_v1::ZwpLockedPointerV1,
        request: zwp_locked_pointer_v1::Request,
        host: &HostSide<HostLockedPointer>,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        let Some(host) = host.get() else {
            return;
        };
        match request {
            zwp_locked_pointer_v1::Request::SetCursorPositionHint {
                surface_x,
                surface_y,
            } => host.set_cursor_position_hint(
                position_to_host(surface_x, state.scale),
                position_to_host(surface_y, state.scale),
            ),
            zwp_locked_pointer_v1::Request::SetRegion { region } => {
                host.set_region(host_region(region.as_ref()).as_ref())
            }
            _ => {}
        }
    }

    fn destroyed(
        _state: &mut Self,
        _client: ClientId,
        _resource: &zwp_locked_pointer_v1::ZwpLockedPointerV1,
        host: &HostSide<HostLockedPointer>,
    ) {
        if let Some(host) = host.get() {
            host.destroy();
        }
    }
}

impl Dispatch<zwp_confined_pointer_v1::ZwpConfinedPointerV1, HostSide<HostConfinedPointer>>
    for Bridge
{
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &zwp_confined_pointer_v1::ZwpConfinedPointerV1,
        request: zwp_confined_pointer_v1::Request,
        host: &HostSide<HostConfinedPointer>,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let (Some(host), zwp_confined_pointer_v1::Request::SetRegion { region }) =
            (host.get(), request)
        {
            host.set_region(host_region(region.as_ref()).as_ref());
        }
    }

    fn destroyed(
        _state: &mut Self,
        _client: ClientId,
        _resource: &zwp_confined_pointer_v1::ZwpConfinedPointerV1,
        host: &HostSide<HostConfinedPointer>,
    ) {
        if let Some(host) = host.get() {
            host.destroy();
        }
    }
}

impl ClientDispatch<HostLockedPointer, zwp_locked_pointer_v1::ZwpLockedPointerV1> for Bridge {
    fn event(
        _state: &mut Self,
        _proxy: &HostLockedPointer,
        event: host_locked::Event,
        guest: &zwp_locked_pointer_v1::ZwpLockedPointerV1,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            host_locked::Event::Locked => guest.locked(),
            host_locked::Event::Unlocked => guest.unlocked(),
            _ => {}
        }
    }
}

impl ClientDispatch<HostConfinedPointer, zwp_confined_pointer_v1::ZwpConfinedPointerV1> for Bridge {
    fn event(
        _state: &mut Self,
        _proxy: &HostConfinedPointer,
        event: host_confined::Event,
        guest: &zwp_confined_pointer_v1::ZwpConfinedPointerV1,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            host_confined::Event::Confined => guest.confined(),
            host_confined::Event::Unconfined => guest.unconfined(),
            _ => {}
        }
    }
}

delegate_noop!(Bridge: HostRelativePointerManager);
delegate_noop!(Bridge: HostPointerConstraints);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifetime_crosses_unchanged() {
        assert_eq!(
            host_lifetime(WEnum::Value(zwp_pointer_constraints_v1::Lifetime::Oneshot)),
            host_constraints::Lifetime::Oneshot
        );
        assert_eq!(
            host_lifetime(WEnum::Value(zwp_pointer_constraints_v1::Lifetime::Persistent)),
            host_constraints::Lifetime::Persistent
        );
        assert_eq!(host_lifetime(WEnum::Unknown(9)), host_constraints::Lifetime::Persistent);
    }
}
