//! Host registry and guest globals
//!
//! Host globals are bound once by the bridge. Those the guest may use are
//! re-advertised through the [`GlobalTable`], which publishes them on the
//! guest display via [`GuestRegistry`].

use super::Bridge;
use crate::bridge::{Binding, GlobalKind, RegistrySink};
use log::{debug, info};
use std::sync::OnceLock;
use wayland_client::protocol::wl_compositor::WlCompositor as HostCompositor;
use wayland_client::protocol::wl_data_device_manager::WlDataDeviceManager as HostDataDeviceManager;
use wayland_client::protocol::wl_registry;
use wayland_client::protocol::wl_shm::{self as host_shm, WlShm as HostShm};
use wayland_client::protocol::wl_subcompositor::WlSubcompositor as HostSubcompositor;
use wayland_client::{delegate_noop, Connection, Dispatch, QueueHandle, WEnum};
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1;
use wayland_protocols::wp::pointer_constraints::zv1::client::zwp_pointer_constraints_v1::ZwpPointerConstraintsV1;
use wayland_protocols::wp::pointer_constraints::zv1::server::zwp_pointer_constraints_v1;
use wayland_protocols::wp::relative_pointer::zv1::client::zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1;
use wayland_protocols::wp::relative_pointer::zv1::server::zwp_relative_pointer_manager_v1;
use wayland_protocols::wp::viewporter::client::wp_viewporter::WpViewporter;
use wayland_protocols::xdg::decoration::zv1::client::zxdg_decoration_manager_v1::ZxdgDecorationManagerV1;
use wayland_protocols::xdg::shell::client::xdg_wm_base::{self as host_wm_base, XdgWmBase};
use wayland_server::backend::GlobalId;
use wayland_server::protocol::{
    wl_compositor, wl_data_device_manager, wl_output, wl_seat, wl_shm, wl_subcompositor,
};
use wayland_server::{DataInit, DisplayHandle, New, Resource};
use wayland_protocols::wp::viewporter::server::wp_viewporter;
use wayland_protocols::xdg::shell::server::xdg_wm_base;

pub const COMPOSITOR_VERSION: u32 = 3;
pub const SUBCOMPOSITOR_VERSION: u32 = 1;
pub const SHM_VERSION: u32 = 1;
pub const OUTPUT_VERSION: u32 = 3;
pub const SEAT_VERSION: u32 = 5;
pub const DATA_DEVICE_MANAGER_VERSION: u32 = 3;
pub const XDG_WM_BASE_VERSION: u32 = 1;
pub const VIEWPORTER_VERSION: u32 = 1;
pub const RELATIVE_POINTER_MANAGER_VERSION: u32 = 1;
pub const POINTER_CONSTRAINTS_VERSION: u32 = 1;
const LINUX_DMABUF_VERSION: u32 = 2;
const DECORATION_MANAGER_VERSION: u32 = 1;

/// Host globals bound by the bridge itself.
pub struct HostGlobals {
    pub registry: wl_registry::WlRegistry,
    pub compositor: Option<HostCompositor>,
    pub subcompositor: Option<HostSubcompositor>,
    pub shm: Option<HostShm>,
    /// `wl_shm.format` codes announced by the host.
    pub shm_formats: Vec<u32>,
    pub xdg_wm_base: Option<XdgWmBase>,
    pub viewporter: Option<WpViewporter>,
    pub linux_dmabuf: Option<ZwpLinuxDmabufV1>,
    pub decoration: Option<ZxdgDecorationManagerV1>,
    pub relative_pointer_manager: Option<ZwpRelativePointerManagerV1>,
    pub pointer_constraints: Option<ZwpPointerConstraintsV1>,
    pub data_device_manager: Option<HostDataDeviceManager>,
}

impl HostGlobals {
    pub fn new(registry: wl_registry::WlRegistry) -> Self {
        Self {
            registry,
            compositor: None,
            subcompositor: None,
            shm: None,
            shm_formats: Vec::new(),
            xdg_wm_base: None,
            viewporter: None,
            linux_dmabuf: None,
            decoration: None,
            relative_pointer_manager: None,
            pointer_constraints: None,
            data_device_manager: None,
        }
    }
}

/// User data of a guest global: our table name.
#[derive(Debug, Clone, Copy)]
pub struct GlobalData {
    pub name: u32,
}

/// User data of a resource bound from a guest global.
///
/// The negotiated binding is only known once the resource exists, hence the
/// cell.
#[derive(Debug, Default)]
pub struct BoundGlobal {
    slot: OnceLock<Binding>,
}

impl BoundGlobal {
    pub fn binding(&self) -> Option<&Binding> {
        self.slot.get()
    }

    pub fn host_name(&self) -> Option<u32> {
        self.slot.get().and_then(|b| b.host_name)
    }
}

/// Publishes globals on the guest display.
pub struct GuestRegistry<'a> {
    pub display: &'a DisplayHandle,
}

impl RegistrySink for GuestRegistry<'_> {
    type Handle = GlobalId;

    fn publish(&mut self, name: u32, kind: GlobalKind, version: u32) -> GlobalId {
        let data = GlobalData { name };
        let dh = self.display;
        match kind {
            GlobalKind::Compositor => {
                dh.create_global::<Bridge, wl_compositor::WlCompositor, _>(version, data)
            }
            GlobalKind::Subcompositor => {
                dh.create_global::<Bridge, wl_subcompositor::WlSubcompositor, _>(version, data)
            }
            GlobalKind::Shm => dh.create_global::<Bridge, wl_shm::WlShm, _>(version, data),
            GlobalKind::Output => dh.create_global::<Bridge, wl_output::WlOutput, _>(version, data),
            GlobalKind::Seat => dh.create_global::<Bridge, wl_seat::WlSeat, _>(version, data),
            GlobalKind::DataDeviceManager => dh
                .create_global::<Bridge, wl_data_device_manager::WlDataDeviceManager, _>(
                    version, data,
                ),
            GlobalKind::XdgWmBase => {
                dh.create_global::<Bridge, xdg_wm_base::XdgWmBase, _>(version, data)
            }
            GlobalKind::Viewporter => {
                dh.create_global::<Bridge, wp_viewporter::WpViewporter, _>(version, data)
            }
            GlobalKind::RelativePointerManager => dh.create_global::<
                Bridge,
                zwp_relative_pointer_manager_v1::ZwpRelativePointerManagerV1,
                _,
            >(version, data),
            GlobalKind::PointerConstraints => dh.create_global::<
                Bridge,
                zwp_pointer_constraints_v1::ZwpPointerConstraintsV1,
                _,
            >(version, data),
        }
    }

    fn retract(&mut self, handle: GlobalId) {
        self.display.remove_global::<Bridge>(handle);
    }
}

/// Initialise a resource bound from a guest global and record the binding.
/// Returns `None` (after killing the guest) when the bind is invalid.
pub(crate) fn bind_guest<I>(
    state: &mut Bridge,
    resource: New<I>,
    global: &GlobalData,
    data_init: &mut DataInit<'_, Bridge>,
) -> Option<(I, Binding)>
where
    I: Resource + 'static,
    Bridge: wayland_server::Dispatch<I, BoundGlobal>,
{
    let resource = data_init.init(resource, BoundGlobal::default());
    match state.globals.bind(global.name, resource.version()) {
        Ok(binding) => {
            if let Some(data) = resource.data::<BoundGlobal>() {
                let _ = data.slot.set(binding);
            }
            Some((resource, binding))
        }
        Err(err) => {
            state.report(&resource, err);
            None
        }
    }
}

impl Bridge {
    pub(crate) fn advertise(&mut self, kind: GlobalKind, version: u32, host_name: u32) -> u32 {
        let mut sink = GuestRegistry {
            display: &self.display,
        };
        self.globals.advertise(&mut sink, kind, version, Some(host_name))
    }

    pub(crate) fn unbind(&mut self, data: &BoundGlobal) {
        if let Some(binding) = data.binding() {
            self.globals.unbind(binding);
        }
    }

    fn host_global(&mut self, name: u32, interface: &str, version: u32) {
        let registry = self.host.registry.clone();
        let qh = self.qh.clone();
        match interface {
            "wl_compositor" => {
                let version = version.min(COMPOSITOR_VERSION);
                self.host.compositor = Some(registry.bind(name, version, &qh, ()));
                self.advertise(GlobalKind::Compositor, version, name);
            }
            "wl_subcompositor" => {
                let version = version.min(SUBCOMPOSITOR_VERSION);
                self.host.subcompositor = Some(registry.bind(name, version, &qh, ()));
                self.advertise(GlobalKind::Subcompositor, version, name);
            }
            "wl_shm" => {
                let version = version.min(SHM_VERSION);
                self.host.shm = Some(registry.bind(name, version, &qh, ()));
                self.advertise(GlobalKind::Shm, version, name);
            }
            "wl_output" => {
                let version = version.min(OUTPUT_VERSION);
                let proxy = registry.bind(name, version, &qh, ());
                self.outputs.add(name, proxy);
                self.advertise(GlobalKind::Output, version, name);
            }
            "wl_seat" => {
                let version = version.min(SEAT_VERSION);
                let proxy = registry.bind(name, version, &qh, ());
                self.seats.add(name, proxy);
                self.advertise(GlobalKind::Seat, version, name);
            }
            "wl_data_device_manager" => {
                let version = version.min(DATA_DEVICE_MANAGER_VERSION);
                self.host.data_device_manager = Some(registry.bind(name, version, &qh, ()));
                self.advertise(GlobalKind::DataDeviceManager, version, name);
            }
            "xdg_wm_base" => {
                let version = version.min(XDG_WM_BASE_VERSION);
                self.host.xdg_wm_base = Some(registry.bind(name, version, &qh, ()));
                self.advertise(GlobalKind::XdgWmBase, version, name);
            }
            "wp_viewporter" => {
                let version = version.min(VIEWPORTER_VERSION);
                self.host.viewporter = Some(registry.bind(name, version, &qh, ()));
                self.advertise(GlobalKind::Viewporter, version, name);
            }
            "zwp_relative_pointer_manager_v1" => {
                let version = version.min(RELATIVE_POINTER_MANAGER_VERSION);
                self.host.relative_pointer_manager = Some(registry.bind(name, version, &qh, ()));
                self.advertise(GlobalKind::RelativePointerManager, version, name);
            }
            "zwp_pointer_constraints_v1" => {
                let version = version.min(POINTER_CONSTRAINTS_VERSION);
                self.host.pointer_constraints = Some(registry.bind(name, version, &qh, ()));
                self.advertise(GlobalKind::PointerConstraints, version, name);
            }
            "zwp_linux_dmabuf_v1" => {
                let version = version.min(LINUX_DMABUF_VERSION);
                self.host.linux_dmabuf = Some(registry.bind(name, version, &qh, ()));
                debug!("🧩 Host linux-dmabuf v{}", version);
            }
            "zxdg_decoration_manager_v1" => {
                let version = version.min(DECORATION_MANAGER_VERSION);
                self.host.decoration = Some(registry.bind(name, version, &qh, ()));
                debug!("🧩 Host decoration manager v{}", version);
            }
            other => debug!("🔕 Not forwarding host global {} v{}", other, version),
        }
    }

    fn host_global_removed(&mut self, host_name: u32) {
        let mut sink = GuestRegistry {
            display: &self.display,
        };
        let Some((name, severed)) = self.globals.destroy_by_host_name(&mut sink, host_name) else {
            return;
        };
        // guest resources bound from the global resolve their host side
        // through these entries, so dropping them leaves the resources inert
        self.outputs.remove(host_name);
        let devices = self.seats.remove(host_name);
        info!(
            "🗑️ Host removed global {}; severed {} guest bindings and {} input devices",
            name,
            severed.len(),
            devices
        );
    }
}

impl Dispatch<wl_registry::WlRegistry, ()> for Bridge {
    fn event(
        state: &mut Self,
        _registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => state.host_global(name, &interface, version),
            wl_registry::Event::GlobalRemove { name } => state.host_global_removed(name),
            _ => {}
        }
    }
}

impl Dispatch<HostShm, ()> for Bridge {
    fn event(
        state: &mut Self,
        _shm: &HostShm,
        event: host_shm::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let host_shm::Event::Format { format } = event {
            let code = match format {
                WEnum::Value(format) => u32::from(format),
                WEnum::Unknown(code) => code,
            };
            state.host.shm_formats.push(code);
        }
    }
}

impl Dispatch<XdgWmBase, ()> for Bridge {
    fn event(
        _state: &mut Self,
        wm_base: &XdgWmBase,
        event: host_wm_base::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let host_wm_base::Event::Ping { serial } = event {
            wm_base.pong(serial);
        }
    }
}

delegate_noop!(Bridge: HostCompositor);
delegate_noop!(Bridge: HostSubcompositor);
delegate_noop!(Bridge: HostDataDeviceManager);
delegate_noop!(Bridge: WpViewporter);
delegate_noop!(Bridge: ignore ZwpLinuxDmabufV1);
delegate_noop!(Bridge: ZxdgDecorationManagerV1);
