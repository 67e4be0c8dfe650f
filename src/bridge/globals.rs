//! Advertised globals and version negotiation
//!
//! The table is the source of truth for what the guest may bind. Publishing a
//! global to guest registries goes through a [`RegistrySink`], which the
//! server glue implements on top of the guest display and which tests mock.

use crate::error::{BridgeError, BridgeResult};
use log::{debug, info};
use std::collections::{BTreeMap, HashSet};

/// Interfaces the bridge can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalKind {
    Compositor,
    Subcompositor,
    Shm,
    Output,
    Seat,
    DataDeviceManager,
    XdgWmBase,
    Viewporter,
    RelativePointerManager,
    PointerConstraints,
}

impl GlobalKind {
    pub fn interface(&self) -> &'static str {
        match self {
            GlobalKind::Compositor => "wl_compositor",
            GlobalKind::Subcompositor => "wl_subcompositor",
            GlobalKind::Shm => "wl_shm",
            GlobalKind::Output => "wl_output",
            GlobalKind::Seat => "wl_seat",
            GlobalKind::DataDeviceManager => "wl_data_device_manager",
            GlobalKind::XdgWmBase => "xdg_wm_base",
            GlobalKind::Viewporter => "wp_viewporter",
            GlobalKind::RelativePointerManager => "zwp_relative_pointer_manager_v1",
            GlobalKind::PointerConstraints => "zwp_pointer_constraints_v1",
        }
    }
}

/// Publishes and retracts globals on every open guest registry.
///
/// Implementations must announce synchronously: once `publish` returns, every
/// currently open registry has seen the global.
#[cfg_attr(test, mockall::automock(type Handle = u32;))]
pub trait RegistrySink {
    type Handle;

    fn publish(&mut self, name: u32, kind: GlobalKind, version: u32) -> Self::Handle;
    fn retract(&mut self, handle: Self::Handle);
}

/// One advertised capability.
#[derive(Debug)]
pub struct Global<H> {
    pub name: u32,
    pub kind: GlobalKind,
    /// Highest version a guest may bind, already clamped to what the host offers.
    pub version: u32,
    /// Registry name on the host, when the global forwards a host capability.
    pub host_name: Option<u32>,
    handle: Option<H>,
    bindings: HashSet<u64>,
}

impl<H> Global<H> {
    pub fn live_bindings(&self) -> usize {
        self.bindings.len()
    }
}

/// Outcome of a successful bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub id: u64,
    pub global: u32,
    pub kind: GlobalKind,
    pub version: u32,
    pub host_name: Option<u32>,
}

pub struct GlobalTable<H> {
    globals: BTreeMap<u32, Global<H>>,
    next_name: u32,
    next_binding: u64,
}

impl<H> Default for GlobalTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> GlobalTable<H> {
    pub fn new() -> Self {
        Self {
            globals: BTreeMap::new(),
            next_name: 1,
            next_binding: 1,
        }
    }

    /// Create a global and announce it immediately.
    pub fn advertise<S>(
        &mut self,
        sink: &mut S,
        kind: GlobalKind,
        version: u32,
        host_name: Option<u32>,
    ) -> u32
    where
        S: RegistrySink<Handle = H> + ?Sized,
    {
        let name = self.next_name;
        self.next_name += 1;
        let handle = sink.publish(name, kind, version);
        info!("📣 Advertising {} v{} as global {}", kind.interface(), version, name);
        self.globals.insert(
            name,
            Global {
                name,
                kind,
                version,
                host_name,
                handle: Some(handle),
                bindings: HashSet::new(),
            },
        );
        name
    }

    /// Retract a global. Returns the bindings that must be severed.
    pub fn destroy<S>(&mut self, sink: &mut S, name: u32) -> Vec<u64>
    where
        S: RegistrySink<Handle = H> + ?Sized,
    {
        let Some(mut global) = self.globals.remove(&name) else {
            return Vec::new();
        };
        if let Some(handle) = global.handle.take() {
            sink.retract(handle);
        }
        debug!(
            "🗑️ Retracted global {} ({}), severing {} binding(s)",
            name,
            global.kind.interface(),
            global.bindings.len()
        );
        global.bindings.drain().collect()
    }

    /// Retract the global forwarding host registry entry `host_name`, if any.
    pub fn destroy_by_host_name<S>(&mut self, sink: &mut S, host_name: u32) -> Option<(u32, Vec<u64>)>
    where
        S: RegistrySink<Handle = H> + ?Sized,
    {
        let name = self
            .globals
            .values()
            .find(|g| g.host_name == Some(host_name))
            .map(|g| g.name)?;
        Some((name, self.destroy(sink, name)))
    }

    /// Validate a guest bind and negotiate its version.
    pub fn bind(&mut self, name: u32, requested: u32) -> BridgeResult<Binding> {
        let global = self.globals.get_mut(&name).ok_or_else(|| {
            BridgeError::protocol("wl_registry", format!("invalid global {}", name))
        })?;
        if requested == 0 || requested > global.version {
            return Err(BridgeError::protocol(
                "wl_registry",
                format!(
                    "invalid version {} for {} (advertised {})",
                    requested,
                    global.kind.interface(),
                    global.version
                ),
            ));
        }
        let id = self.next_binding;
        self.next_binding += 1;
        global.bindings.insert(id);
        Ok(Binding {
            id,
            global: name,
            kind: global.kind,
            version: requested.min(global.version),
            host_name: global.host_name,
        })
    }

    /// Forget a binding whose pair was torn down.
    pub fn unbind(&mut self, binding: &Binding) {
        if let Some(global) = self.globals.get_mut(&binding.global) {
            global.bindings.remove(&binding.id);
        }
    }

    pub fn get(&self, name: u32) -> Option<&Global<H>> {
        self.globals.get(&name)
    }

    pub fn find_kind(&self, kind: GlobalKind) -> Option<&Global<H>> {
        self.globals.values().find(|g| g.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.globals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Global<H>> {
        self.globals.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    #[test]
    fn test_advertise_publishes_immediately() {
        let mut sink = MockRegistrySink::new();
        sink.expect_publish()
            .with(eq(1), eq(GlobalKind::Compositor), eq(3))
            .times(1)
            .return_const(77u32);
        let mut table = GlobalTable::new();
        let name = table.advertise(&mut sink, GlobalKind::Compositor, 3, Some(9));
        assert_eq!(name, 1);
        assert_eq!(table.get(1).unwrap().host_name, Some(9));
    }

    #[test]
    fn test_destroy_retracts_handle_once() {
        let mut sink = MockRegistrySink::new();
        sink.expect_publish().return_const(5u32);
        sink.expect_retract().with(eq(5)).times(1).return_const(());
        let mut table = GlobalTable::new();
        let name = table.advertise(&mut sink, GlobalKind::Seat, 5, None);
        let binding = table.bind(name, 4).unwrap();
        let severed = table.destroy(&mut sink, name);
        assert_eq!(severed, vec![binding.id]);
        assert!(table.destroy(&mut sink, name).is_empty());
    }

    #[test]
    fn test_bind_clamps_and_validates_version() {
        let mut sink = MockRegistrySink::new();
        sink.expect_publish().return_const(0u32);
        let mut table = GlobalTable::new();
        let name = table.advertise(&mut sink, GlobalKind::Output, 3, Some(4));
        let b = table.bind(name, 2).unwrap();
        assert_eq!(b.version, 2);
        assert_eq!(b.host_name, Some(4));
        assert!(matches!(
            table.bind(name, 4),
            Err(BridgeError::ProtocolViolation { .. })
        ));
        assert!(table.bind(name, 0).is_err());
        assert!(table.bind(name + 1, 1).is_err());
    }

    #[test]
    fn test_pointer_extensions_keep_host_interface_names() {
        assert_eq!(
            GlobalKind::RelativePointerManager.interface(),
            "zwp_relative_pointer_manager_v1"
        );
        assert_eq!(GlobalKind::PointerConstraints.interface(), "zwp_pointer_constraints_v1");

        let mut sink = MockRegistrySink::new();
        sink.expect_publish()
            .with(eq(1), eq(GlobalKind::PointerConstraints), eq(1))
            .times(1)
            .return_const(3u32);
        let mut table = GlobalTable::new();
        let name = table.advertise(&mut sink, GlobalKind::PointerConstraints, 1, Some(21));
        assert_eq!(table.find_kind(GlobalKind::PointerConstraints).map(|g| g.name), Some(name));
    }

    #[test]
    fn test_destroy_by_host_name() {
        let mut sink = MockRegistrySink::new();
        sink.expect_publish().return_const(1u32);
        sink.expect_retract().times(1).return_const(());
        let mut table = GlobalTable::new();
        table.advertise(&mut sink, GlobalKind::Shm, 1, Some(12));
        let out = table.advertise(&mut sink, GlobalKind::Output, 2, Some(13));
        let (name, severed) = table.destroy_by_host_name(&mut sink, 13).unwrap();
        assert_eq!(name, out);
        assert!(severed.is_empty());
        assert!(table.destroy_by_host_name(&mut sink, 99).is_none());
        assert_eq!(table.len(), 1);
    }
}
