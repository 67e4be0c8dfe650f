//! `wl_compositor`, `wl_subcompositor` and `wp_viewporter`
//!
//! Surfaces are paired with a host surface on creation. Attach, damage and
//! commit go through the surface pipeline; everything else is forwarded with
//! coordinates scaled.

use super::registry::{bind_guest, BoundGlobal, GlobalData};
use super::shm::{self, HostBufferData};
use super::{Bridge, SurfaceData, SurfaceKey};
use crate::bridge::Teardown;
use crate::surface::damage::host_region_rect;
use crate::surface::{AttachTarget, Presentation, SurfaceState, Viewport};
use log::{debug, trace, warn};
use wayland_client::protocol::wl_callback::{self as host_callback, WlCallback as HostCallback};
use wayland_client::protocol::wl_output::Transform as HostTransform;
use wayland_client::protocol::wl_region::WlRegion as HostRegion;
use wayland_client::protocol::wl_subsurface::WlSubsurface as HostSubsurface;
use wayland_client::protocol::wl_surface::{self as host_surface, WlSurface as HostSurface};
use wayland_client::{delegate_noop, Connection, Dispatch as ClientDispatch, QueueHandle};
use wayland_protocols::wp::viewporter::client::wp_viewport::WpViewport as HostViewport;
use wayland_protocols::wp::viewporter::server::{wp_viewport, wp_viewporter};
use wayland_server::backend::ClientId;
use wayland_server::protocol::{
    wl_buffer, wl_callback, wl_compositor, wl_region, wl_subcompositor, wl_subsurface, wl_surface,
};
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource, WEnum};

impl Bridge {
    fn create_surface(
        &mut self,
        compositor: &wl_compositor::WlCompositor,
        id: New<wl_surface::WlSurface>,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let Some(host_compositor) = self.host.compositor.clone() else {
            // the global is only advertised with a host compositor behind it
            compositor.post_error(0u32, "host compositor is gone");
            return;
        };
        let qh = self.qh.clone();
        let mut guest = None;
        let key = self.surfaces.pairs.insert_with(|key| {
            let surface = data_init.init(id, key);
            guest = Some(surface.clone());
            let host = host_compositor.create_surface(&qh, key);
            (
                surface,
                host,
                SurfaceData {
                    state: SurfaceState::new(),
                    viewport: None,
                },
            )
        });
        let Some(guest) = guest else {
            return;
        };
        let surface_id = guest.id().protocol_id();
        self.surfaces.ids.insert(surface_id, key);
        trace!("🧩 Surface {} created", surface_id);

        if let Some(wm) = self.wm.as_mut() {
            if let Err(err) = wm.surface_created(surface_id, &self.surfaces) {
                self.report(&guest, err);
            }
        }
    }

    fn surface_attach(
        &mut self,
        surface: &wl_surface::WlSurface,
        key: SurfaceKey,
        buffer: Option<wl_buffer::WlBuffer>,
        x: i32,
        y: i32,
    ) {
        let attached = match buffer.as_ref().map(|b| self.buffers.attached(b)).transpose() {
            Ok(attached) => attached.flatten(),
            Err(err) => return self.report(surface, err),
        };
        let forwarded = buffer.as_ref().and_then(|b| self.buffers.host(b));
        let Some(host_surface) = self.surfaces.pairs.proxy(key).cloned() else {
            return;
        };

        let Bridge {
            surfaces,
            driver,
            host,
            qh,
            scale,
            ..
        } = self;
        let Some(data) = surfaces.pairs.data_mut(key) else {
            return;
        };
        let outcome = data.state.attach(attached, x, y, *scale, |id, spec| {
            let allocation = driver.allocate(spec)?;
            let data = HostBufferData::Output { surface: key, id };
            let buffer = shm::import(host, qh, driver.kind().name(), &allocation, data)?;
            Ok((buffer, allocation))
        });
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => return self.report(surface, err),
        };

        let (ox, oy) = outcome.offset;
        match &outcome.target {
            AttachTarget::Output(buffer) => host_surface.attach(Some(buffer), ox, oy),
            AttachTarget::PassThrough => host_surface.attach(forwarded.as_ref(), ox, oy),
            AttachTarget::Detach => host_surface.attach(None, ox, oy),
        }
        for evicted in outcome.evicted {
            evicted.destroy();
        }

        if let Some(wm) = self.wm.as_mut() {
            wm.surface_attached(surface.id().protocol_id(), &self.surfaces);
        }
    }

    fn surface_commit(&mut self, surface: &wl_surface::WlSurface, key: SurfaceKey) {
        let Some(host_surface) = self.surfaces.pairs.proxy(key).cloned() else {
            return;
        };
        let viewporter = self.host.viewporter.clone();
        let scale = self.scale;
        let qh = self.qh.clone();
        let Some(data) = self.surfaces.pairs.data_mut(key) else {
            return;
        };
        if data.viewport.is_none() {
            data.viewport = viewporter.map(|v| v.get_viewport(&host_surface, &qh, ()));
        }

        let outcome = data.state.commit(scale, data.viewport.is_some());
        if let Some(bytes) = outcome.copied_bytes {
            trace!("📋 Copied {} bytes for surface {}", bytes, surface.id());
        }
        match (&outcome.presentation, &data.viewport) {
            (Presentation::Viewport(presented), Some(viewport)) => {
                match presented.source {
                    Some(src) => viewport.set_source(src.x, src.y, src.width, src.height),
                    None => viewport.set_source(-1.0, -1.0, -1.0, -1.0),
                }
                viewport.set_destination(presented.destination.0, presented.destination.1);
            }
            (Presentation::BufferScale(buffer_scale), _) => host_surface.set_buffer_scale(*buffer_scale),
            _ => {}
        }

        let has_role = data.state.has_role;
        let announce = has_role && !data.state.has_output;
        if announce {
            data.state.has_output = true;
        }

        let surface_id = surface.id().protocol_id();
        let commit = has_role
            || match self.wm.as_mut() {
                Some(wm) => wm.surface_committed(surface_id, outcome.has_contents),
                None => true,
            };
        if commit {
            host_surface.commit();
        }

        if announce {
            if let Some(client) = surface.client() {
                for output in self.outputs.internal_guests(&client) {
                    surface.enter(&output);
                }
            }
        }
        if let Some(buffer) = outcome.release {
            buffer.release();
        }
    }

    fn surface_destroyed(&mut self, surface: &wl_surface::WlSurface, key: SurfaceKey) {
        let surface_id = surface.id().protocol_id();
        let Teardown::Sever { other: host, mut data } = self.surfaces.pairs.resource_destroyed(key)
        else {
            return;
        };
        if self.surfaces.ids.get(&surface_id) == Some(&key) {
            self.surfaces.ids.remove(&surface_id);
        }

        // role objects go before the surface they are built on
        if let Some(wm) = self.wm.as_mut() {
            wm.surface_destroyed(surface_id, &self.surfaces);
            let requests = wm.drain_host_requests();
            self.apply_host_requests(requests);
        }

        if let Some(viewport) = data.viewport.take() {
            viewport.destroy();
        }
        for buffer in data.state.take_all_buffers() {
            buffer.destroy();
        }
        host.destroy();
        trace!("🧩 Surface {} destroyed", surface_id);
    }
}

fn host_transform(transform: WEnum<wayland_server::protocol::wl_output::Transform>) -> HostTransform {
    let raw = match transform {
        WEnum::Value(value) => value as u32,
        WEnum::Unknown(raw) => raw,
    };
    HostTransform::try_from(raw).unwrap_or(HostTransform::Normal)
}

impl GlobalDispatch<wl_compositor::WlCompositor, GlobalData> for Bridge {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_compositor::WlCompositor>,
        global: &GlobalData,
        data_init: &mut DataInit<'_, Self>,
    ) {
        bind_guest(state, resource, global, data_init);
    }
}

impl Dispatch<wl_compositor::WlCompositor, BoundGlobal> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_compositor::WlCompositor,
        request: wl_compositor::Request,
        _data: &BoundGlobal,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_compositor::Request::CreateSurface { id } => {
                state.create_surface(resource, id, data_init)
            }
            wl_compositor::Request::CreateRegion { id } => {
                let Some(compositor) = state.host.compositor.as_ref() else {
                    resource.post_error(0u32, "host compositor is gone");
                    return;
                };
                let host = compositor.create_region(&state.qh, ());
                data_init.init(id, host);
            }
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &wl_compositor::WlCompositor,
        data: &BoundGlobal,
    ) {
        state.unbind(data);
    }
}

impl Dispatch<wl_surface::WlSurface, SurfaceKey> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_surface::WlSurface,
        request: wl_surface::Request,
        key: &SurfaceKey,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let key = *key;
        match request {
            wl_surface::Request::Attach { buffer, x, y } => {
                state.surface_attach(resource, key, buffer, x, y)
            }
            wl_surface::Request::Commit => state.surface_commit(resource, key),
            request => {
                let scale = state.scale;
                let qh = state.qh.clone();
                let Some(pair) = state.surfaces.pairs.get_mut(key) else {
                    return;
                };
                let host = &pair.proxy;
                match request {
                    wl_surface::Request::Damage {
                        x,
                        y,
                        width,
                        height,
                    } => {
                        let rect = pair.data.state.damage(x, y, width, height, scale);
                        let (x, y, width, height) = rect.to_xywh();
                        host.damage(x, y, width, height);
                    }
                    wl_surface::Request::Frame { callback } => {
                        let guest = data_init.init(callback, ());
                        host.frame(&qh, guest);
                    }
                    wl_surface::Request::SetOpaqueRegion { region } => {
                        host.set_opaque_region(region.as_ref().and_then(|r| r.data::<HostRegion>()));
                    }
                    wl_surface::Request::SetInputRegion { region } => {
                        host.set_input_region(region.as_ref().and_then(|r| r.data::<HostRegion>()));
                    }
                    wl_surface::Request::SetBufferScale { scale } => {
                        pair.data.state.contents_scale = scale;
                    }
                    wl_surface::Request::SetBufferTransform { transform } => {
                        host.set_buffer_transform(host_transform(transform));
                    }
                    _ => {}
                }
            }
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        resource: &wl_surface::WlSurface,
        key: &SurfaceKey,
    ) {
        state.surface_destroyed(resource, *key);
    }
}

impl ClientDispatch<HostSurface, SurfaceKey> for Bridge {
    fn event(
        state: &mut Self,
        _proxy: &HostSurface,
        event: host_surface::Event,
        key: &SurfaceKey,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(guest) = state.surfaces.pairs.resource(*key).cloned() else {
            return;
        };
        let Some(client) = guest.client() else {
            return;
        };
        match event {
            host_surface::Event::Enter { output } => {
                for guest_output in state.outputs.guests_for(&output, &client) {
                    guest.enter(&guest_output);
                }
                if let Some(data) = state.surfaces.pairs.data_mut(*key) {
                    data.state.has_output = true;
                }
            }
            host_surface::Event::Leave { output } => {
                for guest_output in state.outputs.guests_for(&output, &client) {
                    guest.leave(&guest_output);
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_region::WlRegion, HostRegion> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_region::WlRegion,
        request: wl_region::Request,
        host: &HostRegion,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_region::Request::Add {
                x,
                y,
                width,
                height,
            } => {
                let (x, y, width, height) = host_region_rect(x, y, width, height, state.scale);
                host.add(x, y, width, height);
            }
            wl_region::Request::Subtract {
                x,
                y,
                width,
                height,
            } => {
                let (x, y, width, height) = host_region_rect(x, y, width, height, state.scale);
                host.subtract(x, y, width, height);
            }
            _ => {}
        }
    }

    fn destroyed(_state: &mut Self, _client: ClientId, _resource: &wl_region::WlRegion, host: &HostRegion) {
        host.destroy();
    }
}

impl Dispatch<wl_callback::WlCallback, ()> for Bridge {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_callback::WlCallback,
        _request: wl_callback::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }
}

impl ClientDispatch<HostCallback, wl_callback::WlCallback> for Bridge {
    fn event(
        _state: &mut Self,
        _proxy: &HostCallback,
        event: host_callback::Event,
        guest: &wl_callback::WlCallback,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let host_callback::Event::Done { callback_data } = event {
            if guest.is_alive() {
                guest.done(callback_data);
            }
        }
    }
}

impl GlobalDispatch<wl_subcompositor::WlSubcompositor, GlobalData> for Bridge {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_subcompositor::WlSubcompositor>,
        global: &GlobalData,
        data_init: &mut DataInit<'_, Self>,
    ) {
        bind_guest(state, resource, global, data_init);
    }
}

impl Dispatch<wl_subcompositor::WlSubcompositor, BoundGlobal> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_subcompositor::WlSubcompositor,
        request: wl_subcompositor::Request,
        _data: &BoundGlobal,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let wl_subcompositor::Request::GetSubsurface {
            id,
            surface,
            parent,
        } = request
        else {
            return;
        };
        let host = match (
            state.host.subcompositor.as_ref(),
            state.surfaces.host(&surface),
            state.surfaces.host(&parent),
        ) {
            (Some(subcompositor), Some(host_surface), Some(host_parent)) => {
                Some(subcompositor.get_subsurface(&host_surface, &host_parent, &state.qh, ()))
            }
            _ => {
                warn!("⚠️ Subsurface for {} has no host counterpart", surface.id());
                resource.post_error(wl_subcompositor::Error::BadSurface, "surface has no host side");
                None
            }
        };
        data_init.init(id, host);
        if let Some(key) = surface.data::<SurfaceKey>() {
            if let Some(data) = state.surfaces.pairs.data_mut(*key) {
                data.state.has_role = true;
            }
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &wl_subcompositor::WlSubcompositor,
        data: &BoundGlobal,
    ) {
        state.unbind(data);
    }
}

impl Dispatch<wl_subsurface::WlSubsurface, Option<HostSubsurface>> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_subsurface::WlSubsurface,
        request: wl_subsurface::Request,
        host: &Option<HostSubsurface>,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        let Some(host) = host else {
            return;
        };
        match request {
            wl_subsurface::Request::SetPosition { x, y } => {
                host.set_position(state.to_host(x), state.to_host(y))
            }
            wl_subsurface::Request::PlaceAbove { sibling } => {
                if let Some(sibling) = state.surfaces.host(&sibling) {
                    host.place_above(&sibling);
                }
            }
            wl_subsurface::Request::PlaceBelow { sibling } => {
                if let Some(sibling) = state.surfaces.host(&sibling) {
                    host.place_below(&sibling);
                }
            }
            wl_subsurface::Request::SetSync => host.set_sync(),
            wl_subsurface::Request::SetDesync => host.set_desync(),
            _ => {}
        }
    }

    fn destroyed(
        _state: &mut Self,
        _client: ClientId,
        _resource: &wl_subsurface::WlSubsurface,
        host: &Option<HostSubsurface>,
    ) {
        if let Some(host) = host {
            host.destroy();
        }
    }
}

impl GlobalDispatch<wp_viewporter::WpViewporter, GlobalData> for Bridge {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wp_viewporter::WpViewporter>,
        global: &GlobalData,
        data_init: &mut DataInit<'_, Self>,
    ) {
        bind_guest(state, resource, global, data_init);
    }
}

impl Dispatch<wp_viewporter::WpViewporter, BoundGlobal> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wp_viewporter::WpViewporter,
        request: wp_viewporter::Request,
        _data: &BoundGlobal,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let wp_viewporter::Request::GetViewport { id, surface } = request else {
            return;
        };
        let key = surface.data::<SurfaceKey>().copied();
        let data = key.and_then(|key| state.surfaces.pairs.data_mut(key));
        match data {
            Some(data) if data.state.viewport.is_some() => {
                resource.post_error(
                    wp_viewporter::Error::ViewportExists,
                    "surface already has a viewport",
                );
            }
            Some(data) => data.state.viewport = Some(Viewport::default()),
            None => debug!("🔍 Viewport for an unknown surface"),
        }
        data_init.init(id, key);
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &wp_viewporter::WpViewporter,
        data: &BoundGlobal,
    ) {
        state.unbind(data);
    }
}

impl Dispatch<wp_viewport::WpViewport, Option<SurfaceKey>> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wp_viewport::WpViewport,
        request: wp_viewport::Request,
        key: &Option<SurfaceKey>,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        let Some(viewport) = key
            .and_then(|key| state.surfaces.pairs.data_mut(key))
            .and_then(|data| data.state.viewport.as_mut())
        else {
            return;
        };
        match request {
            wp_viewport::Request::SetSource {
                x,
                y,
                width,
                height,
            } => viewport.set_source(x, y, width, height),
            wp_viewport::Request::SetDestination { width, height } => {
                viewport.set_destination(width, height)
            }
            _ => {}
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &wp_viewport::WpViewport,
        key: &Option<SurfaceKey>,
    ) {
        if let Some(data) = key.and_then(|key| state.surfaces.pairs.data_mut(key)) {
            data.state.viewport = None;
        }
    }
}

delegate_noop!(Bridge: HostRegion);
delegate_noop!(Bridge: HostSubsurface);
delegate_noop!(Bridge: HostViewport);
