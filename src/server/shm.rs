//! `wl_shm` and buffer import
//!
//! With the pass-through driver guest pools are created on the host and
//! buffers forwarded as they are. With a copying driver pools stay local; the
//! content is mapped at attach and copied into output buffers, which are
//! imported on the host by [`import`].

use super::registry::{bind_guest, BoundGlobal, GlobalData, HostGlobals};
use super::{Bridge, SurfaceKey};
use crate::bridge::{PairKey, PairTable, Teardown};
use crate::error::{BridgeError, BridgeResult};
use crate::mmap::{MapLayout, MappedBuffer, PlaneLayout, WriteSync};
use crate::surface::{Allocation, AttachedBuffer, BufferId, HostImport, ShmFormat};
use log::{debug, trace, warn};
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use wayland_client::protocol::wl_buffer::{self as host_buffer, WlBuffer as HostBuffer};
use wayland_client::protocol::wl_shm::Format as HostFormat;
use wayland_client::protocol::wl_shm_pool::WlShmPool as HostShmPool;
use wayland_client::{delegate_noop, Connection, Dispatch as ClientDispatch, QueueHandle};
use wayland_protocols::wp::linux_dmabuf::zv1::client::zwp_linux_buffer_params_v1::{
    self, ZwpLinuxBufferParamsV1,
};
use wayland_server::backend::ClientId;
use wayland_server::protocol::{wl_buffer, wl_shm, wl_shm_pool};
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource, WEnum};

pub type ForwardedKey = PairKey<wl_buffer::WlBuffer, HostBuffer, (i32, i32)>;

/// Guest buffers created against a forwarded pool.
#[derive(Default)]
pub struct Buffers {
    pub forwarded: PairTable<wl_buffer::WlBuffer, HostBuffer, (i32, i32)>,
}

pub enum GuestPool {
    /// Created on the host as well (pass-through driver).
    Forwarded(HostShmPool),
    /// Kept local and mapped when a buffer is attached.
    Local { fd: OwnedFd, size: AtomicI32 },
}

/// User data of a guest `wl_buffer`.
pub enum GuestBuffer {
    Forwarded(ForwardedKey),
    Shm {
        pool: Arc<GuestPool>,
        offset: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: ShmFormat,
    },
}

/// User data of a host `wl_buffer`.
#[derive(Debug, Clone, Copy)]
pub enum HostBufferData {
    /// One of our output buffers.
    Output { surface: SurfaceKey, id: BufferId },
    /// A forwarded guest buffer.
    Guest(ForwardedKey),
}

fn shm_layout(offset: i32, height: i32, stride: i32, format: ShmFormat, size: usize) -> MapLayout {
    let (offset, height, stride) = (offset.max(0) as usize, height.max(0) as usize, stride.max(0) as usize);
    MapLayout {
        size,
        bpp: format.bpp(),
        planes: (0..format.num_planes())
            .map(|plane| {
                PlaneLayout::new(
                    offset + format.plane_offset(plane, height, stride),
                    stride,
                    format.y_subsampling(plane),
                )
            })
            .collect(),
    }
}

impl Buffers {
    /// Describe a guest buffer for [`crate::surface::SurfaceState::attach`].
    pub fn attached(&self, buffer: &wl_buffer::WlBuffer) -> BridgeResult<Option<AttachedBuffer<wl_buffer::WlBuffer>>> {
        let Some(data) = buffer.data::<GuestBuffer>() else {
            return Ok(None);
        };
        match data {
            GuestBuffer::Forwarded(key) => {
                let Some(&(width, height)) = self.forwarded.data(*key) else {
                    return Ok(None);
                };
                Ok(Some(AttachedBuffer {
                    guest: buffer.clone(),
                    width: width as u32,
                    height: height as u32,
                    shm: None,
                }))
            }
            GuestBuffer::Shm {
                pool,
                offset,
                width,
                height,
                stride,
                format,
            } => {
                let GuestPool::Local { fd, size } = pool.as_ref() else {
                    return Ok(None);
                };
                let size = size.load(Ordering::Relaxed).max(0) as usize;
                let layout = shm_layout(*offset, *height, *stride, *format, size);
                let fd = fd.try_clone()?;
                let map = MappedBuffer::map(fd, layout, WriteSync::None).map_err(|e| {
                    BridgeError::protocol(buffer.id().to_string(), format!("{:#}", e))
                })?;
                Ok(Some(AttachedBuffer {
                    guest: buffer.clone(),
                    width: *width as u32,
                    height: *height as u32,
                    shm: Some((*format, map)),
                }))
            }
        }
    }

    /// Host proxy of a forwarded guest buffer.
    pub fn host(&self, buffer: &wl_buffer::WlBuffer) -> Option<HostBuffer> {
        match buffer.data::<GuestBuffer>()? {
            GuestBuffer::Forwarded(key) => self.forwarded.proxy(*key).cloned(),
            GuestBuffer::Shm { .. } => None,
        }
    }
}

fn missing(driver: &'static str, interface: &str) -> BridgeError {
    BridgeError::allocation(
        driver,
        io::Error::new(io::ErrorKind::NotFound, format!("host has no {}", interface)),
    )
}

/// Import an output buffer on the host.
pub(crate) fn import(
    host: &HostGlobals,
    qh: &QueueHandle<Bridge>,
    driver: &'static str,
    allocation: &Allocation,
    data: HostBufferData,
) -> BridgeResult<HostBuffer> {
    match &allocation.import {
        HostImport::Shm {
            size,
            width,
            height,
            stride,
            format,
        } => {
            let shm = host.shm.as_ref().ok_or_else(|| missing(driver, "wl_shm"))?;
            let format = HostFormat::try_from(format.to_wl()).map_err(|_| {
                BridgeError::allocation(
                    driver,
                    io::Error::new(io::ErrorKind::InvalidInput, "unknown shm format"),
                )
            })?;
            let pool = shm.create_pool(allocation.map.as_fd(), *size, qh, ());
            let buffer = pool.create_buffer(0, *width, *height, *stride, format, qh, data);
            pool.destroy();
            Ok(buffer)
        }
        HostImport::Dmabuf {
            width,
            height,
            fourcc,
            planes,
        } => {
            let dmabuf = host
                .linux_dmabuf
                .as_ref()
                .ok_or_else(|| missing(driver, "zwp_linux_dmabuf_v1"))?;
            let params = dmabuf.create_params(qh, ());
            for (index, (offset, stride)) in planes.iter().enumerate() {
                params.add(allocation.map.as_fd(), index as u32, *offset, *stride, 0, 0);
            }
            let buffer = params.create_immed(
                *width,
                *height,
                *fourcc,
                zwp_linux_buffer_params_v1::Flags::empty(),
                qh,
                data,
            );
            params.destroy();
            Ok(buffer)
        }
    }
}

/// Formats the guest may use, given the host's and the active driver.
fn guest_formats(host_formats: &[u32], pass_through: bool) -> Vec<u32> {
    let mut formats: Vec<u32> = host_formats
        .iter()
        .copied()
        .filter(|code| {
            pass_through || ShmFormat::from_wl(*code).map_or(false, ShmFormat::forwarded_from_shm)
        })
        .collect();
    // argb8888 and xrgb8888 are mandatory
    for code in [0, 1] {
        if !formats.contains(&code) {
            formats.push(code);
        }
    }
    formats
}

impl GlobalDispatch<wl_shm::WlShm, GlobalData> for Bridge {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<wl_shm::WlShm>,
        global: &GlobalData,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let Some((shm, _)) = bind_guest(state, resource, global, data_init) else {
            return;
        };
        let pass_through = state.driver.kind().is_pass_through();
        for code in guest_formats(&state.host.shm_formats, pass_through) {
            if let Ok(format) = wl_shm::Format::try_from(code) {
                shm.format(format);
            }
        }
    }
}

impl Dispatch<wl_shm::WlShm, BoundGlobal> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &wl_shm::WlShm,
        request: wl_shm::Request,
        _data: &BoundGlobal,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_shm::Request::CreatePool { id, fd, size } = request {
            let pool = match (state.driver.kind().is_pass_through(), &state.host.shm) {
                (true, Some(host)) => {
                    GuestPool::Forwarded(host.create_pool(fd.as_fd(), size, &state.qh, ()))
                }
                _ => GuestPool::Local {
                    fd,
                    size: AtomicI32::new(size),
                },
            };
            data_init.init(id, Arc::new(pool));
        }
    }

    fn destroyed(state: &mut Self, _client: ClientId, _resource: &wl_shm::WlShm, data: &BoundGlobal) {
        state.unbind(data);
    }
}

impl Dispatch<wl_shm_pool::WlShmPool, Arc<GuestPool>> for Bridge {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &wl_shm_pool::WlShmPool,
        request: wl_shm_pool::Request,
        data: &Arc<GuestPool>,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_shm_pool::Request::CreateBuffer {
                id,
                offset,
                width,
                height,
                stride,
                format,
            } => {
                let code = match format {
                    WEnum::Value(format) => u32::from(format),
                    WEnum::Unknown(code) => code,
                };
                match data.as_ref() {
                    GuestPool::Forwarded(host_pool) => {
                        let Ok(host_format) = HostFormat::try_from(code) else {
                            resource.post_error(wl_shm::Error::InvalidFormat, "unknown format");
                            return;
                        };
                        let qh = state.qh.clone();
                        state.buffers.forwarded.insert_with(|key| {
                            let guest = data_init.init(id, GuestBuffer::Forwarded(key));
                            let host = host_pool.create_buffer(
                                offset,
                                width,
                                height,
                                stride,
                                host_format,
                                &qh,
                                HostBufferData::Guest(key),
                            );
                            (guest, host, (width, height))
                        });
                    }
                    GuestPool::Local { .. } => {
                        let Some(format) = ShmFormat::from_wl(code) else {
                            resource.post_error(wl_shm::Error::InvalidFormat, "unsupported format");
                            return;
                        };
                        trace!("🧾 Local {}x{} {:?} buffer", width, height, format);
                        data_init.init(
                            id,
                            GuestBuffer::Shm {
                                pool: data.clone(),
                                offset,
                                width,
                                height,
                                stride,
                                format,
                            },
                        );
                    }
                }
            }
            wl_shm_pool::Request::Resize { size } => match data.as_ref() {
                GuestPool::Forwarded(host_pool) => host_pool.resize(size),
                GuestPool::Local { size: current, .. } => current.store(size, Ordering::Relaxed),
            },
            _ => {}
        }
    }

    fn destroyed(
        _state: &mut Self,
        _client: ClientId,
        _resource: &wl_shm_pool::WlShmPool,
        data: &Arc<GuestPool>,
    ) {
        if let GuestPool::Forwarded(host_pool) = data.as_ref() {
            host_pool.destroy();
        }
    }
}

impl Dispatch<wl_buffer::WlBuffer, GuestBuffer> for Bridge {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &wl_buffer::WlBuffer,
        _request: wl_buffer::Request,
        _data: &GuestBuffer,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }

    fn destroyed(
        state: &mut Self,
        _client: ClientId,
        _resource: &wl_buffer::WlBuffer,
        data: &GuestBuffer,
    ) {
        if let GuestBuffer::Forwarded(key) = data {
            if let Teardown::Sever { other, .. } = state.buffers.forwarded.resource_destroyed(*key) {
                other.destroy();
            }
        }
    }
}

impl ClientDispatch<HostBuffer, HostBufferData> for Bridge {
    fn event(
        state: &mut Self,
        _proxy: &HostBuffer,
        event: host_buffer::Event,
        data: &HostBufferData,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let host_buffer::Event::Release = event else {
            return;
        };
        match *data {
            HostBufferData::Output { surface, id } => {
                let released = state
                    .surfaces
                    .pairs
                    .data_mut(surface)
                    .map_or(false, |data| data.state.buffer_released(id));
                if !released {
                    debug!("🔁 Release for retired output buffer {:?}", id);
                }
            }
            HostBufferData::Guest(key) => match state.buffers.forwarded.resource(key) {
                Some(guest) => guest.release(),
                None => warn!("⚠️ Release for a destroyed guest buffer"),
            },
        }
    }
}

delegate_noop!(Bridge: HostShmPool);
delegate_noop!(Bridge: ignore ZwpLinuxBufferParamsV1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copying_drivers_hide_nv12_and_unknown_formats() {
        let host = [0, 1, 0x3231_564e, 0x3432_4241, 0xdead_beef];
        let formats = guest_formats(&host, false);
        assert_eq!(formats, vec![0, 1, 0x3432_4241]);
    }

    #[test]
    fn test_pass_through_forwards_everything() {
        let host = [0x3231_564e, 0xdead_beef];
        let formats = guest_formats(&host, true);
        assert_eq!(formats, vec![0x3231_564e, 0xdead_beef, 0, 1]);
    }

    #[test]
    fn test_nv12_layout_has_a_subsampled_chroma_plane() {
        let layout = shm_layout(64, 4, 8, ShmFormat::Nv12, 256);
        assert_eq!(layout.bpp, 1);
        assert_eq!(layout.planes.len(), 2);
        assert_eq!(layout.planes[0], PlaneLayout::new(64, 8, 1));
        assert_eq!(layout.planes[1], PlaneLayout::new(64 + 32, 8, 2));
    }
}
