//! Window manager and clipboard glue for `-X` mode
//!
//! The X connection is polled by the event loop. Its events go through the
//! [`WindowManager`] and the [`SelectionBridge`]; the host side of the
//! clipboard (our own data device, source and offer pipes) is driven from the
//! actions they return.

use super::data::HostOfferData;
use super::{Bridge, DataDriver};
use crate::error::{BridgeError, BridgeResult};
use crate::output;
use crate::selection::{OfferedType, SelectionAction, SelectionBridge};
use crate::xwm::{WindowManager, XConnection};
use anyhow::{Context, Result};
use calloop::generic::Generic;
use calloop::{Interest, Mode, PostAction, RegistrationToken};
use log::{debug, error, info, trace, warn};
use rustix::fs::OFlags;
use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::os::fd::{AsFd, OwnedFd};
use tokio::sync::oneshot;
use wayland_client::protocol::wl_data_device::{self as host_device, WlDataDevice as HostDataDevice};
use wayland_client::protocol::wl_data_offer::WlDataOffer as HostDataOffer;
use wayland_client::protocol::wl_data_source::{self as host_source, WlDataSource as HostDataSource};
use wayland_client::{event_created_child, Connection, Dispatch as ClientDispatch, Proxy, QueueHandle};
use wayland_server::backend::protocol::ProtocolError;
use wayland_server::backend::DisconnectReason;

/// User data of the bridge's own host data device.
#[derive(Debug, Clone, Copy)]
pub struct SelectionDevice;

/// User data of the bridge's own host data source.
#[derive(Debug, Clone, Copy)]
pub struct SelectionSource;

/// Host side of the X clipboard.
pub struct XSelection {
    bridge: SelectionBridge<File>,
    device: Option<HostDataDevice>,
    /// Current host selection offer.
    offer: Option<HostDataOffer>,
    /// Our source while an X client owns the clipboard.
    source: Option<HostDataSource>,
    /// Watch on the offer pipe being read.
    receive: Option<RegistrationToken>,
}

fn nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = rustix::fs::fcntl_getfl(fd)?;
    rustix::fs::fcntl_setfl(fd, flags | OFlags::NONBLOCK)?;
    Ok(())
}

impl Bridge {
    /// Become Xwayland's window manager. Sends the proxy scale back once it
    /// is fixed.
    pub(crate) fn attach_window_manager(
        &mut self,
        conn: XConnection,
        reply: oneshot::Sender<f64>,
    ) -> Result<()> {
        let scale = output::xwayland_scale(self.options.scale, self.host.viewporter.is_some());
        self.scale = scale;

        let fd = conn
            .as_fd()
            .try_clone_to_owned()
            .context("Failed to duplicate the X connection")?;
        self.handle
            .insert_source(
                Generic::new(fd, Interest::READ, Mode::Level),
                |_, _, bridge: &mut Bridge| {
                    bridge.dispatch_x();
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|e| anyhow::Error::new(e.error))
            .context("Failed to watch the X connection")?;

        if let Some(window) = conn.selection_window() {
            let device = match (self.host.data_device_manager.as_ref(), self.seats.first()) {
                (Some(manager), Some(seat)) => {
                    Some(manager.get_data_device(seat, &self.qh, SelectionDevice))
                }
                _ => {
                    warn!("⚠️ Host has no data device; the clipboard stays X-only");
                    None
                }
            };
            self.selection = Some(XSelection {
                bridge: SelectionBridge::new(window, conn.atoms().selection_atoms()),
                device,
                offer: None,
                source: None,
                receive: None,
            });
        }

        let settings = conn.wm_settings(
            scale,
            true,
            self.options.application_id.clone(),
            self.options.frame_color,
            self.options.dark_frame_color,
        );
        self.wm = Some(WindowManager::new(settings));
        self.x = Some(conn);
        self.announce_outputs();
        info!("🪟 Managing Xwayland at scale {}", scale);
        let _ = reply.send(scale);
        Ok(())
    }

    /// Drain every queued X event.
    pub(crate) fn dispatch_x(&mut self) {
        loop {
            let (Some(x), Some(wm)) = (self.x.as_ref(), self.wm.as_mut()) else {
                return;
            };
            let event = match x.poll_for_event() {
                Ok(Some(event)) => event,
                Ok(None) => return,
                Err(err) => return self.fail(err),
            };
            let selection = self.selection.as_mut().map(|s| &mut s.bridge);
            match x.handle_event(event, wm, selection, &self.surfaces) {
                Ok(actions) => self.apply_selection_actions(actions),
                Err(BridgeError::ProtocolViolation { object, message }) => {
                    self.kill_guest(&object, message)
                }
                Err(err) if err.is_fatal_to_process() => return self.fail(err),
                Err(err) => debug!("🔇 X event: {}", err),
            }
        }
    }

    /// Send what the window manager queued to X and to the host shell.
    pub(crate) fn drain_window_manager(&mut self) -> BridgeResult<()> {
        let (Some(wm), Some(x)) = (self.wm.as_mut(), self.x.as_ref()) else {
            return Ok(());
        };
        wm.apply_input_focus();
        x.execute(wm.drain_x_requests())?;
        let requests = wm.drain_host_requests();
        self.apply_host_requests(requests);
        match self.x.as_ref() {
            Some(x) => x.flush(),
            None => Ok(()),
        }
    }

    fn kill_guest(&mut self, object: &str, message: String) {
        error!("❌ Disconnecting Xwayland: {}: {}", object, message);
        let Some(client) = self.guest.clone() else {
            return;
        };
        self.display.backend_handle().kill_client(
            client,
            DisconnectReason::ProtocolError(ProtocolError {
                code: 0,
                object_id: 0,
                object_interface: "wl_surface".into(),
                message,
            }),
        );
    }

    /// Run one selection step and everything it leads to.
    fn selection_step(&mut self, step: impl FnOnce(&mut SelectionBridge<File>) -> Vec<SelectionAction>) {
        let (Some(selection), Some(x)) = (self.selection.as_mut(), self.x.as_ref()) else {
            return;
        };
        let actions = step(&mut selection.bridge);
        match x.run_selection(&mut selection.bridge, actions) {
            Ok(host) => self.apply_selection_actions(host),
            Err(err) if err.is_fatal_to_process() => self.fail(err),
            Err(err) => debug!("🔇 Selection: {}", err),
        }
    }

    fn apply_selection_actions(&mut self, actions: Vec<SelectionAction>) {
        for action in actions {
            match action {
                SelectionAction::ReceiveOffer { mime } => self.receive_offer(mime),
                SelectionAction::PauseReceive => {
                    if let Some(token) = self.selection.as_ref().and_then(|s| s.receive) {
                        if let Err(err) = self.handle.disable(&token) {
                            warn!("⚠️ Failed to pause the offer pipe: {}", err);
                        }
                    }
                }
                SelectionAction::ResumeReceive => {
                    if let Some(token) = self.selection.as_ref().and_then(|s| s.receive) {
                        if let Err(err) = self.handle.enable(&token) {
                            warn!("⚠️ Failed to resume the offer pipe: {}", err);
                        }
                    }
                }
                SelectionAction::CloseReceive => self.close_receive(),
                SelectionAction::AwaitSinkWritable => self.await_sink_writable(),
                SelectionAction::SetHostSelection { mimes } => self.set_host_selection(mimes),
                SelectionAction::ClearHostSelection => self.clear_host_selection(),
                other => trace!("📋 Left over X action {:?}", other),
            }
        }
    }

    fn offer_pipe(&self) -> io::Result<(OwnedFd, OwnedFd)> {
        match &self.data_driver {
            DataDriver::Noop => {
                Ok(rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC)?)
            }
            DataDriver::Virtwl(device) => {
                let read = device.new_pipe_read()?;
                let write = read.try_clone()?;
                Ok((read, write))
            }
        }
    }

    fn receive_offer(&mut self, mime: String) {
        let Some(offer) = self.selection.as_ref().and_then(|s| s.offer.clone()) else {
            return self.selection_step(|b| b.receive_failed());
        };
        let (read, write) = match self.offer_pipe().and_then(|(read, write)| {
            nonblocking(&read)?;
            Ok((read, write))
        }) {
            Ok(pipe) => pipe,
            Err(err) => {
                warn!("⚠️ No pipe for the host offer: {}", err);
                return self.selection_step(|b| b.receive_failed());
            }
        };
        debug!("📥 Receiving {} from the host", mime);
        offer.receive(mime, write.as_fd());
        drop(write);

        self.close_receive();
        let token = self.handle.insert_source(
            Generic::new(File::from(read), Interest::READ, Mode::Level),
            |_, file, bridge: &mut Bridge| {
                let reader: &File = file;
                bridge.offer_readable(reader);
                Ok(PostAction::Continue)
            },
        );
        match token {
            Ok(token) => {
                if let Some(selection) = self.selection.as_mut() {
                    selection.receive = Some(token);
                }
            }
            Err(err) => {
                warn!("⚠️ Failed to watch the offer pipe: {}", err.error);
                self.selection_step(|b| b.receive_failed());
            }
        }
    }

    fn offer_readable(&mut self, mut reader: &File) {
        let Some(selection) = self.selection.as_mut() else {
            return;
        };
        let Some(buf) = selection.bridge.receive_buf() else {
            return self.close_receive();
        };
        let result = reader.read(buf);
        if let Err(err) = &result {
            if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) {
                return;
            }
        }
        self.selection_step(|b| b.offer_read(result));
    }

    fn close_receive(&mut self) {
        if let Some(token) = self.selection.as_mut().and_then(|s| s.receive.take()) {
            self.handle.remove(token);
        }
    }

    fn await_sink_writable(&mut self) {
        let Some(sink) = self.selection.as_ref().and_then(|s| s.bridge.active_sink()) else {
            return;
        };
        let fd = match sink.as_fd().try_clone_to_owned() {
            Ok(fd) => fd,
            Err(err) => {
                warn!("⚠️ Failed to watch the host send pipe: {}", err);
                return;
            }
        };
        let inserted = self.handle.insert_source(
            Generic::new(fd, Interest::WRITE, Mode::OneShot),
            |_, _, bridge: &mut Bridge| {
                bridge.selection_step(|b| b.sink_writable());
                Ok(PostAction::Remove)
            },
        );
        if let Err(err) = inserted {
            warn!("⚠️ Failed to watch the host send pipe: {}", err.error);
        }
    }

    fn set_host_selection(&mut self, mimes: Vec<String>) {
        let serial = self.seats.last_serial;
        let qh = self.qh.clone();
        let (Some(selection), Some(manager)) =
            (self.selection.as_mut(), self.host.data_device_manager.as_ref())
        else {
            return;
        };
        let Some(device) = selection.device.as_ref() else {
            return;
        };
        let source = manager.create_data_source(&qh, SelectionSource);
        for mime in &mimes {
            source.offer(mime.clone());
        }
        device.set_selection(Some(&source), serial);
        info!("📤 X clipboard published to the host ({} types)", mimes.len());
        if let Some(previous) = selection.source.replace(source) {
            previous.destroy();
        }
    }

    fn clear_host_selection(&mut self) {
        let serial = self.seats.last_serial;
        let Some(selection) = self.selection.as_mut() else {
            return;
        };
        if let Some(device) = selection.device.as_ref() {
            device.set_selection(None, serial);
        }
        if let Some(source) = selection.source.take() {
            source.destroy();
        }
    }

    fn host_selection_changed(&mut self, offer: Option<HostDataOffer>) {
        let Some(selection) = self.selection.as_mut() else {
            return;
        };
        if let Some(previous) = selection.offer.take() {
            if Some(&previous) != offer.as_ref() {
                previous.destroy();
            }
        }
        selection.offer = offer.clone();
        // our own source coming back from the host
        if offer.is_some() && selection.source.is_some() {
            trace!("📋 Ignoring the echo of our own selection");
            return;
        }

        let mimes = offer
            .as_ref()
            .and_then(|o| o.data::<HostOfferData>())
            .map(HostOfferData::mimes);
        let types = match (mimes, self.x.as_ref()) {
            (Some(mimes), Some(x)) => {
                let mut types = Vec::with_capacity(mimes.len());
                for mime in mimes {
                    match x.intern_atom(&mime) {
                        Ok(atom) => types.push(OfferedType { atom, mime }),
                        Err(err) => return self.fail(err),
                    }
                }
                Some(types)
            }
            _ => None,
        };
        self.selection_step(|b| b.host_offer(types));
    }

    fn host_send(&mut self, mime: String, fd: OwnedFd) {
        let Some(x) = self.x.as_ref() else {
            return;
        };
        let target = match x.intern_atom(&mime) {
            Ok(atom) => atom,
            Err(err) => return self.fail(err),
        };
        if let Err(err) = nonblocking(&fd) {
            warn!("⚠️ Host send pipe for {}: {}", mime, err);
            return;
        }
        debug!("📤 Host wants the X clipboard as {}", mime);
        self.selection_step(|b| b.host_send(target, File::from(fd)));
    }
}

impl ClientDispatch<HostDataDevice, SelectionDevice> for Bridge {
    fn event(
        state: &mut Self,
        _proxy: &HostDataDevice,
        event: host_device::Event,
        _data: &SelectionDevice,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let host_device::Event::Selection { id } = event {
            state.host_selection_changed(id);
        }
    }

    event_created_child!(Bridge, HostDataDevice, [
        host_device::EVT_DATA_OFFER_OPCODE => (HostDataOffer, HostOfferData::default()),
    ]);
}

impl ClientDispatch<HostDataSource, SelectionSource> for Bridge {
    fn event(
        state: &mut Self,
        proxy: &HostDataSource,
        event: host_source::Event,
        _data: &SelectionSource,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            host_source::Event::Send { mime_type, fd } => state.host_send(mime_type, fd),
            host_source::Event::Cancelled => {
                proxy.destroy();
                if let Some(selection) = state.selection.as_mut() {
                    if selection.source.as_ref() == Some(proxy) {
                        selection.source = None;
                    }
                }
            }
            _ => {}
        }
    }
}
