//! Protocol glue and the event loop
//!
//! Everything that speaks Wayland lives here: the guest display (server
//! side), the host connection (client side), the X connection and the
//! selection pipes, all driven by one calloop loop over a single [`Bridge`]
//! value. Decisions are made by the state machines in [`crate::bridge`],
//! [`crate::surface`], [`crate::xwm`] and [`crate::selection`]; the handlers
//! in this module translate protocol messages into calls on them and back.

mod compositor;
mod data;
mod output;
mod pointer_ext;
mod registry;
mod seat;
mod shell;
mod shm;
mod xwm;

pub use registry::{BoundGlobal, GlobalData, HostGlobals};

use crate::bridge::{GlobalTable, PairKey, PairTable};
use crate::error::BridgeError;
use crate::seat::Accelerator;
use crate::surface::{BackingDriver, SurfaceState};
use crate::transport::{Multiplexer, PumpStatus, VirtwlContext, VirtwlDevice};
use crate::xwm::{SurfaceDirectory, SurfaceInfo, WindowManager, XConnection};
use anyhow::{Context, Result};
use calloop::channel::{self, Channel};
use calloop::generic::Generic;
use calloop::{EventLoop, Interest, LoopHandle, LoopSignal, Mode, PostAction, RegistrationToken};
use calloop_wayland_source::WaylandSource;
use log::{debug, error, info, warn};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::Arc;
use wayland_client::protocol::wl_buffer::WlBuffer as HostBuffer;
use wayland_client::protocol::wl_registry::WlRegistry;
use wayland_client::protocol::wl_surface::WlSurface as HostSurface;
use wayland_client::{Connection, Proxy, QueueHandle};
use wayland_protocols::wp::viewporter::client::wp_viewport::WpViewport as HostViewport;
use wayland_server::backend::{ClientData, ClientId, DisconnectReason, GlobalId};
use wayland_server::protocol::wl_buffer::WlBuffer;
use wayland_server::protocol::wl_surface::WlSurface;
use wayland_server::{Display, DisplayHandle, Resource};

/// Proxy-wide settings.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Desired scale, already clamped.
    pub scale: f64,
    pub dpi: Vec<i32>,
    pub xwayland: bool,
    pub application_id: Option<String>,
    pub accelerators: Vec<Accelerator>,
    pub frame_color: u32,
    pub dark_frame_color: u32,
}

/// Where selection pipes come from.
#[derive(Debug, Clone)]
pub enum DataDriver {
    Noop,
    Virtwl(VirtwlDevice),
}

/// How the host compositor is reached.
pub enum HostLink {
    Socket(UnixStream),
    /// Through a virtwl context, pumped by a [`Multiplexer`].
    Virtwl(VirtwlDevice),
}

/// Everything [`run`] needs.
pub struct BridgeSetup {
    pub options: BridgeOptions,
    pub driver: BackingDriver,
    pub data_driver: DataDriver,
    pub host: HostLink,
    /// The one guest connection served by this process.
    pub guest: UnixStream,
}

/// Requests from the process supervisor.
pub enum BridgeCommand {
    /// Xwayland reported its display: become its window manager. The proxy
    /// scale is sent back once it is known.
    AttachWindowManager {
        conn: XConnection,
        scale: tokio::sync::oneshot::Sender<f64>,
    },
    Shutdown,
}

pub(crate) type SurfaceKey = PairKey<WlSurface, HostSurface, SurfaceData>;

pub struct SurfaceData {
    pub state: SurfaceState<HostBuffer, WlBuffer>,
    /// Host viewport, created on the first commit when the host has a viewporter.
    pub viewport: Option<HostViewport>,
}

/// Guest surfaces and their host proxies, addressable by protocol id.
#[derive(Default)]
pub struct Surfaces {
    pub pairs: PairTable<WlSurface, HostSurface, SurfaceData>,
    ids: HashMap<u32, SurfaceKey>,
}

impl Surfaces {
    pub fn key(&self, id: u32) -> Option<SurfaceKey> {
        self.ids.get(&id).copied()
    }

    /// Host proxy of a guest surface.
    pub fn host(&self, guest: &WlSurface) -> Option<HostSurface> {
        let key = guest.data::<SurfaceKey>()?;
        self.pairs.proxy(*key).cloned()
    }

    /// Guest resource of a host surface.
    pub fn guest(&self, host: &HostSurface) -> Option<WlSurface> {
        let key = host.data::<SurfaceKey>()?;
        self.pairs.resource(*key).cloned()
    }

    pub fn host_by_id(&self, id: u32) -> Option<HostSurface> {
        self.pairs.proxy(self.key(id)?).cloned()
    }
}

impl SurfaceDirectory for Surfaces {
    fn surface(&self, id: u32) -> Option<SurfaceInfo> {
        let data = self.pairs.data(self.key(id)?)?;
        Some(SurfaceInfo {
            contents: (data.state.contents_width, data.state.contents_height),
            has_role: data.state.has_role,
            last_event_serial: data.state.last_event_serial,
        })
    }
}

/// State of the whole proxy, handed by `&mut` to every handler.
pub struct Bridge {
    pub(crate) options: BridgeOptions,
    /// Proxy scale.
    pub(crate) scale: f64,
    pub(crate) display: DisplayHandle,
    pub(crate) conn: Connection,
    pub(crate) qh: QueueHandle<Bridge>,
    pub(crate) handle: LoopHandle<'static, Bridge>,
    signal: LoopSignal,
    pub(crate) host: HostGlobals,
    pub(crate) globals: GlobalTable<GlobalId>,
    pub(crate) driver: BackingDriver,
    pub(crate) data_driver: DataDriver,
    pub(crate) surfaces: Surfaces,
    pub(crate) buffers: shm::Buffers,
    pub(crate) outputs: output::Outputs,
    pub(crate) seats: seat::Seats,
    pub(crate) shell: shell::Shells,
    pub(crate) data: data::DataDevices,
    pub(crate) wm: Option<WindowManager>,
    pub(crate) x: Option<XConnection>,
    pub(crate) selection: Option<xwm::XSelection>,
    /// The guest connection, once inserted.
    pub(crate) guest: Option<ClientId>,
    exit_code: Option<i32>,
}

struct GuestClient {
    signal: LoopSignal,
}

impl ClientData for GuestClient {
    fn initialized(&self, client_id: ClientId) {
        debug!("👋 Guest {:?} connected", client_id);
    }

    fn disconnected(&self, client_id: ClientId, reason: DisconnectReason) {
        info!("👋 Guest {:?} disconnected: {:?}", client_id, reason);
        self.signal.stop();
    }
}

impl Bridge {
    #[allow(clippy::too_many_arguments)]
    fn new(
        setup_options: BridgeOptions,
        driver: BackingDriver,
        data_driver: DataDriver,
        display: DisplayHandle,
        conn: Connection,
        qh: QueueHandle<Bridge>,
        registry: WlRegistry,
        handle: LoopHandle<'static, Bridge>,
        signal: LoopSignal,
    ) -> Self {
        let scale = setup_options.scale;
        let accelerators = setup_options.accelerators.clone();
        Self {
            options: setup_options,
            scale,
            display,
            conn,
            qh,
            handle,
            signal,
            host: HostGlobals::new(registry),
            globals: GlobalTable::new(),
            driver,
            data_driver,
            surfaces: Surfaces::default(),
            buffers: shm::Buffers::default(),
            outputs: output::Outputs::default(),
            seats: seat::Seats::new(accelerators),
            shell: shell::Shells::default(),
            data: data::DataDevices::default(),
            wm: None,
            x: None,
            selection: None,
            guest: None,
            exit_code: None,
        }
    }

    /// Guest coordinate or size to host.
    pub(crate) fn to_host(&self, value: i32) -> i32 {
        crate::seat::to_host(value, self.scale)
    }

    /// Host size to guest.
    pub(crate) fn to_guest(&self, value: i32) -> i32 {
        (value as f64 * self.scale) as i32
    }

    /// Take the process down after a fatal error.
    pub(crate) fn fail(&mut self, err: BridgeError) {
        error!("❌ {}", err);
        self.exit_code = Some(err.exit_code().unwrap_or(1));
        self.signal.stop();
    }

    /// Route a handler error: protocol violations kill the guest connection
    /// through `resource`, fatal ones the process.
    pub(crate) fn report<R: Resource>(&mut self, resource: &R, err: BridgeError) {
        match err {
            BridgeError::ProtocolViolation { object, message } => {
                warn!("⚠️ Protocol violation on {}: {}", object, message);
                resource.post_error(0u32, format!("{}: {}", object, message));
            }
            err if err.is_fatal_to_process() => self.fail(err),
            err => debug!("🔇 Ignoring {}", err),
        }
    }

    /// Block until the X server has processed everything sent so far, so a
    /// restack lands before the guest sees the focus change.
    pub(crate) fn forced_roundtrip(&mut self) {
        let (Some(wm), Some(x)) = (self.wm.as_mut(), self.x.as_ref()) else {
            return;
        };
        let result = x.execute(wm.drain_x_requests()).and_then(|()| x.sync());
        if let Err(err) = result {
            self.fail(err);
        }
    }

    fn command(&mut self, command: BridgeCommand) {
        match command {
            BridgeCommand::AttachWindowManager { conn, scale } => {
                if let Err(err) = self.attach_window_manager(conn, scale) {
                    error!("❌ Failed to start the window manager: {:#}", err);
                    self.exit_code = Some(1);
                    self.signal.stop();
                }
            }
            BridgeCommand::Shutdown => {
                info!("🛑 Shutdown requested");
                self.signal.stop();
            }
        }
    }

    /// Runs after every loop iteration: apply what the state machines
    /// queued, then flush all three connections.
    fn after_dispatch(&mut self) {
        self.dispatch_x();
        if let Err(err) = self.drain_window_manager() {
            self.fail(err);
        }
        if let Err(err) = self.conn.flush() {
            error!("❌ Lost the host connection: {}", err);
            self.exit_code = Some(1);
            self.signal.stop();
        }
        if let Err(err) = self.display.flush_clients() {
            warn!("⚠️ Failed to flush guest clients: {}", err);
        }
    }
}

fn host_channel_closed(bridge: &mut Bridge) -> io::Result<PostAction> {
    error!("❌ Host channel closed");
    bridge.exit_code = Some(1);
    bridge.signal.stop();
    Ok(PostAction::Remove)
}

fn pump_virtwl(handle: &LoopHandle<'static, Bridge>, device: &VirtwlDevice) -> Result<UnixStream> {
    let context = VirtwlContext::new(device).context("Failed to create a virtwl context")?;
    let (ours, theirs) = UnixStream::pair().context("Failed to create the host socket pair")?;
    let channel_fd = context.as_fd().try_clone_to_owned()?;
    let socket = theirs.try_clone()?;
    let writable = theirs.try_clone()?;
    let mux = Rc::new(RefCell::new(Multiplexer::new(context, theirs)?));

    // While the socket is full the channel source is disabled and the write
    // source enabled, and the other way round once the queue drains.
    let write_mux = mux.clone();
    let channel_token: Rc<Cell<Option<RegistrationToken>>> = Rc::default();
    let resume = channel_token.clone();
    let write_handle = handle.clone();
    let write_token = handle
        .insert_source(
            Generic::new(writable, Interest::WRITE, Mode::Level),
            move |_, _, bridge: &mut Bridge| match write_mux.borrow_mut().socket_writable() {
                PumpStatus::Open => {
                    if let Some(token) = resume.get() {
                        write_handle.enable(&token).map_err(io::Error::other)?;
                    }
                    Ok(PostAction::Disable)
                }
                PumpStatus::Blocked => Ok(PostAction::Continue),
                PumpStatus::Closed => host_channel_closed(bridge),
            },
        )
        .map_err(|e| anyhow::Error::new(e.error))?;
    handle.disable(&write_token)?;

    let channel_mux = mux.clone();
    let channel_handle = handle.clone();
    let token = handle
        .insert_source(
            Generic::new(channel_fd, Interest::READ, Mode::Level),
            move |_, _, bridge: &mut Bridge| match channel_mux.borrow_mut().channel_readable() {
                PumpStatus::Open => Ok(PostAction::Continue),
                PumpStatus::Blocked => {
                    channel_handle.enable(&write_token).map_err(io::Error::other)?;
                    Ok(PostAction::Disable)
                }
                PumpStatus::Closed => host_channel_closed(bridge),
            },
        )
        .map_err(|e| anyhow::Error::new(e.error))?;
    channel_token.set(Some(token));
    handle
        .insert_source(
            Generic::new(socket, Interest::READ, Mode::Level),
            move |_, _, bridge: &mut Bridge| match mux.borrow_mut().socket_readable() {
                PumpStatus::Open | PumpStatus::Blocked => Ok(PostAction::Continue),
                PumpStatus::Closed => host_channel_closed(bridge),
            },
        )
        .map_err(|e| anyhow::Error::new(e.error))?;
    info!("🔀 Host connection relayed through {}", device.path().display());
    Ok(ours)
}

/// Serve one guest connection until it or the host goes away. Returns the
/// exit status.
pub fn run(setup: BridgeSetup, commands: Channel<BridgeCommand>) -> Result<i32> {
    let mut event_loop: EventLoop<'static, Bridge> =
        EventLoop::try_new().context("Failed to create the event loop")?;
    let handle = event_loop.handle();
    let mut display: Display<Bridge> =
        Display::new().context("Failed to create the guest display")?;

    let stream = match setup.host {
        HostLink::Socket(stream) => stream,
        HostLink::Virtwl(device) => pump_virtwl(&handle, &device)?,
    };
    let conn = Connection::from_socket(stream).context("Failed to connect to the host compositor")?;
    let mut queue = conn.new_event_queue();
    let qh = queue.handle();
    let registry = conn.display().get_registry(&qh, ());

    let mut bridge = Bridge::new(
        setup.options,
        setup.driver,
        setup.data_driver,
        display.handle(),
        conn.clone(),
        qh,
        registry,
        handle.clone(),
        event_loop.get_signal(),
    );
    info!(
        "🌉 Bridge starting with the {} shm driver",
        bridge.driver.kind().name()
    );

    // globals first, then the output and seat state they announce
    queue
        .roundtrip(&mut bridge)
        .context("Host registry roundtrip failed")?;
    queue
        .roundtrip(&mut bridge)
        .context("Host output roundtrip failed")?;

    WaylandSource::new(conn, queue)
        .insert(handle.clone())
        .map_err(|e| anyhow::Error::new(e.error))
        .context("Failed to watch the host connection")?;

    let client = display
        .handle()
        .insert_client(
            setup.guest,
            Arc::new(GuestClient {
                signal: event_loop.get_signal(),
            }),
        )
        .context("Failed to add the guest client")?;
    bridge.guest = Some(client.id());
    let poll_fd = display.backend().poll_fd().try_clone_to_owned()?;
    handle
        .insert_source(
            Generic::new(poll_fd, Interest::READ, Mode::Level),
            move |_, _, bridge: &mut Bridge| {
                display.dispatch_clients(bridge)?;
                Ok(PostAction::Continue)
            },
        )
        .map_err(|e| anyhow::Error::new(e.error))
        .context("Failed to watch the guest display")?;

    handle
        .insert_source(commands, |event, _, bridge: &mut Bridge| {
            if let channel::Event::Msg(command) = event {
                bridge.command(command);
            }
        })
        .map_err(|e| anyhow::Error::new(e.error))
        .context("Failed to watch supervisor commands")?;

    event_loop
        .run(None, &mut bridge, |bridge| bridge.after_dispatch())
        .context("Event loop failed")?;

    let code = bridge.exit_code.unwrap_or(0);
    info!("🏁 Bridge stopped ({})", code);
    Ok(code)
}
