//! # crossway - Wayland and Xwayland proxy
//!
//! Process entry point: parses flags, layers them over the configuration
//! and runs one of the modes:
//! - spawn (default): serve `PROGRAM` over an inherited `WAYLAND_SOCKET`
//! - Xwayland (`-X`): start Xwayland, manage its windows, then run `PROGRAM`
//! - master (`--master`): listen on a named socket and fork a peer per client
//! - peer (`--peer FD`): serve one already accepted connection

use anyhow::{bail, Context, Result};
use calloop::channel::{self, Sender};
use clap::Parser;
use crossway::config::{parse_dpi_list, CrosswayConfig};
use crossway::drivers::Drivers;
use crossway::output;
use crossway::seat::parse_accelerators;
use crossway::server::{self, BridgeCommand, BridgeOptions, BridgeSetup};
use crossway::sys;
use crossway::xwayland::{self, XwaylandOptions};
use crossway::xwm::conn::ConnectOptions;
use crossway::xwm::XConnection;
use log::{debug, error, info, warn};
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::net::UnixListener;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// DPI buckets used with Xwayland when none are configured.
const XWAYLAND_DPI: [i32; 6] = [72, 96, 160, 240, 320, 480];

#[derive(Parser, Debug)]
#[command(name = "crossway")]
#[command(about = "Protocol-translating Wayland proxy for guest clients and Xwayland")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Listen on a named socket and spawn a peer per connection
    #[arg(long)]
    master: bool,

    /// Socket name used in master mode
    #[arg(long)]
    socket: Option<String>,

    /// Serve an accepted guest connection (used by master mode)
    #[arg(long, value_name = "FD", hide = true)]
    peer: Option<RawFd>,

    /// Host Wayland display
    #[arg(long)]
    display: Option<String>,

    /// noop, dmabuf, virtwl or virtwl-dmabuf
    #[arg(long)]
    shm_driver: Option<String>,

    /// noop or virtwl
    #[arg(long)]
    data_driver: Option<String>,

    /// Scale factor, clamped to 0.1..=10
    #[arg(long)]
    scale: Option<f64>,

    /// Comma separated DPI buckets
    #[arg(long)]
    dpi: Option<String>,

    /// Key combinations reserved for the host, e.g. `<Control><Alt>Delete`
    #[arg(long)]
    accelerators: Option<String>,

    /// Force this application id on every toplevel
    #[arg(long)]
    application_id: Option<String>,

    /// Run Xwayland and act as its window manager
    #[arg(short = 'X')]
    xwayland: bool,

    /// Fixed X display number
    #[arg(long)]
    x_display: Option<u32>,

    #[arg(long)]
    xwayland_path: Option<String>,

    #[arg(long)]
    xwayland_gl_driver_path: Option<PathBuf>,

    /// Keep running after PROGRAM exits
    #[arg(long)]
    no_exit_with_child: bool,

    /// Sent to $NOTIFY_SOCKET once PROGRAM exits
    #[arg(long)]
    sd_notify: Option<String>,

    /// Leave CLIPBOARD_MANAGER alone and do not bridge the X clipboard
    #[arg(long)]
    no_clipboard_manager: bool,

    /// Window frame colour, #RRGGBB
    #[arg(long)]
    frame_color: Option<String>,

    #[arg(long)]
    dark_frame_color: Option<String>,

    #[arg(long)]
    virtwl_device: Option<PathBuf>,

    #[arg(long)]
    drm_device: Option<PathBuf>,

    /// Let Xwayland use glamor
    #[arg(long)]
    glamor: bool,

    #[arg(long)]
    x_auth: Option<PathBuf>,

    #[arg(long)]
    x_font_path: Option<String>,

    #[arg(long)]
    peer_cmd_prefix: Option<String>,

    #[arg(long)]
    xwayland_cmd_prefix: Option<String>,

    /// Program to run, with its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    program: Vec<String>,
}

impl Cli {
    /// Apply flags over the file and environment layers.
    fn apply(&self, config: &mut CrosswayConfig) -> Result<()> {
        let bridge = &mut config.bridge;
        if let Some(socket) = &self.socket {
            bridge.socket = socket.clone();
        }
        if let Some(display) = &self.display {
            bridge.display = Some(display.clone());
        }
        if let Some(driver) = &self.shm_driver {
            bridge.shm_driver = Some(driver.clone());
        }
        if let Some(driver) = &self.data_driver {
            bridge.data_driver = Some(driver.clone());
        }
        if let Some(scale) = self.scale {
            bridge.scale = scale;
        }
        if let Some(dpi) = &self.dpi {
            bridge.dpi = parse_dpi_list(dpi)?;
        }
        if let Some(list) = &self.accelerators {
            bridge.accelerators = list.clone();
        }
        if let Some(id) = &self.application_id {
            bridge.application_id = Some(id.clone());
        }
        if self.no_exit_with_child {
            bridge.exit_with_child = false;
        }
        if let Some(message) = &self.sd_notify {
            bridge.sd_notify = Some(message.clone());
        }
        if self.no_clipboard_manager {
            bridge.clipboard_manager = false;
        }
        if let Some(color) = &self.frame_color {
            bridge.frame_color = color.clone();
        }
        if let Some(color) = &self.dark_frame_color {
            bridge.dark_frame_color = color.clone();
        }
        if let Some(path) = &self.virtwl_device {
            bridge.virtwl_device = Some(path.clone());
        }
        if let Some(path) = &self.drm_device {
            bridge.drm_device = Some(path.clone());
        }
        if self.glamor {
            bridge.glamor = true;
        }
        if let Some(prefix) = &self.peer_cmd_prefix {
            bridge.peer_cmd_prefix = Some(prefix.clone());
        }

        let xwayland = &mut config.xwayland;
        if let Some(path) = &self.xwayland_path {
            xwayland.path = path.clone();
        }
        if let Some(path) = &self.xwayland_gl_driver_path {
            xwayland.gl_driver_path = Some(path.clone());
        }
        if let Some(path) = &self.x_auth {
            xwayland.auth = Some(path.clone());
        }
        if let Some(path) = &self.x_font_path {
            xwayland.font_path = Some(path.clone());
        }
        if let Some(prefix) = &self.xwayland_cmd_prefix {
            xwayland.cmd_prefix = Some(prefix.clone());
        }

        config.bridge.scale = output::clamp_scale(config.bridge.scale);
        Ok(())
    }

    /// Flags a peer spawned in master mode inherits.
    fn peer_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let mut push = |flag: &str, value: Option<String>| {
            if let Some(value) = value {
                args.push(format!("--{}={}", flag, value));
            }
        };
        push("config", self.config.as_ref().map(|p| p.display().to_string()));
        push("display", self.display.clone());
        push("scale", self.scale.map(|s| s.to_string()));
        push("dpi", self.dpi.clone());
        push("accelerators", self.accelerators.clone());
        push("virtwl-device", self.virtwl_device.as_ref().map(|p| p.display().to_string()));
        push("drm-device", self.drm_device.as_ref().map(|p| p.display().to_string()));
        push("shm-driver", self.shm_driver.clone());
        push("data-driver", self.data_driver.clone());
        if self.debug {
            args.push("--debug".to_string());
        }
        args
    }
}

fn bridge_options(config: &CrosswayConfig, xwayland: bool) -> Result<BridgeOptions> {
    let (frame_color, dark_frame_color) = config.frame_colors()?;
    let mut dpi = config.bridge.dpi.clone();
    if dpi.is_empty() && xwayland {
        dpi = XWAYLAND_DPI.to_vec();
    }
    Ok(BridgeOptions {
        scale: config.bridge.scale,
        dpi,
        xwayland,
        application_id: config.bridge.application_id.clone(),
        accelerators: parse_accelerators(&config.bridge.accelerators)?,
        frame_color,
        dark_frame_color,
    })
}

/// Run a bridge for `guest` on a blocking thread. Returns its command
/// sender and exit status.
fn start_bridge(
    config: &CrosswayConfig,
    drivers: Drivers,
    guest: UnixStream,
    xwayland: bool,
) -> Result<(Sender<BridgeCommand>, JoinHandle<Result<i32>>)> {
    let options = bridge_options(config, xwayland)?;
    let display = config.bridge.display.clone();
    let (sender, commands) = channel::channel();
    let handle = tokio::task::spawn_blocking(move || {
        let setup = BridgeSetup {
            options,
            driver: drivers.backing()?,
            data_driver: drivers.data()?,
            host: drivers.host_link(display.as_deref())?,
            guest,
        };
        server::run(setup, commands)
    });
    Ok((sender, handle))
}

fn status_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

fn bridge_code(result: std::result::Result<Result<i32>, tokio::task::JoinError>) -> Result<i32> {
    result.context("Bridge thread panicked")?
}

/// Tell the service manager PROGRAM is done.
fn sd_notify(message: &str) -> Result<()> {
    let Some(path) = std::env::var_os("NOTIFY_SOCKET") else {
        warn!("⚠️ --sd-notify given but NOTIFY_SOCKET is not set");
        return Ok(());
    };
    let socket = UnixDatagram::unbound().context("Failed to create the notify socket")?;
    let bytes = path.as_encoded_bytes();
    if let Some(name) = bytes.strip_prefix(b"@") {
        use std::os::linux::net::SocketAddrExt;
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)?;
        socket.send_to_addr(message.as_bytes(), &addr)?;
    } else {
        socket.send_to(message.as_bytes(), &path)?;
    }
    debug!("📣 Notified the service manager: {}", message);
    Ok(())
}

/// Spawn `program` with the environment the guest expects.
fn spawn_program(program: &[String], env: &[(&str, String)], wayland: Option<&UnixStream>) -> Result<Child> {
    let Some((path, args)) = program.split_first() else {
        bail!("No program to run");
    };
    let mut command = Command::new(path);
    command.args(args).env("WAYLAND_DISPLAY", ".").env_remove("DISPLAY");
    for (name, value) in env {
        command.env(name, value);
    }
    if let Some(socket) = wayland {
        let fd = socket.as_raw_fd();
        command.env("WAYLAND_SOCKET", fd.to_string());
        // SAFETY: the hook only calls fcntl, which is async-signal-safe.
        unsafe {
            command.pre_exec(move || sys::clear_cloexec(fd));
        }
    }
    let child = command
        .spawn()
        .with_context(|| format!("Failed to spawn {}", path))?;
    info!("🚀 Started {} (pid {:?})", path, child.id());
    Ok(child)
}

/// Wait for whichever of the bridge, PROGRAM and Xwayland ends first and
/// turn that into the exit status.
async fn supervise(
    config: &CrosswayConfig,
    mut bridge: JoinHandle<Result<i32>>,
    sender: Sender<BridgeCommand>,
    mut child: Option<Child>,
    mut xwayland: Option<Child>,
) -> Result<i32> {
    loop {
        let child_exit = async {
            match child.as_mut() {
                Some(child) => child.wait().await,
                None => std::future::pending().await,
            }
        };
        let xwayland_exit = async {
            match xwayland.as_mut() {
                Some(xwayland) => xwayland.wait().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = &mut bridge => return bridge_code(result),
            status = child_exit => {
                let status = status.context("Failed to wait for the program")?;
                child = None;
                info!("🏁 Program exited with {}", status);
                if config.bridge.exit_with_child {
                    if let Some(xwayland) = xwayland.as_mut() {
                        // SIGTERM rather than kill, so Xwayland can clean up
                        if let Some(pid) = xwayland.id() {
                            let _ = rustix::process::kill_process(
                                rustix::process::Pid::from_raw(pid as i32)
                                    .context("Invalid Xwayland pid")?,
                                rustix::process::Signal::Term,
                            );
                        }
                    }
                    let _ = sender.send(BridgeCommand::Shutdown);
                    return Ok(status_code(status));
                }
                if let Some(message) = &config.bridge.sd_notify {
                    if let Err(err) = sd_notify(message) {
                        warn!("⚠️ Failed to notify the service manager: {:#}", err);
                    }
                }
            }
            status = xwayland_exit => {
                let status = status.context("Failed to wait for Xwayland")?;
                xwayland = None;
                if !status.success() {
                    error!("❌ Xwayland exited with {}", status);
                    let _ = sender.send(BridgeCommand::Shutdown);
                    return Ok(status_code(status));
                }
                info!("👋 Xwayland exited");
            }
        }
    }
}

async fn run_spawn(cli: &Cli, config: &CrosswayConfig) -> Result<i32> {
    if cli.program.is_empty() {
        bail!("No program given; see --help");
    }
    let drivers = Drivers::select(&config.bridge)?;
    let (guest, theirs) = UnixStream::pair().context("Failed to create the guest socket pair")?;
    let (sender, bridge) = start_bridge(config, drivers, guest, false)?;
    let child = spawn_program(&cli.program, &[], Some(&theirs))?;
    drop(theirs);
    supervise(config, bridge, sender, Some(child), None).await
}

async fn run_xwayland(cli: &Cli, config: &CrosswayConfig) -> Result<i32> {
    if cli.program.is_empty() {
        bail!("No program given; see --help");
    }
    let drivers = Drivers::select(&config.bridge)?;
    // software rendering unless glamor has a DRM device to work with
    let shm = !(config.bridge.glamor && config.bridge.drm_device.is_some());
    let mut options = XwaylandOptions::from_config(config, shm);
    options.display_number = cli.x_display;

    let mut xwayland = xwayland::launch(&options)?;
    let guest = xwayland
        .wayland
        .try_clone()
        .context("Failed to duplicate the Xwayland connection")?;
    let (sender, mut bridge) = start_bridge(config, drivers, guest, true)?;

    let display = tokio::select! {
        result = &mut bridge => {
            error!("❌ Bridge stopped before Xwayland was ready");
            return bridge_code(result);
        }
        display = xwayland.ready() => display?,
    };

    let wm = xwayland
        .wm
        .try_clone()
        .context("Failed to duplicate the window manager socket")?;
    let connect = ConnectOptions {
        clipboard_manager: config.bridge.clipboard_manager,
    };
    let conn = tokio::task::spawn_blocking(move || XConnection::connect(wm, connect))
        .await
        .context("Window manager setup task failed")??;

    let (reply, scale) = oneshot::channel();
    sender
        .send(BridgeCommand::AttachWindowManager { conn, scale: reply })
        .map_err(|_| anyhow::anyhow!("Bridge stopped before the window manager started"))?;
    let scale = tokio::select! {
        result = &mut bridge => return bridge_code(result),
        scale = scale => scale.context("Bridge stopped before the window manager started")?,
    };

    let env = [
        ("DISPLAY", display.clone()),
        ("XCURSOR_SIZE", output::xcursor_size(scale).to_string()),
    ];
    info!("🪟 Xwayland is {} at scale {}", display, scale);
    let child = spawn_program(&cli.program, &env, None)?;
    supervise(config, bridge, sender, Some(child), Some(xwayland.child)).await
}

async fn run_peer(fd: RawFd, config: &CrosswayConfig) -> Result<i32> {
    // SAFETY: master mode hands us this descriptor and nothing else owns it.
    let guest = unsafe { UnixStream::from_raw_fd(fd) };
    let drivers = Drivers::select(&config.bridge)?;
    let (sender, bridge) = start_bridge(config, drivers, guest, false)?;
    supervise(config, bridge, sender, None, None).await
}

async fn run_master(cli: &Cli, config: &CrosswayConfig) -> Result<i32> {
    let runtime_dir =
        PathBuf::from(std::env::var_os("XDG_RUNTIME_DIR").context("XDG_RUNTIME_DIR is not set")?);
    let socket_path = runtime_dir.join(&config.bridge.socket);
    let lock_path = runtime_dir.join(format!("{}.lock", config.bridge.socket));

    let lock = OpenOptions::new()
        .create(true)
        .write(true)
        .mode(0o660)
        .open(&lock_path)
        .with_context(|| format!("Failed to open {}", lock_path.display()))?;
    rustix::fs::flock(&lock, rustix::fs::FlockOperation::NonBlockingLockExclusive)
        .with_context(|| format!("{} is served by another process", socket_path.display()))?;

    // the lock is ours, so any socket file left behind is stale
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
    info!("👂 Listening on {}", socket_path.display());

    let exe = std::env::current_exe().context("Failed to locate our own executable")?;
    let prefix: Vec<String> = config
        .bridge
        .peer_cmd_prefix
        .as_deref()
        .map(|p| p.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    let forwarded = cli.peer_args();

    loop {
        let (stream, _) = listener.accept().await.context("Accept failed")?;
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        let fd = stream.as_raw_fd();

        let mut argv = prefix.clone();
        argv.push(exe.display().to_string());
        argv.push(format!("--peer={}", fd));
        argv.extend(forwarded.iter().cloned());

        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]).stdin(Stdio::null());
        // SAFETY: the hook only calls fcntl, which is async-signal-safe.
        unsafe {
            command.pre_exec(move || sys::clear_cloexec(fd));
        }
        match command.spawn() {
            Ok(mut peer) => {
                debug!("🔀 Peer {:?} serves a new guest", peer.id());
                tokio::spawn(async move {
                    if let Ok(status) = peer.wait().await {
                        debug!("👋 Peer exited with {}", status);
                    }
                });
            }
            Err(err) => error!("❌ Failed to spawn a peer: {}", err),
        }
        drop(stream);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = CrosswayConfig::load_or_default(cli.config.as_deref())?;
    config.apply_env()?;
    cli.apply(&mut config)?;
    config.validate()?;

    crossway::logging::init(&config.logging, cli.debug)?;

    info!("🚀 Starting crossway {}", crossway::VERSION);
    debug!(
        "📄 Built {} for {} ({})",
        env!("CROSSWAY_BUILD_DATE"),
        env!("CROSSWAY_TARGET"),
        option_env!("CROSSWAY_GIT_COMMIT").unwrap_or("unknown commit")
    );

    let code = if let Some(fd) = cli.peer {
        run_peer(fd, &config).await?
    } else if cli.master {
        run_master(&cli, &config).await?
    } else if cli.xwayland {
        run_xwayland(&cli, &config).await?
    } else {
        run_spawn(&cli, &config).await?
    };

    info!("👋 crossway exiting with {}", code);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["crossway", "weston-terminal"]).unwrap();
        assert!(!cli.debug);
        assert!(!cli.master);
        assert!(!cli.xwayland);
        assert_eq!(cli.program, vec!["weston-terminal"]);
    }

    #[test]
    fn test_program_arguments_are_not_flags() {
        let cli = Cli::try_parse_from(["crossway", "-X", "--scale=2", "xterm", "-e", "top"]).unwrap();
        assert!(cli.xwayland);
        assert_eq!(cli.scale, Some(2.0));
        assert_eq!(cli.program, vec!["xterm", "-e", "top"]);
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "crossway",
            "--scale=20",
            "--dpi=96,160",
            "--no-exit-with-child",
            "--no-clipboard-manager",
            "--frame-color=#000000",
            "--x-auth=/run/xauth",
            "prog",
        ])
        .unwrap();
        let mut config = CrosswayConfig::default();
        cli.apply(&mut config).unwrap();

        assert_eq!(config.bridge.scale, 10.0);
        assert_eq!(config.bridge.dpi, vec![96, 160]);
        assert!(!config.bridge.exit_with_child);
        assert!(!config.bridge.clipboard_manager);
        assert_eq!(config.bridge.frame_color, "#000000");
        assert_eq!(config.xwayland.auth, Some(PathBuf::from("/run/xauth")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_peer_args_forward_bridge_flags() {
        let cli = Cli::try_parse_from([
            "crossway",
            "--master",
            "--socket=wayland-1",
            "--scale=1.5",
            "--shm-driver=virtwl",
            "--debug",
        ])
        .unwrap();
        assert_eq!(
            cli.peer_args(),
            vec!["--scale=1.5", "--shm-driver=virtwl", "--debug"]
        );
    }

    #[test]
    fn test_xwayland_dpi_default() {
        let config = CrosswayConfig::default();
        let options = bridge_options(&config, true).unwrap();
        assert_eq!(options.dpi, XWAYLAND_DPI.to_vec());
        assert!(bridge_options(&config, false).unwrap().dpi.is_empty());
    }

    #[test]
    fn test_status_code() {
        assert_eq!(status_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(status_code(ExitStatus::from_raw(15)), 143);
    }
}
