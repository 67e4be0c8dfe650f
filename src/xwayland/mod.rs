//! Xwayland launcher for `-X` mode
//!
//! Xwayland is started rootless with three inherited descriptors: its Wayland
//! connection (`WAYLAND_SOCKET`), the window manager socket (`-wm`) and a pipe
//! it writes the display name to once it is ready (`-displayfd`).

use crate::config::CrosswayConfig;
use crate::sys;
use anyhow::{Context, Result};
use log::{debug, info};
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// How to invoke Xwayland.
#[derive(Debug, Clone, PartialEq)]
pub struct XwaylandOptions {
    pub path: String,
    pub gl_driver_path: Option<PathBuf>,
    pub auth: Option<PathBuf>,
    pub font_path: Option<String>,
    pub cmd_prefix: Option<String>,
    pub glamor: bool,
    /// Pass `-shm`: buffers are forwarded to the host as they are.
    pub shm: bool,
    /// Fixed display number instead of the first free one.
    pub display_number: Option<u32>,
}

impl XwaylandOptions {
    pub fn from_config(config: &CrosswayConfig, pass_through: bool) -> Self {
        Self {
            path: config.xwayland.path.clone(),
            gl_driver_path: config.xwayland.gl_driver_path.clone(),
            auth: config.xwayland.auth.clone(),
            font_path: config.xwayland.font_path.clone(),
            cmd_prefix: config.xwayland.cmd_prefix.clone(),
            glamor: config.bridge.glamor,
            shm: pass_through,
            display_number: None,
        }
    }

    /// Full argv, command prefix included.
    pub fn command_line(&self, displayfd: RawFd, wm_fd: RawFd) -> Vec<String> {
        let mut argv: Vec<String> = self
            .cmd_prefix
            .as_deref()
            .map(|p| p.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        argv.push(self.path.clone());
        if let Some(number) = self.display_number.filter(|n| *n > 0) {
            argv.push(format!(":{}", number));
        }
        argv.extend(
            [
                "-nolisten",
                "tcp",
                "-rootless",
                "-terminate",
                "-displayfd",
            ]
            .map(str::to_string),
        );
        argv.push(displayfd.to_string());
        argv.push("-wm".to_string());
        argv.push(wm_fd.to_string());
        if self.shm {
            argv.push("-shm".to_string());
        }
        if let Some(auth) = &self.auth {
            argv.push("-auth".to_string());
            argv.push(auth.display().to_string());
        }
        if let Some(fp) = &self.font_path {
            argv.push("-fp".to_string());
            argv.push(fp.clone());
        }
        if self.glamor {
            argv.push("-glamor".to_string());
            argv.push("gl".to_string());
        }
        argv
    }
}

/// A started Xwayland and our ends of its sockets.
pub struct Xwayland {
    pub child: Child,
    /// Our end of Xwayland's Wayland connection; becomes a guest client.
    pub wayland: UnixStream,
    /// Our end of the window manager socket.
    pub wm: UnixStream,
    displayfd: Option<OwnedFd>,
}

impl Xwayland {
    /// Wait until Xwayland reports its display, `:N`.
    ///
    /// Xwayland only answers once its Wayland connection is up, so the
    /// bridge has to be serving [`wayland`](Self::wayland) by then.
    pub async fn ready(&mut self) -> Result<String> {
        let fd = self
            .displayfd
            .take()
            .context("Xwayland display was already read")?;
        let display = tokio::task::spawn_blocking(move || read_display(fd))
            .await
            .context("Display reader task failed")??;
        debug!("🔗 Xwayland is ready on {}", display);
        Ok(display)
    }
}

/// Parse what Xwayland writes to `-displayfd`.
pub fn parse_display_reply(reply: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(reply).context("Xwayland display reply is not UTF-8")?;
    let number: u32 = text
        .trim()
        .trim_start_matches(':')
        .parse()
        .with_context(|| format!("Invalid Xwayland display reply '{}'", text.trim()))?;
    Ok(format!(":{}", number))
}

fn read_display(fd: OwnedFd) -> Result<String> {
    let mut file = File::from(fd);
    let mut reply = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = file
            .read(&mut byte)
            .context("Failed to read the Xwayland display")?;
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        reply.push(byte[0]);
    }
    if reply.is_empty() {
        anyhow::bail!("Xwayland exited before reporting its display");
    }
    parse_display_reply(&reply)
}

/// Start Xwayland. Its display is known once [`Xwayland::ready`] returns.
pub fn launch(options: &XwaylandOptions) -> Result<Xwayland> {
    let (wayland, wayland_child) =
        UnixStream::pair().context("Failed to create the Xwayland Wayland socket")?;
    let (wm, wm_child) = UnixStream::pair().context("Failed to create the window manager socket")?;
    let (display_read, display_write) = rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC)
        .context("Failed to create the displayfd pipe")?;

    let argv = options.command_line(display_write.as_raw_fd(), wm_child.as_raw_fd());
    info!("🚀 Starting Xwayland: {}", argv.join(" "));

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .env("WAYLAND_SOCKET", wayland_child.as_raw_fd().to_string())
        .stdin(Stdio::null())
        .kill_on_drop(true);
    if let Some(path) = &options.gl_driver_path {
        command.env("LIBGL_DRIVERS_PATH", path);
    }

    let inherited = [
        wayland_child.as_raw_fd(),
        wm_child.as_raw_fd(),
        display_write.as_raw_fd(),
    ];
    // SAFETY: the hook only calls fcntl, which is async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            for fd in inherited {
                sys::clear_cloexec(fd)?;
            }
            Ok(())
        });
    }

    let child = command
        .spawn()
        .with_context(|| format!("Failed to spawn {}", options.path))?;
    drop(wayland_child);
    drop(wm_child);
    drop(display_write);

    Ok(Xwayland {
        child,
        wayland,
        wm,
        displayfd: Some(display_read),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> XwaylandOptions {
        XwaylandOptions::from_config(&CrosswayConfig::default(), false)
    }

    #[test]
    fn test_minimal_command_line() {
        let argv = options().command_line(7, 9);
        assert_eq!(
            argv,
            vec![
                "Xwayland",
                "-nolisten",
                "tcp",
                "-rootless",
                "-terminate",
                "-displayfd",
                "7",
                "-wm",
                "9"
            ]
        );
    }

    #[test]
    fn test_optional_arguments() {
        let mut options = options();
        options.shm = true;
        options.glamor = true;
        options.auth = Some("/run/xauth".into());
        options.font_path = Some("/usr/share/fonts/X11/misc".into());
        options.cmd_prefix = Some("strace -f".into());

        let argv = options.command_line(3, 4);
        assert_eq!(&argv[..3], ["strace", "-f", "Xwayland"]);
        assert!(argv.contains(&"-shm".to_string()));
        let auth = argv.iter().position(|a| a == "-auth").unwrap();
        assert_eq!(argv[auth + 1], "/run/xauth");
        let fp = argv.iter().position(|a| a == "-fp").unwrap();
        assert_eq!(argv[fp + 1], "/usr/share/fonts/X11/misc");
        assert_eq!(argv.last().unwrap(), "gl");
    }

    #[test]
    fn test_fixed_display_number() {
        let mut options = options();
        options.display_number = Some(5);
        assert_eq!(&options.command_line(3, 4)[..2], ["Xwayland", ":5"]);

        options.display_number = Some(0);
        assert_eq!(options.command_line(3, 4)[1], "-nolisten");
    }

    #[test]
    fn test_display_reply() {
        assert_eq!(parse_display_reply(b"1").unwrap(), ":1");
        assert_eq!(parse_display_reply(b":12 ").unwrap(), ":12");
        assert!(parse_display_reply(b"").is_err());
        assert!(parse_display_reply(b"x").is_err());
    }

    #[test]
    fn test_read_display_stops_at_newline() {
        let (read, write) = rustix::pipe::pipe().unwrap();
        let mut writer = File::from(write);
        std::io::Write::write_all(&mut writer, b"3\ntrailing").unwrap();
        drop(writer);
        assert_eq!(read_display(read).unwrap(), ":3");
    }

    #[test]
    fn test_read_display_on_early_exit() {
        let (read, write) = rustix::pipe::pipe().unwrap();
        drop(write);
        assert!(read_display(read).is_err());
    }
}
