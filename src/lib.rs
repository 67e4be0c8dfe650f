//! # Crossway
//!
//! A protocol-translating Wayland proxy. Guest clients (a virtual machine's
//! applications, or Xwayland) connect to crossway as if it were their
//! compositor; crossway re-creates every object on a real host compositor and
//! translates between the two.
//!
//! ## Architecture
//!
//! - `bridge`: object pairing and the global registry, free of protocol types
//! - `surface`: per-surface state, damage tracking and the shm drivers
//! - `output`, `seat`: output scaling and input translation
//! - `xwm`: the X window manager used in Xwayland mode
//! - `selection`: clipboard bridging between X and the host
//! - `transport`, `sys`: the virtwl device and its channel
//! - `server`: the Wayland glue and event loop tying it all together
//! - `config`, `logging`, `drivers`, `xwayland`: process setup
//!
//! ## Usage
//!
//! ```rust,no_run
//! use crossway::config::CrosswayConfig;
//! use crossway::drivers::Drivers;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = CrosswayConfig::load_or_default(None)?;
//!     let drivers = Drivers::select(&config.bridge)?;
//!     println!("shm driver: {}", drivers.shm);
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod drivers;
pub mod error;
pub mod logging;
pub mod mmap;
pub mod output;
pub mod seat;
pub mod selection;
pub mod server;
pub mod surface;
pub mod sys;
pub mod transport;
pub mod xwayland;
pub mod xwm;

// Re-export main types for easy access
pub use config::CrosswayConfig;
pub use error::{BridgeError, BridgeResult};
pub use server::{BridgeCommand, BridgeOptions, BridgeSetup};

// Re-export common error types
pub use anyhow::{Context, Error, Result};

/// Version information for crossway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
