//! Protocol bridge core
//!
//! The building blocks every forwarded capability uses: index-stable storage,
//! the advertised global table, and resource/proxy pairs with exactly-once
//! teardown.

pub mod arena;
pub mod globals;
pub mod pairs;

pub use arena::{Arena, Key};
pub use globals::{Binding, Global, GlobalKind, GlobalTable, RegistrySink};
pub use pairs::{Pair, PairKey, PairTable, Teardown};
