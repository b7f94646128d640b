//! Status-bar facing side: how lines are written and where they go.

pub mod channel;
pub mod flat;
pub mod i3bar;

pub use channel::{Channel, MemoryChannel, MemoryConnection, MemoryHost, StdioChannel, TransportError};
pub use flat::FlatOutput;
pub use i3bar::I3barOutput;

use crate::core::plugin::OutputConstructor;

/// Output plugins by configuration name.
pub fn lookup(name: &str) -> Option<OutputConstructor> {
    match name {
        "flat" => Some(FlatOutput::init),
        "i3bar" => Some(I3barOutput::init),
        _ => None,
    }
}
