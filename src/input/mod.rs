//! Data sources. Each plugin owns the sections it registers.

pub mod pulseaudio;
pub mod upower;

pub use pulseaudio::PulseAudio;
pub use upower::Upower;

use crate::core::plugin::{constructor, InputConstructor};

/// Input plugins by configuration name.
pub fn lookup(name: &str) -> Option<InputConstructor> {
    match name {
        "pulseaudio" => Some(constructor::<PulseAudio>()),
        "upower" => Some(constructor::<Upower>()),
        _ => None,
    }
}
