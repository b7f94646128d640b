//! # Sections
//!
//! A `Section` is one displayable field of the status line. It is created and
//! mutated by exactly one input plugin and read by the output plugin on every tick.
//!
//! ```text
//! Section
//! ├── name, instance          // identity, unique in the Registry
//! ├── label + label_colour    // optional prefix
//! ├── colour, background      // optional RGBA
//! ├── align, max_width        // layout hints for the output
//! ├── state                   // Unavailable | Active(flags)
//! ├── value, short_value      // what gets shown
//! ├── dirty + cache           // output-side serialization cache
//! └── actionable              // owning plugin accepts actions
//! ```
//!
//! Setters always mark the section dirty. The output clears it with `set_cache()`.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Shown instead of the value when a section is `State::Unavailable`.
pub const UNAVAILABLE_PLACEHOLDER: &str = "N/A";

// ============================================================================
// Colour
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Colour {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub alpha: u8,
}

impl Colour {
    pub const fn rgb(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue, alpha: 0xff }
    }
}

/// Prints `#rrggbb`, or `#rrggbbaa` when not fully opaque.
impl fmt::Display for Colour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.red, self.green, self.blue)?;
        if self.alpha != 0xff {
            write!(f, "{:02x}", self.alpha)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseColourError(String);

impl fmt::Display for ParseColourError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid colour '{}', expected #rrggbb or #rrggbbaa", self.0)
    }
}

impl std::error::Error for ParseColourError {}

impl FromStr for Colour {
    type Err = ParseColourError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseColourError(s.to_string());
        let hex = s.strip_prefix('#').ok_or_else(err)?;
        if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
            return Err(err());
        }
        let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| err());
        Ok(Self {
            red: byte(0)?,
            green: byte(2)?,
            blue: byte(4)?,
            alpha: if hex.len() == 8 { byte(6)? } else { 0xff },
        })
    }
}

// ============================================================================
// Alignment & State
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Align {
    #[default]
    Start,
    End,
    Center,
}

bitflags! {
    /// Composable severity flags of an available section.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct StateFlags: u8 {
        const GOOD    = 0b0001;
        const AVERAGE = 0b0010;
        const BAD     = 0b0100;
        const URGENT  = 0b1000;
    }
}

/// `Unavailable` is exclusive: it cannot carry flags and overrides the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Unavailable,
    Active(StateFlags),
}

impl Default for State {
    fn default() -> Self {
        State::Active(StateFlags::empty())
    }
}

impl State {
    pub const NO_STATE: State = State::Active(StateFlags::empty());

    pub fn flags(self) -> StateFlags {
        match self {
            State::Unavailable => StateFlags::empty(),
            State::Active(flags) => flags,
        }
    }

    pub fn is_urgent(self) -> bool {
        self.flags().contains(StateFlags::URGENT)
    }
}

// ============================================================================
// Section
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Section {
    name: String,
    instance: String,
    label: Option<String>,
    label_colour: Option<Colour>,
    colour: Option<Colour>,
    background_colour: Option<Colour>,
    align: Align,
    max_width: i64,
    state: State,
    value: Option<String>,
    short_value: Option<String>,
    dirty: bool,
    cache: Option<String>,
    actionable: bool,
}

impl Section {
    pub fn new(name: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: instance.into(),
            dirty: true,
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn identity(&self) -> (&str, &str) {
        (&self.name, &self.instance)
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn label_colour(&self) -> Option<Colour> {
        self.label_colour
    }

    pub fn colour(&self) -> Option<Colour> {
        self.colour
    }

    pub fn background_colour(&self) -> Option<Colour> {
        self.background_colour
    }

    pub fn align(&self) -> Align {
        self.align
    }

    pub fn max_width(&self) -> i64 {
        self.max_width
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn short_value(&self) -> Option<&str> {
        self.short_value.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn cache(&self) -> Option<&str> {
        self.cache.as_deref()
    }

    pub fn is_actionable(&self) -> bool {
        self.actionable
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = Some(label.into());
        self.dirty = true;
    }

    pub fn set_label_colour(&mut self, colour: Option<Colour>) {
        self.label_colour = colour;
        self.dirty = true;
    }

    pub fn set_colour(&mut self, colour: Option<Colour>) {
        self.colour = colour;
        self.dirty = true;
    }

    pub fn set_background_colour(&mut self, colour: Option<Colour>) {
        self.background_colour = colour;
        self.dirty = true;
    }

    pub fn set_align(&mut self, align: Align) {
        self.align = align;
        self.dirty = true;
    }

    /// Positive: absolute codepoint cap. Negative: cap is the magnitude. Zero: no cap.
    pub fn set_max_width(&mut self, max_width: i64) {
        self.max_width = max_width;
        self.dirty = true;
    }

    /// Sizes the section to the worst-case rendering `sample`.
    pub fn set_max_width_sample(&mut self, sample: &str) {
        self.set_max_width(-(sample.chars().count() as i64));
    }

    pub fn set_state(&mut self, state: State) {
        if self.state != state {
            self.state = state;
            self.dirty = true;
        }
    }

    pub fn set_value(&mut self, value: Option<String>) {
        if self.value != value {
            self.value = value;
            self.dirty = true;
        }
    }

    pub fn set_short_value(&mut self, short_value: Option<String>) {
        if self.short_value != short_value {
            self.short_value = short_value;
            self.dirty = true;
        }
    }

    pub fn set_actionable(&mut self, actionable: bool) {
        self.actionable = actionable;
    }

    /// Stores the output's serialized form and clears the dirty flag.
    pub fn set_cache(&mut self, cache: String) {
        self.cache = Some(cache);
        self.dirty = false;
    }

    /// Effective codepoint cap, if any.
    pub fn width_cap(&self) -> Option<usize> {
        match self.max_width {
            0 => None,
            w => Some(w.unsigned_abs() as usize),
        }
    }

    /// The text an output should show for this section, after applying
    /// the unavailable override and the width cap.
    pub fn display_value(&self) -> Option<Cow<'_, str>> {
        if self.state == State::Unavailable {
            return Some(Cow::Borrowed(UNAVAILABLE_PLACEHOLDER));
        }
        let value = self.value.as_deref()?;
        let Some(cap) = self.width_cap() else {
            return Some(Cow::Borrowed(value));
        };
        if value.chars().count() <= cap {
            return Some(Cow::Borrowed(value));
        }
        match self.short_value.as_deref() {
            Some(short) => Some(Cow::Borrowed(short)),
            None => Some(Cow::Owned(value.chars().take(cap).collect())),
        }
    }
}
