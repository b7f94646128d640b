//! # i3bar Protocol Output
//!
//! Speaks the i3bar/swaybar JSON protocol:
//!
//! ```text
//! {"version":1,"click_events":true}      header
//! [                                      infinite array opens
//! [{"full_text":"40% 60%",...},...]      first line
//! ,[{"full_text":"50%",...},...]         every later line
//! ```
//!
//! Click events come back on stdin as the same kind of infinite array of
//! objects, which map to event ids `mouse:<button>`.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::core::action::InboundEvent;
use crate::core::config::ResolvedConfig;
use crate::core::plugin::{OutputPlugin, PluginInitError};
use crate::core::section::{Align, Colour, Section, State, StateFlags};

const GOOD_COLOUR: Colour = Colour::rgb(0x88, 0xb0, 0x90);
const AVERAGE_COLOUR: Colour = Colour::rgb(0xcc, 0xdc, 0x90);
const BAD_COLOUR: Colour = Colour::rgb(0xe8, 0x93, 0x93);
const UNAVAILABLE_COLOUR: Colour = Colour::rgb(0x65, 0x65, 0x65);

#[derive(Serialize)]
struct Header {
    version: u8,
    click_events: bool,
}

#[derive(Serialize)]
struct Block<'a> {
    name: &'a str,
    instance: &'a str,
    full_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    short_text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    background: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_width: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    align: Option<&'static str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    urgent: bool,
}

#[derive(Deserialize)]
struct ClickEvent {
    name: Option<String>,
    instance: Option<String>,
    button: u32,
}

pub struct I3barOutput {
    click_events: bool,
    first_line: bool,
}

impl I3barOutput {
    pub fn new(click_events: bool) -> Self {
        Self {
            click_events,
            first_line: true,
        }
    }

    pub fn init(config: &ResolvedConfig) -> Result<Box<dyn OutputPlugin>, PluginInitError> {
        Ok(Box::new(Self::new(config.i3bar_click_events)))
    }
}

fn state_colour(state: State) -> Option<Colour> {
    match state {
        State::Unavailable => Some(UNAVAILABLE_COLOUR),
        State::Active(flags) if flags.contains(StateFlags::BAD) => Some(BAD_COLOUR),
        State::Active(flags) if flags.contains(StateFlags::AVERAGE) => Some(AVERAGE_COLOUR),
        State::Active(flags) if flags.contains(StateFlags::GOOD) => Some(GOOD_COLOUR),
        State::Active(_) => None,
    }
}

/// Serializes one section, or `None` when it has nothing to show.
fn render_block(section: &Section) -> Option<String> {
    let value = section.display_value()?;
    let full_text = match section.label() {
        Some(label) => format!("{label} {value}"),
        None => value.into_owned(),
    };
    let min_width = section.width_cap();
    let block = Block {
        name: section.name(),
        instance: section.instance(),
        full_text,
        short_text: section
            .short_value()
            .filter(|_| section.state() != State::Unavailable),
        color: section
            .colour()
            .or_else(|| state_colour(section.state()))
            .map(|c| c.to_string()),
        background: section.background_colour().map(|c| c.to_string()),
        min_width,
        align: min_width.map(|_| match section.align() {
            Align::Start => "left",
            Align::End => "right",
            Align::Center => "center",
        }),
        urgent: section.state().is_urgent(),
    };
    match serde_json::to_string(&block) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!("Failed to serialize section {}/{}: {}", section.name(), section.instance(), e);
            None
        }
    }
}

impl OutputPlugin for I3barOutput {
    fn name(&self) -> &'static str {
        "i3bar"
    }

    fn stream_new(&mut self) {
        self.first_line = true;
    }

    fn header(&mut self) -> Option<String> {
        let header = Header {
            version: 1,
            click_events: self.click_events,
        };
        let json = serde_json::to_string(&header).ok()?;
        Some(format!("{json}\n[\n"))
    }

    fn generate_line(&mut self, sections: &mut [&mut Section]) -> String {
        let mut blocks = Vec::with_capacity(sections.len());
        for section in sections.iter_mut() {
            if section.is_dirty() || section.cache().is_none() {
                let rendered = render_block(section).unwrap_or_default();
                section.set_cache(rendered);
            }
            if let Some(cached) = section.cache()
                && !cached.is_empty()
            {
                blocks.push(cached.to_string());
            }
        }
        format!("[{}]", blocks.join(","))
    }

    fn frame_line(&mut self, line: &str) -> String {
        if std::mem::replace(&mut self.first_line, false) {
            format!("{line}\n")
        } else {
            format!(",{line}\n")
        }
    }

    fn parse_event(&self, line: &str) -> Option<InboundEvent> {
        let trimmed = line.trim().trim_start_matches(['[', ',']).trim();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_str::<ClickEvent>(trimmed) {
            Ok(click) => Some(InboundEvent::new(
                click.name?,
                click.instance.unwrap_or_default(),
                format!("mouse:{}", click.button),
            )),
            Err(e) => {
                debug!("Ignoring unparseable click event '{}': {}", trimmed, e);
                None
            }
        }
    }

    fn uninit(&mut self) -> Option<String> {
        Some("]\n".to_string())
    }
}
