//! Plain-text output: one line per tick, sections joined by a separator.
//!
//! Inbound events are whitespace-separated `name instance event id` lines,
//! which is easy to drive from a shell or a bar that runs scripts on click.

use unicode_width::UnicodeWidthStr;

use crate::core::action::InboundEvent;
use crate::core::config::ResolvedConfig;
use crate::core::plugin::{OutputPlugin, PluginInitError};
use crate::core::section::{Align, Section};

pub struct FlatOutput {
    separator: String,
}

impl FlatOutput {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }

    pub fn init(config: &ResolvedConfig) -> Result<Box<dyn OutputPlugin>, PluginInitError> {
        Ok(Box::new(Self::new(config.flat_separator.clone())))
    }
}

fn pad(text: String, cap: Option<usize>, align: Align) -> String {
    let Some(cap) = cap else { return text };
    let width = text.width();
    if width >= cap {
        return text;
    }
    let fill = cap - width;
    match align {
        Align::Start => format!("{text}{}", " ".repeat(fill)),
        Align::End => format!("{}{text}", " ".repeat(fill)),
        Align::Center => {
            let left = fill / 2;
            format!("{}{text}{}", " ".repeat(left), " ".repeat(fill - left))
        }
    }
}

fn render_section(section: &Section) -> String {
    let Some(value) = section.display_value() else {
        return String::new();
    };
    let mut text = match section.label() {
        Some(label) => format!("{label}: {value}"),
        None => value.into_owned(),
    };
    if section.state().is_urgent() {
        text = format!("!{text}!");
    }
    pad(text, section.width_cap(), section.align())
}

impl OutputPlugin for FlatOutput {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn generate_line(&mut self, sections: &mut [&mut Section]) -> String {
        let mut parts = Vec::with_capacity(sections.len());
        for section in sections.iter_mut() {
            if section.is_dirty() || section.cache().is_none() {
                let rendered = render_section(section);
                section.set_cache(rendered);
            }
            if let Some(cached) = section.cache()
                && !cached.is_empty()
            {
                parts.push(cached.to_string());
            }
        }
        parts.join(&self.separator)
    }

    fn parse_event(&self, line: &str) -> Option<InboundEvent> {
        let mut fields = line.trim().splitn(3, char::is_whitespace);
        let name = fields.next().filter(|s| !s.is_empty())?;
        let instance = fields.next()?;
        let event_id = fields.next()?.trim();
        if event_id.is_empty() {
            return None;
        }
        Some(InboundEvent::new(name, instance, event_id))
    }
}
