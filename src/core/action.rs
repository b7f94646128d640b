//! # Actions
//!
//! The status-bar host reports interactions (clicks, scrolls) as
//! `(section name, section instance, event id)` triples. Routing one back to
//! its plugin is a two step affair:
//!
//! ```text
//! InboundEvent ──route()──► SectionHandle ──core──► plugin.on_action(key, event_id)
//!                                                        │
//!                                              ActionTable::lookup(event_id)
//! ```
//!
//! Routing never fails loudly: the host may click a section that was removed
//! a moment ago, and not every section takes actions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use log::{debug, warn};

use crate::core::registry::{Registry, SectionHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub name: String,
    pub instance: String,
    pub event_id: String,
}

impl InboundEvent {
    pub fn new(
        name: impl Into<String>,
        instance: impl Into<String>,
        event_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            instance: instance.into(),
            event_id: event_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// A configured action name the plugin does not know.
    UnknownAction(String),
    /// The device or service refused the request.
    Rejected(String),
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionError::UnknownAction(name) => write!(f, "unknown action '{name}'"),
            ActionError::Rejected(msg) => write!(f, "action rejected: {msg}"),
        }
    }
}

impl std::error::Error for ActionError {}

/// Resolves the section an event targets.
///
/// `None` when the section does not exist or does not take actions; both are
/// silently ignored by the caller.
pub fn route(registry: &Registry, event: &InboundEvent) -> Option<SectionHandle> {
    let Some((handle, section)) = registry.find_by_identity(&event.name, &event.instance) else {
        debug!(
            "No section {}/{} for event '{}'",
            event.name, event.instance, event.event_id
        );
        return None;
    };
    if !section.is_actionable() {
        debug!(
            "Section {}/{} takes no actions, ignoring '{}'",
            event.name, event.instance, event.event_id
        );
        return None;
    }
    Some(handle)
}

/// Maps host event ids to a plugin's own action enum.
///
/// Built once from the plugin's fixed list of action names and the user's
/// `event id → action name` configuration.
#[derive(Debug, Clone)]
pub struct ActionTable<A> {
    by_event: HashMap<String, A>,
}

impl<A: Copy> ActionTable<A> {
    pub fn build(known: &[(&str, A)], configured: &BTreeMap<String, String>) -> Self {
        let mut by_event = HashMap::new();
        for (event_id, action_name) in configured {
            match known.iter().find(|(name, _)| *name == action_name.trim()) {
                Some((_, action)) => {
                    by_event.insert(event_id.clone(), *action);
                }
                None => warn!(
                    "Ignoring binding for '{}': {}",
                    event_id,
                    ActionError::UnknownAction(action_name.clone())
                ),
            }
        }
        Self { by_event }
    }

    pub fn lookup(&self, event_id: &str) -> Option<A> {
        self.by_event.get(event_id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.by_event.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::PluginId;
    use crate::core::section::Section;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Volume {
        Raise,
        MuteToggle,
    }

    const KNOWN: &[(&str, Volume)] = &[("raise", Volume::Raise), ("mute toggle", Volume::MuteToggle)];

    fn bindings(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_action_table_lookup() {
        let table = ActionTable::build(
            KNOWN,
            &bindings(&[("mouse:1", "mute toggle"), ("mouse:4", "raise")]),
        );
        assert_eq!(table.lookup("mouse:1"), Some(Volume::MuteToggle));
        assert_eq!(table.lookup("mouse:4"), Some(Volume::Raise));
        assert_eq!(table.lookup("mouse:3"), None);
    }

    #[test]
    fn test_action_table_skips_unknown_names() {
        let table = ActionTable::build(KNOWN, &bindings(&[("mouse:1", "explode")]));
        assert!(table.is_empty());
    }

    #[test]
    fn test_route_unknown_section_is_none() {
        let registry = Registry::new();
        assert!(route(&registry, &InboundEvent::new("ghost", "0", "mouse:1")).is_none());
    }

    #[test]
    fn test_route_requires_actionable_section() {
        let mut registry = Registry::new();
        let handle = SectionHandle::new(PluginId(0), 1);
        registry.insert(handle, Section::new("pulseaudio", "sink0"));
        let event = InboundEvent::new("pulseaudio", "sink0", "mouse:1");
        assert!(route(&registry, &event).is_none());

        registry.find_mut(handle).unwrap().set_actionable(true);
        assert_eq!(route(&registry, &event), Some(handle));
    }
}
