//! # Section Registry
//!
//! Owns every live `Section` in display order. Sections live in an arena of
//! slots; two indexes sit on top of it:
//!
//! - `handles`: `SectionHandle` → slot, where the handle is the owning plugin
//!   plus an opaque key it chose (a sink index, a device path hash, ...).
//! - `identities`: `(name, instance)` → slot, for action routing.
//!
//! `order` lists occupied slots grouped by owning plugin, in plugin order,
//! then in insertion order within a plugin. A section a plugin discovers late
//! still lands in its plugin's group. Iteration is stable across ticks until
//! something is inserted or removed.

use std::collections::HashMap;

use log::{debug, warn};

use crate::core::section::Section;

/// Position of a plugin in the core's plugin list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginId(pub usize);

/// Plugin-scoped key for one of its sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionHandle {
    pub plugin: PluginId,
    pub key: u64,
}

impl SectionHandle {
    pub fn new(plugin: PluginId, key: u64) -> Self {
        Self { plugin, key }
    }
}

struct Slot {
    handle: SectionHandle,
    section: Section,
}

#[derive(Default)]
pub struct Registry {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    order: Vec<usize>,
    handles: HashMap<SectionHandle, usize>,
    identities: HashMap<(String, String), usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Inserts `section` after the other sections of its plugin.
    ///
    /// Returns `false` and drops nothing already registered if either the
    /// handle or the `(name, instance)` identity is taken.
    pub fn insert(&mut self, handle: SectionHandle, section: Section) -> bool {
        let identity = (section.name().to_string(), section.instance().to_string());
        if self.identities.contains_key(&identity) {
            warn!(
                "Section {}/{} already registered, ignoring duplicate",
                identity.0, identity.1
            );
            return false;
        }
        if self.handles.contains_key(&handle) {
            warn!("Section handle {:?} already in use", handle);
            return false;
        }

        let slot = Slot { handle, section };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        debug!("Registered section {}/{} at slot {}", identity.0, identity.1, index);
        let position = self
            .order
            .iter()
            .position(|&i| {
                self.slots[i]
                    .as_ref()
                    .is_some_and(|slot| slot.handle.plugin > handle.plugin)
            })
            .unwrap_or(self.order.len());
        self.order.insert(position, index);
        self.handles.insert(handle, index);
        self.identities.insert(identity, index);
        true
    }

    /// Removes and returns the section registered under `handle`.
    pub fn remove(&mut self, handle: SectionHandle) -> Option<Section> {
        let index = self.handles.remove(&handle)?;
        let slot = self.slots[index].take()?;
        self.identities
            .remove(&(slot.section.name().to_string(), slot.section.instance().to_string()));
        self.order.retain(|&i| i != index);
        self.free.push(index);
        debug!(
            "Removed section {}/{}",
            slot.section.name(),
            slot.section.instance()
        );
        Some(slot.section)
    }

    /// Removes every section owned by `plugin`, returning how many went away.
    pub fn remove_owned_by(&mut self, plugin: PluginId) -> usize {
        let owned: Vec<SectionHandle> = self
            .handles
            .keys()
            .filter(|h| h.plugin == plugin)
            .copied()
            .collect();
        owned.into_iter().filter_map(|h| self.remove(h)).count()
    }

    pub fn find(&self, handle: SectionHandle) -> Option<&Section> {
        let index = *self.handles.get(&handle)?;
        self.slots[index].as_ref().map(|slot| &slot.section)
    }

    pub fn find_mut(&mut self, handle: SectionHandle) -> Option<&mut Section> {
        let index = *self.handles.get(&handle)?;
        self.slots[index].as_mut().map(|slot| &mut slot.section)
    }

    /// Looks a section up by its `(name, instance)` identity.
    pub fn find_by_identity(&self, name: &str, instance: &str) -> Option<(SectionHandle, &Section)> {
        let index = *self
            .identities
            .get(&(name.to_string(), instance.to_string()))?;
        self.slots[index]
            .as_ref()
            .map(|slot| (slot.handle, &slot.section))
    }

    /// Read view of all sections in display order.
    pub fn snapshot(&self) -> Vec<&Section> {
        self.order
            .iter()
            .filter_map(|&i| self.slots[i].as_ref().map(|slot| &slot.section))
            .collect()
    }

    /// Mutable view in display order, used by outputs to maintain section caches.
    pub fn snapshot_mut(&mut self) -> Vec<&mut Section> {
        let mut by_slot: Vec<Option<&mut Section>> = self
            .slots
            .iter_mut()
            .map(|slot| slot.as_mut().map(|s| &mut s.section))
            .collect();
        self.order
            .iter()
            .filter_map(|&i| by_slot[i].take())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(plugin: usize, key: u64) -> SectionHandle {
        SectionHandle::new(PluginId(plugin), key)
    }

    fn names(registry: &Registry) -> Vec<String> {
        registry
            .snapshot()
            .iter()
            .map(|s| format!("{}/{}", s.name(), s.instance()))
            .collect()
    }

    #[test]
    fn test_insert_rejects_duplicate_identity() {
        let mut registry = Registry::new();
        let mut first = Section::new("pulseaudio", "sink0");
        first.set_value(Some("first".into()));
        assert!(registry.insert(handle(0, 0), first));

        let mut second = Section::new("pulseaudio", "sink0");
        second.set_value(Some("second".into()));
        assert!(!registry.insert(handle(0, 1), second));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find(handle(0, 0)).unwrap().value(), Some("first"));
        assert!(registry.find(handle(0, 1)).is_none());
    }

    #[test]
    fn test_insert_rejects_duplicate_handle() {
        let mut registry = Registry::new();
        assert!(registry.insert(handle(0, 7), Section::new("a", "1")));
        assert!(!registry.insert(handle(0, 7), Section::new("a", "2")));
        assert!(registry.find_by_identity("a", "2").is_none());
    }

    #[test]
    fn test_same_key_different_plugins_is_allowed() {
        let mut registry = Registry::new();
        assert!(registry.insert(handle(0, 1), Section::new("a", "x")));
        assert!(registry.insert(handle(1, 1), Section::new("b", "x")));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_snapshot_keeps_insertion_order_across_removal() {
        let mut registry = Registry::new();
        registry.insert(handle(0, 1), Section::new("a", "1"));
        registry.insert(handle(0, 2), Section::new("a", "2"));
        registry.insert(handle(1, 1), Section::new("b", "1"));
        assert_eq!(names(&registry), ["a/1", "a/2", "b/1"]);

        let removed = registry.remove(handle(0, 2)).unwrap();
        assert_eq!(removed.instance(), "2");
        assert_eq!(names(&registry), ["a/1", "b/1"]);

        // Reused slot goes to the end of its plugin's group
        registry.insert(handle(0, 3), Section::new("a", "3"));
        assert_eq!(names(&registry), ["a/1", "a/3", "b/1"]);
    }

    #[test]
    fn test_late_section_joins_its_plugin_group() {
        let mut registry = Registry::new();
        registry.insert(handle(1, 1), Section::new("b", "1"));
        registry.insert(handle(2, 1), Section::new("c", "1"));
        registry.insert(handle(0, 1), Section::new("a", "1"));
        registry.insert(handle(1, 2), Section::new("b", "2"));
        registry.insert(handle(0, 2), Section::new("a", "2"));
        assert_eq!(names(&registry), ["a/1", "a/2", "b/1", "b/2", "c/1"]);
    }

    #[test]
    fn test_removed_identity_can_be_reinserted() {
        let mut registry = Registry::new();
        registry.insert(handle(0, 1), Section::new("a", "1"));
        registry.remove(handle(0, 1));
        assert!(registry.insert(handle(0, 1), Section::new("a", "1")));
    }

    #[test]
    fn test_remove_unknown_handle_is_none() {
        let mut registry = Registry::new();
        assert!(registry.remove(handle(3, 3)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_find_by_identity_returns_handle() {
        let mut registry = Registry::new();
        registry.insert(handle(2, 42), Section::new("pulseaudio", "sink0"));
        let (h, section) = registry.find_by_identity("pulseaudio", "sink0").unwrap();
        assert_eq!(h, handle(2, 42));
        assert_eq!(section.name(), "pulseaudio");
    }

    #[test]
    fn test_remove_owned_by() {
        let mut registry = Registry::new();
        registry.insert(handle(0, 1), Section::new("a", "1"));
        registry.insert(handle(1, 1), Section::new("b", "1"));
        registry.insert(handle(0, 2), Section::new("a", "2"));
        assert_eq!(registry.remove_owned_by(PluginId(0)), 2);
        assert_eq!(names(&registry), ["b/1"]);
    }

    #[test]
    fn test_snapshot_mut_follows_order() {
        let mut registry = Registry::new();
        registry.insert(handle(0, 1), Section::new("a", "1"));
        registry.insert(handle(0, 2), Section::new("a", "2"));
        registry.remove(handle(0, 1));
        registry.insert(handle(0, 3), Section::new("a", "3"));

        for section in registry.snapshot_mut() {
            section.set_cache(section.instance().to_string());
        }
        let caches: Vec<_> = registry.snapshot().iter().map(|s| s.cache().unwrap().to_string()).collect();
        assert_eq!(caches, ["2", "3"]);
    }
}
