//! Held modifier tracking

use std::collections::BTreeSet;

use thumbmap_config::{is_modifier_key, MODIFIER_KEYS};

use crate::event_value;

/// Set of currently pressed modifier names
///
/// Names are kept sorted so that the chord lookup key does not depend on
/// the order in which modifiers were pressed.
#[derive(Debug, Default, Clone)]
pub struct ModifierState {
    pressed: BTreeSet<&'static str>,
}

impl ModifierState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_modifier(key: &str) -> bool {
        is_modifier_key(key)
    }

    /// Track a key event; non-modifiers and repeats are ignored.
    pub fn update(&mut self, key: &str, value: i32) {
        let Some(name) = MODIFIER_KEYS.iter().copied().find(|m| *m == key) else {
            return;
        };
        match value {
            event_value::PRESS => {
                self.pressed.insert(name);
            }
            event_value::RELEASE => {
                self.pressed.remove(name);
            }
            _ => {}
        }
    }

    /// Lookup key for `key` with the held modifiers, e.g. `LEFTCTRL+LEFTSHIFT+A`.
    pub fn current_combination(&self, key: &str) -> String {
        if Self::is_modifier(key) || self.pressed.is_empty() {
            return key.to_string();
        }
        let mut parts: Vec<&str> = self.pressed.iter().copied().collect();
        parts.push(key);
        parts.join("+")
    }

    /// Held modifiers in sorted order.
    pub fn pressed(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.pressed.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.pressed.is_empty()
    }

    pub fn clear(&mut self) {
        self.pressed.clear();
    }
}
