//! Key remapping decisions
//!
//! [`RemapEngine::process`] turns one physical key event into the events to
//! write on the synthetic keyboard plus the raw key frame for the host. It
//! does no I/O so every decision can be tested without devices.
//!
//! Resolution order for a key press:
//! 1. the simple subtable (plain key to key) gives the *effective* key
//! 2. the combo subtable is searched for `MODS+effective`, then `effective`
//! 3. otherwise the effective key is written as is

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use evdev::{EventType, InputEvent, Key};
use thumbmap_config::{
    canonical_combination, code_to_key, combination_keys, key_to_code, Layer, RemapTable,
    RemapValue, DEFAULT_EMERGENCY_UNGRAB_KEYS,
};

use crate::event_value;
use crate::frame::KeyFrame;
use crate::layer_manager::LayerManager;
use crate::modifier::ModifierState;

/// What a combo subtable entry does, resolved to key codes at load
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Single output key
    Key(Key),
    /// Combinations tapped in order: each is pressed, then released in reverse
    Burst(Vec<Vec<Key>>),
    /// No synthetic output; the host dispatches it from the raw key frame
    Command(String),
}

/// A merged remap table split by how entries are matched
#[derive(Debug, Default, Clone)]
pub struct SplitTable {
    /// Plain key to key; never contains chords, sequences or commands
    pub simple: HashMap<Key, Key>,
    /// Everything else, keyed by `KEY` or `MODS+KEY`
    pub combo: HashMap<String, Action>,
}

impl SplitTable {
    pub fn from_table(table: &RemapTable) -> Self {
        let mut split = SplitTable::default();

        for (from, value) in table {
            if value.is_simple() && !from.contains('+') {
                let RemapValue::Key(to) = value else {
                    continue;
                };
                match (key_to_code(from), key_to_code(to)) {
                    (Some(from_key), Some(to_key)) => {
                        split.simple.insert(from_key, to_key);
                    }
                    _ => tracing::warn!("Ignoring remap {} -> {}: unknown key name", from, to),
                }
                continue;
            }

            let action = match value {
                RemapValue::Key(to) => key_to_code(to).map(Action::Key),
                RemapValue::Combination(combo) => {
                    combination_keys(combo).map(|keys| Action::Burst(vec![keys]))
                }
                RemapValue::Sequence(combos) => combos
                    .iter()
                    .map(|c| combination_keys(c))
                    .collect::<Option<Vec<_>>>()
                    .map(Action::Burst),
                RemapValue::Command(command) => Some(Action::Command(command.clone())),
            };
            match action {
                Some(action) => {
                    // lookups build `MODS+KEY` with sorted modifier names
                    let trigger = canonical_combination(from).unwrap_or_else(|| from.clone());
                    split.combo.insert(trigger, action);
                }
                None => tracing::warn!("Ignoring remap {} -> {:?}: unknown key name", from, value),
            }
        }

        split
    }
}

/// Synthetic keys currently held, by the physical key that pressed them
#[derive(Debug, Default)]
pub struct VirtualKeyState {
    held: HashMap<Key, Key>,
}

impl VirtualKeyState {
    pub fn press(&mut self, physical: Key, emitted: Key) {
        self.held.insert(physical, emitted);
    }

    pub fn release(&mut self, physical: Key) -> Option<Key> {
        self.held.remove(&physical)
    }

    pub fn get(&self, physical: Key) -> Option<Key> {
        self.held.get(&physical).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// A physical key that is down, and the device holding it
#[derive(Debug)]
struct HeldKey {
    source: String,
    /// Name after the simple subtable, as tracked for modifiers
    effective: String,
}

/// Output of a chord rule while its trigger key is down
#[derive(Debug)]
struct ActiveChord {
    output: Key,
    /// Modifiers released to produce the output
    released: Vec<Key>,
}

/// Watches for two keys pressed one after the other
#[derive(Debug)]
pub struct EmergencyWatch {
    first: Key,
    second: Key,
    previous: Option<(Key, i32)>,
}

impl EmergencyWatch {
    pub fn new(first: Key, second: Key) -> Self {
        Self {
            first,
            second,
            previous: None,
        }
    }

    /// Parse the configured keybind, falling back to the default with a warning.
    pub fn from_keybind(keybind: &str) -> Self {
        match parse_emergency_keybind(keybind) {
            Ok((first, second)) => {
                tracing::info!("Emergency ungrab keybind: {}", keybind.to_uppercase());
                Self::new(first, second)
            }
            Err(reason) => {
                tracing::warn!("Invalid emergency ungrab keybinds: {} ({})", keybind, reason);
                tracing::warn!("Please set two keys separated by '+'");
                tracing::info!("Emergency ungrab keybind: {}", DEFAULT_EMERGENCY_UNGRAB_KEYS);
                Self::new(Key::KEY_RIGHTCTRL, Key::KEY_LEFTCTRL)
            }
        }
    }

    pub fn keys(&self) -> (Key, Key) {
        (self.first, self.second)
    }

    /// True when `key` completes the sequence.
    pub fn observe(&mut self, key: Key, value: i32) -> bool {
        let triggered = matches!(self.previous, Some((prev, v)) if prev == self.first && v != event_value::RELEASE)
            && key == self.second
            && value != event_value::RELEASE;
        self.previous = Some((key, value));
        triggered
    }
}

/// Exactly two `+`-joined key names.
pub fn parse_emergency_keybind(keybind: &str) -> Result<(Key, Key), String> {
    let parts: Vec<&str> = keybind.split('+').map(str::trim).collect();
    let [first, second] = parts.as_slice() else {
        return Err(format!("expected 2 keys, got {}", parts.len()));
    };
    let first = key_to_code(first).ok_or_else(|| format!("unknown key '{first}'"))?;
    let second = key_to_code(second).ok_or_else(|| format!("unknown key '{second}'"))?;
    Ok((first, second))
}

/// Physical source of an event
#[derive(Debug, Clone, Copy)]
pub struct SourceDevice<'a> {
    /// Stable identity, the device node path
    pub id: &'a str,
    /// `device` context value this device matched, if any
    pub tag: Option<&'a str>,
}

/// Result of processing one event
#[derive(Debug, Default)]
pub struct Outcome {
    /// Events for the synthetic keyboard, in order
    pub events: Vec<InputEvent>,
    /// Raw key frame for the host; absent for repeats and non-key events
    pub forward: Option<KeyFrame>,
    /// The emergency ungrab sequence was completed
    pub emergency: bool,
}

fn key_event(key: Key, value: i32) -> InputEvent {
    InputEvent::new(EventType::KEY, key.code(), value)
}

pub struct RemapEngine {
    layer: Layer,
    pending_swap: bool,
    tables: HashMap<String, Arc<SplitTable>>,
    modifiers: ModifierState,
    virtual_keys: VirtualKeyState,
    chords: HashMap<Key, ActiveChord>,
    suppressed: HashSet<Key>,
    held: HashMap<Key, HeldKey>,
    emergency: EmergencyWatch,
}

impl RemapEngine {
    pub fn new(emergency: EmergencyWatch) -> Self {
        Self {
            layer: Layer::new(),
            pending_swap: false,
            tables: HashMap::new(),
            modifiers: ModifierState::new(),
            virtual_keys: VirtualKeyState::default(),
            chords: HashMap::new(),
            suppressed: HashSet::new(),
            held: HashMap::new(),
            emergency,
        }
    }

    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    /// Adopt a new layer. Tables swap once no synthetic key is held.
    pub fn set_layer(&mut self, layer: Layer) {
        self.layer = layer;
        self.pending_swap = true;
    }

    /// Re-resolve tables at the next safe point, e.g. after hot-plug.
    pub fn invalidate(&mut self) {
        self.pending_swap = true;
    }

    /// Whether a table swap is waiting for keys to be released.
    pub fn swap_pending(&self) -> bool {
        self.pending_swap
    }

    fn apply_pending_swap(&mut self) {
        if self.pending_swap
            && self.virtual_keys.is_empty()
            && self.chords.is_empty()
            && self.suppressed.is_empty()
        {
            self.tables.clear();
            self.pending_swap = false;
        }
    }

    /// Release everything still held from a device that went away.
    ///
    /// Returns the events that lift its synthetic keys. Its modifiers stop
    /// counting towards chords, and a pending table swap can apply again.
    pub fn release_device(&mut self, id: &str) -> Vec<InputEvent> {
        self.tables.remove(id);

        let mut gone: Vec<Key> = self
            .held
            .iter()
            .filter(|(_, held)| held.source == id)
            .map(|(key, _)| *key)
            .collect();
        if gone.is_empty() {
            return Vec::new();
        }
        gone.sort_by_key(|key| key.code());
        for key in &gone {
            self.held.remove(key);
        }

        self.modifiers.clear();
        for held in self.held.values() {
            self.modifiers.update(&held.effective, event_value::PRESS);
        }

        tracing::debug!("Releasing {} key(s) held on {}", gone.len(), id);
        gone.into_iter().flat_map(|key| self.release(key)).collect()
    }

    fn layer_for(&self, device: &SourceDevice) -> Layer {
        match device.tag {
            Some(tag) => self.layer.with("device", tag),
            None => self.layer.clone(),
        }
    }

    fn table_for(&mut self, layers: &mut LayerManager, device: &SourceDevice) -> Arc<SplitTable> {
        if let Some(table) = self.tables.get(device.id) {
            return Arc::clone(table);
        }
        let layer = self.layer_for(device);
        let merged = layers.find_merged_mapping(&layer);
        let split = Arc::new(SplitTable::from_table(&merged));
        tracing::debug!(
            "Resolved {} simple and {} combo remaps for {} in {}",
            split.simple.len(),
            split.combo.len(),
            device.id,
            layer
        );
        self.tables.insert(device.id.to_string(), Arc::clone(&split));
        split
    }

    pub fn process(
        &mut self,
        layers: &mut LayerManager,
        device: &SourceDevice,
        event: InputEvent,
    ) -> Outcome {
        // Axis codes overlap key codes; never look them up
        if event.event_type() != EventType::KEY {
            return Outcome {
                events: vec![event],
                ..Default::default()
            };
        }

        let raw = Key::new(event.code());
        let value = event.value();
        let mut outcome = Outcome::default();

        if self.emergency.observe(raw, value) {
            outcome.emergency = true;
            return outcome;
        }

        let Some(raw_name) = code_to_key(raw.code()) else {
            outcome.events.push(event);
            return outcome;
        };

        self.apply_pending_swap();
        let table = self.table_for(layers, device);

        let effective = table.simple.get(&raw).copied().unwrap_or(raw);
        let effective_name = if effective == raw {
            raw_name.clone()
        } else {
            code_to_key(effective.code()).unwrap_or_else(|| raw_name.clone())
        };
        self.modifiers.update(&effective_name, value);
        match value {
            event_value::PRESS => {
                self.held.insert(
                    raw,
                    HeldKey {
                        source: device.id.to_string(),
                        effective: effective_name.clone(),
                    },
                );
            }
            event_value::RELEASE => {
                self.held.remove(&raw);
            }
            _ => {}
        }

        if value != event_value::REPEAT {
            outcome.forward = Some(KeyFrame {
                key: raw_name,
                status: u8::from(value == event_value::PRESS),
                layer: self.layer_for(device),
            });
        }

        outcome.events = match value {
            event_value::RELEASE => self.release(raw),
            event_value::REPEAT => self.repeat(raw, effective),
            _ => self.press(&table, raw, effective, &effective_name),
        };
        outcome
    }

    fn held_modifier_keys(&self) -> Vec<Key> {
        self.modifiers.pressed().filter_map(key_to_code).collect()
    }

    fn press(&mut self, table: &SplitTable, raw: Key, effective: Key, effective_name: &str) -> Vec<InputEvent> {
        let combination = self.modifiers.current_combination(effective_name);
        let chord = if combination != effective_name {
            table.combo.get(&combination)
        } else {
            None
        };
        let via_chord = chord.is_some();
        let action = chord.or_else(|| table.combo.get(effective_name));
        let is_modifier = ModifierState::is_modifier(effective_name);

        match action {
            Some(Action::Burst(combos)) => {
                self.suppressed.insert(raw);
                self.burst(combos)
            }
            Some(Action::Command(command)) => {
                tracing::debug!("{} is bound to command '{}', suppressing output", effective_name, command);
                self.suppressed.insert(raw);
                Vec::new()
            }
            Some(Action::Key(output)) if via_chord && !is_modifier => {
                let released = self.held_modifier_keys();
                let mut events: Vec<InputEvent> = released
                    .iter()
                    .map(|m| key_event(*m, event_value::RELEASE))
                    .collect();
                events.push(key_event(*output, event_value::PRESS));
                self.chords.insert(
                    raw,
                    ActiveChord {
                        output: *output,
                        released,
                    },
                );
                events
            }
            Some(Action::Key(output)) => {
                self.virtual_keys.press(raw, *output);
                vec![key_event(*output, event_value::PRESS)]
            }
            None => {
                self.virtual_keys.press(raw, effective);
                vec![key_event(effective, event_value::PRESS)]
            }
        }
    }

    fn repeat(&self, raw: Key, effective: Key) -> Vec<InputEvent> {
        if self.suppressed.contains(&raw) {
            return Vec::new();
        }
        let key = match self.chords.get(&raw) {
            Some(chord) => chord.output,
            None => self.virtual_keys.get(raw).unwrap_or(effective),
        };
        vec![key_event(key, event_value::REPEAT)]
    }

    fn release(&mut self, raw: Key) -> Vec<InputEvent> {
        if let Some(chord) = self.chords.remove(&raw) {
            let still_held = self.held_modifier_keys();
            let mut events = vec![key_event(chord.output, event_value::RELEASE)];
            events.extend(
                chord
                    .released
                    .iter()
                    .filter(|m| still_held.contains(m))
                    .map(|m| key_event(*m, event_value::PRESS)),
            );
            return events;
        }

        if self.suppressed.remove(&raw) {
            return Vec::new();
        }

        // A key pressed before tracking began is released under its own code
        let key = self.virtual_keys.release(raw).unwrap_or(raw);
        vec![key_event(key, event_value::RELEASE)]
    }

    /// Release held modifiers, tap each combination, then restore the modifiers.
    fn burst(&self, combos: &[Vec<Key>]) -> Vec<InputEvent> {
        let held = self.held_modifier_keys();
        let mut events: Vec<InputEvent> = held
            .iter()
            .map(|m| key_event(*m, event_value::RELEASE))
            .collect();

        for combo in combos {
            events.extend(combo.iter().map(|k| key_event(*k, event_value::PRESS)));
            events.extend(combo.iter().rev().map(|k| key_event(*k, event_value::RELEASE)));
        }

        events.extend(held.iter().map(|m| key_event(*m, event_value::PRESS)));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thumbmap_config::parse_config_str;

    const DEVICE: SourceDevice<'static> = SourceDevice {
        id: "/dev/input/event3",
        tag: None,
    };

    fn setup(config: &str) -> (RemapEngine, LayerManager) {
        let config = parse_config_str(config).unwrap();
        let layers = LayerManager::detached(Arc::new(config));
        let engine = RemapEngine::new(EmergencyWatch::new(Key::KEY_RIGHTCTRL, Key::KEY_LEFTCTRL));
        (engine, layers)
    }

    fn key(engine: &mut RemapEngine, layers: &mut LayerManager, key: Key, value: i32) -> Outcome {
        engine.process(layers, &DEVICE, key_event(key, value))
    }

    fn codes(outcome: &Outcome) -> Vec<(Key, i32)> {
        outcome
            .events
            .iter()
            .map(|e| (Key::new(e.code()), e.value()))
            .collect()
    }

    #[test]
    fn test_split_table_is_exclusive() {
        let config = parse_config_str(
            r#"
            remap {
                A "B"
                "LEFTCTRL+B" "C"
                C "LEFTCTRL+V"
                D "LEFTCTRL+A" "LEFTCTRL+C"
                E {
                    command "notify-send hi"
                }
                F "LEFTSHIFT"
            }
            "#,
        )
        .unwrap();
        let table = config.search_remap_table(&Layer::new()).unwrap();
        let split = SplitTable::from_table(table);

        assert_eq!(split.simple.len(), 2);
        assert_eq!(split.simple.get(&Key::KEY_A), Some(&Key::KEY_B));
        assert_eq!(split.simple.get(&Key::KEY_F), Some(&Key::KEY_LEFTSHIFT));
        for name in ["LEFTCTRL+B", "C", "D", "E"] {
            assert!(split.combo.contains_key(name), "{name} should be a combo entry");
        }
        assert!(!split.combo.contains_key("A"));
        assert!(!split.simple.contains_key(&Key::KEY_C));
        assert!(!split.simple.contains_key(&Key::KEY_D));
    }

    #[test]
    fn test_unmapped_key_passes_through() {
        let (mut engine, mut layers) = setup("");

        let press = key(&mut engine, &mut layers, Key::KEY_J, 1);
        assert_eq!(codes(&press), vec![(Key::KEY_J, 1)]);
        let forward = press.forward.unwrap();
        assert_eq!(forward.key, "J");
        assert_eq!(forward.status, 1);

        let repeat = key(&mut engine, &mut layers, Key::KEY_J, 2);
        assert_eq!(codes(&repeat), vec![(Key::KEY_J, 2)]);
        assert!(repeat.forward.is_none(), "repeats are not forwarded");

        let release = key(&mut engine, &mut layers, Key::KEY_J, 0);
        assert_eq!(codes(&release), vec![(Key::KEY_J, 0)]);
        assert_eq!(release.forward.unwrap().status, 0);
    }

    #[test]
    fn test_non_key_events_skip_lookup() {
        // REL_X shares code 0 with KEY_RESERVED, REL_WHEEL 8 with KEY_7
        let (mut engine, mut layers) = setup(
            r#"
            remap {
                "7" "A"
            }
            "#,
        );
        let wheel = InputEvent::new(EventType::RELATIVE, 8, -1);
        let outcome = engine.process(&mut layers, &DEVICE, wheel);
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].event_type(), EventType::RELATIVE);
        assert_eq!(outcome.events[0].code(), 8);
        assert_eq!(outcome.events[0].value(), -1);
        assert!(outcome.forward.is_none());
    }

    #[test]
    fn test_swapped_keys_translate_once() {
        let (mut engine, mut layers) = setup(
            r#"
            remap {
                LEFTALT "LEFTMETA"
                LEFTMETA "LEFTALT"
            }
            "#,
        );

        let alt = key(&mut engine, &mut layers, Key::KEY_LEFTALT, 1);
        assert_eq!(codes(&alt), vec![(Key::KEY_LEFTMETA, 1)]);
        let meta = key(&mut engine, &mut layers, Key::KEY_LEFTMETA, 1);
        assert_eq!(codes(&meta), vec![(Key::KEY_LEFTALT, 1)]);
    }

    #[test]
    fn test_simple_remap_feeds_chords() {
        let (mut engine, mut layers) = setup(
            r#"
            remap {
                CAPSLOCK "LEFTCTRL"
                "LEFTCTRL+H" "BACKSPACE"
            }
            "#,
        );

        let caps = key(&mut engine, &mut layers, Key::KEY_CAPSLOCK, 1);
        assert_eq!(codes(&caps), vec![(Key::KEY_LEFTCTRL, 1)]);
        assert_eq!(caps.forward.unwrap().key, "CAPSLOCK", "raw key is forwarded");

        let h = key(&mut engine, &mut layers, Key::KEY_H, 1);
        assert_eq!(
            codes(&h),
            vec![(Key::KEY_LEFTCTRL, 0), (Key::KEY_BACKSPACE, 1)]
        );

        let repeat = key(&mut engine, &mut layers, Key::KEY_H, 2);
        assert_eq!(codes(&repeat), vec![(Key::KEY_BACKSPACE, 2)]);

        let h_up = key(&mut engine, &mut layers, Key::KEY_H, 0);
        assert_eq!(
            codes(&h_up),
            vec![(Key::KEY_BACKSPACE, 0), (Key::KEY_LEFTCTRL, 1)]
        );

        let caps_up = key(&mut engine, &mut layers, Key::KEY_CAPSLOCK, 0);
        assert_eq!(codes(&caps_up), vec![(Key::KEY_LEFTCTRL, 0)]);
    }

    #[test]
    fn test_chord_matches_regardless_of_written_order() {
        let (mut engine, mut layers) = setup(
            r#"
            remap {
                "LEFTSHIFT+LEFTCTRL+A" "HOME"
            }
            "#,
        );

        key(&mut engine, &mut layers, Key::KEY_LEFTCTRL, 1);
        key(&mut engine, &mut layers, Key::KEY_LEFTSHIFT, 1);
        let a = key(&mut engine, &mut layers, Key::KEY_A, 1);
        assert_eq!(
            codes(&a),
            vec![
                (Key::KEY_LEFTCTRL, 0),
                (Key::KEY_LEFTSHIFT, 0),
                (Key::KEY_HOME, 1)
            ]
        );
    }

    #[test]
    fn test_aliased_triggers_fire() {
        let (mut engine, mut layers) = setup(
            r#"
            remap {
                "CTRL+H" "BACKSPACE"
                CAPS "LEFTCTRL+V"
            }
            "#,
        );

        key(&mut engine, &mut layers, Key::KEY_LEFTCTRL, 1);
        let h = key(&mut engine, &mut layers, Key::KEY_H, 1);
        assert_eq!(
            codes(&h),
            vec![(Key::KEY_LEFTCTRL, 0), (Key::KEY_BACKSPACE, 1)]
        );
        key(&mut engine, &mut layers, Key::KEY_H, 0);
        key(&mut engine, &mut layers, Key::KEY_LEFTCTRL, 0);

        let caps = key(&mut engine, &mut layers, Key::KEY_CAPSLOCK, 1);
        assert_eq!(
            codes(&caps),
            vec![
                (Key::KEY_LEFTCTRL, 1),
                (Key::KEY_V, 1),
                (Key::KEY_V, 0),
                (Key::KEY_LEFTCTRL, 0)
            ]
        );
    }

    #[test]
    fn test_removed_device_releases_its_keys() {
        let (mut engine, mut layers) = setup(
            r#"
            remap {
                J "BTN_LEFT"
                "LEFTCTRL+X" "DELETE"
            }
            "#,
        );
        let other = SourceDevice {
            id: "/dev/input/event9",
            tag: None,
        };

        key(&mut engine, &mut layers, Key::KEY_LEFTCTRL, 1);
        key(&mut engine, &mut layers, Key::KEY_J, 1);
        engine.process(&mut layers, &other, key_event(Key::KEY_A, 1));
        engine.set_layer(Layer::from_pairs([("thumbsense", true)]));

        let released = engine.release_device(DEVICE.id);
        let mut released: Vec<(Key, i32)> = released
            .iter()
            .map(|e| (Key::new(e.code()), e.value()))
            .collect();
        released.sort_by_key(|(k, _)| k.code());
        assert_eq!(released, vec![(Key::KEY_LEFTCTRL, 0), (Key::BTN_LEFT, 0)]);
        assert!(engine.release_device(DEVICE.id).is_empty());

        // no phantom ctrl on the remaining keyboard
        let x = engine.process(&mut layers, &other, key_event(Key::KEY_X, 1));
        assert_eq!(codes(&x), vec![(Key::KEY_X, 1)]);

        // the swap waits only for keys that are really held
        engine.process(&mut layers, &other, key_event(Key::KEY_X, 0));
        engine.process(&mut layers, &other, key_event(Key::KEY_A, 0));
        engine.process(&mut layers, &other, key_event(Key::KEY_B, 1));
        assert!(!engine.swap_pending());
    }

    #[test]
    fn test_chord_release_after_modifier_release() {
        let (mut engine, mut layers) = setup(
            r#"
            remap {
                "LEFTCTRL+H" "BACKSPACE"
            }
            "#,
        );

        key(&mut engine, &mut layers, Key::KEY_LEFTCTRL, 1);
        key(&mut engine, &mut layers, Key::KEY_H, 1);
        key(&mut engine, &mut layers, Key::KEY_LEFTCTRL, 0);

        // ctrl is no longer held, so it is not restored
        let h_up = key(&mut engine, &mut layers, Key::KEY_H, 0);
        assert_eq!(codes(&h_up), vec![(Key::KEY_BACKSPACE, 0)]);
    }

    #[test]
    fn test_modifier_to_modifier_is_not_a_chord() {
        let (mut engine, mut layers) = setup(
            r#"
            remap {
                "LEFTCTRL+LEFTSHIFT" "A"
            }
            "#,
        );

        key(&mut engine, &mut layers, Key::KEY_LEFTCTRL, 1);
        let shift = key(&mut engine, &mut layers, Key::KEY_LEFTSHIFT, 1);
        assert_eq!(codes(&shift), vec![(Key::KEY_LEFTSHIFT, 1)]);
    }

    #[test]
    fn test_sequence_restores_modifiers() {
        let (mut engine, mut layers) = setup(
            r#"
            remap {
                K "LEFTCTRL+A" "LEFTCTRL+C"
            }
            "#,
        );

        key(&mut engine, &mut layers, Key::KEY_LEFTSHIFT, 1);
        let k = key(&mut engine, &mut layers, Key::KEY_K, 1);
        assert_eq!(
            codes(&k),
            vec![
                (Key::KEY_LEFTSHIFT, 0),
                (Key::KEY_LEFTCTRL, 1),
                (Key::KEY_A, 1),
                (Key::KEY_A, 0),
                (Key::KEY_LEFTCTRL, 0),
                (Key::KEY_LEFTCTRL, 1),
                (Key::KEY_C, 1),
                (Key::KEY_C, 0),
                (Key::KEY_LEFTCTRL, 0),
                (Key::KEY_LEFTSHIFT, 1),
            ]
        );

        assert!(codes(&key(&mut engine, &mut layers, Key::KEY_K, 2)).is_empty());
        let k_up = key(&mut engine, &mut layers, Key::KEY_K, 0);
        assert!(codes(&k_up).is_empty());
        assert!(k_up.forward.is_some());
    }

    #[test]
    fn test_command_is_suppressed_but_forwarded() {
        let (mut engine, mut layers) = setup(
            r#"
            remap {
                X {
                    command "notify-send hi"
                }
            }
            "#,
        );

        let press = key(&mut engine, &mut layers, Key::KEY_X, 1);
        assert!(press.events.is_empty());
        assert_eq!(press.forward.unwrap().key, "X");

        let release = key(&mut engine, &mut layers, Key::KEY_X, 0);
        assert!(release.events.is_empty());
    }

    #[test]
    fn test_release_uses_code_from_press_time() {
        let (mut engine, mut layers) = setup(
            r#"
            context thumbsense=true {
                remap {
                    J "BTN_LEFT"
                }
            }
            "#,
        );
        let thumbsense = Layer::from_pairs([("thumbsense", true)]);

        // Remapped press, layer removed while held: release stays remapped
        engine.set_layer(thumbsense.clone());
        let press = key(&mut engine, &mut layers, Key::KEY_J, 1);
        assert_eq!(codes(&press), vec![(Key::BTN_LEFT, 1)]);
        engine.set_layer(Layer::new());
        let release = key(&mut engine, &mut layers, Key::KEY_J, 0);
        assert_eq!(codes(&release), vec![(Key::BTN_LEFT, 0)]);

        // Original press, layer added while held: release stays original
        let press = key(&mut engine, &mut layers, Key::KEY_J, 1);
        assert_eq!(codes(&press), vec![(Key::KEY_J, 1)]);
        engine.set_layer(thumbsense);
        let release = key(&mut engine, &mut layers, Key::KEY_J, 0);
        assert_eq!(codes(&release), vec![(Key::KEY_J, 0)]);

        // Swap applies once nothing is held
        let press = key(&mut engine, &mut layers, Key::KEY_J, 1);
        assert_eq!(codes(&press), vec![(Key::BTN_LEFT, 1)]);
    }

    #[test]
    fn test_swap_waits_for_held_keys() {
        let (mut engine, mut layers) = setup(
            r#"
            context thumbsense=true {
                remap {
                    J "BTN_LEFT"
                }
            }
            "#,
        );

        key(&mut engine, &mut layers, Key::KEY_A, 1);
        engine.set_layer(Layer::from_pairs([("thumbsense", true)]));

        // A is still held, so the old table stays active
        let j = key(&mut engine, &mut layers, Key::KEY_J, 1);
        assert_eq!(codes(&j), vec![(Key::KEY_J, 1)]);
        assert!(engine.swap_pending());

        key(&mut engine, &mut layers, Key::KEY_A, 0);
        key(&mut engine, &mut layers, Key::KEY_J, 0);
        let j = key(&mut engine, &mut layers, Key::KEY_J, 1);
        assert_eq!(codes(&j), vec![(Key::BTN_LEFT, 1)]);
        assert!(!engine.swap_pending());
    }

    #[test]
    fn test_device_tag_selects_tables_and_is_forwarded() {
        let (mut engine, mut layers) = setup(
            r#"
            context device="HHKB" {
                remap {
                    A "B"
                }
            }
            "#,
        );
        let hhkb = SourceDevice {
            id: "/dev/input/event7",
            tag: Some("HHKB"),
        };

        let outcome = engine.process(&mut layers, &hhkb, key_event(Key::KEY_A, 1));
        assert_eq!(codes(&outcome), vec![(Key::KEY_B, 1)]);
        assert_eq!(
            outcome.forward.unwrap().layer,
            Layer::from_pairs([("device", "HHKB")])
        );

        let other = key(&mut engine, &mut layers, Key::KEY_A, 1);
        assert_eq!(codes(&other), vec![(Key::KEY_A, 1)]);
    }

    #[test]
    fn test_emergency_sequence() {
        let (mut engine, mut layers) = setup("");

        let first = key(&mut engine, &mut layers, Key::KEY_RIGHTCTRL, 1);
        assert!(!first.emergency);
        let second = key(&mut engine, &mut layers, Key::KEY_LEFTCTRL, 1);
        assert!(second.emergency);
        assert!(second.events.is_empty());
    }

    #[test]
    fn test_emergency_needs_order() {
        let mut watch = EmergencyWatch::new(Key::KEY_RIGHTCTRL, Key::KEY_LEFTCTRL);
        assert!(!watch.observe(Key::KEY_LEFTCTRL, 1));
        assert!(!watch.observe(Key::KEY_RIGHTCTRL, 1));
        assert!(!watch.observe(Key::KEY_RIGHTCTRL, 0));
        assert!(!watch.observe(Key::KEY_LEFTCTRL, 1));
    }

    #[test]
    fn test_emergency_keybind_fallback() {
        assert!(parse_emergency_keybind("LEFTCTRL").is_err());
        assert!(parse_emergency_keybind("LEFTCTRL+LEFTALT+ESC").is_err());
        assert!(parse_emergency_keybind("LEFTCTRL+NOPE").is_err());
        assert_eq!(
            parse_emergency_keybind("leftalt+esc"),
            Ok((Key::KEY_LEFTALT, Key::KEY_ESC))
        );

        let watch = EmergencyWatch::from_keybind("LEFTCTRL");
        assert_eq!(watch.keys(), (Key::KEY_RIGHTCTRL, Key::KEY_LEFTCTRL));
    }
}
