//! Key name catalogue
//!
//! Key names are evdev names without the `KEY_` prefix (`A`, `LEFTCTRL`,
//! `F13`) and full `BTN_*` names for buttons (`BTN_LEFT`). Lookups are
//! case-insensitive; an explicit `KEY_` prefix is accepted as well.

use std::str::FromStr;

use evdev::Key;

/// Modifier key names. Chord triggers list them first, sorted by name.
pub const MODIFIER_KEYS: [&str; 8] = [
    "LEFTCTRL",
    "RIGHTCTRL",
    "LEFTALT",
    "RIGHTALT",
    "LEFTSHIFT",
    "RIGHTSHIFT",
    "LEFTMETA",
    "RIGHTMETA",
];

/// Friendlier spellings accepted in configuration files.
const ALIASES: &[(&str, &str)] = &[
    ("ESCAPE", "ESC"),
    ("CAPS", "CAPSLOCK"),
    ("RETURN", "ENTER"),
    ("CTRL", "LEFTCTRL"),
    ("SHIFT", "LEFTSHIFT"),
    ("ALT", "LEFTALT"),
    ("SUPER", "LEFTMETA"),
    ("META", "LEFTMETA"),
    ("PGUP", "PAGEUP"),
    ("PGDN", "PAGEDOWN"),
    ("DEL", "DELETE"),
];

/// Resolve a key name to its evdev key code.
pub fn key_to_code(name: &str) -> Option<Key> {
    let upper = name.trim().to_uppercase();
    if upper.is_empty() {
        return None;
    }

    if upper.starts_with("BTN_") || upper.starts_with("KEY_") {
        return Key::from_str(&upper).ok();
    }

    let canonical = ALIASES
        .iter()
        .find(|(alias, _)| *alias == upper)
        .map(|(_, target)| *target)
        .unwrap_or(upper.as_str());

    Key::from_str(&format!("KEY_{canonical}")).ok()
}

/// Canonical name of an evdev key code, or `None` if the code has no name.
pub fn code_to_key(code: u16) -> Option<String> {
    let key = Key::new(code);
    let debug = format!("{key:?}");

    let name = if let Some(stripped) = debug.strip_prefix("KEY_") {
        stripped.to_string()
    } else if debug.starts_with("BTN_") {
        debug
    } else {
        return None;
    };

    // Aliased codes must still resolve back to the same key.
    (key_to_code(&name) == Some(key)).then_some(name)
}

/// Whether every `+`-joined part of a combination resolves to a key.
pub fn is_valid_combination(combination: &str) -> bool {
    combination_keys(combination).is_some()
}

/// Split a combination string such as `LEFTCTRL+C` into key codes.
pub fn combination_keys(combination: &str) -> Option<Vec<Key>> {
    combination
        .split('+')
        .map(|part| key_to_code(part))
        .collect::<Option<Vec<_>>>()
        .filter(|keys| !keys.is_empty())
}

pub fn is_modifier_key(name: &str) -> bool {
    MODIFIER_KEYS.contains(&name)
}

/// Canonical spelling of a remap trigger such as `shift+ctrl+h`.
///
/// Aliases resolve to their key names and modifiers come first in sorted
/// order, so `SHIFT+CTRL+H` and `LEFTCTRL+LEFTSHIFT+H` name the same chord.
/// Non-modifier keys keep their written order at the end.
pub fn canonical_combination(combination: &str) -> Option<String> {
    let names = combination
        .split('+')
        .map(|part| {
            let key = key_to_code(part)?;
            Some(code_to_key(key.code()).unwrap_or_else(|| part.trim().to_uppercase()))
        })
        .collect::<Option<Vec<_>>>()
        .filter(|names| !names.is_empty())?;

    let (mut modifiers, keys): (Vec<String>, Vec<String>) =
        names.into_iter().partition(|name| is_modifier_key(name));
    modifiers.sort();
    modifiers.dedup();
    modifiers.extend(keys);
    Some(modifiers.join("+"))
}
