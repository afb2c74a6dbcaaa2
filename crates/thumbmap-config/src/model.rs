//! Configuration data model

use std::collections::HashMap;

use crate::context::Layer;
use crate::error::InvalidKeyInfo;

/// Remap table: upper-cased input key (or `MODS+KEY` chord) to output
pub type RemapTable = HashMap<String, RemapValue>;

/// Output of a single remap entry, classified once when the table loads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemapValue {
    /// Plain key, e.g. `CAPSLOCK "LEFTCTRL"`
    Key(String),
    /// Single `+`-joined combination, e.g. `J "LEFTCTRL+C"`
    Combination(String),
    /// Several combinations sent in order
    Sequence(Vec<String>),
    /// Dispatched by the host process; produces no synthetic output
    Command(String),
}

impl RemapValue {
    /// Whether this entry may take part in plain key-to-key translation.
    pub fn is_simple(&self) -> bool {
        matches!(self, RemapValue::Key(_))
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub global: GlobalConfig,
    pub keyboard: KeyboardConfig,
    pub touchpad: TouchpadConfig,
    /// Remap sections in declaration order; the empty context is the top-level `remap`
    pub sections: Vec<RemapSection>,
    /// Key names that failed to resolve; the daemon warns, `validate` fails
    pub invalid_keys: Vec<InvalidKeyInfo>,
}

impl Config {
    /// Remap table declared for exactly `context`, ignoring key order.
    pub fn search_remap_table(&self, context: &Layer) -> Option<&RemapTable> {
        self.sections
            .iter()
            .find(|section| section.context.same_context(context))
            .map(|section| &section.table)
    }

    /// Distinct `device` context values in declaration order.
    pub fn device_patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = Vec::new();
        for section in &self.sections {
            if let Some(pattern) = section.context.get("device").and_then(|v| v.as_str()) {
                if !patterns.iter().any(|p| p == pattern) {
                    patterns.push(pattern.to_string());
                }
            }
        }
        patterns
    }

    /// All declared contexts, for listing.
    pub fn contexts(&self) -> impl Iterator<Item = &Layer> {
        self.sections.iter().map(|section| &section.context)
    }
}

/// A remap table bound to the context that activates it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemapSection {
    pub context: Layer,
    pub table: RemapTable,
}

/// Global settings
#[derive(Debug, Clone, Default)]
pub struct GlobalConfig {
    pub log_level: LogLevel,
    /// Toggle the `thumbsense` flag from touchpad contact
    pub thumbsense_bridge: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive usable with `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

pub const DEFAULT_EMERGENCY_UNGRAB_KEYS: &str = "RIGHTCTRL+LEFTCTRL";

/// Keyboard remapper settings
#[derive(Debug, Clone)]
pub struct KeyboardConfig {
    /// Case-insensitive regexes matched against device names
    pub name_patterns: Vec<String>,
    /// Two `+`-joined keys pressed in order to release all grabs
    pub emergency_ungrab_keys: String,
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self {
            name_patterns: vec!["keyboard".to_string()],
            emergency_ungrab_keys: DEFAULT_EMERGENCY_UNGRAB_KEYS.to_string(),
        }
    }
}

/// Touchpad remapper settings
#[derive(Debug, Clone, Default)]
pub struct TouchpadConfig {
    /// Empty means every available touchpad
    pub name_patterns: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LayerValue;

    fn section(context: Layer, entries: &[(&str, &str)]) -> RemapSection {
        RemapSection {
            context,
            table: entries
                .iter()
                .map(|(k, v)| (k.to_string(), RemapValue::Key(v.to_string())))
                .collect(),
        }
    }

    #[test]
    fn test_search_remap_table_ignores_key_order() {
        let config = Config {
            sections: vec![
                section(Layer::new(), &[("A", "B")]),
                section(
                    Layer::from_pairs([
                        ("device", LayerValue::from("HHKB")),
                        ("thumbsense", LayerValue::from(true)),
                    ]),
                    &[("J", "BTN_LEFT")],
                ),
            ],
            ..Default::default()
        };

        let query = Layer::from_pairs([
            ("thumbsense", LayerValue::from(true)),
            ("device", LayerValue::from("HHKB")),
        ]);
        let table = config.search_remap_table(&query).unwrap();
        assert_eq!(table.get("J"), Some(&RemapValue::Key("BTN_LEFT".to_string())));

        let default = config.search_remap_table(&Layer::new()).unwrap();
        assert!(default.contains_key("A"));

        assert!(config
            .search_remap_table(&Layer::from_pairs([("thumbsense", true)]))
            .is_none());
    }

    #[test]
    fn test_device_patterns_are_distinct() {
        let config = Config {
            sections: vec![
                section(Layer::from_pairs([("device", "HHKB")]), &[]),
                section(
                    Layer::from_pairs([
                        ("device", LayerValue::from("HHKB")),
                        ("thumbsense", LayerValue::from(true)),
                    ]),
                    &[],
                ),
                section(Layer::from_pairs([("device", "Apple")]), &[]),
                section(Layer::from_pairs([("thumbsense", true)]), &[]),
            ],
            ..Default::default()
        };

        assert_eq!(config.device_patterns(), vec!["HHKB", "Apple"]);
    }
}
