//! KDL configuration parser

use std::path::Path;

use crate::context::{Layer, LayerValue};
use crate::error::{ConfigError, InvalidKeyInfo, KeyPosition, SourceLocation};
use crate::keys::{canonical_combination, is_valid_combination, key_to_code};
use crate::model::*;

fn location(offset: usize, len: usize, source: &str) -> SourceLocation {
    let (line, column) = offset_to_line_col(source, offset);
    SourceLocation::new(line, column, offset, len)
}

fn node_location(node: &kdl::KdlNode, source: &str) -> SourceLocation {
    let span = node.name().span();
    location(span.offset(), span.len(), source)
}

fn entry_location(entry: &kdl::KdlEntry, source: &str) -> SourceLocation {
    let span = entry.span();
    location(span.offset(), span.len(), source)
}

/// Convert byte offset to line and column (1-indexed)
fn offset_to_line_col(source: &str, offset: usize) -> (usize, usize) {
    let before = &source[..offset.min(source.len())];
    let line = before.matches('\n').count() + 1;
    let column = before.rsplit('\n').next().map_or(0, |l| l.chars().count()) + 1;
    (line, column)
}

/// Parse a configuration file from the given path
pub fn parse_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Parse configuration from a string
pub fn parse_config_str(content: &str) -> Result<Config, ConfigError> {
    let doc: kdl::KdlDocument = content.parse().map_err(|e: kdl::KdlError| {
        // kdl carries its own miette version; rebuild the span
        let span = miette::SourceSpan::from((e.span.offset(), e.span.len()));
        ConfigError::ParseError {
            src: content.to_string(),
            span,
            source: e,
        }
    })?;

    let mut config = Config::default();
    let mut parser = SectionParser {
        source: content,
        invalid_keys: Vec::new(),
    };

    for node in doc.nodes() {
        match node.name().value() {
            "global" => config.global = parse_global(node)?,
            "keyboard" => config.keyboard = parse_keyboard(node),
            "touchpad" => config.touchpad = parse_touchpad(node),
            "remap" => {
                let table = parser.parse_remap(node, "remap {}");
                add_section(&mut config, Layer::new(), table);
            }
            "context" => {
                let context = parse_context(node)?;
                if context.is_empty() {
                    return Err(ConfigError::Invalid {
                        message: "`context` needs at least one property, e.g. `context thumbsense=true { ... }`"
                            .to_string(),
                    });
                }
                let description = format!("context {context}");
                let mut table = RemapTable::new();
                for child in children(node) {
                    match child.name().value() {
                        "remap" => table.extend(parser.parse_remap(child, &description)),
                        name => tracing::warn!("Unknown option in {}: {}", description, name),
                    }
                }
                add_section(&mut config, context, table);
            }
            name => {
                tracing::warn!("Unknown top-level node: {}", name);
            }
        }
    }

    config.invalid_keys = parser.invalid_keys;
    Ok(config)
}

fn children(node: &kdl::KdlNode) -> &[kdl::KdlNode] {
    node.children().map(|doc| doc.nodes()).unwrap_or(&[])
}

fn string_args(node: &kdl::KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|entry| entry.name().is_none())
        .filter_map(|entry| entry.value().as_string())
        .map(str::to_string)
        .collect()
}

/// Sections repeating a context extend the earlier one.
fn add_section(config: &mut Config, context: Layer, table: RemapTable) {
    match config
        .sections
        .iter_mut()
        .find(|section| section.context.same_context(&context))
    {
        Some(section) => section.table.extend(table),
        None => config.sections.push(RemapSection { context, table }),
    }
}

fn parse_global(node: &kdl::KdlNode) -> Result<GlobalConfig, ConfigError> {
    let mut global = GlobalConfig::default();

    for child in children(node) {
        let first = child.entries().first().map(|entry| entry.value());
        match child.name().value() {
            "log-level" => {
                if let Some(val) = first.and_then(|v| v.as_string()) {
                    global.log_level = val
                        .parse()
                        .map_err(|message| ConfigError::Invalid { message })?;
                }
            }
            "thumbsense-bridge" => {
                global.thumbsense_bridge = match first {
                    None => true,
                    Some(value) => value.as_bool().ok_or_else(|| ConfigError::Invalid {
                        message: "thumbsense-bridge expects true or false".to_string(),
                    })?,
                };
            }
            name => {
                tracing::warn!("Unknown global config option: {}", name);
            }
        }
    }

    Ok(global)
}

fn parse_keyboard(node: &kdl::KdlNode) -> KeyboardConfig {
    let mut keyboard = KeyboardConfig::default();

    for child in children(node) {
        match child.name().value() {
            "name-patterns" => {
                let patterns = string_args(child);
                if !patterns.is_empty() {
                    keyboard.name_patterns = patterns;
                }
            }
            // Validated by the remapper, which falls back to the default with a warning
            "emergency-ungrab-keys" => {
                if let Some(keys) = string_args(child).into_iter().next() {
                    keyboard.emergency_ungrab_keys = keys;
                }
            }
            name => {
                tracing::warn!("Unknown keyboard config option: {}", name);
            }
        }
    }

    keyboard
}

fn parse_touchpad(node: &kdl::KdlNode) -> TouchpadConfig {
    let mut touchpad = TouchpadConfig::default();

    for child in children(node) {
        match child.name().value() {
            "name-patterns" => touchpad.name_patterns = string_args(child),
            name => {
                tracing::warn!("Unknown touchpad config option: {}", name);
            }
        }
    }

    touchpad
}

fn parse_context(node: &kdl::KdlNode) -> Result<Layer, ConfigError> {
    let mut context = Layer::new();

    for entry in node.entries() {
        let Some(key) = entry.name() else {
            return Err(ConfigError::Invalid {
                message: "`context` only takes key=value properties".to_string(),
            });
        };
        let value = entry.value();
        let value = if let Some(b) = value.as_bool() {
            LayerValue::Bool(b)
        } else if let Some(i) = value.as_i64() {
            LayerValue::Int(i)
        } else if let Some(s) = value.as_string() {
            LayerValue::Str(s.to_string())
        } else {
            return Err(ConfigError::Invalid {
                message: format!("Unsupported value for context property '{}'", key.value()),
            });
        };
        context.insert(key.value(), value);
    }

    Ok(context)
}

struct SectionParser<'a> {
    source: &'a str,
    invalid_keys: Vec<InvalidKeyInfo>,
}

impl SectionParser<'_> {
    fn parse_remap(&mut self, node: &kdl::KdlNode, context: &str) -> RemapTable {
        let mut table = RemapTable::new();

        for child in children(node) {
            let written = child.name().value();
            let from = match canonical_combination(written) {
                Some(canonical) => canonical,
                None => {
                    self.invalid_keys.push(InvalidKeyInfo {
                        key: written.to_string(),
                        position: KeyPosition::From,
                        context: context.to_string(),
                        location: node_location(child, self.source),
                    });
                    written.to_uppercase()
                }
            };

            let Some(value) = self.parse_value(child, context) else {
                tracing::warn!("Remap entry '{}' in {} has no target, ignoring", from, context);
                continue;
            };
            table.insert(from, value);
        }

        table
    }

    fn parse_value(&mut self, child: &kdl::KdlNode, context: &str) -> Option<RemapValue> {
        if let Some(command) = children(child)
            .iter()
            .find(|n| n.name().value() == "command")
            .and_then(|n| string_args(n).into_iter().next())
        {
            return Some(RemapValue::Command(command));
        }

        let mut targets = Vec::new();
        for entry in child.entries().iter().filter(|e| e.name().is_none()) {
            let Some(target) = entry.value().as_string() else {
                continue;
            };
            if !is_valid_combination(target) {
                self.invalid_keys.push(InvalidKeyInfo {
                    key: target.to_string(),
                    position: KeyPosition::To,
                    context: context.to_string(),
                    location: entry_location(entry, self.source),
                });
            }
            targets.push(target.to_uppercase());
        }

        match targets.len() {
            0 => None,
            1 => {
                let target = targets.remove(0);
                if target.contains('+') {
                    Some(RemapValue::Combination(target))
                } else {
                    Some(RemapValue::Key(target))
                }
            }
            _ => Some(RemapValue::Sequence(targets)),
        }
    }
}

/// Check a parsed configuration for unresolvable key names.
pub fn validate_keys(config: &Config) -> Result<(), ConfigError> {
    if config.invalid_keys.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::InvalidKeys {
            invalid_keys: config.invalid_keys.clone(),
        })
    }
}

/// Whether a single key name (not a combination) resolves.
pub fn is_valid_key(name: &str) -> bool {
    key_to_code(name).is_some()
}
