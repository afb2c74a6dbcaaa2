//! Device name patterns and device tags

use std::cell::OnceCell;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use thumbmap_config::Config;

/// Case-insensitive device name pattern
///
/// Patterns are regular expressions; a pattern that fails to compile is
/// matched as a plain substring instead.
#[derive(Debug, Clone)]
pub struct NamePattern {
    source: String,
    regex: Option<Regex>,
}

impl NamePattern {
    pub fn new(pattern: &str) -> Self {
        let regex = match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(regex) => Some(regex),
            Err(e) => {
                tracing::warn!(
                    "Device pattern '{}' is not a valid regex ({}), matching it as text",
                    pattern,
                    e
                );
                None
            }
        };
        Self {
            source: pattern.to_string(),
            regex,
        }
    }

    pub fn is_match(&self, name: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(name),
            None => name.to_lowercase().contains(&self.source.to_lowercase()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Maps a physical device name to the `device` context it belongs to
pub struct DeviceMatcher {
    config: Arc<Config>,
    patterns: OnceCell<Vec<NamePattern>>,
}

impl DeviceMatcher {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            patterns: OnceCell::new(),
        }
    }

    /// First declared `device` pattern matching `device_name`.
    pub fn match_device(&self, device_name: &str) -> Option<&str> {
        self.patterns
            .get_or_init(|| {
                self.config
                    .device_patterns()
                    .iter()
                    .map(|p| NamePattern::new(p))
                    .collect()
            })
            .iter()
            .find(|pattern| pattern.is_match(device_name))
            .map(NamePattern::as_str)
    }
}
