use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("Failed to parse KDL")]
    #[diagnostic(code(thumbmap::config::parse_error))]
    ParseError {
        #[source_code]
        src: String,
        #[label("here")]
        span: miette::SourceSpan,
        #[source]
        source: kdl::KdlError,
    },

    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(thumbmap::config::invalid))]
    Invalid { message: String },

    #[error("Invalid key names:\n{}", format_invalid_keys(.invalid_keys))]
    #[diagnostic(
        code(thumbmap::config::invalid_keys),
        help("key names are evdev names without the KEY_ prefix (e.g. CAPSLOCK, LEFTCTRL) or BTN_* names")
    )]
    InvalidKeys { invalid_keys: Vec<InvalidKeyInfo> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which side of a remap entry a key name was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPosition {
    From,
    To,
}

impl fmt::Display for KeyPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPosition::From => write!(f, "source"),
            KeyPosition::To => write!(f, "target"),
        }
    }
}

/// 1-indexed line/column of a KDL node or entry, plus its byte span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
    pub len: usize,
}

impl SourceLocation {
    pub fn new(line: usize, column: usize, offset: usize, len: usize) -> Self {
        Self {
            line,
            column,
            offset,
            len,
        }
    }
}

/// A key name in a remap table that does not resolve to an evdev code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidKeyInfo {
    pub key: String,
    pub position: KeyPosition,
    /// Human readable description of the section, e.g. `remap {thumbsense=true}`
    pub context: String,
    pub location: SourceLocation,
}

impl fmt::Display for InvalidKeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown {} key '{}' in {} at line {}, column {}",
            self.position, self.key, self.context, self.location.line, self.location.column
        )
    }
}

fn format_invalid_keys(keys: &[InvalidKeyInfo]) -> String {
    keys.iter()
        .map(|k| format!("  - {k}"))
        .collect::<Vec<_>>()
        .join("\n")
}
