//! Control socket protocol
//!
//! Newline-delimited JSON exchanged between `thumbmap` and the daemon:
//! - `{"type": "layer_add", "layer": {"thumbsense": true}}`
//! - `{"type": "layer_remove", "layer": {"thumbsense": true}}`
//! - `{"type": "status"}`

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::context::Layer;

const SOCKET_NAME: &str = "thumbmap.sock";

/// Request messages sent from the CLI to the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Merge context flags into the current layer
    LayerAdd { layer: Layer },
    /// Remove the named context flags from the current layer
    LayerRemove { layer: Layer },
    Status,
}

/// Response messages sent from the daemon back to the CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Success {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Status {
        /// Layer as last sent by the daemon
        layer: Layer,
        remappers: Vec<RemapperStatus>,
    },
    Error {
        message: String,
    },
}

/// A forked remapper process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemapperStatus {
    /// `keyboard` or `touchpad`
    pub kind: String,
    pub pid: i32,
    pub running: bool,
}

/// `$XDG_RUNTIME_DIR/thumbmap.sock`, or `/tmp/thumbmap-$UID.sock` without a runtime dir.
pub fn control_socket_path() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) => PathBuf::from(runtime_dir).join(SOCKET_NAME),
        Err(_) => {
            let uid = nix::unistd::getuid();
            PathBuf::from(format!("/tmp/thumbmap-{}.sock", uid))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_add_wire_format() {
        let request = ControlRequest::LayerAdd {
            layer: Layer::from_pairs([("thumbsense", true)]),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"type":"layer_add","layer":{"thumbsense":true}}"#);

        let parsed: ControlRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_status_request_and_response() {
        let parsed: ControlRequest = serde_json::from_str(r#"{"type":"status"}"#).unwrap();
        assert_eq!(parsed, ControlRequest::Status);

        let response = ControlResponse::Status {
            layer: Layer::from_pairs([("application", "Chrome")]),
            remappers: vec![RemapperStatus {
                kind: "keyboard".to_string(),
                pid: 42,
                running: true,
            }],
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.starts_with(r#"{"type":"status","layer":{"application":"Chrome"}"#));
    }

    #[test]
    fn test_success_omits_empty_message() {
        let json = serde_json::to_string(&ControlResponse::Success { message: None }).unwrap();
        assert_eq!(json, r#"{"type":"success"}"#);
    }
}
