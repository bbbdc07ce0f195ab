//! File Transfer Module
//!
//! Chunked file transfer over the point-to-point channel. A transfer is a
//! JSON start frame, the base64 text of the file in fixed-size data frames,
//! and a JSON end frame.

pub mod download;
pub mod receiver;
pub mod sender;

pub use download::DownloadSink;
pub use receiver::{FileReceiver, Progress, ReceiveEvent, ReceivedFile};
pub use sender::{prepare_transfer, OutgoingTransfer};

use serde::{Deserialize, Serialize};

/// Default data frame size, in base64 characters
pub const DEFAULT_CHUNK_SIZE: usize = 192;

pub(crate) const START: &str = "start";
pub(crate) const END: &str = "end";
// Short-form start marker used by older senders
pub(crate) const LEGACY_START: &str = "b64data";

/// JSON control frame. Both the long and short key forms are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    #[serde(rename = "type", alias = "t")]
    pub kind: String,
    #[serde(alias = "e", default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
    #[serde(alias = "c", default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

impl ControlFrame {
    pub fn start(ext: &str, count: u32) -> Self {
        Self {
            kind: START.to_string(),
            ext: Some(ext.to_string()),
            count: Some(count),
        }
    }

    pub fn end() -> Self {
        Self {
            kind: END.to_string(),
            ext: None,
            count: None,
        }
    }

    pub fn is_start(&self) -> bool {
        self.kind == START || self.kind == LEGACY_START
    }

    pub fn is_end(&self) -> bool {
        self.kind == END
    }

    /// Parse a frame as a control object; data frames yield `None`.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        serde_json::from_slice(frame).ok()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a plain struct of strings and integers cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Violation of the transfer frame order or format
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("start frame is missing `{0}`")]
    MalformedStart(&'static str),
    #[error("end frame without a preceding start frame")]
    EndWithoutStart,
    #[error("data frame without a preceding start frame")]
    DataWithoutStart,
    #[error("unknown control frame type `{0}`")]
    UnknownControl(String),
    #[error("received data is not valid base64: {0}")]
    InvalidBase64(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_frame_json_shape() {
        let json: serde_json::Value =
            serde_json::from_slice(&ControlFrame::start("png", 7).to_bytes()).unwrap();
        assert_eq!(json, serde_json::json!({"type": "start", "ext": "png", "count": 7}));
    }

    #[test]
    fn end_frame_json_shape() {
        let json: serde_json::Value = serde_json::from_slice(&ControlFrame::end().to_bytes()).unwrap();
        assert_eq!(json, serde_json::json!({"type": "end"}));
    }

    #[test]
    fn legacy_short_keys_parse() {
        let frame = ControlFrame::parse(br#"{"t": "b64data", "e": "txt", "c": 3}"#).unwrap();
        assert!(frame.is_start());
        assert_eq!(frame.ext.as_deref(), Some("txt"));
        assert_eq!(frame.count, Some(3));
        assert!(ControlFrame::parse(br#"{"t": "end"}"#).unwrap().is_end());
    }

    #[test]
    fn base64_text_is_not_a_control_frame() {
        assert!(ControlFrame::parse(b"aGVsbG8gd29ybGQ=").is_none());
        // Valid JSON, but not an object
        assert!(ControlFrame::parse(b"12345678").is_none());
    }
}
