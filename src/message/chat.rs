//! Direct Chat Frames
//!
//! A chat frame is the sender's origin id as 16 lowercase hex characters
//! followed by the UTF-8 message text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bluetooth::protocol::{OriginId, ORIGIN_ID_SIZE};

/// Length of the hex-encoded sender prefix
pub const SENDER_PREFIX_LEN: usize = ORIGIN_ID_SIZE * 2;

/// A chat message received over the point-to-point channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender origin id, hex encoded
    pub sender: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Sender origin id, if the prefix is valid hex
    pub fn sender_id(&self) -> Option<OriginId> {
        let mut id = [0u8; ORIGIN_ID_SIZE];
        hex::decode_to_slice(&self.sender, &mut id).ok()?;
        Some(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("chat frame is {0} bytes, shorter than the sender prefix")]
    TooShort(usize),
    #[error("chat frame is not valid UTF-8")]
    InvalidUtf8,
}

pub fn encode_chat_frame(origin_id: &OriginId, text: &str) -> Vec<u8> {
    let mut frame = hex::encode(origin_id).into_bytes();
    frame.extend_from_slice(text.as_bytes());
    frame
}

pub fn parse_chat_frame(frame: &[u8]) -> Result<ChatMessage, ChatError> {
    let text = std::str::from_utf8(frame).map_err(|_| ChatError::InvalidUtf8)?;
    if text.len() < SENDER_PREFIX_LEN || !text.is_char_boundary(SENDER_PREFIX_LEN) {
        return Err(ChatError::TooShort(frame.len()));
    }

    let (sender, body) = text.split_at(SENDER_PREFIX_LEN);
    Ok(ChatMessage {
        sender: sender.to_string(),
        text: body.to_string(),
        received_at: Utc::now(),
    })
}
