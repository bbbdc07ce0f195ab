//! Message Handling Module
//!
//! Application payloads carried over the point-to-point channel.

pub mod chat;

pub use chat::{encode_chat_frame, parse_chat_frame, ChatError, ChatMessage};
