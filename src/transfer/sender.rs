//! Outgoing file transfers

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use super::{ControlFrame, DEFAULT_CHUNK_SIZE};

/// Every frame of one outgoing transfer, in send order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingTransfer {
    pub extension: String,
    pub total_chunks: u32,
    frames: Vec<Vec<u8>>,
}

impl OutgoingTransfer {
    /// start, data[0..total_chunks], end
    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Vec<u8>> {
        self.frames
    }

    pub fn data_frames(&self) -> &[Vec<u8>] {
        &self.frames[1..self.frames.len() - 1]
    }
}

/// Split `blob` into transfer frames. A `chunk_size` of 0 selects the default.
pub fn prepare_transfer(blob: &[u8], extension: &str, chunk_size: usize) -> OutgoingTransfer {
    let chunk_size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };

    let encoded = BASE64_STANDARD.encode(blob);

    let mut start = ControlFrame::start(extension, 0);
    let data: Vec<Vec<u8>> = encoded
        .as_bytes()
        .chunks(chunk_size)
        .map(<[u8]>::to_vec)
        .collect();
    let end = ControlFrame::end();

    let total_chunks = data.len() as u32;
    start.count = Some(total_chunks);

    let mut frames = Vec::with_capacity(data.len() + 2);
    frames.push(start.to_bytes());
    frames.extend(data);
    frames.push(end.to_bytes());

    OutgoingTransfer {
        extension: extension.to_string(),
        total_chunks,
        frames,
    }
}
