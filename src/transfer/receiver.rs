//! Incoming file transfers
//!
//! One `FileReceiver` per peer channel. Frames must arrive in send order.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use log::{debug, info, warn};
use std::time::{Duration, Instant};

use super::{ControlFrame, ProtocolError};

/// Progress after a data frame
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub received: u32,
    pub expected: u32,
    /// `received / expected`; `None` when the sender announced zero chunks
    pub fraction: Option<f64>,
    /// `(expected - received) / received * elapsed`
    pub eta: Option<Duration>,
    pub elapsed: Duration,
}

impl Progress {
    fn compute(received: u32, expected: u32, elapsed: Duration) -> Self {
        let fraction = (expected > 0).then(|| received as f64 / expected as f64);

        let eta = if received >= 1 {
            let remaining = expected.saturating_sub(received) as f64;
            Some(elapsed.mul_f64(remaining / received as f64))
        } else {
            None
        };

        Self {
            received,
            expected,
            fraction,
            eta,
            elapsed,
        }
    }

    pub fn percent(&self) -> Option<f64> {
        self.fraction.map(|f| f * 100.0)
    }
}

/// The extension becomes part of a file name, so it must be a single path component
fn is_safe_extension(ext: &str) -> bool {
    !ext.is_empty()
        && ext != "."
        && ext != ".."
        && !ext.contains(|c: char| c == '/' || c == '\\' || c == '\0' || c.is_control())
}

/// A completely received file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub extension: String,
    pub data: Vec<u8>,
    pub elapsed: Duration,
}

impl ReceivedFile {
    /// Name the file is stored under: `received_file.<ext>`
    pub fn file_name(&self) -> String {
        format!("received_file.{}", self.extension)
    }
}

/// Outcome of feeding one frame to the receiver
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveEvent {
    Started { extension: String, expected: u32 },
    Progress(Progress),
    Completed(ReceivedFile),
}

struct Session {
    extension: String,
    expected: u32,
    received: u32,
    buffer: Vec<u8>,
    started_at: Instant,
}

/// Reassembles transfers from an ordered frame stream
#[derive(Default)]
pub struct FileReceiver {
    session: Option<Session>,
}

impl FileReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.session.is_some()
    }

    pub fn on_receive_frame(&mut self, frame: &[u8]) -> Result<ReceiveEvent, ProtocolError> {
        self.on_receive_frame_at(frame, Instant::now())
    }

    /// Feed one frame observed at `now`. Any error discards the session.
    pub fn on_receive_frame_at(
        &mut self,
        frame: &[u8],
        now: Instant,
    ) -> Result<ReceiveEvent, ProtocolError> {
        let result = match ControlFrame::parse(frame) {
            Some(control) if control.is_start() => self.start(control, now),
            Some(control) if control.is_end() => self.finish(now),
            Some(control) => Err(ProtocolError::UnknownControl(control.kind)),
            None => self.append(frame, now),
        };

        if let Err(e) = &result {
            if self.session.take().is_some() {
                warn!("File transfer aborted, partial data discarded: {}", e);
            }
        }
        result
    }

    fn start(&mut self, control: ControlFrame, now: Instant) -> Result<ReceiveEvent, ProtocolError> {
        let extension = control
            .ext
            .filter(|ext| is_safe_extension(ext))
            .ok_or(ProtocolError::MalformedStart("ext"))?;
        let expected = control.count.ok_or(ProtocolError::MalformedStart("count"))?;

        if self.session.is_some() {
            warn!("New transfer started before the previous one ended");
        }
        info!("Receiving .{} file in {} chunks", extension, expected);

        self.session = Some(Session {
            extension: extension.clone(),
            expected,
            received: 0,
            buffer: Vec::new(),
            started_at: now,
        });

        Ok(ReceiveEvent::Started { extension, expected })
    }

    fn append(&mut self, frame: &[u8], now: Instant) -> Result<ReceiveEvent, ProtocolError> {
        let session = self.session.as_mut().ok_or(ProtocolError::DataWithoutStart)?;

        session.buffer.extend_from_slice(frame);
        session.received += 1;

        let elapsed = now.saturating_duration_since(session.started_at);
        let progress = Progress::compute(session.received, session.expected, elapsed);
        debug!("Chunk {}/{} received", progress.received, progress.expected);

        Ok(ReceiveEvent::Progress(progress))
    }

    fn finish(&mut self, now: Instant) -> Result<ReceiveEvent, ProtocolError> {
        let session = self.session.take().ok_or(ProtocolError::EndWithoutStart)?;

        let data = BASE64_STANDARD
            .decode(&session.buffer)
            .map_err(|e| ProtocolError::InvalidBase64(e.to_string()))?;
        let elapsed = now.saturating_duration_since(session.started_at);

        if session.received != session.expected {
            warn!(
                "Transfer ended after {} of {} announced chunks",
                session.received, session.expected
            );
        }
        info!(
            "File received in {:.3} seconds ({} bytes, .{})",
            elapsed.as_secs_f64(),
            data.len(),
            session.extension
        );

        Ok(ReceiveEvent::Completed(ReceivedFile {
            extension: session.extension,
            data,
            elapsed,
        }))
    }
}
