//! Wire frames and the newline-delimited JSON codec.
//!
//! One frame per line. A frame must arrive whole; lines longer than
//! [`MAX_FRAME_LEN`] are discarded as they stream past instead of buffered.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::envelope::Message;
use super::types::AgentId;
use crate::error::{Error, Result};

/// Upper bound on one encoded frame, newline excluded.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame from an agent: identity plus its route manifest.
    Hello {
        agent: AgentId,
        #[serde(default)]
        routes: Vec<String>,
    },
    /// Server accepted the identity.
    Welcome { server: String },
    /// Server refused the identity.
    Reject { reason: String },
    Message { message: Message },
    /// Route manifest update on a live session.
    Routes { routes: Vec<String> },
    /// Orderly close.
    Bye,
}

impl Frame {
    pub fn message(message: Message) -> Self {
        Frame::Message { message }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Welcome { .. } => "welcome",
            Frame::Reject { .. } => "reject",
            Frame::Message { .. } => "message",
            Frame::Routes { .. } => "routes",
            Frame::Bye => "bye",
        }
    }
}

/// Encode a frame as one line, trailing newline included.
pub fn encode(frame: &Frame) -> Result<String> {
    let mut line = serde_json::to_string(frame)?;
    if line.len() > MAX_FRAME_LEN {
        return Err(Error::transport(format!(
            "frame of {} bytes exceeds limit of {}",
            line.len(),
            MAX_FRAME_LEN
        )));
    }
    line.push('\n');
    Ok(line)
}

/// Decode one line (with or without its newline).
pub fn decode(line: &str) -> Result<Frame> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.len() > MAX_FRAME_LEN {
        return Err(Error::transport(format!(
            "frame of {} bytes exceeds limit of {}",
            line.len(),
            MAX_FRAME_LEN
        )));
    }
    Ok(serde_json::from_str(line)?)
}

/// One line pulled off a byte stream by [`read_line`].
#[derive(Debug, PartialEq)]
pub enum RawLine {
    /// A complete line, newline stripped, at most [`MAX_FRAME_LEN`] bytes.
    Line(Vec<u8>),
    /// A line over the limit; only its length was kept.
    Oversize(usize),
    /// End of stream. A trailing partial line is dropped.
    Eof,
}

/// Read the next line without ever holding more than [`MAX_FRAME_LEN`]
/// bytes of it.
pub async fn read_line<R>(reader: &mut R) -> std::io::Result<RawLine>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut skipped = 0usize;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(RawLine::Eof);
        }
        let newline = available.iter().position(|&b| b == b'\n');
        let chunk = &available[..newline.unwrap_or(available.len())];

        if skipped > 0 || line.len() + chunk.len() > MAX_FRAME_LEN {
            skipped += line.len() + chunk.len();
            line.clear();
        } else {
            line.extend_from_slice(chunk);
        }
        let used = chunk.len() + usize::from(newline.is_some());
        reader.consume(used);

        if newline.is_some() {
            return Ok(if skipped > 0 {
                RawLine::Oversize(skipped)
            } else {
                RawLine::Line(line)
            });
        }
    }
}
