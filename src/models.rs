//! Session envelope shared by the relay and the client.
//!
//! Every response frame decrypts to a JSON [`ChunkReply`]. Keeping failures
//! as a separate segment kind means an error can never be confused with an
//! answer that happens to contain similar text.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result of querying the LLM for one piece of a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Segment {
    Answer { text: String },
    /// `chunk` is the request frame the failed piece came from, which is the
    /// client's chunk index. A frame the relay re-splits yields several
    /// segments with the same `chunk`.
    Failed { chunk: usize, reason: String },
}

impl Segment {
    pub fn is_failure(&self) -> bool {
        matches!(self, Segment::Failed { .. })
    }
}

/// Plaintext of one response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReply {
    /// Zero-based position of the request frame on its connection.
    pub sequence: u64,
    pub segments: Vec<Segment>,
}

impl ChunkReply {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Complete answer to a prompt, one or more segments per chunk in chunk
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAnswer {
    pub segments: Vec<Segment>,
}

impl RelayAnswer {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// True when every segment is an answer.
    pub fn is_complete(&self) -> bool {
        !self.segments.iter().any(Segment::is_failure)
    }

    /// Chunk indices and reasons of failed segments.
    pub fn failures(&self) -> Vec<(usize, &str)> {
        self.segments
            .iter()
            .filter_map(|seg| match seg {
                Segment::Failed { chunk, reason } => Some((*chunk, reason.as_str())),
                Segment::Answer { .. } => None,
            })
            .collect()
    }

    /// Concatenated text. Failed segments render as `[chunk i failed: reason]`.
    pub fn text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RelayAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.segments {
            match seg {
                Segment::Answer { text } => f.write_str(text)?,
                Segment::Failed { chunk, reason } => write!(f, "[chunk {chunk} failed: {reason}]")?,
            }
        }
        Ok(())
    }
}
