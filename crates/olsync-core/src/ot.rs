//! Position-addressed text operations: coarse diff and sequential apply.
//!
//! Positions and lengths count UTF-16 code units, the server's string
//! offsets. Characters outside the Basic Multilingual Plane occupy two
//! units; a position between those two is out of range. Ops in one update
//! compose sequentially: each position refers to the buffer after the
//! previous ops.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OtError {
    #[error("Op position {position} out of range for text of length {len}")]
    OutOfRange { position: usize, len: usize },
}

/// A single text operation in wire form (`{"p":0,"i":"x"}` / `{"p":0,"d":"x"}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextOp {
    Insert {
        p: usize,
        i: String,
    },
    Delete {
        p: usize,
        d: String,
    },
    /// Comment ops carry range metadata only and never change the text
    Comment {
        p: usize,
        c: String,
    },
}

impl TextOp {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        TextOp::Insert {
            p: position,
            i: text.into(),
        }
    }

    pub fn delete(position: usize, text: impl Into<String>) -> Self {
        TextOp::Delete {
            p: position,
            d: text.into(),
        }
    }

    pub fn position(&self) -> usize {
        match self {
            TextOp::Insert { p, .. } | TextOp::Delete { p, .. } | TextOp::Comment { p, .. } => *p,
        }
    }
}

/// Compute the ops turning `old` into `new`.
///
/// Whole-document replace: a delete of all of `old` (when non-empty) followed
/// by an insert of all of `new` (when non-empty). Equal texts yield no ops.
pub fn diff(old: &str, new: &str) -> Vec<TextOp> {
    if old == new {
        return Vec::new();
    }
    let mut ops = Vec::with_capacity(2);
    if !old.is_empty() {
        ops.push(TextOp::delete(0, old));
    }
    if !new.is_empty() {
        ops.push(TextOp::insert(0, new));
    }
    ops
}

/// Apply `ops` in order to `text`.
pub fn apply(text: &str, ops: &[TextOp]) -> Result<String, OtError> {
    let mut buffer = text.to_string();
    for op in ops {
        match op {
            TextOp::Insert { p, i } => {
                let at = byte_offset(&buffer, *p)?;
                buffer.insert_str(at, i);
            }
            TextOp::Delete { p, d } => {
                let start = byte_offset(&buffer, *p)?;
                let end = byte_offset(&buffer, p + utf16_len(d))?;
                buffer.replace_range(start..end, "");
            }
            TextOp::Comment { .. } => {}
        }
    }
    Ok(buffer)
}

/// Length of `text` in UTF-16 code units.
pub fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

/// Byte offset of UTF-16 position `units`, or the end for `units == len`.
fn byte_offset(text: &str, units: usize) -> Result<usize, OtError> {
    let mut seen = 0;
    for (offset, c) in text.char_indices() {
        if seen == units {
            return Ok(offset);
        }
        seen += c.len_utf16();
        if seen > units {
            break;
        }
    }
    if seen == units {
        return Ok(text.len());
    }
    Err(OtError::OutOfRange {
        position: units,
        len: utf16_len(text),
    })
}
