use serde::{Deserialize, Serialize};

use super::OtError;

/// A single cursor step.
///
/// On the wire a positive number retains, a negative number deletes and a
/// string inserts. Zero and the empty string are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawOp", into = "RawOp")]
pub enum Op {
    Retain(usize),
    Delete(usize),
    Insert(String),
}

impl Op {
    pub fn len(&self) -> usize {
        match self {
            Op::Retain(n) | Op::Delete(n) => *n,
            Op::Insert(text) => text.len(),
        }
    }

    /// Bytes this op consumes from the buffer it is applied to.
    pub fn base_len(&self) -> usize {
        match self {
            Op::Retain(n) | Op::Delete(n) => *n,
            Op::Insert(_) => 0,
        }
    }

    /// Bytes this op contributes to the result.
    pub fn target_len(&self) -> usize {
        match self {
            Op::Retain(n) => *n,
            Op::Delete(_) => 0,
            Op::Insert(text) => text.len(),
        }
    }

    pub(crate) fn is_noop(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawOp {
    Count(i64),
    Text(String),
}

impl TryFrom<RawOp> for Op {
    type Error = OtError;

    fn try_from(raw: RawOp) -> Result<Self, Self::Error> {
        match raw {
            RawOp::Count(0) => Err(OtError::InvalidOp("zero-length retain or delete".into())),
            RawOp::Count(n) => {
                let len = usize::try_from(n.unsigned_abs())
                    .map_err(|_| OtError::InvalidOp(format!("length {n} out of range")))?;
                Ok(if n > 0 { Op::Retain(len) } else { Op::Delete(len) })
            }
            RawOp::Text(text) if text.is_empty() => {
                Err(OtError::InvalidOp("empty insert".into()))
            }
            RawOp::Text(text) => Ok(Op::Insert(text)),
        }
    }
}

impl From<Op> for RawOp {
    fn from(op: Op) -> Self {
        let wide = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
        match op {
            Op::Retain(n) => RawOp::Count(wide(n)),
            Op::Delete(n) => RawOp::Count(-wide(n)),
            Op::Insert(text) => RawOp::Text(text),
        }
    }
}
