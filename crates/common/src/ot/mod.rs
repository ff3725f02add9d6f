// Operational transformation over plain text buffers.
//
// An operation sequence walks a cursor over the buffer from left to right.
// All lengths are UTF-8 byte counts, which is what the browser client
// measures when it builds its sequences.

mod op;

use thiserror::Error;

pub use op::Op;

/// An ordered operation sequence.
pub type Ops = Vec<Op>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OtError {
    #[error("base length {actual} does not match document length {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("transform requires concurrent ops: base lengths {left} and {right} differ")]
    TransformConflict { left: usize, right: usize },

    #[error("compose requires consecutive ops: output length {first} != base length {second}")]
    ComposeMismatch { first: usize, second: usize },

    #[error("operation boundary at byte {offset} splits a character")]
    CharBoundary { offset: usize },

    #[error("operation sequence ended early")]
    ShortSequence,

    #[error("operation wrote {written} bytes, expected {expected}")]
    Incomplete { written: usize, expected: usize },

    #[error("invalid operation: {0}")]
    InvalidOp(String),
}

/// Retained, deleted and inserted byte totals of a sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub retain: usize,
    pub delete: usize,
    pub insert: usize,
}

impl Counts {
    /// Length of the buffer the sequence must be applied to.
    pub fn base_len(&self) -> usize {
        self.retain.saturating_add(self.delete)
    }

    /// Length of the buffer after the sequence has been applied.
    pub fn target_len(&self) -> usize {
        self.retain.saturating_add(self.insert)
    }
}

/// Totals saturate at `usize::MAX`; use the fallible operations to reject
/// sequences whose lengths do not fit.
pub fn count(ops: &[Op]) -> Counts {
    ops.iter().fold(Counts::default(), |mut counts, op| {
        match op {
            Op::Retain(n) => counts.retain = counts.retain.saturating_add(*n),
            Op::Delete(n) => counts.delete = counts.delete.saturating_add(*n),
            Op::Insert(text) => counts.insert = counts.insert.saturating_add(text.len()),
        }
        counts
    })
}

fn checked_count(ops: &[Op]) -> Result<Counts, OtError> {
    let overflow = || OtError::InvalidOp("operation lengths overflow".into());
    let mut counts = Counts::default();
    for op in ops {
        let (total, len) = match op {
            Op::Retain(n) => (&mut counts.retain, *n),
            Op::Delete(n) => (&mut counts.delete, *n),
            Op::Insert(text) => (&mut counts.insert, text.len()),
        };
        *total = total.checked_add(len).ok_or_else(overflow)?;
    }
    counts.retain.checked_add(counts.delete).ok_or_else(overflow)?;
    counts.retain.checked_add(counts.insert).ok_or_else(overflow)?;
    Ok(counts)
}

/// Applies `ops` to `buffer`.
///
/// The buffer is only replaced once the whole sequence has been walked, so
/// any error leaves it exactly as it was.
pub fn apply(buffer: &mut String, ops: &[Op]) -> Result<(), OtError> {
    let counts = checked_count(ops)?;
    if counts.base_len() != buffer.len() {
        return Err(OtError::LengthMismatch { expected: buffer.len(), actual: counts.base_len() });
    }

    let mut out = String::with_capacity(counts.target_len());
    let mut cursor = 0;
    for op in ops {
        match op {
            Op::Retain(n) => {
                let end = cursor + n;
                let span = buffer.get(cursor..end).ok_or(OtError::CharBoundary { offset: end })?;
                out.push_str(span);
                cursor = end;
            }
            Op::Delete(n) => {
                let end = cursor + n;
                if !buffer.is_char_boundary(end) {
                    return Err(OtError::CharBoundary { offset: end });
                }
                cursor = end;
            }
            Op::Insert(text) => out.push_str(text),
        }
    }

    // Validation above makes this unreachable for well-formed sequences.
    if cursor != counts.base_len() || out.len() != counts.target_len() {
        return Err(OtError::Incomplete { written: out.len(), expected: counts.target_len() });
    }

    *buffer = out;
    Ok(())
}

/// Coalesces adjacent ops of the same kind and drops no-ops.
pub fn merge(ops: impl IntoIterator<Item = Op>) -> Ops {
    let mut merged = Vec::new();
    for op in ops {
        push(&mut merged, op);
    }
    merged
}

fn push(ops: &mut Ops, op: Op) {
    if op.is_noop() {
        return;
    }
    match (ops.last_mut(), &op) {
        (Some(Op::Retain(n)), Op::Retain(m)) => {
            *n += m;
            return;
        }
        (Some(Op::Delete(n)), Op::Delete(m)) => {
            *n += m;
            return;
        }
        (Some(Op::Insert(text)), Op::Insert(more)) => {
            text.push_str(more);
            return;
        }
        _ => {}
    }
    ops.push(op);
}

fn leftover(kind: fn(usize) -> Op, len: usize, used: usize) -> Option<Op> {
    (len > used).then(|| kind(len - used))
}

/// Composes the consecutive sequences `a` and `b` into one sequence with the
/// same effect as applying `a` and then `b`.
pub fn compose(a: &[Op], b: &[Op]) -> Result<Ops, OtError> {
    let (a_counts, b_counts) = (checked_count(a)?, checked_count(b)?);
    if a_counts.target_len() != b_counts.base_len() {
        return Err(OtError::ComposeMismatch {
            first: a_counts.target_len(),
            second: b_counts.base_len(),
        });
    }

    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut a_iter = a.iter().cloned();
    let mut b_iter = b.iter().cloned();
    let mut head_a = a_iter.next();
    let mut head_b = b_iter.next();

    loop {
        match (head_a.take(), head_b.take()) {
            (None, None) => break,
            (Some(Op::Delete(n)), other) => {
                push(&mut out, Op::Delete(n));
                head_a = a_iter.next();
                head_b = other;
            }
            (other, Some(Op::Insert(text))) => {
                push(&mut out, Op::Insert(text));
                head_a = other;
                head_b = b_iter.next();
            }
            (None, Some(_)) | (Some(_), None) => return Err(OtError::ShortSequence),
            (Some(Op::Retain(n)), Some(Op::Retain(m))) => {
                let span = n.min(m);
                push(&mut out, Op::Retain(span));
                head_a = leftover(Op::Retain, n, span).or_else(|| a_iter.next());
                head_b = leftover(Op::Retain, m, span).or_else(|| b_iter.next());
            }
            (Some(Op::Retain(n)), Some(Op::Delete(m))) => {
                let span = n.min(m);
                push(&mut out, Op::Delete(span));
                head_a = leftover(Op::Retain, n, span).or_else(|| a_iter.next());
                head_b = leftover(Op::Delete, m, span).or_else(|| b_iter.next());
            }
            (Some(Op::Insert(text)), Some(Op::Retain(m))) => {
                let span = text.len().min(m);
                let (kept, rest) = split_insert(&text, span)?;
                push(&mut out, Op::Insert(kept.to_owned()));
                head_a = if rest.is_empty() {
                    a_iter.next()
                } else {
                    Some(Op::Insert(rest.to_owned()))
                };
                head_b = leftover(Op::Retain, m, span).or_else(|| b_iter.next());
            }
            (Some(Op::Insert(text)), Some(Op::Delete(m))) => {
                // Text inserted by `a` and deleted by `b` never shows up.
                let span = text.len().min(m);
                let (_, rest) = split_insert(&text, span)?;
                head_a = if rest.is_empty() {
                    a_iter.next()
                } else {
                    Some(Op::Insert(rest.to_owned()))
                };
                head_b = leftover(Op::Delete, m, span).or_else(|| b_iter.next());
            }
        }
    }

    Ok(merge(out))
}

fn split_insert(text: &str, at: usize) -> Result<(&str, &str), OtError> {
    if !text.is_char_boundary(at) {
        return Err(OtError::CharBoundary { offset: at });
    }
    Ok(text.split_at(at))
}

/// Transforms the concurrent sequences `a` and `b`, both computed against the
/// same base buffer, into `(a', b')` such that applying `b` then `a'` yields
/// the same buffer as applying `a` then `b'`.
///
/// When both sides insert at the same position the text from `a` ends up
/// first.
pub fn transform(a: &[Op], b: &[Op]) -> Result<(Ops, Ops), OtError> {
    let (a_counts, b_counts) = (checked_count(a)?, checked_count(b)?);
    if a_counts.base_len() != b_counts.base_len() {
        return Err(OtError::TransformConflict {
            left: a_counts.base_len(),
            right: b_counts.base_len(),
        });
    }

    let mut a_out = Vec::with_capacity(a.len() + b.len());
    let mut b_out = Vec::with_capacity(a.len() + b.len());
    let mut a_iter = a.iter().cloned();
    let mut b_iter = b.iter().cloned();
    let mut head_a = a_iter.next();
    let mut head_b = b_iter.next();

    loop {
        match (head_a.take(), head_b.take()) {
            (None, None) => break,
            (Some(Op::Insert(text)), other) => {
                push(&mut b_out, Op::Retain(text.len()));
                push(&mut a_out, Op::Insert(text));
                head_a = a_iter.next();
                head_b = other;
            }
            (other, Some(Op::Insert(text))) => {
                push(&mut a_out, Op::Retain(text.len()));
                push(&mut b_out, Op::Insert(text));
                head_a = other;
                head_b = b_iter.next();
            }
            (None, Some(_)) | (Some(_), None) => return Err(OtError::ShortSequence),
            (Some(Op::Retain(n)), Some(Op::Retain(m))) => {
                let span = n.min(m);
                push(&mut a_out, Op::Retain(span));
                push(&mut b_out, Op::Retain(span));
                head_a = leftover(Op::Retain, n, span).or_else(|| a_iter.next());
                head_b = leftover(Op::Retain, m, span).or_else(|| b_iter.next());
            }
            (Some(Op::Delete(n)), Some(Op::Delete(m))) => {
                // Both sides removed the span; neither output mentions it.
                let span = n.min(m);
                head_a = leftover(Op::Delete, n, span).or_else(|| a_iter.next());
                head_b = leftover(Op::Delete, m, span).or_else(|| b_iter.next());
            }
            (Some(Op::Delete(n)), Some(Op::Retain(m))) => {
                // `b` kept the span, so `a'` still has to remove it.
                let span = n.min(m);
                push(&mut a_out, Op::Delete(span));
                head_a = leftover(Op::Delete, n, span).or_else(|| a_iter.next());
                head_b = leftover(Op::Retain, m, span).or_else(|| b_iter.next());
            }
            (Some(Op::Retain(n)), Some(Op::Delete(m))) => {
                let span = n.min(m);
                push(&mut b_out, Op::Delete(span));
                head_a = leftover(Op::Retain, n, span).or_else(|| a_iter.next());
                head_b = leftover(Op::Delete, m, span).or_else(|| b_iter.next());
            }
        }
    }

    Ok((a_out, b_out))
}
