//! Padding to a whole number of work-groups.

use super::{Lane, ReduceOp};

/// Number of filler elements needed to make `len` a multiple of `local_size`.
pub fn padding_len(len: usize, local_size: usize) -> usize {
    (local_size - len % local_size) % local_size
}

/// Copy `data` and append `fill` until the length divides `local_size`.
///
/// The input is never modified. `local_size` must be non-zero.
pub fn pad<T: Copy>(data: &[T], local_size: usize, fill: T) -> Vec<T> {
    let extra = padding_len(data.len(), local_size);
    let mut padded = Vec::with_capacity(data.len() + extra);
    padded.extend_from_slice(data);
    padded.resize(data.len() + extra, fill);
    padded
}

/// Pad with the identity element of `op`.
pub fn pad_for<T: Lane>(op: ReduceOp, data: &[T], local_size: usize) -> Vec<T> {
    pad(data, local_size, op.identity())
}
