/// Guardrails on diffs accepted from remote replicas.
///
/// A diff is untrusted input until it has been merged; these bounds keep a
/// single malformed or hostile change from exhausting memory.

use super::ops::DocError;

/// Max encoded size of one diff (a full-state bootstrap included).
pub const MAX_DIFF_BYTES: usize = 16 * 1024 * 1024; // 16 MB

/// Max ops in one diff.
pub const MAX_OPS_PER_DIFF: usize = 250_000;

/// Max length of a top-level document key.
pub const MAX_KEY_BYTES: usize = 1024;

/// Max distance a remote op's Lamport clock may sit ahead of the local one.
/// Honest clocks advance by one per op, so a bigger jump is forged.
pub const MAX_LAMPORT_JUMP: u64 = 1 << 40;

pub fn check_diff_size(len: usize) -> Result<(), DocError> {
    if len > MAX_DIFF_BYTES {
        return Err(DocError::PayloadTooLarge {
            size: len,
            max: MAX_DIFF_BYTES,
        });
    }
    Ok(())
}

pub fn check_op_count(count: usize) -> Result<(), DocError> {
    if count > MAX_OPS_PER_DIFF {
        return Err(DocError::TooManyOps {
            count,
            max: MAX_OPS_PER_DIFF,
        });
    }
    Ok(())
}

pub fn check_key(key: &str) -> Result<(), DocError> {
    if key.len() > MAX_KEY_BYTES {
        return Err(DocError::KeyTooLong(key.len()));
    }
    Ok(())
}

pub fn check_lamport(lamport: u64, local_max: u64) -> Result<(), DocError> {
    let max = local_max.saturating_add(MAX_LAMPORT_JUMP);
    if lamport > max {
        return Err(DocError::LamportOutOfRange { lamport, max });
    }
    Ok(())
}
