/// Document operations and their wire encoding.
///
/// A diff is a CBOR-encoded batch of stamped ops (ciborium). Ops are
/// immutable; the document state is a pure function of the set of ops held.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crdt::ids::OpId;
use crate::crdt::limits::{check_diff_size, check_op_count};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DocError {
    #[error("Document root must be a JSON object")]
    NotAnObject,

    #[error("Key {0} does not hold a list")]
    NotAList(String),

    #[error("Index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Key too long ({0} bytes)")]
    KeyTooLong(usize),

    #[error("Diff exceeds max size ({size} > {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Diff holds too many ops ({count} > {max})")]
    TooManyOps { count: usize, max: usize },

    #[error("Lamport clock {lamport} is out of range (max {max})")]
    LamportOutOfRange { lamport: u64, max: u64 },

    #[error("Lamport clock exhausted")]
    ClockExhausted,

    #[error("CBOR encoding failed: {0}")]
    Encode(String),

    #[error("CBOR decoding failed: {0}")]
    Decode(String),

    #[error("Snapshot does not match the requested type: {0}")]
    Shape(String),
}

pub type Result<T> = std::result::Result<T, DocError>;

// ---------------------------------------------------------------------------
// Ops
// ---------------------------------------------------------------------------

/// One mutation of a document.
///
/// `Set`, `Delete` and `MakeList` are assignments to a top-level key; the
/// assignment with the greatest `OpId` wins. `Insert` and `Remove` edit the
/// replicated sequence created by a `MakeList` op.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum DocOp {
    Set {
        key: String,
        value: serde_json::Value,
    },
    Delete {
        key: String,
    },
    MakeList {
        key: String,
    },
    /// Insert after `after` (`None` = list head). The element id is the op id.
    Insert {
        list: OpId,
        after: Option<OpId>,
        value: serde_json::Value,
    },
    Remove {
        elem: OpId,
    },
}

impl DocOp {
    /// Top-level key for assignment ops.
    pub fn assigned_key(&self) -> Option<&str> {
        match self {
            DocOp::Set { key, .. } | DocOp::Delete { key } | DocOp::MakeList { key } => Some(key),
            DocOp::Insert { .. } | DocOp::Remove { .. } => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StampedOp {
    pub id: OpId,
    pub op: DocOp,
}

// ---------------------------------------------------------------------------
// CBOR helpers
// ---------------------------------------------------------------------------

pub fn encode_ops(ops: &[StampedOp]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(ops, &mut buf).map_err(|e| DocError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode a diff, enforcing the size limits before and after parsing.
pub fn decode_ops(bytes: &[u8]) -> Result<Vec<StampedOp>> {
    check_diff_size(bytes.len())?;
    let ops: Vec<StampedOp> =
        ciborium::from_reader(bytes).map_err(|e| DocError::Decode(e.to_string()))?;
    check_op_count(ops.len())?;
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::ids::ReplicaId;
    use serde_json::json;

    #[test]
    fn test_cbor_batch_roundtrip() {
        let replica = ReplicaId::random();
        let list = OpId::new(1, replica);
        let ops = vec![
            StampedOp {
                id: list,
                op: DocOp::MakeList { key: "items".into() },
            },
            StampedOp {
                id: OpId::new(2, replica),
                op: DocOp::Insert {
                    list,
                    after: None,
                    value: json!({"title": "x", "done": false, "n": -3, "w": 1.5}),
                },
            },
            StampedOp {
                id: OpId::new(3, replica),
                op: DocOp::Remove {
                    elem: OpId::new(2, replica),
                },
            },
        ];

        let decoded = decode_ops(&encode_ops(&ops).unwrap()).unwrap();
        assert_eq!(decoded, ops);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        assert!(matches!(
            decode_ops(&[0xff, 0x00, 0x13]),
            Err(DocError::Decode(_))
        ));
    }

    #[test]
    fn test_assigned_key() {
        assert_eq!(DocOp::Delete { key: "a".into() }.assigned_key(), Some("a"));
        let elem = OpId::new(1, ReplicaId::random());
        assert_eq!(DocOp::Remove { elem }.assigned_key(), None);
    }
}
