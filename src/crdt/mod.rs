//! Bundled document CRDT.
//!
//! The replication engine treats documents as opaque: a local edit yields a
//! diff, a remote diff merges in. [`JsonDoc`] is the implementation shipped
//! with the crate.

pub mod document;
pub mod ids;
pub mod limits;
pub mod ops;

pub use document::{DocMut, JsonDoc};
pub use ids::{OpId, ReplicaId};
pub use ops::{DocError, DocOp, StampedOp};
