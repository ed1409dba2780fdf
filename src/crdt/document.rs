//! `JsonDoc`: a JSON object replicated as an op-based CRDT.
//!
//! Each top-level key is a last-writer-wins register holding either a JSON
//! value or a replicated list (RGA). Lists order siblings that share an
//! anchor by descending `OpId` and are read in depth-first order, so
//! concurrent inserts at one position interleave identically everywhere.
//!
//! **Convergence:** state is derived from the set of ops alone. Merging the
//! same ops in any order, any number of times, yields the same snapshot.
//! Ops whose list or anchor has not arrived yet stay invisible until it does.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::crdt::ids::{OpId, ReplicaId};
use crate::crdt::limits::{check_key, check_lamport};
use crate::crdt::ops::{decode_ops, encode_ops, DocError, DocOp, Result, StampedOp};

// ---------------------------------------------------------------------------
// DocState: op set plus derived indexes
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
struct ListIndex {
    /// Anchor -> inserted elements, sorted by descending OpId.
    children: HashMap<Option<OpId>, Vec<OpId>>,
}

#[derive(Clone, Debug, Default)]
struct DocState {
    ops: BTreeMap<OpId, DocOp>,
    /// Winning assignment per top-level key.
    registers: BTreeMap<String, OpId>,
    lists: HashMap<OpId, ListIndex>,
    removed: HashSet<OpId>,
    max_lamport: u64,
}

impl DocState {
    /// Returns false if the op was already present.
    fn apply(&mut self, stamped: StampedOp) -> bool {
        let StampedOp { id, op } = stamped;
        if self.ops.contains_key(&id) {
            return false;
        }

        match &op {
            DocOp::Set { key, .. } | DocOp::Delete { key } | DocOp::MakeList { key } => {
                let wins = self.registers.get(key).map_or(true, |current| id > *current);
                if wins {
                    self.registers.insert(key.clone(), id);
                }
            }
            DocOp::Insert { list, after, .. } => {
                let siblings = self
                    .lists
                    .entry(*list)
                    .or_default()
                    .children
                    .entry(*after)
                    .or_default();
                let pos = match siblings.binary_search_by(|other| id.cmp(other)) {
                    Ok(pos) | Err(pos) => pos,
                };
                siblings.insert(pos, id);
            }
            DocOp::Remove { elem } => {
                self.removed.insert(*elem);
            }
        }

        self.max_lamport = self.max_lamport.max(id.lamport);
        self.ops.insert(id, op);
        true
    }

    /// Visible elements of a list in document order.
    fn list_elements(&self, list: &OpId) -> Vec<(OpId, &Value)> {
        let mut out = Vec::new();
        let index = match self.lists.get(list) {
            Some(index) => index,
            None => return out,
        };

        let mut stack: Vec<OpId> = index
            .children
            .get(&None)
            .map(|head| head.iter().rev().copied().collect())
            .unwrap_or_default();

        while let Some(id) = stack.pop() {
            if !self.removed.contains(&id) {
                if let Some(DocOp::Insert { value, .. }) = self.ops.get(&id) {
                    out.push((id, value));
                }
            }
            if let Some(children) = index.children.get(&Some(id)) {
                stack.extend(children.iter().rev());
            }
        }
        out
    }

    /// The winning assignment for `key`, if it is a list.
    fn list_id(&self, key: &str) -> Option<OpId> {
        let winner = self.registers.get(key)?;
        match self.ops.get(winner)? {
            DocOp::MakeList { .. } => Some(*winner),
            _ => None,
        }
    }

    fn value_of(&self, key: &str) -> Option<Value> {
        let winner = self.registers.get(key)?;
        match self.ops.get(winner)? {
            DocOp::Set { value, .. } => Some(value.clone()),
            DocOp::Delete { .. } => None,
            DocOp::MakeList { .. } => Some(Value::Array(
                self.list_elements(winner)
                    .into_iter()
                    .map(|(_, value)| value.clone())
                    .collect(),
            )),
            DocOp::Insert { .. } | DocOp::Remove { .. } => None,
        }
    }

    fn materialize(&self) -> Value {
        let mut root = Map::new();
        for key in self.registers.keys() {
            if let Some(value) = self.value_of(key) {
                root.insert(key.clone(), value);
            }
        }
        Value::Object(root)
    }
}

// ---------------------------------------------------------------------------
// DocMut: the mutable view handed to a transaction
// ---------------------------------------------------------------------------

/// Working copy of a document inside [`JsonDoc::transact`].
///
/// Reads observe the transaction's own edits. Nothing is visible outside
/// until the transaction commits.
pub struct DocMut {
    state: DocState,
    replica: ReplicaId,
    clock: u64,
    pending: Vec<StampedOp>,
}

impl DocMut {
    fn stamp(&mut self, op: DocOp) -> Result<()> {
        self.clock = self.clock.checked_add(1).ok_or(DocError::ClockExhausted)?;
        let stamped = StampedOp {
            id: OpId::new(self.clock, self.replica),
            op,
        };
        self.state.apply(stamped.clone());
        self.pending.push(stamped);
        Ok(())
    }

    fn require_list(&self, key: &str) -> Result<OpId> {
        self.state
            .list_id(key)
            .ok_or_else(|| DocError::NotAList(key.to_string()))
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.value_of(key)
    }

    /// Assign a top-level key. Arrays become replicated lists.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        check_key(key)?;
        match value.into() {
            Value::Array(items) => {
                self.stamp(DocOp::MakeList {
                    key: key.to_string(),
                })?;
                for item in items {
                    self.push(key, item)?;
                }
            }
            value => self.stamp(DocOp::Set {
                key: key.to_string(),
                value,
            })?,
        }
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        check_key(key)?;
        self.stamp(DocOp::Delete {
            key: key.to_string(),
        })?;
        Ok(())
    }

    pub fn len(&self, key: &str) -> Result<usize> {
        let list = self.require_list(key)?;
        Ok(self.state.list_elements(&list).len())
    }

    pub fn push(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        let list = self.require_list(key)?;
        let after = self.state.list_elements(&list).last().map(|(id, _)| *id);
        self.stamp(DocOp::Insert {
            list,
            after,
            value: value.into(),
        })?;
        Ok(())
    }

    /// Insert so the value ends up at `index` (`index == len` appends).
    pub fn insert(&mut self, key: &str, index: usize, value: impl Into<Value>) -> Result<()> {
        let list = self.require_list(key)?;
        let elements = self.state.list_elements(&list);
        if index > elements.len() {
            return Err(DocError::IndexOutOfBounds {
                index,
                len: elements.len(),
            });
        }
        let after = index.checked_sub(1).map(|prev| elements[prev].0);
        self.stamp(DocOp::Insert {
            list,
            after,
            value: value.into(),
        })?;
        Ok(())
    }

    pub fn remove(&mut self, key: &str, index: usize) -> Result<Value> {
        let list = self.require_list(key)?;
        let elements = self.state.list_elements(&list);
        let (elem, value) = match elements.get(index) {
            Some((elem, value)) => (*elem, (*value).clone()),
            None => {
                return Err(DocError::IndexOutOfBounds {
                    index,
                    len: elements.len(),
                })
            }
        };
        self.stamp(DocOp::Remove { elem })?;
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// JsonDoc
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct JsonDoc {
    replica: ReplicaId,
    state: DocState,
    /// Cached materialization, refreshed on commit and merge.
    snapshot: Value,
}

impl JsonDoc {
    /// Empty document owned by `replica`.
    pub fn empty(replica: ReplicaId) -> Self {
        JsonDoc {
            replica,
            state: DocState::default(),
            snapshot: Value::Object(Map::new()),
        }
    }

    /// Document seeded with the top-level keys of `initial`.
    pub fn new(replica: ReplicaId, initial: &Value) -> Result<Self> {
        let fields = initial.as_object().ok_or(DocError::NotAnObject)?;
        let mut doc = Self::empty(replica);
        doc.transact(|d| {
            for (key, value) in fields {
                d.set(key, value.clone())?;
            }
            Ok(())
        })?;
        Ok(doc)
    }

    /// Rebuild a document from a [`save`](Self::save) blob.
    pub fn load(replica: ReplicaId, bytes: &[u8]) -> Result<Self> {
        let mut doc = Self::empty(replica);
        doc.merge(bytes)?;
        Ok(doc)
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Current merged state. Never reflects an uncommitted transaction.
    pub fn snapshot(&self) -> &Value {
        &self.snapshot
    }

    pub fn get_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.snapshot.clone()).map_err(|e| DocError::Shape(e.to_string()))
    }

    pub fn op_count(&self) -> usize {
        self.state.ops.len()
    }

    /// Run `edit` against a working copy and commit its ops atomically.
    ///
    /// Returns the encoded diff, or `None` if the edit produced no ops. If
    /// `edit` fails, nothing is committed.
    pub fn transact<F>(&mut self, edit: F) -> Result<Option<Vec<u8>>>
    where
        F: FnOnce(&mut DocMut) -> Result<()>,
    {
        let mut working = DocMut {
            state: self.state.clone(),
            replica: self.replica,
            clock: self.state.max_lamport,
            pending: Vec::new(),
        };
        edit(&mut working)?;

        if working.pending.is_empty() {
            return Ok(None);
        }
        let diff = encode_ops(&working.pending)?;

        self.state = working.state;
        self.snapshot = self.state.materialize();
        Ok(Some(diff))
    }

    /// Merge a remote diff. Returns how many ops were new.
    pub fn merge(&mut self, diff: &[u8]) -> Result<usize> {
        let ops = decode_ops(diff)?;
        for stamped in &ops {
            check_lamport(stamped.id.lamport, self.state.max_lamport)?;
            if let Some(key) = stamped.op.assigned_key() {
                check_key(key)?;
            }
        }

        let mut applied = 0;
        for stamped in ops {
            if self.state.apply(stamped) {
                applied += 1;
            }
        }
        if applied > 0 {
            self.snapshot = self.state.materialize();
        }
        Ok(applied)
    }

    /// Every op held, as one diff. Merging it into any replica brings that
    /// replica up to this one's state.
    pub fn save(&self) -> Result<Vec<u8>> {
        let ops: Vec<StampedOp> = self
            .state
            .ops
            .iter()
            .map(|(id, op)| StampedOp {
                id: *id,
                op: op.clone(),
            })
            .collect();
        encode_ops(&ops)
    }
}
