// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The transactional store the durable services sit on. The store itself is a
//! collaborator: the services only speak the binding/object interface below,
//! and every mutation to persistent state happens inside a [`StoreTransaction`]
//! driven through a [`Txn`] context.
//!
//! [`MemStore`] is the in-memory optimistic implementation used by tests and
//! single-process embeddings. Conflicting commits return
//! [`CommitResult::ConflictRetry`] and never corrupt committed state.

use std::any::Any;
use std::sync::Arc;

use thiserror::Error;

mod context;
mod mem;

pub use context::{Txn, TxnParticipant, TxnRunner};
pub use mem::MemStore;

/// Identifier for one stored object. Never reused within a store's lifetime.
pub type ObjId = u64;

/// Anything the store can hold. Values are immutable snapshots; an update
/// replaces the stored value wholesale under the transaction's write set.
pub trait ManagedObject: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync> ManagedObject for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Downcast a stored value to a concrete type.
///
/// Dispatch must go through the trait object: calling `as_any` on the `Arc`
/// itself would hit the blanket impl for `Arc<dyn ManagedObject>` and the
/// downcast would always miss.
pub fn downcast<T: 'static>(obj: &Arc<dyn ManagedObject>) -> Option<&T> {
    obj.as_ref().as_any().downcast_ref::<T>()
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("name not bound: {0}")]
    NameNotBound(String),
    #[error("object not found: {0}")]
    ObjectNotFound(ObjId),
}

/// Outcome of a transaction commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    Success,
    /// Another transaction won a conflicting write; the whole unit of work
    /// should be re-run.
    ConflictRetry,
}

/// One transaction's view of the store. Reads are recorded for validation at
/// commit; writes are buffered in a working set until then.
pub trait StoreTransaction: Send {
    /// Store a new object, returning its id.
    fn create(&mut self, value: Arc<dyn ManagedObject>) -> ObjId;

    /// Resolve an object by id.
    fn resolve(&mut self, obj_id: ObjId) -> Result<Arc<dyn ManagedObject>, StoreError>;

    /// Replace an object's value.
    fn update(&mut self, obj_id: ObjId, value: Arc<dyn ManagedObject>) -> Result<(), StoreError>;

    /// Declare write intent on an object without changing it yet. Ensures the
    /// commit conflicts with concurrent writers even if this transaction
    /// ultimately stores the same value.
    fn mark_for_update(&mut self, obj_id: ObjId) -> Result<(), StoreError>;

    fn remove_object(&mut self, obj_id: ObjId) -> Result<(), StoreError>;

    /// Bind a name to an object id, replacing any previous binding.
    fn set_binding(&mut self, name: &str, obj_id: ObjId);

    fn get_binding(&mut self, name: &str) -> Result<ObjId, StoreError>;

    fn remove_binding(&mut self, name: &str) -> Result<(), StoreError>;

    /// The lexically next bound name strictly greater than `prev`, if any.
    /// Prefix scans are `next_bound_name(prefix)` loops that stop when the
    /// result no longer starts with the prefix.
    fn next_bound_name(&mut self, prev: &str) -> Option<String>;

    fn commit(self: Box<Self>) -> CommitResult;

    fn rollback(self: Box<Self>);
}

/// Hands out transactions. Shared across every service on a node, and across
/// nodes in single-process cluster embeddings.
pub trait DataStore: Send + Sync {
    fn begin_transaction(&self) -> Box<dyn StoreTransaction>;
}
