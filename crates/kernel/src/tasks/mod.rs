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

//! The durable layer: persisted pending tasks, the transactional task
//! service, cross-node hand-off, and identity status voting.

use meridian_common::{Identity, NodeId};
use meridian_store::ObjId;

mod continue_policy;
mod pending;
mod service;

pub use continue_policy::{ContinuePolicy, FixedTimeContinuePolicy};
pub use pending::{DurableTask, PendingTask, TaskPayload};
pub use service::{
    PeriodicTaskHandle, TASK_SERVICE, TaskMappingListener, TaskRecoveryListener, TaskService,
};

/// Durable namespace key for one pending record. Object ids are zero-padded
/// so lexical prefix scans walk records in allocation order.
pub(crate) fn pending_key(identity: &Identity, obj_id: ObjId) -> String {
    format!("task.pending.{}.{:020}", identity.name(), obj_id)
}

pub(crate) fn pending_prefix(identity: &Identity) -> String {
    format!("task.pending.{}.", identity.name())
}

/// Owner identity recovered from a pending-record binding name.
pub(crate) fn pending_owner(name: &str) -> Option<Identity> {
    let rest = name.strip_prefix("task.pending.")?;
    let (owner, _) = rest.rsplit_once('.')?;
    Some(Identity::named(owner))
}

/// Binding of one node's hand-off set.
pub(crate) fn handoff_key(node: NodeId) -> String {
    format!("task.handoff.{node}")
}
