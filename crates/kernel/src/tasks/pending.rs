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

//! The durable record behind every persisted task, and the payload it
//! carries.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use meridian_common::{Identity, NodeId, TaskError};
use meridian_store::{ObjId, Txn};

/// Application work persisted by the task service. Implementations are the
/// transactional task bodies; the context handed to `run` is the transaction
/// the execution commits under.
pub trait DurableTask: Send + Sync {
    /// Human-readable task type, recorded on the durable record.
    fn name(&self) -> &str {
        "durable-task"
    }

    /// Request execution under a freshly minted identity instead of the
    /// submitting owner. Periodic tasks keep the minted identity for every
    /// occurrence.
    fn new_identity(&self) -> bool {
        false
    }

    fn run(&self, txn: &mut Txn) -> Result<(), TaskError>;
}

/// What a pending record points at: either the task value itself, or an
/// object the application manages (and may delete) on its own.
#[derive(Clone)]
pub enum TaskPayload {
    Inline(Arc<dyn DurableTask>),
    External(ObjId),
}

impl fmt::Debug for TaskPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPayload::Inline(task) => write!(f, "Inline({})", task.name()),
            TaskPayload::External(obj) => write!(f, "External({obj})"),
        }
    }
}

/// One durable task slot. Either active (fully populated) or reusable (a
/// cleared free slot waiting in the owner's pool); never in between.
#[derive(Clone, Debug)]
pub struct PendingTask {
    payload: Option<TaskPayload>,
    owner: Option<Identity>,
    task_type: String,
    start_time: u64,
    period: Option<u64>,
    last_start: Option<u64>,
    running_node: Option<NodeId>,
    reusable: bool,
}

impl PendingTask {
    pub fn active(
        payload: TaskPayload,
        owner: Identity,
        task_type: String,
        start_time: u64,
        period: Option<u64>,
    ) -> Self {
        Self {
            payload: Some(payload),
            owner: Some(owner),
            task_type,
            start_time,
            period,
            last_start: None,
            running_node: None,
            reusable: false,
        }
    }

    /// A free slot: all fields cleared, available for reuse.
    pub fn cleared() -> Self {
        Self {
            payload: None,
            owner: None,
            task_type: String::new(),
            start_time: 0,
            period: None,
            last_start: None,
            running_node: None,
            reusable: true,
        }
    }

    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    pub fn payload(&self) -> Option<&TaskPayload> {
        self.payload.as_ref()
    }

    pub fn owner(&self) -> Option<&Identity> {
        self.owner.as_ref()
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Recurrence period in milliseconds; `None` for one-shot tasks.
    pub fn period(&self) -> Option<u64> {
        self.period
    }

    pub fn last_start(&self) -> Option<u64> {
        self.last_start
    }

    /// Meaningful only for periodic tasks: the node that currently owns this
    /// recurrence chain. Guards duplicate execution across hand-off races.
    pub fn running_node(&self) -> Option<NodeId> {
        self.running_node
    }

    pub fn with_last_start(&self, at: u64) -> Self {
        let mut next = self.clone();
        next.last_start = Some(at);
        next
    }

    pub fn with_running_node(&self, node: Option<NodeId>) -> Self {
        let mut next = self.clone();
        next.running_node = node;
        next
    }
}

/// Per-destination-node set of pending-task binding names awaiting pickup.
#[derive(Clone, Debug, Default)]
pub(crate) struct HandoffSet(pub(crate) BTreeSet<String>);

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Nop;
    impl DurableTask for Nop {
        fn run(&self, _txn: &mut Txn) -> Result<(), TaskError> {
            Ok(())
        }
    }

    #[test]
    fn record_is_active_or_reusable_never_both() {
        let record = PendingTask::active(
            TaskPayload::Inline(Arc::new(Nop)),
            Identity::named("fred"),
            "nop".to_string(),
            1000,
            Some(50),
        );
        assert!(!record.is_reusable());
        assert!(record.payload().is_some());

        let cleared = PendingTask::cleared();
        assert!(cleared.is_reusable());
        assert!(cleared.payload().is_none());
        assert!(cleared.owner().is_none());
        assert_eq!(cleared.period(), None);
    }
}
