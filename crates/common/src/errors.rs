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

use thiserror::Error;

use crate::{Identity, NodeId};

/// Raised by task bodies. The executor re-runs retryable failures in place,
/// unbounded and without backoff; fatal failures are logged and the task is
/// dropped (a recurring task skips that single recurrence).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("transient task failure: {0}")]
    Retryable(String),
    #[error("task failed: {0}")]
    Fatal(String),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Retryable(_))
    }

    pub fn retryable(msg: impl Into<String>) -> Self {
        TaskError::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        TaskError::Fatal(msg.into())
    }
}

/// Errors out of the reservation/recurring/queueing layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// The scheduler could not admit the task (capacity); for non-recurring
    /// durable tasks this propagates to the caller.
    #[error("task rejected by scheduler")]
    TaskRejected,
    #[error("reservation has already been used")]
    ReservationAlreadyUsed,
    #[error("reservation has already been cancelled")]
    ReservationAlreadyCancelled,
    /// Reservations are an at-most-once enqueue primitive; recurring tasks
    /// must go through a recurring handle instead.
    #[error("recurring tasks cannot be reserved")]
    RecurringNotReservable,
    #[error("recurring handle has already been started")]
    RecurringAlreadyStarted,
    #[error("recurring handle has already been cancelled")]
    RecurringAlreadyCancelled,
    #[error("service is shut down")]
    ShuttingDown,
}

/// Errors out of the node-mapping layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("unknown identity: {0}")]
    UnknownIdentity(Identity),
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),
    #[error("no live nodes available for assignment")]
    NoNodesAvailable,
    /// Communication failure talking to the mapping server. Soft: callers log
    /// and fall back, they never fail a transaction over this.
    #[error("mapping server unreachable: {0}")]
    Rpc(String),
}
