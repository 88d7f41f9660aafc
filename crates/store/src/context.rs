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

//! Explicit transaction context handed down through every transactional call.
//! Services that need to defer side effects until the outcome is known (e.g.
//! releasing a reservation only on commit) join the context as participants
//! and get called back at commit or abort.

use std::any::Any;
use std::time::Duration;

use minstant::Instant;
use tracing::warn;

use crate::{CommitResult, DataStore, StoreTransaction};

use meridian_common::TaskError;

/// Per-service state riding along with a [`Txn`]. Participants accumulate
/// deferred work during the transaction; exactly one of [`commit`] or
/// [`abort`] is called when the transaction resolves.
///
/// [`commit`]: TxnParticipant::commit
/// [`abort`]: TxnParticipant::abort
pub trait TxnParticipant: Any + Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// The transaction committed; apply deferred side effects.
    fn commit(&mut self);

    /// The transaction aborted. `retryable` is true when the same unit of
    /// work is about to run again (conflict or transient failure).
    fn abort(&mut self, retryable: bool);
}

/// One transaction in flight: the store transaction plus any service
/// participants that joined it. Dropping a `Txn` without resolving it rolls
/// the store transaction back and aborts participants non-retryably.
pub struct Txn {
    tx: Option<Box<dyn StoreTransaction>>,
    participants: Vec<(&'static str, Box<dyn TxnParticipant>)>,
    started: Instant,
}

impl Txn {
    pub fn begin(store: &dyn DataStore) -> Self {
        Self {
            tx: Some(store.begin_transaction()),
            participants: Vec::new(),
            started: Instant::now(),
        }
    }

    /// The underlying store transaction.
    pub fn tx(&mut self) -> &mut dyn StoreTransaction {
        // Only resolution (commit/abort/drop) takes the transaction out, and
        // those all consume self.
        self.tx.as_deref_mut().unwrap()
    }

    /// How long this transaction has been running.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Fetch the `service`'s participant state, creating it with `init` on
    /// first use within this transaction.
    pub fn join<T: TxnParticipant>(
        &mut self,
        service: &'static str,
        init: impl FnOnce() -> T,
    ) -> &mut T {
        let pos = match self.participants.iter().position(|(s, _)| *s == service) {
            Some(pos) => pos,
            None => {
                self.participants.push((service, Box::new(init())));
                self.participants.len() - 1
            }
        };
        let joined = self.participants[pos]
            .1
            .as_any_mut()
            .downcast_mut::<T>();
        // A service name maps to one participant type by construction.
        joined.unwrap()
    }

    /// Commit the store transaction and resolve participants accordingly. On
    /// `ConflictRetry` participants are aborted retryably, since the runner
    /// is about to re-run the unit of work.
    pub fn commit(mut self) -> CommitResult {
        let tx = self.tx.take().unwrap();
        let result = tx.commit();
        match result {
            CommitResult::Success => {
                for (_, participant) in &mut self.participants {
                    participant.commit();
                }
            }
            CommitResult::ConflictRetry => {
                for (_, participant) in &mut self.participants {
                    participant.abort(true);
                }
            }
        }
        self.participants.clear();
        result
    }

    /// Roll the store transaction back and abort participants.
    pub fn abort(mut self, retryable: bool) {
        let tx = self.tx.take().unwrap();
        tx.rollback();
        for (_, participant) in &mut self.participants {
            participant.abort(retryable);
        }
        self.participants.clear();
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            warn!("transaction dropped without commit or abort; rolling back");
            tx.rollback();
            for (_, participant) in &mut self.participants {
                participant.abort(false);
            }
        }
    }
}

/// Runs closures as transactions, retrying on commit conflicts and on
/// retryable task failures. This is the single entry point every service and
/// the executor use to touch the store.
#[derive(Clone)]
pub struct TxnRunner {
    store: std::sync::Arc<dyn DataStore>,
}

impl TxnRunner {
    pub fn new(store: std::sync::Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &std::sync::Arc<dyn DataStore> {
        &self.store
    }

    /// Run `f` in a fresh transaction, committing on `Ok`. Conflicts and
    /// retryable failures re-run `f` from scratch, unbounded; a fatal failure
    /// aborts and propagates.
    pub fn run<R>(
        &self,
        mut f: impl FnMut(&mut Txn) -> Result<R, TaskError>,
    ) -> Result<R, TaskError> {
        loop {
            let mut txn = Txn::begin(self.store.as_ref());
            match f(&mut txn) {
                Ok(result) => match txn.commit() {
                    CommitResult::Success => return Ok(result),
                    CommitResult::ConflictRetry => continue,
                },
                Err(e) if e.is_retryable() => {
                    txn.abort(true);
                    continue;
                }
                Err(e) => {
                    txn.abort(false);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStore;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Recorder {
        committed: Arc<AtomicU32>,
        aborted: Arc<AtomicU32>,
    }

    impl TxnParticipant for Recorder {
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
        fn commit(&mut self) {
            self.committed.fetch_add(1, Ordering::SeqCst);
        }
        fn abort(&mut self, _retryable: bool) {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn participant_commit_fires_once() {
        let store = MemStore::new();
        let committed = Arc::new(AtomicU32::new(0));
        let aborted = Arc::new(AtomicU32::new(0));

        let mut txn = Txn::begin(store.as_ref());
        let c = committed.clone();
        let a = aborted.clone();
        txn.join("test", move || Recorder {
            committed: c,
            aborted: a,
        });
        // Second join for the same service reuses the state.
        txn.join::<Recorder>("test", || unreachable!());
        assert_eq!(txn.commit(), CommitResult::Success);

        assert_eq!(committed.load(Ordering::SeqCst), 1);
        assert_eq!(aborted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropped_txn_aborts_participants() {
        let store = MemStore::new();
        let committed = Arc::new(AtomicU32::new(0));
        let aborted = Arc::new(AtomicU32::new(0));

        let mut txn = Txn::begin(store.as_ref());
        let c = committed.clone();
        let a = aborted.clone();
        txn.join("test", move || Recorder {
            committed: c,
            aborted: a,
        });
        drop(txn);

        assert_eq!(committed.load(Ordering::SeqCst), 0);
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn runner_retries_on_conflict() {
        let store = MemStore::new();
        let runner = TxnRunner::new(store.clone());

        let id = runner
            .run(|txn| {
                let id = txn.tx().create(Arc::new(0u64));
                txn.tx().set_binding("t.counter", id);
                Ok(id)
            })
            .unwrap();

        // Force one conflict: read the object, then commit a competing write
        // behind the runner's back before it commits.
        let attempts = AtomicU32::new(0);
        runner
            .run(|txn| {
                txn.tx().update(id, Arc::new(7u64)).map_err(|e| {
                    TaskError::fatal(e.to_string())
                })?;
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    let mut interloper = store.begin_transaction();
                    interloper.update(id, Arc::new(99u64)).unwrap();
                    assert_eq!(interloper.commit(), CommitResult::Success);
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn runner_propagates_fatal() {
        let store = MemStore::new();
        let runner = TxnRunner::new(store);
        let result: Result<(), _> = runner.run(|_| Err(TaskError::fatal("boom")));
        assert_eq!(result, Err(TaskError::Fatal("boom".to_string())));
    }
}
