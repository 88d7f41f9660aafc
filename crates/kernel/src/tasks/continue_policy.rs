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

use std::time::Duration;

use meridian_store::Txn;

/// Cooperative yield control for long incremental tasks: the task asks
/// whether to keep going in this transaction or reschedule the remainder.
/// Advisory only, nothing preempts.
pub trait ContinuePolicy: Send + Sync {
    fn should_continue(&self, txn: &Txn) -> bool;
}

/// Keep going while the transaction is younger than a fixed threshold.
pub struct FixedTimeContinuePolicy {
    threshold: Duration,
}

impl FixedTimeContinuePolicy {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }
}

impl ContinuePolicy for FixedTimeContinuePolicy {
    fn should_continue(&self, txn: &Txn) -> bool {
        txn.elapsed() < self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_store::{DataStore, MemStore};
    use std::thread;

    #[test]
    fn continues_until_threshold_elapses() {
        let store = MemStore::new();
        let policy = FixedTimeContinuePolicy::new(Duration::from_millis(40));
        let txn = Txn::begin(store.as_ref() as &dyn DataStore);
        assert!(policy.should_continue(&txn));
        thread::sleep(Duration::from_millis(60));
        assert!(!policy.should_continue(&txn));
        txn.abort(false);
    }
}
