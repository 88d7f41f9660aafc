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

//! One shared deadline queue for the whole node: delayed task injection,
//! status-vote debounce, recurring first fires. A single dispatcher thread
//! services a monotonic-deadline binary heap; handles are cancellation flags
//! checked when the deadline comes due.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use minstant::Instant;
use tracing::debug;

pub struct TimerQueue {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

struct TimerState {
    heap: BinaryHeap<Entry>,
    seq: u64,
    shutdown: bool,
}

struct Entry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    callback: Box<dyn FnOnce() + Send>,
}

// Min-heap on deadline, FIFO within a deadline.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}

/// Cancellation handle for one scheduled deadline. Cancelling after the
/// callback has fired is a no-op.
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl TimerQueue {
    pub fn new() -> Arc<Self> {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                seq: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });
        let dispatch = inner.clone();
        thread::Builder::new()
            .name("timer-dispatch".to_string())
            .spawn(move || dispatch_loop(dispatch))
            .ok();
        Arc::new(Self { inner })
    }

    /// Run `callback` at `deadline` unless the handle is cancelled first.
    pub fn schedule(
        &self,
        deadline: Instant,
        callback: Box<dyn FnOnce() + Send>,
    ) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.inner.state.lock().unwrap();
            state.seq += 1;
            let seq = state.seq;
            state.heap.push(Entry {
                deadline,
                seq,
                cancelled: cancelled.clone(),
                callback,
            });
        }
        self.inner.wakeup.notify_one();
        TimerHandle { cancelled }
    }

    /// Convenience for "in `delay` from now."
    pub fn schedule_after(
        &self,
        delay: Duration,
        callback: Box<dyn FnOnce() + Send>,
    ) -> TimerHandle {
        self.schedule(Instant::now() + delay, callback)
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
            state.heap.clear();
        }
        self.inner.wakeup.notify_all();
    }
}

fn dispatch_loop(inner: Arc<TimerInner>) {
    loop {
        let due = {
            let mut state = inner.state.lock().unwrap();
            loop {
                if state.shutdown {
                    debug!("timer dispatcher shutting down");
                    return;
                }
                let now = Instant::now();
                match state.heap.peek() {
                    Some(head) if head.deadline <= now => break state.heap.pop(),
                    Some(head) => {
                        let wait = head.deadline.duration_since(now);
                        state = inner.wakeup.wait_timeout(state, wait).unwrap().0;
                    }
                    None => {
                        state = inner.wakeup.wait(state).unwrap();
                    }
                }
            }
        };
        // Fire outside the lock so callbacks can schedule more deadlines.
        if let Some(entry) = due
            && !entry.cancelled.load(Ordering::SeqCst)
        {
            (entry.callback)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_in_deadline_order() {
        let timer = TimerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        timer.schedule_after(
            Duration::from_millis(60),
            Box::new(move || o2.lock().unwrap().push(2)),
        );
        timer.schedule_after(
            Duration::from_millis(20),
            Box::new(move || o1.lock().unwrap().push(1)),
        );
        thread::sleep(Duration::from_millis(150));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        timer.shutdown();
    }

    #[test]
    fn cancelled_handle_never_fires() {
        let timer = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let handle = timer.schedule_after(
            Duration::from_millis(30),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.cancel();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.shutdown();
    }
}
