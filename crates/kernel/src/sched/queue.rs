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

//! Queue ordering strategies behind [`ApplicationScheduler`]. Both park
//! not-yet-due tasks on the shared timer and only hold ready work.
//!
//! [`ApplicationScheduler`]: super::ApplicationScheduler

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::BuildHasherDefault;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use ahash::AHasher;
use minstant::Instant;

use meridian_common::Identity;

use super::{FUTURE_THRESHOLD, ScheduledTask, TimerQueue, now_millis};

/// Strategy seam between an application scheduler and its backing store of
/// ready tasks. `enqueue` honors the task's start time; consumers only ever
/// see due work.
pub trait SchedulerQueue: Send + Sync {
    fn enqueue(&self, task: Arc<ScheduledTask>);
    fn try_next(&self) -> Option<Arc<ScheduledTask>>;
    fn next_timeout(&self, wait: Duration) -> Option<Arc<ScheduledTask>>;
}

/// True if the task's start time is far enough out to be worth a timer trip.
fn delay_of(task: &ScheduledTask) -> Option<Duration> {
    let now = now_millis();
    let threshold = FUTURE_THRESHOLD.as_millis() as u64;
    if task.start_time() > now + threshold {
        Some(Duration::from_millis(task.start_time() - now))
    } else {
        None
    }
}

/// Single unbounded FIFO.
pub struct FifoQueue {
    ready_tx: flume::Sender<Arc<ScheduledTask>>,
    ready_rx: flume::Receiver<Arc<ScheduledTask>>,
    timer: Arc<TimerQueue>,
}

impl FifoQueue {
    pub fn new(timer: Arc<TimerQueue>) -> Self {
        let (ready_tx, ready_rx) = flume::unbounded();
        Self {
            ready_tx,
            ready_rx,
            timer,
        }
    }
}

impl SchedulerQueue for FifoQueue {
    fn enqueue(&self, task: Arc<ScheduledTask>) {
        match delay_of(&task) {
            Some(delay) => {
                let tx = self.ready_tx.clone();
                self.timer.schedule_after(
                    delay,
                    Box::new(move || {
                        let _ = tx.send(task);
                    }),
                );
            }
            None => {
                let _ = self.ready_tx.send(task);
            }
        }
    }

    fn try_next(&self) -> Option<Arc<ScheduledTask>> {
        self.ready_rx.try_recv().ok()
    }

    fn next_timeout(&self, wait: Duration) -> Option<Arc<ScheduledTask>> {
        self.ready_rx.recv_timeout(wait).ok()
    }
}

struct WindowEntry {
    window: u64,
    seq: u64,
    task: Arc<ScheduledTask>,
}

// Min-heap on (window, arrival).
impl Ord for WindowEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .window
            .cmp(&self.window)
            .then(other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for WindowEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for WindowEntry {
    fn eq(&self, other: &Self) -> bool {
        self.window == other.window && self.seq == other.seq
    }
}
impl Eq for WindowEntry {}

struct WindowState {
    heap: BinaryHeap<WindowEntry>,
    counters: HashMap<Identity, u64, BuildHasherDefault<AHasher>>,
    current_window: u64,
    seq: u64,
}

/// Windowed fairness: each owner's task is stamped with
/// `max(current_window, owner_counter) + 1`, and the heap serves (window,
/// arrival) order. An owner submitting a burst spreads it across future
/// windows; nobody gets seconds in window K until everyone waiting has had
/// firsts.
pub struct WindowedQueue {
    state: Mutex<WindowState>,
    ready: Condvar,
    timer_self: Mutex<Weak<WindowedQueue>>,
    timer: Arc<TimerQueue>,
}

impl WindowedQueue {
    pub fn new(timer: Arc<TimerQueue>) -> Arc<Self> {
        let queue = Arc::new(Self {
            state: Mutex::new(WindowState {
                heap: BinaryHeap::new(),
                counters: HashMap::default(),
                current_window: 0,
                seq: 0,
            }),
            ready: Condvar::new(),
            timer_self: Mutex::new(Weak::new()),
            timer,
        });
        // Timer callbacks need a way back into the queue.
        *queue.timer_self.lock().unwrap() = Arc::downgrade(&queue);
        queue
    }

    fn inject(&self, task: Arc<ScheduledTask>) {
        {
            let mut state = self.state.lock().unwrap();
            let counter = state
                .counters
                .get(task.owner())
                .copied()
                .unwrap_or(0)
                .max(state.current_window);
            let window = counter + 1;
            state.counters.insert(task.owner().clone(), window);
            state.seq += 1;
            let seq = state.seq;
            state.heap.push(WindowEntry { window, seq, task });
        }
        self.ready.notify_one();
    }

    fn pop(state: &mut WindowState) -> Option<Arc<ScheduledTask>> {
        let entry = state.heap.pop()?;
        state.current_window = entry.window;
        Some(entry.task)
    }
}

impl SchedulerQueue for WindowedQueue {
    fn enqueue(&self, task: Arc<ScheduledTask>) {
        match delay_of(&task) {
            Some(delay) => {
                let this = self.timer_self.lock().unwrap().clone();
                self.timer.schedule_after(
                    delay,
                    Box::new(move || {
                        if let Some(queue) = this.upgrade() {
                            queue.inject(task);
                        }
                    }),
                );
            }
            None => self.inject(task),
        }
    }

    fn try_next(&self) -> Option<Arc<ScheduledTask>> {
        let mut state = self.state.lock().unwrap();
        Self::pop(&mut state)
    }

    fn next_timeout(&self, wait: Duration) -> Option<Arc<ScheduledTask>> {
        let deadline = Instant::now() + wait;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(task) = Self::pop(&mut state) {
                return Some(task);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, timeout) = self
                .ready
                .wait_timeout(state, deadline.duration_since(now))
                .unwrap();
            state = next;
            if timeout.timed_out() {
                return Self::pop(&mut state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::FnTask;
    use pretty_assertions::assert_eq;

    fn task_for(owner: &str) -> Arc<ScheduledTask> {
        ScheduledTask::immediate(Arc::new(FnTask(|| Ok(()))), Identity::named(owner))
    }

    #[test]
    fn fifo_preserves_submission_order() {
        let timer = TimerQueue::new();
        let queue = FifoQueue::new(timer.clone());
        for owner in ["a", "b", "c"] {
            queue.enqueue(task_for(owner));
        }
        let drained: Vec<_> = std::iter::from_fn(|| queue.try_next())
            .map(|t| t.owner().name().to_string())
            .collect();
        assert_eq!(drained, vec!["a", "b", "c"]);
        timer.shutdown();
    }

    #[test]
    fn fifo_parks_delayed_tasks_until_due() {
        let timer = TimerQueue::new();
        let queue = FifoQueue::new(timer.clone());
        let task = ScheduledTask::starting_at(
            Arc::new(FnTask(|| Ok(()))),
            Identity::named("later"),
            now_millis() + 50,
        );
        queue.enqueue(task);
        assert!(queue.try_next().is_none());
        let got = queue.next_timeout(Duration::from_millis(500));
        assert!(got.is_some());
        timer.shutdown();
    }

    #[test]
    fn windowed_interleaves_a_burst_with_other_owners() {
        let timer = TimerQueue::new();
        let queue = WindowedQueue::new(timer.clone());
        // Owner "hog" bursts 3 tasks, then "meek" submits one. The meek task
        // lands in window 1 and must run before the hog's second task.
        for _ in 0..3 {
            queue.enqueue(task_for("hog"));
        }
        queue.enqueue(task_for("meek"));
        let drained: Vec<_> = std::iter::from_fn(|| queue.try_next())
            .map(|t| t.owner().name().to_string())
            .collect();
        assert_eq!(drained, vec!["hog", "meek", "hog", "hog"]);
        timer.shutdown();
    }

    #[test]
    fn windowed_no_owner_runs_ahead_by_more_than_one_window() {
        let timer = TimerQueue::new();
        let queue = WindowedQueue::new(timer.clone());
        let owners = ["a", "b", "c"];
        for _round in 0..4 {
            for owner in owners {
                queue.enqueue(task_for(owner));
            }
        }
        // Count of executions per owner may never differ by more than one at
        // any point in the drain order.
        let mut counts: HashMap<String, usize> = HashMap::new();
        while let Some(task) = queue.try_next() {
            *counts.entry(task.owner().name().to_string()).or_insert(0) += 1;
            let max = counts.values().max().copied().unwrap_or(0);
            let min = owners
                .iter()
                .map(|o| counts.get(*o).copied().unwrap_or(0))
                .min()
                .unwrap_or(0);
            assert!(max - min <= 1, "unfair drain: {counts:?}");
        }
        timer.shutdown();
    }
}
