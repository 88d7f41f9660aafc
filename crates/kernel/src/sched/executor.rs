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

//! The fixed consumer pool. Each worker loops pulling the next ready task
//! from the system scheduler, executes it with retry-in-place, and submits
//! the follow-on occurrence of recurring work.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use meridian_common::TaskError;

use super::{ScheduledTask, SystemScheduler};

/// How long a worker blocks on the scheduler before rechecking shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct TaskExecutor {
    scheduler: Arc<SystemScheduler>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl TaskExecutor {
    pub fn start(scheduler: Arc<SystemScheduler>, threads: usize) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let workers = (0..threads.max(1))
            .filter_map(|i| {
                let scheduler = scheduler.clone();
                let shutdown = shutdown.clone();
                thread::Builder::new()
                    .name(format!("task-worker-{i}"))
                    .spawn(move || worker_loop(scheduler, shutdown))
                    .ok()
            })
            .collect();
        Self {
            scheduler,
            workers,
            shutdown,
        }
    }

    pub fn scheduler(&self) -> &Arc<SystemScheduler> {
        &self.scheduler
    }

    /// Stop accepting work and join the workers. In-flight tasks finish.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(scheduler: Arc<SystemScheduler>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        let Some(task) = scheduler.next_task(POLL_INTERVAL) else {
            continue;
        };
        // A recurrence cancelled while parked just evaporates.
        if let Some(state) = task.recurring_state()
            && state.is_cancelled()
        {
            continue;
        }
        if let Err(e) = run_with_retry(&task) {
            warn!(task = task.body().name(), error = %e, "task failed; dropping");
        }
        // Success or not, a recurring task's next occurrence is submitted
        // relative to the original schedule; one failed occurrence is
        // skipped, not the chain.
        if let Some(state) = task.recurring_state()
            && !state.is_cancelled()
        {
            state.queue.enqueue(task.next_recurrence());
        }
    }
}

/// Execute until success or a non-retryable failure. Retryable failures
/// repeat in place, unbounded, no backoff, no re-enqueue.
fn run_with_retry(task: &Arc<ScheduledTask>) -> Result<(), TaskError> {
    loop {
        match task.body().run() {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => {
                let tries = task.bump_try_count();
                debug!(task = task.body().name(), tries, "retrying task in place");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sched::{FnTask, TimerQueue, now_millis};
    use meridian_common::Identity;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn harness() -> (Arc<TimerQueue>, Arc<SystemScheduler>, TaskExecutor) {
        let timer = TimerQueue::new();
        let scheduler = SystemScheduler::new(&Config::default(), timer.clone());
        let executor = TaskExecutor::start(scheduler.clone(), 2);
        (timer, scheduler, executor)
    }

    #[test]
    fn retryable_failures_rerun_in_place() {
        let (timer, scheduler, executor) = harness();
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        let app = scheduler.app_scheduler("app");
        app.add_task(ScheduledTask::immediate(
            Arc::new(FnTask(move || {
                if a.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TaskError::retryable("not yet"))
                } else {
                    Ok(())
                }
            })),
            Identity::named("fred"),
        ));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        executor.shutdown();
        timer.shutdown();
    }

    #[test]
    fn recurring_cadence_follows_original_schedule() {
        let (timer, scheduler, executor) = harness();
        let starts = Arc::new(Mutex::new(Vec::new()));
        let s = starts.clone();
        let app = scheduler.app_scheduler("app");
        let task = ScheduledTask::recurring(
            Arc::new(FnTask(move || {
                s.lock().unwrap().push(now_millis());
                Ok(())
            })),
            Identity::named("fred"),
            now_millis(),
            Duration::from_millis(100),
        );
        let handle = app.add_recurring_task(task);
        handle.start().unwrap();
        thread::sleep(Duration::from_millis(350));
        handle.cancel().unwrap();
        let seen = starts.lock().unwrap().len();
        assert!((3..=4).contains(&seen), "saw {seen} occurrences");
        thread::sleep(Duration::from_millis(250));
        assert_eq!(starts.lock().unwrap().len(), seen, "ran after cancel");
        executor.shutdown();
        timer.shutdown();
    }

    #[test]
    fn fatal_failure_skips_one_recurrence_only() {
        let (timer, scheduler, executor) = harness();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let app = scheduler.app_scheduler("app");
        let task = ScheduledTask::recurring(
            Arc::new(FnTask(move || {
                let n = r.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(TaskError::fatal("first occurrence dies"))
                } else {
                    Ok(())
                }
            })),
            Identity::named("fred"),
            now_millis(),
            Duration::from_millis(80),
        );
        let handle = app.add_recurring_task(task);
        handle.start().unwrap();
        thread::sleep(Duration::from_millis(300));
        handle.cancel().unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 3);
        executor.shutdown();
        timer.shutdown();
    }
}
