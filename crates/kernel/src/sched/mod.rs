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

//! Intra-node scheduling: per-application queues with pluggable ordering,
//! the system-level fan-out across applications, the fixed consumer pool, and
//! the shared timer everything parks delayed work on.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use meridian_common::{Identity, SchedulerError, TaskError};

mod executor;
mod queue;
mod system;
mod timer;

pub use executor::TaskExecutor;
pub use queue::{FifoQueue, SchedulerQueue, WindowedQueue};
pub use system::SystemScheduler;
pub use timer::{TimerHandle, TimerQueue};

/// Tasks whose start time is within this much of now run immediately rather
/// than taking a trip through the timer.
pub const FUTURE_THRESHOLD: Duration = Duration::from_millis(15);

/// Wall-clock now in epoch milliseconds, the unit persisted start times use.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A unit of executable work as the executor sees it. Durable tasks wrap
/// their transactional execution path in one of these.
pub trait TaskBody: Send + Sync {
    fn name(&self) -> &str {
        "task"
    }
    fn run(&self) -> Result<(), TaskError>;
}

/// [`TaskBody`] from a plain closure, for service-internal work and tests.
pub struct FnTask<F>(pub F);

impl<F> TaskBody for FnTask<F>
where
    F: Fn() -> Result<(), TaskError> + Send + Sync,
{
    fn run(&self) -> Result<(), TaskError> {
        (self.0)()
    }
}

/// One schedulable unit: the body, its owner, when it should start, and the
/// recurrence period if any. Immutable once built except the try count and
/// the lazily-bound recurring state.
pub struct ScheduledTask {
    body: Arc<dyn TaskBody>,
    owner: Identity,
    start_time: u64,
    period: Option<Duration>,
    try_count: AtomicU32,
    recurring: OnceLock<Arc<RecurringState>>,
}

impl ScheduledTask {
    pub fn immediate(body: Arc<dyn TaskBody>, owner: Identity) -> Arc<Self> {
        Self::starting_at(body, owner, now_millis())
    }

    pub fn starting_at(body: Arc<dyn TaskBody>, owner: Identity, start_time: u64) -> Arc<Self> {
        Arc::new(Self {
            body,
            owner,
            start_time,
            period: None,
            try_count: AtomicU32::new(0),
            recurring: OnceLock::new(),
        })
    }

    pub fn recurring(
        body: Arc<dyn TaskBody>,
        owner: Identity,
        start_time: u64,
        period: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            body,
            owner,
            start_time,
            period: Some(period),
            try_count: AtomicU32::new(0),
            recurring: OnceLock::new(),
        })
    }

    pub fn body(&self) -> &Arc<dyn TaskBody> {
        &self.body
    }

    pub fn owner(&self) -> &Identity {
        &self.owner
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    pub fn try_count(&self) -> u32 {
        self.try_count.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_try_count(&self) -> u32 {
        self.try_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn recurring_state(&self) -> Option<&Arc<RecurringState>> {
        self.recurring.get()
    }

    pub(crate) fn bind_recurring(&self, state: Arc<RecurringState>) {
        // First binding wins; a rebind attempt means the task was handed to
        // add_recurring_task twice, which the handle state machine rejects
        // separately.
        let _ = self.recurring.set(state);
    }

    /// The follow-on occurrence of a recurring task, one period after this
    /// one's scheduled start. Shares the recurring state so cancellation
    /// covers the whole chain.
    pub(crate) fn next_recurrence(self: &Arc<Self>) -> Arc<Self> {
        let period = self.period.unwrap_or(Duration::ZERO);
        let next = Arc::new(Self {
            body: self.body.clone(),
            owner: self.owner.clone(),
            start_time: self.start_time + period.as_millis() as u64,
            period: self.period,
            try_count: AtomicU32::new(0),
            recurring: OnceLock::new(),
        });
        if let Some(state) = self.recurring.get() {
            let _ = next.recurring.set(state.clone());
        }
        next
    }
}

/// Shared lifecycle flag for one recurring chain, plus the queue follow-on
/// occurrences go back into.
pub(crate) struct RecurringState {
    started: AtomicBool,
    cancelled: AtomicBool,
    pub(crate) queue: Arc<dyn SchedulerQueue>,
}

impl RecurringState {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Handle for a recurring task: created, then started (occurrences begin),
/// then cancelled. Cancellation stops future occurrences but never preempts
/// an execution already in flight.
#[derive(Clone)]
pub struct RecurringHandle {
    task: Arc<ScheduledTask>,
    state: Arc<RecurringState>,
}

impl RecurringHandle {
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.state.cancelled.load(Ordering::SeqCst) {
            return Err(SchedulerError::RecurringAlreadyCancelled);
        }
        if self
            .state
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::RecurringAlreadyStarted);
        }
        self.state.queue.enqueue(self.task.clone());
        Ok(())
    }

    pub fn cancel(&self) -> Result<(), SchedulerError> {
        if self
            .state
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::RecurringAlreadyCancelled);
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}

enum ReservationState {
    Pending,
    Used,
    Cancelled,
}

/// Two-phase admission token: the scheduler has accepted the task, but it
/// becomes visible to consumers only on [`use_task`]. Each of `use_task` and
/// `cancel` may be called exactly once.
///
/// [`use_task`]: TaskReservation::use_task
pub struct TaskReservation {
    task: Arc<ScheduledTask>,
    queue: Arc<dyn SchedulerQueue>,
    state: ReservationState,
}

impl TaskReservation {
    pub fn use_task(&mut self) -> Result<(), SchedulerError> {
        match self.state {
            ReservationState::Pending => {
                self.state = ReservationState::Used;
                self.queue.enqueue(self.task.clone());
                Ok(())
            }
            ReservationState::Used => Err(SchedulerError::ReservationAlreadyUsed),
            ReservationState::Cancelled => Err(SchedulerError::ReservationAlreadyCancelled),
        }
    }

    pub fn cancel(&mut self) -> Result<(), SchedulerError> {
        match self.state {
            ReservationState::Pending => {
                self.state = ReservationState::Cancelled;
                Ok(())
            }
            ReservationState::Used => Err(SchedulerError::ReservationAlreadyUsed),
            ReservationState::Cancelled => Err(SchedulerError::ReservationAlreadyCancelled),
        }
    }
}

/// The queue one application's tasks go through, fronting whichever ordering
/// strategy the deployment selected.
pub struct ApplicationScheduler {
    queue: Arc<dyn SchedulerQueue>,
}

impl ApplicationScheduler {
    pub fn new(queue: Arc<dyn SchedulerQueue>) -> Arc<Self> {
        Arc::new(Self { queue })
    }

    /// Admit a non-recurring task without making it runnable yet.
    pub fn reserve_task(
        &self,
        task: Arc<ScheduledTask>,
    ) -> Result<TaskReservation, SchedulerError> {
        if task.period().is_some() {
            return Err(SchedulerError::RecurringNotReservable);
        }
        Ok(TaskReservation {
            task,
            queue: self.queue.clone(),
            state: ReservationState::Pending,
        })
    }

    pub fn add_task(&self, task: Arc<ScheduledTask>) {
        self.queue.enqueue(task);
    }

    /// Register a recurring task. Occurrences begin when the returned handle
    /// is started.
    pub fn add_recurring_task(&self, task: Arc<ScheduledTask>) -> RecurringHandle {
        let state = Arc::new(RecurringState {
            started: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            queue: self.queue.clone(),
        });
        task.bind_recurring(state.clone());
        RecurringHandle { task, state }
    }

    pub fn try_next(&self) -> Option<Arc<ScheduledTask>> {
        self.queue.try_next()
    }

    pub fn next_task(&self, wait: Duration) -> Option<Arc<ScheduledTask>> {
        self.queue.next_timeout(wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn noop_task(owner: &str) -> Arc<ScheduledTask> {
        ScheduledTask::immediate(Arc::new(FnTask(|| Ok(()))), Identity::named(owner))
    }

    fn fifo_app() -> Arc<ApplicationScheduler> {
        let timer = TimerQueue::new();
        ApplicationScheduler::new(Arc::new(FifoQueue::new(timer)))
    }

    #[test]
    fn reservation_use_is_call_once() {
        let app = fifo_app();
        let mut res = app.reserve_task(noop_task("fred")).unwrap();
        assert!(app.try_next().is_none());
        res.use_task().unwrap();
        assert!(app.try_next().is_some());
        assert_eq!(res.use_task(), Err(SchedulerError::ReservationAlreadyUsed));
        assert_eq!(res.cancel(), Err(SchedulerError::ReservationAlreadyUsed));
    }

    #[test]
    fn reservation_cancel_discards() {
        let app = fifo_app();
        let mut res = app.reserve_task(noop_task("fred")).unwrap();
        res.cancel().unwrap();
        assert_eq!(
            res.use_task(),
            Err(SchedulerError::ReservationAlreadyCancelled)
        );
        assert_eq!(
            res.cancel(),
            Err(SchedulerError::ReservationAlreadyCancelled)
        );
        assert!(app.try_next().is_none());
    }

    #[test]
    fn recurring_tasks_cannot_be_reserved() {
        let app = fifo_app();
        let task = ScheduledTask::recurring(
            Arc::new(FnTask(|| Ok(()))),
            Identity::named("fred"),
            now_millis(),
            Duration::from_millis(100),
        );
        assert!(matches!(
            app.reserve_task(task),
            Err(SchedulerError::RecurringNotReservable)
        ));
    }

    #[test]
    fn recurring_handle_state_machine() {
        let app = fifo_app();
        let task = ScheduledTask::recurring(
            Arc::new(FnTask(|| Ok(()))),
            Identity::named("fred"),
            now_millis(),
            Duration::from_millis(100),
        );
        let handle = app.add_recurring_task(task);
        assert!(app.try_next().is_none());
        handle.start().unwrap();
        assert!(app.try_next().is_some());
        assert_eq!(handle.start(), Err(SchedulerError::RecurringAlreadyStarted));
        handle.cancel().unwrap();
        assert_eq!(
            handle.cancel(),
            Err(SchedulerError::RecurringAlreadyCancelled)
        );
    }
}
