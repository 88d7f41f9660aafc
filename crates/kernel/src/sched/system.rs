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

//! The system scheduler: consumer threads ask it for the next ready task and
//! it fans the demand out across registered applications per the configured
//! policy.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use minstant::Instant;

use crate::config::{Config, QueuePolicy, SystemPolicy};

use super::{ApplicationScheduler, FifoQueue, ScheduledTask, SchedulerQueue, TimerQueue, WindowedQueue};

/// How long an idle round-robin pass parks before looking again.
const IDLE_PARK: Duration = Duration::from_millis(1);

struct AppEntry {
    name: String,
    scheduler: Arc<ApplicationScheduler>,
    /// Deficit round-robin only: serves remaining this round.
    deficit: usize,
}

struct SysState {
    apps: Vec<AppEntry>,
    cursor: usize,
}

pub struct SystemScheduler {
    policy: SystemPolicy,
    queue_policy: QueuePolicy,
    drr_quantum: usize,
    drr_cap: usize,
    timer: Arc<TimerQueue>,
    state: Mutex<SysState>,
    /// With [`SystemPolicy::SingleQueue`] every application name resolves to
    /// this one scheduler.
    shared: Arc<ApplicationScheduler>,
}

fn make_queue(policy: QueuePolicy, timer: &Arc<TimerQueue>) -> Arc<dyn SchedulerQueue> {
    match policy {
        QueuePolicy::Fifo => Arc::new(FifoQueue::new(timer.clone())),
        QueuePolicy::Windowed => WindowedQueue::new(timer.clone()),
    }
}

impl SystemScheduler {
    pub fn new(config: &Config, timer: Arc<TimerQueue>) -> Arc<Self> {
        let shared = ApplicationScheduler::new(make_queue(config.queue_policy, &timer));
        Arc::new(Self {
            policy: config.system_policy,
            queue_policy: config.queue_policy,
            drr_quantum: config.drr_quantum.max(1),
            drr_cap: config.drr_cap.max(1),
            timer,
            state: Mutex::new(SysState {
                apps: Vec::new(),
                cursor: 0,
            }),
            shared,
        })
    }

    pub fn timer(&self) -> &Arc<TimerQueue> {
        &self.timer
    }

    /// The scheduler for one application, created on first reference.
    pub fn app_scheduler(&self, name: &str) -> Arc<ApplicationScheduler> {
        if self.policy == SystemPolicy::SingleQueue {
            return self.shared.clone();
        }
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.apps.iter().find(|a| a.name == name) {
            return entry.scheduler.clone();
        }
        let scheduler = ApplicationScheduler::new(make_queue(self.queue_policy, &self.timer));
        state.apps.push(AppEntry {
            name: name.to_string(),
            scheduler: scheduler.clone(),
            deficit: 0,
        });
        scheduler
    }

    /// Block up to `wait` for the next ready task anywhere in the system.
    pub fn next_task(&self, wait: Duration) -> Option<Arc<ScheduledTask>> {
        match self.policy {
            SystemPolicy::SingleQueue => self.shared.next_task(wait),
            SystemPolicy::RoundRobin => self.next_round_robin(wait),
            SystemPolicy::DeficitRoundRobin => self.next_drr(wait),
        }
    }

    fn next_round_robin(&self, wait: Duration) -> Option<Arc<ScheduledTask>> {
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                let n = state.apps.len();
                if n > 0 {
                    for i in 0..n {
                        let idx = (state.cursor + i) % n;
                        if let Some(task) = state.apps[idx].scheduler.try_next() {
                            state.cursor = (idx + 1) % n;
                            return Some(task);
                        }
                    }
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(IDLE_PARK);
        }
    }

    fn next_drr(&self, wait: Duration) -> Option<Arc<ScheduledTask>> {
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                let n = state.apps.len();
                // One full sweep: serve the cursor app while it has deficit
                // and work, otherwise zero it and move on.
                if n > 0 {
                    for _ in 0..n {
                        let idx = state.cursor % n;
                        if state.apps[idx].deficit == 0 {
                            state.apps[idx].deficit =
                                (state.apps[idx].deficit + self.drr_quantum).min(self.drr_cap);
                        }
                        if let Some(task) = state.apps[idx].scheduler.try_next() {
                            state.apps[idx].deficit -= 1;
                            if state.apps[idx].deficit == 0 {
                                state.cursor = (idx + 1) % n;
                            }
                            return Some(task);
                        }
                        // Idle app forfeits the rest of its round.
                        state.apps[idx].deficit = 0;
                        state.cursor = (idx + 1) % n;
                    }
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(IDLE_PARK);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{FnTask, ScheduledTask};
    use meridian_common::Identity;
    use pretty_assertions::assert_eq;

    fn task_named(owner: &str) -> Arc<ScheduledTask> {
        ScheduledTask::immediate(Arc::new(FnTask(|| Ok(()))), Identity::named(owner))
    }

    fn config_with(policy: SystemPolicy) -> Config {
        Config {
            system_policy: policy,
            ..Config::default()
        }
    }

    #[test]
    fn single_queue_shares_one_scheduler() {
        let timer = TimerQueue::new();
        let sys = SystemScheduler::new(&config_with(SystemPolicy::SingleQueue), timer.clone());
        let a = sys.app_scheduler("alpha");
        let b = sys.app_scheduler("beta");
        a.add_task(task_named("one"));
        let got = b.try_next().unwrap();
        assert_eq!(got.owner().name(), "one");
        timer.shutdown();
    }

    #[test]
    fn round_robin_alternates_between_apps() {
        let timer = TimerQueue::new();
        let sys = SystemScheduler::new(&config_with(SystemPolicy::RoundRobin), timer.clone());
        let a = sys.app_scheduler("alpha");
        let b = sys.app_scheduler("beta");
        for _ in 0..3 {
            a.add_task(task_named("a"));
            b.add_task(task_named("b"));
        }
        let mut served = Vec::new();
        for _ in 0..6 {
            let task = sys.next_task(Duration::from_millis(100)).unwrap();
            served.push(task.owner().name().to_string());
        }
        assert_eq!(served, vec!["a", "b", "a", "b", "a", "b"]);
        timer.shutdown();
    }

    #[test]
    fn drr_serves_batches_up_to_quantum() {
        let timer = TimerQueue::new();
        let mut config = config_with(SystemPolicy::DeficitRoundRobin);
        config.drr_quantum = 2;
        config.drr_cap = 2;
        let sys = SystemScheduler::new(&config, timer.clone());
        let a = sys.app_scheduler("alpha");
        let b = sys.app_scheduler("beta");
        for _ in 0..4 {
            a.add_task(task_named("a"));
            b.add_task(task_named("b"));
        }
        let mut served = Vec::new();
        for _ in 0..8 {
            let task = sys.next_task(Duration::from_millis(100)).unwrap();
            served.push(task.owner().name().to_string());
        }
        assert_eq!(served, vec!["a", "a", "b", "b", "a", "a", "b", "b"]);
        timer.shutdown();
    }
}
