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

//! Kernel tunables. Policies are typed enums selected here at startup rather
//! than loaded by name; how the struct gets populated (file, flags) is the
//! embedder's business.

use std::time::Duration;

use strum::{Display, EnumString};

/// Per-application queue ordering strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum QueuePolicy {
    /// Single unbounded queue; delayed work parks on the shared timer.
    Fifo,
    /// Windowed fairness: owners take turns window by window, no owner gets
    /// seconds until everyone waiting has had firsts.
    Windowed,
}

/// How the system scheduler fans consumer demand out across applications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum SystemPolicy {
    /// All applications share one queue.
    SingleQueue,
    /// Strict alternation across applications, brief park when all idle.
    RoundRobin,
    /// Deficit round-robin: per-round quantum with capped carry-over.
    DeficitRoundRobin,
}

/// Node-assignment strategy for the mapping server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum AssignPolicy {
    RoundRobin,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Fixed consumer thread count for the task executor.
    pub worker_threads: usize,
    /// Grace delay after `ready()` before the first hand-off scan.
    pub handoff_start: Duration,
    /// Period of the hand-off set scan thereafter.
    pub handoff_period: Duration,
    /// Debounce delay between an identity's active/inactive flip and the vote
    /// actually reaching the mapping service.
    pub vote_delay: Duration,
    /// How long an identity must sit on the removal-candidate queue, with no
    /// status bindings, before the sweep deletes its mapping.
    pub remove_expire: Duration,
    /// Elapsed-transaction-time threshold for `should_continue`.
    pub continue_threshold: Duration,
    pub queue_policy: QueuePolicy,
    pub system_policy: SystemPolicy,
    pub assign_policy: AssignPolicy,
    /// Whether rebalancing assignment may move an identity off a still-live
    /// node. Off by default; moving live mappings churns caches for no
    /// measured gain.
    pub assign_exclude_current: bool,
    /// Deficit round-robin: tasks granted to each application per round.
    pub drr_quantum: usize,
    /// Deficit round-robin: cap on carried-over quota.
    pub drr_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            handoff_start: Duration::from_millis(2500),
            handoff_period: Duration::from_millis(500),
            vote_delay: Duration::from_millis(5000),
            remove_expire: Duration::from_millis(5000),
            continue_threshold: Duration::from_millis(10),
            queue_policy: QueuePolicy::Fifo,
            system_policy: SystemPolicy::SingleQueue,
            assign_policy: AssignPolicy::RoundRobin,
            assign_exclude_current: false,
            drr_quantum: 4,
            drr_cap: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn policies_parse_from_kebab_case() {
        assert_eq!(QueuePolicy::from_str("windowed"), Ok(QueuePolicy::Windowed));
        assert_eq!(
            SystemPolicy::from_str("deficit-round-robin"),
            Ok(SystemPolicy::DeficitRoundRobin)
        );
        assert_eq!(AssignPolicy::RoundRobin.to_string(), "round-robin");
    }
}
