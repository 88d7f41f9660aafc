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

use std::sync::atomic::{AtomicUsize, Ordering};

use meridian_common::{Identity, NodeId};

/// Picks the node a (re)assigned identity should land on. `live` is the
/// current live-node set in ascending id order; `current` is the node the
/// identity is leaving, if any.
pub trait NodeAssignPolicy: Send + Sync {
    fn choose_node(
        &self,
        identity: &Identity,
        live: &[NodeId],
        current: Option<NodeId>,
    ) -> Option<NodeId>;
}

/// Plain rotation over the live set. `exclude_current` additionally skips a
/// still-live current node when rebalancing; off by default since moving a
/// live mapping churns that node's caches.
pub struct RoundRobinPolicy {
    next: AtomicUsize,
    exclude_current: bool,
}

impl RoundRobinPolicy {
    pub fn new(exclude_current: bool) -> Self {
        Self {
            next: AtomicUsize::new(0),
            exclude_current,
        }
    }
}

impl NodeAssignPolicy for RoundRobinPolicy {
    fn choose_node(
        &self,
        _identity: &Identity,
        live: &[NodeId],
        current: Option<NodeId>,
    ) -> Option<NodeId> {
        let candidates: Vec<NodeId> = if self.exclude_current {
            live.iter()
                .copied()
                .filter(|n| Some(*n) != current)
                .collect()
        } else {
            live.to_vec()
        };
        if candidates.is_empty() {
            return None;
        }
        let turn = self.next.fetch_add(1, Ordering::Relaxed);
        Some(candidates[turn % candidates.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rotates_over_live_nodes() {
        let policy = RoundRobinPolicy::new(false);
        let id = Identity::named("fred");
        let live = [1, 2, 3];
        let picks: Vec<_> = (0..6)
            .map(|_| policy.choose_node(&id, &live, None).unwrap())
            .collect();
        assert_eq!(picks, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn exclude_current_skips_the_leaving_node() {
        let policy = RoundRobinPolicy::new(true);
        let id = Identity::named("fred");
        for _ in 0..5 {
            let pick = policy.choose_node(&id, &[1, 2], Some(1)).unwrap();
            assert_eq!(pick, 2);
        }
        assert_eq!(policy.choose_node(&id, &[1], Some(1)), None);
    }

    #[test]
    fn empty_live_set_yields_none() {
        let policy = RoundRobinPolicy::new(false);
        assert_eq!(policy.choose_node(&Identity::named("x"), &[], None), None);
    }
}
