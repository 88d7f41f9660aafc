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

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::{Arc, Mutex};

use ahash::AHasher;
use tracing::info;

/// Identifier for one cluster node.
pub type NodeId = u64;

/// A point-in-time view of one cluster member.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub alive: bool,
}

impl Node {
    pub fn is_alive(&self) -> bool {
        self.alive
    }
}

/// Callback invoked once when a node is declared failed.
pub trait NodeFailureListener: Send + Sync {
    fn node_failed(&self, node: Node);
}

/// The liveness registry the services consult. In a full deployment this is
/// fed by an external watchdog; tests and single-process embeddings drive it
/// directly via [`NodeDirectory::note_failed`].
pub struct NodeDirectory {
    inner: Mutex<DirectoryInner>,
}

struct DirectoryInner {
    nodes: HashMap<NodeId, bool, BuildHasherDefault<AHasher>>,
    listeners: Vec<Arc<dyn NodeFailureListener>>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DirectoryInner {
                nodes: HashMap::default(),
                listeners: Vec::new(),
            }),
        }
    }

    /// Record a node as a live cluster member.
    pub fn register(&self, node_id: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.nodes.insert(node_id, true);
    }

    pub fn get_node(&self, node_id: NodeId) -> Option<Node> {
        let inner = self.inner.lock().unwrap();
        inner.nodes.get(&node_id).map(|alive| Node {
            id: node_id,
            alive: *alive,
        })
    }

    pub fn is_alive(&self, node_id: NodeId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.nodes.get(&node_id).copied().unwrap_or(false)
    }

    pub fn live_nodes(&self) -> Vec<NodeId> {
        let inner = self.inner.lock().unwrap();
        let mut live: Vec<_> = inner
            .nodes
            .iter()
            .filter_map(|(id, alive)| alive.then_some(*id))
            .collect();
        live.sort_unstable();
        live
    }

    pub fn add_failure_listener(&self, listener: Arc<dyn NodeFailureListener>) {
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.push(listener);
    }

    /// Declare a node dead. Listeners fire exactly once per failure, outside
    /// the directory lock; a second call for the same node is a no-op.
    pub fn note_failed(&self, node_id: NodeId) {
        let listeners = {
            let mut inner = self.inner.lock().unwrap();
            match inner.nodes.get_mut(&node_id) {
                Some(alive) if *alive => {
                    *alive = false;
                    inner.listeners.clone()
                }
                _ => return,
            }
        };
        info!(node_id, "node declared failed");
        let node = Node {
            id: node_id,
            alive: false,
        };
        for listener in listeners {
            listener.node_failed(node);
        }
    }
}

impl Default for NodeDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);
    impl NodeFailureListener for Counter {
        fn node_failed(&self, _node: Node) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn failure_fires_listeners_once() {
        let dir = NodeDirectory::new();
        dir.register(1);
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        dir.add_failure_listener(counter.clone());

        dir.note_failed(1);
        dir.note_failed(1);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(!dir.is_alive(1));
    }

    #[test]
    fn live_nodes_excludes_failed() {
        let dir = NodeDirectory::new();
        dir.register(1);
        dir.register(2);
        dir.register(3);
        dir.note_failed(2);
        assert_eq!(dir.live_nodes(), vec![1, 3]);
    }
}
