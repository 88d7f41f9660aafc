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

//! The cluster-wide mapping authority. Owns assignment, node-failure
//! remapping, and the delayed removal sweep for idle identities.

use std::collections::{HashMap, VecDeque};
use std::hash::BuildHasherDefault;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ahash::AHasher;
use minstant::Instant;
use tracing::{debug, info, warn};

use meridian_common::{
    Identity, MappingError, Node, NodeDirectory, NodeFailureListener, NodeId, TaskError,
};
use meridian_store::{DataStore, ObjId, StoreError, Txn, TxnRunner, downcast};

use crate::util::{scan_prefix, store_fatal};

use super::{
    IdentityMO, MappingServerRpc, NodeAssignPolicy, NotifyClient, idmap_key, node_key,
    node_prefix, status_key, status_node_prefix, status_prefix,
};

pub struct NodeMappingServer {
    runner: TxnRunner,
    directory: Arc<NodeDirectory>,
    policy: Box<dyn NodeAssignPolicy>,
    clients: Mutex<HashMap<NodeId, Arc<dyn NotifyClient>, BuildHasherDefault<AHasher>>>,
    remove: RemoveQueue,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

struct RemoveQueue {
    state: Mutex<RemoveState>,
    wake: Condvar,
    expire: Duration,
}

struct RemoveState {
    queue: VecDeque<(Identity, Instant)>,
    shutdown: bool,
}

enum AssignOutcome {
    Existing(NodeId),
    Moved {
        old: Option<NodeId>,
        new: NodeId,
        /// No service claimed the fresh mapping; it goes straight onto the
        /// removal-candidate queue so an unclaimed rebalance can't orphan it.
        orphan: bool,
    },
    NoNodes,
}

enum FailStep {
    Drained,
    Moved {
        identity: Identity,
        new: NodeId,
        orphan: bool,
    },
    Stranded(Vec<Identity>),
}

impl NodeMappingServer {
    pub fn start(
        store: Arc<dyn DataStore>,
        directory: Arc<NodeDirectory>,
        policy: Box<dyn NodeAssignPolicy>,
        remove_expire: Duration,
    ) -> Arc<Self> {
        let server = Arc::new(Self {
            runner: TxnRunner::new(store),
            directory: directory.clone(),
            policy,
            clients: Mutex::new(HashMap::default()),
            remove: RemoveQueue {
                state: Mutex::new(RemoveState {
                    queue: VecDeque::new(),
                    shutdown: false,
                }),
                wake: Condvar::new(),
                expire: remove_expire,
            },
            sweeper: Mutex::new(None),
        });
        let sweep = server.clone();
        let handle = thread::Builder::new()
            .name("nodemap-remove".to_string())
            .spawn(move || sweep.sweep_loop())
            .ok();
        *server.sweeper.lock().unwrap() = handle;
        directory.add_failure_listener(Arc::new(ServerFailureListener(Arc::downgrade(&server))));
        server
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.remove.state.lock().unwrap();
            state.shutdown = true;
        }
        self.remove.wake.notify_all();
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn client_for(&self, node: NodeId) -> Option<Arc<dyn NotifyClient>> {
        self.clients.lock().unwrap().get(&node).cloned()
    }

    /// Best-effort add/remove notifications for a committed move: the old
    /// node hears `removed`, the new node hears `added`.
    fn notify_moved(&self, identity: &Identity, old: Option<NodeId>, new: NodeId) {
        if let Some(old_node) = old
            && let Some(client) = self.client_for(old_node)
        {
            client.removed(identity, Some(new));
        }
        if let Some(client) = self.client_for(new) {
            client.added(identity, old);
        } else {
            debug!(node = new, %identity, "no listener for newly mapped node");
        }
    }

    fn enqueue_removal(&self, identity: &Identity) {
        {
            let mut state = self.remove.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.queue.push_back((identity.clone(), Instant::now()));
        }
        self.remove.wake.notify_one();
    }

    fn current_mapping(
        txn: &mut Txn,
        identity: &Identity,
    ) -> Result<Option<(ObjId, NodeId)>, TaskError> {
        match txn.tx().get_binding(&idmap_key(identity)) {
            Ok(obj) => {
                let value = txn.tx().resolve(obj).map_err(store_fatal)?;
                let mo = downcast::<IdentityMO>(&value)
                    .ok_or_else(|| TaskError::fatal("corrupt identity mapping record"))?;
                Ok(Some((obj, mo.node)))
            }
            Err(StoreError::NameNotBound(_)) => Ok(None),
            Err(e) => Err(store_fatal(e)),
        }
    }

    /// Atomic rebind: drop the old bindings, write the new pair. The old
    /// node's status bindings say nothing about the new node, so they are
    /// deleted outright; services on the new node re-vote once work lands
    /// there. A rebind no service claimed goes on the removal-candidate
    /// queue, where the delayed sweep gives those votes time to arrive.
    fn rebind(
        &self,
        txn: &mut Txn,
        identity: &Identity,
        current: Option<(ObjId, NodeId)>,
        target: NodeId,
        service: &str,
    ) -> Result<AssignOutcome, TaskError> {
        let old = current.map(|(_, n)| n);
        if let Some((obj, old_node)) = current {
            let _ = txn.tx().remove_binding(&node_key(old_node, identity));
            let _ = txn.tx().remove_binding(&idmap_key(identity));
            let _ = txn.tx().remove_object(obj);
            for name in scan_prefix(txn.tx(), &status_node_prefix(identity, old_node)) {
                let _ = txn.tx().remove_binding(&name);
            }
        }
        let obj = txn.tx().create(Arc::new(IdentityMO {
            identity: identity.clone(),
            node: target,
        }));
        txn.tx().set_binding(&idmap_key(identity), obj);
        txn.tx().set_binding(&node_key(target, identity), obj);
        let orphan = if service.is_empty() {
            true
        } else {
            txn.tx()
                .set_binding(&status_key(identity, target, service), obj);
            false
        };
        Ok(AssignOutcome::Moved {
            old,
            new: target,
            orphan,
        })
    }

    fn assign_in(
        &self,
        txn: &mut Txn,
        service: &str,
        identity: &Identity,
    ) -> Result<AssignOutcome, TaskError> {
        let current = Self::current_mapping(txn, identity)?;
        if let Some((obj, node)) = current
            && self.directory.is_alive(node)
        {
            // Mapped and healthy: the assignment is just a status refresh.
            if !service.is_empty() {
                txn.tx().set_binding(&status_key(identity, node, service), obj);
            }
            return Ok(AssignOutcome::Existing(node));
        }
        let live = self.directory.live_nodes();
        let Some(target) = self
            .policy
            .choose_node(identity, &live, current.map(|(_, n)| n))
        else {
            return Ok(AssignOutcome::NoNodes);
        };
        self.rebind(txn, identity, current, target, service)
    }

    /// One step of draining a failed node: remap a single identity per
    /// transaction so a large dead node doesn't turn into one giant commit.
    fn drain_step(&self, dead: NodeId) -> Result<FailStep, TaskError> {
        self.runner.run(|txn| {
            let prefix = node_prefix(dead);
            let first = match txn.tx().next_bound_name(&prefix) {
                Some(name) if name.starts_with(&prefix) => name,
                _ => return Ok(FailStep::Drained),
            };
            let identity = Identity::named(&first[prefix.len()..]);
            let live = self.directory.live_nodes();
            if live.is_empty() {
                // Nowhere to go. Queue everything left for removal instead
                // of spinning.
                let stranded = scan_prefix(txn.tx(), &prefix)
                    .into_iter()
                    .map(|name| Identity::named(&name[prefix.len()..]))
                    .collect();
                return Ok(FailStep::Stranded(stranded));
            }
            let current = Self::current_mapping(txn, &identity)?;
            let Some(target) = self.policy.choose_node(&identity, &live, Some(dead)) else {
                return Ok(FailStep::Stranded(vec![identity]));
            };
            match self.rebind(txn, &identity, current, target, "")? {
                AssignOutcome::Moved { new, orphan, .. } => Ok(FailStep::Moved {
                    identity,
                    new,
                    orphan,
                }),
                _ => Ok(FailStep::Drained),
            }
        })
    }

    fn node_failed(&self, dead: NodeId) {
        info!(node = dead, "remapping identities off failed node");
        self.unregister_node_listener(dead);
        loop {
            match self.drain_step(dead) {
                Ok(FailStep::Drained) => break,
                Ok(FailStep::Moved {
                    identity,
                    new,
                    orphan,
                }) => {
                    self.notify_moved(&identity, Some(dead), new);
                    if orphan {
                        self.enqueue_removal(&identity);
                    }
                }
                Ok(FailStep::Stranded(identities)) => {
                    for identity in &identities {
                        self.enqueue_removal(identity);
                    }
                    warn!(
                        node = dead,
                        count = identities.len(),
                        "no live nodes; stranded identities queued for removal"
                    );
                    break;
                }
                Err(e) => {
                    warn!(node = dead, error = %e, "failed-node drain aborted");
                    break;
                }
            }
        }
    }

    fn sweep_loop(self: Arc<Self>) {
        loop {
            let entry = {
                let mut state = self.remove.state.lock().unwrap();
                loop {
                    if state.shutdown {
                        return;
                    }
                    match state.queue.front() {
                        None => state = self.remove.wake.wait(state).unwrap(),
                        Some((_, enqueued)) => {
                            let due = *enqueued + self.remove.expire;
                            let now = Instant::now();
                            if due <= now {
                                break state.queue.pop_front();
                            }
                            state = self
                                .remove
                                .wake
                                .wait_timeout(state, due.duration_since(now))
                                .unwrap()
                                .0;
                        }
                    }
                }
            };
            if let Some((identity, _)) = entry {
                self.try_remove(&identity);
            }
        }
    }

    /// Confirm-and-delete phase of removal. An identity that reactivated
    /// (any status binding back) is left alone.
    fn try_remove(&self, identity: &Identity) {
        let removed = self.runner.run(|txn| {
            if !scan_prefix(txn.tx(), &status_prefix(identity)).is_empty() {
                return Ok(None);
            }
            let Some((obj, node)) = Self::current_mapping(txn, identity)? else {
                return Ok(None);
            };
            let _ = txn.tx().remove_binding(&node_key(node, identity));
            let _ = txn.tx().remove_binding(&idmap_key(identity));
            let _ = txn.tx().remove_object(obj);
            Ok(Some(node))
        });
        match removed {
            Ok(Some(node)) => {
                info!(%identity, node, "removed idle identity mapping");
                if let Some(client) = self.client_for(node) {
                    client.removed(identity, None);
                }
            }
            Ok(None) => debug!(%identity, "removal skipped; identity active again"),
            Err(e) => warn!(%identity, error = %e, "removal sweep transaction failed"),
        }
    }
}

impl MappingServerRpc for NodeMappingServer {
    fn assign_node(
        &self,
        service: &str,
        identity: &Identity,
        requesting_node: NodeId,
    ) -> Result<NodeId, MappingError> {
        let outcome = self
            .runner
            .run(|txn| self.assign_in(txn, service, identity))
            .map_err(|e| MappingError::Rpc(e.to_string()))?;
        match outcome {
            AssignOutcome::Existing(node) => Ok(node),
            AssignOutcome::NoNodes => Err(MappingError::NoNodesAvailable),
            AssignOutcome::Moved { old, new, orphan } => {
                debug!(%identity, ?old, new, requesting_node, "identity mapped");
                self.notify_moved(identity, old, new);
                if orphan {
                    self.enqueue_removal(identity);
                }
                Ok(new)
            }
        }
    }

    fn can_remove(&self, identity: &Identity) {
        self.enqueue_removal(identity);
    }

    fn register_node_listener(&self, node: NodeId, client: Arc<dyn NotifyClient>) {
        self.clients.lock().unwrap().insert(node, client);
    }

    fn unregister_node_listener(&self, node: NodeId) {
        self.clients.lock().unwrap().remove(&node);
    }
}

struct ServerFailureListener(Weak<NodeMappingServer>);

impl NodeFailureListener for ServerFailureListener {
    fn node_failed(&self, node: Node) {
        if let Some(server) = self.0.upgrade() {
            server.node_failed(node.id);
        }
    }
}
