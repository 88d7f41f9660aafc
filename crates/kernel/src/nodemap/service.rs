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

//! The per-node mapping client: local status bookkeeping, lookups against
//! the shared store, and fan-out of the server's change notifications onto
//! scheduler tasks.

use std::any::Any;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::warn;

use meridian_common::{Identity, MappingError, NodeDirectory, NodeId};
use meridian_store::{StoreError, Txn, TxnParticipant, TxnRunner, downcast};

use crate::sched::{ApplicationScheduler, FnTask, ScheduledTask, now_millis};
use crate::util::scan_prefix;

use super::{
    IdentityMO, MappingListener, MappingServerRpc, NotifyClient, idmap_key, node_prefix,
    status_key, status_prefix,
};

/// How long to wait before retrying an assignment the server couldn't be
/// reached for.
const ASSIGN_RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct NodeMappingService {
    node_id: NodeId,
    runner: TxnRunner,
    rpc: Arc<dyn MappingServerRpc>,
    directory: Arc<NodeDirectory>,
    app: Arc<ApplicationScheduler>,
    listeners: Mutex<Vec<Arc<dyn MappingListener>>>,
    service_owner: Identity,
}

/// Deferred server calls that only make sense once the local transaction
/// has actually committed.
struct MappingTxnState {
    rpc: Arc<dyn MappingServerRpc>,
    can_removes: Vec<Identity>,
}

impl TxnParticipant for MappingTxnState {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn commit(&mut self) {
        for identity in self.can_removes.drain(..) {
            self.rpc.can_remove(&identity);
        }
    }

    fn abort(&mut self, _retryable: bool) {
        self.can_removes.clear();
    }
}

impl NodeMappingService {
    pub fn new(
        node_id: NodeId,
        runner: TxnRunner,
        rpc: Arc<dyn MappingServerRpc>,
        directory: Arc<NodeDirectory>,
        app: Arc<ApplicationScheduler>,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            node_id,
            runner,
            rpc: rpc.clone(),
            directory,
            app,
            listeners: Mutex::new(Vec::new()),
            service_owner: Identity::named(&format!("nodemap.{node_id}")),
        });
        rpc.register_node_listener(node_id, Arc::new(ClientDispatch(Arc::downgrade(&service))));
        service
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn add_listener(&self, listener: Arc<dyn MappingListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Ask the server to map `identity` somewhere, counting `service` as a
    /// keep-alive vote. Communication failure is soft: logged, retried
    /// later off-thread, and reported so the caller can fall back to local
    /// execution.
    pub fn assign_node(
        self: &Arc<Self>,
        service: &str,
        identity: &Identity,
    ) -> Result<NodeId, MappingError> {
        match self.rpc.assign_node(service, identity, self.node_id) {
            Ok(node) => Ok(node),
            Err(MappingError::Rpc(msg)) => {
                warn!(%identity, error = %msg, "mapping server unreachable; will retry assignment");
                let svc = self.clone();
                let service = service.to_string();
                let id = identity.clone();
                self.app.add_task(ScheduledTask::starting_at(
                    Arc::new(FnTask(move || {
                        let _ = svc.assign_node(&service, &id);
                        Ok(())
                    })),
                    self.service_owner.clone(),
                    now_millis() + ASSIGN_RETRY_DELAY.as_millis() as u64,
                ));
                Err(MappingError::Rpc(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// Current node for `identity`, read in the caller's transaction.
    pub fn get_node_in(&self, txn: &mut Txn, identity: &Identity) -> Result<NodeId, MappingError> {
        let obj = match txn.tx().get_binding(&idmap_key(identity)) {
            Ok(obj) => obj,
            Err(StoreError::NameNotBound(_)) => {
                return Err(MappingError::UnknownIdentity(identity.clone()));
            }
            Err(e) => return Err(MappingError::Rpc(e.to_string())),
        };
        let value = txn
            .tx()
            .resolve(obj)
            .map_err(|e| MappingError::Rpc(e.to_string()))?;
        downcast::<IdentityMO>(&value)
            .map(|mo| mo.node)
            .ok_or_else(|| MappingError::Rpc("corrupt identity mapping record".to_string()))
    }

    pub fn get_node(&self, identity: &Identity) -> Result<NodeId, MappingError> {
        let identity = identity.clone();
        run_mapping(&self.runner, |txn| self.get_node_in(txn, &identity))
    }

    /// Every identity currently mapped to `node`.
    pub fn get_identities(&self, node: NodeId) -> Result<Vec<Identity>, MappingError> {
        if self.directory.get_node(node).is_none() {
            return Err(MappingError::UnknownNode(node));
        }
        run_mapping(&self.runner, |txn| {
            let prefix = node_prefix(node);
            Ok(scan_prefix(txn.tx(), &prefix)
                .into_iter()
                .map(|name| Identity::named(&name[prefix.len()..]))
                .collect())
        })
    }

    /// Record `service`'s interest (or lack of it) in `identity` on this
    /// node, inside the caller's transaction. A second deactivate for the
    /// same binding is tolerated. When the last status binding anywhere
    /// disappears, the server is told the identity is a removal candidate
    /// once the transaction commits.
    pub fn set_status_in(
        &self,
        txn: &mut Txn,
        service: &str,
        identity: &Identity,
        active: bool,
    ) -> Result<(), MappingError> {
        let obj = match txn.tx().get_binding(&idmap_key(identity)) {
            Ok(obj) => obj,
            Err(StoreError::NameNotBound(_)) => {
                return Err(MappingError::UnknownIdentity(identity.clone()));
            }
            Err(e) => return Err(MappingError::Rpc(e.to_string())),
        };
        let key = status_key(identity, self.node_id, service);
        if active {
            txn.tx().set_binding(&key, obj);
        } else {
            // Tolerate deactivating a status that was never (or already no
            // longer) set.
            let _ = txn.tx().remove_binding(&key);
            if scan_prefix(txn.tx(), &status_prefix(identity)).is_empty() {
                let rpc = self.rpc.clone();
                let state = txn.join("nodemap", move || MappingTxnState {
                    rpc,
                    can_removes: Vec::new(),
                });
                state.can_removes.push(identity.clone());
            }
        }
        Ok(())
    }

    pub fn set_status(
        &self,
        service: &str,
        identity: &Identity,
        active: bool,
    ) -> Result<(), MappingError> {
        run_mapping(&self.runner, |txn| {
            self.set_status_in(txn, service, identity, active)
        })
    }

    fn dispatch_added(self: Arc<Self>, identity: Identity, old_node: Option<NodeId>) {
        let svc = self.clone();
        self.app.add_task(ScheduledTask::immediate(
            Arc::new(FnTask(move || {
                let listeners = svc.listeners.lock().unwrap().clone();
                for listener in listeners {
                    listener.mapping_added(&identity, old_node);
                }
                Ok(())
            })),
            self.service_owner.clone(),
        ));
    }

    fn dispatch_removed(self: Arc<Self>, identity: Identity, new_node: Option<NodeId>) {
        let svc = self.clone();
        self.app.add_task(ScheduledTask::immediate(
            Arc::new(FnTask(move || {
                let listeners = svc.listeners.lock().unwrap().clone();
                for listener in listeners {
                    listener.mapping_removed(&identity, new_node);
                }
                Ok(())
            })),
            self.service_owner.clone(),
        ));
    }

    pub fn shutdown(&self) {
        self.rpc.unregister_node_listener(self.node_id);
    }
}

/// Run a mapping operation in its own transaction, folding runner failures
/// into the soft communication-error arm.
fn run_mapping<R>(
    runner: &TxnRunner,
    mut f: impl FnMut(&mut Txn) -> Result<R, MappingError>,
) -> Result<R, MappingError> {
    match runner.run(|txn| Ok(f(txn))) {
        Ok(result) => result,
        Err(e) => Err(MappingError::Rpc(e.to_string())),
    }
}

/// The server's callback into this node, bounced onto a scheduler task so
/// notification never runs inside the server's own locks.
struct ClientDispatch(Weak<NodeMappingService>);

impl NotifyClient for ClientDispatch {
    fn added(&self, identity: &Identity, old_node: Option<NodeId>) {
        if let Some(service) = self.0.upgrade() {
            service.dispatch_added(identity.clone(), old_node);
        }
    }

    fn removed(&self, identity: &Identity, new_node: Option<NodeId>) {
        if let Some(service) = self.0.upgrade() {
            service.dispatch_removed(identity.clone(), new_node);
        }
    }
}
