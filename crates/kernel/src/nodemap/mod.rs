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

//! The identity-to-node mapping authority: one server per cluster, one
//! client service per node, and the durable bindings both sides speak
//! through.

use std::sync::Arc;

use meridian_common::{Identity, MappingError, NodeId};

mod policy;
mod server;
mod service;

pub use policy::{NodeAssignPolicy, RoundRobinPolicy};
pub use server::NodeMappingServer;
pub use service::NodeMappingService;

/// The authoritative mapping unit, stored under both an identity-keyed and a
/// node-keyed binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityMO {
    pub identity: Identity,
    pub node: NodeId,
}

/// Per-node callback surface for committed mapping changes.
pub trait MappingListener: Send + Sync {
    fn mapping_added(&self, identity: &Identity, old_node: Option<NodeId>);
    fn mapping_removed(&self, identity: &Identity, new_node: Option<NodeId>);
}

/// The reverse notification channel the server pushes committed changes
/// down, one registered client per node. Calls are best-effort.
pub trait NotifyClient: Send + Sync {
    fn added(&self, identity: &Identity, old_node: Option<NodeId>);
    fn removed(&self, identity: &Identity, new_node: Option<NodeId>);
}

/// The server's remote surface as the per-node clients see it. In-process
/// deployments hand the server itself across this seam; failures are soft
/// errors, logged and retried, never transaction failures.
pub trait MappingServerRpc: Send + Sync {
    fn assign_node(
        &self,
        service: &str,
        identity: &Identity,
        requesting_node: NodeId,
    ) -> Result<NodeId, MappingError>;

    /// The caller observed zero remaining status bindings; put the identity
    /// on the removal-candidate queue.
    fn can_remove(&self, identity: &Identity);

    fn register_node_listener(&self, node: NodeId, client: Arc<dyn NotifyClient>);

    fn unregister_node_listener(&self, node: NodeId);
}

pub(crate) fn idmap_key(identity: &Identity) -> String {
    format!("nodemap.idmap.{}", identity.name())
}

pub(crate) fn node_key(node: NodeId, identity: &Identity) -> String {
    format!("nodemap.nodemap.{node}.{}", identity.name())
}

pub(crate) fn node_prefix(node: NodeId) -> String {
    format!("nodemap.nodemap.{node}.")
}

/// One status binding per (identity, node, service) acts as a reference
/// count keeping the mapping alive.
pub(crate) fn status_key(identity: &Identity, node: NodeId, service: &str) -> String {
    format!("nodemap.status.{}.{node}.{service}", identity.name())
}

pub(crate) fn status_prefix(identity: &Identity) -> String {
    format!("nodemap.status.{}.", identity.name())
}

pub(crate) fn status_node_prefix(identity: &Identity, node: NodeId) -> String {
    format!("nodemap.status.{}.{node}.", identity.name())
}
