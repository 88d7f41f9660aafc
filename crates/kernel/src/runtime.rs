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

//! Per-node assembly: wires the scheduler stack, mapping client, and task
//! service together against a shared store and brings them up in order.

use std::sync::Arc;

use tracing::info;

use meridian_common::{NodeDirectory, NodeId, TaskError};
use meridian_store::{DataStore, TxnRunner};

use crate::config::{AssignPolicy, Config};
use crate::nodemap::{
    MappingServerRpc, NodeAssignPolicy, NodeMappingService, RoundRobinPolicy,
};
use crate::sched::{SystemScheduler, TaskExecutor, TimerQueue};
use crate::tasks::{TaskMappingListener, TaskRecoveryListener, TaskService};

/// The assignment policy the mapping server should run with, per config.
pub fn assign_policy(config: &Config) -> Box<dyn NodeAssignPolicy> {
    match config.assign_policy {
        AssignPolicy::RoundRobin => {
            Box::new(RoundRobinPolicy::new(config.assign_exclude_current))
        }
    }
}

/// Everything one node runs: the shared timer, the system scheduler and its
/// consumer pool, the mapping client, and the task service. Startup order
/// matters (listeners before `ready`, so the restart scan sees mapping
/// callbacks); `start` owns it.
pub struct NodeRuntime {
    node_id: NodeId,
    directory: Arc<NodeDirectory>,
    timer: Arc<TimerQueue>,
    scheduler: Arc<SystemScheduler>,
    executor: Option<TaskExecutor>,
    mapping: Arc<NodeMappingService>,
    tasks: Arc<TaskService>,
}

impl NodeRuntime {
    pub fn start(
        node_id: NodeId,
        store: Arc<dyn DataStore>,
        directory: Arc<NodeDirectory>,
        server: Arc<dyn MappingServerRpc>,
        config: &Config,
    ) -> Result<Self, TaskError> {
        directory.register(node_id);
        let timer = TimerQueue::new();
        let scheduler = SystemScheduler::new(config, timer.clone());
        let runner = TxnRunner::new(store);
        let mapping = NodeMappingService::new(
            node_id,
            runner.clone(),
            server,
            directory.clone(),
            scheduler.app_scheduler("nodemap"),
        );
        let tasks = TaskService::new(
            node_id,
            runner,
            scheduler.app_scheduler("task"),
            timer.clone(),
            mapping.clone(),
            directory.clone(),
            config,
        );
        mapping.add_listener(Arc::new(TaskMappingListener(tasks.clone())));
        directory.add_failure_listener(Arc::new(TaskRecoveryListener(tasks.clone())));
        let executor = TaskExecutor::start(scheduler.clone(), config.worker_threads);
        tasks.ready()?;
        info!(node = node_id, "node runtime up");
        Ok(Self {
            node_id,
            directory,
            timer,
            scheduler,
            executor: Some(executor),
            mapping,
            tasks,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn directory(&self) -> &Arc<NodeDirectory> {
        &self.directory
    }

    pub fn scheduler(&self) -> &Arc<SystemScheduler> {
        &self.scheduler
    }

    pub fn timer(&self) -> &Arc<TimerQueue> {
        &self.timer
    }

    pub fn mapping(&self) -> &Arc<NodeMappingService> {
        &self.mapping
    }

    pub fn tasks(&self) -> &Arc<TaskService> {
        &self.tasks
    }

    /// Orderly local teardown. Durable state stays in the store; mark the
    /// node failed in the directory afterwards if its work should move.
    pub fn shutdown(mut self) {
        self.tasks.shutdown();
        self.mapping.shutdown();
        if let Some(executor) = self.executor.take() {
            executor.shutdown();
        }
        self.timer.shutdown();
        info!(node = self.node_id, "node runtime down");
    }
}
