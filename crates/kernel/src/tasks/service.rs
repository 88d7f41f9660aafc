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

//! The transactional task service: durable scheduling, cross-node hand-off,
//! the reusable record pool, and identity status voting.
//!
//! All persistent effects ride the caller's transaction; in-memory effects
//! (reservation use, recurring starts, status counts, pool movements) are
//! deferred to commit through the service's transaction participant and
//! rolled back on abort.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHasher;
use tracing::{debug, info, warn};

use meridian_common::{
    Identity, MappingError, Node, NodeDirectory, NodeFailureListener, NodeId, TaskError,
};
use meridian_store::{ObjId, StoreError, Txn, TxnParticipant, TxnRunner, downcast};

use crate::config::Config;
use crate::nodemap::{MappingListener, NodeMappingService};
use crate::sched::{
    ApplicationScheduler, FnTask, RecurringHandle, ScheduledTask, TaskBody, TaskReservation,
    TimerHandle, TimerQueue, now_millis,
};
use crate::util::{scan_prefix, store_fatal};

use super::pending::HandoffSet;
use super::{
    ContinuePolicy, DurableTask, FixedTimeContinuePolicy, PendingTask, TaskPayload, handoff_key,
    pending_key, pending_owner, pending_prefix,
};

/// Service name used for transaction participation and status bindings.
pub const TASK_SERVICE: &str = "task";

pub struct TaskService {
    node_id: NodeId,
    runner: TxnRunner,
    app: Arc<ApplicationScheduler>,
    timer: Arc<TimerQueue>,
    mapping: Arc<NodeMappingService>,
    directory: Arc<NodeDirectory>,
    continue_policy: Box<dyn ContinuePolicy>,
    vote_delay: Duration,
    handoff_start: Duration,
    handoff_period: Duration,
    service_owner: Identity,
    state: Mutex<LocalState>,
}

struct LocalState {
    /// Identities this node believes it owns. Eventually consistent with the
    /// authoritative map; the runner rechecks before every execution.
    mapped: HashSet<Identity, BuildHasherDefault<AHasher>>,
    counts: HashMap<Identity, StatusInfo, BuildHasherDefault<AHasher>>,
    /// Records currently admitted to the local scheduler, by object id.
    /// Restart scans skip these so a record is never queued twice.
    active: HashSet<ObjId, BuildHasherDefault<AHasher>>,
    /// Active recurring chains keyed by their record's object id.
    recurring: HashMap<ObjId, RecurringDetail, BuildHasherDefault<AHasher>>,
    /// Reusable record slots per identity.
    pool: HashMap<Identity, Vec<ObjId>, BuildHasherDefault<AHasher>>,
    scan_handle: Option<RecurringHandle>,
    shutdown: bool,
}

struct StatusInfo {
    count: i64,
    voted_active: bool,
    pending_vote: Option<PendingVote>,
}

struct PendingVote {
    target_active: bool,
    timer: TimerHandle,
}

struct RecurringDetail {
    identity: Identity,
    handle: RecurringHandle,
}

enum Placement {
    Local { skip_check: bool },
    HandedOff,
}

enum RunOutcome {
    Done,
    /// Record gone: cancelled from another node, or never existed.
    Gone,
    /// Reusable placeholder, nothing to run.
    Placeholder,
    /// External payload object deleted by the application.
    RemovedByApp,
    /// Periodic record stamped with a different running node; a hand-off
    /// won the race and this chain is stale here.
    StaleNode,
}

/// In-memory side effects accumulated during one transaction, applied on
/// commit and unwound on abort.
struct TaskTxnState {
    service: Arc<TaskService>,
    reservations: Vec<TaskReservation>,
    recurring_starts: Vec<(ObjId, Identity, RecurringHandle)>,
    recurring_cancels: Vec<ObjId>,
    track_active: Vec<ObjId>,
    untrack_active: Vec<ObjId>,
    status_deltas: Vec<(Identity, i64)>,
    /// Pool slots consumed optimistically; returned if we abort.
    pool_takes: Vec<(Identity, ObjId)>,
    /// Completed records that become free slots once we commit.
    pool_returns: Vec<(Identity, ObjId)>,
}

impl TaskTxnState {
    fn new(service: Arc<TaskService>) -> Self {
        Self {
            service,
            reservations: Vec::new(),
            recurring_starts: Vec::new(),
            recurring_cancels: Vec::new(),
            track_active: Vec::new(),
            untrack_active: Vec::new(),
            status_deltas: Vec::new(),
            pool_takes: Vec::new(),
            pool_returns: Vec::new(),
        }
    }
}

impl TxnParticipant for TaskTxnState {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn commit(&mut self) {
        // Bookkeeping before admission: a task made runnable below can
        // execute and commit its own decrement before this loop finishes, so
        // the count and active-set entries must already be in place.
        for obj_id in self.track_active.drain(..) {
            self.service.track_active_obj(obj_id);
        }
        for (identity, delta) in self.status_deltas.drain(..) {
            self.service.adjust_status(&identity, delta);
        }
        for reservation in &mut self.reservations {
            if let Err(e) = reservation.use_task() {
                warn!(error = %e, "reservation unusable at commit");
            }
        }
        for (obj_id, identity, handle) in self.recurring_starts.drain(..) {
            self.service
                .track_recurring(obj_id, identity, handle.clone());
            if let Err(e) = handle.start() {
                warn!(obj_id, error = %e, "recurring start failed at commit");
            }
        }
        for obj_id in self.recurring_cancels.drain(..) {
            self.service.untrack_recurring(obj_id);
        }
        for obj_id in self.untrack_active.drain(..) {
            self.service.untrack_active_obj(obj_id);
        }
        for (identity, obj_id) in self.pool_returns.drain(..) {
            self.service.pool_return(&identity, obj_id);
        }
    }

    fn abort(&mut self, _retryable: bool) {
        for reservation in &mut self.reservations {
            let _ = reservation.cancel();
        }
        for (_, _, handle) in self.recurring_starts.drain(..) {
            let _ = handle.cancel();
        }
        for (identity, obj_id) in self.pool_takes.drain(..) {
            self.service.pool_return(&identity, obj_id);
        }
        self.track_active.clear();
        self.untrack_active.clear();
        self.status_deltas.clear();
        self.pool_returns.clear();
        self.recurring_cancels.clear();
    }
}

/// Cancellation handle for a durably scheduled periodic task. Works from any
/// node: it goes through the record's binding, and the owning node notices
/// the record is gone on its next occurrence.
pub struct PeriodicTaskHandle {
    service: Arc<TaskService>,
    name: String,
    obj_id: ObjId,
    identity: Identity,
}

impl PeriodicTaskHandle {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Cancel future occurrences. Cancelling an already-cancelled task finds
    /// the record gone and reports it.
    pub fn cancel(&self, txn: &mut Txn) -> Result<(), TaskError> {
        let value = txn
            .tx()
            .resolve(self.obj_id)
            .map_err(|e| TaskError::fatal(format!("periodic task already cancelled: {e}")))?;
        let record = downcast::<PendingTask>(&value)
            .ok_or_else(|| TaskError::fatal("corrupt pending task record"))?
            .clone();
        let _ = txn.tx().remove_binding(&self.name);
        txn.tx().remove_object(self.obj_id).map_err(store_fatal)?;
        if record.running_node() == Some(self.service.node_id) {
            let state = self.service.txn_state(txn);
            state.recurring_cancels.push(self.obj_id);
            state.untrack_active.push(self.obj_id);
            state.status_deltas.push((self.identity.clone(), -1));
        }
        Ok(())
    }
}

/// The durable execution path: fetched and run by the executor, it replays
/// the persisted record inside a fresh transaction.
struct TaskRunner {
    service: Arc<TaskService>,
    obj_id: ObjId,
    identity: Identity,
    task_type: String,
    /// First execution right after allocation skips the local-mapping check;
    /// the mapping may not have propagated yet.
    skip_first_check: AtomicBool,
}

impl TaskBody for TaskRunner {
    fn name(&self) -> &str {
        &self.task_type
    }

    fn run(&self) -> Result<(), TaskError> {
        self.service.run_pending(self)
    }
}

impl TaskService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        runner: TxnRunner,
        app: Arc<ApplicationScheduler>,
        timer: Arc<TimerQueue>,
        mapping: Arc<NodeMappingService>,
        directory: Arc<NodeDirectory>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            runner,
            app,
            timer,
            mapping,
            directory,
            continue_policy: Box::new(FixedTimeContinuePolicy::new(config.continue_threshold)),
            vote_delay: config.vote_delay,
            handoff_start: config.handoff_start,
            handoff_period: config.handoff_period,
            service_owner: Identity::named(&format!("task-service.{node_id}")),
            state: Mutex::new(LocalState {
                mapped: HashSet::default(),
                counts: HashMap::default(),
                active: HashSet::default(),
                recurring: HashMap::default(),
                pool: HashMap::default(),
                scan_handle: None,
                shutdown: false,
            }),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Cooperative check for long incremental tasks.
    pub fn should_continue(&self, txn: &Txn) -> bool {
        self.continue_policy.should_continue(txn)
    }

    // ---- public scheduling surface ----

    pub fn schedule_task(
        self: &Arc<Self>,
        txn: &mut Txn,
        owner: &Identity,
        task: Arc<dyn DurableTask>,
    ) -> Result<(), TaskError> {
        self.schedule(txn, owner, TaskPayload::Inline(task), None, None)
            .map(|_| ())
    }

    pub fn schedule_task_delayed(
        self: &Arc<Self>,
        txn: &mut Txn,
        owner: &Identity,
        task: Arc<dyn DurableTask>,
        delay: Duration,
    ) -> Result<(), TaskError> {
        self.schedule(txn, owner, TaskPayload::Inline(task), Some(delay), None)
            .map(|_| ())
    }

    pub fn schedule_periodic_task(
        self: &Arc<Self>,
        txn: &mut Txn,
        owner: &Identity,
        task: Arc<dyn DurableTask>,
        delay: Duration,
        period: Duration,
    ) -> Result<PeriodicTaskHandle, TaskError> {
        let (obj_id, name, owner) = self.schedule(
            txn,
            owner,
            TaskPayload::Inline(task),
            Some(delay),
            Some(period),
        )?;
        Ok(PeriodicTaskHandle {
            service: self.clone(),
            name,
            obj_id,
            identity: owner,
        })
    }

    /// Schedule a task the application stores and manages itself. If the
    /// application later deletes the object, execution silently no-ops.
    pub fn schedule_external_task(
        self: &Arc<Self>,
        txn: &mut Txn,
        owner: &Identity,
        task_obj: ObjId,
    ) -> Result<(), TaskError> {
        self.schedule(txn, owner, TaskPayload::External(task_obj), None, None)
            .map(|_| ())
    }

    /// Non-durable, non-transactional scheduling for service-internal work.
    pub fn schedule_non_durable(self: &Arc<Self>, body: Arc<dyn TaskBody>, delay: Option<Duration>) {
        let start = now_millis() + delay.map(|d| d.as_millis() as u64).unwrap_or(0);
        self.app.add_task(ScheduledTask::starting_at(
            body,
            self.service_owner.clone(),
            start,
        ));
    }

    /// Non-durable work that still wants a transaction; run through the
    /// retrying runner when it comes up.
    pub fn schedule_non_durable_transactional(
        self: &Arc<Self>,
        f: impl Fn(&mut Txn) -> Result<(), TaskError> + Send + Sync + 'static,
        delay: Option<Duration>,
    ) {
        let runner = self.runner.clone();
        self.schedule_non_durable(Arc::new(FnTask(move || runner.run(|txn| f(txn)))), delay);
    }

    // ---- lifecycle ----

    /// Bring the service up: bind this node's hand-off set, make sure our
    /// own service identity is mapped, and start the periodic hand-off scan
    /// after the configured grace delay.
    pub fn ready(self: &Arc<Self>) -> Result<(), TaskError> {
        let key = handoff_key(self.node_id);
        self.runner.run(|txn| {
            match txn.tx().get_binding(&key) {
                Ok(_) => {}
                Err(StoreError::NameNotBound(_)) => {
                    let obj = txn.tx().create(Arc::new(HandoffSet::default()));
                    txn.tx().set_binding(&key, obj);
                }
                Err(e) => return Err(store_fatal(e)),
            }
            Ok(())
        })?;
        if let Err(e) = self.mapping.assign_node(TASK_SERVICE, &self.service_owner) {
            warn!(error = %e, "service identity assignment deferred");
        }
        let svc = self.clone();
        let scan = ScheduledTask::recurring(
            Arc::new(FnTask(move || {
                svc.handoff_scan();
                Ok(())
            })),
            self.service_owner.clone(),
            now_millis() + self.handoff_start.as_millis() as u64,
            self.handoff_period,
        );
        let handle = self.app.add_recurring_task(scan);
        handle
            .start()
            .map_err(|e| TaskError::fatal(e.to_string()))?;
        let mut state = self.state.lock().unwrap();
        state.scan_handle = Some(handle);
        info!(node = self.node_id, "task service ready");
        Ok(())
    }

    /// Stop the hand-off scan, pending votes, and local recurrences. Durable
    /// state is untouched; another node picks the work up via recovery.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        if let Some(handle) = state.scan_handle.take() {
            let _ = handle.cancel();
        }
        for info in state.counts.values_mut() {
            if let Some(vote) = info.pending_vote.take() {
                vote.timer.cancel();
            }
        }
        for (_, detail) in state.recurring.drain() {
            let _ = detail.handle.cancel();
        }
        info!(node = self.node_id, "task service shut down");
    }

    // ---- scheduling internals ----

    fn txn_state<'a>(self: &Arc<Self>, txn: &'a mut Txn) -> &'a mut TaskTxnState {
        let service = self.clone();
        txn.join(TASK_SERVICE, move || TaskTxnState::new(service))
    }

    fn schedule(
        self: &Arc<Self>,
        txn: &mut Txn,
        owner: &Identity,
        payload: TaskPayload,
        delay: Option<Duration>,
        period: Option<Duration>,
    ) -> Result<(ObjId, String, Identity), TaskError> {
        if self.state.lock().unwrap().shutdown {
            return Err(TaskError::fatal("task service is shut down"));
        }
        let (task_type, new_identity) = match &payload {
            TaskPayload::Inline(task) => (task.name().to_string(), task.new_identity()),
            TaskPayload::External(obj) => {
                let value = txn.tx().resolve(*obj).map_err(store_fatal)?;
                let task = downcast::<Arc<dyn DurableTask>>(&value)
                    .ok_or_else(|| TaskError::fatal("external object is not a durable task"))?;
                (task.name().to_string(), task.new_identity())
            }
        };
        let owner = if new_identity {
            Identity::minted(self.node_id)
        } else {
            owner.clone()
        };
        let start = now_millis() + delay.map(|d| d.as_millis() as u64).unwrap_or(0);
        let record = PendingTask::active(
            payload,
            owner.clone(),
            task_type.clone(),
            start,
            period.map(|p| p.as_millis() as u64),
        );

        // Prefer recycling a free slot over growing the namespace.
        let (obj_id, reused) = match self.pool_take(&owner) {
            Some(obj_id) => {
                txn.tx()
                    .update(obj_id, Arc::new(record.clone()))
                    .map_err(store_fatal)?;
                (obj_id, true)
            }
            None => {
                let obj_id = txn.tx().create(Arc::new(record.clone()));
                (obj_id, false)
            }
        };
        let name = pending_key(&owner, obj_id);
        if !reused {
            txn.tx().set_binding(&name, obj_id);
        }
        if reused {
            self.txn_state(txn)
                .pool_takes
                .push((owner.clone(), obj_id));
        }

        match self.place(txn, &owner, &name)? {
            Placement::HandedOff => {
                debug!(task = %task_type, %owner, "durable task handed off");
            }
            Placement::Local { skip_check } => {
                self.admit_local(txn, &record, obj_id, &owner, &task_type, skip_check)?;
            }
        }
        Ok((obj_id, name, owner))
    }

    /// Put a locally-owned record on the local scheduler, deferring
    /// visibility to commit.
    fn admit_local(
        self: &Arc<Self>,
        txn: &mut Txn,
        record: &PendingTask,
        obj_id: ObjId,
        owner: &Identity,
        task_type: &str,
        skip_check: bool,
    ) -> Result<(), TaskError> {
        let body = Arc::new(TaskRunner {
            service: self.clone(),
            obj_id,
            identity: owner.clone(),
            task_type: task_type.to_string(),
            skip_first_check: AtomicBool::new(skip_check),
        });
        if let Some(period_ms) = record.period() {
            // Stamp ownership of the recurrence chain.
            txn.tx()
                .update(
                    obj_id,
                    Arc::new(record.with_running_node(Some(self.node_id))),
                )
                .map_err(store_fatal)?;
            let task = ScheduledTask::recurring(
                body,
                owner.clone(),
                record.start_time(),
                Duration::from_millis(period_ms),
            );
            let handle = self.app.add_recurring_task(task);
            let state = self.txn_state(txn);
            state.recurring_starts.push((obj_id, owner.clone(), handle));
            state.track_active.push(obj_id);
            state.status_deltas.push((owner.clone(), 1));
        } else {
            let task = ScheduledTask::starting_at(body, owner.clone(), record.start_time());
            let reservation = self
                .app
                .reserve_task(task)
                .map_err(|e| TaskError::fatal(e.to_string()))?;
            let state = self.txn_state(txn);
            state.reservations.push(reservation);
            state.track_active.push(obj_id);
            state.status_deltas.push((owner.clone(), 1));
        }
        Ok(())
    }

    /// Decide where a record runs: here, or in another node's hand-off set.
    fn place(
        self: &Arc<Self>,
        txn: &mut Txn,
        owner: &Identity,
        binding: &str,
    ) -> Result<Placement, TaskError> {
        if self.is_mapped_locally(owner) {
            return Ok(Placement::Local { skip_check: false });
        }
        match self.mapping.get_node_in(txn, owner) {
            Ok(node) if node == self.node_id => Ok(Placement::Local { skip_check: false }),
            Ok(node) if self.directory.is_alive(node) => {
                self.add_handoff(txn, node, binding)?;
                Ok(Placement::HandedOff)
            }
            Ok(dead) => {
                debug!(%owner, node = dead, "owner mapped to dead node; running locally");
                self.async_assign(owner.clone());
                Ok(Placement::Local { skip_check: true })
            }
            Err(MappingError::UnknownIdentity(_)) => {
                self.async_assign(owner.clone());
                Ok(Placement::Local { skip_check: true })
            }
            Err(e) => {
                warn!(%owner, error = %e, "mapping lookup failed; running locally");
                self.async_assign(owner.clone());
                Ok(Placement::Local { skip_check: true })
            }
        }
    }

    fn add_handoff(&self, txn: &mut Txn, node: NodeId, binding: &str) -> Result<(), TaskError> {
        match txn.tx().get_binding(&handoff_key(node)) {
            Ok(obj) => {
                let value = txn.tx().resolve(obj).map_err(store_fatal)?;
                let mut set = downcast::<HandoffSet>(&value).cloned().unwrap_or_default();
                set.0.insert(binding.to_string());
                txn.tx().update(obj, Arc::new(set)).map_err(store_fatal)?;
                Ok(())
            }
            // Destination still booting. The record stays persisted; the new
            // node finds it through the mapping-added restart scan.
            Err(StoreError::NameNotBound(_)) => {
                debug!(node, "destination hand-off set missing; entry skipped");
                Ok(())
            }
            Err(e) => Err(store_fatal(e)),
        }
    }

    fn async_assign(self: &Arc<Self>, owner: Identity) {
        let mapping = self.mapping.clone();
        self.schedule_non_durable(
            Arc::new(FnTask(move || {
                if let Err(e) = mapping.assign_node(TASK_SERVICE, &owner) {
                    debug!(%owner, error = %e, "async assignment attempt failed");
                }
                Ok(())
            })),
            None,
        );
    }

    // ---- execution path ----

    fn run_pending(self: &Arc<Self>, runner: &TaskRunner) -> Result<(), TaskError> {
        let skip_check = runner.skip_first_check.swap(false, Ordering::SeqCst);
        if !skip_check && !self.is_mapped_locally(&runner.identity) {
            // Ownership moved while we were queued.
            self.cancel_local(runner.obj_id, &runner.identity);
            return Ok(());
        }
        let outcome = self.runner.run(|txn| {
            let value = match txn.tx().resolve(runner.obj_id) {
                Ok(value) => value,
                Err(StoreError::ObjectNotFound(_)) => return Ok(RunOutcome::Gone),
                Err(e) => return Err(store_fatal(e)),
            };
            let record = downcast::<PendingTask>(&value)
                .ok_or_else(|| TaskError::fatal("corrupt pending task record"))?
                .clone();
            if record.is_reusable() {
                return Ok(RunOutcome::Placeholder);
            }
            if record.period().is_some() && record.running_node() != Some(self.node_id) {
                return Ok(RunOutcome::StaleNode);
            }
            let body: Arc<dyn DurableTask> = match record.payload() {
                Some(TaskPayload::Inline(task)) => task.clone(),
                Some(TaskPayload::External(obj)) => match txn.tx().resolve(*obj) {
                    Ok(value) => downcast::<Arc<dyn DurableTask>>(&value)
                        .cloned()
                        .ok_or_else(|| TaskError::fatal("external object is not a durable task"))?,
                    Err(StoreError::ObjectNotFound(_)) => {
                        // The application deleted its object; retire the
                        // record as if the task had completed. External
                        // records are always one-shot.
                        txn.tx()
                            .update(runner.obj_id, Arc::new(PendingTask::cleared()))
                            .map_err(store_fatal)?;
                        let state = self.txn_state(txn);
                        state
                            .pool_returns
                            .push((runner.identity.clone(), runner.obj_id));
                        state.untrack_active.push(runner.obj_id);
                        state.status_deltas.push((runner.identity.clone(), -1));
                        return Ok(RunOutcome::RemovedByApp);
                    }
                    Err(e) => return Err(store_fatal(e)),
                },
                None => return Ok(RunOutcome::Placeholder),
            };
            body.run(txn)?;
            if record.period().is_some() {
                txn.tx()
                    .update(runner.obj_id, Arc::new(record.with_last_start(now_millis())))
                    .map_err(store_fatal)?;
            } else {
                txn.tx()
                    .update(runner.obj_id, Arc::new(PendingTask::cleared()))
                    .map_err(store_fatal)?;
                let state = self.txn_state(txn);
                state
                    .pool_returns
                    .push((runner.identity.clone(), runner.obj_id));
                state.untrack_active.push(runner.obj_id);
                state.status_deltas.push((runner.identity.clone(), -1));
            }
            Ok(RunOutcome::Done)
        });
        match outcome {
            Ok(RunOutcome::Done | RunOutcome::Placeholder | RunOutcome::RemovedByApp) => Ok(()),
            Ok(RunOutcome::Gone | RunOutcome::StaleNode) => {
                self.cancel_local(runner.obj_id, &runner.identity);
                Ok(())
            }
            Err(e) => {
                // The failing transaction aborted, so the record would stay
                // marked in-use forever without out-of-band cleanup.
                warn!(task = %runner.task_type, error = %e, "durable task failed");
                self.schedule_cleanup(runner.obj_id, runner.identity.clone());
                Err(e)
            }
        }
    }

    /// Best-effort post-failure cleanup: return a one-shot record to the
    /// reusable pool even though its execution transaction aborted.
    fn schedule_cleanup(self: &Arc<Self>, obj_id: ObjId, identity: Identity) {
        let svc = self.clone();
        self.schedule_non_durable(
            Arc::new(FnTask(move || {
                let result = svc.runner.run(|txn| {
                    let value = match txn.tx().resolve(obj_id) {
                        Ok(value) => value,
                        Err(_) => return Ok(()),
                    };
                    let Some(record) = downcast::<PendingTask>(&value) else {
                        return Ok(());
                    };
                    if record.period().is_some() || record.is_reusable() {
                        return Ok(());
                    }
                    txn.tx()
                        .update(obj_id, Arc::new(PendingTask::cleared()))
                        .map_err(store_fatal)?;
                    let state = svc.txn_state(txn);
                    state.pool_returns.push((identity.clone(), obj_id));
                    state.untrack_active.push(obj_id);
                    state.status_deltas.push((identity.clone(), -1));
                    Ok(())
                });
                if let Err(e) = result {
                    warn!(obj_id, error = %e, "non-retry cleanup failed");
                }
                Ok(())
            })),
            None,
        );
    }

    /// Stop local tracking of a record whose execution no longer belongs
    /// here.
    fn cancel_local(self: &Arc<Self>, obj_id: ObjId, identity: &Identity) {
        self.untrack_active_obj(obj_id);
        self.untrack_recurring(obj_id);
        self.adjust_status(identity, -1);
    }

    // ---- hand-off ----

    fn handoff_scan(self: &Arc<Self>) {
        let key = handoff_key(self.node_id);
        let claimed = self.runner.run(|txn| {
            let obj = match txn.tx().get_binding(&key) {
                Ok(obj) => obj,
                Err(StoreError::NameNotBound(_)) => return Ok(Vec::new()),
                Err(e) => return Err(store_fatal(e)),
            };
            let value = txn.tx().resolve(obj).map_err(store_fatal)?;
            let set = downcast::<HandoffSet>(&value).cloned().unwrap_or_default();
            if set.0.is_empty() {
                return Ok(Vec::new());
            }
            txn.tx()
                .update(obj, Arc::new(HandoffSet::default()))
                .map_err(store_fatal)?;
            Ok(set.0.into_iter().collect::<Vec<_>>())
        });
        match claimed {
            Ok(names) => {
                for name in names {
                    debug!(name, "claimed handed-off task");
                    let svc = self.clone();
                    self.schedule_non_durable(
                        Arc::new(FnTask(move || {
                            svc.restart_binding(&name);
                            Ok(())
                        })),
                        None,
                    );
                }
            }
            Err(e) => warn!(error = %e, "hand-off scan failed"),
        }
    }

    /// Resume one persisted record on this node: after a hand-off, a mapping
    /// move, or recovery.
    fn restart_binding(self: &Arc<Self>, name: &str) {
        let result = self.runner.run(|txn| {
            let obj_id = match txn.tx().get_binding(name) {
                Ok(obj_id) => obj_id,
                Err(StoreError::NameNotBound(_)) => return Ok(()),
                Err(e) => return Err(store_fatal(e)),
            };
            let value = match txn.tx().resolve(obj_id) {
                Ok(value) => value,
                Err(StoreError::ObjectNotFound(_)) => return Ok(()),
                Err(e) => return Err(store_fatal(e)),
            };
            let record = downcast::<PendingTask>(&value)
                .ok_or_else(|| TaskError::fatal("corrupt pending task record"))?
                .clone();
            // Already admitted locally; a restart would queue it twice.
            if self.state.lock().unwrap().active.contains(&obj_id) {
                return Ok(());
            }
            if record.is_reusable() {
                // Free slot: track it for reuse. Cleared records carry no
                // owner, so recover it from the binding name.
                if let Some(owner) = pending_owner(name) {
                    let state = self.txn_state(txn);
                    state.pool_returns.push((owner, obj_id));
                }
                return Ok(());
            }
            let Some(owner) = record.owner().cloned() else {
                return Err(TaskError::fatal("active pending record with no owner"));
            };
            if !self.is_mapped_locally(&owner) {
                // Mapping moved again before we got here; hand off again.
                if let Placement::HandedOff = self.place(txn, &owner, name)? {
                    return Ok(());
                }
            }
            match record.period() {
                Some(period_ms) => {
                    // Best-effort cadence reconstruction: next occurrence on
                    // the original schedule that is still in the future.
                    let last = record.last_start().unwrap_or(record.start_time());
                    let now = now_millis();
                    let next = if last >= now {
                        last
                    } else {
                        last + period_ms * ((now - last) / period_ms + 1)
                    };
                    txn.tx()
                        .update(obj_id, Arc::new(record.with_running_node(Some(self.node_id))))
                        .map_err(store_fatal)?;
                    let body = Arc::new(TaskRunner {
                        service: self.clone(),
                        obj_id,
                        identity: owner.clone(),
                        task_type: record.task_type().to_string(),
                        skip_first_check: AtomicBool::new(true),
                    });
                    let task = ScheduledTask::recurring(
                        body,
                        owner.clone(),
                        next,
                        Duration::from_millis(period_ms),
                    );
                    let handle = self.app.add_recurring_task(task);
                    let state = self.txn_state(txn);
                    state.recurring_starts.push((obj_id, owner.clone(), handle));
                    state.track_active.push(obj_id);
                    state.status_deltas.push((owner, 1));
                }
                None => {
                    let body = Arc::new(TaskRunner {
                        service: self.clone(),
                        obj_id,
                        identity: owner.clone(),
                        task_type: record.task_type().to_string(),
                        skip_first_check: AtomicBool::new(true),
                    });
                    let task = ScheduledTask::starting_at(body, owner.clone(), record.start_time());
                    let reservation = self
                        .app
                        .reserve_task(task)
                        .map_err(|e| TaskError::fatal(e.to_string()))?;
                    let state = self.txn_state(txn);
                    state.reservations.push(reservation);
                    state.track_active.push(obj_id);
                    state.status_deltas.push((owner, 1));
                }
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!(name, error = %e, "restart of persisted task failed");
        }
    }

    // ---- mapping callbacks ----

    pub(crate) fn mapping_added(self: &Arc<Self>, identity: &Identity, _old_node: Option<NodeId>) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.mapped.insert(identity.clone()) {
                return;
            }
        }
        debug!(%identity, node = self.node_id, "identity mapped here; restarting persisted tasks");
        let svc = self.clone();
        let identity = identity.clone();
        self.schedule_non_durable(
            Arc::new(FnTask(move || {
                svc.restart_identity_tasks(&identity);
                Ok(())
            })),
            None,
        );
    }

    pub(crate) fn mapping_removed(self: &Arc<Self>, identity: &Identity, new_node: Option<NodeId>) {
        let locally_active = {
            let state = self.state.lock().unwrap();
            state
                .counts
                .get(identity)
                .map(|info| info.count > 0)
                .unwrap_or(false)
        };
        if locally_active && new_node.is_none() {
            // Work still running and the identity is being dropped outright;
            // push back with a fresh assignment rather than abandon it.
            self.async_assign(identity.clone());
            return;
        }
        let handles: Vec<RecurringHandle> = {
            let mut state = self.state.lock().unwrap();
            state.mapped.remove(identity);
            state.pool.remove(identity);
            let stale: Vec<ObjId> = state
                .recurring
                .iter()
                .filter(|(_, d)| &d.identity == identity)
                .map(|(obj_id, _)| *obj_id)
                .collect();
            stale
                .into_iter()
                .filter_map(|obj_id| state.recurring.remove(&obj_id))
                .map(|d| d.handle)
                .collect()
        };
        for handle in handles {
            let _ = handle.cancel();
        }
        if new_node.is_none() {
            self.purge_identity_records(identity);
        } else if locally_active {
            // Still draining local work; keep the mapping alive from here.
            if let Err(e) = self.mapping.set_status(TASK_SERVICE, identity, true) {
                debug!(%identity, error = %e, "could not re-vote active during drain");
            }
        }
    }

    fn restart_identity_tasks(self: &Arc<Self>, identity: &Identity) {
        let prefix = pending_prefix(identity);
        let names = self
            .runner
            .run(|txn| Ok(scan_prefix(txn.tx(), &prefix)))
            .unwrap_or_default();
        for name in names {
            self.restart_binding(&name);
        }
    }

    /// Permanent removal: the records themselves go away, not just the local
    /// tracking.
    fn purge_identity_records(self: &Arc<Self>, identity: &Identity) {
        let prefix = pending_prefix(identity);
        let result = self.runner.run(|txn| {
            for name in scan_prefix(txn.tx(), &prefix) {
                if let Ok(obj_id) = txn.tx().get_binding(&name) {
                    let _ = txn.tx().remove_binding(&name);
                    let _ = txn.tx().remove_object(obj_id);
                }
            }
            Ok(())
        });
        match result {
            Ok(()) => info!(%identity, "purged durable tasks for removed identity"),
            Err(e) => warn!(%identity, error = %e, "purge of removed identity failed"),
        }
        let mut state = self.state.lock().unwrap();
        if let Some(mut info) = state.counts.remove(identity)
            && let Some(vote) = info.pending_vote.take()
        {
            vote.timer.cancel();
        }
    }

    // ---- recovery ----

    /// A peer died: its hand-off set will never be scanned again, so tear it
    /// down. Idempotent; a second recovery finds nothing.
    pub(crate) fn peer_node_failed(self: &Arc<Self>, node: NodeId) {
        if node == self.node_id {
            return;
        }
        let key = handoff_key(node);
        let result = self.runner.run(|txn| {
            match txn.tx().get_binding(&key) {
                Ok(obj) => {
                    let _ = txn.tx().remove_binding(&key);
                    let _ = txn.tx().remove_object(obj);
                }
                Err(StoreError::NameNotBound(_)) => {}
                Err(e) => return Err(store_fatal(e)),
            }
            Ok(())
        });
        match result {
            Ok(()) => debug!(node, "recovered peer hand-off set"),
            Err(e) => warn!(node, error = %e, "peer recovery failed"),
        }
    }

    // ---- local bookkeeping ----

    fn is_mapped_locally(&self, identity: &Identity) -> bool {
        self.state.lock().unwrap().mapped.contains(identity)
    }

    fn pool_take(&self, identity: &Identity) -> Option<ObjId> {
        self.state.lock().unwrap().pool.get_mut(identity)?.pop()
    }

    fn pool_return(&self, identity: &Identity, obj_id: ObjId) {
        let mut state = self.state.lock().unwrap();
        let slots = state.pool.entry(identity.clone()).or_default();
        if !slots.contains(&obj_id) {
            slots.push(obj_id);
        }
    }

    fn track_active_obj(&self, obj_id: ObjId) {
        self.state.lock().unwrap().active.insert(obj_id);
    }

    fn untrack_active_obj(&self, obj_id: ObjId) {
        self.state.lock().unwrap().active.remove(&obj_id);
    }

    fn track_recurring(&self, obj_id: ObjId, identity: Identity, handle: RecurringHandle) {
        self.state
            .lock()
            .unwrap()
            .recurring
            .insert(obj_id, RecurringDetail { identity, handle });
    }

    fn untrack_recurring(&self, obj_id: ObjId) {
        let detail = self.state.lock().unwrap().recurring.remove(&obj_id);
        if let Some(detail) = detail {
            let _ = detail.handle.cancel();
        }
    }

    /// Fold `delta` into the identity's local task count and keep the
    /// debounced vote machinery consistent: a flip schedules a delayed vote,
    /// a flip-back cancels it outright.
    fn adjust_status(self: &Arc<Self>, identity: &Identity, delta: i64) {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        let info = state.counts.entry(identity.clone()).or_insert(StatusInfo {
            count: 0,
            voted_active: false,
            pending_vote: None,
        });
        info.count += delta;
        if info.count < 0 {
            // A handle cancel and a gone-record cancel can race to the same
            // decrement; floor rather than wedge the count negative.
            debug!(%identity, count = info.count, "status count underflow");
            info.count = 0;
        }
        let desired_active = info.count > 0;
        if desired_active == info.voted_active {
            // Flip-back before the debounce fired: drop the vote entirely.
            if let Some(vote) = info.pending_vote.take() {
                vote.timer.cancel();
            }
            return;
        }
        if let Some(vote) = &info.pending_vote
            && vote.target_active == desired_active
        {
            return;
        }
        if let Some(vote) = info.pending_vote.take() {
            vote.timer.cancel();
        }
        let svc = self.clone();
        let id = identity.clone();
        let timer = self.timer.schedule_after(
            self.vote_delay,
            Box::new(move || {
                let inner = svc.clone();
                let vote_id = id.clone();
                // Bounce off the scheduler; the vote does a full transaction
                // and must not run on the timer dispatch thread.
                svc.schedule_non_durable(
                    Arc::new(FnTask(move || {
                        inner.cast_vote(&vote_id);
                        Ok(())
                    })),
                    None,
                );
            }),
        );
        info.pending_vote = Some(PendingVote {
            target_active: desired_active,
            timer,
        });
    }

    fn cast_vote(self: &Arc<Self>, identity: &Identity) {
        let active = {
            let mut state = self.state.lock().unwrap();
            let Some(info) = state.counts.get_mut(identity) else {
                return;
            };
            info.pending_vote = None;
            let active = info.count > 0;
            if active == info.voted_active {
                // Stale fire; the state flipped back already.
                return;
            }
            info.voted_active = active;
            active
        };
        match self.mapping.set_status(TASK_SERVICE, identity, active) {
            Ok(()) => debug!(%identity, active, "status vote cast"),
            Err(MappingError::UnknownIdentity(_)) if active => {
                // Active work here but no mapping anywhere; claim it.
                if let Err(e) = self.mapping.assign_node(TASK_SERVICE, identity) {
                    warn!(%identity, error = %e, "re-assignment after unknown-identity vote failed");
                }
            }
            Err(e) => warn!(%identity, active, error = %e, "status vote failed"),
        }
    }

    #[cfg(test)]
    pub(crate) fn test_local_count(&self, identity: &Identity) -> i64 {
        self.state
            .lock()
            .unwrap()
            .counts
            .get(identity)
            .map(|i| i.count)
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn test_pool_len(&self, identity: &Identity) -> usize {
        self.state
            .lock()
            .unwrap()
            .pool
            .get(identity)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

/// Adapter registering the task service for mapping-change callbacks.
pub struct TaskMappingListener(pub Arc<TaskService>);

impl MappingListener for TaskMappingListener {
    fn mapping_added(&self, identity: &Identity, old_node: Option<NodeId>) {
        self.0.mapping_added(identity, old_node);
    }

    fn mapping_removed(&self, identity: &Identity, new_node: Option<NodeId>) {
        self.0.mapping_removed(identity, new_node);
    }
}

/// Adapter registering the task service for peer-failure recovery.
pub struct TaskRecoveryListener(pub Arc<TaskService>);

impl NodeFailureListener for TaskRecoveryListener {
    fn node_failed(&self, node: Node) {
        self.0.peer_node_failed(node.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::nodemap::{NodeMappingServer, RoundRobinPolicy};
    use crate::sched::{SystemScheduler, TaskExecutor};
    use meridian_store::MemStore;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct CountTask {
        runs: Arc<AtomicUsize>,
        fresh_identity: bool,
    }

    impl DurableTask for CountTask {
        fn name(&self) -> &str {
            "count"
        }

        fn new_identity(&self) -> bool {
            self.fresh_identity
        }

        fn run(&self, _txn: &mut Txn) -> Result<(), TaskError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        runner: TxnRunner,
        server: Arc<NodeMappingServer>,
        tasks: Arc<TaskService>,
        timer: Arc<TimerQueue>,
        executor: TaskExecutor,
    }

    impl Harness {
        fn pending_count(&self, owner: &Identity) -> usize {
            self.runner
                .run(|txn| Ok(scan_prefix(txn.tx(), &pending_prefix(owner)).len()))
                .unwrap()
        }
    }

    fn harness() -> Harness {
        let store = MemStore::new();
        let directory = Arc::new(NodeDirectory::new());
        directory.register(1);
        let server = NodeMappingServer::start(
            store.clone(),
            directory.clone(),
            Box::new(RoundRobinPolicy::new(false)),
            Duration::from_millis(5000),
        );
        let timer = TimerQueue::new();
        let config = Config {
            vote_delay: Duration::from_millis(30),
            handoff_start: Duration::from_millis(50),
            handoff_period: Duration::from_millis(50),
            ..Config::default()
        };
        let scheduler = SystemScheduler::new(&config, timer.clone());
        let runner = TxnRunner::new(store);
        let mapping = NodeMappingService::new(
            1,
            runner.clone(),
            server.clone(),
            directory.clone(),
            scheduler.app_scheduler("nodemap"),
        );
        let tasks = TaskService::new(
            1,
            runner.clone(),
            scheduler.app_scheduler("task"),
            timer.clone(),
            mapping.clone(),
            directory,
            &config,
        );
        mapping.add_listener(Arc::new(TaskMappingListener(tasks.clone())));
        tasks.ready().unwrap();
        let executor = TaskExecutor::start(scheduler, 2);
        Harness {
            runner,
            server,
            tasks,
            timer,
            executor,
        }
    }

    fn teardown(h: Harness) {
        h.tasks.shutdown();
        h.executor.shutdown();
        h.server.shutdown();
        h.timer.shutdown();
    }

    #[test]
    fn one_shot_executes_and_recycles_its_record() {
        let h = harness();
        let owner = Identity::named("fred");
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        h.runner
            .run(|txn| {
                h.tasks.schedule_task(
                    txn,
                    &owner,
                    Arc::new(CountTask {
                        runs: r.clone(),
                        fresh_identity: false,
                    }),
                )
            })
            .unwrap();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(h.tasks.test_local_count(&owner), 0);
        assert_eq!(h.tasks.test_pool_len(&owner), 1);
        assert_eq!(h.pending_count(&owner), 1);

        // The next submission reuses the cleared slot instead of growing the
        // namespace.
        let r2 = runs.clone();
        h.runner
            .run(|txn| {
                h.tasks.schedule_task(
                    txn,
                    &owner,
                    Arc::new(CountTask {
                        runs: r2.clone(),
                        fresh_identity: false,
                    }),
                )
            })
            .unwrap();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(h.pending_count(&owner), 1);
        teardown(h);
    }

    #[test]
    fn aborted_schedule_leaves_nothing_behind() {
        let h = harness();
        let owner = Identity::named("fred");
        let runs = Arc::new(AtomicUsize::new(0));
        let mut txn = Txn::begin(h.runner.store().as_ref());
        h.tasks
            .schedule_task(
                &mut txn,
                &owner,
                Arc::new(CountTask {
                    runs: runs.clone(),
                    fresh_identity: false,
                }),
            )
            .unwrap();
        txn.abort(false);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(h.tasks.test_local_count(&owner), 0);
        assert_eq!(h.pending_count(&owner), 0);
        teardown(h);
    }

    #[test]
    fn periodic_task_recurs_until_cancelled() {
        let h = harness();
        let owner = Identity::named("fred");
        let runs = Arc::new(AtomicUsize::new(0));
        let body: Arc<dyn DurableTask> = Arc::new(CountTask {
            runs: runs.clone(),
            fresh_identity: false,
        });
        let handle = h
            .runner
            .run(|txn| {
                h.tasks.schedule_periodic_task(
                    txn,
                    &owner,
                    body.clone(),
                    Duration::ZERO,
                    Duration::from_millis(80),
                )
            })
            .unwrap();
        thread::sleep(Duration::from_millis(300));
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "saw only {seen} occurrences");
        h.runner.run(|txn| handle.cancel(txn)).unwrap();
        thread::sleep(Duration::from_millis(300));
        let after = runs.load(Ordering::SeqCst);
        assert!(after <= seen + 1, "kept running after cancel");
        assert_eq!(h.pending_count(&owner), 0);

        // A second cancel finds the record gone.
        assert!(h.runner.run(|txn| handle.cancel(txn)).is_err());
        teardown(h);
    }

    struct SnapshotTask {
        service: Arc<TaskService>,
        owner: Identity,
        observed: Arc<AtomicUsize>,
    }

    impl DurableTask for SnapshotTask {
        fn name(&self) -> &str {
            "snapshot"
        }

        fn run(&self, _txn: &mut Txn) -> Result<(), TaskError> {
            self.observed.store(
                self.service.test_local_count(&self.owner) as usize,
                Ordering::SeqCst,
            );
            Ok(())
        }
    }

    #[test]
    fn active_count_is_visible_before_first_execution() {
        let h = harness();
        let owner = Identity::named("fred");
        let observed = Arc::new(AtomicUsize::new(usize::MAX));
        let task = Arc::new(SnapshotTask {
            service: h.tasks.clone(),
            owner: owner.clone(),
            observed: observed.clone(),
        });
        h.runner
            .run(|txn| h.tasks.schedule_task(txn, &owner, task.clone()))
            .unwrap();
        thread::sleep(Duration::from_millis(300));
        // The scheduling commit applies the count before admitting the task,
        // so the body always sees itself counted.
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert_eq!(h.tasks.test_local_count(&owner), 0);
        teardown(h);
    }

    #[test]
    fn external_task_runs_from_its_managed_object() {
        let h = harness();
        let owner = Identity::named("fred");
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        h.runner
            .run(|txn| {
                let payload: Arc<dyn DurableTask> = Arc::new(CountTask {
                    runs: r.clone(),
                    fresh_identity: false,
                });
                let obj = txn.tx().create(Arc::new(payload));
                h.tasks.schedule_external_task(txn, &owner, obj)
            })
            .unwrap();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(h.tasks.test_local_count(&owner), 0);
        assert_eq!(h.tasks.test_pool_len(&owner), 1);
        teardown(h);
    }

    #[test]
    fn external_task_removed_by_application_is_tolerated() {
        let h = harness();
        let owner = Identity::named("fred");
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        h.runner
            .run(|txn| {
                let payload: Arc<dyn DurableTask> = Arc::new(CountTask {
                    runs: r.clone(),
                    fresh_identity: false,
                });
                let obj = txn.tx().create(Arc::new(payload));
                h.tasks.schedule_external_task(txn, &owner, obj)?;
                // The application deletes its own object before the task
                // gets to run.
                txn.tx().remove_object(obj).map_err(store_fatal)
            })
            .unwrap();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(h.tasks.test_local_count(&owner), 0);
        // The record is retired to the reusable pool, not leaked.
        assert_eq!(h.tasks.test_pool_len(&owner), 1);
        assert_eq!(h.pending_count(&owner), 1);
        teardown(h);
    }

    #[test]
    fn new_identity_task_runs_under_minted_owner() {
        let h = harness();
        let owner = Identity::named("fred");
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        h.runner
            .run(|txn| {
                h.tasks.schedule_task(
                    txn,
                    &owner,
                    Arc::new(CountTask {
                        runs: r.clone(),
                        fresh_identity: true,
                    }),
                )
            })
            .unwrap();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // Nothing accrued to the submitting owner.
        assert_eq!(h.tasks.test_local_count(&owner), 0);
        assert_eq!(h.tasks.test_pool_len(&owner), 0);
        assert_eq!(h.pending_count(&owner), 0);
        teardown(h);
    }
}
