//! The pipeline coordinator.
//!
//! `Pipeline` owns the tree, the active executor and all scheduling state.
//! It lives on one control thread: every public mutation applies its change
//! to the tree and then drains the tree's event queue before returning, and
//! executor results arrive as [`ExecutorMessage`]s that are folded back in by
//! [`Pipeline::handle_executor_message`]. Nothing here blocks except the
//! explicit [`Pipeline::wait_until_idle`].
//!
//! # Dispatch
//!
//! At most one execution request is in flight. When a chain finishes, its
//! output is folded into the chain's output node and every branch below it
//! that carries operators of its own is run next (the cascade). Once the
//! cascade ends, staleness introduced meanwhile is re-evaluated and may
//! dispatch again.

use crate::config::{ExecutionMode, PipelineSettings};
use crate::executor::{
    create_executor, ChainStep, ExecutionRequest, ExecutorEvent, ExecutorMessage,
    PipelineExecutor, SnapshotRequest, VolumeFuture,
};
use crate::pipeline::data_source::{Module, Persistence};
use crate::pipeline::edit::EditSession;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::event::{
    Dispatch, PipelineNotification, RunFuture, RunOutcome, SkipReason, TreeEvent,
};
use crate::pipeline::id::{DataSourceId, OperatorId, RunId};
use crate::pipeline::operator::{Operator, OperatorState};
use crate::pipeline::tree::{PipelineTree, OUTPUT_LABEL};
use crate::transforms::AnyTransform;
use crate::volume::{Volume, VolumeProperties};
use crossbeam_channel::{unbounded, Receiver, Sender, TrySendError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Callback run once the in-flight run has been torn down.
pub type CancelCallback = Box<dyn FnOnce(&mut Pipeline) + Send>;

/// Work that belongs to one top-level `execute` call.
#[derive(Debug)]
struct Cascade {
    /// Data source the triggering `execute` targeted.
    origin: DataSourceId,
    /// Branch chains still to run.
    pending: VecDeque<DataSourceId>,
    /// Removed operators that were pulled out of the in-flight run.
    excised_removals: usize,
    /// Chain to re-run once the cascade completes.
    rerun: Option<DataSourceId>,
    cancel_requested: bool,
}

impl Cascade {
    fn new(origin: DataSourceId) -> Self {
        Self {
            origin,
            pending: VecDeque::new(),
            excised_removals: 0,
            rerun: None,
            cancel_requested: false,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    run: RunId,
    data_source: DataSourceId,
    /// Operators of the request with the revision they were dispatched at.
    operators: Vec<(OperatorId, u64)>,
    completed: HashSet<OperatorId>,
    cascade: Cascade,
}

impl InFlight {
    fn contains(&self, op: OperatorId) -> bool {
        self.operators.iter().any(|(o, _)| *o == op)
    }

    fn unfinished(&self) -> impl Iterator<Item = OperatorId> + '_ {
        self.operators
            .iter()
            .map(|(o, _)| *o)
            .filter(|o| !self.completed.contains(o))
    }
}

/// Where and from which index a chain will run.
struct Plan {
    data_source: DataSourceId,
    start_index: usize,
    volume: Volume,
}

enum Terminal {
    Finished,
    Canceled,
    Failed(String),
}

struct Waiter {
    target: DataSourceId,
    tx: Sender<RunOutcome>,
}

/// Execution coordinator for one pipeline tree.
pub struct Pipeline {
    tree: PipelineTree,
    settings: PipelineSettings,
    executor: Box<dyn PipelineExecutor>,
    msg_tx: Sender<ExecutorMessage>,
    msg_rx: Receiver<ExecutorMessage>,
    paused: bool,
    editing_operators: usize,
    /// Data sources whose chain lost a run operator since the last dispatch.
    deleted_from: HashSet<DataSourceId>,
    last_run: RunId,
    in_flight: Option<InFlight>,
    cancel_callbacks: Vec<CancelCallback>,
    waiters: Vec<Waiter>,
    subscribers: Vec<Sender<PipelineNotification>>,
    pub(crate) edit_sessions: HashMap<OperatorId, EditSession>,
}

impl Pipeline {
    /// Create a pipeline over `volume` with the executor selected by `settings`.
    pub fn new(volume: Volume, properties: VolumeProperties, settings: PipelineSettings) -> Self {
        let executor = create_executor(&settings);
        Self::with_executor(volume, properties, settings, executor)
    }

    /// Create a pipeline driving a caller-supplied executor.
    pub fn with_executor(
        volume: Volume,
        properties: VolumeProperties,
        settings: PipelineSettings,
        executor: Box<dyn PipelineExecutor>,
    ) -> Self {
        let (msg_tx, msg_rx) = unbounded();
        Self {
            tree: PipelineTree::new("Root", volume, properties),
            settings,
            executor,
            msg_tx,
            msg_rx,
            paused: false,
            editing_operators: 0,
            deleted_from: HashSet::new(),
            last_run: RunId::default(),
            in_flight: None,
            cancel_callbacks: Vec::new(),
            waiters: Vec::new(),
            subscribers: Vec::new(),
            edit_sessions: HashMap::new(),
        }
    }

    // ==================== Accessors ====================

    pub fn tree(&self) -> &PipelineTree {
        &self.tree
    }

    pub fn root(&self) -> DataSourceId {
        self.tree.root()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.executor.kind()
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    /// Whether an execution request is in flight.
    pub fn is_running(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Number of operators currently under an edit session.
    pub fn editing_operators(&self) -> usize {
        self.editing_operators
    }

    /// Whether an operator was removed since the last dispatch.
    pub fn operators_deleted(&self) -> bool {
        !self.deleted_from.is_empty()
    }

    pub fn operator_state(&self, op: OperatorId) -> PipelineResult<OperatorState> {
        Ok(self.tree.op(op)?.state())
    }

    /// Subscribe to notifications. Dropped receivers are pruned lazily.
    pub fn subscribe(&mut self) -> Receiver<PipelineNotification> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn add_subscriber(&mut self, tx: Sender<PipelineNotification>) {
        self.subscribers.push(tx);
    }

    /// Receiver of executor messages, for callers multiplexing it with
    /// other channels. Each message must be passed to
    /// [`Pipeline::handle_executor_message`].
    pub fn executor_messages(&self) -> Receiver<ExecutorMessage> {
        self.msg_rx.clone()
    }

    pub(crate) fn notify(&mut self, notification: PipelineNotification) {
        self.subscribers
            .retain(|tx| match tx.try_send(notification.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("Subscriber lagging, dropped {:?}", notification);
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
    }

    // ==================== Tree mutation ====================

    /// Append an operator to the chain of `ds`.
    pub fn add_operator(
        &mut self,
        ds: DataSourceId,
        transform: impl Into<AnyTransform>,
    ) -> PipelineResult<OperatorId> {
        let op = self.tree.add_operator(ds, transform.into())?;
        self.process_events();
        Ok(op)
    }

    /// Append an operator without reacting to it yet.
    pub(crate) fn add_operator_deferred(
        &mut self,
        ds: DataSourceId,
        transform: AnyTransform,
    ) -> PipelineResult<OperatorId> {
        self.tree.add_operator(ds, transform)
    }

    /// Remove an operator. An operator under edit leaves its session first.
    pub fn remove_operator(&mut self, op: OperatorId) -> PipelineResult<()> {
        if self.tree.op_mut(op)?.finish_edit() {
            self.editing_operators = self.editing_operators.saturating_sub(1);
        }
        self.edit_sessions.remove(&op);
        self.tree.remove_operator(op)?;
        self.process_events();
        Ok(())
    }

    /// Replace the parameters of `op`.
    pub fn apply_parameters(
        &mut self,
        op: OperatorId,
        transform: impl Into<AnyTransform>,
    ) -> PipelineResult<()> {
        self.tree.apply_parameters(op, transform.into())?;
        self.process_events();
        Ok(())
    }

    /// Signal that the transform of `op` changed outside of
    /// [`Pipeline::apply_parameters`].
    pub fn transform_modified(&mut self, op: OperatorId) -> PipelineResult<()> {
        self.tree.transform_modified(op)?;
        self.process_events();
        Ok(())
    }

    /// Replace the volume of `ds`. Everything downstream becomes stale and
    /// is re-evaluated.
    pub fn set_data(&mut self, ds: DataSourceId, volume: Volume) -> PipelineResult<()> {
        for op in self.tree.subtree_operators(ds) {
            self.tree.op_mut(op)?.mark_modified();
        }
        self.tree.set_data(ds, volume)?;
        self.process_events();
        self.execute_logged(Some(ds), None);
        Ok(())
    }

    /// User edit of spacing/units. The data source stops following the root.
    pub fn set_properties(
        &mut self,
        ds: DataSourceId,
        properties: VolumeProperties,
    ) -> PipelineResult<()> {
        let by_user = ds != self.tree.root();
        self.tree.set_properties(ds, properties, by_user)?;
        self.process_events();
        Ok(())
    }

    pub fn add_module(&mut self, ds: DataSourceId, module: Module) -> PipelineResult<()> {
        self.tree.add_module(ds, module)
    }

    // ==================== Editing ====================

    /// An editing surface opened a session on `op`.
    pub fn started_editing(&mut self, op: OperatorId) -> PipelineResult<()> {
        if self.tree.op_mut(op)?.begin_edit() {
            self.editing_operators += 1;
            tracing::debug!("Editing {:?} ({} open)", op, self.editing_operators);
            self.notify_state(op);
        }
        Ok(())
    }

    /// An editing surface closed its session on `op`. When the last
    /// session closes and nothing is running, the operator's chain is
    /// re-evaluated.
    pub fn finished_editing(&mut self, op: OperatorId) -> PipelineResult<()> {
        let operator = self.tree.op_mut(op)?;
        if !operator.finish_edit() {
            return Ok(());
        }
        let input = operator.input();
        self.notify_state(op);

        if self.editing_operators > 0 {
            self.editing_operators -= 1;
            if self.editing_operators == 0 && !self.is_running() {
                self.execute_logged(Some(input), None);
            }
        }
        self.process_events();
        Ok(())
    }

    /// Whether any operator under `ds` is being edited.
    pub fn being_edited(&self, ds: DataSourceId) -> bool {
        self.tree.being_edited(ds)
    }

    /// Whether executing `ds` would dispatch anything.
    pub fn is_modified(&self, ds: DataSourceId) -> bool {
        self.operators_deleted() || self.tree.first_stale(ds).is_some()
    }

    /// First operator under `ds` that is not Complete.
    pub fn first_modified(&self, ds: DataSourceId) -> Option<OperatorId> {
        self.tree.first_stale(ds)
    }

    /// Deepest materialized output under `ds` (root when `None`).
    pub fn transformed_data_source(&self, ds: Option<DataSourceId>) -> DataSourceId {
        self.tree
            .transformed_data_source(ds.unwrap_or_else(|| self.tree.root()))
    }

    // ==================== Execution ====================

    /// Re-evaluate `ds` (root when `None`) and dispatch whatever is stale.
    ///
    /// `start` overrides the first stale operator as the start point.
    /// Returns immediately; results arrive as executor messages.
    pub fn execute(
        &mut self,
        ds: Option<DataSourceId>,
        start: Option<OperatorId>,
    ) -> PipelineResult<Dispatch> {
        let dispatch = self.execute_inner(ds, start);
        self.process_events();
        dispatch
    }

    /// Execute and return a future resolving to the terminal volume of `ds`.
    pub fn execute_future(&mut self, ds: Option<DataSourceId>) -> PipelineResult<RunFuture> {
        let (tx, future) = RunFuture::channel();
        self.execute_with_reply(ds, tx)?;
        Ok(future)
    }

    pub(crate) fn execute_with_reply(
        &mut self,
        ds: Option<DataSourceId>,
        tx: Sender<RunOutcome>,
    ) -> PipelineResult<()> {
        let target = ds.unwrap_or_else(|| self.tree.root());
        match self.execute(Some(target), None) {
            Ok(Dispatch::Started(_)) | Ok(Dispatch::Skipped(SkipReason::Running)) => {
                if self.in_flight.is_some() {
                    self.waiters.push(Waiter { target, tx });
                } else {
                    // Dispatch already resolved (e.g. the executor failed).
                    let _ = tx.send(self.output_of(target));
                }
            }
            Ok(Dispatch::Finished) | Ok(Dispatch::Skipped(SkipReason::UpToDate)) => {
                let _ = tx.send(self.output_of(target));
            }
            Ok(Dispatch::Skipped(_)) => {
                let _ = tx.send(RunOutcome::Skipped);
            }
            Err(e) => {
                let _ = tx.send(RunOutcome::Failed(e.to_string()));
                return Err(e);
            }
        }
        Ok(())
    }

    /// Compute the volume as it is right before `op` runs, off the control
    /// thread and without touching pipeline state.
    pub fn copy_of_volume_prior_to(&self, op: OperatorId) -> PipelineResult<VolumeFuture> {
        let input = self.tree.op(op)?.input();
        let index = self
            .tree
            .index_in_chain(op)
            .ok_or(PipelineError::UnknownOperator(op))?;
        let volume = self
            .tree
            .ds(input)?
            .volume()
            .cloned()
            .ok_or(PipelineError::MissingVolume(input))?;
        let steps = self.steps(&self.tree.chain(input)[..index])?;
        Ok(self.executor.snapshot_prior_to(SnapshotRequest {
            operator: op,
            volume,
            steps,
        }))
    }

    /// Stop new dispatches. A run already in flight continues.
    pub fn pause(&mut self) {
        tracing::debug!("Pipeline paused");
        self.paused = true;
    }

    /// Allow dispatch again, re-evaluating the root when `run` is set.
    pub fn resume(&mut self, run: bool) {
        self.paused = false;
        if run {
            self.execute_logged(None, None);
            self.process_events();
        }
    }

    /// Allow dispatch again and re-evaluate `ds`.
    pub fn resume_at(&mut self, ds: DataSourceId) {
        self.paused = false;
        self.execute_logged(Some(ds), None);
        self.process_events();
    }

    /// Abort the in-flight run.
    pub fn cancel(&mut self) -> bool {
        self.cancel_with(|_| {})
    }

    /// Abort the in-flight run and call `callback` once it is torn down.
    ///
    /// The callback fires on whichever terminal message for the run arrives
    /// first, so a completion racing the cancellation still releases it.
    /// With nothing running it fires immediately. Returns whether a run was
    /// in flight.
    pub fn cancel_with(&mut self, callback: impl FnOnce(&mut Pipeline) + Send + 'static) -> bool {
        match self.in_flight.as_mut() {
            Some(flight) => {
                tracing::info!("Canceling {}", flight.run);
                flight.cascade.cancel_requested = true;
                self.cancel_callbacks.push(Box::new(callback));
                if !self.executor.cancel() {
                    tracing::debug!("Executor already idle, waiting for the terminal message");
                }
                true
            }
            None => {
                callback(self);
                self.process_events();
                false
            }
        }
    }

    /// Switch strategies. The in-flight run is abandoned and its unfinished
    /// operators become Canceled.
    pub fn set_execution_mode(&mut self, mode: ExecutionMode) {
        if self.executor.kind() == mode {
            return;
        }
        let settings = self.settings.clone().with_mode(mode);
        self.set_settings(settings);
    }

    /// Apply new settings, rebuilding the executor from them.
    pub fn set_settings(&mut self, settings: PipelineSettings) {
        let executor = create_executor(&settings);
        self.settings = settings;
        self.replace_executor(executor);
    }

    /// Swap in another executor instance.
    pub fn replace_executor(&mut self, executor: Box<dyn PipelineExecutor>) {
        if self.in_flight.is_some() {
            self.executor.cancel();
            self.abandon_run();
        }
        self.executor = executor;
        let mode = self.executor.kind();
        tracing::info!("Execution mode is now {}", mode);
        self.notify(PipelineNotification::ExecutionModeChanged(mode));
        self.process_events();
    }

    // ==================== Executor messages ====================

    /// Handle every executor message that is already queued.
    pub fn process_executor_messages(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(msg) = self.msg_rx.try_recv() {
            self.handle_executor_message(msg);
            handled += 1;
        }
        handled
    }

    /// Block until no run is in flight, handling executor messages as they
    /// arrive. Returns false on timeout.
    pub fn wait_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.msg_rx.recv_timeout(remaining) {
                Ok(msg) => self.handle_executor_message(msg),
                Err(_) => return false,
            }
        }
        true
    }

    /// Fold one executor message into the tree.
    pub fn handle_executor_message(&mut self, msg: ExecutorMessage) {
        let Some(flight) = self.in_flight.as_mut().filter(|f| f.run == msg.run) else {
            tracing::debug!("Dropping {:?} from stale {}", msg.event, msg.run);
            return;
        };

        match msg.event {
            ExecutorEvent::OperatorStarted(op) => {
                tracing::debug!("{} started {:?}", msg.run, op);
            }
            ExecutorEvent::OperatorFinished { operator, child } => {
                flight.completed.insert(operator);
                let revision = flight
                    .operators
                    .iter()
                    .find(|(o, _)| *o == operator)
                    .map(|(_, r)| *r);
                if let Some(revision) = revision {
                    self.complete_operator(operator, revision);
                }
                if let Some(volume) = child {
                    self.fold_explicit_output(operator, volume);
                }
            }
            ExecutorEvent::OperatorExcised(op) => {
                tracing::debug!("{} excised {:?}", msg.run, op);
            }
            ExecutorEvent::Finished(volume) => self.handle_run_finished(volume),
            ExecutorEvent::Canceled => self.abandon_run(),
            ExecutorEvent::Failed { operator, message } => self.handle_run_failed(operator, message),
        }
        self.process_events();
    }

    /// Fold a chain's output into its output node.
    ///
    /// The tail operator gets a transient output node on first run, wired
    /// to follow the root's properties, and the chain's modules move onto
    /// it. Later runs update the node in place. A tail with an explicit
    /// output keeps it untouched. Returns the output node.
    pub fn branch_finished(
        &mut self,
        ds: DataSourceId,
        volume: Volume,
    ) -> PipelineResult<Option<DataSourceId>> {
        let chain_len = self.tree.chain(ds).len();
        let Some(&last) = self.tree.chain(ds).last() else {
            return Ok(None);
        };
        let tail = self.tree.op(last)?;

        if tail.has_explicit_child() {
            let child = tail.child().ok_or(PipelineError::UnknownOperator(last))?;
            if chain_len == 1 {
                self.tree.move_modules(ds, child)?;
            }
            self.notify(PipelineNotification::BranchFinished {
                data_source: ds,
                output: child,
            });
            return Ok(Some(child));
        }

        let (child, created) = match tail.child() {
            Some(child) => (child, false),
            None => {
                let child = self
                    .tree
                    .create_data_source(OUTPUT_LABEL, Persistence::Transient);
                self.tree.attach_child(last, child, false)?;
                let root = self.tree.root();
                let properties = self.tree.ds(root)?.properties().clone();
                self.tree.set_flows_from(child, Some(root))?;
                self.tree.ds_mut(child)?.set_properties(properties, false);
                (child, true)
            }
        };

        self.tree.set_data(child, volume)?;

        if created {
            tracing::debug!("Created output {:?} for {:?}", child, last);
            self.notify(PipelineNotification::NewChildDataSource {
                operator: last,
                data_source: child,
            });
            self.tree.move_modules(ds, child)?;
        }
        self.notify(PipelineNotification::BranchFinished {
            data_source: ds,
            output: child,
        });
        Ok(Some(child))
    }

    // ==================== Internals ====================

    pub(crate) fn execute_logged(&mut self, ds: Option<DataSourceId>, start: Option<OperatorId>) {
        match self.execute_inner(ds, start) {
            Ok(dispatch) => tracing::debug!("execute({:?}) -> {:?}", ds, dispatch),
            Err(e) => tracing::warn!("execute({:?}) failed: {}", ds, e),
        }
    }

    fn execute_inner(
        &mut self,
        ds: Option<DataSourceId>,
        start: Option<OperatorId>,
    ) -> PipelineResult<Dispatch> {
        if self.paused {
            return Ok(Dispatch::Skipped(SkipReason::Paused));
        }
        let ds = ds.unwrap_or_else(|| self.tree.root());
        self.tree.ds(ds)?;

        if self.editing_operators > 0 || self.tree.being_edited(ds) {
            return Ok(Dispatch::Skipped(SkipReason::Editing));
        }
        if self.in_flight.is_some() {
            return Ok(Dispatch::Skipped(SkipReason::Running));
        }

        if self.tree.chain(ds).is_empty() {
            // An empty chain has no branches; only its own removals are settled.
            let tree = &self.tree;
            self.deleted_from
                .retain(|&d| d != ds && tree.data_source(d).is_some());
            self.notify(PipelineNotification::Finished { data_source: ds });
            return Ok(Dispatch::Finished);
        }

        let first_modified = self.tree.first_stale(ds);
        if first_modified.is_none() && !self.operators_deleted() {
            return Ok(Dispatch::Skipped(SkipReason::UpToDate));
        }

        let plan = self.plan(ds, start.or(first_modified))?;
        let dispatch = self.dispatch(plan, Cascade::new(ds))?;
        self.deleted_from.clear();
        Ok(dispatch)
    }

    /// Decide which chain runs, from which index, on which volume.
    fn plan(&mut self, ds: DataSourceId, start: Option<OperatorId>) -> PipelineResult<Plan> {
        let mut target = ds;
        let deleted = self.operators_deleted();
        if let Some(start) = start.filter(|_| !deleted) {
            let input = self.tree.op(start)?.input();
            if input != ds
                && self.tree.ds(input)?.volume().is_some()
                && self.path_complete(input, ds)
            {
                target = input;
            }
        }

        let chain = self.tree.chain(target).to_vec();
        let mut start_index = 0;
        let mut rebased = None;

        let is_new_tail = start
            .filter(|op| chain.last() == Some(op) && chain.len() > 1)
            .map(|op| self.tree.op(op).map(Operator::is_new))
            .transpose()?
            .unwrap_or(false);

        if is_new_tail && !deleted {
            let preceding = &chain[..chain.len() - 1];
            let canceled = preceding
                .iter()
                .copied()
                .find(|&id| self.tree.operator(id).is_some_and(Operator::is_canceled));

            if let Some(canceled) = canceled {
                tracing::debug!("{:?} was canceled, re-running the whole chain", canceled);
                self.tree.op_mut(canceled)?.reset_state();
            } else if preceding
                .iter()
                .all(|&id| self.tree.operator(id).is_some_and(Operator::is_complete))
            {
                rebased = self
                    .tree
                    .chain_output_owner(target)
                    .and_then(|owner| self.tree.operator(owner).and_then(Operator::child))
                    .and_then(|out| self.tree.data_source(out))
                    .and_then(|out| out.volume().cloned());
                if rebased.is_some() {
                    start_index = chain.len() - 1;
                }
            }
        }

        let volume = match rebased {
            Some(volume) => volume,
            None => self
                .tree
                .ds(target)?
                .volume()
                .cloned()
                .ok_or(PipelineError::MissingVolume(target))?,
        };
        Ok(Plan {
            data_source: target,
            start_index,
            volume,
        })
    }

    /// Whether every chain between `ancestor` and `ds` is Complete.
    fn path_complete(&self, ds: DataSourceId, ancestor: DataSourceId) -> bool {
        let mut current = ds;
        while current != ancestor {
            let Some(producer) = self.tree.data_source(current).and_then(|d| d.producer()) else {
                return false;
            };
            let Some(parent) = self.tree.operator(producer).map(Operator::input) else {
                return false;
            };
            if !self
                .tree
                .chain(parent)
                .iter()
                .all(|&id| self.tree.operator(id).is_some_and(Operator::is_complete))
            {
                return false;
            }
            current = parent;
        }
        true
    }

    fn steps(&self, ops: &[OperatorId]) -> PipelineResult<Vec<ChainStep>> {
        ops.iter()
            .map(|&id| {
                Ok(ChainStep {
                    operator: id,
                    transform: self.tree.op(id)?.transform().clone(),
                })
            })
            .collect()
    }

    fn dispatch(&mut self, plan: Plan, cascade: Cascade) -> PipelineResult<Dispatch> {
        let chain = self.tree.chain(plan.data_source).to_vec();
        let ops = &chain[plan.start_index..];
        let steps = self.steps(ops)?;
        let operators = ops
            .iter()
            .map(|&id| Ok((id, self.tree.op(id)?.revision())))
            .collect::<PipelineResult<Vec<_>>>()?;

        let run = self.last_run.next();
        self.last_run = run;
        let request = ExecutionRequest {
            run,
            data_source: plan.data_source,
            volume: plan.volume,
            steps,
            start_index: plan.start_index,
        };

        match self.executor.execute(request, self.msg_tx.clone()) {
            Ok(()) => {
                tracing::info!(
                    "Dispatched {} on {:?} from index {} ({} operator(s))",
                    run,
                    plan.data_source,
                    plan.start_index,
                    operators.len()
                );
                self.in_flight = Some(InFlight {
                    run,
                    data_source: plan.data_source,
                    operators,
                    completed: HashSet::new(),
                    cascade,
                });
                self.notify(PipelineNotification::Started {
                    run,
                    data_source: plan.data_source,
                });
                Ok(Dispatch::Started(run))
            }
            Err(e) => {
                tracing::warn!("Executor refused {}: {}", run, e);
                let operator = match &e {
                    PipelineError::NotMarshallable { operator, .. } => Some(*operator),
                    _ => None,
                };
                self.stale_pending(&cascade);
                self.notify(PipelineNotification::Failed {
                    operator,
                    message: e.to_string(),
                });
                self.end_run(Terminal::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn complete_operator(&mut self, op: OperatorId, revision: u64) {
        if let Ok(operator) = self.tree.op_mut(op) {
            operator.mark_complete(revision);
            self.notify_state(op);
        }
    }

    fn fold_explicit_output(&mut self, op: OperatorId, volume: Volume) {
        let child = self
            .tree
            .operator(op)
            .filter(|o| o.has_explicit_child())
            .and_then(Operator::child);
        match child {
            Some(child) => {
                if let Err(e) = self.tree.set_data(child, volume) {
                    tracing::warn!("Failed to store output of {:?}: {}", op, e);
                }
            }
            None => tracing::warn!("{:?} produced an output but has no explicit child", op),
        }
    }

    fn handle_run_finished(&mut self, volume: Volume) {
        let Some(flight) = self.in_flight.take() else {
            return;
        };
        let unfinished: Vec<_> = flight
            .operators
            .iter()
            .filter(|(o, _)| !flight.completed.contains(o))
            .copied()
            .collect();
        for (op, revision) in unfinished {
            self.complete_operator(op, revision);
        }

        let mut cascade = flight.cascade;
        match self.branch_finished(flight.data_source, volume) {
            Ok(_) => {
                for &op in self.tree.chain(flight.data_source) {
                    let Some(child) = self.tree.operator(op).and_then(Operator::child) else {
                        continue;
                    };
                    if !self.tree.chain(child).is_empty() {
                        cascade.pending.push_back(child);
                    }
                }
            }
            Err(e) => tracing::warn!("Could not fold output of {}: {}", flight.run, e),
        }

        if cascade.cancel_requested {
            self.stale_pending(&cascade);
            self.notify(PipelineNotification::Finished {
                data_source: cascade.origin,
            });
            self.end_run(Terminal::Finished);
            return;
        }

        self.continue_cascade(cascade);
    }

    /// Dispatch the next branch chain, or finish the cascade.
    fn continue_cascade(&mut self, mut cascade: Cascade) {
        while let Some(next) = cascade.pending.pop_front() {
            if self.tree.data_source(next).is_none() {
                continue;
            }
            if self.paused || self.editing_operators > 0 || self.tree.being_edited(next) {
                // Input changed under it; leave it stale for a later execute.
                self.mark_subtree_modified(next);
                continue;
            }
            let Some(volume) = self.tree.data_source(next).and_then(|d| d.volume()).cloned()
            else {
                continue;
            };
            let plan = Plan {
                data_source: next,
                start_index: 0,
                volume,
            };
            if let Err(e) = self.dispatch(plan, cascade) {
                tracing::warn!("Cascade into {:?} failed: {}", next, e);
            }
            return;
        }

        tracing::info!("Execution of {:?} finished", cascade.origin);
        if cascade.excised_removals > 0 && cascade.rerun.is_none() {
            // Every removal was pulled out of the run; its output reflects them.
            self.deleted_from.clear();
        }
        self.notify(PipelineNotification::Finished {
            data_source: cascade.origin,
        });

        // Waiters whose target went stale during the run wait for the rerun.
        let (stale, ready): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|w| self.is_modified(w.target));
        self.waiters = ready;
        self.end_run(Terminal::Finished);

        let target = cascade.rerun.unwrap_or_else(|| self.tree.root());
        self.execute_logged(Some(target), None);

        if self.in_flight.is_some() {
            self.waiters.extend(stale);
        } else {
            for waiter in stale {
                let outcome = if self.is_modified(waiter.target) {
                    RunOutcome::Skipped
                } else {
                    self.output_of(waiter.target)
                };
                let _ = waiter.tx.send(outcome);
            }
        }
    }

    fn handle_run_failed(&mut self, operator: Option<OperatorId>, message: String) {
        let Some(flight) = self.in_flight.take() else {
            return;
        };
        tracing::warn!("{} failed: {}", flight.run, message);
        let operators: Vec<_> = flight.operators.iter().map(|(o, _)| *o).collect();
        for op in operators {
            if let Ok(o) = self.tree.op_mut(op) {
                o.mark_modified();
                self.notify_state(op);
            }
        }
        self.stale_pending(&flight.cascade);
        self.notify(PipelineNotification::Failed { operator, message: message.clone() });
        self.end_run(Terminal::Failed(message));
    }

    /// The in-flight run is gone: unfinished operators become Canceled.
    fn abandon_run(&mut self) {
        let Some(flight) = self.in_flight.take() else {
            return;
        };
        tracing::info!("{} canceled", flight.run);
        self.revert_unfolded(&flight);
        let unfinished: Vec<_> = flight.unfinished().collect();
        for op in unfinished {
            if let Ok(o) = self.tree.op_mut(op) {
                o.mark_canceled();
                self.notify_state(op);
            }
        }
        self.stale_pending(&flight.cascade);
        self.notify(PipelineNotification::Canceled {
            run: Some(flight.run),
        });
        self.end_run(Terminal::Canceled);
    }

    /// Operators a run finished are only Complete once the run's output is
    /// folded. A run that ends without folding leaves them Modified.
    fn revert_unfolded(&mut self, flight: &InFlight) {
        for &op in &flight.completed {
            if let Ok(o) = self.tree.op_mut(op) {
                o.mark_modified();
                self.notify_state(op);
            }
        }
    }

    fn stale_pending(&mut self, cascade: &Cascade) {
        for &ds in &cascade.pending {
            self.mark_subtree_modified(ds);
        }
    }

    fn mark_subtree_modified(&mut self, ds: DataSourceId) {
        for op in self.tree.subtree_operators(ds) {
            if let Ok(o) = self.tree.op_mut(op) {
                o.mark_modified();
            }
        }
    }

    /// Resolve waiters and release cancel callbacks.
    fn end_run(&mut self, terminal: Terminal) {
        for waiter in std::mem::take(&mut self.waiters) {
            let outcome = match &terminal {
                Terminal::Finished => self.output_of(waiter.target),
                Terminal::Canceled => RunOutcome::Canceled,
                Terminal::Failed(message) => RunOutcome::Failed(message.clone()),
            };
            let _ = waiter.tx.send(outcome);
        }
        for callback in std::mem::take(&mut self.cancel_callbacks) {
            callback(self);
        }
    }

    fn output_of(&self, ds: DataSourceId) -> RunOutcome {
        let output = self.tree.transformed_data_source(ds);
        match self.tree.data_source(output).and_then(|d| d.volume()) {
            Some(volume) => RunOutcome::Finished(volume.clone()),
            None => RunOutcome::Failed(format!("{:?} has no volume", output)),
        }
    }

    fn notify_state(&mut self, op: OperatorId) {
        if let Some(state) = self.tree.operator(op).map(Operator::state) {
            self.notify(PipelineNotification::OperatorStateChanged {
                operator: op,
                state,
            });
        }
    }

    /// Drain the tree's event queue.
    pub(crate) fn process_events(&mut self) {
        while let Some(event) = self.tree.pop_event() {
            tracing::trace!("Processing {:?}", event);
            match event {
                TreeEvent::OperatorAdded(op) => self.on_operator_added(op),
                TreeEvent::OperatorRemoved {
                    operator,
                    data_source,
                    state,
                    child,
                } => self.on_operator_removed(operator, data_source, state, child),
                TreeEvent::TransformModified(op) => {
                    self.notify_state(op);
                    self.execute_logged(None, None);
                }
                TreeEvent::DataChanged(ds) => {
                    self.notify(PipelineNotification::DataChanged(ds));
                }
                TreeEvent::PropertiesChanged(ds) => self.on_properties_changed(ds),
            }
        }
    }

    fn on_operator_added(&mut self, op: OperatorId) {
        let Some(operator) = self.tree.operator(op) else {
            return;
        };
        let ds = operator.input();
        let explicit = operator.has_explicit_child().then(|| operator.child()).flatten();

        // A chain's output always hangs off its tail.
        let mut relocated = None;
        if self.tree.chain(ds).len() > 1 && explicit.is_none() {
            if let Some(owner) = self.tree.chain_output_owner(ds).filter(|&o| o != op) {
                match self.tree.detach_child(owner) {
                    Ok(Some(child)) => {
                        if let Err(e) = self.tree.attach_child(op, child, false) {
                            tracing::warn!("Failed to relocate {:?}: {}", child, e);
                        } else {
                            relocated = Some(child);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Failed to detach output of {:?}: {}", owner, e),
                }
            }
        }

        if let Some(child) = relocated {
            self.notify(PipelineNotification::DataSourceMoved {
                operator: op,
                data_source: child,
            });
        }
        self.notify(PipelineNotification::OperatorAdded {
            operator: op,
            relocated,
        });
        if let Some(child) = explicit {
            let root = self.tree.root();
            if let Err(e) = self.tree.set_flows_from(child, Some(root)) {
                tracing::warn!("Failed to wire properties of {:?}: {}", child, e);
            }
            self.notify(PipelineNotification::NewChildDataSource {
                operator: op,
                data_source: child,
            });
        }

        self.execute_logged(Some(ds), Some(op));
    }

    fn on_operator_removed(
        &mut self,
        op: OperatorId,
        ds: DataSourceId,
        state: OperatorState,
        child: Option<DataSourceId>,
    ) {
        if state != OperatorState::New {
            self.deleted_from.insert(ds);
        }
        self.notify(PipelineNotification::OperatorRemoved(op));

        if let Some(child) = child {
            let new_tail = self
                .tree
                .chain(ds)
                .last()
                .copied()
                .filter(|&tail| self.tree.operator(tail).is_some_and(|t| t.child().is_none()));
            match new_tail {
                Some(tail) => match self.tree.attach_child(tail, child, false) {
                    Ok(()) => self.notify(PipelineNotification::DataSourceMoved {
                        operator: tail,
                        data_source: child,
                    }),
                    Err(e) => tracing::warn!("Failed to move {:?}: {}", child, e),
                },
                None => match self.tree.remove_data_source(child) {
                    Ok(removed) => {
                        for ds in removed {
                            self.deleted_from.remove(&ds);
                            self.notify(PipelineNotification::DataSourceRemoved(ds));
                        }
                    }
                    Err(e) => tracing::warn!("Failed to tear down {:?}: {}", child, e),
                },
            }
        }

        let in_run = match self.in_flight.as_ref() {
            Some(flight) => flight.contains(op),
            None => {
                self.execute_logged(Some(ds), None);
                return;
            }
        };
        let excised = in_run && self.executor.cancel_operator(op);
        let root = self.tree.root();
        if let Some(flight) = self.in_flight.as_mut() {
            if excised {
                tracing::debug!("Excised {:?} from {}", op, flight.run);
                flight.cascade.excised_removals += 1;
            } else {
                tracing::debug!("{:?} cannot be excised, re-running {:?} afterwards", op, ds);
                if in_run {
                    self.deleted_from.insert(ds);
                }
                flight.cascade.rerun = Some(match flight.cascade.rerun {
                    Some(prev) if prev != ds => root,
                    _ => ds,
                });
            }
        }
    }

    fn on_properties_changed(&mut self, ds: DataSourceId) {
        self.notify(PipelineNotification::PropertiesChanged(ds));
        if ds != self.tree.root() {
            return;
        }
        let Some(properties) = self.tree.data_source(ds).map(|d| d.properties().clone()) else {
            return;
        };
        let followers: Vec<_> = self
            .tree
            .data_sources()
            .filter(|d| d.flows_from() == Some(ds) && !d.units_modified())
            .map(|d| d.id())
            .collect();
        for follower in followers {
            if let Ok(d) = self.tree.ds_mut(follower) {
                d.set_properties(properties.clone(), false);
                self.notify(PipelineNotification::PropertiesChanged(follower));
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.in_flight.is_some() {
            self.executor.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockPipelineExecutor;
    use crate::transforms::{AddConstant, BuiltinTransform};
    use std::sync::{Arc, Mutex};

    fn add(c: f64) -> AnyTransform {
        BuiltinTransform::AddConstant(AddConstant::new(c)).into()
    }

    /// Executor that records requests and never runs anything.
    #[derive(Default, Clone)]
    struct Recorder {
        requests: Arc<Mutex<Vec<ExecutionRequest>>>,
        excise: Arc<Mutex<bool>>,
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn last(&self) -> ExecutionRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl PipelineExecutor for Recorder {
        fn kind(&self) -> ExecutionMode {
            ExecutionMode::InProcess
        }

        fn execute(
            &mut self,
            request: ExecutionRequest,
            _events: Sender<ExecutorMessage>,
        ) -> PipelineResult<()> {
            self.requests.lock().unwrap().push(request);
            Ok(())
        }

        fn cancel(&mut self) -> bool {
            true
        }

        fn cancel_operator(&mut self, _operator: OperatorId) -> bool {
            *self.excise.lock().unwrap()
        }

        fn is_running(&self) -> bool {
            false
        }

        fn snapshot_prior_to(&self, request: SnapshotRequest) -> VolumeFuture {
            VolumeFuture::ready(Ok(request.volume))
        }
    }

    fn pipeline() -> (Pipeline, Recorder) {
        let recorder = Recorder::default();
        let pipeline = Pipeline::with_executor(
            Volume::zeros([2, 2, 2]),
            VolumeProperties::default(),
            PipelineSettings::default(),
            Box::new(recorder.clone()),
        );
        (pipeline, recorder)
    }

    /// Answer the last request as if every operator succeeded.
    fn complete_last(p: &mut Pipeline, rec: &Recorder) {
        let req = rec.last();
        let mut volume = req.volume.clone();
        for step in &req.steps {
            step.transform
                .apply(&mut volume, &crate::transforms::TransformContext::detached())
                .unwrap();
            p.handle_executor_message(ExecutorMessage::new(
                req.run,
                ExecutorEvent::OperatorFinished {
                    operator: step.operator,
                    child: None,
                },
            ));
        }
        p.handle_executor_message(ExecutorMessage::new(req.run, ExecutorEvent::Finished(volume)));
    }

    #[test]
    fn test_add_operator_dispatches_and_creates_output() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        let a = p.add_operator(root, add(1.0)).unwrap();
        assert_eq!(rec.count(), 1);
        assert!(p.is_running());

        complete_last(&mut p, &rec);
        assert!(!p.is_running());
        assert_eq!(p.operator_state(a).unwrap(), OperatorState::Complete);
        let out = p.tree().op(a).unwrap().child().unwrap();
        assert_eq!(p.transformed_data_source(None), out);
        let vol = p.tree().ds(out).unwrap().volume().unwrap();
        assert!(vol.data().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_up_to_date_is_noop() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        p.add_operator(root, add(1.0)).unwrap();
        complete_last(&mut p, &rec);
        assert_eq!(
            p.execute(None, None).unwrap(),
            Dispatch::Skipped(SkipReason::UpToDate)
        );
        assert_eq!(rec.count(), 1);
    }

    #[test]
    fn test_tail_fast_path_uses_materialized_output() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        let a = p.add_operator(root, add(1.0)).unwrap();
        complete_last(&mut p, &rec);
        let out = p.tree().op(a).unwrap().child().unwrap();

        let b = p.add_operator(root, add(2.0)).unwrap();
        // Output moved to the new tail.
        assert_eq!(p.tree().op(b).unwrap().child(), Some(out));
        assert_eq!(p.tree().op(a).unwrap().child(), None);

        let req = rec.last();
        assert_eq!(req.start_index, 1);
        assert_eq!(req.steps.len(), 1);
        assert_eq!(req.steps[0].operator, b);
        assert!(req.volume.data().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_canceled_predecessor_forces_full_run() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        let a = p.add_operator(root, add(1.0)).unwrap();
        assert!(p.cancel());
        let run = rec.last().run;
        p.handle_executor_message(ExecutorMessage::new(run, ExecutorEvent::Canceled));
        assert_eq!(p.operator_state(a).unwrap(), OperatorState::Canceled);

        let b = p.add_operator(root, add(2.0)).unwrap();
        let req = rec.last();
        assert_eq!(req.start_index, 0);
        assert_eq!(req.steps.iter().map(|s| s.operator).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(p.operator_state(a).unwrap(), OperatorState::Modified);
    }

    #[test]
    fn test_empty_chain_finishes_without_executor() {
        let mut mock = MockPipelineExecutor::new();
        mock.expect_execute().times(0);
        let mut p = Pipeline::with_executor(
            Volume::zeros([1, 1, 1]),
            VolumeProperties::default(),
            PipelineSettings::default(),
            Box::new(mock),
        );
        let rx = p.subscribe();
        assert_eq!(p.execute(None, None).unwrap(), Dispatch::Finished);
        assert!(rx
            .try_iter()
            .any(|n| matches!(n, PipelineNotification::Finished { .. })));
    }

    #[test]
    fn test_pause_blocks_then_resume_dispatches_once() {
        let mut mock = MockPipelineExecutor::new();
        mock.expect_execute().times(1).returning(|_, _| Ok(()));
        mock.expect_cancel().returning(|| true);
        let mut p = Pipeline::with_executor(
            Volume::zeros([1, 1, 1]),
            VolumeProperties::default(),
            PipelineSettings::default(),
            Box::new(mock),
        );
        p.pause();
        let root = p.root();
        p.add_operator(root, add(1.0)).unwrap();
        assert_eq!(
            p.execute(None, None).unwrap(),
            Dispatch::Skipped(SkipReason::Paused)
        );
        p.resume(true);
        assert!(p.is_running());
        // A second call while running is a no-op.
        assert_eq!(
            p.execute(None, None).unwrap(),
            Dispatch::Skipped(SkipReason::Running)
        );
    }

    #[test]
    fn test_editing_blocks_until_last_session_closes() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        let a = p.add_operator(root, add(1.0)).unwrap();
        complete_last(&mut p, &rec);
        let b = p.add_operator(root, add(1.0)).unwrap();
        complete_last(&mut p, &rec);

        p.started_editing(a).unwrap();
        p.started_editing(b).unwrap();
        p.apply_parameters(a, add(5.0)).unwrap();
        assert_eq!(
            p.execute(None, None).unwrap(),
            Dispatch::Skipped(SkipReason::Editing)
        );
        p.finished_editing(a).unwrap();
        assert_eq!(rec.count(), 2);
        p.finished_editing(b).unwrap();
        assert_eq!(rec.count(), 3);
        assert_eq!(p.editing_operators(), 0);
        assert_eq!(p.operator_state(a).unwrap(), OperatorState::Modified);
    }

    #[test]
    fn test_removal_forces_rerun() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        p.add_operator(root, add(1.0)).unwrap();
        complete_last(&mut p, &rec);
        let b = p.add_operator(root, add(1.0)).unwrap();
        complete_last(&mut p, &rec);

        p.pause();
        p.remove_operator(b).unwrap();
        assert!(p.operators_deleted());
        p.resume(true);
        assert_eq!(rec.count(), 3);
        assert_eq!(rec.last().start_index, 0);
        assert!(!p.operators_deleted());
    }

    #[test]
    fn test_empty_branch_keeps_removal_elsewhere_pending() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        p.add_operator(root, add(1.0)).unwrap();
        complete_last(&mut p, &rec);
        let b = p.add_operator(root, add(1.0)).unwrap();
        complete_last(&mut p, &rec);
        let out = p.tree().op(b).unwrap().child().unwrap();
        let c = p.add_operator(out, add(1.0)).unwrap();
        complete_last(&mut p, &rec);
        let leaf = p.tree().op(c).unwrap().child().unwrap();
        assert!(p.tree().chain(leaf).is_empty());

        p.pause();
        p.remove_operator(b).unwrap();
        p.resume(false);
        assert_eq!(p.execute(Some(leaf), None).unwrap(), Dispatch::Finished);
        assert!(p.operators_deleted());

        let requests = rec.count();
        assert!(p.execute(None, None).unwrap().started());
        assert_eq!(rec.count(), requests + 1);
        assert_eq!(rec.last().start_index, 0);
        assert!(!p.operators_deleted());
    }

    #[test]
    fn test_removing_only_operator_destroys_output() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        let a = p.add_operator(root, add(1.0)).unwrap();
        complete_last(&mut p, &rec);
        let out = p.tree().op(a).unwrap().child().unwrap();

        p.remove_operator(a).unwrap();
        assert!(p.tree().data_source(out).is_none());
        assert_eq!(p.transformed_data_source(None), root);
    }

    #[test]
    fn test_unexcisable_removal_reruns_after_completion() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        p.pause();
        let a = p.add_operator(root, add(1.0)).unwrap();
        let b = p.add_operator(root, add(1.0)).unwrap();
        p.resume(true);
        assert_eq!(rec.count(), 1);

        p.remove_operator(b).unwrap();
        // Still one request: the removal waits for the run to end.
        assert_eq!(rec.count(), 1);
        let run = rec.last().run;
        p.handle_executor_message(ExecutorMessage::new(
            run,
            ExecutorEvent::OperatorFinished {
                operator: a,
                child: None,
            },
        ));
        p.handle_executor_message(ExecutorMessage::new(
            run,
            ExecutorEvent::Finished(Volume::zeros([2, 2, 2])),
        ));
        assert_eq!(rec.count(), 2);
        assert_eq!(
            rec.last().steps.iter().map(|s| s.operator).collect::<Vec<_>>(),
            vec![a]
        );
    }

    #[test]
    fn test_excised_removal_needs_no_rerun() {
        let (mut p, rec) = pipeline();
        *rec.excise.lock().unwrap() = true;
        let root = p.root();
        p.pause();
        p.add_operator(root, add(1.0)).unwrap();
        let b = p.add_operator(root, add(1.0)).unwrap();
        p.resume(true);

        // Mark b as previously run so its removal trips the deleted flag.
        p.tree.op_mut(b).unwrap().mark_complete(0);
        p.remove_operator(b).unwrap();
        complete_last(&mut p, &rec);
        assert_eq!(rec.count(), 1);
        assert!(!p.operators_deleted());
    }

    #[test]
    fn test_stale_messages_are_dropped() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        let a = p.add_operator(root, add(1.0)).unwrap();
        let run = rec.last().run;
        p.handle_executor_message(ExecutorMessage::new(
            RunId(run.0 + 10),
            ExecutorEvent::Finished(Volume::zeros([1, 1, 1])),
        ));
        assert!(p.is_running());
        assert_eq!(p.operator_state(a).unwrap(), OperatorState::New);
    }

    #[test]
    fn test_cancel_callback_fires_on_completion_race() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        p.add_operator(root, add(1.0)).unwrap();
        let fired = Arc::new(Mutex::new(false));
        let flag = fired.clone();
        p.pause();
        assert!(p.cancel_with(move |p| {
            p.resume(false);
            *flag.lock().unwrap() = true;
        }));
        // The run completes before the cancellation lands.
        complete_last(&mut p, &rec);
        assert!(*fired.lock().unwrap());
        assert!(!p.paused());
    }

    #[test]
    fn test_cancel_when_idle_fires_immediately() {
        let (mut p, _rec) = pipeline();
        let fired = Arc::new(Mutex::new(false));
        let flag = fired.clone();
        assert!(!p.cancel_with(move |_| *flag.lock().unwrap() = true));
        assert!(*fired.lock().unwrap());
    }

    #[test]
    fn test_failure_leaves_chain_stale() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        let a = p.add_operator(root, add(1.0)).unwrap();
        let run = rec.last().run;
        p.handle_executor_message(ExecutorMessage::new(
            run,
            ExecutorEvent::Failed {
                operator: Some(a),
                message: "boom".into(),
            },
        ));
        assert!(!p.is_running());
        assert!(p.is_modified(root));
        // No automatic retry.
        assert_eq!(rec.count(), 1);
        assert!(p.execute(None, None).unwrap().started());
    }

    #[test]
    fn test_cancel_after_last_operator_finished_reruns() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        let a = p.add_operator(root, add(1.0)).unwrap();
        complete_last(&mut p, &rec);

        p.apply_parameters(a, add(5.0)).unwrap();
        assert!(p.cancel());
        let run = rec.last().run;
        p.handle_executor_message(ExecutorMessage::new(
            run,
            ExecutorEvent::OperatorFinished {
                operator: a,
                child: None,
            },
        ));
        p.handle_executor_message(ExecutorMessage::new(run, ExecutorEvent::Canceled));

        // The +5 result never reached the output node.
        assert_ne!(p.operator_state(a).unwrap(), OperatorState::Complete);
        assert!(p.execute(None, None).unwrap().started());
        complete_last(&mut p, &rec);
        let out = p.transformed_data_source(None);
        let vol = p.tree().ds(out).unwrap().volume().unwrap();
        assert!(vol.data().iter().all(|&v| v == 5.0));
    }

    #[test]
    fn test_failure_reverts_finished_operators() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        p.pause();
        let a = p.add_operator(root, add(1.0)).unwrap();
        let b = p.add_operator(root, add(1.0)).unwrap();
        p.resume(true);
        complete_last(&mut p, &rec);

        p.apply_parameters(a, add(2.0)).unwrap();
        let run = rec.last().run;
        p.handle_executor_message(ExecutorMessage::new(
            run,
            ExecutorEvent::OperatorFinished {
                operator: a,
                child: None,
            },
        ));
        p.handle_executor_message(ExecutorMessage::new(
            run,
            ExecutorEvent::Failed {
                operator: Some(b),
                message: "boom".into(),
            },
        ));
        assert_eq!(p.operator_state(a).unwrap(), OperatorState::Modified);
        assert_eq!(p.first_modified(root), Some(a));
    }

    #[test]
    fn test_units_flow_until_modified() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        let a = p.add_operator(root, add(1.0)).unwrap();
        complete_last(&mut p, &rec);
        let out = p.tree().op(a).unwrap().child().unwrap();

        let props = VolumeProperties {
            spacing: [2.0, 2.0, 2.0],
            units: "um".into(),
        };
        p.set_properties(root, props.clone()).unwrap();
        assert_eq!(p.tree().ds(out).unwrap().properties(), &props);

        let pinned = VolumeProperties {
            spacing: [3.0, 3.0, 3.0],
            units: "mm".into(),
        };
        p.set_properties(out, pinned.clone()).unwrap();
        p.set_properties(root, VolumeProperties::default()).unwrap();
        assert_eq!(p.tree().ds(out).unwrap().properties(), &pinned);
    }

    #[test]
    fn test_modules_move_to_new_output() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        p.add_module(root, Module::new("Outline")).unwrap();
        let a = p.add_operator(root, add(1.0)).unwrap();
        complete_last(&mut p, &rec);
        let out = p.tree().op(a).unwrap().child().unwrap();
        assert!(p.tree().ds(root).unwrap().modules().is_empty());
        assert_eq!(p.tree().ds(out).unwrap().modules().len(), 1);
    }

    #[test]
    fn test_cascade_runs_branch_chain() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        let a = p.add_operator(root, add(1.0)).unwrap();
        complete_last(&mut p, &rec);
        let out = p.tree().op(a).unwrap().child().unwrap();
        let b = p.add_operator(out, add(10.0)).unwrap();
        complete_last(&mut p, &rec);

        // Changing the root chain re-runs the branch afterwards.
        p.apply_parameters(a, add(2.0)).unwrap();
        assert_eq!(rec.last().data_source, root);
        complete_last(&mut p, &rec);
        let req = rec.last();
        assert_eq!(req.data_source, out);
        assert_eq!(req.steps[0].operator, b);
        assert!(req.volume.data().iter().all(|&v| v == 2.0));
        complete_last(&mut p, &rec);
        assert!(!p.is_running());
        let final_ds = p.transformed_data_source(None);
        let vol = p.tree().ds(final_ds).unwrap().volume().unwrap();
        assert!(vol.data().iter().all(|&v| v == 12.0));
    }

    #[test]
    fn test_switching_mode_abandons_run() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        let a = p.add_operator(root, add(1.0)).unwrap();
        assert!(p.is_running());
        let mut next = MockPipelineExecutor::new();
        next.expect_kind().return_const(ExecutionMode::External);
        next.expect_cancel().returning(|| false);
        p.replace_executor(Box::new(next));
        assert!(!p.is_running());
        assert_eq!(p.operator_state(a).unwrap(), OperatorState::Canceled);
        assert_eq!(p.execution_mode(), ExecutionMode::External);
        assert_eq!(rec.count(), 1);
    }

    #[test]
    fn test_execute_future_resolves_with_output() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        p.pause();
        p.add_operator(root, add(3.0)).unwrap();
        let skipped = p.execute_future(None).unwrap();
        assert_eq!(skipped.try_get(), Some(RunOutcome::Skipped));

        p.resume(false);
        let future = p.execute_future(None).unwrap();
        assert_eq!(future.try_get(), None);
        complete_last(&mut p, &rec);
        match future.try_get() {
            Some(RunOutcome::Finished(vol)) => assert!(vol.data().iter().all(|&v| v == 3.0)),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_execute_future_waits_for_rerun_of_stale_target() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        let a = p.add_operator(root, add(1.0)).unwrap();
        p.apply_parameters(a, add(5.0)).unwrap();
        let future = p.execute_future(None).unwrap();

        // The first run computed +1; the future must not settle on it.
        complete_last(&mut p, &rec);
        assert!(p.is_running());
        assert_eq!(future.try_get(), None);

        complete_last(&mut p, &rec);
        match future.try_get() {
            Some(RunOutcome::Finished(vol)) => assert!(vol.data().iter().all(|&v| v == 5.0)),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_execute_future_skipped_when_rerun_is_paused() {
        let (mut p, rec) = pipeline();
        let root = p.root();
        let a = p.add_operator(root, add(1.0)).unwrap();
        p.apply_parameters(a, add(5.0)).unwrap();
        let future = p.execute_future(None).unwrap();

        p.pause();
        complete_last(&mut p, &rec);
        assert!(!p.is_running());
        assert_eq!(future.try_get(), Some(RunOutcome::Skipped));
    }

    #[test]
    fn test_copy_of_volume_prior_to() {
        let (mut p, _rec) = pipeline();
        let root = p.root();
        p.pause();
        let a = p.add_operator(root, add(1.0)).unwrap();
        let b = p.add_operator(root, add(1.0)).unwrap();
        let vol = p.copy_of_volume_prior_to(b).unwrap().wait().unwrap();
        // Recorder echoes the input volume of the prefix request.
        assert_eq!(vol, Volume::zeros([2, 2, 2]));
        assert!(p.copy_of_volume_prior_to(OperatorId(99)).is_err());
        assert_eq!(p.tree().index_in_chain(a), Some(0));
    }

    /// Answer requests until the pipeline goes idle.
    fn settle(p: &mut Pipeline, rec: &Recorder) {
        for _ in 0..64 {
            if !p.is_running() {
                return;
            }
            complete_last(p, rec);
        }
        panic!("pipeline did not settle");
    }

    #[derive(Debug, Clone)]
    enum Action {
        Add(i8),
        Remove(usize),
        Apply(usize, i8),
        Pause,
        Resume,
    }

    fn action() -> impl Strategy<Value = Action> {
        prop_oneof![
            (-5i8..5).prop_map(Action::Add),
            (0usize..8).prop_map(Action::Remove),
            (0usize..8, -5i8..5).prop_map(|(i, c)| Action::Apply(i, c)),
            Just(Action::Pause),
            Just(Action::Resume),
        ]
    }

    // Property-based tests using proptest
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_settled_output_reflects_chain(
            actions in prop::collection::vec(action(), 1..24)
        ) {
            let (mut p, rec) = pipeline();
            let root = p.root();
            let mut constants: Vec<(OperatorId, f64)> = Vec::new();

            for action in actions {
                match action {
                    Action::Add(c) => {
                        let op = p.add_operator(root, add(c as f64)).unwrap();
                        constants.push((op, c as f64));
                    }
                    Action::Remove(i) if !constants.is_empty() => {
                        let (op, _) = constants.remove(i % constants.len());
                        p.remove_operator(op).unwrap();
                    }
                    Action::Apply(i, c) if !constants.is_empty() => {
                        let i = i % constants.len();
                        constants[i].1 = c as f64;
                        p.apply_parameters(constants[i].0, add(c as f64)).unwrap();
                    }
                    Action::Pause => p.pause(),
                    Action::Resume => p.resume(true),
                    _ => {}
                }
                settle(&mut p, &rec);
            }
            p.resume(true);
            settle(&mut p, &rec);

            prop_assert_eq!(p.first_modified(root), None);
            prop_assert!(!p.operators_deleted());
            let expected: f64 = constants.iter().map(|(_, c)| c).sum();
            let out = p.transformed_data_source(None);
            let volume = p.tree().ds(out).unwrap().volume().unwrap();
            prop_assert!(
                volume.data().iter().all(|&v| (v as f64 - expected).abs() < 1e-4),
                "expected {} got {:?}", expected, volume.range()
            );
        }
    }
}
