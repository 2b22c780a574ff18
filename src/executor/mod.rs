//! Execution strategies for operator chains.
//!
//! An executor runs a contiguous suffix of one data source's chain against a
//! volume, off the control thread, and reports back through a
//! [`crossbeam_channel::Sender<ExecutorMessage>`]. Two strategies implement
//! [`PipelineExecutor`]:
//!
//! - [`ThreadExecutor`] runs the chain on a worker thread in this process.
//! - [`ExternalExecutor`] marshals the chain into a work directory and runs
//!   it inside a container through a [`ContainerRuntime`].
//!
//! The strategy is chosen from [`PipelineSettings`] by [`create_executor`];
//! swapping strategies means dropping one executor and building another.
//!
//! Every message carries the [`RunId`] of the request it belongs to so the
//! coordinator can discard messages from runs it already abandoned.

pub mod chain;
pub mod container;
pub mod control;
pub mod external;
pub mod marshal;
pub mod thread;

pub use chain::{run_chain, ChainOutcome, ChainStep, StepEvent};
pub use container::{default_runtime, ContainerRuntime, ContainerSpec, DockerCli};
pub use control::{CancelToken, RunControl};
pub use external::ExternalExecutor;
pub use thread::ThreadExecutor;

use crate::config::{ExecutionMode, PipelineSettings};
use crate::pipeline::{DataSourceId, OperatorId, PipelineError, PipelineResult, RunId};
use crate::volume::Volume;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// A contiguous suffix of a chain submitted for execution.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub run: RunId,
    /// Data source whose chain is being run.
    pub data_source: DataSourceId,
    /// Input of the first step.
    pub volume: Volume,
    /// `operators[start_index..]` of the chain.
    pub steps: Vec<ChainStep>,
    pub start_index: usize,
}

impl ExecutionRequest {
    pub fn operators(&self) -> impl Iterator<Item = OperatorId> + '_ {
        self.steps.iter().map(|s| s.operator)
    }
}

/// What happened inside a run.
#[derive(Debug)]
pub enum ExecutorEvent {
    OperatorStarted(OperatorId),
    OperatorFinished {
        operator: OperatorId,
        child: Option<Volume>,
    },
    /// The operator was pulled out of the run and produced nothing.
    OperatorExcised(OperatorId),
    Finished(Volume),
    Canceled,
    Failed {
        operator: Option<OperatorId>,
        message: String,
    },
}

impl ExecutorEvent {
    /// Whether this is the last event of its run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutorEvent::Finished(_) | ExecutorEvent::Canceled | ExecutorEvent::Failed { .. }
        )
    }
}

/// Message sent from an executor to the coordinator.
#[derive(Debug)]
pub struct ExecutorMessage {
    pub run: RunId,
    pub event: ExecutorEvent,
}

impl ExecutorMessage {
    pub fn new(run: RunId, event: ExecutorEvent) -> Self {
        Self { run, event }
    }
}

impl From<ChainOutcome> for ExecutorEvent {
    fn from(outcome: ChainOutcome) -> Self {
        match outcome {
            ChainOutcome::Completed(volume) => ExecutorEvent::Finished(volume),
            ChainOutcome::Canceled => ExecutorEvent::Canceled,
            ChainOutcome::Failed { operator, message } => ExecutorEvent::Failed {
                operator: Some(operator),
                message,
            },
        }
    }
}

/// Request for the volume as it is right before a given operator runs.
#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    /// Operator the snapshot is taken in front of.
    pub operator: OperatorId,
    /// Input volume of the operator's chain.
    pub volume: Volume,
    /// The operators that precede `operator` in its chain.
    pub steps: Vec<ChainStep>,
}

/// One-shot handle for a volume computed off the control thread.
pub struct VolumeFuture {
    rx: Receiver<PipelineResult<Volume>>,
}

impl VolumeFuture {
    /// Create a future and the sender that completes it.
    pub fn channel() -> (Sender<PipelineResult<Volume>>, Self) {
        let (tx, rx) = bounded(1);
        (tx, Self { rx })
    }

    /// A future that is already resolved.
    pub fn ready(result: PipelineResult<Volume>) -> Self {
        let (tx, future) = Self::channel();
        let _ = tx.send(result);
        future
    }

    /// Block until the volume is available.
    pub fn wait(self) -> PipelineResult<Volume> {
        self.rx.recv().map_err(|_| PipelineError::ChannelClosed)?
    }

    /// Block for at most `timeout`. `None` means still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<PipelineResult<Volume>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(PipelineError::ChannelClosed)),
        }
    }

    /// Non-blocking poll.
    pub fn try_get(&self) -> Option<PipelineResult<Volume>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(PipelineError::ChannelClosed)),
        }
    }
}

impl std::fmt::Debug for VolumeFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeFuture")
            .field("ready", &!self.rx.is_empty())
            .finish()
    }
}

/// Capability set shared by every execution strategy.
#[cfg_attr(test, mockall::automock)]
pub trait PipelineExecutor: Send {
    /// Which strategy this is.
    fn kind(&self) -> ExecutionMode;

    /// Start running `request` asynchronously. Progress and the terminal
    /// outcome are sent on `events`. Fails with
    /// [`PipelineError::ExecutorBusy`] while another run is in flight.
    fn execute(
        &mut self,
        request: ExecutionRequest,
        events: Sender<ExecutorMessage>,
    ) -> PipelineResult<()>;

    /// Abort the whole in-flight run. A `Canceled` event follows once the
    /// run is torn down. Returns false when nothing was running.
    fn cancel(&mut self) -> bool;

    /// Try to excise a single operator from the in-flight run without
    /// aborting the rest of it.
    fn cancel_operator(&mut self, operator: OperatorId) -> bool;

    fn is_running(&self) -> bool;

    /// Compute the volume as it would be right before `request.operator` runs.
    fn snapshot_prior_to(&self, request: SnapshotRequest) -> VolumeFuture;
}

/// Build the executor selected by `settings`.
pub fn create_executor(settings: &PipelineSettings) -> Box<dyn PipelineExecutor> {
    tracing::info!("Creating {} executor", settings.execution_mode);
    match settings.execution_mode {
        ExecutionMode::InProcess => Box::new(ThreadExecutor::new()),
        ExecutionMode::External => Box::new(ExternalExecutor::new(
            settings.external.clone(),
            default_runtime(&settings.external),
        )),
    }
}

/// Run a snapshot request on its own thread.
pub(crate) fn spawn_snapshot(request: SnapshotRequest) -> VolumeFuture {
    let (tx, future) = VolumeFuture::channel();
    let operator = request.operator;
    let spawned = std::thread::Builder::new()
        .name(format!("tomoflow-snapshot-{}", operator.0))
        .spawn(move || {
            let control = RunControl::new();
            let result = match run_chain(request.volume, &request.steps, &control, |_| {}) {
                ChainOutcome::Completed(volume) => Ok(volume),
                ChainOutcome::Canceled => Err(PipelineError::Executor(
                    "snapshot computation was canceled".to_string(),
                )),
                ChainOutcome::Failed { operator, message } => {
                    Err(PipelineError::Transform { operator, message })
                }
            };
            let _ = tx.send(result);
        });
    match spawned {
        Ok(_) => future,
        Err(e) => VolumeFuture::ready(Err(PipelineError::Executor(format!(
            "failed to spawn snapshot thread: {}",
            e
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::{AddConstant, BuiltinTransform};

    #[test]
    fn test_ready_future() {
        let future = VolumeFuture::ready(Ok(Volume::filled([1, 1, 1], 2.0)));
        assert!(future.try_get().is_some());
    }

    #[test]
    fn test_dropped_sender_closes_future() {
        let (tx, future) = VolumeFuture::channel();
        drop(tx);
        assert_eq!(future.wait(), Err(PipelineError::ChannelClosed));
    }

    #[test]
    fn test_pending_future_times_out() {
        let (_tx, future) = VolumeFuture::channel();
        assert!(future.wait_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn test_spawn_snapshot_applies_prefix() {
        let request = SnapshotRequest {
            operator: OperatorId(1),
            volume: Volume::zeros([2, 1, 1]),
            steps: vec![ChainStep {
                operator: OperatorId(0),
                transform: BuiltinTransform::AddConstant(AddConstant::new(4.0)).into(),
            }],
        };
        let vol = spawn_snapshot(request).wait().unwrap();
        assert_eq!(vol.data(), &[4.0, 4.0]);
    }

    #[test]
    fn test_create_executor_matches_mode() {
        let settings = PipelineSettings::default();
        assert_eq!(create_executor(&settings).kind(), ExecutionMode::InProcess);
        let settings = settings.with_mode(ExecutionMode::External);
        assert_eq!(create_executor(&settings).kind(), ExecutionMode::External);
    }

    #[test]
    fn test_terminal_events() {
        assert!(ExecutorEvent::Canceled.is_terminal());
        assert!(!ExecutorEvent::OperatorStarted(OperatorId(0)).is_terminal());
    }
}
