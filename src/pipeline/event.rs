//! Events flowing through the coordinator.
//!
//! - [`TreeEvent`]: queued by the tree on structural or data changes and
//!   processed to quiescence by the coordinator after every mutation.
//! - [`PipelineNotification`]: broadcast to subscribers.
//! - [`RunFuture`]: one-shot completion handle for callers that need the
//!   terminal volume of a run.

use crate::config::ExecutionMode;
use crate::pipeline::id::{DataSourceId, OperatorId, RunId};
use crate::pipeline::operator::OperatorState;
use crate::volume::Volume;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Change recorded by the tree, consumed by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeEvent {
    OperatorAdded(OperatorId),
    OperatorRemoved {
        operator: OperatorId,
        data_source: DataSourceId,
        /// State the operator had when removed.
        state: OperatorState,
        /// Child data source it owned, already detached.
        child: Option<DataSourceId>,
    },
    TransformModified(OperatorId),
    DataChanged(DataSourceId),
    PropertiesChanged(DataSourceId),
}

/// Notification sent to subscribers.
#[derive(Debug, Clone)]
pub enum PipelineNotification {
    /// A run was handed to the executor.
    Started {
        run: RunId,
        data_source: DataSourceId,
    },
    /// One chain of a run folded its output into `output`.
    BranchFinished {
        data_source: DataSourceId,
        output: DataSourceId,
    },
    /// Execution starting at `data_source` is done, cascades included.
    Finished { data_source: DataSourceId },
    Canceled { run: Option<RunId> },
    Failed {
        operator: Option<OperatorId>,
        message: String,
    },
    OperatorAdded {
        operator: OperatorId,
        /// Branch output relocated to hang off the new operator.
        relocated: Option<DataSourceId>,
    },
    OperatorRemoved(OperatorId),
    OperatorStateChanged {
        operator: OperatorId,
        state: OperatorState,
    },
    NewChildDataSource {
        operator: OperatorId,
        data_source: DataSourceId,
    },
    DataSourceMoved {
        operator: OperatorId,
        data_source: DataSourceId,
    },
    DataSourceRemoved(DataSourceId),
    DataChanged(DataSourceId),
    PropertiesChanged(DataSourceId),
    ExecutionModeChanged(ExecutionMode),
}

/// Why `execute` did not dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Paused,
    Editing,
    /// A run is already in flight.
    Running,
    /// Nothing is stale.
    UpToDate,
}

/// Result of an `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Started(RunId),
    /// Empty chain, finished without involving the executor.
    Finished,
    Skipped(SkipReason),
}

impl Dispatch {
    pub fn started(&self) -> bool {
        matches!(self, Dispatch::Started(_))
    }
}

/// Terminal outcome of an awaited execution.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Finished(Volume),
    Canceled,
    Failed(String),
    /// Nothing ran: the pipeline was paused or being edited.
    Skipped,
}

/// Handle resolving to a [`RunOutcome`].
#[derive(Debug)]
pub struct RunFuture {
    rx: Receiver<RunOutcome>,
}

impl RunFuture {
    pub(crate) fn channel() -> (Sender<RunOutcome>, Self) {
        let (tx, rx) = bounded(1);
        (tx, Self { rx })
    }

    pub(crate) fn ready(outcome: RunOutcome) -> Self {
        let (tx, future) = Self::channel();
        let _ = tx.send(outcome);
        future
    }

    /// Non-blocking poll.
    pub fn try_get(&self) -> Option<RunOutcome> {
        self.rx.try_recv().ok()
    }

    /// Block for at most `timeout`. Only meaningful when the coordinator is
    /// driven from another thread, see [`crate::pipeline::PipelineBridge`].
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RunOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                Some(RunOutcome::Failed("pipeline dropped".to_string()))
            }
        }
    }
}
