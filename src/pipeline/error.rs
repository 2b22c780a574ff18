//! Pipeline-specific error types.

use crate::pipeline::id::{DataSourceId, OperatorId};
use thiserror::Error;

/// Errors that can occur within the coordinator and its executors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Unknown data source {0:?}")]
    UnknownDataSource(DataSourceId),

    #[error("Unknown operator {0:?}")]
    UnknownOperator(OperatorId),

    #[error("Data source {0:?} has no volume")]
    MissingVolume(DataSourceId),

    #[error("Cannot remove the root data source")]
    RootRemoval,

    #[error("Executor already has a run in flight")]
    ExecutorBusy,

    #[error("Operator {operator:?} ('{name}') cannot run in the external executor")]
    NotMarshallable { operator: OperatorId, name: String },

    #[error("Operator {operator:?} failed: {message}")]
    Transform { operator: OperatorId, message: String },

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Channel closed")]
    ChannelClosed,
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
