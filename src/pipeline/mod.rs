//! Pipeline tree and execution coordinator.
//!
//! A pipeline is a tree of data sources. Each data source holds a volume and
//! an ordered chain of operators; a chain's result lands in a child data
//! source that may carry its own chain.
//!
//! # Architecture
//!
//! ```text
//!  Root ──► [op 0] ──► [op 1] ──► [op 2]
//!                                   └──► Output ──► [op 3] ──► Output
//! ```
//!
//! # Design
//!
//! - **Arena tree**: `Vec<Option<_>>` slots addressed by `DataSourceId` and
//!   `OperatorId`; removed slots stay empty so stale ids never alias.
//! - **Event queue**: the tree records changes as [`TreeEvent`]s and the
//!   coordinator reacts to them after every mutation.
//! - **Single control thread**: [`Pipeline`] is driven from one thread;
//!   executors report back through a crossbeam channel, see [`bridge`].
//! - **Strategy executors**: in-process worker thread or external container,
//!   behind [`crate::executor::PipelineExecutor`].

pub mod bridge;
pub mod coordinator;
pub mod data_source;
pub mod edit;
pub mod error;
pub mod event;
pub mod id;
pub mod load;
pub mod operator;
pub mod tree;

pub use bridge::{PipelineBridge, PipelineCommand};
pub use coordinator::{CancelCallback, Pipeline};
pub use data_source::{DataSource, Module, Persistence};
pub use error::{PipelineError, PipelineResult};
pub use event::{
    Dispatch, PipelineNotification, RunFuture, RunOutcome, SkipReason, TreeEvent,
};
pub use id::{DataSourceId, OperatorId, RunId};
pub use operator::{Operator, OperatorState};
pub use tree::{PipelineTree, OUTPUT_LABEL};
