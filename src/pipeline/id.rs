//! Identity types for the pipeline tree.
//!
//! `DataSourceId` and `OperatorId` are newtypes over `u32` that serve as
//! direct indices into the arena vectors of [`PipelineTree`](super::PipelineTree).
//! Slots are never reused, so a stale id resolves to `None` instead of to a
//! different record.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index into `PipelineTree::data_sources`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataSourceId(pub u32);

impl DataSourceId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for DataSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataSourceId({})", self.0)
    }
}

impl fmt::Display for DataSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Index into `PipelineTree::operators`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperatorId(pub u32);

impl OperatorId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperatorId({})", self.0)
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Monotonic identifier of one execution request.
///
/// Executor messages carry the run they belong to so the coordinator can
/// drop messages from a run it has already abandoned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct RunId(pub u64);

impl RunId {
    pub fn next(self) -> RunId {
        RunId(self.0 + 1)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run#{}", self.0)
    }
}
