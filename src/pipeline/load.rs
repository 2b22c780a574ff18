//! Building a pipeline from a [`PipelineFile`].

use crate::config::{OperatorEntry, PipelineFile, PipelineSettings};
use crate::error::{FlowError, Result};
use crate::pipeline::coordinator::Pipeline;
use crate::pipeline::id::DataSourceId;
use std::path::Path;
use std::time::Duration;

impl Pipeline {
    /// Build and run the pipeline described by `file`.
    ///
    /// Each chain is run to completion before the chain on its output is
    /// attached, so this blocks for up to `timeout` per chain. `base` is the
    /// directory relative snapshot paths resolve against.
    pub fn from_file(
        file: &PipelineFile,
        base: &Path,
        settings: PipelineSettings,
        timeout: Duration,
    ) -> Result<Self> {
        let volume = file.root_volume(base)?;
        let mut pipeline = Pipeline::new(volume, file.properties.clone(), settings);
        let root = pipeline.root();
        tracing::info!(
            "Building pipeline {:?} ({} operator(s))",
            file.name,
            file.operator_count()
        );
        pipeline.build_chain(root, &file.operators, timeout)?;
        Ok(pipeline)
    }

    fn build_chain(
        &mut self,
        ds: DataSourceId,
        entries: &[OperatorEntry],
        timeout: Duration,
    ) -> Result<()> {
        let Some((tail, body)) = entries.split_last() else {
            return Ok(());
        };
        if body.iter().any(|e| !e.branch.is_empty()) {
            return Err(FlowError::Config(
                "only the last operator of a chain may carry a branch".to_string(),
            ));
        }

        self.pause();
        let mut last = None;
        for entry in entries {
            last = Some(self.add_operator(ds, entry.transform.clone())?);
        }
        self.resume_at(ds);

        if !self.wait_until_idle(timeout) {
            return Err(FlowError::Runtime(format!(
                "chain on {:?} did not finish within {:?}",
                ds, timeout
            )));
        }
        if let Some(op) = self.first_modified(ds) {
            return Err(FlowError::Runtime(format!(
                "chain on {:?} did not complete, {:?} is {}",
                ds,
                op,
                self.operator_state(op)?.label()
            )));
        }

        if tail.branch.is_empty() {
            return Ok(());
        }
        let Some(output) = last.and_then(|op| self.tree().operator(op)).and_then(|op| op.child())
        else {
            return Err(FlowError::Runtime(format!("chain on {:?} produced no output", ds)));
        };
        self.build_chain(output, &tail.branch, timeout)
    }
}
