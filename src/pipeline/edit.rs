//! Edit sessions: the protocol an editing surface follows around an operator.
//!
//! Opening a session while a run is in flight needs the caller's consent to
//! cancel it. Applying an edit during a run cancels it, and once the run is
//! torn down the pipeline is resumed and the change re-executed. Canceling
//! the session of an operator that was added together with it removes the
//! operator again.

use crate::pipeline::coordinator::Pipeline;
use crate::pipeline::error::PipelineResult;
use crate::pipeline::id::{DataSourceId, OperatorId};
use crate::transforms::AnyTransform;

/// Book-keeping for one open session.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EditSession {
    /// The operator was created for this session.
    pub added: bool,
}

impl Pipeline {
    /// Open an edit session on `op`.
    ///
    /// With a run in flight, `confirm` decides whether it may be canceled;
    /// returns false when it may not. Re-opening an open session is a no-op.
    pub fn open_edit(&mut self, op: OperatorId, confirm: bool) -> PipelineResult<bool> {
        self.tree().op(op)?;
        if self.edit_sessions.contains_key(&op) {
            return Ok(true);
        }
        if self.is_running() {
            if !confirm {
                tracing::debug!("Edit of {:?} refused while running", op);
                return Ok(false);
            }
            self.cancel();
        }
        self.started_editing(op)?;
        self.edit_sessions.insert(op, EditSession::default());
        Ok(true)
    }

    /// Close the session on `op`, applying `transform`.
    ///
    /// Without a run in flight the parameters are applied and the session
    /// closed, which re-executes once no other session is open. With a run
    /// in flight, `confirm` decides whether it may be canceled; returns
    /// false (session still open) when it may not.
    pub fn apply_edit(
        &mut self,
        op: OperatorId,
        transform: impl Into<AnyTransform>,
        confirm: bool,
    ) -> PipelineResult<bool> {
        let transform = transform.into();
        self.tree().op(op)?;

        if !self.is_running() {
            self.apply_parameters(op, transform)?;
            self.edit_sessions.remove(&op);
            self.finished_editing(op)?;
            return Ok(true);
        }

        if !confirm {
            return Ok(false);
        }

        // Close the session first so the rerun is not held back by it.
        self.edit_sessions.remove(&op);
        self.finished_editing(op)?;
        self.pause();
        self.apply_parameters(op, transform)?;
        self.cancel_with(move |pipeline| {
            pipeline.resume(false);
            if let Err(e) = pipeline.transform_modified(op) {
                tracing::warn!("Rerun after edit of {:?} failed: {}", op, e);
            }
        });
        Ok(true)
    }

    /// Abandon the session on `op`. An operator added with the session is
    /// removed, any other returns to its pre-edit state.
    pub fn cancel_edit(&mut self, op: OperatorId) -> PipelineResult<()> {
        let session = self.edit_sessions.remove(&op).unwrap_or_default();
        if session.added {
            tracing::debug!("Discarding {:?} added for an abandoned edit", op);
            self.remove_operator(op)
        } else {
            self.finished_editing(op)
        }
    }

    /// Append an operator and open an edit session on it before the pipeline
    /// gets a chance to run it.
    pub fn add_operator_with_edit(
        &mut self,
        ds: DataSourceId,
        transform: impl Into<AnyTransform>,
    ) -> PipelineResult<OperatorId> {
        if self.is_running() {
            self.cancel();
        }
        let op = self.add_operator_deferred(ds, transform.into())?;
        self.started_editing(op)?;
        self.edit_sessions.insert(op, EditSession { added: true });
        self.process_events();
        Ok(op)
    }

    /// Whether `op` has an open edit session.
    pub fn has_edit_session(&self, op: OperatorId) -> bool {
        self.edit_sessions.contains_key(&op)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{ExecutionMode, PipelineSettings};
    use crate::executor::MockPipelineExecutor;
    use crate::pipeline::{OperatorState, Pipeline};
    use crate::transforms::{AddConstant, AnyTransform, BuiltinTransform};
    use crate::volume::{Volume, VolumeProperties};

    fn add(c: f64) -> AnyTransform {
        BuiltinTransform::AddConstant(AddConstant::new(c)).into()
    }

    fn pipeline(mock: MockPipelineExecutor) -> Pipeline {
        Pipeline::with_executor(
            Volume::zeros([1, 1, 1]),
            VolumeProperties::default(),
            PipelineSettings::default(),
            Box::new(mock),
        )
    }

    #[test]
    fn test_added_operator_waits_for_edit() {
        let mut mock = MockPipelineExecutor::new();
        mock.expect_execute().times(1).returning(|_, _| Ok(()));
        mock.expect_cancel().returning(|| true);
        mock.expect_kind().return_const(ExecutionMode::InProcess);
        let mut p = pipeline(mock);
        let root = p.root();

        let op = p.add_operator_with_edit(root, add(1.0)).unwrap();
        assert!(!p.is_running());
        assert_eq!(p.operator_state(op).unwrap(), OperatorState::Editing);

        assert!(p.apply_edit(op, add(2.0), false).unwrap());
        assert!(p.is_running());
        assert_eq!(p.operator_state(op).unwrap(), OperatorState::New);
    }

    #[test]
    fn test_cancel_edit_of_added_operator_removes_it() {
        let mut mock = MockPipelineExecutor::new();
        mock.expect_execute().times(0);
        let mut p = pipeline(mock);
        let root = p.root();
        let op = p.add_operator_with_edit(root, add(1.0)).unwrap();
        p.cancel_edit(op).unwrap();
        assert!(p.tree().operator(op).is_none());
        assert_eq!(p.editing_operators(), 0);
        assert!(!p.has_edit_session(op));
    }

    #[test]
    fn test_open_edit_needs_confirmation_while_running() {
        let mut mock = MockPipelineExecutor::new();
        mock.expect_execute().returning(|_, _| Ok(()));
        mock.expect_cancel().returning(|| true);
        let mut p = pipeline(mock);
        let root = p.root();
        let op = p.add_operator(root, add(1.0)).unwrap();
        assert!(p.is_running());

        assert!(!p.open_edit(op, false).unwrap());
        assert!(!p.has_edit_session(op));
        assert!(p.open_edit(op, true).unwrap());
        assert!(p.has_edit_session(op));
        assert!(p.open_edit(op, true).unwrap());
        assert_eq!(p.editing_operators(), 1);
    }
}
