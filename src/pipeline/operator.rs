//! Operators and their lifecycle state machine.
//!
//! ```text
//!            begin_edit              finish_edit
//!   New ─────────────► Editing ─────────────► New | Modified | Complete
//!    │                                          │
//!    │ apply_parameters                         │ run succeeds
//!    ▼                                          ▼
//! Modified ───────────── run succeeds ──────► Complete
//!
//!   any state ── run aborted before the operator finished ──► Canceled
//!   Canceled ── reset_state ──► Modified
//! ```
//!
//! While an operator is `Editing`, run results and cancellations are
//! recorded against the state it will return to when the edit ends.

use crate::pipeline::id::{DataSourceId, OperatorId};
use crate::transforms::AnyTransform;

/// Lifecycle state of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorState {
    /// Added and never run.
    New,
    /// Parameters or input changed since the last successful run.
    Modified,
    /// Under an interactive edit session.
    Editing,
    /// A run covering this operator was aborted before it finished.
    Canceled,
    /// Last run succeeded with the current parameters.
    Complete,
}

impl OperatorState {
    pub fn label(&self) -> &'static str {
        match self {
            OperatorState::New => "new",
            OperatorState::Modified => "modified",
            OperatorState::Editing => "editing",
            OperatorState::Canceled => "canceled",
            OperatorState::Complete => "complete",
        }
    }
}

/// State an edit session returns to, plus whether parameters were applied.
#[derive(Debug, Clone, Copy)]
struct EditReturn {
    state: OperatorState,
    applied: bool,
}

/// One transform step in a data source's chain.
#[derive(Debug, Clone)]
pub struct Operator {
    id: OperatorId,
    input: DataSourceId,
    transform: AnyTransform,
    state: OperatorState,
    edit: Option<EditReturn>,
    /// Bumped on every parameter change; a run only completes the
    /// revision it was dispatched with.
    revision: u64,
    child: Option<DataSourceId>,
    explicit_child: bool,
}

impl Operator {
    pub fn new(id: OperatorId, input: DataSourceId, transform: AnyTransform) -> Self {
        Self {
            id,
            input,
            transform,
            state: OperatorState::New,
            edit: None,
            revision: 0,
            child: None,
            explicit_child: false,
        }
    }

    pub fn id(&self) -> OperatorId {
        self.id
    }

    /// Data source whose chain this operator belongs to.
    pub fn input(&self) -> DataSourceId {
        self.input
    }

    pub fn name(&self) -> &str {
        self.transform.name()
    }

    pub fn transform(&self) -> &AnyTransform {
        &self.transform
    }

    pub fn state(&self) -> OperatorState {
        self.state
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_new(&self) -> bool {
        self.state == OperatorState::New
    }

    pub fn is_complete(&self) -> bool {
        self.state == OperatorState::Complete
    }

    pub fn is_editing(&self) -> bool {
        self.state == OperatorState::Editing
    }

    pub fn is_canceled(&self) -> bool {
        self.state == OperatorState::Canceled
    }

    /// Data source receiving this operator's output.
    pub fn child(&self) -> Option<DataSourceId> {
        self.child
    }

    /// True when the transform fills the child itself rather than the chain
    /// folding its final output into it.
    pub fn has_explicit_child(&self) -> bool {
        self.child.is_some() && self.explicit_child
    }

    pub(crate) fn set_child(&mut self, child: Option<DataSourceId>, explicit: bool) {
        self.child = child;
        self.explicit_child = child.is_some() && explicit;
    }

    pub(crate) fn take_child(&mut self) -> Option<DataSourceId> {
        self.explicit_child = false;
        self.child.take()
    }

    /// Replace the transform parameters.
    ///
    /// New and Complete operators become Modified. During an edit the
    /// change is recorded and resolved by [`Operator::finish_edit`].
    pub fn apply_parameters(&mut self, transform: AnyTransform) {
        self.transform = transform;
        self.revision += 1;
        match &mut self.edit {
            Some(edit) if self.state == OperatorState::Editing => edit.applied = true,
            _ => self.state = OperatorState::Modified,
        }
    }

    /// Enter the Editing state. Returns false if already editing.
    pub fn begin_edit(&mut self) -> bool {
        if self.is_editing() {
            return false;
        }
        self.edit = Some(EditReturn {
            state: self.state,
            applied: false,
        });
        self.state = OperatorState::Editing;
        true
    }

    /// Leave the Editing state.
    ///
    /// A never-run operator stays New so it still qualifies for the tail
    /// rerun. Otherwise applied parameters leave it Modified, an untouched
    /// Complete operator stays Complete, and anything unresolved becomes
    /// Modified.
    pub fn finish_edit(&mut self) -> bool {
        let Some(edit) = self.edit.take() else {
            return false;
        };
        self.state = match (edit.state, edit.applied) {
            (OperatorState::New, _) => OperatorState::New,
            (OperatorState::Complete, false) => OperatorState::Complete,
            _ => OperatorState::Modified,
        };
        true
    }

    /// A run finished this operator at `revision`.
    pub(crate) fn mark_complete(&mut self, revision: u64) {
        if revision != self.revision {
            return;
        }
        match &mut self.edit {
            Some(edit) if self.state == OperatorState::Editing => {
                if !edit.applied {
                    edit.state = OperatorState::Complete;
                }
            }
            _ => self.state = OperatorState::Complete,
        }
    }

    /// A run covering this operator was aborted before it finished.
    pub(crate) fn mark_canceled(&mut self) {
        match &mut self.edit {
            Some(edit) if self.state == OperatorState::Editing => {
                edit.state = OperatorState::Canceled
            }
            _ => self.state = OperatorState::Canceled,
        }
    }

    /// The operator's input changed underneath it.
    pub(crate) fn mark_modified(&mut self) {
        match &mut self.edit {
            Some(edit) if self.state == OperatorState::Editing => {
                if edit.state != OperatorState::New {
                    edit.state = OperatorState::Modified;
                }
            }
            _ => {
                if self.state != OperatorState::New {
                    self.state = OperatorState::Modified;
                }
            }
        }
    }

    /// Make a Canceled operator eligible to run again.
    pub fn reset_state(&mut self) {
        if self.state == OperatorState::Canceled {
            self.state = OperatorState::Modified;
        }
    }
}
