//! Cooperative cancellation shared between the control thread and a run.
//!
//! A [`RunControl`] tracks which operator of a run is executing and which
//! have completed, so the control thread can decide whether a single
//! operator can still be excised from the run without restarting it.

use crate::pipeline::OperatorId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Cheap, cloneable cancellation flag.
///
/// A token is canceled when either its run flag or its operator flag is set.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    run: Arc<AtomicBool>,
    operator: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token nobody holds a handle to cancel.
    pub fn never() -> Self {
        Self::default()
    }

    /// Derive a token that also observes a per-operator flag.
    fn for_operator(&self, flag: Arc<AtomicBool>) -> Self {
        Self {
            run: self.run.clone(),
            operator: Some(flag),
        }
    }

    pub fn cancel(&self) {
        self.run.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.run.load(Ordering::SeqCst)
            || self
                .operator
                .as_ref()
                .is_some_and(|f| f.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
struct RunProgress {
    current: Option<OperatorId>,
    current_interruptible: bool,
    current_flag: Option<Arc<AtomicBool>>,
    completed: HashSet<OperatorId>,
    excised: HashSet<OperatorId>,
}

/// Shared state of one in-flight run.
#[derive(Default)]
pub struct RunControl {
    token: CancelToken,
    progress: Mutex<RunProgress>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the whole run at the next checkpoint.
    pub fn cancel_all(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }

    /// Try to excise `operator` from the run.
    ///
    /// Succeeds for operators that have not started yet, and for the running
    /// operator when its transform is interruptible. Fails once the operator
    /// has completed since its output is already baked into the volume.
    pub fn cancel_operator(&self, operator: OperatorId) -> bool {
        let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        if progress.completed.contains(&operator) {
            return false;
        }
        if progress.current == Some(operator) {
            if !progress.current_interruptible {
                return false;
            }
            if let Some(flag) = &progress.current_flag {
                flag.store(true, Ordering::SeqCst);
            }
        }
        progress.excised.insert(operator);
        true
    }

    /// Called by the runner before an operator starts. Returns `None` when
    /// the operator was excised and must be skipped.
    pub(crate) fn begin(&self, operator: OperatorId, interruptible: bool) -> Option<CancelToken> {
        let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        if progress.excised.contains(&operator) {
            return None;
        }
        let flag = Arc::new(AtomicBool::new(false));
        progress.current = Some(operator);
        progress.current_interruptible = interruptible;
        progress.current_flag = Some(flag.clone());
        Some(self.token.for_operator(flag))
    }

    /// Called by the runner after an operator returns.
    pub(crate) fn finish(&self, operator: OperatorId, succeeded: bool) {
        let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        progress.current = None;
        progress.current_flag = None;
        if succeeded {
            progress.completed.insert(operator);
        }
    }

    pub(crate) fn is_excised(&self, operator: OperatorId) -> bool {
        self.progress
            .lock()
            .map(|p| p.excised.contains(&operator))
            .unwrap_or(false)
    }
}
