//! In-process execution on a dedicated worker thread.

use crate::config::ExecutionMode;
use crate::executor::{
    run_chain, spawn_snapshot, ExecutionRequest, ExecutorEvent, ExecutorMessage,
    PipelineExecutor, RunControl, SnapshotRequest, StepEvent, VolumeFuture,
};
use crate::pipeline::{OperatorId, PipelineError, PipelineResult, RunId};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct ActiveRun {
    run: RunId,
    control: Arc<RunControl>,
    /// Set by the worker right before it sends the terminal event.
    done: Arc<AtomicBool>,
}

/// Runs each request on a freshly spawned, named worker thread.
///
/// Cancellation is cooperative: the worker checks the run's token between
/// operators, and interruptible transforms also check it while running.
#[derive(Default)]
pub struct ThreadExecutor {
    active: Option<ActiveRun>,
}

impl ThreadExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn running(&self) -> Option<&ActiveRun> {
        self.active
            .as_ref()
            .filter(|a| !a.done.load(Ordering::SeqCst))
    }
}

impl PipelineExecutor for ThreadExecutor {
    fn kind(&self) -> ExecutionMode {
        ExecutionMode::InProcess
    }

    fn execute(
        &mut self,
        request: ExecutionRequest,
        events: Sender<ExecutorMessage>,
    ) -> PipelineResult<()> {
        if self.is_running() {
            return Err(PipelineError::ExecutorBusy);
        }

        let run = request.run;
        let control = Arc::new(RunControl::new());
        let worker_control = control.clone();
        let done = Arc::new(AtomicBool::new(false));
        let worker_done = done.clone();

        tracing::info!(
            "Starting {} on {:?}: {} operator(s) from index {}",
            run,
            request.data_source,
            request.steps.len(),
            request.start_index
        );

        std::thread::Builder::new()
            .name(format!("tomoflow-{}", run))
            .spawn(move || {
                let outcome = run_chain(request.volume, &request.steps, &worker_control, |e| {
                    let event = match e {
                        StepEvent::Started(op) => ExecutorEvent::OperatorStarted(op),
                        StepEvent::Finished { operator, child } => {
                            ExecutorEvent::OperatorFinished { operator, child }
                        }
                        StepEvent::Excised(op) => ExecutorEvent::OperatorExcised(op),
                    };
                    let _ = events.send(ExecutorMessage::new(run, event));
                });
                worker_done.store(true, Ordering::SeqCst);
                let _ = events.send(ExecutorMessage::new(run, outcome.into()));
            })
            .map_err(|e| PipelineError::Executor(format!("failed to spawn worker: {}", e)))?;

        self.active = Some(ActiveRun { run, control, done });
        Ok(())
    }

    fn cancel(&mut self) -> bool {
        match self.running() {
            Some(active) => {
                tracing::info!("Canceling {}", active.run);
                active.control.cancel_all();
                true
            }
            None => false,
        }
    }

    fn cancel_operator(&mut self, operator: OperatorId) -> bool {
        match self.running() {
            Some(active) => active.control.cancel_operator(operator),
            None => false,
        }
    }

    fn is_running(&self) -> bool {
        self.running().is_some()
    }

    fn snapshot_prior_to(&self, request: SnapshotRequest) -> VolumeFuture {
        spawn_snapshot(request)
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        // The worker is detached; it stops at its next checkpoint.
        if let Some(active) = self.active.take() {
            active.control.cancel_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ChainStep;
    use crate::pipeline::DataSourceId;
    use crate::transforms::{
        AddConstant, AnyTransform, BuiltinTransform, TransformContext, TransformError,
        TransformPlugin, TransformResult,
    };
    use crate::volume::Volume;
    use crossbeam_channel::{unbounded, Receiver};
    use std::time::Duration;

    /// Spins until canceled.
    struct Spin;

    impl TransformPlugin for Spin {
        fn name(&self) -> &str {
            "Spin"
        }

        fn apply(&self, _volume: &mut Volume, ctx: &TransformContext) -> TransformResult {
            while !ctx.is_canceled() {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(TransformError::Canceled)
        }

        fn interruptible(&self) -> bool {
            true
        }
    }

    fn request(steps: Vec<ChainStep>) -> ExecutionRequest {
        ExecutionRequest {
            run: RunId(1),
            data_source: DataSourceId(0),
            volume: Volume::zeros([2, 2, 2]),
            steps,
            start_index: 0,
        }
    }

    fn add(op: u32, c: f64) -> ChainStep {
        ChainStep {
            operator: OperatorId(op),
            transform: BuiltinTransform::AddConstant(AddConstant::new(c)).into(),
        }
    }

    fn spin(op: u32) -> ChainStep {
        ChainStep {
            operator: OperatorId(op),
            transform: AnyTransform::Plugin(Arc::new(Spin)),
        }
    }

    fn terminal(rx: &Receiver<ExecutorMessage>) -> ExecutorMessage {
        loop {
            let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            if msg.event.is_terminal() {
                return msg;
            }
        }
    }

    #[test]
    fn test_runs_chain_to_completion() {
        let (tx, rx) = unbounded();
        let mut exec = ThreadExecutor::new();
        exec.execute(request(vec![add(0, 1.0), add(1, 1.0)]), tx)
            .unwrap();
        let msg = terminal(&rx);
        assert_eq!(msg.run, RunId(1));
        match msg.event {
            ExecutorEvent::Finished(vol) => assert!(vol.data().iter().all(|&v| v == 2.0)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_busy_while_running() {
        let (tx, rx) = unbounded();
        let mut exec = ThreadExecutor::new();
        exec.execute(request(vec![spin(0)]), tx.clone()).unwrap();
        assert!(exec.is_running());
        assert_eq!(
            exec.execute(request(vec![add(1, 1.0)]), tx).unwrap_err(),
            PipelineError::ExecutorBusy
        );
        assert!(exec.cancel());
        assert!(matches!(terminal(&rx).event, ExecutorEvent::Canceled));
    }

    #[test]
    fn test_cancel_operator_excises_running_step() {
        let (tx, rx) = unbounded();
        let mut exec = ThreadExecutor::new();
        exec.execute(request(vec![add(0, 1.0), spin(1), add(2, 1.0)]), tx)
            .unwrap();

        // Wait until the spinning operator is running.
        loop {
            let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            if matches!(msg.event, ExecutorEvent::OperatorStarted(OperatorId(1))) {
                break;
            }
        }
        assert!(exec.cancel_operator(OperatorId(1)));
        match terminal(&rx).event {
            ExecutorEvent::Finished(vol) => assert!(vol.data().iter().all(|&v| v == 2.0)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_cancel_when_idle_returns_false() {
        let mut exec = ThreadExecutor::new();
        assert!(!exec.cancel());
        assert!(!exec.cancel_operator(OperatorId(0)));
    }
}
