//! Isolated-external execution inside a container.
//!
//! Each run marshals its chain into a temporary work directory, starts a
//! container with the directory mounted, waits for it to exit and reads the
//! output volume back. Only built-in transforms can be marshalled.

use crate::config::{ExecutionMode, ExternalSettings};
use crate::error::{FlowError, Result};
use crate::executor::marshal::{self, ChainDescription};
use crate::executor::{
    ContainerRuntime, ContainerSpec, ExecutionRequest, ExecutorEvent, ExecutorMessage,
    PipelineExecutor, SnapshotRequest, VolumeFuture,
};
use crate::pipeline::{OperatorId, PipelineError, PipelineResult, RunId};
use crate::volume::Volume;
use crossbeam_channel::Sender;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// State shared between the executor and the thread supervising a container.
#[derive(Default)]
struct ContainerHandle {
    canceled: AtomicBool,
    done: AtomicBool,
    id: Mutex<Option<String>>,
}

impl ContainerHandle {
    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn set_id(&self, id: Option<String>) {
        let mut slot = self.id.lock().unwrap_or_else(|e| e.into_inner());
        *slot = id;
    }

    fn id(&self) -> Option<String> {
        self.id.lock().map(|id| id.clone()).unwrap_or(None)
    }
}

struct ExternalRun {
    run: RunId,
    handle: Arc<ContainerHandle>,
}

/// Runs chains in a container through a [`ContainerRuntime`].
///
/// Operators cannot be excised from a container run, so
/// [`PipelineExecutor::cancel_operator`] always reports failure.
pub struct ExternalExecutor {
    settings: ExternalSettings,
    runtime: Arc<dyn ContainerRuntime>,
    active: Option<ExternalRun>,
}

impl ExternalExecutor {
    pub fn new(settings: ExternalSettings, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            settings,
            runtime,
            active: None,
        }
    }

    pub fn settings(&self) -> &ExternalSettings {
        &self.settings
    }

    fn running(&self) -> Option<&ExternalRun> {
        self.active
            .as_ref()
            .filter(|a| !a.handle.done.load(Ordering::SeqCst))
    }

    fn stop_container(&self, handle: &Arc<ContainerHandle>) {
        let Some(id) = handle.id() else {
            // Not started yet; the supervisor checks the flag before starting.
            return;
        };
        let runtime = self.runtime.clone();
        let spawned = std::thread::Builder::new()
            .name("tomoflow-container-stop".to_string())
            .spawn(move || {
                if let Err(e) = runtime.stop(&id) {
                    tracing::warn!("Failed to stop container {}: {}", id, e);
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("Failed to spawn container stop thread: {}", e);
        }
    }
}

/// Run one marshalled chain to completion. `Ok(None)` means the run was
/// canceled.
fn run_in_container(
    runtime: &dyn ContainerRuntime,
    settings: &ExternalSettings,
    volume: &Volume,
    description: &ChainDescription,
    handle: &ContainerHandle,
) -> Result<Option<Volume>> {
    let work_dir = tempfile::Builder::new()
        .prefix("tomoflow-work-")
        .tempdir()
        .map_err(|e| FlowError::Runtime(format!("failed to create work directory: {}", e)))?;
    marshal::write_work_dir(work_dir.path(), volume, description)?;

    if settings.pull {
        runtime.pull(&settings.image)?;
    }
    if handle.is_canceled() {
        return Ok(None);
    }

    let spec = ContainerSpec {
        image: settings.image.clone(),
        mounts: vec![(
            work_dir.path().to_path_buf(),
            marshal::WORK_MOUNT.to_string(),
        )],
        args: marshal::container_args(),
    };
    let id = runtime.start(&spec)?;
    tracing::debug!("Started container {}", id);
    handle.set_id(Some(id.clone()));
    if handle.is_canceled() {
        // Canceled between the flag check and the id becoming visible.
        let _ = runtime.stop(&id);
    }

    let result = supervise(runtime, &id, work_dir.path(), handle);

    if settings.remove {
        if let Err(e) = runtime.remove(&id) {
            tracing::warn!("Failed to remove container {}: {}", id, e);
        }
    }
    handle.set_id(None);
    result
}

fn supervise(
    runtime: &dyn ContainerRuntime,
    id: &str,
    work_dir: &Path,
    handle: &ContainerHandle,
) -> Result<Option<Volume>> {
    let code = runtime.wait(id)?;
    if handle.is_canceled() {
        return Ok(None);
    }
    if code != 0 {
        let logs = runtime.logs(id).unwrap_or_default();
        return Err(FlowError::Runtime(format!(
            "container {} exited with code {}: {}",
            id,
            code,
            logs.trim()
        )));
    }
    marshal::read_output(work_dir).map(Some)
}

impl PipelineExecutor for ExternalExecutor {
    fn kind(&self) -> ExecutionMode {
        ExecutionMode::External
    }

    fn execute(
        &mut self,
        request: ExecutionRequest,
        events: Sender<ExecutorMessage>,
    ) -> PipelineResult<()> {
        if self.is_running() {
            return Err(PipelineError::ExecutorBusy);
        }
        let description = ChainDescription::from_steps(&request.steps, request.start_index)?;

        let run = request.run;
        let handle = Arc::new(ContainerHandle::default());
        let worker_handle = handle.clone();
        let runtime = self.runtime.clone();
        let settings = self.settings.clone();
        let volume = request.volume;

        tracing::info!(
            "Starting {} in container image {}: {} operator(s) from index {}",
            run,
            settings.image,
            description.operators.len(),
            description.start_index
        );

        std::thread::Builder::new()
            .name(format!("tomoflow-external-{}", run))
            .spawn(move || {
                let event = match run_in_container(
                    runtime.as_ref(),
                    &settings,
                    &volume,
                    &description,
                    &worker_handle,
                ) {
                    Ok(Some(volume)) => ExecutorEvent::Finished(volume),
                    Ok(None) => ExecutorEvent::Canceled,
                    Err(_) if worker_handle.is_canceled() => ExecutorEvent::Canceled,
                    Err(e) => {
                        tracing::warn!("External {} failed: {}", run, e);
                        ExecutorEvent::Failed {
                            operator: None,
                            message: e.to_string(),
                        }
                    }
                };
                worker_handle.done.store(true, Ordering::SeqCst);
                let _ = events.send(ExecutorMessage::new(run, event));
            })
            .map_err(|e| PipelineError::Executor(format!("failed to spawn supervisor: {}", e)))?;

        self.active = Some(ExternalRun { run, handle });
        Ok(())
    }

    fn cancel(&mut self) -> bool {
        let Some(active) = self.running() else {
            return false;
        };
        tracing::info!("Canceling external {}", active.run);
        active.handle.canceled.store(true, Ordering::SeqCst);
        let handle = active.handle.clone();
        self.stop_container(&handle);
        true
    }

    fn cancel_operator(&mut self, _operator: OperatorId) -> bool {
        false
    }

    fn is_running(&self) -> bool {
        self.running().is_some()
    }

    fn snapshot_prior_to(&self, request: SnapshotRequest) -> VolumeFuture {
        if request.steps.is_empty() {
            return VolumeFuture::ready(Ok(request.volume));
        }
        let description = match ChainDescription::from_steps(&request.steps, 0) {
            Ok(d) => d,
            Err(e) => return VolumeFuture::ready(Err(e)),
        };

        let (tx, future) = VolumeFuture::channel();
        let runtime = self.runtime.clone();
        let settings = self.settings.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("tomoflow-external-snapshot-{}", request.operator.0))
            .spawn(move || {
                let handle = ContainerHandle::default();
                let result = match run_in_container(
                    runtime.as_ref(),
                    &settings,
                    &request.volume,
                    &description,
                    &handle,
                ) {
                    Ok(Some(volume)) => Ok(volume),
                    Ok(None) => Err(PipelineError::Executor("snapshot was canceled".into())),
                    Err(e) => Err(PipelineError::Executor(e.to_string())),
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
}

impl Drop for ExternalExecutor {
    fn drop(&mut self) {
        if self.is_running() {
            self.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::container::MockContainerRuntime;
    use crate::executor::ChainStep;
    use crate::pipeline::DataSourceId;
    use crate::transforms::{
        AddConstant, AnyTransform, BuiltinTransform, TransformContext, TransformPlugin,
        TransformResult,
    };
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    struct Local;

    impl TransformPlugin for Local {
        fn name(&self) -> &str {
            "Local"
        }

        fn apply(&self, _volume: &mut Volume, _ctx: &TransformContext) -> TransformResult {
            Ok(Default::default())
        }
    }

    fn request(steps: Vec<ChainStep>) -> ExecutionRequest {
        ExecutionRequest {
            run: RunId(7),
            data_source: DataSourceId(0),
            volume: Volume::zeros([2, 1, 1]),
            steps,
            start_index: 0,
        }
    }

    fn add(op: u32) -> ChainStep {
        ChainStep {
            operator: OperatorId(op),
            transform: BuiltinTransform::AddConstant(AddConstant::new(1.0)).into(),
        }
    }

    /// Mock that behaves like a container running `tomoflow run-chain`.
    fn working_runtime(pull: bool) -> MockContainerRuntime {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_pull()
            .times(if pull { 1 } else { 0 })
            .returning(|_| Ok(()));
        runtime.expect_start().times(1).returning(|spec| {
            let (host, _) = &spec.mounts[0];
            marshal::run_chain_files(
                &host.join(marshal::CHAIN_FILE),
                &host.join(marshal::INPUT_FILE),
                &host.join(marshal::OUTPUT_FILE),
            )?;
            Ok("c0ffee".to_string())
        });
        runtime.expect_wait().returning(|_| Ok(0));
        runtime.expect_remove().times(1).returning(|_| Ok(()));
        runtime
    }

    #[test]
    fn test_successful_run_reads_output() {
        let settings = ExternalSettings::default();
        let mut exec = ExternalExecutor::new(settings, Arc::new(working_runtime(true)));
        let (tx, rx) = unbounded();
        exec.execute(request(vec![add(0), add(1)]), tx).unwrap();

        let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(msg.run, RunId(7));
        match msg.event {
            ExecutorEvent::Finished(vol) => assert_eq!(vol.data(), &[2.0, 2.0]),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_pull_can_be_disabled() {
        let settings = ExternalSettings {
            pull: false,
            ..Default::default()
        };
        let mut exec = ExternalExecutor::new(settings, Arc::new(working_runtime(false)));
        let (tx, rx) = unbounded();
        exec.execute(request(vec![add(0)]), tx).unwrap();
        let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(msg.event, ExecutorEvent::Finished(_)));
    }

    #[test]
    fn test_nonzero_exit_fails_run() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_pull().returning(|_| Ok(()));
        runtime.expect_start().returning(|_| Ok("dead".to_string()));
        runtime.expect_wait().returning(|_| Ok(3));
        runtime
            .expect_logs()
            .returning(|_| Ok("transform exploded".to_string()));
        runtime.expect_remove().returning(|_| Ok(()));

        let mut exec = ExternalExecutor::new(ExternalSettings::default(), Arc::new(runtime));
        let (tx, rx) = unbounded();
        exec.execute(request(vec![add(0)]), tx).unwrap();
        match rx.recv_timeout(Duration::from_secs(5)).unwrap().event {
            ExecutorEvent::Failed { operator, message } => {
                assert_eq!(operator, None);
                assert!(message.contains("transform exploded"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_plugins_are_rejected_before_start() {
        let runtime = MockContainerRuntime::new();
        let mut exec = ExternalExecutor::new(ExternalSettings::default(), Arc::new(runtime));
        let (tx, _rx) = unbounded();
        let steps = vec![
            add(0),
            ChainStep {
                operator: OperatorId(1),
                transform: AnyTransform::Plugin(Arc::new(Local)),
            },
        ];
        assert!(matches!(
            exec.execute(request(steps), tx),
            Err(PipelineError::NotMarshallable { .. })
        ));
        assert!(!exec.is_running());
    }

    #[test]
    fn test_operator_cancel_is_unsupported() {
        let mut exec = ExternalExecutor::new(
            ExternalSettings::default(),
            Arc::new(MockContainerRuntime::new()),
        );
        assert!(!exec.cancel_operator(OperatorId(0)));
        assert!(!exec.cancel());
    }

    #[test]
    fn test_snapshot_of_first_operator_is_input() {
        let exec = ExternalExecutor::new(
            ExternalSettings::default(),
            Arc::new(MockContainerRuntime::new()),
        );
        let vol = exec
            .snapshot_prior_to(SnapshotRequest {
                operator: OperatorId(0),
                volume: Volume::filled([1, 1, 1], 5.0),
                steps: Vec::new(),
            })
            .wait()
            .unwrap();
        assert_eq!(vol.data(), &[5.0]);
    }
}
