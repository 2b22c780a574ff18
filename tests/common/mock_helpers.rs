//! Mock construction helpers

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tomoflow::executor::{marshal, ContainerRuntime, ContainerSpec};
use tomoflow::transforms::{
    AnyTransform, TransformContext, TransformError, TransformOutput, TransformPlugin,
    TransformResult,
};
use tomoflow::{FlowError, Volume};

/// Plugin that adds 1 once released, polling for cancellation meanwhile.
#[derive(Default)]
pub struct Gate {
    open: AtomicBool,
    entered: AtomicUsize,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn release(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    /// How many times `apply` was entered.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Block until `apply` has been entered `n` times.
    pub fn wait_entered(&self, n: usize, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while self.entered() < n {
            if std::time::Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub fn transform(self: &Arc<Self>) -> AnyTransform {
        AnyTransform::Plugin(self.clone())
    }
}

impl TransformPlugin for Gate {
    fn name(&self) -> &str {
        "Gate"
    }

    fn apply(&self, volume: &mut Volume, ctx: &TransformContext) -> TransformResult {
        self.entered.fetch_add(1, Ordering::SeqCst);
        while !self.open.load(Ordering::SeqCst) {
            ctx.checkpoint()?;
            std::thread::sleep(Duration::from_millis(1));
        }
        for v in volume.data_mut() {
            *v += 1.0;
        }
        Ok(TransformOutput::default())
    }

    fn interruptible(&self) -> bool {
        true
    }
}

/// Plugin that always fails.
pub struct Broken;

impl TransformPlugin for Broken {
    fn name(&self) -> &str {
        "Broken"
    }

    fn apply(&self, _volume: &mut Volume, _ctx: &TransformContext) -> TransformResult {
        Err(TransformError::Failed("broken on purpose".into()))
    }
}

/// Plugin writing a doubled copy of its input into an explicit child.
pub struct Doubler;

impl TransformPlugin for Doubler {
    fn name(&self) -> &str {
        "Doubler"
    }

    fn apply(&self, volume: &mut Volume, _ctx: &TransformContext) -> TransformResult {
        let mut child = volume.clone();
        for v in child.data_mut() {
            *v *= 2.0;
        }
        Ok(TransformOutput { child: Some(child) })
    }

    fn produces_child(&self) -> bool {
        true
    }
}

/// Container runtime that runs the marshalled chain in-process.
///
/// `start` executes the chain found in the `/work` mount, so `wait` returns
/// immediately. Calls are recorded for assertions.
#[derive(Default)]
pub struct LocalRuntime {
    pub calls: Mutex<Vec<String>>,
    pub exit_code: Mutex<i32>,
}

impl LocalRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(code: i32) -> Arc<Self> {
        let runtime = Self::default();
        *runtime.exit_code.lock().unwrap() = code;
        Arc::new(runtime)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

impl ContainerRuntime for LocalRuntime {
    fn pull(&self, image: &str) -> tomoflow::Result<()> {
        self.record(format!("pull {}", image));
        Ok(())
    }

    fn start(&self, spec: &ContainerSpec) -> tomoflow::Result<String> {
        self.record("start");
        let (host, _) = spec
            .mounts
            .first()
            .ok_or_else(|| FlowError::Runtime("no work mount".into()))?;
        if *self.exit_code.lock().unwrap() == 0 {
            marshal::run_chain_files(
                &host.join(marshal::CHAIN_FILE),
                &host.join(marshal::INPUT_FILE),
                &host.join(marshal::OUTPUT_FILE),
            )?;
        }
        Ok("local-1".to_string())
    }

    fn wait(&self, _id: &str) -> tomoflow::Result<i32> {
        self.record("wait");
        Ok(*self.exit_code.lock().unwrap())
    }

    fn stop(&self, _id: &str) -> tomoflow::Result<()> {
        self.record("stop");
        Ok(())
    }

    fn remove(&self, _id: &str) -> tomoflow::Result<()> {
        self.record("remove");
        Ok(())
    }

    fn logs(&self, _id: &str) -> tomoflow::Result<String> {
        Ok("chain exploded".to_string())
    }
}
