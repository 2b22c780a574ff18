//! On-disk contract between the external executor and `tomoflow run-chain`.
//!
//! The executor fills a work directory with [`CHAIN_FILE`] and
//! [`INPUT_FILE`], mounts it at [`WORK_MOUNT`], and runs
//! [`container_args`] inside the container. A zero exit code and a readable
//! [`OUTPUT_FILE`] mean success.

use crate::error::{FlowError, Result, ResultExt};
use crate::executor::{run_chain, ChainOutcome, ChainStep, RunControl};
use crate::pipeline::{OperatorId, PipelineError, PipelineResult};
use crate::transforms::BuiltinTransform;
use crate::volume::Volume;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const WORK_MOUNT: &str = "/work";
pub const CHAIN_FILE: &str = "chain.json";
pub const INPUT_FILE: &str = "input.vol";
pub const OUTPUT_FILE: &str = "output.vol";

/// One operator of a marshalled chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarshalledStep {
    pub operator: OperatorId,
    pub transform: BuiltinTransform,
}

/// Serialized form of an execution request's operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDescription {
    pub start_index: usize,
    pub operators: Vec<MarshalledStep>,
}

impl ChainDescription {
    /// Describe `steps`. Plugin transforms cannot leave the process.
    pub fn from_steps(steps: &[ChainStep], start_index: usize) -> PipelineResult<Self> {
        let operators = steps
            .iter()
            .map(|step| match step.transform.spec() {
                Some(spec) => Ok(MarshalledStep {
                    operator: step.operator,
                    transform: spec.clone(),
                }),
                None => Err(PipelineError::NotMarshallable {
                    operator: step.operator,
                    name: step.transform.name().to_string(),
                }),
            })
            .collect::<PipelineResult<Vec<_>>>()?;
        Ok(Self {
            start_index,
            operators,
        })
    }

    pub fn into_steps(self) -> Vec<ChainStep> {
        self.operators
            .into_iter()
            .map(|m| ChainStep {
                operator: m.operator,
                transform: m.transform.into(),
            })
            .collect()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).context(format!("Failed to read {:?}", path))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).context(format!("Failed to write {:?}", path))
    }
}

/// Arguments of the command run inside the container.
pub fn container_args() -> Vec<String> {
    let file = |name: &str| format!("{}/{}", WORK_MOUNT, name);
    vec![
        "tomoflow".to_string(),
        "run-chain".to_string(),
        "--state".to_string(),
        file(CHAIN_FILE),
        "--input".to_string(),
        file(INPUT_FILE),
        "--output".to_string(),
        file(OUTPUT_FILE),
    ]
}

/// Populate `dir` with the chain description and input volume.
pub fn write_work_dir(dir: &Path, volume: &Volume, description: &ChainDescription) -> Result<()> {
    description.save(&dir.join(CHAIN_FILE))?;
    volume.save(dir.join(INPUT_FILE))
}

/// Read the volume a finished container left in `dir`.
pub fn read_output(dir: &Path) -> Result<Volume> {
    Volume::load(dir.join(OUTPUT_FILE)).context("Failed to read container output".to_string())
}

/// Execute a marshalled chain. This is what `tomoflow run-chain` does.
pub fn run_chain_files(state: &Path, input: &Path, output: &Path) -> Result<()> {
    let description = ChainDescription::load(state)?;
    let volume = Volume::load(input)?;
    let steps = description.into_steps();
    tracing::info!("Running {} marshalled operator(s)", steps.len());

    let control = RunControl::new();
    match run_chain(volume, &steps, &control, |_| {}) {
        ChainOutcome::Completed(volume) => volume.save(output),
        ChainOutcome::Canceled => Err(FlowError::Runtime("chain was canceled".to_string())),
        ChainOutcome::Failed { operator, message } => {
            Err(PipelineError::Transform { operator, message }.into())
        }
    }
}
