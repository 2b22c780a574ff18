//! Thread boundary between the coordinator and whatever drives it.
//!
//! The coordinator runs on a dedicated control thread that multiplexes
//! commands from the caller with messages from the active executor.
//! Notifications flow back over a bounded channel.

use crate::config::ExecutionMode;
use crate::pipeline::coordinator::Pipeline;
use crate::pipeline::event::{PipelineNotification, RunFuture, RunOutcome};
use crate::pipeline::id::{DataSourceId, OperatorId};
use crate::transforms::AnyTransform;
use crate::volume::VolumeProperties;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::thread::JoinHandle;

/// Commands sent to the control thread.
#[derive(Debug, Clone)]
pub enum PipelineCommand {
    AddOperator {
        data_source: DataSourceId,
        transform: AnyTransform,
    },
    RemoveOperator(OperatorId),
    ApplyParameters {
        operator: OperatorId,
        transform: AnyTransform,
    },
    /// Re-evaluate a data source (root when `None`).
    Execute(Option<DataSourceId>),
    /// Re-evaluate and report the terminal volume on `reply`.
    ExecuteAndReply {
        data_source: Option<DataSourceId>,
        reply: Sender<RunOutcome>,
    },
    StartedEditing(OperatorId),
    FinishedEditing(OperatorId),
    SetProperties {
        data_source: DataSourceId,
        properties: VolumeProperties,
    },
    Pause,
    Resume { run: bool },
    Cancel,
    SetExecutionMode(ExecutionMode),
    /// Shut down the control thread.
    Shutdown,
}

/// Channel capacity for commands (caller → pipeline).
const CMD_CHANNEL_CAPACITY: usize = 256;
/// Channel capacity for notifications (pipeline → caller).
const MSG_CHANNEL_CAPACITY: usize = 10_000;

/// Caller-side handle for the control thread.
pub struct PipelineBridge {
    pub cmd_tx: Sender<PipelineCommand>,
    pub msg_rx: Receiver<PipelineNotification>,
}

impl PipelineBridge {
    /// Create a new bridge pair: `(bridge, cmd_rx, msg_tx)`.
    ///
    /// The control thread owns `cmd_rx` and `msg_tx`.
    pub fn new() -> (Self, Receiver<PipelineCommand>, Sender<PipelineNotification>) {
        let (cmd_tx, cmd_rx) = bounded(CMD_CHANNEL_CAPACITY);
        let (msg_tx, msg_rx) = bounded(MSG_CHANNEL_CAPACITY);
        (Self { cmd_tx, msg_rx }, cmd_rx, msg_tx)
    }

    /// Move `pipeline` onto its own control thread. Joining the handle after
    /// [`PipelineBridge::shutdown`] gives the pipeline back.
    pub fn spawn(mut pipeline: Pipeline) -> std::io::Result<(Self, JoinHandle<Pipeline>)> {
        let (bridge, cmd_rx, msg_tx) = Self::new();
        pipeline.add_subscriber(msg_tx);
        let handle = std::thread::Builder::new()
            .name("tomoflow-control".into())
            .spawn(move || {
                pipeline.run(cmd_rx);
                pipeline
            })?;
        Ok((bridge, handle))
    }

    // --- Drain notifications ---

    /// Drain all pending notifications.
    pub fn drain(&self) -> Vec<PipelineNotification> {
        let mut msgs = Vec::new();
        while let Ok(msg) = self.msg_rx.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    /// Try to receive a single notification without blocking.
    pub fn try_recv(&self) -> Option<PipelineNotification> {
        self.msg_rx.try_recv().ok()
    }

    // --- Commands ---

    pub fn send_command(&self, cmd: PipelineCommand) -> bool {
        self.cmd_tx.send(cmd).is_ok()
    }

    pub fn add_operator(&self, data_source: DataSourceId, transform: impl Into<AnyTransform>) {
        let _ = self.cmd_tx.send(PipelineCommand::AddOperator {
            data_source,
            transform: transform.into(),
        });
    }

    pub fn remove_operator(&self, operator: OperatorId) {
        let _ = self.cmd_tx.send(PipelineCommand::RemoveOperator(operator));
    }

    pub fn apply_parameters(&self, operator: OperatorId, transform: impl Into<AnyTransform>) {
        let _ = self.cmd_tx.send(PipelineCommand::ApplyParameters {
            operator,
            transform: transform.into(),
        });
    }

    pub fn execute(&self, data_source: Option<DataSourceId>) {
        let _ = self.cmd_tx.send(PipelineCommand::Execute(data_source));
    }

    /// Execute and get a future for the terminal volume.
    pub fn execute_future(&self, data_source: Option<DataSourceId>) -> RunFuture {
        let (reply, future) = RunFuture::channel();
        if self
            .cmd_tx
            .send(PipelineCommand::ExecuteAndReply { data_source, reply })
            .is_err()
        {
            return RunFuture::ready(RunOutcome::Failed("control thread gone".into()));
        }
        future
    }

    pub fn pause(&self) {
        let _ = self.cmd_tx.send(PipelineCommand::Pause);
    }

    pub fn resume(&self, run: bool) {
        let _ = self.cmd_tx.send(PipelineCommand::Resume { run });
    }

    pub fn cancel(&self) {
        let _ = self.cmd_tx.send(PipelineCommand::Cancel);
    }

    pub fn set_execution_mode(&self, mode: ExecutionMode) {
        let _ = self.cmd_tx.send(PipelineCommand::SetExecutionMode(mode));
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(PipelineCommand::Shutdown);
    }
}

impl Pipeline {
    /// Control loop. Returns on [`PipelineCommand::Shutdown`] or when every
    /// command sender is gone; an in-flight run is canceled on the way out.
    pub fn run(&mut self, cmd_rx: Receiver<PipelineCommand>) {
        tracing::info!("Pipeline control thread started");
        let executor_rx = self.executor_messages();

        loop {
            select! {
                recv(cmd_rx) -> cmd => match cmd {
                    Ok(PipelineCommand::Shutdown) | Err(_) => break,
                    Ok(cmd) => self.handle_command(cmd),
                },
                recv(executor_rx) -> msg => {
                    if let Ok(msg) = msg {
                        self.handle_executor_message(msg);
                    }
                }
            }
        }

        if self.is_running() {
            self.cancel();
        }
        tracing::info!("Pipeline control thread exiting");
    }

    fn handle_command(&mut self, cmd: PipelineCommand) {
        tracing::debug!("Command: {:?}", cmd);
        let result = match cmd {
            PipelineCommand::AddOperator {
                data_source,
                transform,
            } => self.add_operator(data_source, transform).map(|_| ()),
            PipelineCommand::RemoveOperator(op) => self.remove_operator(op),
            PipelineCommand::ApplyParameters {
                operator,
                transform,
            } => self.apply_parameters(operator, transform),
            PipelineCommand::Execute(ds) => self.execute(ds, None).map(|_| ()),
            PipelineCommand::ExecuteAndReply { data_source, reply } => {
                self.execute_with_reply(data_source, reply)
            }
            PipelineCommand::StartedEditing(op) => self.started_editing(op),
            PipelineCommand::FinishedEditing(op) => self.finished_editing(op),
            PipelineCommand::SetProperties {
                data_source,
                properties,
            } => self.set_properties(data_source, properties),
            PipelineCommand::Pause => {
                self.pause();
                Ok(())
            }
            PipelineCommand::Resume { run } => {
                self.resume(run);
                Ok(())
            }
            PipelineCommand::Cancel => {
                self.cancel();
                Ok(())
            }
            PipelineCommand::SetExecutionMode(mode) => {
                self.set_execution_mode(mode);
                Ok(())
            }
            PipelineCommand::Shutdown => Ok(()),
        };

        if let Err(e) = result {
            tracing::warn!("Command failed: {}", e);
            self.notify(PipelineNotification::Failed {
                operator: None,
                message: e.to_string(),
            });
        }
    }
}
