//! Sequential chain runner shared by every execution strategy.
//!
//! Operators run strictly in list order. Each operator transforms a copy of
//! the current volume so an operator that is excised mid-flight leaves the
//! input untouched for the next one.

use crate::executor::control::RunControl;
use crate::pipeline::OperatorId;
use crate::transforms::{AnyTransform, TransformContext, TransformError};
use crate::volume::Volume;

/// One operator of an execution request.
#[derive(Debug, Clone)]
pub struct ChainStep {
    pub operator: OperatorId,
    pub transform: AnyTransform,
}

/// Progress reported while a chain runs.
#[derive(Debug)]
pub enum StepEvent {
    Started(OperatorId),
    Finished {
        operator: OperatorId,
        child: Option<Volume>,
    },
    Excised(OperatorId),
}

/// Terminal result of a chain.
#[derive(Debug)]
pub enum ChainOutcome {
    Completed(Volume),
    Canceled,
    Failed {
        operator: OperatorId,
        message: String,
    },
}

/// Run `steps` in order over `volume`.
pub fn run_chain(
    mut volume: Volume,
    steps: &[ChainStep],
    control: &RunControl,
    mut on_event: impl FnMut(StepEvent),
) -> ChainOutcome {
    for step in steps {
        if control.is_canceled() {
            return ChainOutcome::Canceled;
        }

        let Some(token) = control.begin(step.operator, step.transform.interruptible()) else {
            tracing::debug!("Skipping excised operator {:?}", step.operator);
            on_event(StepEvent::Excised(step.operator));
            continue;
        };

        on_event(StepEvent::Started(step.operator));
        tracing::debug!(
            "Running operator {:?} ('{}')",
            step.operator,
            step.transform.name()
        );

        let ctx = TransformContext::new(token);
        let mut next = volume.clone();
        match step.transform.apply(&mut next, &ctx) {
            Ok(output) => {
                control.finish(step.operator, true);
                volume = next;
                on_event(StepEvent::Finished {
                    operator: step.operator,
                    child: output.child,
                });
            }
            Err(TransformError::Canceled) => {
                control.finish(step.operator, false);
                if control.is_canceled() {
                    return ChainOutcome::Canceled;
                }
                // Only this operator was pulled out; continue with its input.
                on_event(StepEvent::Excised(step.operator));
            }
            Err(TransformError::Failed(message)) => {
                control.finish(step.operator, false);
                if control.is_excised(step.operator) {
                    on_event(StepEvent::Excised(step.operator));
                    continue;
                }
                tracing::warn!("Operator {:?} failed: {}", step.operator, message);
                return ChainOutcome::Failed {
                    operator: step.operator,
                    message,
                };
            }
        }
    }

    if control.is_canceled() {
        return ChainOutcome::Canceled;
    }
    ChainOutcome::Completed(volume)
}
