//! Arena holding every data source and operator of one pipeline.
//!
//! Records live in `Vec<Option<_>>` slots addressed by [`DataSourceId`] and
//! [`OperatorId`]. Ownership is strictly top-down: the root owns its chain,
//! each operator may link to a child data source, and removal tears whole
//! subtrees out of the arena. Links are plain ids, so a removed record
//! simply stops resolving.
//!
//! Mutations that other parts of the system react to push a [`TreeEvent`]
//! onto an internal queue instead of calling back directly. The coordinator
//! drains the queue after each mutation.

use crate::pipeline::data_source::{DataSource, Module, Persistence};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::event::TreeEvent;
use crate::pipeline::id::{DataSourceId, OperatorId};
use crate::pipeline::operator::Operator;
use crate::transforms::AnyTransform;
use crate::volume::{Volume, VolumeProperties};
use std::collections::VecDeque;

/// Label given to data sources synthesized for chain output.
pub const OUTPUT_LABEL: &str = "Output";

#[derive(Debug)]
pub struct PipelineTree {
    data_sources: Vec<Option<DataSource>>,
    operators: Vec<Option<Operator>>,
    root: DataSourceId,
    events: VecDeque<TreeEvent>,
}

impl PipelineTree {
    /// Create a tree whose persistent root holds `volume`.
    pub fn new(label: impl Into<String>, volume: Volume, properties: VolumeProperties) -> Self {
        let root = DataSourceId(0);
        let mut ds = DataSource::new(root, label, Persistence::Persistent);
        ds.set_volume(Some(volume));
        ds.set_properties(properties, false);
        Self {
            data_sources: vec![Some(ds)],
            operators: Vec::new(),
            root,
            events: VecDeque::new(),
        }
    }

    pub fn root(&self) -> DataSourceId {
        self.root
    }

    // --- Lookup ---

    pub fn data_source(&self, id: DataSourceId) -> Option<&DataSource> {
        self.data_sources.get(id.index()).and_then(Option::as_ref)
    }

    pub fn operator(&self, id: OperatorId) -> Option<&Operator> {
        self.operators.get(id.index()).and_then(Option::as_ref)
    }

    pub fn ds(&self, id: DataSourceId) -> PipelineResult<&DataSource> {
        self.data_source(id)
            .ok_or(PipelineError::UnknownDataSource(id))
    }

    pub fn op(&self, id: OperatorId) -> PipelineResult<&Operator> {
        self.operator(id).ok_or(PipelineError::UnknownOperator(id))
    }

    pub(crate) fn ds_mut(&mut self, id: DataSourceId) -> PipelineResult<&mut DataSource> {
        self.data_sources
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(PipelineError::UnknownDataSource(id))
    }

    pub(crate) fn op_mut(&mut self, id: OperatorId) -> PipelineResult<&mut Operator> {
        self.operators
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(PipelineError::UnknownOperator(id))
    }

    /// Chain of `ds`, empty when `ds` does not exist.
    pub fn chain(&self, ds: DataSourceId) -> &[OperatorId] {
        self.data_source(ds).map(|d| d.operators()).unwrap_or(&[])
    }

    pub fn data_sources(&self) -> impl Iterator<Item = &DataSource> {
        self.data_sources.iter().flatten()
    }

    pub fn operators(&self) -> impl Iterator<Item = &Operator> {
        self.operators.iter().flatten()
    }

    pub fn data_source_count(&self) -> usize {
        self.data_sources().count()
    }

    pub fn operator_count(&self) -> usize {
        self.operators().count()
    }

    /// Position of `op` in its chain.
    pub fn index_in_chain(&self, op: OperatorId) -> Option<usize> {
        let input = self.operator(op)?.input();
        self.chain(input).iter().position(|&o| o == op)
    }

    // --- Structural mutation ---

    pub(crate) fn create_data_source(
        &mut self,
        label: impl Into<String>,
        persistence: Persistence,
    ) -> DataSourceId {
        let id = DataSourceId(self.data_sources.len() as u32);
        self.data_sources
            .push(Some(DataSource::new(id, label, persistence)));
        id
    }

    /// Append a new operator to the chain of `ds`.
    ///
    /// Transforms that produce their own output get an explicit child data
    /// source right away.
    pub fn add_operator(
        &mut self,
        ds: DataSourceId,
        transform: AnyTransform,
    ) -> PipelineResult<OperatorId> {
        self.ds(ds)?;
        let id = OperatorId(self.operators.len() as u32);
        let produces_child = transform.produces_child();
        self.operators.push(Some(Operator::new(id, ds, transform)));
        self.ds_mut(ds)?.push_operator(id);

        if produces_child {
            let child = self.create_data_source(OUTPUT_LABEL, Persistence::Transient);
            self.attach_child(id, child, true)?;
        }

        self.events.push_back(TreeEvent::OperatorAdded(id));
        Ok(id)
    }

    /// Remove `op` from its chain and the arena.
    ///
    /// The child it owned is detached but not destroyed; the coordinator
    /// decides whether it moves to the new tail or gets torn down.
    pub fn remove_operator(&mut self, op: OperatorId) -> PipelineResult<()> {
        let input = self.op(op)?.input();
        self.ds_mut(input)?.remove_operator(op);
        let mut record = self.operators[op.index()]
            .take()
            .ok_or(PipelineError::UnknownOperator(op))?;
        let child = record.take_child();
        if let Some(child) = child {
            if let Ok(ds) = self.ds_mut(child) {
                ds.set_producer(None);
            }
        }
        self.events.push_back(TreeEvent::OperatorRemoved {
            operator: op,
            data_source: input,
            state: record.state(),
            child,
        });
        Ok(())
    }

    /// Link `child` as the output of `op`.
    pub(crate) fn attach_child(
        &mut self,
        op: OperatorId,
        child: DataSourceId,
        explicit: bool,
    ) -> PipelineResult<()> {
        self.ds_mut(child)?.set_producer(Some(op));
        self.op_mut(op)?.set_child(Some(child), explicit);
        Ok(())
    }

    /// Unlink and return the child of `op`.
    pub(crate) fn detach_child(&mut self, op: OperatorId) -> PipelineResult<Option<DataSourceId>> {
        let child = self.op_mut(op)?.take_child();
        if let Some(child) = child {
            self.ds_mut(child)?.set_producer(None);
        }
        Ok(child)
    }

    /// Tear down `ds` with its whole subtree. No events are queued for the
    /// operators destroyed along the way. Returns the removed data sources.
    pub(crate) fn remove_data_source(
        &mut self,
        ds: DataSourceId,
    ) -> PipelineResult<Vec<DataSourceId>> {
        if ds == self.root {
            return Err(PipelineError::RootRemoval);
        }
        self.ds(ds)?;
        let mut removed = Vec::new();
        let mut pending = vec![ds];
        while let Some(id) = pending.pop() {
            let Some(record) = self.data_sources[id.index()].take() else {
                continue;
            };
            if let Some(producer) = record.producer() {
                if let Some(op) = self.operators.get_mut(producer.index()).and_then(Option::as_mut) {
                    op.set_child(None, false);
                }
            }
            for &op in record.operators() {
                if let Some(op) = self.operators[op.index()].take() {
                    pending.extend(op.child());
                }
            }
            removed.push(id);
        }
        Ok(removed)
    }

    // --- Data ---

    /// Replace the volume of `ds` and queue a data-changed event.
    pub fn set_data(&mut self, ds: DataSourceId, volume: Volume) -> PipelineResult<()> {
        self.ds_mut(ds)?.set_volume(Some(volume));
        self.data_modified(ds)
    }

    /// Queue a data-changed event for `ds`.
    pub fn data_modified(&mut self, ds: DataSourceId) -> PipelineResult<()> {
        self.ds(ds)?;
        self.events.push_back(TreeEvent::DataChanged(ds));
        Ok(())
    }

    /// Replace spacing and units. `by_user` stops them from following the
    /// root from now on.
    pub fn set_properties(
        &mut self,
        ds: DataSourceId,
        properties: VolumeProperties,
        by_user: bool,
    ) -> PipelineResult<()> {
        self.ds_mut(ds)?.set_properties(properties, by_user);
        self.events.push_back(TreeEvent::PropertiesChanged(ds));
        Ok(())
    }

    pub(crate) fn set_flows_from(
        &mut self,
        ds: DataSourceId,
        source: Option<DataSourceId>,
    ) -> PipelineResult<()> {
        self.ds_mut(ds)?.set_flows_from(source);
        Ok(())
    }

    /// Change the parameters of `op` and queue a transform-modified event.
    pub fn apply_parameters(&mut self, op: OperatorId, transform: AnyTransform) -> PipelineResult<()> {
        self.op_mut(op)?.apply_parameters(transform);
        self.transform_modified(op)
    }

    /// Queue a transform-modified event for `op`.
    pub fn transform_modified(&mut self, op: OperatorId) -> PipelineResult<()> {
        self.op(op)?;
        self.events.push_back(TreeEvent::TransformModified(op));
        Ok(())
    }

    pub fn add_module(&mut self, ds: DataSourceId, module: Module) -> PipelineResult<()> {
        self.ds_mut(ds)?.push_module(module);
        Ok(())
    }

    /// Move every module of `from` onto `to`.
    pub(crate) fn move_modules(&mut self, from: DataSourceId, to: DataSourceId) -> PipelineResult<usize> {
        self.ds(to)?;
        let modules = self.ds_mut(from)?.take_modules();
        let moved = modules.len();
        let target = self.ds_mut(to)?;
        for module in modules {
            target.push_module(module);
        }
        Ok(moved)
    }

    pub(crate) fn pop_event(&mut self) -> Option<TreeEvent> {
        self.events.pop_front()
    }

    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }

    // --- Queries over subtrees ---

    /// Whether any operator under `ds`, branches included, is being edited.
    pub fn being_edited(&self, ds: DataSourceId) -> bool {
        self.chain(ds).iter().any(|&id| match self.operator(id) {
            Some(op) => op.is_editing() || op.child().is_some_and(|c| self.being_edited(c)),
            None => false,
        })
    }

    /// First operator under `ds`, in chain order and descending into each
    /// operator's branch after the operator itself, that is not Complete.
    pub fn first_stale(&self, ds: DataSourceId) -> Option<OperatorId> {
        for &id in self.chain(ds) {
            let Some(op) = self.operator(id) else {
                continue;
            };
            if !op.is_complete() {
                return Some(id);
            }
            if let Some(found) = op.child().and_then(|c| self.first_stale(c)) {
                return Some(found);
            }
        }
        None
    }

    /// Every operator under `ds`, branches included.
    pub fn subtree_operators(&self, ds: DataSourceId) -> Vec<OperatorId> {
        let mut out = Vec::new();
        for &id in self.chain(ds) {
            out.push(id);
            if let Some(child) = self.operator(id).and_then(Operator::child) {
                out.extend(self.subtree_operators(child));
            }
        }
        out
    }

    /// Operator of `ds`'s chain that holds the chain's folded output: the
    /// last one owning a child that is not an explicit transform output.
    pub fn chain_output_owner(&self, ds: DataSourceId) -> Option<OperatorId> {
        self.chain(ds).iter().rev().copied().find(|&id| {
            self.operator(id)
                .is_some_and(|op| op.child().is_some() && !op.has_explicit_child())
        })
    }

    /// Operator owning the deepest materialized output under `ds`,
    /// following output nodes that carry chains of their own.
    pub fn transformed_data_source_operator(&self, ds: DataSourceId) -> Option<OperatorId> {
        for &id in self.chain(ds).iter().rev() {
            let Some(child) = self.operator(id).and_then(Operator::child) else {
                continue;
            };
            if !self.chain(child).is_empty() {
                return self.transformed_data_source_operator(child);
            }
            return Some(id);
        }
        None
    }

    /// Deepest output node under `ds`, or `ds` itself when nothing ran yet.
    pub fn transformed_data_source(&self, ds: DataSourceId) -> DataSourceId {
        self.transformed_data_source_operator(ds)
            .and_then(|op| self.operator(op).and_then(Operator::child))
            .unwrap_or(ds)
    }
}
