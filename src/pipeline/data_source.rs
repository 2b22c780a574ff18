//! Data sources: nodes holding a volume and the chain of operators consuming it.

use crate::pipeline::id::{DataSourceId, OperatorId};
use crate::volume::{Volume, VolumeProperties};
use serde::{Deserialize, Serialize};

/// Whether a data source outlives the operator that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Loaded by the user; the pipeline root.
    Persistent,
    /// Synthesized to hold a chain's output; lives as long as its producer.
    Transient,
}

/// A visualization attached to a data source.
///
/// The pipeline treats modules as opaque: a label plus serialized settings
/// that are carried over when a module moves to another data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub label: String,
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl Module {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            settings: serde_json::Value::Null,
        }
    }

    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = settings;
        self
    }
}

#[derive(Debug, Clone)]
pub struct DataSource {
    id: DataSourceId,
    label: String,
    persistence: Persistence,
    volume: Option<Volume>,
    properties: VolumeProperties,
    /// Set once the user edits this node's units or spacing directly.
    units_modified: bool,
    /// Source of the properties this node follows while unmodified.
    flows_from: Option<DataSourceId>,
    operators: Vec<OperatorId>,
    producer: Option<OperatorId>,
    modules: Vec<Module>,
}

impl DataSource {
    pub(crate) fn new(id: DataSourceId, label: impl Into<String>, persistence: Persistence) -> Self {
        Self {
            id,
            label: label.into(),
            persistence,
            volume: None,
            properties: VolumeProperties::default(),
            units_modified: false,
            flows_from: None,
            operators: Vec::new(),
            producer: None,
            modules: Vec::new(),
        }
    }

    pub fn id(&self) -> DataSourceId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    pub fn is_transient(&self) -> bool {
        self.persistence == Persistence::Transient
    }

    /// The materialized volume, if any run or load produced one.
    pub fn volume(&self) -> Option<&Volume> {
        self.volume.as_ref()
    }

    pub fn properties(&self) -> &VolumeProperties {
        &self.properties
    }

    pub fn units_modified(&self) -> bool {
        self.units_modified
    }

    pub fn flows_from(&self) -> Option<DataSourceId> {
        self.flows_from
    }

    /// Operators in execution order.
    pub fn operators(&self) -> &[OperatorId] {
        &self.operators
    }

    /// Operator whose output this data source holds.
    pub fn producer(&self) -> Option<OperatorId> {
        self.producer
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub(crate) fn set_volume(&mut self, volume: Option<Volume>) {
        self.volume = volume;
    }

    /// Replace the properties. `by_user` pins them against upstream flow.
    pub(crate) fn set_properties(&mut self, properties: VolumeProperties, by_user: bool) {
        self.properties = properties;
        if by_user {
            self.units_modified = true;
        }
    }

    pub(crate) fn set_flows_from(&mut self, source: Option<DataSourceId>) {
        self.flows_from = source;
    }

    pub(crate) fn set_producer(&mut self, producer: Option<OperatorId>) {
        self.producer = producer;
    }

    pub(crate) fn push_operator(&mut self, op: OperatorId) {
        self.operators.push(op);
    }

    /// Remove `op` from the chain, returning its former index.
    pub(crate) fn remove_operator(&mut self, op: OperatorId) -> Option<usize> {
        let index = self.operators.iter().position(|&o| o == op)?;
        self.operators.remove(index);
        Some(index)
    }

    pub(crate) fn push_module(&mut self, module: Module) {
        self.modules.push(module);
    }

    pub(crate) fn take_modules(&mut self) -> Vec<Module> {
        std::mem::take(&mut self.modules)
    }
}
