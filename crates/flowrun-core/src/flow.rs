use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::step::{Step, StepId};

/// A mutable flow entity pointing at its currently published version.
///
/// Historical versions remain addressable so that in-flight runs started
/// under an older version can still be re-executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Flow {
    pub id: Uuid,
    pub name: String,
    /// Version number of the published version, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<u32>,
}

/// An immutable snapshot of a flow's step graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowVersion {
    pub flow_id: Uuid,
    /// Monotonically increasing per flow.
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The entry trigger step.
    pub entry: StepId,
    /// All steps, keyed by id. Insertion order is the authoring order.
    pub steps: IndexMap<StepId, Step>,
}

impl FlowVersion {
    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.get(id)
    }

    pub fn entry_step(&self) -> Option<&Step> {
        self.steps.get(&self.entry)
    }

    /// Build a version from a list of steps whose first trigger step is
    /// the entry.
    pub fn from_steps(flow_id: Uuid, version: u32, steps: Vec<Step>) -> Option<Self> {
        let entry = steps
            .iter()
            .find(|s| s.kind.is_trigger())
            .map(|s| s.id.clone())?;
        Some(Self {
            flow_id,
            version,
            name: None,
            entry,
            steps: steps.into_iter().map(|s| (s.id.clone(), s)).collect(),
        })
    }
}
