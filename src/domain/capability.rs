//! Declared capabilities: the tools a pipeline may call and where their
//! outputs land in pipeline state.

use serde::{Deserialize, Serialize};

pub const EXTRACT_DOCUMENT: &str = "extract_document";
pub const VALIDATE_INVOICE_DATA: &str = "validate_invoice_data";
pub const POST_INVOICE: &str = "post_invoice";
pub const SEND_NOTIFICATION: &str = "send_notification";

pub const EXTRACTED_DATA: &str = "extracted_data";
pub const VALIDATION_RESULT: &str = "validation_result";
pub const POSTING_RESULT: &str = "posting_result";
pub const NOTIFICATION_RESULT: &str = "notification_result";

/// One declared tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Tool name the planner selects
    pub name: String,

    /// Pipeline state key the tool's payload is merged under
    pub output_key: String,

    /// Human-readable description (shown to model-driven planners)
    pub description: String,
}

/// The set of tools available to one deployment, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    capabilities: Vec<Capability>,
}

impl CapabilitySet {
    pub fn new(capabilities: Vec<Capability>) -> Self {
        Self { capabilities }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.name == name)
    }

    /// Output key of a tool, if declared
    pub fn output_key(&self, name: &str) -> Option<&str> {
        self.get(name).map(|c| c.output_key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}
