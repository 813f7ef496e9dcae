//! Validation adapter: checks extracted invoice data for required fields.
//!
//! Runs in-process. A missing field is a semantic result, not a tool
//! failure: the adapter succeeds with `is_valid: false` and the planner
//! decides what happens next.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::capability::{VALIDATE_INVOICE_DATA, VALIDATION_RESULT};
use crate::error::ToolError;

use super::{required_arg, Tool, ToolContext};

/// Fields every invoice must carry
pub const REQUIRED_FIELDS: [&str; 4] = ["invoice_number", "date", "total_amount", "vendor_name"];

/// Payload produced by the validation adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub missing_fields: Vec<String>,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ValidationAdapter;

impl ValidationAdapter {
    pub fn new() -> Self {
        Self
    }
}

/// Check extracted data for the required fields.
///
/// A field is present when found non-null and non-empty in `kv` or in
/// `document`; a bare object without those sections is checked directly.
pub fn validate(extracted: &Value) -> ValidationReport {
    let sections: Vec<&Value> = match (extracted.get("kv"), extracted.get("document")) {
        (None, None) => vec![extracted],
        (kv, document) => kv.into_iter().chain(document).collect(),
    };

    let missing_fields: Vec<String> = REQUIRED_FIELDS
        .iter()
        .filter(|field| !sections.iter().any(|section| has_field(section, field)))
        .map(|field| field.to_string())
        .collect();

    let is_valid = missing_fields.is_empty();
    let message = if is_valid {
        "All required fields are present.".to_string()
    } else {
        format!("Missing required fields: {}", missing_fields.join(", "))
    };

    ValidationReport {
        is_valid,
        missing_fields,
        message,
    }
}

fn has_field(section: &Value, field: &str) -> bool {
    match section.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

#[async_trait]
impl Tool for ValidationAdapter {
    fn name(&self) -> &str {
        VALIDATE_INVOICE_DATA
    }

    fn output_key(&self) -> &str {
        VALIDATION_RESULT
    }

    fn description(&self) -> &str {
        "Validate extracted invoice data for required fields. Args: {extracted_data}."
    }

    async fn invoke(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let extracted = required_arg(&args, "extracted_data")?;
        let report = validate(extracted);
        serde_json::to_value(report).map_err(|e| ToolError::malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProcessId;
    use serde_json::json;

    #[test]
    fn test_all_fields_present() {
        let extracted = json!({
            "source": "b/k",
            "document": { "invoice_number": "INV-1", "total_amount": 120.5 },
            "kv": { "date": "2024-03-01", "vendor_name": "ACME" }
        });

        let report = validate(&extracted);
        assert!(report.is_valid);
        assert!(report.missing_fields.is_empty());
    }

    #[test]
    fn test_missing_and_blank_fields() {
        let extracted = json!({
            "document": { "invoice_number": "INV-1", "vendor_name": "  " },
            "kv": { "date": null }
        });

        let report = validate(&extracted);
        assert!(!report.is_valid);
        assert_eq!(
            report.missing_fields,
            vec!["date", "total_amount", "vendor_name"]
        );
        assert!(report.message.contains("total_amount"));
    }

    #[test]
    fn test_bare_object() {
        let extracted = json!({
            "invoice_number": "INV-1",
            "date": "2024-03-01",
            "total_amount": "99.00",
            "vendor_name": "ACME"
        });
        assert!(validate(&extracted).is_valid);
    }

    #[tokio::test]
    async fn test_invoke_requires_extracted_data() {
        let ctx = ToolContext::new(ProcessId::external("p"), "k");
        let adapter = ValidationAdapter::new();

        assert!(adapter.invoke(json!({}), &ctx).await.is_err());

        let payload = adapter
            .invoke(json!({ "extracted_data": { "document": {} } }), &ctx)
            .await
            .unwrap();
        assert_eq!(payload["is_valid"], false);
        assert_eq!(payload["missing_fields"].as_array().unwrap().len(), 4);
    }
}
