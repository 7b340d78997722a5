//! The structured field set produced by abstract extraction.

use serde_json::{Map, Value};

/// Every field the extraction prompt asks for, in output column order.
pub const STRUCTURED_FIELDS: [&str; 23] = [
    "use_cases",
    "opportunities",
    "challenges",
    "ai_category",
    "business_function",
    "technical_complexity",
    "roi_impact",
    "time_horizon",
    "industry_segment",
    "implementation_stage",
    "data_requirements",
    "model_family",
    "deployment_pattern",
    "human_in_the_loop",
    "risk_factors",
    "compliance_considerations",
    "kpis",
    "stakeholders",
    "cost_profile",
    "scalability",
    "integration_complexity",
    "confidence_score",
    "concise_summary",
];

/// Fields whose default is an empty list rather than null.
pub const LIST_FIELDS: [&str; 8] = [
    "use_cases",
    "opportunities",
    "challenges",
    "data_requirements",
    "risk_factors",
    "compliance_considerations",
    "kpis",
    "stakeholders",
];

pub fn is_list_field(name: &str) -> bool {
    LIST_FIELDS.contains(&name)
}

pub fn default_value(name: &str) -> Value {
    if is_list_field(name) {
        Value::Array(Vec::new())
    } else {
        Value::Null
    }
}

/// Payload with every field set to its default.
pub fn blank_payload() -> Map<String, Value> {
    STRUCTURED_FIELDS
        .iter()
        .map(|field| (field.to_string(), default_value(field)))
        .collect()
}

/// Project an arbitrary object onto the field set.
///
/// Present keys keep their value (strings trimmed), absent keys get their
/// default, and keys outside the field set are dropped.
pub fn normalize_payload(payload: &Map<String, Value>) -> Map<String, Value> {
    STRUCTURED_FIELDS
        .iter()
        .map(|field| {
            let value = match payload.get(*field) {
                Some(Value::String(text)) => Value::String(text.trim().to_string()),
                Some(other) => other.clone(),
                None => default_value(field),
            };
            (field.to_string(), value)
        })
        .collect()
}
