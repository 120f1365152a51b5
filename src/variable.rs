//! Variable evaluation results.
use serde::{Deserialize, Serialize};

/// The type a variable is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableType {
    Boolean,
    String,
    Number,
    JSON,
}

/// A variable value. The engine resolves the declared type before returning
/// a value, so a given key always yields the same variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_more::From)]
#[serde(untagged)]
pub enum VariableValue {
    Boolean(bool),
    Number(f64),
    String(String),
    Json(serde_json::Value),
}

impl VariableValue {
    /// The [`VariableType`] this value belongs to.
    pub fn variable_type(&self) -> VariableType {
        match self {
            VariableValue::Boolean(_) => VariableType::Boolean,
            VariableValue::Number(_) => VariableType::Number,
            VariableValue::String(_) => VariableType::String,
            VariableValue::Json(_) => VariableType::JSON,
        }
    }

    /// Returns the boolean value, if this is a boolean.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            VariableValue::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the numeric value, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            VariableValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the string value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            VariableValue::String(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> VariableValue {
        VariableValue::String(value.to_owned())
    }
}

/// Why an evaluation produced the value it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalReason {
    /// Coarse category, e.g. `"DEFAULT"` or `"TARGETING_MATCH"`.
    pub reason: String,
    /// Human-readable detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Id of the matched targeting rule, when one matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
}

impl EvalReason {
    pub(crate) const DEFAULT: &'static str = "DEFAULT";

    pub(crate) const DETAILS_MISSING_CONFIG: &'static str = "Missing Config";
    pub(crate) const DETAILS_USER_NOT_TARGETED: &'static str = "User Not Targeted";
    pub(crate) const DETAILS_ERROR: &'static str = "Error";

    /// A reason explaining a locally-synthesized default.
    pub(crate) fn defaulted(details: &str) -> EvalReason {
        EvalReason {
            reason: EvalReason::DEFAULT.to_owned(),
            details: Some(details.to_owned()),
            target_id: None,
        }
    }
}

/// Result of evaluating a variable for a user.
///
/// Produced by the engine, or synthesized locally as a default when the
/// engine is unavailable, the key is unknown, or the engine-resolved type
/// mismatches the requested one. `eval_reason` tells the two apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub key: String,
    #[serde(rename = "type")]
    pub variable_type: VariableType,
    pub value: VariableValue,
    #[serde(default)]
    pub is_defaulted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<VariableValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_reason: Option<EvalReason>,
}

impl Variable {
    /// Synthesize a defaulted variable carrying the reason the default was
    /// served.
    pub(crate) fn defaulted(key: &str, default_value: VariableValue, details: &str) -> Variable {
        Variable {
            id: None,
            key: key.to_owned(),
            variable_type: default_value.variable_type(),
            value: default_value.clone(),
            is_defaulted: true,
            default_value: Some(default_value),
            eval_reason: Some(EvalReason::defaulted(details)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_types_are_classified() {
        assert_eq!(
            VariableValue::from(true).variable_type(),
            VariableType::Boolean
        );
        assert_eq!(
            VariableValue::from(3.5).variable_type(),
            VariableType::Number
        );
        assert_eq!(
            VariableValue::from("on").variable_type(),
            VariableType::String
        );
        assert_eq!(
            VariableValue::Json(serde_json::json!({"a": 1})).variable_type(),
            VariableType::JSON
        );
    }

    #[test]
    fn engine_variable_json_decodes() {
        let variable: Variable = serde_json::from_str(
            r#"{"_id":"63f","key":"show-banner","type":"Boolean","value":true,
                "evalReason":{"reason":"TARGETING_MATCH","target_id":"t-1"}}"#,
        )
        .unwrap();

        assert_eq!(variable.key, "show-banner");
        assert_eq!(variable.variable_type, VariableType::Boolean);
        assert_eq!(variable.value.as_boolean(), Some(true));
        assert!(!variable.is_defaulted);
        assert_eq!(variable.eval_reason.unwrap().reason, "TARGETING_MATCH");
    }

    #[test]
    fn defaulted_variable_carries_reason() {
        let variable = Variable::defaulted(
            "show-banner",
            VariableValue::from(false),
            EvalReason::DETAILS_MISSING_CONFIG,
        );

        assert!(variable.is_defaulted);
        assert_eq!(variable.value.as_boolean(), Some(false));
        assert_eq!(variable.default_value.unwrap().as_boolean(), Some(false));
        let reason = variable.eval_reason.unwrap();
        assert_eq!(reason.reason, EvalReason::DEFAULT);
        assert_eq!(reason.details.as_deref(), Some("Missing Config"));
    }
}
