//! The full per-user evaluation result produced by the engine.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{User, Variable};

/// A feature the user is bucketed into.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    #[serde(rename = "_id")]
    pub id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub feature_type: String,
    /// Id of the variation served to this user.
    #[serde(rename = "_variation")]
    pub variation: String,
    #[serde(default)]
    pub variation_key: Option<String>,
    #[serde(default)]
    pub variation_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(rename = "_id")]
    pub id: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    #[serde(rename = "_id")]
    pub id: String,
    pub key: String,
}

/// Feature/variation pair a variable resolves through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureVariation {
    #[serde(rename = "_feature")]
    pub feature: String,
    #[serde(rename = "_variation")]
    pub variation: String,
}

/// The engine's full evaluation of one user against the active
/// configuration: every feature and variable the user resolves to.
/// Powers "all variables" and "all features".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketedConfig {
    pub project: Project,
    pub environment: Environment,
    #[serde(default)]
    pub features: HashMap<String, Feature>,
    #[serde(default)]
    pub feature_variation_map: HashMap<String, String>,
    #[serde(default)]
    pub variable_variation_map: HashMap<String, FeatureVariation>,
    #[serde(default)]
    pub variables: HashMap<String, Variable>,
    #[serde(default)]
    pub known_variable_keys: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

#[cfg(test)]
mod tests {
    use super::BucketedConfig;

    #[test]
    fn decodes_engine_output() {
        let config: BucketedConfig = serde_json::from_str(
            r#"{
                "project": {"_id": "p-1", "key": "web", "a0_organization": "org"},
                "environment": {"_id": "e-1", "key": "production"},
                "features": {
                    "checkout": {
                        "_id": "f-1", "key": "checkout", "type": "release",
                        "_variation": "v-1", "variationKey": "on"
                    }
                },
                "featureVariationMap": {"f-1": "v-1"},
                "variableVariationMap": {
                    "checkout-enabled": {"_feature": "f-1", "_variation": "v-1"}
                },
                "variables": {
                    "checkout-enabled": {
                        "key": "checkout-enabled", "type": "Boolean", "value": true
                    }
                },
                "knownVariableKeys": [151.0]
            }"#,
        )
        .unwrap();

        assert_eq!(config.project.key, "web");
        assert_eq!(config.environment.key, "production");
        assert_eq!(config.features["checkout"].variation_key.as_deref(), Some("on"));
        assert_eq!(
            config.variable_variation_map["checkout-enabled"].feature,
            "f-1"
        );
        assert!(config.variables["checkout-enabled"]
            .value
            .as_boolean()
            .unwrap());
        assert!(config.user.is_none());
    }
}
