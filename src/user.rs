//! The user context flags are evaluated against.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user to evaluate flags for. Immutable per call.
///
/// Only `user_id` is required; the rest feeds targeting rules inside the
/// engine. Custom data maps are flat: values are strings, numbers, or
/// booleans, not nested structures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Unique identifier for the user. Required, non-empty.
    #[serde(rename = "user_id")]
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_build: Option<String>,
    /// Flat custom targeting data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<HashMap<String, serde_json::Value>>,
    /// Like `custom_data`, but never forwarded in event payloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_custom_data: Option<HashMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_date: Option<DateTime<Utc>>,
}

impl User {
    /// Create a user with the given id and no other attributes.
    pub fn new(user_id: impl Into<String>) -> User {
        User {
            user_id: user_id.into(),
            email: None,
            name: None,
            language: None,
            country: None,
            app_version: None,
            app_build: None,
            custom_data: None,
            private_custom_data: None,
            created_date: None,
            last_seen_date: None,
        }
    }

    /// Set custom targeting data.
    pub fn with_custom_data(mut self, data: HashMap<String, serde_json::Value>) -> User {
        self.custom_data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::User;

    #[test]
    fn serializes_with_wire_field_names() {
        let user = User {
            email: Some("ada@example.com".to_owned()),
            app_version: Some("1.2.3".to_owned()),
            ..User::new("user-1")
        };

        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["user_id"], "user-1");
        assert_eq!(json["email"], "ada@example.com");
        assert_eq!(json["appVersion"], "1.2.3");
        // Unset optionals are omitted entirely.
        assert!(json.get("country").is_none());
        assert!(json.get("customData").is_none());
    }
}
