//! The client façade: input validation over the local evaluation runtime.
use std::collections::HashMap;
use std::sync::Arc;

use crate::configuration::{ConfigApiClient, ConfigMetadata, EnvironmentConfigManager};
use crate::engine::{BucketingEngine, WasmBucketing};
use crate::events::{Event, EventApiClient, EventQueueManager, EventType};
use crate::platform_data::PlatformData;
use crate::variable::EvalReason;
use crate::{Error, Feature, Options, Result, User, Variable, VariableValue};

/// A client evaluating flags locally against the embedded engine.
///
/// Evaluation never fails for engine or network reasons: it degrades to the
/// caller-supplied default carrying a reason, so the only errors surfaced
/// from evaluation calls are input-validation ones.
///
/// # Examples
/// ```no_run
/// # fn main() -> flagpole::Result<()> {
/// let client = flagpole::Client::new("server-key", flagpole::Options::new())?;
/// let user = flagpole::User::new("user-1");
/// let enabled = client
///     .variable_value(&user, "show-banner", false.into())?
///     .as_boolean()
///     .unwrap_or(false);
/// # Ok(()) }
/// ```
pub struct Client {
    engine: Arc<dyn BucketingEngine>,
    config_manager: EnvironmentConfigManager,
    event_queue: EventQueueManager,
}

impl Client {
    /// Create a client and start its background synchronization.
    pub fn new(sdk_key: impl Into<String>, mut options: Options) -> Result<Client> {
        let sdk_key = sdk_key.into();
        validate_sdk_key(&sdk_key)?;
        options.normalize();

        let engine: Arc<dyn BucketingEngine> =
            Arc::new(WasmBucketing::from_file(&options.engine_module_path, &sdk_key)?);
        let platform_json = serde_json::to_string(&PlatformData::default_platform_data())?;
        engine.set_platform_data(&platform_json)?;

        let on_initialized = options.on_client_initialized.take();
        let config_source = Box::new(ConfigApiClient::new(&sdk_key, &options)?);
        let config_manager = EnvironmentConfigManager::start(
            config_source,
            Arc::clone(&engine),
            &options,
            on_initialized,
        )?;

        let events_api = Box::new(EventApiClient::new(&sdk_key, &options)?);
        let event_queue = EventQueueManager::start(Arc::clone(&engine), events_api, &options)?;

        Ok(Client {
            engine,
            config_manager,
            event_queue,
        })
    }

    /// Whether a configuration has been applied at least once.
    pub fn is_initialized(&self) -> bool {
        self.config_manager.is_initialized()
    }

    /// Validators of the applied configuration.
    pub fn config_metadata(&self) -> Option<ConfigMetadata> {
        self.config_manager.config_metadata()
    }

    /// Evaluate a variable for a user, falling back to `default_value`.
    pub fn variable(
        &self,
        user: &User,
        key: &str,
        default_value: VariableValue,
    ) -> Result<Variable> {
        validate_user(user)?;
        if key.is_empty() {
            return Err(Error::InvalidInput("missing parameter: key".to_owned()));
        }

        if !self.is_initialized() {
            log::debug!(target: "flagpole", "variable called before client has initialized");
            if let Err(err) = self
                .event_queue
                .queue_aggregate_event(EventType::AggVariableDefaulted, key)
            {
                log::warn!(
                    target: "flagpole",
                    "unable to track defaulted event for variable {key}: {err}"
                );
            }
            return Ok(Variable::defaulted(
                key,
                default_value,
                EvalReason::DETAILS_MISSING_CONFIG,
            ));
        }

        match self
            .engine
            .evaluate_variable(user, key, default_value.variable_type())
        {
            Ok(Some(variable)) => Ok(variable),
            Ok(None) => Ok(Variable::defaulted(
                key,
                default_value,
                EvalReason::DETAILS_USER_NOT_TARGETED,
            )),
            Err(err) => {
                log::warn!(target: "flagpole", key; "error evaluating variable: {err}");
                Ok(Variable::defaulted(
                    key,
                    default_value,
                    EvalReason::DETAILS_ERROR,
                ))
            }
        }
    }

    /// Like [`Client::variable`], returning just the value.
    pub fn variable_value(
        &self,
        user: &User,
        key: &str,
        default_value: VariableValue,
    ) -> Result<VariableValue> {
        Ok(self.variable(user, key, default_value)?.value)
    }

    /// All variables the user resolves to. Empty before initialization.
    pub fn all_variables(&self, user: &User) -> Result<HashMap<String, Variable>> {
        validate_user(user)?;
        if !self.is_initialized() {
            log::warn!(target: "flagpole", "all_variables called before client has initialized");
            return Ok(HashMap::new());
        }
        match self.engine.generate_bucketed_config(user) {
            Ok(config) => Ok(config.variables),
            Err(err) => {
                log::warn!(target: "flagpole", "error retrieving all variables: {err}");
                Ok(HashMap::new())
            }
        }
    }

    /// All features the user is bucketed into. Empty before initialization.
    pub fn all_features(&self, user: &User) -> Result<HashMap<String, Feature>> {
        validate_user(user)?;
        if !self.is_initialized() {
            log::warn!(target: "flagpole", "all_features called before client has initialized");
            return Ok(HashMap::new());
        }
        match self.engine.generate_bucketed_config(user) {
            Ok(config) => Ok(config.features),
            Err(err) => {
                log::warn!(target: "flagpole", "error retrieving all features: {err}");
                Ok(HashMap::new())
            }
        }
    }

    /// Track a custom event for a user. Queued in the background; dropped
    /// with a log line if the client is not initialized yet.
    pub fn track(&self, user: &User, event: &Event) -> Result<()> {
        validate_user(user)?;
        if event.event_type.is_empty() {
            return Err(Error::InvalidInput("missing parameter: type".to_owned()));
        }
        if !self.is_initialized() {
            log::debug!(target: "flagpole", "track called before client has initialized");
            return Ok(());
        }
        if let Err(err) = self.event_queue.queue_event(user, event) {
            log::error!(target: "flagpole", "error tracking event: {err}");
        }
        Ok(())
    }

    /// Set client-wide custom data used in all segmentation and bucketing
    /// decisions. Merged with per-user custom data; user data wins.
    pub fn set_client_custom_data(
        &self,
        custom_data: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        if !self.is_initialized() {
            log::debug!(
                target: "flagpole",
                "set_client_custom_data called before client has initialized"
            );
            return Ok(());
        }
        let json = serde_json::to_string(custom_data)?;
        if let Err(err) = self.engine.set_client_custom_data(&json) {
            log::error!(target: "flagpole", "error setting client custom data: {err}");
        }
        Ok(())
    }

    /// Shut down background synchronization and flush remaining events.
    pub fn close(&mut self) {
        self.config_manager.close();
        self.event_queue.close();
    }
}

fn validate_sdk_key(sdk_key: &str) -> Result<()> {
    if sdk_key.is_empty() {
        return Err(Error::InvalidInput(
            "missing SDK key; provide a valid server SDK key".to_owned(),
        ));
    }
    if !sdk_key.starts_with("server") && !sdk_key.starts_with("fp_server") {
        return Err(Error::InvalidInput(
            "invalid SDK key; provide a valid server SDK key".to_owned(),
        ));
    }
    Ok(())
}

fn validate_user(user: &User) -> Result<()> {
    if user.user_id.is_empty() {
        return Err(Error::InvalidInput("user_id cannot be empty".to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{validate_sdk_key, validate_user};
    use crate::User;

    #[test]
    fn sdk_keys_must_be_server_keys() {
        assert!(validate_sdk_key("server-abc123").is_ok());
        assert!(validate_sdk_key("fp_server_abc123").is_ok());
        assert!(validate_sdk_key("").is_err());
        assert!(validate_sdk_key("client-abc123").is_err());
        assert!(validate_sdk_key("mobile-abc123").is_err());
    }

    #[test]
    fn users_need_a_user_id() {
        assert!(validate_user(&User::new("u-1")).is_ok());
        assert!(validate_user(&User::new("")).is_err());
    }
}
