//! SDK options.
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

/// Ceiling enforced on both event-queue sizes.
const EVENT_QUEUE_SIZE_CEILING: usize = 20_000;

/// Callback invoked exactly once when the first configuration has been
/// applied.
pub type InitializedCallback = Box<dyn FnOnce() + Send>;

/// Options for [`Client`](crate::Client).
///
/// All fields have defaults; override the ones you need:
///
/// ```
/// # use std::time::Duration;
/// let options = flagpole::Options::new()
///     .with_config_polling_interval(Duration::from_secs(30))
///     .with_disable_realtime_updates(true);
/// ```
pub struct Options {
    /// Base URL of the configuration CDN.
    pub config_cdn_uri: String,
    /// Base URL of the events API.
    pub events_api_uri: String,
    /// Interval between configuration polls while the realtime stream is
    /// not connected.
    pub config_polling_interval: Duration,
    /// Interval between configuration polls while the realtime stream is
    /// connected. Polling is only a safety net in that state.
    pub sse_backup_polling_interval: Duration,
    /// Per-request timeout for configuration fetches.
    pub config_request_timeout: Duration,
    /// Base delay for the configuration client's bounded wire retry.
    pub config_retry_delay: Duration,
    /// Invoked once, when the first configuration has been applied.
    pub on_client_initialized: Option<InitializedCallback>,
    /// Interval between event-queue flushes.
    pub event_flush_interval: Duration,
    /// Hard ceiling on the engine event queue. New events are dropped once
    /// occupancy reaches it.
    pub max_event_queue_size: usize,
    /// Occupancy at which an enqueue triggers an early flush to make room.
    pub flush_event_queue_size: usize,
    /// Maximum events per published batch chunk (partitioning happens
    /// inside the engine).
    pub event_request_chunk_size: usize,
    /// Per-request timeout for event publishes.
    pub event_request_timeout: Duration,
    /// Disables engine-generated aggregate evaluation events.
    pub disable_automatic_event_logging: bool,
    /// Disables caller-tracked custom events.
    pub disable_custom_event_logging: bool,
    /// Disables the realtime configuration stream, leaving polling only.
    pub disable_realtime_updates: bool,
    /// Minimum (initial) delay between realtime-stream reconnect attempts.
    pub sse_min_reconnect_delay: Duration,
    /// Cap on the realtime-stream reconnect delay.
    pub sse_max_reconnect_delay: Duration,
    /// Path to the prebuilt bucketing engine module.
    pub engine_module_path: PathBuf,
}

impl Options {
    /// Default value for [`Options::config_cdn_uri`].
    pub const DEFAULT_CONFIG_CDN_URI: &'static str = "https://config-cdn.flagpole.io/";
    /// Default value for [`Options::events_api_uri`].
    pub const DEFAULT_EVENTS_API_URI: &'static str = "https://events.flagpole.io/";
    /// Default value for [`Options::config_polling_interval`].
    pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(10);
    /// Default value for [`Options::sse_backup_polling_interval`].
    pub const DEFAULT_SSE_BACKUP_POLLING_INTERVAL: Duration = Duration::from_secs(15 * 60);
    /// Default value for [`Options::event_flush_interval`].
    pub const DEFAULT_EVENT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
    /// Default value for [`Options::engine_module_path`].
    pub const DEFAULT_ENGINE_MODULE_PATH: &'static str = "bucketing-lib.release.wasm";

    /// Create options with all defaults.
    pub fn new() -> Options {
        Options::default()
    }

    /// Update the configuration poll interval.
    pub fn with_config_polling_interval(mut self, interval: Duration) -> Options {
        self.config_polling_interval = interval;
        self
    }

    /// Update the event flush interval.
    pub fn with_event_flush_interval(mut self, interval: Duration) -> Options {
        self.event_flush_interval = interval;
        self
    }

    /// Enable or disable the realtime configuration stream.
    pub fn with_disable_realtime_updates(mut self, disable: bool) -> Options {
        self.disable_realtime_updates = disable;
        self
    }

    /// Set the one-shot initialization callback.
    pub fn with_on_client_initialized(mut self, callback: impl FnOnce() + Send + 'static) -> Options {
        self.on_client_initialized = Some(Box::new(callback));
        self
    }

    /// Set the path of the prebuilt engine module.
    pub fn with_engine_module_path(mut self, path: impl Into<PathBuf>) -> Options {
        self.engine_module_path = path.into();
        self
    }

    /// Clamp mutually-constrained values into a consistent state, logging a
    /// warning for every adjustment.
    pub(crate) fn normalize(&mut self) {
        if self.flush_event_queue_size >= self.max_event_queue_size {
            log::warn!(
                target: "flagpole",
                "flush_event_queue_size {} must be smaller than max_event_queue_size {}",
                self.flush_event_queue_size,
                self.max_event_queue_size
            );
            self.flush_event_queue_size = self.max_event_queue_size.saturating_sub(1);
        }

        if self.event_request_chunk_size > self.flush_event_queue_size
            || self.event_request_chunk_size > self.max_event_queue_size
        {
            log::warn!(
                target: "flagpole",
                "event_request_chunk_size {} must be smaller than the queue sizes",
                self.event_request_chunk_size
            );
            self.event_request_chunk_size = 100;
        }

        if self.flush_event_queue_size > EVENT_QUEUE_SIZE_CEILING {
            log::warn!(
                target: "flagpole",
                "flush_event_queue_size {} must be smaller than {}",
                self.flush_event_queue_size,
                EVENT_QUEUE_SIZE_CEILING
            );
            self.flush_event_queue_size = EVENT_QUEUE_SIZE_CEILING;
        }

        if self.max_event_queue_size > EVENT_QUEUE_SIZE_CEILING {
            log::warn!(
                target: "flagpole",
                "max_event_queue_size {} must be smaller than {}",
                self.max_event_queue_size,
                EVENT_QUEUE_SIZE_CEILING
            );
            self.max_event_queue_size = EVENT_QUEUE_SIZE_CEILING;
        }
    }

    /// The subset of options the engine's event queue is initialized with,
    /// in the engine's wire format.
    pub(crate) fn event_queue_options_json(&self) -> String {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct EventQueueOptions<'a> {
            #[serde(rename = "flushEventsMS")]
            flush_events_ms: u128,
            disable_automatic_event_logging: bool,
            disable_custom_event_logging: bool,
            max_events_per_flush: usize,
            min_events_per_flush: usize,
            event_request_chunk_size: usize,
            #[serde(rename = "eventsAPIBasePath")]
            events_api_base_path: &'a str,
        }

        let options = EventQueueOptions {
            flush_events_ms: self.event_flush_interval.as_millis(),
            disable_automatic_event_logging: self.disable_automatic_event_logging,
            disable_custom_event_logging: self.disable_custom_event_logging,
            max_events_per_flush: self.max_event_queue_size,
            min_events_per_flush: self.flush_event_queue_size,
            event_request_chunk_size: self.event_request_chunk_size,
            events_api_base_path: &self.events_api_uri,
        };

        // Serialization of a struct of plain fields cannot fail.
        serde_json::to_string(&options).unwrap_or_else(|_| "{}".to_owned())
    }
}

impl Default for Options {
    fn default() -> Options {
        Options {
            config_cdn_uri: Options::DEFAULT_CONFIG_CDN_URI.to_owned(),
            events_api_uri: Options::DEFAULT_EVENTS_API_URI.to_owned(),
            config_polling_interval: Options::DEFAULT_POLLING_INTERVAL,
            sse_backup_polling_interval: Options::DEFAULT_SSE_BACKUP_POLLING_INTERVAL,
            config_request_timeout: Duration::from_secs(5),
            config_retry_delay: Duration::from_millis(200),
            on_client_initialized: None,
            event_flush_interval: Options::DEFAULT_EVENT_FLUSH_INTERVAL,
            max_event_queue_size: 2000,
            flush_event_queue_size: 1000,
            event_request_chunk_size: 100,
            event_request_timeout: Duration::from_secs(10),
            disable_automatic_event_logging: false,
            disable_custom_event_logging: false,
            disable_realtime_updates: false,
            sse_min_reconnect_delay: Duration::from_secs(5),
            sse_max_reconnect_delay: Duration::from_secs(300),
            engine_module_path: PathBuf::from(Options::DEFAULT_ENGINE_MODULE_PATH),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Options;

    #[test]
    fn flush_size_clamped_below_max_size() {
        let mut options = Options {
            max_event_queue_size: 500,
            flush_event_queue_size: 500,
            ..Options::default()
        };
        options.normalize();
        assert_eq!(options.flush_event_queue_size, 499);
    }

    #[test]
    fn queue_sizes_clamped_to_ceiling() {
        let mut options = Options {
            max_event_queue_size: 50_000,
            flush_event_queue_size: 30_000,
            ..Options::default()
        };
        options.normalize();
        assert_eq!(options.max_event_queue_size, 20_000);
        assert_eq!(options.flush_event_queue_size, 20_000);
    }

    #[test]
    fn oversized_chunk_size_reset() {
        let mut options = Options {
            event_request_chunk_size: 5_000,
            ..Options::default()
        };
        options.normalize();
        assert_eq!(options.event_request_chunk_size, 100);
    }

    #[test]
    fn event_queue_options_use_engine_field_names() {
        let options = Options::default();
        let json: serde_json::Value =
            serde_json::from_str(&options.event_queue_options_json()).unwrap();
        assert_eq!(json["flushEventsMS"], 10_000);
        assert_eq!(json["maxEventsPerFlush"], 2000);
        assert_eq!(json["minEventsPerFlush"], 1000);
        assert_eq!(json["eventsAPIBasePath"], Options::DEFAULT_EVENTS_API_URI);
    }
}
