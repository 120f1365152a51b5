//! The background manager that keeps the engine's configuration fresh.
//!
//! A poll loop fetches the configuration on an interval with ETag /
//! Last-Modified conditioning; an optional realtime stream delivers
//! out-of-band refetch triggers between polls. Reconnection of the stream
//! follows capped exponential backoff with its own bookkeeping lock,
//! distinct from the engine mutex.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::client::{ConfigSource, FetchOutcome};
use super::realtime::{parse_stream_data, RealtimeStream, StreamObserver};
use super::{ConfigMetadata, SseSection};
use crate::engine::BucketingEngine;
use crate::options::{InitializedCallback, Options};
use crate::{Error, Result};

/// Format of `If-Modified-Since` and `Last-Modified` headers.
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// How long `close()` waits for the poll thread before detaching it; a
/// mid-flight fetch must not stall shutdown.
const CLOSE_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// What the manager knows about the currently applied configuration.
#[derive(Default)]
struct ConfigState {
    initialized: bool,
    etag: Option<String>,
    last_modified: Option<String>,
    /// Parsed form of `last_modified`, used to order responses.
    last_modified_at: Option<DateTime<Utc>>,
    sse: SseSection,
}

/// Reconnect bookkeeping for the realtime stream. Guarded by its own lock
/// so reconnection can proceed while unrelated engine calls are in flight.
#[derive(Debug, Default)]
struct ReconnectState {
    attempts: u32,
    last_attempt: Option<Instant>,
    in_flight: bool,
}

impl ReconnectState {
    /// Backoff delay for a given attempt: `min * 2^attempt`, capped.
    fn delay_for_attempt(attempt: u32, min: Duration, max: Duration) -> Duration {
        let exponential = min.as_secs_f64() * 2f64.powi(attempt.min(31) as i32);
        Duration::from_secs_f64(exponential.min(max.as_secs_f64()))
    }

    /// Decide whether a fault should schedule a reconnect, and after how
    /// long. Returns `None` while a reconnect is already pending. A fault
    /// arriving before the previous delay elapsed reuses the remaining
    /// wait instead of restarting it.
    fn schedule(&mut self, now: Instant, min: Duration, max: Duration) -> Option<Duration> {
        if self.in_flight {
            return None;
        }
        let full = ReconnectState::delay_for_attempt(self.attempts, min, max);
        let delay = match self.last_attempt {
            Some(at) => full.saturating_sub(now.duration_since(at)),
            None => full,
        };
        self.attempts += 1;
        self.last_attempt = Some(now);
        self.in_flight = true;
        Some(delay)
    }

    fn finish_attempt(&mut self) {
        self.in_flight = false;
    }

    /// A live connection clears the backoff history.
    fn reset(&mut self) {
        self.attempts = 0;
        self.last_attempt = None;
    }
}

struct ManagerInner {
    /// Self-reference handed to reader threads and reconnect tasks.
    weak_self: Weak<ManagerInner>,
    source: Box<dyn ConfigSource>,
    engine: Arc<dyn BucketingEngine>,
    state: Mutex<ConfigState>,
    on_initialized: Mutex<Option<InitializedCallback>>,
    realtime_enabled: bool,
    stream: Mutex<Option<RealtimeStream>>,
    stream_connected: AtomicBool,
    reconnect: Mutex<ReconnectState>,
    min_reconnect_delay: Duration,
    max_reconnect_delay: Duration,
    polling_enabled: AtomicBool,
    shutdown: AtomicBool,
}

/// Keeps the engine's configuration synchronized with the server.
///
/// `UNINITIALIZED` until the first configuration applies, at which point the
/// one-shot initialized callback fires; `close()` stops the poll loop and
/// the realtime stream.
pub struct EnvironmentConfigManager {
    inner: Arc<ManagerInner>,
    stop_sender: SyncSender<()>,
    // Receiver is !Sync; the mutex keeps the manager shareable.
    poll_done: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
}

impl EnvironmentConfigManager {
    /// Start the manager and its background poll thread.
    pub fn start(
        source: Box<dyn ConfigSource>,
        engine: Arc<dyn BucketingEngine>,
        options: &Options,
        on_initialized: Option<InitializedCallback>,
    ) -> Result<EnvironmentConfigManager> {
        let inner = ManagerInner::new(source, engine, options, on_initialized);

        // Buffer of 1 is enough: a full buffer means a stop command is
        // already pending.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);
        let (done_sender, poll_done) = std::sync::mpsc::sync_channel::<()>(1);

        {
            let inner = Arc::clone(&inner);
            let poll_interval = options.config_polling_interval;
            let backup_interval = options.sse_backup_polling_interval;
            std::thread::Builder::new()
                .name("flagpole-config-poller".to_owned())
                .spawn(move || {
                    loop {
                        if !inner.polling_enabled.load(Ordering::SeqCst) {
                            break;
                        }
                        inner.fetch_and_apply(None);

                        // Under a connected stream, polling is only a backstop.
                        let timeout = if inner.stream_connected.load(Ordering::SeqCst) {
                            backup_interval
                        } else {
                            poll_interval
                        };
                        match stop_receiver.recv_timeout(timeout) {
                            Err(RecvTimeoutError::Timeout) => {}
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                                log::debug!(target: "flagpole", "config poller stopping");
                                break;
                            }
                        }
                    }
                    let _ = done_sender.try_send(());
                })?;
        }

        Ok(EnvironmentConfigManager {
            inner,
            stop_sender,
            poll_done: Mutex::new(Some(poll_done)),
        })
    }

    /// Whether a configuration has been applied at least once.
    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().expect("config state lock").initialized
    }

    /// Validators of the applied configuration.
    pub fn config_metadata(&self) -> Option<ConfigMetadata> {
        let state = self.inner.state.lock().expect("config state lock");
        state.initialized.then(|| ConfigMetadata {
            etag: state.etag.clone(),
            last_modified: state.last_modified.clone(),
        })
    }

    /// Stop polling and close the realtime stream. In-flight fetches are
    /// not drained.
    pub fn close(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.polling_enabled.store(false, Ordering::SeqCst);
        let _ = self.stop_sender.try_send(());
        if let Some(done) = self.poll_done.lock().expect("poll done lock").take() {
            if done.recv_timeout(CLOSE_JOIN_TIMEOUT).is_err() {
                log::debug!(target: "flagpole", "config poller still busy; detaching");
            }
        }
        if let Some(stream) = self.inner.stream.lock().expect("stream lock").take() {
            stream.close();
        }
    }
}

impl ManagerInner {
    fn new(
        source: Box<dyn ConfigSource>,
        engine: Arc<dyn BucketingEngine>,
        options: &Options,
        on_initialized: Option<InitializedCallback>,
    ) -> Arc<ManagerInner> {
        Arc::new_cyclic(|weak_self| ManagerInner {
            weak_self: weak_self.clone(),
            source,
            engine,
            state: Mutex::new(ConfigState::default()),
            on_initialized: Mutex::new(on_initialized),
            realtime_enabled: !options.disable_realtime_updates,
            stream: Mutex::new(None),
            stream_connected: AtomicBool::new(false),
            reconnect: Mutex::new(ReconnectState::default()),
            min_reconnect_delay: options.sse_min_reconnect_delay,
            max_reconnect_delay: options.sse_max_reconnect_delay,
            polling_enabled: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
        })
    }

    /// One fetch cycle: fetch conditioned on the cached validators (or a
    /// pushed timestamp), then apply the result.
    fn fetch_and_apply(&self, last_modified_override: Option<DateTime<Utc>>) {
        let (etag, last_modified) = {
            let state = self.state.lock().expect("config state lock");
            let last_modified = last_modified_override
                .map(|at| at.format(HTTP_DATE_FORMAT).to_string())
                .or_else(|| state.last_modified.clone());
            (state.etag.clone(), last_modified)
        };

        match self
            .source
            .fetch_config(etag.as_deref(), last_modified.as_deref())
        {
            Ok(FetchOutcome::NotModified) => {
                log::debug!(target: "flagpole", "config not modified");
            }
            Ok(FetchOutcome::Modified {
                body,
                etag,
                last_modified,
            }) => self.apply_config(&body, etag, last_modified),
            Err(Error::Unauthorized) => {
                log::error!(
                    target: "flagpole",
                    "invalid SDK key; halting configuration polling"
                );
                self.polling_enabled.store(false, Ordering::SeqCst);
            }
            Err(err) => {
                // Retried on the next scheduled tick.
                log::warn!(target: "flagpole", "config fetch failed: {err}");
            }
        }
    }

    /// Apply a freshly fetched configuration body, unless it is a duplicate
    /// or an out-of-order artifact.
    fn apply_config(&self, body: &str, etag: Option<String>, last_modified: Option<String>) {
        let config: serde_json::Value = match serde_json::from_str(body) {
            Ok(config) => config,
            Err(err) => {
                log::warn!(target: "flagpole", "malformed config body: {err}");
                return;
            }
        };

        let first_config = {
            let mut state = self.state.lock().expect("config state lock");

            if state.initialized && etag.is_some() && etag == state.etag {
                log::debug!(target: "flagpole", "config unchanged (etag match)");
                return;
            }

            let last_modified_at = last_modified
                .as_deref()
                .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
                .map(|at| at.with_timezone(&Utc));
            if let (Some(cached), Some(received)) = (state.last_modified_at, last_modified_at) {
                if received < cached {
                    log::warn!(
                        target: "flagpole",
                        "received out-of-order config (Last-Modified {received} older than {cached}); discarding"
                    );
                    return;
                }
            }

            if let Err(err) = self.engine.store_config(body) {
                // Validators stay unchanged so the next tick refetches.
                log::warn!(target: "flagpole", "failed to store config in engine: {err}");
                return;
            }

            let first_config = !state.initialized;
            state.initialized = true;
            state.etag = etag;
            state.last_modified = last_modified;
            state.last_modified_at = last_modified_at;
            state.sse = config
                .get("sse")
                .cloned()
                .and_then(|section| serde_json::from_value(section).ok())
                .unwrap_or_default();
            first_config
        };

        if self.realtime_enabled {
            self.ensure_stream();
        }

        if first_config {
            self.fire_initialized_callback();
        }
    }

    /// The one-shot initialized callback; panics are contained and logged.
    fn fire_initialized_callback(&self) {
        let callback = self.on_initialized.lock().expect("callback lock").take();
        if let Some(callback) = callback {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback));
            if result.is_err() {
                log::warn!(target: "flagpole", "initialized callback panicked");
            }
        }
    }

    /// Make sure a live stream connection exists for the most recently
    /// applied configuration, reconnecting when the config moved the stream
    /// to a different URL.
    fn ensure_stream(&self) {
        let desired_url = {
            let state = self.state.lock().expect("config state lock");
            state.sse.url()
        };
        let stream = self.stream.lock().expect("stream lock");
        let current = stream
            .as_ref()
            .filter(|stream| stream.is_alive())
            .map(|stream| stream.url().to_owned());
        drop(stream);
        if current != desired_url {
            log::info!(target: "flagpole", "realtime stream not active; connecting");
            self.recreate_stream();
        }
    }

    /// Replace the stream connection. The old connection is closed and its
    /// reader joined (bounded) before a new one opens, so two live readers
    /// cannot coexist.
    fn recreate_stream(&self) {
        if self.shutdown.load(Ordering::SeqCst) || !self.realtime_enabled {
            return;
        }
        let url = {
            let state = self.state.lock().expect("config state lock");
            // A concurrently cleared configuration cancels reconnection.
            if !state.initialized {
                return;
            }
            state.sse.url()
        };
        let mut stream = self.stream.lock().expect("stream lock");
        if let Some(old) = stream.take() {
            old.close();
        }
        let Some(url) = url else {
            log::debug!(target: "flagpole", "config carries no realtime coordinates");
            return;
        };
        let observer: Weak<dyn StreamObserver> = self.weak_self.clone();
        *stream = Some(RealtimeStream::connect(url, observer));
    }

    /// A fault on the stream: schedule at most one pending reconnect, with
    /// capped exponential backoff.
    fn handle_stream_fault(&self) {
        let delay = {
            let mut reconnect = self.reconnect.lock().expect("reconnect lock");
            reconnect.schedule(
                Instant::now(),
                self.min_reconnect_delay,
                self.max_reconnect_delay,
            )
        };
        let Some(delay) = delay else {
            log::debug!(target: "flagpole", "reconnect already pending");
            return;
        };
        let Some(inner) = self.weak_self.upgrade() else {
            return;
        };

        log::info!(
            target: "flagpole",
            "realtime stream reconnect in {}s",
            delay.as_secs_f64()
        );
        let spawned = std::thread::Builder::new()
            .name("flagpole-sse-reconnect".to_owned())
            .spawn(move || {
                std::thread::sleep(delay);
                if !inner.shutdown.load(Ordering::SeqCst) {
                    inner.recreate_stream();
                }
                inner
                    .reconnect
                    .lock()
                    .expect("reconnect lock")
                    .finish_attempt();
            });
        if let Err(err) = spawned {
            log::error!(target: "flagpole", "failed to spawn reconnect task: {err}");
            self.reconnect
                .lock()
                .expect("reconnect lock")
                .finish_attempt();
        }
    }

    /// Any traffic on the stream reasserts connected state and clears the
    /// backoff history.
    fn mark_stream_connected(&self) {
        if !self.stream_connected.swap(true, Ordering::SeqCst) {
            log::info!(target: "flagpole", "realtime stream connected");
        }
        self.reconnect.lock().expect("reconnect lock").reset();
    }
}

impl StreamObserver for ManagerInner {
    fn stream_opened(&self) {
        self.mark_stream_connected();
    }

    fn stream_message(&self, data: String) {
        self.mark_stream_connected();

        let Some(message) = parse_stream_data(&data) else {
            return;
        };
        if message.requests_refetch() {
            log::info!(target: "flagpole", "realtime refetch requested");
            let last_modified = message
                .last_modified
                .and_then(DateTime::<Utc>::from_timestamp_millis);
            self.fetch_and_apply(last_modified);
        }
    }

    fn stream_keep_alive(&self) {
        self.mark_stream_connected();
    }

    fn stream_fault(&self, reason: String) {
        self.stream_connected.store(false, Ordering::SeqCst);
        log::debug!(target: "flagpole", "realtime stream fault: {reason}");
        self.handle_stream_fault();
    }
}
