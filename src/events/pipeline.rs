//! The event ingestion and flush pipeline.
//!
//! Events are buffered inside the engine; this pipeline drains them on a
//! timer (and on close), publishes each payload, and reports the outcome
//! back so the engine can discard or requeue. Enqueues are admission
//! controlled against the engine-reported queue occupancy so the queue
//! never grows unbounded.
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::{thread_rng, Rng};

use super::client::EventsApi;
use super::{Event, EventType, FlushPayload};
use crate::engine::BucketingEngine;
use crate::options::Options;
use crate::{Error, Result, User};

/// How long close() waits for an in-flight flush before the final one.
const CLOSE_FLUSH_WAIT: Duration = Duration::from_secs(1);

/// How long close() waits for the flush loop before detaching it; a
/// mid-flight publish must not stall shutdown.
const CLOSE_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

const STATE_RUNNING: u8 = 0;
const STATE_STOPPING: u8 = 1;
const STATE_STOPPED: u8 = 2;

struct PipelineInner {
    engine: Arc<dyn BucketingEngine>,
    events_api: Box<dyn EventsApi>,
    flush_threshold: usize,
    max_queue_size: usize,
    disable_automatic_events: bool,
    disable_custom_events: bool,
    /// RUNNING → STOPPING → STOPPED. STOPPED is terminal: entered on close
    /// or when a publish failure shows further attempts are futile.
    state: AtomicU8,
    /// Held for the duration of one flush; `try_lock` makes concurrent
    /// flush attempts return immediately.
    flush_lock: Mutex<()>,
}

/// Buffers usage events in the engine and reliably drains them.
pub struct EventQueueManager {
    inner: Arc<PipelineInner>,
    stop_sender: Option<SyncSender<()>>,
    // Receiver is !Sync; the mutex keeps the manager shareable.
    flush_done: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
}

impl EventQueueManager {
    /// Initialize the engine event queue and start the flush loop.
    ///
    /// The loop is not started when both automatic and custom event logging
    /// are disabled; `close()` is still accepted in that state.
    pub fn start(
        engine: Arc<dyn BucketingEngine>,
        events_api: Box<dyn EventsApi>,
        options: &Options,
    ) -> Result<EventQueueManager> {
        let client_instance_id = format!("{:032x}", thread_rng().gen::<u128>());
        engine.init_event_queue(&client_instance_id, &options.event_queue_options_json())?;

        let inner = Arc::new(PipelineInner {
            engine,
            events_api,
            flush_threshold: options.flush_event_queue_size,
            max_queue_size: options.max_event_queue_size,
            disable_automatic_events: options.disable_automatic_event_logging,
            disable_custom_events: options.disable_custom_event_logging,
            state: AtomicU8::new(STATE_RUNNING),
            flush_lock: Mutex::new(()),
        });

        if options.disable_automatic_event_logging && options.disable_custom_event_logging {
            return Ok(EventQueueManager {
                inner,
                stop_sender: None,
                flush_done: Mutex::new(None),
            });
        }

        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);
        let (done_sender, flush_done) = std::sync::mpsc::sync_channel::<()>(1);
        {
            let inner = Arc::clone(&inner);
            let interval = options.event_flush_interval;
            std::thread::Builder::new()
                .name("flagpole-event-flusher".to_owned())
                .spawn(move || {
                    loop {
                        match stop_receiver.recv_timeout(interval) {
                            Err(RecvTimeoutError::Timeout) => {
                                if inner.state.load(Ordering::SeqCst) != STATE_RUNNING {
                                    break;
                                }
                                inner.flush_events();
                            }
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                                log::debug!(target: "flagpole", "event flusher stopping");
                                break;
                            }
                        }
                    }
                    let _ = done_sender.try_send(());
                })?;
        }

        Ok(EventQueueManager {
            inner,
            stop_sender: Some(stop_sender),
            flush_done: Mutex::new(Some(flush_done)),
        })
    }

    /// Enqueue a caller-tracked event for a user.
    ///
    /// Backpressure is handled locally: when the engine queue is full the
    /// event is dropped with a warning, never surfaced to the caller.
    pub fn queue_event(&self, user: &User, event: &Event) -> Result<()> {
        if self.inner.disable_custom_events {
            log::debug!(target: "flagpole", "custom event logging is disabled; dropping event");
            return Ok(());
        }
        if !self.inner.admit_event()? {
            return Ok(());
        }
        let user_json = serde_json::to_string(user)?;
        let event_json = serde_json::to_string(event)?;
        self.inner.engine.queue_event(&user_json, &event_json)
    }

    /// Enqueue an aggregate event; the engine coalesces these.
    pub fn queue_aggregate_event(&self, event_type: EventType, target: &str) -> Result<()> {
        if self.inner.disable_automatic_events {
            return Ok(());
        }
        if !self.inner.admit_event()? {
            return Ok(());
        }
        let event_json = serde_json::to_string(&Event::aggregate(event_type, target))?;
        self.inner.engine.queue_aggregate_event(&event_json, "{}")
    }

    /// Drain and publish now. Returns the number of events flushed.
    pub fn flush_events(&self) -> usize {
        self.inner.flush_events()
    }

    /// Stop the flush loop, wait briefly for any in-flight flush, then
    /// perform one final flush. Errors are logged, never raised; close
    /// always completes.
    pub fn close(&mut self) {
        self.inner
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_STOPPING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok();
        if let Some(stop_sender) = self.stop_sender.take() {
            let _ = stop_sender.try_send(());
        }
        if let Some(done) = self.flush_done.lock().expect("flush done lock").take() {
            if done.recv_timeout(CLOSE_JOIN_TIMEOUT).is_err() {
                log::debug!(target: "flagpole", "event flusher still busy; detaching");
            }
        }

        // An admission-triggered flush may still be running on an
        // application thread; give it a bounded window to finish.
        let deadline = Instant::now() + CLOSE_FLUSH_WAIT;
        while self.inner.flush_in_progress() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }

        let flushed = self.inner.flush_events();
        if flushed > 0 {
            log::debug!(target: "flagpole", "flushed {flushed} events during close");
        }
        self.inner.state.store(STATE_STOPPED, Ordering::SeqCst);
    }
}

impl PipelineInner {
    /// Admission control: at the flush threshold, trigger a best-effort
    /// flush to make room; at the hard ceiling, reject the event.
    fn admit_event(&self) -> Result<bool> {
        let size = self.engine.event_queue_size()?;
        if size >= self.flush_threshold {
            self.flush_events();
            let size = self.engine.event_queue_size()?;
            if size >= self.max_queue_size {
                log::warn!(
                    target: "flagpole",
                    "event queue is full ({size} events); dropping new event"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn flush_in_progress(&self) -> bool {
        match self.flush_lock.try_lock() {
            Ok(_guard) => false,
            Err(std::sync::TryLockError::WouldBlock) => true,
            Err(std::sync::TryLockError::Poisoned(_)) => false,
        }
    }

    /// One flush pass. At most one runs at a time; a concurrent attempt
    /// returns immediately, doing nothing.
    fn flush_events(&self) -> usize {
        let Ok(_guard) = self.flush_lock.try_lock() else {
            log::debug!(target: "flagpole", "flush already in progress");
            return 0;
        };
        if self.state.load(Ordering::SeqCst) == STATE_STOPPED {
            return 0;
        }

        let payloads = match self.engine.flush_event_queue() {
            Ok(payloads) => payloads,
            Err(err) => {
                log::warn!(target: "flagpole", "failed to drain engine event queue: {err}");
                return 0;
            }
        };
        if payloads.is_empty() {
            return 0;
        }

        let mut flushed = 0;
        let mut halted = false;
        for payload in &payloads {
            if halted {
                // The engine requeues payloads we can no longer publish, so
                // every minted payload is acknowledged exactly once.
                self.report_outcome(payload, false, true);
                continue;
            }
            match self.events_api.publish_events(&payload.records) {
                Ok(()) => {
                    self.report_outcome(payload, true, false);
                    flushed += payload.event_count as usize;
                }
                Err(err @ (Error::Unauthorized | Error::NotFound(_))) => {
                    log::error!(
                        target: "flagpole",
                        "event publish failed terminally ({err}); halting event pipeline"
                    );
                    self.report_outcome(payload, false, false);
                    self.state.store(STATE_STOPPED, Ordering::SeqCst);
                    halted = true;
                }
                Err(err) if err.is_retryable() => {
                    log::warn!(target: "flagpole", "event publish failed, will retry: {err}");
                    self.report_outcome(payload, false, true);
                }
                Err(err) => {
                    log::warn!(target: "flagpole", "event publish rejected: {err}");
                    self.report_outcome(payload, false, false);
                }
            }
        }
        flushed
    }

    fn report_outcome(&self, payload: &FlushPayload, success: bool, retryable: bool) {
        if let Err(err) =
            self.engine
                .report_payload_outcome(&payload.payload_id, success, retryable)
        {
            log::error!(
                target: "flagpole",
                payload_id = payload.payload_id;
                "failed to report payload outcome: {err}"
            );
        }
    }
}
