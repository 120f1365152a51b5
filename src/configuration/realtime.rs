//! The realtime configuration stream.
//!
//! A long-lived server-sent-events connection. The reader thread blocks on
//! the socket until a message, fault, or close; faults are reported to the
//! observer, which owns reconnection policy.
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Weak};
use std::time::Duration;

use reqwest::header::ACCEPT;
use serde::Deserialize;

/// How long `close()` waits for the reader thread before detaching it.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Kind name of a message asking the client to refetch configuration.
const MESSAGE_TYPE_REFETCH: &str = "refetchConfig";
/// Kind name of a server keep-alive message.
const MESSAGE_TYPE_PING: &str = "ping";

/// Callbacks from the reader thread.
pub(crate) trait StreamObserver: Send + Sync {
    fn stream_opened(&self);
    fn stream_message(&self, data: String);
    fn stream_keep_alive(&self);
    fn stream_fault(&self, reason: String);
}

/// The outer server-sent-event body; the interesting part is a JSON string
/// nested in `data`.
#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    #[serde(default)]
    data: Option<String>,
}

/// A decoded realtime message. Unknown fields are ignored for forward
/// compatibility.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RealtimeMessage {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Server timestamp of the config change, in epoch milliseconds.
    #[serde(default)]
    pub last_modified: Option<i64>,
}

impl RealtimeMessage {
    /// Messages with an explicit `refetchConfig` kind, and messages with no
    /// kind at all, ask for a refetch.
    pub(crate) fn requests_refetch(&self) -> bool {
        match self.kind.as_deref() {
            None | Some("") | Some(MESSAGE_TYPE_REFETCH) => true,
            _ => false,
        }
    }

    pub(crate) fn is_ping(&self) -> bool {
        self.kind.as_deref() == Some(MESSAGE_TYPE_PING)
    }
}

/// Decode the payload of one stream event.
pub(crate) fn parse_stream_data(data: &str) -> Option<RealtimeMessage> {
    let envelope: StreamEnvelope = match serde_json::from_str(data) {
        Ok(envelope) => envelope,
        Err(err) => {
            log::warn!(target: "flagpole", "malformed realtime envelope: {err}");
            return None;
        }
    };
    let inner = envelope.data?;
    match serde_json::from_str(&inner) {
        Ok(message) => Some(message),
        Err(err) => {
            log::warn!(target: "flagpole", "malformed realtime message: {err}");
            None
        }
    }
}

/// Incremental parser for the text/event-stream line protocol.
#[derive(Debug, Default)]
struct EventStreamParser {
    data_lines: Vec<String>,
}

#[derive(Debug, PartialEq)]
enum StreamActivity {
    Message(String),
    KeepAlive,
}

impl EventStreamParser {
    fn push_line(&mut self, line: &str) -> Option<StreamActivity> {
        if line.is_empty() {
            // Blank line terminates an event.
            if self.data_lines.is_empty() {
                return None;
            }
            return Some(StreamActivity::Message(self.data_lines.drain(..).collect::<Vec<_>>().join("\n")));
        }
        if line.starts_with(':') {
            // Comment; servers send these as keep-alives.
            return Some(StreamActivity::KeepAlive);
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.strip_prefix(' ').unwrap_or(value).to_owned());
        }
        // Other fields (event, id, retry) are not used by the server.
        None
    }
}

/// One live stream connection and its reader thread.
pub(crate) struct RealtimeStream {
    url: String,
    shutdown: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    done: Receiver<()>,
}

impl RealtimeStream {
    /// Open a connection and start its reader thread. Connection failures
    /// are reported asynchronously through the observer as faults.
    pub(crate) fn connect(url: String, observer: Weak<dyn StreamObserver>) -> RealtimeStream {
        let shutdown = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (done_sender, done) = std::sync::mpsc::sync_channel::<()>(1);

        {
            let url = url.clone();
            let shutdown = Arc::clone(&shutdown);
            let finished = Arc::clone(&finished);
            let reader_finished = Arc::clone(&finished);
            let spawned = std::thread::Builder::new()
                .name("flagpole-sse-reader".to_owned())
                .spawn(move || {
                    run_reader(&url, &shutdown, &observer);
                    reader_finished.store(true, Ordering::SeqCst);
                    notify_done(&done_sender);
                });
            if spawned.is_err() {
                finished.store(true, Ordering::SeqCst);
            }
        }

        RealtimeStream {
            url,
            shutdown,
            finished,
            done,
        }
    }

    /// The URL this connection was opened with.
    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    /// Whether the reader thread is still running.
    pub(crate) fn is_alive(&self) -> bool {
        !self.finished.load(Ordering::SeqCst)
    }

    /// Stop the connection, waiting a bounded time for the reader to exit
    /// so that a replacement connection cannot overlap with a live reader.
    pub(crate) fn close(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if self.is_alive() && self.done.recv_timeout(READER_JOIN_TIMEOUT).is_err() {
            log::debug!(target: "flagpole", "realtime reader did not stop in time; detaching");
        }
    }
}

fn notify_done(done_sender: &SyncSender<()>) {
    match done_sender.try_send(()) {
        Ok(()) | Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => {}
    }
}

fn run_reader(url: &str, shutdown: &AtomicBool, observer: &Weak<dyn StreamObserver>) {
    let notify_fault = |reason: String| {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        if let Some(observer) = observer.upgrade() {
            observer.stream_fault(reason);
        }
    };

    // The whole-request timeout must stay off for a long-lived stream.
    let client = match reqwest::blocking::Client::builder()
        .timeout(None)
        .connect_timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            notify_fault(format!("failed to build stream client: {err}"));
            return;
        }
    };

    let response = match client
        .get(url)
        .header(ACCEPT, "text/event-stream")
        .send()
        .and_then(|response| response.error_for_status())
    {
        Ok(response) => response,
        Err(err) => {
            notify_fault(format!("stream connection failed: {err}"));
            return;
        }
    };

    if let Some(observer) = observer.upgrade() {
        observer.stream_opened();
    }

    let mut parser = EventStreamParser::default();
    for line in BufReader::new(response).lines() {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                notify_fault(format!("stream read failed: {err}"));
                return;
            }
        };
        let Some(observer) = observer.upgrade() else {
            return;
        };
        match parser.push_line(&line) {
            Some(StreamActivity::Message(data)) => observer.stream_message(data),
            Some(StreamActivity::KeepAlive) => observer.stream_keep_alive(),
            None => {}
        }
    }

    notify_fault("stream ended".to_owned());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_accumulates_data_until_blank_line() {
        let mut parser = EventStreamParser::default();
        assert_eq!(parser.push_line("event: message"), None);
        assert_eq!(parser.push_line("data: {\"a\":"), None);
        assert_eq!(parser.push_line("data: 1}"), None);
        assert_eq!(
            parser.push_line(""),
            Some(StreamActivity::Message("{\"a\":\n1}".to_owned()))
        );
        // The buffer resets between events.
        assert_eq!(parser.push_line(""), None);
    }

    #[test]
    fn comment_lines_are_keep_alives() {
        let mut parser = EventStreamParser::default();
        assert_eq!(parser.push_line(": keep-alive"), Some(StreamActivity::KeepAlive));
    }

    #[test]
    fn refetch_messages_decode_from_nested_envelope() {
        let data = r#"{"id":"m-1","timestamp":1723000000000,"channel":"c","data":"{\"type\":\"refetchConfig\",\"lastModified\":1723000000000,\"etag\":\"\\\"e1\\\"\"}"}"#;
        let message = parse_stream_data(data).unwrap();
        assert!(message.requests_refetch());
        assert_eq!(message.last_modified, Some(1_723_000_000_000));
    }

    #[test]
    fn empty_and_missing_types_request_refetch() {
        for inner in [r#"{}"#, r#"{"type":""}"#] {
            let data = serde_json::json!({ "data": inner }).to_string();
            assert!(parse_stream_data(&data).unwrap().requests_refetch());
        }
    }

    #[test]
    fn ping_messages_do_not_refetch() {
        let data = serde_json::json!({ "data": r#"{"type":"ping"}"# }).to_string();
        let message = parse_stream_data(&data).unwrap();
        assert!(message.is_ping());
        assert!(!message.requests_refetch());
    }

    #[test]
    fn unknown_message_kinds_are_ignored() {
        let data = serde_json::json!({ "data": r#"{"type":"announcement"}"# }).to_string();
        let message = parse_stream_data(&data).unwrap();
        assert!(!message.requests_refetch());
        assert!(!message.is_ping());
    }

    #[test]
    fn malformed_envelopes_are_dropped() {
        assert!(parse_stream_data("not json").is_none());
        assert!(parse_stream_data(r#"{"data":"not json"}"#).is_none());
        assert!(parse_stream_data(r#"{"other":1}"#).is_none());
    }
}
