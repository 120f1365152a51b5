use std::sync::Arc;

/// Result type used throughout the SDK.
///
/// This is a standard Rust `Result` whose error variant is the crate-wide
/// [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the Flagpole SDK.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The request was unauthorized, possibly due to an invalid SDK key.
    #[error("unauthorized, sdk_key is likely invalid")]
    Unauthorized,

    /// The requested resource does not exist (HTTP 404). Usually a
    /// misconfigured base URL or an SDK key unknown to the server.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The server rejected the request (4xx other than 401/403/404).
    #[error("bad request: HTTP {status}")]
    BadRequest {
        /// HTTP status code returned by the server.
        status: u16,
    },

    /// The server failed to process the request (5xx). Retryable.
    #[error("server error: HTTP {status}")]
    ServerError {
        /// HTTP status code returned by the server.
        status: u16,
    },

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Invalid base URL configuration.
    #[error("invalid base url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The evaluation engine raised an internal fault. Fatal to the call
    /// that triggered it, never retryable.
    #[error("engine aborted at {file_name}:{line}:{column}: {message}")]
    EngineAbort {
        /// Message reported by the engine.
        message: String,
        /// Engine-side source file that raised the fault.
        file_name: String,
        /// Line within `file_name`.
        line: u32,
        /// Column within `file_name`.
        column: u32,
    },

    /// Failure instantiating or calling into the evaluation engine that is
    /// not an engine-reported abort (linking, memory layout, traps).
    #[error("engine failure: {0}")]
    Engine(String),

    /// Data did not have the expected structure (config body, engine
    /// payloads, event records).
    #[error(transparent)]
    Serialization(Arc<serde_json::Error>),

    /// Caller-supplied input failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A background thread could not be spawned or panicked.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl Error {
    /// Whether the failure is transient and the operation may succeed when
    /// tried again (5xx and network failures). Terminal transport errors
    /// (401/403, 404, other 4xx) and engine faults are not retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ServerError { .. } | Error::Network(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serialization(Arc::new(value))
    }
}

impl From<url::ParseError> for Error {
    fn from(value: url::ParseError) -> Self {
        Error::InvalidBaseUrl(value)
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn server_errors_and_network_failures_are_retryable() {
        assert!(Error::ServerError { status: 500 }.is_retryable());
        assert!(Error::ServerError { status: 503 }.is_retryable());
    }

    #[test]
    fn terminal_errors_are_not_retryable() {
        assert!(!Error::Unauthorized.is_retryable());
        assert!(!Error::NotFound("url".to_owned()).is_retryable());
        assert!(!Error::BadRequest { status: 400 }.is_retryable());
        assert!(!Error::EngineAbort {
            message: "oom".to_owned(),
            file_name: "engine.ts".to_owned(),
            line: 1,
            column: 1,
        }
        .is_retryable());
    }
}
