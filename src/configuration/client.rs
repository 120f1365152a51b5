//! The HTTP client that fetches configuration from the CDN.
use std::time::Duration;

use rand::thread_rng;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use url::Url;

use crate::backoff::exponential_backoff;
use crate::options::Options;
use crate::{Error, Result};

/// Wire retries for retryable fetch failures, per call.
const MAX_FETCH_RETRIES: u32 = 2;

/// Result of a conditional configuration fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The server returned a new configuration body.
    Modified {
        body: String,
        etag: Option<String>,
        last_modified: Option<String>,
    },
    /// The configuration has not changed since the supplied validators.
    NotModified,
}

/// Source of configuration documents.
///
/// The production implementation is [`ConfigApiClient`]; tests substitute
/// scripted fakes.
pub trait ConfigSource: Send + Sync {
    /// Fetch the configuration, conditioned on the given cache validators.
    fn fetch_config(
        &self,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FetchOutcome>;
}

/// Fetches configuration from the CDN with conditional requests and a
/// bounded wire retry for transient failures.
pub struct ConfigApiClient {
    // Client holds a connection pool internally, so we're reusing the
    // client between requests.
    client: reqwest::blocking::Client,
    url: Url,
    retry_base_delay: Duration,
}

impl ConfigApiClient {
    pub fn new(sdk_key: &str, options: &Options) -> Result<ConfigApiClient> {
        let client = reqwest::blocking::Client::builder()
            .timeout(options.config_request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let url =
            Url::parse(&options.config_cdn_uri)?.join(&format!("v1/server/{sdk_key}.json"))?;

        Ok(ConfigApiClient {
            client,
            url,
            retry_base_delay: options.config_retry_delay,
        })
    }

    fn fetch_once(
        &self,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FetchOutcome> {
        let mut request = self.client.get(self.url.clone());
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send()?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if let Some(err) = status_error(status, self.url.as_str()) {
            return Err(err);
        }

        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };
        let etag = header(ETAG);
        let last_modified = header(LAST_MODIFIED);
        let body = response.text()?;

        Ok(FetchOutcome::Modified {
            body,
            etag,
            last_modified,
        })
    }
}

impl ConfigSource for ConfigApiClient {
    fn fetch_config(
        &self,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FetchOutcome> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(etag, last_modified) {
                Err(err) if err.is_retryable() && attempt < MAX_FETCH_RETRIES => {
                    log::warn!(
                        target: "flagpole",
                        "config fetch failed (attempt {}): {err}",
                        attempt + 1
                    );
                    std::thread::sleep(exponential_backoff(
                        attempt,
                        self.retry_base_delay,
                        &mut thread_rng(),
                    ));
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }
}

/// Map an unsuccessful response status onto the transport error taxonomy.
pub(crate) fn status_error(status: StatusCode, url: &str) -> Option<Error> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Some(Error::Unauthorized)
    } else if status == StatusCode::NOT_FOUND {
        Some(Error::NotFound(url.to_owned()))
    } else if status.is_client_error() {
        Some(Error::BadRequest {
            status: status.as_u16(),
        })
    } else if status.is_server_error() {
        Some(Error::ServerError {
            status: status.as_u16(),
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::status_error;
    use crate::Error;

    #[test]
    fn status_taxonomy() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "u"),
            Some(Error::Unauthorized)
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, "u"),
            Some(Error::Unauthorized)
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "u"),
            Some(Error::NotFound(_))
        ));
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, "u"),
            Some(Error::BadRequest { status: 422 })
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "u"),
            Some(Error::ServerError { status: 502 })
        ));
        assert!(status_error(StatusCode::OK, "u").is_none());
    }

    #[test]
    fn only_server_errors_are_retryable() {
        assert!(status_error(StatusCode::INTERNAL_SERVER_ERROR, "u")
            .unwrap()
            .is_retryable());
        assert!(!status_error(StatusCode::NOT_FOUND, "u").unwrap().is_retryable());
        assert!(!status_error(StatusCode::BAD_REQUEST, "u").unwrap().is_retryable());
    }
}
