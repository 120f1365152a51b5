//! The HTTP client that publishes event batches.
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use url::Url;

use super::UserEventsBatchRecord;
use crate::configuration::client::status_error;
use crate::options::Options;
use crate::{Error, Result};

/// Destination for drained event batches.
///
/// The production implementation is [`EventApiClient`]; tests substitute
/// scripted fakes. Publish failures control only whether the engine is told
/// to requeue the payload; there is no wire retry here.
pub trait EventsApi: Send + Sync {
    /// Publish one payload's batch records.
    fn publish_events(&self, batch: &[UserEventsBatchRecord]) -> Result<()>;
}

/// Publishes event batches to the events API.
pub struct EventApiClient {
    // Client holds a connection pool internally, so we're reusing the
    // client between requests.
    client: reqwest::blocking::Client,
    url: Url,
}

impl EventApiClient {
    pub fn new(sdk_key: &str, options: &Options) -> Result<EventApiClient> {
        let mut headers = HeaderMap::new();
        let mut authorization = HeaderValue::from_str(sdk_key)
            .map_err(|_| Error::InvalidInput("SDK key is not a valid header value".to_owned()))?;
        authorization.set_sensitive(true);
        headers.insert(AUTHORIZATION, authorization);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::blocking::Client::builder()
            .timeout(options.event_request_timeout)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let url = Url::parse(&options.events_api_uri)?.join("v1/events/batch")?;

        Ok(EventApiClient { client, url })
    }
}

impl EventsApi for EventApiClient {
    fn publish_events(&self, batch: &[UserEventsBatchRecord]) -> Result<()> {
        let body = serde_json::json!({ "batch": batch });
        let response = self.client.post(self.url.clone()).json(&body).send()?;

        if let Some(err) = status_error(response.status(), self.url.as_str()) {
            return Err(err);
        }
        Ok(())
    }
}
