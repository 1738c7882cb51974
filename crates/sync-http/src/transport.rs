use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    Client, StatusCode,
    header::{HeaderMap, RETRY_AFTER},
};
use serde::Deserialize;
use serde_json::Value;
use sync_core::{PollFailure, PollRequest};
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

const EVENTS_PATH: &str = "json/events";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Connection-level failure from a transport without a reqwest error.
    #[error("network failure: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl TransportError {
    /// Classify for the poll state machine.
    pub fn into_poll_failure(self) -> PollFailure {
        match self {
            Self::Timeout => PollFailure::Timeout,
            Self::Http(err) if err.is_timeout() => PollFailure::Timeout,
            Self::UnexpectedStatus {
                status,
                body,
                retry_after,
            } => PollFailure::from_response(status, &body, retry_after),
            other => PollFailure::network(other.to_string()),
        }
    }
}

/// Client side of the long-poll event API.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// `GET /json/events`; returns the raw `events` array.
    async fn get_events(&self, request: &PollRequest) -> Result<Vec<Value>, TransportError>;

    /// `DELETE /json/events` for `queue_id`.
    async fn delete_queue(&self, queue_id: &str) -> Result<(), TransportError>;
}

/// HTTP basic-auth credentials (account email and API key).
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub api_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Clone, Debug)]
pub struct HttpEventTransport {
    http: Client,
    events_url: Url,
    credentials: Option<Credentials>,
}

impl HttpEventTransport {
    pub fn new(server: &Url, credentials: Option<Credentials>) -> Result<Self, TransportError> {
        Ok(Self {
            http: Client::builder().build()?,
            events_url: events_url(server)?,
            credentials,
        })
    }

    pub fn events_url(&self) -> &Url {
        &self.events_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some(credentials) => {
                request.basic_auth(&credentials.email, Some(&credentials.api_key))
            }
            None => request,
        }
    }
}

#[async_trait]
impl EventTransport for HttpEventTransport {
    async fn get_events(&self, request: &PollRequest) -> Result<Vec<Value>, TransportError> {
        trace!(
            queue_id = %request.queue_id,
            last_event_id = request.last_event_id,
            dont_block = request.dont_block,
            "GET events"
        );
        let res = self
            .authorize(self.http.get(self.events_url.clone()))
            .query(&[
                ("queue_id", request.queue_id.clone()),
                ("last_event_id", request.last_event_id.to_string()),
                ("dont_block", request.dont_block.to_string()),
            ])
            .timeout(request.timeout)
            .send()
            .await?;

        let res = check_status(res).await?;
        let body: EventsResponse = res.json().await?;
        debug!(count = body.events.len(), "events received");
        Ok(body.events)
    }

    async fn delete_queue(&self, queue_id: &str) -> Result<(), TransportError> {
        let res = self
            .authorize(self.http.delete(self.events_url.clone()))
            .query(&[("queue_id", queue_id)])
            .send()
            .await?;
        check_status(res).await?;
        debug!(%queue_id, "event queue deleted");
        Ok(())
    }
}

fn events_url(server: &Url) -> Result<Url, TransportError> {
    let mut base = server.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join(EVENTS_PATH)?)
}

async fn check_status(res: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let retry_after = retry_after(status, res.headers());
    let body = res.text().await.unwrap_or_default();
    Err(TransportError::UnexpectedStatus {
        status: status.as_u16(),
        body,
        retry_after,
    })
}

fn retry_after(status: StatusCode, headers: &HeaderMap) -> Option<Duration> {
    if status != StatusCode::TOO_MANY_REQUESTS && !status.is_server_error() {
        return None;
    }
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;
    use sync_core::SyncErrorCategory;

    use super::*;

    #[test]
    fn events_url_keeps_server_path_prefix() {
        let server = Url::parse("https://chat.example.com/api/v1").expect("valid url");
        assert_eq!(
            events_url(&server).expect("joinable").as_str(),
            "https://chat.example.com/api/v1/json/events"
        );

        let server = Url::parse("https://chat.example.com").expect("valid url");
        assert_eq!(
            events_url(&server).expect("joinable").as_str(),
            "https://chat.example.com/json/events"
        );
    }

    #[test]
    fn retry_after_is_read_only_for_throttling_and_server_errors() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(
            retry_after(StatusCode::TOO_MANY_REQUESTS, &headers),
            Some(Duration::from_secs(12))
        );
        assert_eq!(
            retry_after(StatusCode::SERVICE_UNAVAILABLE, &headers),
            Some(Duration::from_secs(12))
        );
        assert_eq!(retry_after(StatusCode::BAD_REQUEST, &headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(StatusCode::TOO_MANY_REQUESTS, &headers), None);
    }

    #[test]
    fn classifies_transport_errors_for_the_poller() {
        assert_eq!(TransportError::Timeout.into_poll_failure(), PollFailure::Timeout);

        let expired = TransportError::UnexpectedStatus {
            status: 400,
            body: r#"{"result":"error","code":"BAD_EVENT_QUEUE_ID"}"#.into(),
            retry_after: None,
        };
        assert_eq!(expired.into_poll_failure(), PollFailure::QueueExpired);

        let throttled = TransportError::UnexpectedStatus {
            status: 429,
            body: "slow down".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        match throttled.into_poll_failure() {
            PollFailure::Transient(error) => {
                assert_eq!(error.category, SyncErrorCategory::RateLimited);
                assert_eq!(error.retry_after_ms, Some(3_000));
            }
            other => panic!("unexpected failure: {other:?}"),
        }

        match TransportError::Network("connection refused".into()).into_poll_failure() {
            PollFailure::Transient(error) => {
                assert_eq!(error.category, SyncErrorCategory::TransientNetwork)
            }
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[test]
    fn credentials_debug_hides_api_key() {
        let credentials = Credentials {
            email: "iago@example.com".into(),
            api_key: "secret-key".into(),
        };
        let rendered = format!("{credentials:?}");
        assert!(rendered.contains("iago@example.com"));
        assert!(!rendered.contains("secret-key"));
    }
}
