//! HTTP transport.

use crate::DispatchResult;
use async_trait::async_trait;
use beacon_connectivity::NetworkError;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Successful answer from an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// The endpoint had nothing new to return (HTTP 304).
    pub not_modified: bool,
}

impl TransportResponse {
    pub fn ok() -> Self {
        Self {
            status: 200,
            not_modified: false,
        }
    }

    pub fn not_modified() -> Self {
        Self {
            status: 304,
            not_modified: true,
        }
    }
}

/// Sends JSON bodies to an endpoint.
///
/// Dropping the returned future cancels the request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, url: &Url, body: &Value) -> Result<TransportResponse, NetworkError>;
}

/// [`Transport`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> DispatchResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post(&self, url: &Url, body: &Value) -> Result<TransportResponse, NetworkError> {
        debug!(url = %url, "Posting to endpoint");

        let response = self
            .client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(TransportResponse::not_modified());
        }
        if status.is_success() {
            return Ok(TransportResponse {
                status: status.as_u16(),
                not_modified: false,
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(NetworkError::Status {
            code: status.as_u16(),
            body,
        })
    }
}

/// Classify a reqwest failure.
pub fn map_reqwest_error(error: reqwest::Error) -> NetworkError {
    if error.is_timeout() {
        NetworkError::Timeout
    } else if error.is_connect() || error.is_request() {
        NetworkError::ConnectionLost(error.to_string())
    } else if error.is_builder() || error.is_body() {
        NetworkError::InvalidRequest(error.to_string())
    } else if let Some(status) = error.status() {
        NetworkError::Status {
            code: status.as_u16(),
            body: String::new(),
        }
    } else {
        NetworkError::Other(error.to_string())
    }
}
