use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;

pub const USER_AGENT: &str = concat!("AAISP-Prometheus-Exporter/", env!("CARGO_PKG_VERSION"));

/// Status and body of one HTTP exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// The network seam under [`crate::ChaosClient`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// POSTs `form` as `application/x-www-form-urlencoded` to `url`.
    async fn post(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> std::result::Result<RawResponse, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> std::result::Result<RawResponse, TransportError> {
        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify)?;
        Ok(RawResponse { status, body })
    }
}

// reqwest errors embed the URL but never the form body.
fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(err.without_url().to_string())
    }
}
