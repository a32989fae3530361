use super::SenderError;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, ClientBuilder, Response, redirect};
use std::time::Duration;
use url::Url;

pub const CONTENT_TYPE_JSON_STREAM: &str = "application/x-json-stream";

/// Marker header on the sender's own requests. Outbound-HTTP instrumentation
/// must skip requests carrying it, or the pipeline would track itself.
pub const SUPPRESS_INSTRUMENTATION_HEADER: &str = "x-telemetry-suppress-instrumentation";

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub endpoint: String,
    pub instrumentation_key: String,
    pub timeout: Duration,
    pub connection_timeout: Duration,
    pub user_agent: String,
    pub max_redirects: u32,
    pub disk_retry_enabled: bool,
    pub resend_interval: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://dc.services.visualstudio.com/v2.1/track".to_string(),
            instrumentation_key: String::new(),
            timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            user_agent: format!("telemetry-channel/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 10,
            disk_retry_enabled: false,
            resend_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    endpoint_url: Url,
}

impl HttpClient {
    pub fn new(config: &SenderConfig) -> Result<Self, SenderError> {
        let endpoint_url: Url = config.endpoint.parse().map_err(|e| {
            SenderError::InvalidConfiguration(format!(
                "Invalid endpoint URL '{}': {e}",
                config.endpoint
            ))
        })?;

        // Redirects are followed by the sender so the learned host sticks.
        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .connect_timeout(config.connection_timeout)
            .user_agent(&config.user_agent)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| {
                SenderError::InvalidConfiguration(format!("Failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            endpoint_url,
        })
    }

    pub fn endpoint_url(&self) -> &Url {
        &self.endpoint_url
    }

    pub fn build_headers(&self, compressed: bool) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(CONTENT_TYPE_JSON_STREAM),
        );
        if compressed {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        headers.insert(
            HeaderName::from_static(SUPPRESS_INSTRUMENTATION_HEADER),
            HeaderValue::from_static("1"),
        );
        headers
    }

    pub async fn post(
        &self,
        url: Url,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> Result<Response, reqwest::Error> {
        self.client.post(url).headers(headers).body(body).send().await
    }
}
