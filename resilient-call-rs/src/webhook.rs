//! Monitored outbound HTTP for webhooks and JSON APIs.

use std::sync::Arc;

use reqwest::{header, Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::monitor::{CallOptions, RemoteCallMonitor};
use crate::types::{Error, ErrorKind, Result, ServiceType};

const USER_AGENT: &str = concat!("resilient-call/", env!("CARGO_PKG_VERSION"));

// Longest error body kept in a classified error message
const MAX_ERROR_BODY: usize = 512;

/// HTTP client whose every request is a monitored call against one service
#[derive(Clone)]
pub struct WebhookClient {
    http: Client,
    monitor: Arc<RemoteCallMonitor>,
    service_name: String,
    service_type: ServiceType,
    base_url: String,
}

impl WebhookClient {
    /// Client for a webhook receiver rooted at `base_url`
    pub fn new<S, U>(monitor: Arc<RemoteCallMonitor>, service_name: S, base_url: U) -> Result<Self>
    where
        S: Into<String>,
        U: Into<String>,
    {
        Self::with_service_type(monitor, service_name, ServiceType::Webhook, base_url)
    }

    pub fn with_service_type<S, U>(
        monitor: Arc<RemoteCallMonitor>,
        service_name: S,
        service_type: ServiceType,
        base_url: U,
    ) -> Result<Self>
    where
        S: Into<String>,
        U: Into<String>,
    {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::USER_AGENT, header::HeaderValue::from_static(USER_AGENT));

        let http = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Error::validation(format!("Failed to build HTTP client: {}", e)).cause(e))?;

        Ok(Self {
            http,
            monitor,
            service_name: service_name.into(),
            service_type,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// POSTs `body` as JSON and decodes the JSON response
    pub async fn post_json<B, R>(&self, endpoint: &str, body: &B, options: CallOptions) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(body)?;
        let response = self
            .send(Method::POST, endpoint, options, |request| {
                request
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(payload.clone())
            })
            .await?;
        Ok(serde_json::from_slice(&response)?)
    }

    /// POSTs `body` as JSON, ignoring the response body. Returns the status code.
    pub async fn deliver<B>(&self, endpoint: &str, body: &B, options: CallOptions) -> Result<u16>
    where
        B: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(body)?;
        let url = self.url(endpoint);

        self.monitor
            .monitored_call(
                &self.service_name,
                self.service_type,
                endpoint,
                Method::POST.as_str(),
                || {
                    let request = self
                        .http
                        .post(&url)
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(payload.clone());
                    async move {
                        let response = check_status(request.send().await?).await?;
                        Ok::<_, Error>(response.status().as_u16())
                    }
                },
                options,
            )
            .await
    }

    /// GETs `endpoint` and decodes the JSON response
    pub async fn get<R>(&self, endpoint: &str, options: CallOptions) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let response = self.send(Method::GET, endpoint, options, |request| request).await?;
        Ok(serde_json::from_slice(&response)?)
    }

    // Runs one monitored request and returns the raw body of a 2xx response.
    // Decoding happens outside the monitored call so a malformed body is not
    // retried.
    async fn send<F>(&self, method: Method, endpoint: &str, options: CallOptions, prepare: F) -> Result<Vec<u8>>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let url = self.url(endpoint);

        self.monitor
            .monitored_call(
                &self.service_name,
                self.service_type,
                endpoint,
                method.as_str(),
                || {
                    let request = prepare(self.http.request(method.clone(), &url));
                    async move {
                        let response = check_status(request.send().await?).await?;
                        Ok::<_, Error>(response.bytes().await?.to_vec())
                    }
                },
                options,
            )
            .await
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }
}

impl std::fmt::Debug for WebhookClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookClient")
            .field("service_name", &self.service_name)
            .field("service_type", &self.service_type)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Maps a non-2xx response to an `Http(status)` error carrying the body
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let mut body: String = body.chars().take(MAX_ERROR_BODY).collect();
    if body.is_empty() {
        body = status.canonical_reason().unwrap_or("no reason").to_string();
    }

    Err(Error::new(ErrorKind::Http(status.as_u16()), format!("HTTP {}: {}", status.as_u16(), body)))
}
