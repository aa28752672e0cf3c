//! reqwest-backed transport for rendered poll requests

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use capability::{HttpRequest, Transport, TransportResult};
use tracing::{debug, warn};

/// Executes rendered requests with a shared `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Map a reqwest failure onto the transport result taxonomy.
fn failure(e: &reqwest::Error) -> TransportResult {
    if e.is_timeout() {
        TransportResult::Timeout
    } else {
        TransportResult::ConnectionError(e.to_string())
    }
}

impl Transport for ReqwestTransport {
    fn execute<'a>(
        &'a self,
        request: &'a HttpRequest,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = TransportResult> + Send + 'a>> {
        Box::pin(async move {
            let parsed = if request.query.is_empty() {
                reqwest::Url::parse(&request.url)
            } else {
                reqwest::Url::parse_with_params(&request.url, &request.query)
            };
            let url = match parsed {
                Ok(url) => url,
                Err(e) => {
                    return TransportResult::ConnectionError(format!(
                        "invalid url {}: {e}",
                        request.url
                    ));
                }
            };
            let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
                Ok(m) => m,
                Err(e) => {
                    return TransportResult::ConnectionError(format!(
                        "invalid method {}: {e}",
                        request.method
                    ));
                }
            };

            let mut builder = self.client.request(method, url).timeout(timeout);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(ref body) = request.body {
                builder = builder.body(body.clone());
            }

            let response = match builder.send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(url = %request.url, error = %e, "request failed");
                    return failure(&e);
                }
            };

            let status = response.status().as_u16();
            let mut headers = BTreeMap::new();
            for (name, value) in response.headers() {
                if let Ok(v) = value.to_str() {
                    headers.insert(name.to_string(), v.to_string());
                }
            }

            match response.text().await {
                Ok(body) => {
                    debug!(status, bytes = body.len(), "response received");
                    TransportResult::HttpResponse {
                        status,
                        headers,
                        body,
                    }
                }
                Err(e) => {
                    warn!(status, error = %e, "failed to read response body");
                    failure(&e)
                }
            }
        })
    }
}
