//! Pluggable HTTP transport for every outbound call to a peer scenario.
//!
//! [`UreqGateway`] runs `ureq` (sync) inside `tokio::task::spawn_blocking`
//! so the async runtime is never blocked. Tests inject their own
//! [`HttpGateway`] to observe requests and script responses.

use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl GatewayRequest {
    /// `GET` with `Accept: application/json`.
    pub fn get_json(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: vec![("Accept".to_string(), "application/json".to_string())],
            body: None,
            timeout,
        }
    }

    /// `POST` of a JSON body with JSON `Content-Type` and `Accept`.
    pub fn post_json(url: impl Into<String>, body: Vec<u8>, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
            ],
            body: Some(body),
            timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl GatewayResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Transport-level failure: the request never produced a status line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct GatewayError {
    pub message: String,
}

/// Sends one HTTP request and returns the full response regardless of status.
#[async_trait]
pub trait HttpGateway: Send + Sync {
    async fn send(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError>;
}

/// Production transport backed by `ureq`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UreqGateway;

impl UreqGateway {
    fn send_blocking(request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(request.timeout))
            .http_status_as_error(false)
            .build()
            .into();

        let transport = |e: ureq::Error| GatewayError {
            message: e.to_string(),
        };

        let response = match request.method {
            HttpMethod::Get => {
                let mut builder = agent.get(&request.url);
                for (name, value) in &request.headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                builder.call().map_err(transport)?
            }
            HttpMethod::Post => {
                let mut builder = agent.post(&request.url);
                for (name, value) in &request.headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                let body = request.body.unwrap_or_default();
                builder.send(&body[..]).map_err(transport)?
            }
        };

        let status = response.status().as_u16();
        let body = response.into_body().read_to_vec().map_err(transport)?;
        Ok(GatewayResponse { status, body })
    }
}

#[async_trait]
impl HttpGateway for UreqGateway {
    async fn send(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        tokio::task::spawn_blocking(move || Self::send_blocking(request))
            .await
            .map_err(|e| GatewayError {
                message: format!("task join error: {}", e),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_json_sets_content_negotiation_headers() {
        let req = GatewayRequest::post_json("http://x/api", b"{}".to_vec(), Duration::from_secs(1));
        assert_eq!(req.method, HttpMethod::Post);
        assert!(req
            .headers
            .iter()
            .any(|(k, v)| k == "Content-Type" && v == "application/json"));
        assert!(req
            .headers
            .iter()
            .any(|(k, v)| k == "Accept" && v == "application/json"));
    }

    #[tokio::test]
    async fn unreachable_host_is_transport_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{}/api/v1/tools", port);
        let req = GatewayRequest::get_json(url, Duration::from_secs(2));
        assert!(UreqGateway.send(req).await.is_err());
    }
}
