use anyhow::{Context, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::ErrorResponse;

/// Characters escaped inside a single path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Escape a user-supplied value for use as one path segment.
pub fn segment(value: &str) -> String {
    utf8_percent_encode(value, SEGMENT).to_string()
}

#[derive(Clone)]
pub struct Client {
    base_url: Url,
    http: reqwest::Client,
    token: Option<String>,
    user_agent: String,
    retries: u32,
}

impl Client {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration, retries: u32) -> Result<Self> {
        let mut base_url = Url::parse(base_url).context("Invalid base URL")?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url,
            http,
            token,
            user_agent: format!("netmeshctl/{}", env!("CARGO_PKG_VERSION")),
            retries,
        })
    }

    pub fn build_url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).with_context(|| {
            format!(
                "Failed to join base_url={} with path={}",
                self.base_url, path
            )
        })
    }

    /// Send a request and pretty-print the JSON reply.
    pub async fn send_json(&self, method: Method, path: &str, body: Option<Value>) -> Result<()> {
        let reply = self.request(method, path, body).await?;
        println!("{}", serde_json::to_string_pretty(&reply)?);
        Ok(())
    }

    /// Send a request and return the `response` payload of the success envelope.
    pub async fn send_for_payload(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let mut reply = self.request(method, path, body).await?;
        Ok(reply
            .get_mut("response")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = self.build_url(path)?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let mut req = self
                .http
                .request(method.clone(), url.clone())
                .header("user-agent", &self.user_agent)
                .header("x-request-id", Uuid::new_v4().to_string());

            if let Some(token) = &self.token {
                req = req.bearer_auth(token);
            }
            if let Some(b) = &body {
                req = req.json(b);
            }

            debug!("HTTP {} {} (attempt {})", method, url, attempt);
            let resp = req.send().await.context("Request failed")?;
            let status = resp.status();
            let bytes = resp.bytes().await.unwrap_or_default();

            if status.is_success() {
                if bytes.is_empty() {
                    return Ok(Value::Null);
                }
                return serde_json::from_slice(&bytes).context("Malformed JSON reply");
            }

            if attempt <= self.retries && should_retry(&method, status) {
                tokio::time::sleep(Duration::from_millis(300)).await;
                continue;
            }

            anyhow::bail!("{}", describe_failure(&method, &url, status, &bytes));
        }
    }
}

/// Render a failed reply, preferring the server's `{code, message}` envelope.
fn describe_failure(method: &Method, url: &Url, status: StatusCode, body: &[u8]) -> String {
    match serde_json::from_slice::<ErrorResponse>(body) {
        Ok(ErrorResponse {
            code,
            message: Some(message),
        }) => format!(
            "HTTP {} {} failed: status={} code={} message={}",
            method,
            url,
            status.as_u16(),
            code.unwrap_or(status.as_u16()),
            message
        ),
        _ => format!(
            "HTTP {} {} failed: status={} body={}",
            method,
            url,
            status.as_u16(),
            String::from_utf8_lossy(body)
        ),
    }
}

fn should_retry(method: &Method, status: StatusCode) -> bool {
    status.is_server_error() && matches!(*method, Method::GET | Method::DELETE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_only_idempotent_reads_and_deletes() {
        assert!(should_retry(&Method::GET, StatusCode::BAD_GATEWAY));
        assert!(should_retry(&Method::DELETE, StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!should_retry(&Method::POST, StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!should_retry(&Method::GET, StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_failure_message_carries_error_envelope() {
        let url = Url::parse("http://127.0.0.1:8081/api/nodes/n1").unwrap();
        let msg = describe_failure(
            &Method::POST,
            &url,
            StatusCode::CONFLICT,
            br#"{"code":409,"message":"server nodes cannot be deleted"}"#,
        );
        assert!(msg.contains("status=409"));
        assert!(msg.contains("code=409"));
        assert!(msg.contains("message=server nodes cannot be deleted"));

        let msg = describe_failure(&Method::GET, &url, StatusCode::BAD_GATEWAY, b"upstream down");
        assert!(msg.contains("body=upstream down"));
        assert!(!msg.contains("code="));
    }

    #[test]
    fn test_segment_escapes_path_separators() {
        assert_eq!(segment("net-1"), "net-1");
        assert_eq!(segment("a/b c"), "a%2Fb%20c");
    }

    #[test]
    fn test_build_url_keeps_base_path() {
        let client = Client::new("http://127.0.0.1:8081/", None, Duration::from_secs(1), 0).unwrap();
        let url = client.build_url("api/nodes/n1").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8081/api/nodes/n1");

        let client = Client::new("https://ctl.example/mesh", None, Duration::from_secs(1), 0).unwrap();
        let url = client.build_url("api/nodes").unwrap();
        assert_eq!(url.as_str(), "https://ctl.example/mesh/api/nodes");
    }
}
