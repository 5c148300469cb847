//! # pulse-webhook
//!
//! The bridge between Pulse and the agent host. Trigger turns POST to the
//! configured agent hook; auxiliary pings use the `/hooks/wake` variant on
//! the same host. Transport errors and 5xx retry with exponential backoff;
//! 4xx never retries.

use reqwest::Url;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use pulse_config::schema::WebhookConfig;
use pulse_core::PulseError;

const BACKOFF_START: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Result of one webhook dispatch (after retries).
#[derive(Debug, Clone)]
pub struct WakeOutcome {
    pub ok: bool,
    /// HTTP status as a string, or "timeout" / "transport".
    pub status: String,
    /// True when the call went out without a bearer token.
    pub auth_missing: bool,
    /// Session identifier returned by the agent host, if any.
    pub session_key: Option<String>,
}

/// HTTP client for the agent host's hook endpoints.
pub struct WebhookClient {
    client: reqwest::Client,
    agent_url: Url,
    wake_url: Url,
    token: String,
    auth_header: String,
    message_prefix: String,
    max_retries: u32,
}

impl WebhookClient {
    pub fn new(cfg: &WebhookConfig) -> pulse_core::Result<Self> {
        let agent_url = Url::parse(&cfg.url)
            .map_err(|e| PulseError::Config(format!("invalid webhook url '{}': {e}", cfg.url)))?;
        // The wake endpoint lives on the same scheme+host; composed from the
        // parsed URL, never by substring surgery on the path.
        let mut wake_url = agent_url.clone();
        wake_url.set_path("/hooks/wake");

        if cfg.token.is_empty() {
            warn!("webhook token is empty — calls will be sent unauthenticated");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| PulseError::Webhook(e.to_string()))?;

        Ok(Self {
            client,
            agent_url,
            wake_url,
            token: cfg.token.clone(),
            auth_header: cfg.auth_header.clone(),
            message_prefix: cfg.message_prefix.clone(),
            max_retries: cfg.max_retries,
        })
    }

    pub fn agent_url(&self) -> &Url {
        &self.agent_url
    }

    pub fn wake_url(&self) -> &Url {
        &self.wake_url
    }

    pub fn auth_present(&self) -> bool {
        !self.token.is_empty()
    }

    /// Trigger an agent turn. `metadata` carries the trigger id, timestamp,
    /// and pressure snapshot for idempotency on the receiving side.
    pub async fn trigger(&self, message: &str, metadata: serde_json::Value) -> WakeOutcome {
        let body = serde_json::json!({
            "message": format!("{} {}", self.message_prefix, message),
            "metadata": metadata,
        });
        self.post_with_retries(self.agent_url.clone(), body).await
    }

    /// Auxiliary notification — lighter than a full turn.
    pub async fn wake(&self, text: &str) -> bool {
        let body = serde_json::json!({ "text": text, "mode": "now" });
        self.post_with_retries(self.wake_url.clone(), body).await.ok
    }

    async fn post_with_retries(&self, url: Url, body: serde_json::Value) -> WakeOutcome {
        let auth_missing = self.token.is_empty();
        let mut backoff = BACKOFF_START;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut request = self.client.post(url.clone()).json(&body);
            if !auth_missing {
                request = request.header(&self.auth_header, format!("Bearer {}", self.token));
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let session_key = resp
                            .json::<serde_json::Value>()
                            .await
                            .ok()
                            .and_then(|v| {
                                v.get("sessionKey")
                                    .or_else(|| v.get("runId"))
                                    .and_then(|s| s.as_str())
                                    .map(|s| s.to_string())
                            });
                        info!(status = status.as_u16(), "webhook accepted");
                        return WakeOutcome {
                            ok: true,
                            status: status.as_u16().to_string(),
                            auth_missing,
                            session_key,
                        };
                    }
                    if status.is_client_error() {
                        // 4xx is permanent: no retry, and the caller must
                        // not decay pressure on the back of it.
                        let text = resp.text().await.unwrap_or_default();
                        error!(
                            status = status.as_u16(),
                            body = %text.chars().take(200).collect::<String>(),
                            "webhook rejected"
                        );
                        return WakeOutcome {
                            ok: false,
                            status: status.as_u16().to_string(),
                            auth_missing,
                            session_key: None,
                        };
                    }
                    // 5xx: retry with backoff.
                    warn!(status = status.as_u16(), attempt, "webhook server error");
                    if attempt > self.max_retries {
                        return WakeOutcome {
                            ok: false,
                            status: status.as_u16().to_string(),
                            auth_missing,
                            session_key: None,
                        };
                    }
                }
                Err(e) => {
                    let status = if e.is_timeout() { "timeout" } else { "transport" };
                    warn!(error = %e, attempt, status, "webhook call failed");
                    if attempt > self.max_retries {
                        return WakeOutcome {
                            ok: false,
                            status: status.to_string(),
                            auth_missing,
                            session_key: None,
                        };
                    }
                }
            }

            debug!(backoff_ms = backoff.as_millis() as u64, "retrying webhook");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config(url: &str, retries: u32) -> WebhookConfig {
        WebhookConfig {
            url: url.into(),
            token: "secret".into(),
            max_retries: retries,
            timeout_secs: 2,
            ..WebhookConfig::default()
        }
    }

    /// Minimal HTTP server answering each connection with the next canned
    /// status line. Returns the bound address and a request counter.
    async fn canned_server(responses: Vec<&'static str>) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_inner = counter.clone();
        tokio::spawn(async move {
            let mut responses = responses.into_iter();
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                counter_inner.fetch_add(1, Ordering::SeqCst);
                let status = responses.next().unwrap_or("200 OK");
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let body = r#"{"runId": "run-1"}"#;
                let reply = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (addr, counter)
    }

    #[test]
    fn wake_url_is_composed_from_scheme_and_host() {
        let cfg = config("http://127.0.0.1:18789/hooks/agent", 0);
        let client = WebhookClient::new(&cfg).unwrap();
        assert_eq!(
            client.wake_url().as_str(),
            "http://127.0.0.1:18789/hooks/wake"
        );
        // A path that happens to contain "agent" elsewhere must not matter.
        let cfg = config("http://agent.example:8080/v2/hooks/agent", 0);
        let client = WebhookClient::new(&cfg).unwrap();
        assert_eq!(
            client.wake_url().as_str(),
            "http://agent.example:8080/hooks/wake"
        );
    }

    #[test]
    fn invalid_url_is_a_config_error() {
        let cfg = config("not a url", 0);
        assert!(WebhookClient::new(&cfg).is_err());
    }

    #[tokio::test]
    async fn accepted_dispatch_returns_session_key() {
        let (addr, counter) = canned_server(vec!["202 Accepted"]).await;
        let cfg = config(&format!("http://{addr}/hooks/agent"), 0);
        let client = WebhookClient::new(&cfg).unwrap();

        let outcome = client.trigger("time to think", serde_json::json!({})).await;
        assert!(outcome.ok);
        assert_eq!(outcome.status, "202");
        assert_eq!(outcome.session_key.as_deref(), Some("run-1"));
        assert!(!outcome.auth_missing);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let (addr, counter) = canned_server(vec!["403 Forbidden", "202 Accepted"]).await;
        let cfg = config(&format!("http://{addr}/hooks/agent"), 3);
        let client = WebhookClient::new(&cfg).unwrap();

        let outcome = client.trigger("hello", serde_json::json!({})).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.status, "403");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_error_retries_then_succeeds() {
        let (addr, counter) =
            canned_server(vec!["500 Internal Server Error", "202 Accepted"]).await;
        let cfg = config(&format!("http://{addr}/hooks/agent"), 2);
        let client = WebhookClient::new(&cfg).unwrap();

        let outcome = client.trigger("hello", serde_json::json!({})).await;
        assert!(outcome.ok);
        assert_eq!(outcome.status, "202");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transport_error_reports_after_retries() {
        // Nothing listens here.
        let cfg = config("http://127.0.0.1:1/hooks/agent", 1);
        let client = WebhookClient::new(&cfg).unwrap();
        let outcome = client.trigger("hello", serde_json::json!({})).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.status, "transport");
    }

    #[tokio::test]
    async fn missing_token_is_flagged() {
        let (addr, _) = canned_server(vec!["202 Accepted"]).await;
        let mut cfg = config(&format!("http://{addr}/hooks/agent"), 0);
        cfg.token = String::new();
        let client = WebhookClient::new(&cfg).unwrap();
        let outcome = client.trigger("hello", serde_json::json!({})).await;
        assert!(outcome.ok);
        assert!(outcome.auth_missing);
    }
}
