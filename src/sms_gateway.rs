//! HTTP client for the outbound SMS provider.
//!
//! With no gateway URL configured, messages are logged and reported as
//! delivered so a shop can run without a provider.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::Config;
use crate::data_helpers::{new_id, value_str};
use crate::error::{AppError, AppResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct SmsGateway {
    client: Client,
    url: Option<String>,
    authorization: Option<String>,
    default_sender: String,
}

impl SmsGateway {
    pub fn from_config(config: &Config) -> AppResult<Self> {
        let url = config.sms_gateway_url.trim().trim_end_matches('/').to_string();
        let url = if url.is_empty() {
            None
        } else if url.starts_with("http://") || url.starts_with("https://") {
            Some(url)
        } else {
            return Err(AppError::internal(format!(
                "SMS gateway URL must start with http:// or https://: {url}"
            )));
        };
        let authorization = (!config.sms_api_key.is_empty()).then(|| {
            let raw = format!("{}:{}", config.sms_api_key, config.sms_api_secret);
            format!("Basic {}", BASE64_STANDARD.encode(raw))
        });
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| AppError::internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            url,
            authorization,
            default_sender: config.sms_sender_id.clone(),
        })
    }

    /// True when messages actually leave the process.
    pub fn is_live(&self) -> bool {
        self.url.is_some()
    }

    /// Send one message. Returns the provider's message id.
    pub async fn send(&self, to: &str, sender: Option<&str>, text: &str) -> Result<String, String> {
        let from = sender
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.default_sender);
        let Some(url) = self.url.as_deref() else {
            info!(to, from, chars = text.chars().count(), "SMS (log-only): {text}");
            return Ok(new_id("log"));
        };

        let mut request = self
            .client
            .post(url)
            .json(&json!({ "to": to, "from": from, "text": text }));
        if let Some(auth) = &self.authorization {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }

        let start = Instant::now();
        let resp = request.send().await.map_err(|e| friendly_error(url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();
        debug!(to, status = status.as_u16(), latency_ms = start.elapsed().as_millis() as u64, "SMS gateway replied");

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body_text)
                .ok()
                .and_then(|json| value_str(&json, &["error", "message"]))
                .unwrap_or_else(|| status_error(status));
            return Err(format!("{message} (HTTP {})", status.as_u16()));
        }

        let provider_id = serde_json::from_str::<Value>(&body_text)
            .ok()
            .and_then(|json| value_str(&json, &["id", "messageId", "message_id"]))
            .unwrap_or_else(|| new_id("accepted"));
        Ok(provider_id)
    }
}

fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach SMS gateway at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid SMS gateway URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 | 403 => "SMS gateway rejected the credentials".to_string(),
        404 => "SMS gateway endpoint not found".to_string(),
        429 => "SMS gateway rate limit reached".to_string(),
        s if s >= 500 => format!("SMS gateway server error (HTTP {s})"),
        s => format!("Unexpected response from SMS gateway (HTTP {s})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
    use std::sync::{Arc, Mutex};

    fn config_with(url: &str) -> Config {
        let mut config = Config::for_data_dir(std::env::temp_dir());
        config.sms_gateway_url = url.into();
        config.sms_api_key = "key".into();
        config.sms_api_secret = "secret".into();
        config
    }

    #[test]
    fn rejects_url_without_scheme() {
        assert!(SmsGateway::from_config(&config_with("sms.example.com")).is_err());
        assert!(!SmsGateway::from_config(&config_with("")).unwrap().is_live());
    }

    #[tokio::test]
    async fn log_only_mode_reports_success() {
        let gateway = SmsGateway::from_config(&config_with("")).unwrap();
        let id = gateway.send("+251911000111", None, "hello").await.unwrap();
        assert!(id.starts_with("log-"));
    }

    type Seen = Arc<Mutex<Vec<(Option<String>, Value)>>>;

    async fn spawn_gateway(status: StatusCode, reply: Value) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route(
                "/send",
                post(
                    move |State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>| {
                        let reply = reply.clone();
                        async move {
                            let auth = headers
                                .get("authorization")
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_string);
                            seen.lock().unwrap().push((auth, body));
                            (status, Json(reply))
                        }
                    },
                ),
            )
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/send"), seen)
    }

    #[tokio::test]
    async fn posts_json_with_basic_auth() {
        let (url, seen) = spawn_gateway(StatusCode::OK, json!({ "messageId": "abc-1" })).await;
        let gateway = SmsGateway::from_config(&config_with(&url)).unwrap();
        let id = gateway.send("+251911000111", Some("MyShop"), "Ready").await.unwrap();
        assert_eq!(id, "abc-1");

        let seen = seen.lock().unwrap();
        let (auth, body) = &seen[0];
        assert_eq!(auth.as_deref(), Some("Basic a2V5OnNlY3JldA=="));
        assert_eq!(body["to"], "+251911000111");
        assert_eq!(body["from"], "MyShop");
        assert_eq!(body["text"], "Ready");
    }

    #[tokio::test]
    async fn error_status_surfaces_gateway_message() {
        let (url, _) = spawn_gateway(StatusCode::BAD_REQUEST, json!({ "error": "bad number" })).await;
        let gateway = SmsGateway::from_config(&config_with(&url)).unwrap();
        let err = gateway.send("+1", None, "x").await.unwrap_err();
        assert_eq!(err, "bad number (HTTP 400)");

        let (url, _) = spawn_gateway(StatusCode::SERVICE_UNAVAILABLE, json!({})).await;
        let gateway = SmsGateway::from_config(&config_with(&url)).unwrap();
        let err = gateway.send("+1", None, "x").await.unwrap_err();
        assert!(err.contains("server error"));
    }
}
