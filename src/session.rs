use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use uuid::Uuid;

/// Hands out the id a scenario run is tagged with.
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// Never fails; sources fall back to a random UUID.
    async fn session_id(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UuidSessions;

#[async_trait]
impl SessionSource for UuidSessions {
    async fn session_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Asks a webhook for a session id with a GET and reads `session_id` from the
/// JSON body.
#[derive(Debug, Clone)]
pub struct WebhookSessions {
    client: Client,
    url: String,
    timeout: Duration,
}

impl WebhookSessions {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), url)
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn fetch(&self) -> Result<Option<String>, reqwest::Error> {
        let body: Value = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let id = match body.get("session_id") {
            Some(Value::String(id)) if !id.trim().is_empty() => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };
        Ok(id)
    }
}

#[async_trait]
impl SessionSource for WebhookSessions {
    async fn session_id(&self) -> String {
        match self.fetch().await {
            Ok(Some(id)) => {
                tracing::info!(session_id = %id, "session id issued by webhook");
                return id;
            }
            Ok(None) => tracing::error!(url = %self.url, "webhook response missing session_id"),
            Err(err) => tracing::error!(url = %self.url, error = %err, "webhook session request failed"),
        }

        let id = Uuid::new_v4().to_string();
        tracing::info!(session_id = %id, "generated fallback session id");
        id
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    /// Answers a single HTTP request with `status` and `body`.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/session")
    }

    fn sessions(url: String) -> WebhookSessions {
        let client = Client::builder().no_proxy().build().unwrap();
        WebhookSessions::with_client(client, url).with_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn uses_the_webhook_session_id() {
        let url = serve_once("200 OK", r#"{"session_id": "call-123"}"#).await;
        assert_eq!(sessions(url).session_id().await, "call-123");
    }

    #[tokio::test]
    async fn missing_field_falls_back_to_uuid() {
        let url = serve_once("200 OK", r#"{"id": "call-123"}"#).await;
        let id = sessions(url).session_id().await;
        assert!(Uuid::parse_str(&id).is_ok(), "{id}");
    }

    #[tokio::test]
    async fn error_status_falls_back_to_uuid() {
        let url = serve_once("503 Service Unavailable", r#"{"session_id": "call-123"}"#).await;
        let id = sessions(url).session_id().await;
        assert!(Uuid::parse_str(&id).is_ok(), "{id}");
    }

    #[tokio::test]
    async fn unreachable_webhook_falls_back_to_uuid() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let id = sessions(format!("http://{addr}/session")).session_id().await;
        assert!(Uuid::parse_str(&id).is_ok(), "{id}");
    }
}
