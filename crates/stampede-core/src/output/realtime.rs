//! Real-time endpoints — Graphite plaintext over TCP, webhook JSON POST,
//! and single-shot WebSocket messages. Every send is independently
//! fault-tolerant: an endpoint failure is logged and never blocks the
//! other endpoints or the test.

use std::sync::Arc;

use futures_util::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::Message;

use crate::results::TestResult;

// ---------------------------------------------------------------------------
// Graphite
// ---------------------------------------------------------------------------

pub struct GraphiteEndpoint {
    pub host: String,
    pub port: u16,
    pub prefix: String,
}

impl GraphiteEndpoint {
    /// Send `metric value timestamp` lines for a batch over a fresh TCP
    /// connection.
    pub async fn send(&self, batch: &[TestResult]) -> Result<(), String> {
        let address = format!("{}:{}", self.host, self.port);
        let mut stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| format!("graphite connect to {address} failed: {e}"))?;

        let mut payload = String::new();
        for result in batch {
            let ts = result.timestamp / 1000;
            let metric_path = format!(
                "{}.{}.{}",
                self.prefix,
                sanitize(&result.scenario),
                sanitize(&result.step_name)
            );
            payload.push_str(&format!(
                "{metric_path}.response_time {} {ts}\n",
                result.response_time
            ));
            payload.push_str(&format!(
                "{metric_path}.success {} {ts}\n",
                if result.success { 1 } else { 0 }
            ));
        }

        stream
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| format!("graphite write failed: {e}"))?;
        stream
            .shutdown()
            .await
            .map_err(|e| format!("graphite shutdown failed: {e}"))?;
        Ok(())
    }
}

/// Graphite metric path segments must not contain dots or spaces.
fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

pub struct WebhookEndpoint {
    pub url: String,
    pub client: Arc<reqwest::Client>,
}

impl WebhookEndpoint {
    pub async fn send(
        &self,
        batch: &[TestResult],
        batch_number: u64,
        test_start_time: i64,
    ) -> Result<(), String> {
        let payload = serde_json::json!({
            "timestamp": crate::clock::epoch_ms(),
            "batch_number": batch_number,
            "batch_size": batch.len(),
            "test_start_time": test_start_time,
            "results": batch,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| format!("webhook POST to {} failed: {e}", self.url))?;

        if !response.status().is_success() {
            return Err(format!(
                "webhook {} answered {}",
                self.url,
                response.status()
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

pub struct WebsocketEndpoint {
    pub url: String,
}

impl WebsocketEndpoint {
    /// Connect, deliver the batch as one text message, and close.
    pub async fn send(&self, batch: &[TestResult], batch_number: u64) -> Result<(), String> {
        let (mut stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| format!("websocket connect to {} failed: {e}", self.url))?;

        let message = serde_json::json!({
            "batch_number": batch_number,
            "results": batch,
        })
        .to_string();

        stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| format!("websocket send failed: {e}"))?;
        stream
            .close(None)
            .await
            .map_err(|e| format!("websocket close failed: {e}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_batch() -> Vec<TestResult> {
        let mut r = TestResult::new(1, 0, "browse", "rest", "Home Page");
        r.status = 200;
        r.response_time = 30;
        vec![r]
    }

    #[test]
    fn sanitize_replaces_separator_characters() {
        assert_eq!(sanitize("Home Page"), "Home_Page");
        assert_eq!(sanitize("a.b/c"), "a_b_c");
        assert_eq!(sanitize("plain-name_1"), "plain-name_1");
    }

    #[tokio::test]
    async fn graphite_writes_plaintext_lines() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut socket, &mut buffer)
                .await
                .unwrap();
            String::from_utf8(buffer).unwrap()
        });

        let endpoint = GraphiteEndpoint {
            host: address.ip().to_string(),
            port: address.port(),
            prefix: "stampede".to_string(),
        };
        endpoint.send(&make_batch()).await.unwrap();

        let received = server.await.unwrap();
        assert!(received.contains("stampede.browse.Home_Page.response_time 30 "));
        assert!(received.contains("stampede.browse.Home_Page.success 1 "));
        assert!(received.ends_with('\n'));
    }

    #[tokio::test]
    async fn graphite_connect_failure_is_an_error_not_a_panic() {
        let endpoint = GraphiteEndpoint {
            host: "127.0.0.1".to_string(),
            port: 9,
            prefix: "x".to_string(),
        };
        assert!(endpoint.send(&make_batch()).await.is_err());
    }

    #[tokio::test]
    async fn webhook_posts_batch_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = WebhookEndpoint {
            url: format!("{}/hook", server.uri()),
            client: Arc::new(reqwest::Client::new()),
        };
        endpoint.send(&make_batch(), 7, 1_700_000_000_000).await.unwrap();
    }

    #[tokio::test]
    async fn webhook_non_2xx_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let endpoint = WebhookEndpoint {
            url: server.uri(),
            client: Arc::new(reqwest::Client::new()),
        };
        let err = endpoint.send(&make_batch(), 1, 0).await.unwrap_err();
        assert!(err.contains("500"));
    }

    #[tokio::test]
    async fn websocket_unreachable_is_an_error() {
        let endpoint = WebsocketEndpoint {
            url: "ws://127.0.0.1:9".to_string(),
        };
        assert!(endpoint.send(&make_batch(), 1).await.is_err());
    }
}
