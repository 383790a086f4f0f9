use crate::wire::{decode_conversations, decode_messages};
use crate::{ApiError, ChatlogQuery, ChatlogSource};
use async_trait::async_trait;
use chatlog_config::ApiConfig;
use chatlog_core::{CivilZone, ConversationSummary, Message};
use serde_json::Value;
use std::time::Duration;
use url::Url;

const CHATLOG_PATH: &str = "api/v1/chatlog";
const SESSION_PATH: &str = "api/v1/session";

/// `ChatlogSource` backed by the archive's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpChatlogSource {
    http: reqwest::Client,
    base_url: Url,
    zone: CivilZone,
    retry_count: u32,
    retry_delay: Duration,
}

impl HttpChatlogSource {
    pub fn new(config: &ApiConfig, zone: CivilZone) -> Result<Self, ApiError> {
        let mut base_url = Url::parse(&config.base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            http,
            base_url,
            zone,
            retry_count: config.retry_count,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn get_json(&self, path: &str, params: &[(&str, String)]) -> Result<Value, ApiError> {
        let url = self.base_url.join(path)?;
        let mut attempt = 0;

        loop {
            match self.send_once(&url, params).await {
                Ok(payload) => return Ok(payload),
                Err(err) if attempt < self.retry_count && is_transient(&err) => {
                    attempt += 1;
                    tracing::warn!(
                        url = %url,
                        attempt,
                        max = self.retry_count,
                        error = %err,
                        "archive request failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(&self, url: &Url, params: &[(&str, String)]) -> Result<Value, ApiError> {
        let response = self.http.get(url.clone()).query(params).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

fn is_transient(err: &ApiError) -> bool {
    match err {
        ApiError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
        ApiError::Status { status, .. } => *status >= 500,
        _ => false,
    }
}

#[async_trait]
impl ChatlogSource for HttpChatlogSource {
    async fn fetch_messages(&self, query: &ChatlogQuery) -> Result<Vec<Message>, ApiError> {
        let params = [
            ("talker", query.conversation_id.clone()),
            ("time", query.range.to_string()),
            ("limit", query.limit.to_string()),
            ("offset", query.offset.to_string()),
            ("format", "json".to_string()),
        ];
        let payload = self.get_json(CHATLOG_PATH, &params).await?;
        let messages = decode_messages(payload, &self.zone, &query.conversation_id)?;
        tracing::debug!(
            conversation = %query.conversation_id,
            range = %query.range,
            offset = query.offset,
            count = messages.len(),
            "fetched chatlog page"
        );
        Ok(messages)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        let payload = self
            .get_json(SESSION_PATH, &[("format", "json".to_string())])
            .await?;
        decode_conversations(payload, &self.zone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatlog_core::CivilDateRange;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned response per connection, in order, and records request lines.
    async fn serve(
        responses: Vec<(u16, &'static str)>,
    ) -> (String, Arc<AtomicUsize>, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let handle = tokio::spawn(async move {
            let mut request_lines = Vec::new();
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.expect("accept");
                let mut buf = vec![0u8; 4096];
                let read = socket.read(&mut buf).await.expect("read request");
                let request = String::from_utf8_lossy(&buf[..read]).to_string();
                request_lines.push(request.lines().next().unwrap_or_default().to_string());
                counter.fetch_add(1, Ordering::SeqCst);

                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.expect("write response");
                socket.shutdown().await.ok();
            }
            request_lines
        });

        (format!("http://{addr}"), hits, handle)
    }

    fn config(base_url: String) -> ApiConfig {
        ApiConfig {
            base_url,
            request_timeout_secs: 5,
            retry_count: 2,
            retry_delay_ms: 10,
        }
    }

    fn query() -> ChatlogQuery {
        let day = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        ChatlogQuery::new("alice", CivilDateRange::new(day - chrono::Duration::days(2), day), 400)
            .with_offset(200)
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let (base, hits, handle) = serve(vec![
            (503, "{}"),
            (
                200,
                concat!(
                    r#"[{"seq":1,"time":"2024-01-10T08:00:00+08:00","talker":"alice","#,
                    r#""sender":"alice","type":1,"content":"hi"}]"#,
                ),
            ),
        ])
        .await;
        let source = HttpChatlogSource::new(&config(base), CivilZone::default()).expect("client");

        let messages = source.fetch_messages(&query()).await.expect("fetched");
        assert_eq!(messages.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let lines = handle.await.expect("server joined");
        assert!(lines[1].starts_with("GET /api/v1/chatlog?"));
        assert!(lines[1].contains("talker=alice"));
        assert!(
            lines[1].contains("time=2024-01-08~2024-01-10")
                || lines[1].contains("time=2024-01-08%7E2024-01-10")
        );
        assert!(lines[1].contains("limit=400"));
        assert!(lines[1].contains("offset=200"));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (base, hits, _handle) = serve(vec![(404, r#"{"message":"no such talker"}"#)]).await;
        let source = HttpChatlogSource::new(&config(base), CivilZone::default()).expect("client");

        let err = source.fetch_messages(&query()).await.expect_err("404 fails");
        assert!(matches!(err, ApiError::Status { status: 404, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lists_conversations() {
        let (base, _hits, _handle) = serve(vec![(
            200,
            concat!(
                r#"{"items":[{"userName":"alice","nOrder":1,"nickName":"Alice","#,
                r#""content":"hey","nTime":"2024-01-10T08:05:00+08:00"}]}"#,
            ),
        )])
        .await;
        let source = HttpChatlogSource::new(&config(base), CivilZone::default()).expect("client");

        let conversations = source.list_conversations().await.expect("listed");
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].display_name, "Alice");
    }
}
