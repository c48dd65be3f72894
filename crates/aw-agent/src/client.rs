// client.rs — Transport to the authority.
//
// `AuthorityClient` is the seam the sync loop talks through. The HTTP
// implementation posts JSON to the authority API and reads pushed deltas
// from its server-sent-events stream.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use aw_audit::AuditBatch;
use aw_rules::{
    Heartbeat, HeartbeatAck, PullRequest, PullResponse, PushNotice, Registration,
    RegistrationAck,
};

use crate::error::AgentError;

/// Stream of pushed deltas. Ends when the connection drops.
pub type PushStream = BoxStream<'static, Result<PushNotice, AgentError>>;

#[async_trait]
pub trait AuthorityClient: Send + Sync {
    async fn register(&self, registration: &Registration) -> Result<RegistrationAck, AgentError>;

    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, AgentError>;

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<HeartbeatAck, AgentError>;

    async fn upload_audit(&self, batch: &AuditBatch) -> Result<(), AgentError>;

    async fn subscribe(&self, endpoint_id: &str) -> Result<PushStream, AgentError>;
}

/// JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAuthorityClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpAuthorityClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(delivery)?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, AgentError> {
        let response = self
            .http
            .post(self.url(path))
            .timeout(Duration::from_secs(30))
            .json(body)
            .send()
            .await
            .map_err(delivery)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::Delivery(format!(
                "POST {} returned {}: {}",
                path, status, text
            )));
        }
        response.json().await.map_err(delivery)
    }
}

fn delivery(e: reqwest::Error) -> AgentError {
    AgentError::Delivery(e.to_string())
}

#[async_trait]
impl AuthorityClient for HttpAuthorityClient {
    async fn register(&self, registration: &Registration) -> Result<RegistrationAck, AgentError> {
        self.post("/agents/register", registration).await
    }

    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, AgentError> {
        self.post("/agents/pull", request).await
    }

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<HeartbeatAck, AgentError> {
        self.post("/agents/heartbeat", heartbeat).await
    }

    async fn upload_audit(&self, batch: &AuditBatch) -> Result<(), AgentError> {
        let _: serde_json::Value = self.post("/audit", batch).await?;
        Ok(())
    }

    async fn subscribe(&self, endpoint_id: &str) -> Result<PushStream, AgentError> {
        let response = self
            .http
            .get(self.url("/agents/stream"))
            .query(&[("endpoint_id", endpoint_id)])
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(delivery)?
            .error_for_status()
            .map_err(delivery)?;

        let bytes = Box::pin(response.bytes_stream());
        let notices = stream::unfold(
            (bytes, SseBuffer::default()),
            |(mut bytes, mut buffer)| async move {
                loop {
                    if let Some(data) = buffer.next_event() {
                        let notice = serde_json::from_str::<PushNotice>(&data)
                            .map_err(AgentError::from);
                        return Some((notice, (bytes, buffer)));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => buffer.push(&chunk),
                        Some(Err(e)) => return Some((Err(delivery(e)), (bytes, buffer))),
                        None => return None,
                    }
                }
            },
        );
        Ok(notices.boxed())
    }
}

/// Incremental parser for `text/event-stream` bodies.
#[derive(Debug, Default)]
pub(crate) struct SseBuffer {
    pending: String,
}

impl SseBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.pending
            .push_str(&String::from_utf8_lossy(chunk).replace("\r\n", "\n"));
    }

    /// The `data` payload of the next complete event, skipping comments
    /// and events without data.
    pub(crate) fn next_event(&mut self) -> Option<String> {
        while let Some(end) = self.pending.find("\n\n") {
            let block: String = self.pending.drain(..end + 2).collect();
            let data: Vec<&str> = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|d| d.strip_prefix(' ').unwrap_or(d))
                .collect();
            if !data.is_empty() {
                return Some(data.join("\n"));
            }
        }
        None
    }
}
