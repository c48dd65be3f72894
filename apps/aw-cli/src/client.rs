// client.rs — Blocking JSON client for the authority API.

use std::time::Duration;

use anyhow::Context;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Error body returned by the authority on any non-2xx response.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub reason: Option<String>,
}

pub struct AuthorityApi {
    base_url: String,
    http: Client,
}

impl AuthorityApi {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn get<R: DeserializeOwned>(&self, path: &str) -> anyhow::Result<R> {
        self.send(path, self.http.get(self.url(path)))
    }

    pub fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> anyhow::Result<R> {
        self.send(path, self.http.post(self.url(path)).json(body))
    }

    pub fn delete<R: DeserializeOwned>(&self, path: &str) -> anyhow::Result<R> {
        self.send(path, self.http.delete(self.url(path)))
    }

    fn send<R: DeserializeOwned>(&self, path: &str, request: RequestBuilder) -> anyhow::Result<R> {
        tracing::debug!(path, "authority request");
        let response = request
            .send()
            .with_context(|| format!("cannot reach authority at {}", self.base_url))?;
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .with_context(|| format!("unexpected response from {}", path));
        }
        let text = response.text().unwrap_or_default();
        Err(describe_failure(status, &text))
    }
}

/// Turn an error response into a message an operator can act on.
pub fn describe_failure(status: StatusCode, text: &str) -> anyhow::Error {
    let Ok(body) = serde_json::from_str::<ErrorBody>(text) else {
        return anyhow::anyhow!("authority returned {}: {}", status, text.trim());
    };
    match body.kind.as_str() {
        "conflict" => anyhow::anyhow!(
            "{}\nThe object changed since you read it. Re-read it and retry.",
            body.message
        ),
        "stale_selection" => anyhow::anyhow!("{}", body.message),
        _ => anyhow::anyhow!("{} ({})", body.message, body.kind),
    }
}
