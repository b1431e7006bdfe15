//! Thin HTTP client for the permitd API.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize)]
struct ScanRequest<'a> {
    id: &'a str,
    images: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanResponse {
    is_register_completed: bool,
}

#[derive(Serialize)]
struct AuthenticateRequest<'a> {
    id: &'a str,
    image: &'a str,
}

#[derive(Deserialize)]
struct AuthenticateResponse {
    passcode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Health {
    pub status: String,
    pub version: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

pub struct PermitClient {
    http: reqwest::Client,
    base: String,
}

impl PermitClient {
    pub fn new(server: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: server.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    /// Register `images` (base64) for `id`. Returns the server's completion flag.
    pub async fn scan(&self, id: &str, images: &[String]) -> Result<bool> {
        let resp = self
            .http
            .post(self.url("/scan"))
            .json(&ScanRequest { id, images })
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.base))?;
        let body: ScanResponse = read_json(resp).await?;
        Ok(body.is_register_completed)
    }

    /// Authenticate `image` (base64) as `id`. `None` means the face was not recognized.
    pub async fn authenticate(&self, id: &str, image: &str) -> Result<Option<String>> {
        let resp = self
            .http
            .post(self.url("/authenticate"))
            .json(&AuthenticateRequest { id, image })
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.base))?;
        let body: AuthenticateResponse = read_json(resp).await?;
        Ok(body.passcode)
    }

    pub async fn health(&self) -> Result<Health> {
        let resp = self
            .http
            .get(self.url("/health"))
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.base))?;
        read_json(resp).await
    }
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return resp.json().await.context("malformed response body");
    }
    let body = resp.text().await.unwrap_or_default();
    bail!("{}", describe_error(status.as_u16(), &body))
}

/// Human-readable summary of an error response.
fn describe_error(status: u16, body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(err) => format!("server returned {status} {}: {}", err.error.code, err.error.message),
        Err(_) if body.trim().is_empty() => format!("server returned {status}"),
        Err(_) => format!("server returned {status}: {}", body.trim()),
    }
}

/// Read an image file and base64-encode its raw bytes.
pub fn encode_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(STANDARD.encode(bytes))
}
