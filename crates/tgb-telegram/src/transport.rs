//! Bot API transport over HTTPS (reqwest).

use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use tgb_core::{
    config::Config,
    errors::Error,
    messaging::port::{Body, FileData, FilePart, Transport},
    Result,
};

/// Added to the long-poll timeout so the HTTP client never gives up first.
const HTTP_TIMEOUT_SLACK: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    api_url: String,
    token: String,
    accepted_status_codes: Vec<u16>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("api_url", &self.api_url)
            .field("token", &"<redacted>")
            .field("accepted_status_codes", &self.accepted_status_codes)
            .finish()
    }
}

impl HttpTransport {
    pub fn new(cfg: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.long_poll_timeout_secs) + HTTP_TIMEOUT_SLACK)
            .build()
            .map_err(|e| Error::Config(format!("http client build failed: {e}")))?;
        Ok(Self {
            http,
            api_url: cfg.api_url.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
            accepted_status_codes: cfg.accepted_status_codes.clone(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_url, self.token)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn invoke(&self, method: &str, body: &Body) -> Result<Value> {
        let req = self.http.post(self.method_url(method));
        let req = match body {
            Body::Json(value) => req.json(value),
            Body::Multipart { fields, files } => req.multipart(build_form(fields, files).await?),
        };

        // reqwest errors carry the URL, which carries the token.
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Transport(e.without_url().to_string()))?;

        let status = resp.status().as_u16();
        if !self.accepted_status_codes.contains(&status) {
            return Err(Error::Transport(format!(
                "{method}: unexpected HTTP status {status}"
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Transport(e.without_url().to_string()))?;
        debug!(method, status, len = bytes.len(), "Bot API response");
        parse_envelope(&bytes)
    }
}

/// Build a fresh form. `Path` parts are read again on every call so a retried
/// request uploads the file from the start.
async fn build_form(fields: &[(String, String)], files: &[(String, FilePart)]) -> Result<Form> {
    let mut form = Form::new();
    for (name, value) in fields {
        form = form.text(name.clone(), value.clone());
    }

    for (name, file) in files {
        let bytes = match &file.data {
            FileData::Bytes(data) => data.to_vec(),
            FileData::Path(path) => tokio::fs::read(path).await.map_err(|e| {
                Error::Io(e).context(format!("read upload {}", path.display()))
            })?,
        };
        let mut part = Part::bytes(bytes).file_name(file.file_name.clone());
        if let Some(mime) = &file.mime_type {
            part = part
                .mime_str(mime)
                .map_err(|e| Error::Encoding(format!("invalid mime type {mime:?}: {e}")))?;
        }
        form = form.part(name.clone(), part);
    }

    Ok(form)
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
    #[serde(default)]
    migrate_to_chat_id: Option<i64>,
}

/// Unwrap the `{ok, result | error_code, description, parameters}` envelope.
pub fn parse_envelope(bytes: &[u8]) -> Result<Value> {
    let env: Envelope = serde_json::from_slice(bytes)
        .map_err(|e| Error::Transport(format!("invalid response body: {e}")))?;

    if env.ok {
        return Ok(env.result.unwrap_or(Value::Null));
    }

    let params = env.parameters;
    if let Some(secs) = params.as_ref().and_then(|p| p.retry_after) {
        return Err(Error::RateLimited {
            retry_after: Duration::from_secs(secs),
        });
    }

    let mut description = env
        .description
        .unwrap_or_else(|| "unknown error".to_string());
    if let Some(id) = params.and_then(|p| p.migrate_to_chat_id) {
        description.push_str(&format!(" (migrated to chat {id})"));
    }
    Err(Error::Api {
        code: env.error_code.unwrap_or_default(),
        description,
    })
}
