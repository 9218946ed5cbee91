use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{errors::Error, Result};

/// Hexagonal port for the Bot API transport.
///
/// Implementations are stateless callers: they POST `body` to `method`, unwrap the
/// response envelope and hand back the raw `result`. Envelope failures surface as
/// `Error::RateLimited` / `Error::Api`, everything else as `Error::Transport`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn invoke(&self, method: &str, body: &Body) -> Result<Value>;
}

/// Decode a `result` value into the method's return type.
pub fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Json(e).context(format!("decode {method}")))
}

/// A fully encoded request, reusable across retries.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: &'static str,
    pub body: Body,
}

/// Request body. `Multipart` is used whenever a local file is attached.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Json(Value),
    Multipart {
        fields: Vec<(String, String)>,
        files: Vec<(String, FilePart)>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct FilePart {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub data: FileData,
}

/// File contents that can be opened again on every attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum FileData {
    Bytes(Arc<[u8]>),
    Path(PathBuf),
}

impl Body {
    /// Build a body from a JSON object, switching to multipart when files are attached.
    ///
    /// Scalar fields are sent verbatim; nested objects and arrays are sent as JSON
    /// strings, which is how the Bot API expects them in form bodies.
    pub fn new(params: Value, files: Vec<(String, FilePart)>) -> Result<Self> {
        if files.is_empty() {
            return Ok(Body::Json(params));
        }

        let Value::Object(map) = params else {
            return Err(Error::Encoding(
                "multipart body requires an object".to_string(),
            ));
        };

        let mut fields = Vec::with_capacity(map.len());
        for (name, value) in map {
            let text = match value {
                Value::Null => continue,
                Value::String(s) => s,
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                other @ (Value::Array(_) | Value::Object(_)) => serde_json::to_string(&other)?,
            };
            fields.push((name, text));
        }

        Ok(Body::Multipart { fields, files })
    }

    pub fn empty() -> Self {
        Body::Json(Value::Object(Default::default()))
    }

    /// Names of all top-level fields, sorted.
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self {
            Body::Json(Value::Object(map)) => map.keys().cloned().collect(),
            Body::Json(_) => Vec::new(),
            Body::Multipart { fields, files } => fields
                .iter()
                .map(|(k, _)| k.clone())
                .chain(files.iter().map(|(k, _)| k.clone()))
                .collect(),
        };
        names.sort();
        names
    }
}
