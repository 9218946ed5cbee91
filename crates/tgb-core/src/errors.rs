use std::time::Duration;

/// Core error type for the bot client.
///
/// Adapter crates map their specific errors into this type so the scheduler can
/// decide consistently what is retried, what is slept on and what bubbles up.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server asked us to back off (`parameters.retry_after`).
    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// Network failure or an HTTP status that carries no API envelope.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("api error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("timed out waiting for an answer")]
    Timeout,

    #[error("forbidden")]
    ForbiddenByScope,

    #[error("invalid sub id: {0}")]
    InvalidSubId(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap the error with the operation it happened in.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all context layers stripped.
    pub fn root(&self) -> &Error {
        let mut err = self;
        while let Error::Context { source, .. } = err {
            err = source;
        }
        err
    }

    /// Errors that retrying the same request can never fix. The server has
    /// already judged an `Api` error (bad request, forbidden, not found).
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.root(),
            Error::Api { .. }
                | Error::Encoding(_)
                | Error::Cancelled
                | Error::Config(_)
                | Error::InvalidSubId(_)
                | Error::Parse(_)
                | Error::ForbiddenByScope
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self.root() {
            Error::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
