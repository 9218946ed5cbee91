use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::warn;

use crate::{richtext::media::MediaRef, Result};

/// Sink for rendered pages and media.
#[async_trait]
pub trait Receiver: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<()>;

    /// `caption` is HTML. Implementations await the media's resolution themselves.
    async fn send_media(&self, media: &MediaRef, caption: Option<&str>) -> Result<()>;
}

/// One delivered item, in delivery order.
#[derive(Clone, Debug)]
pub enum Output {
    Text(String),
    Media {
        media: MediaRef,
        caption: Option<String>,
    },
}

impl Output {
    pub fn text(&self) -> Option<&str> {
        match self {
            Output::Text(t) => Some(t),
            Output::Media { .. } => None,
        }
    }

    pub fn caption(&self) -> Option<&str> {
        match self {
            Output::Text(_) => None,
            Output::Media { caption, .. } => caption.as_deref(),
        }
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct BufferReceiver {
    outputs: Mutex<Vec<Output>>,
}

impl BufferReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outputs(&self) -> Vec<Output> {
        self.outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Text pages only.
    pub fn pages(&self) -> Vec<String> {
        self.outputs()
            .iter()
            .filter_map(|o| o.text().map(str::to_string))
            .collect()
    }

    fn push(&self, output: Output) {
        self.outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(output);
    }
}

#[async_trait]
impl Receiver for BufferReceiver {
    async fn send_text(&self, text: &str) -> Result<()> {
        self.push(Output::Text(text.to_string()));
        Ok(())
    }

    async fn send_media(&self, media: &MediaRef, caption: Option<&str>) -> Result<()> {
        self.push(Output::Media {
            media: media.clone(),
            caption: caption.map(str::to_string),
        });
        Ok(())
    }
}

/// Fans every item out to several receivers, in order.
///
/// A strict broadcast stops at the first failure; otherwise failures are logged
/// and the remaining receivers still get the item.
pub struct Broadcast {
    receivers: Vec<Arc<dyn Receiver>>,
    strict: bool,
}

impl Broadcast {
    pub fn new(receivers: Vec<Arc<dyn Receiver>>, strict: bool) -> Self {
        Self { receivers, strict }
    }

    fn handle(&self, idx: usize, res: Result<()>) -> Result<()> {
        match res {
            Ok(()) => Ok(()),
            Err(e) if self.strict => Err(e),
            Err(e) => {
                warn!(receiver = idx, "Broadcast delivery failed: {e}");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Receiver for Broadcast {
    async fn send_text(&self, text: &str) -> Result<()> {
        for (idx, r) in self.receivers.iter().enumerate() {
            self.handle(idx, r.send_text(text).await)?;
        }
        Ok(())
    }

    async fn send_media(&self, media: &MediaRef, caption: Option<&str>) -> Result<()> {
        for (idx, r) in self.receivers.iter().enumerate() {
            self.handle(idx, r.send_media(media, caption).await)?;
        }
        Ok(())
    }
}
