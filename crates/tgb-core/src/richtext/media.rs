use std::{fmt, future::Future, time::Duration};

use tokio::sync::watch;
use tracing::warn;

use crate::{
    messaging::payload::{InputSource, Media, MediaType, ParseMode},
    Error, Result,
};

/// A media item ready to be attached to a message.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedMedia {
    pub mime_type: String,
    pub source: InputSource,
    /// Size in bytes, when the resolver learned it.
    pub size: Option<u64>,
}

impl ResolvedMedia {
    pub fn kind(&self) -> MediaType {
        MediaType::from_mime(&self.mime_type)
    }

    /// Build the payload item. Remote sources larger than the server will fetch
    /// are rejected here, uploads are checked when encoded.
    pub fn into_media(self, caption: Option<&str>) -> Result<Media> {
        let kind = self.kind();
        if let (false, Some(size)) = (self.source.is_upload(), self.size) {
            if size > kind.remote_max() {
                return Err(Error::Encoding(format!(
                    "remote {} of {size} bytes exceeds the {} byte fetch limit",
                    kind.name(),
                    kind.remote_max()
                )));
            }
        }

        let mut media = Media::new(kind, self.source);
        media.mime_type = Some(self.mime_type);
        if let Some(caption) = caption.filter(|c| !c.is_empty()) {
            media = media.caption(caption, Some(ParseMode::Html));
        }
        Ok(media)
    }
}

#[derive(Clone, Debug)]
enum Failure {
    Timeout,
    Failed(String),
}

type Slot = Option<std::result::Result<ResolvedMedia, Failure>>;

/// Lazily resolved media. Resolution starts when the reference is created and
/// runs alongside text composition; consumers await it with [`MediaRef::get`].
#[derive(Clone)]
pub struct MediaRef {
    rx: watch::Receiver<Slot>,
}

impl MediaRef {
    /// Spawn `resolve` with its own `deadline`. Must be called inside a tokio runtime.
    pub fn spawn<F>(resolve: F, deadline: Duration) -> Self
    where
        F: Future<Output = Result<ResolvedMedia>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(deadline, resolve).await {
                Ok(Ok(media)) => Ok(media),
                Ok(Err(e)) => {
                    warn!("Media resolution failed: {e}");
                    Err(Failure::Failed(e.to_string()))
                }
                Err(_) => {
                    warn!(?deadline, "Media resolution timed out");
                    Err(Failure::Timeout)
                }
            };
            let _ = tx.send(Some(outcome));
        });
        Self { rx }
    }

    /// An already resolved reference.
    pub fn ready(media: ResolvedMedia) -> Self {
        let (_tx, rx) = watch::channel(Some(Ok(media)));
        Self { rx }
    }

    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub async fn get(&self) -> Result<ResolvedMedia> {
        let mut rx = self.rx.clone();
        let slot = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Cancelled.context("media resolution"))?;
        match slot.as_ref() {
            Some(Ok(media)) => Ok(media.clone()),
            Some(Err(Failure::Timeout)) => Err(Error::Timeout.context("media resolution")),
            Some(Err(Failure::Failed(msg))) => {
                Err(Error::Transport(msg.clone()).context("media resolution"))
            }
            None => Err(Error::Cancelled.context("media resolution")),
        }
    }
}

impl fmt::Debug for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaRef")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo() -> ResolvedMedia {
        ResolvedMedia {
            mime_type: "image/jpeg".into(),
            source: InputSource::Url("https://x/a.jpg".into()),
            size: Some(1000),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_concurrently() {
        let media = MediaRef::spawn(
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(photo())
            },
            Duration::from_secs(10),
        );
        assert!(!media.is_resolved());
        assert_eq!(media.get().await.unwrap(), photo());
        assert!(media.clone().is_resolved());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_turns_into_timeout() {
        let media = MediaRef::spawn(
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(photo())
            },
            Duration::from_secs(5),
        );
        let err = media.get().await.unwrap_err();
        assert!(matches!(err.root(), Error::Timeout));
    }

    #[tokio::test]
    async fn ready_reference_and_oversized_remote() {
        let mut big = photo();
        big.size = Some(6 * 1024 * 1024);
        let media = MediaRef::ready(big).get().await.unwrap();
        assert_eq!(media.kind(), MediaType::Photo);
        assert!(matches!(media.into_media(None), Err(Error::Encoding(_))));

        let ok = photo().into_media(Some("<b>cap</b>")).unwrap();
        assert_eq!(ok.caption.as_deref(), Some("<b>cap</b>"));
        assert_eq!(ok.parse_mode, Some(ParseMode::Html));
    }
}
