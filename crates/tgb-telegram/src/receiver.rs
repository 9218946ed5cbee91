//! Delivers rich-text pages and media to one chat.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tgb_core::{
    domain::ChatRef,
    messaging::{payload::Payload, types::SendOptions},
    richtext::{media::MediaRef, receiver::Receiver},
    Result,
};

use crate::bot::Bot;

pub struct ChatReceiver {
    bot: Bot,
    chat: ChatRef,
    opts: SendOptions,
    cancel: CancellationToken,
}

impl ChatReceiver {
    pub fn new(bot: Bot, chat: ChatRef, cancel: CancellationToken) -> Self {
        Self {
            bot,
            chat,
            opts: SendOptions::default(),
            cancel,
        }
    }

    pub fn options(mut self, opts: SendOptions) -> Self {
        self.opts = opts;
        self
    }
}

#[async_trait]
impl Receiver for ChatReceiver {
    async fn send_text(&self, text: &str) -> Result<()> {
        self.bot
            .send(&self.chat, &Payload::html(text), &self.opts, &self.cancel)
            .await
            .map(|_| ())
    }

    async fn send_media(&self, media: &MediaRef, caption: Option<&str>) -> Result<()> {
        let media = media.get().await?.into_media(caption)?;
        self.bot
            .send(&self.chat, &Payload::Media(media), &self.opts, &self.cancel)
            .await
            .map(|_| ())
    }
}
