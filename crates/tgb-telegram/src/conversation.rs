//! Question/answer correlation.
//!
//! A waiter is registered under the prompt message and completed by the first
//! message that replies to it. Waiters remove themselves when dropped, so a
//! timed-out or cancelled `ask` leaves nothing behind.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::Duration,
};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tgb_core::{
    domain::MessageRef,
    messaging::types::Message,
    Error, Result,
};

#[derive(Default)]
pub struct Conversations {
    waiters: RwLock<HashMap<MessageRef, (u64, oneshot::Sender<Message>)>>,
    next_token: AtomicU64,
}

impl Conversations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for replies to `prompt`. A previous waiter on the same prompt is replaced.
    pub fn register(&self, prompt: MessageRef) -> Waiter<'_> {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.waiters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(prompt, (token, tx));
        Waiter {
            owner: self,
            prompt,
            token,
            rx,
        }
    }

    /// Hand `msg` to the waiter it replies to. Returns `false` when nobody was waiting.
    pub fn answer(&self, msg: &Message) -> bool {
        let Some(reply_to) = msg.reply_to_id() else {
            return false;
        };
        let prompt = MessageRef {
            chat_id: msg.chat.id,
            message_id: reply_to,
        };

        if !self.read_waiters().contains_key(&prompt) {
            return false;
        }
        let waiter = self
            .waiters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&prompt);
        match waiter {
            Some((_, tx)) => tx.send(msg.clone()).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.read_waiters().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_waiters(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<MessageRef, (u64, oneshot::Sender<Message>)>> {
        self.waiters.read().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct Waiter<'a> {
    owner: &'a Conversations,
    prompt: MessageRef,
    token: u64,
    rx: oneshot::Receiver<Message>,
}

impl Waiter<'_> {
    pub async fn wait(mut self, timeout: Duration, cancel: &CancellationToken) -> Result<Message> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            // Polled before the deadline: an answer already taken from the table wins.
            // A replaced waiter sees its sender dropped.
            res = &mut self.rx => res.map_err(|_| Error::Cancelled),
            _ = tokio::time::sleep(timeout) => {
                debug!(prompt = %self.prompt.message_id, "Answer timed out");
                Err(Error::Timeout)
            }
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        let mut waiters = self
            .owner
            .waiters
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if waiters
            .get(&self.prompt)
            .is_some_and(|(token, _)| *token == self.token)
        {
            waiters.remove(&self.prompt);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tgb_core::domain::{ChatId, MessageId};

    use super::*;

    fn reply(to: Option<i64>) -> Message {
        let mut v = json!({"message_id": 50, "date": 0, "chat": {"id": 1, "type": "private"}, "text": "Bob"});
        if let Some(id) = to {
            v["reply_to_message"] = json!({"message_id": id, "date": 0, "chat": {"id": 1, "type": "private"}});
        }
        serde_json::from_value(v).unwrap()
    }

    fn prompt(id: i64) -> MessageRef {
        MessageRef {
            chat_id: ChatId(1),
            message_id: MessageId(id),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reply_completes_the_waiter() {
        let conv = Conversations::new();
        let waiter = conv.register(prompt(7));

        assert!(!conv.answer(&reply(None)));
        assert!(!conv.answer(&reply(Some(8))));
        assert!(conv.answer(&reply(Some(7))));

        let msg = waiter
            .wait(Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(msg.text.as_deref(), Some("Bob"));
        assert!(conv.is_empty());
        // Consumed: a second reply goes to the normal dispatcher.
        assert!(!conv.answer(&reply(Some(7))));
    }

    #[tokio::test(start_paused = true)]
    async fn answer_at_the_deadline_is_not_lost() {
        let conv = Conversations::new();
        let waiter = conv.register(prompt(7));
        assert!(conv.answer(&reply(Some(7))));

        let msg = waiter
            .wait(Duration::ZERO, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(msg.text.as_deref(), Some("Bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_the_waiter() {
        let conv = Conversations::new();
        let err = conv
            .register(prompt(7))
            .wait(Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(conv.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_waiter_does_not_remove_its_successor() {
        let conv = Conversations::new();
        let first = conv.register(prompt(7));
        let second = conv.register(prompt(7));

        let cancel = CancellationToken::new();
        assert!(matches!(
            first.wait(Duration::from_secs(1), &cancel).await,
            Err(Error::Cancelled)
        ));
        assert_eq!(conv.len(), 1);

        assert!(conv.answer(&reply(Some(7))));
        assert!(second.wait(Duration::from_secs(1), &cancel).await.is_ok());
    }
}
