//! Flood-control-aware send scheduler.
//!
//! Every outgoing request passes through up to two gates:
//! - the recipient gate, once the recipient's chat type is known;
//! - the global gate, shared by all requests of the bot.
//!
//! Rate-limit replies are slept on for exactly the advertised time and do not
//! consume the retry budget. Other transient failures back off exponentially.

use std::{
    collections::HashMap,
    iter,
    sync::{Arc, RwLock},
    time::Duration,
};

use serde_json::Value;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    domain::ChatRef,
    messaging::{
        gate::Gate,
        payload::{Media, Payload},
        port::{decode, Body, Request, Transport},
        types::{Chat, Message, SendOptions},
    },
    Error, Result,
};

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    cfg: Config,
    transport: Arc<dyn Transport>,
    global: Gate,
    /// Recipient gates. A chat's id and username map to the same `Arc<Gate>`.
    slots: RwLock<HashMap<ChatRef, Arc<Gate>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// What a delivery learned besides its result.
enum Outcome {
    Delivered(Value),
    /// The recipient had no gate yet; `chat` is how the server described it.
    FirstContact { result: Value, chat: Chat },
}

impl Scheduler {
    pub fn new(transport: Arc<dyn Transport>, cfg: Config) -> Self {
        let global = Gate::new(cfg.pacing.global_min_interval);
        Self {
            inner: Arc::new(SchedulerInner {
                cfg,
                transport,
                global,
                slots: RwLock::new(HashMap::new()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    /// Send a single message or media item.
    pub async fn send(
        &self,
        chat: &ChatRef,
        payload: &Payload,
        opts: &SendOptions,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let request = payload
            .encode(chat, opts)
            .map_err(|e| e.context(format!("{} to {chat}", payload.method())))?;
        let method = request.method;
        let value = self.spawn(Some(chat.clone()), request, cancel).await?;
        decode(method, value)
    }

    /// Send an album. The server answers with one message per item.
    pub async fn send_group(
        &self,
        chat: &ChatRef,
        media: Vec<Media>,
        opts: &SendOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        let payload = Payload::MediaGroup(media);
        let request = payload
            .encode(chat, opts)
            .map_err(|e| e.context(format!("sendMediaGroup to {chat}")))?;
        let value = self.spawn(Some(chat.clone()), request, cancel).await?;
        decode("sendMediaGroup", value)
    }

    /// Invoke a method that is paced by the global gate only.
    pub async fn call_global(
        &self,
        method: &'static str,
        body: Body,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.spawn(None, Request { method, body }, cancel).await
    }

    /// Cancel every pending send and wait for their tasks to finish.
    pub async fn shutdown(&self) {
        info!(pending = self.inner.tracker.len(), "Scheduler shutting down");
        self.inner.tracker.close();
        self.inner.shutdown.cancel();
        self.inner.tracker.wait().await;
    }

    async fn spawn(
        &self,
        chat: Option<ChatRef>,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let label = match &chat {
            Some(chat) => format!("{} to {chat}", request.method),
            None => request.method.to_string(),
        };
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Cancelled.context(label));
        }

        let inner = self.inner.clone();
        let caller = cancel.clone();
        let handle = self.inner.tracker.spawn(async move {
            let shutdown = inner.shutdown.clone();
            let outcome = tokio::select! {
                biased;
                _ = caller.cancelled() => Err(Error::Cancelled),
                r = inner.deliver(chat.as_ref(), &request, &shutdown) => r,
            };

            match outcome {
                Ok(Outcome::Delivered(result)) => Ok(result),
                Ok(Outcome::FirstContact { result, chat: observed }) => {
                    if let Some(requested) = &chat {
                        inner.install(requested, &observed);
                    }
                    Ok(result)
                }
                Err(e) => Err(e.context(label)),
            }
        });

        handle
            .await
            .map_err(|e| Error::Transport(format!("send task failed: {e}")))?
    }
}

impl SchedulerInner {
    async fn deliver(
        &self,
        chat: Option<&ChatRef>,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let slot = chat.and_then(|c| self.slot(c));

        let _recipient = match &slot {
            Some(gate) => Some(gate.acquire(cancel).await?),
            None => None,
        };
        let _global = self.global.acquire(cancel).await?;

        let result = self.invoke_with_retry(request, cancel).await?;
        if slot.is_some() || chat.is_none() {
            return Ok(Outcome::Delivered(result));
        }

        Ok(match observed_chat(&result) {
            Some(chat) => Outcome::FirstContact { result, chat },
            None => Outcome::Delivered(result),
        })
    }

    async fn invoke_with_retry(&self, request: &Request, cancel: &CancellationToken) -> Result<Value> {
        let mut attempt = 0u32;
        loop {
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                r = self.transport.invoke(request.method, &request.body) => r,
            };
            let err = match res {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if let Some(wait) = err.retry_after() {
                debug!(method = request.method, ?wait, "Rate limited, sleeping");
                sleep(wait, cancel).await?;
                continue;
            }
            if err.is_permanent() {
                return Err(err);
            }

            attempt += 1;
            if attempt > self.cfg.max_retries {
                return Err(err);
            }
            let delay = self.cfg.backoff(attempt);
            warn!(
                method = request.method,
                attempt,
                ?delay,
                "Request failed, retrying: {err}"
            );
            sleep(delay, cancel).await?;
        }
    }

    fn slot(&self, chat: &ChatRef) -> Option<Arc<Gate>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.get(&slot_key(chat)).cloned()
    }

    /// Create the recipient gate after first contact. Concurrent first sends may
    /// race here; whoever takes the lock second reuses the existing gate.
    fn install(&self, requested: &ChatRef, chat: &Chat) {
        let refs = chat.refs();
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());

        let gate = refs
            .iter()
            .chain(iter::once(requested))
            .find_map(|r| slots.get(&slot_key(r)).cloned())
            .unwrap_or_else(|| {
                let interval = self.cfg.pacing.recipient_min_interval(chat.kind);
                debug!(chat = %chat.id, kind = ?chat.kind, ?interval, "Installing recipient gate");
                Arc::new(Gate::cooling(interval))
            });

        for r in refs.iter().chain(iter::once(requested)) {
            slots
                .entry(slot_key(r))
                .or_insert_with(|| gate.clone());
        }
    }
}

/// Usernames are case-insensitive.
fn slot_key(chat: &ChatRef) -> ChatRef {
    match chat {
        ChatRef::Id(id) => ChatRef::Id(*id),
        ChatRef::Username(name) => ChatRef::Username(name.to_lowercase()),
    }
}

/// The chat a send result was delivered to. Albums report the first message's chat.
fn observed_chat(result: &Value) -> Option<Chat> {
    let message = match result {
        Value::Array(items) => items.first()?,
        other => other,
    };
    serde_json::from_value(message.get("chat")?.clone()).ok()
}

async fn sleep(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
