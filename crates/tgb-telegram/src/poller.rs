//! Long-poll update loop.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use tgb_core::messaging::{
    port::{decode, Body, Transport},
    types::Update,
};

/// Receives updates in `update_id` order, each on its own task.
#[async_trait]
pub trait UpdateSink: Send + Sync + 'static {
    async fn handle(&self, update: Update);
}

pub struct Poller {
    transport: Arc<dyn Transport>,
    timeout_secs: u64,
    limit: Option<u32>,
    allowed_updates: Vec<String>,
    offset: i64,
    tracker: TaskTracker,
}

impl Poller {
    pub fn new(transport: Arc<dyn Transport>, timeout_secs: u64) -> Self {
        Self {
            transport,
            timeout_secs,
            limit: None,
            allowed_updates: Vec::new(),
            offset: 0,
            tracker: TaskTracker::new(),
        }
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn allowed_updates(mut self, kinds: Vec<String>) -> Self {
        self.allowed_updates = kinds;
        self
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Poll until `cancel` fires, then wait for in-flight handlers.
    pub async fn run(mut self, sink: Arc<dyn UpdateSink>, cancel: CancellationToken) {
        info!(timeout = self.timeout_secs, "Update poller started");
        while !cancel.is_cancelled() {
            if !self.poll_once(&sink, &cancel).await {
                break;
            }
        }
        self.tracker.close();
        self.tracker.wait().await;
        info!(offset = self.offset, "Update poller stopped");
    }

    /// One `getUpdates` round. Returns `false` once cancelled.
    async fn poll_once(&mut self, sink: &Arc<dyn UpdateSink>, cancel: &CancellationToken) -> bool {
        let body = self.request_body();
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            r = self.transport.invoke("getUpdates", &body) => r,
        };

        match res.and_then(|v| decode::<Vec<Value>>("getUpdates", v)) {
            Ok(batch) => {
                for raw in batch {
                    let Some(id) = raw.get("update_id").and_then(Value::as_i64) else {
                        warn!("Dropping update without update_id");
                        continue;
                    };
                    // Replays of an already handled batch are dropped.
                    if id < self.offset {
                        debug!(update_id = id, offset = self.offset, "Skipping stale update");
                        continue;
                    }
                    self.offset = id + 1;
                    match decode::<Update>("getUpdates", raw) {
                        Ok(update) => {
                            let sink = sink.clone();
                            self.tracker.spawn(async move { sink.handle(update).await });
                        }
                        Err(e) => warn!(update_id = id, "Dropping undecodable update: {e}"),
                    }
                }
                true
            }
            Err(e) => {
                warn!("getUpdates failed: {e}");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    _ = tokio::time::sleep(Duration::from_secs(self.timeout_secs)) => true,
                }
            }
        }
    }

    fn request_body(&self) -> Body {
        let mut body = json!({
            "offset": self.offset,
            "timeout": self.timeout_secs,
        });
        if let Some(limit) = self.limit {
            body["limit"] = json!(limit);
        }
        if !self.allowed_updates.is_empty() {
            body["allowed_updates"] = json!(self.allowed_updates);
        }
        Body::Json(body)
    }
}
