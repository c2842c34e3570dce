use anyhow::{Result, bail};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;

use super::traits::{DeliveryReceipt, InboundReply, NotificationChannel};
use crate::process::BoxFuture;
use crate::prompt::PromptEvent;

/// In-memory channel: notifications are kept for inspection and replies
/// are pushed by the caller with [`QueueChannel::reply`].
pub struct QueueChannel {
    sent: Mutex<Vec<PromptEvent>>,
    alerts: Mutex<Vec<String>>,
    sent_signal: Notify,
    failing: AtomicBool,
    alerts_failing: AtomicBool,
    reply_tx: mpsc::UnboundedSender<InboundReply>,
    reply_rx: AsyncMutex<mpsc::UnboundedReceiver<InboundReply>>,
}

impl Default for QueueChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueChannel {
    pub fn new() -> Self {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        Self {
            sent: Mutex::new(Vec::new()),
            alerts: Mutex::new(Vec::new()),
            sent_signal: Notify::new(),
            failing: AtomicBool::new(false),
            alerts_failing: AtomicBool::new(false),
            reply_tx,
            reply_rx: AsyncMutex::new(reply_rx),
        }
    }

    /// Make subsequent deliveries fail (alerts still succeed).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_alerts_failing(&self, failing: bool) {
        self.alerts_failing.store(failing, Ordering::SeqCst);
    }

    pub fn reply(&self, prompt_ref: impl Into<String>, value: impl Into<String>) {
        let _ = self.reply_tx.send(InboundReply {
            prompt_ref: prompt_ref.into(),
            value: value.into(),
            channel: "queue".into(),
        });
    }

    pub fn sent(&self) -> Vec<PromptEvent> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn alerts(&self) -> Vec<String> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until at least `count` prompts were delivered; returns them.
    pub async fn wait_for_sent(&self, count: usize, timeout: Duration) -> Result<Vec<PromptEvent>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.sent_signal.notified();
            let sent = self.sent();
            if sent.len() >= count {
                return Ok(sent);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                bail!("expected {count} notifications, saw {}", sent.len());
            }
        }
    }
}

impl NotificationChannel for QueueChannel {
    fn name(&self) -> &str {
        "queue"
    }

    fn send<'a>(&'a self, event: &'a PromptEvent) -> BoxFuture<'a, Result<DeliveryReceipt>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                bail!("queue channel delivery disabled");
            }
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
            self.sent_signal.notify_waiters();
            Ok(DeliveryReceipt {
                channel: "queue".into(),
                prompt_id: event.id.to_string(),
                delivered_at: Utc::now(),
            })
        })
    }

    fn alert<'a>(&'a self, message: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.alerts_failing.load(Ordering::SeqCst) {
                bail!("queue channel alerts disabled");
            }
            self.alerts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(message.to_string());
            Ok(())
        })
    }

    fn listen(
        &self,
        sink: mpsc::Sender<InboundReply>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut rx = self.reply_rx.lock().await;
            loop {
                let reply = tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    reply = rx.recv() => reply,
                };
                let Some(reply) = reply else { return Ok(()) };
                if sink.send(reply).await.is_err() {
                    return Ok(());
                }
            }
        })
    }
}
