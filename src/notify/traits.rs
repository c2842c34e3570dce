use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::process::BoxFuture;
use crate::prompt::PromptEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub channel: String,
    pub prompt_id: String,
    pub delivered_at: DateTime<Utc>,
}

/// A human answer arriving from a channel. `prompt_ref` is a full prompt id
/// or a unique prefix of one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundReply {
    pub prompt_ref: String,
    pub value: String,
    pub channel: String,
}

/// Core notification trait. Implement for any way of reaching a human
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Tell a human a prompt needs an answer.
    fn send<'a>(&'a self, event: &'a PromptEvent) -> BoxFuture<'a, anyhow::Result<DeliveryReceipt>>;

    /// Operator-visible alert (failed injection, integrity halt, ...).
    fn alert<'a>(&'a self, message: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Feed replies into `sink` until `cancel` fires (long-running).
    fn listen(
        &self,
        sink: mpsc::Sender<InboundReply>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, anyhow::Result<()>>;
}
