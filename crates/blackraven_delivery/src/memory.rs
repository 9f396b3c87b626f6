use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::mechanism::{DeliveryError, DeliveryMechanism, DeliveryReceipt, DeliveryRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub transfer_id: String,
    pub platform: String,
    pub recipient: String,
    pub filename: String,
    pub payload_len: usize,
    pub message: Option<String>,
}

/// Keeps every handed-over message in memory instead of sending it.
/// Recipients added with [`InMemoryDelivery::fail_for`] are refused.
#[derive(Debug, Default)]
pub struct InMemoryDelivery {
    delivered: Mutex<Vec<DeliveredMessage>>,
    failing: Mutex<BTreeSet<String>>,
}

impl InMemoryDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, recipient: &str) {
        lock(&self.failing).insert(recipient.to_string());
    }

    pub fn recover(&self, recipient: &str) {
        lock(&self.failing).remove(recipient);
    }

    pub fn delivered(&self) -> Vec<DeliveredMessage> {
        lock(&self.delivered).clone()
    }

    pub fn delivered_to(&self, recipient: &str) -> usize {
        lock(&self.delivered)
            .iter()
            .filter(|m| m.recipient == recipient)
            .count()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl DeliveryMechanism for InMemoryDelivery {
    async fn deliver(&self, request: &DeliveryRequest<'_>) -> Result<DeliveryReceipt, DeliveryError> {
        if lock(&self.failing).contains(request.recipient) {
            return Err(DeliveryError::Transport(format!(
                "recipient {} unreachable",
                request.recipient
            )));
        }

        lock(&self.delivered).push(DeliveredMessage {
            transfer_id: request.transfer_id.to_string(),
            platform: request.platform.to_string(),
            recipient: request.recipient.to_string(),
            filename: request.filename.to_string(),
            payload_len: request.payload.len(),
            message: request.message.map(str::to_string),
        });
        info!(
            transfer_id = %request.transfer_id,
            platform = %request.platform,
            recipient = %request.recipient,
            "transfer recorded by in-memory delivery"
        );

        Ok(DeliveryReceipt {
            reference: format!("memory:{}", Uuid::now_v7()),
            mechanism: self.mechanism_name(),
        })
    }

    fn mechanism_name(&self) -> &'static str {
        "memory"
    }
}
