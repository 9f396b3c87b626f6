use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Identifier the transport handed back for the accepted message.
    pub reference: String,
    pub mechanism: &'static str,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("delivery transport unavailable: {0}")]
    Transport(String),
    #[error("delivery rejected: {0}")]
    Rejected(String),
    #[error("delivery misconfigured: {0}")]
    Configuration(String),
    #[error("no delivery mechanism for platform {0}")]
    UnsupportedPlatform(String),
}

/// Everything a mechanism needs to hand one transfer to one recipient.
#[derive(Debug, Clone)]
pub struct DeliveryRequest<'a> {
    pub transfer_id: &'a str,
    pub platform: &'a str,
    pub recipient: &'a str,
    pub sender: &'a str,
    pub filename: &'a str,
    pub media_type: &'a str,
    pub payload: &'a [u8],
    pub message: Option<&'a str>,
    pub access_url: Option<&'a str>,
}

#[async_trait]
pub trait DeliveryMechanism: Send + Sync {
    async fn deliver(&self, request: &DeliveryRequest<'_>) -> Result<DeliveryReceipt, DeliveryError>;

    fn mechanism_name(&self) -> &'static str;
}

/// Maps a platform tag stored on each recipient entry to its mechanism.
#[derive(Clone, Default)]
pub struct DeliveryRegistry {
    mechanisms: BTreeMap<String, Arc<dyn DeliveryMechanism>>,
}

impl std::fmt::Debug for DeliveryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.mechanisms
                    .iter()
                    .map(|(platform, mechanism)| (platform, mechanism.mechanism_name())),
            )
            .finish()
    }
}

impl DeliveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        platform: impl Into<String>,
        mechanism: Arc<dyn DeliveryMechanism>,
    ) -> &mut Self {
        self.mechanisms
            .insert(platform.into().to_ascii_lowercase(), mechanism);
        self
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn DeliveryMechanism>> {
        self.mechanisms.get(platform).cloned()
    }

    pub fn platforms(&self) -> BTreeSet<String> {
        self.mechanisms.keys().cloned().collect()
    }

    pub async fn deliver(
        &self,
        request: &DeliveryRequest<'_>,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let mechanism = self
            .get(request.platform)
            .ok_or_else(|| DeliveryError::UnsupportedPlatform(request.platform.to_string()))?;
        mechanism.deliver(request).await
    }
}
