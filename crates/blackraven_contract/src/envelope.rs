use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type EventId = String;
pub type TransferId = String;
pub type OwnerId = String;
pub type PlatformName = String;
pub type EventName = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Dispatching,
    Sent,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatching => "dispatching",
            Self::Sent => "sent",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "dispatching" => Some(Self::Dispatching),
            "sent" => Some(Self::Sent),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Status change pushed to the owner's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferEventEnvelope {
    pub event_id: EventId,
    pub event: EventName,
    pub sent_at: DateTime<Utc>,
    pub owner_id: OwnerId,
    pub transfer_id: TransferId,
    pub status: Option<TransferStatus>,
    pub payload: Value,
}

impl TransferEventEnvelope {
    pub fn new(
        event: impl Into<EventName>,
        owner_id: impl Into<OwnerId>,
        transfer_id: impl Into<TransferId>,
        status: Option<TransferStatus>,
        payload: Value,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            event: event.into(),
            sent_at: Utc::now(),
            owner_id: owner_id.into(),
            transfer_id: transfer_id.into(),
            status,
            payload,
        }
    }
}
