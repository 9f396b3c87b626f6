use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::envelope::{DeliveryStatus, PlatformName, TransferId, TransferStatus};

/// Body of `POST /v1/transfers`.
///
/// Dates stay as strings here so that malformed values surface as field-level
/// validation errors instead of a generic body rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTransferRequest {
    pub filename: String,
    #[serde(default)]
    pub media_type: Option<String>,
    pub payload_base64: String,
    #[serde(default)]
    pub message: Option<String>,
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub recipients: BTreeMap<PlatformName, String>,
    pub deactivation_passphrase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeactivateRequest {
    pub passphrase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryView {
    pub platform: PlatformName,
    pub recipient: String,
    pub status: DeliveryStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub receipt: Option<String>,
    pub delivered_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferView {
    pub transfer_id: TransferId,
    pub filename: String,
    pub media_type: String,
    pub size_bytes: i64,
    pub size_display: String,
    pub message: Option<String>,
    pub start_date: String,
    pub end_date: String,
    pub recipients: BTreeMap<PlatformName, String>,
    pub status: TransferStatus,
    pub created_at: String,
    pub updated_at: String,
    pub sent_at: Option<String>,
    pub time_remaining: String,
    pub failure_reason: Option<String>,
    pub deliveries: Vec<DeliveryView>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipientFailure {
    pub platform: PlatformName,
    pub recipient: String,
    pub error: String,
}

/// Outcome of one dispatch pass over a single transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchSummary {
    pub transfer_id: TransferId,
    pub status: TransferStatus,
    pub delivered: Vec<PlatformName>,
    pub failed: Vec<RecipientFailure>,
    /// Set when retries ran out and the row was closed with failures on record.
    pub exhausted: bool,
}

impl DispatchSummary {
    pub fn fully_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub due: usize,
    pub claimed: usize,
    pub skipped: usize,
    pub sent: usize,
    pub retrying: usize,
    pub exhausted: usize,
    pub errors: usize,
    pub results: Vec<DispatchSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeactivationResponse {
    Deactivated {
        transfer_id: TransferId,
        message: String,
    },
    IncorrectPassphrase {
        transfer_id: TransferId,
        attempts_remaining: u32,
        message: String,
    },
    BruteForceDetected {
        transfer_id: TransferId,
        message: String,
        dispatch: DispatchSummary,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deactivation_response_is_tagged_by_outcome() {
        let response = DeactivationResponse::IncorrectPassphrase {
            transfer_id: "t-1".to_string(),
            attempts_remaining: 1,
            message: "incorrect passphrase, 1 attempt remaining".to_string(),
        };

        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["outcome"], json!("incorrect_passphrase"));
        assert_eq!(value["attempts_remaining"], json!(1));
    }

    #[test]
    fn create_request_defaults_optional_fields() {
        let request: CreateTransferRequest = serde_json::from_value(json!({
            "filename": "notes.txt",
            "payload_base64": "aGVsbG8=",
            "start_date": "2030-01-01T00:00:00Z",
            "end_date": "2030-01-02T00:00:00Z",
            "deactivation_passphrase": "Str0ng!pass"
        }))
        .expect("deserialize");

        assert!(request.media_type.is_none());
        assert!(request.message.is_none());
        assert!(request.recipients.is_empty());
    }
}
