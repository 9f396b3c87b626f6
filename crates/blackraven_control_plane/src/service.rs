use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use blackraven_contract::{
    CreateTransferRequest, DeactivationResponse, DeliveryView, DispatchSummary, FieldError,
    TransferEventEnvelope, TransferStatus, TransferView,
};
use blackraven_delivery::DeliveryRegistry;
use blackraven_storage::{
    BlackravenStorage, BlobStore, DeliveryRecord, NewTransfer, TransferRecord,
};
use blackraven_transfer::{
    format_file_size, format_time_remaining, incorrect_passphrase_message, validate_upload,
    AttemptVerdict, DeactivationPolicy, PassphraseHasher, UploadPolicy, BRUTE_FORCE_MESSAGE,
    DEACTIVATED_MESSAGE,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::error::ServiceError;
use crate::identity::CurrentUser;

#[derive(Debug, Clone)]
pub struct SweeperSettings {
    /// Transfers dispatched in parallel by one sweep.
    pub concurrency: usize,
    /// Claims after which a partially failed transfer is closed as `sent`
    /// with its failures kept on record.
    pub max_dispatch_attempts: i64,
    /// A `dispatching` row older than this is assumed abandoned.
    pub claim_lease: Duration,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_dispatch_attempts: 5,
            claim_lease: Duration::minutes(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub max_payload_bytes: usize,
    pub deactivation: DeactivationPolicy,
    pub sweeper: SweeperSettings,
    /// Base URL used to build the access link in delivery messages.
    pub app_url: Option<String>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            max_payload_bytes: 25 * 1024 * 1024,
            deactivation: DeactivationPolicy::default(),
            sweeper: SweeperSettings::default(),
            app_url: None,
        }
    }
}

/// Owns every state transition of a scheduled transfer.
#[derive(Clone)]
pub struct TransferService {
    pub(crate) storage: BlackravenStorage,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) delivery: DeliveryRegistry,
    pub(crate) hasher: PassphraseHasher,
    pub(crate) settings: Arc<ServiceSettings>,
    events: broadcast::Sender<TransferEventEnvelope>,
}

impl TransferService {
    pub fn new(
        storage: BlackravenStorage,
        blobs: Arc<dyn BlobStore>,
        delivery: DeliveryRegistry,
        hasher: PassphraseHasher,
        settings: ServiceSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            storage,
            blobs,
            delivery,
            hasher,
            settings: Arc::new(settings),
            events,
        }
    }

    pub fn storage(&self) -> &BlackravenStorage {
        &self.storage
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEventEnvelope> {
        self.events.subscribe()
    }

    pub(crate) fn emit(
        &self,
        event: &str,
        owner_id: &str,
        transfer_id: &str,
        status: Option<TransferStatus>,
        payload: serde_json::Value,
    ) {
        let _ = self.events.send(TransferEventEnvelope::new(
            event,
            owner_id,
            transfer_id,
            status,
            payload,
        ));
    }

    fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            max_payload_bytes: self.settings.max_payload_bytes,
            platforms: self.delivery.platforms(),
        }
    }

    /// Validates, hashes, stores the payload, then inserts the row. A failed
    /// insert removes the payload it just wrote.
    pub async fn create(
        &self,
        user: &CurrentUser,
        request: CreateTransferRequest,
    ) -> Result<TransferView, ServiceError> {
        let draft = validate_upload(request, &self.upload_policy())?;

        let passphrase_hash = self.hasher.hash_blocking(draft.passphrase.clone()).await?;

        let path = draft.payload_path(&user.id);
        self.blobs.put(&path, &draft.payload).await?;

        let new = NewTransfer {
            owner_id: user.id.clone(),
            owner_email: user.email.clone(),
            payload_path: path.clone(),
            filename: draft.filename.clone(),
            media_type: draft.media_type.clone(),
            size_bytes: draft.payload.len() as i64,
            message: draft.message.clone(),
            start_date: draft.start_date,
            end_date: draft.end_date,
            recipients: draft.recipients.clone(),
            passphrase_hash,
        };

        let record = match self.storage.insert_transfer(&new).await {
            Ok(record) => record,
            Err(insert_error) => {
                if let Err(cleanup_error) = self.blobs.remove(&path).await {
                    error!(
                        path = %path,
                        owner_id = %user.id,
                        error = %cleanup_error,
                        "orphaned payload: row insert failed and payload removal failed"
                    );
                }
                return Err(ServiceError::Operational(insert_error));
            }
        };

        info!(
            transfer_id = %record.transfer_id,
            owner_id = %user.id,
            end_date = %record.end_date,
            "scheduled transfer created"
        );
        self.emit(
            "transfer.created",
            &user.id,
            &record.transfer_id,
            Some(TransferStatus::Pending),
            json!({ "end_date": record.end_date }),
        );

        transfer_view(&record, Vec::new(), Utc::now())
    }

    pub async fn list(&self, user: &CurrentUser) -> Result<Vec<TransferView>, ServiceError> {
        let now = Utc::now();
        let records = self.storage.list_transfers_for_owner(&user.id).await?;
        let mut views = Vec::with_capacity(records.len());
        for record in records {
            let deliveries = self.storage.list_deliveries(&record.transfer_id).await?;
            views.push(transfer_view(&record, deliveries, now)?);
        }
        Ok(views)
    }

    pub async fn get(
        &self,
        user: &CurrentUser,
        transfer_id: &str,
    ) -> Result<TransferView, ServiceError> {
        let record = self.owned(user, transfer_id).await?;
        let deliveries = self.storage.list_deliveries(&record.transfer_id).await?;
        transfer_view(&record, deliveries, Utc::now())
    }

    pub async fn send_now(
        &self,
        user: &CurrentUser,
        transfer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchSummary, ServiceError> {
        let record = self.owned(user, transfer_id).await?;
        require_pending(&record)?;
        self.force_send(&record, now).await
    }

    /// Claims and dispatches a pending transfer right away.
    async fn force_send(
        &self,
        record: &TransferRecord,
        now: DateTime<Utc>,
    ) -> Result<DispatchSummary, ServiceError> {
        let claim = self
            .storage
            .claim_for_owner(&record.transfer_id, &record.owner_id, now)
            .await?
            .ok_or_else(|| ServiceError::conflict("transfer is no longer pending"))?;

        info!(transfer_id = %record.transfer_id, "immediate send requested");
        self.dispatch_claimed(record, claim, now).await
    }

    /// Removes a transfer that already reached a terminal state. The payload
    /// goes first; if that fails the row is kept so nothing is lost track of.
    pub async fn delete(&self, user: &CurrentUser, transfer_id: &str) -> Result<(), ServiceError> {
        let record = self.owned(user, transfer_id).await?;
        match record.status()? {
            TransferStatus::Sent | TransferStatus::Cancelled => {}
            TransferStatus::Pending => {
                return Err(ServiceError::conflict(
                    "pending transfers can only be removed by deactivating them with the passphrase",
                ))
            }
            TransferStatus::Dispatching => {
                return Err(ServiceError::conflict("transfer is being dispatched"))
            }
        }
        self.purge(&record).await
    }

    async fn purge(&self, record: &TransferRecord) -> Result<(), ServiceError> {
        self.blobs.remove(&record.payload_path).await.map_err(|e| {
            error!(
                transfer_id = %record.transfer_id,
                path = %record.payload_path,
                error = %e,
                "payload removal failed; transfer row kept"
            );
            ServiceError::from(e)
        })?;

        if !self
            .storage
            .delete_transfer(&record.transfer_id, &record.owner_id)
            .await?
        {
            return Err(ServiceError::NotFound);
        }

        info!(transfer_id = %record.transfer_id, "transfer and payload deleted");
        self.emit(
            "transfer.deleted",
            &record.owner_id,
            &record.transfer_id,
            None,
            json!({}),
        );
        Ok(())
    }

    /// One passphrase submission against a pending transfer.
    pub async fn deactivate(
        &self,
        user: &CurrentUser,
        transfer_id: &str,
        passphrase: &str,
        now: DateTime<Utc>,
    ) -> Result<DeactivationResponse, ServiceError> {
        if passphrase.is_empty() {
            return Err(ServiceError::Validation(vec![FieldError::new(
                "passphrase",
                "passphrase is required",
            )]));
        }

        let record = self.owned(user, transfer_id).await?;
        let max_attempts = i64::from(self.settings.deactivation.max_attempts);
        if record.status()? != TransferStatus::Pending {
            return Err(ServiceError::conflict(format!(
                "transfer is {} and no longer accepts deactivation attempts",
                record.status
            )));
        }
        if record.failed_attempts >= max_attempts {
            return Err(ServiceError::conflict(
                "too many incorrect passphrases; the transfer can no longer be deactivated",
            ));
        }
        if record.dispatch_attempts > 0 {
            return Err(ServiceError::conflict(
                "delivery has already started; the transfer can no longer be deactivated",
            ));
        }

        let verified = self
            .hasher
            .verify_blocking(passphrase.to_string(), record.passphrase_hash.clone())
            .await?;

        if verified {
            if !self
                .storage
                .mark_cancelled(&record.transfer_id, &record.owner_id, max_attempts)
                .await?
            {
                return Err(ServiceError::conflict("transfer can no longer be deactivated"));
            }
            self.emit(
                "transfer.cancelled",
                &record.owner_id,
                &record.transfer_id,
                Some(TransferStatus::Cancelled),
                json!({}),
            );
            self.purge(&record).await?;
            info!(transfer_id = %record.transfer_id, "transfer deactivated");
            return Ok(DeactivationResponse::Deactivated {
                transfer_id: record.transfer_id,
                message: DEACTIVATED_MESSAGE.to_string(),
            });
        }

        let failures = self
            .storage
            .record_failed_attempt(&record.transfer_id, &record.owner_id, max_attempts)
            .await?
            .ok_or_else(|| ServiceError::conflict("transfer can no longer be deactivated"))?;
        let failures = u32::try_from(failures).unwrap_or(u32::MAX);

        match self.settings.deactivation.judge(failures) {
            AttemptVerdict::Retry { attempts_remaining } => {
                warn!(
                    transfer_id = %record.transfer_id,
                    failures,
                    attempts_remaining,
                    "incorrect deactivation passphrase"
                );
                Ok(DeactivationResponse::IncorrectPassphrase {
                    transfer_id: record.transfer_id,
                    attempts_remaining,
                    message: incorrect_passphrase_message(attempts_remaining),
                })
            }
            AttemptVerdict::ForceSend => {
                warn!(
                    transfer_id = %record.transfer_id,
                    failures,
                    "possible brute-forcing detected; forcing immediate send"
                );
                self.emit(
                    "transfer.brute_force_detected",
                    &record.owner_id,
                    &record.transfer_id,
                    None,
                    json!({ "failed_attempts": failures }),
                );
                let dispatch = match self.force_send(&record, now).await {
                    Ok(summary) => summary,
                    // a concurrent attempt or sweep already took the row
                    Err(ServiceError::Conflict(_)) => self.current_summary(&record).await?,
                    Err(other) => return Err(other),
                };
                Ok(DeactivationResponse::BruteForceDetected {
                    transfer_id: record.transfer_id,
                    message: BRUTE_FORCE_MESSAGE.to_string(),
                    dispatch,
                })
            }
        }
    }

    async fn current_summary(&self, record: &TransferRecord) -> Result<DispatchSummary, ServiceError> {
        let latest = self
            .storage
            .get_transfer(&record.transfer_id)
            .await?
            .ok_or(ServiceError::NotFound)?;
        let deliveries = self.storage.list_deliveries(&record.transfer_id).await?;
        let delivered = deliveries
            .iter()
            .filter(|d| d.is_delivered())
            .map(|d| d.platform.clone())
            .collect();
        Ok(DispatchSummary {
            transfer_id: latest.transfer_id.clone(),
            status: latest.status()?,
            delivered,
            failed: Vec::new(),
            exhausted: false,
        })
    }

    async fn owned(
        &self,
        user: &CurrentUser,
        transfer_id: &str,
    ) -> Result<TransferRecord, ServiceError> {
        self.storage
            .get_transfer_for_owner(transfer_id, &user.id)
            .await?
            .ok_or(ServiceError::NotFound)
    }
}

fn require_pending(record: &TransferRecord) -> Result<(), ServiceError> {
    match record.status()? {
        TransferStatus::Pending => Ok(()),
        TransferStatus::Dispatching => Err(ServiceError::conflict("transfer is being dispatched")),
        status => Err(ServiceError::conflict(format!(
            "transfer is already {}",
            status.as_str()
        ))),
    }
}

pub(crate) fn transfer_view(
    record: &TransferRecord,
    deliveries: Vec<DeliveryRecord>,
    now: DateTime<Utc>,
) -> Result<TransferView, ServiceError> {
    let status = record.status()?;
    let time_remaining = if status.is_terminal() {
        "Expired".to_string()
    } else {
        format_time_remaining(record.end_date()?, now)
    };

    let deliveries = deliveries
        .into_iter()
        .map(|d| -> anyhow::Result<DeliveryView> {
            Ok(DeliveryView {
                status: d.status()?,
                platform: d.platform,
                recipient: d.recipient,
                attempts: d.attempts,
                last_error: d.last_error,
                receipt: d.receipt,
                delivered_at: d.delivered_at,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(TransferView {
        transfer_id: record.transfer_id.clone(),
        filename: record.filename.clone(),
        media_type: record.media_type.clone(),
        size_bytes: record.size_bytes,
        size_display: format_file_size(record.size_bytes.max(0) as u64),
        message: record.message.clone(),
        start_date: record.start_date.clone(),
        end_date: record.end_date.clone(),
        recipients: record.recipients().context("render transfer view")?,
        status,
        created_at: record.created_at.clone(),
        updated_at: record.updated_at.clone(),
        sent_at: record.sent_at.clone(),
        time_remaining,
        failure_reason: record.failure_reason.clone(),
        deliveries,
    })
}

pub(crate) fn platforms_of(deliveries: &[DeliveryRecord]) -> BTreeSet<String> {
    deliveries
        .iter()
        .filter(|d| d.is_delivered())
        .map(|d| d.platform.clone())
        .collect()
}
