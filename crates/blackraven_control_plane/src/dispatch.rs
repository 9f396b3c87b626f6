use blackraven_contract::{DispatchSummary, RecipientFailure, TransferStatus};
use blackraven_delivery::DeliveryRequest;
use blackraven_storage::{DispatchClaim, TransferRecord};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::json;
use tracing::{error, info, warn};

use crate::error::ServiceError;
use crate::service::{platforms_of, TransferService};

impl TransferService {
    /// Delivers every outstanding recipient of a claimed transfer and settles
    /// the claim. Any storage failure after the claim releases it again so the
    /// next sweep can retry.
    pub(crate) async fn dispatch_claimed(
        &self,
        record: &TransferRecord,
        claim: DispatchClaim,
        now: DateTime<Utc>,
    ) -> Result<DispatchSummary, ServiceError> {
        match self.deliver_outstanding(record, &claim, now).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                if let Err(release_error) = self
                    .storage
                    .release_claim(&claim, now, Some("dispatch interrupted"))
                    .await
                {
                    error!(
                        transfer_id = %claim.transfer_id,
                        error = %release_error,
                        "failed to release dispatch claim; it expires with the lease"
                    );
                }
                Err(e)
            }
        }
    }

    async fn deliver_outstanding(
        &self,
        record: &TransferRecord,
        claim: &DispatchClaim,
        now: DateTime<Utc>,
    ) -> Result<DispatchSummary, ServiceError> {
        let recipients = record.recipients()?;
        let already = platforms_of(&self.storage.list_deliveries(&record.transfer_id).await?);
        let outstanding: Vec<(&String, &String)> = recipients
            .iter()
            .filter(|(platform, _)| !already.contains(*platform))
            .collect();

        let mut delivered: Vec<String> = already.iter().cloned().collect();
        let mut failed = Vec::new();

        if !outstanding.is_empty() {
            let access_url = self.settings.app_url.as_deref().map(|base| {
                format!("{}/shared/{}", base.trim_end_matches('/'), record.transfer_id)
            });

            let outcomes: Vec<(&String, &String, Result<String, String>)> =
                match self.blobs.get(&record.payload_path).await {
                    Ok(payload) => {
                        let attempts = outstanding.iter().map(|(platform, recipient)| {
                            let request = DeliveryRequest {
                                transfer_id: &record.transfer_id,
                                platform: platform.as_str(),
                                recipient: recipient.as_str(),
                                sender: &record.owner_email,
                                filename: &record.filename,
                                media_type: &record.media_type,
                                payload: &payload,
                                message: record.message.as_deref(),
                                access_url: access_url.as_deref(),
                            };
                            async move {
                                let outcome = self
                                    .delivery
                                    .deliver(&request)
                                    .await
                                    .map(|receipt| receipt.reference)
                                    .map_err(|e| e.to_string());
                                (*platform, *recipient, outcome)
                            }
                        });
                        join_all(attempts).await
                    }
                    Err(e) => {
                        error!(
                            transfer_id = %record.transfer_id,
                            path = %record.payload_path,
                            error = %e,
                            "payload unavailable for dispatch"
                        );
                        let reason = format!("payload unavailable: {e}");
                        outstanding
                            .iter()
                            .map(|(platform, recipient)| (*platform, *recipient, Err(reason.clone())))
                            .collect()
                    }
                };

            // record every outcome before giving up on the first storage error
            let mut unrecorded = None;
            for (platform, recipient, outcome) in outcomes {
                if let Err(e) = self
                    .storage
                    .record_delivery(
                        &record.transfer_id,
                        platform,
                        recipient,
                        outcome.as_deref().map_err(String::as_str),
                        now,
                    )
                    .await
                {
                    error!(
                        transfer_id = %record.transfer_id,
                        platform = %platform,
                        recipient = %recipient,
                        delivered = outcome.is_ok(),
                        error = %e,
                        "delivery outcome not recorded; recipient may receive the file again"
                    );
                    unrecorded.get_or_insert(e);
                }
                match outcome {
                    Ok(_) => delivered.push(platform.clone()),
                    Err(error) => {
                        warn!(
                            transfer_id = %record.transfer_id,
                            platform = %platform,
                            recipient = %recipient,
                            error = %error,
                            "delivery failed"
                        );
                        failed.push(RecipientFailure {
                            platform: platform.clone(),
                            recipient: recipient.clone(),
                            error,
                        });
                    }
                }
            }
            if let Some(e) = unrecorded {
                return Err(ServiceError::Operational(e));
            }
        }
        delivered.sort();

        let reason = failure_reason(&failed);
        let exhausted =
            !failed.is_empty() && claim.dispatch_attempts >= self.settings.sweeper.max_dispatch_attempts;

        let status = if failed.is_empty() || exhausted {
            if !self
                .storage
                .complete_dispatch(claim, now, reason.as_deref())
                .await?
            {
                return Err(ServiceError::conflict("dispatch claim was lost"));
            }
            TransferStatus::Sent
        } else {
            if !self
                .storage
                .release_claim(claim, now, reason.as_deref())
                .await?
            {
                return Err(ServiceError::conflict("dispatch claim was lost"));
            }
            TransferStatus::Pending
        };

        match (status, exhausted) {
            (TransferStatus::Sent, false) => info!(
                transfer_id = %record.transfer_id,
                delivered = delivered.len(),
                "transfer sent"
            ),
            (TransferStatus::Sent, true) => error!(
                transfer_id = %record.transfer_id,
                attempts = claim.dispatch_attempts,
                failed = failed.len(),
                "giving up on undeliverable recipients"
            ),
            _ => warn!(
                transfer_id = %record.transfer_id,
                attempts = claim.dispatch_attempts,
                failed = failed.len(),
                "partial delivery; transfer left pending for retry"
            ),
        }

        self.emit(
            if status == TransferStatus::Sent {
                "transfer.sent"
            } else {
                "transfer.dispatch_failed"
            },
            &record.owner_id,
            &record.transfer_id,
            Some(status),
            json!({
                "delivered": delivered,
                "failed": failed,
                "exhausted": exhausted,
            }),
        );

        Ok(DispatchSummary {
            transfer_id: record.transfer_id.clone(),
            status,
            delivered,
            failed,
            exhausted,
        })
    }
}

fn failure_reason(failed: &[RecipientFailure]) -> Option<String> {
    if failed.is_empty() {
        return None;
    }
    Some(
        failed
            .iter()
            .map(|f| format!("{} ({}): {}", f.platform, f.recipient, f.error))
            .collect::<Vec<_>>()
            .join("; "),
    )
}
