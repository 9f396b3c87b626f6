use blackraven_contract::{SweepReport, TransferStatus};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use tracing::{debug, error, info};

use crate::error::ServiceError;
use crate::service::TransferService;

enum SweepOutcome {
    Skipped,
    Dispatched(blackraven_contract::DispatchSummary),
    Failed,
}

impl TransferService {
    /// Dispatches every transfer whose `end_date` has passed. Safe to run
    /// from several processes at once: a row is only dispatched by the
    /// sweep that wins its claim.
    pub async fn sweep_due(&self, now: DateTime<Utc>) -> Result<SweepReport, ServiceError> {
        let stale_before = now - self.settings.sweeper.claim_lease;
        let due = self.storage.list_due(now, stale_before).await?;
        let mut report = SweepReport {
            due: due.len(),
            ..SweepReport::default()
        };
        if due.is_empty() {
            debug!("sweep found nothing due");
            return Ok(report);
        }

        let concurrency = self.settings.sweeper.concurrency.max(1);
        let outcomes: Vec<SweepOutcome> = stream::iter(due)
            .map(|record| async move {
                let claim = match self
                    .storage
                    .claim_due(&record.transfer_id, now, stale_before)
                    .await
                {
                    Ok(Some(claim)) => claim,
                    Ok(None) => return SweepOutcome::Skipped,
                    Err(e) => {
                        error!(transfer_id = %record.transfer_id, error = %e, "claim failed");
                        return SweepOutcome::Failed;
                    }
                };
                match self.dispatch_claimed(&record, claim, now).await {
                    Ok(summary) => SweepOutcome::Dispatched(summary),
                    Err(ServiceError::Conflict(_)) => SweepOutcome::Skipped,
                    Err(e) => {
                        error!(transfer_id = %record.transfer_id, error = %e, "dispatch failed");
                        SweepOutcome::Failed
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                SweepOutcome::Skipped => report.skipped += 1,
                SweepOutcome::Failed => report.errors += 1,
                SweepOutcome::Dispatched(summary) => {
                    report.claimed += 1;
                    match (summary.status, summary.exhausted) {
                        (TransferStatus::Sent, true) => report.exhausted += 1,
                        (TransferStatus::Sent, false) => report.sent += 1,
                        _ => report.retrying += 1,
                    }
                    report.results.push(summary);
                }
            }
        }

        info!(
            due = report.due,
            claimed = report.claimed,
            sent = report.sent,
            retrying = report.retrying,
            exhausted = report.exhausted,
            skipped = report.skipped,
            errors = report.errors,
            "sweep finished"
        );
        Ok(report)
    }
}
