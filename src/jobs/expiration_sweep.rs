use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

use crate::services::{ledger::RegistrationLedger, loyalty::LoyaltyService};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid schedule {schedule:?}: {source}")]
    InvalidSchedule {
        schedule: String,
        source: JobSchedulerError,
    },

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] JobSchedulerError),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub cards_expired: usize,
    pub warnings_sent: usize,
    pub registrations_pruned: u64,
    pub errors: usize,
}

/// Background job that retires overdue cards
///
/// 1. Mark every active card past its expiry date as expired (bumps its tag and
///    notifies registered devices so they fetch the voided pass)
/// 2. Warn holders of cards entering their program's warning window (once per
///    expiry date)
/// 3. Delete registrations whose card no longer exists
pub async fn run_expiration_sweep(
    loyalty: &LoyaltyService,
    ledger: &RegistrationLedger,
) -> SweepStats {
    let mut stats = SweepStats::default();

    tracing::info!("Starting expiration sweep");

    match loyalty.expire_due_cards().await {
        Ok(expired) => stats.cards_expired = expired.len(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to expire due cards");
            stats.errors += 1;
        }
    }

    match loyalty.send_expiration_warnings().await {
        Ok(sent) => stats.warnings_sent = sent,
        Err(e) => {
            tracing::error!(error = %e, "Failed to send expiration warnings");
            stats.errors += 1;
        }
    }

    match ledger.prune_orphaned().await {
        Ok(pruned) => stats.registrations_pruned = pruned,
        Err(e) => {
            tracing::error!(error = %e, "Failed to prune orphaned registrations");
            stats.errors += 1;
        }
    }

    tracing::info!(?stats, "Expiration sweep completed");

    stats
}

/// Starts a scheduler running the sweep on `schedule` (six-field cron, seconds first)
pub async fn start_scheduler(
    schedule: &str,
    loyalty: LoyaltyService,
    ledger: RegistrationLedger,
) -> Result<JobScheduler, SchedulerError> {
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(schedule, move |_id, _scheduler| {
        let loyalty = loyalty.clone();
        let ledger = ledger.clone();
        Box::pin(async move {
            run_expiration_sweep(&loyalty, &ledger).await;
        })
    })
    .map_err(|source| SchedulerError::InvalidSchedule {
        schedule: schedule.to_string(),
        source,
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;

    tracing::info!(schedule, "Expiration sweep scheduled");
    Ok(scheduler)
}
