//! Daily trigger for the billing engine.

use crate::clock::Clock;
use crate::engine::{BillingEngine, RunOutcome};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// First occurrence of `run_at` (UTC) strictly after `now`.
pub fn next_fire_after(now: DateTime<Utc>, run_at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(run_at).and_utc();
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

pub struct BillingScheduler {
    engine: Arc<BillingEngine>,
    clock: Arc<dyn Clock>,
    run_at: NaiveTime,
    dry_run: bool,
}

impl BillingScheduler {
    pub fn new(
        engine: Arc<BillingEngine>,
        clock: Arc<dyn Clock>,
        run_at: NaiveTime,
        dry_run: bool,
    ) -> Self {
        Self {
            engine,
            clock,
            run_at,
            dry_run,
        }
    }

    /// Fire once per day until `shutdown` is cancelled. A run already in
    /// progress is allowed to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(run_at = %self.run_at, dry_run = self.dry_run, "Billing scheduler started");

        loop {
            let now = self.clock.now();
            let next = next_fire_after(now, self.run_at);
            let wait = (next - now).to_std().unwrap_or_default();
            info!(next_run = %next, "Next billing run scheduled");

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            match self.engine.run(self.dry_run).await {
                Ok(RunOutcome::Completed(summary)) => {
                    info!(batch_code = %summary.batch_code, "Scheduled billing run finished");
                }
                Ok(RunOutcome::Skipped { reason }) => {
                    info!(reason = %reason, "Scheduled billing run skipped");
                }
                Err(e) => {
                    error!(error = %e, "Scheduled billing run failed");
                }
            }
        }

        info!("Billing scheduler stopped");
    }
}
