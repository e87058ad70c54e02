//! Lease renewal for a job being driven by this process.

use std::sync::Arc;
use std::time::Duration;

use neurochron_core::{CancelHandle, JobId, JobStore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// Renews a job lease every `ttl / 3` until dropped.
///
/// Cancels `handle` when the lease is lost, when renewal has failed for a
/// whole `ttl`, or when a cancel request shows up on the job record.
pub struct LeaseHeartbeat {
    task: JoinHandle<()>,
}

impl LeaseHeartbeat {
    pub fn spawn(
        store: Arc<dyn JobStore>,
        job_id: JobId,
        owner: String,
        ttl: Duration,
        handle: CancelHandle,
    ) -> Self {
        let task = tokio::spawn(async move {
            let period = (ttl / 3).max(MIN_RENEW_INTERVAL);
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut renewed_at = Instant::now();

            loop {
                ticker.tick().await;
                match store.renew_lease(job_id, &owner, ttl).await {
                    Ok(true) => renewed_at = Instant::now(),
                    Ok(false) => {
                        warn!(job_id = %job_id, owner = %owner, "Lease lost");
                        handle.cancel();
                        return;
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Lease renewal failed");
                        if renewed_at.elapsed() >= ttl {
                            warn!(job_id = %job_id, "Lease expired while store was unreachable");
                            handle.cancel();
                            return;
                        }
                        continue;
                    }
                }

                match store.get(job_id).await {
                    Ok(job) if job.cancel_requested => {
                        info!(job_id = %job_id, "Cancellation requested");
                        handle.cancel();
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => debug!(job_id = %job_id, error = %e, "Cancel check failed"),
                }
            }
        });
        Self { task }
    }
}

impl Drop for LeaseHeartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}
