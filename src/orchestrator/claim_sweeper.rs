//! Periodic reaping of lapsed claim records.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::pool::AppState;

/// Spawn the sweeper. Lapsed claims are already logically free; sweeping
/// only keeps the lock directory tidy and the counters honest.
#[must_use]
pub fn spawn(state: Arc<AppState>, ct: CancellationToken) -> JoinHandle<()> {
    let period = Duration::from_secs(state.config.claims.sweep_interval_seconds.max(1));
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        debug!("claim sweeper cancelled");
                        return;
                    }
                    _ = ticker.tick() => match state.sweep_claims().await {
                        Ok(0) => {}
                        Ok(reaped) => info!(reaped, "lapsed claims reaped"),
                        Err(err) => warn!(%err, "claim sweep failed"),
                    },
                }
            }
        }
        .instrument(info_span!("claim_sweeper")),
    )
}
