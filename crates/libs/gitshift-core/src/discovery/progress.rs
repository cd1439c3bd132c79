//! Single-writer progress tracking for a discovery run.
//!
//! Workers mutate an in-memory snapshot; the tracker flushes it to the
//! `discovery_progress` row at most once per second, plus a forced flush
//! when the run finishes. Reads are eventually consistent.

use crate::ctx::Ctx;
use crate::model::ModelManager;
use crate::model::discovery_progress::{DiscoveryProgressBmc, DiscoveryStatus, ProgressSnapshot};
use crate::types::DiscoveryId;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::warn;

const FLUSH_INTERVAL_SECS: u64 = 1;

struct TrackerState {
    snapshot: ProgressSnapshot,
    last_flush: Option<Instant>,
}

pub(crate) struct ProgressTracker {
    mm: ModelManager,
    ctx: Ctx,
    id: DiscoveryId,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    pub(crate) fn new(mm: ModelManager, id: DiscoveryId) -> Self {
        Self {
            mm,
            ctx: Ctx::system(),
            id,
            state: Mutex::new(TrackerState {
                snapshot: ProgressSnapshot::default(),
                last_flush: None,
            }),
        }
    }

    /// Applies a mutation and flushes if the throttle window has passed.
    /// Flush failures are logged, never propagated: progress is advisory.
    pub(crate) async fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut ProgressSnapshot),
    {
        let mut state = self.state.lock().await;
        f(&mut state.snapshot);

        let due = state
            .last_flush
            .is_none_or(|at| at.elapsed().as_secs() >= FLUSH_INTERVAL_SECS);
        if !due {
            return;
        }
        state.last_flush = Some(Instant::now());
        let snapshot = state.snapshot.clone();
        drop(state);

        if let Err(error) =
            DiscoveryProgressBmc::update(&self.ctx, &self.mm, self.id, &snapshot).await
        {
            warn!(%error, discovery_id = %self.id, "failed to flush discovery progress");
        }
    }

    /// Final flush plus terminal status.
    pub(crate) async fn finish(&self, status: DiscoveryStatus) {
        let snapshot = { self.state.lock().await.snapshot.clone() };
        if let Err(error) =
            DiscoveryProgressBmc::complete(&self.ctx, &self.mm, self.id, status, &snapshot).await
        {
            warn!(%error, discovery_id = %self.id, "failed to finalize discovery progress");
        }
    }
}
