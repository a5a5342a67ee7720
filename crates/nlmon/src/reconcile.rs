//! Cache reconciliation
//!
//! Rebuilds both caches from full kernel dumps and re-announces every entry
//! as newly added. Used after a reload request or a receive buffer overrun,
//! when incremental delivery may have missed records.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CP-10: System Recovery - Resynchronize mirrored state
//! - SI-4: System Monitoring - Authoritative re-announcement

use crate::error::Result;
use crate::manager::CacheManager;
use crate::transport::Transport;
use crate::types::CacheKind;
use tracing::{info, instrument};

/// Order in which caches are refilled and announced
const RECONCILE_ORDER: [CacheKind; 2] = [CacheKind::Link, CacheKind::Route];

/// Entries re-announced per cache by one reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub links: usize,
    pub routes: usize,
}

/// Refill and re-announce the link cache, then the route cache
///
/// Runs to completion without yielding. A dump failure aborts the sweep and
/// is returned to the caller.
#[instrument(skip(manager))]
pub fn reconcile<S: Transport>(manager: &mut CacheManager<S>) -> Result<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();

    for kind in RECONCILE_ORDER {
        if !manager.is_registered(kind) {
            continue;
        }

        manager.refill(kind)?;
        let announced = manager.announce_all(kind);

        match kind {
            CacheKind::Link => summary.links = announced,
            CacheKind::Route => summary.routes = announced,
        }
    }

    info!(
        links = summary.links,
        routes = summary.routes,
        "Reconciled caches"
    );
    Ok(summary)
}
