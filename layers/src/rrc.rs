//! Radio Resource Control (RRC) Layer Implementation
//! 
//! Minimal RRC peer for the RLC layer: names radio bearers and records
//! radio link failure indications so the owner can reestablish RLC.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use common::Lcid;
use tracing::{error, warn};

use crate::rlc::{RlcLayer, RrcInterface};

/// RRC layer implementation
#[derive(Debug, Default)]
pub struct RrcLayer {
    max_retx_events: AtomicU32,
    protocol_failures: AtomicU32,
    /// Bearers with a radio link failure not yet handled
    pending_failures: Mutex<Vec<Lcid>>,
}

impl RrcLayer {
    /// Create a new RRC layer instance
    pub fn new() -> Self {
        Self::default()
    }
    
    fn lock_pending(&self) -> MutexGuard<'_, Vec<Lcid>> {
        self.pending_failures.lock().unwrap_or_else(PoisonError::into_inner)
    }
    
    pub fn max_retx_count(&self) -> u32 {
        self.max_retx_events.load(Ordering::Relaxed)
    }
    
    pub fn protocol_failure_count(&self) -> u32 {
        self.protocol_failures.load(Ordering::Relaxed)
    }
    
    /// Take bearers that hit the retransmission limit since the last call
    pub fn take_failed_bearers(&self) -> Vec<Lcid> {
        std::mem::take(&mut *self.lock_pending())
    }
    
    /// Reestablish the failed bearers of `rlc`, returns how many were handled
    pub fn handle_radio_link_failures(&self, rlc: &RlcLayer) -> usize {
        let failed = self.take_failed_bearers();
        for &lcid in &failed {
            warn!("Radio link failure on {}, reestablishing RLC", lcid.rb_name());
            if let Err(e) = rlc.reestablish_bearer(lcid) {
                error!("Failed to reestablish {}: {}", lcid.rb_name(), e);
            }
        }
        failed.len()
    }
}

impl RrcInterface for RrcLayer {
    fn max_retx_attempted(&self, lcid: Lcid) {
        warn!("Max RLC retransmissions reached on {}", lcid.rb_name());
        self.max_retx_events.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.lock_pending();
        if !pending.contains(&lcid) {
            pending.push(lcid);
        }
    }
    
    fn protocol_failure(&self, lcid: Lcid) {
        error!("RLC protocol failure on {}", lcid.rb_name());
        self.protocol_failures.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[tokio::test]
    async fn test_rrc_records_failures() {
        let rrc = RrcLayer::new();
        rrc.max_retx_attempted(Lcid(3));
        rrc.max_retx_attempted(Lcid(3));
        rrc.protocol_failure(Lcid(1));
        
        assert_eq!(rrc.max_retx_count(), 2);
        assert_eq!(rrc.protocol_failure_count(), 1);
        assert_eq!(rrc.take_failed_bearers(), vec![Lcid(3)]);
        assert!(rrc.take_failed_bearers().is_empty());
    }
    
    #[tokio::test]
    async fn test_bearer_names() {
        let rrc = RrcLayer::new();
        assert_eq!(rrc.rb_name(Lcid(1)), "SRB1");
        assert_eq!(rrc.rb_name(Lcid(5)), "DRB3");
    }
}
