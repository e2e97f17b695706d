//! Packet Data Convergence Protocol (PDCP) Layer Implementation
//! 
//! Minimal PDCP peer for the RLC layer: numbers outgoing SDUs and records
//! what RLC hands back (received SDUs, delivery and failure reports).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use common::Lcid;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::rlc::PdcpInterface;
use crate::LayerError;

/// PDCP layer configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PdcpConfig {
    /// SN size in bits (12 or 18)
    #[serde(default = "default_sn_size")]
    pub sn_size: u8,
}

fn default_sn_size() -> u8 {
    12
}

impl Default for PdcpConfig {
    fn default() -> Self {
        Self {
            sn_size: default_sn_size(),
        }
    }
}

#[derive(Debug, Default)]
struct PdcpRx {
    sdus: Vec<(Lcid, Bytes)>,
    delivered: Vec<u32>,
    failed: Vec<u32>,
}

/// PDCP layer implementation
#[derive(Debug)]
pub struct PdcpLayer {
    config: PdcpConfig,
    /// Next PDCP sequence number for transmission
    tx_next: AtomicU32,
    rx: Mutex<PdcpRx>,
}

impl PdcpLayer {
    /// Create a new PDCP layer instance
    pub fn new(config: PdcpConfig) -> Result<Self, LayerError> {
        if config.sn_size != 12 && config.sn_size != 18 {
            return Err(LayerError::ConfigurationError(
                "Invalid SN size: must be 12 or 18 bits".to_string()
            ));
        }
        debug!("PDCP config: sn_size={}", config.sn_size);
        
        Ok(Self {
            config,
            tx_next: AtomicU32::new(0),
            rx: Mutex::new(PdcpRx::default()),
        })
    }
    
    fn lock_rx(&self) -> MutexGuard<'_, PdcpRx> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner)
    }
    
    /// Assign the SN for the next outgoing SDU
    pub fn next_tx_sn(&self) -> u32 {
        let modulus = 1u32 << self.config.sn_size;
        let sn = self.tx_next.fetch_add(1, Ordering::Relaxed);
        sn % modulus
    }
    
    /// Drain SDUs received so far
    pub fn take_rx_sdus(&self) -> Vec<(Lcid, Bytes)> {
        std::mem::take(&mut self.lock_rx().sdus)
    }
    
    pub fn rx_count(&self) -> usize {
        self.lock_rx().sdus.len()
    }
    
    /// PDCP SNs reported as delivered, in notification order
    pub fn delivered(&self) -> Vec<u32> {
        self.lock_rx().delivered.clone()
    }
    
    /// PDCP SNs reported as failed
    pub fn failed(&self) -> Vec<u32> {
        self.lock_rx().failed.clone()
    }
    
    /// Forget everything recorded and restart SN numbering
    pub fn reset(&self) {
        *self.lock_rx() = PdcpRx::default();
        self.tx_next.store(0, Ordering::Relaxed);
    }
}

impl PdcpInterface for PdcpLayer {
    fn write_pdu(&self, lcid: Lcid, sdu: Bytes) {
        debug!("PDCP Rx SDU on LCID={} ({} B)", lcid, sdu.len());
        self.lock_rx().sdus.push((lcid, sdu));
    }
    
    fn notify_delivery(&self, lcid: Lcid, pdcp_sns: &[u32]) {
        debug!("PDCP LCID={} delivered SNs {:?}", lcid, pdcp_sns);
        self.lock_rx().delivered.extend_from_slice(pdcp_sns);
    }
    
    fn notify_failure(&self, lcid: Lcid, pdcp_sns: &[u32]) {
        warn!("PDCP LCID={} failed to deliver SNs {:?}", lcid, pdcp_sns);
        self.lock_rx().failed.extend_from_slice(pdcp_sns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[tokio::test]
    async fn test_pdcp_initialization() {
        let pdcp = PdcpLayer::new(PdcpConfig { sn_size: 12 }).unwrap();
        assert_eq!(pdcp.next_tx_sn(), 0);
        assert_eq!(pdcp.next_tx_sn(), 1);
    }
    
    #[tokio::test]
    async fn test_pdcp_invalid_sn_size() {
        assert!(PdcpLayer::new(PdcpConfig { sn_size: 16 }).is_err());
    }
    
    #[tokio::test]
    async fn test_sn_wraps() {
        let pdcp = PdcpLayer::new(PdcpConfig { sn_size: 12 }).unwrap();
        for _ in 0..4095 {
            pdcp.next_tx_sn();
        }
        assert_eq!(pdcp.next_tx_sn(), 4095);
        assert_eq!(pdcp.next_tx_sn(), 0);
    }
    
    #[tokio::test]
    async fn test_records_upcalls() {
        let pdcp = PdcpLayer::new(PdcpConfig::default()).unwrap();
        pdcp.write_pdu(Lcid(3), Bytes::from_static(b"abc"));
        pdcp.notify_delivery(Lcid(3), &[0, 1]);
        pdcp.notify_failure(Lcid(3), &[2]);
        
        assert_eq!(pdcp.rx_count(), 1);
        assert_eq!(pdcp.delivered(), vec![0, 1]);
        assert_eq!(pdcp.failed(), vec![2]);
        assert_eq!(pdcp.take_rx_sdus()[0].1, Bytes::from_static(b"abc"));
        assert_eq!(pdcp.rx_count(), 0);
        
        pdcp.reset();
        assert!(pdcp.delivered().is_empty());
        assert_eq!(pdcp.next_tx_sn(), 0);
    }
}
