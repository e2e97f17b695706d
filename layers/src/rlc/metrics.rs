//! Per-bearer RLC counters

use serde::{Deserialize, Serialize};

/// Counters collected by one AM bearer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlcBearerMetrics {
    pub num_tx_sdus: u64,
    pub num_rx_sdus: u64,
    pub num_tx_sdu_bytes: u64,
    pub num_rx_sdu_bytes: u64,
    /// SDUs rejected because the Tx queue was full
    pub num_lost_sdus: u64,
    pub num_tx_pdus: u64,
    pub num_rx_pdus: u64,
    pub num_tx_pdu_bytes: u64,
    pub num_rx_pdu_bytes: u64,
    /// PDUs that reached the retransmission limit
    pub num_lost_pdus: u64,
    /// Bytes held in the receive window, sampled when metrics are read
    pub rx_buffered_bytes: u64,
}

impl RlcBearerMetrics {
    /// Transmitted SDU throughput in Mbit/s over `nof_ms`
    pub fn tx_rate_mbps(&self, nof_ms: u64) -> f64 {
        rate_mbps(self.num_tx_sdu_bytes, nof_ms)
    }
    
    /// Received SDU throughput in Mbit/s over `nof_ms`
    pub fn rx_rate_mbps(&self, nof_ms: u64) -> f64 {
        rate_mbps(self.num_rx_sdu_bytes, nof_ms)
    }
}

fn rate_mbps(bytes: u64, nof_ms: u64) -> f64 {
    if nof_ms == 0 {
        return 0.0;
    }
    (bytes * 8) as f64 / (nof_ms as f64 * 1000.0)
}
