//! Delivery bookkeeping for upper-layer SDUs
//! 
//! Remembers which RLC PDUs carry pieces of each PDCP SDU so delivery can
//! be notified once every piece has been acknowledged.

use std::collections::HashMap;

#[derive(Debug, Default)]
struct SduInfo {
    fully_txed: bool,
    pending: Vec<u16>,
}

/// Tracks undelivered SDUs by PDCP SN
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    sdus: HashMap<u32, SduInfo>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }
    
    /// Start tracking an SDU, returns false if it is already tracked
    pub fn add_sdu(&mut self, pdcp_sn: u32) -> bool {
        if self.sdus.contains_key(&pdcp_sn) {
            return false;
        }
        self.sdus.insert(pdcp_sn, SduInfo::default());
        true
    }
    
    #[cfg(test)]
    pub fn contains(&self, pdcp_sn: u32) -> bool {
        self.sdus.contains_key(&pdcp_sn)
    }
    
    /// Record that RLC PDU `rlc_sn` carries a piece of the SDU
    pub fn add_segment(&mut self, pdcp_sn: u32, rlc_sn: u16) -> bool {
        match self.sdus.get_mut(&pdcp_sn) {
            Some(info) => {
                info.pending.push(rlc_sn);
                true
            }
            None => false,
        }
    }
    
    /// All bytes of the SDU have been placed into PDUs
    pub fn mark_fully_txed(&mut self, pdcp_sn: u32) {
        if let Some(info) = self.sdus.get_mut(&pdcp_sn) {
            info.fully_txed = true;
        }
    }
    
    /// Acknowledge PDU `rlc_sn`, appending SDUs that are now delivered to `delivered`
    pub fn ack(&mut self, rlc_sn: u16, pdcp_sns: &[u32], delivered: &mut Vec<u32>) {
        for &pdcp_sn in pdcp_sns {
            let Some(info) = self.sdus.get_mut(&pdcp_sn) else {
                continue;
            };
            if let Some(pos) = info.pending.iter().position(|&sn| sn == rlc_sn) {
                info.pending.swap_remove(pos);
            }
            if info.fully_txed && info.pending.is_empty() {
                self.sdus.remove(&pdcp_sn);
                delivered.push(pdcp_sn);
            }
        }
    }
    
    pub fn remove(&mut self, pdcp_sn: u32) {
        self.sdus.remove(&pdcp_sn);
    }
    
    pub fn len(&self) -> usize {
        self.sdus.len()
    }
    
    pub fn clear(&mut self) {
        self.sdus.clear();
    }
}
