//! Radio Link Control (RLC) Layer Implementation
//! 
//! Implements the LTE RLC acknowledged mode according to 3GPP TS 36.322.
//! `RlcLayer` owns one AM entity per logical channel and is driven by MAC
//! (grants, received PDUs, 1 ms ticks) and by PDCP (SDUs).

pub mod am;
pub mod config;
pub mod metrics;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use common::Lcid;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use am::pdu::PduError;
pub use am::{BufferState, RlcAm};
pub use config::RlcConfig;
pub use metrics::RlcBearerMetrics;

/// RLC entity and layer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RlcError {
    #[error("Malformed PDU: {0}")]
    MalformedPdu(#[from] PduError),
    
    #[error("SN={sn} is a duplicate or outside the receive window")]
    DuplicateOrOutOfWindow { sn: u16 },
    
    #[error("Invalid status PDU: ACK_SN={ack_sn} outside [VT(A)={vt_a}, VT(S)={vt_s}]")]
    InvalidStatus { ack_sn: u16, vt_a: u16, vt_s: u16 },
    
    #[error("Maximum number of retransmissions reached for SN={sn}")]
    MaxRetxReached { sn: u16 },
    
    #[error("Transmitter disabled")]
    TxDisabled,
    
    #[error("Tx SDU queue full")]
    SduQueueFull,
    
    #[error("Empty SDU")]
    EmptySdu,
    
    #[error("Unknown bearer LCID={0}")]
    UnknownBearer(Lcid),
    
    #[error("Bearer LCID={0} already exists")]
    BearerExists(Lcid),
    
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl RlcError {
    /// The bearer's transmit path is dead until reestablishment
    pub fn is_fatal(&self) -> bool {
        matches!(self, RlcError::MaxRetxReached { .. })
    }
}

/// Upper user-plane layer as seen from RLC
pub trait PdcpInterface: Send + Sync {
    /// Reassembled SDU received on `lcid`
    fn write_pdu(&self, lcid: Lcid, sdu: Bytes);
    
    /// SDUs with these PDCP SNs were acknowledged by the peer
    fn notify_delivery(&self, lcid: Lcid, pdcp_sns: &[u32]);
    
    /// SDUs with these PDCP SNs were abandoned after max retransmissions
    fn notify_failure(&self, lcid: Lcid, pdcp_sns: &[u32]);
}

/// Control-plane layer as seen from RLC
pub trait RrcInterface: Send + Sync {
    /// A PDU on `lcid` reached the retransmission limit
    fn max_retx_attempted(&self, lcid: Lcid);
    
    /// The peer sent an inconsistent status report on `lcid`
    fn protocol_failure(&self, lcid: Lcid);
    
    /// Bearer name used in logs
    fn rb_name(&self, lcid: Lcid) -> String {
        lcid.rb_name()
    }
}

/// RLC layer with one AM entity per logical channel
pub struct RlcLayer {
    pdcp: Arc<dyn PdcpInterface>,
    rrc: Arc<dyn RrcInterface>,
    bearers: RwLock<HashMap<Lcid, Arc<RlcAm>>>,
}

impl RlcLayer {
    /// Create a new RLC layer instance
    pub fn new(pdcp: Arc<dyn PdcpInterface>, rrc: Arc<dyn RrcInterface>) -> Self {
        Self {
            pdcp,
            rrc,
            bearers: RwLock::new(HashMap::new()),
        }
    }
    
    fn read_bearers(&self) -> RwLockReadGuard<'_, HashMap<Lcid, Arc<RlcAm>>> {
        self.bearers.read().unwrap_or_else(PoisonError::into_inner)
    }
    
    fn write_bearers(&self) -> RwLockWriteGuard<'_, HashMap<Lcid, Arc<RlcAm>>> {
        self.bearers.write().unwrap_or_else(PoisonError::into_inner)
    }
    
    /// Look up a bearer, cloning the handle so the map lock is released
    pub fn bearer(&self, lcid: Lcid) -> Result<Arc<RlcAm>, RlcError> {
        self.read_bearers()
            .get(&lcid)
            .cloned()
            .ok_or(RlcError::UnknownBearer(lcid))
    }
    
    /// Add an AM bearer
    pub fn add_bearer(&self, lcid: Lcid, config: RlcConfig) -> Result<(), RlcError> {
        let mut bearers = self.write_bearers();
        if bearers.contains_key(&lcid) {
            warn!("Bearer {} already configured", self.rrc.rb_name(lcid));
            return Err(RlcError::BearerExists(lcid));
        }
        
        let entity = RlcAm::new(lcid, config, self.pdcp.clone(), self.rrc.clone())?;
        info!("Added AM bearer {} (LCID={})", entity.rb_name(), lcid);
        bearers.insert(lcid, Arc::new(entity));
        Ok(())
    }
    
    /// Remove a bearer, stopping its entity
    pub fn del_bearer(&self, lcid: Lcid) -> Result<(), RlcError> {
        let entity = self.write_bearers().remove(&lcid).ok_or(RlcError::UnknownBearer(lcid))?;
        entity.stop();
        info!("Deleted bearer {} (LCID={})", entity.rb_name(), lcid);
        Ok(())
    }
    
    pub fn has_bearer(&self, lcid: Lcid) -> bool {
        self.read_bearers().contains_key(&lcid)
    }
    
    /// Move a bearer to another LCID, keeping its state
    /// 
    /// Handles obtained through `bearer()` before the change refer to the
    /// old entity, which is stopped; look the bearer up again afterwards.
    pub fn change_lcid(&self, old_lcid: Lcid, new_lcid: Lcid) -> Result<(), RlcError> {
        let mut bearers = self.write_bearers();
        if bearers.contains_key(&new_lcid) {
            warn!("Can't change LCID {} to {}, target in use", old_lcid, new_lcid);
            return Err(RlcError::BearerExists(new_lcid));
        }
        let entity = bearers.remove(&old_lcid).ok_or(RlcError::UnknownBearer(old_lcid))?;
        let config = entity.config();
        
        // Entities report upwards with their LCID, so the state moves to a new entity
        let moved = RlcAm::new(new_lcid, config, self.pdcp.clone(), self.rrc.clone())?;
        moved.take_state_from(&entity);
        info!("Changed LCID of bearer from {} to {}", old_lcid, new_lcid);
        bearers.insert(new_lcid, Arc::new(moved));
        Ok(())
    }
    
    /// Active logical channels in ascending order
    pub fn lcids(&self) -> Vec<Lcid> {
        let mut lcids: Vec<Lcid> = self.read_bearers().keys().copied().collect();
        lcids.sort();
        lcids
    }
    
    fn entities(&self) -> Vec<Arc<RlcAm>> {
        let bearers = self.read_bearers();
        let mut entities: Vec<Arc<RlcAm>> = bearers.values().cloned().collect();
        entities.sort_by_key(|e| e.lcid());
        entities
    }
    
    pub fn write_sdu(&self, lcid: Lcid, sdu: Bytes, pdcp_sn: u32) -> Result<(), RlcError> {
        self.bearer(lcid)?.write_sdu(sdu, pdcp_sn)
    }
    
    pub fn discard_sdu(&self, lcid: Lcid, pdcp_sn: u32) -> Result<bool, RlcError> {
        Ok(self.bearer(lcid)?.discard_sdu(pdcp_sn))
    }
    
    pub fn sdu_queue_is_full(&self, lcid: Lcid) -> bool {
        self.bearer(lcid).map(|e| e.sdu_queue_is_full()).unwrap_or(false)
    }
    
    pub fn has_data(&self, lcid: Lcid) -> bool {
        self.bearer(lcid).map(|e| e.has_data()).unwrap_or(false)
    }
    
    pub fn get_buffer_state(&self, lcid: Lcid) -> usize {
        self.bearer(lcid).map(|e| e.get_buffer_state()).unwrap_or(0)
    }
    
    pub fn get_buffer_state_split(&self, lcid: Lcid) -> BufferState {
        self.bearer(lcid)
            .map(|e| e.get_buffer_state_split())
            .unwrap_or_default()
    }
    
    /// MAC grant of `nof_bytes` on `lcid`
    pub fn read_pdu(&self, lcid: Lcid, nof_bytes: usize) -> Result<Bytes, RlcError> {
        Ok(self.bearer(lcid)?.read_pdu(nof_bytes))
    }
    
    /// PDU received from MAC on `lcid`
    pub fn write_pdu(&self, lcid: Lcid, pdu: &[u8]) -> Result<(), RlcError> {
        self.bearer(lcid)?.write_pdu(pdu)
    }
    
    pub fn suspend_bearer(&self, lcid: Lcid) -> Result<bool, RlcError> {
        Ok(self.bearer(lcid)?.suspend())
    }
    
    pub fn resume_bearer(&self, lcid: Lcid) -> Result<(), RlcError> {
        self.bearer(lcid)?.resume()
    }
    
    pub fn is_suspended(&self, lcid: Lcid) -> bool {
        self.bearer(lcid).map(|e| e.is_suspended()).unwrap_or(false)
    }
    
    /// Reestablish every bearer
    pub fn reestablish(&self) {
        info!("Reestablishing all RLC bearers");
        for entity in self.entities() {
            entity.reestablish();
        }
    }
    
    pub fn reestablish_bearer(&self, lcid: Lcid) -> Result<(), RlcError> {
        self.bearer(lcid)?.reestablish();
        Ok(())
    }
    
    /// Stop every bearer; the transmit paths stay disabled
    pub fn stop(&self) {
        for entity in self.entities() {
            entity.stop();
        }
    }
    
    pub fn empty_queue(&self) {
        for entity in self.entities() {
            entity.empty_queue();
        }
    }
    
    /// Advance all bearer timers by 1 ms
    pub fn tick(&self) {
        for entity in self.entities() {
            entity.tick();
        }
    }
    
    /// Snapshot of all bearer counters; counters are reset afterwards
    pub fn get_metrics(&self) -> BTreeMap<Lcid, RlcBearerMetrics> {
        let metrics = self
            .entities()
            .into_iter()
            .map(|entity| {
                let m = entity.get_metrics();
                entity.reset_metrics();
                (entity.lcid(), m)
            })
            .collect();
        debug!("Collected RLC metrics");
        metrics
    }
    
    pub fn reset_metrics(&self) {
        for entity in self.entities() {
            entity.reset_metrics();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdcp::{PdcpConfig, PdcpLayer};
    use crate::rrc::RrcLayer;
    
    fn layer() -> (RlcLayer, Arc<PdcpLayer>, Arc<RrcLayer>) {
        let pdcp = Arc::new(PdcpLayer::new(PdcpConfig::default()).unwrap());
        let rrc = Arc::new(RrcLayer::new());
        let rlc = RlcLayer::new(pdcp.clone(), rrc.clone());
        (rlc, pdcp, rrc)
    }
    
    #[tokio::test]
    async fn test_bearer_lifecycle() {
        let (rlc, _pdcp, _rrc) = layer();
        let drb1 = Lcid(3);
        
        assert!(!rlc.has_bearer(drb1));
        rlc.add_bearer(drb1, RlcConfig::default()).unwrap();
        assert!(rlc.has_bearer(drb1));
        assert_eq!(
            rlc.add_bearer(drb1, RlcConfig::default()),
            Err(RlcError::BearerExists(drb1))
        );
        
        rlc.del_bearer(drb1).unwrap();
        assert!(!rlc.has_bearer(drb1));
        assert_eq!(rlc.del_bearer(drb1), Err(RlcError::UnknownBearer(drb1)));
    }
    
    #[tokio::test]
    async fn test_invalid_bearer_config() {
        let (rlc, _pdcp, _rrc) = layer();
        let config = RlcConfig {
            sn_field_length: 12,
            ..Default::default()
        };
        assert!(matches!(
            rlc.add_bearer(Lcid(3), config),
            Err(RlcError::InvalidConfiguration(_))
        ));
        assert!(!rlc.has_bearer(Lcid(3)));
    }
    
    #[tokio::test]
    async fn test_unknown_bearer_operations() {
        let (rlc, _pdcp, _rrc) = layer();
        let lcid = Lcid(4);
        assert_eq!(
            rlc.write_sdu(lcid, Bytes::from_static(b"x"), 0),
            Err(RlcError::UnknownBearer(lcid))
        );
        assert!(rlc.read_pdu(lcid, 100).is_err());
        assert_eq!(rlc.get_buffer_state(lcid), 0);
        assert!(!rlc.has_data(lcid));
    }
    
    #[tokio::test]
    async fn test_loopback_between_layers() {
        let (tx, _tx_pdcp, _tx_rrc) = layer();
        let (rx, rx_pdcp, _rx_rrc) = layer();
        let lcid = Lcid(3);
        tx.add_bearer(lcid, RlcConfig::default()).unwrap();
        rx.add_bearer(lcid, RlcConfig::default()).unwrap();
        
        for i in 0..3u8 {
            tx.write_sdu(lcid, Bytes::from(vec![i; 10]), i as u32).unwrap();
        }
        assert!(tx.has_data(lcid));
        
        let pdu = tx.read_pdu(lcid, 100).unwrap();
        rx.write_pdu(lcid, &pdu).unwrap();
        
        let sdus = rx_pdcp.take_rx_sdus();
        assert_eq!(sdus.len(), 3);
        assert!(sdus.iter().all(|(l, _)| *l == lcid));
        assert_eq!(sdus[2].1, Bytes::from(vec![2u8; 10]));
        
        let metrics = tx.get_metrics();
        assert_eq!(metrics[&lcid].num_tx_sdus, 3);
        assert_eq!(metrics[&lcid].num_tx_pdus, 1);
        // Reading metrics resets them
        assert_eq!(tx.get_metrics()[&lcid].num_tx_sdus, 0);
    }
    
    #[tokio::test]
    async fn test_change_lcid_keeps_state() {
        let (rlc, _pdcp, _rrc) = layer();
        rlc.add_bearer(Lcid(3), RlcConfig::default()).unwrap();
        rlc.write_sdu(Lcid(3), Bytes::from_static(&[1, 2, 3]), 0).unwrap();
        rlc.add_bearer(Lcid(5), RlcConfig::default()).unwrap();
        let stale = rlc.bearer(Lcid(3)).unwrap();
        
        assert_eq!(rlc.change_lcid(Lcid(3), Lcid(5)), Err(RlcError::BearerExists(Lcid(5))));
        rlc.change_lcid(Lcid(3), Lcid(4)).unwrap();
        
        assert!(!rlc.has_bearer(Lcid(3)));
        assert_eq!(rlc.lcids(), vec![Lcid(4), Lcid(5)]);
        assert_eq!(rlc.get_buffer_state(Lcid(4)), 5);
        assert_eq!(rlc.bearer(Lcid(4)).unwrap().rb_name(), "DRB2");
        
        // The handle taken before the move no longer carries traffic
        assert_eq!(
            stale.write_sdu(Bytes::from_static(&[4]), 1),
            Err(RlcError::TxDisabled)
        );
        assert!(stale.read_pdu(100).is_empty());
        assert!(!stale.has_data());
        assert_eq!(rlc.get_buffer_state(Lcid(4)), 5);
    }
    
    #[tokio::test]
    async fn test_suspend_and_stop() {
        let (rlc, _pdcp, _rrc) = layer();
        let lcid = Lcid(3);
        rlc.add_bearer(lcid, RlcConfig::default()).unwrap();
        rlc.write_sdu(lcid, Bytes::from_static(&[1, 2, 3]), 0).unwrap();
        
        assert!(rlc.suspend_bearer(lcid).unwrap());
        assert!(rlc.is_suspended(lcid));
        assert_eq!(rlc.get_buffer_state(lcid), 0);
        rlc.resume_bearer(lcid).unwrap();
        assert_eq!(rlc.get_buffer_state(lcid), 5);
        
        rlc.stop();
        assert_eq!(rlc.get_buffer_state(lcid), 0);
        assert_eq!(
            rlc.write_sdu(lcid, Bytes::from_static(&[1]), 1),
            Err(RlcError::TxDisabled)
        );
        
        rlc.reestablish();
        rlc.write_sdu(lcid, Bytes::from_static(&[1]), 1).unwrap();
        assert_eq!(rlc.get_buffer_state(lcid), 3);
        
        rlc.empty_queue();
        assert_eq!(rlc.get_buffer_state(lcid), 0);
    }
}
