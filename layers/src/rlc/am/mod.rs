//! RLC Acknowledged Mode entity
//! 
//! `RlcAm` is the externally visible entity of one AM bearer. Transmitter
//! and receiver state live behind a single mutex; calls towards PDCP and
//! RRC are collected while the lock is held and dispatched after it is
//! released, so upper layers may call back into the entity.

pub mod pdu;

mod delivery;
mod rx;
mod status;
mod timer;
mod tx;
mod window;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use common::{bytes_to_hex_truncated, Lcid};
use tracing::{debug, info, trace, warn};

use self::pdu::{is_control_pdu, PduError, StatusPdu};
use self::rx::Receiver;
use self::tx::Transmitter;
use super::{PdcpInterface, RlcBearerMetrics, RlcConfig, RlcError, RrcInterface};

pub use self::tx::BufferState;

/// Upper layer calls produced while the entity lock is held
#[derive(Debug)]
enum Upcall {
    Sdu(Bytes),
    Delivered(Vec<u32>),
    MaxRetx { sn: u16, pdcp_sns: Vec<u32> },
    ProtocolFailure,
}

struct AmState {
    cfg: RlcConfig,
    tx: Transmitter,
    rx: Receiver,
    suspended: bool,
    /// PDUs received while suspended, replayed on resume
    suspended_pdus: VecDeque<Bytes>,
}

impl AmState {
    fn new(rb_name: &str, cfg: RlcConfig) -> Self {
        Self {
            tx: Transmitter::new(rb_name, &cfg),
            rx: Receiver::new(rb_name, &cfg),
            cfg,
            suspended: false,
            suspended_pdus: VecDeque::new(),
        }
    }
    
    fn set_rb_name(&mut self, rb_name: &str) {
        self.tx.rb_name = rb_name.to_string();
        self.rx.rb_name = rb_name.to_string();
    }
    
    fn status_due(&self) -> bool {
        self.rx.do_status && !self.tx.status_prohibit_timer.is_running()
    }
    
    fn buffer_state(&self) -> BufferState {
        if self.suspended {
            return BufferState::default();
        }
        let status_len = self.status_due().then(|| self.rx.status_pdu_length());
        self.tx.buffer_state(status_len)
    }
    
    fn read_pdu(&mut self, nof_bytes: usize, upcalls: &mut Vec<Upcall>) -> Option<Bytes> {
        if !self.tx.enabled {
            return None;
        }
        if self.status_due() {
            return self.build_status_pdu(nof_bytes);
        }
        self.tx.build_pdu(nof_bytes, upcalls)
    }
    
    fn build_status_pdu(&mut self, nof_bytes: usize) -> Option<Bytes> {
        let status = self.rx.build_status_pdu(nof_bytes)?;
        let pdu = status.encode();
        info!("{} Tx status PDU ({} B) - {}", self.tx.rb_name, pdu.len(), status);
        self.tx.status_prohibit_timer.run();
        Some(pdu)
    }
    
    fn write_pdu(&mut self, pdu: &[u8], upcalls: &mut Vec<Upcall>) -> Result<(), RlcError> {
        if !self.tx.enabled {
            debug!("{} Dropping PDU, bearer stopped", self.tx.rb_name);
            return Err(RlcError::InvalidState("bearer stopped".to_string()));
        }
        if is_control_pdu(pdu) {
            let status = StatusPdu::parse(pdu).map_err(|e| {
                warn!("{} Dropping malformed status PDU: {}", self.tx.rb_name, e);
                e
            })?;
            self.tx.apply_status_pdu(&status, upcalls)
        } else {
            self.rx.handle_data_pdu(pdu, upcalls)
        }
    }
    
    fn tick(&mut self, upcalls: &mut Vec<Upcall>) {
        if self.tx.poll_retx_timer.step() {
            self.tx.on_poll_retx_expiry(upcalls);
        }
        if self.tx.status_prohibit_timer.step() {
            debug!("{} Status prohibit timer expired", self.tx.rb_name);
        }
        if self.rx.reordering_timer.step() {
            self.rx.on_reordering_expiry();
        }
    }
    
    fn stop(&mut self) {
        self.tx.stop();
        self.rx.stop();
        self.suspended_pdus.clear();
    }
}

/// One acknowledged mode bearer
pub struct RlcAm {
    lcid: Lcid,
    rb_name: String,
    pdcp: Arc<dyn PdcpInterface>,
    rrc: Arc<dyn RrcInterface>,
    state: Mutex<AmState>,
    metrics: Mutex<RlcBearerMetrics>,
}

impl RlcAm {
    /// Create a configured entity for `lcid`
    pub fn new(
        lcid: Lcid,
        cfg: RlcConfig,
        pdcp: Arc<dyn PdcpInterface>,
        rrc: Arc<dyn RrcInterface>,
    ) -> Result<Self, RlcError> {
        cfg.validate()?;
        let rb_name = rrc.rb_name(lcid);
        debug!(
            "{} Configured AM: t_poll_retx={}, poll_pdu={}, poll_byte={}, max_retx_thresh={}, t_reordering={}, t_status_prohibit={}",
            rb_name,
            cfg.t_poll_retx,
            cfg.poll_pdu,
            cfg.poll_byte,
            cfg.max_retx_thresh,
            cfg.t_reordering,
            cfg.t_status_prohibit
        );
        Ok(Self {
            lcid,
            state: Mutex::new(AmState::new(&rb_name, cfg)),
            rb_name,
            pdcp,
            rrc,
            metrics: Mutex::new(RlcBearerMetrics::default()),
        })
    }
    
    pub fn lcid(&self) -> Lcid {
        self.lcid
    }
    
    pub fn rb_name(&self) -> &str {
        &self.rb_name
    }
    
    fn lock_state(&self) -> MutexGuard<'_, AmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
    
    fn lock_metrics(&self) -> MutexGuard<'_, RlcBearerMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }
    
    /// Apply a new configuration; queued SDUs are dropped
    pub fn configure(&self, cfg: RlcConfig) -> Result<(), RlcError> {
        cfg.validate()?;
        let mut state = self.lock_state();
        state.tx.configure(&cfg);
        state.rx.configure(&cfg);
        state.cfg = cfg;
        info!("{} Reconfigured", self.rb_name);
        Ok(())
    }
    
    pub fn config(&self) -> RlcConfig {
        self.lock_state().cfg.clone()
    }
    
    /// Move all protocol state and counters of `other` into this entity
    /// 
    /// `other` is left stopped, so handles still pointing at it reject
    /// SDUs and PDUs until it is reestablished.
    pub(crate) fn take_state_from(&self, other: &RlcAm) {
        {
            let mut src = other.lock_state();
            let mut dst = self.lock_state();
            std::mem::swap(&mut *src, &mut *dst);
            dst.set_rb_name(&self.rb_name);
            src.stop();
        }
        let metrics = std::mem::take(&mut *other.lock_metrics());
        *self.lock_metrics() = metrics;
    }
    
    /// Queue an SDU for transmission
    pub fn write_sdu(&self, sdu: Bytes, pdcp_sn: u32) -> Result<(), RlcError> {
        let len = sdu.len();
        let result = self.lock_state().tx.write_sdu(pdcp_sn, sdu);
        
        let mut metrics = self.lock_metrics();
        match &result {
            Ok(()) => {
                metrics.num_tx_sdus += 1;
                metrics.num_tx_sdu_bytes += len as u64;
            }
            Err(RlcError::SduQueueFull) => metrics.num_lost_sdus += 1,
            Err(_) => {}
        }
        result
    }
    
    /// Drop a queued SDU that has not been segmented yet
    pub fn discard_sdu(&self, pdcp_sn: u32) -> bool {
        self.lock_state().tx.discard_sdu(pdcp_sn)
    }
    
    pub fn sdu_queue_is_full(&self) -> bool {
        self.lock_state().tx.sdu_queue_is_full()
    }
    
    /// A status report, retransmission or new data is pending
    pub fn has_data(&self) -> bool {
        let state = self.lock_state();
        if state.suspended || !state.tx.enabled {
            return false;
        }
        state.status_due() || state.tx.has_data()
    }
    
    /// Bytes needed to send everything pending, headers included
    pub fn get_buffer_state(&self) -> usize {
        self.get_buffer_state_split().total()
    }
    
    pub fn get_buffer_state_split(&self) -> BufferState {
        self.lock_state().buffer_state()
    }
    
    /// Build the next PDU for a grant of `nof_bytes`, empty if nothing fits
    pub fn read_pdu(&self, nof_bytes: usize) -> Bytes {
        let mut upcalls = Vec::new();
        let pdu = {
            let mut state = self.lock_state();
            if state.suspended {
                None
            } else {
                let pdu = state.read_pdu(nof_bytes, &mut upcalls);
                state.tx.log_state();
                pdu
            }
        };
        
        let pdu = pdu.unwrap_or_default();
        if !pdu.is_empty() {
            trace!("{} Tx PDU {}", self.rb_name, bytes_to_hex_truncated(&pdu, 32));
            let mut metrics = self.lock_metrics();
            metrics.num_tx_pdus += 1;
            metrics.num_tx_pdu_bytes += pdu.len() as u64;
        }
        self.dispatch(upcalls);
        pdu
    }
    
    /// Process a PDU received from the peer
    /// 
    /// Discarded PDUs are reported as errors without affecting the entity;
    /// `MaxRetxReached` is returned when this PDU caused the retransmission
    /// limit to be hit.
    pub fn write_pdu(&self, pdu: &[u8]) -> Result<(), RlcError> {
        if pdu.is_empty() {
            return Err(RlcError::MalformedPdu(PduError::MalformedHeader("empty PDU")));
        }
        trace!("{} Rx PDU {}", self.rb_name, bytes_to_hex_truncated(pdu, 32));
        
        let mut upcalls = Vec::new();
        let result = {
            let mut state = self.lock_state();
            if state.suspended {
                debug!("{} Suspended, buffering PDU ({} B)", self.rb_name, pdu.len());
                state.suspended_pdus.push_back(Bytes::copy_from_slice(pdu));
                return Ok(());
            }
            state.write_pdu(pdu, &mut upcalls)
        };
        
        {
            let mut metrics = self.lock_metrics();
            metrics.num_rx_pdus += 1;
            metrics.num_rx_pdu_bytes += pdu.len() as u64;
        }
        
        let max_retx_sn = upcalls.iter().find_map(|upcall| match upcall {
            Upcall::MaxRetx { sn, .. } => Some(*sn),
            _ => None,
        });
        self.dispatch(upcalls);
        
        match (result, max_retx_sn) {
            (Ok(()), Some(sn)) => Err(RlcError::MaxRetxReached { sn }),
            (result, _) => result,
        }
    }
    
    /// Advance timers by 1 ms
    pub fn tick(&self) {
        let mut upcalls = Vec::new();
        self.lock_state().tick(&mut upcalls);
        self.dispatch(upcalls);
    }
    
    /// Reset all state and resume transmission
    pub fn reestablish(&self) {
        let mut state = self.lock_state();
        state.stop();
        state.tx.reestablish();
        info!("{} Reestablished", self.rb_name);
    }
    
    /// Reset all state, leaving transmission disabled
    pub fn stop(&self) {
        self.lock_state().stop();
        info!("{} Stopped", self.rb_name);
    }
    
    /// Drop queued SDUs
    pub fn empty_queue(&self) {
        self.lock_state().tx.empty_queue();
    }
    
    /// Returns false if already suspended
    pub fn suspend(&self) -> bool {
        let mut state = self.lock_state();
        if state.suspended {
            return false;
        }
        state.suspended = true;
        info!("{} Suspended", self.rb_name);
        true
    }
    
    /// Resume and process PDUs received while suspended
    pub fn resume(&self) -> Result<(), RlcError> {
        let pending = {
            let mut state = self.lock_state();
            if !state.suspended {
                warn!("{} Can't resume, bearer not suspended", self.rb_name);
                return Err(RlcError::InvalidState("bearer not suspended".to_string()));
            }
            state.suspended = false;
            std::mem::take(&mut state.suspended_pdus)
        };
        
        info!("{} Resumed with {} buffered PDUs", self.rb_name, pending.len());
        for pdu in pending {
            if let Err(e) = self.write_pdu(&pdu) {
                debug!("{} Buffered PDU not accepted: {}", self.rb_name, e);
            }
        }
        Ok(())
    }
    
    pub fn is_suspended(&self) -> bool {
        self.lock_state().suspended
    }
    
    pub fn get_metrics(&self) -> RlcBearerMetrics {
        let rx_buffered_bytes = self.lock_state().rx.buffered_bytes();
        let mut metrics = *self.lock_metrics();
        metrics.rx_buffered_bytes = rx_buffered_bytes as u64;
        metrics
    }
    
    pub fn reset_metrics(&self) {
        *self.lock_metrics() = RlcBearerMetrics::default();
    }
    
    fn dispatch(&self, upcalls: Vec<Upcall>) {
        for upcall in upcalls {
            match upcall {
                Upcall::Sdu(sdu) => {
                    {
                        let mut metrics = self.lock_metrics();
                        metrics.num_rx_sdus += 1;
                        metrics.num_rx_sdu_bytes += sdu.len() as u64;
                    }
                    self.pdcp.write_pdu(self.lcid, sdu);
                }
                Upcall::Delivered(pdcp_sns) => self.pdcp.notify_delivery(self.lcid, &pdcp_sns),
                Upcall::MaxRetx { pdcp_sns, .. } => {
                    self.lock_metrics().num_lost_pdus += 1;
                    self.rrc.max_retx_attempted(self.lcid);
                    if !pdcp_sns.is_empty() {
                        self.pdcp.notify_failure(self.lcid, &pdcp_sns);
                    }
                }
                Upcall::ProtocolFailure => self.rrc.protocol_failure(self.lcid),
            }
        }
    }
}
