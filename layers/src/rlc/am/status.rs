//! Status reporting
//! 
//! Builds STATUS PDUs from the receive window and applies received ones
//! to the transmit window.

use tracing::{debug, error, info, warn};

use super::pdu::{Nack, StatusPdu, SO_END_OF_PDU, WINDOW_SIZE};
use super::rx::Receiver;
use super::tx::{RetxEntry, Transmitter};
use super::window::{sn_add, sn_distance};
use super::Upcall;
use crate::rlc::RlcError;

impl Receiver {
    /// Build a status report of at most `max_bytes`
    /// 
    /// NACKs that do not fit are dropped from the end and ACK_SN stays below
    /// the first dropped NACK.
    pub(super) fn build_status_pdu(&mut self, max_bytes: usize) -> Option<StatusPdu> {
        let mut status = StatusPdu::new(self.vr_r);
        let mut sn = self.vr_r;
        let vr_ms = sn_distance(self.vr_r, self.vr_ms);
        
        while sn_distance(self.vr_r, sn) <= vr_ms && status.nacks.len() < WINDOW_SIZE as usize {
            if self.window.contains(sn) || sn == self.vr_ms {
                status.ack_sn = sn;
            } else {
                status.nacks.push(Nack::Pdu { sn });
            }
            
            if status.packed_len() > max_bytes {
                if status.nacks.pop().is_none() {
                    warn!(
                        "{} Failed to generate status PDU, {} B granted",
                        self.rb_name, max_bytes
                    );
                    return None;
                }
                if !status.is_valid() {
                    debug!("{} Truncated status would NACK ACK_SN, reporting ACK only", self.rb_name);
                    status = StatusPdu::new(self.vr_r);
                }
                break;
            }
            sn = sn_add(sn, 1);
        }
        
        self.do_status = false;
        self.poll_received = false;
        Some(status)
    }
    
    /// Size of the status report that would be sent without grant limit
    pub(super) fn status_pdu_length(&self) -> usize {
        let mut status = StatusPdu::new(self.vr_ms);
        let mut sn = self.vr_r;
        while sn_distance(self.vr_r, sn) < sn_distance(self.vr_r, self.vr_ms)
            && status.nacks.len() < WINDOW_SIZE as usize
        {
            if !self.window.contains(sn) {
                status.nacks.push(Nack::Pdu { sn });
            }
            sn = sn_add(sn, 1);
        }
        status.packed_len()
    }
}

impl Transmitter {
    /// Release acknowledged PDUs and queue NACKed ones for retransmission
    pub(super) fn apply_status_pdu(
        &mut self,
        status: &StatusPdu,
        upcalls: &mut Vec<Upcall>,
    ) -> Result<(), RlcError> {
        if !self.enabled || self.max_retx_reached {
            debug!("{} Ignoring status PDU, Tx disabled", self.rb_name);
            return Err(RlcError::TxDisabled);
        }
        
        info!("{} Rx status PDU: {}", self.rb_name, status);
        
        // ACK_SN must lie in [VT(A), VT(S)]
        let base = self.vt_a;
        if sn_distance(base, status.ack_sn) > WINDOW_SIZE || sn_distance(status.ack_sn, self.vt_s) > WINDOW_SIZE {
            warn!(
                "{} Received invalid status PDU (ack_sn={}, vt_a={}, vt_s={}), dropping",
                self.rb_name, status.ack_sn, self.vt_a, self.vt_s
            );
            return Err(RlcError::InvalidStatus {
                ack_sn: status.ack_sn,
                vt_a: self.vt_a,
                vt_s: self.vt_s,
            });
        }
        
        if sn_distance(base, self.poll_sn) < sn_distance(base, status.ack_sn) {
            debug!("{} Stopping pollRetx timer", self.rb_name);
            self.poll_retx_timer.stop();
        }
        
        // NACKs replace any previously scheduled retransmissions
        if !status.nacks.is_empty() {
            self.retx_queue.clear();
        }
        
        let ack = sn_distance(base, status.ack_sn);
        let vt_s = sn_distance(base, self.vt_s);
        let mut sn = base;
        let mut update_vt_a = true;
        let mut delivered = Vec::new();
        
        while sn_distance(base, sn) < ack && sn_distance(base, sn) < vt_s {
            if status.is_nacked(sn) {
                update_vt_a = false;
                for nack in status.nacks.iter().filter(|nack| nack.sn() == sn) {
                    self.schedule_nack(nack, upcalls);
                }
            } else {
                if let Some(pdu) = self.window.remove(sn) {
                    self.delivery.ack(sn, &pdu.pdcp_sns, &mut delivered);
                }
                if update_vt_a {
                    self.vt_a = sn_add(self.vt_a, 1);
                    self.vt_ms = sn_add(self.vt_ms, 1);
                }
            }
            sn = sn_add(sn, 1);
        }
        
        if !self.window.is_empty() && !self.window.contains(self.vt_a) {
            error!(
                "{} VT(A)={} not in Tx window with {} PDUs, signaling protocol failure",
                self.rb_name,
                self.vt_a,
                self.window.len()
            );
            upcalls.push(Upcall::ProtocolFailure);
        }
        
        if !delivered.is_empty() {
            debug!("{} Delivered PDCP SNs {:?}", self.rb_name, delivered);
            upcalls.push(Upcall::Delivered(delivered));
        }
        self.log_state();
        Ok(())
    }
    
    fn schedule_nack(&mut self, nack: &Nack, upcalls: &mut Vec<Upcall>) {
        let sn = nack.sn();
        if self.retx_queue.iter().any(|retx| retx.sn == sn) {
            info!("{} NACK for SN={} already considered for retx", self.rb_name, sn);
            return;
        }
        let Some(pdu) = self.window.get_mut(sn) else {
            error!("{} NACKed SN={} already removed from Tx window", self.rb_name, sn);
            return;
        };
        
        pdu.retx_count += 1;
        let len = pdu.payload.len();
        self.check_max_retx(sn, upcalls);
        
        let mut retx = RetxEntry {
            sn,
            is_segment: false,
            so_start: 0,
            so_end: len,
        };
        if let Nack::Segment { so_start, so_end, .. } = *nack {
            let so_start = so_start as usize;
            let so_end = if so_end == SO_END_OF_PDU {
                len
            } else {
                so_end as usize + 1
            };
            if so_start < len && so_start < so_end && so_end <= len {
                retx.is_segment = true;
                retx.so_start = so_start;
                retx.so_end = so_end;
            } else {
                warn!(
                    "{} Invalid NACK segment [{}:{}] for SN={} ({} B), retransmitting whole PDU",
                    self.rb_name, so_start, so_end, sn, len
                );
            }
        }
        
        info!(
            "{} Schedule SN={} [{}:{}] for retx",
            self.rb_name, sn, retx.so_start, retx.so_end
        );
        self.retx_queue.push_back(retx);
    }
}
