//! AM transmitter
//! 
//! Segments and concatenates queued SDUs into data PDUs, keeps sent PDUs
//! in the transmit window until acknowledged, and builds retransmissions,
//! resegmenting them when the grant is too small.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use common::bytes_to_hex_truncated;
use tracing::{debug, error, info, trace, warn};

use super::delivery::DeliveryTracker;
use super::pdu::{
    DataPduHeader, FramingInfo, SegmentInfo, MAX_DATA_FIELD_SIZE, MAX_LI, MAX_SDUS_PER_PDU,
    MIN_DATA_PDU_SIZE, SN_MODULUS, WINDOW_SIZE,
};
use super::timer::{PollContext, PollTrigger, Timer};
use super::window::{sn_add, SnWindow};
use super::Upcall;
use crate::rlc::{RlcConfig, RlcError};

/// SDU waiting for transmission
#[derive(Debug, Clone)]
pub(super) struct Sdu {
    pub pdcp_sn: u32,
    pub data: Bytes,
}

/// Sent PDU kept until acknowledged
#[derive(Debug)]
pub(super) struct TxPdu {
    pub header: DataPduHeader,
    pub payload: Bytes,
    pub retx_count: u32,
    /// PDCP SNs of the SDU pieces carried
    pub pdcp_sns: Vec<u32>,
}

/// Pending retransmission of bytes `so_start..so_end` of PDU `sn`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct RetxEntry {
    pub sn: u16,
    pub is_segment: bool,
    pub so_start: usize,
    pub so_end: usize,
}

/// Bytes the transmitter wants to send, split by priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferState {
    /// New data including estimated headers
    pub new_tx: usize,
    /// Status report and head-of-line retransmission
    pub prio_tx: usize,
}

impl BufferState {
    pub fn total(&self) -> usize {
        self.new_tx + self.prio_tx
    }
}

pub(super) struct Transmitter {
    pub rb_name: String,
    pub enabled: bool,
    /// Set once a PDU hits the retransmission limit, cleared by reestablishment
    pub max_retx_reached: bool,
    max_retx_thresh: u32,
    tx_queue_length: usize,
    
    pub sdu_queue: VecDeque<Sdu>,
    sdu_queue_bytes: usize,
    /// SDU partially placed into PDUs
    pub tx_sdu: Option<Sdu>,
    pub window: SnWindow<TxPdu>,
    pub retx_queue: VecDeque<RetxEntry>,
    pub delivery: DeliveryTracker,
    
    /// Lowest SN not yet acknowledged
    pub vt_a: u16,
    /// First SN outside the transmit window
    pub vt_ms: u16,
    /// Next SN for a new PDU
    pub vt_s: u16,
    /// SN of the last PDU sent with the poll bit
    pub poll_sn: u16,
    
    poll: PollTrigger,
    pub poll_retx_timer: Timer,
    pub status_prohibit_timer: Timer,
}

impl Transmitter {
    pub fn new(rb_name: &str, cfg: &RlcConfig) -> Self {
        Self {
            rb_name: rb_name.to_string(),
            enabled: true,
            max_retx_reached: false,
            max_retx_thresh: cfg.max_retx_thresh,
            tx_queue_length: cfg.tx_queue_length,
            sdu_queue: VecDeque::with_capacity(cfg.tx_queue_length),
            sdu_queue_bytes: 0,
            tx_sdu: None,
            window: SnWindow::new(),
            retx_queue: VecDeque::new(),
            delivery: DeliveryTracker::new(),
            vt_a: 0,
            vt_ms: WINDOW_SIZE,
            vt_s: 0,
            poll_sn: 0,
            poll: PollTrigger::new(cfg.poll_pdu, cfg.poll_byte),
            poll_retx_timer: Timer::new("t-PollRetransmit", cfg.t_poll_retx),
            status_prohibit_timer: Timer::new("t-StatusProhibit", cfg.t_status_prohibit),
        }
    }
    
    /// Apply a new configuration, dropping queued SDUs
    pub fn configure(&mut self, cfg: &RlcConfig) {
        self.max_retx_thresh = cfg.max_retx_thresh;
        self.tx_queue_length = cfg.tx_queue_length;
        self.poll = PollTrigger::new(cfg.poll_pdu, cfg.poll_byte);
        self.poll_retx_timer.set_duration(cfg.t_poll_retx);
        self.status_prohibit_timer.set_duration(cfg.t_status_prohibit);
        self.empty_queue();
        self.enabled = true;
    }
    
    /// Drop all state and disable transmission
    pub fn stop(&mut self) {
        self.enabled = false;
        self.max_retx_reached = false;
        self.empty_queue();
        self.window.clear();
        self.retx_queue.clear();
        self.delivery.clear();
        self.vt_a = 0;
        self.vt_ms = WINDOW_SIZE;
        self.vt_s = 0;
        self.poll_sn = 0;
        self.poll.reset();
        self.poll_retx_timer.stop();
        self.status_prohibit_timer.stop();
    }
    
    pub fn reestablish(&mut self) {
        self.stop();
        self.enabled = true;
    }
    
    pub fn empty_queue(&mut self) {
        self.sdu_queue.clear();
        self.sdu_queue_bytes = 0;
        self.tx_sdu = None;
    }
    
    pub fn write_sdu(&mut self, pdcp_sn: u32, data: Bytes) -> Result<(), RlcError> {
        if !self.enabled {
            return Err(RlcError::TxDisabled);
        }
        if data.is_empty() {
            warn!("{} Dropping empty SDU with PDCP SN={}", self.rb_name, pdcp_sn);
            return Err(RlcError::EmptySdu);
        }
        if self.sdu_queue_is_full() {
            warn!(
                "{} Tx SDU queue full ({} SDUs), dropping SDU with PDCP SN={}",
                self.rb_name,
                self.sdu_queue.len(),
                pdcp_sn
            );
            return Err(RlcError::SduQueueFull);
        }
        
        debug!(
            "{} Tx SDU ({} B, PDCP SN={}, queue={} SDUs / {} B)",
            self.rb_name,
            data.len(),
            pdcp_sn,
            self.sdu_queue.len() + 1,
            self.sdu_queue_bytes + data.len()
        );
        self.sdu_queue_bytes += data.len();
        self.sdu_queue.push_back(Sdu { pdcp_sn, data });
        Ok(())
    }
    
    /// Remove a queued SDU that has not been segmented yet
    pub fn discard_sdu(&mut self, pdcp_sn: u32) -> bool {
        let Some(pos) = self.sdu_queue.iter().position(|sdu| sdu.pdcp_sn == pdcp_sn) else {
            debug!("{} Could not discard SDU with PDCP SN={}", self.rb_name, pdcp_sn);
            return false;
        };
        if let Some(sdu) = self.sdu_queue.remove(pos) {
            self.sdu_queue_bytes -= sdu.data.len();
            debug!("{} Discarded SDU with PDCP SN={}", self.rb_name, pdcp_sn);
        }
        true
    }
    
    pub fn sdu_queue_is_full(&self) -> bool {
        self.sdu_queue.len() >= self.tx_queue_length
    }
    
    pub fn window_full(&self) -> bool {
        self.window.len() >= WINDOW_SIZE as usize
    }
    
    fn in_window(&self, sn: u16) -> bool {
        self.window.contains(sn)
    }
    
    /// Data or retransmissions are pending
    pub fn has_data(&self) -> bool {
        if !self.enabled || self.max_retx_reached {
            return false;
        }
        self.retx_queue.iter().any(|retx| self.in_window(retx.sn))
            || !self.sdu_queue.is_empty()
            || self.tx_sdu.is_some()
    }
    
    /// Bytes needed to empty the queues, `status_len` is the pending status report size
    pub fn buffer_state(&self, status_len: Option<usize>) -> BufferState {
        let mut bs = BufferState::default();
        if !self.enabled {
            return bs;
        }
        
        if let Some(len) = status_len {
            bs.prio_tx += len;
        }
        if self.max_retx_reached {
            return bs;
        }
        
        if let Some(retx) = self.retx_queue.iter().find(|retx| self.in_window(retx.sn)) {
            if let Some(len) = self.required_buffer_size(retx) {
                bs.prio_tx += len;
            }
        }
        
        if !self.window_full() {
            let n_sdus = self.sdu_queue.len() + usize::from(self.tx_sdu.is_some());
            let mut n_bytes = self.sdu_queue_bytes + self.tx_sdu.as_ref().map_or(0, |sdu| sdu.data.len());
            // Room for one LI per concatenated SDU, 1.5 B each
            if n_sdus > 1 {
                n_bytes += ((n_sdus - 1) * 3 + 1) / 2;
            }
            if n_bytes > 0 {
                n_bytes += 2;
            }
            bs.new_tx = n_bytes;
        }
        bs
    }
    
    /// Size of the PDU or segment that would carry `retx` in full
    pub fn required_buffer_size(&self, retx: &RetxEntry) -> Option<usize> {
        let pdu = self.window.get(retx.sn)?;
        if !retx.is_segment {
            return Some(pdu.header.packed_len() + pdu.payload.len());
        }
        
        let mut lower = 0;
        let mut n_li = 0;
        for &li in &pdu.header.li {
            if lower >= retx.so_end {
                break;
            }
            let upper = lower + li as usize;
            if upper > retx.so_start && lower < retx.so_end {
                n_li += 1;
            }
            lower = upper;
        }
        Some(DataPduHeader::packed_len_for(true, n_li) + (retx.so_end - retx.so_start))
    }
    
    fn poll_context(&self) -> PollContext {
        PollContext {
            poll_retx_expired: self.poll_retx_timer.is_expired(),
            window_full: self.window_full(),
            queues_empty: self.sdu_queue.is_empty() && self.retx_queue.is_empty(),
            vt_s: self.vt_s,
        }
    }
    
    /// Decide on the poll bit for a PDU about to go out, `poll_sn` is the
    /// highest SN submitted once it is sent
    fn check_poll(&mut self, poll_sn: u16) -> bool {
        let Some(cause) = self.poll.required(self.poll_context()) else {
            return false;
        };
        debug!(
            "{} Setting poll bit ({:?}, {} PDUs / {} B without poll)",
            self.rb_name,
            cause,
            self.poll.pdu_without_poll(),
            self.poll.byte_without_poll()
        );
        self.poll.reset();
        self.poll_sn = poll_sn;
        self.poll_retx_timer.run();
        true
    }
    
    fn last_submitted_sn(&self) -> u16 {
        sn_add(self.vt_s, SN_MODULUS - 1)
    }
    
    /// Signal the retransmission limit once per SN
    pub(super) fn check_max_retx(&mut self, sn: u16, upcalls: &mut Vec<Upcall>) {
        let Some(pdu) = self.window.get(sn) else {
            return;
        };
        if self.max_retx_reached || pdu.retx_count < self.max_retx_thresh {
            return;
        }
        
        warn!(
            "{} Signaling max number of reTx={} for SN={}",
            self.rb_name, pdu.retx_count, sn
        );
        let pdcp_sns = pdu.pdcp_sns.clone();
        for &pdcp_sn in &pdcp_sns {
            self.delivery.remove(pdcp_sn);
        }
        self.max_retx_reached = true;
        self.poll_retx_timer.stop();
        upcalls.push(Upcall::MaxRetx { sn, pdcp_sns });
    }
    
    /// Queue the whole of PDU `sn` for retransmission
    pub fn retransmit_pdu(&mut self, sn: u16, upcalls: &mut Vec<Upcall>) {
        if self.window.is_empty() {
            warn!("{} No PDU to retransmit", self.rb_name);
            return;
        }
        let Some(pdu) = self.window.get_mut(sn) else {
            warn!("{} Can't retransmit unexisting SN={}", self.rb_name, sn);
            return;
        };
        
        pdu.retx_count += 1;
        let so_end = pdu.payload.len();
        self.check_max_retx(sn, upcalls);
        
        info!("{} Schedule SN={} for retx", self.rb_name, sn);
        self.retx_queue.push_back(RetxEntry {
            sn,
            is_segment: false,
            so_start: 0,
            so_end,
        });
    }
    
    /// t-PollRetransmit expired
    pub fn on_poll_retx_expiry(&mut self, upcalls: &mut Vec<Upcall>) {
        if !self.enabled || self.max_retx_reached {
            return;
        }
        debug!("{} {} expired", self.rb_name, self.poll_retx_timer);
        if (self.retx_queue.is_empty() && self.sdu_queue.is_empty()) || self.window_full() {
            self.retransmit_pdu(self.vt_a, upcalls);
        }
    }
    
    /// Next retransmission or new data PDU fitting into `nof_bytes`
    pub fn build_pdu(&mut self, nof_bytes: usize, upcalls: &mut Vec<Upcall>) -> Option<Bytes> {
        if !self.enabled || self.max_retx_reached {
            return None;
        }
        
        if self.window_full() && self.retx_queue.is_empty() {
            self.retransmit_pdu(self.vt_a, upcalls);
            if self.max_retx_reached {
                return None;
            }
        }
        
        if !self.retx_queue.is_empty() {
            let pdu = self.build_retx_pdu(nof_bytes, upcalls);
            if pdu.is_some() || self.max_retx_reached {
                return pdu;
            }
        }
        
        self.build_data_pdu(nof_bytes)
    }
    
    fn build_retx_pdu(&mut self, nof_bytes: usize, upcalls: &mut Vec<Upcall>) -> Option<Bytes> {
        let mut retx = *self.retx_queue.front()?;
        
        // Entries acknowledged in the meantime are stale
        while !self.in_window(retx.sn) {
            self.retx_queue.pop_front();
            match self.retx_queue.front() {
                Some(next) => retx = *next,
                None => {
                    if !self.in_window(self.vt_a) {
                        return None;
                    }
                    self.retransmit_pdu(self.vt_a, upcalls);
                    retx = *self.retx_queue.front()?;
                }
            }
        }
        
        let required = self.required_buffer_size(&retx)?;
        if retx.is_segment || required > nof_bytes {
            debug!(
                "{} Resegmenting SN={}: {} B needed, {} B granted",
                self.rb_name, retx.sn, required, nof_bytes
            );
            return self.build_segment(nof_bytes, retx);
        }
        
        let pdu = self.window.get(retx.sn)?;
        let mut header = pdu.header.clone();
        let payload = pdu.payload.clone();
        let retx_count = pdu.retx_count;
        
        self.retx_queue.pop_front();
        self.poll.record(payload.len() + header.packed_len());
        header.poll = self.check_poll(self.last_submitted_sn());
        
        let mut buf = BytesMut::with_capacity(header.packed_len() + payload.len());
        header.write(&mut buf);
        buf.extend_from_slice(&payload);
        
        info!(
            "{} Retx PDU SN={} ({} B) (attempt {}/{})",
            self.rb_name,
            retx.sn,
            buf.len(),
            retx_count,
            self.max_retx_thresh
        );
        debug!("{} Tx {}", self.rb_name, header);
        Some(buf.freeze())
    }
    
    fn build_segment(&mut self, nof_bytes: usize, mut retx: RetxEntry) -> Option<Bytes> {
        let pdu = self.window.get(retx.sn)?;
        let old_header = pdu.header.clone();
        let payload = pdu.payload.clone();
        
        if !retx.is_segment {
            retx.so_start = 0;
            retx.so_end = payload.len();
        }
        
        let mut header = DataPduHeader {
            poll: false,
            fi: FramingInfo::NOT_START_ALIGNED | FramingInfo::NOT_END_ALIGNED,
            sn: old_header.sn,
            segment: Some(SegmentInfo {
                last: false,
                so: retx.so_start as u16,
            }),
            li: Vec::new(),
        };
        self.poll.record(payload.len() + header.packed_len());
        
        // Reserve room for at least one LI if the original carried any
        let mut head_len = header.packed_len();
        if !old_header.li.is_empty() {
            head_len += 2;
        }
        if nof_bytes <= head_len {
            info!(
                "{} Cannot build a PDU segment: {} B granted, header needs {} B",
                self.rb_name, nof_bytes, head_len
            );
            return None;
        }
        
        let mut pdu_space = nof_bytes - head_len;
        if pdu_space < retx.so_end - retx.so_start {
            retx.so_end = retx.so_start + pdu_space;
        }
        
        if retx.so_start == 0 && old_header.fi.is_start_aligned() {
            header.fi.remove(FramingInfo::NOT_START_ALIGNED);
        }
        
        // Keep the LIs of SDU boundaries that fall inside the segment
        let mut lower = 0;
        let mut upper = 0;
        for &old_li in &old_header.li {
            if lower >= retx.so_end {
                break;
            }
            upper += old_li as usize;
            
            head_len = header.packed_len();
            pdu_space = nof_bytes.saturating_sub(head_len);
            if pdu_space < retx.so_end - retx.so_start {
                retx.so_end = retx.so_start + pdu_space;
            }
            
            if upper > retx.so_start && lower < retx.so_end {
                let mut li = upper - lower;
                if upper > retx.so_end {
                    li -= upper - retx.so_end;
                }
                if lower < retx.so_start {
                    li -= retx.so_start - lower;
                }
                if lower > 0 && lower == retx.so_start {
                    header.fi.remove(FramingInfo::NOT_START_ALIGNED);
                }
                if upper == retx.so_end {
                    header.fi.remove(FramingInfo::NOT_END_ALIGNED);
                }
                
                if retx.so_end > upper {
                    let data_len = retx.so_end - retx.so_start;
                    let with_li = DataPduHeader::packed_len_for(true, header.li.len() + 1);
                    if with_li + data_len <= nof_bytes {
                        header.li.push(li as u16);
                    } else {
                        // No room for another LI, end the segment at this SDU boundary
                        retx.so_end = retx.so_start + header.li_sum() + li;
                        header.fi.remove(FramingInfo::NOT_END_ALIGNED);
                    }
                }
            }
            lower += old_li as usize;
        }
        
        // Segment starts with the SDU following the last LI
        if retx.so_start > 0 && retx.so_start == old_header.li_sum() {
            header.fi.remove(FramingInfo::NOT_START_ALIGNED);
        }
        
        let data_len = retx.so_end - retx.so_start;
        if header.packed_len() + data_len > nof_bytes || data_len == 0 {
            error!(
                "{} Segment of SN={} does not fit: {} B header + {} B data > {} B",
                self.rb_name,
                retx.sn,
                header.packed_len(),
                data_len,
                nof_bytes
            );
            return None;
        }
        
        let front_so_end = self.retx_queue.front()?.so_end;
        if retx.so_end == payload.len() {
            self.retx_queue.pop_front();
            if let Some(segment) = header.segment.as_mut() {
                segment.last = true;
            }
            if old_header.fi.is_end_aligned() {
                header.fi.remove(FramingInfo::NOT_END_ALIGNED);
            }
        } else if front_so_end == retx.so_end {
            self.retx_queue.pop_front();
        } else if let Some(front) = self.retx_queue.front_mut() {
            front.is_segment = true;
            front.so_start = retx.so_end;
        }
        
        header.poll = self.check_poll(self.last_submitted_sn());
        
        let mut buf = BytesMut::with_capacity(header.packed_len() + data_len);
        header.write(&mut buf);
        buf.extend_from_slice(&payload[retx.so_start..retx.so_end]);
        
        info!(
            "{} Retx PDU segment SN={} [{}:{}] ({} B)",
            self.rb_name,
            retx.sn,
            retx.so_start,
            retx.so_end,
            buf.len()
        );
        debug!("{} Tx {}", self.rb_name, header);
        Some(buf.freeze())
    }
    
    fn build_data_pdu(&mut self, nof_bytes: usize) -> Option<Bytes> {
        if self.tx_sdu.is_none() && self.sdu_queue.is_empty() {
            trace!("{} No data available to be sent", self.rb_name);
            return None;
        }
        if self.window_full() {
            debug!("{} Cannot build data PDU, window full", self.rb_name);
            return None;
        }
        if nof_bytes < MIN_DATA_PDU_SIZE {
            debug!(
                "{} Cannot build data PDU, {} B granted, {} B needed",
                self.rb_name, nof_bytes, MIN_DATA_PDU_SIZE
            );
            return None;
        }
        
        let sn = self.vt_s;
        let mut header = DataPduHeader::new(sn);
        let mut pdu_space = nof_bytes.min(MAX_DATA_FIELD_SIZE);
        let mut head_len = header.packed_len();
        let mut payload = BytesMut::with_capacity(pdu_space);
        let mut pdcp_sns = Vec::new();
        let mut last_li = 0;
        
        // Remainder of a partially sent SDU goes first
        if let Some(mut sdu) = self.tx_sdu.take() {
            let to_move = (pdu_space - head_len).min(sdu.data.len());
            payload.extend_from_slice(&sdu.data.split_to(to_move));
            last_li = to_move;
            
            if self.delivery.add_segment(sdu.pdcp_sn, sn) {
                pdcp_sns.push(sdu.pdcp_sn);
                if sdu.data.is_empty() {
                    self.delivery.mark_fully_txed(sdu.pdcp_sn);
                }
            } else {
                warn!(
                    "{} Partially sent SDU with PDCP SN={} is not tracked",
                    self.rb_name, sdu.pdcp_sn
                );
            }
            if !sdu.data.is_empty() {
                self.tx_sdu = Some(sdu);
            }
            pdu_space = pdu_space.saturating_sub(to_move);
            header.fi.insert(FramingInfo::NOT_START_ALIGNED);
        }
        
        // Concatenate further SDUs while there is room
        while pdu_space > head_len && !self.sdu_queue.is_empty() && header.li.len() < MAX_SDUS_PER_PDU {
            if last_li > 0 {
                if last_li > MAX_LI {
                    break;
                }
                header.li.push(last_li as u16);
            }
            head_len = header.packed_len();
            if head_len >= pdu_space {
                header.li.pop();
                break;
            }
            
            let Some(mut sdu) = self.sdu_queue.pop_front() else {
                break;
            };
            self.sdu_queue_bytes -= sdu.data.len();
            if !self.delivery.add_sdu(sdu.pdcp_sn) {
                warn!(
                    "{} PDCP SN={} already marked as undelivered",
                    self.rb_name, sdu.pdcp_sn
                );
            }
            
            let to_move = (pdu_space - head_len).min(sdu.data.len());
            payload.extend_from_slice(&sdu.data.split_to(to_move));
            last_li = to_move;
            
            self.delivery.add_segment(sdu.pdcp_sn, sn);
            pdcp_sns.push(sdu.pdcp_sn);
            if sdu.data.is_empty() {
                self.delivery.mark_fully_txed(sdu.pdcp_sn);
            } else {
                self.tx_sdu = Some(sdu);
            }
            pdu_space = pdu_space.saturating_sub(to_move);
        }
        
        if self.tx_sdu.is_some() {
            header.fi.insert(FramingInfo::NOT_END_ALIGNED);
        }
        if payload.is_empty() {
            error!("{} Generated empty RLC PDU", self.rb_name);
        }
        
        self.poll.record(payload.len() + header.packed_len());
        header.poll = self.check_poll(sn);
        self.vt_s = sn_add(self.vt_s, 1);
        
        let payload = payload.freeze();
        let mut buf = BytesMut::with_capacity(header.packed_len() + payload.len());
        header.write(&mut buf);
        buf.extend_from_slice(&payload);
        
        info!("{} Tx PDU SN={} ({} B)", self.rb_name, sn, buf.len());
        debug!("{} Tx {}", self.rb_name, header);
        trace!("{} {}", self.rb_name, bytes_to_hex_truncated(&buf, 32));
        
        self.window.insert(
            sn,
            TxPdu {
                header,
                payload,
                retx_count: 0,
                pdcp_sns,
            },
        );
        Some(buf.freeze())
    }
    
    pub fn log_state(&self) {
        debug!(
            "{} Tx window state: vt_a={} vt_ms={} vt_s={} poll_sn={} window={} retx_queue={} sdu_queue={} undelivered={}",
            self.rb_name,
            self.vt_a,
            self.vt_ms,
            self.vt_s,
            self.poll_sn,
            self.window.len(),
            self.retx_queue.len(),
            self.sdu_queue.len(),
            self.delivery.len()
        );
    }
}
