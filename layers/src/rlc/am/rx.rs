//! AM receiver
//! 
//! Stores incoming data PDUs in the receive window, merges PDU segments,
//! reassembles SDUs in SN order and drives t-Reordering.

use std::collections::{BTreeSet, HashMap};

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, info, warn};

use super::pdu::{DataPduHeader, FramingInfo, PduError, WINDOW_SIZE};
use super::timer::Timer;
use super::window::{sn_add, sn_distance, SnWindow};
use super::Upcall;
use crate::rlc::{RlcConfig, RlcError};

/// Received PDU or PDU segment
#[derive(Debug, Clone)]
pub(super) struct RxPdu {
    pub header: DataPduHeader,
    pub payload: Bytes,
}

impl RxPdu {
    fn so(&self) -> usize {
        self.header.so()
    }
    
    fn end(&self) -> usize {
        self.so() + self.payload.len()
    }
}

pub(super) struct Receiver {
    pub rb_name: String,
    pub window: SnWindow<RxPdu>,
    /// Segments of SNs not yet complete, sorted by SO
    segments: HashMap<u16, Vec<RxPdu>>,
    /// SDU being reassembled
    rx_sdu: BytesMut,
    
    /// Lowest SN not yet reassembled
    pub vr_r: u16,
    /// First SN outside the receive window
    pub vr_mr: u16,
    /// SN following the one that started t-Reordering
    pub vr_x: u16,
    /// Highest status-reportable SN
    pub vr_ms: u16,
    /// SN following the highest SN received
    pub vr_h: u16,
    
    pub poll_received: bool,
    pub do_status: bool,
    pub reordering_timer: Timer,
}

impl Receiver {
    pub fn new(rb_name: &str, cfg: &RlcConfig) -> Self {
        Self {
            rb_name: rb_name.to_string(),
            window: SnWindow::new(),
            segments: HashMap::new(),
            rx_sdu: BytesMut::new(),
            vr_r: 0,
            vr_mr: WINDOW_SIZE,
            vr_x: 0,
            vr_ms: 0,
            vr_h: 0,
            poll_received: false,
            do_status: false,
            reordering_timer: Timer::new("t-Reordering", cfg.t_reordering),
        }
    }
    
    pub fn configure(&mut self, cfg: &RlcConfig) {
        self.reordering_timer.set_duration(cfg.t_reordering);
    }
    
    pub fn stop(&mut self) {
        self.window.clear();
        self.segments.clear();
        self.rx_sdu.clear();
        self.vr_r = 0;
        self.vr_mr = WINDOW_SIZE;
        self.vr_x = 0;
        self.vr_ms = 0;
        self.vr_h = 0;
        self.poll_received = false;
        self.do_status = false;
        self.reordering_timer.stop();
    }
    
    /// `VR(R) <= sn < VR(MR)`
    fn inside_window(&self, sn: u16) -> bool {
        sn_distance(self.vr_r, sn) < sn_distance(self.vr_r, self.vr_mr)
    }
    
    fn dist(&self, sn: u16) -> u16 {
        sn_distance(self.vr_r, sn)
    }
    
    /// Payload bytes held in the receive window
    pub fn buffered_bytes(&self) -> usize {
        self.window.values().map(|pdu| pdu.payload.len()).sum()
    }
    
    pub fn handle_data_pdu(&mut self, pdu: &[u8], upcalls: &mut Vec<Upcall>) -> Result<(), RlcError> {
        let (header, header_len) = DataPduHeader::parse(pdu).map_err(|e| {
            warn!("{} Dropping malformed data PDU ({} B): {}", self.rb_name, pdu.len(), e);
            RlcError::MalformedPdu(e)
        })?;
        let payload = Bytes::copy_from_slice(&pdu[header_len..]);
        if payload.is_empty() {
            warn!("{} Dropping data PDU SN={} without data field", self.rb_name, header.sn);
            return Err(RlcError::MalformedPdu(PduError::MalformedHeader("no data field")));
        }
        if let Err(e) = header.check_payload(payload.len()) {
            warn!("{} Dropping corrupted PDU SN={}: {}", self.rb_name, header.sn, e);
            return Err(RlcError::MalformedPdu(e));
        }
        
        debug!("{} Rx {} ({} B)", self.rb_name, header, pdu.len());
        if header.is_segment() {
            self.handle_segment(RxPdu { header, payload }, upcalls)
        } else {
            self.handle_full_pdu(RxPdu { header, payload }, upcalls)
        }
    }
    
    fn handle_full_pdu(&mut self, pdu: RxPdu, upcalls: &mut Vec<Upcall>) -> Result<(), RlcError> {
        let sn = pdu.header.sn;
        let poll = pdu.header.poll;
        
        if !self.inside_window(sn) {
            if poll {
                info!("{} Status packet requested through polling bit", self.rb_name);
                self.do_status = true;
            }
            info!(
                "{} SN={} outside rx window [{}:{}] - discarding",
                self.rb_name, sn, self.vr_r, self.vr_mr
            );
            return Err(RlcError::DuplicateOrOutOfWindow { sn });
        }
        if self.window.contains(sn) {
            if poll {
                info!("{} Status packet requested through polling bit", self.rb_name);
                self.do_status = true;
            }
            info!("{} Discarding duplicate SN={}", self.rb_name, sn);
            return Err(RlcError::DuplicateOrOutOfWindow { sn });
        }
        
        info!("{} Rx data PDU SN={} ({} B)", self.rb_name, sn, pdu.payload.len());
        self.window.insert(sn, pdu);
        self.update_vr_h(sn);
        while self.window.contains(self.vr_ms) {
            self.vr_ms = sn_add(self.vr_ms, 1);
        }
        self.check_poll(sn, poll);
        
        self.reassemble(upcalls);
        self.update_reordering_timer();
        self.log_state();
        Ok(())
    }
    
    fn handle_segment(&mut self, seg: RxPdu, upcalls: &mut Vec<Upcall>) -> Result<(), RlcError> {
        let sn = seg.header.sn;
        let poll = seg.header.poll;
        
        if !self.inside_window(sn) {
            if poll {
                info!("{} Status packet requested through polling bit", self.rb_name);
                self.do_status = true;
            }
            info!(
                "{} SN={} outside rx window [{}:{}] - discarding",
                self.rb_name, sn, self.vr_r, self.vr_mr
            );
            return Err(RlcError::DuplicateOrOutOfWindow { sn });
        }
        if self.window.contains(sn) {
            if poll {
                self.do_status = true;
            }
            info!("{} Discarding segment of already received SN={}", self.rb_name, sn);
            return Err(RlcError::DuplicateOrOutOfWindow { sn });
        }
        
        info!(
            "{} Rx data PDU segment SN={} SO={} ({} B)",
            self.rb_name,
            sn,
            seg.so(),
            seg.payload.len()
        );
        
        let complete = match self.segments.get_mut(&sn) {
            Some(list) => {
                if poll {
                    info!("{} Status packet requested through polling bit", self.rb_name);
                    self.do_status = true;
                }
                add_segment_and_check(list, seg)
            }
            None => {
                let mut list = Vec::new();
                let complete = add_segment_and_check(&mut list, seg);
                if complete.is_none() {
                    self.segments.insert(sn, list);
                    self.update_vr_h(sn);
                    self.check_poll(sn, poll);
                    self.update_reordering_timer();
                }
                complete
            }
        };
        
        match complete {
            Some(pdu) => {
                self.segments.remove(&sn);
                debug!("{} Reassembled SN={} from segments", self.rb_name, sn);
                self.handle_full_pdu(pdu, upcalls)
            }
            None => Ok(()),
        }
    }
    
    fn update_vr_h(&mut self, sn: u16) {
        if self.dist(sn) >= self.dist(self.vr_h) {
            self.vr_h = sn_add(sn, 1);
        }
    }
    
    fn check_poll(&mut self, sn: u16, poll: bool) {
        if !poll {
            return;
        }
        info!("{} Status packet requested through polling bit", self.rb_name);
        self.poll_received = true;
        // Reply immediately unless SN is inside the reordering gap
        if self.dist(sn) < self.dist(self.vr_ms) || self.dist(sn) >= self.dist(self.vr_mr) {
            self.do_status = true;
        }
    }
    
    fn update_reordering_timer(&mut self) {
        if self.reordering_timer.is_running() {
            let vr_x_outside = !self.inside_window(self.vr_x) && self.vr_x != self.vr_mr;
            if self.vr_x == self.vr_r || vr_x_outside {
                debug!("{} Stopping reordering timer", self.rb_name);
                self.reordering_timer.stop();
            }
        }
        if !self.reordering_timer.is_running() && self.dist(self.vr_h) > self.dist(self.vr_r) {
            self.reordering_timer.run();
            if self.reordering_timer.is_running() {
                debug!("{} Starting reordering timer, vr_x={}", self.rb_name, self.vr_h);
                self.vr_x = self.vr_h;
            }
        }
    }
    
    /// Deliver complete SDUs from in-sequence PDUs starting at VR(R)
    fn reassemble(&mut self, upcalls: &mut Vec<Upcall>) {
        while let Some(pdu) = self.window.remove(self.vr_r) {
            let mut data = pdu.payload;
            
            if pdu.header.fi.is_start_aligned() && !self.rx_sdu.is_empty() {
                warn!(
                    "{} Dropping {} B of incomplete SDU before SN={}",
                    self.rb_name,
                    self.rx_sdu.len(),
                    self.vr_r
                );
                self.rx_sdu.clear();
            }
            
            let mut corrupted = false;
            for &li in &pdu.header.li {
                let len = li as usize;
                if len == 0 || len > data.len() {
                    error!(
                        "{} Dropping corrupted SN={}: invalid LI {} with {} B left",
                        self.rb_name,
                        self.vr_r,
                        len,
                        data.len()
                    );
                    self.rx_sdu.clear();
                    corrupted = true;
                    break;
                }
                self.rx_sdu.extend_from_slice(&data.split_to(len));
                self.deliver_sdu(upcalls);
            }
            
            if !corrupted {
                self.rx_sdu.extend_from_slice(&data);
                if pdu.header.fi.is_end_aligned() && !self.rx_sdu.is_empty() {
                    self.deliver_sdu(upcalls);
                }
            }
            
            self.segments.remove(&self.vr_r);
            self.vr_r = sn_add(self.vr_r, 1);
            self.vr_mr = sn_add(self.vr_mr, 1);
        }
    }
    
    fn deliver_sdu(&mut self, upcalls: &mut Vec<Upcall>) {
        let sdu = self.rx_sdu.split().freeze();
        debug!("{} Rx SDU ({} B)", self.rb_name, sdu.len());
        upcalls.push(Upcall::Sdu(sdu));
    }
    
    /// t-Reordering expired
    pub fn on_reordering_expiry(&mut self) {
        debug!("{} Reordering timer expired, vr_x={}", self.rb_name, self.vr_x);
        self.vr_ms = self.vr_x;
        while self.window.contains(self.vr_ms) {
            self.vr_ms = sn_add(self.vr_ms, 1);
        }
        if self.poll_received {
            self.do_status = true;
        }
        if self.dist(self.vr_h) > self.dist(self.vr_ms) {
            self.reordering_timer.run();
            self.vr_x = self.vr_h;
        }
        self.log_state();
    }
    
    pub fn log_state(&self) {
        debug!(
            "{} Rx window state: vr_r={} vr_mr={} vr_x={} vr_ms={} vr_h={} window={} segments={}",
            self.rb_name,
            self.vr_r,
            self.vr_mr,
            self.vr_x,
            self.vr_ms,
            self.vr_h,
            self.window.len(),
            self.segments.len()
        );
    }
}

/// Insert `seg` in SO order and return the full PDU once all bytes are present
fn add_segment_and_check(list: &mut Vec<RxPdu>, seg: RxPdu) -> Option<RxPdu> {
    match list.iter().position(|s| s.so() >= seg.so()) {
        Some(i) if list[i].so() == seg.so() => {
            if seg.payload.len() > list[i].payload.len() {
                list[i] = seg;
            }
        }
        Some(i) => list.insert(i, seg),
        None => list.push(seg),
    }
    
    // Look for gaps and drop segments covered by earlier ones
    let mut covered = 0;
    let mut i = 0;
    while i < list.len() {
        if list[i].so() > covered {
            return None;
        }
        if list[i].end() <= covered {
            list.remove(i);
        } else {
            covered = list[i].end();
            i += 1;
        }
    }
    
    let first = list.first()?;
    let last = list.last()?;
    if !last.header.segment.is_some_and(|s| s.last) {
        return None;
    }
    
    let mut header = DataPduHeader::new(first.header.sn);
    if first.header.fi.contains(FramingInfo::NOT_START_ALIGNED) {
        header.fi.insert(FramingInfo::NOT_START_ALIGNED);
    }
    if last.header.fi.contains(FramingInfo::NOT_END_ALIGNED) {
        header.fi.insert(FramingInfo::NOT_END_ALIGNED);
    }
    
    // SDU boundaries in data field coordinates
    let total = covered;
    let mut boundaries = BTreeSet::new();
    let mut data = BytesMut::with_capacity(total);
    for (idx, seg) in list.iter().enumerate() {
        header.poll |= seg.header.poll;
        
        let mut offset = seg.so();
        for &li in &seg.header.li {
            offset += li as usize;
            boundaries.insert(offset);
        }
        if idx + 1 < list.len() && seg.header.fi.is_end_aligned() {
            boundaries.insert(seg.end());
        }
        
        if seg.end() > data.len() {
            let overlap = data.len() - seg.so();
            data.extend_from_slice(&seg.payload[overlap..]);
        }
    }
    
    let mut prev = 0;
    for boundary in boundaries.into_iter().filter(|&b| b > 0 && b < total) {
        header.li.push((boundary - prev) as u16);
        prev = boundary;
    }
    
    Some(RxPdu {
        header,
        payload: data.freeze(),
    })
}
