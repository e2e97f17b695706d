//! AMD and STATUS PDU formats
//! 
//! Bit-exact packing and parsing of the acknowledged mode data PDU header
//! (including resegmentation fields and length indicators) and of the
//! STATUS control PDU, for the 10-bit sequence number configuration.

use std::fmt;

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use common::BitWriter;
use nom::bits::complete::take;
use nom::IResult;
use thiserror::Error;

/// Size of the sequence number space
pub const SN_MODULUS: u16 = 1024;
/// Transmit and receive window size
pub const WINDOW_SIZE: u16 = 512;
/// Smallest grant that can carry a data PDU: fixed header plus one byte
pub const MIN_DATA_PDU_SIZE: usize = 3;
/// Maximum number of SDU pieces carried in one PDU
pub const MAX_SDUS_PER_PDU: usize = 128;
/// Largest value a length indicator can carry
pub const MAX_LI: usize = 0x7FF;
/// Largest data field addressable by a segment offset
pub const MAX_DATA_FIELD_SIZE: usize = 0x7FFF;
/// SO_end value meaning "up to the last byte of the PDU"
pub const SO_END_OF_PDU: u16 = 0x7FFF;
/// A poll is set every this many SNs when both poll triggers are zero
pub const POLL_PERIODICITY: u16 = 8;

const FIXED_HEADER_LEN: usize = 2;
const SEGMENT_HEADER_LEN: usize = 2;
const STATUS_FIXED_BITS: usize = 15;
const NACK_BITS: usize = 12;
const NACK_SO_BITS: usize = 30;
const CPT_STATUS: u16 = 0;

/// Errors raised while parsing PDUs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PduError {
    #[error("Malformed header: {0}")]
    MalformedHeader(&'static str),
    
    #[error("Length indicators sum to {li_sum} B but data field is {payload_len} B")]
    LengthMismatch { li_sum: usize, payload_len: usize },
    
    #[error("Unsupported control PDU type {0}")]
    UnsupportedControlPdu(u16),
}

bitflags! {
    /// Framing info (FI) field of a data PDU
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FramingInfo: u8 {
        /// First byte of the data field does not start an SDU
        const NOT_START_ALIGNED = 0b10;
        /// Last byte of the data field does not end an SDU
        const NOT_END_ALIGNED = 0b01;
    }
}

impl FramingInfo {
    /// Data field starts with the first byte of an SDU
    pub fn is_start_aligned(self) -> bool {
        !self.contains(Self::NOT_START_ALIGNED)
    }
    
    /// Data field ends with the last byte of an SDU
    pub fn is_end_aligned(self) -> bool {
        !self.contains(Self::NOT_END_ALIGNED)
    }
}

/// Resegmentation fields, present when RF=1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Last segment flag (LSF)
    pub last: bool,
    /// Segment offset (SO) in bytes within the original data field
    pub so: u16,
}

/// Header of an AMD PDU or AMD PDU segment
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataPduHeader {
    /// Poll bit
    pub poll: bool,
    /// Framing info
    pub fi: FramingInfo,
    /// Sequence number
    pub sn: u16,
    /// Set for PDU segments
    pub segment: Option<SegmentInfo>,
    /// Length indicators, one per SDU piece except the last
    pub li: Vec<u16>,
}

impl DataPduHeader {
    /// Header for a new, start and end aligned PDU
    pub fn new(sn: u16) -> Self {
        Self {
            sn,
            ..Default::default()
        }
    }
    
    /// Header length for the given resegmentation flag and number of LIs
    pub fn packed_len_for(segment: bool, n_li: usize) -> usize {
        let seg_len = if segment { SEGMENT_HEADER_LEN } else { 0 };
        FIXED_HEADER_LEN + seg_len + (n_li * 3 + 1) / 2
    }
    
    /// Packed header length in bytes
    pub fn packed_len(&self) -> usize {
        Self::packed_len_for(self.segment.is_some(), self.li.len())
    }
    
    /// Whether this header describes a PDU segment
    pub fn is_segment(&self) -> bool {
        self.segment.is_some()
    }
    
    /// Segment offset, 0 for full PDUs
    pub fn so(&self) -> usize {
        self.segment.map_or(0, |s| s.so as usize)
    }
    
    /// Sum of all length indicators
    pub fn li_sum(&self) -> usize {
        self.li.iter().map(|&li| li as usize).sum()
    }
    
    /// Check the length indicators against the received data field
    /// 
    /// Every LI is non-zero and the LIs leave at least one byte for the
    /// last SDU piece.
    pub fn check_payload(&self, payload_len: usize) -> Result<(), PduError> {
        if self.li.contains(&0) {
            return Err(PduError::MalformedHeader("zero length indicator"));
        }
        let li_sum = self.li_sum();
        if li_sum >= payload_len {
            return Err(PduError::LengthMismatch { li_sum, payload_len });
        }
        Ok(())
    }
    
    /// Append the packed header to `buf`
    pub fn write(&self, buf: &mut BytesMut) {
        let mut writer = BitWriter::with_capacity(self.packed_len());
        writer.put_flag(true);
        writer.put_flag(self.segment.is_some());
        writer.put_flag(self.poll);
        writer.put_bits(self.fi.bits() as u32, 2);
        writer.put_flag(!self.li.is_empty());
        writer.put_bits(self.sn as u32, 10);
        
        if let Some(segment) = self.segment {
            writer.put_flag(segment.last);
            writer.put_bits(segment.so as u32, 15);
        }
        
        for (i, &li) in self.li.iter().enumerate() {
            writer.put_flag(i + 1 < self.li.len());
            writer.put_bits(li as u32, 11);
        }
        
        buf.extend_from_slice(&writer.finish());
    }
    
    /// Parse a header, returning it with the number of header bytes consumed
    pub fn parse(pdu: &[u8]) -> Result<(Self, usize), PduError> {
        let mut reader = BitReader::new(pdu);
        
        if !reader.read_flag()? {
            return Err(PduError::MalformedHeader("not a data PDU"));
        }
        let rf = reader.read_flag()?;
        let poll = reader.read_flag()?;
        let fi = FramingInfo::from_bits_truncate(reader.read(2)? as u8);
        let mut extension = reader.read_flag()?;
        let sn = reader.read(10)?;
        
        let segment = if rf {
            let last = reader.read_flag()?;
            let so = reader.read(15)?;
            Some(SegmentInfo { last, so })
        } else {
            None
        };
        
        let mut li = Vec::new();
        while extension {
            extension = reader.read_flag()?;
            li.push(reader.read(11)?);
        }
        
        let header = Self { poll, fi, sn, segment, li };
        Ok((header, reader.bytes_consumed()))
    }
}

impl fmt::Display for DataPduHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[DATA, RF={}, P={}, FI={}, SN={}",
            self.segment.is_some() as u8,
            self.poll as u8,
            self.fi.bits(),
            self.sn,
        )?;
        if let Some(segment) = self.segment {
            write!(f, ", LSF={}, SO={}", segment.last as u8, segment.so)?;
        }
        write!(f, ", N_li={}", self.li.len())?;
        if !self.li.is_empty() {
            write!(f, " {:?}", self.li)?;
        }
        write!(f, "]")
    }
}

/// Negative acknowledgement of a PDU or a byte range of it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nack {
    /// The whole PDU is missing
    Pdu { sn: u16 },
    /// Bytes `so_start..=so_end` are missing; `SO_END_OF_PDU` reaches the end
    Segment { sn: u16, so_start: u16, so_end: u16 },
}

impl Nack {
    /// NACKed sequence number
    pub fn sn(&self) -> u16 {
        match *self {
            Nack::Pdu { sn } | Nack::Segment { sn, .. } => sn,
        }
    }
    
    fn packed_bits(&self) -> usize {
        match self {
            Nack::Pdu { .. } => NACK_BITS,
            Nack::Segment { .. } => NACK_BITS + NACK_SO_BITS,
        }
    }
}

/// STATUS control PDU
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusPdu {
    /// First SN not yet acknowledged
    pub ack_sn: u16,
    /// Missing PDUs or byte ranges below `ack_sn`
    pub nacks: Vec<Nack>,
}

impl StatusPdu {
    /// Status acknowledging everything below `ack_sn`
    pub fn new(ack_sn: u16) -> Self {
        Self {
            ack_sn,
            nacks: Vec::new(),
        }
    }
    
    /// Packed length in bytes
    pub fn packed_len(&self) -> usize {
        let bits = STATUS_FIXED_BITS + self.nacks.iter().map(Nack::packed_bits).sum::<usize>();
        (bits + 7) / 8
    }
    
    /// A status must never NACK its own ACK_SN
    pub fn is_valid(&self) -> bool {
        self.nacks.iter().all(|nack| nack.sn() != self.ack_sn)
    }
    
    /// Whether `sn` is NACKed by this status
    pub fn is_nacked(&self, sn: u16) -> bool {
        self.nacks.iter().any(|nack| nack.sn() == sn)
    }
    
    /// Append the packed status to `buf`
    pub fn write(&self, buf: &mut BytesMut) {
        let mut writer = BitWriter::with_capacity(self.packed_len());
        writer.put_flag(false);
        writer.put_bits(CPT_STATUS as u32, 3);
        writer.put_bits(self.ack_sn as u32, 10);
        writer.put_flag(!self.nacks.is_empty());
        
        for (i, nack) in self.nacks.iter().enumerate() {
            let more = i + 1 < self.nacks.len();
            match *nack {
                Nack::Pdu { sn } => {
                    writer.put_bits(sn as u32, 10);
                    writer.put_flag(more);
                    writer.put_flag(false);
                }
                Nack::Segment { sn, so_start, so_end } => {
                    writer.put_bits(sn as u32, 10);
                    writer.put_flag(more);
                    writer.put_flag(true);
                    writer.put_bits(so_start as u32, 15);
                    writer.put_bits(so_end as u32, 15);
                }
            }
        }
        
        buf.extend_from_slice(&writer.finish());
    }
    
    /// Packed status as a standalone buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.packed_len());
        self.write(&mut buf);
        buf.freeze()
    }
    
    /// Parse a STATUS PDU
    pub fn parse(pdu: &[u8]) -> Result<Self, PduError> {
        let mut reader = BitReader::new(pdu);
        
        if reader.read_flag()? {
            return Err(PduError::MalformedHeader("not a control PDU"));
        }
        let cpt = reader.read(3)?;
        if cpt != CPT_STATUS {
            return Err(PduError::UnsupportedControlPdu(cpt));
        }
        
        let ack_sn = reader.read(10)?;
        let mut more = reader.read_flag()?;
        let mut nacks = Vec::new();
        while more {
            let sn = reader.read(10)?;
            more = reader.read_flag()?;
            let has_so = reader.read_flag()?;
            if has_so {
                let so_start = reader.read(15)?;
                let so_end = reader.read(15)?;
                nacks.push(Nack::Segment { sn, so_start, so_end });
            } else {
                nacks.push(Nack::Pdu { sn });
            }
        }
        
        Ok(Self { ack_sn, nacks })
    }
}

impl fmt::Display for StatusPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ACK_SN = {}, N_nack = {}", self.ack_sn, self.nacks.len())?;
        if !self.nacks.is_empty() {
            write!(f, ", NACK_SN = ")?;
            for nack in &self.nacks {
                match *nack {
                    Nack::Pdu { sn } => write!(f, "[{}]", sn)?,
                    Nack::Segment { sn, so_start, so_end } => {
                        write!(f, "[{} {}:{}]", sn, so_start, so_end)?
                    }
                }
            }
        }
        Ok(())
    }
}

/// D/C bit is 0 for control PDUs
pub fn is_control_pdu(pdu: &[u8]) -> bool {
    pdu.first().is_some_and(|&b| b & 0x80 == 0)
}

type BitInput<'a> = (&'a [u8], usize);

fn take_bits(input: BitInput<'_>, count: usize) -> IResult<BitInput<'_>, u16> {
    take(count)(input)
}

struct BitReader<'a> {
    len: usize,
    input: BitInput<'a>,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            len: data.len(),
            input: (data, 0),
        }
    }
    
    fn read(&mut self, count: usize) -> Result<u16, PduError> {
        let (rest, value) =
            take_bits(self.input, count).map_err(|_| PduError::MalformedHeader("truncated"))?;
        self.input = rest;
        Ok(value)
    }
    
    fn read_flag(&mut self) -> Result<bool, PduError> {
        Ok(self.read(1)? == 1)
    }
    
    /// Bytes touched so far, counting a partially read byte
    fn bytes_consumed(&self) -> usize {
        let (rest, offset) = self.input;
        self.len - rest.len() + usize::from(offset > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_header_lengths() {
        assert_eq!(DataPduHeader::packed_len_for(false, 0), 2);
        assert_eq!(DataPduHeader::packed_len_for(false, 1), 4);
        assert_eq!(DataPduHeader::packed_len_for(false, 2), 5);
        assert_eq!(DataPduHeader::packed_len_for(false, 3), 7);
        assert_eq!(DataPduHeader::packed_len_for(true, 0), 4);
        assert_eq!(DataPduHeader::packed_len_for(true, 4), 10);
    }
    
    #[test]
    fn test_data_header_bits() {
        let header = DataPduHeader {
            poll: true,
            fi: FramingInfo::NOT_END_ALIGNED,
            sn: 0x2AB,
            segment: None,
            li: vec![],
        };
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        // D/C=1 RF=0 P=1 FI=01 E=0 SN=10 1010 1011
        assert_eq!(&buf[..], &[0xAA, 0xAB]);
        
        let (parsed, len) = DataPduHeader::parse(&buf).unwrap();
        assert_eq!(len, 2);
        assert_eq!(parsed, header);
    }
    
    #[test]
    fn test_segment_header_with_lis() {
        let header = DataPduHeader {
            poll: false,
            fi: FramingInfo::NOT_START_ALIGNED | FramingInfo::NOT_END_ALIGNED,
            sn: 7,
            segment: Some(SegmentInfo { last: true, so: 1234 }),
            li: vec![10, 2047, 3],
        };
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        assert_eq!(buf.len(), header.packed_len());
        assert_eq!(buf.len(), 9);
        
        buf.extend_from_slice(&[0u8; 2100]);
        let (parsed, len) = DataPduHeader::parse(&buf).unwrap();
        assert_eq!(len, 9);
        assert_eq!(parsed, header);
        assert_eq!(parsed.li_sum(), 2060);
        assert_eq!(parsed.so(), 1234);
    }
    
    #[test]
    fn test_truncated_header() {
        assert_eq!(
            DataPduHeader::parse(&[0x84]),
            Err(PduError::MalformedHeader("truncated"))
        );
        // E=1 announces an LI that is missing
        assert!(DataPduHeader::parse(&[0x84, 0x00]).is_err());
        assert!(DataPduHeader::parse(&[0x00, 0x00]).is_err());
    }
    
    #[test]
    fn test_length_mismatch() {
        let header = DataPduHeader {
            li: vec![5, 5],
            ..DataPduHeader::new(1)
        };
        assert!(header.check_payload(11).is_ok());
        assert_eq!(
            header.check_payload(9),
            Err(PduError::LengthMismatch { li_sum: 10, payload_len: 9 })
        );
        // Nothing left for the last SDU
        assert_eq!(
            header.check_payload(10),
            Err(PduError::LengthMismatch { li_sum: 10, payload_len: 10 })
        );
        
        let header = DataPduHeader {
            li: vec![0, 1],
            ..DataPduHeader::new(1)
        };
        assert_eq!(
            header.check_payload(3),
            Err(PduError::MalformedHeader("zero length indicator"))
        );
    }
    
    #[test]
    fn test_framing_info() {
        assert!(FramingInfo::empty().is_start_aligned());
        assert!(FramingInfo::empty().is_end_aligned());
        assert!(!FramingInfo::NOT_START_ALIGNED.is_start_aligned());
        assert!(FramingInfo::NOT_START_ALIGNED.is_end_aligned());
        assert!(FramingInfo::NOT_END_ALIGNED.is_start_aligned());
        assert!(!FramingInfo::NOT_END_ALIGNED.is_end_aligned());
    }
    
    #[test]
    fn test_status_ack_only() {
        let status = StatusPdu::new(5);
        let bytes = status.encode();
        assert_eq!(bytes.len(), 2);
        assert_eq!(&bytes[..], &[0x00, 0x14]);
        assert!(is_control_pdu(&bytes));
        assert_eq!(StatusPdu::parse(&bytes).unwrap(), status);
    }
    
    #[test]
    fn test_status_with_nacks() {
        let status = StatusPdu {
            ack_sn: 10,
            nacks: vec![
                Nack::Pdu { sn: 3 },
                Nack::Segment { sn: 7, so_start: 100, so_end: SO_END_OF_PDU },
                Nack::Pdu { sn: 9 },
            ],
        };
        // 15 + 12 + 42 + 12 bits
        assert_eq!(status.packed_len(), 11);
        
        let bytes = status.encode();
        assert_eq!(bytes.len(), 11);
        let parsed = StatusPdu::parse(&bytes).unwrap();
        assert_eq!(parsed, status);
        assert!(parsed.is_nacked(7));
        assert!(!parsed.is_nacked(8));
        assert!(parsed.is_valid());
        assert_eq!(
            parsed.to_string(),
            "ACK_SN = 10, N_nack = 3, NACK_SN = [3][7 100:32767][9]"
        );
    }
    
    #[test]
    fn test_status_validity() {
        let status = StatusPdu {
            ack_sn: 4,
            nacks: vec![Nack::Pdu { sn: 4 }],
        };
        assert!(!status.is_valid());
    }
    
    #[test]
    fn test_unsupported_control_pdu() {
        // D/C=0 CPT=001
        assert_eq!(
            StatusPdu::parse(&[0x10, 0x00]),
            Err(PduError::UnsupportedControlPdu(1))
        );
        assert!(StatusPdu::parse(&[0x80, 0x00]).is_err());
    }
}
