//! Common Utilities
//! 
//! Helpers shared by the protocol layers: hex dumps for trace logging and
//! an MSB-first bit writer used by the bit-packed PDU headers.

use bytes::{BufMut, BytesMut};

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex dump limited to the first `max_len` bytes
pub fn bytes_to_hex_truncated(data: &[u8], max_len: usize) -> String {
    if data.len() <= max_len {
        return bytes_to_hex(data);
    }
    format!("{} .. ({} more bytes)", bytes_to_hex(&data[..max_len]), data.len() - max_len)
}

/// Writes fields of arbitrary bit width, most significant bit first
#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: BytesMut,
    current: u8,
    used: u8,
}

impl BitWriter {
    /// Create a writer with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: BytesMut::with_capacity(capacity),
            current: 0,
            used: 0,
        }
    }
    
    /// Append the `width` least significant bits of `value`
    pub fn put_bits(&mut self, value: u32, width: u8) {
        debug_assert!(width <= 32);
        for i in (0..width).rev() {
            let bit = ((value >> i) & 1) as u8;
            self.current |= bit << (7 - self.used);
            self.used += 1;
            if self.used == 8 {
                self.bytes.put_u8(self.current);
                self.current = 0;
                self.used = 0;
            }
        }
    }
    
    /// Append a single flag bit
    pub fn put_flag(&mut self, flag: bool) {
        self.put_bits(flag as u32, 1);
    }
    
    /// Number of bits written so far
    pub fn bit_len(&self) -> usize {
        self.bytes.len() * 8 + self.used as usize
    }
    
    /// Zero-pad to the next byte boundary and return the packed bytes
    pub fn finish(mut self) -> BytesMut {
        if self.used > 0 {
            self.bytes.put_u8(self.current);
        }
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_bytes_to_hex() {
        let data = vec![0x12, 0x34, 0xAB, 0xCD];
        assert_eq!(bytes_to_hex(&data), "12 34 ab cd");
    }
    
    #[test]
    fn test_bytes_to_hex_truncated() {
        let data = vec![0x01, 0x02, 0x03, 0x04];
        assert_eq!(bytes_to_hex_truncated(&data, 8), "01 02 03 04");
        assert_eq!(bytes_to_hex_truncated(&data, 2), "01 02 .. (2 more bytes)");
    }
    
    #[test]
    fn test_bit_writer_packs_msb_first() {
        let mut writer = BitWriter::with_capacity(2);
        writer.put_flag(true);
        writer.put_flag(false);
        writer.put_bits(0b101010, 6);
        assert_eq!(writer.bit_len(), 8);
        
        writer.put_bits(0b11, 2);
        assert_eq!(writer.bit_len(), 10);
        
        let packed = writer.finish();
        assert_eq!(&packed[..], &[0xAA, 0xC0]);
    }
    
    #[test]
    fn test_bit_writer_crosses_byte_boundaries() {
        let mut writer = BitWriter::default();
        writer.put_bits(0, 5);
        writer.put_bits(0x3FF, 10);
        writer.put_flag(true);
        assert_eq!(&writer.finish()[..], &[0x07, 0xFF]);
    }
}
