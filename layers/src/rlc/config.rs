//! RLC AM bearer configuration
//! 
//! Timer values are in milliseconds; a value of 0 disables the timer.
//! Negative poll thresholds disable the corresponding poll trigger.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

use super::RlcError;

/// Supported SN field lengths in bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum SnFieldLength {
    /// 10-bit SN, 1024 sequence numbers
    Size10 = 10,
}

/// AM bearer parameters
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RlcConfig {
    /// t-PollRetransmit
    #[serde(default = "default_t_poll_retx")]
    pub t_poll_retx: u32,
    /// PDUs between polls
    #[serde(default = "default_poll_pdu")]
    pub poll_pdu: i32,
    /// Bytes between polls
    #[serde(default = "default_poll_byte")]
    pub poll_byte: i32,
    /// Retransmissions before declaring radio link failure
    #[serde(default = "default_max_retx_thresh")]
    pub max_retx_thresh: u32,
    /// t-Reordering
    #[serde(default = "default_t_reordering")]
    pub t_reordering: u32,
    /// t-StatusProhibit
    #[serde(default = "default_t_status_prohibit")]
    pub t_status_prohibit: u32,
    /// SN field length in bits
    #[serde(default = "default_sn_field_length")]
    pub sn_field_length: u8,
    /// SDUs queued before `write_sdu` rejects new ones
    #[serde(default = "default_tx_queue_length")]
    pub tx_queue_length: usize,
}

fn default_t_poll_retx() -> u32 {
    5
}

fn default_poll_pdu() -> i32 {
    4
}

fn default_poll_byte() -> i32 {
    25
}

fn default_max_retx_thresh() -> u32 {
    4
}

fn default_t_reordering() -> u32 {
    5
}

fn default_t_status_prohibit() -> u32 {
    5
}

fn default_sn_field_length() -> u8 {
    10
}

fn default_tx_queue_length() -> usize {
    128
}

/// Largest accepted SDU queue
pub const MAX_TX_QUEUE_LENGTH: usize = 128;

impl Default for RlcConfig {
    fn default() -> Self {
        Self {
            t_poll_retx: default_t_poll_retx(),
            poll_pdu: default_poll_pdu(),
            poll_byte: default_poll_byte(),
            max_retx_thresh: default_max_retx_thresh(),
            t_reordering: default_t_reordering(),
            t_status_prohibit: default_t_status_prohibit(),
            sn_field_length: default_sn_field_length(),
            tx_queue_length: default_tx_queue_length(),
        }
    }
}

impl RlcConfig {
    /// Parsed SN field length
    pub fn sn_field_length(&self) -> Result<SnFieldLength, RlcError> {
        SnFieldLength::from_u8(self.sn_field_length).ok_or_else(|| {
            RlcError::InvalidConfiguration(format!(
                "SN field length {} not supported",
                self.sn_field_length
            ))
        })
    }
    
    /// Check the configuration before applying it to a bearer
    pub fn validate(&self) -> Result<(), RlcError> {
        self.sn_field_length()?;
        if self.tx_queue_length == 0 || self.tx_queue_length > MAX_TX_QUEUE_LENGTH {
            return Err(RlcError::InvalidConfiguration(format!(
                "Tx queue length {} must be in 1..={}",
                self.tx_queue_length, MAX_TX_QUEUE_LENGTH
            )));
        }
        if self.max_retx_thresh == 0 {
            return Err(RlcError::InvalidConfiguration(
                "max_retx_thresh must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_default_config() {
        let cfg = RlcConfig::default();
        assert_eq!(cfg.t_poll_retx, 5);
        assert_eq!(cfg.poll_pdu, 4);
        assert_eq!(cfg.poll_byte, 25);
        assert_eq!(cfg.max_retx_thresh, 4);
        assert_eq!(cfg.tx_queue_length, 128);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.sn_field_length().unwrap(), SnFieldLength::Size10);
    }
    
    #[test]
    fn test_invalid_config() {
        let cfg = RlcConfig {
            sn_field_length: 16,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(RlcError::InvalidConfiguration(_))));
        
        let cfg = RlcConfig {
            tx_queue_length: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        
        let cfg = RlcConfig {
            max_retx_thresh: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
    
    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: RlcConfig = serde_json::from_str(r#"{"poll_pdu": -1, "t_reordering": 35}"#).unwrap();
        assert_eq!(cfg.poll_pdu, -1);
        assert_eq!(cfg.t_reordering, 35);
        assert_eq!(cfg.poll_byte, 25);
        assert_eq!(cfg.t_status_prohibit, 5);
    }
}
