//! Common Types for the RLC stack
//! 
//! Defines fundamental types used throughout the protocol stack

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical Channel Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Lcid(pub u8);

impl Lcid {
    /// Highest LCID usable for a radio bearer
    pub const MAX: u8 = 10;
    
    /// Signalling bearer SRB0 (CCCH)
    pub const SRB0: Self = Self(0);
    /// Signalling bearer SRB1
    pub const SRB1: Self = Self(1);
    /// Signalling bearer SRB2
    pub const SRB2: Self = Self(2);
    
    /// Create a new LCID with validation
    pub fn new(value: u8) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }
    
    /// Get the LCID value
    pub fn value(&self) -> u8 {
        self.0
    }
    
    /// Whether the channel carries a signalling radio bearer
    pub fn is_srb(&self) -> bool {
        self.0 <= 2
    }
    
    /// Radio bearer name used in logs, e.g. "SRB1" or "DRB1"
    pub fn rb_name(&self) -> String {
        if self.is_srb() {
            format!("SRB{}", self.0)
        } else {
            format!("DRB{}", self.0 - 2)
        }
    }
}

impl fmt::Display for Lcid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_lcid_validation() {
        assert!(Lcid::new(0).is_some());
        assert!(Lcid::new(10).is_some());
        assert!(Lcid::new(11).is_none());
    }
    
    #[test]
    fn test_rb_names() {
        assert_eq!(Lcid::SRB0.rb_name(), "SRB0");
        assert_eq!(Lcid::SRB2.rb_name(), "SRB2");
        assert_eq!(Lcid(3).rb_name(), "DRB1");
        assert!(!Lcid(3).is_srb());
    }
}
