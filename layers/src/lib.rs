//! Protocol Stack Layers Library
//! 
//! This crate implements the LTE RLC acknowledged mode (3GPP TS 36.322)
//! together with the minimal PDCP and RRC peers it reports to.

pub mod pdcp;
pub mod rlc;
pub mod rrc;

use thiserror::Error;

pub use rlc::RlcError;

/// Common errors for protocol layers
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    
    #[error("RLC error: {0}")]
    Rlc(#[from] RlcError),
}
