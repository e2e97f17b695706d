//! TOML configuration for the link simulator
//!
//! Every field has a default so partial files (or none at all) are accepted.

use anyhow::{bail, Context};
use layers::rlc::RlcConfig;
use serde::{Deserialize, Serialize};

/// Top level simulator configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SimConfig {
    /// AM bearer configuration used on both sides
    #[serde(default)]
    pub bearer: RlcConfig,
    /// Loopback channel
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Traffic and run length
    #[serde(default)]
    pub run: RunConfig,
}

/// Loopback channel configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    /// Probability that a PDU is dropped, per direction
    #[serde(default)]
    pub loss: f64,
    /// Smallest MAC grant in bytes
    #[serde(default = "default_min_grant")]
    pub min_grant: usize,
    /// Largest MAC grant in bytes
    #[serde(default = "default_max_grant")]
    pub max_grant: usize,
}

fn default_min_grant() -> usize {
    10
}

fn default_max_grant() -> usize {
    1000
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            loss: 0.0,
            min_grant: default_min_grant(),
            max_grant: default_max_grant(),
        }
    }
}

/// Traffic and run length configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Simulated time with traffic, in ms
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    /// Extra time to let retransmissions settle, in ms
    #[serde(default = "default_drain_ms")]
    pub drain_ms: u64,
    /// SDUs offered per side and tick
    #[serde(default = "default_sdu_rate")]
    pub sdu_rate: u32,
    /// Largest SDU in bytes
    #[serde(default = "default_max_sdu_size")]
    pub max_sdu_size: usize,
    /// Logical channel of the simulated bearer
    #[serde(default = "default_lcid")]
    pub lcid: u8,
    /// RNG seed
    #[serde(default)]
    pub seed: u64,
}

fn default_duration_ms() -> u64 {
    1000
}

fn default_drain_ms() -> u64 {
    2000
}

fn default_sdu_rate() -> u32 {
    1
}

fn default_max_sdu_size() -> usize {
    500
}

fn default_lcid() -> u8 {
    3
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_duration_ms(),
            drain_ms: default_drain_ms(),
            sdu_rate: default_sdu_rate(),
            max_sdu_size: default_max_sdu_size(),
            lcid: default_lcid(),
            seed: 0,
        }
    }
}

impl SimConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: SimConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.bearer.validate()?;
        if !(0.0..=1.0).contains(&self.channel.loss) {
            bail!("Loss probability {} not in [0, 1]", self.channel.loss);
        }
        if self.channel.min_grant == 0 || self.channel.min_grant > self.channel.max_grant {
            bail!(
                "Invalid grant range {}..={}",
                self.channel.min_grant,
                self.channel.max_grant
            );
        }
        if self.run.max_sdu_size == 0 {
            bail!("max_sdu_size must be at least 1");
        }
        if common::Lcid::new(self.run.lcid).is_none() {
            bail!("LCID {} out of range", self.run.lcid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let cfg = SimConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.bearer, RlcConfig::default());
        assert_eq!(cfg.channel.loss, 0.0);
        assert_eq!(cfg.run.duration_ms, 1000);
        assert_eq!(cfg.run.lcid, 3);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_config() {
        let cfg = SimConfig::from_toml_str(
            r#"
            [bearer]
            t_poll_retx = 45
            poll_byte = -1

            [channel]
            loss = 0.1
            max_grant = 200

            [run]
            seed = 7
            "#,
        )
        .unwrap();
        assert_eq!(cfg.bearer.t_poll_retx, 45);
        assert_eq!(cfg.bearer.poll_byte, -1);
        assert_eq!(cfg.bearer.max_retx_thresh, 4);
        assert_eq!(cfg.channel.loss, 0.1);
        assert_eq!(cfg.channel.min_grant, 10);
        assert_eq!(cfg.channel.max_grant, 200);
        assert_eq!(cfg.run.seed, 7);
        assert_eq!(cfg.run.sdu_rate, 1);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_invalid_config() {
        let mut cfg = SimConfig::default();
        cfg.channel.loss = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = SimConfig::default();
        cfg.channel.min_grant = 2000;
        assert!(cfg.validate().is_err());

        let mut cfg = SimConfig::default();
        cfg.bearer.sn_field_length = 5;
        assert!(cfg.validate().is_err());

        assert!(SimConfig::from_toml_str("[channel]\nloss = \"high\"").is_err());
        assert!(SimConfig::from_toml_file("/nonexistent/sim.toml").is_err());
    }
}
