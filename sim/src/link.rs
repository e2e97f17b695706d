//! Loopback link between two RLC AM stacks
//!
//! Each side owns a PDCP, RRC and RLC instance. The channel carries PDUs
//! instantly and drops them with a configured probability.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use common::Lcid;
use layers::pdcp::{PdcpConfig, PdcpLayer};
use layers::rlc::{RlcBearerMetrics, RlcError, RlcLayer};
use layers::rrc::RrcLayer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ChannelConfig, SimConfig};

/// Per side counters, all from the point of view of that side
#[derive(Debug, Clone, Default, Serialize)]
pub struct SideReport {
    pub sdus_offered: u64,
    pub sdus_rejected: u64,
    pub sdus_received: u64,
    /// SDUs of the peer that never arrived
    pub sdus_lost: u64,
    /// SDUs of the peer received out of order or corrupted
    pub sdus_out_of_order: u64,
    pub pdus_sent: u64,
    pub pdus_dropped: u64,
    pub pdus_rejected: u64,
    pub reestablishments: u64,
    pub metrics: RlcBearerMetrics,
}

/// Result of a run
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub ticks: u64,
    pub loss: f64,
    pub enb: SideReport,
    pub ue: SideReport,
}

impl SimReport {
    /// Nothing was lost, reordered or left undelivered
    pub fn is_clean(&self) -> bool {
        [&self.enb, &self.ue]
            .iter()
            .all(|side| side.sdus_lost == 0 && side.sdus_out_of_order == 0)
    }
}

struct Side {
    name: &'static str,
    pdcp: Arc<PdcpLayer>,
    rrc: Arc<RrcLayer>,
    rlc: RlcLayer,
    /// SDUs sent and not yet seen at the peer
    in_flight: VecDeque<Bytes>,
    report: SideReport,
}

impl Side {
    fn new(name: &'static str, cfg: &SimConfig, lcid: Lcid) -> Result<Self> {
        let pdcp = Arc::new(PdcpLayer::new(PdcpConfig::default())?);
        let rrc = Arc::new(RrcLayer::new());
        let rlc = RlcLayer::new(pdcp.clone(), rrc.clone());
        rlc.add_bearer(lcid, cfg.bearer.clone())?;
        Ok(Self {
            name,
            pdcp,
            rrc,
            rlc,
            in_flight: VecDeque::new(),
            report: SideReport::default(),
        })
    }

    fn offer_sdus(&mut self, rng: &mut StdRng, lcid: Lcid, count: u32, max_size: usize) {
        for _ in 0..count {
            if self.rlc.sdu_queue_is_full(lcid) {
                self.report.sdus_rejected += 1;
                continue;
            }
            let size = rng.gen_range(1..=max_size);
            let sdu: Bytes = (0..size).map(|_| rng.gen::<u8>()).collect::<Vec<_>>().into();
            let pdcp_sn = self.pdcp.next_tx_sn();
            match self.rlc.write_sdu(lcid, sdu.clone(), pdcp_sn) {
                Ok(()) => {
                    self.report.sdus_offered += 1;
                    self.in_flight.push_back(sdu);
                }
                Err(e) => {
                    debug!("{}: SDU rejected: {}", self.name, e);
                    self.report.sdus_rejected += 1;
                }
            }
        }
    }

    /// Match SDUs received from `peer` against what it sent
    fn check_rx_sdus(&mut self, peer: &mut Side) {
        for (_, sdu) in self.pdcp.take_rx_sdus() {
            self.report.sdus_received += 1;
            match peer.in_flight.iter().position(|sent| *sent == sdu) {
                Some(pos) => {
                    if pos > 0 {
                        warn!("{}: {} SDUs missing before PDCP SDU of {} B", self.name, pos, sdu.len());
                    }
                    self.report.sdus_lost += pos as u64;
                    peer.in_flight.drain(..=pos);
                }
                None => {
                    warn!("{}: Unexpected SDU of {} B", self.name, sdu.len());
                    self.report.sdus_out_of_order += 1;
                }
            }
        }
    }

    fn has_data(&self, lcid: Lcid) -> bool {
        self.rlc.has_data(lcid) || !self.in_flight.is_empty()
    }
}

/// Two stacks connected by a lossy channel
pub struct Link {
    cfg: SimConfig,
    lcid: Lcid,
    rng: StdRng,
    tick: u64,
    enb: Side,
    ue: Side,
}

impl Link {
    pub fn new(cfg: SimConfig) -> Result<Self> {
        cfg.validate()?;
        let lcid = Lcid(cfg.run.lcid);
        Ok(Self {
            rng: StdRng::seed_from_u64(cfg.run.seed),
            enb: Side::new("eNB", &cfg, lcid)?,
            ue: Side::new("UE", &cfg, lcid)?,
            lcid,
            tick: 0,
            cfg,
        })
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// Traffic phase is over and nothing is pending, or the drain time ran out
    pub fn finished(&self) -> bool {
        let run = &self.cfg.run;
        if self.tick < run.duration_ms {
            return false;
        }
        let idle = !self.enb.has_data(self.lcid) && !self.ue.has_data(self.lcid);
        idle || self.tick >= run.duration_ms + run.drain_ms
    }

    /// Simulate one millisecond
    pub fn step(&mut self) -> Result<()> {
        let run = &self.cfg.run;
        if self.tick < run.duration_ms {
            self.enb.offer_sdus(&mut self.rng, self.lcid, run.sdu_rate, run.max_sdu_size);
            self.ue.offer_sdus(&mut self.rng, self.lcid, run.sdu_rate, run.max_sdu_size);
        }

        carry(&mut self.rng, &self.cfg.channel, self.lcid, &mut self.enb, &mut self.ue)?;
        carry(&mut self.rng, &self.cfg.channel, self.lcid, &mut self.ue, &mut self.enb)?;

        self.enb.rlc.tick();
        self.ue.rlc.tick();

        self.ue.check_rx_sdus(&mut self.enb);
        self.enb.check_rx_sdus(&mut self.ue);

        self.handle_radio_link_failures()?;

        self.tick += 1;
        if self.tick % 1000 == 0 {
            self.log_stats();
        }
        Ok(())
    }

    /// Run to completion without pacing
    pub fn run(&mut self) -> Result<SimReport> {
        while !self.finished() {
            self.step()?;
        }
        self.report()
    }

    /// A max-retx failure on either side resets the bearer on both
    fn handle_radio_link_failures(&mut self) -> Result<()> {
        let failed = self.enb.rrc.handle_radio_link_failures(&self.enb.rlc)
            + self.ue.rrc.handle_radio_link_failures(&self.ue.rlc);
        if failed == 0 {
            return Ok(());
        }

        warn!("Radio link failure at {} ms, reestablishing both sides", self.tick);
        self.ue.report.sdus_lost += self.enb.in_flight.len() as u64;
        self.enb.report.sdus_lost += self.ue.in_flight.len() as u64;
        for side in [&mut self.enb, &mut self.ue] {
            side.rlc.reestablish_bearer(self.lcid)?;
            side.report.reestablishments += 1;
            side.in_flight.clear();
        }
        Ok(())
    }

    fn log_stats(&self) {
        for side in [&self.enb, &self.ue] {
            let r = &side.report;
            info!(
                "{} @ {} ms: offered={} received={} lost={} pdus_sent={} pdus_dropped={}",
                side.name, self.tick, r.sdus_offered, r.sdus_received, r.sdus_lost, r.pdus_sent, r.pdus_dropped
            );
        }
    }

    pub fn report(&self) -> Result<SimReport> {
        // SDUs the peer still has in flight never arrived
        let side_report = |side: &Side, peer: &Side| -> Result<SideReport> {
            let mut report = side.report.clone();
            report.metrics = side.rlc.bearer(self.lcid)?.get_metrics();
            report.sdus_lost += peer.in_flight.len() as u64;
            Ok(report)
        };

        Ok(SimReport {
            ticks: self.tick,
            loss: self.cfg.channel.loss,
            enb: side_report(&self.enb, &self.ue)?,
            ue: side_report(&self.ue, &self.enb)?,
        })
    }
}

/// Move one PDU from `from` to `to` over the channel
fn carry(rng: &mut StdRng, channel: &ChannelConfig, lcid: Lcid, from: &mut Side, to: &mut Side) -> Result<()> {
    let grant = rng.gen_range(channel.min_grant..=channel.max_grant);
    let pdu = from.rlc.read_pdu(lcid, grant)?;
    if pdu.is_empty() {
        return Ok(());
    }
    from.report.pdus_sent += 1;

    if channel.loss > 0.0 && rng.gen_bool(channel.loss) {
        debug!("{} -> {}: Dropping PDU ({} B)", from.name, to.name, pdu.len());
        from.report.pdus_dropped += 1;
        return Ok(());
    }

    match to.rlc.write_pdu(lcid, &pdu) {
        Ok(()) => {}
        Err(e @ RlcError::MaxRetxReached { .. }) => warn!("{}: {}", to.name, e),
        Err(e) => {
            debug!("{}: PDU rejected: {}", to.name, e);
            to.report.pdus_rejected += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;

    fn sim_config(loss: f64, duration_ms: u64) -> SimConfig {
        let mut cfg = SimConfig::default();
        cfg.channel.loss = loss;
        cfg.run = RunConfig {
            duration_ms,
            seed: 42,
            ..Default::default()
        };
        cfg
    }

    #[test]
    fn test_lossless_run() {
        let mut link = Link::new(sim_config(0.0, 200)).unwrap();
        let report = link.run().unwrap();

        assert!(report.is_clean());
        assert!(report.ticks >= 200);
        assert!(report.ticks < 200 + 2000);
        for (tx, rx) in [(&report.enb, &report.ue), (&report.ue, &report.enb)] {
            assert!(tx.sdus_offered > 0);
            assert_eq!(tx.sdus_offered, rx.sdus_received);
            assert_eq!(tx.metrics.num_tx_sdus, rx.metrics.num_rx_sdus);
            assert_eq!(tx.metrics.num_tx_sdu_bytes, rx.metrics.num_rx_sdu_bytes);
            assert_eq!(tx.pdus_dropped, 0);
        }
    }

    #[test]
    fn test_lossy_run_keeps_order() {
        let mut cfg = sim_config(0.05, 300);
        cfg.bearer.max_retx_thresh = 16;
        let mut link = Link::new(cfg).unwrap();
        let report = link.run().unwrap();

        assert_eq!(report.enb.sdus_out_of_order, 0);
        assert_eq!(report.ue.sdus_out_of_order, 0);
        assert!(report.enb.pdus_dropped + report.ue.pdus_dropped > 0);
        assert!(report.enb.sdus_received > 0);
    }

    #[test]
    fn test_same_seed_same_run() {
        let first = Link::new(sim_config(0.1, 100)).unwrap().run().unwrap();
        let second = Link::new(sim_config(0.1, 100)).unwrap().run().unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }
}
