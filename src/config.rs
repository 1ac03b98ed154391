use crate::error::RxwError;
use anyhow::bail;
use rand::Rng;
use std::time::Duration;

/// Smallest packet size that a receive window accepts as its maximum TPDU
pub const MIN_TPDU: u16 = 64;

/// Default Reed-Solomon block length
pub const DEFAULT_FEC_N: u8 = 255;

pub struct RxwConfig {
    /// The largest packet payload accepted by the window. Larger packets are rejected as
    ///  malformed.
    pub max_tpdu: u16,

    /// Capacity of the receive window in packets (not bytes). The effective capacity is the
    ///  larger of this and the number of packets implied by `rxw_secs` and `rxw_max_rte`.
    pub rxw_sqns: u32,
    /// Capacity of the receive window in seconds of data at `rxw_max_rte`
    pub rxw_secs: u32,
    /// bytes per second
    pub rxw_max_rte: u32,

    /// Upper bound of the randomised back-off before a missing packet is NAK'ed. Randomisation
    ///  spreads NAKs from many receivers so the sender's NCF can suppress most of them.
    pub nak_bo_ivl: Duration,
    /// how long to wait for an NCF after sending a NAK
    pub nak_rpt_ivl: Duration,
    /// how long to wait for repair data after an NCF (configure to roughly 2x RTT or more)
    pub nak_rdata_ivl: Duration,
    /// number of wait-NCF timeouts before a packet is declared lost
    pub nak_ncf_retries: u8,
    /// number of wait-data timeouts before a packet is declared lost
    pub nak_data_retries: u8,

    /// Reed-Solomon block length n, i.e. data shares plus parity shares per transmission group.
    ///  The number of data shares k is negotiated at runtime (see `ReceiveWindow::update_fec`).
    pub fec_n: u8,
    /// request parity packets for a transmission group instead of selective repairs
    pub use_ondemand_parity: bool,

    /// interval at which the receive stream's active loop evaluates NAK timers
    pub timer_tick: Duration,
}

impl RxwConfig {
    /// defaults for a LAN with regular Ethernet frames
    pub fn default_lan() -> RxwConfig {
        RxwConfig {
            max_tpdu: 1500,
            rxw_sqns: 100,
            rxw_secs: 0,
            rxw_max_rte: 0,
            nak_bo_ivl: Duration::from_millis(50),
            nak_rpt_ivl: Duration::from_secs(2),
            nak_rdata_ivl: Duration::from_secs(2),
            nak_ncf_retries: 50,
            nak_data_retries: 50,
            fec_n: DEFAULT_FEC_N,
            use_ondemand_parity: false,
            timer_tick: Duration::from_millis(10),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_tpdu < MIN_TPDU {
            bail!("maximum TPDU size {} is below the minimum of {}", self.max_tpdu, MIN_TPDU);
        }
        if self.capacity() == 0 {
            bail!("receive window capacity must not be zero - configure rxw_sqns or rxw_secs and rxw_max_rte");
        }
        if self.nak_bo_ivl.is_zero() || self.nak_rpt_ivl.is_zero() || self.nak_rdata_ivl.is_zero() {
            bail!("NAK intervals must not be zero");
        }
        if self.nak_ncf_retries == 0 || self.nak_data_retries == 0 {
            bail!("NAK retry counts must not be zero");
        }
        if self.fec_n < 2 {
            return Err(RxwError::InvalidFecParameters { n: self.fec_n, k: 0 }.into());
        }
        if self.timer_tick.is_zero() {
            bail!("timer tick must not be zero");
        }
        Ok(())
    }

    /// window capacity in packets
    pub fn capacity(&self) -> u32 {
        Self::capacity_for(self.max_tpdu, self.rxw_sqns, self.rxw_secs, self.rxw_max_rte)
    }

    pub fn capacity_for(max_tpdu: u16, sqns: u32, secs: u32, max_rte: u32) -> u32 {
        let by_rate = if max_tpdu == 0 {
            0
        }
        else {
            (secs as u64 * max_rte as u64) / max_tpdu as u64
        };
        // more than half the sequence space can not be ordered
        let by_rate = by_rate.min(crate::seq_num::SeqNum::HALF_RANGE as u64) as u32;
        sqns.max(by_rate)
    }

    /// a random back-off interval in `[1ms, nak_bo_ivl]`
    pub fn nak_rb_ivl(&self) -> Duration {
        let max_micros = self.nak_bo_ivl.as_micros().max(1000) as u64;
        Duration::from_micros(rand::rng().random_range(1000..=max_micros))
    }
}
