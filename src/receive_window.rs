//! The receive window buffers the packets of one sender's stream between `trail` (the oldest
//!  sequence number still held) and `lead` (the newest sequence number known to exist).
//!
//! ```ascii
//!   trail          commit_lead                        lead
//!     |  committed     |   incoming (received/missing)  |
//!     v                v                                v
//!   [ C  C  C  C  C  C | D  D  B  N  W  D  P  D  L  D ]
//! ```
//!
//! * slots in `[trail, commit_lead)` were delivered to the application and wait to be
//!   reclaimed (`remove_trail`, `remove_commit`)
//! * slots in `[commit_lead, lead]` are in the retransmission state machine: data, parity,
//!   or placeholders for missing sequence numbers that are being recovered
//!
//! The window is driven by a single protocol context per peer: all mutating calls take the
//!  caller's notion of `now`, and no call blocks or waits.

use crate::config::RxwConfig;
use crate::delivery::ApduStatus;
use crate::error::RxwError;
use crate::fec::FecEngine;
use crate::packet_state::{PktState, RxwReturn, SlotState};
use crate::recovery::PendingQueues;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::seq_num::SeqNum;
use crate::skbuff::{SkBuff, MAX_APDU};
use crate::tsi::Tsi;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// One buffered sequence number: the packet (or a placeholder for it) and its state record
pub(crate) struct Slot {
    pub(crate) sqn: SeqNum,
    pub(crate) skb: SkBuff,
    pub(crate) state: SlotState,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RxwStats {
    /// time between noticing a sequence number missing and its repair arriving
    pub min_fill_time: Option<Duration>,
    pub max_fill_time: Option<Duration>,
    /// number of NAKs it took to repair a missing sequence number
    pub min_nak_transmit_count: Option<u8>,
    pub max_nak_transmit_count: Option<u8>,
    pub cumulative_losses: u32,
    pub bytes_delivered: u64,
    pub msgs_delivered: u32,
    /// packets rebuilt from parity
    pub fec_recovered: u32,
}

pub struct ReceiveWindow {
    pub(crate) tsi: Tsi,
    pub(crate) config: Arc<RxwConfig>,

    pub(crate) slots: Vec<Option<Slot>>,
    /// index into `slots` of the trail's sequence number
    pub(crate) trail_index: usize,
    /// capacity in slots
    pub(crate) alloc: u32,
    pub(crate) max_tpdu: u16,

    pub(crate) lead: SeqNum,
    pub(crate) trail: SeqNum,
    pub(crate) commit_lead: SeqNum,
    /// the sender's advertised trail, i.e. the oldest sequence number it can still repair
    pub(crate) rxw_trail: SeqNum,
    pub(crate) rxw_trail_init: SeqNum,
    /// a late-joining receiver does not request repairs for data from before it joined, until
    ///  the sender's advertised trail has moved past the first received sequence number
    pub(crate) is_constrained: bool,
    pub(crate) is_defined: bool,

    pub(crate) queues: PendingQueues,

    pub(crate) fec: Option<FecEngine>,
    pub(crate) tg_size: u32,
    pub(crate) tg_sqn_shift: u32,

    pub(crate) lost_count: u32,
    pub(crate) fragment_count: u32,
    pub(crate) parity_count: u32,
    pub(crate) committed_count: u32,

    pub(crate) stats: RxwStats,
    /// payload bytes held by the window
    pub(crate) size: usize,
}

impl Drop for ReceiveWindow {
    fn drop(&mut self) {
        debug!("destroying receive window for {} holding {} packets, {} lost in total", self.tsi, self.length(), self.stats.cumulative_losses);
    }
}

impl ReceiveWindow {
    /// Creates a window that holds the larger of `sqns` packets or `secs` seconds of data at
    ///  `max_rte` bytes per second, with the default NAK retry policy.
    pub fn create(tsi: Tsi, max_tpdu: u16, sqns: u32, secs: u32, max_rte: u32) -> anyhow::Result<ReceiveWindow> {
        let mut config = RxwConfig::default_lan();
        config.max_tpdu = max_tpdu;
        config.rxw_sqns = sqns;
        config.rxw_secs = secs;
        config.rxw_max_rte = max_rte;
        Self::with_config(tsi, Arc::new(config))
    }

    pub fn with_config(tsi: Tsi, config: Arc<RxwConfig>) -> anyhow::Result<ReceiveWindow> {
        let alloc = config.capacity();
        if alloc == 0 {
            return Err(RxwError::Allocation { slots: alloc }.into());
        }
        config.validate()?;

        let mut slots = Vec::new();
        if slots.try_reserve_exact(alloc.safe_cast()).is_err() {
            return Err(RxwError::Allocation { slots: alloc }.into());
        }
        slots.resize_with(alloc.safe_cast(), || None);

        debug!("creating receive window for {} with {} slots, max TPDU {}", tsi, alloc, config.max_tpdu);

        // empty state: lead = -1, trail = 0
        Ok(ReceiveWindow {
            tsi,
            max_tpdu: config.max_tpdu,
            config,
            slots,
            trail_index: 0,
            alloc,
            lead: SeqNum::ZERO.prev(),
            trail: SeqNum::ZERO,
            commit_lead: SeqNum::ZERO,
            rxw_trail: SeqNum::ZERO,
            rxw_trail_init: SeqNum::ZERO,
            is_constrained: true,
            is_defined: false,
            queues: PendingQueues::default(),
            fec: None,
            tg_size: 1,
            tg_sqn_shift: 0,
            lost_count: 0,
            fragment_count: 0,
            parity_count: 0,
            committed_count: 0,
            stats: RxwStats::default(),
            size: 0,
        })
    }

    pub fn tsi(&self) -> Tsi {
        self.tsi
    }

    pub fn max_length(&self) -> u32 {
        self.alloc
    }

    pub fn length(&self) -> u32 {
        self.lead.next().distance_from(self.trail)
    }

    /// payload bytes held by the window
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    pub fn is_full(&self) -> bool {
        self.length() == self.alloc
    }

    pub fn lead(&self) -> SeqNum {
        self.lead
    }

    pub fn next_lead(&self) -> SeqNum {
        self.lead.next()
    }

    pub fn trail(&self) -> SeqNum {
        self.trail
    }

    pub fn commit_lead(&self) -> SeqNum {
        self.commit_lead
    }

    pub fn rxw_trail(&self) -> SeqNum {
        self.rxw_trail
    }

    pub fn is_defined(&self) -> bool {
        self.is_defined
    }

    pub fn is_constrained(&self) -> bool {
        self.is_constrained
    }

    pub fn lost_count(&self) -> u32 {
        self.lost_count
    }

    pub fn fragment_count(&self) -> u32 {
        self.fragment_count
    }

    pub fn parity_count(&self) -> u32 {
        self.parity_count
    }

    pub fn committed_count(&self) -> u32 {
        self.committed_count
    }

    pub fn stats(&self) -> &RxwStats {
        &self.stats
    }

    /// True if the next read can make progress: either a complete APDU starts at the commit
    ///  lead, or data there was lost and the loss is waiting to be reclaimed and reported. An
    ///  APDU that can never be completed counts as well, since reading declares it lost.
    pub fn has_event(&self) -> bool {
        if self.incoming_is_empty() {
            return false;
        }
        let Some(slot) = self.slot(self.commit_lead) else {
            return false;
        };
        match slot.state.pkt_state {
            PktState::LostData => true,
            PktState::HaveData => {
                let first = slot.skb.apdu_first_sqn();
                first != self.commit_lead || !matches!(self.apdu_status(first), ApduStatus::Incomplete)
            }
            _ => false,
        }
    }

    pub(crate) fn incoming_is_empty(&self) -> bool {
        self.commit_lead == self.lead.next()
    }

    pub(crate) fn in_window(&self, sqn: SeqNum) -> bool {
        sqn.distance_from(self.trail) < self.length()
    }

    /// only valid for sequence numbers in the window
    pub(crate) fn slot_index(&self, sqn: SeqNum) -> usize {
        let offset: usize = sqn.distance_from(self.trail).safe_cast();
        (self.trail_index + offset) % self.slots.len()
    }

    pub(crate) fn slot(&self, sqn: SeqNum) -> Option<&Slot> {
        if !self.in_window(sqn) {
            return None;
        }
        self.slots[self.slot_index(sqn)].as_ref()
    }

    pub(crate) fn slot_state(&self, sqn: SeqNum) -> Option<PktState> {
        self.slot(sqn).map(|s| s.state.pkt_state)
    }

    /// first sequence number of the transmission group containing `sqn`
    pub(crate) fn tg_sqn(&self, sqn: SeqNum) -> SeqNum {
        SeqNum::from_raw((sqn.to_raw() >> self.tg_sqn_shift) << self.tg_sqn_shift)
    }

    /// position of `sqn` inside its transmission group
    pub(crate) fn pkt_sqn(&self, sqn: SeqNum) -> u32 {
        sqn.to_raw() - self.tg_sqn(sqn).to_raw()
    }

    /// Returns the buffered packet for a sequence number. Placeholders for missing or lost
    ///  sequence numbers yield `Missing`, sequence numbers outside the window `Unknown`.
    pub fn peek(&self, sqn: SeqNum) -> Result<&SkBuff, RxwReturn> {
        match self.slot(sqn) {
            None => Err(RxwReturn::Unknown),
            Some(slot) => match slot.state.pkt_state {
                PktState::HaveData | PktState::HaveParity | PktState::CommitData => Ok(&slot.skb),
                _ => Err(RxwReturn::Missing),
            }
        }
    }

    pub fn peek_state(&self, sqn: SeqNum) -> Option<&SlotState> {
        self.slot(sqn).map(|s| &s.state)
    }

    /// Moves a slot to a new state. This is the single place that keeps queue membership and
    ///  the per-state counters consistent with slot states.
    pub fn state(&mut self, sqn: SeqNum, new_state: PktState) -> RxwReturn {
        if !self.in_window(sqn) {
            return RxwReturn::Unknown;
        }
        let idx = self.slot_index(sqn);
        self.set_state(idx, new_state);
        RxwReturn::Ok
    }

    pub(crate) fn set_state(&mut self, idx: usize, new_state: PktState) {
        self.transition_with(idx, new_state, |_| {});
    }

    /// unlink the slot from its current state, apply `update` to its state record and link
    ///  it into `new_state`
    pub(crate) fn transition_with(&mut self, idx: usize, new_state: PktState, update: impl FnOnce(&mut SlotState)) {
        let Some(slot) = self.slots[idx].as_mut() else {
            return;
        };

        let old_state = slot.state.pkt_state;
        if let Some(expiry) = slot.state.queue_expiry() {
            self.queues.remove(old_state, expiry, slot.sqn);
        }
        match old_state {
            PktState::HaveData => self.fragment_count -= 1,
            PktState::HaveParity => self.parity_count -= 1,
            PktState::CommitData => self.committed_count -= 1,
            PktState::LostData => self.lost_count -= 1,
            _ => {}
        }

        update(&mut slot.state);
        slot.state.pkt_state = new_state;

        if new_state.is_pending() && slot.state.queue_expiry().is_none() {
            // no timer means the timer is due
            let tstamp = slot.skb.tstamp;
            match new_state {
                PktState::BackOff => slot.state.nak_rb_expiry = Some(tstamp),
                PktState::WaitNcf => slot.state.nak_rpt_expiry = Some(tstamp),
                _ => slot.state.nak_rdata_expiry = Some(tstamp),
            }
        }
        if let Some(expiry) = slot.state.queue_expiry() {
            self.queues.insert(new_state, expiry, slot.sqn);
        }
        match new_state {
            PktState::HaveData => self.fragment_count += 1,
            PktState::HaveParity => self.parity_count += 1,
            PktState::CommitData => self.committed_count += 1,
            PktState::LostData => {
                self.lost_count += 1;
                self.stats.cumulative_losses = self.stats.cumulative_losses.saturating_add(1);
            }
            _ => {}
        }
    }

    /// Inserts a newly received packet.
    ///
    /// `nak_rb_expiry` is the back-off expiry for sequence numbers that this packet reveals as
    ///  missing.
    pub fn add(&mut self, mut skb: SkBuff, now: Instant, nak_rb_expiry: Instant) -> RxwReturn {
        if let Some(rejected) = self.check_sanity(&mut skb) {
            return rejected;
        }

        // the first packet of a session defines the window
        if !self.is_defined {
            self.define(skb.sequence.prev());
        }
        else {
            self.update_trail(skb.data_trail);
        }

        let sequence = skb.sequence;
        let status = if skb.is_parity() {
            // bounds checking for parity happens at transmission group granularity
            let tg_sqn = self.tg_sqn(sequence);
            if tg_sqn.lt(self.tg_sqn(self.commit_lead)) {
                trace!("parity for already committed group {:?}", tg_sqn);
                return RxwReturn::Duplicate;
            }

            let lead_tg_sqn = self.tg_sqn(self.lead);
            if tg_sqn.lt(lead_tg_sqn) {
                return self.insert(skb);
            }
            if tg_sqn == lead_tg_sqn {
                let is_contiguous = self.slot(tg_sqn)
                    .map(|s| s.state.is_contiguous)
                    .unwrap_or(true);
                let is_group_complete = self.lead == tg_sqn + (self.tg_size - 1);
                let has_gap = self.first_missing_in_group(tg_sqn, None).is_some();
                if !is_group_complete && (is_contiguous || !has_gap) {
                    if self.has_parity_index(tg_sqn, self.pkt_sqn(sequence)) {
                        return RxwReturn::Duplicate;
                    }
                    // parity in place of the group's next data packet
                    return self.append(skb);
                }
                return self.insert(skb);
            }

            self.add_placeholder_range(tg_sqn, now, nak_rb_expiry)
        }
        else {
            if sequence.lt(self.commit_lead) {
                trace!("packet {:?} was already committed", sequence);
                return RxwReturn::Duplicate;
            }
            if sequence.lte(self.lead) {
                return self.insert(skb);
            }
            if sequence == self.lead.next() {
                return self.append(skb);
            }

            self.add_placeholder_range(sequence, now, nak_rb_expiry)
        };

        match status {
            RxwReturn::Appended | RxwReturn::SlowConsumer => {
                match self.append(skb) {
                    RxwReturn::Appended if status == RxwReturn::SlowConsumer => RxwReturn::SlowConsumer,
                    RxwReturn::Appended => RxwReturn::Missing,
                    other => other,
                }
            }
            other => other,
        }
    }

    /// protocol sanity checks - returns the rejection if the packet is not acceptable
    fn check_sanity(&self, skb: &mut SkBuff) -> Option<RxwReturn> {
        if usize::from(skb.tsdu_length) != skb.len() {
            warn!("packet {:?} from {}: declared TSDU length {} does not match payload length {}", skb.sequence, self.tsi, skb.tsdu_length, skb.len());
            return Some(RxwReturn::Malformed);
        }
        if skb.len() > usize::from(self.max_tpdu) {
            warn!("packet {:?} from {}: payload length {} exceeds the maximum TPDU size {}", skb.sequence, self.tsi, skb.len(), self.max_tpdu);
            return Some(RxwReturn::Malformed);
        }
        if skb.sequence.distance_from(skb.data_trail) >= SeqNum::HALF_RANGE - 1 {
            debug!("packet {:?} from {}: advertised trail {:?} is not plausible", skb.sequence, self.tsi, skb.data_trail);
            return Some(RxwReturn::Bounds);
        }

        if skb.is_parity() {
            let Some(fec) = &self.fec else {
                warn!("parity packet {:?} from {} without FEC being enabled", skb.sequence, self.tsi);
                return Some(RxwReturn::Malformed);
            };
            if self.pkt_sqn(skb.sequence) >= u32::from(fec.parity_shards()) {
                warn!("parity packet {:?} from {}: parity index out of range", skb.sequence, self.tsi);
                return Some(RxwReturn::Malformed);
            }
            return None;
        }

        if let Some(fragment) = skb.fragment {
            if fragment.apdu_len as usize == skb.len() {
                // single fragment APDU
                skb.fragment = None;
            }
            else if (fragment.apdu_len as usize) < skb.len() {
                warn!("packet {:?} from {}: APDU length {} is shorter than the fragment", skb.sequence, self.tsi, fragment.apdu_len);
                return Some(RxwReturn::Malformed);
            }
            else if skb.sequence.lt(fragment.apdu_first_sqn) {
                warn!("packet {:?} from {}: fragment precedes its APDU's first sequence number {:?}", skb.sequence, self.tsi, fragment.apdu_first_sqn);
                return Some(RxwReturn::Malformed);
            }
            else if fragment.apdu_len > MAX_APDU {
                warn!("packet {:?} from {}: APDU length {} exceeds the maximum of {}", skb.sequence, self.tsi, fragment.apdu_len, MAX_APDU);
                return Some(RxwReturn::Malformed);
            }
        }
        None
    }

    fn define(&mut self, lead: SeqNum) {
        debug!("defining receive window for {} with lead {:?}", self.tsi, lead);
        self.lead = lead;
        self.trail = lead.next();
        self.trail_index = 0;
        self.commit_lead = self.trail;
        self.rxw_trail = self.trail;
        self.rxw_trail_init = self.trail;
        self.is_constrained = true;
        self.is_defined = true;
    }

    /// SPM processing: applies the sender's advertised transmit window. Returns the number of
    ///  placeholders added for sequence numbers that now are known to be missing.
    pub fn update_window(&mut self, txw_lead: SeqNum, txw_trail: SeqNum, now: Instant, nak_rb_expiry: Instant) -> u32 {
        if !self.is_defined {
            self.define(txw_lead);
            return 0;
        }

        self.update_trail(txw_trail);
        self.update_lead(txw_lead, now, nak_rb_expiry)
    }

    fn update_lead(&mut self, txw_lead: SeqNum, now: Instant, nak_rb_expiry: Instant) -> u32 {
        if txw_lead.lte(self.lead) {
            return 0;
        }

        // committed packets constrain the lead until they are released
        let lead = if self.trail != self.commit_lead && txw_lead.distance_from(self.trail) >= self.alloc {
            self.trail + (self.alloc - 1)
        }
        else {
            txw_lead
        };
        if lead == self.lead {
            return 0;
        }

        if self.make_room(lead).is_err() {
            return 0;
        }

        let mut added = 0;
        while self.lead != lead {
            self.add_placeholder(PktState::BackOff, now, nak_rb_expiry);
            added += 1;
        }
        if added > 0 {
            debug!("{}: advertised lead {:?} revealed {} missing sequence numbers", self.tsi, txw_lead, added);
        }
        added
    }

    /// Applies the sender's advertised trail: sequence numbers below it can not be repaired
    ///  any more.
    pub(crate) fn update_trail(&mut self, trail: SeqNum) {
        if trail.lte(self.rxw_trail) {
            return;
        }
        if trail.distance_from(self.rxw_trail) > SeqNum::HALF_RANGE - 1 {
            return;
        }

        if self.is_constrained {
            if trail.gt(self.rxw_trail_init) {
                debug!("{}: advertised trail {:?} passed the initial trail, lifting constraint", self.tsi, trail);
                self.is_constrained = false;
            }
            else {
                return;
            }
        }

        self.rxw_trail = trail;
        if self.rxw_trail.lte(self.trail) {
            return;
        }

        if self.is_empty() {
            // nothing buffered: jump the window forward
            let distance = self.rxw_trail.distance_from(self.trail);
            debug!("{}: empty window jumps {} sequence numbers to advertised trail {:?}", self.tsi, distance, self.rxw_trail);
            self.trail += distance;
            self.trail_index = 0;
            self.commit_lead = self.trail;
            self.lead += distance;
            self.stats.cumulative_losses = self.stats.cumulative_losses.saturating_add(distance);
            return;
        }

        let mut sqn = self.commit_lead;
        while sqn.lt(self.rxw_trail) && sqn.lte(self.lead) {
            if self.slot_state(sqn).map(|s| s.is_pending()).unwrap_or(false) {
                trace!("{}: {:?} fell behind the sender's trail", self.tsi, sqn);
                self.lost(sqn);
            }
            sqn = sqn.next();
        }
    }

    /// Places a packet in an existing slot, i.e. fills a gap below the lead
    fn insert(&mut self, skb: SkBuff) -> RxwReturn {
        let target = if skb.is_parity() {
            let tg_sqn = self.tg_sqn(skb.sequence);
            if self.fec.as_ref().map(|f| f.is_failed(tg_sqn)).unwrap_or(true) {
                trace!("parity for group {:?} that can not be recovered any more", tg_sqn);
                return RxwReturn::Duplicate;
            }
            if self.has_parity_index(tg_sqn, self.pkt_sqn(skb.sequence)) {
                return RxwReturn::Duplicate;
            }
            match self.first_missing_in_group(tg_sqn, None) {
                Some(sqn) => sqn,
                None => {
                    trace!("parity for group {:?} without missing packets", tg_sqn);
                    return RxwReturn::Duplicate;
                }
            }
        }
        else {
            match self.slot_state(skb.sequence) {
                Some(PktState::BackOff) | Some(PktState::WaitNcf) | Some(PktState::WaitData) => {}
                Some(PktState::HaveParity) => self.relocate_parity(skb.sequence),
                _ => return RxwReturn::Duplicate,
            }
            skb.sequence
        };

        self.fill_slot(target, skb);

        let tg_sqn = self.tg_sqn(target);
        self.refresh_contiguity(tg_sqn);
        self.evaluate_fec(tg_sqn);
        RxwReturn::Inserted
    }

    /// replaces the placeholder (or parity) at `sqn` with a received or rebuilt packet
    pub(crate) fn fill_slot(&mut self, sqn: SeqNum, skb: SkBuff) {
        let idx = self.slot_index(sqn);
        self.record_fill_statistics(idx, skb.tstamp);

        if self.slot_state(sqn) == Some(PktState::LostData) {
            // parity or a rebuilt packet revives a lost sequence number
            self.stats.cumulative_losses = self.stats.cumulative_losses.saturating_sub(1);
        }

        let new_state = if skb.is_parity() { PktState::HaveParity } else { PktState::HaveData };
        self.set_state(idx, PktState::Error);
        if let Some(slot) = self.slots[idx].as_mut() {
            self.size -= slot.skb.len();
            self.size += skb.len();
            slot.skb = skb;
        }
        self.set_state(idx, new_state);
    }

    /// data arrived for a slot holding parity: move the parity to another gap in its group
    fn relocate_parity(&mut self, sqn: SeqNum) {
        let tg_sqn = self.tg_sqn(sqn);
        let target = self.first_missing_in_group(tg_sqn, Some(sqn));
        let idx = self.slot_index(sqn);

        let parity = self.slots[idx].as_ref().map(|s| s.skb.clone());
        self.set_state(idx, PktState::Error);
        if let Some(slot) = self.slots[idx].as_mut() {
            self.size -= slot.skb.len();
            slot.skb = SkBuff::placeholder(sqn, slot.skb.tstamp);
        }
        // the slot is refilled by the caller right away

        match (target, parity) {
            (Some(target), Some(parity)) => {
                trace!("moving parity from {:?} to {:?}", sqn, target);
                self.fill_slot(target, parity);
            }
            _ => trace!("dropping parity at {:?}: no gap left in group {:?}", sqn, tg_sqn),
        }
    }

    fn record_fill_statistics(&mut self, idx: usize, arrival: Instant) {
        let Some(slot) = self.slots[idx].as_ref() else {
            return;
        };
        if !slot.state.pkt_state.is_pending() {
            return;
        }

        let fill_time = arrival.saturating_duration_since(slot.skb.tstamp);
        let nak_transmit_count = slot.state.nak_transmit_count;

        let stats = &mut self.stats;
        stats.min_fill_time = Some(stats.min_fill_time.map_or(fill_time, |t| t.min(fill_time)));
        stats.max_fill_time = Some(stats.max_fill_time.map_or(fill_time, |t| t.max(fill_time)));
        stats.min_nak_transmit_count = Some(stats.min_nak_transmit_count.map_or(nak_transmit_count, |c| c.min(nak_transmit_count)));
        stats.max_nak_transmit_count = Some(stats.max_nak_transmit_count.map_or(nak_transmit_count, |c| c.max(nak_transmit_count)));
    }

    /// Extends the lead by one slot holding the packet
    fn append(&mut self, skb: SkBuff) -> RxwReturn {
        let new_lead = self.lead.next();
        let forced = match self.make_room(new_lead) {
            Ok(forced) => forced,
            Err(rejected) => return rejected,
        };

        self.lead = new_lead;
        let idx = self.slot_index(new_lead);
        let new_state = if skb.is_parity() { PktState::HaveParity } else { PktState::HaveData };
        self.size += skb.len();
        self.slots[idx] = Some(Slot {
            sqn: new_lead,
            skb,
            state: SlotState::new(),
        });
        self.set_state(idx, new_state);

        let tg_sqn = self.tg_sqn(new_lead);
        self.refresh_contiguity(tg_sqn);
        self.evaluate_fec(tg_sqn);

        if forced { RxwReturn::SlowConsumer } else { RxwReturn::Appended }
    }

    /// Adds placeholders for all sequence numbers between the lead and `sequence` (exclusive),
    ///  making room for `sequence` itself as well.
    pub(crate) fn add_placeholder_range(&mut self, sequence: SeqNum, now: Instant, nak_rb_expiry: Instant) -> RxwReturn {
        let forced = match self.make_room(sequence) {
            Ok(forced) => forced,
            Err(rejected) => return rejected,
        };

        while self.lead.next() != sequence {
            self.add_placeholder(PktState::BackOff, now, nak_rb_expiry);
        }
        if forced { RxwReturn::SlowConsumer } else { RxwReturn::Appended }
    }

    /// extends the lead by a placeholder in a pending state - the caller makes sure there is room
    pub(crate) fn add_placeholder(&mut self, pkt_state: PktState, now: Instant, expiry: Instant) {
        self.lead = self.lead.next();
        let sqn = self.lead;
        let idx = self.slot_index(sqn);

        let mut state = SlotState::new();
        match pkt_state {
            PktState::WaitNcf => state.nak_rpt_expiry = Some(expiry),
            PktState::WaitData => state.nak_rdata_expiry = Some(expiry),
            _ => state.nak_rb_expiry = Some(expiry),
        }
        self.slots[idx] = Some(Slot {
            sqn,
            skb: SkBuff::placeholder(sqn, now),
            state,
        });
        self.set_state(idx, pkt_state);

        let tg_sqn = self.tg_sqn(sqn);
        self.refresh_contiguity(tg_sqn);
    }

    /// Makes room for the lead to move to `new_lead`.
    ///
    /// Committed data at the trail pins the window: the application has to release it before
    ///  the window can move on (`Bounds`). Lost slots are reclaimed silently. Anything else at
    ///  the trail is undelivered data or an ongoing repair; it is discarded and counted as a
    ///  loss, which is reported as `Ok(true)` so the caller can signal a slow consumer.
    pub(crate) fn make_room(&mut self, new_lead: SeqNum) -> Result<bool, RxwReturn> {
        let new_len = u64::from(new_lead.distance_from(self.trail)) + 1;
        let alloc = u64::from(self.alloc);
        if new_len <= alloc {
            return Ok(false);
        }

        let excess = new_len - alloc;
        let evictable = excess.min(u64::from(self.length()));

        for offset in 0..evictable {
            let offset: u32 = offset.prechecked_cast();
            let sqn = self.trail + offset;
            if self.slot_state(sqn) == Some(PktState::CommitData) {
                trace!("{}: receive window pinned by committed data at {:?}", self.tsi, sqn);
                return Err(RxwReturn::Bounds);
            }
        }

        let mut forced = false;
        for _ in 0..evictable {
            forced |= self.evict_trail();
        }

        let skip = excess - evictable;
        if skip > 0 {
            // the window is empty now, and the new lead is still too far ahead
            let skip: u32 = skip.prechecked_cast();
            warn!("{}: receive window jumps {} sequence numbers that were never received", self.tsi, skip);
            self.trail += skip;
            self.trail_index = 0;
            self.commit_lead = self.trail;
            self.lead = self.trail.prev();
            self.stats.cumulative_losses = self.stats.cumulative_losses.saturating_add(skip);
            forced = true;
        }
        Ok(forced)
    }

    /// discards the trail slot to make room - returns true if undelivered data was discarded
    fn evict_trail(&mut self) -> bool {
        let state = self.slot_state(self.trail).unwrap_or(PktState::Error);
        let forced = !matches!(state, PktState::LostData | PktState::CommitData);
        if forced {
            warn!("{}: receive window full, discarding {:?} in {}", self.tsi, self.trail, state);
            self.stats.cumulative_losses = self.stats.cumulative_losses.saturating_add(1);
        }
        self.release_trail();
        forced
    }

    /// drops the trail slot and advances the trail
    fn release_trail(&mut self) {
        let idx = self.slot_index(self.trail);
        self.set_state(idx, PktState::Error);
        if let Some(slot) = self.slots[idx].take() {
            self.size -= slot.skb.len();
        }

        if self.trail == self.commit_lead {
            self.commit_lead = self.commit_lead.next();
        }
        self.trail = self.trail.next();
        self.trail_index = (self.trail_index + 1) % self.slots.len();

        if let Some(fec) = self.fec.as_mut() {
            fec.forget_groups_before(self.trail);
        }
    }

    /// Reclaims slots from the trail that have reached a terminal state: delivered data and
    ///  lost sequence numbers. Stops at the first slot that is still live. Returns the number of
    ///  reclaimed slots.
    pub fn remove_trail(&mut self) -> u32 {
        let mut count = 0;
        while !self.is_empty() {
            match self.slot_state(self.trail) {
                Some(PktState::CommitData) | Some(PktState::LostData) => {
                    self.release_trail();
                    count += 1;
                }
                _ => break,
            }
        }
        if count > 0 {
            trace!("{}: reclaimed {} slots, trail now {:?}", self.tsi, count, self.trail);
        }
        count
    }

    /// Releases delivered data to relieve memory pressure. The transmission group containing
    ///  the commit lead is kept, since its delivered members are still needed for parity
    ///  reconstruction.
    pub fn remove_commit(&mut self) -> u32 {
        let tg_sqn_of_commit_lead = self.tg_sqn(self.commit_lead);
        let mut count = 0;
        while self.trail != self.commit_lead && self.tg_sqn(self.trail) != tg_sqn_of_commit_lead {
            if self.slot_state(self.trail) != Some(PktState::CommitData) {
                break;
            }
            self.release_trail();
            count += 1;
        }
        count
    }

    /// Declares a sequence number unrecoverable
    pub fn lost(&mut self, sqn: SeqNum) {
        let Some(old_state) = self.slot_state(sqn) else {
            trace!("{}: {:?} declared lost outside the window", self.tsi, sqn);
            return;
        };
        if matches!(old_state, PktState::CommitData | PktState::LostData) {
            return;
        }

        let idx = self.slot_index(sqn);
        self.set_state(idx, PktState::LostData);
        debug!("{}: {:?} lost in {}", self.tsi, sqn, old_state);

        let tg_sqn = self.tg_sqn(sqn);
        self.refresh_contiguity(tg_sqn);
        if old_state.is_pending() {
            self.evaluate_fec(tg_sqn);
        }
    }

    /// the first member of a transmission group that does not hold data, parity or loss
    ///  decisions included
    pub(crate) fn first_missing_in_group(&self, tg_sqn: SeqNum, except: Option<SeqNum>) -> Option<SeqNum> {
        tg_sqn.to(tg_sqn + self.tg_size)
            .filter(|&sqn| Some(sqn) != except)
            .find(|&sqn| matches!(self.slot_state(sqn), Some(s) if s.is_pending() || s == PktState::LostData))
    }

    fn has_parity_index(&self, tg_sqn: SeqNum, parity_index: u32) -> bool {
        tg_sqn.to(tg_sqn + self.tg_size)
            .filter_map(|sqn| self.slot(sqn))
            .any(|slot| slot.state.pkt_state == PktState::HaveParity && self.pkt_sqn(slot.skb.sequence) == parity_index)
    }

    /// re-evaluates whether all members of a transmission group seen so far hold data
    pub(crate) fn refresh_contiguity(&mut self, tg_sqn: SeqNum) {
        if !self.in_window(tg_sqn) {
            return;
        }

        let members = self.tg_size.min(self.lead.next().distance_from(tg_sqn));
        let is_contiguous = tg_sqn.to(tg_sqn + members)
            .all(|sqn| matches!(self.slot_state(sqn), Some(PktState::HaveData) | Some(PktState::CommitData)));

        let idx = self.slot_index(tg_sqn);
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.state.is_contiguous = is_contiguous;
        }
    }

    /// logs the complete window state
    pub fn dump(&self) {
        debug!(
            "receive window {}: trail {:?} commit_lead {:?} lead {:?} rxw_trail {:?} rxw_trail_init {:?} \
             length {}/{} size {} defined {} constrained {} fec {} tg_size {} \
             back-off {} wait-ncf {} wait-data {} lost {} fragments {} parity {} committed {} stats {:?}",
            self.tsi, self.trail, self.commit_lead, self.lead, self.rxw_trail, self.rxw_trail_init,
            self.length(), self.alloc, self.size, self.is_defined, self.is_constrained, self.fec.is_some(), self.tg_size,
            self.queues.len(PktState::BackOff), self.queues.len(PktState::WaitNcf), self.queues.len(PktState::WaitData),
            self.lost_count, self.fragment_count, self.parity_count, self.committed_count, self.stats,
        );
        for sqn in self.trail.to(self.lead.next()) {
            if let Some(slot) = self.slot(sqn) {
                trace!("  {:?}: {} ({}) len {}", sqn, slot.state.pkt_state, u8::from(slot.state.pkt_state), slot.skb.len());
            }
        }
    }
}
