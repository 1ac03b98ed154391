//! NAK-based recovery of missing sequence numbers.
//!
//! Every missing sequence number is in one of three pending states, each with its own expiry
//!  queue ordered by expiry time:
//!
//! * back-off: waiting for a randomised interval before NAK'ing, so that a NAK from another
//!   receiver (confirmed by the sender's NCF) can suppress ours
//! * wait-NCF: NAK sent, waiting for the sender to confirm it
//! * wait-data: NAK confirmed, waiting for the repair
//!
//! Expiry in wait-NCF or wait-data goes back to back-off until the respective retry count is
//!  exhausted, and the sequence number is declared lost.

use crate::packet_state::{PktState, RxwReturn};
use crate::receive_window::ReceiveWindow;
use crate::seq_num::SeqNum;
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, trace};

/// maximum number of sequence numbers in a single NAK packet
pub const MAX_NAK_LIST: usize = 63;

/// Pending slots ordered by their expiry, ties broken by sequence number
#[derive(Debug, Default)]
pub(crate) struct PendingQueues {
    back_off: BTreeSet<(Instant, u32)>,
    wait_ncf: BTreeSet<(Instant, u32)>,
    wait_data: BTreeSet<(Instant, u32)>,
}

impl PendingQueues {
    fn queue(&self, state: PktState) -> Option<&BTreeSet<(Instant, u32)>> {
        match state {
            PktState::BackOff => Some(&self.back_off),
            PktState::WaitNcf => Some(&self.wait_ncf),
            PktState::WaitData => Some(&self.wait_data),
            _ => None,
        }
    }

    fn queue_mut(&mut self, state: PktState) -> Option<&mut BTreeSet<(Instant, u32)>> {
        match state {
            PktState::BackOff => Some(&mut self.back_off),
            PktState::WaitNcf => Some(&mut self.wait_ncf),
            PktState::WaitData => Some(&mut self.wait_data),
            _ => None,
        }
    }

    pub(crate) fn insert(&mut self, state: PktState, expiry: Instant, sqn: SeqNum) {
        if let Some(queue) = self.queue_mut(state) {
            queue.insert((expiry, sqn.to_raw()));
        }
    }

    pub(crate) fn remove(&mut self, state: PktState, expiry: Instant, sqn: SeqNum) {
        if let Some(queue) = self.queue_mut(state) {
            queue.remove(&(expiry, sqn.to_raw()));
        }
    }

    pub(crate) fn len(&self, state: PktState) -> usize {
        self.queue(state).map(|q| q.len()).unwrap_or(0)
    }

    /// sequence numbers whose expiry is not after `now`, in expiry order
    pub(crate) fn expired(&self, state: PktState, now: Instant) -> Vec<SeqNum> {
        self.queue(state)
            .map(|q| q.iter()
                .take_while(|(expiry, _)| *expiry <= now)
                .map(|(_, sqn)| SeqNum::from_raw(*sqn))
                .collect()
            )
            .unwrap_or_default()
    }

    pub(crate) fn next_expiry(&self) -> Option<Instant> {
        [&self.back_off, &self.wait_ncf, &self.wait_data].into_iter()
            .filter_map(|q| q.first().map(|(expiry, _)| *expiry))
            .min()
    }
}

/// request for parity packets for a transmission group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParityNak {
    pub tg_sqn: SeqNum,
    /// number of missing packets in the group
    pub count: u32,
}

/// What the owner of a window has to do after a timer evaluation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateResult {
    /// selective NAKs in window order, each at most `MAX_NAK_LIST` sequence numbers
    pub nak_lists: Vec<Vec<SeqNum>>,
    pub parity_naks: Vec<ParityNak>,
    /// sequence numbers whose recovery was abandoned by this update
    pub lost: Vec<SeqNum>,
    /// the earliest remaining timer, for scheduling the next update
    pub next_expiry: Option<Instant>,
}

impl UpdateResult {
    pub fn num_naks(&self) -> usize {
        self.nak_lists.iter().map(|l| l.len()).sum()
    }
}

impl ReceiveWindow {
    /// Processes expired NAK timers. Expired back-off timers produce NAKs, expired wait-NCF
    ///  and wait-data timers go back to back-off, or to lost when their retries are exhausted.
    ///
    /// `nak_rb_expiry` is the new back-off expiry for sequence numbers going back to back-off.
    pub fn update(&mut self, now: Instant, nak_rb_expiry: Instant) -> UpdateResult {
        let mut result = UpdateResult::default();
        if !self.is_defined {
            return result;
        }

        self.nak_rb_state(now, &mut result);
        self.nak_rpt_state(now, nak_rb_expiry, &mut result);
        self.nak_rdata_state(now, nak_rb_expiry, &mut result);

        result.next_expiry = self.queues.next_expiry();
        result
    }

    fn nak_rb_state(&mut self, now: Instant, result: &mut UpdateResult) {
        let expired = self.queues.expired(PktState::BackOff, now);
        if expired.is_empty() {
            return;
        }

        let nak_rpt_expiry = now + self.config.nak_rpt_ivl;
        let mut naks = Vec::with_capacity(expired.len());
        for sqn in expired {
            let idx = self.slot_index(sqn);
            self.transition_with(idx, PktState::WaitNcf, |state| {
                state.nak_transmit_count = state.nak_transmit_count.saturating_add(1);
                state.nak_rpt_expiry = Some(nak_rpt_expiry);
            });
            naks.push(sqn);
        }

        let trail = self.trail;
        naks.sort_by_key(|sqn| sqn.distance_from(trail));

        if self.is_fec_available() && self.config.use_ondemand_parity {
            for sqn in naks {
                let tg_sqn = self.tg_sqn(sqn);
                match result.parity_naks.last_mut() {
                    Some(last) if last.tg_sqn == tg_sqn => last.count += 1,
                    _ => result.parity_naks.push(ParityNak { tg_sqn, count: 1 }),
                }
            }
            trace!("{}: requesting parity for {} groups", self.tsi, result.parity_naks.len());
        }
        else {
            trace!("{}: NAK'ing {} sequence numbers", self.tsi, naks.len());
            result.nak_lists.extend(naks.chunks(MAX_NAK_LIST).map(|c| c.to_vec()));
        }
    }

    fn nak_rpt_state(&mut self, now: Instant, nak_rb_expiry: Instant, result: &mut UpdateResult) {
        let nak_ncf_retries = self.config.nak_ncf_retries;
        for sqn in self.queues.expired(PktState::WaitNcf, now) {
            let idx = self.slot_index(sqn);
            // an earlier loss in this batch may have completed the slot's group through parity
            let Some(slot) = self.slots[idx].as_mut().filter(|s| s.state.pkt_state == PktState::WaitNcf) else {
                continue;
            };
            slot.state.ncf_retry_count = slot.state.ncf_retry_count.saturating_add(1);
            let ncf_retry_count = slot.state.ncf_retry_count;

            if ncf_retry_count >= nak_ncf_retries {
                debug!("{}: {:?} lost after {} NAKs without NCF", self.tsi, sqn, ncf_retry_count);
                self.lost(sqn);
                result.lost.push(sqn);
            }
            else {
                self.transition_with(idx, PktState::BackOff, |state| state.nak_rb_expiry = Some(nak_rb_expiry));
            }
        }
    }

    fn nak_rdata_state(&mut self, now: Instant, nak_rb_expiry: Instant, result: &mut UpdateResult) {
        let nak_data_retries = self.config.nak_data_retries;
        for sqn in self.queues.expired(PktState::WaitData, now) {
            let idx = self.slot_index(sqn);
            // an earlier loss in this batch may have completed the slot's group through parity
            let Some(slot) = self.slots[idx].as_mut().filter(|s| s.state.pkt_state == PktState::WaitData) else {
                continue;
            };
            slot.state.data_retry_count = slot.state.data_retry_count.saturating_add(1);
            let data_retry_count = slot.state.data_retry_count;

            if data_retry_count >= nak_data_retries {
                debug!("{}: {:?} lost after {} confirmed NAKs without repair", self.tsi, sqn, data_retry_count);
                self.lost(sqn);
                result.lost.push(sqn);
            }
            else {
                self.transition_with(idx, PktState::BackOff, |state| state.nak_rb_expiry = Some(nak_rb_expiry));
            }
        }
    }

    /// Processes an NCF, i.e. the sender's confirmation that a repair for `sqn` is coming.
    ///
    /// `nak_rdata_expiry` bounds the wait for the repair, `nak_rb_expiry` is the back-off
    ///  expiry for sequence numbers the NCF reveals as missing.
    pub fn confirm(&mut self, sqn: SeqNum, now: Instant, nak_rdata_expiry: Instant, nak_rb_expiry: Instant) -> RxwReturn {
        if !self.is_defined {
            return RxwReturn::Bounds;
        }
        if sqn.lt(self.commit_lead) {
            return if sqn.gte(self.trail) { RxwReturn::Duplicate } else { RxwReturn::Bounds };
        }

        if sqn.lte(self.lead) {
            let idx = self.slot_index(sqn);
            return match self.slot_state(sqn) {
                Some(state) if state.is_pending() => {
                    trace!("{}: NCF for {:?} in {}", self.tsi, sqn, state);
                    self.transition_with(idx, PktState::WaitData, |state| state.nak_rdata_expiry = Some(nak_rdata_expiry));
                    RxwReturn::Updated
                }
                _ => RxwReturn::Duplicate,
            };
        }

        // NCF for a sequence number we have not seen yet: it was sent, so waiting for the
        //  repair is the next step
        let mut forced = false;
        if sqn != self.lead.next() {
            match self.add_placeholder_range(sqn, now, nak_rb_expiry) {
                RxwReturn::Appended => {}
                RxwReturn::SlowConsumer => forced = true,
                other => return other,
            }
        }
        match self.make_room(sqn) {
            Ok(f) => forced |= f,
            Err(rejected) => return rejected,
        }

        self.add_placeholder(PktState::WaitData, now, nak_rdata_expiry);
        if forced { RxwReturn::SlowConsumer } else { RxwReturn::Appended }
    }
}
