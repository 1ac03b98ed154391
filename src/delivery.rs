use crate::error::RxwError;
use crate::packet_state::PktState;
use crate::receive_window::ReceiveWindow;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::seq_num::SeqNum;
use crate::skbuff::{SkBuff, MAX_APDU, MAX_FRAGMENTS};
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

/// One application message (APDU): the packets it was sent in, in order. The buffers are
///  shared with the window until the window reclaims them.
#[derive(Clone, Debug, Default)]
pub struct Msgv {
    pub skbs: Vec<SkBuff>,
}

impl Msgv {
    /// total payload length
    pub fn len(&self) -> usize {
        self.skbs.iter().map(|skb| skb.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_fragments(&self) -> usize {
        self.skbs.len()
    }

    pub fn first_sqn(&self) -> Option<SeqNum> {
        self.skbs.first().map(|skb| skb.sequence)
    }

    /// the message's payload as a single buffer
    pub fn to_bytes(&self) -> Bytes {
        if let [single] = self.skbs.as_slice() {
            return single.data.clone();
        }
        let mut buf = BytesMut::with_capacity(self.len());
        for skb in &self.skbs {
            buf.extend_from_slice(&skb.data);
        }
        buf.freeze()
    }
}

pub(crate) enum ApduStatus {
    Complete,
    /// fragments are still missing
    Incomplete,
    /// a fragment was lost, so the APDU can never be completed
    Lost,
    Malformed(&'static str),
}

impl ReceiveWindow {
    /// Delivers complete APDUs in sequence order, starting at the commit lead, appending up to
    ///  `msgv_len` of them to `msgv`. Delivered packets move to the commit state, where they stay
    ///  until they are reclaimed. Returns the number of delivered APDUs.
    ///
    /// Delivery stops at the first sequence number that is missing, lost or part of an
    ///  incomplete APDU. A lost sequence number at the commit lead blocks delivery until it is
    ///  reclaimed with `remove_trail`, so the owner can report the loss first.
    pub fn readv(&mut self, msgv: &mut Vec<Msgv>, msgv_len: usize) -> anyhow::Result<usize> {
        if msgv_len == 0 {
            return Err(RxwError::BufferTooSmall.into());
        }

        let mut num_msgs = 0;
        let mut num_bytes = 0;
        while num_msgs < msgv_len && !self.incoming_is_empty() {
            let Some(slot) = self.slot(self.commit_lead) else {
                break;
            };

            match slot.state.pkt_state {
                PktState::HaveData => {
                    let first = slot.skb.apdu_first_sqn();
                    if first != self.commit_lead {
                        debug!("{}: fragment {:?} of APDU {:?} without its start", self.tsi, self.commit_lead, first);
                        self.lost(self.commit_lead);
                        break;
                    }
                    if !self.is_apdu_complete(first) {
                        break;
                    }

                    let msg = self.read_apdu();
                    num_bytes += msg.len();
                    num_msgs += 1;
                    msgv.push(msg);
                }
                PktState::CommitData => {
                    // committed out of band
                    self.commit_lead = self.commit_lead.next();
                }
                _ => break,
            }
        }

        if num_msgs > 0 {
            trace!("{}: delivered {} messages, {} bytes", self.tsi, num_msgs, num_bytes);
            self.stats.msgs_delivered = self.stats.msgs_delivered.saturating_add(num_msgs.prechecked_cast());
            let num_bytes: u64 = num_bytes.safe_cast();
            self.stats.bytes_delivered += num_bytes;
        }
        Ok(num_msgs)
    }

    /// Checks whether all packets of the APDU starting at `first` are present. An APDU that can
    ///  never be completed is declared lost.
    fn is_apdu_complete(&mut self, first: SeqNum) -> bool {
        match self.apdu_status(first) {
            ApduStatus::Complete => true,
            ApduStatus::Incomplete => false,
            ApduStatus::Lost => {
                debug!("{}: APDU {:?} has a lost fragment", self.tsi, first);
                self.lost(first);
                false
            }
            ApduStatus::Malformed(reason) => {
                warn!("{}: APDU {:?}: {}", self.tsi, first, reason);
                self.lost(first);
                false
            }
        }
    }

    pub(crate) fn apdu_status(&self, first: SeqNum) -> ApduStatus {
        let Some(first_skb) = self.slot(first).map(|s| &s.skb) else {
            return ApduStatus::Incomplete;
        };
        let Some(fragment) = first_skb.fragment else {
            return ApduStatus::Complete;
        };

        let apdu_len = fragment.apdu_len;
        if apdu_len > MAX_APDU {
            return ApduStatus::Malformed("exceeds the maximum APDU length");
        }

        let mut contiguous_len = 0usize;
        let mut num_fragments = 0;
        let mut sqn = first;
        while self.in_window(sqn) {
            let Some(slot) = self.slot(sqn) else {
                return ApduStatus::Incomplete;
            };
            match slot.state.pkt_state {
                PktState::HaveData => {}
                PktState::LostData => return ApduStatus::Lost,
                _ => return ApduStatus::Incomplete,
            }

            let consistent = match &slot.skb.fragment {
                Some(f) => f.apdu_first_sqn == first && f.apdu_len == apdu_len,
                None => false,
            };
            num_fragments += 1;
            contiguous_len += slot.skb.len();

            if !consistent {
                return ApduStatus::Malformed("contains a fragment of another APDU");
            }
            if num_fragments > MAX_FRAGMENTS {
                return ApduStatus::Malformed("has too many fragments");
            }
            if contiguous_len >= apdu_len as usize {
                if contiguous_len > apdu_len as usize {
                    return ApduStatus::Malformed("fragments overshoot the APDU length");
                }
                return ApduStatus::Complete;
            }
            sqn = sqn.next();
        }

        // the rest is yet to come
        ApduStatus::Incomplete
    }

    /// moves the complete APDU at the commit lead to the commit state
    fn read_apdu(&mut self) -> Msgv {
        let mut msg = Msgv::default();
        let Some(apdu_len) = self.slot(self.commit_lead).map(|s| s.skb.apdu_len()) else {
            return msg;
        };

        let mut len = 0;
        loop {
            let sqn = self.commit_lead;
            let idx = self.slot_index(sqn);
            let Some(skb) = self.slots[idx].as_ref().map(|s| s.skb.clone()) else {
                break;
            };
            self.set_state(idx, PktState::CommitData);
            self.commit_lead = sqn.next();

            len += skb.len();
            msg.skbs.push(skb);
            if len >= apdu_len {
                break;
            }
        }
        msg
    }
}
