//! Reed-Solomon forward error correction over transmission groups.
//!
//! A transmission group is `k` consecutive sequence numbers starting at a multiple of `k`. The
//!  sender can add up to `n - k` parity packets per group, and any `k` of the group's data and
//!  parity packets are enough to rebuild the missing data packets.
//!
//! Shares are the payloads padded to the parity length. With the variable packet length option,
//!  every share carries the original payload length as a big-endian u16 in its last two bytes.
//!  If the group carries fragmented APDUs, the parity packets also carry parity over the
//!  members' encoded fragment headers, with an all-zero encoding for packets without one.

use crate::error::RxwError;
use crate::packet_state::PktState;
use crate::receive_window::{ReceiveWindow, Slot};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::seq_num::SeqNum;
use crate::skbuff::{FragmentHeader, SkBuff};
use anyhow::{anyhow, bail};
use bytes::BufMut;
use reed_solomon_erasure::galois_8::ReedSolomon;
use rustc_hash::FxHashSet;
use std::mem::size_of;
use tracing::{debug, trace, warn};

pub(crate) struct FecEngine {
    rs: ReedSolomon,
    n: u8,
    k: u8,
    /// groups that were declared lost, by first sequence number
    failed_groups: FxHashSet<u32>,
}

impl FecEngine {
    fn new(n: u8, k: u8) -> anyhow::Result<FecEngine> {
        let rs = ReedSolomon::new(k.into(), (n - k).into())
            .map_err(|_| RxwError::InvalidFecParameters { n, k })?;
        Ok(FecEngine {
            rs,
            n,
            k,
            failed_groups: FxHashSet::default(),
        })
    }

    pub(crate) fn parity_shards(&self) -> u8 {
        self.n - self.k
    }

    pub(crate) fn is_failed(&self, tg_sqn: SeqNum) -> bool {
        self.failed_groups.contains(&tg_sqn.to_raw())
    }

    /// forgets failed groups that have left the window completely
    pub(crate) fn forget_groups_before(&mut self, trail: SeqNum) {
        let k = u32::from(self.k);
        self.failed_groups.retain(|&tg_sqn| (SeqNum::from_raw(tg_sqn) + (k - 1)).gte(trail));
    }
}

/// the share a data packet contributes to its group
fn data_share(payload: &[u8], share_len: usize, var_pktlen: bool) -> anyhow::Result<Vec<u8>> {
    let payload_capacity = if var_pktlen {
        share_len.checked_sub(size_of::<u16>())
            .ok_or_else(|| anyhow!("share length {} has no room for the packet length", share_len))?
    }
    else {
        share_len
    };
    if payload.len() > payload_capacity {
        bail!("payload of {} bytes does not fit a share of {} bytes", payload.len(), share_len);
    }

    let mut share = Vec::with_capacity(share_len);
    share.extend_from_slice(payload);
    share.resize(payload_capacity, 0);
    if var_pktlen {
        // payloads are bounded by the maximum TPDU size, which is a u16
        share.put_u16(payload.len().prechecked_cast());
    }
    Ok(share)
}

fn fragment_share(fragment: Option<&FragmentHeader>) -> Vec<u8> {
    let mut share = Vec::with_capacity(FragmentHeader::SERIALIZED_LEN);
    match fragment {
        Some(fragment) => fragment.ser(&mut share),
        None => share.put_bytes(0, FragmentHeader::SERIALIZED_LEN),
    }
    share
}

impl ReceiveWindow {
    /// Enables FEC with `rs_k` data packets per transmission group, as negotiated with the
    ///  sender. The block length n comes from the configuration. Groups in the incoming part of
    ///  the window are re-evaluated, since their boundaries may have changed.
    pub fn update_fec(&mut self, rs_k: u8) -> anyhow::Result<()> {
        let n = self.config.fec_n;
        if rs_k < 2 || !rs_k.is_power_of_two() || rs_k >= n {
            return Err(RxwError::InvalidFecParameters { n, k: rs_k }.into());
        }
        if self.fec.as_ref().map(|f| f.k == rs_k).unwrap_or(false) {
            return Ok(());
        }

        let engine = FecEngine::new(n, rs_k)?;

        // parity of the old group layout is useless now
        for sqn in self.commit_lead.to(self.lead.next()) {
            if self.slot_state(sqn) == Some(PktState::HaveParity) {
                self.lost(sqn);
            }
        }

        debug!("{}: FEC enabled with n={} k={}", self.tsi, n, rs_k);
        self.fec = Some(engine);
        self.tg_size = rs_k.into();
        self.tg_sqn_shift = rs_k.trailing_zeros();

        let mut tg_sqn = self.tg_sqn(self.commit_lead);
        while !self.incoming_is_empty() && tg_sqn.lte(self.lead) {
            self.refresh_contiguity(tg_sqn);
            self.evaluate_fec(tg_sqn);
            tg_sqn += self.tg_size;
        }
        Ok(())
    }

    pub fn is_fec_available(&self) -> bool {
        self.fec.is_some()
    }

    /// Checks whether a transmission group can be completed from parity, and does so if
    ///  possible. A group with parity that can not be completed, and that has no members waiting
    ///  for selective repair any more, is given up: its parity slots are declared lost.
    pub(crate) fn evaluate_fec(&mut self, tg_sqn: SeqNum) {
        match &self.fec {
            Some(fec) if !fec.is_failed(tg_sqn) => {}
            _ => return,
        }

        let last = tg_sqn + (self.tg_size - 1);
        if !self.in_window(tg_sqn) || !self.in_window(last) {
            return;
        }

        let (mut data, mut parity, mut pending) = (0, 0, 0);
        for sqn in tg_sqn.to(last.next()) {
            match self.slot_state(sqn) {
                Some(PktState::HaveData) | Some(PktState::CommitData) => data += 1,
                Some(PktState::HaveParity) => parity += 1,
                Some(state) if state.is_pending() => pending += 1,
                _ => {}
            }
        }

        // without parity, lost members stay lost until parity arrives
        if data == self.tg_size || parity == 0 {
            return;
        }
        if data + parity >= self.tg_size {
            self.reconstruct(tg_sqn);
        }
        else if pending == 0 {
            debug!("{}: transmission group {:?} can not be recovered: {} data, {} parity", self.tsi, tg_sqn, data, parity);
            self.fail_group(tg_sqn);
        }
    }

    fn reconstruct(&mut self, tg_sqn: SeqNum) {
        match self.decode_group(tg_sqn) {
            Ok(rebuilt) => {
                trace!("{}: rebuilt {} packets of transmission group {:?}", self.tsi, rebuilt.len(), tg_sqn);
                for skb in rebuilt {
                    self.fill_slot(skb.sequence, skb);
                    self.stats.fec_recovered += 1;
                }
                self.refresh_contiguity(tg_sqn);
            }
            Err(e) => {
                warn!("{}: FEC decoding of transmission group {:?} failed: {}", self.tsi, tg_sqn, e);
                self.fail_group(tg_sqn);
            }
        }
    }

    /// rebuilds the group's missing data packets from its data and parity
    fn decode_group(&self, tg_sqn: SeqNum) -> anyhow::Result<Vec<SkBuff>> {
        let Some(fec) = &self.fec else {
            bail!("FEC is not enabled");
        };
        let k: usize = fec.k.into();
        let n: usize = fec.n.into();

        let members: Vec<&Slot> = tg_sqn.to(tg_sqn + self.tg_size)
            .filter_map(|sqn| self.slot(sqn))
            .collect();
        if members.len() != k {
            bail!("group is not completely in the window");
        }

        // the first parity packet determines the share layout
        let Some(layout) = members.iter().find(|s| s.state.pkt_state == PktState::HaveParity).map(|s| &s.skb) else {
            bail!("group has no parity");
        };
        let share_len = layout.len();
        let var_pktlen = layout.is_var_pktlen();
        let with_fragments = layout.parity_fragment.is_some();
        if var_pktlen && share_len < size_of::<u16>() {
            bail!("parity of {} bytes can not carry a packet length", share_len);
        }

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; n];
        let mut fragment_shards: Vec<Option<Vec<u8>>> = vec![None; n];
        let mut missing = Vec::new();

        for (j, slot) in members.iter().enumerate() {
            let skb = &slot.skb;
            match slot.state.pkt_state {
                PktState::HaveData | PktState::CommitData => {
                    shards[j] = Some(data_share(&skb.data, share_len, var_pktlen)?);
                    fragment_shards[j] = Some(fragment_share(skb.fragment.as_ref()));
                }
                PktState::HaveParity => {
                    if skb.len() != share_len || skb.is_var_pktlen() != var_pktlen {
                        bail!("parity packets of different shape: {:?} has {} bytes", skb.sequence, skb.len());
                    }
                    let h: usize = self.pkt_sqn(skb.sequence).safe_cast();
                    shards[k + h] = Some(skb.data.to_vec());
                    if with_fragments {
                        match &skb.parity_fragment {
                            Some(encoded) if encoded.len() == FragmentHeader::SERIALIZED_LEN => fragment_shards[k + h] = Some(encoded.to_vec()),
                            _ => bail!("parity packet {:?} without encoded fragment option", skb.sequence),
                        }
                    }
                    missing.push(j);
                }
                _ => missing.push(j),
            }
        }

        fec.rs.reconstruct_data(&mut shards)
            .map_err(|e| anyhow!("Reed-Solomon decoding failed: {:?}", e))?;
        if with_fragments {
            fec.rs.reconstruct_data(&mut fragment_shards)
                .map_err(|e| anyhow!("Reed-Solomon decoding of fragment options failed: {:?}", e))?;
        }

        let mut rebuilt = Vec::with_capacity(missing.len());
        for j in missing {
            let Some(mut payload) = shards[j].take() else {
                bail!("share {} was not rebuilt", j);
            };
            if var_pktlen {
                let len_offset = payload.len() - size_of::<u16>();
                let len = usize::from(u16::from_be_bytes([payload[len_offset], payload[len_offset + 1]]));
                if len > len_offset {
                    bail!("encoded packet length {} exceeds the share", len);
                }
                payload.truncate(len);
            }

            let fragment = if with_fragments {
                match fragment_shards[j].take() {
                    Some(encoded) => FragmentHeader::deser(&mut encoded.as_slice())?,
                    None => bail!("fragment option {} was not rebuilt", j),
                }
            }
            else {
                None
            };

            let offset: u32 = j.prechecked_cast();
            let sequence = tg_sqn + offset;
            let mut skb = SkBuff::new_data(sequence, layout.data_trail, layout.tstamp, payload);
            skb.fragment = fragment;
            rebuilt.push(skb);
        }
        Ok(rebuilt)
    }

    /// gives up on a group: its parity slots become lost
    fn fail_group(&mut self, tg_sqn: SeqNum) {
        if let Some(fec) = self.fec.as_mut() {
            fec.failed_groups.insert(tg_sqn.to_raw());
        }
        for sqn in tg_sqn.to(tg_sqn + self.tg_size) {
            if self.slot_state(sqn) == Some(PktState::HaveParity) {
                let idx = self.slot_index(sqn);
                self.set_state(idx, PktState::LostData);
            }
        }
        self.refresh_contiguity(tg_sqn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RxwConfig;
    use crate::packet_state::RxwReturn;
    use crate::receive_window::tests::{sqn, TSI};
    use crate::skbuff::PacketOptions;
    use bytes::Bytes;
    use rstest::rstest;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    const K: u8 = 4;
    const N: u8 = 8;

    fn fec_window() -> ReceiveWindow {
        let mut config = RxwConfig::default_lan();
        config.rxw_sqns = 32;
        config.fec_n = N;
        let mut window = ReceiveWindow::with_config(TSI, Arc::new(config)).unwrap();
        window.update_fec(K).unwrap();
        window
    }

    fn payloads() -> Vec<Vec<u8>> {
        vec![
            b"first".to_vec(),
            b"second packet".to_vec(),
            b"3".to_vec(),
            b"the fourth one".to_vec(),
        ]
    }

    /// parity shares for one group, the way a sender computes them
    fn encode(payloads: &[Vec<u8>], fragments: &[Option<FragmentHeader>], var_pktlen: bool) -> Vec<(Vec<u8>, Vec<u8>)> {
        let max_len = payloads.iter().map(|p| p.len()).max().unwrap();
        let share_len = if var_pktlen { max_len + 2 } else { max_len };
        let rs = ReedSolomon::new(K.into(), (N - K).into()).unwrap();

        let mut shards: Vec<Vec<u8>> = payloads.iter()
            .map(|p| data_share(p, share_len, var_pktlen).unwrap())
            .collect();
        shards.resize(N.into(), vec![0; share_len]);
        rs.encode(&mut shards).unwrap();

        let mut fragment_shards: Vec<Vec<u8>> = fragments.iter()
            .map(|f| fragment_share(f.as_ref()))
            .collect();
        fragment_shards.resize(N.into(), vec![0; FragmentHeader::SERIALIZED_LEN]);
        rs.encode(&mut fragment_shards).unwrap();

        shards.split_off(K.into()).into_iter()
            .zip(fragment_shards.split_off(K.into()))
            .collect()
    }

    fn data(raw: u32, payload: &[u8], now: Instant) -> SkBuff {
        SkBuff::new_data(sqn(raw), sqn(raw) - 1000, now, Bytes::copy_from_slice(payload))
    }

    fn parity(tg_sqn: u32, h: u32, share: &[u8], now: Instant) -> SkBuff {
        SkBuff::new_parity(sqn(tg_sqn + h), sqn(tg_sqn) - 1000, now, Bytes::copy_from_slice(share))
            .with_options(PacketOptions::VAR_PKTLEN)
    }

    #[rstest]
    #[case::one(1)]
    #[case::not_power_of_two(3)]
    #[case::no_parity(8)]
    #[case::beyond_n(16)]
    fn test_update_fec_invalid(#[case] k: u8) {
        let mut config = RxwConfig::default_lan();
        config.fec_n = N;
        let mut window = ReceiveWindow::with_config(TSI, Arc::new(config)).unwrap();

        let err = window.update_fec(k).unwrap_err();
        assert_eq!(err.downcast_ref::<RxwError>(), Some(&RxwError::InvalidFecParameters { n: N, k }));
        assert!(!window.is_fec_available());
    }

    #[test]
    fn test_update_fec() {
        let window = fec_window();
        assert!(window.is_fec_available());
        assert_eq!(window.tg_size, 4);
        assert_eq!(window.tg_sqn_shift, 2);
        assert_eq!(window.tg_sqn(sqn(7)), sqn(4));
        assert_eq!(window.pkt_sqn(sqn(7)), 3);
        assert_eq!(window.tg_sqn(sqn(8)), sqn(8));
        assert_eq!(window.pkt_sqn(sqn(8)), 0);
        assert_eq!(window.tg_sqn(sqn(u32::MAX)), sqn(u32::MAX - 3));
        assert_eq!(window.pkt_sqn(sqn(u32::MAX)), 3);
    }

    #[rstest]
    #[case::first(0, RxwReturn::Appended)]
    #[case::last(1, RxwReturn::Appended)]
    #[case::out_of_range(2, RxwReturn::Malformed)]
    fn test_parity_index(#[case] h: u32, #[case] expected: RxwReturn) {
        let now = Instant::now();
        let mut config = RxwConfig::default_lan();
        config.fec_n = 6;
        let mut window = ReceiveWindow::with_config(TSI, Arc::new(config)).unwrap();
        window.update_fec(K).unwrap();

        // n - k = 2 parity packets per group
        assert_eq!(window.add(parity(8, h, &[0u8; 8], now), now, now), expected);
    }

    #[test]
    fn test_recover_single_loss() {
        let now = Instant::now();
        let mut window = fec_window();
        let payloads = payloads();
        let parity_shares = encode(&payloads, &[None; 4], true);

        assert_eq!(window.add(data(0, &payloads[0], now), now, now), RxwReturn::Appended);
        assert_eq!(window.add(data(1, &payloads[1], now), now, now), RxwReturn::Appended);
        assert_eq!(window.add(data(3, &payloads[3], now), now, now), RxwReturn::Missing);
        assert_eq!(window.peek_state(sqn(2)).unwrap().pkt_state, PktState::BackOff);

        assert_eq!(window.add(parity(0, 0, &parity_shares[0].0, now), now, now), RxwReturn::Inserted);

        let state = window.peek_state(sqn(2)).unwrap();
        assert_eq!(state.pkt_state, PktState::HaveData);
        assert_eq!(window.peek(sqn(2)).unwrap().data, Bytes::from(payloads[2].clone()));
        assert_eq!(window.peek(sqn(2)).unwrap().tsdu_length, 1);
        assert_eq!(window.parity_count(), 0);
        assert_eq!(window.stats().fec_recovered, 1);
        assert_eq!(window.queues.len(PktState::BackOff), 0);
        assert!(window.peek_state(sqn(0)).unwrap().is_contiguous);

        let mut msgv = Vec::new();
        assert_eq!(window.readv(&mut msgv, 8).unwrap(), 4);
        assert_eq!(msgv[2].skbs[0].data, Bytes::from(payloads[2].clone()));
    }

    #[test]
    fn test_proactive_parity_is_appended() {
        let now = Instant::now();
        let mut window = fec_window();
        let payloads = payloads();
        let parity_shares = encode(&payloads, &[None; 4], true);

        assert_eq!(window.add(data(0, &payloads[0], now), now, now), RxwReturn::Appended);
        assert_eq!(window.add(data(1, &payloads[1], now), now, now), RxwReturn::Appended);
        // #2 and #3 get lost, the sender's parity follows the group
        assert_eq!(window.add(parity(0, 0, &parity_shares[0].0, now), now, now), RxwReturn::Appended);
        assert_eq!(window.peek_state(sqn(2)).unwrap().pkt_state, PktState::HaveParity);
        assert!(!window.peek_state(sqn(0)).unwrap().is_contiguous);

        assert_eq!(window.add(parity(0, 0, &parity_shares[0].0, now), now, now), RxwReturn::Duplicate);
        assert_eq!(window.add(parity(0, 1, &parity_shares[1].0, now), now, now), RxwReturn::Appended);

        for i in 0..4 {
            assert_eq!(window.peek(sqn(i)).unwrap().data, Bytes::from(payloads[i as usize].clone()));
        }
        assert_eq!(window.stats().fec_recovered, 2);
        assert!(window.peek_state(sqn(0)).unwrap().is_contiguous);
    }

    #[test]
    fn test_data_arriving_on_parity_slot() {
        let now = Instant::now();
        let mut window = fec_window();
        let payloads = payloads();
        let parity_shares = encode(&payloads, &[None; 4], true);

        assert_eq!(window.add(data(0, &payloads[0], now), now, now), RxwReturn::Appended);
        assert_eq!(window.add(data(3, &payloads[3], now), now, now), RxwReturn::Missing);
        assert_eq!(window.add(parity(0, 2, &parity_shares[2].0, now), now, now), RxwReturn::Inserted);
        assert_eq!(window.peek_state(sqn(1)).unwrap().pkt_state, PktState::HaveParity);

        // the repair of #1 pushes the parity to #2, which completes the group
        assert_eq!(window.add(data(1, &payloads[1], now), now, now), RxwReturn::Inserted);
        assert_eq!(window.peek(sqn(1)).unwrap().data, Bytes::from(payloads[1].clone()));
        assert_eq!(window.peek(sqn(2)).unwrap().data, Bytes::from(payloads[2].clone()));
        assert_eq!(window.stats().fec_recovered, 1);
    }

    #[test]
    fn test_fixed_length_shares() {
        let now = Instant::now();
        let mut window = fec_window();
        let payloads: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 20]).collect();
        let parity_shares = encode(&payloads, &[None; 4], false);

        for i in [0, 2, 3] {
            let _ = window.add(data(i, &payloads[i as usize], now), now, now);
        }
        let skb = SkBuff::new_parity(sqn(1), sqn(0) - 1000, now, parity_shares[1].0.clone());
        assert_eq!(window.add(skb, now, now), RxwReturn::Inserted);
        assert_eq!(window.peek(sqn(1)).unwrap().data, Bytes::from(payloads[1].clone()));
    }

    #[test]
    fn test_fragment_options_are_rebuilt() {
        let now = Instant::now();
        let mut window = fec_window();
        let payloads: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 10]).collect();
        let fragments: Vec<Option<FragmentHeader>> = (0..4u32)
            .map(|i| Some(FragmentHeader { apdu_first_sqn: sqn(0), frag_offset: 10 * i, apdu_len: 40 }))
            .collect();
        let parity_shares = encode(&payloads, &fragments, false);

        for i in [0, 1, 3] {
            let skb = data(i, &payloads[i as usize], now).with_fragment(fragments[i as usize].unwrap());
            let _ = window.add(skb, now, now);
        }
        let skb = SkBuff::new_parity(sqn(0), sqn(0) - 1000, now, parity_shares[0].0.clone())
            .with_parity_fragment(parity_shares[0].1.clone());
        assert_eq!(window.add(skb, now, now), RxwReturn::Inserted);

        assert_eq!(window.peek(sqn(2)).unwrap().fragment, fragments[2]);
        let mut msgv = Vec::new();
        assert_eq!(window.readv(&mut msgv, 1).unwrap(), 1);
        assert_eq!(msgv[0].skbs.len(), 4);
        assert_eq!(msgv[0].len(), 40);
    }

    #[test]
    fn test_group_fails_without_enough_parity() {
        let now = Instant::now();
        let mut window = fec_window();
        let payloads = payloads();
        let parity_shares = encode(&payloads, &[None; 4], true);

        assert_eq!(window.add(data(0, &payloads[0], now), now, now), RxwReturn::Appended);
        assert_eq!(window.add(data(3, &payloads[3], now), now, now), RxwReturn::Missing);
        assert_eq!(window.add(parity(0, 0, &parity_shares[0].0, now), now, now), RxwReturn::Inserted);
        assert_eq!(window.parity_count(), 1);

        // the last pending member is given up: two data and one parity can not rebuild the group
        window.lost(sqn(2));
        assert_eq!(window.peek_state(sqn(1)).unwrap().pkt_state, PktState::LostData);
        assert_eq!(window.peek_state(sqn(2)).unwrap().pkt_state, PktState::LostData);
        assert_eq!(window.parity_count(), 0);
        assert_eq!(window.lost_count(), 2);
        assert_eq!(window.stats().cumulative_losses, 2);

        assert_eq!(window.add(parity(0, 1, &parity_shares[1].0, now), now, now), RxwReturn::Duplicate);
        assert_eq!(window.peek_state(sqn(1)).unwrap().pkt_state, PktState::LostData);
    }

    #[rstest]
    #[case::no_ncf(false)]
    #[case::no_repair(true)]
    fn test_group_fails_when_repair_times_out(#[case] ncf_received: bool) {
        let now = Instant::now();
        let mut config = RxwConfig::default_lan();
        config.rxw_sqns = 32;
        config.fec_n = N;
        config.nak_rpt_ivl = Duration::from_millis(20);
        config.nak_rdata_ivl = Duration::from_millis(20);
        config.nak_ncf_retries = 1;
        config.nak_data_retries = 1;
        let mut window = ReceiveWindow::with_config(TSI, Arc::new(config)).unwrap();
        window.update_fec(K).unwrap();

        let payloads = payloads();
        let parity_shares = encode(&payloads, &[None; 4], true);

        assert_eq!(window.add(data(0, &payloads[0], now), now, now), RxwReturn::Appended);
        assert_eq!(window.add(data(3, &payloads[3], now), now, now), RxwReturn::Missing);
        assert_eq!(window.add(parity(0, 0, &parity_shares[0].0, now), now, now), RxwReturn::Inserted);
        assert_eq!(window.peek_state(sqn(1)).unwrap().pkt_state, PktState::HaveParity);

        let result = window.update(now, now);
        assert_eq!(result.nak_lists, vec![vec![sqn(2)]]);
        assert!(result.lost.is_empty());
        if ncf_received {
            assert_eq!(window.confirm(sqn(2), now, now + Duration::from_millis(20), now), RxwReturn::Updated);
        }

        let later = now + Duration::from_millis(20);
        let result = window.update(later, later);
        assert_eq!(result.lost, vec![sqn(2)]);

        let states = (0..4)
            .map(|i| window.peek_state(sqn(i)).unwrap().pkt_state)
            .collect::<Vec<_>>();
        assert_eq!(states, vec![PktState::HaveData, PktState::LostData, PktState::LostData, PktState::HaveData]);
        assert_eq!(window.parity_count(), 0);
        assert_eq!(window.lost_count(), 2);
        assert_eq!(window.stats().cumulative_losses, 2);
        assert!(window.update(later, later).lost.is_empty());
    }

    #[test]
    fn test_parity_revives_lost_packet() {
        let now = Instant::now();
        let mut window = fec_window();
        let payloads = payloads();
        let parity_shares = encode(&payloads, &[None; 4], true);

        assert_eq!(window.add(data(0, &payloads[0], now), now, now), RxwReturn::Appended);
        assert_eq!(window.add(data(2, &payloads[2], now), now, now), RxwReturn::Missing);
        assert_eq!(window.add(data(4, &payloads[0], now), now, now), RxwReturn::Missing);
        window.lost(sqn(1));
        assert_eq!(window.stats().cumulative_losses, 1);
        // #3 is still pending, so the group is not given up yet

        assert_eq!(window.add(data(3, &payloads[3], now), now, now), RxwReturn::Inserted);
        assert_eq!(window.peek_state(sqn(1)).unwrap().pkt_state, PktState::LostData);
        assert_eq!(window.add(parity(0, 3, &parity_shares[3].0, now), now, now), RxwReturn::Inserted);

        assert_eq!(window.peek(sqn(1)).unwrap().data, Bytes::from(payloads[1].clone()));
        assert_eq!(window.lost_count(), 0);
        assert_eq!(window.stats().cumulative_losses, 0);
    }

    #[test]
    fn test_inconsistent_parity_fails_group() {
        let now = Instant::now();
        let mut window = fec_window();
        let payloads = payloads();
        let parity_shares = encode(&payloads, &[None; 4], true);

        assert_eq!(window.add(data(0, &payloads[0], now), now, now), RxwReturn::Appended);
        assert_eq!(window.add(data(3, &payloads[3], now), now, now), RxwReturn::Missing);
        assert_eq!(window.add(parity(0, 0, &parity_shares[0].0, now), now, now), RxwReturn::Inserted);
        // shorter than the first parity
        assert_eq!(window.add(parity(0, 1, &parity_shares[1].0[..4], now), now, now), RxwReturn::Inserted);

        assert_eq!(window.peek_state(sqn(1)).unwrap().pkt_state, PktState::LostData);
        assert_eq!(window.peek_state(sqn(2)).unwrap().pkt_state, PktState::LostData);
        assert_eq!(window.stats().fec_recovered, 0);
    }

    #[test]
    fn test_forget_failed_groups() {
        let mut engine = FecEngine::new(N, K).unwrap();
        engine.failed_groups.insert(0);
        engine.failed_groups.insert(4);
        engine.forget_groups_before(sqn(3));
        assert!(engine.is_failed(sqn(0)));
        engine.forget_groups_before(sqn(4));
        assert!(!engine.is_failed(sqn(0)));
        assert!(engine.is_failed(sqn(4)));
    }

    #[rstest]
    #[case::fits(b"abc", 5, true, Some(vec![b'a', b'b', b'c', 0, 3]))]
    #[case::padded(b"ab", 4, false, Some(vec![b'a', b'b', 0, 0]))]
    #[case::too_long(b"abcd", 5, true, None)]
    #[case::no_room_for_length(b"", 1, true, None)]
    fn test_data_share(#[case] payload: &[u8], #[case] share_len: usize, #[case] var_pktlen: bool, #[case] expected: Option<Vec<u8>>) {
        assert_eq!(data_share(payload, share_len, var_pktlen).ok(), expected);
    }
}
