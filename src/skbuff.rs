//! The packet buffer abstraction the receive window consumes. Wire parsing happens before a
//!  packet reaches the window, so an `SkBuff` carries the already-decoded header fields that the
//!  window needs, plus the payload as a reference-counted `Bytes` handle. Handing a buffer to the
//!  application is therefore a cheap clone of the handle, and the window can keep its own
//!  reference until the slot is reclaimed.

use crate::seq_num::SeqNum;
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};
use std::time::Instant;

/// Upper bound for the length of an application message (APDU)
pub const MAX_APDU: u32 = u16::MAX as u32;

/// Upper bound for the number of packets an application message may be split into
pub const MAX_FRAGMENTS: usize = 16;

bitflags! {
    /// The subset of packet header option bits that is relevant for the receive window
    #[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
    pub struct PacketOptions: u8 {
        /// parity packets: data shares were padded and carry their original length
        const VAR_PKTLEN = 0b0100_0000;
        const PARITY     = 0b1000_0000;
    }
}

/// Fragmentation option of a packet that carries part of a multi-packet APDU
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FragmentHeader {
    /// sequence number of the APDU's first packet
    pub apdu_first_sqn: SeqNum,
    /// offset of this fragment's payload inside the APDU
    pub frag_offset: u32,
    pub apdu_len: u32,
}

impl FragmentHeader {
    pub const SERIALIZED_LEN: usize = 3 * size_of::<u32>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.apdu_first_sqn.to_raw());
        buf.put_u32(self.frag_offset);
        buf.put_u32(self.apdu_len);
    }

    /// An all-zero encoding stands for 'no fragment header' - this is how packets without the
    ///  option take part in parity encoding of fragment headers.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Option<FragmentHeader>> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("fragment header requires {} bytes, {} available", Self::SERIALIZED_LEN, buf.remaining());
        }

        let apdu_first_sqn = SeqNum::from_raw(buf.get_u32());
        let frag_offset = buf.get_u32();
        let apdu_len = buf.get_u32();

        if apdu_len == 0 {
            return Ok(None);
        }
        Ok(Some(FragmentHeader { apdu_first_sqn, frag_offset, apdu_len }))
    }
}

#[derive(Clone, Debug)]
pub struct SkBuff {
    /// for parity packets, this is the transmission group's first sequence number with the
    ///  parity index in the low bits
    pub sequence: SeqNum,
    /// the sender's advertised transmit window trail
    pub data_trail: SeqNum,
    /// time of arrival
    pub tstamp: Instant,
    pub options: PacketOptions,
    /// payload length as declared in the packet header
    pub tsdu_length: u16,
    pub fragment: Option<FragmentHeader>,
    /// parity packets only: parity over the group's encoded fragment headers
    pub parity_fragment: Option<Bytes>,
    pub data: Bytes,
}

impl SkBuff {
    pub fn new_data(sequence: SeqNum, data_trail: SeqNum, tstamp: Instant, payload: impl Into<Bytes>) -> SkBuff {
        let data: Bytes = payload.into();
        SkBuff {
            sequence,
            data_trail,
            tstamp,
            options: PacketOptions::empty(),
            tsdu_length: u16::try_from(data.len()).unwrap_or(u16::MAX),
            fragment: None,
            parity_fragment: None,
            data,
        }
    }

    pub fn new_parity(sequence: SeqNum, data_trail: SeqNum, tstamp: Instant, payload: impl Into<Bytes>) -> SkBuff {
        let mut result = Self::new_data(sequence, data_trail, tstamp, payload);
        result.options |= PacketOptions::PARITY;
        result
    }

    /// an empty buffer standing in for a sequence number that was not received (yet)
    pub(crate) fn placeholder(sequence: SeqNum, tstamp: Instant) -> SkBuff {
        Self::new_data(sequence, sequence, tstamp, Bytes::new())
    }

    pub fn with_fragment(mut self, fragment: FragmentHeader) -> SkBuff {
        self.fragment = Some(fragment);
        self
    }

    pub fn with_options(mut self, options: PacketOptions) -> SkBuff {
        self.options |= options;
        self
    }

    pub fn with_parity_fragment(mut self, encoded: impl Into<Bytes>) -> SkBuff {
        self.parity_fragment = Some(encoded.into());
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_parity(&self) -> bool {
        self.options.contains(PacketOptions::PARITY)
    }

    pub fn is_var_pktlen(&self) -> bool {
        self.options.contains(PacketOptions::VAR_PKTLEN)
    }

    /// length of the APDU this packet belongs to
    pub fn apdu_len(&self) -> usize {
        match &self.fragment {
            Some(fragment) => fragment.apdu_len as usize,
            None => self.len(),
        }
    }

    /// sequence number of the first packet of the APDU this packet belongs to
    pub fn apdu_first_sqn(&self) -> SeqNum {
        match &self.fragment {
            Some(fragment) => fragment.apdu_first_sqn,
            None => self.sequence,
        }
    }
}
