use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Display, Formatter};
use std::time::Instant;

/// Per-slot state of the retransmission state machine.
///
/// ```ascii
/// BackOff --(back-off expiry)--> WaitNcf --(NCF)--> WaitData --(repair)--> HaveData --(read)--> CommitData
///    ^                              |                  |
///    +------(retry left)------------+------------------+
///                                   +--(retries exhausted)--> LostData
/// HaveParity --(group reconstructed)--> HaveData
/// ```
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum PktState {
    /// malformed or unrecoverable, never delivered. This is also the state of a slot that is
    ///  not linked into any queue.
    Error = 0,
    /// missing, waiting for the randomised back-off before a NAK is sent
    BackOff = 1,
    /// NAK sent, waiting for the sender's confirmation
    WaitNcf = 2,
    /// NAK confirmed, waiting for the repair data
    WaitData = 3,
    /// data received, waiting to be committed to the application
    HaveData = 4,
    /// holds parity instead of the original data
    HaveParity = 5,
    /// delivered to the application, waiting to be reclaimed
    CommitData = 6,
    /// recovery failed
    LostData = 7,
}

impl PktState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PktState::Error => "ERROR_STATE",
            PktState::BackOff => "BACK_OFF_STATE",
            PktState::WaitNcf => "WAIT_NCF_STATE",
            PktState::WaitData => "WAIT_DATA_STATE",
            PktState::HaveData => "HAVE_DATA_STATE",
            PktState::HaveParity => "HAVE_PARITY_STATE",
            PktState::CommitData => "COMMIT_DATA_STATE",
            PktState::LostData => "LOST_DATA_STATE",
        }
    }

    /// waiting for a repair through selective NAKs
    pub fn is_pending(&self) -> bool {
        matches!(self, PktState::BackOff | PktState::WaitNcf | PktState::WaitData)
    }
}

impl Display for PktState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a receive window operation
#[must_use]
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum RxwReturn {
    Ok = 0,
    /// filled a gap below the current lead
    Inserted = 1,
    /// extended the lead by one
    Appended = 2,
    /// restarted a timer on an existing slot
    Updated = 3,
    /// extended the lead, leaving a gap of missing sequence numbers
    Missing = 4,
    Duplicate = 5,
    Malformed = 6,
    /// outside the window, or the window is pinned by committed data
    Bounds = 7,
    /// undelivered data had to be discarded to make room
    SlowConsumer = 8,
    Unknown = 9,
}

impl RxwReturn {
    pub fn as_str(&self) -> &'static str {
        match self {
            RxwReturn::Ok => "OK",
            RxwReturn::Inserted => "INSERTED",
            RxwReturn::Appended => "APPENDED",
            RxwReturn::Updated => "UPDATED",
            RxwReturn::Missing => "MISSING",
            RxwReturn::Duplicate => "DUPLICATE",
            RxwReturn::Malformed => "MALFORMED",
            RxwReturn::Bounds => "BOUNDS",
            RxwReturn::SlowConsumer => "SLOW_CONSUMER",
            RxwReturn::Unknown => "UNKNOWN",
        }
    }
}

impl Display for RxwReturn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The state record kept for every slot in the window
#[derive(Clone, Debug)]
pub struct SlotState {
    pub nak_rb_expiry: Option<Instant>,
    pub nak_rpt_expiry: Option<Instant>,
    pub nak_rdata_expiry: Option<Instant>,

    pub pkt_state: PktState,

    pub nak_transmit_count: u8,
    pub ncf_retry_count: u8,
    pub data_retry_count: u8,

    /// only meaningful for the first sequence number of a transmission group: the group has
    ///  no gaps so far
    pub is_contiguous: bool,
}

impl SlotState {
    pub(crate) fn new() -> SlotState {
        SlotState {
            nak_rb_expiry: None,
            nak_rpt_expiry: None,
            nak_rdata_expiry: None,
            pkt_state: PktState::Error,
            nak_transmit_count: 0,
            ncf_retry_count: 0,
            data_retry_count: 0,
            is_contiguous: false,
        }
    }

    /// the expiry that orders the slot in the pending queue of its current state
    pub(crate) fn queue_expiry(&self) -> Option<Instant> {
        match self.pkt_state {
            PktState::BackOff => self.nak_rb_expiry,
            PktState::WaitNcf => self.nak_rpt_expiry,
            PktState::WaitData => self.nak_rdata_expiry,
            _ => None,
        }
    }
}
