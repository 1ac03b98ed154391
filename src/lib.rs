//! Receive side of a NAK-based reliable multicast transport.
//!
//! A sender multicasts a stream of sequence-numbered packets to any number of receivers. There
//!  are no positive acknowledgements: a receiver that notices a gap in the sequence numbers asks
//!  for a repair with a negative acknowledgement (NAK), and the sender confirms the request to
//!  all receivers with an NCF so that other receivers missing the same packet can hold back
//!  their own NAKs.
//!
//! ## The receive window
//!
//! [`receive_window::ReceiveWindow`] buffers one sender's packets between the trail (oldest
//!  packet still held) and the lead (newest sequence number known to exist):
//! * packets are held until they can be delivered in order, missing sequence numbers get
//!   placeholders which go through the repair state machine (see [`recovery`])
//! * application messages (APDUs) can span several packets, they are reassembled on
//!   delivery (see [`delivery`])
//! * if the sender transmits Reed-Solomon parity packets, a transmission group of k packets
//!   can be completed from any k of its data and parity packets (see [`fec`])
//! * sequence numbers are 32 bit and wrap around, the window never spans more than half the
//!   sequence space (see [`seq_num`])
//!
//! The window itself does no I/O and reads no clocks: callers pass in the current time and
//!  timer expiries. [`receive_stream::ReceiveStream`] wraps a window for use in an async
//!  transport, with the message dispatcher and NAK sender traits as the seams to the
//!  application and the network.
//!
//! ## Not covered
//!
//! * the wire format of data, parity, NAK, NCF and SPM packets
//! * the sending side, including the transmit window and parity generation

pub mod config;
pub mod delivery;
pub mod error;
pub mod fec;
pub mod message_dispatcher;
pub mod nak_sender;
pub mod packet_state;
pub mod receive_stream;
pub mod receive_window;
pub mod recovery;
pub mod safe_converter;
pub mod seq_num;
pub mod skbuff;
pub mod tsi;
