use crate::seq_num::SeqNum;
use crate::tsi::Tsi;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// This is the abstraction for emitting NAKs towards a sender. Encoding NAK packets and putting
///  them on the wire is the transport's business, and keeping it behind a trait allows mocking
///  the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NakSender: Send + Sync + 'static {
    /// selective NAK for up to `MAX_NAK_LIST` sequence numbers
    async fn send_nak_list(&self, tsi: Tsi, sqns: &[SeqNum]);

    /// request for `count` parity packets of the transmission group starting at `tg_sqn`
    async fn send_parity_nak(&self, tsi: Tsi, tg_sqn: SeqNum, count: u32);
}
