use crate::tsi::Tsi;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;


#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, tsi: Tsi, msg_buf: &[u8]);

    /// `num_lost` sequence numbers were given up on since the last notification
    async fn on_data_loss(&self, tsi: Tsi, num_lost: u32);
}
