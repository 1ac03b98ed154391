use crate::config::RxwConfig;
use crate::delivery::Msgv;
use crate::message_dispatcher::MessageDispatcher;
use crate::nak_sender::NakSender;
use crate::packet_state::{PktState, RxwReturn};
use crate::receive_window::ReceiveWindow;
use crate::seq_num::SeqNum;
use crate::skbuff::SkBuff;
use crate::tsi::Tsi;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, trace, warn};

/// number of messages read from the window in one go
const MSGV_LEN: usize = 32;

struct ReceiveStreamInner {
    config: Arc<RxwConfig>,
    window: ReceiveWindow,
    nak_sender: Arc<dyn NakSender>,
    /// cumulative losses of the window at the time of the last loss notification
    reported_losses: u32,
}

impl ReceiveStreamInner {
    fn tsi(&self) -> Tsi {
        self.window.tsi()
    }

    /// Reads everything that is deliverable. Lost sequence numbers at the commit lead are
    ///  reclaimed so that delivery can continue past them.
    fn consume_messages(&mut self) -> Vec<Bytes> {
        let mut messages = Vec::new();
        loop {
            let mut msgv: Vec<Msgv> = Vec::new();
            let num_read = match self.window.readv(&mut msgv, MSGV_LEN) {
                Ok(n) => n,
                Err(e) => {
                    warn!("{}: reading from the receive window failed: {}", self.tsi(), e);
                    break;
                }
            };
            messages.extend(msgv.iter().map(Msgv::to_bytes));

            if self.window.slot_state(self.window.commit_lead()) == Some(PktState::LostData) {
                let num_reclaimed = self.window.remove_trail();
                trace!("{}: skipping lost data at the commit lead, reclaimed {} slots", self.tsi(), num_reclaimed);
                continue;
            }
            if num_read < MSGV_LEN {
                break;
            }
        }

        self.window.remove_commit();
        messages
    }

    /// the number of losses since the last call, if any. FEC can lower the window's loss count
    ///  again, so the reported count only ever rises.
    fn unreported_losses(&mut self) -> Option<u32> {
        let cumulative_losses = self.window.stats().cumulative_losses;
        let new_losses = cumulative_losses.saturating_sub(self.reported_losses);
        self.reported_losses = self.reported_losses.max(cumulative_losses);
        (new_losses > 0).then_some(new_losses)
    }

    async fn do_send_naks(&mut self) {
        let now = Instant::now().into_std();
        let nak_rb_expiry = now + self.config.nak_rb_ivl();
        let result = self.window.update(now, nak_rb_expiry);

        let tsi = self.tsi();
        for nak_list in &result.nak_lists {
            trace!("{}: sending NAK for {:?}", tsi, nak_list);
            self.nak_sender.send_nak_list(tsi, nak_list).await;
        }
        for parity_nak in &result.parity_naks {
            trace!("{}: requesting {} parity packets for transmission group {:?}", tsi, parity_nak.count, parity_nak.tg_sqn);
            self.nak_sender.send_parity_nak(tsi, parity_nak.tg_sqn, parity_nak.count).await;
        }
        if !result.lost.is_empty() {
            debug!("{}: gave up on {:?}", tsi, result.lost);
        }
    }
}

/// Drives the receive window for one sender: packets and control messages are fed in through
///  `on_data`, `on_ncf` and `on_spm`, deliverable messages are handed to the message
///  dispatcher as soon as they are complete, and an active loop sends NAKs for missing data.
pub struct ReceiveStream {
    config: Arc<RxwConfig>,
    inner: Arc<RwLock<ReceiveStreamInner>>,
    active_handle: Option<JoinHandle<()>>,
    message_dispatcher: Arc<dyn MessageDispatcher>,
}

impl Drop for ReceiveStream {
    fn drop(&mut self) {
        if let Some(handle) = &self.active_handle {
            handle.abort();
        }
    }
}

impl ReceiveStream {
    pub fn new(
        config: Arc<RxwConfig>,
        tsi: Tsi,
        nak_sender: Arc<dyn NakSender>,
        message_dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<ReceiveStream> {
        config.validate()?;
        let window = ReceiveWindow::with_config(tsi, config.clone())?;

        let inner = Arc::new(RwLock::new(ReceiveStreamInner {
            config: config.clone(),
            window,
            nak_sender,
            reported_losses: 0,
        }));

        Ok(ReceiveStream {
            config,
            inner,
            active_handle: None,
            message_dispatcher,
        })
    }

    pub fn spawn_active_loop(&mut self) {
        if self.active_handle.is_some() {
            warn!("active loop already spawned");
            return;
        }
        self.active_handle = Some(tokio::spawn(Self::do_loop(self.config.clone(), self.inner.clone(), self.message_dispatcher.clone())));
    }

    pub async fn tsi(&self) -> Tsi {
        self.inner.read().await.tsi()
    }

    /// Enables FEC with `rs_k` data packets per transmission group
    pub async fn update_fec(&self, rs_k: u8) -> anyhow::Result<()> {
        self.inner.write().await
            .window.update_fec(rs_k)
    }

    /// Handles a data or parity packet, dispatching all messages it completes
    pub async fn on_data(&self, skb: SkBuff) -> RxwReturn {
        let mut inner = self.inner.write().await;

        trace!("{}: received packet {:?} with length {}", inner.tsi(), skb.sequence, skb.len());

        let now = Instant::now().into_std();
        let nak_rb_expiry = now + self.config.nak_rb_ivl();
        let result = inner.window.add(skb, now, nak_rb_expiry);
        if result == RxwReturn::SlowConsumer {
            warn!("{}: window full, discarded undelivered data", inner.tsi());
        }

        Self::dispatch(&mut inner, self.message_dispatcher.as_ref()).await;
        result
    }

    /// Handles an NCF, i.e. the sender's confirmation that it is going to repair `sqn`
    pub async fn on_ncf(&self, sqn: SeqNum) -> RxwReturn {
        let mut inner = self.inner.write().await;

        let now = Instant::now().into_std();
        let nak_rdata_expiry = now + self.config.nak_rdata_ivl;
        let nak_rb_expiry = now + self.config.nak_rb_ivl();
        let result = inner.window.confirm(sqn, now, nak_rdata_expiry, nak_rb_expiry);
        trace!("{}: NCF for {:?}: {}", inner.tsi(), sqn, result);
        result
    }

    /// Handles an SPM advertising the sender's transmit window. Returns the number of sequence
    ///  numbers that this revealed as missing.
    pub async fn on_spm(&self, txw_lead: SeqNum, txw_trail: SeqNum) -> u32 {
        let mut inner = self.inner.write().await;

        let now = Instant::now().into_std();
        let nak_rb_expiry = now + self.config.nak_rb_ivl();
        let num_missing = inner.window.update_window(txw_lead, txw_trail, now, nak_rb_expiry);

        // an advanced trail can turn pending data into losses
        Self::dispatch(&mut inner, self.message_dispatcher.as_ref()).await;
        num_missing
    }

    async fn dispatch(inner: &mut ReceiveStreamInner, message_dispatcher: &dyn MessageDispatcher) {
        let tsi = inner.tsi();
        for buf in inner.consume_messages() {
            message_dispatcher.on_message(tsi, &buf).await;
        }
        if let Some(num_lost) = inner.unreported_losses() {
            debug!("{}: {} sequence numbers lost", tsi, num_lost);
            message_dispatcher.on_data_loss(tsi, num_lost).await;
        }
    }

    /// Active loop - this function never returns, it runs until it is taken out of dispatch
    async fn do_loop(config: Arc<RxwConfig>, inner: Arc<RwLock<ReceiveStreamInner>>, message_dispatcher: Arc<dyn MessageDispatcher>) {
        let mut timer_interval = interval(config.timer_tick);

        loop {
            timer_interval.tick().await;

            let mut inner = inner.write().await;
            inner.do_send_naks().await;
            // timeouts may have declared the data at the commit lead lost
            Self::dispatch(&mut inner, message_dispatcher.as_ref()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_dispatcher::MockMessageDispatcher;
    use crate::nak_sender::MockNakSender;
    use crate::receive_window::tests::{ms, pkt, sqn, TSI};
    use crate::skbuff::FragmentHeader;
    use async_trait::async_trait;
    use tokio::runtime::Builder;
    use tokio::sync::Mutex;
    use tokio::time::sleep;

    fn config() -> Arc<RxwConfig> {
        let mut config = RxwConfig::default_lan();
        config.rxw_sqns = 32;
        config.nak_rpt_ivl = ms(20);
        config.nak_rdata_ivl = ms(20);
        config.nak_ncf_retries = 1;
        config.nak_data_retries = 1;
        Arc::new(config)
    }

    fn data(raw: u32) -> SkBuff {
        pkt(raw, Instant::now().into_std())
    }

    struct CollectingMessageDispatcher {
        messages: Mutex<Vec<(Tsi, Vec<u8>)>>,
        losses: Mutex<Vec<(Tsi, u32)>>,
    }
    impl CollectingMessageDispatcher {
        fn new() -> CollectingMessageDispatcher {
            CollectingMessageDispatcher {
                messages: Default::default(),
                losses: Default::default(),
            }
        }

        async fn assert_messages(&self, expected_messages: Vec<u8>) {
            let expected = expected_messages.into_iter()
                .map(|n| (TSI, vec![n; 10]))
                .collect::<Vec<_>>();

            assert_eq!(self.messages.lock().await.clone(), expected);
        }

        async fn assert_losses(&self, expected_losses: Vec<u32>) {
            let expected = expected_losses.into_iter()
                .map(|n| (TSI, n))
                .collect::<Vec<_>>();

            assert_eq!(self.losses.lock().await.clone(), expected);
        }
    }
    #[async_trait]
    impl MessageDispatcher for CollectingMessageDispatcher {
        async fn on_message(&self, tsi: Tsi, msg_buf: &[u8]) {
            self.messages.lock().await.push((tsi, msg_buf.to_vec()));
        }

        async fn on_data_loss(&self, tsi: Tsi, num_lost: u32) {
            self.losses.lock().await.push((tsi, num_lost));
        }
    }

    #[test]
    fn test_new_invalid_config() {
        let mut config = RxwConfig::default_lan();
        config.rxw_sqns = 0;
        assert!(ReceiveStream::new(Arc::new(config), TSI, Arc::new(MockNakSender::new()), Arc::new(MockMessageDispatcher::new())).is_err());
    }

    #[test]
    fn test_on_data_in_order() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let message_dispatcher = Arc::new(CollectingMessageDispatcher::new());
            let receive_stream = ReceiveStream::new(config(), TSI, Arc::new(MockNakSender::new()), message_dispatcher.clone()).unwrap();

            assert_eq!(receive_stream.on_data(data(1)).await, RxwReturn::Appended);
            assert_eq!(receive_stream.on_data(data(2)).await, RxwReturn::Appended);
            assert_eq!(receive_stream.on_data(data(3)).await, RxwReturn::Appended);

            message_dispatcher.assert_messages(vec![1, 2, 3]).await;
            message_dispatcher.assert_losses(vec![]).await;

            // delivered slots are reclaimed, except for the commit lead's transmission group
            let inner = receive_stream.inner.read().await;
            assert_eq!(inner.window.commit_lead(), sqn(4));
            assert_eq!(inner.window.trail(), sqn(4));
        });
    }

    #[test]
    fn test_on_data_gap_is_filled() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let message_dispatcher = Arc::new(CollectingMessageDispatcher::new());
            let receive_stream = ReceiveStream::new(config(), TSI, Arc::new(MockNakSender::new()), message_dispatcher.clone()).unwrap();

            receive_stream.on_data(data(1)).await;
            assert_eq!(receive_stream.on_data(data(3)).await, RxwReturn::Missing);
            message_dispatcher.assert_messages(vec![1]).await;

            assert_eq!(receive_stream.on_data(data(2)).await, RxwReturn::Inserted);
            message_dispatcher.assert_messages(vec![1, 2, 3]).await;

            assert_eq!(receive_stream.on_data(data(2)).await, RxwReturn::Duplicate);
            message_dispatcher.assert_messages(vec![1, 2, 3]).await;
        });
    }

    #[test]
    fn test_on_data_skips_apdu_with_lost_fragment() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let message_dispatcher = Arc::new(CollectingMessageDispatcher::new());
            let receive_stream = ReceiveStream::new(config(), TSI, Arc::new(MockNakSender::new()), message_dispatcher.clone()).unwrap();

            let fragment = |raw: u32| SkBuff::new_data(sqn(raw), sqn(raw) - 1000, Instant::now().into_std(), vec![raw as u8; 10])
                .with_fragment(FragmentHeader { apdu_first_sqn: sqn(0), frag_offset: raw * 10, apdu_len: 30 });

            assert_eq!(receive_stream.on_data(fragment(0)).await, RxwReturn::Appended);
            assert_eq!(receive_stream.on_data(fragment(2)).await, RxwReturn::Missing);
            receive_stream.inner.write().await.window.lost(sqn(1));

            assert_eq!(receive_stream.on_data(data(3)).await, RxwReturn::Appended);

            message_dispatcher.assert_messages(vec![3]).await;
            message_dispatcher.assert_losses(vec![3]).await;
            assert_eq!(receive_stream.inner.read().await.window.trail(), sqn(4));
        });
    }

    #[test]
    fn test_loss_notification_never_repeats() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let receive_stream = ReceiveStream::new(config(), TSI, Arc::new(MockNakSender::new()), Arc::new(MockMessageDispatcher::new())).unwrap();
            let mut inner = receive_stream.inner.write().await;

            inner.window.stats.cumulative_losses = 2;
            assert_eq!(inner.unreported_losses(), Some(2));

            // FEC revived a lost packet
            inner.window.stats.cumulative_losses = 1;
            assert_eq!(inner.unreported_losses(), None);
            inner.window.stats.cumulative_losses = 2;
            assert_eq!(inner.unreported_losses(), None);

            inner.window.stats.cumulative_losses = 3;
            assert_eq!(inner.unreported_losses(), Some(1));
        });
    }

    #[test]
    fn test_on_ncf() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let receive_stream = ReceiveStream::new(config(), TSI, Arc::new(MockNakSender::new()), Arc::new(CollectingMessageDispatcher::new())).unwrap();

            receive_stream.on_data(data(1)).await;
            receive_stream.on_data(data(3)).await;

            assert_eq!(receive_stream.on_ncf(sqn(2)).await, RxwReturn::Updated);
            assert_eq!(receive_stream.on_ncf(sqn(1)).await, RxwReturn::Bounds);
            assert_eq!(receive_stream.on_ncf(sqn(5)).await, RxwReturn::Appended);

            let inner = receive_stream.inner.read().await;
            assert_eq!(inner.window.slot_state(sqn(2)), Some(PktState::WaitData));
            assert_eq!(inner.window.slot_state(sqn(4)), Some(PktState::BackOff));
            assert_eq!(inner.window.slot_state(sqn(5)), Some(PktState::WaitData));
        });
    }

    #[test]
    fn test_on_spm() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let message_dispatcher = Arc::new(CollectingMessageDispatcher::new());
            let receive_stream = ReceiveStream::new(config(), TSI, Arc::new(MockNakSender::new()), message_dispatcher.clone()).unwrap();

            receive_stream.on_data(data(1)).await;
            assert_eq!(receive_stream.on_spm(sqn(4), sqn(1)).await, 3);
            assert_eq!(receive_stream.on_spm(sqn(4), sqn(1)).await, 0);

            message_dispatcher.assert_messages(vec![1]).await;
            assert_eq!(receive_stream.inner.read().await.window.lead(), sqn(4));
        });
    }

    #[test]
    fn test_active_loop_sends_nak() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut nak_sender = MockNakSender::new();
            nak_sender.expect_send_nak_list()
                .once()
                .withf(|tsi, sqns| tsi == &TSI && sqns == [sqn(2), sqn(3)].as_slice())
                .returning(|_, _| ());

            let mut config = RxwConfig::default_lan();
            config.rxw_sqns = 32;
            let mut receive_stream = ReceiveStream::new(Arc::new(config), TSI, Arc::new(nak_sender), Arc::new(CollectingMessageDispatcher::new())).unwrap();
            receive_stream.spawn_active_loop();

            receive_stream.on_data(data(1)).await;
            receive_stream.on_data(data(4)).await;

            // back-off is at most 50ms, the NCF timeout is 2s
            sleep(ms(200)).await;

            let inner = receive_stream.inner.read().await;
            assert_eq!(inner.window.slot_state(sqn(2)), Some(PktState::WaitNcf));
            assert_eq!(inner.window.slot_state(sqn(3)), Some(PktState::WaitNcf));
        });
    }

    #[test]
    fn test_active_loop_skips_lost_data() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut nak_sender = MockNakSender::new();
            nak_sender.expect_send_nak_list()
                .once()
                .withf(|_, sqns| sqns == [sqn(2)].as_slice())
                .returning(|_, _| ());

            let message_dispatcher = Arc::new(CollectingMessageDispatcher::new());
            let mut receive_stream = ReceiveStream::new(config(), TSI, Arc::new(nak_sender), message_dispatcher.clone()).unwrap();
            receive_stream.spawn_active_loop();

            receive_stream.on_data(data(1)).await;
            receive_stream.on_data(data(3)).await;
            message_dispatcher.assert_messages(vec![1]).await;

            // back-off, then a single NCF timeout
            sleep(ms(200)).await;

            message_dispatcher.assert_messages(vec![1, 3]).await;
            message_dispatcher.assert_losses(vec![1]).await;
            assert_eq!(receive_stream.inner.read().await.window.stats().cumulative_losses, 1);

            // late repair
            assert_eq!(receive_stream.on_data(data(2)).await, RxwReturn::Duplicate);
            message_dispatcher.assert_messages(vec![1, 3]).await;
        });
    }

    #[test]
    fn test_active_loop_requests_parity() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut nak_sender = MockNakSender::new();
            nak_sender.expect_send_parity_nak()
                .once()
                .withf(|tsi, tg_sqn, count| tsi == &TSI && tg_sqn == &sqn(0) && *count == 2)
                .returning(|_, _, _| ());

            let mut config = RxwConfig::default_lan();
            config.rxw_sqns = 32;
            config.fec_n = 8;
            config.use_ondemand_parity = true;
            let mut receive_stream = ReceiveStream::new(Arc::new(config), TSI, Arc::new(nak_sender), Arc::new(CollectingMessageDispatcher::new())).unwrap();
            receive_stream.update_fec(4).await.unwrap();
            receive_stream.spawn_active_loop();

            receive_stream.on_data(data(0)).await;
            receive_stream.on_data(data(3)).await;

            sleep(ms(200)).await;
        });
    }

    #[test]
    fn test_update_fec_invalid() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let receive_stream = ReceiveStream::new(config(), TSI, Arc::new(MockNakSender::new()), Arc::new(MockMessageDispatcher::new())).unwrap();
            assert!(receive_stream.update_fec(3).await.is_err());
            assert_eq!(receive_stream.tsi().await, TSI);
        });
    }
}
