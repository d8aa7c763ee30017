//! Async driver for one AM entity: the entity lives behind a single lock, PDUs go out through a
//!  [PduTransport], reassembled units go up to a [UnitDispatcher], and an active loop lets timers
//!  fire and fills a transmit opportunity at every tick.

use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use bytes::Bytes;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, error, trace, warn};
use crate::config::{AmConfig, BearerConfig, CipherDirection};
use crate::entity::{AmEntity, EntityState};
use crate::error::AmError;
use crate::metrics::AmMetrics;
use crate::segmentation::Unit;


/// The unreliable lower layer. It may drop, duplicate and reorder PDUs, but must not corrupt
///  them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PduTransport: Send + Sync + 'static {
    async fn send(&self, bearer_id: u8, pdu: Bytes);
}

/// The upper layer
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UnitDispatcher: Send + Sync + 'static {
    async fn on_unit(&self, bearer_id: u8, unit: Bytes);

    /// The entity failed permanently and stays silent until the bearer is re-established. This is
    ///  called once per failure.
    async fn on_failure(&self, bearer_id: u8, error: AmError);
}

/// Confidentiality protection of unit payloads. The key is the implementation's business; `count`
///  is a per-direction unit counter that must never repeat for a key.
pub trait PayloadCipher: Send + Sync + 'static {
    fn apply(&self, count: u32, bearer_id: u8, direction: CipherDirection, data: &[u8]) -> Bytes;
}

pub struct NoCipher;
impl PayloadCipher for NoCipher {
    fn apply(&self, _count: u32, _bearer_id: u8, _direction: CipherDirection, data: &[u8]) -> Bytes {
        Bytes::copy_from_slice(data)
    }
}


struct AmBearerInner {
    config: Arc<BearerConfig>,
    entity: AmEntity,
    transport: Arc<dyn PduTransport>,
    dispatcher: Arc<dyn UnitDispatcher>,
    cipher: Arc<dyn PayloadCipher>,

    /// cipher count for the next submitted unit
    tx_count: u32,
    /// cipher count for the next delivered unit
    rx_count: u32,
}

impl AmBearerInner {
    fn now() -> std::time::Instant {
        Instant::now().into_std()
    }

    async fn on_fatal(&self, e: AmError) {
        error!("bearer {}: {}", self.config.bearer_id, e);
        self.dispatcher.on_failure(self.config.bearer_id, e).await;
    }

    async fn dispatch(&mut self, units: Vec<Bytes>) {
        for unit in units {
            let plain = self.cipher.apply(self.rx_count, self.config.bearer_id, self.config.direction.reverse(), &unit);
            self.rx_count = self.rx_count.wrapping_add(1);
            self.dispatcher.on_unit(self.config.bearer_id, plain).await;
        }
    }

    async fn do_tick(&mut self) {
        if let Err(e) = self.entity.on_tick(Self::now()) {
            self.on_fatal(e).await;
        }
        self.do_transmit().await;
    }

    /// sends PDUs until the entity has nothing more to send right now
    async fn do_transmit(&mut self) {
        loop {
            match self.entity.pull_pdu(self.config.max_pdu_size, Self::now()) {
                Ok(pdu) => {
                    let buf = pdu.encode();
                    trace!("bearer {}: sending PDU with {} bytes", self.config.bearer_id, buf.len());
                    self.transport.send(self.config.bearer_id, buf).await;
                }
                Err(e) if e.is_retryable() => break,
                Err(AmError::Halted) => break,
                Err(e) => {
                    warn!("bearer {}: unexpected error building a PDU: {}", self.config.bearer_id, e);
                    break;
                }
            }
        }
    }
}


pub struct AmBearer {
    config: Arc<BearerConfig>,
    inner: Arc<RwLock<AmBearerInner>>,
    active_handle: Option<JoinHandle<()>>,
}

impl Drop for AmBearer {
    fn drop(&mut self) {
        if let Some(handle) = self.active_handle.take() {
            handle.abort();
        }
    }
}

impl AmBearer {
    pub fn new(
        config: BearerConfig,
        am_config: &AmConfig,
        transport: Arc<dyn PduTransport>,
        dispatcher: Arc<dyn UnitDispatcher>,
        cipher: Arc<dyn PayloadCipher>,
    ) -> anyhow::Result<AmBearer> {
        config.validate()?;
        let config = Arc::new(config);

        let inner = AmBearerInner {
            config: config.clone(),
            entity: AmEntity::new(am_config)?,
            transport,
            dispatcher,
            cipher,
            tx_count: 0,
            rx_count: 0,
        };

        Ok(AmBearer {
            config,
            inner: Arc::new(RwLock::new(inner)),
            active_handle: None,
        })
    }

    pub fn bearer_id(&self) -> u8 {
        self.config.bearer_id
    }

    pub fn spawn_active_loop(&mut self) {
        if self.active_handle.is_some() {
            warn!("active loop already spawned");
            return;
        }
        self.active_handle = Some(tokio::spawn(Self::do_loop(self.config.clone(), self.inner.clone())));
    }

    /// Ciphers and queues a unit. It is sent at the next transmit opportunity.
    pub async fn submit(&self, data: &[u8]) -> Result<(), AmError> {
        let mut inner = self.inner.write().await;

        let count = inner.tx_count;
        let ciphered = inner.cipher.apply(count, self.config.bearer_id, self.config.direction, data);
        inner.entity.submit(Unit { id: count.into(), data: ciphered })?;
        inner.tx_count = count.wrapping_add(1);

        debug!("bearer {}: queued unit #{} with {} bytes", self.config.bearer_id, count, data.len());
        Ok(())
    }

    pub async fn on_pdu_received(&self, buf: Bytes) {
        let mut inner = self.inner.write().await;
        trace!("bearer {}: received PDU with {} bytes", self.config.bearer_id, buf.len());

        match inner.entity.on_received(buf, AmBearerInner::now()) {
            Ok(units) => inner.dispatch(units).await,
            Err(e) => inner.on_fatal(e).await,
        }
    }

    /// lets expired timers fire, then uses a transmit opportunity
    pub async fn on_tick(&self) {
        self.inner.write().await
            .do_tick().await;
    }

    pub async fn reestablish(&self) {
        let mut inner = self.inner.write().await;
        debug!("bearer {}: re-establishing", self.config.bearer_id);
        inner.entity.reestablish();
        inner.tx_count = 0;
        inner.rx_count = 0;
    }

    pub async fn state(&self) -> EntityState {
        self.inner.read().await.entity.state()
    }

    pub async fn metrics(&self) -> AmMetrics {
        self.inner.read().await.entity.metrics()
    }

    /// Active loop - this function never returns, it runs until the bearer is dropped
    async fn do_loop(config: Arc<BearerConfig>, inner: Arc<RwLock<AmBearerInner>>) {
        let mut tick_interval = interval(config.tick_interval);
        loop {
            tick_interval.tick().await;
            inner.write().await
                .do_tick().await;
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;
    use bytes::BytesMut;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use tokio::runtime::Builder;
    use super::*;
    use crate::pdu_header::{DataHeader, DataPdu, FramingInfo};
    use crate::sn::Sn;
    use crate::status_pdu::{NackEntry, StatusPdu};

    fn bearer_config() -> BearerConfig {
        BearerConfig {
            bearer_id: 3,
            max_pdu_size: 100,
            tick_interval: Duration::from_millis(10),
            direction: CipherDirection::Uplink,
        }
    }

    fn am_config() -> AmConfig {
        AmConfig {
            poll_pdu: None,
            poll_byte: None,
            max_retx_threshold: 1,
            ..AmConfig::default_lte()
        }
    }

    /// xor with the count, and with the direction so that both directions differ
    struct XorCipher;
    impl PayloadCipher for XorCipher {
        fn apply(&self, count: u32, _bearer_id: u8, direction: CipherDirection, data: &[u8]) -> Bytes {
            let key = (count as u8).wrapping_add(1) ^ match direction {
                CipherDirection::Uplink => 0x00,
                CipherDirection::Downlink => 0x80,
            };
            data.iter().map(|b| b ^ key).collect::<Vec<_>>().into()
        }
    }

    fn data_pdu(sn: u16, payload: Vec<u8>) -> Bytes {
        DataPdu {
            header: DataHeader::new(Sn::new(sn), FramingInfo::empty(), vec![]),
            payload: payload.into(),
        }.encode()
    }

    fn status_pdu(ack_sn: u16, nacks: Vec<NackEntry>) -> Bytes {
        let mut buf = BytesMut::new();
        StatusPdu { ack_sn: Sn::new(ack_sn), nacks }.ser(&mut buf);
        buf.freeze()
    }

    fn rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap()
    }

    #[test]
    fn test_invalid_config() {
        let result = AmBearer::new(
            BearerConfig { max_pdu_size: 2, ..bearer_config() },
            &am_config(),
            Arc::new(MockPduTransport::new()),
            Arc::new(MockUnitDispatcher::new()),
            Arc::new(NoCipher),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_submit_and_tick() {
        let mut transport = MockPduTransport::new();
        transport.expect_send()
            .once()
            .with(eq(3u8), eq(Bytes::from_static(&[0xA0, 0x00, b'h' ^ 1, b'i' ^ 1])))
            .return_const(());

        let bearer = AmBearer::new(bearer_config(), &am_config(), Arc::new(transport), Arc::new(MockUnitDispatcher::new()), Arc::new(XorCipher)).unwrap();

        rt().block_on(async move {
            bearer.submit(b"hi").await.unwrap();
            bearer.on_tick().await;
            bearer.on_tick().await;
            assert_eq!(bearer.metrics().await.data_pdus_sent, 1);
        });
    }

    #[test]
    fn test_received_units_are_deciphered_in_order() {
        let mut dispatcher = MockUnitDispatcher::new();
        let mut sequence = Sequence::new();
        for expected in [b"ab", b"cd", b"ef"] {
            dispatcher.expect_on_unit()
                .once()
                .in_sequence(&mut sequence)
                .with(eq(3u8), eq(Bytes::from_static(expected)))
                .return_const(());
        }

        let bearer = AmBearer::new(bearer_config(), &am_config(), Arc::new(MockPduTransport::new()), Arc::new(dispatcher), Arc::new(XorCipher)).unwrap();

        // received PDUs were ciphered by the peer, i.e. in the downlink direction
        let ciphered = |count: u8, data: &[u8]| data.iter().map(|b| b ^ (count + 1) ^ 0x80).collect::<Vec<_>>();

        rt().block_on(async move {
            bearer.on_pdu_received(data_pdu(1, ciphered(1, b"cd"))).await;
            bearer.on_pdu_received(data_pdu(2, ciphered(2, b"ef"))).await;
            bearer.on_pdu_received(data_pdu(0, ciphered(0, b"ab"))).await;
            assert_eq!(bearer.metrics().await.units_delivered, 3);
        });
    }

    #[test]
    fn test_failure_is_reported_once() {
        let mut transport = MockPduTransport::new();
        transport.expect_send()
            .return_const(());
        let mut dispatcher = MockUnitDispatcher::new();
        dispatcher.expect_on_failure()
            .once()
            .with(eq(3u8), eq(AmError::MaxRetransmissionsExceeded { sn: Sn::ZERO }))
            .return_const(());

        let bearer = AmBearer::new(bearer_config(), &am_config(), Arc::new(transport), Arc::new(dispatcher), Arc::new(NoCipher)).unwrap();

        rt().block_on(async move {
            bearer.submit(b"x").await.unwrap();
            bearer.on_tick().await;

            bearer.on_pdu_received(status_pdu(1, vec![NackEntry::full(Sn::ZERO)])).await;
            bearer.on_tick().await;
            bearer.on_pdu_received(status_pdu(1, vec![NackEntry::full(Sn::ZERO)])).await;
            assert_eq!(bearer.state().await, EntityState::Failed);

            bearer.on_pdu_received(status_pdu(1, vec![NackEntry::full(Sn::ZERO)])).await;
            bearer.on_tick().await;
            assert!(matches!(bearer.submit(b"y").await, Err(AmError::Halted)));

            bearer.reestablish().await;
            assert_eq!(bearer.state().await, EntityState::Active);
            bearer.submit(b"y").await.unwrap();
        });
    }

    #[test]
    fn test_active_loop() {
        let mut transport = MockPduTransport::new();
        transport.expect_send()
            .once()
            .with(eq(3u8), eq(Bytes::from_static(&[0xA0, 0x00, b'x'])))
            .return_const(());

        let mut bearer = AmBearer::new(bearer_config(), &am_config(), Arc::new(transport), Arc::new(MockUnitDispatcher::new()), Arc::new(NoCipher)).unwrap();

        rt().block_on(async move {
            bearer.spawn_active_loop();
            bearer.submit(b"x").await.unwrap();
            tokio::time::sleep(Duration::from_millis(25)).await;
            assert_eq!(bearer.metrics().await.data_pdus_sent, 1);
        });
    }
}
