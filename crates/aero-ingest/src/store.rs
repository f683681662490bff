use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard};

use aero_proto::{decode, Barometric, DecodeError, TelemetrySample, Vector3};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ConfigStore, NetworkConfig};
use crate::receiver::{ReceiverError, UdpReceiver};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store already started")]
    AlreadyStarted,

    #[error("invalid local address {0:?}: expected dotted-quad IPv4")]
    InvalidAddress(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Receiver(#[from] ReceiverError),
}

/// Ingestion counters, kept under the same lock as the sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted: u64,
    pub length_mismatch: u64,
    pub framing_error: u64,
    pub checksum_mismatch: u64,
    /// Message ids skipped between consecutive accepted datagrams.
    pub sequence_gaps: u64,
    pub last_message_id: Option<u8>,
    pub last_update: Option<OffsetDateTime>,
}

impl IngestStats {
    pub fn rejected(&self) -> u64 {
        self.length_mismatch + self.framing_error + self.checksum_mismatch
    }

    fn record_rejection(&mut self, e: &DecodeError) {
        match e {
            DecodeError::LengthMismatch { .. } => self.length_mismatch += 1,
            DecodeError::FramingError { .. } => self.framing_error += 1,
            DecodeError::ChecksumMismatch { .. } => self.checksum_mismatch += 1,
        }
    }

    fn record_accepted(&mut self, message_id: u8) {
        if let Some(prev) = self.last_message_id {
            // Ids wrap at 256; a repeat counts as no gap rather than 255.
            let skipped = message_id.wrapping_sub(prev).wrapping_sub(1);
            if message_id != prev && skipped > 0 {
                self.sequence_gaps += skipped as u64;
            }
        }
        self.last_message_id = Some(message_id);
        self.accepted += 1;
        self.last_update = Some(OffsetDateTime::now_utc());
    }
}

#[derive(Debug, Default)]
struct Latest {
    sample: TelemetrySample,
    stats: IngestStats,
}

#[derive(Debug, Default)]
struct Shared {
    latest: Mutex<Latest>,
}

impl Shared {
    // Writers always store a whole sample, so a poisoned lock still holds
    // consistent data.
    fn lock(&self) -> MutexGuard<'_, Latest> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ingest(&self, payload: &[u8]) {
        match decode(payload) {
            Ok(sample) => {
                let mut latest = self.lock();
                latest.sample = sample;
                latest.stats.record_accepted(sample.message_id);
            }
            Err(e) => {
                warn!("store: rejected datagram ({}): {}", e.reason(), e);
                self.lock().stats.record_rejection(&e);
            }
        }
    }
}

/// Latest-sample store bridging the reactor thread to reader threads.
///
/// `ingest` runs on the reactor thread (as the receiver callback); the
/// getters may be called from any thread. Both sides hold the one lock
/// only long enough to copy a sample in or out.
pub struct TelemetryStore {
    view: TelemetryReader,
    receiver: Option<UdpReceiver>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self { view: TelemetryReader { shared: Arc::new(Shared::default()) }, receiver: None }
    }

    /// Decodes `payload` and, if valid, replaces the stored sample as a
    /// unit. Invalid datagrams are counted and leave the sample untouched.
    pub fn ingest(&self, payload: &[u8]) {
        self.view.shared.ingest(payload);
    }

    pub fn acceleration(&self) -> Vector3 {
        self.view.acceleration()
    }

    pub fn angular_rate(&self) -> Vector3 {
        self.view.angular_rate()
    }

    pub fn barometric(&self) -> Barometric {
        self.view.barometric()
    }

    pub fn sample(&self) -> TelemetrySample {
        self.view.sample()
    }

    pub fn stats(&self) -> IngestStats {
        self.view.stats()
    }

    /// Binds a receiver on the executor behind `handle` and feeds it into
    /// `ingest`.
    pub fn start(&mut self, handle: &Handle, local_address: &str, local_port: u16) -> Result<(), StoreError> {
        let addr: Ipv4Addr = local_address
            .parse()
            .map_err(|_| StoreError::InvalidAddress(local_address.to_string()))?;
        self.start_on(handle, SocketAddrV4::new(addr, local_port))
    }

    /// Like `start`, with the endpoint read from `network/localAddress` and
    /// `network/localPort`.
    pub fn start_from_config(&mut self, handle: &Handle, config: &ConfigStore) -> Result<(), StoreError> {
        let net = NetworkConfig::from_store(config)?;
        self.start_on(handle, SocketAddrV4::new(net.local_address, net.local_port))
    }

    fn start_on(&mut self, handle: &Handle, local: SocketAddrV4) -> Result<(), StoreError> {
        if self.receiver.is_some() {
            return Err(StoreError::AlreadyStarted);
        }
        info!("store: starting telemetry ingestion on {}", local);

        let mut receiver = UdpReceiver::new(local);
        let shared = self.view.shared.clone();
        receiver.register_callback(move |payload, _from| shared.ingest(&payload));
        receiver.start(handle)?;

        self.receiver = Some(receiver);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.stop();
            debug!("store: ingestion stopped");
        }
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.receiver.as_ref().and_then(|r| r.local_addr())
    }

    pub fn is_running(&self) -> bool {
        self.receiver.is_some()
    }

    /// A read-only view that can be handed to other threads.
    pub fn reader(&self) -> TelemetryReader {
        self.view.clone()
    }
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable snapshot reader sharing the store's state.
#[derive(Clone)]
pub struct TelemetryReader {
    shared: Arc<Shared>,
}

impl TelemetryReader {
    pub fn acceleration(&self) -> Vector3 {
        self.shared.lock().sample.acceleration
    }

    pub fn angular_rate(&self) -> Vector3 {
        self.shared.lock().sample.angular_rate
    }

    pub fn barometric(&self) -> Barometric {
        self.shared.lock().sample.barometric
    }

    pub fn sample(&self) -> TelemetrySample {
        self.shared.lock().sample
    }

    pub fn stats(&self) -> IngestStats {
        self.shared.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aero_proto::encode;
    use serde_json::json;

    fn sample(id: u8, base: f32) -> TelemetrySample {
        TelemetrySample {
            message_id: id,
            acceleration: Vector3::new(base, base + 1.0, base + 2.0),
            angular_rate: Vector3::new(-base, -base - 1.0, -base - 2.0),
            barometric: Barometric { pressure: 101_325.0 + base, temperature: 15.0 + base, altitude: base * 10.0 },
        }
    }

    #[test]
    fn test_zero_sample_before_first_datagram() {
        let store = TelemetryStore::new();
        assert_eq!(store.acceleration(), Vector3::default());
        assert_eq!(store.angular_rate(), Vector3::default());
        assert_eq!(store.barometric(), Barometric::default());
        assert_eq!(store.stats(), IngestStats::default());
    }

    #[test]
    fn test_last_valid_datagram_wins() {
        let store = TelemetryStore::new();
        for i in 0..10u8 {
            store.ingest(&encode(&sample(i, i as f32)));
        }
        let last = sample(9, 9.0);
        assert_eq!(store.acceleration(), last.acceleration);
        assert_eq!(store.angular_rate(), last.angular_rate);
        assert_eq!(store.barometric(), last.barometric);
        assert_eq!(store.sample(), last);
        assert_eq!(store.stats().accepted, 10);
    }

    #[test]
    fn test_invalid_datagram_keeps_previous_sample() {
        let store = TelemetryStore::new();
        let good = sample(1, 4.0);
        store.ingest(&encode(&good));

        let mut bad_crc = encode(&sample(2, 8.0));
        bad_crc[38] ^= 0xFF;
        store.ingest(&bad_crc);
        store.ingest(&encode(&sample(3, 9.0))[..40]);
        let mut bad_end = encode(&sample(4, 10.0));
        bad_end[42] = 0;
        store.ingest(&bad_end);

        assert_eq!(store.sample(), good);
        let stats = store.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.checksum_mismatch, 1);
        assert_eq!(stats.length_mismatch, 1);
        assert_eq!(stats.framing_error, 1);
        assert_eq!(stats.rejected(), 3);
        assert_eq!(stats.last_message_id, Some(1));
    }

    #[test]
    fn test_sequence_gaps_counted_across_wrap() {
        let store = TelemetryStore::new();
        for id in [250u8, 251, 254, 255, 0, 3] {
            store.ingest(&encode(&sample(id, 0.0)));
        }
        // 252,253 and 1,2 were skipped.
        let stats = store.stats();
        assert_eq!(stats.sequence_gaps, 4);
        assert_eq!(stats.last_message_id, Some(3));
        assert!(stats.last_update.is_some());
    }

    #[test]
    fn test_repeated_id_is_not_a_gap() {
        let store = TelemetryStore::new();
        store.ingest(&encode(&sample(7, 0.0)));
        store.ingest(&encode(&sample(7, 1.0)));
        assert_eq!(store.stats().sequence_gaps, 0);
    }

    #[test]
    fn test_reader_sees_store_updates() {
        let store = TelemetryStore::new();
        let reader = store.reader();
        store.ingest(&encode(&sample(5, 2.5)));
        assert_eq!(reader.sample(), sample(5, 2.5));
        assert_eq!(reader.stats().accepted, 1);
    }

    #[test]
    fn test_store_dropped_on_reactor_thread() {
        let mut exec = crate::executor::AsyncExecutor::new();
        exec.start().unwrap();
        let handle = exec.handle().unwrap();
        let mut store = TelemetryStore::new();
        store.start(&handle, "127.0.0.1", 0).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        handle.spawn(async move {
            drop(store);
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(std::time::Duration::from_secs(5)).is_ok());
        exec.stop();
    }

    #[test]
    fn test_invalid_address_rejected_before_binding() {
        let mut exec = crate::executor::AsyncExecutor::new();
        exec.start().unwrap();
        let mut store = TelemetryStore::new();
        let err = store.start(&exec.handle().unwrap(), "not-an-ip", 5000).unwrap_err();
        assert!(matches!(err, StoreError::InvalidAddress(_)));
        assert!(!store.is_running());
        exec.stop();
    }

    #[test]
    fn test_missing_config_key_surfaces() {
        let mut exec = crate::executor::AsyncExecutor::new();
        exec.start().unwrap();
        let config = ConfigStore::from_value(json!({ "network": { "localAddress": "127.0.0.1" } }));

        let mut store = TelemetryStore::new();
        let err = store.start_from_config(&exec.handle().unwrap(), &config).unwrap_err();
        assert!(matches!(err, StoreError::Config(ConfigError::NotFound(ref p)) if p == "network/localPort"));
        exec.stop();
    }
}
