pub mod config;
pub mod doctor;
pub mod executor;
pub mod receiver;
pub mod store;

pub use config::{ConfigError, ConfigStore, NetworkConfig};
pub use executor::{AsyncExecutor, ExecutorError};
pub use receiver::{ReceiverError, UdpReceiver};
pub use store::{IngestStats, StoreError, TelemetryReader, TelemetryStore};
