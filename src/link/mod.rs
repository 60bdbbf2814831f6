//! Sensor link abstraction.
//!
//! The connection manager drives a [`SensorLink`] rather than a concrete
//! Bluetooth stack so the whole lifecycle can be tested deterministically
//! with an injected fake. The real BlueZ-backed implementation lives in
//! [`bluer`] behind the `bluer` cargo feature.

#[cfg(feature = "bluer")]
pub mod bluer;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Buffer size for measurement notification channels.
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 100;

/// Identity of an advertising or connected device.
///
/// Valid only while a connection attempt or session is in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Name carried in the advertisement; may be empty.
    pub advertised_name: String,
    /// Stable identifier for reconnecting to the same device (the Bluetooth
    /// address on BlueZ).
    pub stable_id: String,
}

/// Which of the required GATT services a connected device exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceSet {
    /// Heart-rate service with a measurement characteristic. Mandatory; a
    /// device without it is incompatible.
    pub heart_rate: bool,
    /// Battery service with a level characteristic. Optional.
    pub battery: bool,
}

/// Errors surfaced by a sensor link.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The local adapter is missing or powered off. Transient; retried with
    /// throttled logging.
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    /// The link dropped or was never established.
    #[error("device link is not connected")]
    NotConnected,
    /// Any other Bluetooth failure, scoped to the current session.
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// A link operation exceeded its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),
    /// The platform has no usable Bluetooth transport at all. Fatal to the
    /// connection manager; the rest of the process keeps running.
    #[error("Bluetooth transport unsupported: {0}")]
    Unsupported(String),
}

impl LinkError {
    /// Whether this error permanently stops the connection manager.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LinkError::Unsupported(_))
    }
}

/// One wireless sensor link.
///
/// All methods are cancel-safe; the manager wraps every call in its own
/// deadline instead of relying on transport-internal timeouts.
#[async_trait]
pub trait SensorLink: Send + Sync {
    /// Enumerate nearby advertising devices for up to `scan_window`.
    async fn scan(&self, scan_window: Duration) -> Result<Vec<DeviceInfo>, LinkError>;

    /// Open the link to `device`.
    async fn connect(&self, device: &DeviceInfo) -> Result<(), LinkError>;

    /// Resolve the heart-rate and battery services on the connected device.
    async fn discover_services(&self) -> Result<ServiceSet, LinkError>;

    /// Register for measurement notifications. The returned channel closes
    /// when the device disconnects or the subscription is torn down.
    async fn subscribe_measurements(&self) -> Result<mpsc::Receiver<Vec<u8>>, LinkError>;

    /// Read the current battery level, if the device exposes one.
    async fn read_battery(&self) -> Result<Option<u8>, LinkError>;

    /// Register for battery-change notifications. `None` when the device has
    /// no battery characteristic or does not support notifications on it.
    async fn subscribe_battery(&self) -> Result<Option<mpsc::Receiver<u8>>, LinkError>;

    /// Whether the underlying transport still reports the link as up.
    async fn is_connected(&self) -> bool;

    /// Tear down the link and any registered notification handlers.
    /// Releasing an already-closed link is a no-op.
    async fn disconnect(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(LinkError::Unsupported("no adapter".into()).is_fatal());
        assert!(!LinkError::AdapterUnavailable("powered off".into()).is_fatal());
        assert!(!LinkError::NotConnected.is_fatal());
        assert!(!LinkError::Bluetooth("gatt failure".into()).is_fatal());
        assert!(!LinkError::Timeout("scan").is_fatal());
    }

    #[test]
    fn error_display() {
        let err = LinkError::AdapterUnavailable("hci0 down".into());
        assert_eq!(format!("{err}"), "Bluetooth adapter unavailable: hci0 down");
    }
}
