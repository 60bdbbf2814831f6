//! BlueZ D-Bus sensor link.
//!
//! Talks to the BlueZ daemon through the `bluer` crate. The session and
//! adapter are acquired lazily on each scan attempt so that a missing or
//! powered-off adapter stays a transient, retryable condition.

use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, Session, Uuid};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

use super::{DeviceInfo, LinkError, NOTIFICATION_CHANNEL_CAPACITY, SensorLink, ServiceSet};
use crate::decoder::decode_battery_level;

const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

impl From<bluer::Error> for LinkError {
    fn from(err: bluer::Error) -> Self {
        LinkError::Bluetooth(err.to_string())
    }
}

#[derive(Default)]
struct Inner {
    adapter: Option<Adapter>,
    device: Option<Device>,
    hr_char: Option<Characteristic>,
    battery_char: Option<Characteristic>,
}

/// [`SensorLink`] over the BlueZ daemon.
pub struct BluerLink {
    inner: tokio::sync::Mutex<Inner>,
}

impl BluerLink {
    pub fn new() -> Self {
        BluerLink {
            inner: tokio::sync::Mutex::new(Inner::default()),
        }
    }

    /// Cached adapter, or a fresh session if none is held yet. Failures are
    /// reported as `AdapterUnavailable` so the manager retries them.
    async fn adapter(&self) -> Result<Adapter, LinkError> {
        let mut inner = self.inner.lock().await;
        if let Some(adapter) = inner.adapter.as_ref() {
            return Ok(adapter.clone());
        }
        let adapter = async {
            let session = Session::new().await?;
            let adapter = session.default_adapter().await?;
            adapter.set_powered(true).await?;
            Ok::<_, bluer::Error>(adapter)
        }
        .await
        .map_err(|e| LinkError::AdapterUnavailable(e.to_string()))?;
        inner.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    async fn connected_device(&self) -> Result<Device, LinkError> {
        let inner = self.inner.lock().await;
        inner.device.clone().ok_or(LinkError::NotConnected)
    }
}

impl Default for BluerLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SensorLink for BluerLink {
    async fn scan(&self, scan_window: Duration) -> Result<Vec<DeviceInfo>, LinkError> {
        let adapter = self.adapter().await?;
        let mut events = adapter.discover_devices().await.map_err(|e| {
            // Discovery refusing to start usually means the adapter went away.
            LinkError::AdapterUnavailable(e.to_string())
        })?;

        let deadline = Instant::now() + scan_window;
        let mut found = Vec::new();
        while let Ok(Some(event)) = timeout_at(deadline, events.next()).await {
            if let AdapterEvent::DeviceAdded(address) = event {
                let device = adapter.device(address)?;
                let advertised_name = device.name().await.ok().flatten().unwrap_or_default();
                found.push(DeviceInfo {
                    advertised_name,
                    stable_id: address.to_string(),
                });
            }
        }
        Ok(found)
    }

    async fn connect(&self, device: &DeviceInfo) -> Result<(), LinkError> {
        let address: Address = device
            .stable_id
            .parse()
            .map_err(|_| LinkError::Bluetooth(format!("invalid address {}", device.stable_id)))?;
        let adapter = self.adapter().await?;
        let handle = adapter.device(address)?;
        handle.connect().await?;
        if !handle.is_connected().await? {
            return Err(LinkError::NotConnected);
        }

        let mut inner = self.inner.lock().await;
        inner.device = Some(handle);
        inner.hr_char = None;
        inner.battery_char = None;
        Ok(())
    }

    async fn discover_services(&self) -> Result<ServiceSet, LinkError> {
        let device = self.connected_device().await?;

        let mut hr_char = None;
        let mut battery_char = None;
        for service in device.services().await? {
            let uuid = service.uuid().await?;
            if uuid != HEART_RATE_SERVICE && uuid != BATTERY_SERVICE {
                continue;
            }
            for characteristic in service.characteristics().await? {
                let char_uuid = characteristic.uuid().await?;
                if uuid == HEART_RATE_SERVICE && char_uuid == HEART_RATE_MEASUREMENT {
                    hr_char = Some(characteristic);
                } else if uuid == BATTERY_SERVICE && char_uuid == BATTERY_LEVEL {
                    battery_char = Some(characteristic);
                }
            }
        }

        let set = ServiceSet {
            heart_rate: hr_char.is_some(),
            battery: battery_char.is_some(),
        };
        let mut inner = self.inner.lock().await;
        inner.hr_char = hr_char;
        inner.battery_char = battery_char;
        Ok(set)
    }

    async fn subscribe_measurements(&self) -> Result<mpsc::Receiver<Vec<u8>>, LinkError> {
        let characteristic = {
            let inner = self.inner.lock().await;
            inner.hr_char.clone().ok_or(LinkError::NotConnected)?
        };
        let mut notifications = characteristic.notify().await?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        // The stream ends when the device disconnects, which closes the
        // channel and lets the manager observe the loss.
        tokio::spawn(async move {
            while let Some(frame) = notifications.next().await {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn read_battery(&self) -> Result<Option<u8>, LinkError> {
        let characteristic = {
            let inner = self.inner.lock().await;
            inner.battery_char.clone()
        };
        match characteristic {
            Some(c) => Ok(decode_battery_level(&c.read().await?)),
            None => Ok(None),
        }
    }

    async fn subscribe_battery(&self) -> Result<Option<mpsc::Receiver<u8>>, LinkError> {
        let characteristic = {
            let inner = self.inner.lock().await;
            inner.battery_char.clone()
        };
        let Some(characteristic) = characteristic else {
            return Ok(None);
        };
        if !characteristic.flags().await?.notify {
            return Ok(None);
        }
        let mut notifications = characteristic.notify().await?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(value) = notifications.next().await {
                let Some(percent) = decode_battery_level(&value) else {
                    continue;
                };
                if tx.send(percent).await.is_err() {
                    break;
                }
            }
        });
        Ok(Some(rx))
    }

    async fn is_connected(&self) -> bool {
        let device = {
            let inner = self.inner.lock().await;
            inner.device.clone()
        };
        match device {
            Some(d) => d.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    async fn disconnect(&self) {
        let device = {
            let mut inner = self.inner.lock().await;
            inner.hr_char = None;
            inner.battery_char = None;
            inner.device.take()
        };
        if let Some(device) = device
            && let Err(error) = device.disconnect().await
        {
            tracing::debug!(%error, "disconnect failed; link presumed already down");
        }
    }
}
