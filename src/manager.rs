//! Device connection manager.
//!
//! Owns the sensor link lifecycle as an explicit state machine driven by a
//! single cooperative loop: discover, connect, resolve services, subscribe,
//! stream, recover, repeat. Every decoded reading is fed into the shared
//! [`Core`]; battery tracking and stream-health monitoring run as supervised
//! helper tasks tied to the same shutdown signal.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::core::{Core, reading_now};
use crate::decoder::decode_measurement;
use crate::link::{DeviceInfo, LinkError, SensorLink};
use crate::throttle::LogThrottle;

/// Extra headroom on the scan deadline so the link's own window can elapse
/// before the manager declares the step timed out.
const SCAN_DEADLINE_SLACK: Duration = Duration::from_secs(1);

/// Deadline for individual battery characteristic reads.
const BATTERY_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the streaming loop re-checks that the link is still up.
const LINK_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Phase of the connection lifecycle. Exactly one instance exists
/// process-wide, owned by the manager loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    Subscribing,
    Streaming,
    Recovering,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting => "connecting",
            ConnectionState::DiscoveringServices => "discovering-services",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Recovering => "recovering",
        };
        f.write_str(name)
    }
}

/// Tunables for the connection lifecycle. Defaults follow the timings the
/// lifecycle was designed around; tests shrink them to milliseconds.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Case-insensitive substring a device's advertised name must contain.
    /// Empty matches any named device.
    pub device_name_token: String,
    /// Keep readings whose bpm is zero instead of dropping them.
    pub allow_zero_bpm: bool,
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    pub discover_timeout: Duration,
    pub subscribe_timeout: Duration,
    /// Pause before rescanning after a failed or empty scan, or a failed
    /// connect/subscribe.
    pub scan_retry_delay: Duration,
    /// Pause after rejecting an incompatible device.
    pub incompatible_delay: Duration,
    /// Pause in Recovering before looping back to Scanning.
    pub recover_delay: Duration,
    /// Silence on a live link longer than this flags the stream degraded.
    pub health_grace: Duration,
    /// Period of the battery poll that backs up silent notification paths.
    pub battery_poll_interval: Duration,
    /// Minimum spacing between identical transient-failure warnings.
    pub warn_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            device_name_token: String::new(),
            allow_zero_bpm: false,
            scan_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            discover_timeout: Duration::from_secs(5),
            subscribe_timeout: Duration::from_secs(5),
            scan_retry_delay: Duration::from_secs(2),
            incompatible_delay: Duration::from_secs(2),
            recover_delay: Duration::from_secs(1),
            health_grace: Duration::from_secs(20),
            battery_poll_interval: Duration::from_secs(60),
            warn_interval: Duration::from_secs(30),
        }
    }
}

/// Per-session state, cleared whenever the lifecycle returns to Scanning
/// through Recovering.
#[derive(Default)]
struct SessionState {
    device: Option<DeviceInfo>,
    frames: Option<mpsc::Receiver<Vec<u8>>>,
}

/// Pick a device for this session.
///
/// Prefers the first device whose advertised name contains `token`
/// case-insensitively; falls back to the first device with any non-empty
/// name; yields `None` when no device qualifies.
pub fn select_device(devices: &[DeviceInfo], token: &str) -> Option<DeviceInfo> {
    let token = token.to_lowercase();
    if !token.is_empty()
        && let Some(device) = devices
            .iter()
            .find(|d| d.advertised_name.to_lowercase().contains(&token))
    {
        return Some(device.clone());
    }
    devices
        .iter()
        .find(|d| !d.advertised_name.is_empty())
        .cloned()
}

/// Connection-lifecycle state machine.
pub struct ConnectionManager {
    core: Arc<Core>,
    link: Arc<dyn SensorLink>,
    config: ManagerConfig,
    state: Mutex<ConnectionState>,
    throttle: Mutex<LogThrottle>,
    stream_degraded: Arc<AtomicBool>,
    last_accepted: Arc<Mutex<Option<Instant>>>,
}

impl ConnectionManager {
    pub fn new(core: Arc<Core>, link: Arc<dyn SensorLink>, config: ManagerConfig) -> Self {
        let warn_interval = config.warn_interval;
        ConnectionManager {
            core,
            link,
            config,
            state: Mutex::new(ConnectionState::Idle),
            throttle: Mutex::new(LogThrottle::new(warn_interval)),
            stream_degraded: Arc::new(AtomicBool::new(false)),
            last_accepted: Arc::new(Mutex::new(None)),
        }
    }

    /// Current lifecycle phase, for diagnostics.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the link is up but readings stopped for longer than the grace
    /// period. Diagnostic only; never forces a reconnect by itself.
    pub fn is_stream_degraded(&self) -> bool {
        self.stream_degraded.load(Ordering::Relaxed)
    }

    /// Run the lifecycle until `shutdown` fires or the transport turns out to
    /// be permanently unsupported.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut session = SessionState::default();
        let mut state = ConnectionState::Idle;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(state);
            let step = match state {
                ConnectionState::Idle => Ok(ConnectionState::Scanning),
                ConnectionState::Scanning => self.scan_step(&mut session, &mut shutdown).await,
                ConnectionState::Connecting => self.connect_step(&mut session, &mut shutdown).await,
                ConnectionState::DiscoveringServices => {
                    self.discover_step(&mut session, &mut shutdown).await
                }
                ConnectionState::Subscribing => {
                    self.subscribe_step(&mut session, &mut shutdown).await
                }
                ConnectionState::Streaming => self.stream_step(&mut session, &mut shutdown).await,
                ConnectionState::Recovering => self.recover_step(&mut session, &mut shutdown).await,
            };
            match step {
                Ok(next) => state = next,
                Err(error) => {
                    tracing::error!(%error, "connection manager stopping permanently");
                    break;
                }
            }
        }
        self.set_state(ConnectionState::Idle);
        self.link.disconnect().await;
    }

    async fn scan_step(
        &self,
        session: &mut SessionState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ConnectionState, LinkError> {
        let scan = self.bounded(
            "scan",
            self.config.scan_timeout + SCAN_DEADLINE_SLACK,
            self.link.scan(self.config.scan_timeout),
        );
        let devices = match scan.await {
            Ok(devices) => devices,
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => {
                self.warn_throttled("scan", &error, "scan failed; will retry");
                self.pause(self.config.scan_retry_delay, shutdown).await;
                return Ok(ConnectionState::Scanning);
            }
        };

        match select_device(&devices, &self.config.device_name_token) {
            Some(device) => {
                tracing::info!(
                    name = %device.advertised_name,
                    id = %device.stable_id,
                    "selected device"
                );
                session.device = Some(device);
                Ok(ConnectionState::Connecting)
            }
            None => {
                if self.should_log("no-device") {
                    tracing::warn!(
                        seen = devices.len(),
                        "no matching device found; rescanning"
                    );
                }
                self.pause(self.config.scan_retry_delay, shutdown).await;
                Ok(ConnectionState::Scanning)
            }
        }
    }

    async fn connect_step(
        &self,
        session: &mut SessionState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ConnectionState, LinkError> {
        let Some(device) = session.device.clone() else {
            return Ok(ConnectionState::Scanning);
        };
        let result = self
            .bounded(
                "connect",
                self.config.connect_timeout,
                self.link.connect(&device),
            )
            .await;
        match result {
            Ok(()) if self.link.is_connected().await => {
                tracing::info!(name = %device.advertised_name, "connected");
                Ok(ConnectionState::DiscoveringServices)
            }
            Ok(()) => {
                if self.should_log("connect") {
                    tracing::warn!(
                        name = %device.advertised_name,
                        "link reports not connected after connect returned"
                    );
                }
                self.release_and_pause(session, self.config.scan_retry_delay, shutdown)
                    .await;
                Ok(ConnectionState::Scanning)
            }
            Err(error) if error.is_fatal() => Err(error),
            Err(error) => {
                self.warn_throttled("connect", &error, "connect failed; rescanning");
                self.release_and_pause(session, self.config.scan_retry_delay, shutdown)
                    .await;
                Ok(ConnectionState::Scanning)
            }
        }
    }

    async fn discover_step(
        &self,
        session: &mut SessionState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ConnectionState, LinkError> {
        let result = self
            .bounded(
                "service discovery",
                self.config.discover_timeout,
                self.link.discover_services(),
            )
            .await;
        match result {
            Ok(services) if services.heart_rate => {
                if !services.battery {
                    tracing::debug!("device has no battery service; battery reporting disabled");
                }
                Ok(ConnectionState::Subscribing)
            }
            Ok(_) => {
                // Incompatible for this whole session, not an error.
                tracing::info!("device lacks the heart-rate service; disconnecting");
                self.release_and_pause(session, self.config.incompatible_delay, shutdown)
                    .await;
                Ok(ConnectionState::Scanning)
            }
            Err(error) if error.is_fatal() => Err(error),
            Err(error) => {
                self.warn_throttled("discover", &error, "service discovery failed; rescanning");
                self.release_and_pause(session, self.config.scan_retry_delay, shutdown)
                    .await;
                Ok(ConnectionState::Scanning)
            }
        }
    }

    async fn subscribe_step(
        &self,
        session: &mut SessionState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ConnectionState, LinkError> {
        let result = self
            .bounded(
                "subscribe",
                self.config.subscribe_timeout,
                self.link.subscribe_measurements(),
            )
            .await;
        match result {
            Ok(frames) => {
                session.frames = Some(frames);
                Ok(ConnectionState::Streaming)
            }
            Err(error) if error.is_fatal() => Err(error),
            Err(error) => {
                self.warn_throttled("subscribe", &error, "subscribe failed; rescanning");
                self.release_and_pause(session, self.config.scan_retry_delay, shutdown)
                    .await;
                Ok(ConnectionState::Scanning)
            }
        }
    }

    async fn stream_step(
        &self,
        session: &mut SessionState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ConnectionState, LinkError> {
        let Some(mut frames) = session.frames.take() else {
            return Ok(ConnectionState::Recovering);
        };
        let device_name = session
            .device
            .as_ref()
            .map(|d| d.advertised_name.clone())
            .unwrap_or_default();
        tracing::info!(device = %device_name, "streaming measurements");
        self.stream_degraded.store(false, Ordering::Relaxed);
        self.mark_accepted(); // arm the grace period from stream start

        // Battery: one read on entry, then best-effort change notifications.
        match self
            .bounded("battery read", BATTERY_OP_TIMEOUT, self.link.read_battery())
            .await
        {
            Ok(Some(percent)) => {
                if self.core.update_battery(percent) {
                    tracing::debug!(percent, "battery level");
                }
            }
            Ok(None) => {}
            Err(error) => tracing::debug!(%error, "initial battery read failed"),
        }
        let mut battery_events = match self
            .bounded(
                "battery subscribe",
                self.config.subscribe_timeout,
                self.link.subscribe_battery(),
            )
            .await
        {
            Ok(rx) => rx,
            Err(error) => {
                tracing::debug!(%error, "battery notifications unavailable");
                None
            }
        };

        // Supervised helpers: an error in either only logs, never kills the
        // streaming loop.
        let battery_poll = tokio::spawn(battery_poll_task(
            Arc::clone(&self.link),
            Arc::clone(&self.core),
            self.config.battery_poll_interval,
            shutdown.clone(),
        ));
        let health = tokio::spawn(health_monitor_task(
            Arc::clone(&self.link),
            Arc::clone(&self.stream_degraded),
            Arc::clone(&self.last_accepted),
            self.config.health_grace,
            shutdown.clone(),
        ));

        let mut link_check = tokio::time::interval(LINK_CHECK_INTERVAL);
        link_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                frame = frames.recv() => match frame {
                    Some(bytes) => self.handle_frame(&bytes),
                    None => {
                        tracing::info!("measurement stream closed");
                        break;
                    }
                },
                percent = recv_battery(&mut battery_events) => match percent {
                    Some(percent) => {
                        if self.core.update_battery(percent) {
                            tracing::debug!(percent, "battery level changed");
                        }
                    }
                    None => battery_events = None,
                },
                _ = link_check.tick() => {
                    if !self.link.is_connected().await {
                        tracing::warn!("link reports disconnected");
                        break;
                    }
                }
            }
        }

        battery_poll.abort();
        health.abort();
        Ok(ConnectionState::Recovering)
    }

    async fn recover_step(
        &self,
        session: &mut SessionState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ConnectionState, LinkError> {
        *session = SessionState::default();
        self.stream_degraded.store(false, Ordering::Relaxed);
        self.link.disconnect().await;
        self.pause(self.config.recover_delay, shutdown).await;
        Ok(ConnectionState::Scanning)
    }

    /// Decode one notification frame and feed the sinks.
    fn handle_frame(&self, bytes: &[u8]) {
        let frame = decode_measurement(bytes);
        if frame.bpm == 0 && !self.config.allow_zero_bpm {
            tracing::trace!("dropping zero-bpm reading");
            return;
        }
        let reading = self.core.accept_reading(reading_now(
            frame.bpm,
            frame.energy_expended,
            frame.rr_intervals_ms,
        ));
        tracing::trace!(bpm = reading.bpm, rr = reading.rr_intervals_ms.len(), "reading accepted");
        self.mark_accepted();
        self.stream_degraded.store(false, Ordering::Relaxed);
    }

    fn mark_accepted(&self) {
        *self
            .last_accepted
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Wrap a link operation in the manager's own deadline rather than
    /// trusting the transport's internal timeout behavior.
    async fn bounded<T>(
        &self,
        phase: &'static str,
        limit: Duration,
        op: impl Future<Output = Result<T, LinkError>>,
    ) -> Result<T, LinkError> {
        match tokio::time::timeout(limit, op).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout(phase)),
        }
    }

    /// Cancellable delay. Returns immediately once shutdown fires.
    async fn pause(&self, delay: Duration, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }

    /// Drop session state, close the link, and back off before rescanning.
    async fn release_and_pause(
        &self,
        session: &mut SessionState,
        delay: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        *session = SessionState::default();
        self.link.disconnect().await;
        self.pause(delay, shutdown).await;
    }

    fn should_log(&self, key: &'static str) -> bool {
        self.throttle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .should_log(key)
    }

    fn warn_throttled(&self, key: &'static str, error: &LinkError, context: &'static str) {
        if self.should_log(key) {
            tracing::warn!(error = %error, "{}", context);
        }
    }
}

/// Next value from an optional battery channel; pends forever when absent so
/// the select loop simply ignores the arm.
async fn recv_battery(rx: &mut Option<mpsc::Receiver<u8>>) -> Option<u8> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Low-frequency battery poll, a safety net for devices whose battery
/// notifications stay silent.
async fn battery_poll_task(
    link: Arc<dyn SensorLink>,
    core: Arc<Core>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // the streaming entry already read the battery
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                match tokio::time::timeout(BATTERY_OP_TIMEOUT, link.read_battery()).await {
                    Ok(Ok(Some(percent))) => {
                        if core.update_battery(percent) {
                            tracing::debug!(percent, "battery level changed");
                        }
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(error)) => tracing::debug!(%error, "battery poll failed"),
                    Err(_) => tracing::debug!("battery poll timed out"),
                }
            }
        }
    }
}

/// Flags a degraded stream when the link stays up but readings stop for
/// longer than the grace period.
async fn health_monitor_task(
    link: Arc<dyn SensorLink>,
    degraded: Arc<AtomicBool>,
    last_accepted: Arc<Mutex<Option<Instant>>>,
    grace: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = (grace / 4).max(Duration::from_millis(250));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let idle = last_accepted
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .map(|at| at.elapsed());
                if let Some(idle) = idle
                    && idle > grace
                    && link.is_connected().await
                    && !degraded.swap(true, Ordering::Relaxed)
                {
                    tracing::warn!(
                        idle_secs = idle.as_secs(),
                        "stream degraded: link is up but readings stopped"
                    );
                }
            }
        }
    }
}
