//! `pulselink` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup,
//! and process exit codes. The pipeline lives in the modules below, where the
//! whole connection lifecycle can be tested deterministically with an
//! injected sensor link.

pub mod config;
pub mod core;
pub mod decoder;
pub mod hub;
pub mod link;
pub mod manager;
pub mod metrics;
pub mod reading;
pub mod throttle;

// Re-export commonly used types at the crate root
pub use self::core::{Core, reading_now};
pub use config::Options;
pub use decoder::{DecodedFrame, decode_battery_level, decode_measurement, rr_1024_to_ms};
pub use hub::{BroadcastHub, Event, Subscriber};
pub use link::{DeviceInfo, LinkError, SensorLink, ServiceSet};
pub use manager::{ConnectionManager, ConnectionState, ManagerConfig, select_device};
pub use metrics::{HrvSummary, MetricsConfig, MetricsEngine, StatsSnapshot, ZoneSeconds};
pub use reading::Reading;
pub use throttle::{LogThrottle, parse_duration};
