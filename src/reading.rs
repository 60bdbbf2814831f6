//! Decoded heart-rate reading.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One decoded heart-rate notification.
///
/// A reading is immutable after creation and shared between the connection
/// manager, the metrics engine, and broadcast subscribers as `Arc<Reading>`.
///
/// Units:
/// - `bpm` in beats per minute
/// - `battery_percent` in percent (0-100)
/// - `energy_expended` in kilojoules, as reported by the device
/// - `rr_intervals_ms` in milliseconds per beat-to-beat interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    /// When the notification was accepted.
    pub timestamp: DateTime<Utc>,
    /// Heart rate in beats per minute.
    pub bpm: u16,
    /// Last known battery level, if the device reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<u8>,
    /// Accumulated energy expended, if present in the frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_expended: Option<u16>,
    /// RR intervals carried by the frame, oldest first. Empty when the device
    /// sent none.
    pub rr_intervals_ms: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_camel_case_keys() {
        let reading = Reading {
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            bpm: 72,
            battery_percent: Some(85),
            energy_expended: None,
            rr_intervals_ms: vec![833, 845],
        };
        let json = serde_json::to_string(&reading).unwrap();
        assert!(json.contains("\"bpm\":72"));
        assert!(json.contains("\"batteryPercent\":85"));
        assert!(json.contains("\"rrIntervalsMs\":[833,845]"));
        assert!(!json.contains("energyExpended"));
    }
}
