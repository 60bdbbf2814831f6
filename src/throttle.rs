//! Keyed throttling for repeated log messages, plus duration parsing for CLI
//! options.
//!
//! The connection manager retries transient failures on a tight loop; without
//! throttling, a powered-off adapter would repeat the same warning several
//! times per second. The throttle limits each message key to one emission per
//! interval without affecting retry timing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Limits identical log messages to at most one per interval, tracked per key.
///
/// The first occurrence of a key is always allowed; a blocked occurrence does
/// not reset the key's timer.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last_emitted: HashMap<&'static str, Instant>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        LogThrottle {
            interval,
            last_emitted: HashMap::new(),
        }
    }

    /// Whether a message for `key` may be emitted now. Returns `true` and
    /// resets the key's timer when the interval has passed (or the key is new).
    pub fn should_log(&mut self, key: &'static str) -> bool {
        let now = Instant::now();
        match self.last_emitted.get(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                self.last_emitted.insert(key, now);
                true
            }
        }
    }
}

/// Parse a human-readable duration such as `20s`, `2m`, `500ms` or `1h`.
/// A bare number is interpreted as seconds.
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    let split = src
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(src.len());
    let (digits, suffix) = src.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {src}"))?;
    match suffix.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration suffix: {other}")),
    }
}
