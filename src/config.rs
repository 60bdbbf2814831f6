//! Command-line options.

use std::time::Duration;

use clap::Parser;

use crate::manager::ManagerConfig;
use crate::metrics::{MIN_WINDOW_SECS, MetricsConfig};
use crate::throttle::parse_duration;

/// Bridge a Bluetooth LE heart-rate sensor into rolling analytics and a live
/// broadcast feed.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Options {
    /// Substring the device's advertised name must contain, matched
    /// case-insensitively. Empty matches any named heart-rate device.
    #[arg(long, default_value = "")]
    pub device_name: String,

    /// Keep readings whose heart rate is zero instead of dropping them as
    /// contact-loss artifacts.
    #[arg(long)]
    pub allow_zero_bpm: bool,

    /// Default analysis window in seconds for computed statistics.
    #[arg(long, default_value_t = 60)]
    pub window: u64,

    /// Largest analysis window in seconds the retention buffers must serve.
    #[arg(long, default_value_t = 300)]
    pub max_window: u64,

    /// Extra seconds of samples retained beyond the largest window.
    #[arg(long, default_value_t = 30)]
    pub retention_margin: u64,

    /// Battery poll period, e.g. `60s` or `2m`.
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    pub battery_poll: Duration,

    /// How long the stream may stay silent on a live link before it is
    /// flagged degraded, e.g. `20s`.
    #[arg(long, default_value = "20s", value_parser = parse_duration)]
    pub health_grace: Duration,

    /// Increase log verbosity.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Options {
    /// Requested default window clamped to the supported floor.
    pub fn effective_window(&self) -> u64 {
        self.window.max(MIN_WINDOW_SECS)
    }

    pub fn metrics_config(&self) -> MetricsConfig {
        MetricsConfig {
            max_window_secs: self.max_window.max(self.effective_window()),
            retention_margin_secs: self.retention_margin,
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            device_name_token: self.device_name.clone(),
            allow_zero_bpm: self.allow_zero_bpm,
            battery_poll_interval: self.battery_poll,
            health_grace: self.health_grace,
            ..ManagerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        Options::try_parse_from(std::iter::once("pulselink").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let options = parse(&[]);
        assert_eq!(options.device_name, "");
        assert!(!options.allow_zero_bpm);
        assert_eq!(options.window, 60);
        assert_eq!(options.max_window, 300);
        assert_eq!(options.battery_poll, Duration::from_secs(60));
        assert_eq!(options.health_grace, Duration::from_secs(20));
    }

    #[test]
    fn duration_options_accept_suffixes() {
        let options = parse(&["--battery-poll", "2m", "--health-grace", "500ms"]);
        assert_eq!(options.battery_poll, Duration::from_secs(120));
        assert_eq!(options.health_grace, Duration::from_millis(500));
    }

    #[test]
    fn invalid_duration_is_rejected() {
        let result =
            Options::try_parse_from(["pulselink", "--battery-poll", "soon"]);
        assert!(result.is_err());
    }

    #[test]
    fn tiny_window_is_clamped_to_floor() {
        let options = parse(&["--window", "3"]);
        assert_eq!(options.effective_window(), MIN_WINDOW_SECS);
    }

    #[test]
    fn max_window_never_smaller_than_default_window() {
        let options = parse(&["--window", "600", "--max-window", "300"]);
        assert_eq!(options.metrics_config().max_window_secs, 600);
    }

    #[test]
    fn manager_config_carries_cli_choices() {
        let options = parse(&["--device-name", "XOSS", "--allow-zero-bpm"]);
        let config = options.manager_config();
        assert_eq!(config.device_name_token, "XOSS");
        assert!(config.allow_zero_bpm);
    }
}
