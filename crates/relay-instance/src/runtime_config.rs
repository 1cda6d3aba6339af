use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_QR_SETTLE_MS: u64 = 2_000;
const DEFAULT_IDLE_SWEEP_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_CHANNEL_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
/// How provisioning waits before capturing the QR artifact.
pub enum QrCaptureMode {
    /// Sleep the full settle interval.
    #[default]
    FixedDelay,
    /// Return as soon as the state leaves `connecting` or a QR arrives, bounded by the settle interval.
    EventDriven,
}

impl QrCaptureMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fixed_delay" | "fixed" => Some(Self::FixedDelay),
            "event_driven" | "event" => Some(Self::EventDriven),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Process-wide knobs for the relay service.
pub struct RelayRuntimeConfig {
    pub qr_settle_interval: Duration,
    pub qr_capture_mode: QrCaptureMode,
    pub idle_timeout: Option<Duration>,
    pub idle_sweep_interval: Duration,
    pub channel_queue_capacity: usize,
}

impl Default for RelayRuntimeConfig {
    fn default() -> Self {
        Self {
            qr_settle_interval: Duration::from_millis(DEFAULT_QR_SETTLE_MS),
            qr_capture_mode: QrCaptureMode::FixedDelay,
            idle_timeout: None,
            idle_sweep_interval: Duration::from_secs(DEFAULT_IDLE_SWEEP_INTERVAL_SECONDS),
            channel_queue_capacity: DEFAULT_CHANNEL_QUEUE_CAPACITY,
        }
    }
}

fn parse_positive_u64(raw: Option<String>) -> Option<u64> {
    raw.and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
}

impl RelayRuntimeConfig {
    /// Build config from `RELAY_*` env vars with safe defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] over an arbitrary key lookup. Unparsable values fall back.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let qr_settle_interval = lookup("RELAY_QR_SETTLE_MS")
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.qr_settle_interval);
        let qr_capture_mode = lookup("RELAY_QR_CAPTURE_MODE")
            .and_then(|raw| QrCaptureMode::parse(&raw))
            .unwrap_or(defaults.qr_capture_mode);
        let idle_timeout =
            parse_positive_u64(lookup("RELAY_IDLE_TIMEOUT_SECONDS")).map(Duration::from_secs);
        let idle_sweep_interval = parse_positive_u64(lookup("RELAY_IDLE_SWEEP_INTERVAL_SECONDS"))
            .map(Duration::from_secs)
            .unwrap_or(defaults.idle_sweep_interval);
        let channel_queue_capacity = parse_positive_u64(lookup("RELAY_CHANNEL_QUEUE_CAPACITY"))
            .and_then(|value| usize::try_from(value).ok())
            .unwrap_or(defaults.channel_queue_capacity);
        Self {
            qr_settle_interval,
            qr_capture_mode,
            idle_timeout,
            idle_sweep_interval,
            channel_queue_capacity,
        }
    }
}
