use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{Duration, SystemTime},
};

use crate::{
    error::{Result, WalkingPadError},
    DOMAIN,
};

/// Operating mode the pad can be switched into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceMode {
    /// Belt is driven by the speed set from the remote or app
    Manual = 1,
    /// Pad is idle and ignores speed changes
    Standby = 2,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "Manual"),
            Self::Standby => write!(f, "Standby"),
        }
    }
}

/// One status sample reported by the pad
///
/// All values are in raw device units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Belt speed in 0.1 km/h
    pub speed: u16,
    /// Distance in 0.01 km
    pub distance: u32,
    /// Seconds elapsed in the current session, reset to 0 on a new session
    pub time: u32,
    /// Steps in the current session
    pub steps: u32,
}

impl DeviceStatus {
    /// Create a new status sample
    #[must_use]
    pub const fn new(speed: u16, distance: u32, time: u32, steps: u32) -> Self {
        Self {
            speed,
            distance,
            time,
            steps,
        }
    }

    /// Speed in km/h
    #[must_use]
    pub fn speed_kmh(&self) -> f64 {
        f64::from(self.speed) / 10.0
    }

    /// Distance in kilometers
    #[must_use]
    pub fn distance_km(&self) -> f64 {
        f64::from(self.distance) / 100.0
    }
}

/// Current derived state of one pad
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    /// Transport session is established
    pub connected: bool,
    /// Belt is moving
    pub moving: bool,
    /// Speed in 0.1 km/h
    pub speed: u16,
    /// Distance in 0.01 km
    pub distance: u32,
    /// Seconds elapsed in the current session
    pub time: u32,
    /// Steps in the current session
    pub steps: u32,
    /// Steps per minute between the last two samples, never negative
    pub step_cadence: f64,
    /// Previous applied sample, used for cadence
    pub last_status: Option<DeviceStatus>,
}

impl SessionState {
    /// Speed in km/h
    #[must_use]
    pub fn speed_kmh(&self) -> f64 {
        f64::from(self.speed) / 10.0
    }

    /// Distance in kilometers
    #[must_use]
    pub fn distance_km(&self) -> f64 {
        f64::from(self.distance) / 100.0
    }
}

/// A walking session has started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStarted {
    /// When the start was detected
    pub start_time: SystemTime,
}

/// Statistics for a session that has just ended
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Start of the session, derived from the end time and duration
    pub start_time: SystemTime,
    /// When the end was detected
    pub end_time: SystemTime,
    /// Length of the session in seconds
    pub duration_seconds: u32,
    /// Steps walked
    pub steps: u32,
    /// Distance walked in kilometers
    pub distance_km: f64,
    /// Mean steps per minute over the session
    pub avg_cadence: f64,
    /// Mean speed over the session in km/h
    pub avg_speed_kmh: f64,
}

/// Timing parameters for the command and update pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long the command lock stays held after each transport call
    pub settle_delay_ms: u64,
    /// How long status samples are discarded after a write command completes
    pub suppression_window_ms: u64,
    /// Minimum spacing between observer notifications
    pub debounce_ms: u64,
    /// Interval of the periodic status poll
    pub poll_interval_ms: u64,
    /// How long to scan when locating the pad
    pub scan_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 750,
            suppression_window_ms: 5_000,
            debounce_ms: 1_000,
            poll_interval_ms: 5_000,
            scan_timeout_ms: 10_000,
        }
    }
}

impl TimingConfig {
    /// Settle delay as a [`Duration`]
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Suppression window as a [`Duration`]
    #[must_use]
    pub const fn suppression_window(&self) -> Duration {
        Duration::from_millis(self.suppression_window_ms)
    }

    /// Debounce interval as a [`Duration`]
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Poll interval as a [`Duration`], never shorter than 1 ms
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        if self.poll_interval_ms == 0 {
            Duration::from_millis(1)
        } else {
            Duration::from_millis(self.poll_interval_ms)
        }
    }

    /// Scan timeout as a [`Duration`]
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}

/// Configuration for one pad, supplied once at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PadConfig {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Bluetooth address in lower-case colon-separated form
    pub address: String,
    /// Timing parameters
    #[serde(default)]
    pub timing: TimingConfig,
}

impl PadConfig {
    /// Build a validated configuration
    ///
    /// An empty name falls back to [`DOMAIN`]. The address may be a plain MAC
    /// or a discovery label such as `"AA:BB:CC:DD:EE:FF (WalkingPad)"`.
    ///
    /// # Errors
    ///
    /// Returns [`WalkingPadError::InvalidAddress`] if the address is not six hex octets.
    pub fn new(name: &str, address: &str) -> Result<Self> {
        let name = name.trim();
        Ok(Self {
            name: if name.is_empty() {
                DOMAIN.to_string()
            } else {
                name.to_string()
            },
            address: format_mac(address)?,
            timing: TimingConfig::default(),
        })
    }

    /// Replace the timing parameters
    #[must_use]
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Re-validate a configuration that was deserialized
    ///
    /// # Errors
    ///
    /// Returns [`WalkingPadError::InvalidAddress`] for a bad address, or
    /// [`WalkingPadError::Config`] if a timing value is zero.
    pub fn validated(self) -> Result<Self> {
        let timing = self.timing;
        if timing.debounce_ms == 0 || timing.poll_interval_ms == 0 {
            return Err(WalkingPadError::Config(
                "debounce and poll interval must be non-zero".to_string(),
            ));
        }
        Ok(Self::new(&self.name, &self.address)?.with_timing(timing))
    }
}

/// Parse a Bluetooth address into its six octets
///
/// Accepts `XX:XX:XX:XX:XX:XX` in any case. Anything after the first 17
/// characters is ignored so discovery labels can be passed straight through.
///
/// # Errors
///
/// Returns [`WalkingPadError::InvalidAddress`] if the address is malformed.
pub fn parse_mac(address: &str) -> Result<[u8; 6]> {
    let trimmed = address.trim();
    let mac = trimmed.get(..17).unwrap_or(trimmed);

    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(WalkingPadError::InvalidAddress(format!(
            "{address}. Expected format: XX:XX:XX:XX:XX:XX"
        )));
    }

    let mut mac_bytes = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return Err(WalkingPadError::InvalidAddress(format!(
                "invalid byte {part:?} in {address}"
            )));
        }
        mac_bytes[i] = u8::from_str_radix(part, 16).map_err(|_| {
            WalkingPadError::InvalidAddress(format!("invalid byte {part:?} in {address}"))
        })?;
    }

    Ok(mac_bytes)
}

/// Normalise a Bluetooth address to lower-case colon-separated form
///
/// # Errors
///
/// Returns [`WalkingPadError::InvalidAddress`] if the address is malformed.
pub fn format_mac(address: &str) -> Result<String> {
    let bytes = parse_mac(address)?;
    Ok(bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversion() {
        let status = DeviceStatus::new(35, 125, 60, 100);
        assert!((status.speed_kmh() - 3.5).abs() < f64::EPSILON);
        assert!((status.distance_km() - 1.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_timing_config_defaults() {
        let config = TimingConfig::default();

        assert_eq!(config.settle_delay(), Duration::from_millis(750));
        assert_eq!(config.suppression_window(), Duration::from_secs(5));
        assert_eq!(config.debounce(), Duration::from_secs(1));
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.scan_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let timing = TimingConfig {
            poll_interval_ms: 0,
            ..TimingConfig::default()
        };
        assert_eq!(timing.poll_interval(), Duration::from_millis(1));

        let config = PadConfig::new("", "57:4C:4E:27:1A:2B")
            .unwrap()
            .with_timing(timing);
        assert_eq!(config.timing.poll_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_mac_address_parsing() {
        let test_cases = vec![
            ("12:34:56:78:9A:BC", [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC]),
            ("00:11:22:33:44:55", [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]),
            ("ff:ee:dd:cc:bb:aa", [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]),
            (
                "57:4C:4E:27:1A:2B (WalkingPad)",
                [0x57, 0x4C, 0x4E, 0x27, 0x1A, 0x2B],
            ),
        ];

        for (mac_str, expected_bytes) in test_cases {
            let result = parse_mac(mac_str);
            assert!(result.is_ok(), "MAC address parsing failed for: {mac_str}");
            assert_eq!(result.unwrap(), expected_bytes);
        }

        let invalid_macs = vec![
            "12:34:56:78:9A",    // Too short
            "12:34:56:78:9A:XY", // Invalid hex
            "12-34-56-78-9A-BC", // Wrong separator
            "",                  // Empty string
            "1:234:56:78:9A:BC", // Misaligned octets
        ];

        for invalid_mac in invalid_macs {
            assert!(
                parse_mac(invalid_mac).is_err(),
                "MAC address parsing should have failed for: {invalid_mac}"
            );
        }
    }

    #[test]
    fn test_pad_config_normalises_address_and_name() {
        let config = PadConfig::new("  ", "57:4C:4E:27:1A:2B (WalkingPad)").unwrap();
        assert_eq!(config.name, DOMAIN);
        assert_eq!(config.address, "57:4c:4e:27:1a:2b");
        assert_eq!(config.timing, TimingConfig::default());

        let named = PadConfig::new("Office Pad", "57:4C:4E:27:1A:2B").unwrap();
        assert_eq!(named.name, "Office Pad");
    }

    #[test]
    fn test_pad_config_from_json() {
        let json = r#"{"name": "Desk", "address": "AA:BB:CC:DD:EE:FF", "timing": {"debounce_ms": 500}}"#;
        let config: PadConfig = serde_json::from_str(json).unwrap();
        let config = config.validated().unwrap();

        assert_eq!(config.address, "aa:bb:cc:dd:ee:ff");
        assert_eq!(config.timing.debounce_ms, 500);
        assert_eq!(config.timing.settle_delay_ms, 750);

        let zero: PadConfig = serde_json::from_str(
            r#"{"address": "AA:BB:CC:DD:EE:FF", "timing": {"poll_interval_ms": 0}}"#,
        )
        .unwrap();
        assert!(matches!(
            zero.validated(),
            Err(WalkingPadError::Config(_))
        ));
    }
}
