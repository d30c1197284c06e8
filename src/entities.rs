use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    coordinator::PadObserver,
    device::WalkingPadDevice,
    error::{Result, WalkingPadError},
    types::{DeviceStatus, SessionState},
};

/// km/h to mph
pub const KPH_TO_MPH: f64 = 0.621_371;

/// Belt power switch
///
/// On means the belt is moving.
#[derive(Debug, Clone)]
pub struct BeltSwitch {
    device: WalkingPadDevice,
}

impl BeltSwitch {
    /// Wrap `device`
    #[must_use]
    pub const fn new(device: WalkingPadDevice) -> Self {
        Self { device }
    }

    /// `{mac}_switch`
    #[must_use]
    pub fn unique_id(&self) -> String {
        format!("{}_switch", self.device.address())
    }

    /// Whether the entity should be shown as available
    pub async fn available(&self) -> bool {
        self.device.is_connected().await
    }

    /// Whether the belt is moving
    pub async fn is_on(&self) -> bool {
        self.device.is_moving().await
    }

    /// Switch to manual mode and start the belt
    ///
    /// # Errors
    ///
    /// Returns [`WalkingPadError::Command`] if either command is rejected.
    pub async fn turn_on(&self) -> Result<()> {
        self.device.turn_on().await?;
        self.device.start_belt().await
    }

    /// Stop the belt if it is moving, then switch to standby
    ///
    /// # Errors
    ///
    /// Returns [`WalkingPadError::Command`] if either command is rejected.
    pub async fn turn_off(&self) -> Result<()> {
        if self.device.is_moving().await {
            self.device.stop_belt().await?;
        }
        self.device.turn_off().await
    }
}

/// Target speed control in mph
#[derive(Debug, Clone)]
pub struct SpeedNumber {
    device: WalkingPadDevice,
}

impl SpeedNumber {
    /// Lowest settable speed in mph
    pub const MIN_VALUE: f64 = 0.0;
    /// Highest settable speed in mph
    pub const MAX_VALUE: f64 = 4.0;
    /// Increment in mph
    pub const STEP: f64 = 0.1;

    /// Wrap `device`
    #[must_use]
    pub const fn new(device: WalkingPadDevice) -> Self {
        Self { device }
    }

    /// `{mac}_speed_control`
    #[must_use]
    pub fn unique_id(&self) -> String {
        format!("{}_speed_control", self.device.address())
    }

    /// Display name, derived from the pad name
    #[must_use]
    pub fn name(&self) -> String {
        format!("{} Speed", self.device.name())
    }

    /// Whether the entity should be shown as available
    pub async fn available(&self) -> bool {
        self.device.is_connected().await
    }

    /// Current speed in mph
    pub async fn value(&self) -> f64 {
        raw_to_mph(self.device.state().await.speed)
    }

    /// Set the target speed in mph
    ///
    /// # Errors
    ///
    /// Returns [`WalkingPadError::InvalidParameters`] if `mph` is outside
    /// [`Self::MIN_VALUE`]..=[`Self::MAX_VALUE`], or
    /// [`WalkingPadError::Command`] if the pad rejects the change.
    pub async fn set_value(&self, mph: f64) -> Result<()> {
        if !(Self::MIN_VALUE..=Self::MAX_VALUE).contains(&mph) {
            return Err(WalkingPadError::InvalidParameters(format!(
                "speed {mph} mph outside {}..={}",
                Self::MIN_VALUE,
                Self::MAX_VALUE
            )));
        }

        let raw = mph_to_raw(mph);
        debug!(address = %self.device.address(), mph, raw, "Setting speed");
        self.device.change_speed(raw).await
    }
}

/// Convert raw device speed (0.1 km/h) to mph, rounded to 0.1
#[must_use]
pub fn raw_to_mph(raw: u16) -> f64 {
    if raw == 0 {
        return 0.0;
    }
    (f64::from(raw) * KPH_TO_MPH).round() / 10.0
}

/// Convert mph to raw device speed (0.1 km/h)
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn mph_to_raw(mph: f64) -> u16 {
    if mph <= 0.0 {
        return 0;
    }
    (mph * 10.0 / KPH_TO_MPH).round().min(f64::from(u16::MAX)) as u16
}

/// Sensors published for one pad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    /// Session distance in km
    Distance,
    /// Session duration in seconds
    Duration,
    /// Current speed in km/h
    Speed,
    /// Session steps
    Steps,
    /// Steps per minute
    StepCadence,
    /// Lifetime distance in km
    TotalDistance,
    /// Lifetime walking time in seconds
    TotalTime,
    /// Lifetime steps
    TotalSteps,
}

impl SensorKind {
    /// Every sensor, in registration order
    pub const ALL: [Self; 8] = [
        Self::Distance,
        Self::Duration,
        Self::Speed,
        Self::Steps,
        Self::TotalDistance,
        Self::TotalTime,
        Self::TotalSteps,
        Self::StepCadence,
    ];

    /// Suffix appended to the address to form the unique id
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Distance => "distance",
            Self::Duration => "time",
            Self::Speed => "speed",
            Self::Steps => "steps",
            Self::StepCadence => "step_cadence",
            Self::TotalDistance => "total_distance",
            Self::TotalTime => "total_time",
            Self::TotalSteps => "total_steps",
        }
    }

    /// Display name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Distance => "Distance",
            Self::Duration => "Duration",
            Self::Speed => "Speed",
            Self::Steps => "Steps",
            Self::StepCadence => "Step Cadence",
            Self::TotalDistance => "Total Distance",
            Self::TotalTime => "Total Time",
            Self::TotalSteps => "Total Steps",
        }
    }

    /// Unit of measurement, if any
    #[must_use]
    pub const fn unit(self) -> Option<&'static str> {
        match self {
            Self::Distance | Self::TotalDistance => Some("km"),
            Self::Duration | Self::TotalTime => Some("s"),
            Self::Speed => Some("km/h"),
            Self::Steps | Self::StepCadence | Self::TotalSteps => None,
        }
    }

    /// Whether the value survives session resets and should be persisted
    #[must_use]
    pub const fn is_total(self) -> bool {
        matches!(
            self,
            Self::TotalDistance | Self::TotalTime | Self::TotalSteps
        )
    }

    /// `{mac}_{suffix}`
    #[must_use]
    pub fn unique_id(self, address: &str) -> String {
        format!("{address}_{}", self.suffix())
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Running total of a per-session counter
///
/// The pad resets its counters at the start of every session. A reading
/// lower than the previous one is taken as a new session and added whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TotalAccumulator {
    total: f64,
    last: f64,
}

impl TotalAccumulator {
    /// Start from zero
    #[must_use]
    pub const fn new() -> Self {
        Self {
            total: 0.0,
            last: 0.0,
        }
    }

    /// Continue from a previously persisted total
    #[must_use]
    pub const fn restored(total: f64) -> Self {
        Self { total, last: 0.0 }
    }

    /// Feed the next reading and return the new total
    pub fn update(&mut self, reading: f64) -> f64 {
        if reading >= self.last {
            self.total += reading - self.last;
        } else {
            self.total += reading;
        }
        self.last = reading;
        self.total
    }

    /// Current total
    #[must_use]
    pub const fn total(&self) -> f64 {
        self.total
    }
}

#[derive(Debug, Default)]
struct SensorReadings {
    session: SessionState,
    total_distance: TotalAccumulator,
    total_time: TotalAccumulator,
    total_steps: TotalAccumulator,
}

/// Sensor values for one pad, refreshed from debounced coordinator updates
///
/// Register with [`crate::UpdateCoordinator::add_observer`].
pub struct PadSensors {
    device: WalkingPadDevice,
    readings: RwLock<SensorReadings>,
}

impl PadSensors {
    /// Sensors for `device`, with all totals at zero
    #[must_use]
    pub fn new(device: WalkingPadDevice) -> Self {
        Self {
            device,
            readings: RwLock::new(SensorReadings::default()),
        }
    }

    /// Continue the lifetime totals from persisted values
    pub async fn restore_totals(&self, distance_km: f64, time_seconds: f64, steps: f64) {
        let mut readings = self.readings.write().await;
        readings.total_distance = TotalAccumulator::restored(distance_km);
        readings.total_time = TotalAccumulator::restored(time_seconds);
        readings.total_steps = TotalAccumulator::restored(steps);
    }

    /// Unique id of `kind` for this pad
    #[must_use]
    pub fn unique_id(&self, kind: SensorKind) -> String {
        kind.unique_id(self.device.address())
    }

    /// Whether the sensors should be shown as available
    pub async fn available(&self) -> bool {
        self.device.is_connected().await
    }

    /// Current value of `kind`
    pub async fn value(&self, kind: SensorKind) -> f64 {
        let readings = self.readings.read().await;
        let session = &readings.session;

        match kind {
            SensorKind::Distance => session.distance_km(),
            SensorKind::Duration => f64::from(session.time),
            SensorKind::Speed => session.speed_kmh(),
            SensorKind::Steps => f64::from(session.steps),
            SensorKind::StepCadence => session.step_cadence,
            SensorKind::TotalDistance => readings.total_distance.total(),
            SensorKind::TotalTime => readings.total_time.total(),
            SensorKind::TotalSteps => readings.total_steps.total(),
        }
    }
}

#[async_trait]
impl PadObserver for PadSensors {
    async fn on_status_applied(&self, status: &DeviceStatus) {
        let session = self.device.state().await;
        let mut readings = self.readings.write().await;

        readings.total_distance.update(status.distance_km());
        readings.total_time.update(f64::from(status.time));
        readings.total_steps.update(f64::from(status.steps));
        readings.session = session;
    }
}
