use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{
    types::{DeviceStatus, SessionStarted, SessionSummary},
    DOMAIN, EVENT_SESSION_DONE, EVENT_SESSION_START, TRIGGER_SESSION_DONE, TRIGGER_SESSION_START,
};

/// A session boundary
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// The duration counter left zero
    Started(SessionStarted),
    /// The duration counter went backwards
    Ended(SessionSummary),
}

impl SessionEvent {
    /// Name of the event fired on the host's event bus
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Started(_) => EVENT_SESSION_START,
            Self::Ended(_) => EVENT_SESSION_DONE,
        }
    }

    /// Device trigger type automations attach to
    #[must_use]
    pub const fn trigger_type(&self) -> &'static str {
        match self {
            Self::Started(_) => TRIGGER_SESSION_START,
            Self::Ended(_) => TRIGGER_SESSION_DONE,
        }
    }

    /// Build the event-bus payload for the pad at `address`
    #[must_use]
    pub fn event_payload(&self, device_id: &str, address: &str) -> SessionEventPayload {
        let mut payload = SessionEventPayload {
            identifiers: vec![(DOMAIN.to_string(), address.to_string())],
            device_id: device_id.to_string(),
            domain: DOMAIN.to_string(),
            start_time: 0.0,
            end_time: None,
            duration: None,
            steps: None,
            dist: None,
            avg_step_cadence: None,
            avg_speed: None,
        };

        match self {
            Self::Started(started) => {
                payload.start_time = unix_seconds(started.start_time);
            }
            Self::Ended(summary) => {
                payload.start_time = unix_seconds(summary.start_time);
                payload.end_time = Some(unix_seconds(summary.end_time));
                payload.duration = Some(summary.duration_seconds);
                payload.steps = Some(summary.steps);
                payload.dist = Some(summary.distance_km);
                payload.avg_step_cadence = Some(summary.avg_cadence);
                payload.avg_speed = Some(summary.avg_speed_kmh);
            }
        }

        payload
    }
}

/// Event-bus payload for a [`SessionEvent`]
///
/// Times are Unix timestamps in seconds. Fields after `start_time` are only
/// present for ended sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEventPayload {
    /// `(domain, address)` pairs identifying the device
    pub identifiers: Vec<(String, String)>,
    /// Host device id
    pub device_id: String,
    /// Integration domain
    pub domain: String,
    /// Session start
    pub start_time: f64,
    /// Session end
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    /// Duration in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    /// Steps walked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    /// Distance in kilometers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dist: Option<f64>,
    /// Mean steps per minute
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_step_cadence: Option<f64>,
    /// Mean speed in km/h
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_speed: Option<f64>,
}

/// Detects session boundaries from consecutive status samples
///
/// The pad sends no explicit start or end message. A session starts when the
/// duration counter leaves zero and ends when the counter goes backwards.
#[derive(Debug, Clone, Default)]
pub struct SessionTracker {
    last: Option<DeviceStatus>,
}

impl SessionTracker {
    /// Create a tracker with no history
    #[must_use]
    pub const fn new() -> Self {
        Self { last: None }
    }

    /// Feed the next sample, observed at `now`
    ///
    /// The first sample only seeds the tracker.
    pub fn observe(&mut self, status: &DeviceStatus, now: SystemTime) -> Option<SessionEvent> {
        let previous = self.last.replace(*status)?;

        if previous.time > 0 && previous.time > status.time {
            Some(SessionEvent::Ended(summarize(&previous, now)))
        } else if previous.time == 0 && status.time > 0 {
            Some(SessionEvent::Started(SessionStarted { start_time: now }))
        } else {
            None
        }
    }

    /// Last sample seen
    #[must_use]
    pub const fn last_status(&self) -> Option<&DeviceStatus> {
        self.last.as_ref()
    }

    /// Forget the last sample
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Summarize the session whose final sample was `last`, ending at `end_time`
///
/// A zero duration yields zero averages instead of dividing by zero.
#[must_use]
pub fn summarize(last: &DeviceStatus, end_time: SystemTime) -> SessionSummary {
    let duration = last.time;
    let distance_km = last.distance_km();
    let start_time = end_time
        .checked_sub(Duration::from_secs(u64::from(duration)))
        .unwrap_or(end_time);

    let (avg_cadence, avg_speed_kmh) = if duration == 0 {
        (0.0, 0.0)
    } else {
        let seconds = f64::from(duration);
        (
            f64::from(last.steps) * 60.0 / seconds,
            distance_km * 3600.0 / seconds,
        )
    };

    SessionSummary {
        start_time,
        end_time,
        duration_seconds: duration,
        steps: last.steps,
        distance_km,
        avg_cadence,
        avg_speed_kmh,
    }
}

fn unix_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}
