#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # walkingpad
//!
//! Session tracking and command serialization for KingSmith WalkingPad
//! treadmills.
//!
//! The crate sits between a BLE protocol library that talks to the pad and a
//! home-automation host that shows it as a switch, a speed control and a set
//! of sensors. It does not speak the wire protocol itself: the protocol
//! library is plugged in through the [`PadTransport`] trait.
//!
//! ## Data flow
//!
//! Status samples flow from the transport into [`WalkingPadDevice`], which
//! drops stale samples and derives the session state. [`UpdateCoordinator`]
//! debounces accepted samples and detects session boundaries before handing
//! them to [`PadObserver`]s such as [`entities::PadSensors`].
//!
//! Commands flow the other way: an entity calls the device, the device runs
//! one transport call at a time and updates its state optimistically.
//!
//! ## Stale telemetry
//!
//! After accepting a write command the pad keeps reporting its old state for
//! a few seconds. Samples arriving while a write is in flight, or within the
//! suppression window after it, are discarded so the optimistic state is not
//! overwritten.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use walkingpad::{PadConfig, PadTransport, UpdateCoordinator, WalkingPadDevice};
//! use walkingpad::entities::{BeltSwitch, PadSensors, SensorKind, SpeedNumber};
//!
//! async fn run(transport: Arc<dyn PadTransport>) -> walkingpad::Result<()> {
//!     let config = PadConfig::new("Office Pad", "57:4C:4E:27:1A:2B")?;
//!     let device = WalkingPadDevice::new(config, transport);
//!     let coordinator = UpdateCoordinator::attach(&device).await;
//!
//!     let sensors = Arc::new(PadSensors::new(device.clone()));
//!     coordinator.add_observer(sensors.clone()).await;
//!
//!     device.connect().await?;
//!     device.start_polling().await;
//!
//!     BeltSwitch::new(device.clone()).turn_on().await?;
//!     SpeedNumber::new(device.clone()).set_value(2.0).await?;
//!
//!     println!("steps: {}", sensors.value(SensorKind::Steps).await);
//!     Ok(())
//! }
//! ```

/// Bluetooth discovery of pads by address
pub mod ble;
/// Debounced updates and session events for observers
pub mod coordinator;
/// Session controller: command serialization and status filtering
pub mod device;
/// Switch, speed and sensor adapters a host wraps in its own entities
pub mod entities;
/// Error types and handling
pub mod error;
/// Stale-status suppression state machine
pub mod guard;
/// Session boundary detection and host event payloads
pub mod session;
/// Interface to the BLE protocol library
pub mod transport;
/// Type definitions and configuration
pub mod types;

pub use coordinator::{DebounceDecision, Debouncer, PadObserver, UpdateCoordinator};
pub use device::{step_cadence, StatusListener, SubscriptionId, WalkingPadDevice};
pub use error::{Result, WalkingPadError};
pub use guard::CommandGuard;
pub use session::{SessionEvent, SessionEventPayload, SessionTracker};
pub use transport::PadTransport;
pub use types::{
    format_mac, parse_mac, DeviceMode, DeviceStatus, PadConfig, SessionStarted, SessionState,
    SessionSummary, TimingConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Integration domain, also the default pad name
pub const DOMAIN: &str = "king_smith";

/// Event fired when a walking session starts
pub const EVENT_SESSION_START: &str = "king_smith_session_start";

/// Event fired when a walking session ends
pub const EVENT_SESSION_DONE: &str = "king_smith_session_done";

/// Device trigger type for session starts
pub const TRIGGER_SESSION_START: &str = "session_start";

/// Device trigger type for session ends
pub const TRIGGER_SESSION_DONE: &str = "session_done";

/// WalkingPad BLE service UUID
///
/// Advertised by the pad and used to recognise it during scans.
pub const WALKINGPAD_SERVICE_UUID: &str = "0000fe00-0000-1000-8000-00805f9b34fb";
