use async_trait::async_trait;

use crate::{error::Result, types::DeviceMode};

/// Link to the physical pad
///
/// Implemented by the BLE protocol library that actually speaks to the
/// device. Status samples are delivered out of band through
/// [`crate::WalkingPadDevice::status_sender`] or
/// [`crate::WalkingPadDevice::handle_status`]. Call timeouts are the
/// implementation's responsibility.
#[async_trait]
pub trait PadTransport: Send + Sync {
    /// Open a session to the pad at `address`
    async fn connect(&self, address: &str) -> Result<()>;

    /// Close the session
    async fn disconnect(&self) -> Result<()>;

    /// Switch the operating mode
    async fn switch_mode(&self, mode: DeviceMode) -> Result<()>;

    /// Start the belt motor
    async fn start_belt(&self) -> Result<()>;

    /// Stop the belt motor
    async fn stop_belt(&self) -> Result<()>;

    /// Set the target speed in 0.1 km/h
    async fn change_speed(&self, speed: u16) -> Result<()>;

    /// Ask the pad to report a status sample
    async fn ask_stats(&self) -> Result<()>;
}
