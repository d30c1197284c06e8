use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    time::{sleep, Instant},
};
use tracing::{error, info};
use walkingpad::{
    entities::{BeltSwitch, PadSensors, SensorKind, SpeedNumber},
    DeviceMode, DeviceStatus, PadConfig, PadObserver, PadTransport, Result, SessionEvent,
    SessionStarted, SessionSummary, TimingConfig, UpdateCoordinator, WalkingPadDevice,
};

/// In-memory pad that answers status requests through the device's status channel
#[derive(Default)]
struct SimulatedPad {
    state: Mutex<PadModel>,
    sender: Mutex<Option<mpsc::UnboundedSender<DeviceStatus>>>,
}

#[derive(Default)]
struct PadModel {
    mode: Option<DeviceMode>,
    running: bool,
    speed: u16,
    distance: f64,
    time: f64,
    steps: f64,
    last_tick: Option<Instant>,
}

impl PadModel {
    fn advance(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_tick.replace(now) {
            if self.running && self.speed > 0 {
                let seconds = now.duration_since(last).as_secs_f64();
                self.time += seconds;
                self.distance += f64::from(self.speed) * seconds / 36.0;
                self.steps += f64::from(self.speed) * 0.35 * seconds;
            }
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn status(&self) -> DeviceStatus {
        DeviceStatus::new(
            if self.running { self.speed } else { 0 },
            self.distance as u32,
            self.time as u32,
            self.steps as u32,
        )
    }
}

#[async_trait]
impl PadTransport for SimulatedPad {
    async fn connect(&self, address: &str) -> Result<()> {
        info!(address, "Simulated pad connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn switch_mode(&self, mode: DeviceMode) -> Result<()> {
        let mut pad = self.state.lock().await;
        pad.advance();
        pad.mode = Some(mode);
        if mode == DeviceMode::Standby {
            pad.running = false;
            pad.distance = 0.0;
            pad.time = 0.0;
            pad.steps = 0.0;
        }
        Ok(())
    }

    async fn start_belt(&self) -> Result<()> {
        let mut pad = self.state.lock().await;
        pad.advance();
        pad.running = pad.mode == Some(DeviceMode::Manual);
        if pad.speed == 0 {
            pad.speed = 20;
        }
        Ok(())
    }

    async fn stop_belt(&self) -> Result<()> {
        let mut pad = self.state.lock().await;
        pad.advance();
        pad.running = false;
        Ok(())
    }

    async fn change_speed(&self, speed: u16) -> Result<()> {
        let mut pad = self.state.lock().await;
        pad.advance();
        pad.speed = speed;
        Ok(())
    }

    async fn ask_stats(&self) -> Result<()> {
        let status = {
            let mut pad = self.state.lock().await;
            pad.advance();
            pad.status()
        };

        if let Some(sender) = self.sender.lock().await.as_ref() {
            let _ = sender.send(status);
        }
        Ok(())
    }
}

/// Prints what a host would put on its event bus
struct EventLogger {
    address: String,
}

#[async_trait]
impl PadObserver for EventLogger {
    async fn on_session_started(&self, event: &SessionStarted) {
        self.log(SessionEvent::Started(*event));
    }

    async fn on_session_ended(&self, summary: &SessionSummary) {
        self.log(SessionEvent::Ended(*summary));
    }

    async fn on_connectivity_changed(&self, connected: bool) {
        info!("🔗 Connected: {connected}");
    }
}

impl EventLogger {
    fn log(&self, event: SessionEvent) {
        let payload = event.event_payload("simulated-entry", &self.address);
        match serde_json::to_string(&payload) {
            Ok(json) => info!("📣 {} ({}): {json}", event.event_type(), event.trigger_type()),
            Err(e) => error!("❌ Failed to encode payload: {e}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("🏃 WalkingPad Simulated Walk");

    let timing = TimingConfig {
        poll_interval_ms: 1_000,
        ..TimingConfig::default()
    };
    let config = PadConfig::new("Simulated Pad", "57:4C:4E:27:1A:2B (WalkingPad)")?
        .with_timing(timing)
        .validated()?;

    let pad = Arc::new(SimulatedPad::default());
    let device = WalkingPadDevice::new(config, pad.clone());
    *pad.sender.lock().await = Some(device.status_sender());

    let coordinator = UpdateCoordinator::attach(&device).await;
    let sensors = Arc::new(PadSensors::new(device.clone()));
    coordinator.add_observer(sensors.clone()).await;
    coordinator
        .add_observer(Arc::new(EventLogger {
            address: device.address().to_string(),
        }))
        .await;

    let switch = BeltSwitch::new(device.clone());
    let speed = SpeedNumber::new(device.clone());

    device.connect().await?;
    device.start_polling().await;

    info!("▶️  Starting the belt...");
    switch.turn_on().await?;
    speed.set_value(2.0).await?;

    sleep(Duration::from_secs(15)).await;
    info!("📊 Speed: {:.1} mph", speed.value().await);
    for kind in [SensorKind::Distance, SensorKind::Duration, SensorKind::Steps, SensorKind::StepCadence] {
        info!("  {kind}: {:.2}", sensors.value(kind).await);
    }

    info!("⏹️  Stopping the belt...");
    switch.turn_off().await?;
    sleep(Duration::from_secs(8)).await;

    info!("📈 Lifetime totals:");
    for kind in SensorKind::ALL.into_iter().filter(|k| k.is_total()) {
        info!("  {kind}: {:.2}", sensors.value(kind).await);
    }

    device.stop_polling().await;
    coordinator.detach().await;
    device.disconnect().await?;

    info!("✅ Done");
    Ok(())
}
