use crate::{
    error::{Result, WalkingPadError},
    guard::CommandGuard,
    transport::PadTransport,
    types::{DeviceMode, DeviceStatus, PadConfig, SessionState},
};
use async_trait::async_trait;
use std::{
    fmt,
    future::Future,
    sync::{Arc, Weak},
};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

/// Receives every status sample the device accepts
///
/// Listeners are invoked in subscription order. Suppressed samples never
/// reach them.
#[async_trait]
pub trait StatusListener: Send + Sync {
    /// A fresh sample was applied to the session state
    async fn on_status(&self, status: &DeviceStatus);

    /// The link was dropped after a transport failure
    async fn on_disconnected(&self) {}
}

/// Handle returned when registering a listener or observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered set of callback handles with explicit removal
pub(crate) struct Registry<L: ?Sized> {
    next_id: u64,
    entries: Vec<(SubscriptionId, Arc<L>)>,
}

impl<L: ?Sized> Default for Registry<L> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

impl<L: ?Sized> Registry<L> {
    pub(crate) fn insert(&mut self, entry: Arc<L>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, entry));
        id
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Entries in registration order, detached from the lock
    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries
            .iter()
            .map(|(_, entry)| Arc::clone(entry))
            .collect()
    }
}

/// A command issued to the pad
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Connect,
    Disconnect,
    SwitchMode(DeviceMode),
    StartBelt,
    StopBelt,
    ChangeSpeed(u16),
    AskStats,
}

impl Command {
    const fn name(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::SwitchMode(_) => "switch_mode",
            Self::StartBelt => "start_belt",
            Self::StopBelt => "stop_belt",
            Self::ChangeSpeed(_) => "change_speed",
            Self::AskStats => "ask_stats",
        }
    }

    /// Reads do not make the pad report stale data
    const fn is_write(self) -> bool {
        !matches!(self, Self::AskStats)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SwitchMode(mode) => write!(f, "switch_mode({mode})"),
            Self::ChangeSpeed(speed) => write!(f, "change_speed({speed})"),
            other => write!(f, "{}", other.name()),
        }
    }
}

struct DeviceInner {
    config: PadConfig,
    transport: Arc<dyn PadTransport>,
    command_lock: Mutex<()>,
    guard: Mutex<CommandGuard>,
    state: RwLock<SessionState>,
    listeners: Mutex<Registry<dyn StatusListener>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

/// Session controller for one WalkingPad
///
/// `WalkingPadDevice` owns the command channel to the pad and the single
/// authoritative [`SessionState`]. It guarantees that:
///
/// - only one transport call runs at a time, and each call keeps the command
///   lock for a settle delay after it returns
/// - status samples arriving while a write is in flight, or within the
///   suppression window after it, are discarded
/// - accepted samples update the derived state (moving, cadence) and are
///   fanned out to [`StatusListener`]s in subscription order
///
/// The handle is cheap to clone; clones share the same device.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use walkingpad::{PadConfig, PadTransport, WalkingPadDevice};
///
/// async fn walk(transport: Arc<dyn PadTransport>) -> walkingpad::Result<()> {
///     let config = PadConfig::new("Office Pad", "57:4C:4E:27:1A:2B")?;
///     let device = WalkingPadDevice::new(config, transport);
///
///     device.connect().await?;
///     device.turn_on().await?;
///     device.start_belt().await?;
///     device.change_speed(30).await?;
///
///     device.start_polling().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct WalkingPadDevice {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for WalkingPadDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalkingPadDevice")
            .field("name", &self.inner.config.name)
            .field("address", &self.inner.config.address)
            .finish_non_exhaustive()
    }
}

impl WalkingPadDevice {
    /// Bind a controller to the pad described by `config`
    #[must_use]
    pub fn new(config: PadConfig, transport: Arc<dyn PadTransport>) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                config,
                transport,
                command_lock: Mutex::new(()),
                guard: Mutex::new(CommandGuard::default()),
                state: RwLock::new(SessionState::default()),
                listeners: Mutex::new(Registry::default()),
                poll_task: Mutex::new(None),
            }),
        }
    }

    /// Configuration the device was built with
    #[must_use]
    pub fn config(&self) -> &PadConfig {
        &self.inner.config
    }

    /// Bluetooth address
    #[must_use]
    pub fn address(&self) -> &str {
        &self.inner.config.address
    }

    /// Display name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Snapshot of the current session state
    pub async fn state(&self) -> SessionState {
        self.inner.state.read().await.clone()
    }

    /// Whether the transport session is established
    pub async fn is_connected(&self) -> bool {
        self.inner.state.read().await.connected
    }

    /// Whether the belt is moving
    pub async fn is_moving(&self) -> bool {
        self.inner.state.read().await.moving
    }

    /// Whether a write command is currently executing
    pub async fn is_command_in_flight(&self) -> bool {
        self.inner.guard.lock().await.is_command_in_flight()
    }

    /// Establish the transport session
    ///
    /// # Errors
    ///
    /// Returns [`WalkingPadError::ConnectionFailed`] if the transport cannot
    /// connect. The device stays disconnected.
    pub async fn connect(&self) -> Result<()> {
        info!(address = %self.address(), name = %self.name(), "Connecting to WalkingPad");

        let result = self
            .execute(
                Command::Connect,
                self.inner.transport.connect(&self.inner.config.address),
                |state| state.connected = true,
            )
            .await;

        match result {
            Ok(()) => {
                info!(address = %self.address(), "Connected");
                Ok(())
            }
            Err(e) => {
                warn!(address = %self.address(), error = %e, "Failed to connect");
                self.inner.state.write().await.connected = false;
                Err(into_connection_error(e))
            }
        }
    }

    /// Tear down the transport session
    ///
    /// The device is marked disconnected and listeners are told even if the
    /// transport reports an error.
    ///
    /// # Errors
    ///
    /// Returns [`WalkingPadError::ConnectionFailed`] if the transport fails to
    /// disconnect cleanly.
    pub async fn disconnect(&self) -> Result<()> {
        info!(address = %self.address(), "Disconnecting from WalkingPad");

        let result = self
            .execute(
                Command::Disconnect,
                self.inner.transport.disconnect(),
                |_| {},
            )
            .await;
        self.inner.state.write().await.connected = false;
        self.notify_disconnected().await;

        result.map_err(|e| {
            warn!(address = %self.address(), error = %e, "Disconnect reported an error");
            into_connection_error(e)
        })
    }

    /// Switch the pad into manual mode
    ///
    /// Does nothing while disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`WalkingPadError::Command`] if the transport rejects the command.
    pub async fn turn_on(&self) -> Result<()> {
        self.write_command(
            Command::SwitchMode(DeviceMode::Manual),
            self.inner.transport.switch_mode(DeviceMode::Manual),
            |_| {},
        )
        .await
    }

    /// Switch the pad into standby mode
    ///
    /// Does nothing while disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`WalkingPadError::Command`] if the transport rejects the command.
    pub async fn turn_off(&self) -> Result<()> {
        self.write_command(
            Command::SwitchMode(DeviceMode::Standby),
            self.inner.transport.switch_mode(DeviceMode::Standby),
            |_| {},
        )
        .await
    }

    /// Start the belt
    ///
    /// `moving` is set as soon as the pad accepts the command, without waiting
    /// for a status sample to confirm it. Does nothing while disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`WalkingPadError::Command`] if the transport rejects the command.
    pub async fn start_belt(&self) -> Result<()> {
        self.write_command(
            Command::StartBelt,
            self.inner.transport.start_belt(),
            |state| state.moving = true,
        )
        .await
    }

    /// Stop the belt
    ///
    /// `moving` is cleared as soon as the pad accepts the command. Does nothing
    /// while disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`WalkingPadError::Command`] if the transport rejects the command.
    pub async fn stop_belt(&self) -> Result<()> {
        self.write_command(
            Command::StopBelt,
            self.inner.transport.stop_belt(),
            |state| state.moving = false,
        )
        .await
    }

    /// Set the target speed in raw device units (0.1 km/h)
    ///
    /// The value is not range checked here. Does nothing while disconnected.
    ///
    /// # Errors
    ///
    /// Returns [`WalkingPadError::Command`] if the transport rejects the command.
    pub async fn change_speed(&self, speed: u16) -> Result<()> {
        self.write_command(
            Command::ChangeSpeed(speed),
            self.inner.transport.change_speed(speed),
            move |state| state.speed = speed,
        )
        .await
    }

    /// Ask the pad for a status sample
    ///
    /// While disconnected this attempts to reconnect instead and returns
    /// without asking for stats. A failed request drops the link so the next
    /// call reconnects. Never fails: it is meant to be driven by a poll loop.
    pub async fn request_status(&self) {
        if !self.is_connected().await {
            debug!(address = %self.address(), "Not connected, reconnecting instead of polling");
            if let Err(e) = self.connect().await {
                warn!(address = %self.address(), error = %e, "Reconnect failed");
            }
            return;
        }

        if let Err(e) = self
            .execute(
                Command::AskStats,
                self.inner.transport.ask_stats(),
                |_| {},
            )
            .await
        {
            error!(address = %self.address(), error = %e, "Status request failed, dropping connection");
            self.force_disconnect().await;
        }
    }

    /// Apply a status sample reported by the pad
    ///
    /// Returns `false` if the sample was discarded because a write command is
    /// in flight or just completed.
    pub async fn handle_status(&self, status: DeviceStatus) -> bool {
        {
            let now = Instant::now();
            let mut guard = self.inner.guard.lock().await;
            if guard.suppresses(now) {
                debug!(address = %self.address(), ?status, "Discarding stale status");
                return false;
            }

            let mut state = self.inner.state.write().await;
            let cadence = step_cadence(state.last_status.as_ref(), &status);

            state.moving = status.speed > 0;
            state.speed = status.speed;
            state.distance = status.distance;
            state.time = status.time;
            state.steps = status.steps;
            state.step_cadence = cadence;
            state.last_status = Some(status);
        }

        let listeners = self.inner.listeners.lock().await.snapshot();
        for listener in listeners {
            listener.on_status(&status).await;
        }

        true
    }

    /// Channel the transport can push status samples into
    ///
    /// Samples are applied one at a time, in order, by a background task that
    /// ends when every sender is dropped or the device itself is dropped.
    #[must_use]
    pub fn status_sender(&self) -> mpsc::UnboundedSender<DeviceStatus> {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let inner = Arc::downgrade(&self.inner);
        let address = self.address().to_string();

        tokio::spawn(async move {
            while let Some(status) = receiver.recv().await {
                let Some(device) = upgrade(&inner) else {
                    break;
                };
                device.handle_status(status).await;
            }
            debug!(address = %address, "Status pump stopped");
        });

        sender
    }

    /// Register a listener for accepted status samples
    pub async fn subscribe(&self, listener: Arc<dyn StatusListener>) -> SubscriptionId {
        self.inner.listeners.lock().await.insert(listener)
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.listeners.lock().await.remove(id)
    }

    /// Start calling [`Self::request_status`] every poll interval
    ///
    /// Calling this again while polling is active has no effect.
    pub async fn start_polling(&self) {
        let mut task = self.inner.poll_task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let interval = self.inner.config.timing.poll_interval();
        let inner = Arc::downgrade(&self.inner);

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(device) = upgrade(&inner) else {
                    break;
                };
                device.request_status().await;
            }
        }));

        info!(address = %self.address(), ?interval, "Status polling started");
    }

    /// Stop the periodic status poll
    pub async fn stop_polling(&self) {
        if let Some(task) = self.inner.poll_task.lock().await.take() {
            task.abort();
            info!(address = %self.address(), "Status polling stopped");
        }
    }

    /// Whether the periodic status poll is running
    pub async fn is_polling(&self) -> bool {
        self.inner
            .poll_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    async fn write_command<F>(
        &self,
        command: Command,
        call: F,
        on_success: impl FnOnce(&mut SessionState) + Send,
    ) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send,
    {
        if !self.is_connected().await {
            debug!(address = %self.address(), %command, "Not connected, ignoring command");
            return Ok(());
        }

        self.execute(command, call, on_success).await.map_err(|e| {
            warn!(address = %self.address(), %command, error = %e, "Command failed");
            e.for_command(command.name())
        })
    }

    /// Run one transport call under the command lock
    ///
    /// The lock is held for the settle delay after the call returns, whether or
    /// not it succeeded. Write commands mark the guard in flight for the whole
    /// time and arm the suppression window when they finish.
    async fn execute<F>(
        &self,
        command: Command,
        call: F,
        on_success: impl FnOnce(&mut SessionState) + Send,
    ) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send,
    {
        let timing = &self.inner.config.timing;
        let _permit = self.inner.command_lock.lock().await;

        if command.is_write() {
            self.inner.guard.lock().await.begin_command();
        }
        debug!(address = %self.address(), %command, "Sending command");

        let result = call.await;
        if result.is_ok() {
            on_success(&mut *self.inner.state.write().await);
        }

        tokio::time::sleep(timing.settle_delay()).await;

        if command.is_write() {
            self.inner
                .guard
                .lock()
                .await
                .finish_command(Instant::now(), timing.suppression_window());
        }
        debug!(address = %self.address(), %command, ok = result.is_ok(), "Command settled");

        result
    }

    async fn force_disconnect(&self) {
        self.inner.state.write().await.connected = false;

        if let Err(e) = self
            .execute(
                Command::Disconnect,
                self.inner.transport.disconnect(),
                |_| {},
            )
            .await
        {
            debug!(address = %self.address(), error = %e, "Forced disconnect reported an error");
        }

        self.notify_disconnected().await;
    }

    async fn notify_disconnected(&self) {
        let listeners = self.inner.listeners.lock().await.snapshot();
        for listener in listeners {
            listener.on_disconnected().await;
        }
    }
}

fn upgrade(inner: &Weak<DeviceInner>) -> Option<WalkingPadDevice> {
    inner.upgrade().map(|inner| WalkingPadDevice { inner })
}

fn into_connection_error(error: WalkingPadError) -> WalkingPadError {
    match error {
        WalkingPadError::ConnectionFailed(_) => error,
        other => WalkingPadError::ConnectionFailed(other.to_string()),
    }
}

/// Steps per minute between two consecutive samples
///
/// Zero unless the belt was moving in both samples and the session clock
/// advanced between them. A clock that went backwards (a new session) also
/// yields zero. Never negative.
#[must_use]
pub fn step_cadence(previous: Option<&DeviceStatus>, current: &DeviceStatus) -> f64 {
    let Some(previous) = previous else {
        return 0.0;
    };

    if current.speed == 0 || previous.speed == 0 || current.time <= previous.time {
        return 0.0;
    }

    let minutes = f64::from(current.time - previous.time) / 60.0;
    let steps = f64::from(current.steps) - f64::from(previous.steps);

    (steps / minutes).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::time::sleep;
    use tokio_test::{assert_err, assert_ok};

    struct RecordingListener {
        label: &'static str,
        log: Arc<std::sync::Mutex<Vec<String>>>,
        statuses: std::sync::Mutex<Vec<DeviceStatus>>,
        disconnects: AtomicUsize,
    }

    impl RecordingListener {
        fn new(label: &'static str, log: Arc<std::sync::Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                label,
                log,
                statuses: std::sync::Mutex::new(Vec::new()),
                disconnects: AtomicUsize::new(0),
            })
        }

        fn statuses(&self) -> Vec<DeviceStatus> {
            self.statuses.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatusListener for RecordingListener {
        async fn on_status(&self, status: &DeviceStatus) {
            self.log.lock().unwrap().push(self.label.to_string());
            self.statuses.lock().unwrap().push(*status);
        }

        async fn on_disconnected(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup() -> (WalkingPadDevice, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let config = PadConfig::new("Test Pad", "57:4C:4E:27:1A:2B").unwrap();
        let device = WalkingPadDevice::new(config, transport.clone());
        (device, transport)
    }

    async fn connected_and_settled() -> (WalkingPadDevice, Arc<MockTransport>) {
        let (device, transport) = setup();
        device.connect().await.unwrap();
        sleep(Duration::from_secs(5)).await;
        (device, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_marks_connected() {
        let (device, transport) = setup();
        assert!(!device.is_connected().await);

        device.connect().await.unwrap();

        assert!(device.is_connected().await);
        assert_eq!(transport.ops(), vec!["connect 57:4c:4e:27:1a:2b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_connection_error() {
        let (device, transport) = setup();
        transport.fail("connect");

        let result = device.connect().await;

        assert!(matches!(result, Err(WalkingPadError::ConnectionFailed(_))));
        assert!(!device.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_clears_connected_even_on_error() {
        let (device, transport) = setup();
        device.connect().await.unwrap();
        transport.fail("disconnect");

        let result = device.disconnect().await;

        assert!(matches!(result, Err(WalkingPadError::ConnectionFailed(_))));
        assert!(!device.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_notifies_listeners() {
        let (device, transport) = connected_and_settled().await;
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let listener = RecordingListener::new("a", log);
        device.subscribe(listener.clone()).await;

        assert_ok!(device.disconnect().await);
        assert_eq!(listener.disconnects.load(Ordering::SeqCst), 1);

        transport.fail("disconnect");
        assert_err!(device.disconnect().await);
        assert_eq!(listener.disconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_are_noops_while_disconnected() {
        let (device, transport) = setup();

        assert_ok!(device.change_speed(30).await);
        assert_ok!(device.start_belt().await);
        assert_ok!(device.stop_belt().await);
        assert_ok!(device.turn_on().await);
        assert_ok!(device.turn_off().await);

        assert!(transport.calls().is_empty());
        let state = device.state().await;
        assert!(!state.moving);
        assert_eq!(state.speed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_updates() {
        let (device, transport) = connected_and_settled().await;

        device.turn_on().await.unwrap();
        device.start_belt().await.unwrap();
        assert!(device.is_moving().await);

        device.change_speed(35).await.unwrap();
        assert_eq!(device.state().await.speed, 35);

        device.stop_belt().await.unwrap();
        assert!(!device.is_moving().await);

        assert_eq!(
            transport.ops(),
            vec![
                "connect 57:4c:4e:27:1a:2b",
                "switch_mode Manual",
                "start_belt",
                "change_speed 35",
                "stop_belt",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_command_propagates_as_command_error() {
        let (device, transport) = connected_and_settled().await;
        transport.fail("start_belt");

        let result = device.start_belt().await;

        assert_err!(&result);
        assert!(matches!(
            result,
            Err(WalkingPadError::Command {
                command: "start_belt",
                ..
            })
        ));
        assert!(!device.is_moving().await);
        assert!(device.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_suppressed_within_window_after_command() {
        let (device, _transport) = connected_and_settled().await;
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let listener = RecordingListener::new("a", log);
        device.subscribe(listener.clone()).await;

        device.change_speed(20).await.unwrap();
        let before = device.state().await;

        sleep(Duration::from_millis(4_900)).await;
        assert!(!device.handle_status(DeviceStatus::new(10, 5, 30, 40)).await);
        assert_eq!(device.state().await, before);
        assert!(listener.statuses().is_empty());

        sleep(Duration::from_millis(200)).await;
        assert!(device.handle_status(DeviceStatus::new(20, 5, 31, 41)).await);
        assert_eq!(listener.statuses(), vec![DeviceStatus::new(20, 5, 31, 41)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_suppressed_while_command_in_flight() {
        let (device, _transport) = connected_and_settled().await;

        let pending = {
            let device = device.clone();
            tokio::spawn(async move { device.start_belt().await })
        };
        sleep(Duration::from_millis(10)).await;

        assert!(device.is_command_in_flight().await);
        assert!(!device.handle_status(DeviceStatus::new(0, 0, 0, 0)).await);

        pending.await.unwrap().unwrap();
        assert!(device.is_moving().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_updates_derived_state() {
        let (device, _transport) = setup();

        assert!(device.handle_status(DeviceStatus::new(30, 10, 60, 100)).await);
        let state = device.state().await;
        assert!(state.moving);
        assert_eq!(state.speed, 30);
        assert_eq!(state.distance, 10);
        assert_eq!(state.time, 60);
        assert_eq!(state.steps, 100);
        assert!(state.step_cadence.abs() < f64::EPSILON);

        assert!(device.handle_status(DeviceStatus::new(30, 12, 90, 160)).await);
        let state = device.state().await;
        assert!((state.step_cadence - 120.0).abs() < 1e-9);
        assert_eq!(state.last_status, Some(DeviceStatus::new(30, 12, 90, 160)));

        assert!(device.handle_status(DeviceStatus::new(0, 12, 90, 160)).await);
        let state = device.state().await;
        assert!(!state.moving);
        assert!(state.step_cadence.abs() < f64::EPSILON);
    }

    #[test]
    fn test_step_cadence_guards() {
        let moving = DeviceStatus::new(30, 0, 60, 100);

        assert!(step_cadence(None, &moving).abs() < f64::EPSILON);

        let stopped_before = DeviceStatus::new(0, 0, 30, 50);
        assert!(step_cadence(Some(&stopped_before), &moving).abs() < f64::EPSILON);

        let same_time = DeviceStatus::new(30, 0, 60, 90);
        assert!(step_cadence(Some(&same_time), &moving).abs() < f64::EPSILON);

        let more_steps_before = DeviceStatus::new(30, 0, 30, 500);
        assert!(step_cadence(Some(&more_steps_before), &moving).abs() < f64::EPSILON);

        let previous_session = DeviceStatus::new(30, 0, 600, 1200);
        let new_session = DeviceStatus::new(30, 0, 3, 5);
        assert!(step_cadence(Some(&previous_session), &new_session).abs() < f64::EPSILON);

        let earlier = DeviceStatus::new(25, 0, 30, 40);
        assert!((step_cadence(Some(&earlier), &moving) - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_step_cadence_never_negative() {
        for prev_steps in [0u32, 10, 100, 1_000, u32::MAX] {
            for (prev_time, time) in [(0u32, 0u32), (10, 10), (10, 20), (20, 10), (0, u32::MAX)] {
                let previous = DeviceStatus::new(20, 0, prev_time, prev_steps);
                let current = DeviceStatus::new(20, 0, time, 50);
                let cadence = step_cadence(Some(&previous), &current);
                assert!(cadence >= 0.0, "negative cadence for {previous:?} -> {current:?}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_listeners_called_in_order_and_unsubscribe() {
        let (device, _transport) = setup();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let first = RecordingListener::new("first", log.clone());
        let second = RecordingListener::new("second", log.clone());

        let first_id = device.subscribe(first.clone()).await;
        device.subscribe(second.clone()).await;

        device.handle_status(DeviceStatus::new(10, 1, 1, 1)).await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);

        assert!(device.unsubscribe(first_id).await);
        assert!(!device.unsubscribe(first_id).await);

        device.handle_status(DeviceStatus::new(10, 2, 2, 2)).await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "second"]);
        assert_eq!(first.statuses().len(), 1);
        assert_eq!(second.statuses().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_status_reconnects_when_disconnected() {
        let (device, transport) = setup();

        device.request_status().await;

        assert!(device.is_connected().await);
        assert_eq!(transport.ops(), vec!["connect 57:4c:4e:27:1a:2b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_status_swallows_reconnect_failure() {
        let (device, transport) = setup();
        transport.fail("connect");

        device.request_status().await;

        assert!(!device.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_status_failure_forces_disconnect() {
        let (device, transport) = connected_and_settled().await;
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let listener = RecordingListener::new("a", log);
        device.subscribe(listener.clone()).await;
        transport.fail("ask_stats");

        device.request_status().await;

        assert!(!device.is_connected().await);
        assert_eq!(listener.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(
            transport.ops(),
            vec!["connect 57:4c:4e:27:1a:2b", "ask_stats", "disconnect"]
        );

        transport.succeed("ask_stats");
        device.request_status().await;
        assert!(device.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_request_does_not_suppress_its_answer() {
        let (device, _transport) = connected_and_settled().await;

        device.request_status().await;

        assert!(device.handle_status(DeviceStatus::new(30, 1, 10, 20)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_are_serialized() {
        let (device, transport) = connected_and_settled().await;

        let (speed, belt) = tokio::join!(device.change_speed(30), device.start_belt());
        speed.unwrap();
        belt.unwrap();

        assert_eq!(transport.max_in_flight(), 1);
        let calls = transport.calls();
        let first = &calls[1];
        let second = &calls[2];
        assert!(second.started >= first.finished + Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_requests_status() {
        let (device, transport) = connected_and_settled().await;

        device.start_polling().await;
        assert!(device.is_polling().await);
        sleep(Duration::from_millis(10_500)).await;
        device.stop_polling().await;
        assert!(!device.is_polling().await);

        let polls = transport.ops().iter().filter(|op| *op == "ask_stats").count();
        assert_eq!(polls, 3);

        sleep(Duration::from_secs(20)).await;
        let after = transport.ops().iter().filter(|op| *op == "ask_stats").count();
        assert_eq!(after, polls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_sender_applies_in_order() {
        let (device, _transport) = setup();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let listener = RecordingListener::new("a", log);
        device.subscribe(listener.clone()).await;

        let sender = device.status_sender();
        sender.send(DeviceStatus::new(10, 1, 1, 2)).unwrap();
        sender.send(DeviceStatus::new(10, 2, 2, 4)).unwrap();
        drop(sender);
        sleep(Duration::from_millis(10)).await;

        assert_eq!(
            listener.statuses(),
            vec![DeviceStatus::new(10, 1, 1, 2), DeviceStatus::new(10, 2, 2, 4)]
        );
        assert_eq!(device.state().await.time, 2);
    }
}
