use async_trait::async_trait;
use std::{
    sync::{Arc, Weak},
    time::{Duration, SystemTime},
};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    device::{Registry, StatusListener, SubscriptionId, WalkingPadDevice},
    session::{SessionEvent, SessionTracker},
    types::{DeviceStatus, SessionStarted, SessionSummary},
};

/// Receives debounced updates and session events for one pad
///
/// Every method has an empty default so observers only implement what they
/// need.
#[async_trait]
pub trait PadObserver: Send + Sync {
    /// Latest accepted status, published at most once per debounce interval
    async fn on_status_applied(&self, _status: &DeviceStatus) {}

    /// A walking session started
    async fn on_session_started(&self, _event: &SessionStarted) {}

    /// A walking session ended
    async fn on_session_ended(&self, _summary: &SessionSummary) {}

    /// The link to the pad came up or went down
    async fn on_connectivity_changed(&self, _connected: bool) {}
}

/// What to do with a newly accepted sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceDecision {
    /// Publish right away
    PublishNow,
    /// Publish once `at` is reached
    Schedule {
        /// When the delayed publish is due
        at: Instant,
    },
    /// A delayed publish is already pending and will carry this sample
    AlreadyScheduled,
}

/// Trailing-edge debounce policy
///
/// A sample arriving at least one interval after the last publish is published
/// immediately. Otherwise a single delayed publish is scheduled one interval
/// after the first sample of the burst.
#[derive(Debug, Clone)]
pub struct Debouncer {
    interval: Duration,
    last_published: Option<Instant>,
    pending_until: Option<Instant>,
}

impl Debouncer {
    /// Create a debouncer that publishes at most once per `interval`
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_published: None,
            pending_until: None,
        }
    }

    /// Decide what to do with a sample arriving at `now`
    pub fn on_sample(&mut self, now: Instant) -> DebounceDecision {
        let due = self
            .last_published
            .is_none_or(|last| now.duration_since(last) >= self.interval);

        if due {
            self.last_published = Some(now);
            self.pending_until = None;
            return DebounceDecision::PublishNow;
        }

        if self.pending_until.is_some() {
            return DebounceDecision::AlreadyScheduled;
        }

        let at = now + self.interval;
        self.pending_until = Some(at);
        DebounceDecision::Schedule { at }
    }

    /// The delayed publish scheduled for `at` is firing at `now`
    ///
    /// Returns `false` if that publish was superseded or cancelled.
    pub fn on_fire(&mut self, at: Instant, now: Instant) -> bool {
        if self.pending_until != Some(at) {
            return false;
        }
        self.pending_until = None;
        self.last_published = Some(now);
        true
    }

    /// Drop any pending delayed publish
    pub fn cancel(&mut self) {
        self.pending_until = None;
    }

    /// Whether a delayed publish is pending
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.pending_until.is_some()
    }
}

struct DebounceState {
    debouncer: Debouncer,
    latest: Option<DeviceStatus>,
    task: Option<JoinHandle<()>>,
}

struct CoordinatorInner {
    device: WalkingPadDevice,
    debounce: Mutex<DebounceState>,
    tracker: Mutex<SessionTracker>,
    connected: RwLock<bool>,
    observers: Mutex<Registry<dyn PadObserver>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

/// Turns the raw status feed of a [`WalkingPadDevice`] into observer updates
///
/// Two handlers are subscribed to the device, in this order:
///
/// 1. a debounced refresh that publishes the latest sample at most once per
///    debounce interval, always delivering the final sample of a burst
/// 2. a session detector that fires [`PadObserver::on_session_started`] and
///    [`PadObserver::on_session_ended`] from the duration counter
///
/// Connectivity loss reported by the device bypasses the debounce and drops
/// any pending publish.
pub struct UpdateCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl UpdateCoordinator {
    /// Subscribe a new coordinator to `device`
    pub async fn attach(device: &WalkingPadDevice) -> Self {
        let interval = device.config().timing.debounce();
        let inner = Arc::new(CoordinatorInner {
            device: device.clone(),
            debounce: Mutex::new(DebounceState {
                debouncer: Debouncer::new(interval),
                latest: None,
                task: None,
            }),
            tracker: Mutex::new(SessionTracker::new()),
            connected: RwLock::new(device.is_connected().await),
            observers: Mutex::new(Registry::default()),
            subscriptions: Mutex::new(Vec::new()),
        });

        let refresh = device
            .subscribe(Arc::new(DebouncedRefresh(Arc::downgrade(&inner))))
            .await;
        let detector = device
            .subscribe(Arc::new(SessionDetector(Arc::downgrade(&inner))))
            .await;
        inner
            .subscriptions
            .lock()
            .await
            .extend([refresh, detector]);

        debug!(address = %device.address(), "Coordinator attached");
        Self { inner }
    }

    /// Device this coordinator follows
    #[must_use]
    pub fn device(&self) -> &WalkingPadDevice {
        &self.inner.device
    }

    /// Register an observer
    pub async fn add_observer(&self, observer: Arc<dyn PadObserver>) -> SubscriptionId {
        self.inner.observers.lock().await.insert(observer)
    }

    /// Remove an observer. Returns `false` if it was not registered.
    pub async fn remove_observer(&self, id: SubscriptionId) -> bool {
        self.inner.observers.lock().await.remove(id)
    }

    /// Connectivity as last reported to observers
    pub async fn is_connected(&self) -> bool {
        *self.inner.connected.read().await
    }

    /// Most recent accepted sample
    pub async fn latest_status(&self) -> Option<DeviceStatus> {
        self.inner.debounce.lock().await.latest
    }

    /// Whether a delayed publish is pending
    pub async fn has_pending_update(&self) -> bool {
        self.inner.debounce.lock().await.debouncer.is_pending()
    }

    /// Cancel any pending delayed publish
    pub async fn shutdown(&self) {
        self.inner.cancel_pending().await;
    }

    /// Unsubscribe from the device and cancel any pending publish
    pub async fn detach(&self) {
        let ids: Vec<_> = self.inner.subscriptions.lock().await.drain(..).collect();
        for id in ids {
            self.inner.device.unsubscribe(id).await;
        }
        self.shutdown().await;
        debug!(address = %self.inner.device.address(), "Coordinator detached");
    }
}

impl CoordinatorInner {
    async fn handle_update(self: &Arc<Self>, status: &DeviceStatus) {
        let came_up = {
            let mut connected = self.connected.write().await;
            let was = *connected;
            *connected = true;
            !was
        };
        if came_up {
            self.notify(|o| async move { o.on_connectivity_changed(true).await })
                .await;
        }

        let publish = {
            let mut debounce = self.debounce.lock().await;
            debounce.latest = Some(*status);

            match debounce.debouncer.on_sample(Instant::now()) {
                DebounceDecision::PublishNow => {
                    if let Some(task) = debounce.task.take() {
                        task.abort();
                    }
                    true
                }
                DebounceDecision::Schedule { at } => {
                    debounce.task = Some(self.schedule_publish(at));
                    false
                }
                DebounceDecision::AlreadyScheduled => false,
            }
        };

        if publish {
            self.publish(status).await;
        }
    }

    fn schedule_publish(self: &Arc<Self>, at: Instant) -> JoinHandle<()> {
        let inner = Arc::downgrade(self);

        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };

            let latest = {
                let mut debounce = inner.debounce.lock().await;
                if !debounce.debouncer.on_fire(at, Instant::now()) {
                    return;
                }
                debounce.task = None;
                debounce.latest
            };

            if let Some(status) = latest {
                inner.publish(&status).await;
            }
        })
    }

    async fn publish(&self, status: &DeviceStatus) {
        debug!(address = %self.device.address(), ?status, "Publishing update");
        let status = *status;
        self.notify(|o| async move { o.on_status_applied(&status).await })
            .await;
    }

    async fn handle_disconnect(&self) {
        *self.connected.write().await = false;
        self.cancel_pending().await;
        warn!(address = %self.device.address(), "WalkingPad connection lost");
        self.notify(|o| async move { o.on_connectivity_changed(false).await })
            .await;
    }

    async fn cancel_pending(&self) {
        let mut debounce = self.debounce.lock().await;
        debounce.debouncer.cancel();
        if let Some(task) = debounce.task.take() {
            task.abort();
        }
    }

    async fn detect_session(&self, status: &DeviceStatus) {
        let event = self
            .tracker
            .lock()
            .await
            .observe(status, SystemTime::now());

        match event {
            Some(SessionEvent::Started(started)) => {
                info!(address = %self.device.address(), "Walking session started");
                self.notify(|o| async move { o.on_session_started(&started).await })
                    .await;
            }
            Some(SessionEvent::Ended(summary)) => {
                info!(
                    address = %self.device.address(),
                    duration = summary.duration_seconds,
                    steps = summary.steps,
                    distance_km = summary.distance_km,
                    "Walking session ended"
                );
                self.notify(|o| async move { o.on_session_ended(&summary).await })
                    .await;
            }
            None => {}
        }
    }

    async fn notify<F, Fut>(&self, call: F)
    where
        F: Fn(Arc<dyn PadObserver>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let observers = self.observers.lock().await.snapshot();
        for observer in observers {
            call(observer).await;
        }
    }
}

struct DebouncedRefresh(Weak<CoordinatorInner>);

#[async_trait]
impl StatusListener for DebouncedRefresh {
    async fn on_status(&self, status: &DeviceStatus) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_update(status).await;
        }
    }

    async fn on_disconnected(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_disconnect().await;
        }
    }
}

struct SessionDetector(Weak<CoordinatorInner>);

#[async_trait]
impl StatusListener for SessionDetector {
    async fn on_status(&self, status: &DeviceStatus) {
        if let Some(inner) = self.0.upgrade() {
            inner.detect_session(status).await;
        }
    }
}
