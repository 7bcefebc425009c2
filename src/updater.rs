//! Scheduling strategies for the fetch -> filter -> swap pipeline.

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::server_list::RegistryEvent;

/// The work an updater schedules: one pipeline cycle, resolving to whether it succeeded.
pub type UpdateAction = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

pub trait ServerListUpdater: Send + Sync {
    /// Begins scheduling `action`. A second call while running is a no-op.
    fn start(&self, action: UpdateAction);

    /// Stops scheduling. Safe to call repeatedly or before `start`.
    fn stop(&self);

    fn is_running(&self) -> bool;

    /// When a cycle last succeeded. Failed cycles leave it untouched.
    fn last_update(&self) -> Option<DateTime<Utc>>;

    fn duration_since_last_update(&self) -> Option<Duration>;

    fn missed_cycles(&self) -> u64;
}

#[derive(Debug, Default)]
struct UpdateStats {
    last_update_ms: AtomicI64,
    missed: AtomicU64,
}

impl UpdateStats {
    fn record_update(&self) {
        self.last_update_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    fn last_update(&self) -> Option<DateTime<Utc>> {
        match self.last_update_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    fn duration_since_last_update(&self) -> Option<Duration> {
        self.last_update()
            .map(|at| (Utc::now() - at).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Runs the update action on a fixed interval.
pub struct PollingUpdater {
    initial_delay: Duration,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<UpdateStats>,
}

impl PollingUpdater {
    pub fn new(initial_delay: Duration, interval: Duration) -> Self {
        Self {
            initial_delay,
            interval,
            task: Mutex::new(None),
            stats: Arc::new(UpdateStats::default()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl ServerListUpdater for PollingUpdater {
    fn start(&self, action: UpdateAction) {
        let mut task = self.task.lock();
        if task.is_some() {
            debug!("Polling updater already started");
            return;
        }
        let interval = self.interval;
        let initial_delay = self.initial_delay;
        let stats = self.stats.clone();
        info!(
            "🔄 Starting server list polling (initial delay: {:?}, interval: {:?})",
            initial_delay, interval
        );
        *task = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + initial_delay;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let started = tokio::time::Instant::now();
                if action().await {
                    stats.record_update();
                }
                let elapsed = started.elapsed();
                if elapsed > interval {
                    let missed = (elapsed.as_nanos() / interval.as_nanos().max(1)) as u64;
                    stats.missed.fetch_add(missed, Ordering::Relaxed);
                    warn!(
                        "Server list update took {:?}, longer than interval {:?} ({} cycles missed)",
                        elapsed, interval, missed
                    );
                }
            }
        }));
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!("Stopped server list polling");
        }
    }

    fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    fn last_update(&self) -> Option<DateTime<Utc>> {
        self.stats.last_update()
    }

    fn duration_since_last_update(&self) -> Option<Duration> {
        self.stats.duration_since_last_update()
    }

    fn missed_cycles(&self) -> u64 {
        self.stats.missed.load(Ordering::Relaxed)
    }
}

impl Drop for PollingUpdater {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Runs the update action whenever the registry pushes a notification.
///
/// With a debounce window, a burst of notifications collapses into one update
/// that runs after the window has passed.
pub struct EventDrivenUpdater {
    events: broadcast::Sender<RegistryEvent>,
    debounce: Option<Duration>,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<UpdateStats>,
}

impl EventDrivenUpdater {
    pub fn new(events: broadcast::Sender<RegistryEvent>, debounce: Option<Duration>) -> Self {
        Self {
            events,
            debounce,
            task: Mutex::new(None),
            stats: Arc::new(UpdateStats::default()),
        }
    }
}

impl ServerListUpdater for EventDrivenUpdater {
    fn start(&self, action: UpdateAction) {
        let mut task = self.task.lock();
        if task.is_some() {
            debug!("Event-driven updater already started");
            return;
        }
        let mut receiver = self.events.subscribe();
        let debounce = self.debounce;
        let stats = self.stats.clone();
        info!("🔔 Subscribed to registry notifications");
        *task = Some(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => debug!("Registry event: {:?}", event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Registry notifications lagged, {} events dropped", skipped);
                        stats.missed.fetch_add(skipped, Ordering::Relaxed);
                    }
                    Err(RecvError::Closed) => {
                        info!("Registry notification channel closed");
                        break;
                    }
                }
                if let Some(window) = debounce {
                    tokio::time::sleep(window).await;
                    loop {
                        match receiver.try_recv() {
                            Ok(_) => continue,
                            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                                stats.missed.fetch_add(skipped, Ordering::Relaxed);
                            }
                            Err(_) => break,
                        }
                    }
                }
                if action().await {
                    stats.record_update();
                }
            }
        }));
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!("Unsubscribed from registry notifications");
        }
    }

    fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    fn last_update(&self) -> Option<DateTime<Utc>> {
        self.stats.last_update()
    }

    fn duration_since_last_update(&self) -> Option<Duration> {
        self.stats.duration_since_last_update()
    }

    fn missed_cycles(&self) -> u64 {
        self.stats.missed.load(Ordering::Relaxed)
    }
}

impl Drop for EventDrivenUpdater {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn counting_action(counter: Arc<AtomicUsize>) -> UpdateAction {
        Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
            .boxed()
        })
    }

    #[test]
    fn test_stop_before_start_is_harmless() {
        let updater = PollingUpdater::new(Duration::ZERO, Duration::from_secs(1));
        updater.stop();
        updater.stop();
        assert!(!updater.is_running());
        assert!(updater.last_update().is_none());
        assert!(updater.duration_since_last_update().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_schedules_one_task() {
        let counter = Arc::new(AtomicUsize::new(0));
        let updater = PollingUpdater::new(Duration::ZERO, Duration::from_millis(100));
        updater.start(counting_action(counter.clone()));
        updater.start(counting_action(counter.clone()));
        assert!(updater.is_running());

        // ticks at 0, 100, 200, 300
        tokio::time::sleep(Duration::from_millis(350)).await;
        let runs = counter.load(Ordering::SeqCst);
        assert!((3..=5).contains(&runs), "expected one task's worth of runs, got {}", runs);
        assert!(updater.last_update().is_some());

        updater.stop();
        updater.stop();
        assert!(!updater.is_running());
        let after_stop = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cycle_counts_missed() {
        let updater = PollingUpdater::new(Duration::ZERO, Duration::from_millis(100));
        let action: UpdateAction = Arc::new(|| {
            async {
                tokio::time::sleep(Duration::from_millis(250)).await;
                true
            }
            .boxed()
        });
        updater.start(action);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(updater.missed_cycles() >= 2);
        updater.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycles_do_not_stamp_last_update() {
        let (tx, _keep) = broadcast::channel(16);
        let failing: UpdateAction = Arc::new(|| async { false }.boxed());
        let updater = EventDrivenUpdater::new(tx.clone(), None);
        updater.start(failing);
        tokio::task::yield_now().await;
        tx.send(RegistryEvent::CacheRefreshed).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(updater.last_update().is_none());
        assert!(updater.duration_since_last_update().is_none());
        updater.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_driven_debounces_bursts() {
        let (tx, _keep) = broadcast::channel(16);
        let counter = Arc::new(AtomicUsize::new(0));
        let updater = EventDrivenUpdater::new(tx.clone(), Some(Duration::from_millis(50)));
        updater.start(counting_action(counter.clone()));
        updater.start(counting_action(counter.clone()));
        tokio::task::yield_now().await;

        for _ in 0..5 {
            tx.send(RegistryEvent::CacheRefreshed).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tx.send(RegistryEvent::InstancesChanged { service: "svc".into() }).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(updater.last_update().is_some());

        updater.stop();
        updater.stop();
        assert!(!updater.is_running());
    }
}
