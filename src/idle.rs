//! Stops the on-demand backend after a period with no sessions

use crate::lifecycle::LifecycleController;
use crate::session::OnDemandActivity;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// At least one session is active
    Busy,
    /// Idle; stop at this instant unless a session arrives
    Armed(Instant),
    /// Stop already attempted for this idle period
    Fired,
}

pub struct IdleScheduler {
    lifecycle: Arc<LifecycleController>,
    activity: watch::Receiver<OnDemandActivity>,
    idle_after: Duration,
    tick: Duration,
}

impl IdleScheduler {
    pub fn new(
        lifecycle: Arc<LifecycleController>,
        activity: watch::Receiver<OnDemandActivity>,
        idle_after: Duration,
        tick: Duration,
    ) -> Self {
        Self {
            lifecycle,
            activity,
            idle_after,
            tick,
        }
    }

    /// Run until shutdown is signalled or the session registry goes away
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut seen = *self.activity.borrow_and_update();
        let mut phase = if seen.active == 0 {
            Phase::Armed(Instant::now() + self.idle_after)
        } else {
            Phase::Busy
        };

        let mut ticker = tokio::time::interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            idle_shutdown_secs = self.idle_after.as_secs(),
            "Idle shutdown scheduler started"
        );

        loop {
            let deadline = match phase {
                Phase::Armed(at) => Some(at),
                _ => None,
            };

            tokio::select! {
                changed = self.activity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *self.activity.borrow_and_update();
                    phase = self.next_phase(phase, seen, current);
                    seen = current;
                }
                _ = ticker.tick() => {
                    let current = *self.activity.borrow();
                    phase = self.next_phase(phase, seen, current);
                    seen = current;
                    // Backend came up again (external start or a login that
                    // never turned into a session) after the last stop
                    if phase == Phase::Fired && self.lifecycle.ready_address().is_some() {
                        phase = Phase::Armed(Instant::now() + self.idle_after);
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let current = *self.activity.borrow();
                    if current != seen {
                        phase = self.next_phase(phase, seen, current);
                        seen = current;
                        continue;
                    }
                    phase = self.fire().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Idle shutdown scheduler stopped");
    }

    fn next_phase(&self, phase: Phase, seen: OnDemandActivity, current: OnDemandActivity) -> Phase {
        if current.active > 0 {
            if !matches!(phase, Phase::Busy) {
                debug!(active = current.active, "Sessions active, idle timer disarmed");
            }
            return Phase::Busy;
        }

        // Zero active: arm on a zero-crossing or if someone came and went
        if matches!(phase, Phase::Busy) || current.arrivals != seen.arrivals {
            debug!(idle_shutdown_secs = self.idle_after.as_secs(), "No active sessions, idle timer armed");
            return Phase::Armed(Instant::now() + self.idle_after);
        }
        phase
    }

    async fn fire(&self) -> Phase {
        if self.lifecycle.is_starting() {
            debug!("Backend is starting, deferring idle shutdown");
            return Phase::Armed(Instant::now() + self.idle_after);
        }

        info!(idle_secs = self.idle_after.as_secs(), "Backend idle, stopping");
        match self.lifecycle.stop().await {
            Ok(true) => {}
            Ok(false) => debug!("Backend was not running"),
            Err(e) => warn!(error = %e, "Idle shutdown failed"),
        }
        Phase::Fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleSettings;
    use crate::provider::testing::FakeProvider;
    use crate::provider::InstanceState;
    use crate::session::{SessionInfo, SessionKind, SessionRegistry};
    use std::net::IpAddr;
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    const MIN: Duration = Duration::from_secs(60);

    struct Harness {
        provider: Arc<FakeProvider>,
        lifecycle: Arc<LifecycleController>,
        registry: Arc<SessionRegistry>,
        _shutdown: watch::Sender<bool>,
    }

    fn settings(service_port: u16) -> LifecycleSettings {
        LifecycleSettings {
            instance_id: "mc".to_string(),
            service_port,
            poll_interval: Duration::from_secs(5),
            start_timeout: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(2),
            start_debounce: Duration::from_secs(30),
        }
    }

    fn spawn_scheduler(
        lifecycle: &Arc<LifecycleController>,
        activity: watch::Receiver<OnDemandActivity>,
    ) -> watch::Sender<bool> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = IdleScheduler::new(Arc::clone(lifecycle), activity, 10 * MIN, MIN);
        tokio::spawn(scheduler.run(shutdown_rx));
        shutdown_tx
    }

    fn start_with(provider: Arc<FakeProvider>, settings: LifecycleSettings) -> Harness {
        let lifecycle = LifecycleController::new(provider.clone(), settings);
        let registry = SessionRegistry::new();
        let shutdown = spawn_scheduler(&lifecycle, registry.subscribe());

        Harness {
            provider,
            lifecycle,
            registry,
            _shutdown: shutdown,
        }
    }

    fn start() -> Harness {
        start_with(FakeProvider::running(), settings(25565))
    }

    fn session() -> SessionInfo {
        SessionInfo {
            client: "10.0.0.1:40000".parse().unwrap(),
            backend: "127.0.0.1:25565".to_string(),
            host: "mc.example.com".to_string(),
            kind: SessionKind::OnDemand,
            started: std::time::Instant::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_once_after_full_idle_period() {
        let h = start();

        sleep(10 * MIN + Duration::from_secs(1)).await;
        assert_eq!(h.provider.stops(), 1);

        sleep(30 * MIN).await;
        assert_eq!(h.provider.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_session_cancels_pending_stop() {
        let h = start();

        sleep(9 * MIN).await;
        let guard = h.registry.register(session());
        sleep(Duration::from_secs(1)).await;
        drop(guard);

        // Past the original deadline
        sleep(3 * MIN).await;
        assert_eq!(h.provider.stops(), 0);

        // A full period after the session ended
        sleep(8 * MIN).await;
        assert_eq!(h.provider.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_session_prevents_stop() {
        let h = start();
        let _guard = h.registry.register(session());

        sleep(60 * MIN).await;
        assert_eq!(h.provider.stops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_brief_session_rearms_timer() {
        let h = start();

        sleep(5 * MIN).await;
        // Arrives and leaves before the scheduler runs
        drop(h.registry.register(session()));

        sleep(6 * MIN).await;
        assert_eq!(h.provider.stops(), 0);

        sleep(5 * MIN).await;
        assert_eq!(h.provider.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_sessions_do_not_count() {
        let h = start();
        let mut local = session();
        local.kind = SessionKind::Local;
        let _guard = h.registry.register(local);

        sleep(10 * MIN + Duration::from_secs(1)).await;
        assert_eq!(h.provider.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_deferred_while_backend_starting() {
        let provider = FakeProvider::stopped();
        // Running without an address: the readiness sequence keeps polling
        provider.set(InstanceState::Running, None);
        let mut settings = settings(25565);
        settings.start_timeout = 15 * MIN;
        let h = start_with(provider, settings);

        let lifecycle = Arc::clone(&h.lifecycle);
        let waiter = tokio::spawn(async move { lifecycle.ensure_running().await });
        sleep(Duration::from_secs(1)).await;
        assert!(h.lifecycle.is_starting());

        sleep(10 * MIN).await;
        assert!(h.lifecycle.is_starting());
        assert_eq!(h.provider.stops(), 0);

        // Sequence gives up at 15 minutes; the deferred stop is due at 20
        assert!(waiter.await.unwrap().is_err());
        assert!(!h.lifecycle.is_starting());
        sleep(4 * MIN).await;
        assert_eq!(h.provider.stops(), 0);

        sleep(2 * MIN).await;
        assert_eq!(h.provider.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_rearms_when_backend_returns() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let h = start_with(FakeProvider::running(), settings(port));

        sleep(10 * MIN + Duration::from_secs(1)).await;
        assert_eq!(h.provider.stops(), 1);

        // Started again outside the proxy; the probe runs on the real clock
        h.provider.set(InstanceState::Running, Some(IpAddr::from([127, 0, 0, 1])));
        tokio::time::resume();
        h.lifecycle.reconcile().await.unwrap();
        tokio::time::pause();
        assert!(h.lifecycle.ready_address().is_some());

        // Re-armed by the tick at 11 minutes
        sleep(10 * MIN).await;
        assert_eq!(h.provider.stops(), 1);

        sleep(2 * MIN).await;
        assert_eq!(h.provider.stops(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_catches_missed_departure() {
        let provider = FakeProvider::running();
        let lifecycle = LifecycleController::new(provider.clone(), settings(25565));
        let (activity, rx) = watch::channel(OnDemandActivity { active: 1, arrivals: 1 });
        let _shutdown = spawn_scheduler(&lifecycle, rx);

        // Last session leaves without waking the scheduler
        sleep(Duration::from_secs(90)).await;
        activity.send_if_modified(|a| {
            a.active = 0;
            false
        });

        // The tick at 2 minutes arms; stop due at 12
        sleep(10 * MIN).await;
        assert_eq!(provider.stops(), 0);

        sleep(MIN).await;
        assert_eq!(provider.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_catches_missed_arrival() {
        let provider = FakeProvider::running();
        let lifecycle = LifecycleController::new(provider.clone(), settings(25565));
        let (activity, rx) = watch::channel(OnDemandActivity::default());
        let _shutdown = spawn_scheduler(&lifecycle, rx);

        sleep(5 * MIN + Duration::from_secs(30)).await;
        activity.send_if_modified(|a| {
            a.active = 1;
            a.arrivals = 1;
            false
        });

        sleep(30 * MIN).await;
        assert_eq!(provider.stops(), 0);
    }
}
