// Session service - one live engine per dashboard session, each on its own task
use crate::application::live_engine::{Control, LiveEngine};
use crate::domain::dashboard::{EngineMode, Snapshot};
use crate::domain::telemetry::DashboardState;
use crate::infrastructure::config::EngineSettings;
use crate::infrastructure::push_channel;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const CONTROL_BUFFER: usize = 32;

type Registry = Arc<RwLock<HashMap<Uuid, SessionHandle>>>;

struct SessionHandle {
    controls: mpsc::Sender<Control>,
    snapshots: watch::Receiver<Arc<Snapshot>>,
    cancel: CancellationToken,
    activity: Activity,
    task: JoinHandle<()>,
}

/// When a client last read from or steered a session.
#[derive(Clone)]
struct Activity {
    started: Instant,
    last_seen_ms: Arc<AtomicU64>,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_seen_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        self.last_seen_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms().saturating_sub(self.last_seen_ms.load(Ordering::Relaxed)))
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Clone)]
pub struct SessionService {
    settings: EngineSettings,
    sessions: Registry,
}

impl SessionService {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a live session from an analyzed state.
    ///
    /// With a push address the session runs in push mode; when the channel
    /// cannot be reached it falls back to synthetic telemetry.
    pub async fn start(&self, initial: DashboardState, push_address: Option<&str>) -> Uuid {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let mut engine = LiveEngine::new(initial, &self.settings);

        let push = match push_address.filter(|a| !a.trim().is_empty()) {
            Some(address) => {
                match push_channel::connect(address, self.settings.connect_timeout(), cancel.child_token()).await {
                    Ok(rx) => Some(rx),
                    Err(e) => {
                        tracing::warn!(
                            session_id = %id,
                            address = %address,
                            error = %e,
                            "Push channel unavailable, using synthetic telemetry"
                        );
                        None
                    }
                }
            }
            None => None,
        };
        let mode = if push.is_some() { EngineMode::Push } else { EngineMode::Synth };
        engine.start(mode);

        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(engine.snapshot()));
        let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
        let activity = Activity::new();
        let session = SessionTask {
            id,
            engine,
            push,
            controls: control_rx,
            snapshots: snapshot_tx,
            cancel: cancel.clone(),
            frame_interval: self.settings.frame_interval(),
            idle_timeout: self.settings.idle_timeout(),
            activity: activity.clone(),
            registry: self.sessions.clone(),
        };

        // Registered before the task runs so an idle reap always finds it.
        let mut sessions = self.sessions.write().await;
        let task = tokio::spawn(session.run());
        sessions.insert(
            id,
            SessionHandle {
                controls: control_tx,
                snapshots: snapshot_rx,
                cancel,
                activity,
                task,
            },
        );
        drop(sessions);
        tracing::info!(session_id = %id, mode = ?mode, "Session started");
        id
    }

    pub async fn snapshot(&self, id: Uuid) -> Option<Arc<Snapshot>> {
        let sessions = self.sessions.read().await;
        sessions.get(&id).map(|handle| {
            handle.activity.touch();
            handle.snapshots.borrow().clone()
        })
    }

    /// Live snapshot feed. The session is not reaped while any receiver
    /// returned here is alive.
    pub async fn subscribe(&self, id: Uuid) -> Option<watch::Receiver<Arc<Snapshot>>> {
        let sessions = self.sessions.read().await;
        sessions.get(&id).map(|handle| {
            handle.activity.touch();
            handle.snapshots.clone()
        })
    }

    /// Queue a control for the session. False when the session is unknown
    /// or already shutting down.
    pub async fn control(&self, id: Uuid, control: Control) -> bool {
        let sender = {
            let sessions = self.sessions.read().await;
            match sessions.get(&id) {
                Some(handle) => {
                    handle.activity.touch();
                    handle.controls.clone()
                }
                None => return false,
            }
        };
        sender.send(control).await.is_ok()
    }

    /// Tear the session down and wait for its task. Idempotent: false when
    /// the session no longer exists.
    pub async fn stop(&self, id: Uuid) -> bool {
        let Some(handle) = self.sessions.write().await.remove(&id) else {
            return false;
        };
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            tracing::warn!(session_id = %id, error = %e, "Session task ended abnormally");
        }
        tracing::info!(session_id = %id, "Session stopped");
        true
    }

    pub async fn stop_all(&self) {
        let ids: Vec<Uuid> = self.sessions.read().await.keys().copied().collect();
        for id in ids {
            self.stop(id).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Everything one session task owns.
struct SessionTask {
    id: Uuid,
    engine: LiveEngine,
    push: Option<mpsc::Receiver<String>>,
    controls: mpsc::Receiver<Control>,
    snapshots: watch::Sender<Arc<Snapshot>>,
    cancel: CancellationToken,
    frame_interval: Duration,
    idle_timeout: Option<Duration>,
    activity: Activity,
    registry: Registry,
}

impl SessionTask {
    /// Session loop. Cancellation, controls, frame ticks and push lines are
    /// serialized here so the engine only ever has one writer. Ticks are
    /// polled ahead of push lines so a busy feed cannot stall the frames.
    async fn run(self) {
        let SessionTask {
            id,
            mut engine,
            mut push,
            mut controls,
            snapshots,
            cancel,
            frame_interval,
            idle_timeout,
            activity,
            registry,
        } = self;

        let mut ticker = tokio::time::interval(frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reaped = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                control = controls.recv() => match control {
                    Some(control) => engine.control(control),
                    None => break,
                },
                _ = ticker.tick() => {
                    if is_abandoned(&snapshots, &activity, idle_timeout) {
                        tracing::info!(session_id = %id, idle = ?activity.idle_for(), "Session idle, tearing down");
                        reaped = true;
                        break;
                    }
                    engine.tick();
                }
                line = next_line(&mut push) => match line {
                    Some(line) => {
                        // Malformed lines are logged by the engine and skipped.
                        let _ = engine.apply_push(&line);
                    }
                    None => {
                        tracing::info!(session_id = %id, "Push channel closed, keeping last values");
                        push = None;
                    }
                },
            }
            snapshots.send_replace(Arc::new(engine.snapshot()));
        }

        engine.stop();
        snapshots.send_replace(Arc::new(engine.snapshot()));
        if reaped {
            cancel.cancel();
            registry.write().await.remove(&id);
        }
    }
}

/// Nobody holds a feed and nobody has read or steered the session within
/// `idle_timeout`. The registry's own receiver does not count.
fn is_abandoned(snapshots: &watch::Sender<Arc<Snapshot>>, activity: &Activity, idle_timeout: Option<Duration>) -> bool {
    let Some(limit) = idle_timeout else {
        return false;
    };
    if snapshots.receiver_count() > 1 {
        activity.touch();
        return false;
    }
    activity.idle_for() >= limit
}

async fn next_line(push: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match push {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::telemetry::SensorRecord;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn state() -> DashboardState {
        DashboardState {
            device_id: "IOT-001".to_string(),
            protocol: "MQTT".to_string(),
            frequency: "60".to_string(),
            sensors: vec![SensorRecord {
                id: "IOT-001-0".to_string(),
                kind: "Temperature".to_string(),
                value: 72.0,
                unit: "F".to_string(),
                threshold: 80.0,
                timestamp: "10:00:00".to_string(),
            }],
        }
    }

    fn service() -> SessionService {
        SessionService::new(EngineSettings {
            frame_interval_ms: 5,
            seed: Some(1),
            connect_timeout_ms: 500,
            ..EngineSettings::default()
        })
    }

    fn idle_service(idle_timeout_ms: u64) -> SessionService {
        SessionService::new(EngineSettings {
            frame_interval_ms: 5,
            seed: Some(1),
            idle_timeout_ms,
            ..EngineSettings::default()
        })
    }

    async fn wait_until_empty(service: &SessionService) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while service.len().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn wait_for<F>(service: &SessionService, id: Uuid, predicate: F) -> Arc<Snapshot>
    where
        F: Fn(&Snapshot) -> bool,
    {
        let mut rx = service.subscribe(id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = rx.borrow_and_update().clone();
                if predicate(&current) {
                    return current;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_synth_session_ticks_and_stops() {
        let service = service();
        let id = service.start(state(), None).await;
        let snapshot = wait_for(&service, id, |s| s.view.tick >= 3.0).await;
        assert_eq!(snapshot.view.mode, EngineMode::Synth);
        assert!(!snapshot.view.sensors[0].history.is_empty());

        assert!(service.stop(id).await);
        assert!(!service.stop(id).await);
        assert!(service.snapshot(id).await.is_none());
        assert_eq!(service.len().await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_push_falls_back_to_synth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let service = service();
        let id = service.start(state(), Some(&address)).await;
        let snapshot = service.snapshot(id).await.unwrap();
        assert_eq!(snapshot.view.mode, EngineMode::Synth);
        service.stop(id).await;
    }

    #[tokio::test]
    async fn test_push_session_merges_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"garbage\n").await.unwrap();
            socket
                .write_all(b"{\"sensors\":[{\"id\":\"IOT-001-0\",\"value\":91.5}]}\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let service = service();
        let id = service.start(state(), Some(&address)).await;
        let snapshot = wait_for(&service, id, |s| s.raw.sensors[0].value == 91.5).await;
        assert_eq!(snapshot.view.mode, EngineMode::Push);
        assert_eq!(snapshot.raw.sensors[0].unit, "F");
        assert!(snapshot.view.sensors[0].danger);

        service.stop(id).await;
        server.abort();
    }

    #[tokio::test]
    async fn test_push_flood_does_not_stall_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut n = 0u64;
            loop {
                n += 1;
                let line = format!("{{\"sensors\":[{{\"id\":\"IOT-001-0\",\"value\":{}}}]}}\n", n % 100);
                if socket.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let service = service();
        let id = service.start(state(), Some(&address)).await;
        let snapshot = wait_for(&service, id, |s| s.view.sensors[0].history.len() >= 10).await;
        assert_eq!(snapshot.view.mode, EngineMode::Push);

        service.stop(id).await;
        server.abort();
    }

    #[tokio::test]
    async fn test_unwatched_session_is_reaped() {
        let service = idle_service(40);
        let id = service.start(state(), None).await;
        wait_until_empty(&service).await;
        assert!(service.snapshot(id).await.is_none());
        assert!(!service.stop(id).await);
    }

    #[tokio::test]
    async fn test_watched_session_outlives_idle_timeout() {
        let service = idle_service(40);
        let id = service.start(state(), None).await;
        let mut rx = service.subscribe(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(service.len().await, 1);
        assert!(!rx.borrow_and_update().stopped);

        drop(rx);
        wait_until_empty(&service).await;
    }

    #[tokio::test]
    async fn test_controls_reach_the_engine() {
        let service = service();
        let id = service.start(state(), None).await;
        assert!(service.control(id, Control::Speed(2.5)).await);
        assert!(service.control(id, Control::Pause(true)).await);
        let snapshot = wait_for(&service, id, |s| s.view.paused && s.view.speed == 2.5).await;
        let frozen = snapshot.view.tick;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.snapshot(id).await.unwrap().view.tick, frozen);

        assert!(!service.control(Uuid::new_v4(), Control::Pause(false)).await);
        service.stop(id).await;
    }

    #[tokio::test]
    async fn test_stop_publishes_terminal_snapshot() {
        let service = service();
        let id = service.start(state(), None).await;
        let mut rx = service.subscribe(id).await.unwrap();
        service.stop(id).await;
        assert!(rx.borrow_and_update().stopped);
    }
}
