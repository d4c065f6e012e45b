// Live telemetry engine - evolves a dashboard state over time
use crate::domain::dashboard::{DashboardView, EngineMode, SensorView, Snapshot};
use crate::domain::error::ChannelError;
use crate::domain::history::{round2, HistoryBuffer};
use crate::domain::spring::{SpringParams, SpringState};
use crate::domain::telemetry::{DashboardState, PushMessage, SensorUpdate};
use crate::infrastructure::config::EngineSettings;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};

/// Angular rate of the synthetic oscillation, radians per tick.
const WAVE_RATE: f64 = 0.07;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Idle,
    Live,
    Stopped,
}

/// Playback controls accepted while a session is live.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Control {
    Pause(bool),
    Speed(f64),
    Visible(bool),
}

/// Single owner of one session's [`DashboardState`].
///
/// Every mutation goes through `apply_push` or `tick`; readers get clones
/// via [`LiveEngine::snapshot`]. Once stopped, the engine is inert.
pub struct LiveEngine {
    state: DashboardState,
    status: EngineStatus,
    mode: EngineMode,
    baselines: HashMap<String, f64>,
    history: HashMap<String, HistoryBuffer>,
    springs: HashMap<String, SpringState>,
    tick: f64,
    paused: bool,
    visible: bool,
    speed: f64,
    capacity: usize,
    spring: SpringParams,
    rng: StdRng,
}

impl LiveEngine {
    pub fn new(initial: DashboardState, settings: &EngineSettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut engine = Self {
            state: DashboardState {
                device_id: String::new(),
                protocol: String::new(),
                frequency: String::new(),
                sensors: Vec::new(),
            },
            status: EngineStatus::Idle,
            mode: EngineMode::Synth,
            baselines: HashMap::new(),
            history: HashMap::new(),
            springs: HashMap::new(),
            tick: 0.0,
            paused: false,
            visible: true,
            speed: 1.0,
            capacity: settings.history_capacity,
            spring: settings.spring,
            rng,
        };
        engine.load(initial);
        engine
    }

    /// Idle -> Live. Ignored in any other state.
    pub fn start(&mut self, mode: EngineMode) {
        if self.status != EngineStatus::Idle {
            tracing::debug!(status = ?self.status, "Engine already started");
            return;
        }
        self.mode = mode;
        self.status = EngineStatus::Live;
        tracing::debug!(device_id = %self.state.device_id, mode = ?mode, "Engine live");
    }

    /// Push -> synth, used when the push channel cannot be reached.
    pub fn fall_back_to_synth(&mut self) {
        if self.status != EngineStatus::Stopped && self.mode == EngineMode::Push {
            tracing::info!(device_id = %self.state.device_id, "Switching to synthetic telemetry");
            self.mode = EngineMode::Synth;
        }
    }

    /// Replace the authoritative state. Per-sensor bookkeeping is created
    /// for new ids and dropped for ids that disappeared; existing ids keep
    /// their baseline, history and spring.
    pub fn load(&mut self, state: DashboardState) {
        if self.status == EngineStatus::Stopped {
            return;
        }
        for record in &state.sensors {
            self.baselines.entry(record.id.clone()).or_insert(record.value);
            self.springs
                .entry(record.id.clone())
                .or_insert_with(|| SpringState::at(record.value));
            self.history
                .entry(record.id.clone())
                .or_insert_with(|| HistoryBuffer::new(self.capacity));
        }
        let live: Vec<&str> = state.sensor_ids().collect();
        self.baselines.retain(|id, _| live.contains(&id.as_str()));
        self.springs.retain(|id, _| live.contains(&id.as_str()));
        self.history.retain(|id, _| live.contains(&id.as_str()));
        self.state = state;
    }

    /// Merge one raw push message. Returns how many sensors were updated.
    ///
    /// Messages are dropped while paused or when not live; malformed
    /// messages are logged and leave the state untouched. Within a message,
    /// an entry that is not a valid update is skipped and the first entry
    /// for an id wins.
    pub fn apply_push(&mut self, raw: &str) -> Result<usize, ChannelError> {
        if self.status != EngineStatus::Live {
            return Ok(0);
        }
        if self.paused {
            tracing::debug!("Paused, dropping push message");
            return Ok(0);
        }

        let message: PushMessage = serde_json::from_str(raw).map_err(|e| {
            tracing::warn!(error = %e, "Ignoring malformed push message");
            ChannelError::Malformed(e.to_string())
        })?;

        if let Some(device_id) = message.device_id {
            self.state.device_id = device_id;
        }

        let mut updated = 0;
        let mut seen = HashSet::new();
        for entry in message.sensors.unwrap_or_default() {
            let update: SensorUpdate = match serde_json::from_value(entry) {
                Ok(update) => update,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping malformed sensor entry");
                    continue;
                }
            };
            if !seen.insert(update.id.clone()) {
                tracing::debug!(sensor_id = %update.id, "Repeated sensor id in push message, keeping the first");
                continue;
            }
            match self.state.sensors.iter_mut().find(|s| s.id == update.id) {
                Some(record) => {
                    record.overlay(&update);
                    updated += 1;
                }
                None => tracing::debug!(sensor_id = %update.id, "Push update for unknown sensor ignored"),
            }
        }
        Ok(updated)
    }

    /// Advance one frame.
    ///
    /// Hidden: nothing moves. Paused: springs settle on the current values,
    /// nothing else changes. Otherwise synth mode evolves the values, then
    /// every sensor records a history sample and steps its spring. Time
    /// advances by `speed` frames; only synth mode moves the tick counter.
    pub fn tick(&mut self) {
        if self.status != EngineStatus::Live || !self.visible {
            return;
        }
        let dt = self.speed;

        if self.paused {
            for record in &self.state.sensors {
                if let Some(spring) = self.springs.get_mut(&record.id) {
                    spring.step(record.value, dt, &self.spring);
                }
            }
            return;
        }

        if self.mode == EngineMode::Synth && dt > 0.0 {
            self.tick += dt;
            for record in self.state.sensors.iter_mut() {
                let baseline = *self.baselines.entry(record.id.clone()).or_insert(record.value);
                record.value = synthesize(&mut self.rng, &record.id, baseline, record.threshold, self.tick);
            }
        }

        for record in &self.state.sensors {
            self.history
                .entry(record.id.clone())
                .or_insert_with(|| HistoryBuffer::new(self.capacity))
                .push(record.value);
            self.springs
                .entry(record.id.clone())
                .or_insert_with(|| SpringState::at(record.value))
                .step(record.value, dt, &self.spring);
        }
    }

    pub fn control(&mut self, control: Control) {
        match control {
            Control::Pause(paused) => self.set_paused(paused),
            Control::Speed(speed) => self.set_speed(speed),
            Control::Visible(visible) => self.set_visible(visible),
        }
    }

    pub fn set_paused(&mut self, paused: bool) {
        if self.status != EngineStatus::Stopped {
            self.paused = paused;
        }
    }

    /// Negative or non-finite speeds clamp to 0 (frozen time).
    pub fn set_speed(&mut self, speed: f64) {
        if self.status != EngineStatus::Stopped {
            self.speed = if speed.is_finite() { speed.max(0.0) } else { 0.0 };
        }
    }

    /// Hidden views stop ticking; resuming continues without catch-up.
    pub fn set_visible(&mut self, visible: bool) {
        if self.status != EngineStatus::Stopped {
            self.visible = visible;
        }
    }

    /// Terminal and idempotent.
    pub fn stop(&mut self) {
        if self.status != EngineStatus::Stopped {
            tracing::debug!(device_id = %self.state.device_id, "Engine stopped");
            self.status = EngineStatus::Stopped;
        }
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn tick_count(&self) -> f64 {
        self.tick
    }

    /// Authoritative, un-smoothed values.
    pub fn raw(&self) -> &DashboardState {
        &self.state
    }

    pub fn history(&self, id: &str) -> Option<&HistoryBuffer> {
        self.history.get(id)
    }

    pub fn spring(&self, id: &str) -> Option<&SpringState> {
        self.springs.get(id)
    }

    /// Rendering view: spring-displayed values plus history.
    pub fn view(&self) -> DashboardView {
        let sensors = self
            .state
            .sensors
            .iter()
            .map(|record| {
                let displayed = self.springs.get(&record.id).map_or(record.value, |s| s.displayed);
                let history = self.history.get(&record.id);
                SensorView {
                    id: record.id.clone(),
                    kind: record.kind.clone(),
                    value: round2(displayed),
                    raw_value: record.value,
                    unit: record.unit.clone(),
                    threshold: record.threshold,
                    timestamp: record.timestamp.clone(),
                    danger: record.is_above_threshold(),
                    history: history.map(HistoryBuffer::to_vec).unwrap_or_default(),
                    stats: history.map(HistoryBuffer::stats).unwrap_or_default(),
                }
            })
            .collect();

        DashboardView {
            device_id: self.state.device_id.clone(),
            protocol: self.state.protocol.clone(),
            frequency: self.state.frequency.clone(),
            mode: self.mode,
            paused: self.paused,
            speed: self.speed,
            tick: self.tick,
            sensors,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            view: self.view(),
            raw: self.state.clone(),
            stopped: self.status == EngineStatus::Stopped,
        }
    }
}

/// Phase offset in ticks, stable per sensor id.
fn phase(id: &str) -> f64 {
    (id.bytes().map(u32::from).sum::<u32>() % 360) as f64
}

/// Baseline plus a per-sensor sine wave plus a small random drift, clamped
/// to `[0, max(2 * threshold, 2 * baseline + 0.1)]`.
fn synthesize(rng: &mut StdRng, id: &str, baseline: f64, threshold: f64, tick: f64) -> f64 {
    let wave = ((tick + phase(id)) * WAVE_RATE).sin() * (baseline.abs() * 0.03 + 0.02);
    let drift = rng.gen_range(-0.5..0.5) * (baseline.abs() * 0.015);
    let ceiling = (2.0 * threshold).max(2.0 * baseline + 0.1).max(0.0);
    round2((baseline + wave + drift).clamp(0.0, ceiling))
}
