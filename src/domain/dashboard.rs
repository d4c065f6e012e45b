// Dashboard view models exposed to renderers
use super::history::HistoryStats;
use super::telemetry::DashboardState;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    Push,
    Synth,
}

/// Per-sensor rendering view. `value` is the spring-smoothed display value,
/// `raw_value` the authoritative one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorView {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: f64,
    pub raw_value: f64,
    pub unit: String,
    pub threshold: f64,
    pub timestamp: String,
    pub danger: bool,
    pub history: Vec<f64>,
    pub stats: HistoryStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardView {
    pub device_id: String,
    pub protocol: String,
    pub frequency: String,
    pub mode: EngineMode,
    pub paused: bool,
    pub speed: f64,
    pub tick: f64,
    pub sensors: Vec<SensorView>,
}

/// Immutable pair published to session readers after every engine step.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub view: DashboardView,
    pub raw: DashboardState,
    pub stopped: bool,
}
