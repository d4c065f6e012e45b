// Threshold analysis - joins sensor readings with configured thresholds
use crate::domain::document::{Document, NodeId};
use crate::domain::telemetry::{DashboardState, SensorRecord};
use std::collections::{HashMap, HashSet};

/// Threshold recorded for sensors without a configuration entry, keeps
/// gauges on a finite scale.
pub const DEFAULT_THRESHOLD: f64 = 100.0;

#[derive(Debug, Clone)]
pub struct Analysis {
    pub dashboard: DashboardState,
    pub alerts: Vec<String>,
}

/// Configuration entry matched to a reading.
struct SensorConfig {
    unit: String,
    threshold: Option<f64>,
}

/// Cross-reference `sensor` readings against `config` thresholds.
///
/// Never fails: absent metadata falls back to placeholders, unmatched sensors
/// get no unit and never alert.
pub fn analyze(config: &Document, sensor: &Document) -> Analysis {
    let device_id = text_or(config, "DeviceId", "Unknown");
    let protocol = text_or(config, "Protocol", "N/A");
    let frequency = text_or(config, "Frequency", "N/A");

    let index = index_by_type(config);
    let timestamp = chrono::Local::now().format("%H:%M:%S").to_string();

    let mut alerts = Vec::new();
    let mut sensors = Vec::new();
    let mut used_ids = HashSet::new();

    for (position, reading) in sensor.descendants_named(Document::ROOT, "Reading").into_iter().enumerate() {
        let kind = sensor.attribute(reading, "type").unwrap_or_default().to_string();
        let value = reading_value(sensor, reading, &kind);

        let entry = index.get(kind.as_str()).map(|node| sensor_config(config, *node));
        let unit = entry.as_ref().map(|e| e.unit.clone()).unwrap_or_default();
        let threshold = entry.as_ref().and_then(|e| e.threshold);

        if let Some(limit) = threshold {
            if value > limit {
                alerts.push(format!("⚠️ {kind} is {value} {unit} (Threshold: {limit} {unit})"));
            }
        }

        let id = assign_id(sensor.attribute(reading, "id"), &device_id, position, &mut used_ids);
        sensors.push(SensorRecord {
            id,
            kind,
            value,
            unit,
            threshold: threshold.unwrap_or(DEFAULT_THRESHOLD),
            timestamp: timestamp.clone(),
        });
    }

    tracing::debug!(
        device_id = %device_id,
        sensors = sensors.len(),
        alerts = alerts.len(),
        "Analysis complete"
    );

    Analysis {
        dashboard: DashboardState {
            device_id,
            protocol,
            frequency,
            sensors,
        },
        alerts,
    }
}

fn text_or(doc: &Document, name: &str, fallback: &str) -> String {
    doc.first_text(Document::ROOT, name)
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// First `SensorConfig` per type wins; later duplicates are ignored.
fn index_by_type(config: &Document) -> HashMap<&str, NodeId> {
    let mut index = HashMap::new();
    for node in config.descendants_named(Document::ROOT, "SensorConfig") {
        if let Some(kind) = config.attribute(node, "type") {
            index.entry(kind).or_insert(node);
        }
    }
    index
}

fn sensor_config(config: &Document, node: NodeId) -> SensorConfig {
    let unit = config.first_text(node, "Unit").unwrap_or_default();
    let threshold = config
        .first_text(node, "Threshold")
        .or_else(|| config.first_text(node, "Max"))
        .and_then(|text| parse_number(&text));
    SensorConfig { unit, threshold }
}

fn reading_value(sensor: &Document, reading: NodeId, kind: &str) -> f64 {
    match sensor.first_text(reading, "Value").as_deref().and_then(parse_number) {
        Some(value) => value,
        None => {
            tracing::warn!(sensor_type = %kind, "Reading has no numeric <Value>, using 0");
            0.0
        }
    }
}

fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Explicit ids are kept when unique; otherwise `{device}-{position}`,
/// suffixed until unique.
fn assign_id(explicit: Option<&str>, device_id: &str, position: usize, used: &mut HashSet<String>) -> String {
    if let Some(id) = explicit.filter(|id| !id.is_empty()) {
        if used.insert(id.to_string()) {
            return id.to_string();
        }
    }
    let derived = format!("{device_id}-{position}");
    let mut candidate = derived.clone();
    let mut suffix = 2;
    while !used.insert(candidate.clone()) {
        candidate = format!("{derived}-{suffix}");
        suffix += 1;
    }
    candidate
}
