// Telemetry data domain models
use serde::{Deserialize, Serialize};

/// Normalized per-sensor snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: f64,
    pub unit: String,
    pub threshold: f64,
    pub timestamp: String,
}

impl SensorRecord {
    pub fn is_above_threshold(&self) -> bool {
        self.value > self.threshold
    }

    /// Overlay the fields present in `update`; absent fields keep their value.
    pub fn overlay(&mut self, update: &SensorUpdate) {
        if let Some(kind) = &update.kind {
            self.kind = kind.clone();
        }
        if let Some(value) = update.value {
            self.value = value;
        }
        if let Some(unit) = &update.unit {
            self.unit = unit.clone();
        }
        if let Some(threshold) = update.threshold {
            self.threshold = threshold;
        }
        if let Some(timestamp) = &update.timestamp {
            self.timestamp = timestamp.clone();
        }
    }
}

/// Device metadata plus the ordered sensor records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardState {
    pub device_id: String,
    pub protocol: String,
    pub frequency: String,
    pub sensors: Vec<SensorRecord>,
}

impl DashboardState {
    pub fn sensor_ids(&self) -> impl Iterator<Item = &str> {
        self.sensors.iter().map(|s| s.id.as_str())
    }
}

/// Partial sensor update carried by a push message.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorUpdate {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub threshold: Option<f64>,
    pub timestamp: Option<String>,
}

/// Inbound push-channel message. Sensor entries stay undecoded so each one
/// can be accepted or rejected on its own.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub device_id: Option<String>,
    pub sensors: Option<Vec<serde_json::Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SensorRecord {
        SensorRecord {
            id: "dev-0".to_string(),
            kind: "Temperature".to_string(),
            value: 72.0,
            unit: "°F".to_string(),
            threshold: 80.0,
            timestamp: "10:00:00".to_string(),
        }
    }

    #[test]
    fn test_overlay_keeps_missing_fields() {
        let mut rec = record();
        rec.overlay(&SensorUpdate {
            id: "dev-0".to_string(),
            value: Some(91.5),
            ..Default::default()
        });
        assert_eq!(rec.value, 91.5);
        assert_eq!(rec.unit, "°F");
        assert_eq!(rec.threshold, 80.0);
        assert!(rec.is_above_threshold());
    }

    #[test]
    fn test_json_field_names() {
        let state = DashboardState {
            device_id: "dev".to_string(),
            protocol: "MQTT".to_string(),
            frequency: "60".to_string(),
            sensors: vec![record()],
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["deviceId"], "dev");
        assert_eq!(json["sensors"][0]["type"], "Temperature");
    }

    #[test]
    fn test_push_message_parses_partial_updates() {
        let msg: PushMessage =
            serde_json::from_str(r#"{"sensors":[{"id":"dev-0","threshold":90},{"value":1}]}"#).unwrap();
        let mut sensors = msg.sensors.unwrap().into_iter();
        let update: SensorUpdate = serde_json::from_value(sensors.next().unwrap()).unwrap();
        assert_eq!(update.threshold, Some(90.0));
        assert!(update.value.is_none());
        assert!(serde_json::from_value::<SensorUpdate>(sensors.next().unwrap()).is_err());
        assert!(msg.device_id.is_none());
    }
}
