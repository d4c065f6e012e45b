// Dashboard export formats - JSON document and flat CSV table
use crate::domain::telemetry::DashboardState;

pub const CSV_HEADER: &str = "id,type,value,threshold,unit";

pub fn to_json(state: &DashboardState) -> serde_json::Result<String> {
    serde_json::to_string_pretty(state)
}

/// One row per sensor, in state order.
pub fn to_csv(state: &DashboardState) -> String {
    let mut lines = Vec::with_capacity(state.sensors.len() + 1);
    lines.push(CSV_HEADER.to_string());
    for sensor in &state.sensors {
        lines.push(
            [
                csv_field(&sensor.id),
                csv_field(&sensor.kind),
                sensor.value.to_string(),
                sensor.threshold.to_string(),
                csv_field(&sensor.unit),
            ]
            .join(","),
        );
    }
    lines.join("\n")
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// `sensor_data_<device>.<ext>`, falling back to `device` when the id is blank.
pub fn download_filename(device_id: &str, extension: &str) -> String {
    let device = device_id.trim();
    let device = if device.is_empty() { "device" } else { device };
    format!("sensor_data_{device}.{extension}")
}

/// `Content-Disposition` value with an ASCII-safe name plus the RFC 5987
/// encoded original.
pub fn content_disposition(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .map(|c| if c.is_ascii_graphic() && c != '"' && c != '\\' { c } else { '_' })
        .collect();
    format!(
        "attachment; filename=\"{ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::telemetry::SensorRecord;

    fn state() -> DashboardState {
        DashboardState {
            device_id: "IOT-001".to_string(),
            protocol: "MQTT".to_string(),
            frequency: "60".to_string(),
            sensors: vec![
                SensorRecord {
                    id: "IOT-001-0".to_string(),
                    kind: "Temperature".to_string(),
                    value: 95.0,
                    unit: "°F".to_string(),
                    threshold: 80.0,
                    timestamp: "10:00:00".to_string(),
                },
                SensorRecord {
                    id: "IOT-001-1".to_string(),
                    kind: "Air, \"quality\"".to_string(),
                    value: 12.5,
                    unit: String::new(),
                    threshold: 100.0,
                    timestamp: "10:00:00".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_csv_layout() {
        let csv = to_csv(&state());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "id,type,value,threshold,unit");
        assert_eq!(lines[1], "IOT-001-0,Temperature,95,80,°F");
        assert_eq!(lines[2], "IOT-001-1,\"Air, \"\"quality\"\"\",12.5,100,");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_json_uses_camel_case() {
        let json = to_json(&state()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["deviceId"], "IOT-001");
        assert_eq!(value["sensors"][0]["type"], "Temperature");
        assert_eq!(value["sensors"][0]["threshold"], 80.0);
        assert!(json.contains('\n'));
    }

    #[test]
    fn test_filenames() {
        assert_eq!(download_filename("IOT-001", "csv"), "sensor_data_IOT-001.csv");
        assert_eq!(download_filename("  ", "json"), "sensor_data_device.json");
        let header = content_disposition("sensor_data_Gerät.csv");
        assert!(header.starts_with("attachment; filename=\"sensor_data_Ger_t.csv\""));
        assert!(header.contains("filename*=UTF-8''sensor_data_Ger%C3%A4t.csv"));
    }
}
