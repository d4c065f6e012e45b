// Device configuration form model
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfigForm {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_frequency")]
    pub frequency: String,
    #[serde(default)]
    pub sensors: Vec<SensorConfigForm>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfigForm {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub unit: String,
    pub threshold: String,
}

fn default_device_id() -> String {
    "IOT-DEVICE-001".to_string()
}

fn default_owner() -> String {
    "Admin".to_string()
}

fn default_protocol() -> String {
    "MQTT".to_string()
}

fn default_frequency() -> String {
    "60".to_string()
}

impl Default for DeviceConfigForm {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            owner: default_owner(),
            protocol: default_protocol(),
            frequency: default_frequency(),
            sensors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_defaults() {
        let form: DeviceConfigForm =
            serde_json::from_str(r#"{"sensors":[{"type":"Humidity","threshold":"60"}]}"#).unwrap();
        assert_eq!(form.device_id, "IOT-DEVICE-001");
        assert_eq!(form.protocol, "MQTT");
        assert_eq!(form.sensors[0].kind, "Humidity");
        assert_eq!(form.sensors[0].unit, "");
    }
}
