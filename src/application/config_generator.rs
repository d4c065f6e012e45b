// Device configuration generator - form input to a DeviceConfig document
use crate::domain::device::DeviceConfigForm;

/// Render a `DeviceConfig` document from form input. All text content and
/// attribute values are escaped.
pub fn generate_config_xml(form: &DeviceConfigForm) -> String {
    let text = |value: &str| html_escape::encode_text(value).into_owned();

    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<DeviceConfig>\n");
    xml.push_str("  <MetaData>\n");
    xml.push_str(&format!("    <DeviceId>{}</DeviceId>\n", text(&form.device_id)));
    xml.push_str(&format!("    <Owner>{}</Owner>\n", text(&form.owner)));
    xml.push_str(&format!("    <Protocol>{}</Protocol>\n", text(&form.protocol)));
    xml.push_str(&format!("    <Frequency>{}</Frequency>\n", text(&form.frequency)));
    xml.push_str("  </MetaData>\n");
    xml.push_str("  <Sensors>\n");
    for sensor in &form.sensors {
        xml.push_str(&format!(
            "    <SensorConfig type=\"{}\">\n",
            html_escape::encode_double_quoted_attribute(&sensor.kind)
        ));
        xml.push_str(&format!("      <Unit>{}</Unit>\n", text(&sensor.unit)));
        xml.push_str(&format!("      <Threshold>{}</Threshold>\n", text(&sensor.threshold)));
        xml.push_str("    </SensorConfig>\n");
    }
    xml.push_str("  </Sensors>\n");
    xml.push_str("</DeviceConfig>\n");

    tracing::debug!(device_id = %form.device_id, sensors = form.sensors.len(), "Generated device config");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::analyzer::analyze;
    use crate::domain::device::SensorConfigForm;
    use crate::infrastructure::xml_parser::parse_xml;

    #[test]
    fn test_defaults() {
        let xml = generate_config_xml(&DeviceConfigForm::default());
        let doc = parse_xml(&xml).unwrap();
        assert_eq!(doc.root_name(), "DeviceConfig");
        assert_eq!(doc.first_text(0, "DeviceId").as_deref(), Some("IOT-DEVICE-001"));
        assert_eq!(doc.first_text(0, "Owner").as_deref(), Some("Admin"));
        assert_eq!(doc.first_text(0, "Protocol").as_deref(), Some("MQTT"));
        assert_eq!(doc.first_text(0, "Frequency").as_deref(), Some("60"));
    }

    #[test]
    fn test_generated_config_drives_analysis() {
        let form = DeviceConfigForm {
            device_id: "Lab <A&B>".to_string(),
            sensors: vec![SensorConfigForm {
                kind: "Temp \"inner\"".to_string(),
                unit: "°C".to_string(),
                threshold: "30".to_string(),
            }],
            ..DeviceConfigForm::default()
        };
        let config = parse_xml(&generate_config_xml(&form)).unwrap();
        let sensor = parse_xml(
            r#"<SensorData><Reading type="Temp &quot;inner&quot;"><Value>31</Value></Reading></SensorData>"#,
        )
        .unwrap();

        let analysis = analyze(&config, &sensor);
        assert_eq!(analysis.dashboard.device_id, "Lab <A&B>");
        assert_eq!(analysis.dashboard.sensors[0].threshold, 30.0);
        assert_eq!(analysis.dashboard.sensors[0].unit, "°C");
        assert_eq!(analysis.alerts.len(), 1);
    }
}
