// Pipeline service - parse, validate, analyze and render in one pass
use crate::application::analyzer::analyze;
use crate::application::report_service::ReportService;
use crate::application::validator::validate_against;
use crate::domain::document::Document;
use crate::domain::error::PipelineError;
use crate::domain::telemetry::DashboardState;
use crate::infrastructure::xml_parser::parse_xml;
use serde::Serialize;

/// Reference texts loaded once at startup. Any of them may be absent.
#[derive(Debug, Clone, Default)]
pub struct PipelineSources {
    pub config_schema: Option<String>,
    pub sensor_schema: Option<String>,
    pub template: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutcome {
    pub dashboard: DashboardState,
    pub alerts: Vec<String>,
    pub report: String,
}

#[derive(Clone)]
pub struct PipelineService {
    sources: PipelineSources,
    reports: ReportService,
}

impl PipelineService {
    pub fn new(sources: PipelineSources, reports: ReportService) -> Self {
        Self { sources, reports }
    }

    /// Run the full pipeline over a config document and a sensor document.
    ///
    /// A parse failure aborts with the name of the offending document.
    /// Validation violations abort with the combined list, config first.
    pub fn run(&self, config_xml: &str, sensor_xml: &str) -> Result<PipelineOutcome, PipelineError> {
        // 1. Parse both documents
        let config = parse_document("config data", config_xml)?;
        let sensor = parse_document("sensor data", sensor_xml)?;

        // 2. Structural validation
        self.validate(&config, &sensor)?;

        // 3. Threshold analysis
        let analysis = analyze(&config, &sensor);
        tracing::info!(
            device_id = %analysis.dashboard.device_id,
            sensors = analysis.dashboard.sensors.len(),
            alerts = analysis.alerts.len(),
            "Pipeline analysis complete"
        );

        // 4. Report
        let report = self.render(Some(config_xml), Some(sensor_xml));

        Ok(PipelineOutcome {
            dashboard: analysis.dashboard,
            alerts: analysis.alerts,
            report,
        })
    }

    /// Render the report alone with the loaded template.
    ///
    /// When both documents are present they pass the same parse and
    /// validation gate as [`PipelineService::run`]; a missing one yields the
    /// waiting fragment.
    pub fn report(&self, config_xml: Option<&str>, sensor_xml: Option<&str>) -> Result<String, PipelineError> {
        if let (Some(config_text), Some(sensor_text)) = (non_blank(config_xml), non_blank(sensor_xml)) {
            let config = parse_document("config data", config_text)?;
            let sensor = parse_document("sensor data", sensor_text)?;
            self.validate(&config, &sensor)?;
        }
        Ok(self.render(config_xml, sensor_xml))
    }

    /// Config violations first, then sensor violations.
    fn validate(&self, config: &Document, sensor: &Document) -> Result<(), PipelineError> {
        let mut violations = check("config schema", config, self.sources.config_schema.as_deref())?;
        violations.extend(check("sensor schema", sensor, self.sources.sensor_schema.as_deref())?);
        if violations.is_empty() {
            return Ok(());
        }
        tracing::info!(violations = violations.len(), "Documents failed validation");
        Err(PipelineError::Validation(violations))
    }

    fn render(&self, config_xml: Option<&str>, sensor_xml: Option<&str>) -> String {
        self.reports
            .render(config_xml, sensor_xml, self.sources.template.as_deref())
    }
}

fn non_blank(text: Option<&str>) -> Option<&str> {
    text.filter(|t| !t.trim().is_empty())
}

fn parse_document(document: &'static str, text: &str) -> Result<Document, PipelineError> {
    parse_xml(text).map_err(|source| {
        tracing::warn!(document, error = %source, "Document failed to parse");
        PipelineError::Parse { document, source }
    })
}

fn check(schema: &'static str, doc: &Document, schema_text: Option<&str>) -> Result<Vec<String>, PipelineError> {
    validate_against(doc, schema_text).map_err(|source| {
        tracing::warn!(document = schema, error = %source, "Schema failed to parse");
        PipelineError::Parse {
            document: schema,
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::report_service::WAITING_FRAGMENT;
    use crate::infrastructure::xslt::XsltEngine;
    use std::sync::Arc;

    const CONFIG: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<DeviceConfig>
  <MetaData><DeviceId>IOT-001</DeviceId><Protocol>MQTT</Protocol><Frequency>60</Frequency></MetaData>
  <Sensors>
    <SensorConfig type="Temperature"><Unit>°F</Unit><Threshold>80</Threshold></SensorConfig>
  </Sensors>
</DeviceConfig>"#;

    const SENSOR: &str = r#"<SensorData>
  <Reading type="Temperature"><Value>95</Value></Reading>
  <Reading type="Humidity"><Value>40</Value></Reading>
</SensorData>"#;

    const CONFIG_SCHEMA: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:element name="DeviceConfig">
    <xs:complexType><xs:sequence>
      <xs:element name="MetaData"/>
      <xs:element name="Sensors"/>
    </xs:sequence></xs:complexType>
  </xs:element>
</xs:schema>"#;

    const SENSOR_SCHEMA: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
  <xs:element name="SensorData">
    <xs:complexType><xs:sequence><xs:element name="Reading"/></xs:sequence></xs:complexType>
  </xs:element>
</xs:schema>"#;

    const TEMPLATE: &str = r#"<xsl:stylesheet version="1.0" xmlns:xsl="http://www.w3.org/1999/XSL/Transform">
  <xsl:template match="/"><b><xsl:value-of select="count(//Reading)"/></b></xsl:template>
</xsl:stylesheet>"#;

    fn service(sources: PipelineSources) -> PipelineService {
        PipelineService::new(sources, ReportService::new(Arc::new(XsltEngine)).unwrap())
    }

    fn full_sources() -> PipelineSources {
        PipelineSources {
            config_schema: Some(CONFIG_SCHEMA.to_string()),
            sensor_schema: Some(SENSOR_SCHEMA.to_string()),
            template: Some(TEMPLATE.to_string()),
        }
    }

    #[test]
    fn test_full_run() {
        let outcome = service(full_sources()).run(CONFIG, SENSOR).unwrap();
        assert_eq!(outcome.dashboard.device_id, "IOT-001");
        assert_eq!(outcome.dashboard.sensors.len(), 2);
        assert_eq!(outcome.alerts, vec!["⚠️ Temperature is 95 °F (Threshold: 80 °F)"]);
        assert_eq!(outcome.report, "<b>2</b>");
    }

    #[test]
    fn test_parse_failure_names_document() {
        let err = service(full_sources()).run(CONFIG, "<SensorData><Reading></SensorData>").unwrap_err();
        match &err {
            PipelineError::Parse { document, .. } => assert_eq!(*document, "sensor data"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.alerts()[0].starts_with("Invalid XML Format in sensor data"));
    }

    #[test]
    fn test_violations_are_combined_config_first() {
        let err = service(full_sources())
            .run("<DeviceConfig><MetaData/></DeviceConfig>", "<SensorData/>")
            .unwrap_err();
        assert_eq!(
            err.alerts(),
            vec![
                "Missing required element: <Sensors>".to_string(),
                "Missing required element: <Reading>".to_string(),
            ]
        );
    }

    #[test]
    fn test_malformed_schema_aborts() {
        let sources = PipelineSources {
            config_schema: Some("<xs:schema".to_string()),
            ..full_sources()
        };
        let err = service(sources).run(CONFIG, SENSOR).unwrap_err();
        assert!(matches!(err, PipelineError::Parse { document: "config schema", .. }));
    }

    #[test]
    fn test_report_is_gated_by_validation() {
        let service = service(full_sources());
        assert_eq!(service.report(Some(CONFIG), Some(SENSOR)).unwrap(), "<b>2</b>");

        let err = service
            .report(Some("<DeviceConfig><MetaData/></DeviceConfig>"), Some(SENSOR))
            .unwrap_err();
        assert_eq!(err.alerts(), vec!["Missing required element: <Sensors>".to_string()]);

        let err = service.report(Some(CONFIG), Some("<SensorData>")).unwrap_err();
        assert!(matches!(err, PipelineError::Parse { document: "sensor data", .. }));
    }

    #[test]
    fn test_report_waits_for_both_documents() {
        let service = service(full_sources());
        assert_eq!(service.report(None, Some(SENSOR)).unwrap(), WAITING_FRAGMENT);
        assert_eq!(service.report(Some(CONFIG), Some(" ")).unwrap(), WAITING_FRAGMENT);
    }

    fn bundled_sources() -> PipelineSources {
        PipelineSources {
            config_schema: Some(include_str!("../../config/xsd/device_config.xsd").to_string()),
            sensor_schema: Some(include_str!("../../config/xsd/sensor_data.xsd").to_string()),
            template: Some(include_str!("../../config/xslt/sensor_to_html.xslt").to_string()),
        }
    }

    #[test]
    fn test_bundled_schemas_and_template() {
        let service = service(bundled_sources());
        let report = service.run(CONFIG, SENSOR).unwrap().report;
        assert!(report.contains("<h2>Device Report: IOT-001</h2>"), "{report}");
        assert!(report.contains("Protocol: MQTT | Frequency: 60s"), "{report}");
        assert!(report.contains("<td>Temperature</td><td>95 °F</td><td>80</td><td>ALERT</td>"), "{report}");
        assert!(report.contains("<td>Humidity</td><td>40</td><td>100</td><td>OK</td>"), "{report}");
        assert!(report.find("Humidity") < report.find("Temperature"));
        assert!(report.contains("2 readings"));

        let err = service
            .run("<DeviceConfig><MetaData><DeviceId>x</DeviceId></MetaData></DeviceConfig>", SENSOR)
            .unwrap_err();
        assert_eq!(
            err.alerts(),
            vec![
                "Missing required element: <Protocol>".to_string(),
                "Missing required element: <Frequency>".to_string(),
                "Missing required element: <Sensors>".to_string(),
                "Missing required element: <SensorConfig>".to_string(),
                "Missing required element: <Unit>".to_string(),
                "Missing required element: <Threshold>".to_string(),
            ]
        );
    }

    #[test]
    fn test_missing_sources_skip_validation_and_report() {
        let outcome = service(PipelineSources::default()).run(CONFIG, SENSOR).unwrap();
        assert_eq!(outcome.alerts.len(), 1);
        assert_eq!(outcome.report, WAITING_FRAGMENT);
    }
}
