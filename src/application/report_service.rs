// Report transformation - merges config and sensor XML and renders a template
use crate::domain::document::Document;
use crate::domain::error::TransformError;
use crate::infrastructure::xml_parser::{parse_template, parse_xml};
use regex::Regex;
use std::sync::Arc;

/// Shown when any of the three inputs is missing.
pub const WAITING_FRAGMENT: &str = "<p>Waiting for data...</p>";

/// Renders a data document through a template document.
pub trait TemplateEngine: Send + Sync {
    fn apply_template(&self, data: &Document, template: &Document) -> Result<String, TransformError>;
}

#[derive(Clone)]
pub struct ReportService {
    engine: Arc<dyn TemplateEngine>,
    prolog: Regex,
}

impl ReportService {
    pub fn new(engine: Arc<dyn TemplateEngine>) -> Result<Self, regex::Error> {
        Ok(Self {
            engine,
            prolog: Regex::new(r"<\?xml.*?\?>")?,
        })
    }

    /// Produce an HTML fragment. Failures never propagate: they are rendered
    /// as an error block so the caller always has something to display.
    pub fn render(&self, config_xml: Option<&str>, sensor_xml: Option<&str>, template_xml: Option<&str>) -> String {
        let (Some(config), Some(sensor), Some(template)) =
            (non_empty(config_xml), non_empty(sensor_xml), non_empty(template_xml))
        else {
            return WAITING_FRAGMENT.to_string();
        };

        match self.try_render(config, sensor, template) {
            Ok(html) => html,
            Err(err) => {
                tracing::error!(error = %err, "Report transformation failed");
                error_fragment(&err.to_string())
            }
        }
    }

    fn try_render(&self, config: &str, sensor: &str, template: &str) -> Result<String, TransformError> {
        let merged = self.merge_documents(config, sensor);
        let data = parse_xml(&merged).map_err(TransformError::MergedDocument)?;
        let template = parse_template(template).map_err(TransformError::Template)?;
        self.engine.apply_template(&data, &template)
    }

    /// Wrap both documents under a synthetic `<Payload>` root, dropping each
    /// one's leading XML declaration.
    pub fn merge_documents(&self, config: &str, sensor: &str) -> String {
        let config = self.prolog.replace(config, "");
        let sensor = self.prolog.replace(sensor, "");
        format!("<Payload>\n{config}\n{sensor}\n</Payload>")
    }
}

fn non_empty(text: Option<&str>) -> Option<&str> {
    text.filter(|t| !t.trim().is_empty())
}

pub fn error_fragment(message: &str) -> String {
    format!(
        "<div style=\"color:red; padding:20px; border:1px solid red;\"><h3>Transformation Error</h3><p>{}</p></div>",
        html_escape::encode_text(message)
    )
}
