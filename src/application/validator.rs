// Structural validation of a document against a reference schema
use crate::domain::document::Document;
use crate::domain::error::ParseError;
use crate::infrastructure::xml_parser::parse_xml;

/// Minimal shape extracted from a schema: the expected root element and
/// every element name declared anywhere, in declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaDescriptor {
    pub root: Option<String>,
    pub elements: Vec<String>,
}

impl SchemaDescriptor {
    pub fn parse(schema_text: &str) -> Result<Self, ParseError> {
        Ok(Self::from_schema(&parse_xml(schema_text)?))
    }

    pub fn from_schema(schema: &Document) -> Self {
        let root = schema.root_element().and_then(|schema_root| {
            if schema.local_name(schema_root) != Some("schema") {
                return None;
            }
            schema
                .child_elements(schema_root)
                .find(|child| schema.local_name(*child) == Some("element"))
                .and_then(|element| schema.attribute(element, "name"))
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        });

        let mut elements: Vec<String> = Vec::new();
        for node in schema.descendants(Document::ROOT) {
            if schema.local_name(node) != Some("element") {
                continue;
            }
            if let Some(name) = schema.attribute(node, "name").filter(|n| !n.is_empty()) {
                if !elements.iter().any(|known| known == name) {
                    elements.push(name.to_string());
                }
            }
        }

        Self { root, elements }
    }
}

/// Check `doc` against `schema`. A root mismatch is reported alone;
/// otherwise every declared element missing from the document is listed.
pub fn validate(doc: &Document, schema: &SchemaDescriptor) -> Vec<String> {
    let root_name = doc.root_name();
    if let Some(expected) = &schema.root {
        if root_name != expected {
            return vec![format!(
                "Root tag mismatch. Expected <{expected}> but found <{root_name}>."
            )];
        }
    }

    schema
        .elements
        .iter()
        .filter(|name| name.as_str() != root_name)
        .filter(|name| !doc.contains_element(name))
        .map(|name| format!("Missing required element: <{name}>"))
        .collect()
}

/// Validate against optional schema text; no schema means no violations.
pub fn validate_against(doc: &Document, schema_text: Option<&str>) -> Result<Vec<String>, ParseError> {
    match schema_text.filter(|text| !text.trim().is_empty()) {
        Some(text) => Ok(validate(doc, &SchemaDescriptor::parse(text)?)),
        None => {
            tracing::debug!("No schema provided, skipping validation");
            Ok(Vec::new())
        }
    }
}
