// Error taxonomy shared by the pipeline stages
use thiserror::Error;

/// Malformed XML; fatal for the document it came from.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("XML parse error at line {line}, column {column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("XML Parse Error in Merged Data: {0}")]
    MergedDocument(ParseError),

    #[error("Template parse error: {0}")]
    Template(ParseError),

    #[error("Invalid stylesheet: {0}")]
    Stylesheet(String),

    #[error("Invalid expression '{expr}': {message}")]
    Expression { expr: String, message: String },

    #[error("Transformation nested deeper than {0} levels")]
    DepthExceeded(usize),

    #[error("Transform worker failed: {0}")]
    Worker(String),
}

impl TransformError {
    pub fn expression(expr: &str, message: impl Into<String>) -> Self {
        Self::Expression {
            expr: expr.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Timeout connecting to {0}")]
    Timeout(String),

    #[error("Malformed push message: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid XML Format in {document}: {source}")]
    Parse {
        document: &'static str,
        source: ParseError,
    },

    #[error("{} validation violation(s)", .0.len())]
    Validation(Vec<String>),
}

impl PipelineError {
    /// Alert-style messages surfaced to the user.
    pub fn alerts(&self) -> Vec<String> {
        match self {
            Self::Parse { .. } => vec![self.to_string()],
            Self::Validation(violations) => violations.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_alerts() {
        let err = PipelineError::Parse {
            document: "sensor data",
            source: ParseError {
                line: 2,
                column: 5,
                message: "unexpected closing tag </A>".to_string(),
            },
        };
        let alerts = err.alerts();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains("sensor data"));
        assert!(alerts[0].contains("line 2"));

        let err = PipelineError::Validation(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "2 validation violation(s)");
        assert_eq!(err.alerts(), vec!["a", "b"]);
    }
}
