// Text source loading - schemas and templates from HTTP or the filesystem
use anyhow::{Context, Result};
use async_trait::async_trait;

#[async_trait]
pub trait TextSource: Send + Sync {
    /// Fetch the full text at `location`.
    async fn fetch(&self, location: &str) -> Result<String>;
}

/// `http://` and `https://` locations go through reqwest, everything else
/// is read from disk.
#[derive(Debug, Clone, Default)]
pub struct HttpOrFileSource {
    client: reqwest::Client,
}

impl HttpOrFileSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TextSource for HttpOrFileSource {
    async fn fetch(&self, location: &str) -> Result<String> {
        if location.starts_with("http://") || location.starts_with("https://") {
            let response = self
                .client
                .get(location)
                .send()
                .await
                .with_context(|| format!("Failed to request {location}"))?;

            if !response.status().is_success() {
                let status = response.status();
                anyhow::bail!("Fetching {} failed with status {}", location, status);
            }

            return response
                .text()
                .await
                .with_context(|| format!("Failed to read body of {location}"));
        }

        tokio::fs::read_to_string(location)
            .await
            .with_context(|| format!("Failed to read {location}"))
    }
}

/// Load an optional source. Missing or unreadable sources are logged and
/// yield `None`; the caller degrades instead of failing.
pub async fn load_optional(source: &dyn TextSource, label: &str, location: Option<&str>) -> Option<String> {
    let Some(location) = location.filter(|l| !l.trim().is_empty()) else {
        tracing::warn!(source = label, "No location configured");
        return None;
    };

    match source.fetch(location).await {
        Ok(text) => {
            tracing::info!(source = label, location = %location, bytes = text.len(), "Loaded source");
            Some(text)
        }
        Err(e) => {
            tracing::warn!(source = label, location = %location, error = %e, "Source unavailable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_files() {
        let path = std::env::temp_dir().join(format!("iot-source-{}.xsd", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, "<xs:schema/>").await.unwrap();

        let source = HttpOrFileSource::new();
        let location = path.to_string_lossy().to_string();
        let text = load_optional(&source, "sensor schema", Some(&location)).await;
        assert_eq!(text.as_deref(), Some("<xs:schema/>"));

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_sources_degrade_to_none() {
        let source = HttpOrFileSource::new();
        assert!(load_optional(&source, "template", None).await.is_none());
        assert!(load_optional(&source, "template", Some("")).await.is_none());
        assert!(
            load_optional(&source, "template", Some("/definitely/not/here.xsl"))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_error_names_location() {
        let err = HttpOrFileSource::new().fetch("/nope/config.xsd").await.unwrap_err();
        assert!(err.to_string().contains("/nope/config.xsd"));
    }
}
