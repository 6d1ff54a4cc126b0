use std::path::Path;

use async_trait::async_trait;

use super::DocumentExtractor;
use crate::errors::CollaboratorError;

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "text", "csv", "rst"];

/// Reads plain-text attachments. Binary formats are reported as unavailable.
#[derive(Debug, Default)]
pub struct PlainTextExtractor;

#[async_trait]
impl DocumentExtractor for PlainTextExtractor {
    async fn extract(&self, path: &Path) -> Result<String, CollaboratorError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        if !TEXT_EXTENSIONS.contains(&ext.as_str()) {
            return Err(CollaboratorError::Unavailable(format!(
                "no extractor for '{}' attachments: {}",
                ext,
                path.display()
            )));
        }

        let bytes = tokio::fs::read(path).await.map_err(|e| {
            CollaboratorError::Unavailable(format!("failed to read {}: {}", path.display(), e))
        })?;
        Ok(String::from_utf8_lossy(&bytes).trim().to_string())
    }
}
