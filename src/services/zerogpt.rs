use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{OriginalityDetector, classify_http_error, classify_status};
use crate::errors::CollaboratorError;

const DEFAULT_BASE_URL: &str = "https://api.zerogpt.com";

/// AI-likelihood scoring through the ZeroGPT detection endpoint.
pub struct ZeroGptDetector {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<DetectData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectData {
    fake_percentage: Option<f64>,
}

impl ZeroGptDetector {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl OriginalityDetector for ZeroGptDetector {
    async fn score(&self, text: &str) -> Result<f64, CollaboratorError> {
        let resp = self
            .client
            .post(format!("{}/api/detect/detectText", self.base_url))
            .header("Accept", "application/json")
            .json(&serde_json::json!({ "input_text": text }))
            .send()
            .await
            .map_err(|e| classify_http_error(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp.headers().get(reqwest::header::RETRY_AFTER).cloned();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after.as_ref(), &body));
        }

        let parsed: DetectResponse = resp.json().await.map_err(|e| classify_http_error(&e))?;
        extract_score(parsed)
    }
}

fn extract_score(response: DetectResponse) -> Result<f64, CollaboratorError> {
    if !response.success {
        return Err(CollaboratorError::Malformed(
            response
                .message
                .unwrap_or_else(|| "detection reported failure".to_string()),
        ));
    }
    response
        .data
        .and_then(|d| d.fake_percentage)
        .ok_or_else(|| CollaboratorError::Malformed("response had no fakePercentage".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_fake_percentage() {
        let parsed: DetectResponse =
            serde_json::from_str(r#"{"success": true, "data": {"fakePercentage": 42.5, "isHuman": 57}}"#)
                .unwrap();
        assert_eq!(extract_score(parsed).unwrap(), 42.5);
    }

    #[test]
    fn unsuccessful_detection_is_malformed() {
        let parsed: DetectResponse =
            serde_json::from_str(r#"{"success": false, "message": "text too short"}"#).unwrap();
        match extract_score(parsed) {
            Err(CollaboratorError::Malformed(msg)) => assert_eq!(msg, "text too short"),
            other => panic!("Expected Malformed, got {:?}", other),
        }
    }
}
