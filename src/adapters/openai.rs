//! OpenAI-compatible HTTP provider.
//!
//! Speech-to-text goes through `POST {base}/audio/transcriptions` with
//! `response_format=verbose_json`, categorization through
//! `POST {base}/chat/completions` with a JSON response format.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{Categorizer, ProviderError, Transcriber, Transcript};
use crate::domain::TranscriptSegment;

const CATEGORIZATION_PROMPT: &str = "You split a voice note transcript into topical fragments. \
Reply with a JSON object {\"categories\": [...]} where each item has \
\"text\", \"topic\" and \"keywords\" (array of strings).";

/// Client for an OpenAI-compatible API
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    server_name: String,
}

/// Error envelope returned by the API
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default, rename = "type")]
    type_: Option<String>,
}

/// `verbose_json` transcription response
#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    segments: Vec<TranscriptSegment>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    /// Create a client for `base_url` (e.g. `https://api.openai.com/v1`)
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Other(format!("failed to build HTTP client: {e}")))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        let server_name = reqwest::Url::parse(&base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| base_url.clone());

        Ok(Self {
            client,
            base_url,
            api_key,
            model: model.into(),
            server_name,
        })
    }

    /// Override the server identity recorded in failure context
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Turn a non-success response into a classified error
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ApiErrorResponse>(&body) {
            Ok(api) => (api.error.code.or(api.error.type_), api.error.message),
            Err(_) => (None, body),
        };
        debug!(status = %status, code = ?code, "provider returned error");
        Err(ProviderError::from_status(status.as_u16(), code, message))
    }
}

#[async_trait]
impl Transcriber for OpenAiClient {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn credential(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    async fn transcribe(&self, audio_path: &Path) -> Result<Transcript, ProviderError> {
        let file_name = audio_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let bytes = tokio::fs::read(audio_path)
            .await
            .map_err(|e| ProviderError::Other(format!("failed to read {}: {e}", audio_path.display())))?;

        let form = Form::new()
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .part("file", Part::bytes(bytes).file_name(file_name));

        let response = self
            .authorized(self.client.post(self.url("audio/transcriptions")))
            .multipart(form)
            .send()
            .await?;

        let parsed: TranscriptionResponse = Self::check(response).await?.json().await?;

        Ok(Transcript {
            text: parsed.text.trim().to_string(),
            segments: parsed.segments,
            language: parsed.language,
            duration_seconds: parsed.duration,
        })
    }
}

#[async_trait]
impl Categorizer for OpenAiClient {
    async fn categorize(&self, text: &str) -> Result<Vec<Value>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": CATEGORIZATION_PROMPT },
                { "role": "user", "content": text },
            ],
        });

        let response = self
            .authorized(self.client.post(self.url("chat/completions")))
            .json(&body)
            .send()
            .await?;

        let parsed: ChatResponse = Self::check(response).await?.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Other("empty completion".to_string()))?;

        let value: Value = serde_json::from_str(&content)
            .map_err(|e| ProviderError::Other(format!("completion is not JSON: {e}")))?;

        match value {
            Value::Array(rows) => Ok(rows),
            Value::Object(mut map) => match map.remove("categories") {
                Some(Value::Array(rows)) => Ok(rows),
                _ => Err(ProviderError::Other("completion has no categories array".to_string())),
            },
            _ => Err(ProviderError::Other("completion has no categories array".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: &str) -> OpenAiClient {
        OpenAiClient::new(
            base_url,
            Some("sk-test-1234567890".to_string()),
            "whisper-1",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn audio_file() -> tempfile::NamedTempFile {
        let file = tempfile::Builder::new().suffix(".ogg").tempfile().unwrap();
        std::fs::write(file.path(), b"OggS fake audio").unwrap();
        file
    }

    #[tokio::test]
    async fn test_transcribe_success() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/audio/transcriptions"))
            .and(header("authorization", "Bearer sk-test-1234567890"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "text": " hello there ",
                "language": "english",
                "duration": 2.5,
                "segments": [{ "id": 0, "start": 0.0, "end": 2.5, "text": "hello there" }]
            })))
            .mount(&server)
            .await;

        let audio = audio_file();
        let transcript = test_client(&server.uri())
            .transcribe(audio.path())
            .await
            .unwrap();

        assert_eq!(transcript.text, "hello there");
        assert_eq!(transcript.segments.len(), 1);
        assert_eq!(transcript.duration_seconds, Some(2.5));
    }

    #[tokio::test]
    async fn test_insufficient_quota_is_classified() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/audio/transcriptions"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": {
                    "message": "You exceeded your current quota",
                    "type": "insufficient_quota",
                    "code": "insufficient_quota"
                }
            })))
            .mount(&server)
            .await;

        let audio = audio_file();
        let err = test_client(&server.uri())
            .transcribe(audio.path())
            .await
            .unwrap_err();

        assert!(err.is_quota(), "got: {err}");
        assert_eq!(err.code(), Some("insufficient_quota"));
        assert_eq!(err.http_status(), Some(429));
    }

    #[tokio::test]
    async fn test_server_error_is_not_quota() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/audio/transcriptions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
            .mount(&server)
            .await;

        let audio = audio_file();
        let err = test_client(&server.uri())
            .transcribe(audio.path())
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Http { status: 503, .. }), "got: {err}");
    }

    #[tokio::test]
    async fn test_categorize_reads_categories() {
        let server = MockServer::start().await;

        let content = serde_json::json!({
            "categories": [{ "text": "buy milk", "topic": "errands", "keywords": ["milk"] }]
        })
        .to_string();

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": content } }]
            })))
            .mount(&server)
            .await;

        let rows = test_client(&server.uri()).categorize("buy milk").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["topic"], "errands");
    }

    #[test]
    fn test_server_name_from_base_url() {
        let client = test_client("https://api.openai.com/v1/");
        assert_eq!(client.server_name(), "api.openai.com");
        assert_eq!(client.url("audio/transcriptions"), "https://api.openai.com/v1/audio/transcriptions");
    }
}
