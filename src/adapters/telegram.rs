//! Telegram Bot API adapter for fetching voice files.
//!
//! Messages ingested from Telegram carry only a `file_id`. The transcription
//! worker resolves it with `getFile` and downloads the binary into the
//! staging directory before calling the transcriber.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Errors talking to the Telegram Bot API
#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("Telegram API error: {0}")]
    Api(String),

    #[error("Telegram file {0} has no downloadable path")]
    MissingFilePath(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// File metadata returned by `getFile`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TelegramFile {
    pub file_id: String,
    #[serde(default)]
    pub file_unique_id: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    /// Path for the file download endpoint
    #[serde(default)]
    pub file_path: Option<String>,
}

/// Response from Telegram API
#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

/// File lookup and download, the part of the Bot API the worker needs
#[async_trait]
pub trait TelegramFiles: Send + Sync {
    /// Resolve a `file_id` to its metadata
    async fn get_file(&self, file_id: &str) -> Result<TelegramFile, TelegramError>;

    /// Download `remote_path` to `dest`, returning the byte count
    async fn download_file(&self, remote_path: &str, dest: &Path) -> Result<u64, TelegramError>;
}

/// Telegram Bot API client
pub struct TelegramClient {
    /// Bot token
    bot_token: String,
    /// API base, `https://api.telegram.org` unless self-hosted
    api_base: String,
    /// HTTP client
    client: reqwest::Client,
}

impl TelegramClient {
    /// Create a new Telegram client
    pub fn new(bot_token: String, api_base: String, timeout: std::time::Duration) -> Result<Self, TelegramError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            bot_token,
            api_base: api_base.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Build API URL
    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// Build file download URL
    fn file_url(&self, remote_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_base, self.bot_token, remote_path)
    }
}

#[async_trait]
impl TelegramFiles for TelegramClient {
    async fn get_file(&self, file_id: &str) -> Result<TelegramFile, TelegramError> {
        let response = self
            .client
            .get(self.api_url("getFile"))
            .query(&[("file_id", file_id)])
            .send()
            .await?;

        let result: TelegramResponse<TelegramFile> = response.json().await?;

        if !result.ok {
            return Err(TelegramError::Api(result.description.unwrap_or_default()));
        }

        result
            .result
            .ok_or_else(|| TelegramError::MissingFilePath(file_id.to_string()))
    }

    async fn download_file(&self, remote_path: &str, dest: &Path) -> Result<u64, TelegramError> {
        let mut response = self
            .client
            .get(self.file_url(remote_path))
            .send()
            .await?
            .error_for_status()?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write to a sibling temp name so a partial download never looks complete
        let partial = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, dest).await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base: &str) -> TelegramClient {
        TelegramClient::new("TOKEN".to_string(), base.to_string(), std::time::Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_api_url() {
        let client = client("https://api.telegram.org/");
        assert_eq!(client.api_url("getFile"), "https://api.telegram.org/botTOKEN/getFile");
        assert_eq!(
            client.file_url("voice/file_7.oga"),
            "https://api.telegram.org/file/botTOKEN/voice/file_7.oga"
        );
    }

    #[tokio::test]
    async fn test_get_file_and_download() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/botTOKEN/getFile"))
            .and(query_param("file_id", "AwACAgI"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "result": { "file_id": "AwACAgI", "file_size": 4, "file_path": "voice/file_7.oga" }
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/file/botTOKEN/voice/file_7.oga"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"OggS".to_vec()))
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let file = client.get_file("AwACAgI").await.unwrap();
        assert_eq!(file.file_path.as_deref(), Some("voice/file_7.oga"));

        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("staging").join("m1.oga");
        let written = client
            .download_file(file.file_path.as_deref().unwrap(), &dest)
            .await
            .unwrap();

        assert_eq!(written, 4);
        assert_eq!(std::fs::read(&dest).unwrap(), b"OggS");
    }

    #[tokio::test]
    async fn test_api_error_is_reported() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/botTOKEN/getFile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": false,
                "description": "Bad Request: file is too big"
            })))
            .mount(&server)
            .await;

        let err = client(&server.uri()).get_file("big").await.unwrap_err();
        assert!(matches!(err, TelegramError::Api(ref d) if d.contains("too big")), "got: {err}");
    }
}
