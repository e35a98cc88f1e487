//! Whisper transcription backend.
//!
//! Shells out to a local whisper binary for transcription.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::{ProviderError, Transcriber, Transcript};
use crate::domain::TranscriptSegment;

/// Transcriber backed by the `whisper` CLI
#[derive(Debug, Clone)]
pub struct WhisperTranscriber {
    binary: String,
    model: String,
    language: Option<String>,
}

/// Whisper output JSON structure
#[derive(Debug, Deserialize)]
struct WhisperOutput {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<TranscriptSegment>,
}

impl WhisperTranscriber {
    pub fn new(binary: impl Into<String>, model: impl Into<String>, language: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            model: model.into(),
            language,
        }
    }

    fn parse_output(json: &str) -> Result<Transcript, ProviderError> {
        let whisper: WhisperOutput = serde_json::from_str(json)
            .map_err(|e| ProviderError::Other(format!("failed to parse whisper JSON: {e}")))?;

        let duration = whisper.segments.last().map(|s| s.end);

        Ok(Transcript {
            text: whisper.text.trim().to_string(),
            segments: whisper.segments,
            language: whisper.language.filter(|l| !l.is_empty()),
            duration_seconds: duration,
        })
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    fn server_name(&self) -> &str {
        "whisper-local"
    }

    fn credential(&self) -> Option<&str> {
        None
    }

    async fn transcribe(&self, audio_path: &Path) -> Result<Transcript, ProviderError> {
        // Whisper writes <stem>.json into its output dir
        let temp_dir = tempfile::tempdir()
            .map_err(|e| ProviderError::Other(format!("failed to create temp dir: {e}")))?;

        let mut command = Command::new(&self.binary);
        command
            .arg(audio_path)
            .arg("--model")
            .arg(&self.model)
            .arg("--output_dir")
            .arg(temp_dir.path())
            .arg("--output_format")
            .arg("json");
        if let Some(language) = &self.language {
            command.arg("--language").arg(language);
        }

        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ProviderError::Transport(format!("failed to run {}: {e}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Other(format!("whisper failed: {}", stderr.trim())));
        }

        let stem = audio_path.file_stem().unwrap_or_default().to_string_lossy();
        let json_path = temp_dir.path().join(format!("{}.json", stem));

        let json = tokio::fs::read_to_string(&json_path)
            .await
            .map_err(|e| ProviderError::Other(format!("failed to read whisper output: {e}")))?;

        Self::parse_output(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_output() {
        let json = r#"{
            "text": "  first part. second part. ",
            "language": "en",
            "segments": [
                { "id": 0, "start": 0.0, "end": 1.5, "text": "first part." },
                { "id": 1, "start": 1.5, "end": 3.25, "text": "second part." }
            ]
        }"#;

        let transcript = WhisperTranscriber::parse_output(json).unwrap();
        assert_eq!(transcript.text, "first part. second part.");
        assert_eq!(transcript.segments.len(), 2);
        assert_eq!(transcript.duration_seconds, Some(3.25));
        assert_eq!(transcript.language.as_deref(), Some("en"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_transport_error() {
        let whisper = WhisperTranscriber::new("/nonexistent/whisper-bin", "base", None);
        let err = whisper
            .transcribe(Path::new("/tmp/does-not-matter.ogg"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Transport(_)), "got: {err}");
    }
}
