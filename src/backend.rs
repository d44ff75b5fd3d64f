//! AI and speech-synthesis collaborators.
//!
//! The processor only depends on these traits; concrete HTTP clients live
//! with whoever embeds the crate. Every call receives the session's
//! cancellation token so a backend can abort in-flight work itself.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{ChatvoxError, Result};

/// Options forwarded to the speech synthesizer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynthesisOptions {
    /// Voice name; `None` lets the backend pick its default.
    pub voice: Option<String>,
}

/// Text-generation backend.
#[async_trait]
pub trait AiClient: Send + Sync {
    /// Answer `prompt`. Lower `priority` values are served first.
    async fn ask(&self, cancel: &CancellationToken, priority: u8, prompt: &str) -> Result<String>;
}

/// Speech-synthesis backend.
#[async_trait]
pub trait TtsClient: Send + Sync {
    /// Render `text` to encoded audio bytes.
    async fn synthesize(
        &self,
        cancel: &CancellationToken,
        text: &str,
        options: &SynthesisOptions,
    ) -> Result<Vec<u8>>;
}

/// Stand-in for a backend that has not been configured.
///
/// Every call fails, which scripts observe as an error string.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

#[async_trait]
impl AiClient for Unconfigured {
    async fn ask(&self, _cancel: &CancellationToken, _priority: u8, _prompt: &str) -> Result<String> {
        Err(ChatvoxError::Backend("ai backend not configured".to_string()))
    }
}

#[async_trait]
impl TtsClient for Unconfigured {
    async fn synthesize(
        &self,
        _cancel: &CancellationToken,
        _text: &str,
        _options: &SynthesisOptions,
    ) -> Result<Vec<u8>> {
        Err(ChatvoxError::Backend("tts backend not configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_ai_fails() {
        let err = Unconfigured
            .ask(&CancellationToken::new(), 0, "hi")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "backend error: ai backend not configured");
    }

    #[tokio::test]
    async fn test_unconfigured_tts_fails() {
        let result = Unconfigured
            .synthesize(&CancellationToken::new(), "hi", &SynthesisOptions::default())
            .await;
        assert!(matches!(result, Err(ChatvoxError::Backend(_))));
    }
}
