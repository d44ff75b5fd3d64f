//! Test helpers for processor integration tests.
//!
//! Provides mock collaborators and a fixture that wires a processor to an
//! in-memory feed and sink.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use chatvox::backend::{AiClient, SynthesisOptions, TtsClient};
use chatvox::config::ScriptConfig;
use chatvox::script::{
    ChannelSink, MemorySettingsProvider, ResourceLimits, ScriptSettings, SettingsProvider,
};
use chatvox::{ChatEvent, ChatvoxError, OutboundEvent, Processor, Result, Session};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// AI mock that answers `re: <prompt>` and remembers the priorities it saw.
#[derive(Default)]
pub struct EchoAi {
    pub priorities: Mutex<Vec<u8>>,
}

#[async_trait]
impl AiClient for EchoAi {
    async fn ask(&self, _cancel: &CancellationToken, priority: u8, prompt: &str) -> Result<String> {
        self.priorities.lock().unwrap().push(priority);
        Ok(format!("re: {prompt}"))
    }
}

/// AI mock that always fails.
pub struct FailingAi;

#[async_trait]
impl AiClient for FailingAi {
    async fn ask(&self, _cancel: &CancellationToken, _priority: u8, _prompt: &str) -> Result<String> {
        Err(ChatvoxError::Backend("rate limited".to_string()))
    }
}

/// TTS mock that "synthesizes" the UTF-8 bytes of its input.
#[derive(Default)]
pub struct BytesTts {
    pub voices: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl TtsClient for BytesTts {
    async fn synthesize(
        &self,
        _cancel: &CancellationToken,
        text: &str,
        options: &SynthesisOptions,
    ) -> Result<Vec<u8>> {
        self.voices.lock().unwrap().push(options.voice.clone());
        Ok(text.as_bytes().to_vec())
    }
}

/// TTS mock with a driver bug.
pub struct PanickingTts;

#[async_trait]
impl TtsClient for PanickingTts {
    async fn synthesize(
        &self,
        _cancel: &CancellationToken,
        _text: &str,
        _options: &SynthesisOptions,
    ) -> Result<Vec<u8>> {
        panic!("tts driver bug");
    }
}

/// TTS mock that only returns once the session is cancelled.
pub struct StallingTts;

#[async_trait]
impl TtsClient for StallingTts {
    async fn synthesize(
        &self,
        cancel: &CancellationToken,
        _text: &str,
        _options: &SynthesisOptions,
    ) -> Result<Vec<u8>> {
        cancel.cancelled().await;
        Err(ChatvoxError::Backend("request cancelled".to_string()))
    }
}

/// Build a processor over an in-memory settings store.
pub fn processor(
    scripts: HashMap<&str, ScriptSettings>,
    ai: Arc<dyn AiClient>,
    tts: Arc<dyn TtsClient>,
) -> Processor {
    let provider = MemorySettingsProvider::new();
    for (user, settings) in scripts {
        provider.insert(user, settings);
    }
    processor_with(Arc::new(provider), ai, tts)
}

pub fn processor_with(
    settings: Arc<dyn SettingsProvider>,
    ai: Arc<dyn AiClient>,
    tts: Arc<dyn TtsClient>,
) -> Processor {
    let config = ScriptConfig {
        interrupt_interval: 100,
        ai_priority: 3,
        ..ScriptConfig::default()
    };
    Processor::new(config, settings, ai, tts)
}

pub fn script(text: &str) -> ScriptSettings {
    ScriptSettings {
        script_text: text.to_string(),
        limits: ResourceLimits::default(),
    }
}

/// A running session plus the ends of its feed, sink and stop signal.
pub struct Running {
    pub session: Session,
    pub feed: mpsc::Sender<ChatEvent>,
    pub out: mpsc::UnboundedReceiver<OutboundEvent>,
    pub stop: oneshot::Sender<()>,
}

pub fn start(processor: &Processor, user: &str) -> Running {
    let (feed, feed_rx) = mpsc::channel(16);
    let (sink, out) = ChannelSink::new();
    let (stop, stop_rx) = oneshot::channel();
    let session = processor.start(user, feed_rx, Arc::new(sink), stop_rx);
    Running {
        session,
        feed,
        out,
        stop,
    }
}

/// Receive the next output event, failing the test on timeout.
pub async fn next_output(out: &mut mpsc::UnboundedReceiver<OutboundEvent>) -> OutboundEvent {
    tokio::time::timeout(DEFAULT_TIMEOUT, out.recv())
        .await
        .expect("timed out waiting for output")
        .expect("sink closed")
}

pub fn payload_text(event: &OutboundEvent) -> String {
    String::from_utf8_lossy(&event.payload).into_owned()
}
