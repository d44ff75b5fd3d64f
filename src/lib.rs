//! chatvox - script-driven chat event processor
//!
//! Runs per-user Lua scripts against a live chat feed, forwarding their text
//! and synthesized speech to an output sink.

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod script;

pub use backend::{AiClient, SynthesisOptions, TtsClient, Unconfigured};
pub use config::Config;
pub use error::{ChatvoxError, Result};
pub use script::{
    CancelReason, ChatEvent, EventSink, OutboundEvent, Processor, Session, SessionState,
    SessionStatus,
};
