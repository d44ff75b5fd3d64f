//! Script-driven event processing.
//!
//! A user's Lua script pulls chat events with `get_next_event` and answers
//! them through the `ai`, `tts` and `text` capabilities. Each session runs
//! on its own blocking thread inside a cancellation scope; the host contains
//! panics and closes the runtime exactly once.

pub mod bridge;
pub mod engine;
pub mod events;
pub mod governor;
pub mod host;
pub mod processor;
pub mod scope;
pub mod settings;
pub mod source;

pub use bridge::{CapabilityBridge, Collaborators, CAPABILITIES, SESSION_CLOSED};
pub use engine::{EngineOptions, LuaEngine, ScriptEngine};
pub use events::{ChannelSink, ChatEvent, EventKind, EventSink, OutboundEvent};
pub use governor::ResourceGovernor;
pub use host::{ScriptHost, SessionStatus};
pub use processor::{Processor, Session};
pub use scope::{CancelReason, SessionScope, SessionState};
pub use settings::{
    FileSettingsProvider, MemorySettingsProvider, ResourceLimits, ScriptSettings,
    SettingsProvider, DEFAULT_SCRIPT,
};
pub use source::EventSource;
