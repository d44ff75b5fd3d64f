//! Capability bridge: the host functions a user script can call.
//!
//! | function | returns |
//! |---|---|
//! | `get_next_event()` | `user_name, message, custom_reward_id`, or nothing once the session is cancelled |
//! | `ai(prompt)` | the reply, or `"ai request error: ..."` |
//! | `tts(text [, voice])` | nothing on success (audio is emitted), or `"tts request error: ..."` |
//! | `text(text)` | nothing (text is emitted) |
//!
//! Capability failures never raise; the script checks the returned string.
//! A call over its governor cap returns `"<fn> call limit exceeded (max N)"`.
//! A panic inside a capability is contained: the session is marked faulted,
//! cancelled, and the script sees a raised error.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use super::engine::{HostArgs, HostFunction, HostResult, ScriptEngine};
use super::events::{EventSink, OutboundEvent};
use super::governor::ResourceGovernor;
use super::scope::SessionScope;
use super::source::EventSource;
use crate::backend::{AiClient, SynthesisOptions, TtsClient};
use crate::Result;

/// Names of the registered capabilities.
pub const CAPABILITIES: &[&str] = &["get_next_event", "ai", "tts", "text"];

/// Returned by `ai`, `tts` and `text` once the session is cancelled.
pub const SESSION_CLOSED: &str = "session closed";

/// External collaborators shared by every session.
#[derive(Clone)]
pub struct Collaborators {
    pub ai: Arc<dyn AiClient>,
    pub tts: Arc<dyn TtsClient>,
    /// Priority passed to [`AiClient::ask`].
    pub ai_priority: u8,
}

/// Per-session host functions.
///
/// Built on the script thread and never shared with another thread.
pub struct CapabilityBridge {
    inner: Rc<BridgeInner>,
}

struct BridgeInner {
    scope: SessionScope,
    governor: ResourceGovernor,
    source: RefCell<EventSource>,
    collaborators: Collaborators,
    sink: Arc<dyn EventSink>,
    runtime: Handle,
}

impl CapabilityBridge {
    pub fn new(
        scope: SessionScope,
        governor: ResourceGovernor,
        source: EventSource,
        collaborators: Collaborators,
        sink: Arc<dyn EventSink>,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Rc::new(BridgeInner {
                scope,
                governor,
                source: RefCell::new(source),
                collaborators,
                sink,
                runtime,
            }),
        }
    }

    /// Register every capability with `engine`.
    pub fn register<E: ScriptEngine + ?Sized>(&self, engine: &mut E) -> Result<()> {
        for &name in CAPABILITIES {
            engine.register_function(name, self.handler(name))?;
        }
        Ok(())
    }

    fn handler(&self, name: &'static str) -> HostFunction {
        let inner = Rc::clone(&self.inner);
        Box::new(move |args| inner.invoke(name, args))
    }

    /// Invoke a capability by name, exactly as the script would.
    pub fn call(&self, name: &'static str, args: HostArgs) -> HostResult {
        self.inner.invoke(name, args)
    }

    /// Calls admitted so far for `function`.
    pub fn calls(&self, function: &str) -> u32 {
        self.inner.governor.calls(function)
    }

    /// Stop the event source. Idempotent.
    pub fn close_source(&self) {
        self.inner.source.borrow_mut().close();
    }
}

impl BridgeInner {
    fn invoke(&self, name: &'static str, args: HostArgs) -> HostResult {
        if self.scope.is_cancelled() {
            return Ok(self.refused(name));
        }

        if let Err(msg) = self.governor.admit(name) {
            warn!(function = name, "{}", msg);
            return Ok(vec![msg]);
        }

        match panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(name, args))) {
            Ok(values) => Ok(values),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let backtrace = Backtrace::force_capture();
                error!(
                    function = name,
                    panic = %message,
                    backtrace = %backtrace,
                    "host function panicked"
                );
                self.scope.fault(format!("{name} panicked: {message}"));
                Err(format!("internal fault in {name}"))
            }
        }
    }

    fn refused(&self, name: &str) -> Vec<String> {
        if name == "get_next_event" {
            self.source.borrow_mut().close();
            Vec::new()
        } else {
            vec![SESSION_CLOSED.to_string()]
        }
    }

    fn dispatch(&self, name: &str, args: HostArgs) -> Vec<String> {
        match name {
            "get_next_event" => self.get_next_event(),
            "ai" => vec![self.ai(&first_arg(&args))],
            "tts" => {
                let voice = args.get(1).cloned().flatten();
                self.tts(&first_arg(&args), voice).into_iter().collect()
            }
            "text" => {
                self.text(first_arg(&args));
                Vec::new()
            }
            other => vec![format!("unknown capability: {other}")],
        }
    }

    fn get_next_event(&self) -> Vec<String> {
        let next = self.source.borrow_mut().next_blocking();
        match next {
            Some(event) => {
                debug!(
                    chatter = %event.user_name,
                    reward = %event.custom_reward_id,
                    "delivering chat event"
                );
                vec![event.user_name, event.message, event.custom_reward_id]
            }
            // Source has closed itself; the engine interrupt ends the script.
            None => Vec::new(),
        }
    }

    fn ai(&self, prompt: &str) -> String {
        let ask = self.collaborators.ai.ask(
            self.scope.token(),
            self.collaborators.ai_priority,
            prompt,
        );
        match self.runtime.block_on(ask) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "ai request failed");
                format!("ai request error: {e}")
            }
        }
    }

    fn tts(&self, text: &str, voice: Option<String>) -> Option<String> {
        let options = SynthesisOptions { voice };
        let synth = self
            .collaborators
            .tts
            .synthesize(self.scope.token(), text, &options);
        match self.runtime.block_on(synth) {
            Ok(audio) => {
                self.sink.write(OutboundEvent::audio(audio));
                None
            }
            Err(e) => {
                warn!(error = %e, "tts request failed");
                Some(format!("tts request error: {e}"))
            }
        }
    }

    fn text(&self, text: String) {
        self.sink.write(OutboundEvent::text(text));
    }
}

/// First argument as the script passed it; `nil` renders as `"nil"`.
fn first_arg(args: &HostArgs) -> String {
    args.first()
        .cloned()
        .flatten()
        .unwrap_or_else(|| "nil".to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Unconfigured;
    use crate::script::events::{ChatEvent, EventKind};
    use crate::script::scope::CancelReason;
    use crate::script::settings::ResourceLimits;
    use crate::{ChatvoxError, Result};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::runtime::Runtime;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct EchoAi;

    #[async_trait]
    impl AiClient for EchoAi {
        async fn ask(&self, _cancel: &CancellationToken, priority: u8, prompt: &str) -> Result<String> {
            Ok(format!("[{priority}] {prompt}"))
        }
    }

    struct BytesTts;

    #[async_trait]
    impl TtsClient for BytesTts {
        async fn synthesize(
            &self,
            _cancel: &CancellationToken,
            text: &str,
            options: &SynthesisOptions,
        ) -> Result<Vec<u8>> {
            if text == "explode" {
                panic!("synthesizer crashed");
            }
            if text.is_empty() {
                return Err(ChatvoxError::Backend("empty text".to_string()));
            }
            let voice = options.voice.clone().unwrap_or_default();
            Ok(format!("{voice}:{text}").into_bytes())
        }
    }

    struct Fixture {
        _runtime: Runtime,
        bridge: CapabilityBridge,
        scope: SessionScope,
        feed: mpsc::Sender<ChatEvent>,
        events: Arc<Mutex<Vec<OutboundEvent>>>,
    }

    fn fixture(collaborators: Collaborators, max_calls: &[(&str, u32)]) -> Fixture {
        let runtime = Runtime::new().unwrap();
        let scope = SessionScope::new();
        let (feed, rx) = mpsc::channel(8);
        let source = EventSource::new(rx, scope.clone(), runtime.handle().clone());
        let limits = ResourceLimits {
            max_calls_per_function: max_calls
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<HashMap<_, _>>(),
            ..Default::default()
        };
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let sink: Arc<dyn EventSink> =
            Arc::new(move |event: OutboundEvent| sink_events.lock().unwrap().push(event));
        let bridge = CapabilityBridge::new(
            scope.clone(),
            ResourceGovernor::new(&limits),
            source,
            collaborators,
            sink,
            runtime.handle().clone(),
        );
        Fixture {
            _runtime: runtime,
            bridge,
            scope,
            feed,
            events,
        }
    }

    fn working() -> Collaborators {
        Collaborators {
            ai: Arc::new(EchoAi),
            tts: Arc::new(BytesTts),
            ai_priority: 3,
        }
    }

    fn arg(s: &str) -> HostArgs {
        vec![Some(s.to_string())]
    }

    #[test]
    fn test_get_next_event_returns_three_values() {
        let fx = fixture(working(), &[]);
        fx.feed
            .try_send(ChatEvent::new("viewer", "hello").with_reward("r-9"))
            .unwrap();

        let values = fx.bridge.call("get_next_event", vec![]).unwrap();
        assert_eq!(values, vec!["viewer", "hello", "r-9"]);
    }

    #[test]
    fn test_get_next_event_after_cancel_returns_nothing() {
        let fx = fixture(working(), &[]);
        fx.feed.try_send(ChatEvent::new("viewer", "queued")).unwrap();
        fx.scope.cancel(CancelReason::Stop);

        assert!(fx.bridge.call("get_next_event", vec![]).unwrap().is_empty());
        // Source is closed; the feed no longer accepts events.
        assert!(fx.feed.try_send(ChatEvent::new("viewer", "late")).is_err());
    }

    #[test]
    fn test_ai_success_uses_priority() {
        let fx = fixture(working(), &[]);
        let values = fx.bridge.call("ai", arg("hi")).unwrap();
        assert_eq!(values, vec!["[3] hi"]);
    }

    #[test]
    fn test_ai_failure_is_error_string() {
        let fx = fixture(
            Collaborators {
                ai: Arc::new(Unconfigured),
                tts: Arc::new(Unconfigured),
                ai_priority: 0,
            },
            &[],
        );
        let values = fx.bridge.call("ai", arg("x")).unwrap();
        assert_eq!(values.len(), 1);
        assert!(values[0].starts_with("ai request error: "));
        assert!(!fx.scope.is_cancelled());
    }

    #[test]
    fn test_tts_emits_audio() {
        let fx = fixture(working(), &[]);
        let values = fx
            .bridge
            .call("tts", vec![Some("hello".to_string()), Some("alto".to_string())])
            .unwrap();
        assert!(values.is_empty());

        let events = fx.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Audio);
        assert_eq!(events[0].payload, b"alto:hello".to_vec());
    }

    #[test]
    fn test_tts_failure_emits_nothing() {
        let fx = fixture(working(), &[]);
        let values = fx.bridge.call("tts", arg("")).unwrap();
        assert_eq!(values.len(), 1);
        assert!(values[0].starts_with("tts request error: "));
        assert!(fx.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_text_emits_in_order() {
        let fx = fixture(working(), &[]);
        fx.bridge.call("text", arg("one")).unwrap();
        fx.bridge.call("tts", arg("two")).unwrap();
        fx.bridge.call("text", vec![None]).unwrap();

        let events = fx.events.lock().unwrap();
        assert_eq!(events[0], OutboundEvent::text("one"));
        assert_eq!(events[1].kind, EventKind::Audio);
        assert_eq!(events[2], OutboundEvent::text("nil"));
    }

    #[test]
    fn test_calls_refused_after_cancel() {
        let fx = fixture(working(), &[]);
        fx.scope.cancel(CancelReason::Stop);

        assert_eq!(fx.bridge.call("text", arg("x")).unwrap(), vec![SESSION_CLOSED]);
        assert_eq!(fx.bridge.call("tts", arg("x")).unwrap(), vec![SESSION_CLOSED]);
        assert_eq!(fx.bridge.call("ai", arg("x")).unwrap(), vec![SESSION_CLOSED]);
        assert!(fx.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_call_limit_returns_error_string() {
        let fx = fixture(working(), &[("tts", 1)]);
        assert!(fx.bridge.call("tts", arg("a")).unwrap().is_empty());

        let values = fx.bridge.call("tts", arg("b")).unwrap();
        assert_eq!(values, vec!["tts call limit exceeded (max 1)"]);
        assert_eq!(fx.events.lock().unwrap().len(), 1);
        assert!(!fx.scope.is_cancelled());
        assert_eq!(fx.bridge.calls("tts"), 1);
    }

    #[test]
    fn test_panic_is_contained_as_fault() {
        let fx = fixture(working(), &[]);
        let err = fx.bridge.call("tts", arg("explode")).unwrap_err();
        assert_eq!(err, "internal fault in tts");

        assert_eq!(fx.scope.cancel_reason(), Some(CancelReason::Fault));
        assert!(fx
            .scope
            .fault_details()
            .unwrap()
            .contains("synthesizer crashed"));
        assert!(fx.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "non-string panic payload");
    }
}
