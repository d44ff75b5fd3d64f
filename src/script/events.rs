//! Chat events flowing into a script and output events flowing out.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A chat message delivered to the script by `get_next_event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Display name of the chatter.
    pub user_name: String,
    /// Message body.
    pub message: String,
    /// Channel-points reward id; empty for plain chat.
    #[serde(default)]
    pub custom_reward_id: String,
}

impl ChatEvent {
    /// Create a plain chat message without a reward id.
    pub fn new(user_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            message: message.into(),
            custom_reward_id: String::new(),
        }
    }

    /// Attach a reward id.
    pub fn with_reward(mut self, reward_id: impl Into<String>) -> Self {
        self.custom_reward_id = reward_id.into();
        self
    }
}

/// Kind of output a capability produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Text,
    Audio,
}

/// A unit of output handed to the session's sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub kind: EventKind,
    pub payload: Vec<u8>,
}

impl OutboundEvent {
    /// Text output.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Text,
            payload: text.into().into_bytes(),
        }
    }

    /// Encoded audio output.
    pub fn audio(bytes: Vec<u8>) -> Self {
        Self {
            kind: EventKind::Audio,
            payload: bytes,
        }
    }
}

/// Destination for a session's output.
///
/// Fire-and-forget: the processor never observes a result. Calls arrive from
/// the single script thread in program order.
pub trait EventSink: Send + Sync {
    fn write(&self, event: OutboundEvent);
}

impl<F> EventSink for F
where
    F: Fn(OutboundEvent) + Send + Sync,
{
    fn write(&self, event: OutboundEvent) {
        self(event)
    }
}

/// Sink backed by an unbounded channel, preserving FIFO order.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver its events are delivered to.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn write(&self, event: OutboundEvent) {
        // Receiver gone means nobody is listening; dropping is fine.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_chat_event_builder() {
        let event = ChatEvent::new("viewer", "hello").with_reward("r-1");
        assert_eq!(event.user_name, "viewer");
        assert_eq!(event.message, "hello");
        assert_eq!(event.custom_reward_id, "r-1");
    }

    #[test]
    fn test_outbound_event_kinds() {
        let text = OutboundEvent::text("hi");
        assert_eq!(text.kind, EventKind::Text);
        assert_eq!(text.payload, b"hi".to_vec());

        let audio = OutboundEvent::audio(vec![1, 2, 3]);
        assert_eq!(audio.kind, EventKind::Audio);
        assert_eq!(audio.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_event_kind_serializes_lowercase() {
        let json = serde_json::to_string(&OutboundEvent::text("x")).unwrap();
        assert!(json.contains(r#""kind":"text""#));
    }

    #[test]
    fn test_channel_sink_preserves_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.write(OutboundEvent::text("1"));
        sink.write(OutboundEvent::audio(vec![2]));
        sink.write(OutboundEvent::text("3"));

        assert_eq!(rx.try_recv().unwrap(), OutboundEvent::text("1"));
        assert_eq!(rx.try_recv().unwrap(), OutboundEvent::audio(vec![2]));
        assert_eq!(rx.try_recv().unwrap(), OutboundEvent::text("3"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink_without_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.write(OutboundEvent::text("dropped"));
    }

    #[test]
    fn test_closure_sink() {
        let seen = Mutex::new(Vec::new());
        let sink = |event: OutboundEvent| seen.lock().unwrap().push(event.kind);
        sink.write(OutboundEvent::text("a"));
        sink.write(OutboundEvent::audio(vec![]));
        drop(sink);
        assert_eq!(seen.into_inner().unwrap(), vec![EventKind::Text, EventKind::Audio]);
    }
}
