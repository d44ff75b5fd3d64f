//! Pull-style, cancellable view of an asynchronous chat feed.
//!
//! The script thread is synchronous, so [`EventSource::next_blocking`] parks
//! it on the tokio runtime until either an event arrives or the session scope
//! is cancelled. Cancellation wins when both are ready.

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

use super::events::ChatEvent;
use super::scope::{CancelReason, SessionScope};

/// Single-consumer adapter over one user's chat feed.
pub struct EventSource {
    feed: mpsc::Receiver<ChatEvent>,
    scope: SessionScope,
    runtime: Handle,
    closed: bool,
}

impl EventSource {
    /// Wrap `feed`; `runtime` drives the blocking waits.
    pub fn new(feed: mpsc::Receiver<ChatEvent>, scope: SessionScope, runtime: Handle) -> Self {
        Self {
            feed,
            scope,
            runtime,
            closed: false,
        }
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the scope is cancelled or the feed has ended; a
    /// feed that ends cancels the scope with [`CancelReason::FeedClosed`].
    /// After the first `None` the source stays closed.
    pub async fn next(&mut self) -> Option<ChatEvent> {
        if self.closed {
            return None;
        }

        let token = self.scope.token().clone();
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            event = self.feed.recv() => {
                if event.is_none() {
                    debug!("chat feed closed");
                    self.scope.cancel(CancelReason::FeedClosed);
                }
                event
            }
        };

        if event.is_none() {
            self.close();
        }
        event
    }

    /// Blocking form of [`next`](Self::next) for the script thread.
    ///
    /// Must not be called from inside an async task.
    pub fn next_blocking(&mut self) -> Option<ChatEvent> {
        let runtime = self.runtime.clone();
        runtime.block_on(self.next())
    }

    /// Stop delivering events. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.feed.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
