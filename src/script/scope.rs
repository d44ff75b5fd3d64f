//! Per-session cancellation scope and lifecycle state.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// Why a session's scope was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The external stop signal fired (or its sender went away).
    Stop,
    /// `max_exec_duration` elapsed.
    Timeout,
    /// The chat feed closed; no more events can arrive.
    FeedClosed,
    /// A host function faulted.
    Fault,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancelReason::Stop => "stop signal",
            CancelReason::Timeout => "execution time limit",
            CancelReason::FeedClosed => "event feed closed",
            CancelReason::Fault => "internal fault",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a session.
///
/// `Created -> Running -> {Completed | Cancelled | Faulted} -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    Running = 1,
    Completed = 2,
    Cancelled = 3,
    Faulted = 4,
    Closed = 5,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Created,
            1 => SessionState::Running,
            2 => SessionState::Completed,
            3 => SessionState::Cancelled,
            4 => SessionState::Faulted,
            _ => SessionState::Closed,
        }
    }

    /// Whether the session has finished running.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Cancelled
                | SessionState::Faulted
                | SessionState::Closed
        )
    }
}

struct ScopeInner {
    token: CancellationToken,
    reason: OnceLock<CancelReason>,
    fault: OnceLock<String>,
    state: AtomicU8,
}

/// Cancellation scope shared by everything belonging to one session.
///
/// Cheap to clone. The first [`cancel`](Self::cancel) wins; later calls only
/// return `false`.
#[derive(Clone)]
pub struct SessionScope {
    inner: Arc<ScopeInner>,
}

impl SessionScope {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                token: CancellationToken::new(),
                reason: OnceLock::new(),
                fault: OnceLock::new(),
                state: AtomicU8::new(SessionState::Created as u8),
            }),
        }
    }

    /// Token handed to collaborators and async waiters.
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Cancel the scope. Returns `true` only for the call that did it.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let first = self.inner.reason.set(reason).is_ok();
        self.inner.token.cancel();
        first
    }

    /// Cancel the token without recording a reason.
    ///
    /// Used at teardown so watcher tasks exit once the session is over.
    pub fn release(&self) {
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Reason recorded by the first cancellation, if any.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.inner.reason.get().copied()
    }

    /// Record an internal fault and cancel the scope.
    ///
    /// Only the first fault's details are kept.
    pub fn fault(&self, details: impl Into<String>) {
        let _ = self.inner.fault.set(details.into());
        self.cancel(CancelReason::Fault);
    }

    /// Details of the recorded fault, if any.
    pub fn fault_details(&self) -> Option<&str> {
        self.inner.fault.get().map(String::as_str)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Move from `from` to `to`. Fails if the current state isn't `from`.
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Move a terminal session to `Closed`. Returns `true` exactly once.
    pub fn close(&self) -> bool {
        let mut current = self.inner.state.load(Ordering::SeqCst);
        loop {
            let state = SessionState::from_u8(current);
            if state == SessionState::Closed || !state.is_terminal() {
                return false;
            }
            match self.inner.state.compare_exchange(
                current,
                SessionState::Closed as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for SessionScope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionScope")
            .field("state", &self.state())
            .field("cancel_reason", &self.cancel_reason())
            .finish()
    }
}
