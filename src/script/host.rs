//! Script host: runs one user script under a session scope and contains its
//! failures.

use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};

use tracing::{error, info, warn};

use super::bridge::CapabilityBridge;
use super::engine::ScriptEngine;
use super::scope::{CancelReason, SessionScope, SessionState};
use super::settings::ScriptSettings;
use crate::{ChatvoxError, Result};

/// How a session ended.
///
/// Script syntax and runtime errors are not a status; they are returned as
/// [`ChatvoxError::Script`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// The script returned on its own.
    Completed,
    /// The session scope was cancelled.
    Cancelled { reason: CancelReason },
    /// An internal fault was contained.
    Faulted { details: String },
}

impl SessionStatus {
    fn state(&self) -> SessionState {
        match self {
            SessionStatus::Completed => SessionState::Completed,
            SessionStatus::Cancelled { .. } => SessionState::Cancelled,
            SessionStatus::Faulted { .. } => SessionState::Faulted,
        }
    }
}

/// Drives a single session on the script thread.
pub struct ScriptHost {
    scope: SessionScope,
}

impl ScriptHost {
    pub fn new(scope: SessionScope) -> Self {
        Self { scope }
    }

    /// Build a runtime with `build_engine`, register the bridge, and run
    /// `settings.script_text` until it returns, is cancelled, or faults.
    ///
    /// The runtime is closed exactly once on every path and the session ends
    /// in [`SessionState::Closed`]. A host can only be started once.
    pub fn start<E, F>(
        &self,
        settings: &ScriptSettings,
        bridge: &CapabilityBridge,
        build_engine: F,
    ) -> Result<SessionStatus>
    where
        E: ScriptEngine,
        F: FnOnce() -> Result<E>,
    {
        if !self
            .scope
            .transition(SessionState::Created, SessionState::Running)
        {
            return Err(ChatvoxError::Engine(format!(
                "session cannot start from state {:?}",
                self.scope.state()
            )));
        }
        info!("script started");

        let mut engine: Option<E> = None;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<()> {
            let engine = engine.insert(build_engine()?);
            bridge.register(engine)?;
            engine.load(&settings.script_text)?;
            engine.run()
        }));

        let result = self.classify(outcome);

        bridge.close_source();
        if let Some(mut engine) = engine {
            engine.close();
        }

        let state = match &result {
            Ok(status) => status.state(),
            Err(_) => SessionState::Faulted,
        };
        self.scope.transition(SessionState::Running, state);
        self.scope.release();
        if self.scope.close() {
            match &result {
                Ok(status) => info!(?status, "script closed"),
                Err(e) => warn!(error = %e, "script closed with error"),
            }
        }

        result
    }

    fn classify(&self, outcome: std::thread::Result<Result<()>>) -> Result<SessionStatus> {
        let run_result = match outcome {
            Ok(run_result) => run_result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(
                    panic = %message,
                    backtrace = %Backtrace::force_capture(),
                    "script runtime panicked"
                );
                self.scope.fault(format!("runtime panicked: {message}"));
                Ok(())
            }
        };

        if let Some(details) = self.scope.fault_details() {
            return Ok(SessionStatus::Faulted {
                details: details.to_string(),
            });
        }

        match run_result {
            Ok(()) => Ok(match self.scope.cancel_reason() {
                Some(reason) => SessionStatus::Cancelled { reason },
                None => SessionStatus::Completed,
            }),
            Err(ChatvoxError::Interrupted) => {
                // The interrupt only fires after the scope was cancelled.
                let reason = self.scope.cancel_reason().unwrap_or(CancelReason::Stop);
                info!(%reason, "script stopped by cancellation");
                Ok(SessionStatus::Cancelled { reason })
            }
            Err(e) => {
                warn!(error = %e, "script failed");
                Err(e)
            }
        }
    }
}
