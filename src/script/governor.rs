//! Resource governor: per-session call caps and the execution deadline.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use super::scope::{CancelReason, SessionScope};
use super::settings::ResourceLimits;

/// Counts capability calls for one session and rejects those over the cap.
#[derive(Debug)]
pub struct ResourceGovernor {
    max_calls: HashMap<String, u32>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ResourceGovernor {
    /// Fresh governor; counts start at zero.
    pub fn new(limits: &ResourceLimits) -> Self {
        Self {
            max_calls: limits.max_calls_per_function.clone(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Admit one call to `function`, or explain why not.
    ///
    /// Rejected calls are not counted.
    pub fn admit(&self, function: &str) -> Result<(), String> {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        let count = calls.entry(function.to_string()).or_insert(0);

        if let Some(&max) = self.max_calls.get(function) {
            if *count >= max {
                return Err(format!("{function} call limit exceeded (max {max})"));
            }
        }

        *count += 1;
        Ok(())
    }

    /// Calls admitted so far for `function`.
    pub fn calls(&self, function: &str) -> u32 {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(function)
            .copied()
            .unwrap_or(0)
    }
}

/// Cancel `scope` with [`CancelReason::Timeout`] once `limit` elapses.
///
/// The watchdog exits early when the scope is cancelled for any other reason.
/// Returns `None` when there is no limit.
pub fn spawn_deadline(scope: SessionScope, limit: Option<Duration>) -> Option<JoinHandle<()>> {
    let limit = limit?;
    Some(tokio::spawn(async move {
        tokio::select! {
            _ = scope.token().cancelled() => {}
            _ = tokio::time::sleep(limit) => {
                if scope.cancel(CancelReason::Timeout) {
                    warn!(limit_secs = limit.as_secs_f64(), "script exceeded execution time limit");
                }
            }
        }
    }))
}
