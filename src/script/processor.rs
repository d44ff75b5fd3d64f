//! Processor: the entry point that turns one user's chat feed into output
//! events by running their script.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument, Span};
use uuid::Uuid;

use super::bridge::{CapabilityBridge, Collaborators};
use super::engine::{EngineOptions, LuaEngine};
use super::events::{ChatEvent, EventSink};
use super::governor::{spawn_deadline, ResourceGovernor};
use super::host::{ScriptHost, SessionStatus};
use super::scope::{CancelReason, SessionScope, SessionState};
use super::settings::{ScriptSettings, SettingsProvider};
use super::source::EventSource;
use crate::backend::{AiClient, TtsClient};
use crate::config::ScriptConfig;
use crate::logging::session_span;
use crate::Result;

/// Runs user scripts against live chat feeds.
///
/// Cheap to clone; sessions share the settings provider and collaborators
/// but nothing else.
#[derive(Clone)]
pub struct Processor {
    config: Arc<ScriptConfig>,
    settings: Arc<dyn SettingsProvider>,
    collaborators: Collaborators,
}

impl Processor {
    pub fn new(
        config: ScriptConfig,
        settings: Arc<dyn SettingsProvider>,
        ai: Arc<dyn AiClient>,
        tts: Arc<dyn TtsClient>,
    ) -> Self {
        let collaborators = Collaborators {
            ai,
            tts,
            ai_priority: config.ai_priority,
        };
        Self {
            config: Arc::new(config),
            settings,
            collaborators,
        }
    }

    /// Run one session for `user` on the current task until the script ends.
    ///
    /// `stop` requests shutdown when it fires or when its sender is dropped.
    /// Script syntax and runtime errors are returned as errors; cancellation
    /// and contained faults are reported through [`SessionStatus`].
    pub async fn process(
        &self,
        user: &str,
        feed: mpsc::Receiver<ChatEvent>,
        sink: Arc<dyn EventSink>,
        stop: oneshot::Receiver<()>,
    ) -> Result<SessionStatus> {
        let id = Uuid::new_v4();
        self.run(user.to_string(), id, SessionScope::new(), feed, sink, stop)
            .instrument(session_span(user, id))
            .await
    }

    /// Spawn a session on its own task and return a handle to it.
    pub fn start(
        &self,
        user: &str,
        feed: mpsc::Receiver<ChatEvent>,
        sink: Arc<dyn EventSink>,
        stop: oneshot::Receiver<()>,
    ) -> Session {
        let id = Uuid::new_v4();
        let scope = SessionScope::new();
        let processor = self.clone();
        let task = {
            let user = user.to_string();
            let scope = scope.clone();
            let span = session_span(&user, id);
            tokio::spawn(
                async move { processor.run(user, id, scope, feed, sink, stop).await }
                    .instrument(span),
            )
        };

        Session {
            id,
            user: user.to_string(),
            scope,
            task,
        }
    }

    /// Settings for `user`, falling back to the default script.
    pub async fn load_settings(&self, user: &str) -> ScriptSettings {
        match self.settings.get_settings(user).await {
            Ok(Some(settings)) => {
                info!(
                    script_bytes = settings.script_text.len(),
                    limits = ?settings.limits,
                    "settings fetched"
                );
                settings
            }
            Ok(None) => {
                info!("settings not found, using default script");
                ScriptSettings::default_with_limits(self.config.default_limits())
            }
            Err(e) => {
                warn!(error = %e, "settings lookup failed, using default script");
                ScriptSettings::default_with_limits(self.config.default_limits())
            }
        }
    }

    async fn run(
        &self,
        user: String,
        id: Uuid,
        scope: SessionScope,
        feed: mpsc::Receiver<ChatEvent>,
        sink: Arc<dyn EventSink>,
        stop: oneshot::Receiver<()>,
    ) -> Result<SessionStatus> {
        tokio::spawn(watch_stop(stop, scope.clone()).instrument(Span::current()));

        let settings = self.load_settings(&user).await;
        let deadline = spawn_deadline(scope.clone(), settings.limits.max_exec_duration);

        let engine_options = EngineOptions {
            max_memory_bytes: settings.limits.max_memory_bytes,
            interrupt_interval: self.config.interrupt_interval,
        };
        let collaborators = self.collaborators.clone();
        let runtime = Handle::current();
        let span = Span::current();
        let script_scope = scope.clone();

        let joined = tokio::task::spawn_blocking(move || {
            span.in_scope(|| {
                run_script(
                    script_scope,
                    settings,
                    engine_options,
                    feed,
                    sink,
                    collaborators,
                    runtime,
                )
            })
        })
        .await;

        scope.release();
        if let Some(deadline) = deadline {
            let _ = deadline.await;
        }

        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                // Panics are caught on the script thread; this is a last resort.
                error!(session = %id, error = %e, "script thread failed");
                scope.fault(e.to_string());
                Ok(SessionStatus::Faulted {
                    details: e.to_string(),
                })
            }
        };

        info!("processor is closing");
        result
    }
}

/// Translate the external stop signal into cancellation of `scope`.
async fn watch_stop(stop: oneshot::Receiver<()>, scope: SessionScope) {
    tokio::select! {
        _ = scope.token().cancelled() => {}
        _ = stop => {
            if scope.cancel(CancelReason::Stop) {
                info!("stop signal received");
            }
        }
    }
}

/// Body of the script thread.
fn run_script(
    scope: SessionScope,
    settings: ScriptSettings,
    engine_options: EngineOptions,
    feed: mpsc::Receiver<ChatEvent>,
    sink: Arc<dyn EventSink>,
    collaborators: Collaborators,
    runtime: Handle,
) -> Result<SessionStatus> {
    let source = EventSource::new(feed, scope.clone(), runtime.clone());
    let bridge = CapabilityBridge::new(
        scope.clone(),
        ResourceGovernor::new(&settings.limits),
        source,
        collaborators,
        sink,
        runtime,
    );
    let token = scope.token().clone();

    ScriptHost::new(scope).start(&settings, &bridge, move || {
        LuaEngine::new(&engine_options, token)
    })
}

/// Handle to a session spawned with [`Processor::start`].
pub struct Session {
    id: Uuid,
    user: String,
    scope: SessionScope,
    task: JoinHandle<Result<SessionStatus>>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn state(&self) -> SessionState {
        self.scope.state()
    }

    /// Request shutdown, same as firing the stop signal.
    pub fn cancel(&self) -> bool {
        self.scope.cancel(CancelReason::Stop)
    }

    /// Wait for the session to finish.
    pub async fn wait(self) -> Result<SessionStatus> {
        self.task.await?
    }
}
