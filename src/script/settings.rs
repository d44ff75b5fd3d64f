//! Per-user script settings and the providers that supply them.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;

use crate::{ChatvoxError, Result};

/// Script run when a user has no settings of their own: speak every message.
pub const DEFAULT_SCRIPT: &str = r#"
while true do
    local user, msg, reward_id = get_next_event()
    if msg == nil then break end
    tts(msg)
end
"#;

const BYTES_PER_MB: usize = 1024 * 1024;

/// Convert a megabyte count to bytes; `None` if it does not fit in `usize`.
pub(crate) fn mb_to_bytes(mb: usize) -> Option<usize> {
    mb.checked_mul(BYTES_PER_MB)
}

/// Bounds on one session's resource use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Wall-clock budget for the whole session (`None` = unlimited).
    pub max_exec_duration: Option<Duration>,
    /// Call caps keyed by capability name. Absent names are unlimited.
    pub max_calls_per_function: HashMap<String, u32>,
    /// Lua allocator cap in bytes (0 = unlimited).
    pub max_memory_bytes: usize,
}

/// A user's script and the limits it runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSettings {
    pub script_text: String,
    pub limits: ResourceLimits,
}

impl ScriptSettings {
    /// Settings running [`DEFAULT_SCRIPT`] under `limits`.
    pub fn default_with_limits(limits: ResourceLimits) -> Self {
        Self {
            script_text: DEFAULT_SCRIPT.to_string(),
            limits,
        }
    }
}

/// Source of per-user settings.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    /// `Ok(None)` means the user has no settings.
    async fn get_settings(&self, user_id: &str) -> Result<Option<ScriptSettings>>;
}

/// Limit overrides parsed from a script's leading comment block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitOverrides {
    /// `-- @max_exec_secs N`
    pub max_exec_secs: Option<u64>,
    /// `-- @max_memory_mb N`
    pub max_memory_mb: Option<usize>,
    /// `-- @max_calls <fn> <N>`
    pub max_calls: HashMap<String, u32>,
}

impl LimitOverrides {
    /// Parse overrides from the comment header of a Lua script.
    ///
    /// ```lua
    /// -- @max_exec_secs 3600
    /// -- @max_calls tts 200
    /// -- @max_memory_mb 8
    /// ```
    ///
    /// Parsing stops at the first non-comment line; malformed lines are ignored.
    pub fn parse(content: &str) -> Self {
        let mut overrides = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if !line.starts_with("--") {
                if !line.is_empty() {
                    break;
                }
                continue;
            }

            let comment = line.trim_start_matches("--").trim();

            if let Some(value) = comment.strip_prefix("@max_exec_secs ") {
                overrides.max_exec_secs = value.trim().parse().ok();
            } else if let Some(value) = comment.strip_prefix("@max_memory_mb ") {
                overrides.max_memory_mb = value
                    .trim()
                    .parse()
                    .ok()
                    .filter(|mb| mb_to_bytes(*mb).is_some());
            } else if let Some(value) = comment.strip_prefix("@max_calls ") {
                let mut parts = value.split_whitespace();
                if let (Some(name), Some(count), None) = (parts.next(), parts.next(), parts.next()) {
                    if let Ok(count) = count.parse() {
                        overrides.max_calls.insert(name.to_string(), count);
                    }
                }
            }
        }

        overrides
    }

    /// Layer these overrides on top of `base`.
    pub fn apply(self, mut base: ResourceLimits) -> ResourceLimits {
        if let Some(secs) = self.max_exec_secs {
            base.max_exec_duration = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(bytes) = self.max_memory_mb.and_then(mb_to_bytes) {
            base.max_memory_bytes = bytes;
        }
        base.max_calls_per_function.extend(self.max_calls);
        base
    }
}

/// Reads `<dir>/<user_id>.lua`.
pub struct FileSettingsProvider {
    settings_dir: PathBuf,
    default_limits: ResourceLimits,
}

impl FileSettingsProvider {
    /// Create a provider rooted at `settings_dir`.
    pub fn new<P: AsRef<Path>>(settings_dir: P, default_limits: ResourceLimits) -> Self {
        Self {
            settings_dir: settings_dir.as_ref().to_path_buf(),
            default_limits,
        }
    }

    fn script_path(&self, user_id: &str) -> Result<PathBuf> {
        if user_id.is_empty()
            || user_id.contains(['/', '\\'])
            || user_id.contains("..")
            || user_id.contains('\0')
        {
            return Err(ChatvoxError::Validation(format!(
                "invalid user id for settings lookup: {user_id:?}"
            )));
        }
        Ok(self.settings_dir.join(format!("{user_id}.lua")))
    }

    /// Blocking read used by [`SettingsProvider::get_settings`].
    pub fn read_settings(&self, user_id: &str) -> Result<Option<ScriptSettings>> {
        let path = self.script_path(user_id)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let limits = LimitOverrides::parse(&content).apply(self.default_limits.clone());
        Ok(Some(ScriptSettings {
            script_text: content,
            limits,
        }))
    }
}

#[async_trait]
impl SettingsProvider for FileSettingsProvider {
    async fn get_settings(&self, user_id: &str) -> Result<Option<ScriptSettings>> {
        self.read_settings(user_id)
    }
}

/// In-process settings store.
#[derive(Default)]
pub struct MemorySettingsProvider {
    settings: RwLock<HashMap<String, ScriptSettings>>,
}

impl MemorySettingsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) a user's settings.
    pub fn insert(&self, user_id: impl Into<String>, settings: ScriptSettings) {
        self.settings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id.into(), settings);
    }

    /// Remove a user's settings. Returns whether any existed.
    pub fn remove(&self, user_id: &str) -> bool {
        self.settings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(user_id)
            .is_some()
    }
}

#[async_trait]
impl SettingsProvider for MemorySettingsProvider {
    async fn get_settings(&self, user_id: &str) -> Result<Option<ScriptSettings>> {
        Ok(self
            .settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .cloned())
    }
}
