//! Script engine interface and the sandboxed Lua implementation.

use std::cell::Cell;
use std::rc::Rc;

use mlua::{
    Function, HookTriggers, Lua, LuaOptions, MultiValue, StdLib, Value, Variadic, VmState,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{ChatvoxError, Result};

/// Arguments passed to a host function. `None` is a Lua `nil`.
pub type HostArgs = Vec<Option<String>>;

/// Values a host function returns to the script, or a message raised as a
/// script error.
pub type HostResult = std::result::Result<Vec<String>, String>;

/// A host function callable from the script.
pub type HostFunction = Box<dyn Fn(HostArgs) -> HostResult>;

/// Minimal interface the processor needs from a scripting runtime.
///
/// Engines are single-threaded: every method, and every host function they
/// invoke, runs on the thread that owns the engine.
pub trait ScriptEngine {
    /// Compile `source`. Syntax errors surface here as [`ChatvoxError::Script`].
    fn load(&mut self, source: &str) -> Result<()>;

    /// Expose `handler` to the script as the global `name`.
    fn register_function(&mut self, name: &str, handler: HostFunction) -> Result<()>;

    /// Run the loaded chunk to completion.
    fn run(&mut self) -> Result<()>;

    /// Release the runtime. Returns `true` only for the call that closed it.
    fn close(&mut self) -> bool;
}

/// Construction options for [`LuaEngine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Allocator cap in bytes (0 = unlimited).
    pub max_memory_bytes: usize,
    /// VM instructions between interrupt checks.
    pub interrupt_interval: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_memory_bytes: 16 * 1024 * 1024,
            interrupt_interval: 1000,
        }
    }
}

/// Globals removed from the base library.
const BLOCKED_GLOBALS: &[&str] = &["dofile", "loadfile", "load", "require", "collectgarbage"];

/// Wraps `pcall` and `xpcall` so they re-raise once the session is
/// cancelled. The originals stay reachable only through these upvalues.
const PROTECTED_CALL_GUARD: &str = r#"
local check = ...
local raw_pcall, raw_xpcall = pcall, xpcall
pcall = function(...) return check(raw_pcall(...)) end
xpcall = function(...) return check(raw_xpcall(...)) end
"#;

const INTERRUPT_MESSAGE: &str = "script interrupted: session cancelled";

/// Lua 5.4 runtime restricted to `table`, `string`, `math` and `utf8`.
pub struct LuaEngine {
    lua: Option<Lua>,
    chunk: Option<Function>,
    /// Set once the interrupt has been raised into the script.
    interrupted: Rc<Cell<bool>>,
}

impl LuaEngine {
    /// Build a fresh sandboxed runtime.
    ///
    /// Once `interrupt` is cancelled the running script is aborted at the next
    /// instruction check.
    pub fn new(options: &EngineOptions, interrupt: CancellationToken) -> Result<Self> {
        let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8;
        let lua = Lua::new_with(libs, LuaOptions::new().catch_rust_panics(false))
            .map_err(|e| ChatvoxError::Engine(format!("Failed to create Lua state: {e}")))?;

        let interrupted = Rc::new(Cell::new(false));
        Self::apply_sandbox(&lua)?;
        Self::guard_protected_calls(&lua, interrupt.clone(), Rc::clone(&interrupted))?;

        if options.max_memory_bytes > 0 {
            lua.set_memory_limit(options.max_memory_bytes)
                .map_err(|e| ChatvoxError::Engine(format!("Failed to set memory limit: {e}")))?;
        }

        let hook_flag = Rc::clone(&interrupted);
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(options.interrupt_interval.max(1)),
            move |_lua, _debug| {
                if interrupt.is_cancelled() {
                    Err(raise_interrupt(&hook_flag))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );

        Ok(Self {
            lua: Some(lua),
            chunk: None,
            interrupted,
        })
    }

    fn guard_protected_calls(
        lua: &Lua,
        interrupt: CancellationToken,
        interrupted: Rc<Cell<bool>>,
    ) -> Result<()> {
        let check = lua
            .create_function(move |_, results: MultiValue| {
                if interrupt.is_cancelled() {
                    Err(raise_interrupt(&interrupted))
                } else {
                    Ok(results)
                }
            })
            .map_err(|e| ChatvoxError::Engine(format!("Failed to create pcall guard: {e}")))?;

        lua.load(PROTECTED_CALL_GUARD)
            .set_name("sandbox")
            .call::<()>(check)
            .map_err(|e| ChatvoxError::Engine(format!("Failed to guard pcall: {e}")))
    }

    fn apply_sandbox(lua: &Lua) -> Result<()> {
        let globals = lua.globals();
        for name in BLOCKED_GLOBALS {
            globals
                .set(*name, Value::Nil)
                .map_err(|e| ChatvoxError::Engine(format!("Failed to disable {name}: {e}")))?;
        }

        // print goes to the log, never to the process's stdout.
        let print = lua
            .create_function(|_, args: Variadic<Value>| {
                let line = args.iter().map(value_to_string).collect::<Vec<_>>().join("\t");
                info!(target: "chatvox::script", "{}", line);
                Ok(())
            })
            .map_err(|e| ChatvoxError::Engine(format!("Failed to create print: {e}")))?;
        globals
            .set("print", print)
            .map_err(|e| ChatvoxError::Engine(format!("Failed to override print: {e}")))?;

        Ok(())
    }

    fn lua(&self) -> Result<&Lua> {
        self.lua
            .as_ref()
            .ok_or_else(|| ChatvoxError::Engine("runtime is closed".to_string()))
    }

    /// Read a global; test and diagnostics helper.
    pub fn get_global<V: mlua::FromLua>(&self, name: &str) -> Result<V> {
        self.lua()?
            .globals()
            .get(name)
            .map_err(|e| ChatvoxError::Engine(format!("Failed to get global '{name}': {e}")))
    }

    pub fn is_closed(&self) -> bool {
        self.lua.is_none()
    }
}

impl ScriptEngine for LuaEngine {
    fn load(&mut self, source: &str) -> Result<()> {
        let chunk = self
            .lua()?
            .load(source)
            .set_name("user_script")
            .into_function()
            .map_err(|e| ChatvoxError::Script(e.to_string()))?;
        self.chunk = Some(chunk);
        Ok(())
    }

    fn register_function(&mut self, name: &str, handler: HostFunction) -> Result<()> {
        let lua = self.lua()?;
        let function = lua
            .create_function(move |_, args: Variadic<Value>| {
                let args = args.iter().map(value_to_arg).collect();
                match handler(args) {
                    Ok(values) => Ok(values.into_iter().collect::<Variadic<String>>()),
                    Err(msg) => Err(mlua::Error::RuntimeError(msg)),
                }
            })
            .map_err(|e| ChatvoxError::Engine(format!("Failed to create function '{name}': {e}")))?;

        lua.globals()
            .set(name, function)
            .map_err(|e| ChatvoxError::Engine(format!("Failed to register '{name}': {e}")))
    }

    fn run(&mut self) -> Result<()> {
        self.lua()?;
        let chunk = self
            .chunk
            .as_ref()
            .ok_or_else(|| ChatvoxError::Engine("no script loaded".to_string()))?;
        chunk.call::<()>(()).map_err(|e| {
            if self.interrupted.get() {
                ChatvoxError::Interrupted
            } else {
                ChatvoxError::Script(e.to_string())
            }
        })
    }

    fn close(&mut self) -> bool {
        self.chunk = None;
        match self.lua.take() {
            Some(lua) => {
                let _ = lua.remove_hook();
                true
            }
            None => false,
        }
    }
}

impl Drop for LuaEngine {
    fn drop(&mut self) {
        self.close();
    }
}

fn raise_interrupt(flag: &Cell<bool>) -> mlua::Error {
    flag.set(true);
    mlua::Error::RuntimeError(INTERRUPT_MESSAGE.to_string())
}

fn value_to_arg(value: &Value) -> Option<String> {
    match value {
        Value::Nil => None,
        other => Some(value_to_string(other)),
    }
}

/// Render a Lua value the way `tostring` would for scalars.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy(),
        Value::Table(_) => "[table]".to_string(),
        Value::Function(_) => "[function]".to_string(),
        Value::Thread(_) => "[thread]".to_string(),
        Value::UserData(_) => "[userdata]".to_string(),
        Value::LightUserData(_) => "[lightuserdata]".to_string(),
        Value::Error(e) => format!("[error: {}]", e),
        _ => "[unknown]".to_string(),
    }
}
