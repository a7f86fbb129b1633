//! The embedded VM host: owns one Lua 5.4 interpreter, applies the
//! limiter and sandbox, marshals values across the host/script boundary,
//! and bridges script-initiated callbacks back to the host.

use std::rc::Rc;

use mlua::{Lua, LuaOptions, StdLib, Table, Value};
use tracing::debug;

use crate::limiter::{self, InstructionCounter};
use crate::sandbox;
use crate::types::{ScriptError, ScriptValue};

/// Tables nested deeper than this during marshalling are rejected rather
/// than risking unbounded recursion on adversarial input.
const MAX_MARSHAL_DEPTH: usize = 64;

/// Invoked when a script calls one of the registered callback globals.
/// The in-process [`Sandbox`] calls straight through to a host closure;
/// the isolated worker (see [`crate::worker`]) instead implements this by
/// sending a `Callback` result message and blocking for the reply.
/// `Err` aborts the running chunk with a Lua runtime error carrying the
/// given message — used by the isolated worker to unwind a script
/// cleanly when STOP arrives mid-callback.
pub trait CallbackBridge {
    fn invoke(&self, name: &str, args: &[ScriptValue]) -> Result<ScriptValue, String>;
}

/// Owns a single Lua interpreter instance: the Interpreter Instance of
/// this crate's data model. Not `Send`/`Sync` — `mlua::Lua` is bound to
/// the thread that created it.
pub struct Interpreter {
    lua: Lua,
    instructions: InstructionCounter,
}

impl Interpreter {
    /// Builds a fresh interpreter with the limiter and sandbox installed
    /// and the given callback names wired to `bridge`. `bridge` is
    /// reference-counted so the installed Lua closures can hold a handle
    /// without borrowing the `Interpreter` itself.
    pub fn new(
        memory_limit: Option<usize>,
        instruction_limit: Option<u64>,
        callback_names: &[String],
        bridge: Rc<dyn CallbackBridge>,
    ) -> Result<Self, ScriptError> {
        // `debug` must be loaded so `sandbox::apply` can reach
        // `debug.setmetatable` to seal the implicit string metatable
        // before `remove_globals` deletes `debug` itself. `Lua::new()`
        // loads `StdLib::ALL_SAFE`, which omits `debug`; load everything
        // and let the sandbox step strip what untrusted code must not see.
        let lua = Lua::new_with(StdLib::ALL, LuaOptions::default())
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;
        limiter::install_memory_limit(&lua, memory_limit)
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;
        let instructions = InstructionCounter::new();
        instructions.install(&lua, instruction_limit);

        sandbox::apply(&lua)?;
        install_callbacks(&lua, callback_names, bridge)?;

        Ok(Self { lua, instructions })
    }

    /// Loads `source` in text mode (mlua rejects a leading bytecode
    /// signature unless the chunk's mode is explicitly set to binary,
    /// which this host never does) and runs it, discarding return values.
    pub fn execute(&self, source: &str) -> Result<(), ScriptError> {
        self.instructions.reset();
        debug!(bytes = source.len(), "executing script");
        self.lua
            .load(source)
            .set_name("<script>")
            .exec()
            .map_err(|e| ScriptError::Runtime(e.to_string()))
    }

    /// Calls the global function `name` with `args`, returning its first
    /// return value (or `Nil` if it returned nothing).
    pub fn call(&self, name: &str, args: &[ScriptValue]) -> Result<ScriptValue, ScriptError> {
        self.instructions.reset();
        let globals = self.lua.globals();
        let value: Value = globals
            .get(name)
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;
        let Value::Function(func) = value else {
            return Err(ScriptError::NotAFunction(name.to_string()));
        };

        debug!(function = name, "calling function");
        let lua_args = args
            .iter()
            .map(|v| to_lua(&self.lua, v))
            .collect::<Result<mlua::MultiValue, ScriptError>>()?;

        let result: mlua::MultiValue = func
            .call(lua_args)
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;
        match result.into_iter().next() {
            Some(v) => from_lua(&v, 0),
            None => Ok(ScriptValue::Nil),
        }
    }

    /// True iff `name` resolves to a callable value.
    pub fn function_exists(&self, name: &str) -> Result<bool, ScriptError> {
        let globals = self.lua.globals();
        let value: Value = globals
            .get(name)
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;
        Ok(matches!(value, Value::Function(_)))
    }
}

fn install_callbacks(
    lua: &Lua,
    names: &[String],
    bridge: Rc<dyn CallbackBridge>,
) -> Result<(), ScriptError> {
    let globals = lua.globals();
    for name in names {
        let bridge = bridge.clone();
        let owned_name = name.clone();
        let func = lua
            .create_function(move |lua, args: mlua::MultiValue| {
                let script_args = args
                    .iter()
                    .map(|v| from_lua(v, 0))
                    .collect::<Result<Vec<_>, ScriptError>>()
                    .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
                let result = bridge
                    .invoke(&owned_name, &script_args)
                    .map_err(mlua::Error::RuntimeError)?;
                to_lua(lua, &result).map_err(|e| mlua::Error::RuntimeError(e.to_string()))
            })
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;
        globals
            .set(name.as_str(), func)
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;
    }
    Ok(())
}

fn to_lua(lua: &Lua, value: &ScriptValue) -> Result<mlua::MultiValue, ScriptError> {
    let v = to_lua_value(lua, value)?;
    let mut multi = mlua::MultiValue::new();
    multi.push_back(v);
    Ok(multi)
}

fn to_lua_value(lua: &Lua, value: &ScriptValue) -> Result<Value, ScriptError> {
    Ok(match value {
        ScriptValue::Nil => Value::Nil,
        ScriptValue::Bool(b) => Value::Boolean(*b),
        ScriptValue::Int(i) => Value::Integer(*i),
        ScriptValue::Float(f) => Value::Number(*f),
        ScriptValue::Str(bytes) => Value::String(
            lua.create_string(bytes)
                .map_err(|e| ScriptError::Marshal(e.to_string()))?,
        ),
        ScriptValue::Array(items) => {
            let table = lua
                .create_table()
                .map_err(|e| ScriptError::Marshal(e.to_string()))?;
            for (i, item) in items.iter().enumerate() {
                table
                    .set(i + 1, to_lua_value(lua, item)?)
                    .map_err(|e| ScriptError::Marshal(e.to_string()))?;
            }
            Value::Table(table)
        }
        ScriptValue::Map(entries) => {
            let table = lua
                .create_table()
                .map_err(|e| ScriptError::Marshal(e.to_string()))?;
            for (k, v) in entries {
                table
                    .set(k.as_str(), to_lua_value(lua, v)?)
                    .map_err(|e| ScriptError::Marshal(e.to_string()))?;
            }
            Value::Table(table)
        }
    })
}

/// Marshals a Lua value back into the host domain. `depth` bounds table
/// recursion; cycles are caught separately via `visited` in
/// [`table_to_script_value`].
fn from_lua(value: &Value, depth: usize) -> Result<ScriptValue, ScriptError> {
    if depth > MAX_MARSHAL_DEPTH {
        return Err(ScriptError::Marshal(format!(
            "table nesting exceeds max depth of {MAX_MARSHAL_DEPTH}"
        )));
    }
    Ok(match value {
        Value::Nil => ScriptValue::Nil,
        Value::Boolean(b) => ScriptValue::Bool(*b),
        Value::Integer(i) => ScriptValue::Int(*i),
        Value::Number(n) => ScriptValue::Float(*n),
        Value::String(s) => ScriptValue::Str(s.as_bytes().to_vec()),
        Value::Table(t) => table_to_script_value(t, depth, &mut Vec::new())?,
        other => {
            return Err(ScriptError::Marshal(format!(
                "cannot marshal value of type {}",
                other.type_name()
            )))
        }
    })
}

fn table_to_script_value(
    table: &Table,
    depth: usize,
    visited: &mut Vec<*const std::ffi::c_void>,
) -> Result<ScriptValue, ScriptError> {
    let ptr = table.to_pointer();
    if visited.contains(&ptr) {
        return Err(ScriptError::Marshal("cyclic table".to_string()));
    }
    visited.push(ptr);

    let len = table.raw_len();
    // Vacuously true for an empty table so `{}` round-trips as
    // `Array(vec![])` rather than `Map(vec![])`; any non-conforming key
    // (including a non-empty table with `len == 0`, e.g. `{foo="bar"}`)
    // falsifies it below.
    let mut is_array = true;
    let mut pair_count = 0usize;
    for pair in table.clone().pairs::<Value, Value>() {
        let (key, _) = pair.map_err(|e| ScriptError::Marshal(e.to_string()))?;
        pair_count += 1;
        match key {
            Value::Integer(i) if i >= 1 && (i as usize) <= len => {}
            _ => is_array = false,
        }
    }
    if pair_count != len as usize {
        is_array = false;
    }

    let result = if is_array {
        let mut items = Vec::with_capacity(len as usize);
        for i in 1..=len {
            let v: Value = table
                .get(i)
                .map_err(|e| ScriptError::Marshal(e.to_string()))?;
            items.push(from_lua_nested(&v, depth + 1, visited)?);
        }
        ScriptValue::Array(items)
    } else {
        let mut entries = Vec::with_capacity(pair_count);
        for pair in table.clone().pairs::<Value, Value>() {
            let (key, value) = pair.map_err(|e| ScriptError::Marshal(e.to_string()))?;
            let key_str = match key {
                Value::String(s) => s.to_str().map(|s| s.to_string()).unwrap_or_else(|_| {
                    String::from_utf8_lossy(&s.as_bytes().to_vec()).into_owned()
                }),
                Value::Integer(i) => i.to_string(),
                Value::Number(n) => n.to_string(),
                other => {
                    return Err(ScriptError::Marshal(format!(
                        "unsupported map key type {}",
                        other.type_name()
                    )))
                }
            };
            entries.push((key_str, from_lua_nested(&value, depth + 1, visited)?));
        }
        ScriptValue::Map(entries)
    };

    visited.pop();
    Ok(result)
}

fn from_lua_nested(
    value: &Value,
    depth: usize,
    visited: &mut Vec<*const std::ffi::c_void>,
) -> Result<ScriptValue, ScriptError> {
    if depth > MAX_MARSHAL_DEPTH {
        return Err(ScriptError::Marshal(format!(
            "table nesting exceeds max depth of {MAX_MARSHAL_DEPTH}"
        )));
    }
    match value {
        Value::Table(t) => table_to_script_value(t, depth, visited),
        other => from_lua(other, depth),
    }
}

/// An in-process, non-isolated convenience wrapper over [`Interpreter`]
/// for embedders that only need the language-level sandbox and limiter
/// and provide their own process isolation (or none, e.g. in tests).
/// This is additive to the isolated worker, not a replacement for it.
pub struct Sandbox {
    interpreter: Interpreter,
}

struct DirectBridge {
    callbacks: crate::types::Callbacks,
}

impl CallbackBridge for DirectBridge {
    fn invoke(&self, name: &str, args: &[ScriptValue]) -> Result<ScriptValue, String> {
        Ok(self.callbacks.call(name, args).unwrap_or(ScriptValue::Nil))
    }
}

impl Sandbox {
    pub fn new(
        memory_limit: Option<usize>,
        instruction_limit: Option<u64>,
        callbacks: crate::types::Callbacks,
    ) -> Result<Self, ScriptError> {
        let names = callbacks.names();
        let bridge: Rc<dyn CallbackBridge> = Rc::new(DirectBridge { callbacks });
        let interpreter = Interpreter::new(memory_limit, instruction_limit, &names, bridge)?;
        Ok(Self { interpreter })
    }

    pub fn execute(&self, source: &str) -> Result<(), ScriptError> {
        self.interpreter.execute(source)
    }

    pub fn call(&self, name: &str, args: &[ScriptValue]) -> Result<ScriptValue, ScriptError> {
        self.interpreter.call(name, args)
    }

    pub fn function_exists(&self, name: &str) -> Result<bool, ScriptError> {
        self.interpreter.function_exists(name)
    }
}
