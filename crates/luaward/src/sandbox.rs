//! Surface-reduction policy applied to a freshly constructed interpreter
//! before any untrusted source is loaded.
//!
//! Rather than enumerate what scripts may do, the policy removes what
//! they may not: the library tables and globals that reach the
//! filesystem, process control, dynamic code loading, or metatable
//! manipulation, plus the implicit string metatable that would otherwise
//! let any string literal reach the (pruned) `string` library.

use mlua::{Lua, LuaOptions, StdLib};

use crate::types::ScriptError;

/// Library tables removed entirely.
const FORBIDDEN_LIBRARIES: &[&str] = &["os", "io", "debug", "package", "coroutine"];

/// Individual globals removed entirely.
const FORBIDDEN_GLOBALS: &[&str] = &[
    "dofile",
    "load",
    "loadfile",
    "loadstring",
    "require",
    "module",
    "collectgarbage",
    "getmetatable",
    "setmetatable",
    "rawget",
    "rawset",
    "rawequal",
    "rawlen",
];

/// Entries pruned from the `string` library rather than removing the
/// whole table (scripts still need `string.format`, `string.rep`, etc.).
const FORBIDDEN_STRING_ENTRIES: &[&str] = &["dump"];

/// Applies the full surface-reduction policy to `lua`. Must run exactly
/// once, before the interpreter is handed untrusted source, and before
/// `debug` is removed — sealing the string metatable needs `debug` to
/// still be present.
pub fn apply(lua: &Lua) -> Result<(), ScriptError> {
    seal_string_metatable(lua)?;
    prune_string_library(lua)?;
    remove_globals(lua, FORBIDDEN_GLOBALS)?;
    remove_globals(lua, FORBIDDEN_LIBRARIES)?;
    Ok(())
}

fn seal_string_metatable(lua: &Lua) -> Result<(), ScriptError> {
    // `debug.setmetatable` is the only way to reach the implicit
    // per-string metatable through the public API; it must run while
    // `debug` is still present, before `remove_globals` deletes it.
    // The replacement metatable's `__index` points at the (about to be
    // pruned) `string` table and defines nothing else, so scripts keep
    // `("x"):upper()`-style calls but cannot install new metamethods.
    lua.load(
        r#"
        local string_lib = string
        debug.setmetatable("", { __index = string_lib })
        "#,
    )
    .set_name("<sandbox:seal_string_metatable>")
    .exec()
    .map_err(|e| ScriptError::Runtime(e.to_string()))
}

fn prune_string_library(lua: &Lua) -> Result<(), ScriptError> {
    let globals = lua.globals();
    let string_table: mlua::Table = globals
        .get("string")
        .map_err(|e| ScriptError::Runtime(e.to_string()))?;
    for name in FORBIDDEN_STRING_ENTRIES {
        string_table
            .set(*name, mlua::Value::Nil)
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;
    }
    Ok(())
}

fn remove_globals(lua: &Lua, names: &[&str]) -> Result<(), ScriptError> {
    let globals = lua.globals();
    for name in names {
        globals
            .set(*name, mlua::Value::Nil)
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandboxed() -> Lua {
        // `debug` must be loaded for `apply` to seal the string
        // metatable before stripping `debug` itself; see `vm::Interpreter::new`.
        let lua = Lua::new_with(StdLib::ALL, LuaOptions::default()).unwrap();
        apply(&lua).expect("sandbox install");
        lua
    }

    #[test]
    fn forbidden_libraries_are_nil() {
        let lua = sandboxed();
        for name in FORBIDDEN_LIBRARIES {
            let v: mlua::Value = lua.globals().get(*name).unwrap();
            assert!(matches!(v, mlua::Value::Nil), "{name} should be nil");
        }
    }

    #[test]
    fn forbidden_global_functions_are_nil() {
        let lua = sandboxed();
        for name in FORBIDDEN_GLOBALS {
            let v: mlua::Value = lua.globals().get(*name).unwrap();
            assert!(matches!(v, mlua::Value::Nil), "{name} should be nil");
        }
    }

    #[test]
    fn os_execute_is_unreachable() {
        let lua = sandboxed();
        let err = lua
            .load(r#"return os.execute("ls")"#)
            .exec()
            .unwrap_err()
            .to_string();
        assert!(err.contains("nil value"), "got: {err}");
    }

    #[test]
    fn io_open_is_unreachable() {
        let lua = sandboxed();
        let err = lua
            .load(r#"return io.open("/etc/passwd", "r")"#)
            .exec()
            .unwrap_err()
            .to_string();
        assert!(err.contains("nil value"), "got: {err}");
    }

    #[test]
    fn string_dump_is_removed() {
        let lua = sandboxed();
        let err = lua
            .load(r#"return (""):dump()"#)
            .exec()
            .unwrap_err()
            .to_string();
        assert!(err.contains("nil value"), "got: {err}");
    }

    #[test]
    fn string_methods_still_work_through_sealed_metatable() {
        let lua = sandboxed();
        let result: String = lua.load(r#"return ("hello"):upper()"#).eval().unwrap();
        assert_eq!(result, "HELLO");
    }

    #[test]
    fn setmetatable_is_unreachable() {
        let lua = sandboxed();
        let err = lua
            .load("return setmetatable({}, {})")
            .exec()
            .unwrap_err()
            .to_string();
        assert!(err.contains("nil value"), "got: {err}");
    }
}
