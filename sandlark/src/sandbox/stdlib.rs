//! Allow-listed standard libraries and the sandboxed `require`.
//!
//! Core libraries load with denied names blanked out of both the module
//! table and the globals, so a script redefining them gains nothing. The
//! `cbuf` and `cjson` modules are host-provided; any other name resolves
//! only under the configured read-only module directory.

use std::sync::{Arc, Mutex};

use mlua::{Lua, LuaOptions, StdLib, Table, Value};

use crate::cbuf::CircularBuffer;
use crate::sandbox::SandboxShared;

pub(crate) const MODULES_KEY: &str = "sandlark.modules";

const DENIED_GLOBALS: &[&str] = &[
    "dofile",
    "load",
    "loadfile",
    "loadstring",
    "collectgarbage",
    "print",
];
const DENIED_OS: &[&str] = &["execute", "exit", "remove", "rename", "setlocale", "tmpname"];
const DENIED_STRING: &[&str] = &["dump"];

const MAX_JSON_DEPTH: usize = 32;

/// Build the interpreter with the allow-listed library set.
pub(crate) fn new_interpreter() -> mlua::Result<Lua> {
    let libs = StdLib::COROUTINE | StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::OS;
    Lua::new_with(libs, LuaOptions::default())
}

/// Blank denied names, register the host modules, and replace `require`.
pub(crate) fn install(lua: &Lua, shared: &Arc<Mutex<SandboxShared>>) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in DENIED_GLOBALS {
        globals.set(*name, Value::Nil)?;
    }
    if let Some(os_table) = globals.get::<Option<Table>>("os")? {
        for name in DENIED_OS {
            os_table.set(*name, Value::Nil)?;
        }
    }
    if let Some(string_table) = globals.get::<Option<Table>>("string")? {
        for name in DENIED_STRING {
            string_table.set(*name, Value::Nil)?;
        }
    }

    let modules = lua.create_table()?;
    for name in ["coroutine", "math", "os", "string", "table"] {
        if let Some(table) = globals.get::<Option<Table>>(name)? {
            modules.set(name, table)?;
        }
    }

    let cbuf = lua.create_table()?;
    cbuf.set(
        "new",
        lua.create_function(|lua, (rows, columns, spr): (i64, i64, i64)| {
            let rows = usize::try_from(rows).unwrap_or(0);
            let columns = usize::try_from(columns).unwrap_or(0);
            let spr = u32::try_from(spr).unwrap_or(0);
            let cb = CircularBuffer::new(rows, columns, spr)
                .map_err(|e| mlua::Error::RuntimeError(format!("new() {e}")))?;
            lua.create_userdata(cb)
        })?,
    )?;
    modules.set("cbuf", cbuf.clone())?;
    // Preserved-state blocks reference the module as a global.
    globals.set("cbuf", cbuf)?;

    let cjson = lua.create_table()?;
    cjson.set(
        "encode",
        lua.create_function(|_, value: Value| {
            let json = lua_to_json(&value, 0)?;
            serde_json::to_string(&json).map_err(mlua::Error::external)
        })?,
    )?;
    cjson.set(
        "decode",
        lua.create_function(|lua, text: String| {
            let json: serde_json::Value =
                serde_json::from_str(&text).map_err(mlua::Error::external)?;
            json_to_lua(lua, &json)
        })?,
    )?;
    modules.set("cjson", cjson)?;

    lua.set_named_registry_value(MODULES_KEY, modules)?;

    let shared = shared.clone();
    let require = lua.create_function(move |lua, name: String| {
        let modules: Table = lua.named_registry_value(MODULES_KEY)?;
        let cached: Value = modules.get(name.as_str())?;
        if !cached.is_nil() {
            return Ok(cached);
        }
        let dir = {
            let guard = shared
                .lock()
                .map_err(|_| mlua::Error::RuntimeError("sandbox state poisoned".into()))?;
            guard.cfg.module_directory.clone()
        };
        if let Some(dir) = dir {
            if !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                let path = dir.join(format!("{name}.lua"));
                if path.is_file() {
                    let src = std::fs::read_to_string(&path).map_err(mlua::Error::external)?;
                    let value = lua.load(src.as_str()).set_name(name.clone()).eval::<Value>()?;
                    modules.set(name.as_str(), value.clone())?;
                    return Ok(value);
                }
            }
        }
        Err(mlua::Error::RuntimeError(format!(
            "library '{name}' is not available"
        )))
    })?;
    globals.set("require", require)?;
    Ok(())
}

/// Convert a Lua value into JSON. Tables with a non-empty array part
/// become arrays; everything else becomes an object with string keys.
pub(crate) fn lua_to_json(value: &Value, depth: usize) -> mlua::Result<serde_json::Value> {
    if depth > MAX_JSON_DEPTH {
        return Err(mlua::Error::RuntimeError(
            "structure is nested too deeply".into(),
        ));
    }
    Ok(match value {
        Value::Nil => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.to_str()?.to_string()),
        Value::Table(t) => {
            let len = t.raw_len() as i64;
            if len > 0 {
                let mut items = Vec::with_capacity(len as usize);
                for i in 1..=len {
                    let item: Value = t.raw_get(i)?;
                    items.push(lua_to_json(&item, depth + 1)?);
                }
                serde_json::Value::Array(items)
            } else {
                let mut map = serde_json::Map::new();
                let t = t.clone();
                for pair in t.pairs::<Value, Value>() {
                    let (k, v) = pair?;
                    let key = match &k {
                        Value::String(s) => s.to_str()?.to_string(),
                        Value::Integer(i) => i.to_string(),
                        Value::Number(n) => n.to_string(),
                        other => {
                            return Err(mlua::Error::RuntimeError(format!(
                                "cannot use {} as an object key",
                                other.type_name()
                            )))
                        }
                    };
                    map.insert(key, lua_to_json(&v, depth + 1)?);
                }
                serde_json::Value::Object(map)
            }
        }
        other => {
            return Err(mlua::Error::RuntimeError(format!(
                "cannot serialize {}",
                other.type_name()
            )))
        }
    })
}

pub(crate) fn json_to_lua(lua: &Lua, value: &serde_json::Value) -> mlua::Result<Value> {
    Ok(match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else {
                Value::Number(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::String(lua.create_string(s)?),
        serde_json::Value::Array(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i as i64 + 1, json_to_lua(lua, item)?)?;
            }
            Value::Table(table)
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_to_lua(lua, v)?)?;
            }
            Value::Table(table)
        }
    })
}
