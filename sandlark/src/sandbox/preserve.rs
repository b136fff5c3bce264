//! Global-state preservation and restoration.
//!
//! The serializer walks the script's globals host-side and emits a Lua
//! source fragment of assignments that rebuilds the reachable value graph.
//! Tables are deduplicated by interpreter identity so shared references and
//! cycles restore as shared references; entries are emitted in sorted key
//! order so the output is deterministic. The restorer is the interpreter
//! itself, run with the memory ceiling doubled and the instruction hook
//! disabled.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use mlua::{Lua, Table, Value};

use crate::cbuf::CircularBuffer;
use crate::error::{Resource, SandboxError};
use crate::outbuf::OutputBuffer;
use crate::sandbox::quota::InstructionState;
use crate::sandbox::stdlib::MODULES_KEY;

/// Serialize the reachable globals to `path`, bounded by `budget` bytes.
/// No file is left behind on failure.
pub(crate) fn preserve(lua: &Lua, path: &Path, budget: usize) -> Result<(), SandboxError> {
    let globals = lua.globals();

    let mut module_ids: HashSet<usize> = HashSet::new();
    if let Ok(modules) = lua.named_registry_value::<Table>(MODULES_KEY) {
        for pair in modules.pairs::<Value, Value>() {
            let (_, value) = pair.map_err(|e| SandboxError::Preserve(e.to_string()))?;
            if let Value::Table(t) = value {
                module_ids.insert(t.to_pointer() as usize);
            }
        }
    }
    module_ids.insert(globals.to_pointer() as usize);

    let mut seen: HashMap<usize, String> = HashMap::new();
    let mut out = OutputBuffer::new(budget);
    match serialize_table(&mut out, &mut seen, &module_ids, &globals, "_G") {
        Ok(()) => {}
        Err(SandboxError::QuotaExceeded(Resource::Output)) => {
            let _ = std::fs::remove_file(path);
            return Err(SandboxError::Preserve(
                "state serialization exceeded the output budget".into(),
            ));
        }
        Err(e) => {
            let _ = std::fs::remove_file(path);
            return Err(e);
        }
    }
    std::fs::write(path, out.as_slice()).map_err(|e| {
        let _ = std::fs::remove_file(path);
        SandboxError::Preserve(e.to_string())
    })
}

/// Execute a preserved-state file under relaxed limits, then reinstate
/// them. The caller deletes the file when this fails.
pub(crate) fn restore(
    lua: &Lua,
    path: &Path,
    memory_limit: usize,
    instructions: &InstructionState,
) -> Result<(), SandboxError> {
    let src =
        std::fs::read_to_string(path).map_err(|e| SandboxError::Restore(e.to_string()))?;
    instructions.set_enabled(false);
    let raised = if memory_limit > 0 {
        lua.set_memory_limit(memory_limit.saturating_mul(2)).is_ok()
    } else {
        false
    };
    let result = lua.load(src.as_str()).set_name("preserved-state").exec();
    if raised {
        let _ = lua.set_memory_limit(memory_limit);
    }
    instructions.set_enabled(true);
    result.map_err(|e| SandboxError::Restore(e.to_string()))
}

fn serialize_table(
    out: &mut OutputBuffer,
    seen: &mut HashMap<usize, String>,
    module_ids: &HashSet<usize>,
    table: &Table,
    path: &str,
) -> Result<(), SandboxError> {
    let mut entries: Vec<(String, Value)> = Vec::new();
    let t = table.clone();
    for pair in t.pairs::<Value, Value>() {
        let (key, value) = pair.map_err(|e| SandboxError::Preserve(e.to_string()))?;
        let repr = match key_repr(&key) {
            Some(repr) => repr,
            None => continue,
        };
        if let Value::String(s) = &key {
            if s.as_bytes().first() == Some(&b'_') {
                continue;
            }
        }
        entries.push((repr, value));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    for (repr, value) in entries {
        let child = format!("{path}[{repr}]");
        emit_value(out, seen, module_ids, &child, &value)?;
    }
    Ok(())
}

fn emit_value(
    out: &mut OutputBuffer,
    seen: &mut HashMap<usize, String>,
    module_ids: &HashSet<usize>,
    path: &str,
    value: &Value,
) -> Result<(), SandboxError> {
    match value {
        Value::Boolean(b) => out.write_fmt(format_args!("{path} = {b}\n")),
        Value::Integer(i) => out.write_fmt(format_args!("{path} = {i}\n")),
        Value::Number(n) => out.write_fmt(format_args!("{path} = {}\n", float_repr(*n))),
        Value::String(s) => {
            out.write_fmt(format_args!("{path} = {}\n", quote_lua(&s.as_bytes())))
        }
        Value::Table(t) => {
            let id = t.to_pointer() as usize;
            if module_ids.contains(&id) || t.metatable().is_some() {
                return Ok(());
            }
            if let Some(first) = seen.get(&id) {
                return out.write_fmt(format_args!("{path} = {first}\n"));
            }
            seen.insert(id, path.to_string());
            out.write_fmt(format_args!("{path} = {{}}\n"))?;
            serialize_table(out, seen, module_ids, t, path)
        }
        Value::UserData(ud) => match ud.borrow::<CircularBuffer>() {
            Ok(cb) => {
                out.write_fmt(format_args!(
                    "{path} = cbuf.new({}, {}, {})\n",
                    cb.rows(),
                    cb.columns(),
                    cb.seconds_per_row()
                ))?;
                for col in 0..cb.columns() {
                    if let Some(header) = cb.header(col) {
                        out.write_fmt(format_args!(
                            "{path}:set_header({}, \"{}\", \"{}\")\n",
                            col + 1,
                            header.name,
                            header.aggregation.as_str()
                        ))?;
                    }
                }
                out.write_fmt(format_args!("{path}:from_string(\"{}\")\n", cb.snapshot()))
            }
            Err(_) => Ok(()),
        },
        // Functions, threads, and light userdata are not preserved.
        _ => Ok(()),
    }
}

fn key_repr(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(quote_lua(&s.as_bytes())),
        Value::Integer(i) => Some(i.to_string()),
        Value::Number(n) if n.is_finite() => Some(float_repr(*n)),
        _ => None,
    }
}

/// Round-trip float literal; non-finite values use the division idioms the
/// interpreter evaluates back to them.
fn float_repr(n: f64) -> String {
    if n.is_nan() {
        "0/0".to_string()
    } else if n.is_infinite() {
        if n < 0.0 { "-1/0" } else { "1/0" }.to_string()
    } else {
        format!("{n:?}")
    }
}

/// `%q`-style quoting producing pure-ASCII Lua string literals. Control
/// and non-ASCII bytes become three-digit decimal escapes so binary-safe
/// strings survive the text file.
fn quote_lua(bytes: &[u8]) -> String {
    let mut quoted = String::with_capacity(bytes.len() + 2);
    quoted.push('"');
    for &b in bytes {
        match b {
            b'"' => quoted.push_str("\\\""),
            b'\\' => quoted.push_str("\\\\"),
            b'\n' => quoted.push_str("\\n"),
            b'\r' => quoted.push_str("\\r"),
            0x20..=0x7e => quoted.push(b as char),
            _ => quoted.push_str(&format!("\\{b:03}")),
        }
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_escapes_the_troublemakers() {
        assert_eq!(quote_lua(b"plain"), "\"plain\"");
        assert_eq!(quote_lua(b"a\"b"), "\"a\\\"b\"");
        assert_eq!(quote_lua(b"back\\slash"), "\"back\\\\slash\"");
        assert_eq!(quote_lua(b"line\nbreak"), "\"line\\nbreak\"");
        assert_eq!(quote_lua(&[0x01, 0xff]), "\"\\001\\255\"");
        assert_eq!(quote_lua(b""), "\"\"");
    }

    #[test]
    fn float_literals_round_trip_in_lua() {
        assert_eq!(float_repr(10.5), "10.5");
        assert_eq!(float_repr(10.0), "10.0");
        assert_eq!(float_repr(f64::NAN), "0/0");
        assert_eq!(float_repr(f64::INFINITY), "1/0");
        assert_eq!(float_repr(f64::NEG_INFINITY), "-1/0");
    }
}
