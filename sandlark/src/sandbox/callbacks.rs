//! The fixed set of host functions exposed to scripts.
//!
//! Every callback reaches the owning sandbox through a closure-captured
//! handle; no thread-local or process-global state is involved. Argument
//! validation failures surface as script errors and land in the sandbox's
//! last-error string.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use mlua::{Lua, Table, Value, Variadic};
use uuid::Uuid;

use sandlark_wire::{Event, Field, FieldValue};

use crate::cbuf::CircularBuffer;
use crate::config::ConfigValue;
use crate::error::{Resource, SandboxError};
use crate::outbuf::OutputBuffer;
use crate::sandbox::stdlib::lua_to_json;
use crate::sandbox::{HeaderMask, InjectedEvent, SandboxShared};

/// Status returned by `inject_message` when the host is shutting down.
pub const ABORT_STATUS: i64 = 1;

fn runtime_err(msg: impl Into<String>) -> mlua::Error {
    mlua::Error::RuntimeError(msg.into())
}

fn lock(shared: &Arc<Mutex<SandboxShared>>) -> mlua::Result<MutexGuard<'_, SandboxShared>> {
    shared
        .lock()
        .map_err(|_| runtime_err("sandbox state poisoned"))
}

fn non_negative(value: Option<i64>, what: &str) -> mlua::Result<usize> {
    let value = value.unwrap_or(0);
    usize::try_from(value).map_err(|_| runtime_err(format!("{what} must be non-negative")))
}

/// `Fields[name]` addressing; anything else is a header name.
fn fields_key(name: &str) -> Option<&str> {
    name.strip_prefix("Fields[")?.strip_suffix(']')
}

fn scalar_to_lua(lua: &Lua, value: &FieldValue, idx: usize) -> mlua::Result<Value> {
    Ok(match value {
        FieldValue::Str(vals) => match vals.get(idx) {
            Some(v) => Value::String(lua.create_string(v)?),
            None => Value::Nil,
        },
        FieldValue::Bytes(vals) => match vals.get(idx) {
            Some(v) => Value::String(lua.create_string(v)?),
            None => Value::Nil,
        },
        FieldValue::Int(vals) => vals.get(idx).map(|v| Value::Integer(*v)).unwrap_or(Value::Nil),
        FieldValue::Double(vals) => vals.get(idx).map(|v| Value::Number(*v)).unwrap_or(Value::Nil),
        FieldValue::Bool(vals) => vals.get(idx).map(|v| Value::Boolean(*v)).unwrap_or(Value::Nil),
    })
}

fn header_to_lua(lua: &Lua, event: &Event, name: &str) -> mlua::Result<Value> {
    Ok(match name {
        "Uuid" => Value::String(lua.create_string(event.uuid.as_bytes())?),
        "Timestamp" => Value::Integer(event.timestamp),
        "Type" => Value::String(lua.create_string(&event.event_type)?),
        "Logger" => Value::String(lua.create_string(&event.logger)?),
        "Severity" => Value::Integer(event.severity as i64),
        "Payload" => Value::String(lua.create_string(&event.payload)?),
        "EnvVersion" => Value::String(lua.create_string(&event.env_version)?),
        "Pid" => Value::Integer(event.pid as i64),
        "Hostname" => Value::String(lua.create_string(&event.hostname)?),
        _ => Value::Nil,
    })
}

enum Scalar {
    Str(String),
    Bytes(Vec<u8>),
    Double(f64),
    Bool(bool),
}

impl Scalar {
    fn into_value(self) -> FieldValue {
        match self {
            Scalar::Str(v) => FieldValue::Str(vec![v]),
            Scalar::Bytes(v) => FieldValue::Bytes(vec![v]),
            Scalar::Double(v) => FieldValue::Double(vec![v]),
            Scalar::Bool(v) => FieldValue::Bool(vec![v]),
        }
    }
}

/// Field writes accept string, number, and boolean values; numbers always
/// land as doubles.
fn lua_scalar(value: Value) -> mlua::Result<Scalar> {
    match value {
        Value::String(s) => match std::str::from_utf8(&s.as_bytes()) {
            Ok(text) => Ok(Scalar::Str(text.to_string())),
            Err(_) => Ok(Scalar::Bytes(s.as_bytes().to_vec())),
        },
        Value::Integer(i) => Ok(Scalar::Double(i as f64)),
        Value::Number(n) => Ok(Scalar::Double(n)),
        Value::Boolean(b) => Ok(Scalar::Bool(b)),
        other => Err(runtime_err(format!(
            "unsupported value type {}",
            other.type_name()
        ))),
    }
}

fn expect_string(value: Value, what: &str) -> mlua::Result<String> {
    match value {
        Value::String(s) => Ok(s.to_str()?.to_string()),
        other => Err(runtime_err(format!(
            "{what} must be a string, got {}",
            other.type_name()
        ))),
    }
}

fn expect_int(value: Value, what: &str) -> mlua::Result<i64> {
    match value {
        Value::Integer(i) => Ok(i),
        Value::Number(n) if n.fract() == 0.0 => Ok(n as i64),
        other => Err(runtime_err(format!(
            "{what} must be an integer, got {}",
            other.type_name()
        ))),
    }
}

fn parse_uuid(value: Value, what: &str) -> mlua::Result<Uuid> {
    let Value::String(s) = value else {
        return Err(runtime_err(format!("{what} must be a string")));
    };
    let bytes = s.as_bytes();
    if bytes.len() == 16 {
        return Uuid::from_slice(&bytes).map_err(|_| runtime_err(format!("{what} is malformed")));
    }
    match std::str::from_utf8(&bytes) {
        Ok(text) => Uuid::parse_str(text).map_err(|_| runtime_err(format!("{what} is malformed"))),
        Err(_) => Err(runtime_err(format!("{what} is malformed"))),
    }
}

fn write_header(event: &mut Event, name: &str, value: Value) -> mlua::Result<()> {
    match name {
        "Type" => event.event_type = expect_string(value, name)?,
        "Logger" => event.logger = expect_string(value, name)?,
        "Payload" => event.payload = expect_string(value, name)?,
        "EnvVersion" => event.env_version = expect_string(value, name)?,
        "Hostname" => event.hostname = expect_string(value, name)?,
        "Severity" => event.severity = expect_int(value, name)? as i32,
        "Pid" => event.pid = expect_int(value, name)? as i32,
        "Timestamp" => event.timestamp = expect_int(value, name)?,
        "Uuid" => event.uuid = parse_uuid(value, name)?,
        _ => return Err(runtime_err(format!("unknown header field '{name}'"))),
    }
    Ok(())
}

fn put_at<T>(vals: &mut Vec<T>, idx: usize, value: T) -> mlua::Result<()> {
    if idx < vals.len() {
        vals[idx] = value;
        Ok(())
    } else if idx == vals.len() {
        vals.push(value);
        Ok(())
    } else {
        Err(runtime_err("array_idx out of range"))
    }
}

fn set_in_field(field: &mut Field, scalar: Scalar, idx: usize) -> mlua::Result<()> {
    // A scalar field may be wholesale-replaced; arrays keep their type.
    if idx == 0 && field.value.len() <= 1 {
        field.value = scalar.into_value();
        return Ok(());
    }
    match (&mut field.value, scalar) {
        (FieldValue::Str(vals), Scalar::Str(v)) => put_at(vals, idx, v),
        (FieldValue::Bytes(vals), Scalar::Bytes(v)) => put_at(vals, idx, v),
        (FieldValue::Double(vals), Scalar::Double(v)) => put_at(vals, idx, v),
        (FieldValue::Bool(vals), Scalar::Bool(v)) => put_at(vals, idx, v),
        _ => Err(runtime_err(format!(
            "value type mismatch for field '{}'",
            field.name
        ))),
    }
}

fn write_field(
    event: &mut Event,
    name: &str,
    value: Value,
    representation: &str,
    field_idx: usize,
    array_idx: usize,
) -> mlua::Result<()> {
    if value.is_nil() {
        // Deleting a missing field is a no-op.
        event.remove_field(name, field_idx);
        return Ok(());
    }
    let scalar = lua_scalar(value)?;
    match event.field_mut(name, field_idx) {
        Some(field) => {
            if !representation.is_empty() {
                field.representation = representation.to_string();
            }
            set_in_field(field, scalar, array_idx)
        }
        None => {
            let existing = event.fields.iter().filter(|f| f.name == name).count();
            if field_idx != existing || array_idx != 0 {
                return Err(runtime_err(format!("field_idx out of range for '{name}'")));
            }
            event.add_field(name, scalar.into_value(), representation);
            Ok(())
        }
    }
}

fn table_string(t: &Table, key: &str) -> mlua::Result<Option<String>> {
    match t.get::<Value>(key)? {
        Value::Nil => Ok(None),
        Value::String(s) => Ok(Some(s.to_str()?.to_string())),
        other => Err(runtime_err(format!(
            "{key} must be a string, got {}",
            other.type_name()
        ))),
    }
}

fn table_int(t: &Table, key: &str) -> mlua::Result<Option<i64>> {
    match t.get::<Value>(key)? {
        Value::Nil => Ok(None),
        value => expect_int(value, key).map(Some),
    }
}

fn append_scalar(value: &mut FieldValue, scalar: Scalar) -> Result<(), ()> {
    match (value, scalar) {
        (FieldValue::Str(vals), Scalar::Str(v)) => vals.push(v),
        (FieldValue::Bytes(vals), Scalar::Bytes(v)) => vals.push(v),
        (FieldValue::Double(vals), Scalar::Double(v)) => vals.push(v),
        (FieldValue::Bool(vals), Scalar::Bool(v)) => vals.push(v),
        _ => return Err(()),
    }
    Ok(())
}

fn field_value_from_lua(name: &str, value: Value) -> mlua::Result<FieldValue> {
    match value {
        Value::Table(arr) => {
            let len = arr.raw_len() as i64;
            let mut out: Option<FieldValue> = None;
            for i in 1..=len {
                let item: Value = arr.raw_get(i)?;
                let scalar = lua_scalar(item)?;
                match out.as_mut() {
                    None => out = Some(scalar.into_value()),
                    Some(value) => append_scalar(value, scalar).map_err(|_| {
                        runtime_err(format!("mixed types in field array '{name}'"))
                    })?,
                }
            }
            Ok(out.unwrap_or(FieldValue::Str(Vec::new())))
        }
        other => Ok(lua_scalar(other)?.into_value()),
    }
}

/// Build an event from the table form accepted by `inject_message`.
fn event_from_table(t: &Table) -> mlua::Result<InjectedEvent> {
    let mut event = Event::new("");
    let mut headers = HeaderMask::default();
    if let Some(value) = t.get::<Option<Value>>("Uuid")? {
        if !value.is_nil() {
            event.uuid = parse_uuid(value, "Uuid")?;
            headers.uuid = true;
        }
    }
    if let Some(ts) = table_int(t, "Timestamp")? {
        event.timestamp = ts;
        headers.timestamp = true;
    }
    if let Some(v) = table_string(t, "Type")? {
        event.event_type = v;
        headers.event_type = true;
    }
    if let Some(v) = table_string(t, "Logger")? {
        event.logger = v;
        headers.logger = true;
    }
    if let Some(v) = table_string(t, "Payload")? {
        event.payload = v;
    }
    if let Some(v) = table_string(t, "EnvVersion")? {
        event.env_version = v;
    }
    if let Some(v) = table_string(t, "Hostname")? {
        event.hostname = v;
        headers.hostname = true;
    }
    if let Some(v) = table_int(t, "Severity")? {
        event.severity = v as i32;
        headers.severity = true;
    }
    if let Some(v) = table_int(t, "Pid")? {
        event.pid = v as i32;
        headers.pid = true;
    }
    if let Some(fields) = t.get::<Option<Table>>("Fields")? {
        for pair in fields.pairs::<Value, Value>() {
            let (key, value) = pair?;
            let name = match key {
                Value::String(s) => s.to_str()?.to_string(),
                other => {
                    return Err(runtime_err(format!(
                        "field names must be strings, got {}",
                        other.type_name()
                    )))
                }
            };
            let fv = field_value_from_lua(&name, value)?;
            event.add_field(name, fv, "");
        }
    }
    Ok(InjectedEvent { event, headers })
}

fn append_output(out: &mut OutputBuffer, value: &Value) -> mlua::Result<()> {
    let result = match value {
        Value::String(s) => out.append(&s.as_bytes()),
        Value::Integer(i) => out.write_fmt(format_args!("{i}")),
        Value::Number(n) => {
            if n.is_nan() {
                out.append(b"nan")
            } else if n.is_infinite() {
                out.append(if *n < 0.0 { &b"-inf"[..] } else { &b"inf"[..] })
            } else {
                out.write_fmt(format_args!("{n}"))
            }
        }
        Value::Boolean(b) => out.append(if *b { &b"true"[..] } else { &b"false"[..] }),
        Value::Table(_) => {
            let json = lua_to_json(value, 0)?;
            let text = serde_json::to_string(&json).map_err(mlua::Error::external)?;
            out.append(text.as_bytes())
        }
        Value::UserData(ud) => match ud.borrow::<CircularBuffer>() {
            Ok(cb) => out.append(cb.to_text().as_bytes()),
            Err(_) => return Err(runtime_err("output() unsupported argument")),
        },
        other => {
            return Err(runtime_err(format!(
                "output() does not accept {}",
                other.type_name()
            )))
        }
    };
    result.map_err(|e| match e {
        SandboxError::QuotaExceeded(Resource::Output) => runtime_err("output_limit exceeded"),
        other => runtime_err(other.to_string()),
    })
}

/// Register the host callbacks in the interpreter's globals.
pub(crate) fn install(lua: &Lua, shared: &Arc<Mutex<SandboxShared>>) -> mlua::Result<()> {
    let globals = lua.globals();

    {
        let shared = shared.clone();
        globals.set(
            "read_message",
            lua.create_function(
                move |lua, (name, field_idx, array_idx): (String, Option<i64>, Option<i64>)| {
                    let field_idx = non_negative(field_idx, "field_idx")?;
                    let array_idx = non_negative(array_idx, "array_idx")?;
                    let guard = lock(&shared)?;
                    let Some(event) = guard.event.as_ref() else {
                        return Ok(Value::Nil);
                    };
                    if let Some(field_name) = fields_key(&name) {
                        match event.field(field_name, field_idx) {
                            Some(field) => scalar_to_lua(lua, &field.value, array_idx),
                            None => Ok(Value::Nil),
                        }
                    } else {
                        header_to_lua(lua, event, &name)
                    }
                },
            )?,
        )?;
    }

    {
        let shared = shared.clone();
        globals.set(
            "read_next_field",
            lua.create_function(move |lua, ()| {
                let mut guard = lock(&shared)?;
                let mut values: Option<Vec<Value>> = None;
                if let Some(event) = guard.event.as_ref() {
                    if let Some(field) = event.fields.get(guard.iter_pos) {
                        let value = scalar_to_lua(lua, &field.value, 0)?;
                        values = Some(vec![
                            Value::Integer(field.value.type_tag() as i64),
                            Value::String(lua.create_string(&field.name)?),
                            value,
                            Value::String(lua.create_string(&field.representation)?),
                            Value::Integer(field.value.len() as i64),
                        ]);
                    }
                }
                match values {
                    Some(values) => {
                        guard.iter_pos += 1;
                        Ok(Variadic::from_iter(values))
                    }
                    None => Ok(Variadic::from_iter([Value::Nil])),
                }
            })?,
        )?;
    }

    {
        let shared = shared.clone();
        globals.set(
            "write_message",
            lua.create_function(
                move |_,
                      (name, value, representation, field_idx, array_idx): (
                    String,
                    Value,
                    Option<String>,
                    Option<i64>,
                    Option<i64>,
                )| {
                    let representation = representation.unwrap_or_default();
                    let field_idx = non_negative(field_idx, "field_idx")?;
                    let array_idx = non_negative(array_idx, "array_idx")?;
                    let mut guard = lock(&shared)?;
                    let Some(event) = guard.event.as_mut() else {
                        return Err(runtime_err("write_message() no current event"));
                    };
                    if let Some(field_name) = fields_key(&name) {
                        write_field(event, field_name, value, &representation, field_idx, array_idx)?;
                    } else {
                        if field_idx != 0 || array_idx != 0 {
                            return Err(runtime_err("array_idx out of range"));
                        }
                        write_header(event, &name, value)?;
                    }
                    guard.event_modified = true;
                    Ok(())
                },
            )?,
        )?;
    }

    {
        let shared = shared.clone();
        globals.set(
            "read_config",
            lua.create_function(move |lua, key: String| {
                let guard = lock(&shared)?;
                let cfg = &guard.cfg;
                Ok(match key.as_str() {
                    "memory_limit" => Value::Integer(cfg.memory_limit as i64),
                    "instruction_limit" => Value::Integer(cfg.instruction_limit as i64),
                    "output_limit" => Value::Integer(cfg.output_limit as i64),
                    "script_path" => {
                        Value::String(lua.create_string(cfg.script_path.display().to_string())?)
                    }
                    "module_directory" => match &cfg.module_directory {
                        Some(dir) => {
                            Value::String(lua.create_string(dir.display().to_string())?)
                        }
                        None => Value::Nil,
                    },
                    "plugin_type" => Value::String(lua.create_string(cfg.plugin_type.to_string())?),
                    "preserve_data" => Value::Boolean(cfg.preserve_data),
                    "profile" => Value::Boolean(cfg.profile),
                    "max_inject_per_call" => Value::Integer(cfg.max_inject_per_call as i64),
                    "tz" => match &cfg.tz {
                        Some(tz) => Value::String(lua.create_string(tz)?),
                        None => Value::Nil,
                    },
                    other => match cfg.config.get(other) {
                        Some(ConfigValue::String(s)) => Value::String(lua.create_string(s)?),
                        Some(ConfigValue::Number(n)) => Value::Number(*n),
                        Some(ConfigValue::Bool(b)) => Value::Boolean(*b),
                        None => Value::Nil,
                    },
                })
            })?,
        )?;
    }

    {
        let shared = shared.clone();
        globals.set(
            "inject_message",
            lua.create_function(move |_, (arg, name): (Value, Option<String>)| {
                let mut guard = lock(&shared)?;
                let cap = guard.cfg.max_inject_per_call;
                if cap > 0 && guard.inject_count >= cap {
                    return Err(runtime_err(format!("exceeded InjectMessage count ({cap})")));
                }
                if guard.abort.load(Ordering::Relaxed) {
                    return Ok(ABORT_STATUS);
                }
                let injected = match arg {
                    Value::String(s) => {
                        let payload = std::str::from_utf8(&s.as_bytes())
                            .map_err(|_| runtime_err("inject_message() payload must be utf-8"))?
                            .to_string();
                        let mut event = Event::new("");
                        event.payload = payload;
                        if let Some(name) = name {
                            event.add_field("payload_name", FieldValue::from(name.as_str()), "");
                        }
                        InjectedEvent {
                            event,
                            headers: HeaderMask::default(),
                        }
                    }
                    Value::Table(t) => event_from_table(&t)?,
                    Value::UserData(ud) => {
                        let cb = ud
                            .borrow::<CircularBuffer>()
                            .map_err(|_| runtime_err("inject_message() unsupported argument"))?;
                        let mut event = Event::new("");
                        event.payload = cb.to_text();
                        event.add_field("payload_type", FieldValue::from("cbuf"), "");
                        if let Some(name) = name {
                            event.add_field("payload_name", FieldValue::from(name.as_str()), "");
                        }
                        InjectedEvent {
                            event,
                            headers: HeaderMask::default(),
                        }
                    }
                    other => {
                        return Err(runtime_err(format!(
                            "inject_message() does not accept {}",
                            other.type_name()
                        )))
                    }
                };
                guard.inject_count += 1;
                guard.injected.push(injected);
                Ok(0i64)
            })?,
        )?;
    }

    {
        let shared = shared.clone();
        globals.set(
            "output",
            lua.create_function(move |_, args: Variadic<Value>| {
                if args.is_empty() {
                    return Err(runtime_err("output() must have at least one argument"));
                }
                let mut guard = lock(&shared)?;
                for value in args.iter() {
                    append_output(&mut guard.output, value)?;
                }
                Ok(())
            })?,
        )?;
    }

    Ok(())
}
