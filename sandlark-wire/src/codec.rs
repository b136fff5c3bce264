//! Length-delimited tagged binary codec for events.
//!
//! Tag byte = `(field_id << 3) | wire_type`. Wire types: 0 = varint,
//! 1 = fixed 8 bytes (little-endian double), 2 = length-delimited.
//! The encoder is forward-only: nested field records get a one-byte length
//! placeholder which is widened in place when the true length needs a
//! longer varint.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use crate::event::{Event, Field, FieldValue, DEFAULT_SEVERITY};

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;

// Header field ids, canonical encode order.
const ID_UUID: u64 = 1;
const ID_TIMESTAMP: u64 = 2;
const ID_TYPE: u64 = 3;
const ID_LOGGER: u64 = 4;
const ID_SEVERITY: u64 = 5;
const ID_PAYLOAD: u64 = 6;
const ID_ENV_VERSION: u64 = 7;
const ID_PID: u64 = 8;
const ID_HOSTNAME: u64 = 9;
const ID_FIELDS: u64 = 10;

// Nested field record ids.
const FID_NAME: u64 = 1;
const FID_VALUE_TYPE: u64 = 2;
const FID_REPRESENTATION: u64 = 3;
const FID_VALUE_STRING: u64 = 4;
const FID_VALUE_BYTES: u64 = 5;
const FID_VALUE_INTEGER: u64 = 6;
const FID_VALUE_DOUBLE: u64 = 7;
const FID_VALUE_BOOL: u64 = 8;

/// Malformed wire input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown wire type {0}")]
    UnknownWireType(u8),
    #[error("mixed types in field value array")]
    MixedArray,
    #[error("truncated wire data")]
    Truncated,
    #[error("uuid must be exactly 16 bytes, got {0}")]
    InvalidUuid(usize),
    #[error("event missing required header '{0}'")]
    MissingHeader(&'static str),
    #[error("field {0} has unexpected wire type {1}")]
    UnexpectedWireType(u64, u8),
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
}

/// Encode an event into the wire form. Never fails on a well-formed event.
pub fn encode_event(event: &Event) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + event.payload.len());

    put_tag(&mut buf, ID_UUID, WIRE_LEN);
    put_varint(&mut buf, 16);
    buf.put_slice(event.uuid.as_bytes());

    put_tag(&mut buf, ID_TIMESTAMP, WIRE_VARINT);
    put_varint(&mut buf, event.timestamp as u64);

    put_tag(&mut buf, ID_TYPE, WIRE_LEN);
    put_varint(&mut buf, event.event_type.len() as u64);
    buf.put_slice(event.event_type.as_bytes());

    if !event.logger.is_empty() {
        put_len_delimited(&mut buf, ID_LOGGER, event.logger.as_bytes());
    }
    if event.severity != DEFAULT_SEVERITY {
        put_tag(&mut buf, ID_SEVERITY, WIRE_VARINT);
        // Header int32s are zero-extended; only field integers carry the
        // ten-byte negative form.
        put_varint(&mut buf, event.severity as u32 as u64);
    }
    if !event.payload.is_empty() {
        put_len_delimited(&mut buf, ID_PAYLOAD, event.payload.as_bytes());
    }
    if !event.env_version.is_empty() {
        put_len_delimited(&mut buf, ID_ENV_VERSION, event.env_version.as_bytes());
    }
    if event.pid != 0 {
        put_tag(&mut buf, ID_PID, WIRE_VARINT);
        put_varint(&mut buf, event.pid as u32 as u64);
    }
    if !event.hostname.is_empty() {
        put_len_delimited(&mut buf, ID_HOSTNAME, event.hostname.as_bytes());
    }
    for field in &event.fields {
        put_field(&mut buf, field);
    }
    buf.freeze()
}

/// Decode an event from its wire form.
pub fn decode_event(data: &[u8]) -> Result<Event, CodecError> {
    let mut ev = Event {
        severity: DEFAULT_SEVERITY,
        ..Event::default()
    };
    let mut saw_uuid = false;
    let mut saw_timestamp = false;

    let mut pos = 0usize;
    while pos < data.len() {
        let key = read_varint(data, &mut pos)?;
        let id = key >> 3;
        let wire = (key & 0x7) as u8;
        match id {
            ID_UUID => {
                let raw = expect_len(data, &mut pos, id, wire)?;
                if raw.len() != 16 {
                    return Err(CodecError::InvalidUuid(raw.len()));
                }
                ev.uuid = Uuid::from_slice(raw).map_err(|_| CodecError::InvalidUuid(raw.len()))?;
                saw_uuid = true;
            }
            ID_TIMESTAMP => {
                ev.timestamp = expect_varint(data, &mut pos, id, wire)? as i64;
                saw_timestamp = true;
            }
            ID_TYPE => ev.event_type = expect_string(data, &mut pos, id, wire, "type")?,
            ID_LOGGER => ev.logger = expect_string(data, &mut pos, id, wire, "logger")?,
            ID_SEVERITY => ev.severity = expect_varint(data, &mut pos, id, wire)? as i64 as i32,
            ID_PAYLOAD => ev.payload = expect_string(data, &mut pos, id, wire, "payload")?,
            ID_ENV_VERSION => {
                ev.env_version = expect_string(data, &mut pos, id, wire, "env_version")?
            }
            ID_PID => ev.pid = expect_varint(data, &mut pos, id, wire)? as i64 as i32,
            ID_HOSTNAME => ev.hostname = expect_string(data, &mut pos, id, wire, "hostname")?,
            ID_FIELDS => {
                let raw = expect_len(data, &mut pos, id, wire)?;
                ev.fields.push(decode_field(raw)?);
            }
            _ => skip_value(data, &mut pos, wire)?,
        }
    }
    if !saw_uuid {
        return Err(CodecError::MissingHeader("uuid"));
    }
    if !saw_timestamp {
        return Err(CodecError::MissingHeader("timestamp"));
    }
    Ok(ev)
}

/// Append `v` as a little-endian base-128 varint (high bit = continuation).
pub fn put_varint(buf: &mut BytesMut, mut v: u64) {
    loop {
        let b = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.put_u8(b);
            return;
        }
        buf.put_u8(b | 0x80);
    }
}

/// Read a varint, failing with `Truncated` when the continuation bit runs
/// off the end of the input.
pub fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64, CodecError> {
    let mut out = 0u64;
    let mut shift = 0u32;
    loop {
        if *pos >= data.len() {
            return Err(CodecError::Truncated);
        }
        let b = data[*pos];
        *pos += 1;
        if shift >= 64 {
            return Err(CodecError::Truncated);
        }
        out |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            return Ok(out);
        }
        shift += 7;
    }
}

fn varint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

fn put_tag(buf: &mut BytesMut, id: u64, wire: u8) {
    put_varint(buf, id << 3 | wire as u64);
}

fn put_len_delimited(buf: &mut BytesMut, id: u64, data: &[u8]) {
    put_tag(buf, id, WIRE_LEN);
    put_varint(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Emit a nested field record with a one-byte length placeholder, then
/// widen the slot in place when the real length needs more bytes.
fn put_field(buf: &mut BytesMut, field: &Field) {
    put_tag(buf, ID_FIELDS, WIRE_LEN);
    let len_pos = buf.len();
    buf.put_u8(0);
    let start = buf.len();
    put_field_body(buf, field);
    let body_len = buf.len() - start;
    patch_len(buf, len_pos, body_len);
}

fn patch_len(buf: &mut BytesMut, len_pos: usize, body_len: usize) {
    let need = varint_len(body_len as u64);
    if need > 1 {
        let old_end = buf.len();
        buf.resize(old_end + need - 1, 0);
        buf.copy_within(len_pos + 1..old_end, len_pos + need);
    }
    let mut v = body_len as u64;
    let mut i = len_pos;
    loop {
        let b = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf[i] = b;
            return;
        }
        buf[i] = b | 0x80;
        i += 1;
    }
}

fn put_field_body(buf: &mut BytesMut, field: &Field) {
    put_len_delimited(buf, FID_NAME, field.name.as_bytes());
    let tag = field.value.type_tag();
    if tag != 0 {
        put_tag(buf, FID_VALUE_TYPE, WIRE_VARINT);
        put_varint(buf, tag);
    }
    if !field.representation.is_empty() {
        put_len_delimited(buf, FID_REPRESENTATION, field.representation.as_bytes());
    }
    match &field.value {
        FieldValue::Str(vals) => {
            for v in vals {
                put_len_delimited(buf, FID_VALUE_STRING, v.as_bytes());
            }
        }
        FieldValue::Bytes(vals) => {
            for v in vals {
                put_len_delimited(buf, FID_VALUE_BYTES, v);
            }
        }
        FieldValue::Int(vals) => {
            if vals.len() == 1 {
                put_tag(buf, FID_VALUE_INTEGER, WIRE_VARINT);
                put_varint(buf, vals[0] as u64);
            } else {
                let total: usize = vals.iter().map(|v| varint_len(*v as u64)).sum();
                put_tag(buf, FID_VALUE_INTEGER, WIRE_LEN);
                put_varint(buf, total as u64);
                for v in vals {
                    put_varint(buf, *v as u64);
                }
            }
        }
        FieldValue::Double(vals) => {
            if vals.len() == 1 {
                put_tag(buf, FID_VALUE_DOUBLE, WIRE_FIXED64);
                buf.put_slice(&vals[0].to_le_bytes());
            } else {
                put_tag(buf, FID_VALUE_DOUBLE, WIRE_LEN);
                put_varint(buf, (vals.len() * 8) as u64);
                for v in vals {
                    buf.put_slice(&v.to_le_bytes());
                }
            }
        }
        FieldValue::Bool(vals) => {
            for v in vals {
                put_tag(buf, FID_VALUE_BOOL, WIRE_VARINT);
                put_varint(buf, u64::from(*v));
            }
        }
    }
}

fn decode_field(data: &[u8]) -> Result<Field, CodecError> {
    let mut name = String::new();
    let mut representation = String::new();
    let mut declared: Option<u64> = None;
    let mut value: Option<FieldValue> = None;

    let mut pos = 0usize;
    while pos < data.len() {
        let key = read_varint(data, &mut pos)?;
        let id = key >> 3;
        let wire = (key & 0x7) as u8;
        match id {
            FID_NAME => name = expect_string(data, &mut pos, id, wire, "field name")?,
            FID_VALUE_TYPE => declared = Some(expect_varint(data, &mut pos, id, wire)?),
            FID_REPRESENTATION => {
                representation = expect_string(data, &mut pos, id, wire, "representation")?
            }
            FID_VALUE_STRING => {
                let raw = expect_len(data, &mut pos, id, wire)?;
                let s = std::str::from_utf8(raw)
                    .map_err(|_| CodecError::InvalidUtf8("field value"))?
                    .to_string();
                match value.get_or_insert_with(|| FieldValue::Str(Vec::new())) {
                    FieldValue::Str(vals) => vals.push(s),
                    _ => return Err(CodecError::MixedArray),
                }
            }
            FID_VALUE_BYTES => {
                let raw = expect_len(data, &mut pos, id, wire)?;
                match value.get_or_insert_with(|| FieldValue::Bytes(Vec::new())) {
                    FieldValue::Bytes(vals) => vals.push(raw.to_vec()),
                    _ => return Err(CodecError::MixedArray),
                }
            }
            FID_VALUE_INTEGER => {
                let vals = match value.get_or_insert_with(|| FieldValue::Int(Vec::new())) {
                    FieldValue::Int(vals) => vals,
                    _ => return Err(CodecError::MixedArray),
                };
                match wire {
                    WIRE_VARINT => vals.push(read_varint(data, &mut pos)? as i64),
                    WIRE_LEN => {
                        let raw = take_len(data, &mut pos)?;
                        let mut p = 0usize;
                        while p < raw.len() {
                            vals.push(read_varint(raw, &mut p)? as i64);
                        }
                    }
                    WIRE_FIXED64 => return Err(CodecError::UnexpectedWireType(id, wire)),
                    other => return Err(CodecError::UnknownWireType(other)),
                }
            }
            FID_VALUE_DOUBLE => {
                let vals = match value.get_or_insert_with(|| FieldValue::Double(Vec::new())) {
                    FieldValue::Double(vals) => vals,
                    _ => return Err(CodecError::MixedArray),
                };
                match wire {
                    WIRE_FIXED64 => vals.push(read_fixed64(data, &mut pos)?),
                    WIRE_LEN => {
                        let raw = take_len(data, &mut pos)?;
                        if raw.len() % 8 != 0 {
                            return Err(CodecError::Truncated);
                        }
                        for chunk in raw.chunks_exact(8) {
                            let mut le = [0u8; 8];
                            le.copy_from_slice(chunk);
                            vals.push(f64::from_le_bytes(le));
                        }
                    }
                    WIRE_VARINT => return Err(CodecError::UnexpectedWireType(id, wire)),
                    other => return Err(CodecError::UnknownWireType(other)),
                }
            }
            FID_VALUE_BOOL => {
                let vals = match value.get_or_insert_with(|| FieldValue::Bool(Vec::new())) {
                    FieldValue::Bool(vals) => vals,
                    _ => return Err(CodecError::MixedArray),
                };
                match wire {
                    WIRE_VARINT => vals.push(read_varint(data, &mut pos)? != 0),
                    WIRE_LEN => {
                        let raw = take_len(data, &mut pos)?;
                        let mut p = 0usize;
                        while p < raw.len() {
                            vals.push(read_varint(raw, &mut p)? != 0);
                        }
                    }
                    WIRE_FIXED64 => return Err(CodecError::UnexpectedWireType(id, wire)),
                    other => return Err(CodecError::UnknownWireType(other)),
                }
            }
            _ => skip_value(data, &mut pos, wire)?,
        }
    }

    let value = match (value, declared) {
        (Some(v), Some(d)) if v.type_tag() != d => return Err(CodecError::MixedArray),
        (Some(v), _) => v,
        (None, d) => empty_value(d.unwrap_or(0))?,
    };
    Ok(Field {
        name,
        representation,
        value,
    })
}

fn empty_value(declared: u64) -> Result<FieldValue, CodecError> {
    Ok(match declared {
        0 => FieldValue::Str(Vec::new()),
        1 => FieldValue::Bytes(Vec::new()),
        2 => FieldValue::Int(Vec::new()),
        3 => FieldValue::Double(Vec::new()),
        4 => FieldValue::Bool(Vec::new()),
        _ => return Err(CodecError::MixedArray),
    })
}

fn take_len<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8], CodecError> {
    let len = read_varint(data, pos)? as usize;
    if data.len() - *pos < len {
        return Err(CodecError::Truncated);
    }
    let out = &data[*pos..*pos + len];
    *pos += len;
    Ok(out)
}

fn expect_len<'a>(
    data: &'a [u8],
    pos: &mut usize,
    id: u64,
    wire: u8,
) -> Result<&'a [u8], CodecError> {
    match wire {
        WIRE_LEN => take_len(data, pos),
        WIRE_VARINT | WIRE_FIXED64 => Err(CodecError::UnexpectedWireType(id, wire)),
        other => Err(CodecError::UnknownWireType(other)),
    }
}

fn expect_varint(data: &[u8], pos: &mut usize, id: u64, wire: u8) -> Result<u64, CodecError> {
    match wire {
        WIRE_VARINT => read_varint(data, pos),
        WIRE_LEN | WIRE_FIXED64 => Err(CodecError::UnexpectedWireType(id, wire)),
        other => Err(CodecError::UnknownWireType(other)),
    }
}

fn expect_string(
    data: &[u8],
    pos: &mut usize,
    id: u64,
    wire: u8,
    what: &'static str,
) -> Result<String, CodecError> {
    let raw = expect_len(data, pos, id, wire)?;
    std::str::from_utf8(raw)
        .map(|s| s.to_string())
        .map_err(|_| CodecError::InvalidUtf8(what))
}

fn read_fixed64(data: &[u8], pos: &mut usize) -> Result<f64, CodecError> {
    if data.len() - *pos < 8 {
        return Err(CodecError::Truncated);
    }
    let mut le = [0u8; 8];
    le.copy_from_slice(&data[*pos..*pos + 8]);
    *pos += 8;
    Ok(f64::from_le_bytes(le))
}

fn skip_value(data: &[u8], pos: &mut usize, wire: u8) -> Result<(), CodecError> {
    match wire {
        WIRE_VARINT => {
            read_varint(data, pos)?;
        }
        WIRE_FIXED64 => {
            if data.len() - *pos < 8 {
                return Err(CodecError::Truncated);
            }
            *pos += 8;
        }
        WIRE_LEN => {
            take_len(data, pos)?;
        }
        other => return Err(CodecError::UnknownWireType(other)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        let mut ev = Event::default();
        ev.uuid = Uuid::from_bytes([7u8; 16]);
        ev.timestamp = 1_234_567_890;
        ev.event_type = "logfile".into();
        ev.logger = "tailer".into();
        ev.hostname = "node-1".into();
        ev.payload = "raw line".into();
        ev.pid = 4242;
        ev
    }

    #[test]
    fn round_trips_headers_and_fields() {
        let mut ev = sample_event();
        ev.severity = 3;
        ev.env_version = "0.9".into();
        ev.add_field("status", FieldValue::from("ok"), "");
        ev.add_field("count", FieldValue::Int(vec![1, -2, 300]), "count");
        ev.add_field("ratio", FieldValue::from(0.25), "");
        ev.add_field("flags", FieldValue::Bool(vec![true, false]), "");
        ev.add_field("blob", FieldValue::Bytes(vec![vec![0, 159, 146]]), "bin");

        let wire = encode_event(&ev);
        let back = decode_event(&wire).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn round_trips_empty_strings_and_zero_fields() {
        let mut ev = Event::default();
        ev.uuid = Uuid::from_bytes([1u8; 16]);
        ev.timestamp = 1;
        let back = decode_event(&encode_event(&ev)).unwrap();
        assert_eq!(back, ev);
        assert!(back.fields.is_empty());
        assert_eq!(back.event_type, "");
    }

    #[test]
    fn bytes_field_with_empty_representation_round_trips() {
        let mut ev = sample_event();
        ev.add_field("raw", FieldValue::Bytes(vec![vec![0xff, 0x00]]), "");
        let back = decode_event(&encode_event(&ev)).unwrap();
        assert_eq!(back.field("raw", 0).unwrap().representation, "");
        assert_eq!(
            back.field("raw", 0).unwrap().value,
            FieldValue::Bytes(vec![vec![0xff, 0x00]])
        );
    }

    #[test]
    fn negative_severity_round_trips_zero_extended() {
        let mut ev = sample_event();
        ev.severity = -2;
        let back = decode_event(&encode_event(&ev)).unwrap();
        assert_eq!(back.severity, -2);
        // Zero-extension keeps the header varint at five bytes.
        let mut buf = BytesMut::new();
        put_varint(&mut buf, -2i32 as u32 as u64);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn negative_integer_encodes_as_ten_bytes() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, -1i64 as u64);
        assert_eq!(buf.len(), 10);
        let mut pos = 0;
        assert_eq!(read_varint(&buf, &mut pos).unwrap() as i64, -1);
    }

    #[test]
    fn decodes_minimal_header_bytes() {
        // uuid + timestamp 5123456789 + type "TEST", hand-assembled.
        let uuid: [u8; 16] = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10,
        ];
        let mut wire = vec![0x0a, 0x10];
        wire.extend_from_slice(&uuid);
        wire.push(0x10);
        let mut ts = BytesMut::new();
        put_varint(&mut ts, 5_123_456_789);
        wire.extend_from_slice(&ts);
        wire.extend_from_slice(&[0x1a, 0x04]);
        wire.extend_from_slice(b"TEST");

        let ev = decode_event(&wire).unwrap();
        assert_eq!(ev.uuid.as_bytes(), &uuid);
        assert_eq!(ev.timestamp, 5_123_456_789);
        assert_eq!(ev.event_type, "TEST");
        assert!(ev.fields.is_empty());
    }

    #[test]
    fn rejects_seventeen_byte_uuid() {
        let mut wire = vec![0x0a, 0x11];
        wire.extend_from_slice(&[0u8; 17]);
        assert_eq!(decode_event(&wire), Err(CodecError::InvalidUuid(17)));
    }

    #[test]
    fn rejects_unknown_wire_type() {
        // id 2, wire type 5.
        let wire = [0x15, 0x00];
        assert_eq!(decode_event(&wire), Err(CodecError::UnknownWireType(5)));
    }

    #[test]
    fn rejects_unterminated_varint() {
        let wire = [0x10, 0xff, 0xff];
        assert_eq!(decode_event(&wire), Err(CodecError::Truncated));
    }

    #[test]
    fn rejects_length_past_end() {
        let wire = [0x0a, 0x20, 0x01];
        assert_eq!(decode_event(&wire), Err(CodecError::Truncated));
    }

    #[test]
    fn rejects_mixed_value_ids_in_one_field() {
        // field record: name "x", one string value, one integer value.
        let mut body = BytesMut::new();
        put_len_delimited(&mut body, FID_NAME, b"x");
        put_len_delimited(&mut body, FID_VALUE_STRING, b"s");
        put_tag(&mut body, FID_VALUE_INTEGER, WIRE_VARINT);
        put_varint(&mut body, 9);

        let mut wire = BytesMut::new();
        // Minimal valid header first.
        put_tag(&mut wire, ID_UUID, WIRE_LEN);
        put_varint(&mut wire, 16);
        wire.put_slice(&[0u8; 16]);
        put_tag(&mut wire, ID_TIMESTAMP, WIRE_VARINT);
        put_varint(&mut wire, 1);
        put_tag(&mut wire, ID_FIELDS, WIRE_LEN);
        put_varint(&mut wire, body.len() as u64);
        wire.put_slice(&body);

        assert_eq!(decode_event(&wire), Err(CodecError::MixedArray));
    }

    #[test]
    fn field_length_placeholder_is_widened_for_long_bodies() {
        let mut ev = sample_event();
        ev.add_field("big", FieldValue::Str(vec!["y".repeat(300)]), "");
        let wire = encode_event(&ev);
        let back = decode_event(&wire).unwrap();
        assert_eq!(back.field("big", 0).unwrap().value, ev.field("big", 0).unwrap().value);
    }

    #[test]
    fn skips_unknown_field_ids() {
        let mut wire = BytesMut::new();
        put_tag(&mut wire, ID_UUID, WIRE_LEN);
        put_varint(&mut wire, 16);
        wire.put_slice(&[3u8; 16]);
        put_tag(&mut wire, ID_TIMESTAMP, WIRE_VARINT);
        put_varint(&mut wire, 77);
        // id 60, varint payload: ignored.
        put_tag(&mut wire, 60, WIRE_VARINT);
        put_varint(&mut wire, 12345);

        let ev = decode_event(&wire).unwrap();
        assert_eq!(ev.timestamp, 77);
    }
}
