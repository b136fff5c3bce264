//! Encoder personality: the script renders an event into bytes, with a
//! wire-codec fallback when it produces nothing itself.

use std::path::Path;

use sandlark_wire::{encode_event, Event};

use crate::adapters::{build_sandbox, report_termination, AdapterContext};
use crate::config::{PluginKind, SandboxConfig};
use crate::error::SandboxError;
use crate::sandbox::Sandbox;

pub struct EncoderAdapter {
    sandbox: Sandbox,
    ctx: AdapterContext,
}

impl EncoderAdapter {
    pub fn new(
        mut cfg: SandboxConfig,
        ctx: AdapterContext,
        preserve_path: Option<&Path>,
    ) -> Result<Self, SandboxError> {
        cfg.plugin_type = PluginKind::Encoder;
        let sandbox = build_sandbox(&cfg, &ctx, preserve_path)?;
        Ok(Self { sandbox, ctx })
    }

    /// Encode one event. Precedence: an injected event is wire-encoded,
    /// bytes written through `output` are returned verbatim, and a script
    /// that produced neither falls back to the wire encoding of the
    /// (possibly mutated) current event. A soft failure yields None.
    pub fn encode(&mut self, event: Event) -> Result<Option<Vec<u8>>, SandboxError> {
        let outcome = match self.sandbox.process_message(Some(event)) {
            Ok(outcome) => outcome,
            Err(e) => {
                report_termination(&self.ctx, self.sandbox.last_error());
                return Err(e);
            }
        };
        if outcome.code > 0 {
            report_termination(&self.ctx, self.sandbox.last_error());
            return Err(SandboxError::ScriptFault(
                self.sandbox.last_error().to_string(),
            ));
        }
        if outcome.code < 0 {
            self.sandbox.take_event();
            return Ok(None);
        }

        let injected = self.sandbox.take_injected();
        if let Some(first) = injected.into_iter().next() {
            self.sandbox.take_event();
            return Ok(Some(encode_event(&first.event).to_vec()));
        }
        let output = self.sandbox.take_output();
        if !output.is_empty() {
            self.sandbox.take_event();
            return Ok(Some(output));
        }
        match self.sandbox.take_event() {
            Some(current) => Ok(Some(encode_event(&current).to_vec())),
            None => Ok(None),
        }
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn shutdown(mut self, preserve_path: Option<&Path>) -> Result<(), SandboxError> {
        self.sandbox.stop();
        self.sandbox.destroy(preserve_path).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::CollectSink;
    use sandlark_wire::{decode_event, FieldValue};
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn script_file(code: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(code.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn encoder_for(code: &str) -> EncoderAdapter {
        let file = script_file(code);
        let ctx = AdapterContext::new("wire-encoder", Arc::new(CollectSink::new()));
        let encoder =
            EncoderAdapter::new(SandboxConfig::new(file.path()), ctx, None).unwrap();
        // Keep the script alive for the adapter's lifetime.
        std::mem::forget(file);
        encoder
    }

    #[test]
    fn output_bytes_win_over_the_fallback() {
        let mut encoder = encoder_for(
            r#"
function on_message()
  output("rendered:", read_message("Payload"))
  return 0
end
"#,
        );
        let mut event = Event::new("t");
        event.payload = "hello".into();
        let bytes = encoder.encode(event).unwrap().unwrap();
        assert_eq!(bytes, b"rendered:hello".to_vec());
    }

    #[test]
    fn silent_scripts_fall_back_to_the_wire_codec() {
        let mut encoder = encoder_for(
            r#"
function on_message()
  write_message("Fields[status]", "ok")
  return 0
end
"#,
        );
        let mut event = Event::new("t");
        event.timestamp = 42;
        let bytes = encoder.encode(event.clone()).unwrap().unwrap();
        let decoded = decode_event(&bytes).unwrap();
        assert_eq!(decoded.uuid, event.uuid);
        assert_eq!(decoded.timestamp, 42);
        // The fallback encodes the mutated view.
        assert_eq!(
            decoded.field("status", 0).unwrap().value,
            FieldValue::Str(vec!["ok".into()])
        );
    }

    #[test]
    fn injected_events_are_wire_encoded() {
        let mut encoder = encoder_for(
            r#"
function on_message()
  inject_message({ Type = "framed", Timestamp = 7, Payload = "body" })
  return 0
end
"#,
        );
        let bytes = encoder.encode(Event::new("t")).unwrap().unwrap();
        let decoded = decode_event(&bytes).unwrap();
        assert_eq!(decoded.event_type, "framed");
        assert_eq!(decoded.timestamp, 7);
        assert_eq!(decoded.payload, "body");
    }

    #[test]
    fn soft_failure_encodes_nothing() {
        let mut encoder = encoder_for("function on_message() return -1 end");
        assert!(encoder.encode(Event::new("t")).unwrap().is_none());
    }
}
