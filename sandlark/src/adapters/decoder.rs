//! Decoder personality: the script turns one inbound event into zero or
//! more replacement events.

use std::path::Path;

use sandlark_wire::{decode_event, Event};

use crate::adapters::{
    build_sandbox, check_watchdog, report_termination, AdapterContext, WatchdogSettings,
};
use crate::config::{PluginKind, SandboxConfig};
use crate::error::SandboxError;
use crate::sandbox::{InjectedEvent, Sandbox};

pub struct DecoderAdapter {
    sandbox: Sandbox,
    ctx: AdapterContext,
    watchdog: WatchdogSettings,
}

impl DecoderAdapter {
    pub fn new(
        mut cfg: SandboxConfig,
        ctx: AdapterContext,
        watchdog: WatchdogSettings,
        preserve_path: Option<&Path>,
    ) -> Result<Self, SandboxError> {
        cfg.plugin_type = PluginKind::Decoder;
        let sandbox = build_sandbox(&cfg, &ctx, preserve_path)?;
        Ok(Self {
            sandbox,
            ctx,
            watchdog,
        })
    }

    /// Run the script over one inbound event. Injected events replace the
    /// input; with no injections the (possibly mutated) input passes
    /// through. A soft failure drops the event.
    pub fn decode(&mut self, event: Event) -> Result<Vec<Event>, SandboxError> {
        let inbound = event.clone();
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
            check_watchdog(&self.ctx, &self.watchdog, &mut self.sandbox)?;
            return Ok(Vec::new());
        }

        let mut injected = self.sandbox.take_injected();
        let events = if injected.is_empty() {
            self.sandbox.take_event().into_iter().collect()
        } else {
            if let Some(first) = injected.first_mut() {
                inherit_headers(first, &inbound);
            }
            self.sandbox.take_event();
            injected.into_iter().map(|i| i.event).collect()
        };
        check_watchdog(&self.ctx, &self.watchdog, &mut self.sandbox)?;
        Ok(events)
    }

    /// Decode an event straight off the wire. Malformed bytes surface as
    /// `SandboxError::Codec` without touching the sandbox; well-formed
    /// events go through `decode`.
    pub fn decode_wire(&mut self, bytes: &[u8]) -> Result<Vec<Event>, SandboxError> {
        let event = decode_event(bytes)?;
        self.decode(event)
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn shutdown(mut self, preserve_path: Option<&Path>) -> Result<(), SandboxError> {
        self.sandbox.stop();
        self.sandbox.destroy(preserve_path).map(|_| ())
    }
}

/// The first injected event inherits every header the script did not set
/// explicitly.
fn inherit_headers(injected: &mut InjectedEvent, inbound: &Event) {
    let mask = injected.headers;
    let event = &mut injected.event;
    if !mask.uuid {
        event.uuid = inbound.uuid;
    }
    if !mask.timestamp {
        event.timestamp = inbound.timestamp;
    }
    if !mask.event_type {
        event.event_type = inbound.event_type.clone();
    }
    if !mask.hostname {
        event.hostname = inbound.hostname.clone();
    }
    if !mask.logger {
        event.logger = inbound.logger.clone();
    }
    if !mask.severity {
        event.severity = inbound.severity;
    }
    if !mask.pid {
        event.pid = inbound.pid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::CollectSink;
    use sandlark_wire::FieldValue;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn script_file(code: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(code.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn ctx() -> (AdapterContext, Arc<CollectSink>) {
        let sink = Arc::new(CollectSink::new());
        (AdapterContext::new("log-decoder", sink.clone()), sink)
    }

    fn inbound() -> Event {
        let mut event = Event::new("raw.line");
        event.logger = "tailer".into();
        event.hostname = "node-7".into();
        event.severity = 3;
        event.pid = 99;
        event.payload = "GET /index 200".into();
        event
    }

    #[test]
    fn passthrough_keeps_the_mutated_event() {
        let file = script_file(
            r#"
function on_message()
  write_message("Fields[status]", "200")
  return 0
end
"#,
        );
        let (ctx, _sink) = ctx();
        let mut decoder = DecoderAdapter::new(
            SandboxConfig::new(file.path()),
            ctx,
            WatchdogSettings::default(),
            None,
        )
        .unwrap();
        let events = decoder.decode(inbound()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "raw.line");
        assert_eq!(
            events[0].field("status", 0).unwrap().value,
            FieldValue::Str(vec!["200".into()])
        );
    }

    #[test]
    fn first_injection_inherits_missing_headers() {
        let file = script_file(
            r#"
function on_message()
  inject_message({ Fields = { parsed = true } })
  inject_message({ Type = "second", Logger = "mine" })
  return 0
end
"#,
        );
        let (ctx, _sink) = ctx();
        let mut decoder = DecoderAdapter::new(
            SandboxConfig::new(file.path()),
            ctx,
            WatchdogSettings::default(),
            None,
        )
        .unwrap();
        let input = inbound();
        let events = decoder.decode(input.clone()).unwrap();
        assert_eq!(events.len(), 2);

        // First injection inherited everything it did not set.
        assert_eq!(events[0].uuid, input.uuid);
        assert_eq!(events[0].timestamp, input.timestamp);
        assert_eq!(events[0].event_type, "raw.line");
        assert_eq!(events[0].logger, "tailer");
        assert_eq!(events[0].hostname, "node-7");
        assert_eq!(events[0].severity, 3);
        assert_eq!(events[0].pid, 99);
        assert_eq!(
            events[0].field("parsed", 0).unwrap().value,
            FieldValue::Bool(vec![true])
        );

        // Later injections stand on their own.
        assert_eq!(events[1].event_type, "second");
        assert_eq!(events[1].logger, "mine");
        assert_ne!(events[1].uuid, input.uuid);
    }

    #[test]
    fn wire_bytes_decode_through_the_script() {
        let file = script_file(
            r#"
function on_message()
  write_message("Fields[status]", "200")
  return 0
end
"#,
        );
        let (ctx, sink) = ctx();
        let mut decoder = DecoderAdapter::new(
            SandboxConfig::new(file.path()),
            ctx,
            WatchdogSettings::default(),
            None,
        )
        .unwrap();

        let input = inbound();
        let events = decoder
            .decode_wire(&sandlark_wire::encode_event(&input))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].uuid, input.uuid);
        assert_eq!(
            events[0].field("status", 0).unwrap().value,
            FieldValue::Str(vec!["200".into()])
        );

        // Malformed bytes fail at the codec without touching the sandbox.
        let err = decoder.decode_wire(&[0x0a, 0x03, 0x00]).unwrap_err();
        assert!(matches!(err, SandboxError::Codec(_)));
        assert_eq!(
            decoder.sandbox().status(),
            crate::sandbox::Status::Running
        );
        assert!(sink.take().is_empty());
    }

    #[test]
    fn soft_failure_drops_the_event() {
        let file = script_file("function on_message() return -1 end");
        let (ctx, _sink) = ctx();
        let mut decoder = DecoderAdapter::new(
            SandboxConfig::new(file.path()),
            ctx,
            WatchdogSettings::default(),
            None,
        )
        .unwrap();
        assert!(decoder.decode(inbound()).unwrap().is_empty());
    }

    #[test]
    fn fatal_failure_reports_a_termination_event() {
        let file = script_file("function on_message() error('parse wedge') end");
        let (ctx, sink) = ctx();
        let mut decoder = DecoderAdapter::new(
            SandboxConfig::new(file.path()),
            ctx,
            WatchdogSettings::default(),
            None,
        )
        .unwrap();
        assert!(decoder.decode(inbound()).is_err());
        let reports = sink.take();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].event_type, crate::adapters::TERMINATED_TYPE);
        assert!(reports[0].payload.contains("parse wedge"));
        assert_eq!(
            reports[0].field("plugin", 0).unwrap().value,
            FieldValue::Str(vec!["log-decoder".into()])
        );
    }

    #[test]
    fn backpressured_slow_sandbox_is_terminated() {
        let file = script_file(
            r#"
function on_message()
  local x = 0
  for i = 1, 200000 do x = x + i end
  return 0
end
"#,
        );
        let (ctx, sink) = ctx();
        sink.set_backpressured(true);
        let mut cfg = SandboxConfig::new(file.path());
        cfg.profile = true;
        let mut decoder = DecoderAdapter::new(
            cfg,
            ctx,
            WatchdogSettings {
                max_process_duration_ns: 1,
            },
            None,
        )
        .unwrap();
        let err = decoder.decode(inbound()).unwrap_err();
        assert!(matches!(err, SandboxError::BackpressureFatal(_)));
        let reports = sink.take();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].payload.contains("running slowly and blocking the router"));
    }
}
