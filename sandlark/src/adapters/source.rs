//! Source personality: the script is polled for events and its injections
//! feed the host's inbound channel.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::adapters::{build_sandbox, report_termination, AdapterContext};
use crate::config::{PluginKind, SandboxConfig};
use crate::error::SandboxError;
use crate::sandbox::Sandbox;

pub struct SourceAdapter {
    sandbox: Sandbox,
    ctx: AdapterContext,
    poll_interval: Duration,
}

impl SourceAdapter {
    pub fn new(
        mut cfg: SandboxConfig,
        ctx: AdapterContext,
        poll_interval: Duration,
        preserve_path: Option<&Path>,
    ) -> Result<Self, SandboxError> {
        cfg.plugin_type = PluginKind::Source;
        // Sources produce at their own pace; the per-call cap is for
        // stream-driven plugins.
        cfg.max_inject_per_call = 0;
        let sandbox = build_sandbox(&cfg, &ctx, preserve_path)?;
        Ok(Self {
            sandbox,
            ctx,
            poll_interval,
        })
    }

    /// One poll: run the script's input entry point and deliver whatever
    /// it injected. Returns the script's status code; any non-zero code
    /// means the source is done.
    pub fn poll_once(&mut self) -> Result<i64, SandboxError> {
        let outcome = match self.sandbox.poll_input() {
            Ok(outcome) => outcome,
            Err(e) => {
                report_termination(&self.ctx, self.sandbox.last_error());
                return Err(e);
            }
        };
        for injected in self.sandbox.take_injected() {
            if self.ctx.sink.deliver(injected.event).is_err() {
                return Err(SandboxError::AbortRequested);
            }
        }
        Ok(outcome.code)
    }

    /// Poll until the script returns non-zero, a fatal error lands, or the
    /// host aborts. Zero means keep polling.
    pub fn run(mut self) -> Result<(), SandboxError> {
        loop {
            if self.ctx.abort.load(Ordering::Relaxed) {
                self.sandbox.stop();
                return Ok(());
            }
            match self.poll_once() {
                Ok(0) => {}
                Ok(_) => {
                    // Graceful self-termination.
                    self.sandbox.stop();
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            if !self.poll_interval.is_zero() {
                std::thread::sleep(self.poll_interval);
            }
        }
    }

    /// Run the polling loop off the async runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<(), SandboxError>> {
        tokio::task::spawn_blocking(move || self.run())
    }

    /// Periodic tick for sources that emit on a schedule.
    pub fn tick(&mut self, ns: i64) -> Result<(), SandboxError> {
        let outcome = match self.sandbox.timer_event(ns) {
            Ok(outcome) => outcome,
            Err(e) => {
                report_termination(&self.ctx, self.sandbox.last_error());
                return Err(e);
            }
        };
        for injected in self.sandbox.take_injected() {
            if self.ctx.sink.deliver(injected.event).is_err() {
                return Err(SandboxError::AbortRequested);
            }
        }
        if outcome.code > 0 {
            report_termination(&self.ctx, self.sandbox.last_error());
            return Err(SandboxError::ScriptFault(
                self.sandbox.last_error().to_string(),
            ));
        }
        Ok(())
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
    use std::io::Write;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn script_file(code: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(code.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn polling_delivers_until_the_script_stops() {
        let file = script_file(
            r#"
polls = 0
function on_input()
  polls = polls + 1
  inject_message({ Type = "sample", Fields = { n = polls } })
  if polls >= 3 then return 1 end
  return 0
end
"#,
        );
        let sink = Arc::new(CollectSink::new());
        let ctx = AdapterContext::new("poller", sink.clone());
        let source = SourceAdapter::new(
            SandboxConfig::new(file.path()),
            ctx,
            Duration::ZERO,
            None,
        )
        .unwrap();
        // Non-zero return after three polls ends the loop gracefully.
        source.run().unwrap();
        assert_eq!(sink.take().len(), 3);
    }

    #[test]
    fn scripts_without_on_input_fall_back_to_on_message() {
        let file = script_file(
            r#"
function on_message()
  inject_message("polled payload")
  return 0
end
"#,
        );
        let sink = Arc::new(CollectSink::new());
        let ctx = AdapterContext::new("fallback", sink.clone());
        let mut source = SourceAdapter::new(
            SandboxConfig::new(file.path()),
            ctx,
            Duration::ZERO,
            None,
        )
        .unwrap();
        assert_eq!(source.poll_once().unwrap(), 0);
        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, "polled payload");
    }

    #[tokio::test]
    async fn abort_flag_stops_a_spawned_source() {
        let file = script_file(
            r#"
function on_input()
  return 0
end
"#,
        );
        let sink = Arc::new(CollectSink::new());
        let abort = Arc::new(AtomicBool::new(false));
        let ctx = AdapterContext::new("looper", sink).with_abort(abort.clone());
        let source = SourceAdapter::new(
            SandboxConfig::new(file.path()),
            ctx,
            Duration::from_millis(1),
            None,
        )
        .unwrap();
        let handle = source.spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        abort.store(true, Ordering::Relaxed);
        handle.await.unwrap().unwrap();
    }
}
