//! Plugin adapter layer: the four personalities that present a sandbox to
//! the host pipeline.
//!
//! The router, config, and metrics are injected by reference at
//! construction; adapters own their sandbox and report fatal terminations
//! back into the pipeline as events so dashboards observe them.

pub mod decoder;
pub mod encoder;
pub mod filter;
pub mod source;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use thiserror::Error;

use sandlark_wire::{Event, FieldValue};

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::metrics::Metrics;
use crate::sandbox::Sandbox;

pub use decoder::DecoderAdapter;
pub use encoder::EncoderAdapter;
pub use filter::FilterAdapter;
pub use source::SourceAdapter;

/// Type prefix stamped onto filter-injected events.
pub const SANDBOX_TYPE_PREFIX: &str = "heka.sandbox.";
/// Type of the report event emitted when a sandbox dies.
pub const TERMINATED_TYPE: &str = "heka.sandbox-terminated";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("event channel closed")]
    Closed,
}

/// Where adapters hand events back to the host. Delivery may block on the
/// host's channel; `is_backpressured` feeds the slow-sandbox watchdog.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: Event) -> Result<(), SinkError>;
    fn is_backpressured(&self) -> bool {
        false
    }
}

/// Sink over a bounded tokio channel; `deliver` blocks when the channel is
/// full and reports backpressure while no capacity remains.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn new(tx: tokio::sync::mpsc::Sender<Event>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: Event) -> Result<(), SinkError> {
        self.tx.blocking_send(event).map_err(|_| SinkError::Closed)
    }

    fn is_backpressured(&self) -> bool {
        self.tx.capacity() == 0
    }
}

/// In-memory sink for tests and embedded hosts.
#[derive(Default)]
pub struct CollectSink {
    events: Mutex<Vec<Event>>,
    backpressured: AtomicBool,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Event> {
        let mut events = self.events.lock().unwrap();
        std::mem::take(&mut *events)
    }

    pub fn set_backpressured(&self, value: bool) {
        self.backpressured.store(value, Ordering::Relaxed);
    }
}

impl EventSink for CollectSink {
    fn deliver(&self, event: Event) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    fn is_backpressured(&self) -> bool {
        self.backpressured.load(Ordering::Relaxed)
    }
}

/// Host-side wiring shared by every adapter.
pub struct AdapterContext {
    pub name: String,
    pub sink: Arc<dyn EventSink>,
    pub metrics: Arc<Metrics>,
    pub abort: Arc<AtomicBool>,
}

impl AdapterContext {
    pub fn new(name: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            name: name.into(),
            sink,
            metrics: Arc::new(Metrics::new()),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_abort(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }
}

/// Slow-sandbox watchdog settings for decoders and filters.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogSettings {
    /// Rolling-mean call duration that terminates a sandbox while the host
    /// is backpressured.
    #[serde(default = "default_max_process_duration_ns")]
    pub max_process_duration_ns: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            max_process_duration_ns: default_max_process_duration_ns(),
        }
    }
}

fn default_max_process_duration_ns() -> u64 {
    100_000_000
}

/// The report event a dying sandbox leaves behind: plugin name in a field,
/// last error as the payload.
pub fn terminated_event(plugin_name: &str, last_error: &str) -> Event {
    let mut event = Event::new(TERMINATED_TYPE);
    event.payload = last_error.to_string();
    event.add_field("plugin", FieldValue::from(plugin_name), "");
    event
}

pub(crate) fn report_termination(ctx: &AdapterContext, message: &str) {
    let event = terminated_event(&ctx.name, message);
    if ctx.sink.deliver(event).is_err() {
        log::warn!("could not report termination of {}: channel closed", ctx.name);
    }
}

/// Create and initialize a sandbox, recovering from a corrupt preserve
/// file by starting fresh (the file is already deleted by init).
pub(crate) fn build_sandbox(
    cfg: &SandboxConfig,
    ctx: &AdapterContext,
    preserve_path: Option<&Path>,
) -> Result<Sandbox, SandboxError> {
    let mut sandbox = Sandbox::create(cfg.clone(), ctx.metrics.clone(), ctx.abort.clone())?;
    match sandbox.init(preserve_path) {
        Ok(()) => Ok(sandbox),
        Err(SandboxError::Restore(msg)) => {
            log::warn!(
                "{}: restore failed ({msg}); starting {} fresh",
                ctx.name,
                cfg.script_path.display()
            );
            let mut fresh = Sandbox::create(cfg.clone(), ctx.metrics.clone(), ctx.abort.clone())?;
            fresh.init(None)?;
            Ok(fresh)
        }
        Err(e) => {
            report_termination(ctx, sandbox.last_error());
            Err(e)
        }
    }
}

/// Terminate a sandbox whose rolling mean call duration exceeds the
/// configured ceiling while the host is backpressured.
pub(crate) fn check_watchdog(
    ctx: &AdapterContext,
    watchdog: &WatchdogSettings,
    sandbox: &mut Sandbox,
) -> Result<(), SandboxError> {
    if !ctx.sink.is_backpressured() {
        return Ok(());
    }
    let stats = sandbox.call_stats();
    if stats.samples == 0 || stats.rolling_mean_ns() <= watchdog.max_process_duration_ns {
        return Ok(());
    }
    let detail = format!(
        "rolling mean {}ns over {} samples (min {}ns, max {}ns, limit {}ns)",
        stats.rolling_mean_ns(),
        stats.samples,
        stats.min_ns,
        stats.max_ns,
        watchdog.max_process_duration_ns
    );
    sandbox.stop();
    ctx.metrics.inc_slow_termination();
    let error = SandboxError::BackpressureFatal(detail);
    report_termination(ctx, &error.to_string());
    Err(error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminated_event_carries_plugin_and_error() {
        let event = terminated_event("stats-filter", "instruction_limit exceeded");
        assert_eq!(event.event_type, TERMINATED_TYPE);
        assert_eq!(event.payload, "instruction_limit exceeded");
        assert_eq!(
            event.field("plugin", 0).unwrap().value,
            FieldValue::Str(vec!["stats-filter".into()])
        );
        assert_eq!(event.uuid.get_version_num(), 4);
    }

    #[test]
    fn collect_sink_gathers_and_resets() {
        let sink = CollectSink::new();
        sink.deliver(Event::new("a")).unwrap();
        sink.deliver(Event::new("b")).unwrap();
        let events = sink.take();
        assert_eq!(events.len(), 2);
        assert!(sink.take().is_empty());
        assert!(!sink.is_backpressured());
        sink.set_backpressured(true);
        assert!(sink.is_backpressured());
    }
}
