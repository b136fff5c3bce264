//! Sandbox lifecycle: creation, initialization (optionally from preserved
//! state), entry-point dispatch under quotas, and destruction with
//! preserve-on-exit.
//!
//! A sandbox is single-threaded cooperative: exactly one host thread enters
//! it at a time, and the interpreter yields only at instruction-hook ticks
//! and host-callback boundaries.

pub(crate) mod callbacks;
pub(crate) mod preserve;
pub mod quota;
pub(crate) mod stdlib;

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use mlua::{Function, Lua, Value};

use sandlark_wire::Event;

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::metrics::Metrics;
use crate::outbuf::OutputBuffer;
use quota::{CallTiming, DurationStats, InstructionState, UsageKind, UsageStat, UsageTable};

/// Last-error strings are capped at this many bytes.
pub const MAX_ERROR_LEN: usize = 255;

const SAMPLE_DENOMINATOR: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Unknown,
    Running,
    Terminated,
}

/// Which header fields an injected event carried explicitly; the decoder
/// adapter inherits the rest from the inbound event.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderMask {
    pub uuid: bool,
    pub timestamp: bool,
    pub event_type: bool,
    pub logger: bool,
    pub severity: bool,
    pub pid: bool,
    pub hostname: bool,
}

#[derive(Debug, Clone)]
pub struct InjectedEvent {
    pub event: Event,
    pub headers: HeaderMask,
}

/// Result of one entry-point call. 0 = success, < 0 = soft failure (the
/// event is dropped, the sandbox keeps running), > 0 = fatal (the sandbox
/// is already terminated when the caller sees this).
#[derive(Debug, Clone, Default)]
pub struct EntryOutcome {
    pub code: i64,
    pub message: Option<String>,
}

/// State shared between the sandbox and its host callbacks through
/// closure captures.
pub(crate) struct SandboxShared {
    pub(crate) cfg: SandboxConfig,
    pub(crate) event: Option<Event>,
    pub(crate) event_modified: bool,
    pub(crate) injected: Vec<InjectedEvent>,
    pub(crate) output: OutputBuffer,
    pub(crate) iter_pos: usize,
    pub(crate) inject_count: u32,
    pub(crate) abort: Arc<AtomicBool>,
}

pub struct Sandbox {
    lua: Lua,
    cfg: SandboxConfig,
    shared: Arc<Mutex<SandboxShared>>,
    instructions: Arc<InstructionState>,
    usage: UsageTable,
    timing: CallTiming,
    status: Status,
    last_error: String,
    metrics: Arc<Metrics>,
}

impl Sandbox {
    /// Build the interpreter under the configured ceilings. The script does
    /// not run yet; the sandbox starts in `Unknown`.
    pub fn create(
        cfg: SandboxConfig,
        metrics: Arc<Metrics>,
        abort: Arc<AtomicBool>,
    ) -> Result<Self, SandboxError> {
        let lua = stdlib::new_interpreter().map_err(|e| SandboxError::ScriptFault(e.to_string()))?;
        if cfg.memory_limit > 0 {
            lua.set_memory_limit(cfg.memory_limit)
                .map_err(|e| SandboxError::ScriptFault(e.to_string()))?;
        }
        let shared = Arc::new(Mutex::new(SandboxShared {
            cfg: cfg.clone(),
            event: None,
            event_modified: false,
            injected: Vec::new(),
            output: OutputBuffer::new(cfg.output_limit),
            iter_pos: 0,
            inject_count: 0,
            abort,
        }));
        let instructions = Arc::new(InstructionState::new(
            cfg.instruction_limit,
            cfg.instruction_chunk,
        ));
        quota::install_instruction_hook(&lua, instructions.clone());
        stdlib::install(&lua, &shared).map_err(|e| SandboxError::ScriptFault(e.to_string()))?;
        callbacks::install(&lua, &shared).map_err(|e| SandboxError::ScriptFault(e.to_string()))?;
        let usage = UsageTable::new(&cfg);
        let timing = CallTiming::new(cfg.profile, SAMPLE_DENOMINATOR);
        metrics.inc_sandboxes_created();
        Ok(Self {
            lua,
            cfg,
            shared,
            instructions,
            usage,
            timing,
            status: Status::Unknown,
            last_error: String::new(),
            metrics,
        })
    }

    /// Run the restorer (when a preserve file exists) and then the script,
    /// leaving its entry points defined. `Running` on success; any failure
    /// terminates the sandbox with the error recorded.
    pub fn init(&mut self, preserve_path: Option<&Path>) -> Result<(), SandboxError> {
        if self.status != Status::Unknown {
            return Err(SandboxError::ScriptFault("init() called twice".into()));
        }
        let src = match std::fs::read_to_string(&self.cfg.script_path) {
            Ok(src) => src,
            Err(e) => {
                self.terminate(&format!(
                    "reading {}: {e}",
                    self.cfg.script_path.display()
                ));
                return Err(SandboxError::Io(e));
            }
        };
        if let Some(path) = preserve_path {
            if path.exists() {
                if let Err(e) =
                    preserve::restore(&self.lua, path, self.cfg.memory_limit, &self.instructions)
                {
                    let _ = std::fs::remove_file(path);
                    self.metrics.inc_restore_failure();
                    log::warn!(
                        "discarding corrupt preserved state {}: {e}",
                        path.display()
                    );
                    self.terminate(&e.to_string());
                    return Err(e);
                }
            }
        }
        self.instructions.begin_call();
        let name = self.cfg.script_path.display().to_string();
        let result = self.lua.load(src.as_str()).set_name(name).exec();
        self.refresh_usage();
        match result {
            Ok(()) => {
                self.status = Status::Running;
                Ok(())
            }
            Err(e) => {
                let classified = SandboxError::from_lua(&e);
                self.terminate(&e.to_string());
                Err(classified)
            }
        }
    }

    /// Invoke `on_message`, optionally with a current event (sources poll
    /// with none).
    pub fn process_message(&mut self, event: Option<Event>) -> Result<EntryOutcome, SandboxError> {
        self.begin_dispatch(event);
        self.metrics.record_message();
        self.call_entry("on_message", ())
    }

    /// Source polling entry point; falls back to `on_message` for scripts
    /// that do not define `on_input`.
    pub fn poll_input(&mut self) -> Result<EntryOutcome, SandboxError> {
        self.begin_dispatch(None);
        self.metrics.record_message();
        let has_on_input = matches!(
            self.lua.globals().get::<Option<Function>>("on_input"),
            Ok(Some(_))
        );
        if has_on_input {
            self.call_entry("on_input", ())
        } else {
            self.call_entry("on_message", ())
        }
    }

    /// Invoke `on_tick` with nanoseconds since the epoch.
    pub fn timer_event(&mut self, ns: i64) -> Result<EntryOutcome, SandboxError> {
        self.begin_dispatch(None);
        self.metrics.inc_timer_event();
        self.call_entry("on_tick", ns)
    }

    /// Invoke `on_shutdown` when the script defines one, then terminate.
    pub fn stop(&mut self) {
        if self.status == Status::Running {
            if let Ok(Some(func)) = self.lua.globals().get::<Option<Function>>("on_shutdown") {
                self.instructions.begin_call();
                if let Err(e) = func.call::<()>(()) {
                    log::warn!(
                        "on_shutdown failed for {}: {e}",
                        self.cfg.script_path.display()
                    );
                }
            }
        }
        self.enter_terminated();
    }

    /// Close the interpreter, first serializing global state when a
    /// preserve path is given. A failed preserve deletes the file. Returns
    /// the final usage table; memory `current` reads zero once closed.
    pub fn destroy(mut self, preserve_path: Option<&Path>) -> Result<UsageTable, SandboxError> {
        let mut failure = None;
        if let Some(path) = preserve_path {
            if let Err(e) = preserve::preserve(&self.lua, path, self.cfg.output_limit) {
                let _ = std::fs::remove_file(path);
                self.metrics.inc_preserve_failure();
                failure = Some(e);
            }
        }
        self.refresh_usage();
        self.enter_terminated();
        drop(self.lua);
        let mut usage = self.usage.clone();
        usage.set(UsageKind::Memory, UsageStat::Current, 0);
        match failure {
            Some(e) => Err(e),
            None => Ok(usage),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.cfg
    }

    pub fn usage(&self, kind: UsageKind, stat: UsageStat) -> u64 {
        self.usage.get(kind, stat)
    }

    pub fn call_stats(&self) -> DurationStats {
        self.timing.stats().clone()
    }

    /// Events injected during the last call, in injection order.
    pub fn take_injected(&mut self) -> Vec<InjectedEvent> {
        let mut shared = self.shared.lock().unwrap();
        let injected = std::mem::take(&mut shared.injected);
        self.metrics.add_injected(injected.len() as u64);
        injected
    }

    /// Copy out and reset the output buffer.
    pub fn take_output(&mut self) -> Vec<u8> {
        let mut shared = self.shared.lock().unwrap();
        let out = shared.output.take();
        self.metrics.add_output_bytes(out.len() as u64);
        out
    }

    /// The current event, surrendered back to the host.
    pub fn take_event(&mut self) -> Option<Event> {
        self.shared.lock().unwrap().event.take()
    }

    /// Whether the script mutated the current event via `write_message`.
    pub fn event_modified(&self) -> bool {
        self.shared.lock().unwrap().event_modified
    }

    fn begin_dispatch(&mut self, event: Option<Event>) {
        let mut shared = self.shared.lock().unwrap();
        shared.event = event;
        shared.event_modified = false;
        shared.iter_pos = 0;
        shared.inject_count = 0;
        shared.output.clear();
    }

    fn call_entry(
        &mut self,
        name: &str,
        args: impl mlua::IntoLuaMulti,
    ) -> Result<EntryOutcome, SandboxError> {
        if self.status != Status::Running {
            return Err(SandboxError::NotRunning);
        }
        let func = match self.lua.globals().get::<Option<Function>>(name) {
            Ok(Some(func)) => func,
            Ok(None) => {
                let msg = format!("{name} is not defined");
                self.terminate(&msg);
                return Err(SandboxError::ScriptFault(msg));
            }
            Err(e) => {
                let classified = SandboxError::from_lua(&e);
                self.terminate(&e.to_string());
                return Err(classified);
            }
        };
        self.instructions.begin_call();
        let started = self.timing.should_sample().then(Instant::now);
        let result = func.call::<Value>(args);
        if let Some(started) = started {
            self.timing.record(started.elapsed());
        }
        self.refresh_usage();
        match result {
            Ok(value) => self.interpret_return(name, value),
            Err(e) => {
                let classified = SandboxError::from_lua(&e);
                self.terminate(&e.to_string());
                Err(classified)
            }
        }
    }

    fn interpret_return(&mut self, name: &str, value: Value) -> Result<EntryOutcome, SandboxError> {
        let outcome = match value {
            Value::Integer(code) => EntryOutcome {
                code,
                message: None,
            },
            Value::Number(code) => EntryOutcome {
                code: code as i64,
                message: None,
            },
            Value::String(s) => EntryOutcome {
                code: -1,
                message: Some(String::from_utf8_lossy(&s.as_bytes()).into_owned()),
            },
            other => {
                let msg = format!(
                    "{name} must return a numeric status code, got {}",
                    other.type_name()
                );
                self.terminate(&msg);
                return Err(SandboxError::ScriptFault(msg));
            }
        };
        if outcome.code > 0 {
            let msg = outcome
                .message
                .clone()
                .unwrap_or_else(|| format!("{name} returned {}", outcome.code));
            self.terminate(&msg);
        } else if outcome.code < 0 {
            self.metrics.inc_process_failure();
            if let Some(message) = &outcome.message {
                self.last_error = truncate_error(message);
            }
        }
        Ok(outcome)
    }

    fn refresh_usage(&mut self) {
        self.usage
            .observe(UsageKind::Memory, self.lua.used_memory() as u64);
        self.usage.set(
            UsageKind::Instructions,
            UsageStat::Current,
            self.instructions.count(),
        );
        let hook_max = self.instructions.maximum();
        if hook_max > self.usage.get(UsageKind::Instructions, UsageStat::Maximum) {
            self.usage
                .set(UsageKind::Instructions, UsageStat::Maximum, hook_max);
        }
        let output_pos = self.shared.lock().unwrap().output.pos() as u64;
        self.usage.observe(UsageKind::Output, output_pos);
    }

    fn enter_terminated(&mut self) {
        if self.status != Status::Terminated {
            self.status = Status::Terminated;
            self.metrics.inc_sandboxes_terminated();
        }
    }

    fn terminate(&mut self, msg: &str) {
        self.last_error = truncate_error(msg);
        self.enter_terminated();
    }
}

fn truncate_error(msg: &str) -> String {
    if msg.len() <= MAX_ERROR_LEN {
        return msg.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    msg[..end].to_string()
}
