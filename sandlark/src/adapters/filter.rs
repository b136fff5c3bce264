//! Filter personality: the script observes the stream and injects derived
//! events back into the router under an enforced per-call injection cap.

use std::path::Path;

use sandlark_wire::Event;

use crate::adapters::{
    build_sandbox, check_watchdog, report_termination, AdapterContext, SANDBOX_TYPE_PREFIX,
    WatchdogSettings,
};
use crate::config::{PluginKind, SandboxConfig};
use crate::error::SandboxError;
use crate::sandbox::{InjectedEvent, Sandbox};

/// Cap applied when a filter is configured uncapped; filters never run
/// without one.
const DEFAULT_INJECT_CAP: u32 = 10;

pub struct FilterAdapter {
    sandbox: Sandbox,
    ctx: AdapterContext,
    watchdog: WatchdogSettings,
}

impl FilterAdapter {
    pub fn new(
        mut cfg: SandboxConfig,
        ctx: AdapterContext,
        watchdog: WatchdogSettings,
        preserve_path: Option<&Path>,
    ) -> Result<Self, SandboxError> {
        cfg.plugin_type = PluginKind::Filter;
        if cfg.max_inject_per_call == 0 {
            log::warn!(
                "{}: max_inject_per_call = 0 is not honored for filters; capping at {}",
                ctx.name,
                DEFAULT_INJECT_CAP
            );
            cfg.max_inject_per_call = DEFAULT_INJECT_CAP;
        }
        let sandbox = build_sandbox(&cfg, &ctx, preserve_path)?;
        Ok(Self {
            sandbox,
            ctx,
            watchdog,
        })
    }

    /// Feed one event through the filter. Injected events are stamped and
    /// delivered to the router; returns how many were delivered.
    pub fn process(&mut self, event: Event) -> Result<usize, SandboxError> {
        let inbound_hostname = event.hostname.clone();
        let outcome = match self.sandbox.process_message(Some(event)) {
            Ok(outcome) => outcome,
            Err(e) => {
                report_termination(&self.ctx, self.sandbox.last_error());
                return Err(e);
            }
        };
        self.sandbox.take_event();
        if outcome.code > 0 {
            report_termination(&self.ctx, self.sandbox.last_error());
            return Err(SandboxError::ScriptFault(
                self.sandbox.last_error().to_string(),
            ));
        }
        if outcome.code < 0 {
            check_watchdog(&self.ctx, &self.watchdog, &mut self.sandbox)?;
            return Ok(0);
        }
        let delivered = self.deliver_injected(&inbound_hostname)?;
        check_watchdog(&self.ctx, &self.watchdog, &mut self.sandbox)?;
        Ok(delivered)
    }

    /// Periodic tick; injected events are stamped and delivered the same
    /// way as for `process`.
    pub fn tick(&mut self, ns: i64) -> Result<usize, SandboxError> {
        let outcome = match self.sandbox.timer_event(ns) {
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
            return Ok(0);
        }
        self.deliver_injected("")
    }

    fn deliver_injected(&mut self, inbound_hostname: &str) -> Result<usize, SandboxError> {
        let injected = self.sandbox.take_injected();
        let mut delivered = 0;
        for injected_event in injected {
            let event = stamp(injected_event, &self.ctx.name, inbound_hostname);
            if self.ctx.sink.deliver(event).is_err() {
                return Err(SandboxError::AbortRequested);
            }
            delivered += 1;
        }
        Ok(delivered)
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn shutdown(mut self, preserve_path: Option<&Path>) -> Result<(), SandboxError> {
        self.sandbox.stop();
        self.sandbox.destroy(preserve_path).map(|_| ())
    }
}

/// Filter injections carry the sandbox type prefix and the filter's own
/// logger name; the inbound hostname is preserved.
fn stamp(injected: InjectedEvent, logger: &str, inbound_hostname: &str) -> Event {
    let mut event = injected.event;
    event.event_type = format!("{SANDBOX_TYPE_PREFIX}{}", event.event_type);
    event.logger = logger.to_string();
    if !inbound_hostname.is_empty() {
        event.hostname = inbound_hostname.to_string();
    }
    event
}
