//! Resource ceilings: the usage table, the instruction count hook, and
//! per-call duration sampling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mlua::{HookTriggers, Lua, VmState};

use crate::config::SandboxConfig;

/// Quota dimensions reported by `Sandbox::usage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    Memory,
    Instructions,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageStat {
    Current,
    Maximum,
    Limit,
}

/// `usage[kind][stat]` counters for one sandbox.
#[derive(Debug, Clone, Default)]
pub struct UsageTable {
    cells: [[u64; 3]; 3],
}

impl UsageTable {
    pub(crate) fn new(cfg: &SandboxConfig) -> Self {
        let mut table = Self::default();
        table.set(UsageKind::Memory, UsageStat::Limit, cfg.memory_limit as u64);
        table.set(UsageKind::Instructions, UsageStat::Limit, cfg.instruction_limit);
        table.set(UsageKind::Output, UsageStat::Limit, cfg.output_limit as u64);
        table
    }

    pub fn get(&self, kind: UsageKind, stat: UsageStat) -> u64 {
        self.cells[kind as usize][stat as usize]
    }

    pub(crate) fn set(&mut self, kind: UsageKind, stat: UsageStat, value: u64) {
        self.cells[kind as usize][stat as usize] = value;
    }

    /// Record a current value, ratcheting the maximum.
    pub(crate) fn observe(&mut self, kind: UsageKind, value: u64) {
        self.set(kind, UsageStat::Current, value);
        if value > self.get(kind, UsageStat::Maximum) {
            self.set(kind, UsageStat::Maximum, value);
        }
    }
}

/// Shared state behind the interpreter's count hook. The hook fires every
/// `chunk` virtual instructions, accumulates, and aborts the running call
/// once the accumulated count passes the limit; the overrun is therefore
/// bounded by one chunk.
pub(crate) struct InstructionState {
    count: AtomicU64,
    maximum: AtomicU64,
    enabled: AtomicBool,
    limit: u64,
    chunk: u32,
}

impl InstructionState {
    pub(crate) fn new(limit: u64, chunk: u32) -> Self {
        // The hook interval never exceeds the limit itself, so a limit of 1
        // aborts at the very first tick.
        let chunk = if limit == 0 {
            chunk.max(1)
        } else {
            (chunk.max(1) as u64).min(limit) as u32
        };
        Self {
            count: AtomicU64::new(0),
            maximum: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
            limit,
            chunk,
        }
    }

    pub(crate) fn begin_call(&self) {
        self.count.store(0, Ordering::Relaxed);
    }

    pub(crate) fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn maximum(&self) -> u64 {
        self.maximum.load(Ordering::Relaxed)
    }

    /// The restorer runs with the hook disabled.
    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

/// Install the count hook. A limit of 0 leaves the interpreter unhooked.
pub(crate) fn install_instruction_hook(lua: &Lua, state: Arc<InstructionState>) {
    if state.limit == 0 {
        return;
    }
    let triggers = HookTriggers::new().every_nth_instruction(state.chunk);
    lua.set_hook(triggers, move |_, _| {
        if !state.enabled.load(Ordering::Relaxed) {
            return Ok(VmState::Continue);
        }
        let count = state.count.fetch_add(state.chunk as u64, Ordering::Relaxed) + state.chunk as u64;
        state.maximum.fetch_max(count, Ordering::Relaxed);
        if count >= state.limit {
            return Err(mlua::Error::RuntimeError("instruction_limit exceeded".into()));
        }
        Ok(VmState::Continue)
    });
}

const SAMPLE_WINDOW: usize = 10;

/// Rolling per-call duration statistics.
#[derive(Debug, Clone, Default)]
pub struct DurationStats {
    pub samples: u64,
    pub sum_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    window: [u64; SAMPLE_WINDOW],
    window_len: usize,
    window_at: usize,
}

impl DurationStats {
    fn record(&mut self, ns: u64) {
        self.samples += 1;
        self.sum_ns += ns;
        if self.samples == 1 || ns < self.min_ns {
            self.min_ns = ns;
        }
        if ns > self.max_ns {
            self.max_ns = ns;
        }
        self.window[self.window_at] = ns;
        self.window_at = (self.window_at + 1) % SAMPLE_WINDOW;
        if self.window_len < SAMPLE_WINDOW {
            self.window_len += 1;
        }
    }

    /// Mean over the most recent samples; 0 before any sample lands.
    pub fn rolling_mean_ns(&self) -> u64 {
        if self.window_len == 0 {
            return 0;
        }
        let sum: u64 = self.window[..self.window_len].iter().sum();
        sum / self.window_len as u64
    }

    pub fn mean_ns(&self) -> u64 {
        if self.samples == 0 {
            0
        } else {
            self.sum_ns / self.samples
        }
    }
}

/// Decides which calls get timed. With profiling on, the first
/// `SAMPLE_WINDOW * 10` calls are all timed before falling back to the
/// regular 1-in-N sampling.
#[derive(Debug)]
pub(crate) struct CallTiming {
    profile: bool,
    sample_denominator: u32,
    calls: u64,
    stats: DurationStats,
}

impl CallTiming {
    pub(crate) fn new(profile: bool, sample_denominator: u32) -> Self {
        Self {
            profile,
            sample_denominator,
            calls: 0,
            stats: DurationStats::default(),
        }
    }

    pub(crate) fn should_sample(&mut self) -> bool {
        self.calls += 1;
        if self.profile && self.calls <= (SAMPLE_WINDOW as u64) * 10 {
            return true;
        }
        self.sample_denominator > 0 && self.calls % self.sample_denominator as u64 == 0
    }

    pub(crate) fn record(&mut self, elapsed: Duration) {
        self.stats.record(elapsed.as_nanos() as u64);
    }

    pub(crate) fn stats(&self) -> &DurationStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_table_ratchets_the_maximum() {
        let cfg = SandboxConfig::new("x.lua");
        let mut table = UsageTable::new(&cfg);
        table.observe(UsageKind::Memory, 100);
        table.observe(UsageKind::Memory, 40);
        assert_eq!(table.get(UsageKind::Memory, UsageStat::Current), 40);
        assert_eq!(table.get(UsageKind::Memory, UsageStat::Maximum), 100);
        assert_eq!(
            table.get(UsageKind::Memory, UsageStat::Limit),
            cfg.memory_limit as u64
        );
    }

    #[test]
    fn profiling_times_the_warmup_burst() {
        let mut timing = CallTiming::new(true, 1000);
        let sampled = (0..100).filter(|_| timing.should_sample()).count();
        assert_eq!(sampled, 100);
        // After the burst, back to 1-in-1000.
        let sampled = (0..999).filter(|_| timing.should_sample()).count();
        assert_eq!(sampled, 1);
    }

    #[test]
    fn unprofiled_sampling_is_one_in_n() {
        let mut timing = CallTiming::new(false, 10);
        let sampled = (0..100).filter(|_| timing.should_sample()).count();
        assert_eq!(sampled, 10);
    }

    #[test]
    fn rolling_mean_tracks_the_window() {
        let mut stats = DurationStats::default();
        for _ in 0..SAMPLE_WINDOW {
            stats.record(100);
        }
        assert_eq!(stats.rolling_mean_ns(), 100);
        for _ in 0..SAMPLE_WINDOW {
            stats.record(500);
        }
        assert_eq!(stats.rolling_mean_ns(), 500);
        assert_eq!(stats.min_ns, 100);
        assert_eq!(stats.max_ns, 500);
    }
}
