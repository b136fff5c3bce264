pub mod adapters;
pub mod cbuf;
pub mod config;
pub mod error;
pub mod metrics;
pub mod outbuf;
pub mod sandbox;

pub use config::{ConfigValue, PluginKind, SandboxConfig};
pub use error::{Resource, SandboxError};
pub use metrics::Metrics;
pub use sandbox::quota::{DurationStats, UsageKind, UsageStat, UsageTable};
pub use sandbox::{EntryOutcome, HeaderMask, InjectedEvent, Sandbox, Status};
pub use sandlark_wire as wire;
