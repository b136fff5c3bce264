//! Error taxonomy for the sandbox runtime.
//!
//! Every failure either terminates the sandbox (fatal) or is surfaced as a
//! soft-failure return code; callers inspect the code first, then the
//! sandbox's last-error string.

use std::fmt;

use thiserror::Error;

/// Quota-enforced resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Memory,
    Instructions,
    Output,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Memory => "memory",
            Resource::Instructions => "instruction",
            Resource::Output => "output",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{0}_limit exceeded")]
    QuotaExceeded(Resource),
    #[error("{0}")]
    ScriptFault(String),
    #[error("preserve failed: {0}")]
    Preserve(String),
    #[error("restore failed: {0}")]
    Restore(String),
    #[error(transparent)]
    Codec(#[from] sandlark_wire::CodecError),
    #[error("running slowly and blocking the router: {0}")]
    BackpressureFatal(String),
    #[error("abort requested")]
    AbortRequested,
    #[error("sandbox is not running")]
    NotRunning,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Classify an interpreter error. The full message is the caller's to
    /// record; the classification drives the quota metrics.
    pub(crate) fn from_lua(err: &mlua::Error) -> SandboxError {
        let msg = err.to_string();
        if matches!(err, mlua::Error::MemoryError(_)) || msg.contains("not enough memory") {
            SandboxError::QuotaExceeded(Resource::Memory)
        } else if msg.contains("instruction_limit exceeded") {
            SandboxError::QuotaExceeded(Resource::Instructions)
        } else if msg.contains("output_limit exceeded") {
            SandboxError::QuotaExceeded(Resource::Output)
        } else {
            SandboxError::ScriptFault(msg)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_messages_carry_the_resource_name() {
        assert_eq!(
            SandboxError::QuotaExceeded(Resource::Instructions).to_string(),
            "instruction_limit exceeded"
        );
        assert_eq!(
            SandboxError::QuotaExceeded(Resource::Output).to_string(),
            "output_limit exceeded"
        );
        assert_eq!(
            SandboxError::QuotaExceeded(Resource::Memory).to_string(),
            "memory_limit exceeded"
        );
    }

    #[test]
    fn lua_errors_classify_by_message() {
        let err = mlua::Error::RuntimeError("instruction_limit exceeded".into());
        assert!(matches!(
            SandboxError::from_lua(&err),
            SandboxError::QuotaExceeded(Resource::Instructions)
        ));
        let err = mlua::Error::RuntimeError("attempt to index a nil value".into());
        assert!(matches!(SandboxError::from_lua(&err), SandboxError::ScriptFault(_)));
    }
}
