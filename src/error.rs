//! Error kinds for the runtime.
//!
//! Every failure surfaced by the crate belongs to one of these families.
//! Public APIs return `anyhow::Result`, so callers can attach context; the
//! typed kinds remain inspectable via `downcast_ref::<Error>()`.
//!
//! Propagation rules:
//! - Schema errors are reported at the API call with no state change.
//! - Phase, layout, and dynamic-check errors are fatal to the kernel call;
//!   no partial execution happens.
//! - Device errors abort the launch with the device diagnostic; no retry.
//! - I/O errors are ordinary failure returns with context.
//! - Ghost protocol errors are fatal to the node that observes them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or conflicting schema operation: duplicate field name,
    /// mutation of a fragmented relation, key-into-elastic, grouping a
    /// non-plain relation, mismatched swap/copy types.
    #[error("schema error: {0}")]
    Schema(String),

    /// A kernel's field/global accesses violate the phase rules, or a
    /// reduction op is missing from the reduction table, or an accessed
    /// field does not reside on the target processor.
    #[error("phase error: {0}")]
    Phase(String),

    /// An argument layout was mutated after finalization. Always an
    /// implementation bug in the caller.
    #[error("argument layout error: {0}")]
    Layout(String),

    /// Device compile or launch failure.
    #[error("device error: {0}")]
    Device(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Ghost-exchange setup or transfer violation (e.g. a neighbor buffer
    /// size mismatch).
    #[error("ghost protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Short stable code for logs and event payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Schema(_) => "SCHEMA",
            Error::Phase(_) => "PHASE",
            Error::Layout(_) => "LAYOUT",
            Error::Device(_) => "DEVICE",
            Error::Io(_) => "IO",
            Error::Protocol(_) => "PROTOCOL",
        }
    }
}

/// Shorthand used throughout the crate.
pub(crate) fn schema_err<T>(msg: impl Into<String>) -> anyhow::Result<T> {
    Err(Error::Schema(msg.into()).into())
}

pub(crate) fn phase_err<T>(msg: impl Into<String>) -> anyhow::Result<T> {
    Err(Error::Phase(msg.into()).into())
}

pub(crate) fn layout_err<T>(msg: impl Into<String>) -> anyhow::Result<T> {
    Err(Error::Layout(msg.into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Schema("x".into()).code(), "SCHEMA");
        assert_eq!(Error::Phase("x".into()).code(), "PHASE");
        assert_eq!(Error::Layout("x".into()).code(), "LAYOUT");
        assert_eq!(Error::Device("x".into()).code(), "DEVICE");
        assert_eq!(Error::Protocol("x".into()).code(), "PROTOCOL");
    }

    #[test]
    fn downcast_through_anyhow() {
        let e: anyhow::Error = Error::Phase("uncentered write".into()).into();
        let kind = e.downcast_ref::<Error>().map(Error::code);
        assert_eq!(kind, Some("PHASE"));
    }
}
