//! Error kinds surfaced by the core.
//!
//! Config errors abort machine construction. I/O errors are reported to
//! the machine-build step or the calling collaborator; they never leak
//! into CPU-visible control flow — a device reflects them into its own
//! guest-visible status/error register instead. Protocol errors are
//! logged and the offending transaction is dropped; the device's state
//! machine resyncs on the next command. Fatal errors indicate a broken
//! invariant (dangling event owner, corrupted address-space bookkeeping)
//! and are expected to terminate the VM instance.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error in {device}: {detail}")]
    Config { device: &'static str, detail: String },

    #[error("I/O error in {device}: {detail}")]
    Io { device: &'static str, detail: String },

    #[error("protocol error in {device}: {detail}")]
    Protocol { device: &'static str, detail: String },

    #[error("fatal core error: {detail}")]
    Fatal { detail: String },
}

impl CoreError {
    pub fn config(device: &'static str, detail: impl Into<String>) -> Self {
        Self::Config { device, detail: detail.into() }
    }
    pub fn io(device: &'static str, detail: impl Into<String>) -> Self {
        Self::Io { device, detail: detail.into() }
    }
    pub fn protocol(device: &'static str, detail: impl Into<String>) -> Self {
        Self::Protocol { device, detail: detail.into() }
    }
    pub fn fatal(detail: impl Into<String>) -> Self {
        Self::Fatal { detail: detail.into() }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
