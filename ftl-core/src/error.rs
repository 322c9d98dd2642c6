//! Error taxonomy for the hot path (§7) and for the restore path (§4.4, §4.12).

use snafu::Snafu;

/// Errors raised while servicing a user `write`/`read`/`flush` call, or
/// while the device itself transitions state.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum FtlError {
    /// Internal descriptor/pool exhaustion. Hot-path callers queue on a
    /// retry ring instead of surfacing this; it only escapes when the
    /// retry ring itself is full.
    #[snafu(display("no memory: internal pool exhausted"))]
    NoMemory,

    /// A child write could not proceed because its target zone is busy.
    /// Internal only: resolved by the write pointer's pending queue.
    #[snafu(display("resource busy, retry"))]
    Again,

    #[snafu(display("user argument violated contract: {reason}"))]
    Invalid { reason: &'static str },

    #[snafu(display("device not initialized or halting"))]
    Busy,

    #[snafu(display("base device missing or failed to open"))]
    NoDevice,

    #[snafu(display("I/O completed with an error status"))]
    Io,

    /// The device has hit a condition with no recovery path and has
    /// entered a terminal failed state.
    #[snafu(display("fatal: {reason}"))]
    Fatal { reason: &'static str },
}

pub type FtlResult<T> = Result<T, FtlError>;

/// Rejection codes for a parsed band head/tail metadata record (§4.4).
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum MetadataRejectReason {
    #[snafu(display("crc32c mismatch"))]
    InvalidCrc,
    #[snafu(display("version mismatch"))]
    InvalidVersion,
    #[snafu(display("record size does not match device geometry"))]
    InvalidSize,
    #[snafu(display("uuid mismatch or header absent"))]
    NoMetadata,
}
