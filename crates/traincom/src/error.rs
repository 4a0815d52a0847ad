use thiserror::Error;
use traincom_wire::WireError;

/// Engine error taxonomy.
///
/// Receive-path classifications are recorded in the element's `last_err`
/// and in the session counters, then returned without unwinding the
/// engine; they are deliberately payload-free so they stay `Copy`. I/O
/// failures are logged with their source at the call site.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum PdError {
    #[error("invalid parameter")]
    Param,
    #[error("resource exhausted")]
    Mem,
    #[error("malformed frame")]
    Wire,
    #[error("frame-check sum mismatch")]
    Crc,
    #[error("topology counter mismatch")]
    Topo,
    #[error("no matching subscriber")]
    NoSub,
    #[error("no valid data yet")]
    NoData,
    #[error("subscriber timed out")]
    Timeout,
    #[error("socket i/o failure")]
    Io,
    #[error("socket drained")]
    Block,
}

impl PdError {
    /// Errors the socket dispatcher treats as routine and does not log.
    pub(crate) fn is_quiet(self) -> bool {
        matches!(self, PdError::NoSub | PdError::Block | PdError::NoData)
    }
}

impl From<WireError> for PdError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::BadFcs => PdError::Crc,
            _ => PdError::Wire,
        }
    }
}
