use thiserror::Error;

/// Classification of a rejected frame.
///
/// `BadFcs` is kept separate from the structural errors because the engine
/// counts checksum failures and protocol failures in different buckets.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("frame shorter than a PD header ({0} octets)")]
    TooShort(usize),
    #[error("frame exceeds the maximum PD packet size ({0} octets)")]
    TooLong(usize),
    #[error("frame-check sum mismatch")]
    BadFcs,
    #[error("unsupported protocol version {0:#06x}")]
    BadVersion(u16),
    #[error("unknown message type {0:#06x}")]
    BadType(u16),
    #[error("dataset length {0} out of bounds")]
    BadLength(u32),
}
