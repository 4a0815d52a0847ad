mod error;
mod fcs;
mod header;

pub use error::WireError;
pub use fcs::{compute_fcs, read_fcs, write_fcs};
pub use header::{
    MsgType, PdHeader, check, gross_size, padded_len, set_dataset_length, set_msg_type,
    set_sequence,
};

/// Serialized header size in octets, frame-check sum included.
pub const HEADER_SIZE: usize = 40;

/// Byte offset of the little-endian frame-check sum within the header.
pub const FCS_OFFSET: usize = 36;

/// Largest payload a single PD telegram may carry.
pub const MAX_PD_DATA: usize = 1432;

/// Largest telegram that can appear on the wire.
pub const MAX_PD_PACKET: usize = HEADER_SIZE + MAX_PD_DATA;

/// Protocol version stamped into outgoing headers. Incoming frames are
/// compared under [`PROTO_VERSION_MASK`] so minor revisions interoperate.
pub const PROTO_VERSION: u16 = 0x0100;

/// Mask selecting the major part of `protocol_version`.
pub const PROTO_VERSION_MASK: u16 = 0xFF00;
