use std::net::Ipv4Addr;

use crate::{
    FCS_OFFSET, HEADER_SIZE, MAX_PD_DATA, MAX_PD_PACKET, PROTO_VERSION, PROTO_VERSION_MASK,
    WireError,
    fcs::{compute_fcs, read_fcs},
};

const OFF_SEQ: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_TYPE: usize = 6;
const OFF_COM_ID: usize = 8;
const OFF_ETB_TOPO: usize = 12;
const OFF_OP_TOPO: usize = 16;
const OFF_DATASET_LEN: usize = 20;
const OFF_RESERVED: usize = 24;
const OFF_REPLY_COM_ID: usize = 28;
const OFF_REPLY_IP: usize = 32;

/// PD telegram kind, two ASCII octets on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgType {
    /// Cyclic process data.
    Pd = 0x5064,
    /// Requested (pull-reply) process data.
    Pp = 0x5070,
    /// Pull request.
    Pr = 0x5072,
    /// Error notification.
    Pe = 0x5065,
}

impl MsgType {
    pub fn from_wire(raw: u16) -> Result<Self, WireError> {
        match raw {
            0x5064 => Ok(MsgType::Pd),
            0x5070 => Ok(MsgType::Pp),
            0x5072 => Ok(MsgType::Pr),
            0x5065 => Ok(MsgType::Pe),
            other => Err(WireError::BadType(other)),
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MsgType::Pd => "Pd",
            MsgType::Pp => "Pp",
            MsgType::Pr => "Pr",
            MsgType::Pe => "Pe",
        };
        write!(f, "{name}")
    }
}

/// Decoded view of a PD header. Byte-order conversion happens only in
/// [`PdHeader::encode_into`] and [`PdHeader::decode`].
///
/// On-wire layout (network byte order unless noted):
///
/// | offset | field            | width |
/// |--------|------------------|-------|
/// | 0      | sequence_counter | u32   |
/// | 4      | protocol_version | u16   |
/// | 6      | msg_type         | u16   |
/// | 8      | com_id           | u32   |
/// | 12     | etb_topo_cnt     | u32   |
/// | 16     | op_trn_topo_cnt  | u32   |
/// | 20     | dataset_length   | u32   |
/// | 24     | reserved         | u32   |
/// | 28     | reply_com_id     | u32   |
/// | 32     | reply_ip         | u32   |
/// | 36     | frame_check_sum  | u32 (little-endian) |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdHeader {
    pub sequence_counter: u32,
    pub protocol_version: u16,
    pub msg_type: MsgType,
    pub com_id: u32,
    pub etb_topo_cnt: u32,
    pub op_trn_topo_cnt: u32,
    pub dataset_length: u32,
    pub reply_com_id: u32,
    pub reply_ip: Ipv4Addr,
}

impl PdHeader {
    /// Header for a fresh outgoing telegram, sequence zero, FCS not yet
    /// computed.
    pub fn new(msg_type: MsgType, com_id: u32) -> Self {
        Self {
            sequence_counter: 0,
            protocol_version: PROTO_VERSION,
            msg_type,
            com_id,
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
            dataset_length: 0,
            reply_com_id: 0,
            reply_ip: Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Writes all fields except the FCS into the first [`HEADER_SIZE`]
    /// bytes of `frame`. Call [`crate::write_fcs`] once the header is
    /// final.
    ///
    /// # Panics
    /// Panics if `frame` is shorter than a header.
    pub fn encode_into(&self, frame: &mut [u8]) {
        assert!(frame.len() >= HEADER_SIZE, "frame too small for PD header");
        frame[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.sequence_counter.to_be_bytes());
        frame[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&self.protocol_version.to_be_bytes());
        frame[OFF_TYPE..OFF_TYPE + 2].copy_from_slice(&(self.msg_type as u16).to_be_bytes());
        frame[OFF_COM_ID..OFF_COM_ID + 4].copy_from_slice(&self.com_id.to_be_bytes());
        frame[OFF_ETB_TOPO..OFF_ETB_TOPO + 4].copy_from_slice(&self.etb_topo_cnt.to_be_bytes());
        frame[OFF_OP_TOPO..OFF_OP_TOPO + 4].copy_from_slice(&self.op_trn_topo_cnt.to_be_bytes());
        frame[OFF_DATASET_LEN..OFF_DATASET_LEN + 4]
            .copy_from_slice(&self.dataset_length.to_be_bytes());
        frame[OFF_RESERVED..OFF_RESERVED + 4].copy_from_slice(&0u32.to_be_bytes());
        frame[OFF_REPLY_COM_ID..OFF_REPLY_COM_ID + 4]
            .copy_from_slice(&self.reply_com_id.to_be_bytes());
        frame[OFF_REPLY_IP..OFF_REPLY_IP + 4]
            .copy_from_slice(&u32::from(self.reply_ip).to_be_bytes());
    }

    /// Parses the header fields out of `frame`. Structural check only; use
    /// [`check`] to vet a received frame.
    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        if frame.len() < HEADER_SIZE {
            return Err(WireError::TooShort(frame.len()));
        }
        Ok(Self {
            sequence_counter: be32(frame, OFF_SEQ),
            protocol_version: be16(frame, OFF_VERSION),
            msg_type: MsgType::from_wire(be16(frame, OFF_TYPE))?,
            com_id: be32(frame, OFF_COM_ID),
            etb_topo_cnt: be32(frame, OFF_ETB_TOPO),
            op_trn_topo_cnt: be32(frame, OFF_OP_TOPO),
            dataset_length: be32(frame, OFF_DATASET_LEN),
            reply_com_id: be32(frame, OFF_REPLY_COM_ID),
            reply_ip: Ipv4Addr::from(be32(frame, OFF_REPLY_IP)),
        })
    }
}

#[inline]
fn be16(frame: &[u8], off: usize) -> u16 {
    u16::from_be_bytes(frame[off..off + 2].try_into().expect("2-byte slice"))
}

#[inline]
fn be32(frame: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(frame[off..off + 4].try_into().expect("4-byte slice"))
}

/// Patches a new sequence counter into an encoded header. The FCS must be
/// rewritten afterwards.
#[inline]
pub fn set_sequence(frame: &mut [u8], seq: u32) {
    frame[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&seq.to_be_bytes());
}

/// Patches the message type of an encoded header. The FCS must be
/// rewritten afterwards.
#[inline]
pub fn set_msg_type(frame: &mut [u8], msg_type: MsgType) {
    frame[OFF_TYPE..OFF_TYPE + 2].copy_from_slice(&(msg_type as u16).to_be_bytes());
}

/// Patches the dataset length of an encoded header. The FCS must be
/// rewritten afterwards.
#[inline]
pub fn set_dataset_length(frame: &mut [u8], dataset_length: u32) {
    frame[OFF_DATASET_LEN..OFF_DATASET_LEN + 4].copy_from_slice(&dataset_length.to_be_bytes());
}

/// Payload length rounded up to 4-byte alignment.
#[inline]
pub fn padded_len(dataset_length: usize) -> usize {
    dataset_length.div_ceil(4) * 4
}

/// On-wire size of a telegram carrying `dataset_length` payload octets.
#[inline]
pub fn gross_size(dataset_length: usize) -> usize {
    HEADER_SIZE + padded_len(dataset_length)
}

/// Vets a received frame: size bounds, FCS, masked protocol version,
/// dataset length and message type, cheapest first.
pub fn check(frame: &[u8]) -> Result<PdHeader, WireError> {
    if frame.len() < HEADER_SIZE {
        return Err(WireError::TooShort(frame.len()));
    }
    if frame.len() > MAX_PD_PACKET {
        return Err(WireError::TooLong(frame.len()));
    }
    if read_fcs(frame)? != compute_fcs(frame) {
        return Err(WireError::BadFcs);
    }
    let version = be16(frame, OFF_VERSION);
    if version & PROTO_VERSION_MASK != PROTO_VERSION & PROTO_VERSION_MASK {
        return Err(WireError::BadVersion(version));
    }
    let dataset_length = be32(frame, OFF_DATASET_LEN);
    if dataset_length as usize > MAX_PD_DATA
        || HEADER_SIZE + dataset_length as usize > frame.len()
    {
        return Err(WireError::BadLength(dataset_length));
    }
    PdHeader::decode(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write_fcs;

    fn encoded(header: &PdHeader) -> Vec<u8> {
        let mut frame = vec![0u8; gross_size(header.dataset_length as usize)];
        header.encode_into(&mut frame);
        write_fcs(&mut frame);
        frame
    }

    #[test]
    fn header_roundtrip() {
        let mut header = PdHeader::new(MsgType::Pr, 31);
        header.sequence_counter = 7;
        header.etb_topo_cnt = 0xAABB;
        header.op_trn_topo_cnt = 3;
        header.reply_com_id = 35;
        header.reply_ip = Ipv4Addr::new(10, 0, 0, 2);
        let frame = encoded(&header);
        assert_eq!(frame.len(), HEADER_SIZE);
        assert_eq!(PdHeader::decode(&frame).unwrap(), header);
        assert_eq!(check(&frame).unwrap(), header);
    }

    #[test]
    fn fcs_is_stored_little_endian() {
        let frame = encoded(&PdHeader::new(MsgType::Pd, 1000));
        let fcs = crc32fast::hash(&frame[..FCS_OFFSET]);
        assert_eq!(frame[36], (fcs & 0xFF) as u8);
        assert_eq!(frame[37], ((fcs >> 8) & 0xFF) as u8);
        assert_eq!(frame[38], ((fcs >> 16) & 0xFF) as u8);
        assert_eq!(frame[39], ((fcs >> 24) & 0xFF) as u8);
    }

    #[test]
    fn corrupted_header_fails_fcs() {
        let mut frame = encoded(&PdHeader::new(MsgType::Pd, 1000));
        frame[OFF_COM_ID] ^= 0x01;
        assert_eq!(check(&frame), Err(WireError::BadFcs));
    }

    #[test]
    fn version_is_compared_under_mask() {
        let mut header = PdHeader::new(MsgType::Pd, 1000);
        header.protocol_version = PROTO_VERSION | 0x0042;
        let frame = encoded(&header);
        assert!(check(&frame).is_ok());

        header.protocol_version = PROTO_VERSION.wrapping_add(0x0100);
        let frame = encoded(&header);
        assert!(matches!(check(&frame), Err(WireError::BadVersion(_))));
    }

    #[test]
    fn unknown_msg_type_rejected() {
        let mut frame = encoded(&PdHeader::new(MsgType::Pd, 1000));
        frame[OFF_TYPE..OFF_TYPE + 2].copy_from_slice(&0x4D64u16.to_be_bytes());
        write_fcs(&mut frame);
        assert_eq!(check(&frame), Err(WireError::BadType(0x4D64)));
    }

    #[test]
    fn dataset_length_bounds() {
        let mut header = PdHeader::new(MsgType::Pd, 1000);
        header.dataset_length = MAX_PD_DATA as u32;
        let frame = encoded(&header);
        assert_eq!(frame.len(), MAX_PD_PACKET);
        assert!(check(&frame).is_ok());

        // One octet past the limit must be rejected even if the buffer
        // claims to hold it.
        header.dataset_length = MAX_PD_DATA as u32 + 1;
        let mut frame = vec![0u8; MAX_PD_PACKET];
        header.encode_into(&mut frame);
        write_fcs(&mut frame);
        assert_eq!(
            check(&frame),
            Err(WireError::BadLength(MAX_PD_DATA as u32 + 1))
        );
    }

    #[test]
    fn truncated_payload_rejected() {
        let mut header = PdHeader::new(MsgType::Pd, 1000);
        header.dataset_length = 100;
        let mut frame = vec![0u8; HEADER_SIZE + 50];
        header.encode_into(&mut frame);
        write_fcs(&mut frame);
        assert_eq!(check(&frame), Err(WireError::BadLength(100)));
    }

    #[test]
    fn restamping_sequence_is_consistent() {
        // Stamping the same header twice with consecutive counters must
        // differ only in the counter and a consistent FCS.
        let mut frame = encoded(&PdHeader::new(MsgType::Pd, 2000));
        set_sequence(&mut frame, 1);
        write_fcs(&mut frame);
        let first = frame.clone();

        set_sequence(&mut frame, 2);
        write_fcs(&mut frame);
        assert_eq!(PdHeader::decode(&frame).unwrap().sequence_counter, 2);
        assert!(check(&frame).is_ok());
        assert_eq!(&first[4..FCS_OFFSET], &frame[4..FCS_OFFSET]);
    }

    #[test]
    fn padding_rounds_up_to_word() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 4);
        assert_eq!(padded_len(4), 4);
        assert_eq!(padded_len(5), 8);
        assert_eq!(gross_size(6), HEADER_SIZE + 8);
    }
}
