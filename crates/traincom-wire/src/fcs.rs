use crate::{FCS_OFFSET, WireError};

/// CRC32/IEEE-802.3 over the checksummed header range of `frame`
/// (bytes `0..36`, the FCS field excluded from its own input).
///
/// # Panics
/// Panics if `frame` is shorter than the checksummed range; callers size
/// their buffers via [`crate::gross_size`].
#[inline]
pub fn compute_fcs(frame: &[u8]) -> u32 {
    crc32fast::hash(&frame[..FCS_OFFSET])
}

/// Recomputes the FCS and stores it little-endian into the header. This
/// and [`read_fcs`] are the only places that byte order is applied,
/// regardless of host architecture.
#[inline]
pub fn write_fcs(frame: &mut [u8]) {
    let fcs = compute_fcs(frame);
    frame[FCS_OFFSET..FCS_OFFSET + 4].copy_from_slice(&fcs.to_le_bytes());
}

/// Reads the stored little-endian FCS from the header.
#[inline]
pub fn read_fcs(frame: &[u8]) -> Result<u32, WireError> {
    let bytes = frame
        .get(FCS_OFFSET..FCS_OFFSET + 4)
        .ok_or(WireError::TooShort(frame.len()))?;
    Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
}
