//! Tachyon telemetry frame: compact binary encoding of an 11-bit CAN frame.
//!
//! Pre-COBS layout is `[id_low, id_high | dlc << 4, data[0..dlc], checksum]`
//! where the checksum makes the byte sum zero mod 256. The COBS-encoded
//! result plus its `0x00` delimiter never exceeds [`MAX_ENCODED_LEN`] bytes.

use crate::can::CanMessage;
use crate::encoding::cobs;
use embedded_can::{Frame, Id};

/// Worst case on-wire size: 2 ID/length bytes, 8 payload bytes, 1 checksum,
/// 1 COBS code byte and the frame delimiter.
pub const MAX_ENCODED_LEN: usize = 13;

/// Inter-frame delimiter byte.
pub const DELIMITER: u8 = 0;

/// Encode a standard-ID data frame, returning the total length including
/// the trailing delimiter.
///
/// Extended and remote frames have no representation in this encoding and
/// yield `None`.
pub fn encode(msg: &CanMessage, out: &mut [u8; MAX_ENCODED_LEN]) -> Option<usize> {
    let id = match msg.id() {
        Id::Standard(id) => id.as_raw(),
        Id::Extended(_) => return None,
    };
    if msg.is_remote_frame() {
        return None;
    }

    let dlc = msg.dlc();
    let mut raw = [0u8; 11];
    raw[0] = (id & 0xFF) as u8;
    raw[1] = ((id >> 8) & 0x0F) as u8 | ((dlc as u8) << 4);
    raw[2..2 + dlc].copy_from_slice(msg.data());

    let mut checksum = 0u8;
    for &byte in &raw[..2 + dlc] {
        checksum = checksum.wrapping_sub(byte);
    }
    raw[2 + dlc] = checksum;

    let encoded = cobs::encode(&raw[..3 + dlc], out)?;
    out[encoded] = DELIMITER;
    Some(encoded + 1)
}
