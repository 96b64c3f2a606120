//! Persistence of the SMU configuration in EEPROM.
//!
//! The configuration is stored as one delimited message at a fixed address.
//! A blank or corrupted EEPROM simply fails to decode and the device runs
//! on nominal calibration.

use crate::smu::protocol::SmuConfig;
use tachyon_core::Eeprom;

/// EEPROM address of the configuration blob.
pub const CONFIG_ADDR: u32 = 0;

/// Upper bound of the encoded configuration.
pub const CONFIG_LEN: usize = 160;

/// Read and decode the stored configuration.
pub fn load<E: Eeprom>(eeprom: &mut E) -> Option<SmuConfig> {
    let mut buf = [0u8; CONFIG_LEN];
    eeprom.read(CONFIG_ADDR, &mut buf);
    SmuConfig::decode_delimited(&buf)
}

/// Encode and persist the configuration. Returns `false` if it does not
/// encode or the EEPROM rejects the write.
pub fn store<E: Eeprom>(eeprom: &mut E, config: &SmuConfig) -> bool {
    let mut buf = [0u8; CONFIG_LEN];
    match config.encode_delimited(&mut buf) {
        Ok(len) => eeprom.write(CONFIG_ADDR, &buf[..len]),
        Err(_) => false,
    }
}
