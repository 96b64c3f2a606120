//! MCP4921 12-bit SPI DAC.

use embedded_hal::blocking::spi::Write;
use embedded_hal::digital::v2::OutputPin;

/// MCP4921 on a shared SPI bus, owning only its chip select.
///
/// The output latches on the LDAC pin, which is shared between converters
/// and pulsed by the owner so several channels can update together.
pub struct Mcp4921<CS> {
    cs: CS,
}

impl<CS: OutputPin> Mcp4921<CS> {
    /// Claim the (already high) chip select.
    pub fn new(mut cs: CS) -> Self {
        let _ = cs.set_high();
        Self { cs }
    }

    /// Write a 12-bit code to the input register. Takes effect on the next
    /// LDAC pulse.
    pub fn write_raw_u12<SPI: Write<u8>>(
        &mut self,
        spi: &mut SPI,
        value: u16,
    ) -> Result<(), SPI::Error> {
        let _ = self.cs.set_low();
        // Command nibble: write DACA, unbuffered, 1x gain, output enabled.
        let frame = [0x30 | ((value >> 8) as u8 & 0x0F), value as u8];
        let result = spi.write(&frame);
        let _ = self.cs.set_high();
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::convert::Infallible;
    use std::vec::Vec;

    #[derive(Default)]
    struct FakeSpi(Vec<u8>);

    impl Write<u8> for FakeSpi {
        type Error = Infallible;
        fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
            self.0.extend_from_slice(words);
            Ok(())
        }
    }

    struct NullCs;

    impl OutputPin for NullCs {
        type Error = Infallible;
        fn set_high(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
        fn set_low(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    #[test]
    fn frames_command_and_code() {
        let mut dac = Mcp4921::new(NullCs);
        let mut spi = FakeSpi::default();
        dac.write_raw_u12(&mut spi, 0xABC).unwrap();
        dac.write_raw_u12(&mut spi, 0x005).unwrap();
        assert_eq!(spi.0, [0x3A, 0xBC, 0x30, 0x05]);
    }
}
