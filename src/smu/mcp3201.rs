//! MCP3201 12-bit SPI ADC.

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

/// MCP3201 on a shared SPI bus, owning only its chip select.
///
/// The bus is passed per call because several converters share it; the
/// caller also owns the bus clock rate (the chip samples while clocked, so
/// the rate bounds the aperture).
pub struct Mcp3201<CS> {
    cs: CS,
}

impl<CS: OutputPin> Mcp3201<CS> {
    /// Claim the (already high) chip select.
    pub fn new(mut cs: CS) -> Self {
        let _ = cs.set_high();
        Self { cs }
    }

    /// Read one 12-bit sample.
    pub fn read_raw_u12<SPI: Transfer<u8>>(&mut self, spi: &mut SPI) -> Result<u16, SPI::Error> {
        let _ = self.cs.set_low();
        // Two clocks of sampling, one null bit, then the 12 data bits; the
        // last bit of the 16-bit transfer is past the data.
        let mut frame = [0u8, 0u8];
        let result = spi.transfer(&mut frame);
        let _ = self.cs.set_high();
        let frame = result?;
        Ok((((u16::from(frame[0]) & 0x1F) << 8) | u16::from(frame[1])) >> 1)
    }
}
