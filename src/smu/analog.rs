//! SMU analog output stage: calibrated measurement and the staged drive
//! sequencer.
//!
//! The output stage is an integrator driving complementary source and sink
//! transistors. Closing both paths in one step would force the integrator
//! to slew across its whole range, overshooting and spiking current into
//! the load; instead enabling walks Disabled → ResetIntegrator (rail the
//! voltage DAC with both paths open, letting the capacitor pre-charge) →
//! SingleEnable (true setpoint, one path) → Enabled (both paths). Each
//! phase holds for [`INTEGRATOR_RESET_TIME_MS`].

use crate::smu::calibration::LinearCalibration;
use crate::smu::mcp3201::Mcp3201;
use crate::smu::mcp4921::Mcp4921;
use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;

/// Dwell in each enable phase; long enough for the integrator capacitor to
/// settle near the rail.
pub const INTEGRATOR_RESET_TIME_MS: u64 = 10;

/// Drive sequencer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriveState {
    /// Both transistors off; setpoint writes are buffered.
    Disabled,
    /// Both transistors off, voltage DAC railed to pre-charge the
    /// integrator.
    ResetIntegrator,
    /// True setpoint applied, one transistor enabled.
    SingleEnable,
    /// Both transistors enabled; setpoint writes apply immediately.
    Enabled,
}

/// The analog output stage: three DACs, two ADCs and the transistor enables,
/// all hanging off one shared SPI bus.
///
/// `P` is the platform's erased output-pin type; `D` provides the LDAC
/// latch pulse width.
pub struct AnalogStage<SPI, P, D> {
    spi: SPI,
    delay: D,
    dac_volt: Mcp4921<P>,
    dac_curr_neg: Mcp4921<P>,
    dac_curr_pos: Mcp4921<P>,
    ldac: P,
    adc_volt: Mcp3201<P>,
    adc_curr: Mcp3201<P>,
    enable_source: P,
    enable_sink: P,

    voltage_adc_cal: LinearCalibration,
    current_adc_cal: LinearCalibration,
    voltage_dac_cal: LinearCalibration,
    current_dac_cal: LinearCalibration,

    state: DriveState,
    /// First transistor to close is the source side.
    start_source_driver: bool,
    phase_started_us: u64,

    target_voltage_mv: i32,
    target_current_source_ma: i32,
    target_current_sink_ma: i32,
}

impl<SPI, P, D> AnalogStage<SPI, P, D>
where
    SPI: Transfer<u8> + Write<u8, Error = <SPI as Transfer<u8>>::Error>,
    P: OutputPin,
    D: DelayUs<u8>,
{
    /// Assemble the stage with nominal calibration and everything off.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spi: SPI,
        delay: D,
        dac_volt: Mcp4921<P>,
        dac_curr_neg: Mcp4921<P>,
        dac_curr_pos: Mcp4921<P>,
        ldac: P,
        adc_volt: Mcp3201<P>,
        adc_curr: Mcp3201<P>,
        mut enable_source: P,
        mut enable_sink: P,
    ) -> Self {
        let _ = enable_source.set_low();
        let _ = enable_sink.set_low();
        Self {
            spi,
            delay,
            dac_volt,
            dac_curr_neg,
            dac_curr_pos,
            ldac,
            adc_volt,
            adc_curr,
            enable_source,
            enable_sink,
            voltage_adc_cal: LinearCalibration::default_voltage_adc(),
            current_adc_cal: LinearCalibration::default_current_adc(),
            voltage_dac_cal: LinearCalibration::default_voltage_dac(),
            current_dac_cal: LinearCalibration::default_current_dac(),
            state: DriveState::Disabled,
            start_source_driver: false,
            phase_started_us: 0,
            target_voltage_mv: 0,
            target_current_source_ma: 100,
            target_current_sink_ma: -100,
        }
    }

    /// Sequencer state.
    pub fn state(&self) -> DriveState {
        self.state
    }

    /// Replace the voltage ADC calibration.
    pub fn set_voltage_adc_calibration(&mut self, cal: LinearCalibration) {
        self.voltage_adc_cal = cal;
    }

    /// Replace the current ADC calibration.
    pub fn set_current_adc_calibration(&mut self, cal: LinearCalibration) {
        self.current_adc_cal = cal;
    }

    /// Replace the voltage DAC calibration.
    pub fn set_voltage_dac_calibration(&mut self, cal: LinearCalibration) {
        self.voltage_dac_cal = cal;
    }

    /// Replace the current DAC calibration.
    pub fn set_current_dac_calibration(&mut self, cal: LinearCalibration) {
        self.current_dac_cal = cal;
    }

    /// Measure the output voltage in mV, also yielding the raw code.
    pub fn read_voltage_mv(&mut self) -> Result<(i32, u16), <SPI as Transfer<u8>>::Error> {
        let raw = self.adc_volt.read_raw_u12(&mut self.spi)?;
        Ok((self.voltage_adc_cal.counts_to_value(raw), raw))
    }

    /// Measure the output current in mA, also yielding the raw code.
    pub fn read_current_ma(&mut self) -> Result<(i32, u16), <SPI as Transfer<u8>>::Error> {
        let raw = self.adc_curr.read_raw_u12(&mut self.spi)?;
        Ok((self.current_adc_cal.counts_to_value(raw), raw))
    }

    /// Set the target voltage. Applied immediately only when Enabled.
    pub fn set_voltage_mv(&mut self, mv: i32) -> Result<(), <SPI as Transfer<u8>>::Error> {
        self.target_voltage_mv = mv;
        if self.state == DriveState::Enabled {
            self.write_voltage_target()?;
        }
        Ok(())
    }

    /// Set the source-side current limit. Applied immediately only when
    /// Enabled.
    pub fn set_current_source_ma(&mut self, ma: i32) -> Result<(), <SPI as Transfer<u8>>::Error> {
        self.target_current_source_ma = ma;
        if self.state == DriveState::Enabled {
            self.write_current_source_target()?;
        }
        Ok(())
    }

    /// Set the sink-side current limit. Applied immediately only when
    /// Enabled.
    pub fn set_current_sink_ma(&mut self, ma: i32) -> Result<(), <SPI as Transfer<u8>>::Error> {
        self.target_current_sink_ma = ma;
        if self.state == DriveState::Enabled {
            self.write_current_sink_target()?;
        }
        Ok(())
    }

    /// Current targets: (voltage mV, source mA, sink mA).
    pub fn targets(&self) -> (i32, i32, i32) {
        (
            self.target_voltage_mv,
            self.target_current_source_ma,
            self.target_current_sink_ma,
        )
    }

    /// Begin the staged enable sequence.
    pub fn enable_driver(&mut self, now_us: u64) -> Result<(), <SPI as Transfer<u8>>::Error> {
        let _ = self.enable_source.set_low();
        let _ = self.enable_sink.set_low();

        let (measured_mv, _) = self.read_voltage_mv()?;
        if self.target_voltage_mv >= measured_mv {
            // Will be sourcing: rail the integrator toward the lowest
            // output first.
            self.write_dac(Dac::Volt, 4095)?;
            self.start_source_driver = true;
        } else {
            self.write_dac(Dac::Volt, 0)?;
            self.start_source_driver = false;
        }
        self.write_current_source_target()?;
        self.write_current_sink_target()?;

        self.phase_started_us = now_us;
        self.state = DriveState::ResetIntegrator;
        Ok(())
    }

    /// Immediately open both paths.
    pub fn disable_driver(&mut self) {
        let _ = self.enable_source.set_low();
        let _ = self.enable_sink.set_low();
        self.state = DriveState::Disabled;
    }

    /// Advance the sequencer. Poll from the main loop.
    pub fn update(&mut self, now_us: u64) -> Result<(), <SPI as Transfer<u8>>::Error> {
        match self.state {
            DriveState::Disabled => {
                let _ = self.enable_source.set_low();
                let _ = self.enable_sink.set_low();
            }
            DriveState::ResetIntegrator => {
                if self.phase_elapsed_ms(now_us) >= INTEGRATOR_RESET_TIME_MS {
                    self.write_voltage_target()?;
                    if self.start_source_driver {
                        let _ = self.enable_source.set_high();
                    } else {
                        let _ = self.enable_sink.set_high();
                    }
                    self.phase_started_us = now_us;
                    self.state = DriveState::SingleEnable;
                }
            }
            DriveState::SingleEnable => {
                if self.phase_elapsed_ms(now_us) >= INTEGRATOR_RESET_TIME_MS {
                    let _ = self.enable_source.set_high();
                    let _ = self.enable_sink.set_high();
                    self.state = DriveState::Enabled;
                }
            }
            DriveState::Enabled => {
                let _ = self.enable_source.set_high();
                let _ = self.enable_sink.set_high();
            }
        }
        Ok(())
    }

    /// Voltage for a raw voltage-DAC code, for raw host control.
    pub fn dac_to_voltage(&self, raw: u16) -> i32 {
        self.voltage_dac_cal.counts_to_value(raw)
    }

    /// Current for a raw current-DAC code, for raw host control.
    pub fn dac_to_current(&self, raw: u16) -> i32 {
        self.current_dac_cal.counts_to_value(raw)
    }

    /// Write a raw voltage-DAC code, updating the target to match.
    pub fn set_voltage_raw(&mut self, raw: u16) -> Result<(), <SPI as Transfer<u8>>::Error> {
        self.target_voltage_mv = self.dac_to_voltage(raw);
        if self.state == DriveState::Enabled {
            self.write_dac(Dac::Volt, raw)?;
        }
        Ok(())
    }

    /// Write a raw source-current DAC code, updating the target to match.
    pub fn set_current_source_raw(&mut self, raw: u16) -> Result<(), <SPI as Transfer<u8>>::Error> {
        self.target_current_source_ma = self.dac_to_current(raw);
        if self.state == DriveState::Enabled {
            self.write_dac(Dac::CurrPos, raw)?;
        }
        Ok(())
    }

    /// Write a raw sink-current DAC code, updating the target to match.
    pub fn set_current_sink_raw(&mut self, raw: u16) -> Result<(), <SPI as Transfer<u8>>::Error> {
        self.target_current_sink_ma = self.dac_to_current(raw);
        if self.state == DriveState::Enabled {
            self.write_dac(Dac::CurrNeg, raw)?;
        }
        Ok(())
    }

    fn phase_elapsed_ms(&self, now_us: u64) -> u64 {
        now_us.saturating_sub(self.phase_started_us) / 1000
    }

    fn write_voltage_target(&mut self) -> Result<(), <SPI as Transfer<u8>>::Error> {
        let code = self.voltage_dac_cal.value_to_counts(self.target_voltage_mv);
        self.write_dac(Dac::Volt, code)
    }

    fn write_current_source_target(&mut self) -> Result<(), <SPI as Transfer<u8>>::Error> {
        let code = self
            .current_dac_cal
            .value_to_counts(self.target_current_source_ma);
        self.write_dac(Dac::CurrPos, code)
    }

    fn write_current_sink_target(&mut self) -> Result<(), <SPI as Transfer<u8>>::Error> {
        let code = self
            .current_dac_cal
            .value_to_counts(self.target_current_sink_ma);
        self.write_dac(Dac::CurrNeg, code)
    }

    fn write_dac(&mut self, dac: Dac, code: u16) -> Result<(), <SPI as Transfer<u8>>::Error> {
        match dac {
            Dac::Volt => self.dac_volt.write_raw_u12(&mut self.spi, code)?,
            Dac::CurrPos => self.dac_curr_pos.write_raw_u12(&mut self.spi, code)?,
            Dac::CurrNeg => self.dac_curr_neg.write_raw_u12(&mut self.spi, code)?,
        }
        // Latch on the LDAC falling edge.
        let _ = self.ldac.set_high();
        self.delay.delay_us(1);
        let _ = self.ldac.set_low();
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Dac {
    Volt,
    CurrPos,
    CurrNeg,
}
