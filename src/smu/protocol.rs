//! SMU host protocol: commands and responses carried over the HID
//! transport as delimited messages.
//!
//! Both directions are implemented so the device can decode commands and
//! encode responses, host-side tooling can do the reverse, and tests can
//! round-trip. Every command is answered by exactly one response; commands
//! with nothing to report answer `Acknowledge`.

use crate::proto::{encode_delimited, read_delimited, Overflow, Reader, Writer, WIRE_LEN};
use crate::smu::calibration::LinearCalibration;

/// HID report size used by the SMU.
pub const REPORT_LEN: usize = 64;

/// Longest serial number stored in NVRAM.
pub const SERIAL_LEN: usize = 16;

/// Longest encoded command or response, prefix included.
pub const MAX_MESSAGE_LEN: usize = 192;

/// Output setpoints and enable, in physical units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetControl {
    /// Target voltage in mV.
    pub voltage: i32,
    /// Source-side current limit in mA.
    pub current_source: i32,
    /// Sink-side current limit in mA (negative).
    pub current_sink: i32,
    /// Drive enable.
    pub enable: bool,
}

/// Output setpoints as raw DAC codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetControlRaw {
    /// Voltage DAC code.
    pub voltage: u16,
    /// Source current DAC code.
    pub current_source: u16,
    /// Sink current DAC code.
    pub current_sink: u16,
    /// Drive enable.
    pub enable: bool,
}

/// Device configuration persisted in NVRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SmuConfig {
    serial: [u8; SERIAL_LEN],
    serial_len: u8,
    /// Voltage ADC calibration override.
    pub voltage_adc: Option<LinearCalibration>,
    /// Current ADC calibration override.
    pub current_adc: Option<LinearCalibration>,
    /// Voltage DAC calibration override.
    pub voltage_dac: Option<LinearCalibration>,
    /// Source current DAC calibration override.
    pub current_source_dac: Option<LinearCalibration>,
    /// Sink current DAC calibration override.
    pub current_sink_dac: Option<LinearCalibration>,
}

impl SmuConfig {
    /// Stored serial number.
    pub fn serial(&self) -> &str {
        core::str::from_utf8(&self.serial[..usize::from(self.serial_len)]).unwrap_or("")
    }

    /// Replace the serial number, truncating to [`SERIAL_LEN`] bytes.
    pub fn set_serial(&mut self, serial: &str) {
        let bytes = serial.as_bytes();
        let len = bytes.len().min(SERIAL_LEN);
        self.serial[..len].copy_from_slice(&bytes[..len]);
        self.serial_len = len as u8;
    }

    /// Merge every populated field of `other` over this configuration.
    pub fn update_from(&mut self, other: &SmuConfig) {
        if other.serial_len > 0 {
            self.serial = other.serial;
            self.serial_len = other.serial_len;
        }
        for (mine, theirs) in [
            (&mut self.voltage_adc, other.voltage_adc),
            (&mut self.current_adc, other.current_adc),
            (&mut self.voltage_dac, other.voltage_dac),
            (&mut self.current_source_dac, other.current_source_dac),
            (&mut self.current_sink_dac, other.current_sink_dac),
        ] {
            if theirs.is_some() {
                *mine = theirs;
            }
        }
    }

    fn encode_fields(&self, writer: &mut Writer<'_>) -> Result<(), Overflow> {
        writer.write_str_field(1, self.serial())?;
        let calibrations = [
            (2, self.voltage_adc),
            (3, self.current_adc),
            (4, self.voltage_dac),
            (5, self.current_source_dac),
            (6, self.current_sink_dac),
        ];
        for (field, calibration) in calibrations {
            if let Some(cal) = calibration {
                writer.write_message_field(field, |body| {
                    body.write_int_field(1, i64::from(cal.slope))?;
                    body.write_int_field(2, i64::from(cal.intercept))
                })?;
            }
        }
        Ok(())
    }

    /// Encode with the delimiting length prefix.
    pub fn encode_delimited(&self, buf: &mut [u8]) -> Result<usize, Overflow> {
        encode_delimited(buf, |writer| self.encode_fields(writer))
    }

    fn decode_fields(body: &[u8]) -> Option<Self> {
        let mut config = SmuConfig::default();
        let mut reader = Reader::new(body);
        while let Some((field, wire)) = reader.read_tag() {
            match field {
                1 if wire == WIRE_LEN => config.set_serial(reader.read_str()?),
                2..=6 if wire == WIRE_LEN => {
                    let cal = decode_calibration(reader.read_bytes()?)?;
                    match field {
                        2 => config.voltage_adc = Some(cal),
                        3 => config.current_adc = Some(cal),
                        4 => config.voltage_dac = Some(cal),
                        5 => config.current_source_dac = Some(cal),
                        _ => config.current_sink_dac = Some(cal),
                    }
                }
                _ => reader.skip(wire)?,
            }
        }
        Some(config)
    }

    /// Decode a delimited configuration.
    pub fn decode_delimited(buf: &[u8]) -> Option<Self> {
        let (body, _) = read_delimited(buf)?;
        Self::decode_fields(body)
    }
}

fn decode_calibration(body: &[u8]) -> Option<LinearCalibration> {
    let mut cal = LinearCalibration::new(0, 0);
    let mut reader = Reader::new(body);
    while let Some((field, wire)) = reader.read_tag() {
        match field {
            1 => cal.slope = reader.read_varint()? as i64 as i32,
            2 => cal.intercept = reader.read_varint()? as i64 as i32,
            _ => reader.skip(wire)?,
        }
    }
    Some(cal)
}

/// Host-to-device command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Identify the device and its converter widths.
    GetDeviceInfo,
    /// Read calibrated measurements.
    ReadMeasurements,
    /// Read raw ADC codes.
    ReadMeasurementsRaw,
    /// Set calibrated setpoints and enable state.
    SetControl(SetControl),
    /// Set raw DAC codes and enable state.
    SetControlRaw(SetControlRaw),
    /// Read the NVRAM configuration.
    ReadNvram,
    /// Merge fields into the NVRAM configuration.
    UpdateNvram(SmuConfig),
    /// Replace the NVRAM configuration.
    SetNvram(SmuConfig),
}

impl Command {
    /// Encode with the delimiting length prefix.
    pub fn encode_delimited(&self, buf: &mut [u8]) -> Result<usize, Overflow> {
        encode_delimited(buf, |writer| match self {
            Command::GetDeviceInfo => writer.write_message_field(1, |_| Ok(())),
            Command::ReadMeasurements => writer.write_message_field(2, |_| Ok(())),
            Command::ReadMeasurementsRaw => writer.write_message_field(3, |_| Ok(())),
            Command::SetControl(control) => writer.write_message_field(4, |body| {
                body.write_int_field(1, i64::from(control.voltage))?;
                body.write_int_field(2, i64::from(control.current_source))?;
                body.write_int_field(3, i64::from(control.current_sink))?;
                body.write_bool_field(4, control.enable)
            }),
            Command::SetControlRaw(control) => writer.write_message_field(5, |body| {
                body.write_uint_field(1, u64::from(control.voltage))?;
                body.write_uint_field(2, u64::from(control.current_source))?;
                body.write_uint_field(3, u64::from(control.current_sink))?;
                body.write_bool_field(4, control.enable)
            }),
            Command::ReadNvram => writer.write_message_field(6, |_| Ok(())),
            Command::UpdateNvram(config) => {
                writer.write_message_field(7, |body| config.encode_fields(body))
            }
            Command::SetNvram(config) => {
                writer.write_message_field(8, |body| config.encode_fields(body))
            }
        })
    }

    /// Decode a delimited command; `None` on malformed or unknown input.
    pub fn decode_delimited(buf: &[u8]) -> Option<Self> {
        let (body, _) = read_delimited(buf)?;
        let mut reader = Reader::new(body);
        let (field, wire) = reader.read_tag()?;
        if wire != WIRE_LEN {
            return None;
        }
        let payload = reader.read_bytes()?;
        match field {
            1 => Some(Command::GetDeviceInfo),
            2 => Some(Command::ReadMeasurements),
            3 => Some(Command::ReadMeasurementsRaw),
            4 => {
                let mut control = SetControl::default();
                let mut fields = Reader::new(payload);
                while let Some((field, wire)) = fields.read_tag() {
                    match field {
                        1 => control.voltage = fields.read_varint()? as i64 as i32,
                        2 => control.current_source = fields.read_varint()? as i64 as i32,
                        3 => control.current_sink = fields.read_varint()? as i64 as i32,
                        4 => control.enable = fields.read_varint()? != 0,
                        _ => fields.skip(wire)?,
                    }
                }
                Some(Command::SetControl(control))
            }
            5 => {
                let mut control = SetControlRaw::default();
                let mut fields = Reader::new(payload);
                while let Some((field, wire)) = fields.read_tag() {
                    match field {
                        1 => control.voltage = fields.read_varint()? as u16,
                        2 => control.current_source = fields.read_varint()? as u16,
                        3 => control.current_sink = fields.read_varint()? as u16,
                        4 => control.enable = fields.read_varint()? != 0,
                        _ => fields.skip(wire)?,
                    }
                }
                Some(Command::SetControlRaw(control))
            }
            6 => Some(Command::ReadNvram),
            7 => Some(Command::UpdateNvram(SmuConfig::decode_fields(payload)?)),
            8 => Some(Command::SetNvram(SmuConfig::decode_fields(payload)?)),
            _ => None,
        }
    }
}

/// Static device identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    build: [u8; 32],
    build_len: u8,
    /// Voltage ADC resolution in bits.
    pub voltage_adc_bits: u32,
    /// Current ADC resolution in bits.
    pub current_adc_bits: u32,
    /// Voltage DAC resolution in bits.
    pub voltage_dac_bits: u32,
    /// Source current DAC resolution in bits.
    pub current_source_dac_bits: u32,
    /// Sink current DAC resolution in bits.
    pub current_sink_dac_bits: u32,
}

impl DeviceInfo {
    /// Info for this hardware revision with the given build string.
    pub fn new(build: &str) -> Self {
        let mut info = Self {
            voltage_adc_bits: 12,
            current_adc_bits: 12,
            voltage_dac_bits: 12,
            current_source_dac_bits: 12,
            current_sink_dac_bits: 12,
            ..Self::default()
        };
        let bytes = build.as_bytes();
        let len = bytes.len().min(info.build.len());
        info.build[..len].copy_from_slice(&bytes[..len]);
        info.build_len = len as u8;
        info
    }

    /// Build identification string.
    pub fn build(&self) -> &str {
        core::str::from_utf8(&self.build[..usize::from(self.build_len)]).unwrap_or("")
    }
}

/// Device-to-host response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Command executed, nothing to report.
    Acknowledge,
    /// Device identification.
    DeviceInfo(DeviceInfo),
    /// Calibrated measurements: (mV, mA).
    Measurements {
        /// Output voltage in mV.
        voltage: i32,
        /// Output current in mA.
        current: i32,
    },
    /// Raw ADC codes.
    MeasurementsRaw {
        /// Voltage ADC code.
        voltage: u16,
        /// Current ADC code.
        current: u16,
    },
    /// The NVRAM configuration.
    Nvram(SmuConfig),
}

impl Response {
    /// Encode with the delimiting length prefix.
    pub fn encode_delimited(&self, buf: &mut [u8]) -> Result<usize, Overflow> {
        encode_delimited(buf, |writer| match self {
            Response::Acknowledge => writer.write_message_field(1, |_| Ok(())),
            Response::DeviceInfo(info) => writer.write_message_field(2, |body| {
                body.write_str_field(1, info.build())?;
                body.write_uint_field(2, u64::from(info.voltage_adc_bits))?;
                body.write_uint_field(3, u64::from(info.current_adc_bits))?;
                body.write_uint_field(4, u64::from(info.voltage_dac_bits))?;
                body.write_uint_field(5, u64::from(info.current_source_dac_bits))?;
                body.write_uint_field(6, u64::from(info.current_sink_dac_bits))
            }),
            Response::Measurements { voltage, current } => writer.write_message_field(3, |body| {
                body.write_int_field(1, i64::from(*voltage))?;
                body.write_int_field(2, i64::from(*current))
            }),
            Response::MeasurementsRaw { voltage, current } => {
                writer.write_message_field(4, |body| {
                    body.write_uint_field(1, u64::from(*voltage))?;
                    body.write_uint_field(2, u64::from(*current))
                })
            }
            Response::Nvram(config) => {
                writer.write_message_field(5, |body| config.encode_fields(body))
            }
        })
    }

    /// Decode a delimited response; `None` on malformed or unknown input.
    pub fn decode_delimited(buf: &[u8]) -> Option<Self> {
        let (body, _) = read_delimited(buf)?;
        let mut reader = Reader::new(body);
        let (field, wire) = reader.read_tag()?;
        if wire != WIRE_LEN {
            return None;
        }
        let payload = reader.read_bytes()?;
        match field {
            1 => Some(Response::Acknowledge),
            2 => {
                let mut build = "";
                let mut bits = [0u32; 5];
                let mut fields = Reader::new(payload);
                while let Some((field, wire)) = fields.read_tag() {
                    match field {
                        1 if wire == WIRE_LEN => build = fields.read_str()?,
                        2..=6 => bits[field as usize - 2] = fields.read_varint()? as u32,
                        _ => fields.skip(wire)?,
                    }
                }
                let mut info = DeviceInfo::new(build);
                info.voltage_adc_bits = bits[0];
                info.current_adc_bits = bits[1];
                info.voltage_dac_bits = bits[2];
                info.current_source_dac_bits = bits[3];
                info.current_sink_dac_bits = bits[4];
                Some(Response::DeviceInfo(info))
            }
            3 => {
                let mut voltage = 0;
                let mut current = 0;
                let mut fields = Reader::new(payload);
                while let Some((field, wire)) = fields.read_tag() {
                    match field {
                        1 => voltage = fields.read_varint()? as i64 as i32,
                        2 => current = fields.read_varint()? as i64 as i32,
                        _ => fields.skip(wire)?,
                    }
                }
                Some(Response::Measurements { voltage, current })
            }
            4 => {
                let mut voltage = 0;
                let mut current = 0;
                let mut fields = Reader::new(payload);
                while let Some((field, wire)) = fields.read_tag() {
                    match field {
                        1 => voltage = fields.read_varint()? as u16,
                        2 => current = fields.read_varint()? as u16,
                        _ => fields.skip(wire)?,
                    }
                }
                Some(Response::MeasurementsRaw { voltage, current })
            }
            5 => Some(Response::Nvram(SmuConfig::decode_fields(payload)?)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip_command(command: Command) {
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let len = command.encode_delimited(&mut buf).unwrap();
        assert_eq!(Command::decode_delimited(&buf[..len]), Some(command));
    }

    fn roundtrip_response(response: Response) {
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let len = response.encode_delimited(&mut buf).unwrap();
        assert_eq!(Response::decode_delimited(&buf[..len]), Some(response));
    }

    #[test]
    fn commands_roundtrip() {
        roundtrip_command(Command::GetDeviceInfo);
        roundtrip_command(Command::ReadMeasurements);
        roundtrip_command(Command::ReadMeasurementsRaw);
        roundtrip_command(Command::ReadNvram);
        roundtrip_command(Command::SetControl(SetControl {
            voltage: -12_000,
            current_source: 500,
            current_sink: -500,
            enable: true,
        }));
        roundtrip_command(Command::SetControlRaw(SetControlRaw {
            voltage: 2048,
            current_source: 100,
            current_sink: 4095,
            enable: false,
        }));

        let mut config = SmuConfig::default();
        config.set_serial("SMU-0042");
        config.voltage_adc = Some(LinearCalibration::new(61_700, 2_040));
        config.current_sink_dac = Some(LinearCalibration::new(-136_000, 2_050));
        roundtrip_command(Command::UpdateNvram(config));
        roundtrip_command(Command::SetNvram(config));
    }

    #[test]
    fn responses_roundtrip() {
        roundtrip_response(Response::Acknowledge);
        roundtrip_response(Response::DeviceInfo(DeviceInfo::new("v2 2024-01-15")));
        roundtrip_response(Response::Measurements {
            voltage: -3_300,
            current: 150,
        });
        roundtrip_response(Response::MeasurementsRaw {
            voltage: 2042,
            current: 2100,
        });
        let mut config = SmuConfig::default();
        config.set_serial("SMU-0001");
        roundtrip_response(Response::Nvram(config));
    }

    #[test]
    fn config_merge_keeps_unset_fields() {
        let mut base = SmuConfig::default();
        base.set_serial("SMU-0001");
        base.voltage_adc = Some(LinearCalibration::new(61_645, 2_042));

        let mut patch = SmuConfig::default();
        patch.current_adc = Some(LinearCalibration::new(136_000, 2_041));

        base.update_from(&patch);
        assert_eq!(base.serial(), "SMU-0001");
        assert_eq!(base.voltage_adc, Some(LinearCalibration::new(61_645, 2_042)));
        assert_eq!(base.current_adc, Some(LinearCalibration::new(136_000, 2_041)));
    }

    #[test]
    fn unknown_command_field_is_rejected() {
        // Hand-build a command with oneof field 15.
        let mut buf = [0u8; 16];
        let len = crate::proto::encode_delimited(&mut buf, |writer| {
            writer.write_message_field(15, |_| Ok(()))
        })
        .unwrap();
        assert_eq!(Command::decode_delimited(&buf[..len]), None);
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(Command::decode_delimited(&[0xFF, 0xFF, 0xFF]), None);
        assert_eq!(Response::decode_delimited(&[]), None);
    }
}
