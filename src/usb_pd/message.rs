//! USB-PD wire formats: the 16-bit message header and 32-bit data objects.
//!
//! Everything on the wire is little-endian; data objects are concatenated
//! after the header. Only the small subset of PD 2.0 a fixed-supply sink
//! needs is modeled.

use bitfield::bitfield;

bitfield! {
    /// 16-bit PD message header.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct MessageHeader(u16);
    impl Debug;

    /// Control or data message type, interpreted per `num_data_objects`.
    pub u8, message_type, set_message_type: 4, 0;
    /// Port data role (0 = UFP).
    pub data_role, set_data_role: 5;
    /// Specification revision (1 = PD 2.0).
    pub u8, spec_revision, set_spec_revision: 7, 6;
    /// Port power role (0 = sink).
    pub power_role, set_power_role: 8;
    /// Rolling message ID, 0..=7.
    pub u8, message_id, set_message_id: 11, 9;
    /// Number of 32-bit data objects; 0 marks a control message.
    pub u8, num_data_objects, set_num_data_objects: 14, 12;
    /// Extended-message flag (never set by this sink).
    pub extended, set_extended: 15;
}

/// Control message types (header with zero data objects).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ControlMessageType {
    /// CRC acknowledge, generated and consumed by the controller chip.
    GoodCrc = 0x01,
    /// Source requests minimum power draw.
    GotoMin = 0x02,
    /// Request accepted.
    Accept = 0x03,
    /// Request rejected.
    Reject = 0x04,
    /// Power supply ready at the negotiated level.
    PsRdy = 0x06,
    /// Ask the source for its capabilities.
    GetSourceCap = 0x07,
    /// Ask the sink for its capabilities.
    GetSinkCap = 0x08,
}

/// Data message types (header with one or more data objects).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DataMessageType {
    /// Source capability advertisement, up to 8 PDOs.
    SourceCapabilities = 0x01,
    /// Sink request for one advertised PDO.
    Request = 0x02,
    /// Sink capability advertisement.
    SinkCapabilities = 0x04,
}

/// Spec revision field value for PD 2.0.
pub const SPEC_REVISION_2_0: u8 = 1;

/// Build a header the way this sink always sends: sink power role, UFP data
/// role, PD 2.0.
pub fn sink_header(message_type: u8, num_data_objects: u8, message_id: u8) -> MessageHeader {
    let mut header = MessageHeader(0);
    header.set_message_type(message_type);
    header.set_num_data_objects(num_data_objects);
    header.set_message_id(message_id);
    header.set_spec_revision(SPEC_REVISION_2_0);
    header
}

bitfield! {
    /// Fixed-supply power data object.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct FixedSupplyPdo(u32);
    impl Debug;

    /// Maximum current in 10 mA units.
    pub u16, max_current_10ma, set_max_current_10ma: 9, 0;
    /// Voltage in 50 mV units.
    pub u16, voltage_50mv, set_voltage_50mv: 19, 10;
    /// Peak current capability code.
    pub u8, peak_current, set_peak_current: 21, 20;
    /// Unchunked extended messages supported.
    pub unchunked_extended, set_unchunked_extended: 24;
    /// Dual-role data capable.
    pub dual_role_data, set_dual_role_data: 25;
    /// USB communications capable.
    pub usb_communications_capable, set_usb_communications_capable: 26;
    /// Unconstrained power.
    pub unconstrained_power, set_unconstrained_power: 27;
    /// USB suspend supported.
    pub usb_suspend_supported, set_usb_suspend_supported: 28;
    /// Dual-role power capable.
    pub dual_role_power, set_dual_role_power: 29;
    /// Supply type discriminator, 00 for fixed supply.
    pub u8, supply_type, set_supply_type: 31, 30;
}

bitfield! {
    /// Request data object for a fixed-supply PDO.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct RequestDataObject(u32);
    impl Debug;

    /// Maximum operating current in 10 mA units.
    pub u16, max_operating_current_10ma, set_max_operating_current_10ma: 9, 0;
    /// Operating current in 10 mA units.
    pub u16, operating_current_10ma, set_operating_current_10ma: 19, 10;
    /// The sink can continue without USB suspend.
    pub no_usb_suspend, set_no_usb_suspend: 24;
    /// USB communications capable.
    pub usb_communications_capable, set_usb_communications_capable: 25;
    /// Capability mismatch flag.
    pub capability_mismatch, set_capability_mismatch: 26;
    /// GiveBack supported.
    pub give_back, set_give_back: 27;
    /// 1-indexed position of the requested PDO.
    pub u8, object_position, set_object_position: 30, 28;
}

/// Supply type advertised by a PDO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SupplyType {
    /// Fixed voltage supply.
    FixedSupply,
    /// Battery.
    Battery,
    /// Variable supply.
    Variable,
    /// Augmented (PPS) supply.
    Augmented,
}

/// One source capability, unpacked for consumers that think in millivolts
/// and milliamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Capability {
    /// Supply type; the conversion fields are meaningful for fixed supplies.
    pub supply_type: SupplyType,
    /// Advertised voltage in mV.
    pub voltage_mv: u16,
    /// Advertised maximum current in mA.
    pub max_current_ma: u16,
    /// Source is dual-role power capable.
    pub dual_role_power: bool,
    /// Source has unconstrained power.
    pub unconstrained_power: bool,
    /// Source is USB communications capable.
    pub usb_communications_capable: bool,
    /// Source is dual-role data capable.
    pub dual_role_data: bool,
}

impl Capability {
    /// Unpack a raw 32-bit PDO.
    pub fn unpack(raw: u32) -> Self {
        let pdo = FixedSupplyPdo(raw);
        let supply_type = match pdo.supply_type() {
            0 => SupplyType::FixedSupply,
            1 => SupplyType::Battery,
            2 => SupplyType::Variable,
            _ => SupplyType::Augmented,
        };
        Self {
            supply_type,
            voltage_mv: pdo.voltage_50mv() * 50,
            max_current_ma: pdo.max_current_10ma() * 10,
            dual_role_power: pdo.dual_role_power(),
            unconstrained_power: pdo.unconstrained_power(),
            usb_communications_capable: pdo.usb_communications_capable(),
            dual_role_data: pdo.dual_role_data(),
        }
    }
}

/// Build the request object this sink sends: the given object position,
/// no USB suspend, operating and maximum current both set to `current_ma`.
pub fn request_object(object_position: u8, current_ma: u16) -> u32 {
    let mut request = RequestDataObject(0);
    request.set_object_position(object_position);
    request.set_no_usb_suspend(true);
    request.set_operating_current_10ma(current_ma / 10);
    request.set_max_operating_current_10ma(current_ma / 10);
    request.0
}
