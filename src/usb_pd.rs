//! USB Power Delivery sink: message formats, FUSB302 controller driver and
//! the policy state machine.
//!
//! The split mirrors the hardware: [`message`] is pure wire format,
//! [`fusb302`] is the register-level chip driver, and [`policy`] is the
//! cooperative state machine gluing them to the rest of the firmware.

pub mod fusb302;
pub mod message;
pub mod policy;

/// Longest a source may take to send its first Source_Capabilities after
/// attach, per the PD specification.
pub const T_TYPEC_SEND_SOURCE_CAP_MS: u64 = 200;

/// Dwell on one CC pin before its BC_LVL reading is trusted.
pub const MEASURE_TIME_MS: u64 = 1;

/// How long the VBUS comparator must read low before the sink treats the
/// source as disconnected and resets.
pub const COMP_LOW_RESET_TIME_MS: u64 = 1000;

/// Window for the source to answer a Request with Accept/Reject before the
/// sink retries.
pub const SENDER_RESPONSE_TIME_MS: u64 = 30;

/// Retries of an unanswered Request before falling back to vSafe5V.
pub const REQUEST_RETRY_LIMIT: u8 = 2;

/// VBUS-present comparator threshold; generous to account for leakage from
/// the 3.3 V rail.
pub const COMP_VBUS_THRESHOLD_MV: u32 = 3000;
