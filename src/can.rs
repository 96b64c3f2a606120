//! CAN frame and event types shared by every device.
//!
//! Frames are classic CAN only (no FD): standard or extended ID, up to 8
//! data bytes, optional RTR. The [`embedded_can::Frame`] implementation is
//! the seam through which platform CAN controllers produce and consume
//! frames.

use embedded_can::{ExtendedId, Frame, Id, StandardId};

/// Well-known CAN identifiers on the vehicle bus.
pub mod id {
    use embedded_can::StandardId;

    // Safety: both literals are below the 0x7FF standard-ID limit.
    /// Datalogger heartbeat.
    pub const HEART_DATALOGGER: StandardId = unsafe { StandardId::new_unchecked(0x049) };
    /// Datalogger core status (temperature / reference voltage).
    pub const CORE_STATUS_DATALOGGER: StandardId = unsafe { StandardId::new_unchecked(0x749) };
}

/// A classic CAN frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanMessage {
    id: Id,
    rtr: bool,
    len: u8,
    data: [u8; 8],
}

impl CanMessage {
    /// Payload length, 0..=8.
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    /// `true` for a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw identifier bits, 11 or 29 of them depending on the ID kind.
    pub fn raw_id(&self) -> u32 {
        match self.id {
            Id::Standard(id) => u32::from(id.as_raw()),
            Id::Extended(id) => id.as_raw(),
        }
    }
}

impl Frame for CanMessage {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }
        let mut bytes = [0; 8];
        bytes[..data.len()].copy_from_slice(data);
        Some(Self {
            id: id.into(),
            rtr: false,
            len: data.len() as u8,
            data: bytes,
        })
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > 8 {
            return None;
        }
        Some(Self {
            id: id.into(),
            rtr: true,
            len: dlc as u8,
            data: [0; 8],
        })
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.rtr
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        usize::from(self.len)
    }

    fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }
}

/// Controller error condition, as reported by the CAN peripheral's error
/// interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanErrorKind {
    /// Error warning limit reached.
    Warning,
    /// Receive data overrun in the controller.
    DataOverrun,
    /// Controller went error-passive.
    Passive,
    /// Arbitration lost.
    ArbitrationLost,
    /// Controller went bus-off.
    BusOff,
    /// Anything the controller reports that has no mapping.
    Unknown,
}

/// One timestamped entry in the receive pipeline: a frame or an error event,
/// in bus order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanEvent {
    /// A received data or remote frame.
    Message {
        /// The frame.
        frame: CanMessage,
        /// Time of reception on the 64-bit monotonic timeline.
        timestamp_us: u64,
    },
    /// A controller error event.
    Error {
        /// What went wrong.
        kind: CanErrorKind,
        /// Time of the error on the 64-bit monotonic timeline.
        timestamp_us: u64,
    },
}

impl CanEvent {
    /// Timestamp of the event, whichever variant it is.
    pub fn timestamp_us(&self) -> u64 {
        match self {
            CanEvent::Message { timestamp_us, .. } => *timestamp_us,
            CanEvent::Error { timestamp_us, .. } => *timestamp_us,
        }
    }
}

/// Core status frame payload: chip temperature and bandgap-derived reference
/// voltage, both big-endian u16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CoreStatus {
    /// Die temperature in 0.01 °C.
    pub temperature_centi_c: u16,
    /// Vref+ as measured against the internal bandgap, in mV.
    pub vref_bandgap_mv: u16,
}

impl CoreStatus {
    /// Wire representation of the payload.
    pub fn to_payload(self) -> [u8; 4] {
        let t = self.temperature_centi_c.to_be_bytes();
        let v = self.vref_bandgap_mv.to_be_bytes();
        [t[0], t[1], v[0], v[1]]
    }
}

/// Build a standard data frame from a fixed payload.
///
/// Infallible shorthand for the common case of well-known IDs and payloads
/// of at most 8 bytes.
pub fn make_message(id: StandardId, payload: &[u8]) -> CanMessage {
    CanMessage::new(Id::Standard(id), payload).unwrap_or(CanMessage {
        id: Id::Standard(id),
        rtr: false,
        len: 0,
        data: [0; 8],
    })
}

/// Extended-frame counterpart of [`make_message`].
pub fn make_extended_message(id: ExtendedId, payload: &[u8]) -> CanMessage {
    CanMessage::new(Id::Extended(id), payload).unwrap_or(CanMessage {
        id: Id::Extended(id),
        rtr: false,
        len: 0,
        data: [0; 8],
    })
}
