//! Datalogger record schema and its wire encoding.
//!
//! One record is one length-delimited message: a timestamp, the aggregation
//! period (zero for point events), a source ID declared earlier by a
//! `SourceDef` record, and exactly one payload. Records borrow their
//! payload data; they are constructed, encoded and appended to the log in
//! one step.

use crate::can::{CanErrorKind, CanEvent};
use crate::proto::{encode_delimited, Overflow, Writer};
use crate::stats::StatisticalResult;
use embedded_can::Frame;

/// Worst-case encoded record, including the delimiting prefix.
pub const MAX_RECORD_LEN: usize = 192;

/// Longest annotation text carried by an info record.
pub const MAX_INFO_LEN: usize = 128;

/// What a source ID refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SourceType {
    /// No particular kind.
    Unknown = 0,
    /// A CAN bus.
    Can = 1,
    /// A time source.
    Time = 2,
    /// A voltage rail.
    Voltage = 3,
    /// A temperature sensor.
    Temperature = 4,
}

/// CAN frame ID width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FrameType {
    /// 11-bit identifier.
    Standard = 0,
    /// 29-bit identifier.
    Extended = 1,
}

/// CAN frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RtrType {
    /// Data frame.
    Data = 0,
    /// Remote transmission request.
    Remote = 1,
}

/// Origin of a logged CAN error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ErrorSource {
    /// Unmapped controller condition.
    Unknown = 0,
    /// Error warning limit.
    ErrorWarning = 1,
    /// Receive overrun.
    DataOverrun = 2,
    /// Error passive.
    ErrorPassive = 3,
    /// Arbitration lost.
    ArbitrationLost = 4,
    /// Bus off.
    BusOff = 5,
}

impl From<CanErrorKind> for ErrorSource {
    fn from(kind: CanErrorKind) -> Self {
        match kind {
            CanErrorKind::Warning => ErrorSource::ErrorWarning,
            CanErrorKind::DataOverrun => ErrorSource::DataOverrun,
            CanErrorKind::Passive => ErrorSource::ErrorPassive,
            CanErrorKind::ArbitrationLost => ErrorSource::ArbitrationLost,
            CanErrorKind::BusOff => ErrorSource::BusOff,
            CanErrorKind::Unknown => ErrorSource::Unknown,
        }
    }
}

/// Payload variants; exactly one per record.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    /// Human-readable annotation.
    Info(&'a str),
    /// Declaration of what a source ID means; written once at file open.
    SourceDef {
        /// Kind of source.
        source_type: SourceType,
        /// Human-readable name, units included.
        name: &'a str,
    },
    /// Wall-clock reading from the RTC.
    RtcTime {
        /// Seconds since the Unix epoch.
        unix_seconds: i64,
    },
    /// A frame received from the bus.
    CanMessage {
        /// Raw identifier bits.
        id: u32,
        /// Identifier width.
        frame_type: FrameType,
        /// Data or remote frame.
        rtr_type: RtrType,
        /// Payload bytes (empty for remote frames).
        data: &'a [u8],
    },
    /// A controller error event.
    CanError {
        /// What the controller reported.
        source: ErrorSource,
    },
    /// Statistical aggregate of a sensor over the period.
    SensorReading(StatisticalResult),
    /// Histogram of a sensor over the period.
    SensorDistribution {
        /// Bucket dividers; `counts` has one more entry.
        buckets: &'a [i32],
        /// Per-bucket counts, the last one counting everything at or above
        /// the final divider.
        counts: &'a [u32],
    },
}

/// One log record.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    /// Milliseconds since boot.
    pub timestamp_ms: u32,
    /// Aggregation period in ms; zero for point events.
    pub period_ms: u32,
    /// Source this record belongs to.
    pub source_id: u32,
    /// The payload.
    pub payload: Payload<'a>,
}

impl Record<'_> {
    /// Encode with the delimiting length prefix, returning the total size.
    pub fn encode_delimited(&self, buf: &mut [u8]) -> Result<usize, Overflow> {
        encode_delimited(buf, |writer| self.encode_fields(writer))
    }

    fn encode_fields(&self, writer: &mut Writer<'_>) -> Result<(), Overflow> {
        writer.write_uint_field(1, u64::from(self.timestamp_ms))?;
        writer.write_uint_field(2, u64::from(self.period_ms))?;
        writer.write_uint_field(3, u64::from(self.source_id))?;
        match self.payload {
            Payload::Info(text) => writer.write_message_field(4, |body| {
                body.write_str_field(1, text)
            }),
            Payload::SourceDef { source_type, name } => writer.write_message_field(5, |body| {
                body.write_uint_field(1, u64::from(source_type as u8))?;
                body.write_str_field(2, name)
            }),
            Payload::RtcTime { unix_seconds } => writer.write_message_field(6, |body| {
                body.write_int_field(1, unix_seconds)
            }),
            Payload::CanMessage {
                id,
                frame_type,
                rtr_type,
                data,
            } => writer.write_message_field(7, |body| {
                body.write_uint_field(1, u64::from(id))?;
                body.write_uint_field(2, u64::from(frame_type as u8))?;
                body.write_uint_field(3, u64::from(rtr_type as u8))?;
                body.write_bytes_field(4, data)
            }),
            Payload::CanError { source } => writer.write_message_field(8, |body| {
                body.write_uint_field(1, u64::from(source as u8))
            }),
            Payload::SensorReading(stats) => writer.write_message_field(9, |body| {
                body.write_uint_field(1, u64::from(stats.num_samples))?;
                body.write_int_field(2, i64::from(stats.min))?;
                body.write_int_field(3, i64::from(stats.max))?;
                body.write_int_field(4, i64::from(stats.avg))?;
                body.write_uint_field(5, u64::from(stats.stdev))
            }),
            Payload::SensorDistribution { buckets, counts } => {
                writer.write_message_field(10, |body| {
                    body.write_packed_int_field(1, buckets)?;
                    body.write_packed_uint_field(2, counts)
                })
            }
        }
    }
}

/// Annotation record.
pub fn info_record(text: &str, source_id: u32, timestamp_ms: u32) -> Record<'_> {
    Record {
        timestamp_ms,
        period_ms: 0,
        source_id,
        payload: Payload::Info(text),
    }
}

/// Source declaration record.
pub fn source_def_record(
    source_id: u32,
    source_type: SourceType,
    name: &str,
) -> Record<'_> {
    Record {
        timestamp_ms: 0,
        period_ms: 0,
        source_id,
        payload: Payload::SourceDef { source_type, name },
    }
}

/// RTC reading record.
pub fn time_record(unix_seconds: i64, source_id: u32, timestamp_ms: u32) -> Record<'static> {
    Record {
        timestamp_ms,
        period_ms: 0,
        source_id,
        payload: Payload::RtcTime { unix_seconds },
    }
}

/// Record for a received CAN event (frame or error).
pub fn can_event_record(event: &CanEvent, source_id: u32) -> Record<'_> {
    match event {
        CanEvent::Message {
            frame,
            timestamp_us,
        } => Record {
            timestamp_ms: (timestamp_us / 1000) as u32,
            period_ms: 0,
            source_id,
            payload: Payload::CanMessage {
                id: frame.raw_id(),
                frame_type: if frame.is_extended() {
                    FrameType::Extended
                } else {
                    FrameType::Standard
                },
                rtr_type: if frame.is_remote_frame() {
                    RtrType::Remote
                } else {
                    RtrType::Data
                },
                data: frame.data(),
            },
        },
        CanEvent::Error { kind, timestamp_us } => Record {
            timestamp_ms: (timestamp_us / 1000) as u32,
            period_ms: 0,
            source_id,
            payload: Payload::CanError {
                source: (*kind).into(),
            },
        },
    }
}

/// Aggregate record for one sense period.
pub fn stats_record(
    stats: StatisticalResult,
    source_id: u32,
    timestamp_ms: u32,
    period_ms: u32,
) -> Record<'static> {
    Record {
        timestamp_ms,
        period_ms,
        source_id,
        payload: Payload::SensorReading(stats),
    }
}

/// Histogram record for one sense period.
pub fn histogram_record<'a>(
    buckets: &'a [i32],
    counts: &'a [u32],
    source_id: u32,
    timestamp_ms: u32,
    period_ms: u32,
) -> Record<'a> {
    Record {
        timestamp_ms,
        period_ms,
        source_id,
        payload: Payload::SensorDistribution { buckets, counts },
    }
}
