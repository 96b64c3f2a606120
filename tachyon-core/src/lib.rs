#![no_std]
#![warn(missing_docs)]

//! `tachyon-core` provides a set of essential abstractions that serves as a
//! thin integration layer between the platform independent [`tachyon`] crate
//! and platform specific HAL crates (in documentation also referred to as
//! _target HALs_).
//!
//! Traits from this crate are not supposed to be implemented by the
//! application developer; implementations should be provided by target HALs
//! (host-side tests provide fakes instead).
//!
//! The `tachyon` firmware core is single-threaded and cooperative. Every
//! trait here is polled from the main loop or from a short interrupt service
//! routine; none of the operations are allowed to block for longer than a
//! bounded peripheral transaction (on the order of hundreds of microseconds).
//!
//! [`tachyon`]: <https://docs.rs/crate/tachyon/>

pub use fugit;

/// Free-running 32-bit microsecond counter.
///
/// This is the single hardware timebase of a device. It wraps roughly every
/// 71.6 minutes; `tachyon` virtualizes it into a 64-bit monotonic timeline
/// and only ever reads it through this trait.
///
/// Reading the counter must be safe from both main-loop and interrupt
/// context.
pub trait MicrosCounter {
    /// Current counter value, in microseconds, wrapping at 2³².
    fn now(&self) -> u32;
}

impl<T: MicrosCounter> MicrosCounter for &T {
    fn now(&self) -> u32 {
        T::now(self)
    }
}

/// Hardware watchdog.
///
/// The watchdog is the ultimate recovery mechanism: if the main loop stalls
/// past the watchdog period the device resets. It is fed exactly once per
/// loop iteration.
pub trait Watchdog {
    /// Restart the watchdog period.
    fn feed(&mut self);
    /// `true` if the most recent device reset was caused by the watchdog.
    fn caused_reset(&self) -> bool;
}

/// Non-blocking USB CDC serial endpoint.
///
/// Writes are atomic and best-effort: either the whole block is enqueued to
/// the endpoint or nothing is. A `false` return is a congestion signal to
/// the caller, never an error.
pub trait UsbSerial {
    /// `true` once the host side has opened the endpoint.
    fn connected(&mut self) -> bool;
    /// `true` once USB enumeration has completed.
    fn configured(&mut self) -> bool;
    /// `true` if at least one byte is available to read.
    fn readable(&mut self) -> bool;
    /// Read a single byte, if one is available.
    fn read_byte(&mut self) -> Option<u8>;
    /// Enqueue `bytes` as a single block. Returns `true` iff the full block
    /// was accepted; partial writes are never observable.
    fn write_block_nb(&mut self, bytes: &[u8]) -> bool;
    /// Start USB connection, optionally blocking until enumerated.
    fn connect(&mut self, blocking: bool);
    /// Drop endpoint state after a host disconnect.
    fn reset(&mut self);
}

/// Fixed-size report USB HID endpoint.
///
/// Report length is a property of the device descriptor; `tachyon`'s proto
/// transport fragments longer messages over multiple reports.
pub trait HidEndpoint {
    /// `true` once USB enumeration has completed.
    fn configured(&mut self) -> bool;
    /// Start USB connection, optionally blocking until enumerated.
    fn connect(&mut self, blocking: bool);
    /// Send one report. Returns `true` iff the report was accepted.
    fn send_report(&mut self, report: &[u8]) -> bool;
    /// Read one report into `buf` without blocking. Returns the report
    /// length, or `None` if no report is pending.
    fn read_report(&mut self, buf: &mut [u8]) -> Option<usize>;
}

/// Byte-level I²C master.
///
/// This is deliberately a byte-at-a-time interface (the mbed style) rather
/// than a transaction interface: the FUSB302 driver needs repeated-start
/// sequences, per-byte ACK observation for precise NACK error reporting, and
/// open-ended FIFO reads whose length is only known mid-transfer.
pub trait I2cBus {
    /// Generate a START (or repeated START) condition.
    fn start(&mut self);
    /// Generate a STOP condition.
    fn stop(&mut self);
    /// Write one byte. Returns `true` if the slave ACKed it.
    fn write_byte(&mut self, byte: u8) -> bool;
    /// Read one byte, ACKing it if `ack` is set.
    fn read_byte(&mut self, ack: bool) -> u8;
}

/// Gate for a single external interrupt line.
///
/// Used to bracket main-loop reads of state that the corresponding interrupt
/// handler writes, and to poll the raw line level where the edge interrupt
/// is not completely reliable.
pub trait IrqGate {
    /// Mask the interrupt.
    fn disable(&mut self);
    /// Unmask the interrupt.
    fn enable(&mut self);
    /// `true` while the (active-low) interrupt line is asserted.
    fn is_asserted(&self) -> bool;
}

/// CAN bus operating mode, as requested over a host protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanMode {
    /// Normal transmit/receive operation.
    Normal,
    /// Listen-only: receive without acknowledging frames.
    Silent,
    /// Bus off, controller held in reset.
    Reset,
}

/// Runtime configuration of a CAN controller.
///
/// Frame transmission and reception go through [`embedded_can`]; this trait
/// covers the controller-level knobs that `embedded_can` does not model.
/// All operations report success as `bool`; a `false` is answered to the
/// host (as an SLCAN bell) rather than escalated.
///
/// [`embedded_can`]: <https://docs.rs/crate/embedded-can/>
pub trait CanConfigure {
    /// Set the nominal bitrate.
    fn set_bitrate(&mut self, bitrate: fugit::HertzU32) -> bool;
    /// Program a raw BTR register pair instead of a nominal bitrate.
    fn set_bit_timing_raw(&mut self, btr0: u8, btr1: u8) -> bool;
    /// Change the operating mode.
    fn set_mode(&mut self, mode: CanMode) -> bool;
    /// Detect and clear a controller self-reset (the init bit re-asserting
    /// itself without software involvement). Returns `true` if the condition
    /// was present and has been cleared.
    fn clear_self_reset(&mut self) -> bool;
}

/// Errors surfaced by filesystem integrations.
///
/// The datalogger treats every one of these as a deterministic state machine
/// input, not as a fault to escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FsError {
    /// No medium present or medium initialization failed.
    NoMedium,
    /// Directory or file does not exist.
    NotFound,
    /// Name not expressible on the filesystem (8.3 constraints).
    InvalidPath,
    /// Any other I/O failure.
    Io,
}

/// An open file supporting sequential append.
pub trait File {
    /// Append `bytes` in full.
    fn write(&mut self, bytes: &[u8]) -> Result<(), FsError>;
    /// Flush buffered data and filesystem metadata to the medium.
    fn sync(&mut self) -> Result<(), FsError>;
    /// Close the file. The file value must not be used afterwards.
    fn close(&mut self) -> Result<(), FsError>;
}

/// A mountable filesystem with directory enumeration and file creation.
///
/// Only the small slice of filesystem semantics the datalogger needs:
/// sequential append, sync, and 8.3-constrained names. Paths are
/// `<dir>/<name>` with no nesting.
pub trait Filesystem {
    /// Open file type.
    type File: File;

    /// Initialize the medium and mount the filesystem.
    fn mount(&mut self) -> Result<(), FsError>;
    /// Unmount. Infallible by design; errors at unmount are unactionable.
    fn unmount(&mut self);
    /// Call `visit` with the name of every entry in `dir`.
    /// Fails with [`FsError::NotFound`] if the directory does not exist.
    fn read_dir(&mut self, dir: &str, visit: &mut dyn FnMut(&str)) -> Result<(), FsError>;
    /// Create directory `dir`.
    fn make_dir(&mut self, dir: &str) -> Result<(), FsError>;
    /// Create (or truncate) a file at `path` and open it for writing.
    fn create(&mut self, path: &str) -> Result<Self::File, FsError>;
}

/// A single ADC input channel.
///
/// `read_u16` follows the mbed convention of a left-aligned 16-bit sample
/// regardless of converter resolution.
pub trait AnalogInput {
    /// Sample the channel, left-aligned to 16 bits.
    fn read_u16(&mut self) -> u16;
}

/// Calendar time as kept by an external RTC chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RtcDateTime {
    /// Full year, e.g. 2024.
    pub year: u16,
    /// Month, 1..=12.
    pub month: u8,
    /// Day of month, 1..=31.
    pub day: u8,
    /// Hour, 0..=23.
    pub hour: u8,
    /// Minute, 0..=59.
    pub minute: u8,
    /// Second, 0..=59.
    pub second: u8,
}

impl RtcDateTime {
    /// Seconds since the Unix epoch, assuming the fields describe UTC.
    ///
    /// Uses the days-from-civil algorithm; valid for all years ≥ 1970.
    pub fn unix_seconds(&self) -> i64 {
        let y = i64::from(self.year) - i64::from(self.month <= 2);
        let era = y.div_euclid(400);
        let yoe = y - era * 400;
        let mp = (i64::from(self.month) + 9) % 12;
        let doy = (153 * mp + 2) / 5 + i64::from(self.day) - 1;
        let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
        let days = era * 146_097 + doe - 719_468;
        days * 86_400
            + i64::from(self.hour) * 3_600
            + i64::from(self.minute) * 60
            + i64::from(self.second)
    }
}

/// Battery-backed real-time clock.
pub trait Rtc {
    /// Read the current time. Returns `false` if the oscillator has stopped
    /// and the time is not trustworthy; the fields are still filled with
    /// whatever the chip reports.
    fn get_time(&mut self, out: &mut RtcDateTime) -> bool;
}

/// Byte-addressed non-volatile configuration memory.
pub trait Eeprom {
    /// Read `buf.len()` bytes starting at `addr`.
    fn read(&mut self, addr: u32, buf: &mut [u8]);
    /// Write `data` starting at `addr`. Returns `true` on success.
    fn write(&mut self, addr: u32, data: &[u8]) -> bool;
}

/// Device status display.
///
/// The LCD widget library itself is a platform concern; the firmware core
/// only pushes a per-device status snapshot at a fixed cadence. Headless
/// builds use the `()` implementation.
pub trait StatusDisplay<S> {
    /// Redraw the display from `status`.
    fn refresh(&mut self, status: &S);
}

impl<S> StatusDisplay<S> for () {
    fn refresh(&mut self, _status: &S) {}
}
