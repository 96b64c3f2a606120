#![no_std]
#![warn(missing_docs)]
//! # Tachyon
//!
//! ## Overview
//! This crate is the platform-agnostic firmware core for a family of small
//! CAN bus instruments:
//!
//! - a **CAN adapter** bridging the bus to a host over USB, as either a
//!   Lawicel-style SLCAN ASCII interface or a COBS-framed binary telemetry
//!   stream
//! - a **datalogger** recording CAN traffic and analog telemetry to an SD
//!   card as length-delimited records, surviving brownouts, card removal
//!   and watchdog resets
//! - a **source-measure unit** (SMU), a bidirectional programmable
//!   voltage/current source driven from panel buttons or a USB HID report
//!   protocol, negotiating its supply rail over USB-PD
//!
//! Everything runs on a single cooperative main loop per device: no RTOS,
//! no allocator, no blocking waits. Hardware interrupts exist only at two
//! well-defined seams, the CAN receive ring ([`ring`]) and the USB-PD
//! interrupt handler ([`usb_pd::policy`]), both designed around a single
//! producer and a single consumer.
//!
//! Platform specifics live behind the traits in [`tachyon_core`]
//! (re-exported as [`core`](crate::core)); target HALs implement them, and
//! the device assemblies in [`device`] wire everything together. The shape
//! of a firmware binary is then just:
//!
//! ```ignore
//! static CAN_RX: RxRing<CanEvent, 128> = RxRing::new();
//!
//! fn main() -> ! {
//!     let (producer, consumer) = /* split CAN_RX, producer to the ISR */;
//!     let mut board = device::can_adapter::CanAdapter::new(
//!         device::can_adapter::Config::default(),
//!         hal_timer, hal_watchdog, hal_can, hal_usb_serial, consumer,
//!         usb_led, can_led, display,
//!     );
//!     board.run()
//! }
//! ```
//!
//! Host-side unit tests drive the same traits with fakes; every state
//! machine in the crate is exercised without hardware.

// Logging macros must be declared before any module that uses them.
mod fmt;

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod can;
pub mod datalogger;
pub mod device;
pub mod encoding;
pub mod filter;
pub mod gesture;
pub mod hid;
pub mod led;
pub mod proto;
pub mod record;
pub mod ring;
pub mod slcan;
pub mod smu;
pub mod stats;
pub mod time;
pub mod usb_pd;

pub use embedded_can;
pub use tachyon_core as core;
