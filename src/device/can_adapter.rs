//! CAN adapter: bus-to-USB bridge.
//!
//! Ships every received frame to the host either as SLCAN ASCII or as
//! Tachyon telemetry frames, and (in SLCAN mode) accepts transmit and
//! configuration commands back. Error events only pulse the status LED and
//! feed the bench counters; neither host protocol represents them.

use crate::can::CanEvent;
use crate::encoding::frame;
use crate::led::{Color, RgbActivity};
use crate::ring::Consumer;
use crate::slcan::{Slcan, SlcanHandler};
use crate::stats::MovingAverage;
use crate::time::{Monotonic, Ticker};
use embedded_hal::digital::v2::OutputPin;
use fugit::HertzU32;
use tachyon_core::{
    CanConfigure, CanMode, MicrosCounter, StatusDisplay, UsbSerial, Watchdog,
};

/// Capacity of the receive ring shared with the CAN ISR.
pub const RX_RING_CAPACITY: usize = 128;

/// How the bus is presented to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HostProtocol {
    /// Lawicel-style ASCII, bidirectional.
    Slcan,
    /// COBS-framed binary telemetry, receive only.
    TachyonTelemetry,
}

/// Compile-time adapter configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Host-side framing.
    pub host_protocol: HostProtocol,
    /// Controller self-reset check cadence.
    pub can_check_period_us: u64,
    /// USB liveness blink cadence.
    pub usb_status_period_us: u64,
    /// Statistics window advance cadence.
    pub stat_period_us: u64,
    /// Display refresh cadence.
    pub display_period_us: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_protocol: HostProtocol::Slcan,
            can_check_period_us: 1_000_000,
            usb_status_period_us: 1_000_000,
            stat_period_us: 125_000,
            display_period_us: 100_000,
        }
    }
}

/// Display snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct CanAdapterStatus {
    /// Frames received over the last statistics window.
    pub rx_count: u32,
    /// Error events over the last statistics window.
    pub error_count: u32,
    /// Ring overruns since boot.
    pub overruns: u32,
    /// Host endpoint open.
    pub connected: bool,
}

/// The CAN adapter device.
pub struct CanAdapter<'r, MC, CAN, S, W, P, D> {
    config: Config,
    time: Monotonic<MC>,
    wdt: W,
    can: CAN,
    serial: S,
    rx: Consumer<'r, CanEvent, RX_RING_CAPACITY>,
    slcan: Slcan<16>,
    usb_led: RgbActivity<P, P, P>,
    can_led: RgbActivity<P, P, P>,
    display: D,

    can_check_ticker: Ticker,
    usb_status_ticker: Ticker,
    stat_ticker: Ticker,
    display_ticker: Ticker,

    rx_window: MovingAverage<8>,
    error_window: MovingAverage<8>,
    rx_this_window: u32,
    errors_this_window: u32,
    status: CanAdapterStatus,
}

impl<'r, MC, CAN, S, W, P, D> CanAdapter<'r, MC, CAN, S, W, P, D>
where
    MC: MicrosCounter,
    CAN: embedded_can::nb::Can<Frame = crate::can::CanMessage> + CanConfigure,
    S: UsbSerial,
    W: Watchdog,
    P: OutputPin,
    D: StatusDisplay<CanAdapterStatus>,
{
    /// Assemble the adapter. The receive ring's producer half belongs to
    /// the CAN ISR.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        counter: MC,
        wdt: W,
        can: CAN,
        serial: S,
        rx: Consumer<'r, CanEvent, RX_RING_CAPACITY>,
        usb_led: RgbActivity<P, P, P>,
        can_led: RgbActivity<P, P, P>,
        display: D,
    ) -> Self {
        Self {
            time: Monotonic::new(counter),
            wdt,
            can,
            serial,
            rx,
            slcan: Slcan::new(),
            usb_led,
            can_led,
            display,
            can_check_ticker: Ticker::new(config.can_check_period_us),
            usb_status_ticker: Ticker::new(config.usb_status_period_us),
            stat_ticker: Ticker::new(config.stat_period_us),
            display_ticker: Ticker::new(config.display_period_us),
            rx_window: MovingAverage::new(),
            error_window: MovingAverage::new(),
            rx_this_window: 0,
            errors_this_window: 0,
            status: CanAdapterStatus::default(),
            config,
        }
    }

    /// One main-loop iteration.
    pub fn poll(&mut self) {
        self.wdt.feed();
        self.time.update();
        let now = self.time.now_us();

        // USB link state drives the idle color.
        if self.serial.connected() {
            self.usb_led.set_idle(Color::Green);
        } else if self.serial.configured() {
            self.usb_led.set_idle(Color::Yellow);
        } else {
            self.serial.connect(false);
            self.usb_led.set_idle(Color::Red);
        }
        if self.usb_status_ticker.check_expired(now) {
            // Liveness blink when nothing else is pulsing.
            self.usb_led.pulse(Color::Off, now);
        }

        if self.can_check_ticker.check_expired(now) && self.can.clear_self_reset() {
            warn!("CAN controller self-reset");
            self.can_led.pulse(Color::Blue, now);
        }

        while let Some(event) = self.rx.next() {
            match event {
                CanEvent::Error { .. } => {
                    self.errors_this_window += 1;
                    self.can_led.pulse(Color::Red, now);
                }
                CanEvent::Message { frame, .. } => {
                    self.rx_this_window += 1;
                    self.can_led.pulse(Color::Green, now);
                    match self.config.host_protocol {
                        HostProtocol::Slcan => {
                            self.slcan.put_message(frame);
                        }
                        HostProtocol::TachyonTelemetry => {
                            if self.serial.connected() {
                                let mut buffer = [0u8; frame::MAX_ENCODED_LEN];
                                if let Some(len) = frame::encode(&frame, &mut buffer) {
                                    let color = if self.serial.write_block_nb(&buffer[..len]) {
                                        Color::Yellow
                                    } else {
                                        Color::Red
                                    };
                                    self.usb_led.pulse(color, now);
                                    self.usb_status_ticker.reset(now);
                                }
                            }
                        }
                    }
                }
            }
        }

        if self.config.host_protocol == HostProtocol::Slcan {
            if self.serial.connected() {
                let mut handler = BusHandler(&mut self.can);
                self.slcan.update(&mut self.serial, &mut handler);
            } else {
                self.slcan.reset();
            }
        }

        if self.stat_ticker.check_expired(now) {
            self.rx_window.update(self.rx_this_window);
            self.error_window.update(self.errors_this_window);
            self.rx_this_window = 0;
            self.errors_this_window = 0;
            self.status = CanAdapterStatus {
                rx_count: self.rx_window.read_sum() as u32,
                error_count: self.error_window.read_sum() as u32,
                overruns: self.rx.overruns(),
                connected: self.serial.connected(),
            };
        }

        self.usb_led.update(now);
        self.can_led.update(now);

        if self.display_ticker.check_expired(now) {
            self.display.refresh(&self.status);
        }
    }

    /// Run the main loop forever.
    pub fn run(&mut self) -> ! {
        loop {
            self.poll();
        }
    }
}

/// SLCAN's view of the CAN controller.
struct BusHandler<'a, CAN>(&'a mut CAN);

impl<CAN> SlcanHandler for BusHandler<'_, CAN>
where
    CAN: embedded_can::nb::Can<Frame = crate::can::CanMessage> + CanConfigure,
{
    fn transmit(&mut self, msg: &crate::can::CanMessage) -> bool {
        self.0.transmit(msg).is_ok()
    }

    fn set_bitrate(&mut self, bitrate: HertzU32) -> bool {
        self.0.set_bitrate(bitrate)
    }

    fn set_bit_timing_raw(&mut self, btr0: u8, btr1: u8) -> bool {
        self.0.set_bit_timing_raw(btr0, btr1)
    }

    fn set_mode(&mut self, mode: CanMode) -> bool {
        self.0.set_mode(mode)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::can::{CanErrorKind, CanMessage};
    use crate::ring::RxRing;
    use core::cell::Cell;
    use core::convert::Infallible;
    use embedded_can::{Frame, Id, StandardId};
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::vec::Vec;

    struct FakeCounter(Rc<Cell<u32>>);

    impl MicrosCounter for FakeCounter {
        fn now(&self) -> u32 {
            self.0.get()
        }
    }

    #[derive(Default)]
    struct FakeWdt {
        feeds: u32,
    }

    impl Watchdog for FakeWdt {
        fn feed(&mut self) {
            self.feeds += 1;
        }
        fn caused_reset(&self) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct FakeCan {
        transmitted: Vec<CanMessage>,
        self_reset: bool,
    }

    impl embedded_can::nb::Can for FakeCan {
        type Frame = CanMessage;
        type Error = FakeCanError;

        fn transmit(&mut self, frame: &CanMessage) -> nb::Result<Option<CanMessage>, FakeCanError> {
            self.transmitted.push(*frame);
            Ok(None)
        }

        fn receive(&mut self) -> nb::Result<CanMessage, FakeCanError> {
            Err(nb::Error::WouldBlock)
        }
    }

    #[derive(Debug)]
    struct FakeCanError;

    impl embedded_can::Error for FakeCanError {
        fn kind(&self) -> embedded_can::ErrorKind {
            embedded_can::ErrorKind::Other
        }
    }

    impl CanConfigure for FakeCan {
        fn set_bitrate(&mut self, _bitrate: HertzU32) -> bool {
            true
        }
        fn set_bit_timing_raw(&mut self, _btr0: u8, _btr1: u8) -> bool {
            true
        }
        fn set_mode(&mut self, _mode: CanMode) -> bool {
            true
        }
        fn clear_self_reset(&mut self) -> bool {
            core::mem::take(&mut self.self_reset)
        }
    }

    #[derive(Default)]
    struct FakeSerial {
        connected: bool,
        input: VecDeque<u8>,
        written: Vec<u8>,
    }

    impl UsbSerial for FakeSerial {
        fn connected(&mut self) -> bool {
            self.connected
        }
        fn configured(&mut self) -> bool {
            self.connected
        }
        fn readable(&mut self) -> bool {
            !self.input.is_empty()
        }
        fn read_byte(&mut self) -> Option<u8> {
            self.input.pop_front()
        }
        fn write_block_nb(&mut self, bytes: &[u8]) -> bool {
            self.written.extend_from_slice(bytes);
            true
        }
        fn connect(&mut self, _blocking: bool) {}
        fn reset(&mut self) {}
    }

    #[derive(Clone)]
    struct FakePin;

    impl OutputPin for FakePin {
        type Error = Infallible;
        fn set_high(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
        fn set_low(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    fn led() -> RgbActivity<FakePin, FakePin, FakePin> {
        RgbActivity::new(FakePin, FakePin, FakePin, false)
    }

    fn frame(id: u16, data: &[u8]) -> CanMessage {
        CanMessage::new(Id::Standard(StandardId::new(id).unwrap()), data).unwrap()
    }

    #[test]
    fn telemetry_mode_frames_every_message() {
        let mut ring = RxRing::new();
        let (mut producer, consumer) = ring.split();

        let clock = Rc::new(Cell::new(0u32));
        let mut adapter = CanAdapter::new(
            Config {
                host_protocol: HostProtocol::TachyonTelemetry,
                ..Config::default()
            },
            FakeCounter(clock.clone()),
            FakeWdt::default(),
            FakeCan::default(),
            FakeSerial {
                connected: true,
                ..FakeSerial::default()
            },
            consumer,
            led(),
            led(),
            (),
        );

        producer.push(CanEvent::Message {
            frame: frame(0x123, &[1, 2, 3]),
            timestamp_us: 0,
        });
        producer.push(CanEvent::Error {
            kind: CanErrorKind::Warning,
            timestamp_us: 1,
        });
        adapter.poll();

        // Exactly one COBS frame went out; errors produce nothing.
        let written = &adapter.serial.written;
        assert!(!written.is_empty());
        assert_eq!(written.iter().filter(|&&b| b == 0).count(), 1);
        assert_eq!(*written.last().unwrap(), 0);
        assert_eq!(adapter.wdt.feeds, 1);
    }

    #[test]
    fn slcan_mode_round_trips_commands_and_frames() {
        let mut ring = RxRing::new();
        let (mut producer, consumer) = ring.split();
        let clock = Rc::new(Cell::new(0u32));
        let mut adapter = CanAdapter::new(
            Config::default(),
            FakeCounter(clock.clone()),
            FakeWdt::default(),
            FakeCan::default(),
            FakeSerial {
                connected: true,
                ..FakeSerial::default()
            },
            consumer,
            led(),
            led(),
            (),
        );

        // Host transmits a frame; inbound traffic is formatted as ASCII.
        adapter.serial.input.extend(b"t07B2CAFE\r");
        producer.push(CanEvent::Message {
            frame: frame(0x100, &[0xAB]),
            timestamp_us: 0,
        });
        adapter.poll();
        adapter.poll();

        assert_eq!(adapter.can.transmitted.len(), 1);
        assert_eq!(adapter.can.transmitted[0].raw_id(), 0x7B);
        let written = std::str::from_utf8(&adapter.serial.written).unwrap();
        assert!(written.contains("t1001AB\r"));
        assert!(written.contains('\r'));
    }

    #[test]
    fn self_reset_check_runs_on_cadence() {
        let mut ring = RxRing::new();
        let (_, consumer) = ring.split();
        let clock = Rc::new(Cell::new(0u32));
        let mut adapter = CanAdapter::new(
            Config::default(),
            FakeCounter(clock.clone()),
            FakeWdt::default(),
            FakeCan {
                self_reset: true,
                ..FakeCan::default()
            },
            FakeSerial::default(),
            consumer,
            led(),
            led(),
            (),
        );

        adapter.poll(); // first tick fires immediately
        assert!(!adapter.can.self_reset);
    }
}
