//! Source-measure unit: panel buttons, HID host protocol, USB-PD supply
//! negotiation and the analog drive sequencer, all on one loop.

use crate::gesture::{ButtonGesture, Gesture};
use crate::hid::ProtoTransport;
use crate::led::{Color, RgbActivity};
use crate::smu::analog::{AnalogStage, DriveState};
use crate::smu::nvconfig;
use crate::smu::protocol::{
    Command, DeviceInfo, Response, SmuConfig, MAX_MESSAGE_LEN, REPORT_LEN,
};
use crate::time::{Monotonic, Ticker};
use crate::usb_pd::fusb302::Fusb302;
use crate::usb_pd::message::Capability;
use crate::usb_pd::policy::{UsbPdSink, MAX_SOURCE_CAPABILITIES};
use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::{InputPin, OutputPin};
use tachyon_core::{
    Eeprom, HidEndpoint, I2cBus, IrqGate, MicrosCounter, StatusDisplay, Watchdog,
};

/// Setpoint adjusted by the left/right buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Selection {
    /// Output voltage.
    Voltage,
    /// Source-side current limit.
    SourceCurrent,
    /// Sink-side current limit.
    SinkCurrent,
}

impl Selection {
    fn next(self) -> Self {
        match self {
            Selection::Voltage => Selection::SourceCurrent,
            Selection::SourceCurrent => Selection::SinkCurrent,
            Selection::SinkCurrent => Selection::Voltage,
        }
    }
}

/// Compile-time SMU configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// ADC read cadence (bounded to keep source impedance effects small).
    pub measure_period_us: u64,
    /// Status LED liveness cadence.
    pub led_status_period_us: u64,
    /// Display refresh cadence.
    pub display_period_us: u64,
    /// Button step size, in mV or mA.
    pub step: i32,
    /// Extra rail headroom demanded over the target voltage when choosing
    /// a PDO.
    pub pd_margin_mv: i32,
    /// Build identification returned to the host.
    pub build: &'static str,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            measure_period_us: 50_000,
            led_status_period_us: 1_000_000,
            display_period_us: 100_000,
            step: 100,
            pd_margin_mv: 1500,
            build: "tachyon-smu",
        }
    }
}

/// Display snapshot.
#[derive(Debug, Clone, Copy)]
pub struct SmuStatus {
    /// Target voltage in mV.
    pub target_voltage_mv: i32,
    /// Source current limit in mA.
    pub target_source_ma: i32,
    /// Sink current limit in mA.
    pub target_sink_ma: i32,
    /// Measured output voltage in mV.
    pub measured_mv: i32,
    /// Measured output current in mA.
    pub measured_ma: i32,
    /// Drive sequencer fully enabled.
    pub enabled: bool,
    /// Setpoint under adjustment.
    pub selected: Selection,
    /// Advertised source capabilities.
    pub capabilities: [Capability; MAX_SOURCE_CAPABILITIES],
    /// Number of valid entries in `capabilities`.
    pub capability_count: usize,
    /// Accepted capability position, 0 for the vSafe5V default.
    pub current_capability: u8,
    /// HID endpoint enumerated.
    pub hid_configured: bool,
}

/// The source-measure unit device.
pub struct Smu<MC, W, SPI, P, DL, B, I, H, E, BTN, D> {
    config: Config,
    time: Monotonic<MC>,
    wdt: W,
    analog: AnalogStage<SPI, P, DL>,
    pd: UsbPdSink<B, I>,
    hid: H,
    transport: ProtoTransport<REPORT_LEN, MAX_MESSAGE_LEN>,
    eeprom: E,
    nv: SmuConfig,
    button_down: ButtonGesture<BTN>,
    button_up: ButtonGesture<BTN>,
    button_select: ButtonGesture<BTN>,
    led: RgbActivity<P, P, P>,
    display: D,

    measure_ticker: Ticker,
    led_ticker: Ticker,
    display_ticker: Ticker,

    selected: Selection,
    measured_mv: i32,
    measured_ma: i32,
    measured_v_raw: u16,
    measured_i_raw: u16,
    analog_errors: u32,
}

impl<MC, W, SPI, P, DL, B, I, H, E, BTN, D> Smu<MC, W, SPI, P, DL, B, I, H, E, BTN, D>
where
    MC: MicrosCounter,
    W: Watchdog,
    SPI: Transfer<u8> + Write<u8, Error = <SPI as Transfer<u8>>::Error>,
    P: OutputPin,
    DL: DelayUs<u8>,
    B: I2cBus,
    I: IrqGate,
    H: HidEndpoint,
    E: Eeprom,
    BTN: InputPin,
    D: StatusDisplay<SmuStatus>,
{
    /// Assemble the SMU, loading calibration from NVRAM (nominal values
    /// remain for anything unset or undecodable).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        counter: MC,
        wdt: W,
        mut analog: AnalogStage<SPI, P, DL>,
        fusb: Fusb302<B>,
        pd_irq: I,
        hid: H,
        mut eeprom: E,
        button_down: BTN,
        button_up: BTN,
        button_select: BTN,
        led: RgbActivity<P, P, P>,
        display: D,
    ) -> Self {
        let nv = match nvconfig::load(&mut eeprom) {
            Some(nv) => {
                info!("NVRAM config loaded, serial '{}'", nv.serial());
                nv
            }
            None => {
                warn!("NVRAM config unreadable, using nominal calibration");
                SmuConfig::default()
            }
        };
        apply_calibrations(&mut analog, &nv);
        Self {
            config,
            time: Monotonic::new(counter),
            wdt,
            analog,
            pd: UsbPdSink::new(fusb, pd_irq),
            hid,
            transport: ProtoTransport::new(),
            eeprom,
            nv,
            button_down: ButtonGesture::new(button_down),
            button_up: ButtonGesture::new(button_up),
            button_select: ButtonGesture::new(button_select),
            led,
            display,
            measure_ticker: Ticker::new(config.measure_period_us),
            led_ticker: Ticker::new(config.led_status_period_us),
            display_ticker: Ticker::new(config.display_period_us),
            selected: Selection::Voltage,
            measured_mv: 0,
            measured_ma: 0,
            measured_v_raw: 0,
            measured_i_raw: 0,
            analog_errors: 0,
        }
    }

    /// One main-loop iteration.
    pub fn poll(&mut self) {
        self.wdt.feed();
        self.time.update();
        let now = self.time.now_us();

        if self.measure_ticker.check_expired(now) {
            match self.analog.read_voltage_mv() {
                Ok((mv, raw)) => {
                    self.measured_mv = mv;
                    self.measured_v_raw = raw;
                }
                Err(_) => self.analog_errors += 1,
            }
            match self.analog.read_current_ma() {
                Ok((ma, raw)) => {
                    self.measured_ma = ma;
                    self.measured_i_raw = raw;
                }
                Err(_) => self.analog_errors += 1,
            }
        }

        let mut voltage_changed = false;

        match self.button_down.update(now) {
            Gesture::ClickPress | Gesture::HoldRepeat => {
                voltage_changed |= self.adjust(-self.config.step);
            }
            _ => {}
        }
        match self.button_up.update(now) {
            Gesture::ClickPress | Gesture::HoldRepeat => {
                voltage_changed |= self.adjust(self.config.step);
            }
            _ => {}
        }
        match self.button_select.update(now) {
            Gesture::ClickRelease => self.selected = self.selected.next(),
            Gesture::HoldTransition => {
                if self.analog.state() == DriveState::Disabled {
                    if self.analog.enable_driver(now).is_err() {
                        self.analog_errors += 1;
                    }
                } else {
                    self.analog.disable_driver();
                }
            }
            _ => {}
        }

        if self.hid.configured() {
            let command = self
                .transport
                .poll_receive(&mut self.hid)
                .and_then(Command::decode_delimited);
            if let Some(command) = command {
                voltage_changed |= matches!(
                    command,
                    Command::SetControl(_) | Command::SetControlRaw(_)
                );
                let response = self.execute(now, command);
                let mut buf = [0u8; MAX_MESSAGE_LEN];
                if let Ok(len) = response.encode_delimited(&mut buf) {
                    if !self.transport.send(&mut self.hid, &buf[..len]) {
                        warn!("HID response send failed");
                    }
                }
            }
        } else {
            self.hid.connect(false);
        }

        if voltage_changed {
            self.renegotiate_supply(now);
        }

        self.pd.update(now);
        if self.analog.update(now).is_err() {
            self.analog_errors += 1;
        }

        self.drive_led(now);

        if self.display_ticker.check_expired(now) {
            let status = self.status();
            self.display.refresh(&status);
        }
    }

    /// Run the main loop forever.
    pub fn run(&mut self) -> ! {
        loop {
            self.poll();
        }
    }

    /// Chip transaction failures on the analog stage so far.
    pub fn analog_errors(&self) -> u32 {
        self.analog_errors
    }

    /// Snapshot for displays and tests.
    pub fn status(&mut self) -> SmuStatus {
        let mut capabilities = [Capability::unpack(0); MAX_SOURCE_CAPABILITIES];
        let capability_count = self.pd.capabilities(&mut capabilities);
        let (target_voltage_mv, target_source_ma, target_sink_ma) = self.analog.targets();
        SmuStatus {
            target_voltage_mv,
            target_source_ma,
            target_sink_ma,
            measured_mv: self.measured_mv,
            measured_ma: self.measured_ma,
            enabled: self.analog.state() == DriveState::Enabled,
            selected: self.selected,
            capabilities,
            capability_count,
            current_capability: self.pd.current_capability(),
            hid_configured: self.hid.configured(),
        }
    }

    fn adjust(&mut self, delta: i32) -> bool {
        let (voltage, source, sink) = self.analog.targets();
        let result = match self.selected {
            Selection::Voltage => self.analog.set_voltage_mv(voltage + delta),
            Selection::SourceCurrent => self.analog.set_current_source_ma(source + delta),
            Selection::SinkCurrent => self.analog.set_current_sink_ma(sink + delta),
        };
        if result.is_err() {
            self.analog_errors += 1;
        }
        self.selected == Selection::Voltage
    }

    fn execute(&mut self, now: u64, command: Command) -> Response {
        match command {
            Command::GetDeviceInfo => Response::DeviceInfo(DeviceInfo::new(self.config.build)),
            Command::ReadMeasurements => Response::Measurements {
                voltage: self.measured_mv,
                current: self.measured_ma,
            },
            Command::ReadMeasurementsRaw => Response::MeasurementsRaw {
                voltage: self.measured_v_raw,
                current: self.measured_i_raw,
            },
            Command::SetControl(control) => {
                let ok = self.analog.set_voltage_mv(control.voltage).is_ok()
                    && self.analog.set_current_source_ma(control.current_source).is_ok()
                    && self.analog.set_current_sink_ma(control.current_sink).is_ok();
                if !ok {
                    self.analog_errors += 1;
                }
                self.apply_enable(now, control.enable);
                Response::Acknowledge
            }
            Command::SetControlRaw(control) => {
                let ok = self.analog.set_voltage_raw(control.voltage).is_ok()
                    && self
                        .analog
                        .set_current_source_raw(control.current_source)
                        .is_ok()
                    && self.analog.set_current_sink_raw(control.current_sink).is_ok();
                if !ok {
                    self.analog_errors += 1;
                }
                self.apply_enable(now, control.enable);
                Response::Acknowledge
            }
            Command::ReadNvram => Response::Nvram(self.nv),
            Command::UpdateNvram(patch) => {
                self.nv.update_from(&patch);
                self.persist_nv();
                Response::Acknowledge
            }
            Command::SetNvram(config) => {
                self.nv = config;
                self.persist_nv();
                Response::Acknowledge
            }
        }
    }

    fn apply_enable(&mut self, now: u64, enable: bool) {
        if enable && self.analog.state() == DriveState::Disabled {
            if self.analog.enable_driver(now).is_err() {
                self.analog_errors += 1;
            }
        } else if !enable && self.analog.state() != DriveState::Disabled {
            self.analog.disable_driver();
        }
    }

    fn persist_nv(&mut self) {
        if !nvconfig::store(&mut self.eeprom, &self.nv) {
            warn!("NVRAM write failed");
        }
        apply_calibrations(&mut self.analog, &self.nv);
    }

    /// Walk the PDO list one step toward the cheapest rail that still
    /// covers the target voltage plus margin.
    fn renegotiate_supply(&mut self, now: u64) {
        let mut capabilities = [Capability::unpack(0); MAX_SOURCE_CAPABILITIES];
        let count = self.pd.capabilities(&mut capabilities);
        let current = self.pd.current_capability();
        let (target_voltage_mv, _, _) = self.analog.targets();
        if let Some((position, current_ma)) = pick_supply_step(
            &capabilities[..count],
            current,
            target_voltage_mv + self.config.pd_margin_mv,
        ) {
            let _ = self.pd.request_capability(now, position, current_ma);
        }
    }

    fn drive_led(&mut self, now: u64) {
        let (target_voltage_mv, target_source_ma, target_sink_ma) = self.analog.targets();
        if self.analog.state() == DriveState::Enabled {
            if self.measured_mv < target_voltage_mv * 90 / 100 {
                // Not reaching the voltage setpoint: constant-current or
                // hard limiting.
                let limiting = self.measured_ma >= target_source_ma * 90 / 100
                    || self.measured_ma <= target_sink_ma * 90 / 100;
                self.led
                    .set_idle(if limiting { Color::Red } else { Color::Purple });
            } else {
                self.led.set_idle(Color::Green);
            }
            if self.led_ticker.check_expired(now) {
                self.led.pulse(Color::Off, now);
            }
        } else {
            self.led.set_idle(Color::Off);
            if self.led_ticker.check_expired(now) {
                self.led.pulse(Color::Blue, now);
            }
        }
        self.led.update(now);
    }
}

/// One step of the supply walk: step down to the next-lower PDO when it
/// still covers `required_mv`, step up when the present rail does not.
/// `current` is the 1-indexed accepted position, 0 for the default.
fn pick_supply_step(
    capabilities: &[Capability],
    current: u8,
    required_mv: i32,
) -> Option<(u8, u16)> {
    let current = usize::from(current);
    if current > 1 {
        let below = &capabilities[current - 2];
        if i32::from(below.voltage_mv) >= required_mv {
            return Some(((current - 1) as u8, below.max_current_ma));
        }
    }
    if current < capabilities.len() {
        let covered = current > 0
            && i32::from(capabilities[current - 1].voltage_mv) >= required_mv;
        if !covered {
            let above = &capabilities[current];
            return Some(((current + 1) as u8, above.max_current_ma));
        }
    }
    None
}

fn apply_calibrations<SPI, P, DL>(analog: &mut AnalogStage<SPI, P, DL>, nv: &SmuConfig)
where
    SPI: Transfer<u8> + Write<u8, Error = <SPI as Transfer<u8>>::Error>,
    P: OutputPin,
    DL: DelayUs<u8>,
{
    if let Some(cal) = nv.voltage_adc {
        analog.set_voltage_adc_calibration(cal);
    }
    if let Some(cal) = nv.current_adc {
        analog.set_current_adc_calibration(cal);
    }
    if let Some(cal) = nv.voltage_dac {
        analog.set_voltage_dac_calibration(cal);
    }
    // The source and sink DACs share one calibration model.
    if let Some(cal) = nv.current_source_dac.or(nv.current_sink_dac) {
        analog.set_current_dac_calibration(cal);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::smu::mcp3201::Mcp3201;
    use crate::smu::mcp4921::Mcp4921;
    use crate::smu::protocol::SetControl;
    use core::cell::{Cell, RefCell};
    use core::convert::Infallible;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::vec::Vec;

    struct FakeCounter(Rc<Cell<u32>>);

    impl MicrosCounter for FakeCounter {
        fn now(&self) -> u32 {
            self.0.get()
        }
    }

    struct FakeWdt;

    impl Watchdog for FakeWdt {
        fn feed(&mut self) {}
        fn caused_reset(&self) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct SpiState {
        adc_value: u16,
    }

    #[derive(Clone)]
    struct FakeSpi(Rc<RefCell<SpiState>>);

    impl Transfer<u8> for FakeSpi {
        type Error = Infallible;
        fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Infallible> {
            let shifted = self.0.borrow().adc_value << 1;
            words[0] = (shifted >> 8) as u8 & 0x1F;
            words[1] = shifted as u8;
            Ok(words)
        }
    }

    impl Write<u8> for FakeSpi {
        type Error = Infallible;
        fn write(&mut self, _words: &[u8]) -> Result<(), Infallible> {
            Ok(())
        }
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

    struct NullDelay;

    impl DelayUs<u8> for NullDelay {
        fn delay_us(&mut self, _us: u8) {}
    }

    /// I²C slave that ACKs everything and reads zero.
    struct AckBus;

    impl I2cBus for AckBus {
        fn start(&mut self) {}
        fn stop(&mut self) {}
        fn write_byte(&mut self, _byte: u8) -> bool {
            true
        }
        fn read_byte(&mut self, _ack: bool) -> u8 {
            0
        }
    }

    struct NullIrq;

    impl IrqGate for NullIrq {
        fn disable(&mut self) {}
        fn enable(&mut self) {}
        fn is_asserted(&self) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct FakeHid {
        configured: bool,
        inbound: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }

    impl HidEndpoint for FakeHid {
        fn configured(&mut self) -> bool {
            self.configured
        }
        fn connect(&mut self, _blocking: bool) {}
        fn send_report(&mut self, report: &[u8]) -> bool {
            self.sent.push(report.to_vec());
            true
        }
        fn read_report(&mut self, buf: &mut [u8]) -> Option<usize> {
            let report = self.inbound.pop_front()?;
            buf[..report.len()].copy_from_slice(&report);
            Some(report.len())
        }
    }

    #[derive(Default)]
    struct FakeEeprom {
        bytes: Vec<u8>,
    }

    impl Eeprom for FakeEeprom {
        fn read(&mut self, addr: u32, buf: &mut [u8]) {
            let addr = addr as usize;
            for (index, slot) in buf.iter_mut().enumerate() {
                *slot = self.bytes.get(addr + index).copied().unwrap_or(0xFF);
            }
        }
        fn write(&mut self, addr: u32, data: &[u8]) -> bool {
            let addr = addr as usize;
            if self.bytes.len() < addr + data.len() {
                self.bytes.resize(addr + data.len(), 0xFF);
            }
            self.bytes[addr..addr + data.len()].copy_from_slice(data);
            true
        }
    }

    #[derive(Clone)]
    struct FakeButton(Rc<Cell<bool>>);

    impl InputPin for FakeButton {
        type Error = Infallible;
        fn is_high(&self) -> Result<bool, Infallible> {
            Ok(!self.0.get())
        }
        fn is_low(&self) -> Result<bool, Infallible> {
            Ok(self.0.get())
        }
    }

    type TestSmu = Smu<
        FakeCounter,
        FakeWdt,
        FakeSpi,
        FakePin,
        NullDelay,
        AckBus,
        NullIrq,
        FakeHid,
        FakeEeprom,
        FakeButton,
        (),
    >;

    struct Rig {
        clock: Rc<Cell<u32>>,
        spi: Rc<RefCell<SpiState>>,
        down: Rc<Cell<bool>>,
        up: Rc<Cell<bool>>,
        select: Rc<Cell<bool>>,
        smu: TestSmu,
    }

    fn rig() -> Rig {
        let clock = Rc::new(Cell::new(0u32));
        let spi = Rc::new(RefCell::new(SpiState { adc_value: 2042 }));
        let down = Rc::new(Cell::new(false));
        let up = Rc::new(Cell::new(false));
        let select = Rc::new(Cell::new(false));
        let analog = AnalogStage::new(
            FakeSpi(spi.clone()),
            NullDelay,
            Mcp4921::new(FakePin),
            Mcp4921::new(FakePin),
            Mcp4921::new(FakePin),
            FakePin,
            Mcp3201::new(FakePin),
            Mcp3201::new(FakePin),
            FakePin,
            FakePin,
        );
        let smu = Smu::new(
            Config::default(),
            FakeCounter(clock.clone()),
            FakeWdt,
            analog,
            Fusb302::new(AckBus),
            NullIrq,
            FakeHid {
                configured: true,
                ..FakeHid::default()
            },
            FakeEeprom::default(),
            FakeButton(down.clone()),
            FakeButton(up.clone()),
            FakeButton(select.clone()),
            RgbActivity::new(FakePin, FakePin, FakePin, false),
            (),
        );
        Rig {
            clock,
            spi,
            down,
            up,
            select,
            smu,
        }
    }

    fn step(rig: &mut Rig, ms: u32) {
        rig.clock.set(rig.clock.get() + ms * 1000);
        rig.smu.poll();
    }

    fn send_command(rig: &mut Rig, command: Command) {
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let len = command.encode_delimited(&mut buf).unwrap();
        let mut report = std::vec![0u8; REPORT_LEN];
        report[..len].copy_from_slice(&buf[..len]);
        rig.smu.hid.inbound.push_back(report);
    }

    fn last_response(rig: &mut Rig) -> Response {
        // Responses fit a single report in these tests.
        let report = rig.smu.hid.sent.last().expect("a response was sent");
        Response::decode_delimited(report).expect("decodable response")
    }

    #[test]
    fn buttons_step_the_selected_target() {
        let mut rig = rig();
        step(&mut rig, 1);
        let (v0, _, _) = rig.smu.analog.targets();

        // One click on "up": +100 mV. The debounce dwell needs one poll to
        // arm and one to commit.
        rig.up.set(true);
        step(&mut rig, 60);
        step(&mut rig, 60); // ClickPress
        rig.up.set(false);
        step(&mut rig, 60);
        step(&mut rig, 60); // ClickRelease
        let (v1, _, _) = rig.smu.analog.targets();
        assert_eq!(v1, v0 + 100);

        // Select cycles to source current; "down" steps it.
        rig.select.set(true);
        step(&mut rig, 60);
        step(&mut rig, 60);
        rig.select.set(false);
        step(&mut rig, 60);
        step(&mut rig, 60); // ClickRelease
        assert_eq!(rig.smu.status().selected, Selection::SourceCurrent);
        let (_, i0, _) = rig.smu.analog.targets();
        rig.down.set(true);
        step(&mut rig, 60);
        step(&mut rig, 60); // ClickPress
        let (_, i1, _) = rig.smu.analog.targets();
        assert_eq!(i1, i0 - 100);
    }

    #[test]
    fn hold_repeats_keep_stepping() {
        let mut rig = rig();
        step(&mut rig, 1);
        let (v0, _, _) = rig.smu.analog.targets();
        rig.up.set(true);
        step(&mut rig, 60); // arm the debounce
        step(&mut rig, 60); // ClickPress
        for _ in 0..10 {
            step(&mut rig, 100); // crosses hold boundary, then repeats
        }
        let (v1, _, _) = rig.smu.analog.targets();
        assert!(v1 > v0 + 300, "hold-repeat should keep stepping");
    }

    #[test]
    fn set_control_command_drives_the_stage() {
        let mut rig = rig();
        send_command(
            &mut rig,
            Command::SetControl(SetControl {
                voltage: 5000,
                current_source: 250,
                current_sink: -250,
                enable: true,
            }),
        );
        step(&mut rig, 1);
        assert_eq!(last_response(&mut rig), Response::Acknowledge);
        assert_eq!(rig.smu.analog.targets(), (5000, 250, -250));
        assert_ne!(rig.smu.analog.state(), DriveState::Disabled);

        // Walk the sequencer to Enabled.
        step(&mut rig, 11);
        step(&mut rig, 11);
        assert_eq!(rig.smu.analog.state(), DriveState::Enabled);

        send_command(
            &mut rig,
            Command::SetControl(SetControl {
                voltage: 5000,
                current_source: 250,
                current_sink: -250,
                enable: false,
            }),
        );
        step(&mut rig, 1);
        assert_eq!(rig.smu.analog.state(), DriveState::Disabled);
    }

    #[test]
    fn measurements_round_trip_over_hid() {
        let mut rig = rig();
        rig.spi.borrow_mut().adc_value = 4095;
        step(&mut rig, 60); // measure ticker fires
        send_command(&mut rig, Command::ReadMeasurements);
        step(&mut rig, 1);
        match last_response(&mut rig) {
            Response::Measurements { voltage, current } => {
                assert_eq!(voltage, 33_303);
                assert!(current > 0);
            }
            other => panic!("unexpected response {:?}", other),
        }

        send_command(&mut rig, Command::ReadMeasurementsRaw);
        step(&mut rig, 1);
        assert_eq!(
            last_response(&mut rig),
            Response::MeasurementsRaw {
                voltage: 4095,
                current: 4095
            }
        );
    }

    #[test]
    fn nvram_commands_persist_and_apply() {
        let mut rig = rig();
        let mut config = SmuConfig::default();
        config.set_serial("SMU-0042");
        config.voltage_adc = Some(crate::smu::calibration::LinearCalibration::new(
            61_645, 2_042,
        ));
        send_command(&mut rig, Command::SetNvram(config));
        step(&mut rig, 1);
        assert_eq!(last_response(&mut rig), Response::Acknowledge);

        send_command(&mut rig, Command::ReadNvram);
        step(&mut rig, 1);
        match last_response(&mut rig) {
            Response::Nvram(read_back) => assert_eq!(read_back, config),
            other => panic!("unexpected response {:?}", other),
        }
        assert!(!rig.smu.eeprom.bytes.is_empty());
    }

    #[test]
    fn device_info_reports_converter_widths() {
        let mut rig = rig();
        send_command(&mut rig, Command::GetDeviceInfo);
        step(&mut rig, 1);
        match last_response(&mut rig) {
            Response::DeviceInfo(info) => {
                assert_eq!(info.build(), "tachyon-smu");
                assert_eq!(info.voltage_adc_bits, 12);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn supply_walk_picks_the_cheapest_covering_pdo() {
        fn cap(mv: u16, ma: u16) -> Capability {
            let mut pdo = crate::usb_pd::message::FixedSupplyPdo(0);
            pdo.set_voltage_50mv(mv / 50);
            pdo.set_max_current_10ma(ma / 10);
            Capability::unpack(pdo.0)
        }
        let caps = [cap(5000, 3000), cap(9000, 2000), cap(12000, 2000)];

        // Default rail, target 5 V + margin: step up to object 1... which
        // cannot cover it either, so the walk continues next poll.
        assert_eq!(pick_supply_step(&caps, 0, 6500), Some((1, 3000)));
        // On 5 V, needing 6.5 V: step up to 9 V.
        assert_eq!(pick_supply_step(&caps, 1, 6500), Some((2, 2000)));
        // On 9 V, needing 6.5 V: covered, and 5 V below would not cover.
        assert_eq!(pick_supply_step(&caps, 2, 6500), None);
        // On 12 V, needing 6.5 V: 9 V covers, step down.
        assert_eq!(pick_supply_step(&caps, 3, 6500), Some((2, 2000)));
        // On 9 V, needing 4 V: 5 V covers, step down.
        assert_eq!(pick_supply_step(&caps, 2, 4000), Some((1, 3000)));
        // Top of the list and still short: nothing to do.
        assert_eq!(pick_supply_step(&caps, 3, 20_000), None);
    }
}
