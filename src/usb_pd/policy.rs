//! USB-PD sink policy state machine.
//!
//! Runs cooperatively: [`UsbPdSink::update`] is called from the main loop,
//! [`UsbPdSink::process_interrupt`] from the FUSB302 interrupt handler.
//! `update` brackets itself with the interrupt gate, so every field is
//! written from exactly one context at a time; it also polls the interrupt
//! line directly, since the edge interrupt alone has proven unreliable on
//! this chip.
//!
//! Connection bring-up walks Start → DetectCc → EnableTransceiver →
//! WaitSourceCaps → Connected. The comparator watching VBUS is the
//! disconnect detector: continuously low for
//! [`COMP_LOW_RESET_TIME_MS`](crate::usb_pd::COMP_LOW_RESET_TIME_MS) resets
//! the machine to Start. Timeouts re-enter earlier states rather than
//! failing upward.

use crate::time::Stopwatch;
use crate::usb_pd::fusb302::{
    interrupt, status0, status1, Fusb302, Register, TransferError, MAX_RX_BYTES,
};
use crate::usb_pd::message::{
    request_object, sink_header, Capability, ControlMessageType, DataMessageType, MessageHeader,
};
use crate::usb_pd::{
    COMP_LOW_RESET_TIME_MS, COMP_VBUS_THRESHOLD_MV, MEASURE_TIME_MS, REQUEST_RETRY_LIMIT,
    SENDER_RESPONSE_TIME_MS, T_TYPEC_SEND_SOURCE_CAP_MS,
};
use tachyon_core::{I2cBus, IrqGate};

/// Most PDOs a source may advertise.
pub const MAX_SOURCE_CAPABILITIES: usize = 8;

/// Policy machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Chip not yet initialized.
    Start,
    /// Alternating BC_LVL measurements on CC1/CC2.
    DetectCc,
    /// Programming the transceiver for the chosen CC pin.
    EnableTransceiver,
    /// Waiting for the source's first capability advertisement.
    WaitSourceCaps,
    /// Negotiation traffic only; ready to accept commands.
    Connected,
}

/// USB-PD sink over a FUSB302.
pub struct UsbPdSink<B, I> {
    fusb: Fusb302<B>,
    irq: I,
    state: State,
    device_id: Option<u8>,
    /// CC pin currently being measured during detection; 0 when invalid.
    measuring_cc: u8,
    /// BC_LVL of the other pin from the previous measurement round.
    saved_cc_level: Option<u8>,
    /// CC pin used for communication, valid from EnableTransceiver on.
    cc_pin: u8,
    next_message_id: u8,
    source_caps: [u32; MAX_SOURCE_CAPABILITIES],
    source_caps_len: u8,
    /// Outstanding requested object position; 0 when none was requested.
    requested_cap: u8,
    requested_current_ma: u16,
    /// Accepted object position; 0 is the implicit vSafe5V default.
    current_cap: u8,
    power_stable: bool,
    request_retries: u8,
    state_timer: Stopwatch,
    comp_low_timer: Stopwatch,
    request_timer: Stopwatch,
    error_count: u16,
}

impl<B: I2cBus, I: IrqGate> UsbPdSink<B, I> {
    /// Sink over the given chip and its interrupt line.
    pub fn new(fusb: Fusb302<B>, irq: I) -> Self {
        Self {
            fusb,
            irq,
            state: State::Start,
            device_id: None,
            measuring_cc: 0,
            saved_cc_level: None,
            cc_pin: 0,
            next_message_id: 0,
            source_caps: [0; MAX_SOURCE_CAPABILITIES],
            source_caps_len: 0,
            requested_cap: 0,
            requested_current_ma: 0,
            current_cap: 0,
            power_stable: false,
            request_retries: 0,
            state_timer: Stopwatch::new(),
            comp_low_timer: Stopwatch::new(),
            request_timer: Stopwatch::new(),
            error_count: 0,
        }
    }

    /// Current machine state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Device ID read during initialization, if it succeeded.
    pub fn device_id(&self) -> Option<u8> {
        self.device_id
    }

    /// Accepted object position: 0 default, 1-indexed otherwise.
    pub fn current_capability(&self) -> u8 {
        self.current_cap
    }

    /// `true` once the source has signaled PS_RDY for the accepted level.
    pub fn power_stable(&self) -> bool {
        self.power_stable
    }

    /// Chip transaction failures seen so far.
    pub fn error_count(&self) -> u16 {
        self.error_count
    }

    /// Snapshot the advertised capabilities into `out`, returning the
    /// count. Bracketed against the interrupt writer.
    pub fn capabilities(&mut self, out: &mut [Capability]) -> usize {
        self.irq.disable();
        let len = usize::from(self.source_caps_len).min(out.len());
        for (slot, &raw) in out.iter_mut().zip(self.source_caps.iter()).take(len) {
            *slot = Capability::unpack(raw);
        }
        self.irq.enable();
        len
    }

    /// Request the capability at 1-indexed `position` with the given
    /// operating current.
    pub fn request_capability(
        &mut self,
        now_us: u64,
        position: u8,
        current_ma: u16,
    ) -> Result<(), TransferError> {
        self.irq.disable();
        self.request_retries = 0;
        let result = self.send_request(now_us, position, current_ma);
        self.irq.enable();
        result
    }

    /// Main-loop poll: disconnect detection, state bring-up, request
    /// timeout handling, and interrupt-line polling.
    pub fn update(&mut self, now_us: u64) {
        self.irq.disable();

        if matches!(self.state, State::WaitSourceCaps | State::Connected) {
            match self.read_comp() {
                Ok(true) => self.comp_low_timer.reset(),
                Ok(false) => self.comp_low_timer.start(now_us),
                Err(_) => self.error_count += 1,
            }
            if self.comp_low_timer.elapsed_ms(now_us) >= COMP_LOW_RESET_TIME_MS {
                warn!("VBUS comparator low, resetting sink");
                self.reset_fsm();
            }
        }

        match self.state {
            State::Start => {
                if self.init().is_ok() {
                    debug!("pd: Start -> DetectCc");
                    self.measuring_cc = 0;
                    self.saved_cc_level = None;
                    self.state_timer.restart(now_us);
                    self.state = State::DetectCc;
                } else {
                    self.error_count += 1;
                }
            }
            State::DetectCc => self.detect_cc(now_us),
            State::EnableTransceiver => {
                if self.enable_transceiver().is_ok() {
                    debug!("pd: EnableTransceiver -> WaitSourceCaps");
                    self.state_timer.restart(now_us);
                    self.state = State::WaitSourceCaps;
                } else {
                    self.error_count += 1;
                }
            }
            State::WaitSourceCaps => {
                if self.source_caps_len > 0 {
                    debug!("pd: WaitSourceCaps -> Connected");
                    self.state = State::Connected;
                } else if self.state_timer.elapsed_ms(now_us) > T_TYPEC_SEND_SOURCE_CAP_MS {
                    debug!("pd: WaitSourceCaps -> EnableTransceiver (timeout)");
                    self.state = State::EnableTransceiver;
                }
            }
            State::Connected => self.check_request_timeout(now_us),
        }

        // The edge interrupt does not always fire; poll the line as well.
        if self.irq.is_asserted() {
            self.process_interrupt(now_us);
        }

        self.irq.enable();
    }

    /// Interrupt-context entry point: classify and serve chip interrupts.
    pub fn process_interrupt(&mut self, now_us: u64) {
        let flags = match self.fusb.read_register(Register::Interrupt) {
            Ok(flags) => flags,
            Err(_) => {
                self.error_count += 1;
                return;
            }
        };
        if flags & interrupt::I_CRC_CHK != 0 {
            if self.process_rx_messages(now_us).is_err() {
                self.error_count += 1;
            }
        }
        if flags & interrupt::I_COMP_CHNG != 0 {
            match self.read_comp() {
                Ok(true) => self.comp_low_timer.reset(),
                Ok(false) => self.comp_low_timer.start(now_us),
                Err(_) => self.error_count += 1,
            }
        }
    }

    fn detect_cc(&mut self, now_us: u64) {
        if (self.measuring_cc == 1 || self.measuring_cc == 2)
            && self.state_timer.elapsed_ms(now_us) >= MEASURE_TIME_MS
        {
            let level = match self.read_measure() {
                Ok(level) => level,
                Err(_) => {
                    self.error_count += 1;
                    return;
                }
            };
            match self.saved_cc_level {
                Some(saved) if saved != level => {
                    // One pin reads a higher pull-up band; that is the one
                    // the source terminates.
                    self.cc_pin = if level > saved {
                        self.measuring_cc
                    } else {
                        3 - self.measuring_cc
                    };
                    debug!("pd: DetectCc -> EnableTransceiver (cc={})", self.cc_pin);
                    self.state = State::EnableTransceiver;
                }
                _ => {
                    // Equal or first reading: record it and swap pins.
                    let next = 3 - self.measuring_cc;
                    if self.set_measure(next).is_ok() {
                        self.saved_cc_level = Some(level);
                        self.measuring_cc = next;
                        self.state_timer.restart(now_us);
                    } else {
                        self.error_count += 1;
                    }
                }
            }
        } else if self.measuring_cc != 1 && self.measuring_cc != 2 {
            // State entry: start with CC1.
            if self.set_measure(1).is_ok() {
                self.measuring_cc = 1;
                self.state_timer.restart(now_us);
            } else {
                self.error_count += 1;
            }
        }
    }

    /// A Request the source never answered is retried, then abandoned for
    /// the vSafe5V object.
    fn check_request_timeout(&mut self, now_us: u64) {
        let outstanding = self.requested_cap != 0 && self.requested_cap != self.current_cap;
        if !outstanding
            || !self.request_timer.is_running()
            || self.request_timer.elapsed_ms(now_us) < SENDER_RESPONSE_TIME_MS
        {
            return;
        }
        if self.request_retries < REQUEST_RETRY_LIMIT {
            self.request_retries += 1;
            warn!("pd: request unanswered, retry {}", self.request_retries);
            let _ = self.send_request(now_us, self.requested_cap, self.requested_current_ma);
        } else if self.source_caps_len > 0 {
            warn!("pd: request abandoned, falling back to vSafe5V");
            self.request_retries = 0;
            let cap = Capability::unpack(self.source_caps[0]);
            let _ = self.send_request(now_us, 1, cap.max_current_ma);
        } else {
            self.request_timer.reset();
        }
    }

    fn reset_fsm(&mut self) {
        self.state = State::Start;
        self.device_id = None;
        self.measuring_cc = 0;
        self.saved_cc_level = None;
        self.cc_pin = 0;
        self.next_message_id = 0;
        self.source_caps_len = 0;
        self.requested_cap = 0;
        self.requested_current_ma = 0;
        self.current_cap = 0;
        self.power_stable = false;
        self.request_retries = 0;
        self.state_timer.reset();
        self.comp_low_timer.reset();
        self.request_timer.reset();
    }

    /// Full chip bring-up from an unknown state.
    fn init(&mut self) -> Result<(), TransferError> {
        // Reset everything, including the PD logic.
        self.fusb.write_register(Register::Reset, 0x03)?;
        self.device_id = Some(self.fusb.read_id()?);
        // Power up all analog blocks.
        self.fusb.write_register(Register::Power, 0x0F)?;
        // Comparator watches VBUS; MDAC steps are 42 mV in that mode.
        let mdac = (COMP_VBUS_THRESHOLD_MV / 42) as u8;
        self.fusb.write_register(Register::Measure, 0x40 | mdac)?;
        Ok(())
    }

    /// Program the transceiver for the chosen CC pin and unmask the
    /// interrupts the policy machine consumes.
    fn enable_transceiver(&mut self) -> Result<(), TransferError> {
        let mut switches0 = 0x03; // pull-downs on both CC pins
        let mut switches1 = 0x24; // PD 2.0, auto-CRC
        match self.cc_pin {
            1 => {
                switches0 |= 0x04;
                switches1 |= 0x01;
            }
            2 => {
                switches0 |= 0x08;
                switches1 |= 0x02;
            }
            _ => return Err(TransferError::UnknownRxStructure),
        }
        self.fusb.write_register(Register::Switches0, switches0)?;
        self.fusb.write_register(Register::Switches1, switches1)?;
        // Automatic retries, three attempts.
        self.fusb.write_register(Register::Control3, 0x07)?;
        // Mask everything except CRC-checked and comparator-changed.
        self.fusb.write_register(
            Register::Mask1,
            !(interrupt::I_CRC_CHK | interrupt::I_COMP_CHNG),
        )?;
        self.fusb.write_register(Register::MaskA, 0xFF)?;
        self.fusb.write_register(Register::MaskB, 0x01)?;
        // Unmask the global interrupt.
        self.fusb.write_register(Register::Control0, 0x04)?;
        // Reset the PD logic now that the path is configured.
        self.fusb.write_register(Register::Reset, 0x02)?;
        Ok(())
    }

    /// Select which CC pin the measure block samples.
    fn set_measure(&mut self, cc_pin: u8) -> Result<(), TransferError> {
        let switches0 = match cc_pin {
            1 => 0x03 | 0x04,
            2 => 0x03 | 0x08,
            _ => return Err(TransferError::UnknownRxStructure),
        };
        self.fusb.write_register(Register::Switches0, switches0)
    }

    /// BC_LVL of the currently measured CC pin.
    fn read_measure(&mut self) -> Result<u8, TransferError> {
        Ok(self.fusb.read_register(Register::Status0)? & status0::BC_LVL_MASK)
    }

    /// Comparator output: `true` while VBUS is above the threshold.
    fn read_comp(&mut self) -> Result<bool, TransferError> {
        Ok(self.fusb.read_register(Register::Status0)? & status0::COMP != 0)
    }

    /// Drain every message out of the RX FIFO.
    fn process_rx_messages(&mut self, now_us: u64) -> Result<(), TransferError> {
        loop {
            let status = self.fusb.read_register(Register::Status1)?;
            if status & status1::RX_EMPTY != 0 {
                return Ok(());
            }
            let mut buffer = [0u8; MAX_RX_BYTES];
            self.fusb.read_next_rx_fifo(&mut buffer)?;

            let header = MessageHeader(u16::from_le_bytes([buffer[0], buffer[1]]));
            let num_objects = header.num_data_objects();
            if num_objects > 0 {
                if header.message_type() == DataMessageType::SourceCapabilities as u8 {
                    let first = self.source_caps_len == 0;
                    self.store_source_capabilities(&buffer, num_objects);
                    if first && self.source_caps_len > 0 {
                        // Immediately request the vSafe5V object at its
                        // advertised maximum.
                        let cap = Capability::unpack(self.source_caps[0]);
                        let _ = self.send_request(now_us, 1, cap.max_current_ma);
                    }
                }
            } else if header.message_type() == ControlMessageType::Accept as u8 {
                self.current_cap = self.requested_cap;
                self.request_retries = 0;
                self.request_timer.reset();
            } else if header.message_type() == ControlMessageType::Reject as u8 {
                self.requested_cap = self.current_cap;
                self.request_retries = 0;
                self.request_timer.reset();
            } else if header.message_type() == ControlMessageType::PsRdy as u8 {
                debug!("pd: power ready");
                self.power_stable = true;
            }
            // GoodCRC and everything else: ignored.
        }
    }

    fn store_source_capabilities(&mut self, buffer: &[u8; MAX_RX_BYTES], num_objects: u8) {
        let count = usize::from(num_objects).min(MAX_SOURCE_CAPABILITIES);
        for index in 0..count {
            let offset = 2 + 4 * index;
            self.source_caps[index] = u32::from_le_bytes([
                buffer[offset],
                buffer[offset + 1],
                buffer[offset + 2],
                buffer[offset + 3],
            ]);
        }
        self.source_caps_len = count as u8;
    }

    /// Send a Request message, consuming one message ID.
    fn send_request(
        &mut self,
        now_us: u64,
        position: u8,
        current_ma: u16,
    ) -> Result<(), TransferError> {
        let header = sink_header(DataMessageType::Request as u8, 1, self.next_message_id);
        let object = request_object(position, current_ma);
        let result = self.fusb.write_fifo_message(header, &[object]);
        match &result {
            Ok(()) => {
                debug!("pd: Request({}) id={}", position, self.next_message_id);
                self.requested_cap = position;
                self.requested_current_ma = current_ma;
                self.power_stable = false;
                self.request_timer.restart(now_us);
            }
            Err(_) => self.error_count += 1,
        }
        self.next_message_id = (self.next_message_id + 1) % 8;
        result
    }
}
