//! Lawicel-style SLCAN engine over a non-blocking USB serial endpoint.
//!
//! The engine owns an input line buffer and an output packet buffer and is
//! pumped from the main loop. One call cycle gathers input up to a `\r`,
//! executes at most one queued command, drains received frames into the
//! output buffer as ASCII, and attempts one non-blocking flush. Nothing
//! blocks: a congested endpoint simply leaves the output buffer (and a
//! held-over message) for the next cycle.
//!
//! Bus access goes exclusively through the [`SlcanHandler`] capability
//! interface the owner implements; the engine itself never touches the CAN
//! controller.

use crate::can::CanMessage;
use embedded_can::{ExtendedId, Frame, Id, StandardId};
use fugit::HertzU32;
use tachyon_core::{CanMode, UsbSerial};

/// Input line buffer size. Longest valid command is a `T` frame at 27 bytes.
const INPUT_BUFFER_LEN: usize = 32;
/// Output packet buffer size.
const OUTPUT_BUFFER_LEN: usize = 256;

/// Error reply byte (BEL).
const BELL: u8 = 0x07;

/// Nominal bitrates selected by the `S<n>` command, in Hz.
const BITRATE_CODES: [u32; 9] = [
    10_000, 20_000, 50_000, 100_000, 125_000, 250_000, 500_000, 800_000, 1_000_000,
];

/// Capability interface through which the engine reaches the CAN bus.
///
/// Every operation reports success as `bool`; a `false` turns into a BEL
/// reply to the host.
pub trait SlcanHandler {
    /// Queue a frame for transmission on the bus.
    fn transmit(&mut self, msg: &CanMessage) -> bool;
    /// Change the nominal bitrate.
    fn set_bitrate(&mut self, bitrate: HertzU32) -> bool;
    /// Program a raw BTR register pair.
    fn set_bit_timing_raw(&mut self, btr0: u8, btr1: u8) -> bool;
    /// Open or close the bus.
    fn set_mode(&mut self, mode: CanMode) -> bool;
}

/// Bounded FIFO of received frames awaiting ASCII formatting.
struct MessageQueue<const N: usize> {
    slots: [Option<CanMessage>; N],
    read: usize,
    write: usize,
    len: usize,
}

impl<const N: usize> MessageQueue<N> {
    const fn new() -> Self {
        Self {
            slots: [None; N],
            read: 0,
            write: 0,
            len: 0,
        }
    }

    fn push(&mut self, msg: CanMessage) -> bool {
        if self.len == N {
            return false;
        }
        self.slots[self.write] = Some(msg);
        self.write = (self.write + 1) % N;
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<CanMessage> {
        if self.len == 0 {
            return None;
        }
        let msg = self.slots[self.read].take();
        self.read = (self.read + 1) % N;
        self.len -= 1;
        msg
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

/// SLCAN command/response engine.
///
/// `RX` sizes the internal queue of frames waiting to be formatted; the
/// deeper buffering lives in the CAN receive ring upstream.
pub struct Slcan<const RX: usize> {
    input: [u8; INPUT_BUFFER_LEN],
    input_len: usize,
    input_overflow: bool,
    command_queued: bool,
    output: [u8; OUTPUT_BUFFER_LEN],
    output_len: usize,
    queued_message: Option<CanMessage>,
    rx: MessageQueue<RX>,
    ignore_config: bool,
    dropped: u32,
}

impl<const RX: usize> Slcan<RX> {
    /// Engine with empty buffers.
    pub const fn new() -> Self {
        Self {
            input: [0; INPUT_BUFFER_LEN],
            input_len: 0,
            input_overflow: false,
            command_queued: false,
            output: [0; OUTPUT_BUFFER_LEN],
            output_len: 0,
            queued_message: None,
            rx: MessageQueue::new(),
            ignore_config: false,
            dropped: 0,
        }
    }

    /// Silently acknowledge mode/bitrate commands without invoking the
    /// handler. Used when another component owns the bus configuration.
    pub fn set_ignore_config_commands(&mut self, ignore: bool) {
        self.ignore_config = ignore;
    }

    /// Enqueue a received frame for forwarding to the host. On a full queue
    /// the frame is dropped and `false` returned.
    pub fn put_message(&mut self, msg: CanMessage) -> bool {
        if self.rx.push(msg) {
            true
        } else {
            self.dropped = self.dropped.wrapping_add(1);
            false
        }
    }

    /// Frames dropped on a full forwarding queue.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Discard all buffered state because the host disconnected. The next
    /// input byte starts a fresh command.
    pub fn reset(&mut self) {
        self.input_len = 0;
        self.input_overflow = false;
        self.command_queued = false;
        self.output_len = 0;
        self.queued_message = None;
        self.rx.clear();
    }

    /// One engine cycle. Returns `true` if any progress was made, for
    /// callers that track link activity.
    pub fn update<S: UsbSerial, H: SlcanHandler>(&mut self, serial: &mut S, handler: &mut H) -> bool {
        let mut active = self.read_input(serial);
        active |= self.process_command(handler);
        active |= self.process_messages();
        active |= self.flush(serial);
        active
    }

    /// Accumulate input up to a line terminator.
    fn read_input<S: UsbSerial>(&mut self, serial: &mut S) -> bool {
        let mut active = false;
        while !self.command_queued && serial.readable() {
            let Some(byte) = serial.read_byte() else {
                break;
            };
            active = true;
            if byte == b'\r' {
                self.command_queued = true;
            } else if self.input_len < self.input.len() {
                self.input[self.input_len] = byte;
                self.input_len += 1;
            } else {
                // Oversized command; consume to the terminator, then fail it.
                self.input_overflow = true;
            }
        }
        active
    }

    /// Execute the queued command if its response is guaranteed to fit.
    fn process_command<H: SlcanHandler>(&mut self, handler: &mut H) -> bool {
        if !self.command_queued {
            return false;
        }
        let response_len = Self::response_len(&self.input[..self.input_len]);
        if self.output_len + response_len > self.output.len() {
            return false;
        }

        let result = if self.input_overflow {
            None
        } else {
            let tail = &mut self.output[self.output_len..];
            exec_command(&self.input[..self.input_len], tail, self.ignore_config, handler)
        };
        match result {
            Some(written) => {
                // Command replies are CR terminated.
                self.output[self.output_len + written] = b'\r';
                self.output_len += written + 1;
            }
            None => {
                self.output[self.output_len] = BELL;
                self.output_len += 1;
            }
        }
        self.command_queued = false;
        self.input_len = 0;
        self.input_overflow = false;
        true
    }

    /// Upper bound of the reply size for an incoming command, including the
    /// terminator.
    fn response_len(command: &[u8]) -> usize {
        match command.first() {
            Some(b'V') => 6, // Vxxyy\r
            Some(b'N') => 6, // Nxxxx\r
            Some(b'F') => 4, // Fxx\r
            _ => 1,          // \r or BEL
        }
    }

    /// Move the held-over message and then queued messages into the output
    /// buffer, stopping at the first one that does not fit.
    fn process_messages(&mut self) -> bool {
        let mut active = false;
        if let Some(msg) = self.queued_message.take() {
            if let Some(written) = self.format_message(&msg) {
                self.output_len += written;
                active = true;
            } else {
                self.queued_message = Some(msg);
                return active;
            }
        }
        while let Some(msg) = self.rx.pop() {
            if let Some(written) = self.format_message(&msg) {
                self.output_len += written;
                active = true;
            } else {
                self.queued_message = Some(msg);
                break;
            }
        }
        active
    }

    /// Attempt to transmit the whole output buffer.
    fn flush<S: UsbSerial>(&mut self, serial: &mut S) -> bool {
        if self.output_len == 0 {
            return false;
        }
        if serial.write_block_nb(&self.output[..self.output_len]) {
            self.output_len = 0;
            true
        } else {
            false
        }
    }

    /// Format one frame as SLCAN ASCII at the output tail. `None` if it does
    /// not fit.
    fn format_message(&mut self, msg: &CanMessage) -> Option<usize> {
        let dlc = msg.dlc();
        let (letter, id_digits, id) = match (msg.id(), msg.is_remote_frame()) {
            (Id::Standard(id), false) => (b't', 3, u32::from(id.as_raw())),
            (Id::Extended(id), false) => (b'T', 8, id.as_raw()),
            (Id::Standard(id), true) => (b'r', 3, u32::from(id.as_raw())),
            (Id::Extended(id), true) => (b'R', 8, id.as_raw()),
        };
        let data_digits = if msg.is_remote_frame() { 0 } else { dlc * 2 };
        let needed = 1 + id_digits + 1 + data_digits + 1;
        if self.output_len + needed > self.output.len() {
            return None;
        }

        let out = &mut self.output[self.output_len..];
        out[0] = letter;
        write_hex(&mut out[1..], id, id_digits);
        out[1 + id_digits] = b'0' + dlc as u8;
        if !msg.is_remote_frame() {
            for (i, &byte) in msg.data().iter().enumerate() {
                write_hex(&mut out[2 + id_digits + 2 * i..], u32::from(byte), 2);
            }
        }
        out[needed - 1] = b'\r';
        Some(needed)
    }
}

impl<const RX: usize> Default for Slcan<RX> {
    fn default() -> Self {
        Self::new()
    }
}

/// Execute one command against the handler. `Some(n)` on success with `n`
/// reply bytes (terminator excluded) written to `out`; `None` requests a
/// BEL.
fn exec_command<H: SlcanHandler>(
    command: &[u8],
    out: &mut [u8],
    ignore_config: bool,
    handler: &mut H,
) -> Option<usize> {
    let (&letter, args) = match command.split_first() {
        Some(split) => split,
        // Bare CR is a liveness poke; acknowledge it.
        None => return Some(0),
    };
    match letter {
        b'S' => {
            let code = parse_hex(args, 1)?;
            let hz = *BITRATE_CODES.get(code as usize)?;
            config_ok(ignore_config, || handler.set_bitrate(HertzU32::from_raw(hz)))
        }
        b's' => {
            let raw = parse_hex(args, 4)?;
            config_ok(ignore_config, || {
                handler.set_bit_timing_raw((raw >> 8) as u8, raw as u8)
            })
        }
        b'O' => config_ok(ignore_config, || handler.set_mode(CanMode::Normal)),
        b'L' => config_ok(ignore_config, || handler.set_mode(CanMode::Silent)),
        b'C' => config_ok(ignore_config, || handler.set_mode(CanMode::Reset)),
        b't' => transmit_data(args, 3, handler),
        b'T' => transmit_data(args, 8, handler),
        b'r' => transmit_remote(args, 3, handler),
        b'R' => transmit_remote(args, 8, handler),
        b'V' => {
            // Hardware / software version, in the classic fixed format.
            out[..5].copy_from_slice(b"V1010");
            Some(5)
        }
        b'N' => {
            out[..5].copy_from_slice(b"N0001");
            Some(5)
        }
        b'F' => {
            // Status flags; sticky error reporting is not implemented.
            out[..3].copy_from_slice(b"F00");
            Some(3)
        }
        _ => None,
    }
}

fn config_ok(ignore_config: bool, apply: impl FnOnce() -> bool) -> Option<usize> {
    if ignore_config || apply() {
        Some(0)
    } else {
        None
    }
}

fn transmit_data<H: SlcanHandler>(args: &[u8], id_digits: usize, handler: &mut H) -> Option<usize> {
    if args.len() < id_digits + 1 {
        return None;
    }
    let id = parse_id(&args[..id_digits], id_digits)?;
    let dlc = parse_hex(&args[id_digits..id_digits + 1], 1)? as usize;
    if dlc > 8 || args.len() != id_digits + 1 + dlc * 2 {
        return None;
    }
    let mut data = [0u8; 8];
    for (i, chunk) in args[id_digits + 1..].chunks_exact(2).enumerate() {
        data[i] = parse_hex(chunk, 2)? as u8;
    }
    let msg = CanMessage::new(id, &data[..dlc])?;
    handler.transmit(&msg).then_some(0)
}

fn transmit_remote<H: SlcanHandler>(
    args: &[u8],
    id_digits: usize,
    handler: &mut H,
) -> Option<usize> {
    if args.len() != id_digits + 1 {
        return None;
    }
    let id = parse_id(&args[..id_digits], id_digits)?;
    let dlc = parse_hex(&args[id_digits..], 1)? as usize;
    if dlc > 8 {
        return None;
    }
    let msg = CanMessage::new_remote(id, dlc)?;
    handler.transmit(&msg).then_some(0)
}

fn parse_id(digits: &[u8], id_digits: usize) -> Option<Id> {
    let raw = parse_hex(digits, id_digits)?;
    if id_digits == 3 {
        StandardId::new(raw as u16).map(Id::Standard)
    } else {
        ExtendedId::new(raw).map(Id::Extended)
    }
}

/// Parse exactly `digits` uppercase or lowercase hex digits.
fn parse_hex(bytes: &[u8], digits: usize) -> Option<u32> {
    if bytes.len() != digits {
        return None;
    }
    let mut value = 0u32;
    for &byte in bytes {
        let nibble = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            b'A'..=b'F' => byte - b'A' + 10,
            _ => return None,
        };
        value = (value << 4) | u32::from(nibble);
    }
    Some(value)
}

/// Write `digits` uppercase hex digits of `value`.
fn write_hex(out: &mut [u8], value: u32, digits: usize) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    for i in 0..digits {
        let nibble = (value >> (4 * (digits - 1 - i))) & 0xF;
        out[i] = HEX[nibble as usize];
    }
}
