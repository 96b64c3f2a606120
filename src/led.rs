//! RGB status LED with idle color and short activity pulses.
//!
//! Every device carries the same color code: off = idle, red = error,
//! green = OK / data, yellow = TX pending / sync, blue = connected-but-idle
//! or user dismount, purple = undervoltage, cyan = heartbeat tick.

use embedded_hal::digital::v2::OutputPin;

/// How long a [`RgbActivity::pulse`] overrides the idle color.
pub const PULSE_TIME_US: u64 = 50 * 1000;

/// Additive RGB color over three on/off channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Color {
    /// All channels off.
    Off,
    /// Error / bus-off / dismount.
    Red,
    /// OK / data received.
    Green,
    /// Transmit pending / sync in progress.
    Yellow,
    /// Connected but idle / user dismount.
    Blue,
    /// Undervoltage.
    Purple,
    /// Heartbeat tick.
    Cyan,
    /// All channels on.
    White,
}

impl Color {
    fn channels(self) -> (bool, bool, bool) {
        match self {
            Color::Off => (false, false, false),
            Color::Red => (true, false, false),
            Color::Green => (false, true, false),
            Color::Yellow => (true, true, false),
            Color::Blue => (false, false, true),
            Color::Purple => (true, false, true),
            Color::Cyan => (false, true, true),
            Color::White => (true, true, true),
        }
    }
}

/// Activity LED: a steady idle color, briefly overridden by pulses.
///
/// `update` must be polled from the main loop; it owns the actual pin
/// writes so that pulse expiry does not depend on further events.
pub struct RgbActivity<R, G, B> {
    red: R,
    green: G,
    blue: B,
    active_low: bool,
    idle: Color,
    pulse: Option<(Color, u64)>,
    lit: Option<Color>,
}

impl<R: OutputPin, G: OutputPin, B: OutputPin> RgbActivity<R, G, B> {
    /// Take ownership of the three channel pins. `active_low` selects the
    /// drive polarity.
    pub fn new(red: R, green: G, blue: B, active_low: bool) -> Self {
        Self {
            red,
            green,
            blue,
            active_low,
            idle: Color::Off,
            pulse: None,
            lit: None,
        }
    }

    /// Color shown when no pulse is active.
    pub fn set_idle(&mut self, color: Color) {
        self.idle = color;
    }

    /// Show `color` for [`PULSE_TIME_US`], then fall back to idle.
    /// A new pulse replaces any active one.
    pub fn pulse(&mut self, color: Color, now_us: u64) {
        self.pulse = Some((color, now_us + PULSE_TIME_US));
    }

    /// Drive the pins. Returns `true` if the displayed color changed, so
    /// callers multiplexing LEDs through an expander know when to flush.
    pub fn update(&mut self, now_us: u64) -> bool {
        if let Some((_, deadline)) = self.pulse {
            if now_us >= deadline {
                self.pulse = None;
            }
        }
        let color = match self.pulse {
            Some((color, _)) => color,
            None => self.idle,
        };
        if self.lit == Some(color) {
            return false;
        }
        let (r, g, b) = color.channels();
        self.drive(r, g, b);
        self.lit = Some(color);
        true
    }

    fn drive(&mut self, r: bool, g: bool, b: bool) {
        let _ = set(&mut self.red, r != self.active_low);
        let _ = set(&mut self.green, g != self.active_low);
        let _ = set(&mut self.blue, b != self.active_low);
    }
}

fn set<P: OutputPin>(pin: &mut P, high: bool) -> Result<(), P::Error> {
    if high {
        pin.set_high()
    } else {
        pin.set_low()
    }
}
