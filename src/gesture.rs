//! Button gesture recognition: click, long press, hold-repeat.
//!
//! Built on top of the [`DigitalFilter`] debouncer. Buttons are wired
//! active-low with pull-ups; the raw pin level is inverted here so the
//! filter and the gesture machine both work in pressed-is-true terms.

use crate::filter::{DigitalFilter, FilterState};
use embedded_hal::digital::v2::InputPin;

/// Duration boundary between a click and a click-and-hold, in microseconds.
pub const CLICK_DURATION_US: u64 = 700 * 1000;
/// Interval between repeated activations while held, in microseconds.
pub const HOLD_REPEAT_US: u64 = 100 * 1000;
/// Dwell an edge must be stable for to register, in microseconds.
pub const DEBOUNCE_DURATION_US: u64 = 50 * 1000;

/// Result of polling the gesture recognizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Gesture {
    /// Repeatedly emitted while up.
    Up,
    /// Emitted on the debounced down edge.
    ClickPress,
    /// Repeatedly emitted while down, before the long-press boundary.
    Down,
    /// Emitted on the up edge of a press shorter than the boundary.
    ClickRelease,
    /// Emitted once when a press crosses the long-press boundary.
    HoldTransition,
    /// Repeatedly emitted while held past the boundary.
    Hold,
    /// Emitted every repeat interval while held past the boundary.
    HoldRepeat,
    /// Emitted on the up edge of a long press.
    HoldRelease,
}

/// Debounced gesture recognizer over one active-low button.
pub struct ButtonGesture<P> {
    pin: P,
    filter: DigitalFilter,
    long_press: bool,
    pressed_at_us: u64,
    last_repeat_us: u64,
}

impl<P: InputPin> ButtonGesture<P> {
    /// Recognizer with the default click/repeat/debounce timings.
    pub fn new(pin: P) -> Self {
        Self {
            pin,
            filter: DigitalFilter::new(false, DEBOUNCE_DURATION_US),
            long_press: false,
            pressed_at_us: 0,
            last_repeat_us: 0,
        }
    }

    /// Poll the button; exactly one gesture is reported per call.
    pub fn update(&mut self, now_us: u64) -> Gesture {
        // Active low: pressed while the pin reads low.
        let pressed = self.pin.is_low().unwrap_or(false);
        match self.filter.update(now_us, pressed) {
            FilterState::Rising => {
                self.pressed_at_us = now_us;
                self.long_press = false;
                Gesture::ClickPress
            }
            FilterState::Falling => {
                if self.long_press {
                    self.long_press = false;
                    Gesture::HoldRelease
                } else {
                    Gesture::ClickRelease
                }
            }
            FilterState::High => {
                if !self.long_press {
                    if now_us.saturating_sub(self.pressed_at_us) >= CLICK_DURATION_US {
                        self.long_press = true;
                        self.last_repeat_us = now_us;
                        Gesture::HoldTransition
                    } else {
                        Gesture::Down
                    }
                } else if now_us.saturating_sub(self.last_repeat_us) >= HOLD_REPEAT_US {
                    self.last_repeat_us = now_us;
                    Gesture::HoldRepeat
                } else {
                    Gesture::Hold
                }
            }
            FilterState::Low => Gesture::Up,
        }
    }
}
