//! Hysteretic debounce filters for digital and analog inputs.
//!
//! Both filters commit a level change only after the new level has been
//! observed continuously for a configurable dwell time, with independent
//! rise and fall delays. A glitch shorter than the dwell resets the pending
//! transition and never reaches the output.

use crate::time::time_past;

/// Output of a filter update: the committed level, or the edge being
/// committed on this exact call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FilterState {
    /// Stable low.
    Low,
    /// Stable high.
    High,
    /// Low→high edge committed by this update.
    Rising,
    /// High→low edge committed by this update.
    Falling,
}

/// Debounce filter for a boolean input.
pub struct DigitalFilter {
    filter_rise_us: u64,
    filter_fall_us: u64,
    /// Time at which the pending value becomes the output (if still pending).
    deadline_us: u64,
    /// Last observed raw value.
    last_value: bool,
    /// Current filter output.
    filtered_value: bool,
}

impl DigitalFilter {
    /// Filter with a symmetric dwell time.
    pub const fn new(initial_value: bool, filter_delay_us: u64) -> Self {
        Self::with_asymmetric_delays(initial_value, filter_delay_us, filter_delay_us)
    }

    /// Filter with independent rise and fall dwell times.
    pub const fn with_asymmetric_delays(
        initial_value: bool,
        filter_rise_us: u64,
        filter_fall_us: u64,
    ) -> Self {
        Self {
            filter_rise_us,
            filter_fall_us,
            deadline_us: 0,
            last_value: initial_value,
            filtered_value: initial_value,
        }
    }

    /// Read the filtered value without updating internal state.
    pub fn read(&self) -> bool {
        self.filtered_value
    }

    /// Update with the latest raw value, returning any committed edge.
    pub fn update(&mut self, now_us: u64, value: bool) -> FilterState {
        if value != self.filtered_value {
            if value == self.last_value {
                if time_past(now_us, self.deadline_us) {
                    self.filtered_value = value;
                    return if value {
                        FilterState::Rising
                    } else {
                        FilterState::Falling
                    };
                }
            } else {
                // First observation of the changed value; arm the dwell.
                self.last_value = value;
                self.deadline_us = now_us
                    + if value {
                        self.filter_rise_us
                    } else {
                        self.filter_fall_us
                    };
            }
        } else {
            // Input returned to the committed level; drop any pending edge.
            self.last_value = value;
        }
        if self.filtered_value {
            FilterState::High
        } else {
            FilterState::Low
        }
    }

    /// Update and report only a committed rising edge.
    pub fn rising(&mut self, now_us: u64, value: bool) -> bool {
        self.update(now_us, value) == FilterState::Rising
    }

    /// Update and report only a committed falling edge.
    pub fn falling(&mut self, now_us: u64, value: bool) -> bool {
        self.update(now_us, value) == FilterState::Falling
    }
}

/// Debounce filter over an analog input with hysteresis thresholds.
///
/// The raw sample is reduced to a level by `raw >= rising_threshold` /
/// `raw <= falling_threshold`; samples in the dead band between the
/// thresholds cannot start or sustain a transition.
pub struct AnalogThresholdFilter {
    rising_threshold: u32,
    falling_threshold: u32,
    filter_rise_us: u64,
    filter_fall_us: u64,
    deadline_us: u64,
    last_value: bool,
    filtered_value: bool,
}

impl AnalogThresholdFilter {
    /// Filter with a symmetric dwell time. `rising_threshold` should be
    /// above `falling_threshold` for hysteresis.
    pub const fn new(
        initial_value: bool,
        rising_threshold: u32,
        falling_threshold: u32,
        filter_delay_us: u64,
    ) -> Self {
        Self::with_asymmetric_delays(
            initial_value,
            rising_threshold,
            falling_threshold,
            filter_delay_us,
            filter_delay_us,
        )
    }

    /// Filter with independent rise and fall dwell times.
    pub const fn with_asymmetric_delays(
        initial_value: bool,
        rising_threshold: u32,
        falling_threshold: u32,
        filter_rise_us: u64,
        filter_fall_us: u64,
    ) -> Self {
        Self {
            rising_threshold,
            falling_threshold,
            filter_rise_us,
            filter_fall_us,
            deadline_us: 0,
            last_value: initial_value,
            filtered_value: initial_value,
        }
    }

    /// Read the filtered value without updating internal state.
    pub fn read(&self) -> bool {
        self.filtered_value
    }

    /// Update with the latest raw sample, returning any committed edge.
    pub fn update(&mut self, now_us: u64, raw: u32) -> FilterState {
        let could_rise = raw >= self.rising_threshold && !self.filtered_value;
        let could_fall = raw <= self.falling_threshold && self.filtered_value;
        if could_rise || could_fall {
            let value = raw >= self.rising_threshold;
            if value == self.last_value {
                if time_past(now_us, self.deadline_us) {
                    self.filtered_value = value;
                    return if value {
                        FilterState::Rising
                    } else {
                        FilterState::Falling
                    };
                }
            } else {
                self.last_value = value;
                self.deadline_us = now_us
                    + if value {
                        self.filter_rise_us
                    } else {
                        self.filter_fall_us
                    };
            }
        } else {
            // Sample cannot trigger an edge; clear filtered-out glitching.
            self.last_value = self.filtered_value;
        }
        if self.filtered_value {
            FilterState::High
        } else {
            FilterState::Low
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn glitch_shorter_than_dwell_is_rejected() {
        let mut f = DigitalFilter::new(false, 100);
        // Raw goes high for 99 us, then back low.
        assert_eq!(f.update(0, true), FilterState::Low);
        assert_eq!(f.update(50, true), FilterState::Low);
        assert_eq!(f.update(99, true), FilterState::Low);
        assert_eq!(f.update(100, false), FilterState::Low);
        // High again: the dwell restarts, no stale deadline fires.
        assert_eq!(f.update(150, true), FilterState::Low);
        assert_eq!(f.update(249, true), FilterState::Low);
        assert!(!f.read());
    }

    #[test]
    fn stable_change_commits_exactly_once() {
        let mut f = DigitalFilter::new(false, 100);
        assert_eq!(f.update(0, true), FilterState::Low);
        assert_eq!(f.update(99, true), FilterState::Low);
        assert_eq!(f.update(100, true), FilterState::Rising);
        assert_eq!(f.update(101, true), FilterState::High);
        assert!(f.read());
        assert_eq!(f.update(300, false), FilterState::High);
        assert_eq!(f.update(400, false), FilterState::Falling);
        assert_eq!(f.update(401, false), FilterState::Low);
    }

    #[test]
    fn asymmetric_delays() {
        let mut f = DigitalFilter::with_asymmetric_delays(false, 10, 1000);
        assert_eq!(f.update(0, true), FilterState::Low);
        assert_eq!(f.update(10, true), FilterState::Rising);
        assert_eq!(f.update(20, false), FilterState::High);
        assert_eq!(f.update(500, false), FilterState::High);
        assert_eq!(f.update(1020, false), FilterState::Falling);
    }

    #[test]
    fn analog_dead_band_rejects() {
        // Hysteresis: rise at >= 3100, fall at <= 2850.
        let mut f = AnalogThresholdFilter::new(false, 3100, 2850, 100);
        assert_eq!(f.update(0, 3000), FilterState::Low); // dead band
        assert_eq!(f.update(10, 3200), FilterState::Low);
        assert_eq!(f.update(110, 3200), FilterState::Rising);
        // In the dead band the high level holds.
        assert_eq!(f.update(200, 2900), FilterState::High);
        assert_eq!(f.update(300, 2800), FilterState::High);
        assert_eq!(f.update(400, 2800), FilterState::Falling);
    }

    #[test]
    fn analog_glitch_resets_dwell() {
        let mut f = AnalogThresholdFilter::new(false, 3100, 2850, 100);
        assert_eq!(f.update(0, 3200), FilterState::Low);
        // Dip into the dead band resets the pending rise.
        assert_eq!(f.update(50, 3000), FilterState::Low);
        assert_eq!(f.update(60, 3200), FilterState::Low);
        assert_eq!(f.update(120, 3200), FilterState::Low);
        assert_eq!(f.update(160, 3200), FilterState::Rising);
    }
}
