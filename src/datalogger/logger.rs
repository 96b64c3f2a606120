//! Mount/dismount state machine for the SD-card logger.
//!
//! Everything that can go wrong with the medium (brownout, card yanked,
//! flaky mounts) is a deterministic transition here, gated by supply
//! hysteresis and card-detect state supplied by the caller. Side effects
//! (header and farewell records, file close, unmount) happen only at the
//! transitions this table names; nothing closes a file from an unrelated
//! error path.

use crate::datalogger::file::RecordFile;
use crate::record::{info_record, source_def_record, time_record, Record, SourceType};
use crate::time::Ticker;
use core::fmt::Write as _;
use tachyon_core::{Filesystem, Rtc, RtcDateTime};

/// Source IDs declared in every log file's header.
pub mod source_id {
    /// Device-level annotations.
    pub const SYSTEM: u32 = 1;
    /// Main loop timing statistics.
    pub const MAIN_LOOP: u32 = 2;
    /// The CAN bus.
    pub const CAN: u32 = 10;
    /// The external RTC.
    pub const RTC: u32 = 20;
    /// Vref+ measured against the internal bandgap.
    pub const VOLTAGE_BANDGAP: u32 = 30;
    /// The 12 V rail.
    pub const VOLTAGE_12V: u32 = 31;
    /// The 3.3 V rail.
    pub const VOLTAGE_3V3: u32 = 32;
    /// The supercap rail.
    pub const VOLTAGE_SUPERCAP: u32 = 33;
    /// Die temperature.
    pub const TEMPERATURE_CHIP: u32 = 40;
}

/// Logger state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LoggerState {
    /// No card, or supply too low to try.
    Inactive,
    /// Card present but mounting failed; retrying periodically.
    BadCard,
    /// File open, records flowing.
    Active,
    /// User asked for a clean dismount; waiting for card removal.
    UserDismount,
    /// Card was pulled while active.
    UnsafeEject,
}

/// Compile-time logger configuration.
#[derive(Debug, Clone, Copy)]
pub struct LoggerConfig {
    /// Supply level required to attempt a mount, in mV.
    pub mount_threshold_mv: u32,
    /// Supply level below which an active log is closed, in mV.
    pub dismount_threshold_mv: u32,
    /// Retry cadence while the card refuses to mount.
    pub remount_period_us: u64,
    /// How long a user dismount waits for card removal before rearming.
    pub undismount_period_us: u64,
    /// Annotation written first into every file.
    pub header_info: &'static str,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            mount_threshold_mv: 3100,
            dismount_threshold_mv: 2850,
            remount_period_us: 250 * 1000,
            undismount_period_us: 10 * 1000 * 1000,
            header_info: "Datalogger",
        }
    }
}

/// Sensor and switch state the state machine consumes each poll.
#[derive(Debug, Clone, Copy)]
pub struct LoggerInputs {
    /// Debounced card-detect level.
    pub card_present: bool,
    /// Smoothed supply rail in mV.
    pub rail_mv: u32,
    /// Debounced user dismount request edge.
    pub dismount_request: bool,
}

/// The mount/dismount state machine plus the record file it manages.
pub struct Logger<F: Filesystem, R: Rtc> {
    fs: F,
    rtc: R,
    file: RecordFile<F>,
    state: LoggerState,
    config: LoggerConfig,
    remount_ticker: Ticker,
    undismount_ticker: Ticker,
    mount_attempts: u32,
    was_wdt_reset: bool,
    sd_inserted_ms: u32,
}

impl<F: Filesystem, R: Rtc> Logger<F, R> {
    /// Logger in the Inactive state. `was_wdt_reset` is recorded into the
    /// header of every file mounted this boot.
    pub fn new(fs: F, rtc: R, config: LoggerConfig, was_wdt_reset: bool) -> Self {
        Self {
            fs,
            rtc,
            file: RecordFile::new(),
            state: LoggerState::Inactive,
            config,
            remount_ticker: Ticker::new(config.remount_period_us),
            undismount_ticker: Ticker::new(config.undismount_period_us),
            mount_attempts: 0,
            was_wdt_reset,
            sd_inserted_ms: 0,
        }
    }

    /// Current state, for LEDs and displays.
    pub fn state(&self) -> LoggerState {
        self.state
    }

    /// Append a record to the active file. No-ops (returning `false`)
    /// outside the Active state.
    pub fn write(&mut self, record: &Record<'_>) -> bool {
        self.file.write(record)
    }

    /// Flush the active file.
    pub fn sync(&mut self) -> bool {
        self.file.sync()
    }

    /// Advance the state machine. Returns `true` on the poll that completes
    /// a mount, so the caller can rearm its periodic duties.
    pub fn poll(&mut self, now_us: u64, now_ms: u32, inputs: LoggerInputs) -> bool {
        match self.state {
            LoggerState::Inactive | LoggerState::UnsafeEject => {
                if inputs.card_present && inputs.rail_mv > self.config.mount_threshold_mv {
                    self.sd_inserted_ms = now_ms;
                    if self.mount(now_ms) {
                        info!("logger -> Active: mounted");
                        self.state = LoggerState::Active;
                        return true;
                    }
                    info!("logger -> BadCard: mount failed");
                    self.remount_ticker.reset(now_us);
                    self.mount_attempts = 0;
                    self.state = LoggerState::BadCard;
                }
            }
            LoggerState::BadCard => {
                if !inputs.card_present || inputs.rail_mv <= self.config.mount_threshold_mv {
                    info!("logger -> Inactive: ejected / undervoltage");
                    self.state = LoggerState::Inactive;
                } else if self.remount_ticker.check_expired(now_us) {
                    self.mount_attempts += 1;
                    if self.mount(now_ms) {
                        self.log_mount_attempts(now_ms);
                        info!("logger -> Active: mounted after {} attempts", self.mount_attempts);
                        self.state = LoggerState::Active;
                        return true;
                    }
                }
            }
            LoggerState::Active => {
                if !inputs.card_present {
                    // The card is already gone; closing is best-effort.
                    warn!("logger -> UnsafeEject");
                    self.file.close();
                    self.state = LoggerState::UnsafeEject;
                } else if inputs.dismount_request {
                    self.file
                        .write(&info_record("User dismount", source_id::SYSTEM, now_ms));
                    self.file.close();
                    self.fs.unmount();
                    self.undismount_ticker.reset(now_us);
                    info!("logger -> UserDismount");
                    self.state = LoggerState::UserDismount;
                } else if inputs.rail_mv < self.config.dismount_threshold_mv {
                    self.file.write(&info_record(
                        "Undervoltage dismount",
                        source_id::SYSTEM,
                        now_ms,
                    ));
                    self.file.close();
                    self.fs.unmount();
                    info!("logger -> Inactive: undervoltage");
                    self.state = LoggerState::Inactive;
                }
            }
            LoggerState::UserDismount => {
                if !inputs.card_present || self.undismount_ticker.check_expired(now_us) {
                    info!("logger -> Inactive");
                    self.state = LoggerState::Inactive;
                }
            }
        }
        false
    }

    /// Mount the filesystem, open the next file and write the header
    /// records.
    fn mount(&mut self, now_ms: u32) -> bool {
        let mut time = RtcDateTime {
            year: 0,
            month: 0,
            day: 0,
            hour: 0,
            minute: 0,
            second: 0,
        };
        let time_good = self.rtc.get_time(&mut time);

        // A stopped RTC reports a bogus date; those files go to a dedicated
        // directory instead of a fictional day.
        let mut dirname = [0u8; 8];
        let dirname: &str = if time_good {
            let mut writer = BufWriter::new(&mut dirname);
            let _ = write!(
                writer,
                "{:04}{:02}{:02}",
                time.year.min(9999),
                time.month,
                time.day
            );
            writer.freeze()
        } else {
            "NOTIME"
        };
        let mut basename = [0u8; 8];
        let basename: &str = {
            let mut writer = BufWriter::new(&mut basename);
            let _ = write!(writer, "{:02}{:02}", time.hour, time.minute);
            writer.freeze()
        };

        if self.fs.mount().is_err() {
            return false;
        }
        if self.file.new_file(&mut self.fs, dirname, basename).is_err() {
            return false;
        }

        self.write_header(now_ms);
        if self.was_wdt_reset {
            self.file
                .write(&info_record("WDT Reset", source_id::SYSTEM, 0));
        }
        self.file.write(&info_record(
            "SD inserted",
            source_id::SYSTEM,
            self.sd_inserted_ms,
        ));
        self.file
            .write(&time_record(time.unix_seconds(), source_id::RTC, now_ms));
        if !time_good {
            self.file
                .write(&info_record("RTC stopped", source_id::RTC, now_ms));
        }
        self.file
            .write(&info_record("FS mounted", source_id::SYSTEM, now_ms));
        true
    }

    /// Header: the build annotation, then one `SourceDef` per source ID
    /// used in this file.
    fn write_header(&mut self, now_ms: u32) {
        self.file
            .write(&info_record(self.config.header_info, 0, now_ms));
        let defs: [(u32, SourceType, &str); 9] = [
            (source_id::SYSTEM, SourceType::Unknown, "System"),
            (source_id::MAIN_LOOP, SourceType::Unknown, "Main loop, us"),
            (source_id::CAN, SourceType::Can, "CAN"),
            (source_id::RTC, SourceType::Time, "RTC"),
            (
                source_id::VOLTAGE_BANDGAP,
                SourceType::Voltage,
                "Vref+, bandgap, mV",
            ),
            (source_id::VOLTAGE_12V, SourceType::Voltage, "12v, Vref+, mV"),
            (source_id::VOLTAGE_3V3, SourceType::Voltage, "3.3v, Vref+, mV"),
            (
                source_id::VOLTAGE_SUPERCAP,
                SourceType::Voltage,
                "Supercap, Vref+, mV",
            ),
            (
                source_id::TEMPERATURE_CHIP,
                SourceType::Temperature,
                "Chip temperature, milliC",
            ),
        ];
        for (id, source_type, name) in defs {
            self.file.write(&source_def_record(id, source_type, name));
        }
    }

    fn log_mount_attempts(&mut self, now_ms: u32) {
        let mut text = [0u8; 48];
        let mut writer = BufWriter::new(&mut text);
        let _ = write!(writer, "{} unsuccessful mount attempts", self.mount_attempts);
        let text = writer.freeze();
        self.file
            .write(&info_record(text, source_id::SYSTEM, now_ms));
    }
}

/// `core::fmt::Write` over a fixed buffer, truncating on overflow.
struct BufWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> BufWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    fn freeze(self) -> &'a str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl core::fmt::Write for BufWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let room = self.buf.len() - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::datalogger::file::test::{FakeFs, FileState};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::vec::Vec;

    const MS: u64 = 1000;
    const SEC: u64 = 1000 * MS;

    struct FakeRtc {
        time: RtcDateTime,
        good: bool,
    }

    impl Rtc for FakeRtc {
        fn get_time(&mut self, out: &mut RtcDateTime) -> bool {
            *out = self.time;
            self.good
        }
    }

    fn good_rtc() -> FakeRtc {
        FakeRtc {
            time: RtcDateTime {
                year: 2024,
                month: 1,
                day: 15,
                hour: 8,
                minute: 30,
                second: 0,
            },
            good: true,
        }
    }

    fn inputs(card: bool, rail: u32) -> LoggerInputs {
        LoggerInputs {
            card_present: card,
            rail_mv: rail,
            dismount_request: false,
        }
    }

    fn file_text(file: &Rc<RefCell<FileState>>) -> Vec<u8> {
        file.borrow().bytes.clone()
    }

    fn contains(haystack: &[u8], needle: &str) -> bool {
        haystack
            .windows(needle.len())
            .any(|window| window == needle.as_bytes())
    }

    #[test]
    fn mounts_when_card_and_voltage_present() {
        let fs = FakeFs::default();
        let mut logger = Logger::new(fs.clone(), good_rtc(), LoggerConfig::default(), false);

        // Low rail: stays inactive even with a card.
        assert!(!logger.poll(0, 0, inputs(true, 3000)));
        assert_eq!(logger.state(), LoggerState::Inactive);

        // Rail recovers: mounts and reports it.
        assert!(logger.poll(MS, 1, inputs(true, 3300)));
        assert_eq!(logger.state(), LoggerState::Active);
        assert_eq!(fs.created_paths(), ["20240115/0830"]);

        let bytes = file_text(&fs.last_file());
        assert!(contains(&bytes, "FS mounted"));
        assert!(contains(&bytes, "SD inserted"));
        assert!(contains(&bytes, "System"));
        assert!(!contains(&bytes, "WDT Reset"));
    }

    #[test]
    fn wdt_reset_is_recorded_in_header() {
        let fs = FakeFs::default();
        let mut logger = Logger::new(fs.clone(), good_rtc(), LoggerConfig::default(), true);
        logger.poll(0, 0, inputs(true, 3300));
        assert!(contains(&file_text(&fs.last_file()), "WDT Reset"));
    }

    #[test]
    fn stopped_rtc_logs_under_notime() {
        let fs = FakeFs::default();
        let rtc = FakeRtc {
            time: RtcDateTime {
                year: 2000,
                month: 1,
                day: 1,
                hour: 0,
                minute: 0,
                second: 0,
            },
            good: false,
        };
        let mut logger = Logger::new(fs.clone(), rtc, LoggerConfig::default(), false);
        logger.poll(0, 0, inputs(true, 3300));
        assert_eq!(logger.state(), LoggerState::Active);
        assert_eq!(fs.created_paths(), ["NOTIME/0000"]);
        assert!(contains(&file_text(&fs.last_file()), "RTC stopped"));
    }

    /// Scenario: supply sag below the dismount threshold closes out the
    /// file cleanly.
    #[test]
    fn undervoltage_dismount() {
        let fs = FakeFs::default();
        let mut logger = Logger::new(fs.clone(), good_rtc(), LoggerConfig::default(), false);
        logger.poll(0, 0, inputs(true, 3300));
        assert_eq!(logger.state(), LoggerState::Active);

        // Hysteresis: 2900 mV is below mount but above dismount.
        logger.poll(MS, 1, inputs(true, 2900));
        assert_eq!(logger.state(), LoggerState::Active);

        logger.poll(2 * MS, 2, inputs(true, 2800));
        assert_eq!(logger.state(), LoggerState::Inactive);

        let handle = fs.last_file();
        assert!(contains(&file_text(&handle), "Undervoltage dismount"));
        assert!(handle.borrow().closed);
        assert_eq!(fs.0.borrow().unmounts, 1);
        assert!(!fs.0.borrow().mounted);
    }

    /// Scenario: unsafe eject closes the file and waits for reinsertion.
    #[test]
    fn unsafe_eject_then_reinsert() {
        let fs = FakeFs::default();
        let mut logger = Logger::new(fs.clone(), good_rtc(), LoggerConfig::default(), false);
        logger.poll(0, 0, inputs(true, 3300));
        assert_eq!(logger.state(), LoggerState::Active);

        logger.poll(MS, 1, inputs(false, 3300));
        assert_eq!(logger.state(), LoggerState::UnsafeEject);
        assert!(fs.last_file().borrow().closed);

        // Reinsertion with good voltage remounts through the same path; the
        // second file takes the next sequence number.
        assert!(logger.poll(2 * MS, 2, inputs(true, 3300)));
        assert_eq!(logger.state(), LoggerState::Active);
        assert_eq!(
            fs.created_paths(),
            ["20240115/0830", "20240115/0830_1"]
        );
    }

    #[test]
    fn user_dismount_waits_for_removal() {
        let fs = FakeFs::default();
        let mut logger = Logger::new(fs.clone(), good_rtc(), LoggerConfig::default(), false);
        logger.poll(0, 0, inputs(true, 3300));

        let mut dismount = inputs(true, 3300);
        dismount.dismount_request = true;
        logger.poll(MS, 1, dismount);
        assert_eq!(logger.state(), LoggerState::UserDismount);
        assert!(contains(&file_text(&fs.last_file()), "User dismount"));
        assert!(fs.last_file().borrow().closed);
        assert_eq!(fs.0.borrow().unmounts, 1);

        // Card still in: no remount while waiting.
        logger.poll(2 * MS, 2, inputs(true, 3300));
        assert_eq!(logger.state(), LoggerState::UserDismount);

        // Removal releases the wait.
        logger.poll(3 * MS, 3, inputs(false, 3300));
        assert_eq!(logger.state(), LoggerState::Inactive);
    }

    #[test]
    fn user_dismount_rearms_after_timeout() {
        let fs = FakeFs::default();
        let mut logger = Logger::new(fs.clone(), good_rtc(), LoggerConfig::default(), false);
        logger.poll(0, 0, inputs(true, 3300));
        let mut dismount = inputs(true, 3300);
        dismount.dismount_request = true;
        logger.poll(MS, 1, dismount);
        assert_eq!(logger.state(), LoggerState::UserDismount);

        // Card never removed: the timer eventually rearms logging.
        logger.poll(12 * SEC, 12_000, inputs(true, 3300));
        assert_eq!(logger.state(), LoggerState::Inactive);
        logger.poll(12 * SEC + MS, 12_001, inputs(true, 3300));
        assert_eq!(logger.state(), LoggerState::Active);
    }

    /// Scenario: flaky card mounts on a later retry and the failure count
    /// is logged.
    #[test]
    fn bad_card_retries_and_logs_attempt_count() {
        let fs = FakeFs::default();
        fs.0.borrow_mut().mount_fails = true;
        let mut logger = Logger::new(fs.clone(), good_rtc(), LoggerConfig::default(), false);

        logger.poll(0, 0, inputs(true, 3300));
        assert_eq!(logger.state(), LoggerState::BadCard);

        // Retries happen on the remount cadence.
        logger.poll(100 * MS, 100, inputs(true, 3300));
        assert_eq!(logger.state(), LoggerState::BadCard);
        logger.poll(260 * MS, 260, inputs(true, 3300));
        assert_eq!(logger.state(), LoggerState::BadCard);

        // Card starts behaving on the third retry window.
        fs.0.borrow_mut().mount_fails = false;
        logger.poll(600 * MS, 600, inputs(true, 3300));
        assert_eq!(logger.state(), LoggerState::Active);
        assert!(contains(
            &file_text(&fs.last_file()),
            "2 unsuccessful mount attempts"
        ));
    }

    #[test]
    fn bad_card_gives_up_on_eject() {
        let fs = FakeFs::default();
        fs.0.borrow_mut().mount_fails = true;
        let mut logger = Logger::new(fs.clone(), good_rtc(), LoggerConfig::default(), false);
        logger.poll(0, 0, inputs(true, 3300));
        assert_eq!(logger.state(), LoggerState::BadCard);
        logger.poll(MS, 1, inputs(false, 3300));
        assert_eq!(logger.state(), LoggerState::Inactive);
    }
}
