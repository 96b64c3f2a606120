//! Datalogger: CAN traffic and analog telemetry to SD card.
//!
//! The run loop samples the rails against the bandgap (the 3.3 V rail
//! gates mount/dismount, so it must stay accurate while Vref+ sags),
//! aggregates everything into per-second statistics, and streams CAN
//! traffic into the record file. Loop time itself is histogrammed, so every
//! log carries its own health record.

use crate::can::{id, make_message, CanEvent, CoreStatus};
use crate::datalogger::logger::{source_id, Logger, LoggerConfig, LoggerInputs, LoggerState};
use crate::filter::DigitalFilter;
use crate::led::{Color, RgbActivity};
use crate::record::{can_event_record, histogram_record, info_record, stats_record};
use crate::ring::Consumer;
use crate::stats::{Histogram, MovingAverage, StatisticalCounter};
use crate::time::{Monotonic, Ticker};
use embedded_hal::digital::v2::InputPin;
use embedded_hal::digital::v2::OutputPin;
use tachyon_core::{
    AnalogInput, CanConfigure, Filesystem, MicrosCounter, Rtc, Watchdog,
};

/// Capacity of the receive ring shared with the CAN ISR.
pub const RX_RING_CAPACITY: usize = 128;

/// Loop-time histogram dividers, in µs.
pub const LOOP_TIME_DIVIDERS: [i32; 8] = [33, 100, 333, 1000, 3333, 10_000, 33_333, 100_000];

/// Compile-time datalogger configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Mount state machine configuration.
    pub logger: LoggerConfig,
    /// Rail sampling cadence.
    pub voltage_sense_period_us: u64,
    /// Statistics record cadence.
    pub voltage_save_period_us: u64,
    /// Heartbeat / core-status transmit cadence.
    pub heartbeat_period_us: u64,
    /// Controller self-reset check cadence.
    pub can_check_period_us: u64,
    /// File sync cadence.
    pub file_sync_period_us: u64,
    /// Status blink cadence.
    pub status_blink_period_us: u64,
    /// Card-detect and dismount-switch debounce dwell.
    pub switch_debounce_us: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logger: LoggerConfig::default(),
            voltage_sense_period_us: 100_000,
            voltage_save_period_us: 1_000_000,
            heartbeat_period_us: 1_000_000,
            can_check_period_us: 1_000_000,
            file_sync_period_us: 300_000_000,
            status_blink_period_us: 1_000_000,
            switch_debounce_us: 50_000,
        }
    }
}

/// The datalogger device.
pub struct Datalogger<'r, MC, CAN, F, R, W, IN, A, P>
where
    F: Filesystem,
    R: Rtc,
{
    config: Config,
    time: Monotonic<MC>,
    wdt: W,
    can: CAN,
    rx: Consumer<'r, CanEvent, RX_RING_CAPACITY>,
    logger: Logger<F, R>,

    adc_bandgap: A,
    adc_12v: A,
    adc_3v3: A,
    adc_supercap: A,
    adc_temperature: A,

    card_detect: IN,
    dismount_switch: IN,
    card_filter: DigitalFilter,
    switch_filter: DigitalFilter,

    main_led: RgbActivity<P, P, P>,
    can_led: RgbActivity<P, P, P>,
    sd_led: RgbActivity<P, P, P>,

    sense_ticker: Ticker,
    save_ticker: Ticker,
    heartbeat_ticker: Ticker,
    can_check_ticker: Ticker,
    file_sync_ticker: Ticker,
    blink_ticker: Ticker,

    vrefp_stats: StatisticalCounter,
    rail_12v_stats: StatisticalCounter,
    rail_3v3_stats: StatisticalCounter,
    supercap_stats: StatisticalCounter,
    temperature_stats: StatisticalCounter,
    loop_stats: StatisticalCounter,
    loop_histogram: Histogram<8>,
    rail_3v3_avg: MovingAverage<8>,

    last_vrefp_mv: u16,
    last_temperature_centi_c: u16,
}

impl<'r, MC, CAN, F, R, W, IN, A, P> Datalogger<'r, MC, CAN, F, R, W, IN, A, P>
where
    MC: MicrosCounter,
    CAN: embedded_can::nb::Can<Frame = crate::can::CanMessage> + CanConfigure,
    F: Filesystem,
    R: Rtc,
    W: Watchdog,
    IN: InputPin,
    A: AnalogInput,
    P: OutputPin,
{
    /// Assemble the datalogger. The watchdog-reset flag is latched before
    /// construction so it can be recorded into every file header.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        counter: MC,
        wdt: W,
        can: CAN,
        rx: Consumer<'r, CanEvent, RX_RING_CAPACITY>,
        fs: F,
        rtc: R,
        adc_bandgap: A,
        adc_12v: A,
        adc_3v3: A,
        adc_supercap: A,
        adc_temperature: A,
        card_detect: IN,
        dismount_switch: IN,
        main_led: RgbActivity<P, P, P>,
        can_led: RgbActivity<P, P, P>,
        sd_led: RgbActivity<P, P, P>,
    ) -> Self {
        let was_wdt_reset = wdt.caused_reset();
        if was_wdt_reset {
            warn!("watchdog caused the last reset");
        }
        Self {
            time: Monotonic::new(counter),
            wdt,
            can,
            rx,
            logger: Logger::new(fs, rtc, config.logger, was_wdt_reset),
            adc_bandgap,
            adc_12v,
            adc_3v3,
            adc_supercap,
            adc_temperature,
            card_detect,
            dismount_switch,
            card_filter: DigitalFilter::new(false, config.switch_debounce_us),
            switch_filter: DigitalFilter::new(false, config.switch_debounce_us),
            main_led,
            can_led,
            sd_led,
            sense_ticker: Ticker::new(config.voltage_sense_period_us),
            save_ticker: Ticker::new(config.voltage_save_period_us),
            heartbeat_ticker: Ticker::new(config.heartbeat_period_us),
            can_check_ticker: Ticker::new(config.can_check_period_us),
            file_sync_ticker: Ticker::new(config.file_sync_period_us),
            blink_ticker: Ticker::new(config.status_blink_period_us),
            vrefp_stats: StatisticalCounter::new(),
            rail_12v_stats: StatisticalCounter::new(),
            rail_3v3_stats: StatisticalCounter::new(),
            supercap_stats: StatisticalCounter::new(),
            temperature_stats: StatisticalCounter::new(),
            loop_stats: StatisticalCounter::new(),
            loop_histogram: Histogram::new(LOOP_TIME_DIVIDERS),
            rail_3v3_avg: MovingAverage::new(),
            last_vrefp_mv: 0,
            last_temperature_centi_c: 0,
            config,
        }
    }

    /// Mount state, for tests and displays.
    pub fn logger_state(&self) -> LoggerState {
        self.logger.state()
    }

    /// One main-loop iteration.
    pub fn poll(&mut self) {
        self.wdt.feed();
        self.time.update();
        let loop_start = self.time.now_us();
        let now = loop_start;
        let now_ms = (now / 1000) as u32;

        if self.sense_ticker.check_expired(now) {
            self.sample_rails();
        }

        // Debounced switches. Both are active low.
        let card_present = {
            let level = self.card_detect.is_low().unwrap_or(false);
            self.card_filter.update(now, level);
            self.card_filter.read()
        };
        let dismount_request = {
            let pressed = self.dismount_switch.is_low().unwrap_or(false);
            self.switch_filter.update(now, pressed) == crate::filter::FilterState::Rising
        };

        let inputs = LoggerInputs {
            card_present,
            rail_mv: self.rail_3v3_avg.read(),
            dismount_request,
        };
        if self.logger.poll(now, now_ms, inputs) {
            // Fresh mount: restart the sync cadence.
            self.file_sync_ticker.reset(now);
        }

        self.drive_leds(now, inputs.rail_mv);

        if self.logger.state() == LoggerState::Active && self.file_sync_ticker.check_expired(now)
        {
            self.logger.sync();
            self.sd_led.pulse(Color::White, now);
        }

        if self.save_ticker.check_expired(now) {
            self.save_statistics(now_ms);
        }

        if self.heartbeat_ticker.check_expired(now) {
            self.transmit_heartbeat(now);
        }

        if self.can_check_ticker.check_expired(now) && self.can.clear_self_reset() {
            warn!("CAN controller self-reset");
            self.can_led.pulse(Color::Blue, now);
            if self.logger.state() == LoggerState::Active {
                self.logger
                    .write(&info_record("CAN Reset", source_id::CAN, now_ms));
                self.sd_led.pulse(Color::Yellow, now);
            }
        }

        while let Some(event) = self.rx.next() {
            match event {
                CanEvent::Error { .. } => self.can_led.pulse(Color::Red, now),
                CanEvent::Message { .. } => self.can_led.pulse(Color::Green, now),
            }
            if self.logger.state() == LoggerState::Active {
                self.logger.write(&can_event_record(&event, source_id::CAN));
                self.sd_led.pulse(Color::Yellow, now);
            }
        }

        self.main_led.update(now);
        self.can_led.update(now);
        self.sd_led.update(now);

        let loop_time = (self.time.now_us() - loop_start) as i32;
        self.loop_histogram.add_sample(loop_time);
        self.loop_stats.add_sample(loop_time);
    }

    /// Run the main loop forever.
    pub fn run(&mut self) -> ! {
        loop {
            self.poll();
        }
    }

    /// Sample every rail in one burst, since the bandgap is the common
    /// reference.
    fn sample_rails(&mut self) {
        let bandgap = u32::from(self.adc_bandgap.read_u16() >> 4);
        let rail_12v = u32::from(self.adc_12v.read_u16() >> 4);
        let rail_3v3 = u32::from(self.adc_3v3.read_u16() >> 4);
        let supercap = u32::from(self.adc_supercap.read_u16() >> 4);
        let temperature = u32::from(self.adc_temperature.read_u16() >> 4);

        if bandgap == 0 {
            return;
        }
        // Vref+ from the 905 mV internal bandgap.
        let vrefp_mv = 905 * 4095 / bandgap;

        // The 3.3 V rail gates dismount, so it is referenced to the
        // bandgap and stays honest while Vref+ droops.
        let rail_3v3_bandgap_mv = rail_3v3 * vrefp_mv * 2 / 4095;
        self.rail_3v3_avg.update(rail_3v3_bandgap_mv);

        // Logged values use the precision 3 V reference instead.
        let rail_12v_mv = rail_12v * 3000 * (15 + 82) / 15 / 4095;
        let rail_3v3_mv = rail_3v3 * 3000 * 2 / 4095;
        let supercap_mv = supercap * 3000 * 2 / 4095;
        let temperature_mv = temperature * 3000 / 4095;
        // -2.29 mV/°C around 577.3 mV at 0 °C.
        let temperature_milli_c = (577 - temperature_mv as i32) * 1000 * 100 / 229;

        self.vrefp_stats.add_sample(vrefp_mv as i32);
        self.rail_12v_stats.add_sample(rail_12v_mv as i32);
        self.rail_3v3_stats.add_sample(rail_3v3_mv as i32);
        self.supercap_stats.add_sample(supercap_mv as i32);
        self.temperature_stats.add_sample(temperature_milli_c);

        self.last_vrefp_mv = vrefp_mv as u16;
        self.last_temperature_centi_c = (temperature_milli_c / 10).clamp(0, 65_535) as u16;
    }

    /// Write the per-period aggregates, then reset them for the next
    /// period.
    fn save_statistics(&mut self, now_ms: u32) {
        if self.logger.state() == LoggerState::Active {
            let period_ms = (self.config.voltage_save_period_us / 1000) as u32;
            let records = [
                stats_record(
                    self.vrefp_stats.read(),
                    source_id::VOLTAGE_BANDGAP,
                    now_ms,
                    period_ms,
                ),
                stats_record(
                    self.rail_12v_stats.read(),
                    source_id::VOLTAGE_12V,
                    now_ms,
                    period_ms,
                ),
                stats_record(
                    self.rail_3v3_stats.read(),
                    source_id::VOLTAGE_3V3,
                    now_ms,
                    period_ms,
                ),
                stats_record(
                    self.supercap_stats.read(),
                    source_id::VOLTAGE_SUPERCAP,
                    now_ms,
                    period_ms,
                ),
                stats_record(
                    self.temperature_stats.read(),
                    source_id::TEMPERATURE_CHIP,
                    now_ms,
                    period_ms,
                ),
                stats_record(self.loop_stats.read(), source_id::MAIN_LOOP, now_ms, period_ms),
            ];
            for record in &records {
                self.logger.write(record);
            }

            let mut counts = [0u32; 9];
            counts[..8].copy_from_slice(self.loop_histogram.counts());
            counts[8] = self.loop_histogram.overflow();
            self.logger.write(&histogram_record(
                self.loop_histogram.dividers(),
                &counts,
                source_id::MAIN_LOOP,
                now_ms,
                (self.config.voltage_save_period_us / 1000) as u32,
            ));

            let now_us = self.time.now_us();
            self.sd_led.pulse(Color::Yellow, now_us);
        }

        self.vrefp_stats.reset();
        self.rail_12v_stats.reset();
        self.rail_3v3_stats.reset();
        self.supercap_stats.reset();
        self.temperature_stats.reset();
        self.loop_stats.reset();
        self.loop_histogram.reset();
    }

    /// Heartbeat and core-status frames into the TX path.
    fn transmit_heartbeat(&mut self, now: u64) {
        let heartbeat = make_message(id::HEART_DATALOGGER, &(now as u32).to_le_bytes());
        let _ = self.can.transmit(&heartbeat);

        let status = CoreStatus {
            temperature_centi_c: self.last_temperature_centi_c,
            vref_bandgap_mv: self.last_vrefp_mv,
        };
        let status_frame = make_message(id::CORE_STATUS_DATALOGGER, &status.to_payload());
        let _ = self.can.transmit(&status_frame);

        self.main_led.pulse(Color::Cyan, now);
    }

    /// Idle colors follow the mount state; blinks follow the blink ticker.
    fn drive_leds(&mut self, now: u64, rail_mv: u32) {
        match self.logger.state() {
            LoggerState::Inactive => {
                let idle = if rail_mv <= self.config.logger.mount_threshold_mv {
                    Color::Purple
                } else {
                    Color::Off
                };
                self.main_led.set_idle(idle);
                self.sd_led.set_idle(Color::Off);
            }
            LoggerState::BadCard => {
                self.main_led.set_idle(Color::Off);
                self.sd_led.set_idle(Color::Red);
            }
            LoggerState::Active => {
                self.main_led.set_idle(Color::Off);
                self.sd_led.set_idle(Color::Green);
            }
            LoggerState::UserDismount => {
                self.main_led.set_idle(Color::Blue);
                self.sd_led.set_idle(Color::Blue);
            }
            LoggerState::UnsafeEject => {
                self.main_led.set_idle(Color::Off);
                self.sd_led.set_idle(Color::Red);
            }
        }

        if self.blink_ticker.check_expired(now) {
            match self.logger.state() {
                LoggerState::Inactive => self.main_led.pulse(Color::Red, now),
                LoggerState::Active => self.main_led.pulse(Color::Green, now),
                _ => {}
            }
        }
        if matches!(
            self.logger.state(),
            LoggerState::UnsafeEject | LoggerState::BadCard
        ) {
            self.main_led.pulse(Color::Red, now);
        }
    }
}
