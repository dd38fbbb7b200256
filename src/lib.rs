// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Power management core for mobile SoCs: per-core frequency arbitration, display driven core
//! hotplug, thermal capping and a wrap-safe monotonic clock.

#![cfg_attr(not(test), no_std)]

pub mod clock;
pub mod cpufreq;
mod debug;
pub mod hotplug;
pub mod logger;
pub mod platform;
pub mod seqcount;
pub mod thermal;

use clock::MonotonicClock;
use cpufreq::{Cpufreq, FreqError};
use hotplug::{BlankMode, DEFAULT_SUSPEND_DELAY_MS, HotplugController, HotplugError};
use log::{debug, warn};
use platform::Platform;
use thermal::{DEFAULT_TEMP_THRESHOLD, ThermalCap, ThermalThrottle};

/// The default frequency cap in kHz while the display is off, when enabled.
pub const DEFAULT_SCREEN_OFF_MAX_KHZ: u32 = 1_190_400;

/// Runtime tunables, supplied at construction. Each can also be changed later through the
/// component which owns it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tunables {
    /// Whether display-off takes secondary cores down.
    pub enabled: bool,
    /// Delay between display-off and secondary cores going down.
    pub suspend_delay_ms: u32,
    /// Temperature in °C above which frequencies are capped.
    pub temp_threshold: i32,
    /// Frequency cap in kHz while the display is off.
    pub screen_off_max_khz: u32,
    /// Whether the screen-off cap applies.
    pub screen_off_max_enabled: bool,
    /// Maximum frequency of every core in kHz, if overridden.
    pub max_freq_override_khz: Option<u32>,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            enabled: true,
            suspend_delay_ms: DEFAULT_SUSPEND_DELAY_MS,
            temp_threshold: DEFAULT_TEMP_THRESHOLD,
            screen_off_max_khz: DEFAULT_SCREEN_OFF_MAX_KHZ,
            screen_off_max_enabled: false,
            max_freq_override_khz: None,
        }
    }
}

/// The power manager context, owning every component.
///
/// A platform creates exactly one instance during boot with [`PowerManager::new`], calls
/// [`PowerManager::start`] once the refresh timer can fire, and from then on shares it between
/// cores by reference. Platform interrupt and event handlers forward to the `on_*` and `handle_*`
/// methods.
pub struct PowerManager<P: Platform> {
    clock: MonotonicClock<P::RefreshTimerImpl>,
    cpufreq: Cpufreq<P::CpufreqPlatformImpl>,
    hotplug: HotplugController<P::HotplugPlatformImpl>,
    thermal: ThermalThrottle,
}

impl<P: Platform> PowerManager<P> {
    /// Creates the power manager, building the frequency table from the platform's operating
    /// points.
    ///
    /// Installs the platform's log sink as the logger if none has been installed yet. No hardware
    /// state is changed.
    pub fn new(platform: &P, tunables: &Tunables) -> Result<Self, FreqError> {
        if logger::init(P::log_sink()).is_err() {
            debug!("Logger already installed");
        }

        let clock = MonotonicClock::new(
            platform.refresh_timer(),
            P::fallback_ticks,
            P::FALLBACK_TICK_HZ,
        );
        let cpufreq = Cpufreq::new(platform.cpufreq_platform(), platform.frequency_rows())?;
        if let Err(e) = cpufreq.set_screen_off_max(tunables.screen_off_max_khz) {
            warn!(
                "Screen-off maximum of {} kHz not applied: {e}",
                tunables.screen_off_max_khz
            );
        }
        cpufreq.set_screen_off_max_enabled(tunables.screen_off_max_enabled);
        if let Some(max_khz) = tunables.max_freq_override_khz {
            cpufreq.set_max_freq_override(max_khz)?;
        }

        Ok(Self {
            clock,
            cpufreq,
            hotplug: HotplugController::new(
                platform.hotplug_platform(),
                tunables.enabled,
                tunables.suspend_delay_ms,
            ),
            thermal: ThermalThrottle::new(tunables.temp_threshold),
        })
    }

    /// Starts the monotonic clock.
    pub fn start(&self) {
        self.clock.start();
    }

    /// Returns the monotonic clock.
    pub fn clock(&self) -> &MonotonicClock<P::RefreshTimerImpl> {
        &self.clock
    }

    /// Returns the frequency arbiter.
    pub fn cpufreq(&self) -> &Cpufreq<P::CpufreqPlatformImpl> {
        &self.cpufreq
    }

    /// Returns the hotplug policy.
    pub fn hotplug(&self) -> &HotplugController<P::HotplugPlatformImpl> {
        &self.hotplug
    }

    /// Returns the thermal throttle.
    pub fn thermal(&self) -> &ThermalThrottle {
        &self.thermal
    }

    /// Handles the display turning off or on.
    pub fn on_display_event(&self, blanked: bool) -> Result<(), HotplugError> {
        self.cpufreq.on_display_event(blanked);
        self.hotplug
            .on_display_event(blanked, self.clock.now(), &self.cpufreq)
    }

    /// Handles a raw framebuffer blank notification. Modes other than unblank and powerdown are
    /// ignored.
    pub fn on_fb_blank(&self, mode: u32) -> Result<(), HotplugError> {
        match BlankMode::try_from(mode).map(BlankMode::blanked) {
            Ok(Some(blanked)) => self.on_display_event(blanked),
            Ok(None) => Ok(()),
            Err(_) => {
                warn!("Unknown blank mode {mode}");
                Ok(())
            }
        }
    }

    /// Prepares for system sleep: rejects further frequency changes, then freezes the clock.
    pub fn system_suspend(&self) {
        self.cpufreq.suspend();
        self.clock.suspend();
    }

    /// Recovers from system sleep: resumes the clock, then accepts frequency changes again and
    /// corrects any core left outside its policy.
    pub fn system_resume(&self) {
        self.clock.resume();
        self.cpufreq.resume();
    }

    /// Takes a temperature sample in °C and applies any resulting cap change.
    pub fn on_temperature_sample(&self, temp_c: i32) -> Option<ThermalCap> {
        let cap = self.thermal.sample(temp_c, self.clock.now())?;
        self.cpufreq.set_thermal_cap(cap.max_khz());
        Some(cap)
    }

    /// Handles the clock refresh timer.
    pub fn handle_refresh_timer(&self) {
        self.clock.refresh();
    }

    /// Handles the hotplug timer.
    pub fn handle_hotplug_timer(&self) -> Result<(), HotplugError> {
        self.hotplug.handle_timer(self.clock.now(), &self.cpufreq)
    }

    /// Handles the cross-core frequency work interrupt on the current core.
    pub fn handle_work_interrupt(&self) {
        self.cpufreq.handle_work_interrupt();
    }
}
