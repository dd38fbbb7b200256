// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Per-core frequency arbitration.

pub mod bandwidth;
pub mod limits;
pub mod table;
pub mod work;

use crate::platform::{CoreTopology, MAX_CORES};
use arrayvec::ArrayVec;
use bandwidth::BandwidthCoordinator;
use bitflags::bitflags;
use core::{
    hint::spin_loop,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};
use limits::{FrequencyLimiter, NO_LIMIT, PerCoreLimit};
use log::{debug, info, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use spin::mutex::SpinMutex;
use table::{FrequencyRow, FrequencyTable, FrequencyTableEntry};
use thiserror::Error;
use work::{CoreWork, FrequencyChange};

/// The frequency cap used when no policy cap applies.
const UNCAPPED: u32 = u32::MAX;

bitflags! {
    /// Optional platform feature flags
    #[derive(Debug, Eq, PartialEq, Clone, Copy)]
    #[repr(transparent)]
    pub struct CpufreqPlatformFeatures: u32 {
        /// There is a shared auxiliary clock which follows the busiest core.
        const AUX_CLOCK = 1 << 0;
        /// All cores share one clock, so core 0's clock reflects every core.
        const SYNC_CORES = 1 << 1;
    }
}

/// An error from a platform clock primitive.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum ClockRateError {
    /// The clock cannot produce a rate close to the one requested.
    #[error("Rate of {0} kHz is not supported")]
    UnsupportedRate(u32),
    /// The clock controller failed to apply the rate.
    #[error("Clock controller failure")]
    ControllerFailure,
}

/// An error changing the frequency of a core.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum FreqError {
    /// No table entry satisfies the requested target and relation.
    #[error("Invalid target frequency")]
    InvalidTarget,
    /// Frequency changes are suspended.
    #[error("Frequency changes are suspended")]
    DeviceSuspended,
    /// The hardware refused the rate.
    #[error("Hardware rejected the frequency")]
    HardwareRejected,
    /// A fixed capacity limit was exceeded during initialisation.
    #[error("Resource exhausted")]
    ResourceExhausted,
    /// The platform's operating points do not give a usable table.
    #[error("No usable frequency table")]
    InvalidTable,
    /// The target core is offline so cannot run the change.
    #[error("Core is offline")]
    CoreOffline,
    /// The core index is out of range.
    #[error("Invalid core {0}")]
    InvalidCore(usize),
    /// A later change for the same core replaced this one before it ran.
    #[error("Superseded by a later change")]
    Superseded,
}

/// How to round a target frequency to a table entry.
#[derive(Clone, Copy, Debug, Eq, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum Relation {
    /// The lowest entry at or above the target.
    RoundUp = 0,
    /// The highest entry at or below the target.
    RoundDown = 1,
}

/// The core and frequencies of a frequency transition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrequencyTransition {
    /// The core whose frequency is changing.
    pub core: usize,
    /// The frequency before the change, in kHz.
    pub old_khz: u32,
    /// The frequency after the change, in kHz.
    pub new_khz: u32,
}

/// Frequency change notifications.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransitionEvent {
    /// Sent before the hardware rate is changed.
    PreChange(FrequencyTransition),
    /// Sent after the hardware accepted the new rate.
    PostChange(FrequencyTransition),
}

/// Frequency scaling platform interface
///
/// Rates are in kHz throughout.
pub trait CpufreqPlatformInterface: CoreTopology {
    /// Flags for describing optional features implemented by the platform.
    const FEATURES: CpufreqPlatformFeatures;

    /// Returns the rate nearest to `khz` which the given core's clock can produce.
    fn round_rate(&self, core: usize, khz: u32) -> Result<u32, ClockRateError>;

    /// Sets the given core's clock to a rate previously returned by `round_rate`.
    ///
    /// This is only called on the core itself.
    fn set_rate(&self, core: usize, khz: u32) -> Result<(), ClockRateError>;

    /// Returns the current rate of the given core's clock.
    fn get_rate(&self, core: usize) -> u32;

    /// Returns the rate nearest to `khz` which the auxiliary clock can produce.
    ///
    /// Only called if the `AUX_CLOCK` feature is set.
    fn round_aux_rate(&self, khz: u32) -> Result<u32, ClockRateError> {
        Ok(khz)
    }

    /// Sets the auxiliary clock rate.
    ///
    /// Only called if the `AUX_CLOCK` feature is set.
    fn set_aux_rate(&self, _khz: u32) -> Result<(), ClockRateError> {
        Ok(())
    }

    /// Places a bandwidth vote.
    fn vote_bandwidth(&self, bandwidth: u32) -> Result<(), ClockRateError>;

    /// Delivers a frequency change notification.
    fn notify(&self, event: TransitionEvent);

    /// Interrupts the given core so that it calls [`Cpufreq::handle_work_interrupt`].
    fn kick_core(&self, core: usize);
}

/// Notified by the hotplug policy around core power transitions.
pub trait CoreTransitionHandler {
    /// The given core is about to be brought online.
    fn core_up_prepare(&self, core: usize);

    /// Bringing the given core online failed.
    fn core_up_cancelled(&self, core: usize);

    /// The given core has gone offline.
    fn core_dead(&self, core: usize);
}

#[derive(Debug)]
struct CoreState {
    /// Held across resolve, clamp, dispatch and wait.
    suspended: SpinMutex<bool>,
    initialized: AtomicBool,
    cur_khz: AtomicU32,
    work: CoreWork,
}

/// Arbitrates frequency requests for every core.
///
/// Requests for different cores proceed in parallel; requests for the same core are serialised
/// by that core's lock, which is held until the change has run on the core and reported back.
pub struct Cpufreq<P: CpufreqPlatformInterface> {
    platform: P,
    table: FrequencyTable,
    limiter: FrequencyLimiter,
    bandwidth: BandwidthCoordinator,
    cores: ArrayVec<CoreState, MAX_CORES>,
    thermal_cap_khz: AtomicU32,
    max_freq_override_khz: AtomicU32,
    screen_off_max_khz: AtomicU32,
    screen_off_max_enabled: AtomicBool,
    display_blanked: AtomicBool,
}

impl<P: CpufreqPlatformInterface> Cpufreq<P> {
    /// Builds the frequency table from the given rows and sets up per-core state.
    ///
    /// Nothing is changed on the hardware; call [`Cpufreq::init_core`] for each core as it comes
    /// online.
    pub fn new(platform: P, rows: &[FrequencyRow]) -> Result<Self, FreqError> {
        let core_count = platform.core_count();
        if core_count == 0 || core_count > MAX_CORES {
            return Err(FreqError::ResourceExhausted);
        }

        let table = FrequencyTable::build(
            rows,
            |khz| platform.round_rate(0, khz),
            |khz| {
                if P::FEATURES.contains(CpufreqPlatformFeatures::AUX_CLOCK) {
                    platform.round_aux_rate(khz)
                } else {
                    Ok(khz)
                }
            },
        )?;
        let limiter = FrequencyLimiter::new(core_count, table.min_khz(), table.max_khz())?;
        let bandwidth = BandwidthCoordinator::new(core_count)?;
        let cores = (0..core_count)
            .map(|_| CoreState {
                suspended: SpinMutex::new(false),
                initialized: AtomicBool::new(false),
                cur_khz: AtomicU32::new(0),
                work: CoreWork::new(),
            })
            .collect();

        info!(
            "Frequency table: {} entries, {}..={} kHz",
            table.entries().len(),
            table.min_khz(),
            table.max_khz()
        );

        Ok(Self {
            platform,
            table,
            limiter,
            bandwidth,
            cores,
            thermal_cap_khz: AtomicU32::new(UNCAPPED),
            max_freq_override_khz: AtomicU32::new(UNCAPPED),
            screen_off_max_khz: AtomicU32::new(UNCAPPED),
            screen_off_max_enabled: AtomicBool::new(false),
            display_blanked: AtomicBool::new(false),
        })
    }

    /// Returns the frequency table.
    pub fn table(&self) -> &FrequencyTable {
        &self.table
    }

    /// Returns the platform interface.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Sets the frequency of a newly online core to the table entry nearest its current hardware
    /// rate, so that limits and the bandwidth vote apply from the start.
    pub fn init_core(&self, core: usize) -> Result<(), FreqError> {
        let state = self.core_state(core)?;
        let _suspended = state.suspended.lock();

        let live_khz = self.get(core)?;
        let entry = self
            .table
            .resolve(live_khz, Relation::RoundDown)
            .or_else(|_| self.table.resolve(live_khz, Relation::RoundUp))
            .inspect_err(|_| info!("Core {core} at invalid frequency {live_khz} kHz"))?;

        self.commit(core, state, entry)?;
        state.initialized.store(true, Ordering::Release);
        debug!(
            "Core {core} initialised at {live_khz} kHz, switched to {} kHz",
            entry.frequency_khz
        );
        Ok(())
    }

    /// Resolves `target_khz` against the table, clamps it to the limits of the core and commits
    /// it on the core, waiting for the result.
    pub fn request(
        &self,
        core: usize,
        target_khz: u32,
        relation: Relation,
    ) -> Result<(), FreqError> {
        let state = self.core_state(core)?;
        let suspended = state.suspended.lock();
        if *suspended {
            debug!("Core {core} frequency change to {target_khz} kHz while suspended");
            return Err(FreqError::DeviceSuspended);
        }

        let entry = self
            .table
            .resolve(target_khz, relation)
            .inspect_err(|_| warn!("Invalid target frequency {target_khz} kHz"))?;
        debug!(
            "Core {core} target {target_khz} kHz {relation:?} selected {} kHz",
            entry.frequency_khz
        );
        self.commit(core, state, entry)
    }

    /// Finds the table entry nearest to `target_khz` in the direction given by `relation`.
    pub fn resolve(
        &self,
        target_khz: u32,
        relation: Relation,
    ) -> Result<FrequencyTableEntry, FreqError> {
        self.table.resolve(target_khz, relation)
    }

    /// Returns the live hardware rate of the given core, in kHz.
    pub fn get(&self, core: usize) -> Result<u32, FreqError> {
        self.core_state(core)?;
        let clock = if P::FEATURES.contains(CpufreqPlatformFeatures::SYNC_CORES) {
            0
        } else {
            core
        };
        Ok(self.platform.get_rate(clock))
    }

    /// Returns the frequency last committed on the given core, in kHz.
    pub fn current_khz(&self, core: usize) -> Option<u32> {
        self.cores
            .get(core)
            .map(|state| state.cur_khz.load(Ordering::Acquire))
    }

    /// Returns the table position last committed on the given core.
    pub fn current_index(&self, core: usize) -> Option<u32> {
        self.bandwidth.current_index(core)
    }

    /// Returns the table position last applied to the auxiliary clock and bandwidth vote.
    pub fn bandwidth_index(&self) -> Option<u32> {
        self.bandwidth.applied_index()
    }

    /// Sets the allowed window of the given core. See [`FrequencyLimiter::set_limits`].
    pub fn set_limits(&self, core: usize, min_khz: u32, max_khz: u32) -> Result<(), FreqError> {
        self.limiter.set_limits(core, min_khz, max_khz)
    }

    /// Returns the limits of the given core.
    pub fn limits(&self, core: usize) -> Option<PerCoreLimit> {
        self.limiter.limits(core)
    }

    /// Runs the pending frequency change for the current core, if any.
    ///
    /// Called on a core when it receives the interrupt sent by
    /// [`CpufreqPlatformInterface::kick_core`].
    pub fn handle_work_interrupt(&self) {
        let core = self.platform.current_core();
        let Some(state) = self.cores.get(core) else {
            return;
        };
        if let Some((ticket, change)) = state.work.take() {
            let result = self.set_core_frequency(core, state, change);
            state.work.complete(ticket, result);
        }
    }

    /// Rejects frequency changes on every core until [`Cpufreq::resume`].
    pub fn suspend(&self) {
        for state in &self.cores {
            *state.suspended.lock() = true;
        }
    }

    /// Accepts frequency changes again, then corrects any online core whose frequency violates
    /// its policy window because a change was rejected while suspended.
    pub fn resume(&self) {
        for state in &self.cores {
            *state.suspended.lock() = false;
        }
        self.enforce_policy();
    }

    /// Caps every core at `max_khz`, or lifts the cap if `None`, and moves any core above it.
    pub fn set_thermal_cap(&self, max_khz: Option<u32>) {
        self.thermal_cap_khz
            .store(max_khz.unwrap_or(UNCAPPED), Ordering::Release);
        self.enforce_policy();
    }

    /// Returns the thermal cap, if any.
    pub fn thermal_cap(&self) -> Option<u32> {
        Some(self.thermal_cap_khz.load(Ordering::Acquire)).filter(|&khz| khz != UNCAPPED)
    }

    /// Sets the highest frequency any core may run at.
    ///
    /// The value is rounded down to a table entry and becomes the allowed maximum of every core,
    /// resetting allowed minimums to the hard bound. Online cores above it are moved down.
    pub fn set_max_freq_override(&self, max_khz: u32) -> Result<(), FreqError> {
        let entry = self.table.resolve(max_khz, Relation::RoundDown)?;
        self.max_freq_override_khz
            .store(entry.frequency_khz, Ordering::Release);
        for core in 0..self.cores.len() {
            self.limiter
                .set_limits(core, NO_LIMIT, entry.frequency_khz)?;
        }
        info!("Maximum frequency set to {} kHz", entry.frequency_khz);
        self.enforce_policy();
        Ok(())
    }

    /// Returns the maximum frequency override, or the highest table frequency if none is set.
    pub fn max_freq_override(&self) -> u32 {
        match self.max_freq_override_khz.load(Ordering::Acquire) {
            UNCAPPED => self.table.max_khz(),
            khz => khz,
        }
    }

    /// Sets the frequency cap which applies while the display is blanked, rounded down to a table
    /// entry.
    pub fn set_screen_off_max(&self, max_khz: u32) -> Result<(), FreqError> {
        let entry = self.table.resolve(max_khz, Relation::RoundDown)?;
        self.screen_off_max_khz
            .store(entry.frequency_khz, Ordering::Release);
        if self.screen_off_cap_active() {
            self.enforce_policy();
        }
        Ok(())
    }

    /// Returns the frequency cap which applies while the display is blanked.
    pub fn screen_off_max(&self) -> Option<u32> {
        Some(self.screen_off_max_khz.load(Ordering::Acquire)).filter(|&khz| khz != UNCAPPED)
    }

    /// Turns the screen-off frequency cap on or off.
    pub fn set_screen_off_max_enabled(&self, enabled: bool) {
        self.screen_off_max_enabled.store(enabled, Ordering::Release);
        if self.display_blanked.load(Ordering::Acquire) {
            self.enforce_policy();
        }
    }

    /// Applies or lifts the screen-off frequency cap for a display power change.
    pub fn on_display_event(&self, blanked: bool) {
        let was_blanked = self.display_blanked.swap(blanked, Ordering::AcqRel);
        if was_blanked != blanked && self.screen_off_max_enabled.load(Ordering::Acquire) {
            self.enforce_policy();
        }
    }

    fn core_state(&self, core: usize) -> Result<&CoreState, FreqError> {
        self.cores.get(core).ok_or(FreqError::InvalidCore(core))
    }

    fn screen_off_cap_active(&self) -> bool {
        self.screen_off_max_enabled.load(Ordering::Acquire)
            && self.display_blanked.load(Ordering::Acquire)
    }

    /// Returns the cap which applies to every core on top of its own limits.
    fn policy_cap(&self) -> u32 {
        let thermal = self.thermal_cap_khz.load(Ordering::Acquire);
        if self.screen_off_cap_active() {
            thermal.min(self.screen_off_max_khz.load(Ordering::Acquire))
        } else {
            thermal
        }
    }

    /// Clamps a resolved entry and commits it on the core. Must be called with the core's lock
    /// held.
    fn commit(
        &self,
        core: usize,
        state: &CoreState,
        entry: FrequencyTableEntry,
    ) -> Result<(), FreqError> {
        let frequency_khz = self
            .limiter
            .clamp(core, entry.frequency_khz.min(self.policy_cap()));
        let change = FrequencyChange {
            frequency_khz,
            driver_index: entry.driver_index,
        };

        if self.platform.current_core() == core {
            return self.set_core_frequency(core, state, change);
        }
        if !self.platform.is_online(core) {
            return Err(FreqError::CoreOffline);
        }

        let ticket = state.work.submit(change)?;
        self.platform.kick_core(core);
        loop {
            if let Some(result) = state.work.poll(ticket) {
                return result;
            }
            spin_loop();
        }
    }

    /// Changes the hardware rate. Runs on the target core.
    fn set_core_frequency(
        &self,
        core: usize,
        state: &CoreState,
        change: FrequencyChange,
    ) -> Result<(), FreqError> {
        let transition = FrequencyTransition {
            core,
            old_khz: state.cur_khz.load(Ordering::Acquire),
            new_khz: change.frequency_khz,
        };
        self.platform
            .notify(TransitionEvent::PreChange(transition));

        let result = self
            .platform
            .round_rate(core, change.frequency_khz)
            .and_then(|khz| self.platform.set_rate(core, khz));
        if let Err(e) = result {
            warn!(
                "Core {core} failed to switch to {} kHz: {e}",
                change.frequency_khz
            );
            return Err(FreqError::HardwareRejected);
        }

        self.bandwidth.record(core, change.driver_index);
        state.cur_khz.store(change.frequency_khz, Ordering::Release);
        self.bandwidth.update(&self.platform, &self.table, None);
        self.platform
            .notify(TransitionEvent::PostChange(transition));
        Ok(())
    }

    /// Moves every initialised online core whose committed frequency is outside its policy
    /// window back inside it.
    fn enforce_policy(&self) {
        for (core, state) in self.cores.iter().enumerate() {
            if !state.initialized.load(Ordering::Acquire) || !self.platform.is_online(core) {
                continue;
            }

            let (min_khz, allowed_max_khz) = self.limiter.window(core);
            let max_khz = allowed_max_khz.min(self.policy_cap());
            let cur_khz = state.cur_khz.load(Ordering::Acquire);
            let result = if cur_khz > max_khz {
                self.request(core, max_khz, Relation::RoundDown)
            } else if cur_khz < min_khz {
                self.request(core, min_khz, Relation::RoundUp)
            } else {
                continue;
            };

            match result {
                Ok(()) => info!("Frequency violation fixed for core {core}"),
                Err(e) => info!("Current frequency violates policy for core {core}: {e}"),
            }
        }
    }
}

impl<P: CpufreqPlatformInterface> CoreTransitionHandler for Cpufreq<P> {
    fn core_up_prepare(&self, core: usize) {
        if let Some(state) = self.cores.get(core) {
            state.work.revive();
        }
        self.bandwidth.update(&self.platform, &self.table, Some(core));
    }

    fn core_up_cancelled(&self, core: usize) {
        if let Some(state) = self.cores.get(core) {
            state.work.abandon(FreqError::CoreOffline);
        }
        self.bandwidth.update(&self.platform, &self.table, None);
    }

    fn core_dead(&self, core: usize) {
        if let Some(state) = self.cores.get(core) {
            state.work.abandon(FreqError::CoreOffline);
        }
        self.bandwidth.update(&self.platform, &self.table, None);
    }
}
