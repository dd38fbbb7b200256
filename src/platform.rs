// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Hooks which a SoC must implement to host the power manager.

#[cfg(test)]
pub mod test;

use crate::{
    clock::RefreshTimer,
    cpufreq::{CpufreqPlatformInterface, table::FrequencyRow},
    hotplug::HotplugPlatformInterface,
    logger::LogSink,
};

/// The maximum number of cores any platform may have.
pub const MAX_CORES: usize = 16;

/// The index of the boot core, which is never taken offline.
pub const PRIMARY_CORE: usize = 0;

/// The view of the core topology shared by every component.
///
/// Core indices are linear, starting from [`PRIMARY_CORE`] and always less than
/// [`CoreTopology::core_count`].
pub trait CoreTopology: Sync {
    /// Returns the number of cores, which must not exceed [`MAX_CORES`].
    fn core_count(&self) -> usize;

    /// Returns the index of the core on which the caller is running.
    fn current_core(&self) -> usize;

    /// Returns whether the given core is currently online.
    fn is_online(&self, core: usize) -> bool;
}

/// The hooks implemented by all platforms.
pub trait Platform {
    /// Platform dependent LogSink implementation type for the logger.
    type LogSinkImpl: LogSink + 'static;

    /// Timer which drives periodic refreshes of the monotonic clock epoch.
    type RefreshTimerImpl: RefreshTimer;

    /// Clock, bandwidth and cross-core signalling primitives used for frequency scaling.
    type CpufreqPlatformImpl: CpufreqPlatformInterface;

    /// Core power primitives and the debounce timer used by the hotplug policy.
    type HotplugPlatformImpl: HotplugPlatformInterface;

    /// The tick rate in Hz of [`Platform::fallback_ticks`].
    const FALLBACK_TICK_HZ: u64;

    /// Returns the sink to which log lines should be written.
    fn log_sink() -> &'static Self::LogSinkImpl;

    /// Reads the low resolution 64-bit tick counter used until a better clock source is
    /// registered.
    fn fallback_ticks() -> u64;

    /// Returns the ordered list of operating points from which the frequency table is built.
    fn frequency_rows(&self) -> &[FrequencyRow];

    /// Creates an instance of the clock refresh timer.
    fn refresh_timer(&self) -> Self::RefreshTimerImpl;

    /// Creates an instance of the frequency scaling platform interface.
    fn cpufreq_platform(&self) -> Self::CpufreqPlatformImpl;

    /// Creates an instance of the hotplug platform interface.
    fn hotplug_platform(&self) -> Self::HotplugPlatformImpl;
}
