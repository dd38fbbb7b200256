// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Per-core allowed frequency window, independent of the requested target.

use super::FreqError;
use crate::platform::MAX_CORES;
use arrayvec::ArrayVec;
use log::debug;
use spin::mutex::SpinMutex;

/// Passed as either bound to [`FrequencyLimiter::set_limits`] to fall back to the hard bound.
pub const NO_LIMIT: u32 = u32::MAX;

/// The limits of a single core.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PerCoreLimit {
    /// The lowest frequency the table allows, in kHz.
    pub hard_min: u32,
    /// The highest frequency the table allows, in kHz.
    pub hard_max: u32,
    /// The lowest frequency currently allowed, in kHz.
    pub allowed_min: u32,
    /// The highest frequency currently allowed, in kHz.
    pub allowed_max: u32,
    /// Whether the limits have been set up. Frequencies are not clamped until they have.
    pub initialized: bool,
}

/// Holds the allowed `[min, max]` frequency window of every core.
#[derive(Debug)]
pub struct FrequencyLimiter {
    hard_min: u32,
    hard_max: u32,
    limits: SpinMutex<ArrayVec<PerCoreLimit, MAX_CORES>>,
}

impl FrequencyLimiter {
    /// Creates a limiter for `core_count` cores whose hard bounds are `[hard_min, hard_max]`.
    ///
    /// No core is limited until the first call to [`FrequencyLimiter::set_limits`].
    pub fn new(core_count: usize, hard_min: u32, hard_max: u32) -> Result<Self, FreqError> {
        if core_count > MAX_CORES {
            return Err(FreqError::ResourceExhausted);
        }
        let limits = (0..core_count).map(|_| PerCoreLimit::default()).collect();
        Ok(Self {
            hard_min,
            hard_max,
            limits: SpinMutex::new(limits),
        })
    }

    /// Sets the allowed window of the given core.
    ///
    /// Either bound may be [`NO_LIMIT`]; it and any bound outside the hard bounds is replaced by
    /// the corresponding hard bound. This does not change the frequency the core is running at.
    pub fn set_limits(&self, core: usize, min: u32, max: u32) -> Result<(), FreqError> {
        let mut limits = self.limits.lock();
        if core >= limits.len() {
            return Err(FreqError::InvalidCore(core));
        }

        if !limits[core].initialized {
            // The first limit set on any core brings all of them under control.
            for limit in limits.iter_mut() {
                *limit = PerCoreLimit {
                    hard_min: self.hard_min,
                    hard_max: self.hard_max,
                    allowed_min: self.hard_min,
                    allowed_max: self.hard_max,
                    initialized: true,
                };
            }
        }

        let limit = &mut limits[core];
        let (hard_min, hard_max) = (limit.hard_min, limit.hard_max);
        let in_range = |khz: u32| khz != NO_LIMIT && (hard_min..=hard_max).contains(&khz);
        limit.allowed_min = if in_range(min) { min } else { hard_min };
        limit.allowed_max = if in_range(max) { max } else { hard_max };

        debug!(
            "Limiting core {core} to {}..={} kHz",
            limit.allowed_min, limit.allowed_max
        );
        Ok(())
    }

    /// Bounds `requested_khz` to the allowed window of the given core, if it has one.
    pub fn clamp(&self, core: usize, requested_khz: u32) -> u32 {
        let limits = self.limits.lock();
        match limits.get(core) {
            Some(limit) if limit.initialized => {
                let mut khz = requested_khz;
                if khz > limit.allowed_max {
                    khz = limit.allowed_max;
                    debug!("max: limiting core {core} to {khz} kHz");
                }
                if khz < limit.allowed_min {
                    khz = limit.allowed_min;
                    debug!("min: limiting core {core} to {khz} kHz");
                }
                khz
            }
            _ => requested_khz,
        }
    }

    /// Returns the limits of the given core.
    pub fn limits(&self, core: usize) -> Option<PerCoreLimit> {
        self.limits.lock().get(core).copied()
    }

    /// Returns the window the given core's frequency must stay within: its allowed window if
    /// initialized, otherwise the hard bounds.
    pub fn window(&self, core: usize) -> (u32, u32) {
        match self.limits(core) {
            Some(limit) if limit.initialized => (limit.allowed_min, limit.allowed_max),
            _ => (self.hard_min, self.hard_max),
        }
    }
}
