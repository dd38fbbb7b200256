// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Shared auxiliary clock and bandwidth vote, following the busiest online core.

use super::{CpufreqPlatformFeatures, CpufreqPlatformInterface, FreqError, table::FrequencyTable};
use crate::platform::MAX_CORES;
use arrayvec::ArrayVec;
use core::sync::atomic::{AtomicU32, Ordering};
use log::{error, trace};
use spin::mutex::SpinMutex;

/// Picks the shared auxiliary clock rate and bandwidth vote from the busiest online core.
///
/// The per-core table positions are plain atomics, written by each core after it commits a
/// frequency, so an update never needs any per-core lock.
#[derive(Debug)]
pub struct BandwidthCoordinator {
    current_index: ArrayVec<AtomicU32, MAX_CORES>,
    /// The table position last used for the auxiliary clock and bandwidth vote.
    applied_index: SpinMutex<Option<u32>>,
}

impl BandwidthCoordinator {
    /// Creates a coordinator for `core_count` cores, all at table position 0.
    pub fn new(core_count: usize) -> Result<Self, FreqError> {
        if core_count > MAX_CORES {
            return Err(FreqError::ResourceExhausted);
        }
        Ok(Self {
            current_index: (0..core_count).map(|_| AtomicU32::new(0)).collect(),
            applied_index: SpinMutex::new(None),
        })
    }

    /// Records the table position last committed on the given core.
    pub fn record(&self, core: usize, driver_index: u32) {
        if let Some(index) = self.current_index.get(core) {
            index.store(driver_index, Ordering::Release);
        }
    }

    /// Returns the table position last committed on the given core.
    pub fn current_index(&self, core: usize) -> Option<u32> {
        self.current_index
            .get(core)
            .map(|index| index.load(Ordering::Acquire))
    }

    /// Returns the table position last applied to the auxiliary clock and bandwidth vote.
    pub fn applied_index(&self) -> Option<u32> {
        *self.applied_index.lock()
    }

    /// Re-aggregates the highest table position across online cores, also counting `also_core`
    /// if given even if it is not online yet, and applies it.
    ///
    /// Failures are logged and otherwise ignored; they never affect the frequency already
    /// committed on any core.
    pub fn update<P: CpufreqPlatformInterface>(
        &self,
        platform: &P,
        table: &FrequencyTable,
        also_core: Option<usize>,
    ) {
        let mut applied_index = self.applied_index.lock();

        let seed = also_core
            .and_then(|core| self.current_index(core))
            .unwrap_or_default();
        let index = (0..self.current_index.len())
            .filter(|&core| platform.is_online(core))
            .filter_map(|core| self.current_index(core))
            .fold(seed, u32::max);

        let Some(entry) = table.get(index) else {
            error!("No frequency table entry at position {index}");
            return;
        };

        if P::FEATURES.contains(CpufreqPlatformFeatures::AUX_CLOCK)
            && let Err(e) = platform.set_aux_rate(entry.aux_khz)
        {
            error!("Error setting auxiliary clock rate to {} kHz: {e}", entry.aux_khz);
            return;
        }

        *applied_index = Some(index);
        trace!("Bandwidth vote for table position {index}: {}", entry.bandwidth);
        if let Err(e) = platform.vote_bandwidth(entry.bandwidth) {
            error!("Unable to update bandwidth vote: {e}");
        }
    }
}
