// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Discrete frequency table built from the platform's operating points.

use super::{ClockRateError, FreqError, Relation};
use arrayvec::ArrayVec;
use log::{info, warn};

/// The maximum number of operating points in a frequency table.
pub const MAX_FREQUENCIES: usize = 32;

/// One operating point as described by the platform.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrequencyRow {
    /// The nominal core frequency in kHz.
    pub cpu_khz: u32,
    /// The auxiliary (L2 or interconnect) clock frequency in kHz to use at this point.
    pub aux_khz: u32,
    /// The bandwidth vote to place at this point.
    pub bandwidth: u32,
}

/// One usable entry of the frequency table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrequencyTableEntry {
    /// The frequency the hardware will actually run at, in kHz.
    pub frequency_khz: u32,
    /// The position of the row this entry was built from.
    pub driver_index: u32,
    /// The rounded auxiliary clock frequency in kHz.
    pub aux_khz: u32,
    /// The bandwidth vote for this entry.
    pub bandwidth: u32,
    /// Whether the entry may be selected. Entries whose auxiliary rate cannot be produced keep
    /// their position but are never selected.
    pub valid: bool,
}

/// A frequency table, in strictly ascending order of frequency.
#[derive(Clone, Debug)]
pub struct FrequencyTable {
    entries: ArrayVec<FrequencyTableEntry, MAX_FREQUENCIES>,
}

impl FrequencyTable {
    /// Builds a table from the given rows, rounding each frequency to what the hardware can
    /// produce.
    ///
    /// The table ends at the first row whose core frequency cannot be rounded, or whose rounded
    /// frequency is not higher than that of the row before it. This allows one list of rows to be
    /// shared between parts in different speed bins.
    pub fn build(
        rows: &[FrequencyRow],
        mut round_cpu: impl FnMut(u32) -> Result<u32, ClockRateError>,
        mut round_aux: impl FnMut(u32) -> Result<u32, ClockRateError>,
    ) -> Result<Self, FreqError> {
        if rows.len() > MAX_FREQUENCIES {
            return Err(FreqError::ResourceExhausted);
        }

        let mut entries = ArrayVec::new();
        let mut previous_khz = None;
        for (position, row) in rows.iter().enumerate() {
            let frequency_khz = match round_cpu(row.cpu_khz) {
                Ok(frequency_khz) => frequency_khz,
                Err(e) => {
                    info!("Frequency table ends before {} kHz: {e}", row.cpu_khz);
                    break;
                }
            };
            if previous_khz.is_some_and(|previous| frequency_khz <= previous) {
                info!(
                    "Frequency table ends before {} kHz, rounded to {frequency_khz} kHz",
                    row.cpu_khz
                );
                break;
            }
            previous_khz = Some(frequency_khz);

            let (aux_khz, valid) = match round_aux(row.aux_khz) {
                Ok(aux_khz) => (aux_khz, true),
                Err(e) => {
                    warn!(
                        "No auxiliary clock rate for {frequency_khz} kHz, entry disabled: {e}"
                    );
                    (row.aux_khz, false)
                }
            };

            entries.push(FrequencyTableEntry {
                frequency_khz,
                // The row count is bounded by `MAX_FREQUENCIES`.
                driver_index: position as u32,
                aux_khz,
                bandwidth: row.bandwidth,
                valid,
            });
        }

        if entries.iter().all(|entry| !entry.valid) {
            return Err(FreqError::InvalidTable);
        }
        Ok(Self { entries })
    }

    /// Returns all entries, including disabled ones.
    pub fn entries(&self) -> &[FrequencyTableEntry] {
        &self.entries
    }

    /// Returns the entry built from the given row position.
    pub fn get(&self, driver_index: u32) -> Option<&FrequencyTableEntry> {
        self.entries.get(usize::try_from(driver_index).ok()?)
    }

    /// Returns the lowest selectable frequency in kHz.
    pub fn min_khz(&self) -> u32 {
        self.valid_entries()
            .map(|entry| entry.frequency_khz)
            .min()
            .unwrap_or_default()
    }

    /// Returns the highest selectable frequency in kHz.
    pub fn max_khz(&self) -> u32 {
        self.valid_entries()
            .map(|entry| entry.frequency_khz)
            .max()
            .unwrap_or_default()
    }

    /// Finds the selectable entry nearest to `target_khz` in the direction given by `relation`.
    pub fn resolve(
        &self,
        target_khz: u32,
        relation: Relation,
    ) -> Result<FrequencyTableEntry, FreqError> {
        let found = match relation {
            Relation::RoundUp => self
                .valid_entries()
                .find(|entry| entry.frequency_khz >= target_khz),
            Relation::RoundDown => self
                .valid_entries()
                .rev()
                .find(|entry| entry.frequency_khz <= target_khz),
        };
        found.copied().ok_or(FreqError::InvalidTarget)
    }

    fn valid_entries(&self) -> impl DoubleEndedIterator<Item = &FrequencyTableEntry> {
        self.entries.iter().filter(|entry| entry.valid)
    }
}
