// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Frequency changes deferred to the core they apply to.

use super::FreqError;
use log::debug;
use spin::mutex::SpinMutex;

/// A frequency change to be committed by the target core itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrequencyChange {
    /// The frequency to set, in kHz, after clamping.
    pub frequency_khz: u32,
    /// The table position the change was resolved to.
    pub driver_index: u32,
}

/// Identifies one submission to a [`CoreWork`] slot.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Ticket(u64);

#[derive(Debug, Default)]
struct Slot {
    next_ticket: u64,
    pending: Option<(Ticket, FrequencyChange)>,
    running: Option<Ticket>,
    done: Option<(Ticket, Result<(), FreqError>)>,
    offline: bool,
}

/// A single-slot work queue for one core.
///
/// Only the latest submission is kept: submitting again before the core has taken the previous
/// change supersedes it. The submitter polls for the result of its own ticket.
#[derive(Debug, Default)]
pub struct CoreWork {
    slot: SpinMutex<Slot>,
}

impl CoreWork {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a change, superseding any change which has not been taken yet.
    ///
    /// Fails with [`FreqError::CoreOffline`] between [`CoreWork::abandon`] and
    /// [`CoreWork::revive`].
    pub fn submit(&self, change: FrequencyChange) -> Result<Ticket, FreqError> {
        let mut slot = self.slot.lock();
        if slot.offline {
            return Err(FreqError::CoreOffline);
        }
        let ticket = Ticket(slot.next_ticket);
        slot.next_ticket += 1;
        if let Some((superseded, old)) = slot.pending.replace((ticket, change)) {
            debug!("{superseded:?} for {} kHz superseded", old.frequency_khz);
        }
        Ok(ticket)
    }

    /// Takes the pending change, if any, to run it. Called on the target core.
    pub fn take(&self) -> Option<(Ticket, FrequencyChange)> {
        let mut slot = self.slot.lock();
        let (ticket, change) = slot.pending.take()?;
        slot.running = Some(ticket);
        Some((ticket, change))
    }

    /// Records the result of a change taken with [`CoreWork::take`].
    pub fn complete(&self, ticket: Ticket, result: Result<(), FreqError>) {
        let mut slot = self.slot.lock();
        if slot.running == Some(ticket) {
            slot.running = None;
        }
        slot.done = Some((ticket, result));
    }

    /// Fails the pending change, if any, with the given error, and refuses further submissions
    /// until [`CoreWork::revive`]. Used when the target core goes offline.
    pub fn abandon(&self, error: FreqError) {
        let mut slot = self.slot.lock();
        slot.offline = true;
        if let Some((ticket, _)) = slot.pending.take() {
            slot.done = Some((ticket, Err(error)));
        }
    }

    /// Accepts submissions again once the target core is coming back online.
    pub fn revive(&self) {
        self.slot.lock().offline = false;
    }

    /// Returns the result for the given ticket once it is known.
    ///
    /// A ticket which is neither pending, running nor done was superseded.
    pub fn poll(&self, ticket: Ticket) -> Option<Result<(), FreqError>> {
        let mut slot = self.slot.lock();
        let done = slot.done;
        if let Some((done_ticket, result)) = done
            && done_ticket == ticket
        {
            slot.done = None;
            return Some(result);
        }

        let pending = slot.pending.is_some_and(|(pending, _)| pending == ticket);
        if pending || slot.running == Some(ticket) {
            None
        } else {
            Some(Err(FreqError::Superseded))
        }
    }
}
