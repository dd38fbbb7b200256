// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Sequence counter for data with a single writer and lock-free readers.

use core::{
    hint::spin_loop,
    sync::atomic::{AtomicUsize, Ordering, fence},
};

/// A sequence counter protecting a group of atomics that must be observed as a consistent set.
///
/// The writer makes the count odd before touching the protected data and even again afterwards.
/// Readers take a snapshot of the data between [`SeqCount::read_begin`] and
/// [`SeqCount::read_retry`], and retry if a write overlapped. Readers never block the writer and
/// never take a lock, so they are safe to use from contexts which must not be preempted.
///
/// Writers must be serialised by some other means, e.g. a mutex or by construction.
#[derive(Debug, Default)]
pub struct SeqCount {
    sequence: AtomicUsize,
}

impl SeqCount {
    /// Creates a new sequence counter with no write in progress.
    pub const fn new() -> Self {
        Self {
            sequence: AtomicUsize::new(0),
        }
    }

    /// Starts a read section, waiting for any in-progress write to finish.
    ///
    /// Returns the sequence number to pass to [`SeqCount::read_retry`].
    pub fn read_begin(&self) -> usize {
        loop {
            let sequence = self.sequence.load(Ordering::Acquire);
            if sequence & 1 == 0 {
                return sequence;
            }
            spin_loop();
        }
    }

    /// Returns whether the data read since the matching [`SeqCount::read_begin`] may be
    /// inconsistent and the read must be repeated.
    pub fn read_retry(&self, start: usize) -> bool {
        // Order the protected loads before the re-check of the sequence number.
        fence(Ordering::Acquire);
        self.sequence.load(Ordering::Relaxed) != start
    }

    /// Runs `f` as a write section.
    ///
    /// The caller must guarantee that no other write section on this counter runs concurrently.
    pub fn write<T>(&self, f: impl FnOnce() -> T) -> T {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        debug_assert_eq!(sequence & 1, 0, "Nested or concurrent sequence counter write");
        // Order the odd sequence number before the protected stores.
        fence(Ordering::Release);

        let result = f();

        self.sequence.fetch_add(1, Ordering::Release);
        result
    }

    /// Repeatedly runs `f` until it completes without overlapping a write section, and returns
    /// its result.
    pub fn read<T>(&self, mut f: impl FnMut() -> T) -> T {
        loop {
            let start = self.read_begin();
            let value = f();
            if !self.read_retry(start) {
                return value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicU64},
        },
        thread,
    };

    #[test]
    fn write_leaves_count_even() {
        let seq = SeqCount::new();
        let start = seq.read_begin();
        assert_eq!(seq.write(|| 42), 42);
        assert!(seq.read_retry(start));
        assert!(!seq.read_retry(seq.read_begin()));
    }

    #[test]
    fn readers_see_matched_pairs() {
        struct Pair {
            seq: SeqCount,
            a: AtomicU64,
            b: AtomicU64,
        }

        let pair = Arc::new(Pair {
            seq: SeqCount::new(),
            a: AtomicU64::new(0),
            b: AtomicU64::new(0),
        });
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let pair = pair.clone();
            let done = done.clone();
            thread::spawn(move || {
                for i in 1..=20_000u64 {
                    pair.seq.write(|| {
                        pair.a.store(i, Ordering::Relaxed);
                        pair.b.store(i * 2, Ordering::Relaxed);
                    });
                }
                done.store(true, Ordering::Release);
            })
        };

        while !done.load(Ordering::Acquire) {
            let (a, b) = pair.seq.read(|| {
                (
                    pair.a.load(Ordering::Relaxed),
                    pair.b.load(Ordering::Relaxed),
                )
            });
            assert_eq!(b, a * 2);
        }

        writer.join().unwrap();
    }
}
