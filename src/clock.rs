// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Monotonic nanosecond clock extended from a narrow hardware tick counter.

pub mod scaled_math;

use crate::seqcount::SeqCount;
use core::{
    mem::transmute,
    ptr::null_mut,
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering},
};
use log::{debug, info};
use scaled_math::{
    NSEC_PER_SEC, counter_mask, mult_shift, refresh_period_ns, ticks_to_ns, wrap_interval_ns,
};
use spin::mutex::SpinMutex;
use thiserror::Error;

/// The conversion factors are chosen to be accurate for at least this long without a refresh.
const MAX_CONVERSION_SECS: u64 = 3600;

/// Reads a raw hardware tick counter.
pub type ReadTicks = fn() -> u64;

/// An error registering a clock source.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum ClockError {
    /// The proposed source does not have a higher rate than the current one.
    #[error("Clock source at {rate} Hz is not better than the current source")]
    RegistrationRejected {
        /// The rate of the rejected source.
        rate: u64,
    },
    /// The counter width is not in the range 1 to 64 bits.
    #[error("Invalid counter width of {0} bits")]
    InvalidCounterWidth(u32),
}

/// Timer which calls [`MonotonicClock::refresh`] periodically.
pub trait RefreshTimer: Sync {
    /// Arms the timer to fire every `period_ns` nanoseconds, replacing any previous period.
    ///
    /// This must not wait for an in-flight callback.
    fn start(&self, period_ns: u64);

    /// Disarms the timer, waiting for any in-flight callback to return.
    fn cancel(&self);
}

/// Writer side state, only touched with the writer lock held.
#[derive(Debug)]
struct Source {
    rate: u64,
    refresh_period_ns: u64,
    registered: bool,
    running: bool,
}

/// A seamless 64-bit nanosecond time base over a hardware tick counter which may be narrower than
/// 64 bits.
///
/// Reads are lock-free and may be made from any context, including interrupt handlers. Updates to
/// the epoch are serialised by a spin lock and published through a sequence counter, so a reader
/// always sees `epoch_ns` and `epoch_ticks` as a matched pair along with the conversion factors
/// and counter they belong to.
pub struct MonotonicClock<T: RefreshTimer> {
    seq: SeqCount,
    epoch_ns: AtomicU64,
    epoch_ticks: AtomicU64,
    mask: AtomicU64,
    mult: AtomicU32,
    shift: AtomicU32,
    read_ticks: AtomicPtr<()>,
    suspended: AtomicBool,
    source: SpinMutex<Source>,
    fallback: ReadTicks,
    fallback_hz: u64,
    timer: T,
}

impl<T: RefreshTimer> MonotonicClock<T> {
    /// Creates a clock reading the given low resolution 64-bit fallback counter.
    ///
    /// The fallback counter is used, unregistered, until either a better source is registered or
    /// [`MonotonicClock::start`] registers the fallback itself.
    pub fn new(timer: T, fallback: ReadTicks, fallback_hz: u64) -> Self {
        assert_ne!(fallback_hz, 0);
        let mult = u32::try_from(NSEC_PER_SEC / fallback_hz).unwrap_or(u32::MAX);
        Self {
            seq: SeqCount::new(),
            epoch_ns: AtomicU64::new(0),
            epoch_ticks: AtomicU64::new(0),
            mask: AtomicU64::new(u64::MAX),
            mult: AtomicU32::new(mult),
            shift: AtomicU32::new(0),
            read_ticks: AtomicPtr::new(fallback as *mut ()),
            suspended: AtomicBool::new(false),
            source: SpinMutex::new(Source {
                rate: 0,
                refresh_period_ns: 0,
                registered: false,
                running: false,
            }),
            fallback,
            fallback_hz,
            timer,
        }
    }

    /// Returns the current time in nanoseconds.
    ///
    /// While suspended this returns the time at which the clock was suspended.
    pub fn now(&self) -> u64 {
        self.seq.read(|| {
            let epoch_ns = self.epoch_ns.load(Ordering::Relaxed);
            if self.suspended.load(Ordering::Relaxed) {
                epoch_ns
            } else {
                epoch_ns.wrapping_add(self.elapsed_since_epoch())
            }
        })
    }

    /// Registers a new tick counter which is `bits` wide and counts at `rate` Hz.
    ///
    /// The source is only accepted if its rate is higher than that of the current source. The
    /// first source registered starts the clock at zero; later sources continue from the time
    /// reached by the source they replace.
    pub fn register(&self, read: ReadTicks, bits: u32, rate: u64) -> Result<(), ClockError> {
        if bits == 0 || bits > 64 {
            return Err(ClockError::InvalidCounterWidth(bits));
        }

        let mut source = self.source.lock();
        if rate <= source.rate {
            debug!(
                "Ignoring {bits}-bit clock source at {rate} Hz, current source runs at {} Hz",
                source.rate
            );
            return Err(ClockError::RegistrationRejected { rate });
        }

        let (mult, shift) = mult_shift(rate, NSEC_PER_SEC, MAX_CONVERSION_SECS);
        let mask = counter_mask(bits);
        let wrap_ns = wrap_interval_ns(mask, mult, shift);
        let first = !source.registered;

        self.seq.write(|| {
            let epoch_ns = if first {
                0
            } else if self.suspended.load(Ordering::Relaxed) {
                self.epoch_ns.load(Ordering::Relaxed)
            } else {
                self.epoch_ns
                    .load(Ordering::Relaxed)
                    .wrapping_add(self.elapsed_since_epoch())
            };
            self.epoch_ticks.store(read(), Ordering::Relaxed);
            self.epoch_ns.store(epoch_ns, Ordering::Relaxed);
            self.mask.store(mask, Ordering::Relaxed);
            self.mult.store(mult, Ordering::Relaxed);
            self.shift.store(shift, Ordering::Relaxed);
            self.read_ticks.store(read as *mut (), Ordering::Relaxed);
        });

        source.rate = rate;
        source.refresh_period_ns = refresh_period_ns(wrap_ns);
        source.registered = true;
        let restart = source.running.then_some(source.refresh_period_ns);
        drop(source);

        if let Some(period_ns) = restart {
            self.timer.start(period_ns);
        }

        info!(
            "Clock source: {bits} bits at {rate} Hz, resolution {} ns, wraps every {} ns",
            ticks_to_ns(1, mult, shift),
            wrap_ns
        );
        Ok(())
    }

    /// Starts the clock, registering the fallback counter as a full width source if no other source
    /// has been registered, and arms the periodic refresh.
    pub fn start(&self) {
        let registered = self.source.lock().registered;
        if !registered
            && let Err(e) = self.register(self.fallback, 64, self.fallback_hz)
        {
            debug!("Fallback clock source not registered: {e}");
        }

        self.refresh();

        let mut source = self.source.lock();
        source.running = true;
        let period_ns = source.refresh_period_ns;
        drop(source);
        self.timer.start(period_ns);
    }

    /// Publishes a new epoch, so that the tick delta since the epoch stays within the wrap
    /// interval. Called by the refresh timer.
    pub fn refresh(&self) {
        let _source = self.source.lock();
        if self.suspended.load(Ordering::Relaxed) {
            return;
        }
        self.update_epoch();
    }

    /// Freezes the clock for system suspend.
    ///
    /// Waits for any in-flight refresh to finish before taking the final snapshot.
    pub fn suspend(&self) {
        self.timer.cancel();

        let _source = self.source.lock();
        if self.suspended.load(Ordering::Relaxed) {
            return;
        }
        self.seq.write(|| {
            self.advance_epoch();
            self.suspended.store(true, Ordering::Relaxed);
        });
    }

    /// Unfreezes the clock after system resume.
    ///
    /// The epoch is re-baselined on the live counter, so the time spent suspended is not counted.
    pub fn resume(&self) {
        let source = self.source.lock();
        if !self.suspended.load(Ordering::Relaxed) {
            return;
        }
        self.seq.write(|| {
            self.epoch_ticks
                .store(self.read_ticks_fn()(), Ordering::Relaxed);
            self.suspended.store(false, Ordering::Relaxed);
        });
        let restart = source.running.then_some(source.refresh_period_ns);
        drop(source);

        if let Some(period_ns) = restart {
            self.timer.start(period_ns);
        }
    }

    /// Returns the rate in Hz of the registered source, or 0 if none has been registered.
    pub fn rate(&self) -> u64 {
        self.source.lock().rate
    }

    /// Returns the period at which the epoch is refreshed, or 0 if no source has been registered.
    pub fn refresh_period_ns(&self) -> u64 {
        self.source.lock().refresh_period_ns
    }

    /// Returns whether the clock is suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Must be called with the writer lock held.
    fn update_epoch(&self) {
        self.seq.write(|| self.advance_epoch());
    }

    /// Must be called within a write section.
    fn advance_epoch(&self) {
        let read = self.read_ticks_fn();
        let ticks = read();
        let epoch_ticks = self.epoch_ticks.load(Ordering::Relaxed);
        let delta = ticks.wrapping_sub(epoch_ticks) & self.mask.load(Ordering::Relaxed);
        let elapsed = ticks_to_ns(
            delta,
            self.mult.load(Ordering::Relaxed),
            self.shift.load(Ordering::Relaxed),
        );
        self.epoch_ns.fetch_add(elapsed, Ordering::Relaxed);
        self.epoch_ticks.store(ticks, Ordering::Relaxed);
    }

    fn elapsed_since_epoch(&self) -> u64 {
        let ticks = self.read_ticks_fn()();
        let delta = ticks.wrapping_sub(self.epoch_ticks.load(Ordering::Relaxed))
            & self.mask.load(Ordering::Relaxed);
        ticks_to_ns(
            delta,
            self.mult.load(Ordering::Relaxed),
            self.shift.load(Ordering::Relaxed),
        )
    }

    fn read_ticks_fn(&self) -> ReadTicks {
        let read = self.read_ticks.load(Ordering::Relaxed);
        debug_assert_ne!(read, null_mut());
        // SAFETY: `read_ticks` is only ever stored from a valid `ReadTicks` function pointer, and
        // function pointers have the same size and representation as data pointers on all
        // supported targets.
        unsafe { transmute::<*mut (), ReadTicks>(read) }
    }
}
