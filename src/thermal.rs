// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Temperature driven cluster frequency cap.

use core::sync::atomic::{AtomicI32, Ordering};
use log::info;
use spin::mutex::SpinMutex;

/// The default temperature in °C above which frequencies are capped.
pub const DEFAULT_TEMP_THRESHOLD: i32 = 65;

/// How often the platform should sample the temperature.
pub const SAMPLING_PERIOD_MS: u64 = 250;

/// How long after boot the platform should take the first sample.
pub const INITIAL_DELAY_MS: u64 = 10_000;

/// How far below the threshold the temperature must fall before the cap is lifted.
const SAFE_DIFF: i32 = 5;

/// The minimum time between capping and lifting the cap.
const MIN_INTERVAL_NS: u64 = 1_000_000_000;

/// Caps for increasing temperatures above the threshold, hottest first: the offset in °C above
/// the threshold at which the cap applies, and the cap in kHz.
const LEVELS: [(i32, u32); 3] = [(16, 960_000), (8, 1_267_200), (4, 1_728_000)];

/// The cap for any temperature above the threshold but below the first level.
const WARM_KHZ: u32 = 2_265_600;

/// The frequency cap imposed for temperature.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThermalCap {
    /// No cap.
    Unthrottled,
    /// Every core is capped at the given frequency in kHz.
    Limited(u32),
}

impl ThermalCap {
    /// Returns the cap in kHz, if any.
    pub fn max_khz(self) -> Option<u32> {
        match self {
            Self::Unthrottled => None,
            Self::Limited(khz) => Some(khz),
        }
    }
}

#[derive(Debug)]
struct ThrottleState {
    cap: ThermalCap,
    last_change_ns: u64,
}

/// Decides the cluster frequency cap from periodic temperature samples.
#[derive(Debug)]
pub struct ThermalThrottle {
    temp_threshold: AtomicI32,
    state: SpinMutex<ThrottleState>,
}

impl ThermalThrottle {
    /// Creates a throttle with the given threshold in °C, initially unthrottled.
    pub fn new(temp_threshold: i32) -> Self {
        Self {
            temp_threshold: AtomicI32::new(temp_threshold),
            state: SpinMutex::new(ThrottleState {
                cap: ThermalCap::Unthrottled,
                last_change_ns: 0,
            }),
        }
    }

    /// Returns the threshold in °C.
    pub fn temp_threshold(&self) -> i32 {
        self.temp_threshold.load(Ordering::Acquire)
    }

    /// Sets the threshold in °C. Applies from the next sample.
    pub fn set_temp_threshold(&self, temp_threshold: i32) {
        self.temp_threshold.store(temp_threshold, Ordering::Release);
    }

    /// Returns the current cap.
    pub fn cap(&self) -> ThermalCap {
        self.state.lock().cap
    }

    /// Takes a temperature sample in °C at monotonic time `now_ns`, returning the new cap if it
    /// changed.
    pub fn sample(&self, temp_c: i32, now_ns: u64) -> Option<ThermalCap> {
        let threshold = self.temp_threshold();
        let mut state = self.state.lock();

        if state.cap != ThermalCap::Unthrottled && temp_c < threshold.saturating_sub(SAFE_DIFF) {
            if now_ns < state.last_change_ns.saturating_add(MIN_INTERVAL_NS) {
                return None;
            }
            info!("{temp_c}°C, lifting frequency cap");
            return Self::change(&mut state, ThermalCap::Unthrottled, now_ns);
        }

        let level = LEVELS
            .iter()
            .find(|&&(offset, _)| temp_c >= threshold.saturating_add(offset))
            .map(|&(_, khz)| khz)
            .or((temp_c > threshold).then_some(WARM_KHZ));
        let khz = level?;
        let changed = Self::change(&mut state, ThermalCap::Limited(khz), now_ns);
        if changed.is_some() {
            info!("{temp_c}°C, capping frequency at {khz} kHz");
        }
        changed
    }

    fn change(state: &mut ThrottleState, cap: ThermalCap, now_ns: u64) -> Option<ThermalCap> {
        if state.cap == cap {
            return None;
        }
        state.cap = cap;
        state.last_change_ns = now_ns;
        Some(cap)
    }
}
