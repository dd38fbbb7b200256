// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Display driven core hotplug policy.

use crate::{
    cpufreq::CoreTransitionHandler,
    platform::{CoreTopology, PRIMARY_CORE},
};
use arm_psci::ErrorCode;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use log::{debug, info, warn};
use num_enum::TryFromPrimitive;
use spin::mutex::SpinMutex;
use thiserror::Error;

/// The default delay between the display turning off and secondary cores being taken down.
pub const DEFAULT_SUSPEND_DELAY_MS: u32 = 5000;

const NSEC_PER_MSEC: u64 = 1_000_000;

/// Framebuffer blank modes, as delivered by the display driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum BlankMode {
    /// The display is on.
    Unblank = 0,
    /// The screen is blanked but the display is still powered.
    Normal = 1,
    /// Vertical sync is suspended.
    VsyncSuspend = 2,
    /// Horizontal sync is suspended.
    HsyncSuspend = 3,
    /// The display is powered down.
    Powerdown = 4,
}

impl BlankMode {
    /// Returns whether the mode means the display is blanked, or `None` if the mode doesn't
    /// affect the hotplug policy.
    pub fn blanked(self) -> Option<bool> {
        match self {
            Self::Unblank => Some(false),
            Self::Powerdown => Some(true),
            Self::Normal | Self::VsyncSuspend | Self::HsyncSuspend => None,
        }
    }
}

/// An error bringing a core up or down.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum HotplugError {
    /// The platform refused to change the power state of the core.
    #[error("Core {core} refused power state change: {code:?}")]
    CoreRefused {
        /// The core which was refused.
        core: usize,
        /// The error from the power controller.
        code: ErrorCode,
    },
}

/// Hotplug platform interface
pub trait HotplugPlatformInterface: CoreTopology {
    /// Powers up the given core.
    fn cpu_on(&self, core: usize) -> Result<(), ErrorCode>;

    /// Powers down the given core.
    fn cpu_off(&self, core: usize) -> Result<(), ErrorCode>;

    /// Arms the one-shot hotplug timer to call [`HotplugController::handle_timer`] at the given
    /// monotonic time, replacing any previous deadline.
    fn arm_timer(&self, deadline_ns: u64);

    /// Disarms the hotplug timer.
    fn cancel_timer(&self);
}

/// The state of the secondary cores.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HotplugState {
    /// Secondary cores are left up.
    AllCoresUp,
    /// Secondary cores will be taken down at the deadline unless the display comes back on.
    SecondaryCoresScheduledDown {
        /// Monotonic time in nanoseconds.
        deadline_ns: u64,
    },
    /// Secondary cores have been taken down.
    SecondaryCoresDown,
}

/// Takes secondary cores down a while after the display turns off, and brings them back as soon
/// as it turns on.
pub struct HotplugController<P: HotplugPlatformInterface> {
    platform: P,
    enabled: AtomicBool,
    suspend_delay_ms: AtomicU32,
    /// Held while an up or down action runs.
    state: SpinMutex<HotplugState>,
}

impl<P: HotplugPlatformInterface> HotplugController<P> {
    /// Creates a new controller, assuming all cores are up.
    pub fn new(platform: P, enabled: bool, suspend_delay_ms: u32) -> Self {
        Self {
            platform,
            enabled: AtomicBool::new(enabled),
            suspend_delay_ms: AtomicU32::new(suspend_delay_ms),
            state: SpinMutex::new(HotplugState::AllCoresUp),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> HotplugState {
        *self.state.lock()
    }

    /// Returns whether display-off events take cores down.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Turns the policy on or off. While off, display-off events are ignored but display-on events
    /// still bring cores back.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Returns the delay between the display turning off and cores being taken down.
    pub fn suspend_delay_ms(&self) -> u32 {
        self.suspend_delay_ms.load(Ordering::Acquire)
    }

    /// Sets the delay between the display turning off and cores being taken down. Applies from the
    /// next display-off event.
    pub fn set_suspend_delay_ms(&self, delay_ms: u32) {
        self.suspend_delay_ms.store(delay_ms, Ordering::Release);
    }

    /// Handles the display turning off or on at monotonic time `now_ns`.
    pub fn on_display_event(
        &self,
        blanked: bool,
        now_ns: u64,
        handler: &dyn CoreTransitionHandler,
    ) -> Result<(), HotplugError> {
        if blanked {
            self.schedule_down(now_ns);
            Ok(())
        } else {
            self.bring_up(handler)
        }
    }

    /// Runs the scheduled down action if its deadline has passed. Called by the hotplug timer.
    pub fn handle_timer(
        &self,
        now_ns: u64,
        handler: &dyn CoreTransitionHandler,
    ) -> Result<(), HotplugError> {
        let mut state = self.state.lock();
        let HotplugState::SecondaryCoresScheduledDown { deadline_ns } = *state else {
            debug!("Spurious hotplug timer in state {:?}", *state);
            return Ok(());
        };
        if now_ns < deadline_ns {
            self.platform.arm_timer(deadline_ns);
            return Ok(());
        }

        let mut result = Ok(());
        for core in self.secondary_cores() {
            if !self.platform.is_online(core) {
                continue;
            }
            match self.platform.cpu_off(core) {
                Ok(()) => handler.core_dead(core),
                Err(code) => {
                    warn!("Failed to take core {core} down: {code:?}");
                    result = result.and(Err(HotplugError::CoreRefused { core, code }));
                }
            }
        }
        *state = HotplugState::SecondaryCoresDown;
        info!("Secondary cores down");
        result
    }

    fn schedule_down(&self, now_ns: u64) {
        if !self.enabled() {
            debug!("Hotplug disabled, leaving cores up");
            return;
        }

        let mut state = self.state.lock();
        if *state == HotplugState::AllCoresUp {
            let delay_ns = u64::from(self.suspend_delay_ms()) * NSEC_PER_MSEC;
            let deadline_ns = now_ns.saturating_add(delay_ns);
            *state = HotplugState::SecondaryCoresScheduledDown { deadline_ns };
            self.platform.arm_timer(deadline_ns);
            info!("Secondary cores scheduled down in {} ms", self.suspend_delay_ms());
        }
    }

    /// Cancels any pending down action, waiting for one in progress to finish, and brings every
    /// offline secondary core back up.
    fn bring_up(&self, handler: &dyn CoreTransitionHandler) -> Result<(), HotplugError> {
        let mut state = self.state.lock();
        if matches!(*state, HotplugState::SecondaryCoresScheduledDown { .. }) {
            self.platform.cancel_timer();
            debug!("Cancelled scheduled hotplug");
        }
        *state = HotplugState::AllCoresUp;

        let mut result = Ok(());
        for core in self.secondary_cores() {
            if self.platform.is_online(core) {
                continue;
            }
            handler.core_up_prepare(core);
            match self.platform.cpu_on(core) {
                Ok(()) => info!("Core {core} up"),
                Err(code) => {
                    handler.core_up_cancelled(core);
                    warn!("Failed to bring core {core} up: {code:?}");
                    result = result.and(Err(HotplugError::CoreRefused { core, code }));
                }
            }
        }
        result
    }

    fn secondary_cores(&self) -> impl Iterator<Item = usize> {
        (0..self.platform.core_count()).filter(|&core| core != PRIMARY_CORE)
    }
}
