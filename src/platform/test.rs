// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use super::{CoreTopology, Platform};
use crate::{
    clock::RefreshTimer,
    cpufreq::{
        ClockRateError, CoreTransitionHandler, CpufreqPlatformFeatures, CpufreqPlatformInterface,
        TransitionEvent, table::FrequencyRow,
    },
    hotplug::HotplugPlatformInterface,
    logger::LogSink,
};
use arm_psci::ErrorCode;
use std::{
    cell::Cell,
    collections::BTreeMap,
    fmt,
    io::{Write, stdout},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
};

thread_local! {
    /// The core which the current thread is pretending to be.
    static CURRENT_CORE: Cell<usize> = const { Cell::new(0) };

    /// Fallback clock ticks, one per millisecond. Each test runs on its own thread so gets its
    /// own time.
    static TICKS: Cell<u64> = const { Cell::new(0) };
}

/// Every core starts out running at this frequency.
const INITIAL_KHZ: u32 = 300_000;

static STD_OUT_SINK: StdOutSink = StdOutSink;

/// A fake platform for unit tests.
///
/// Clones share the same state, so one can be handed to the code under test while the test keeps
/// another to inspect and manipulate the fake hardware.
#[derive(Clone)]
pub struct TestPlatform {
    state: Arc<TestState>,
}

#[derive(Debug)]
struct RateSet {
    core: usize,
    khz: u32,
    on_core: usize,
}

struct TestState {
    online: Vec<AtomicBool>,
    kicks: Vec<AtomicBool>,
    rates: Mutex<Vec<u32>>,
    rate_sets: Mutex<Vec<RateSet>>,
    sets_in_flight: AtomicUsize,
    max_concurrent_sets: AtomicUsize,
    fail_set_rate: AtomicBool,
    fail_aux_rate: AtomicBool,
    fail_bandwidth_vote: AtomicBool,
    aux_rates: Mutex<Vec<u32>>,
    bandwidth_votes: Mutex<Vec<u32>>,
    events: Mutex<Vec<TransitionEvent>>,
    hotplug_deadline: Mutex<Option<u64>>,
    cpu_on_refusals: Mutex<BTreeMap<usize, ErrorCode>>,
    cpu_off_refusals: Mutex<BTreeMap<usize, ErrorCode>>,
    cpu_off_calls: Mutex<Vec<usize>>,
    refresh_timer: FakeRefreshTimer,
}

impl TestPlatform {
    /// The operating points of the fake SoC.
    pub const ROWS: [FrequencyRow; 5] = [
        FrequencyRow {
            cpu_khz: 300_000,
            aux_khz: 150_000,
            bandwidth: 762,
        },
        FrequencyRow {
            cpu_khz: 600_000,
            aux_khz: 300_000,
            bandwidth: 1525,
        },
        FrequencyRow {
            cpu_khz: 900_000,
            aux_khz: 600_000,
            bandwidth: 3051,
        },
        FrequencyRow {
            cpu_khz: 1_267_200,
            aux_khz: 806_400,
            bandwidth: 4066,
        },
        FrequencyRow {
            cpu_khz: 1_728_000,
            aux_khz: 1_036_800,
            bandwidth: 6103,
        },
    ];

    /// Creates a fake SoC with the given number of cores, all online and running at the lowest
    /// frequency.
    pub fn new(core_count: usize) -> Self {
        Self {
            state: Arc::new(TestState {
                online: (0..core_count).map(|_| AtomicBool::new(true)).collect(),
                kicks: (0..core_count).map(|_| AtomicBool::new(false)).collect(),
                rates: Mutex::new(vec![INITIAL_KHZ; core_count]),
                rate_sets: Mutex::default(),
                sets_in_flight: AtomicUsize::new(0),
                max_concurrent_sets: AtomicUsize::new(0),
                fail_set_rate: AtomicBool::new(false),
                fail_aux_rate: AtomicBool::new(false),
                fail_bandwidth_vote: AtomicBool::new(false),
                aux_rates: Mutex::default(),
                bandwidth_votes: Mutex::default(),
                events: Mutex::default(),
                hotplug_deadline: Mutex::default(),
                cpu_on_refusals: Mutex::default(),
                cpu_off_refusals: Mutex::default(),
                cpu_off_calls: Mutex::default(),
                refresh_timer: FakeRefreshTimer::default(),
            }),
        }
    }

    /// Marks the given core online or offline without going through the hotplug policy.
    pub fn set_online(&self, core: usize, online: bool) {
        self.state.online[core].store(online, Ordering::SeqCst);
    }

    /// Returns the indices of the online cores.
    pub fn online_cores(&self) -> Vec<usize> {
        (0..self.state.online.len())
            .filter(|&core| self.is_online(core))
            .collect()
    }

    /// Changes the hardware rate of the given core behind the code under test's back.
    pub fn set_rate_of(&self, core: usize, khz: u32) {
        self.state.rates.lock().unwrap()[core] = khz;
    }

    /// Returns every successful rate set as `(core, khz)`.
    pub fn rate_sets(&self) -> Vec<(usize, u32)> {
        self.state
            .rate_sets
            .lock()
            .unwrap()
            .iter()
            .map(|set| (set.core, set.khz))
            .collect()
    }

    /// Returns the successful rate sets which were made while running on the given core.
    pub fn rate_sets_on_core(&self, on_core: usize) -> Vec<(usize, u32)> {
        self.state
            .rate_sets
            .lock()
            .unwrap()
            .iter()
            .filter(|set| set.on_core == on_core)
            .map(|set| (set.core, set.khz))
            .collect()
    }

    /// Returns the largest number of rate sets which have been in progress at once.
    pub fn max_concurrent_sets(&self) -> usize {
        self.state.max_concurrent_sets.load(Ordering::SeqCst)
    }

    /// Makes every subsequent rate set fail, or succeed again.
    pub fn fail_set_rate(&self, fail: bool) {
        self.state.fail_set_rate.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent auxiliary rate set fail, or succeed again.
    pub fn fail_aux_rate(&self, fail: bool) {
        self.state.fail_aux_rate.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent bandwidth vote fail, or succeed again.
    pub fn fail_bandwidth_vote(&self, fail: bool) {
        self.state.fail_bandwidth_vote.store(fail, Ordering::SeqCst);
    }

    /// Returns every successfully set auxiliary rate.
    pub fn aux_rates(&self) -> Vec<u32> {
        self.state.aux_rates.lock().unwrap().clone()
    }

    /// Returns every successfully placed bandwidth vote.
    pub fn bandwidth_votes(&self) -> Vec<u32> {
        self.state.bandwidth_votes.lock().unwrap().clone()
    }

    /// Returns every frequency change notification sent.
    pub fn events(&self) -> Vec<TransitionEvent> {
        self.state.events.lock().unwrap().clone()
    }

    /// Returns the deadline the hotplug timer is armed for, if any.
    pub fn hotplug_deadline(&self) -> Option<u64> {
        *self.state.hotplug_deadline.lock().unwrap()
    }

    /// Makes the next attempt to bring the given core up fail.
    pub fn refuse_cpu_on(&self, core: usize, code: ErrorCode) {
        self.state.cpu_on_refusals.lock().unwrap().insert(core, code);
    }

    /// Makes the next attempt to take the given core down fail.
    pub fn refuse_cpu_off(&self, core: usize, code: ErrorCode) {
        self.state
            .cpu_off_refusals
            .lock()
            .unwrap()
            .insert(core, code);
    }

    /// Returns the cores for which `cpu_off` has been called.
    pub fn cpu_off_calls(&self) -> Vec<usize> {
        self.state.cpu_off_calls.lock().unwrap().clone()
    }

    /// Moves the fallback clock of the current thread forward.
    pub fn advance_time_ms(&self, ms: u64) {
        TICKS.set(TICKS.get() + ms);
    }
}

impl Platform for TestPlatform {
    type LogSinkImpl = StdOutSink;
    type RefreshTimerImpl = FakeRefreshTimer;
    type CpufreqPlatformImpl = TestPlatform;
    type HotplugPlatformImpl = TestPlatform;

    const FALLBACK_TICK_HZ: u64 = 1000;

    fn log_sink() -> &'static StdOutSink {
        &STD_OUT_SINK
    }

    fn fallback_ticks() -> u64 {
        TICKS.get()
    }

    fn frequency_rows(&self) -> &[FrequencyRow] {
        &Self::ROWS
    }

    fn refresh_timer(&self) -> FakeRefreshTimer {
        self.state.refresh_timer.clone()
    }

    fn cpufreq_platform(&self) -> TestPlatform {
        self.clone()
    }

    fn hotplug_platform(&self) -> TestPlatform {
        self.clone()
    }
}

impl CoreTopology for TestPlatform {
    fn core_count(&self) -> usize {
        self.state.online.len()
    }

    fn current_core(&self) -> usize {
        CURRENT_CORE.get()
    }

    fn is_online(&self, core: usize) -> bool {
        self.state
            .online
            .get(core)
            .is_some_and(|online| online.load(Ordering::SeqCst))
    }
}

impl CpufreqPlatformInterface for TestPlatform {
    const FEATURES: CpufreqPlatformFeatures = CpufreqPlatformFeatures::AUX_CLOCK;

    fn round_rate(&self, _core: usize, khz: u32) -> Result<u32, ClockRateError> {
        Ok(khz)
    }

    fn set_rate(&self, core: usize, khz: u32) -> Result<(), ClockRateError> {
        let in_flight = self.state.sets_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .max_concurrent_sets
            .fetch_max(in_flight, Ordering::SeqCst);

        let result = if self.state.fail_set_rate.load(Ordering::SeqCst) {
            Err(ClockRateError::ControllerFailure)
        } else {
            self.state.rates.lock().unwrap()[core] = khz;
            self.state.rate_sets.lock().unwrap().push(RateSet {
                core,
                khz,
                on_core: self.current_core(),
            });
            Ok(())
        };

        // Give any racing set a chance to overlap.
        thread::yield_now();
        self.state.sets_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn get_rate(&self, core: usize) -> u32 {
        self.state.rates.lock().unwrap()[core]
    }

    fn set_aux_rate(&self, khz: u32) -> Result<(), ClockRateError> {
        if self.state.fail_aux_rate.load(Ordering::SeqCst) {
            return Err(ClockRateError::ControllerFailure);
        }
        self.state.aux_rates.lock().unwrap().push(khz);
        Ok(())
    }

    fn vote_bandwidth(&self, bandwidth: u32) -> Result<(), ClockRateError> {
        if self.state.fail_bandwidth_vote.load(Ordering::SeqCst) {
            return Err(ClockRateError::ControllerFailure);
        }
        self.state.bandwidth_votes.lock().unwrap().push(bandwidth);
        Ok(())
    }

    fn notify(&self, event: TransitionEvent) {
        self.state.events.lock().unwrap().push(event);
    }

    fn kick_core(&self, core: usize) {
        self.state.kicks[core].store(true, Ordering::SeqCst);
    }
}

impl HotplugPlatformInterface for TestPlatform {
    fn cpu_on(&self, core: usize) -> Result<(), ErrorCode> {
        if let Some(code) = self.state.cpu_on_refusals.lock().unwrap().remove(&core) {
            return Err(code);
        }
        self.set_online(core, true);
        Ok(())
    }

    fn cpu_off(&self, core: usize) -> Result<(), ErrorCode> {
        self.state.cpu_off_calls.lock().unwrap().push(core);
        if let Some(code) = self.state.cpu_off_refusals.lock().unwrap().remove(&core) {
            return Err(code);
        }
        self.set_online(core, false);
        Ok(())
    }

    fn arm_timer(&self, deadline_ns: u64) {
        *self.state.hotplug_deadline.lock().unwrap() = Some(deadline_ns);
    }

    fn cancel_timer(&self) {
        *self.state.hotplug_deadline.lock().unwrap() = None;
    }
}

/// A refresh timer which just records how it was last armed.
#[derive(Clone, Debug, Default)]
pub struct FakeRefreshTimer {
    state: Arc<Mutex<FakeRefreshTimerState>>,
}

#[derive(Debug, Default)]
struct FakeRefreshTimerState {
    period_ns: Option<u64>,
    cancel_count: usize,
}

impl FakeRefreshTimer {
    /// Returns the period the timer is armed with, if it is armed.
    pub fn period_ns(&self) -> Option<u64> {
        self.state.lock().unwrap().period_ns
    }

    /// Returns how many times the timer has been cancelled.
    pub fn cancel_count(&self) -> usize {
        self.state.lock().unwrap().cancel_count
    }
}

impl RefreshTimer for FakeRefreshTimer {
    fn start(&self, period_ns: u64) {
        self.state.lock().unwrap().period_ns = Some(period_ns);
    }

    fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.period_ns = None;
        state.cancel_count += 1;
    }
}

/// Records the core transitions it is told about.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    up_prepared: Mutex<Vec<usize>>,
    up_cancelled: Mutex<Vec<usize>>,
    dead: Mutex<Vec<usize>>,
}

impl RecordingHandler {
    pub fn up_prepared(&self) -> Vec<usize> {
        self.up_prepared.lock().unwrap().clone()
    }

    pub fn up_cancelled(&self) -> Vec<usize> {
        self.up_cancelled.lock().unwrap().clone()
    }

    pub fn dead(&self) -> Vec<usize> {
        self.dead.lock().unwrap().clone()
    }
}

impl CoreTransitionHandler for RecordingHandler {
    fn core_up_prepare(&self, core: usize) {
        self.up_prepared.lock().unwrap().push(core);
    }

    fn core_up_cancelled(&self, core: usize) {
        self.up_cancelled.lock().unwrap().push(core);
    }

    fn core_dead(&self, core: usize) {
        self.dead.lock().unwrap().push(core);
    }
}

/// Emulates every secondary core of a [`TestPlatform`] with a thread, which calls the given
/// function whenever the core is kicked. The current thread stays core 0.
///
/// The threads are stopped when this is dropped.
pub struct CoreThreads {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl CoreThreads {
    pub fn spawn(platform: &TestPlatform, on_kick: impl Fn() + Send + Sync + 'static) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let on_kick = Arc::new(on_kick);
        let threads = (1..platform.core_count())
            .map(|core| {
                let platform = platform.clone();
                let stop = stop.clone();
                let on_kick = on_kick.clone();
                thread::spawn(move || {
                    CURRENT_CORE.set(core);
                    while !stop.load(Ordering::SeqCst) {
                        if platform.state.kicks[core].swap(false, Ordering::SeqCst) {
                            on_kick();
                        } else {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        Self { stop, threads }
    }
}

impl Drop for CoreThreads {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for thread in self.threads.drain(..) {
            thread.join().unwrap();
        }
    }
}

/// A log sink which writes to standard output.
pub struct StdOutSink;

impl LogSink for StdOutSink {
    fn write_fmt(&self, args: fmt::Arguments) {
        stdout().write_fmt(args).unwrap();
    }

    fn flush(&self) {
        stdout().flush().unwrap();
    }
}
