//! Sampler thread and its state machine
//!
//! Two states are tracked under one monitor: the thread lifetime and the
//! sampling mode. The sampling mode only moves along these edges:
//!
//! ```text
//! NotInitialized -> Default
//! Default -> Idle -> DeepIdle
//! Idle | DeepIdle -> Default                (compile pressure or activity)
//! Default | Idle | DeepIdle -> Suspended    (disable_jit)
//! Suspended -> Default                      (enable_jit)
//! any initialized state -> Stopped          (shutdown)
//! ```

use jit_core::{JitError, SamplerConfig};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Sampling interval that effectively parks the thread.
pub const MAX_SAMPLING_FREQUENCY_MS: u64 = i32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerLifetime {
    NotCreated,
    Attached,
    FailedToAttach,
    Initialized,
    Stopping,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingState {
    NotInitialized,
    Default,
    Idle,
    DeepIdle,
    Suspended,
    Stopped,
}

impl SamplingState {
    pub fn can_transition_to(self, next: SamplingState) -> bool {
        use SamplingState::*;
        matches!(
            (self, next),
            (NotInitialized, Default)
                | (Default, Idle)
                | (Idle, DeepIdle)
                | (Idle | DeepIdle, Default)
                | (Default | Idle | DeepIdle, Suspended)
                | (Suspended, Default)
                | (Default | Idle | DeepIdle | Suspended, Stopped)
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            SamplingState::NotInitialized => "NOT_INITIALIZED",
            SamplingState::Default => "DEFAULT",
            SamplingState::Idle => "IDLE",
            SamplingState::DeepIdle => "DEEPIDLE",
            SamplingState::Suspended => "SUSPENDED",
            SamplingState::Stopped => "STOPPED",
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal sampler transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: SamplingState,
    pub to: SamplingState,
}

#[derive(Debug)]
struct SamplerState {
    lifetime: SamplerLifetime,
    sampling: SamplingState,
    frequency_ms: u64,
    last_activity: Instant,
    interrupted: bool,
    stop_requested: bool,
    first_time_compilations_in_interval: u32,
    total_ticks: u64,
}

/// The sampler monitor, shared by the sampler thread, dispatch and the
/// enable/disable control surface.
#[derive(Debug)]
pub struct SamplerMonitor {
    config: SamplerConfig,
    state: Mutex<SamplerState>,
    wake: Condvar,
}

impl SamplerMonitor {
    pub fn new(config: SamplerConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SamplerState {
                lifetime: SamplerLifetime::NotCreated,
                sampling: SamplingState::NotInitialized,
                frequency_ms: config.sampling_frequency_ms,
                last_activity: Instant::now(),
                interrupted: false,
                stop_requested: false,
                first_time_compilations_in_interval: 0,
                total_ticks: 0,
            }),
            config,
            wake: Condvar::new(),
        })
    }

    pub fn lifetime(&self) -> SamplerLifetime {
        self.state.lock().lifetime
    }

    pub fn sampling_state(&self) -> SamplingState {
        self.state.lock().sampling
    }

    pub fn sampling_frequency_ms(&self) -> u64 {
        self.state.lock().frequency_ms
    }

    pub fn ticks(&self) -> u64 {
        self.state.lock().total_ticks
    }

    pub fn first_time_compilations_in_interval(&self) -> u32 {
        self.state.lock().first_time_compilations_in_interval
    }

    fn transition(
        state: &mut SamplerState,
        to: SamplingState,
        frequency_ms: u64,
    ) -> Result<(), IllegalTransition> {
        let from = state.sampling;
        if !from.can_transition_to(to) {
            return Err(IllegalTransition { from, to });
        }
        state.sampling = to;
        state.frequency_ms = frequency_ms;
        debug!(target: "jit::sampler", from = from.name(), to = to.name(), frequency_ms, "sampler state change");
        Ok(())
    }

    /// Move to `to` along a legal edge, using the frequency of the target
    /// state.
    pub fn set_state(&self, to: SamplingState) -> Result<(), IllegalTransition> {
        let frequency = self.frequency_for(to);
        let mut state = self.state.lock();
        Self::transition(&mut state, to, frequency)
    }

    fn frequency_for(&self, state: SamplingState) -> u64 {
        match state {
            SamplingState::Idle => self.config.idle_sampling_frequency_ms,
            SamplingState::DeepIdle => self.config.deep_idle_sampling_frequency_ms,
            SamplingState::Suspended | SamplingState::Stopped => MAX_SAMPLING_FREQUENCY_MS,
            SamplingState::NotInitialized | SamplingState::Default => {
                self.config.sampling_frequency_ms
            }
        }
    }

    /// First step of the sampler thread. A stop that arrived before the
    /// thread ran keeps its lifetime; returns whether sampling should start.
    fn attach(&self) -> bool {
        let mut state = self.state.lock();
        if state.lifetime != SamplerLifetime::NotCreated {
            return false;
        }
        state.lifetime = SamplerLifetime::Attached;
        if state.stop_requested {
            return false;
        }
        state.lifetime = SamplerLifetime::Initialized;
        let frequency = self.config.sampling_frequency_ms;
        let _ = Self::transition(&mut state, SamplingState::Default, frequency);
        state.last_activity = Instant::now();
        true
    }

    pub fn interrupt(&self) {
        self.state.lock().interrupted = true;
        self.wake.notify_all();
    }

    /// Note compile activity so that idle detection restarts.
    pub fn record_activity(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    /// Account a compilation request and leave IDLE/DEEPIDLE once the
    /// interval's first-time compilations reach the threshold. Returns the
    /// state that was left, if any.
    pub fn on_compilation_request(&self, first_time: bool) -> Option<SamplingState> {
        let mut state = self.state.lock();
        if first_time {
            state.first_time_compilations_in_interval += 1;
        }
        state.last_activity = Instant::now();
        let count = state.first_time_compilations_in_interval;
        let leave = match state.sampling {
            SamplingState::DeepIdle => count >= 1,
            SamplingState::Idle => count >= self.config.first_time_compilations_to_exit_idle,
            _ => false,
        };
        if !leave {
            return None;
        }
        let from = state.sampling;
        drop(state);
        self.get_out_of_idle_states(from, "comp req")
            .then_some(from)
    }

    /// Return to DEFAULT from `from` (IDLE or DEEPIDLE), restoring the
    /// regular frequency and waking the thread.
    pub fn get_out_of_idle_states(&self, from: SamplingState, reason: &str) -> bool {
        let mut state = self.state.lock();
        if state.sampling != from
            || !matches!(from, SamplingState::Idle | SamplingState::DeepIdle)
        {
            return false;
        }
        if Self::transition(&mut state, SamplingState::Default, self.config.sampling_frequency_ms)
            .is_err()
        {
            return false;
        }
        state.interrupted = true;
        state.last_activity = Instant::now();
        info!(target: "jit::sampler", from = from.name(), reason, "sampler leaving idle mode");
        drop(state);
        self.wake.notify_all();
        true
    }

    /// Park the sampler. Returns `false` when it was not in a state that can
    /// be suspended.
    pub fn suspend(&self) -> bool {
        let mut state = self.state.lock();
        match Self::transition(&mut state, SamplingState::Suspended, MAX_SAMPLING_FREQUENCY_MS) {
            Ok(()) => {
                info!(target: "jit::sampler", "sampler suspended");
                true
            }
            Err(_) => false,
        }
    }

    /// Leave SUSPENDED: restore the frequency, record activity and interrupt
    /// the parked thread.
    pub fn resume(&self) -> bool {
        let mut state = self.state.lock();
        if state.sampling != SamplingState::Suspended {
            return false;
        }
        if Self::transition(&mut state, SamplingState::Default, self.config.sampling_frequency_ms)
            .is_err()
        {
            return false;
        }
        state.last_activity = Instant::now();
        state.interrupted = true;
        drop(state);
        self.wake.notify_all();
        info!(target: "jit::sampler", "sampler resumed");
        true
    }

    /// Idle detection run after every tick.
    fn update_idle_state(&self, state: &mut SamplerState, now: Instant) {
        let quiet = now.saturating_duration_since(state.last_activity);
        let next = match state.sampling {
            SamplingState::Default
                if quiet >= Duration::from_millis(self.config.wait_time_to_enter_idle_ms) =>
            {
                SamplingState::Idle
            }
            SamplingState::Idle
                if quiet >= Duration::from_millis(self.config.wait_time_to_enter_deep_idle_ms) =>
            {
                SamplingState::DeepIdle
            }
            _ => return,
        };
        let frequency = self.frequency_for(next);
        if Self::transition(state, next, frequency).is_ok() {
            info!(target: "jit::sampler", state = next.name(), quiet_ms = quiet.as_millis() as u64, "sampler entering idle mode");
        }
    }
}

/// Work done by the sampler on every tick.
pub trait SampleSink: Send + Sync {
    fn on_tick(&self);
}

#[derive(Debug)]
pub struct SamplerThread {
    monitor: Arc<SamplerMonitor>,
    thread: Option<JoinHandle<()>>,
}

impl SamplerThread {
    pub fn start(monitor: Arc<SamplerMonitor>, sink: Arc<dyn SampleSink>) -> Result<Self, JitError> {
        let spawned = {
            let monitor = Arc::clone(&monitor);
            std::thread::Builder::new()
                .name("jit-sampler".to_string())
                .spawn(move || sampler_loop(&monitor, sink.as_ref()))
        };
        match spawned {
            Ok(thread) => Ok(Self {
                monitor,
                thread: Some(thread),
            }),
            Err(error) => {
                monitor.state.lock().lifetime = SamplerLifetime::FailedToAttach;
                warn!(target: "jit::sampler", %error, "sampler thread could not be started");
                Err(JitError::SamplerStart(error.to_string()))
            }
        }
    }

    pub fn monitor(&self) -> &Arc<SamplerMonitor> {
        &self.monitor
    }

    /// Request shutdown and block until the thread reports DESTROYED.
    pub fn stop(&mut self) {
        {
            let mut state = self.monitor.state.lock();
            if state.lifetime == SamplerLifetime::Destroyed {
                return;
            }
            state.stop_requested = true;
            state.lifetime = SamplerLifetime::Stopping;
            let frequency = MAX_SAMPLING_FREQUENCY_MS;
            let _ = SamplerMonitor::transition(&mut state, SamplingState::Stopped, frequency);
            state.interrupted = true;
            self.monitor.wake.notify_all();
            while state.lifetime != SamplerLifetime::Destroyed {
                self.monitor.wake.wait(&mut state);
            }
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        info!(target: "jit::sampler", "sampler thread destroyed");
    }
}

impl Drop for SamplerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sampler_loop(monitor: &SamplerMonitor, sink: &dyn SampleSink) {
    if !monitor.attach() {
        let mut state = monitor.state.lock();
        state.lifetime = SamplerLifetime::Destroyed;
        monitor.wake.notify_all();
        return;
    }
    info!(target: "jit::sampler", frequency_ms = monitor.config.sampling_frequency_ms, "sampler thread started");

    loop {
        let mut state = monitor.state.lock();
        if state.stop_requested {
            break;
        }
        let frequency = Duration::from_millis(state.frequency_ms);
        let deadline = Instant::now() + frequency;
        while !state.interrupted && !state.stop_requested {
            if monitor.wake.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.interrupted = false;
        if state.stop_requested {
            break;
        }
        if state.sampling == SamplingState::Suspended {
            continue;
        }
        state.total_ticks += 1;
        drop(state);

        sink.on_tick();

        let mut state = monitor.state.lock();
        monitor.update_idle_state(&mut state, Instant::now());
        state.first_time_compilations_in_interval = 0;
    }

    let mut state = monitor.state.lock();
    state.lifetime = SamplerLifetime::Destroyed;
    monitor.wake.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn config() -> SamplerConfig {
        SamplerConfig {
            sampling_frequency_ms: 2,
            idle_sampling_frequency_ms: 5,
            deep_idle_sampling_frequency_ms: 10,
            wait_time_to_enter_idle_ms: 20,
            wait_time_to_enter_deep_idle_ms: 40,
            first_time_compilations_to_exit_idle: 3,
            ..SamplerConfig::default()
        }
    }

    #[derive(Default)]
    struct CountingSink(AtomicU64);

    impl SampleSink for CountingSink {
        fn on_tick(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_transition_graph() {
        use SamplingState::*;
        assert!(NotInitialized.can_transition_to(Default));
        assert!(!NotInitialized.can_transition_to(Idle));
        assert!(Default.can_transition_to(Idle));
        assert!(!Default.can_transition_to(DeepIdle));
        for from in [Default, Idle, DeepIdle] {
            assert!(from.can_transition_to(Suspended));
        }
        assert!(Suspended.can_transition_to(Default));
        assert!(!Suspended.can_transition_to(Idle));
        assert!(!Stopped.can_transition_to(Default));
    }

    #[test]
    fn test_suspend_resume_restores_frequency() {
        let monitor = SamplerMonitor::new(config());
        monitor.set_state(SamplingState::Default).unwrap();
        assert!(monitor.suspend());
        assert!(!monitor.suspend());
        assert_eq!(monitor.sampling_frequency_ms(), MAX_SAMPLING_FREQUENCY_MS);
        assert!(monitor.resume());
        assert!(!monitor.resume());
        assert_eq!(monitor.sampling_state(), SamplingState::Default);
        assert_eq!(monitor.sampling_frequency_ms(), 2);
    }

    #[test]
    fn test_suspend_from_idle_states() {
        let monitor = SamplerMonitor::new(config());
        monitor.set_state(SamplingState::Default).unwrap();
        monitor.set_state(SamplingState::Idle).unwrap();
        assert!(monitor.suspend());
        assert_eq!(monitor.sampling_state(), SamplingState::Suspended);
        assert!(monitor.resume());
        assert_eq!(monitor.sampling_frequency_ms(), 2);

        monitor.set_state(SamplingState::Idle).unwrap();
        monitor.set_state(SamplingState::DeepIdle).unwrap();
        assert!(monitor.suspend());
        assert_eq!(monitor.sampling_frequency_ms(), MAX_SAMPLING_FREQUENCY_MS);
        assert!(monitor.resume());
        assert_eq!(monitor.sampling_state(), SamplingState::Default);
    }

    #[test]
    fn test_attach_after_stop_keeps_lifetime() {
        let monitor = SamplerMonitor::new(config());
        {
            let mut state = monitor.state.lock();
            state.stop_requested = true;
            state.lifetime = SamplerLifetime::Stopping;
        }
        assert!(!monitor.attach());
        assert_eq!(monitor.lifetime(), SamplerLifetime::Stopping);
        assert_eq!(monitor.sampling_state(), SamplingState::NotInitialized);

        let fresh = SamplerMonitor::new(config());
        assert!(fresh.attach());
        assert_eq!(fresh.lifetime(), SamplerLifetime::Initialized);
        assert_eq!(fresh.sampling_state(), SamplingState::Default);
    }

    #[test]
    fn test_idle_exit_thresholds() {
        let monitor = SamplerMonitor::new(config());
        monitor.set_state(SamplingState::Default).unwrap();
        monitor.set_state(SamplingState::Idle).unwrap();
        assert_eq!(monitor.on_compilation_request(true), None);
        assert_eq!(monitor.on_compilation_request(false), None);
        assert_eq!(monitor.on_compilation_request(true), None);
        assert_eq!(monitor.on_compilation_request(true), Some(SamplingState::Idle));
        assert_eq!(monitor.sampling_state(), SamplingState::Default);

        monitor.set_state(SamplingState::Idle).unwrap();
        monitor.set_state(SamplingState::DeepIdle).unwrap();
        assert_eq!(monitor.sampling_frequency_ms(), 10);
        assert_eq!(monitor.on_compilation_request(true), Some(SamplingState::DeepIdle));
        assert_eq!(monitor.sampling_frequency_ms(), 2);
    }

    #[test]
    fn test_thread_goes_idle_and_stops() {
        let monitor = SamplerMonitor::new(config());
        let sink = Arc::new(CountingSink::default());
        let mut thread = SamplerThread::start(Arc::clone(&monitor), sink.clone()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while monitor.sampling_state() != SamplingState::DeepIdle && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(monitor.sampling_state(), SamplingState::DeepIdle);
        assert!(sink.0.load(Ordering::Relaxed) > 0);
        assert_eq!(monitor.lifetime(), SamplerLifetime::Initialized);

        thread.stop();
        assert_eq!(monitor.lifetime(), SamplerLifetime::Destroyed);
        assert_eq!(monitor.sampling_state(), SamplingState::Stopped);
    }
}
