//! The pipeline state machine.
//!
//! [`Orchestrator`] owns the single [`PipelineState`], the stage flags and
//! the three feedback managers.  Every public operation takes the state lock
//! once and works on `&mut PipelineState` through private helpers, so a
//! transition (cleanup, commit, hardware update) is atomic with respect to
//! every other caller.
//!
//! ```text
//!  input handler ─┐                         ┌─▶ SoundWorker
//!  driver thread ─┼─▶ Orchestrator (lock) ──┼─▶ LedBlinkManager
//!  monitor thread ┘        │                └─▶ ActivityIndicatorManager
//!                          ▼
//!                 StageFlags (lock-free) ◀── status readers
//! ```
//!
//! State callbacks are collected while the lock is held and run after it is
//! released, so a callback may call back into the orchestrator.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::feedback::{
    ActivityIndicatorManager, ActivityStatus, Cue, LedBlinkManager, ProgressStage, SoundWorker,
};
use crate::sync::{join_bounded, lock, StopSignal};

use super::process::{kill_by_name, terminate_gracefully, ManagedProcess};
use super::state::{PipelineState, Stage, StageFlags, StageSnapshot, SystemState};

/// Key under which the current recording or playback process is registered.
pub const AUDIO_PROCESS: &str = "audio_process";

const MONITOR_JOIN: Duration = Duration::from_secs(1);

/// Called with `(old, new)` after a transition into the registered state.
pub type StateCallback = Arc<dyn Fn(SystemState, SystemState) + Send + Sync>;

// ---------------------------------------------------------------------------
// InputType
// ---------------------------------------------------------------------------

/// What kind of input starts a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    /// Record and transcribe first.
    Voice,
    /// Text is already available; go straight to the language model.
    Text,
}

impl InputType {
    fn entry_state(self) -> SystemState {
        match self {
            InputType::Voice => SystemState::Listening,
            InputType::Text => SystemState::Contemplating,
        }
    }
}

impl FromStr for InputType {
    type Err = std::convert::Infallible;

    /// `"voice"` selects [`InputType::Voice`]; anything else is text.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.trim().eq_ignore_ascii_case("voice") {
            InputType::Voice
        } else {
            InputType::Text
        })
    }
}

// ---------------------------------------------------------------------------
// Configuration and feedback wiring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub monitor_interval: Duration,
    /// States absent from the table never time out.  Empty disables the
    /// monitor thread entirely.
    pub state_timeouts: HashMap<SystemState, Duration>,
    /// Wait between terminate and kill for registered processes.
    pub process_grace: Duration,
    /// Pause after interrupting a previous cycle in `start_pipeline_flow`.
    pub settle: Duration,
    /// Run `pkill -f aplay|arecord` during force cleanup.
    pub kill_strays: bool,
}

impl From<&PipelineConfig> for OrchestratorConfig {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            monitor_interval: Duration::from_secs(cfg.monitor_interval_secs),
            state_timeouts: cfg.state_timeouts(),
            process_grace: Duration::from_millis(cfg.process_grace_ms),
            settle: Duration::from_millis(cfg.settle_ms),
            kill_strays: true,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

/// The feedback managers the orchestrator drives.
pub struct Feedback {
    /// `None` when sound is disabled or the buzzer could not be opened.
    pub sound: Option<Arc<SoundWorker>>,
    pub leds: Arc<LedBlinkManager>,
    pub activity: Arc<ActivityIndicatorManager>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    state: Mutex<PipelineState>,
    flags: StageFlags,
    feedback: Feedback,
    config: OrchestratorConfig,
    callbacks: Mutex<HashMap<SystemState, Vec<StateCallback>>>,
    monitor_stop: Arc<StopSignal>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Transitions committed during one locked operation.
type Fired = Vec<(SystemState, SystemState)>;

impl Orchestrator {
    /// Build the orchestrator and, if any state has a timeout, start the
    /// stuck-state monitor.
    pub fn new(feedback: Feedback, config: OrchestratorConfig) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            state: Mutex::new(PipelineState::new()),
            flags: StageFlags::default(),
            feedback,
            config,
            callbacks: Mutex::new(HashMap::new()),
            monitor_stop: Arc::new(StopSignal::new()),
            monitor: Mutex::new(None),
        });

        if orchestrator.config.state_timeouts.is_empty()
            || orchestrator.config.monitor_interval.is_zero()
        {
            log::info!("orchestrator: stuck-state monitor disabled");
        } else {
            Self::spawn_monitor(&orchestrator);
        }
        orchestrator
    }

    pub fn feedback(&self) -> &Feedback {
        &self.feedback
    }

    // ---- Cycle control ---

    /// Begin a new cycle, tearing down whatever the previous one left behind.
    ///
    /// The generation number is taken before the settle pause, so the old
    /// cycle's driver is already stale while the lock is released.  If
    /// another start lands during the pause, the later one wins and the
    /// returned cycle never runs.
    pub fn start_pipeline_flow(&self, input: InputType) -> u64 {
        let mut fired = Fired::new();
        let (cycle, interrupted) = {
            let mut st = lock(&self.state);
            st.cycle += 1;
            let busy = st.current_state != SystemState::Idle;
            if busy {
                log::info!(
                    "orchestrator: force stopping previous cycle in {}",
                    st.current_state
                );
                st.force_cleanup_needed = true;
                self.transition_locked(&mut st, SystemState::Interrupted, true, &mut fired);
            }
            (st.cycle, busy)
        };
        if interrupted {
            self.run_callbacks(std::mem::take(&mut fired));
            std::thread::sleep(self.config.settle);
        }

        let started = {
            let mut st = lock(&self.state);
            if st.cycle == cycle {
                self.flags.clear_complete();
                self.transition_locked(&mut st, input.entry_state(), false, &mut fired);
            }
            st.cycle == cycle
        };
        self.run_callbacks(fired);
        if started {
            log::debug!("orchestrator: cycle {cycle} started ({input:?})");
        } else {
            log::info!("orchestrator: cycle {cycle} superseded before it started");
        }
        cycle
    }

    /// Move to the next state in the fixed progression.
    ///
    /// A pending interruption wins over progression.  `Idle` and
    /// `Interrupted` have no successor, so advancing from them does nothing.
    /// Returns the state after the call.
    pub fn advance_pipeline_flow(&self) -> SystemState {
        let mut fired = Fired::new();
        let now = {
            let mut st = lock(&self.state);
            self.advance_locked(&mut st, &mut fired);
            st.current_state
        };
        self.run_callbacks(fired);
        now
    }

    /// Like [`advance_pipeline_flow`](Self::advance_pipeline_flow), but only
    /// if `cycle` is still the current cycle.  `None` when it is stale.
    pub fn advance_cycle(&self, cycle: u64) -> Option<SystemState> {
        let mut fired = Fired::new();
        let now = {
            let mut st = lock(&self.state);
            if st.cycle != cycle {
                log::debug!(
                    "orchestrator: ignoring advance from stale cycle {cycle} (current {})",
                    st.cycle
                );
                return None;
            }
            self.advance_locked(&mut st, &mut fired);
            st.current_state
        };
        self.run_callbacks(fired);
        Some(now)
    }

    /// Return to `Idle` unconditionally.
    pub fn complete_pipeline_flow(&self) {
        self.transition_to_state(SystemState::Idle, false);
    }

    /// Return to `Idle` only if `cycle` is current.  `false` when stale.
    pub fn complete_cycle(&self, cycle: u64) -> bool {
        let mut fired = Fired::new();
        {
            let mut st = lock(&self.state);
            if st.cycle != cycle {
                return false;
            }
            self.transition_locked(&mut st, SystemState::Idle, false, &mut fired);
        }
        self.run_callbacks(fired);
        true
    }

    /// Abort the running cycle.
    ///
    /// The transition to `Interrupted` releases what the current state holds
    /// before returning.  Returns `false` if there was nothing to interrupt.
    pub fn request_interruption(&self) -> bool {
        let mut fired = Fired::new();
        {
            let mut st = lock(&self.state);
            let current = st.current_state;
            if matches!(current, SystemState::Idle | SystemState::Interrupted) {
                return false;
            }
            log::info!("orchestrator: interruption requested during {current}");
            st.interrupt_requested = true;
            self.transition_locked(&mut st, SystemState::Interrupted, false, &mut fired);
        }
        self.run_callbacks(fired);
        true
    }

    /// Force cleanup and return to `Idle` from anywhere.  Returns the state
    /// that was left.
    pub fn force_reset_to_idle(&self) -> SystemState {
        let mut fired = Fired::new();
        let previous = {
            let mut st = lock(&self.state);
            let previous = st.current_state;
            st.force_cleanup_needed = true;
            self.transition_locked(&mut st, SystemState::Idle, true, &mut fired);
            previous
        };
        self.run_callbacks(fired);
        log::info!("orchestrator: forced reset to idle from {previous}");
        previous
    }

    /// Move to `new_state`.  A no-op when already there unless `force`.
    pub fn transition_to_state(&self, new_state: SystemState, force: bool) {
        let mut fired = Fired::new();
        {
            let mut st = lock(&self.state);
            self.transition_locked(&mut st, new_state, force, &mut fired);
        }
        self.run_callbacks(fired);
    }

    // ---- Queries ---

    pub fn get_current_state(&self) -> SystemState {
        lock(&self.state).current_state
    }

    pub fn previous_state(&self) -> SystemState {
        lock(&self.state).previous_state
    }

    /// How long the current state has been held.
    pub fn time_in_state(&self) -> Duration {
        lock(&self.state).state_start_time.elapsed()
    }

    pub fn current_cycle(&self) -> u64 {
        lock(&self.state).cycle
    }

    /// Current cycle and state, read under one lock.
    pub fn cycle_state(&self) -> (u64, SystemState) {
        let st = lock(&self.state);
        (st.cycle, st.current_state)
    }

    pub fn is_system_busy(&self) -> bool {
        self.get_current_state().is_busy()
    }

    /// Button input is accepted only from `Idle`, `Interrupted` or
    /// `Listening`.
    pub fn should_block_button_actions(&self) -> bool {
        !self.get_current_state().accepts_input()
    }

    pub fn should_block_recording(&self) -> bool {
        !self.get_current_state().accepts_input()
    }

    pub fn interrupt_requested(&self) -> bool {
        lock(&self.state).interrupt_requested
    }

    /// Lock-free copy of the stage flags.
    pub fn stage_flags(&self) -> StageSnapshot {
        self.flags.snapshot()
    }

    pub fn active_process_count(&self) -> usize {
        lock(&self.state).active_processes.len()
    }

    // ---- Stage bookkeeping ---

    /// Record that `stage` finished for `cycle`.  Ignored, returning `false`,
    /// once that cycle has been interrupted or replaced.
    pub fn mark_stage_complete(&self, cycle: u64, stage: Stage) -> bool {
        let st = lock(&self.state);
        let current = st.cycle == cycle && st.current_state.is_busy();
        if current {
            self.flags.mark_complete(stage);
        }
        current
    }

    /// Register the current recording or playback process so cleanup can
    /// stop it.  Replaces (and stops) any process already registered.
    pub fn register_audio_process(&self, handle: Arc<dyn ManagedProcess>) {
        self.register_process(AUDIO_PROCESS, handle);
    }

    pub fn register_process(&self, name: &str, handle: Arc<dyn ManagedProcess>) {
        let replaced = lock(&self.state)
            .active_processes
            .insert(name.to_string(), handle);
        if let Some(old) = replaced {
            terminate_gracefully(&*old, self.config.process_grace);
        }
    }

    /// Register `handle` for `cycle`.  If that cycle is no longer running the
    /// process is stopped at once and `false` is returned.
    pub fn register_cycle_process(&self, cycle: u64, handle: Arc<dyn ManagedProcess>) -> bool {
        let (accepted, to_stop) = {
            let mut st = lock(&self.state);
            if st.cycle == cycle && st.current_state.is_busy() {
                let replaced = st
                    .active_processes
                    .insert(AUDIO_PROCESS.to_string(), handle);
                (true, replaced)
            } else {
                (false, Some(handle))
            }
        };
        if !accepted {
            log::info!("orchestrator: cycle {cycle} is over; stopping its process");
        }
        if let Some(process) = to_stop {
            terminate_gracefully(&*process, self.config.process_grace);
        }
        accepted
    }

    /// Drop the registration of `handle` after it exited, without stopping
    /// it.  Returns `false` and leaves the registry alone if `cycle` is stale
    /// or the registered process is no longer `handle`.
    pub fn unregister_cycle_process(&self, cycle: u64, handle: &Arc<dyn ManagedProcess>) -> bool {
        let mut st = lock(&self.state);
        let ours = st.cycle == cycle
            && st
                .active_processes
                .get(AUDIO_PROCESS)
                .is_some_and(|registered| Arc::ptr_eq(registered, handle));
        if ours {
            st.active_processes.remove(AUDIO_PROCESS);
        }
        ours
    }

    pub fn register_state_callback<F>(&self, state: SystemState, callback: F)
    where
        F: Fn(SystemState, SystemState) + Send + Sync + 'static,
    {
        lock(&self.callbacks)
            .entry(state)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Queue a sound cue.  Silently ignored when sound is unavailable.
    pub fn play_system_sound(&self, cue: Cue) {
        if let Some(sound) = &self.feedback.sound {
            sound.play_cue(cue);
        }
    }

    /// Stop the monitor and put every feedback device in its resting state.
    pub fn shutdown(&self) {
        self.monitor_stop.set();
        if let Some(monitor) = lock(&self.monitor).take() {
            if monitor.thread().id() != std::thread::current().id()
                && !join_bounded(monitor, MONITOR_JOIN)
            {
                log::warn!("orchestrator: monitor did not stop within {MONITOR_JOIN:?}");
            }
        }
        if let Some(sound) = &self.feedback.sound {
            sound.shutdown();
        }
        self.feedback.leds.stop_all_leds();
        self.feedback.activity.set_all_leds_off();
    }

    // -----------------------------------------------------------------------
    // Locked helpers
    // -----------------------------------------------------------------------

    fn advance_locked(&self, st: &mut PipelineState, fired: &mut Fired) {
        if st.interrupt_requested {
            log::info!("orchestrator: interruption pending; not advancing");
            self.transition_locked(st, SystemState::Interrupted, false, fired);
            return;
        }
        match st.current_state.next() {
            Some(next) => self.transition_locked(st, next, false, fired),
            None => log::debug!("orchestrator: no progression from {}", st.current_state),
        }
    }

    fn transition_locked(
        &self,
        st: &mut PipelineState,
        new_state: SystemState,
        force: bool,
        fired: &mut Fired,
    ) {
        let old = st.current_state;
        if new_state == old && !force {
            return;
        }

        if st.force_cleanup_needed {
            self.force_cleanup(st);
        }

        st.previous_state = old;
        if old != SystemState::Idle {
            self.cleanup_state(st, old, new_state);
        }

        if old.next() == Some(new_state) {
            if let Some(stage) = old.stage().filter(|s| Some(*s) != new_state.stage()) {
                self.flags.mark_complete(stage);
            }
        }
        if new_state == SystemState::Interrupted {
            self.flags.clear_complete();
        }

        st.current_state = new_state;
        st.state_start_time = Instant::now();
        st.interrupt_requested = false;
        self.flags.mirror(new_state);
        self.update_hardware(old, new_state);

        log::info!("orchestrator: {old} -> {new_state}");
        fired.push((old, new_state));
    }

    /// Release what `leaving` holds before moving to `entering`.
    fn cleanup_state(&self, st: &mut PipelineState, leaving: SystemState, entering: SystemState) {
        if let Some(sound) = &self.feedback.sound {
            sound.clear_queue_and_interrupt();
        }

        if let Some(process) = st.active_processes.remove(AUDIO_PROCESS) {
            terminate_gracefully(&*process, self.config.process_grace);
        }

        if leaving == SystemState::Expressing {
            self.feedback.leds.stop_all_leds();
            // Going idle hands the strip to the cycle-complete flourish.
            if entering != SystemState::Idle {
                self.feedback.activity.set_all_leds_off();
            }
        }
    }

    fn force_cleanup(&self, st: &mut PipelineState) {
        log::warn!("orchestrator: force cleanup in {}", st.current_state);

        if let Some(sound) = &self.feedback.sound {
            sound.clear_queue_and_interrupt();
            sound.force_stop_and_reinitialize();
        }

        for (name, process) in st.active_processes.drain() {
            log::debug!("orchestrator: stopping {name}");
            terminate_gracefully(&*process, self.config.process_grace);
        }
        if self.config.kill_strays {
            kill_by_name("aplay");
            kill_by_name("arecord");
        }

        self.feedback.leds.stop_all_leds();
        self.feedback.activity.set_all_leds_off();
        self.flags.clear_all();
        st.force_cleanup_needed = false;
    }

    fn update_hardware(&self, old: SystemState, new: SystemState) {
        let progress = match new {
            SystemState::Idle | SystemState::Interrupted => ProgressStage::Idle,
            SystemState::Listening => ProgressStage::Recording,
            SystemState::ProcessingSpeech => ProgressStage::Asr,
            SystemState::Contemplating => ProgressStage::Llm,
            SystemState::Synthesizing => ProgressStage::Tts,
            SystemState::Expressing => ProgressStage::Playing,
        };
        self.feedback.leds.show_progress(progress);

        let activity = &self.feedback.activity;
        match new {
            SystemState::Idle if old == SystemState::Expressing => {
                activity.update_from_pipeline_status(ActivityStatus::Idle)
            }
            SystemState::Idle | SystemState::Interrupted => activity.set_all_leds_off(),
            SystemState::Listening => {
                activity.update_from_pipeline_status(ActivityStatus::Listening)
            }
            SystemState::ProcessingSpeech => {
                activity.update_from_pipeline_status(ActivityStatus::Transcribing)
            }
            SystemState::Contemplating => {
                activity.update_from_pipeline_status(ActivityStatus::Thinking)
            }
            SystemState::Synthesizing => {
                activity.update_from_pipeline_status(ActivityStatus::Speaking)
            }
            SystemState::Expressing => {
                activity.update_from_pipeline_status(ActivityStatus::Playing)
            }
        }
    }

    fn run_callbacks(&self, fired: Fired) {
        for (old, new) in fired {
            let callbacks = lock(&self.callbacks).get(&new).cloned().unwrap_or_default();
            for callback in callbacks {
                if catch_unwind(AssertUnwindSafe(|| callback(old, new))).is_err() {
                    log::error!("orchestrator: state callback for {new} panicked");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stuck-state monitor
    // -----------------------------------------------------------------------

    fn spawn_monitor(this: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(this);
        let stop = Arc::clone(&this.monitor_stop);
        let interval = this.config.monitor_interval;

        let spawned = std::thread::Builder::new()
            .name("state-monitor".into())
            .spawn(move || {
                while !stop.wait_timeout(interval) {
                    let Some(orchestrator) = weak.upgrade() else {
                        break;
                    };
                    orchestrator.check_stuck_state();
                }
                log::debug!("orchestrator: monitor exiting");
            });

        match spawned {
            Ok(handle) => *lock(&this.monitor) = Some(handle),
            Err(e) => log::warn!("orchestrator: could not start monitor: {e}"),
        }
    }

    /// Reset to `Idle` if the current state has outlived its timeout.
    /// Returns `true` if a reset happened.
    pub fn check_stuck_state(&self) -> bool {
        let mut fired = Fired::new();
        {
            let mut st = lock(&self.state);
            let state = st.current_state;
            let Some(limit) = self.config.state_timeouts.get(&state) else {
                return false;
            };
            let held = st.state_start_time.elapsed();
            if held <= *limit {
                return false;
            }
            log::warn!(
                "orchestrator: {state} held for {:.1}s (limit {:.1}s); resetting to idle",
                held.as_secs_f32(),
                limit.as_secs_f32()
            );
            st.force_cleanup_needed = true;
            self.transition_locked(&mut st, SystemState::Idle, true, &mut fired);
        }
        self.run_callbacks(fired);
        true
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.monitor_stop.set();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::feedback::{ActivityConfig, BlinkTimings};
    use crate::hardware::{
        Buzzer, BuzzerFactory, LedBank, PixelStrip, Rgb, SimBuzzer, SimLedBank, SimPixelStrip,
    };
    use crate::pipeline::process::tests::FakeProcess;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct Rig {
        pub orchestrator: Arc<Orchestrator>,
        pub leds: Arc<SimLedBank>,
        pub strip: Arc<SimPixelStrip>,
        pub buzzer: Arc<SimBuzzer>,
    }

    pub(crate) fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            monitor_interval: Duration::from_millis(10),
            state_timeouts: HashMap::new(),
            process_grace: Duration::from_millis(30),
            settle: Duration::from_millis(1),
            kill_strays: false,
        }
    }

    pub(crate) fn rig_with(config: OrchestratorConfig) -> Rig {
        rig_with_blinks(
            config,
            BlinkTimings {
                normal: Duration::from_millis(10),
                fast: Duration::from_millis(5),
            },
        )
    }

    pub(crate) fn rig_with_blinks(config: OrchestratorConfig, timings: BlinkTimings) -> Rig {
        let leds = Arc::new(SimLedBank::new(["A", "B", "C"]));
        let strip = Arc::new(SimPixelStrip::new(7));
        let buzzer = Arc::new(SimBuzzer::new());
        let shared = Arc::clone(&buzzer);
        let factory: BuzzerFactory = Arc::new(move || Ok(Arc::clone(&shared) as Arc<dyn Buzzer>));

        let feedback = Feedback {
            sound: Some(Arc::new(
                SoundWorker::start(factory, Duration::from_millis(5)).unwrap(),
            )),
            leds: Arc::new(LedBlinkManager::new(
                Arc::clone(&leds) as Arc<dyn LedBank>,
                timings,
            )),
            activity: Arc::new(ActivityIndicatorManager::new(
                Arc::clone(&strip) as Arc<dyn PixelStrip>,
                ActivityConfig {
                    blink: Duration::from_millis(10),
                    flourish: Duration::from_millis(5),
                    ..ActivityConfig::default()
                },
            )),
        };
        Rig {
            orchestrator: Orchestrator::new(feedback, config),
            leds,
            strip,
            buzzer,
        }
    }

    pub(crate) fn rig() -> Rig {
        rig_with(test_config())
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    // ---- Progression ---

    #[test]
    fn voice_cycle_walks_the_progression() {
        let r = rig();
        let o = &r.orchestrator;
        o.start_pipeline_flow(InputType::Voice);
        assert_eq!(o.get_current_state(), SystemState::Listening);

        let walked: Vec<_> = (0..5).map(|_| o.advance_pipeline_flow()).collect();
        assert_eq!(
            walked,
            vec![
                SystemState::ProcessingSpeech,
                SystemState::Contemplating,
                SystemState::Synthesizing,
                SystemState::Expressing,
                SystemState::Idle,
            ]
        );
        o.shutdown();
    }

    #[test]
    fn text_cycle_enters_at_contemplating() {
        let r = rig();
        r.orchestrator.start_pipeline_flow("text".parse().unwrap());
        assert_eq!(r.orchestrator.get_current_state(), SystemState::Contemplating);
        assert!(r.orchestrator.stage_flags().llm_active);
    }

    #[test]
    fn advance_from_rest_states_is_noop() {
        let r = rig();
        let o = &r.orchestrator;
        assert_eq!(o.advance_pipeline_flow(), SystemState::Idle);

        o.transition_to_state(SystemState::Interrupted, false);
        assert_eq!(o.advance_pipeline_flow(), SystemState::Interrupted);
    }

    #[test]
    fn complete_flags_follow_forward_progress() {
        let r = rig();
        let o = &r.orchestrator;
        o.start_pipeline_flow(InputType::Voice);
        o.advance_pipeline_flow();
        assert!(!o.stage_flags().asr_complete);
        o.advance_pipeline_flow();
        let flags = o.stage_flags();
        assert!(flags.asr_complete && flags.llm_active && !flags.asr_active);
    }

    // ---- Starting over a running cycle ---

    #[test]
    fn start_from_any_busy_state_releases_previous_cycle() {
        for state in SystemState::ALL {
            if state == SystemState::Idle {
                continue;
            }
            for input in [InputType::Voice, InputType::Text] {
                let r = rig();
                let o = &r.orchestrator;
                let first = o.start_pipeline_flow(InputType::Voice);
                assert!(o.mark_stage_complete(first, Stage::Asr));
                o.transition_to_state(state, false);
                let process = Arc::new(FakeProcess::running());
                o.register_audio_process(Arc::clone(&process) as Arc<dyn ManagedProcess>);

                o.start_pipeline_flow(input);

                assert_eq!(o.active_process_count(), 0, "{state}");
                assert!(!process.is_running());
                assert_eq!(o.get_current_state(), input.entry_state());
                let flags = o.stage_flags();
                assert!(!flags.asr_complete && !flags.llm_complete && !flags.tts_complete);
                assert_eq!(flags.active_count(), 1);
            }
        }
    }

    #[test]
    fn new_cycle_bumps_generation_and_rejects_stale_advance() {
        let r = rig();
        let o = &r.orchestrator;
        let first = o.start_pipeline_flow(InputType::Voice);
        let second = o.start_pipeline_flow(InputType::Voice);
        assert_eq!(second, first + 1);

        assert_eq!(o.advance_cycle(first), None);
        assert_eq!(o.get_current_state(), SystemState::Listening);
        assert_eq!(o.advance_cycle(second), Some(SystemState::ProcessingSpeech));
        assert!(!o.complete_cycle(first));
    }

    #[test]
    fn settle_pause_releases_the_lock() {
        let mut config = test_config();
        config.settle = Duration::from_millis(300);
        let r = rig_with(config);
        let o = Arc::clone(&r.orchestrator);
        let first = o.start_pipeline_flow(InputType::Text);

        let starter = {
            let o = Arc::clone(&o);
            std::thread::spawn(move || o.start_pipeline_flow(InputType::Voice))
        };
        // Readers see the intermediate state instead of blocking on it.
        assert!(wait_for(|| o.get_current_state() == SystemState::Interrupted));
        assert!(!o.complete_cycle(first));
        assert!(!o.mark_stage_complete(first, Stage::Llm));

        let second = starter.join().unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(o.cycle_state(), (second, SystemState::Listening));
        assert!(o.stage_flags().asr_active);
    }

    #[test]
    fn restart_rebuilds_the_buzzer() {
        let r = rig();
        let o = &r.orchestrator;
        let sound = Arc::clone(o.feedback().sound.as_ref().unwrap());

        o.start_pipeline_flow(InputType::Voice);
        assert_eq!(sound.reinit_count(), 0);
        o.start_pipeline_flow(InputType::Text);
        assert_eq!(sound.reinit_count(), 1);

        o.force_reset_to_idle();
        assert_eq!(sound.reinit_count(), 2);
    }

    // ---- Stage bookkeeping ---

    #[test]
    fn stale_cycle_cannot_mark_stages() {
        let r = rig();
        let o = &r.orchestrator;
        let text = o.start_pipeline_flow(InputType::Text);
        let voice = o.start_pipeline_flow(InputType::Voice);

        assert!(!o.mark_stage_complete(text, Stage::Llm));
        assert!(!o.stage_flags().llm_complete);
        assert!(o.mark_stage_complete(voice, Stage::Asr));
        assert!(o.stage_flags().asr_complete);

        o.request_interruption();
        assert!(!o.mark_stage_complete(voice, Stage::Asr));
        assert!(o.stage_flags().all_clear());
    }

    #[test]
    fn stale_cycle_cannot_unregister_a_newer_process() {
        let r = rig();
        let o = &r.orchestrator;
        let old = o.start_pipeline_flow(InputType::Voice);
        let old_rec: Arc<dyn ManagedProcess> = Arc::new(FakeProcess::running());
        assert!(o.register_cycle_process(old, Arc::clone(&old_rec)));

        let new = o.start_pipeline_flow(InputType::Voice);
        let new_rec: Arc<dyn ManagedProcess> = Arc::new(FakeProcess::running());
        assert!(o.register_cycle_process(new, Arc::clone(&new_rec)));

        assert!(!o.unregister_cycle_process(old, &old_rec));
        assert!(!o.unregister_cycle_process(new, &old_rec));
        assert_eq!(o.active_process_count(), 1);

        // The recorder still registered is the one an interruption stops.
        o.request_interruption();
        assert!(!new_rec.is_running());
    }

    #[test]
    fn finished_process_unregisters_without_being_stopped() {
        let r = rig();
        let o = &r.orchestrator;
        let cycle = o.start_pipeline_flow(InputType::Voice);
        let process = Arc::new(FakeProcess::running());
        let handle = Arc::clone(&process) as Arc<dyn ManagedProcess>;
        assert!(o.register_cycle_process(cycle, Arc::clone(&handle)));

        assert!(o.unregister_cycle_process(cycle, &handle));
        assert_eq!(o.active_process_count(), 0);
        assert_eq!(process.terminates.load(Ordering::SeqCst), 0);
    }

    // ---- Interruption ---

    #[test]
    fn interruption_cleans_up_once() {
        let slow = BlinkTimings {
            normal: Duration::from_secs(10),
            fast: Duration::from_secs(10),
        };
        let r = rig_with_blinks(test_config(), slow);
        let o = &r.orchestrator;
        o.start_pipeline_flow(InputType::Text);
        o.advance_pipeline_flow();
        o.advance_pipeline_flow();
        assert_eq!(o.get_current_state(), SystemState::Expressing);
        assert!(wait_for(|| r.leds.is_on("A") && r.leds.is_on("B") && r.leds.is_on("C")));

        let before = r.leds.write_count();
        o.request_interruption();
        // Blink exit, forced off, idle progress: three LEDs each, once.
        assert_eq!(r.leds.write_count() - before, 9);
    }

    #[test]
    fn interruption_while_contemplating() {
        let r = rig();
        let o = &r.orchestrator;
        o.start_pipeline_flow(InputType::Text);
        let process = Arc::new(FakeProcess::running());
        o.register_audio_process(Arc::clone(&process) as Arc<dyn ManagedProcess>);

        assert!(o.request_interruption());
        assert_eq!(o.get_current_state(), SystemState::Interrupted);
        assert!(o.stage_flags().all_clear());
        assert!(!process.is_running());
        assert_eq!(process.terminates.load(Ordering::SeqCst), 1);
        assert_eq!(o.active_process_count(), 0);
    }

    #[test]
    fn stubborn_playback_is_killed_on_interruption() {
        let r = rig();
        let o = &r.orchestrator;
        o.start_pipeline_flow(InputType::Text);
        o.advance_pipeline_flow();
        o.advance_pipeline_flow();
        assert_eq!(o.get_current_state(), SystemState::Expressing);

        let process = Arc::new(FakeProcess::stubborn());
        o.register_audio_process(Arc::clone(&process) as Arc<dyn ManagedProcess>);
        o.request_interruption();

        assert_eq!(process.kills.load(Ordering::SeqCst), 1);
        assert_eq!(o.active_process_count(), 0);
        assert!(!r.leds.any_on());
    }

    #[test]
    fn interruption_from_idle_is_ignored() {
        let r = rig();
        assert!(!r.orchestrator.request_interruption());
        assert_eq!(r.orchestrator.get_current_state(), SystemState::Idle);
    }

    #[test]
    fn late_process_for_finished_cycle_is_stopped() {
        let r = rig();
        let o = &r.orchestrator;
        let cycle = o.start_pipeline_flow(InputType::Voice);
        o.request_interruption();

        let process = Arc::new(FakeProcess::running());
        assert!(!o.register_cycle_process(cycle, Arc::clone(&process) as Arc<dyn ManagedProcess>));
        assert!(!process.is_running());
        assert_eq!(o.active_process_count(), 0);
    }

    // ---- Blocking predicates ---

    #[test]
    fn input_blocked_only_while_processing() {
        let r = rig();
        let o = &r.orchestrator;
        for state in SystemState::ALL {
            o.transition_to_state(state, false);
            let blocked = !matches!(
                state,
                SystemState::Idle | SystemState::Interrupted | SystemState::Listening
            );
            assert_eq!(o.should_block_button_actions(), blocked, "{state}");
            assert_eq!(o.should_block_recording(), blocked, "{state}");
        }
    }

    // ---- Callbacks ---

    #[test]
    fn callbacks_run_outside_the_lock() {
        let r = rig();
        let o = Arc::clone(&r.orchestrator);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let inner = Arc::clone(&o);
        o.register_state_callback(SystemState::Listening, move |old, new| {
            // Re-entering the orchestrator from a callback must not deadlock.
            sink.lock().unwrap().push((old, new, inner.get_current_state()));
        });

        o.start_pipeline_flow(InputType::Voice);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(SystemState::Idle, SystemState::Listening, SystemState::Listening)]
        );
    }

    #[test]
    fn panicking_callback_is_contained() {
        let r = rig();
        let o = &r.orchestrator;
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        o.register_state_callback(SystemState::Idle, |_, _| panic!("callback"));
        o.register_state_callback(SystemState::Idle, move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        o.start_pipeline_flow(InputType::Voice);
        o.complete_pipeline_flow();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        o.start_pipeline_flow(InputType::Voice);
        assert_eq!(o.get_current_state(), SystemState::Listening);
    }

    // ---- Hardware feedback ---

    #[test]
    fn finished_cycle_ends_with_everything_dark() {
        let r = rig();
        let o = &r.orchestrator;
        o.start_pipeline_flow(InputType::Voice);
        for _ in 0..5 {
            o.advance_pipeline_flow();
        }
        assert_eq!(o.get_current_state(), SystemState::Idle);
        assert!(wait_for(|| !o.feedback().activity.flourish_running()));
        assert!(r.strip.pixels().iter().all(Rgb::is_off));
        assert!(!r.leds.any_on());
        assert_eq!(o.feedback().leds.live_blinks(), 0);
    }

    #[test]
    fn force_reset_reports_previous_state() {
        let r = rig();
        let o = &r.orchestrator;
        o.start_pipeline_flow(InputType::Text);
        o.play_system_sound(Cue::Thinking);
        assert_eq!(o.force_reset_to_idle(), SystemState::Contemplating);
        assert_eq!(o.get_current_state(), SystemState::Idle);
        assert!(o.stage_flags().all_clear());
        assert!(wait_for(|| r.buzzer.sounding().is_none()));
    }

    // ---- Monitor ---

    #[test]
    fn monitor_resets_a_stuck_state() {
        let mut config = test_config();
        config
            .state_timeouts
            .insert(SystemState::Listening, Duration::from_millis(30));
        let r = rig_with(config);
        let o = &r.orchestrator;
        o.start_pipeline_flow(InputType::Voice);

        assert!(wait_for(|| o.get_current_state() == SystemState::Idle));
        assert_eq!(o.previous_state(), SystemState::Listening);
        o.shutdown();
    }

    #[test]
    fn states_without_timeout_are_never_reset() {
        let mut config = test_config();
        config
            .state_timeouts
            .insert(SystemState::Listening, Duration::from_millis(1));
        let r = rig_with(config);
        let o = &r.orchestrator;
        o.start_pipeline_flow(InputType::Text);
        std::thread::sleep(Duration::from_millis(10));
        assert!(!o.check_stuck_state());
        assert_eq!(o.get_current_state(), SystemState::Contemplating);
    }
}
