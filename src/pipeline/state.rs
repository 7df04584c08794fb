//! Pipeline states, the orchestrator's private state record, and the stage
//! flags mirrored for external readers.
//!
//! [`SystemState`] is the state machine's vocabulary.  [`PipelineState`] is
//! owned by the orchestrator and only ever touched under its lock.
//! [`StageFlags`] is lock-free so status readers never contend with a
//! transition in progress.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::process::ManagedProcess;

// ---------------------------------------------------------------------------
// SystemState
// ---------------------------------------------------------------------------

/// States of one pipeline cycle.
///
/// ```text
/// Idle ──voice──▶ Listening ──▶ ProcessingSpeech ──▶ Contemplating
///      ──text───────────────────────────────────────▶ Contemplating
///
/// Contemplating ──▶ Synthesizing ──▶ Expressing ──▶ Idle
///
/// any busy state ──interrupt──▶ Interrupted ──▶ Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    /// No cycle running; ready for input.
    #[default]
    Idle,
    /// Capturing microphone audio.
    Listening,
    /// Speech recognition on the captured audio.
    ProcessingSpeech,
    /// Waiting on the language model.
    Contemplating,
    /// Rendering the reply to audio.
    Synthesizing,
    /// Playing the synthesized reply.
    Expressing,
    /// A cycle was abandoned; resources are being released.
    Interrupted,
}

impl SystemState {
    pub const ALL: [SystemState; 7] = [
        Self::Idle,
        Self::Listening,
        Self::ProcessingSpeech,
        Self::Contemplating,
        Self::Synthesizing,
        Self::Expressing,
        Self::Interrupted,
    ];

    /// Config and log key, e.g. `"processing_speech"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::ProcessingSpeech => "processing_speech",
            Self::Contemplating => "contemplating",
            Self::Synthesizing => "synthesizing",
            Self::Expressing => "expressing",
            Self::Interrupted => "interrupted",
        }
    }

    /// Short label for status output.
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Listening => "Listening",
            Self::ProcessingSpeech => "Transcribing",
            Self::Contemplating => "Thinking",
            Self::Synthesizing => "Synthesizing",
            Self::Expressing => "Speaking",
            Self::Interrupted => "Interrupted",
        }
    }

    /// `true` while a cycle holds the pipeline.
    ///
    /// ```
    /// use rover_pipeline::pipeline::SystemState;
    ///
    /// assert!(!SystemState::Idle.is_busy());
    /// assert!(SystemState::Contemplating.is_busy());
    /// assert!(!SystemState::Interrupted.is_busy());
    /// ```
    pub fn is_busy(self) -> bool {
        !matches!(self, Self::Idle | Self::Interrupted)
    }

    /// New voice or button input is accepted only from these states.
    pub fn accepts_input(self) -> bool {
        matches!(self, Self::Idle | Self::Interrupted | Self::Listening)
    }

    /// Fixed forward progression.  `None` for `Idle` and `Interrupted`.
    pub fn next(self) -> Option<SystemState> {
        match self {
            Self::Listening => Some(Self::ProcessingSpeech),
            Self::ProcessingSpeech => Some(Self::Contemplating),
            Self::Contemplating => Some(Self::Synthesizing),
            Self::Synthesizing => Some(Self::Expressing),
            Self::Expressing => Some(Self::Idle),
            Self::Idle | Self::Interrupted => None,
        }
    }

    /// The stage whose work happens in this state.
    pub fn stage(self) -> Option<Stage> {
        match self {
            Self::Listening | Self::ProcessingSpeech => Some(Stage::Asr),
            Self::Contemplating => Some(Stage::Llm),
            Self::Synthesizing => Some(Stage::Tts),
            Self::Expressing => Some(Stage::Aplay),
            Self::Idle | Self::Interrupted => None,
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown pipeline state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for SystemState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == key)
            .ok_or(UnknownState(key))
    }
}

// ---------------------------------------------------------------------------
// Stage flags
// ---------------------------------------------------------------------------

/// A processing stage as seen by status readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Asr,
    Llm,
    Tts,
    Aplay,
}

/// Lock-free stage booleans.  At most one `*_active` flag is true at a time.
#[derive(Debug, Default)]
pub struct StageFlags {
    asr_active: AtomicBool,
    asr_complete: AtomicBool,
    llm_active: AtomicBool,
    llm_complete: AtomicBool,
    tts_active: AtomicBool,
    tts_complete: AtomicBool,
    aplay_active: AtomicBool,
}

/// Point-in-time copy of [`StageFlags`], serialisable for status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageSnapshot {
    pub asr_active: bool,
    pub asr_complete: bool,
    pub llm_active: bool,
    pub llm_complete: bool,
    pub tts_active: bool,
    pub tts_complete: bool,
    pub aplay_active: bool,
}

impl StageSnapshot {
    pub fn active_count(&self) -> usize {
        [self.asr_active, self.llm_active, self.tts_active, self.aplay_active]
            .into_iter()
            .filter(|f| *f)
            .count()
    }

    pub fn all_clear(&self) -> bool {
        *self == Self::default()
    }
}

impl StageFlags {
    pub fn snapshot(&self) -> StageSnapshot {
        StageSnapshot {
            asr_active: self.asr_active.load(Ordering::SeqCst),
            asr_complete: self.asr_complete.load(Ordering::SeqCst),
            llm_active: self.llm_active.load(Ordering::SeqCst),
            llm_complete: self.llm_complete.load(Ordering::SeqCst),
            tts_active: self.tts_active.load(Ordering::SeqCst),
            tts_complete: self.tts_complete.load(Ordering::SeqCst),
            aplay_active: self.aplay_active.load(Ordering::SeqCst),
        }
    }

    /// Raise the active flag for `state`'s stage and lower every other one.
    pub(crate) fn mirror(&self, state: SystemState) {
        let active = state.stage();
        self.asr_active
            .store(active == Some(Stage::Asr), Ordering::SeqCst);
        self.llm_active
            .store(active == Some(Stage::Llm), Ordering::SeqCst);
        self.tts_active
            .store(active == Some(Stage::Tts), Ordering::SeqCst);
        self.aplay_active
            .store(active == Some(Stage::Aplay), Ordering::SeqCst);
    }

    /// Record that `stage` has produced its result for this cycle.
    pub(crate) fn mark_complete(&self, stage: Stage) {
        match stage {
            Stage::Asr => self.asr_complete.store(true, Ordering::SeqCst),
            Stage::Llm => self.llm_complete.store(true, Ordering::SeqCst),
            Stage::Tts => self.tts_complete.store(true, Ordering::SeqCst),
            // Playback finishing is the end of the cycle.
            Stage::Aplay => {}
        }
    }

    pub(crate) fn clear_complete(&self) {
        for flag in [&self.asr_complete, &self.llm_complete, &self.tts_complete] {
            flag.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn clear_all(&self) {
        self.mirror(SystemState::Idle);
        self.clear_complete();
    }
}

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

/// The orchestrator's state record.  Mutated only under its lock.
pub struct PipelineState {
    pub current_state: SystemState,
    pub previous_state: SystemState,
    pub state_start_time: Instant,
    pub interrupt_requested: bool,
    pub force_cleanup_needed: bool,
    /// Cancellable subprocesses keyed by role, e.g. `"audio_process"`.
    pub active_processes: HashMap<String, Arc<dyn ManagedProcess>>,
    /// Generation counter, bumped by every `start_pipeline_flow`.
    pub cycle: u64,
}

impl PipelineState {
    pub fn new() -> Self {
        Self {
            current_state: SystemState::Idle,
            previous_state: SystemState::Idle,
            state_start_time: Instant::now(),
            interrupt_requested: false,
            force_cleanup_needed: false,
            active_processes: HashMap::new(),
            cycle: 0,
        }
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineState")
            .field("current_state", &self.current_state)
            .field("previous_state", &self.previous_state)
            .field("interrupt_requested", &self.interrupt_requested)
            .field("force_cleanup_needed", &self.force_cleanup_needed)
            .field(
                "active_processes",
                &self.active_processes.keys().collect::<Vec<_>>(),
            )
            .field("cycle", &self.cycle)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
