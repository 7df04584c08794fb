//! Best-effort device feedback.
//!
//! Three managers, each the sole owner of one device:
//!
//! ```text
//! ┌────────────────────┐  ┌────────────────────┐  ┌──────────────────────────┐
//! │ SoundWorker        │  │ LedBlinkManager    │  │ ActivityIndicatorManager │
//! │ buzzer, FIFO queue │  │ named on/off LEDs  │  │ ASR / LLM / TTS pixels   │
//! └────────────────────┘  └────────────────────┘  └──────────────────────────┘
//! ```
//!
//! None of them return errors to their callers.  Device faults are logged
//! and the affected blink or tone is skipped.

pub mod activity;
pub mod blink;
pub mod leds;
pub mod sound;
pub mod tones;

pub use activity::{
    ActivityChannel, ActivityConfig, ActivityIndicatorManager, ActivityStatus, ChannelState,
};
pub use blink::BlinkHandle;
pub use leds::{BlinkTimings, LedBlinkManager, ProgressStage};
pub use sound::{SoundTask, SoundWorker, TonePlayer};
pub use tones::{note_hz, Cue};
