//! Pipeline coordination: the state machine and the driver that walks it.
//!
//! # Architecture
//!
//! ```text
//! InputEvent (mpsc)
//!        │
//!        ▼
//! Dispatcher ── spawn_blocking ──▶ PipelineDriver::run_*_cycle
//!                                     │
//!                                     │ start / advance_cycle / complete_cycle
//!                                     ▼
//!                                Orchestrator  (one Mutex<PipelineState>)
//!                                     │
//!                                     ├─ cleanup of the outgoing state
//!                                     │    sound queue, registered processes
//!                                     ├─ StageFlags (atomics, read lock-free)
//!                                     ├─ LED progress + activity strip
//!                                     └─ state callbacks (after unlock)
//!
//! state-monitor thread ── check_stuck_state ──▶ force_reset_to_idle
//! ```
//!
//! The driver owns nothing the orchestrator needs to clean up except the
//! child processes it registers.  Every stage boundary goes through the
//! orchestrator so an interruption from any thread is observed at the next
//! boundary.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use rover_pipeline::config::AppConfig;
//! use rover_pipeline::context::DeviceContext;
//!
//! let config = AppConfig::default();
//! let ctx = DeviceContext::build(&config, true).expect("device context");
//! match ctx.driver.run_text_cycle("what can you do?") {
//!     Ok(outcome) => println!("said: {}", outcome.spoken),
//!     Err(e) => eprintln!("cycle failed: {e}"),
//! }
//! ctx.shutdown();
//! ```

pub mod conversation;
pub mod orchestrator;
pub mod process;
pub mod runner;
pub mod speech;
pub mod state;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use conversation::{Conversation, Exchange, DEFAULT_SYSTEM_PROMPT};
pub use orchestrator::{
    Feedback, InputType, Orchestrator, OrchestratorConfig, StateCallback, AUDIO_PROCESS,
};
pub use process::{ChildProcess, ManagedProcess, ProcessExit};
pub use runner::{Collaborators, CycleOutcome, DriverSettings, PipelineDriver, PipelineError};
pub use speech::{sanitize_for_speech, strip_think_tags};
pub use state::{PipelineState, Stage, StageSnapshot, SystemState, UnknownState};
