//! Coordination core of a voice-assistant device.
//!
//! A button press or a typed line starts a cycle that records, transcribes,
//! asks a language model, synthesizes the reply and plays it back.  The
//! [`pipeline::Orchestrator`] owns the cycle state and drives the buzzer,
//! indicator LEDs and activity strip in step with it.

pub mod audio;
pub mod config;
pub mod context;
pub mod feedback;
pub mod hardware;
pub mod input;
pub mod pipeline;
pub mod services;
pub mod sync;
