//! Recorded-audio checks.
//!
//! Capture itself is an external `arecord` process (see
//! [`crate::services::ArecordCapture`]); this module only decides whether
//! the file it produced is worth sending to speech recognition.
//!
//! ```text
//! arecord → capture.wav → RecordingValidator::validate → RecordingInfo
//!                                   │
//!                                   └─ RecordingError → cycle ends, back to Idle
//! ```

pub mod validate;

pub use validate::{RecordingError, RecordingInfo, RecordingValidator};
