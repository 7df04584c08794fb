//! Operator input: line commands read from stdin and dispatched to the
//! pipeline.
//!
//! # Design
//!
//! Reading stdin blocks, so [`InputListener`] owns a dedicated OS thread that
//! parses each line into an [`InputEvent`] and forwards it with
//! `blocking_send` on a `tokio::sync::mpsc` channel.  [`Dispatcher::run`]
//! consumes that channel on the async side and runs each cycle on the
//! blocking pool.
//!
//! | Line                    | Event                 |
//! |-------------------------|-----------------------|
//! | *(empty)*, `/voice`     | `VoiceButton`         |
//! | `/stop`, `/interrupt`   | `Interrupt`           |
//! | `/status`               | `Status`              |
//! | `/reset`                | `Reset`               |
//! | `/quit`, `/exit`        | `Quit`                |
//! | anything else           | `TextInput(line)`     |
//!
//! # Usage
//!
//! ```no_run
//! use tokio::sync::mpsc;
//! use rover_pipeline::input::{InputEvent, InputListener};
//!
//! let (tx, mut rx) = mpsc::channel::<InputEvent>(16);
//! let _listener = InputListener::stdin(tx).expect("input thread");
//!
//! // In your async loop:
//! // while let Some(ev) = rx.recv().await { ... }
//! ```

pub mod dispatch;
pub mod listener;

pub use dispatch::{Action, Dispatcher, StatusReport};
pub use listener::InputListener;

// ---------------------------------------------------------------------------
// InputEvent
// ---------------------------------------------------------------------------

/// Events emitted by the input listener thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// The record button: start a voice cycle, or interrupt a busy one.
    VoiceButton,
    /// Typed text to answer without recording.
    TextInput(String),
    Interrupt,
    Status,
    /// Force the pipeline back to idle.
    Reset,
    Quit,
}

// ---------------------------------------------------------------------------
// parse_line
// ---------------------------------------------------------------------------

/// Parse one input line.
///
/// Returns `None` for unknown `/` commands so the caller can report them.
pub fn parse_line(line: &str) -> Option<InputEvent> {
    let line = line.trim();
    if line.is_empty() {
        return Some(InputEvent::VoiceButton);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(InputEvent::TextInput(line.to_string()));
    };
    match command.trim().to_ascii_lowercase().as_str() {
        "voice" | "v" | "record" => Some(InputEvent::VoiceButton),
        "stop" | "interrupt" | "i" => Some(InputEvent::Interrupt),
        "status" | "s" => Some(InputEvent::Status),
        "reset" => Some(InputEvent::Reset),
        "quit" | "q" | "exit" => Some(InputEvent::Quit),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_line_presses_the_button() {
        assert_eq!(parse_line(""), Some(InputEvent::VoiceButton));
        assert_eq!(parse_line("   \n"), Some(InputEvent::VoiceButton));
        assert_eq!(parse_line("/voice"), Some(InputEvent::VoiceButton));
    }

    #[test]
    fn commands_are_case_insensitive() {
        assert_eq!(parse_line("/STOP"), Some(InputEvent::Interrupt));
        assert_eq!(parse_line("/Status"), Some(InputEvent::Status));
        assert_eq!(parse_line("/reset"), Some(InputEvent::Reset));
        assert_eq!(parse_line("/q"), Some(InputEvent::Quit));
    }

    #[test]
    fn plain_text_is_a_question() {
        assert_eq!(
            parse_line("  what is the weather?  "),
            Some(InputEvent::TextInput("what is the weather?".into()))
        );
    }

    #[test]
    fn unknown_command_is_none() {
        assert_eq!(parse_line("/dance"), None);
    }
}
