//! Async dispatcher: turns input events into orchestrator calls and cycles.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};

use super::InputEvent;
use crate::pipeline::{CycleOutcome, PipelineDriver, PipelineError, StageSnapshot, SystemState};

/// What the dispatcher did with one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    StartedVoice,
    StartedText,
    /// A busy cycle was asked to stop.
    Interrupting,
    /// Input arrived while the pipeline was processing.
    Rejected(SystemState),
    /// Nothing was running.
    Ignored,
    Status(StatusReport),
    /// Forced back to idle from the contained state.
    Reset(SystemState),
    Quit,
}

/// Snapshot printed for the `Status` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub state: SystemState,
    pub previous: SystemState,
    pub in_state_ms: u64,
    pub cycle: u64,
    pub stages: StageSnapshot,
    pub active_processes: usize,
    pub history: usize,
    pub running_cycles: usize,
}

type CycleResult = Result<CycleOutcome, PipelineError>;

pub struct Dispatcher {
    driver: Arc<PipelineDriver>,
    cycles: JoinSet<CycleResult>,
}

impl Dispatcher {
    pub fn new(driver: Arc<PipelineDriver>) -> Self {
        Self {
            driver,
            cycles: JoinSet::new(),
        }
    }

    /// Handle events until `Quit` or until the sender closes.
    ///
    /// `Quit` interrupts the running cycle; a closed channel lets it finish.
    pub async fn run(mut self, mut events: mpsc::Receiver<InputEvent>) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        log::debug!("dispatcher: input closed");
                        break;
                    };
                    if self.handle(event) == Action::Quit {
                        self.driver.orchestrator().request_interruption();
                        break;
                    }
                }
                Some(done) = self.cycles.join_next(), if !self.cycles.is_empty() => {
                    report(done);
                }
            }
        }
        self.drain().await;
    }

    /// Wait for every spawned cycle to return.
    pub async fn drain(&mut self) {
        while let Some(done) = self.cycles.join_next().await {
            report(done);
        }
    }

    /// Apply one event.  Must be called inside a tokio runtime.
    pub fn handle(&mut self, event: InputEvent) -> Action {
        let orchestrator = self.driver.orchestrator();
        match event {
            InputEvent::VoiceButton => {
                if orchestrator.is_system_busy() {
                    return if orchestrator.request_interruption() {
                        Action::Interrupting
                    } else {
                        Action::Ignored
                    };
                }
                let driver = Arc::clone(&self.driver);
                self.cycles.spawn_blocking(move || driver.run_voice_cycle());
                Action::StartedVoice
            }
            InputEvent::TextInput(text) => {
                if orchestrator.should_block_button_actions() {
                    let state = orchestrator.get_current_state();
                    log::info!("dispatcher: busy in {state}; ignoring {text:?}");
                    return Action::Rejected(state);
                }
                let driver = Arc::clone(&self.driver);
                self.cycles
                    .spawn_blocking(move || driver.run_text_cycle(&text));
                Action::StartedText
            }
            InputEvent::Interrupt => {
                if orchestrator.request_interruption() {
                    Action::Interrupting
                } else {
                    Action::Ignored
                }
            }
            InputEvent::Status => {
                let report = self.status();
                match serde_json::to_string(&report) {
                    Ok(json) => log::info!("status: {json}"),
                    Err(e) => log::warn!("status: {e}"),
                }
                Action::Status(report)
            }
            InputEvent::Reset => Action::Reset(orchestrator.force_reset_to_idle()),
            InputEvent::Quit => Action::Quit,
        }
    }

    pub fn status(&self) -> StatusReport {
        let o = self.driver.orchestrator();
        let (cycle, state) = o.cycle_state();
        StatusReport {
            state,
            previous: o.previous_state(),
            in_state_ms: u64::try_from(o.time_in_state().as_millis()).unwrap_or(u64::MAX),
            cycle,
            stages: o.stage_flags(),
            active_processes: o.active_process_count(),
            history: self.driver.history_len(),
            running_cycles: self.cycles.len(),
        }
    }
}

fn report(done: Result<CycleResult, JoinError>) {
    match done {
        Ok(Ok(outcome)) => log::debug!("dispatcher: cycle {} finished", outcome.cycle),
        Ok(Err(PipelineError::Interrupted)) => {}
        Ok(Err(e)) => log::warn!("dispatcher: cycle failed: {e}"),
        Err(e) => log::error!("dispatcher: cycle task panicked: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
