//! Pipeline driver: runs one cycle's stages in order on the calling thread.
//!
//! ```text
//! run_voice_cycle
//!   start_pipeline_flow(Voice)                        [Listening]
//!   capture ─▶ validate
//!   advance ─▶ transcribe                             [ProcessingSpeech]
//!   advance ─┐
//! run_text_cycle                                      │
//!   start_pipeline_flow(Text) ───────────────────────▶[Contemplating]
//!            chat completion ─▶ sanitize
//!   advance ─▶ synthesize                             [Synthesizing]
//!   advance ─▶ play (fallback device on failure)      [Expressing]
//!   complete                                          [Idle]
//! ```
//!
//! Every stage call blocks.  Between stages the driver asks the orchestrator
//! to advance *its* cycle; if the cycle was interrupted or superseded the
//! advance does not land and the driver stops with
//! [`PipelineError::Interrupted`].  Any other failure force-resets the
//! orchestrator to `Idle`.  Nothing is retried apart from the single
//! fallback-device playback attempt.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempPath;
use thiserror::Error;

use crate::audio::{RecordingError, RecordingValidator};
use crate::config::AppConfig;
use crate::feedback::Cue;
use crate::services::{
    AudioCapture, AudioPlayer, ChatModel, ServiceError, Synthesizer, Transcriber,
};
use crate::sync::lock;

use super::conversation::Conversation;
use super::orchestrator::{InputType, Orchestrator};
use super::process::{terminate_gracefully, ManagedProcess, ProcessExit};
use super::speech::sanitize_for_speech;
use super::state::{Stage, SystemState};

/// Extra time allowed for the recorder to exit after its fixed duration.
const CAPTURE_SLACK: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// Why a cycle ended without playing a reply.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The cycle was interrupted or replaced by a newer one.
    #[error("cycle interrupted")]
    Interrupted,

    #[error("recording rejected: {0}")]
    Recording(#[from] RecordingError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The model's reply had nothing speakable left after sanitising.
    #[error("reply was empty after cleanup")]
    EmptyReply,

    #[error("temporary file error: {0}")]
    TempFile(#[from] std::io::Error),
}

/// What a successful cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    pub cycle: u64,
    pub transcript: String,
    pub reply: String,
    pub spoken: String,
    /// `true` if playback only succeeded on the fallback device.
    pub used_fallback: bool,
}

// ---------------------------------------------------------------------------
// Settings and collaborators
// ---------------------------------------------------------------------------

/// The external stage implementations.
#[derive(Clone)]
pub struct Collaborators {
    pub capture: Arc<dyn AudioCapture>,
    pub transcriber: Arc<dyn Transcriber>,
    pub chat: Arc<dyn ChatModel>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub player: Arc<dyn AudioPlayer>,
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub mic_device: String,
    pub playback_device: String,
    pub fallback_device: String,
    pub record: Duration,
    pub playback_timeout: Duration,
    pub fallback_timeout: Duration,
    pub process_grace: Duration,
    pub llm_model: String,
    pub voice: String,
    pub strip_think_tags: bool,
    pub temp_dir: Option<PathBuf>,
    pub validator: RecordingValidator,
}

impl From<&AppConfig> for DriverSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            mic_device: cfg.audio.mic_device.clone(),
            playback_device: cfg.audio.playback_device.clone(),
            fallback_device: cfg.audio.fallback_playback_device.clone(),
            record: Duration::from_secs(u64::from(cfg.audio.record_secs)),
            playback_timeout: Duration::from_secs(cfg.audio.playback_timeout_secs),
            fallback_timeout: Duration::from_secs(cfg.audio.fallback_timeout_secs),
            process_grace: Duration::from_millis(cfg.pipeline.process_grace_ms),
            llm_model: cfg.services.llm_model.clone(),
            voice: cfg.services.voice.clone(),
            strip_think_tags: cfg.services.strip_think_tags,
            temp_dir: cfg.audio.temp_dir.clone(),
            validator: RecordingValidator::from_config(&cfg.audio),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineDriver
// ---------------------------------------------------------------------------

pub struct PipelineDriver {
    orchestrator: Arc<Orchestrator>,
    services: Collaborators,
    settings: DriverSettings,
    conversation: Mutex<Conversation>,
}

impl PipelineDriver {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        services: Collaborators,
        settings: DriverSettings,
        conversation: Conversation,
    ) -> Self {
        Self {
            orchestrator,
            services,
            settings,
            conversation: Mutex::new(conversation),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn history_len(&self) -> usize {
        lock(&self.conversation).len()
    }

    pub fn clear_history(&self) {
        lock(&self.conversation).clear();
    }

    /// Record, transcribe, answer and speak.
    pub fn run_voice_cycle(&self) -> Result<CycleOutcome, PipelineError> {
        let cycle = self.orchestrator.start_pipeline_flow(InputType::Voice);
        log::info!("driver: voice cycle {cycle}");
        let result = self.voice_stages(cycle);
        self.finish(cycle, result)
    }

    /// Answer and speak `text` without recording.
    pub fn run_text_cycle(&self, text: &str) -> Result<CycleOutcome, PipelineError> {
        let cycle = self.orchestrator.start_pipeline_flow(InputType::Text);
        log::info!("driver: text cycle {cycle}");
        let result = self.respond(cycle, text.trim().to_string());
        self.finish(cycle, result)
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    fn voice_stages(&self, cycle: u64) -> Result<CycleOutcome, PipelineError> {
        // ── 1. Capture ──────────────────────────────────────────────────
        let recording = self.temp_wav("rover-capture-")?;
        self.record(cycle, &recording)?;

        // ── 2. Validate ─────────────────────────────────────────────────

        let info = self.settings.validator.validate(&recording)?;
        log::debug!(
            "driver: recorded {:.1}s ({} bytes)",
            info.duration.as_secs_f32(),
            info.bytes
        );

        // ── 3. Transcribe ───────────────────────────────────────────────
        self.advance(cycle, SystemState::ProcessingSpeech)?;
        self.orchestrator.play_system_sound(Cue::RecordingComplete);
        let transcript = self.services.transcriber.transcribe(&recording)?;
        self.complete_stage(cycle, Stage::Asr)?;
        log::info!("driver: heard {transcript:?}");
        drop(recording);

        self.advance(cycle, SystemState::Contemplating)?;
        self.respond(cycle, transcript)
    }

    fn record(&self, cycle: u64, output: &Path) -> Result<(), PipelineError> {
        self.orchestrator.play_system_sound(Cue::Confirmation);
        let process =
            self.services
                .capture
                .start(self.settings.record, &self.settings.mic_device, output)?;
        if !self
            .orchestrator
            .register_cycle_process(cycle, Arc::clone(&process))
        {
            return Err(PipelineError::Interrupted);
        }

        let exit = process.wait_timeout(self.settings.record + CAPTURE_SLACK);
        if !self.orchestrator.unregister_cycle_process(cycle, &process) {
            return Err(PipelineError::Interrupted);
        }

        match exit {
            Some(exit) if exit.success => Ok(()),
            other => {
                if other.is_none() {
                    log::warn!("driver: recorder overran; stopping it");
                    terminate_gracefully(&*process, self.settings.process_grace);
                }
                Err(exit_error("arecord", other).into())
            }
        }
    }

    /// Language model, synthesis and playback.  Entered in `Contemplating`.
    fn respond(&self, cycle: u64, user_text: String) -> Result<CycleOutcome, PipelineError> {
        // ── 4. Language model ───────────────────────────────────────────
        let model = self.settings.llm_model.as_str();
        let messages = lock(&self.conversation).build_messages(&user_text);
        let reply = self
            .services
            .chat
            .chat_completion(model, &messages)?;
        self.complete_stage(cycle, Stage::Llm)?;
        lock(&self.conversation).push(user_text.as_str(), reply.as_str(), model);

        let spoken = sanitize_for_speech(&reply, self.settings.strip_think_tags);
        if spoken.is_empty() {
            return Err(PipelineError::EmptyReply);
        }

        // ── 5. Synthesize ───────────────────────────────────────────────
        self.advance(cycle, SystemState::Synthesizing)?;
        let speech = self.temp_wav("rover-reply-")?;
        self.services
            .synthesizer
            .synthesize(&spoken, &self.settings.voice, &speech)?;
        self.complete_stage(cycle, Stage::Tts)?;

        // ── 6. Play ─────────────────────────────────────────────────────
        self.advance(cycle, SystemState::Expressing)?;
        self.orchestrator.play_system_sound(Cue::ReplyReady);
        let used_fallback = self.play(cycle, &speech)?;

        if !self.orchestrator.complete_cycle(cycle) {
            return Err(PipelineError::Interrupted);
        }
        Ok(CycleOutcome {
            cycle,
            transcript: user_text,
            reply,
            spoken,
            used_fallback,
        })
    }

    /// Play `file`, retrying once on the fallback device.  Returns whether
    /// the fallback was needed.
    fn play(&self, cycle: u64, file: &Path) -> Result<bool, PipelineError> {
        let s = &self.settings;
        let first = self.play_on(cycle, file, &s.playback_device, s.playback_timeout)?;
        if first.is_some_and(|e| e.success) {
            return Ok(false);
        }

        log::warn!(
            "driver: playback on {} failed; retrying on {}",
            s.playback_device,
            s.fallback_device
        );
        let second = self.play_on(cycle, file, &s.fallback_device, s.fallback_timeout)?;
        match second {
            Some(exit) if exit.success => Ok(true),
            other => Err(exit_error("aplay", other).into()),
        }
    }

    fn play_on(
        &self,
        cycle: u64,
        file: &Path,
        device: &str,
        timeout: Duration,
    ) -> Result<Option<ProcessExit>, PipelineError> {
        let process = self.services.player.start(file, device)?;
        if !self
            .orchestrator
            .register_cycle_process(cycle, Arc::clone(&process))
        {
            return Err(PipelineError::Interrupted);
        }

        let exit = process.wait_timeout(timeout);
        if !self.orchestrator.unregister_cycle_process(cycle, &process) {
            return Err(PipelineError::Interrupted);
        }
        if exit.is_none() {
            log::warn!("driver: playback on {device} exceeded {timeout:?}; stopping it");
            terminate_gracefully(&*process, self.settings.process_grace);
        }
        Ok(exit)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn advance(&self, cycle: u64, expected: SystemState) -> Result<(), PipelineError> {
        match self.orchestrator.advance_cycle(cycle) {
            Some(state) if state == expected => Ok(()),
            _ => Err(PipelineError::Interrupted),
        }
    }

    fn complete_stage(&self, cycle: u64, stage: Stage) -> Result<(), PipelineError> {
        if self.orchestrator.mark_stage_complete(cycle, stage) {
            Ok(())
        } else {
            Err(PipelineError::Interrupted)
        }
    }

    fn finish(
        &self,
        cycle: u64,
        result: Result<CycleOutcome, PipelineError>,
    ) -> Result<CycleOutcome, PipelineError> {
        match &result {
            Ok(outcome) => log::info!("driver: cycle {cycle} spoke {:?}", outcome.spoken),
            Err(PipelineError::Interrupted) => {
                log::info!("driver: cycle {cycle} interrupted");
                if self.orchestrator.cycle_state() == (cycle, SystemState::Interrupted) {
                    self.orchestrator.complete_cycle(cycle);
                }
            }
            Err(e) => {
                log::error!("driver: cycle {cycle} failed: {e}");
                if self.orchestrator.current_cycle() == cycle {
                    self.orchestrator.force_reset_to_idle();
                    self.orchestrator.play_system_sound(Cue::Error);
                }
            }
        }
        result
    }

    /// A fresh temp file path, deleted when the returned guard drops.
    fn temp_wav(&self, prefix: &str) -> Result<TempPath, PipelineError> {
        let dir = self
            .settings
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".wav")
            .tempfile_in(dir)?;
        Ok(file.into_temp_path())
    }
}

fn exit_error(program: &'static str, exit: Option<ProcessExit>) -> ServiceError {
    match exit {
        None => ServiceError::Timeout { service: program },
        Some(exit) => ServiceError::Exit {
            program: program.to_string(),
            code: exit.code,
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::orchestrator::tests::{rig, Rig};
    use crate::pipeline::process::tests::FakeProcess;
    use crate::services::mock::{MockCapture, MockChat, MockPlayer, MockSynth, MockTranscriber};
    use std::sync::atomic::Ordering;
    use tempfile::{tempdir, TempDir};

    pub(crate) struct Harness {
        pub rig: Rig,
        pub dir: TempDir,
        pub chat: Arc<MockChat>,
        pub synth: Arc<MockSynth>,
        pub player: Arc<MockPlayer>,
        pub driver: Arc<PipelineDriver>,
    }

    fn settings(dir: &Path) -> DriverSettings {
        DriverSettings {
            mic_device: "mic".into(),
            playback_device: "speaker".into(),
            fallback_device: "default".into(),
            record: Duration::from_secs(1),
            playback_timeout: Duration::from_millis(200),
            fallback_timeout: Duration::from_millis(200),
            process_grace: Duration::from_millis(20),
            llm_model: "test-model".into(),
            voice: "test-voice".into(),
            strip_think_tags: true,
            temp_dir: Some(dir.to_path_buf()),
            validator: RecordingValidator::default(),
        }
    }

    pub(crate) fn harness(
        capture: MockCapture,
        chat: MockChat,
        synth: MockSynth,
        player: MockPlayer,
    ) -> Harness {
        let rig = rig();
        let dir = tempdir().expect("temp dir");
        let chat = Arc::new(chat);
        let synth = Arc::new(synth);
        let player = Arc::new(player);
        let services = Collaborators {
            capture: Arc::new(capture),
            transcriber: Arc::new(MockTranscriber::ok("what time is it")),
            chat: Arc::clone(&chat) as Arc<dyn ChatModel>,
            synthesizer: Arc::clone(&synth) as Arc<dyn Synthesizer>,
            player: Arc::clone(&player) as Arc<dyn AudioPlayer>,
        };
        let driver = Arc::new(PipelineDriver::new(
            Arc::clone(&rig.orchestrator),
            services,
            settings(dir.path()),
            Conversation::default(),
        ));
        Harness {
            rig,
            dir,
            chat,
            synth,
            player,
            driver,
        }
    }

    pub(crate) fn default_harness() -> Harness {
        harness(
            MockCapture::default(),
            MockChat::replying(&["<think>clock</think>It is **noon**."]),
            MockSynth::default(),
            MockPlayer::default(),
        )
    }

    fn temp_files(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    #[test]
    fn voice_cycle_runs_every_stage() {
        let h = default_harness();
        let outcome = h.driver.run_voice_cycle().unwrap();

        assert_eq!(outcome.transcript, "what time is it");
        assert_eq!(outcome.spoken, "It is noon.");
        assert!(!outcome.used_fallback);
        assert_eq!(*h.synth.texts.lock().unwrap(), vec!["It is noon."]);
        assert_eq!(*h.player.devices.lock().unwrap(), vec!["speaker"]);
        assert!(h.player.files_existed.load(Ordering::SeqCst));

        let o = &h.rig.orchestrator;
        assert_eq!(o.get_current_state(), SystemState::Idle);
        let flags = o.stage_flags();
        assert!(flags.asr_complete && flags.llm_complete && flags.tts_complete);
        assert_eq!(flags.active_count(), 0);
        assert_eq!(temp_files(&h.dir), 0);
        assert_eq!(h.driver.history_len(), 1);
    }

    #[test]
    fn model_request_carries_history() {
        let h = harness(
            MockCapture::default(),
            MockChat::replying(&["First.", "Second."]),
            MockSynth::default(),
            MockPlayer::default(),
        );
        h.driver.run_text_cycle("one").unwrap();
        h.driver.run_text_cycle("two").unwrap();

        let requests = h.chat.requests.lock().unwrap();
        let (model, messages) = &requests[1];
        assert_eq!(model, "test-model");
        let contents: Vec<_> = messages.iter().skip(1).map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "First.", "two"]);
    }

    #[test]
    fn model_failure_resets_to_idle_and_cleans_up() {
        let h = harness(
            MockCapture::default(),
            MockChat::failing(),
            MockSynth::default(),
            MockPlayer::default(),
        );
        let err = h.driver.run_voice_cycle().unwrap_err();
        assert!(matches!(err, PipelineError::Service(_)), "{err}");

        let o = &h.rig.orchestrator;
        assert_eq!(o.get_current_state(), SystemState::Idle);
        assert!(o.stage_flags().all_clear());
        assert!(h.synth.texts.lock().unwrap().is_empty());
        assert_eq!(temp_files(&h.dir), 0);
        assert!(!h.rig.leds.any_on());
    }

    #[test]
    fn empty_recording_stops_before_transcription() {
        let h = harness(
            MockCapture {
                write_nothing: true,
                ..MockCapture::default()
            },
            MockChat::replying(&["unused"]),
            MockSynth::default(),
            MockPlayer::default(),
        );
        let err = h.driver.run_voice_cycle().unwrap_err();
        assert!(
            matches!(err, PipelineError::Recording(RecordingError::TooSmall { .. })),
            "{err}"
        );
        assert!(h.chat.requests.lock().unwrap().is_empty());
        assert_eq!(h.rig.orchestrator.get_current_state(), SystemState::Idle);
    }

    #[test]
    fn failed_playback_retries_on_fallback_device() {
        let failing = Arc::new(FakeProcess {
            exit_code: 1,
            ..FakeProcess::default()
        });
        let h = harness(
            MockCapture::default(),
            MockChat::replying(&["Hello."]),
            MockSynth::default(),
            MockPlayer::with(vec![failing]),
        );
        let outcome = h.driver.run_text_cycle("hi").unwrap();
        assert!(outcome.used_fallback);
        assert_eq!(*h.player.devices.lock().unwrap(), vec!["speaker", "default"]);
    }

    #[test]
    fn playback_that_fails_twice_is_an_error() {
        let failing = || {
            Arc::new(FakeProcess {
                exit_code: 1,
                ..FakeProcess::default()
            })
        };
        let h = harness(
            MockCapture::default(),
            MockChat::replying(&["Hello."]),
            MockSynth::default(),
            MockPlayer::with(vec![failing(), failing()]),
        );
        let err = h.driver.run_text_cycle("hi").unwrap_err();
        assert!(matches!(err, PipelineError::Service(ServiceError::Exit { .. })), "{err}");
        assert_eq!(h.rig.orchestrator.get_current_state(), SystemState::Idle);
    }

    #[test]
    fn interruption_mid_stage_stops_the_cycle() {
        let h = default_harness();
        let o = Arc::clone(&h.rig.orchestrator);
        let hook: Box<dyn FnMut() + Send> = Box::new(move || {
            o.request_interruption();
        });
        *h.chat.on_call.lock().unwrap() = Some(hook);

        let err = h.driver.run_voice_cycle().unwrap_err();
        assert!(matches!(err, PipelineError::Interrupted));
        assert!(h.synth.texts.lock().unwrap().is_empty());
        assert_eq!(h.rig.orchestrator.get_current_state(), SystemState::Idle);
        assert_eq!(h.rig.orchestrator.previous_state(), SystemState::Interrupted);
    }

    #[test]
    fn replaced_cycle_leaves_the_new_one_untouched() {
        let h = default_harness();
        let o = Arc::clone(&h.rig.orchestrator);
        let hook: Box<dyn FnMut() + Send> = Box::new(move || {
            o.start_pipeline_flow(InputType::Voice);
        });
        *h.chat.on_call.lock().unwrap() = Some(hook);

        let err = h.driver.run_text_cycle("hi").unwrap_err();
        assert!(matches!(err, PipelineError::Interrupted));

        let o = &h.rig.orchestrator;
        assert_eq!(o.get_current_state(), SystemState::Listening);
        let flags = o.stage_flags();
        assert!(flags.asr_active);
        assert!(!flags.asr_complete && !flags.llm_complete && !flags.tts_complete);
        assert_eq!(h.driver.history_len(), 0);
        assert!(h.synth.texts.lock().unwrap().is_empty());
    }

    #[test]
    fn unspeakable_reply_is_rejected() {
        let h = harness(
            MockCapture::default(),
            MockChat::replying(&["<think>only thoughts</think>"]),
            MockSynth::default(),
            MockPlayer::default(),
        );
        let err = h.driver.run_text_cycle("hi").unwrap_err();
        assert!(matches!(err, PipelineError::EmptyReply));
        assert_eq!(h.rig.orchestrator.get_current_state(), SystemState::Idle);
    }
}
