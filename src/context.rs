//! The device context: every long-lived component, built once at startup.

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::feedback::{
    ActivityConfig, ActivityIndicatorManager, BlinkTimings, LedBlinkManager, SoundWorker,
};
use crate::hardware::HardwareSet;
use crate::pipeline::{
    Collaborators, Conversation, DriverSettings, Feedback, Orchestrator, OrchestratorConfig,
    PipelineDriver,
};
use crate::services::{AplayPlayer, ArecordCapture, HttpTranscriber, OllamaChat, PiperSynthesizer};

pub struct DeviceContext {
    pub orchestrator: Arc<Orchestrator>,
    pub driver: Arc<PipelineDriver>,
}

impl DeviceContext {
    /// Build hardware, feedback managers, the orchestrator and a driver wired
    /// to the real collaborators.
    ///
    /// Creates blocking HTTP clients, so call this outside an async context.
    pub fn build(config: &AppConfig, force_simulated: bool) -> anyhow::Result<Self> {
        let services = Collaborators {
            capture: Arc::new(ArecordCapture::from_config(&config.audio)),
            transcriber: Arc::new(HttpTranscriber::from_config(&config.services)),
            chat: Arc::new(OllamaChat::from_config(&config.services)),
            synthesizer: Arc::new(PiperSynthesizer::from_config(&config.services)),
            player: Arc::new(AplayPlayer::new()),
        };
        let hardware = HardwareSet::from_config(&config.hardware, force_simulated);
        Self::with_services(config, hardware, services)
    }

    /// Build around caller-supplied hardware and collaborators.
    pub fn with_services(
        config: &AppConfig,
        hardware: HardwareSet,
        services: Collaborators,
    ) -> anyhow::Result<Self> {
        let feedback = feedback(config, hardware);
        let orchestrator = Orchestrator::new(feedback, OrchestratorConfig::from(&config.pipeline));

        if let Some(dir) = &config.audio.temp_dir {
            std::fs::create_dir_all(dir)
                .map_err(|e| anyhow::anyhow!("cannot create temp dir {}: {e}", dir.display()))?;
        }

        let conversation = Conversation::new(
            config.pipeline.history_len,
            config.services.system_prompt.as_deref(),
        );
        let driver = Arc::new(PipelineDriver::new(
            Arc::clone(&orchestrator),
            services,
            DriverSettings::from(config),
            conversation,
        ));

        Ok(Self {
            orchestrator,
            driver,
        })
    }

    /// Abort any running cycle and put every feedback device at rest.
    pub fn shutdown(&self) {
        if self.orchestrator.is_system_busy() {
            self.orchestrator.force_reset_to_idle();
        }
        self.orchestrator.shutdown();
    }
}

fn feedback(config: &AppConfig, hardware: HardwareSet) -> Feedback {
    let hw = &config.hardware;
    let sound = if hw.sound_enabled {
        match SoundWorker::start(
            hardware.buzzer_factory,
            Duration::from_millis(hw.sound_slice_ms),
        ) {
            Ok(worker) => Some(Arc::new(worker)),
            Err(e) => {
                log::warn!("context: buzzer unavailable ({e}); running without sound");
                None
            }
        }
    } else {
        log::info!("context: sound feedback disabled");
        None
    };

    Feedback {
        sound,
        leds: Arc::new(LedBlinkManager::new(hardware.leds, BlinkTimings::from(hw))),
        activity: Arc::new(ActivityIndicatorManager::new(
            hardware.strip,
            ActivityConfig::from(hw),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SystemState;
    use crate::services::mock::{MockCapture, MockChat, MockPlayer, MockSynth, MockTranscriber};
    use tempfile::tempdir;

    fn mock_services() -> Collaborators {
        Collaborators {
            capture: Arc::new(MockCapture::default()),
            transcriber: Arc::new(MockTranscriber::ok("hello")),
            chat: Arc::new(MockChat::replying(&["Hi there."])),
            synthesizer: Arc::new(MockSynth::default()),
            player: Arc::new(MockPlayer::default()),
        }
    }

    #[test]
    fn simulated_context_runs_a_voice_cycle() {
        let dir = tempdir().expect("temp dir");
        let mut config = AppConfig::default();
        config.audio.temp_dir = Some(dir.path().join("work"));
        config.pipeline.state_timeouts_secs.clear();

        let ctx = DeviceContext::with_services(
            &config,
            HardwareSet::simulated(&config.hardware),
            mock_services(),
        )
        .unwrap();
        let outcome = ctx.driver.run_voice_cycle().unwrap();
        assert_eq!(outcome.spoken, "Hi there.");
        assert_eq!(ctx.orchestrator.get_current_state(), SystemState::Idle);
        ctx.shutdown();
    }

    #[test]
    fn disabled_sound_builds_without_worker() {
        let mut config = AppConfig::default();
        config.hardware.sound_enabled = false;
        config.pipeline.state_timeouts_secs.clear();

        let ctx = DeviceContext::with_services(
            &config,
            HardwareSet::simulated(&config.hardware),
            mock_services(),
        )
        .unwrap();
        assert!(ctx.orchestrator.feedback().sound.is_none());
        ctx.shutdown();
    }
}
