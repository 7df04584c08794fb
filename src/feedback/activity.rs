//! Per-stage activity channels on the RGB strip.
//!
//! ```text
//!            set_active            set_finished
//!   Off ───────────────▶ Active ───────────────▶ Finished
//!    ▲                     │                        │
//!    └──── set_all_leds_off / cycle_complete ───────┘
//! ```
//!
//! An active channel blinks its pixel; a finished channel holds it solid.
//! `cycle_complete` flashes every channel that took part in the cycle
//! together and leaves them dark.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::config::{ChannelConfig, HardwareConfig};
use crate::hardware::{PixelStrip, Rgb};
use crate::sync::lock;

use super::blink::BlinkHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityChannel {
    Asr,
    Llm,
    Tts,
}

impl ActivityChannel {
    pub const ALL: [ActivityChannel; 3] = [Self::Asr, Self::Llm, Self::Tts];

    fn index(self) -> usize {
        match self {
            Self::Asr => 0,
            Self::Llm => 1,
            Self::Tts => 2,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Asr => "asr",
            Self::Llm => "llm",
            Self::Tts => "tts",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Off,
    Active,
    Finished,
}

/// Pipeline status as understood by the activity strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityStatus {
    Listening,
    Transcribing,
    Thinking,
    Speaking,
    Playing,
    Idle,
    Interrupted,
}

#[derive(Debug, Error)]
#[error("unknown activity status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for ActivityStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "listening" | "recording" => Ok(Self::Listening),
            "transcribing" | "processing_speech" => Ok(Self::Transcribing),
            "thinking" | "contemplating" => Ok(Self::Thinking),
            "speaking" | "synthesizing" => Ok(Self::Speaking),
            "playing" | "expressing" => Ok(Self::Playing),
            "idle" => Ok(Self::Idle),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Strip layout and timings for the three channels.
#[derive(Debug, Clone)]
pub struct ActivityConfig {
    pub channels: [ChannelConfig; 3],
    pub blink: Duration,
    pub flourish_flashes: u32,
    pub flourish: Duration,
}

impl From<&HardwareConfig> for ActivityConfig {
    fn from(hw: &HardwareConfig) -> Self {
        Self {
            channels: [hw.asr_channel, hw.llm_channel, hw.tts_channel],
            blink: Duration::from_millis(hw.activity_blink_ms),
            flourish_flashes: hw.flourish_flashes,
            flourish: Duration::from_millis(hw.flourish_ms),
        }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self::from(&HardwareConfig::default())
    }
}

#[derive(Debug, Default)]
struct Slot {
    active: bool,
    finished: bool,
    blink: Option<BlinkHandle>,
}

#[derive(Debug, Default)]
struct Channels {
    slots: [Slot; 3],
    flourish: Option<BlinkHandle>,
}

pub struct ActivityIndicatorManager {
    strip: Arc<dyn PixelStrip>,
    config: ActivityConfig,
    inner: Mutex<Channels>,
}

impl ActivityIndicatorManager {
    /// Take ownership of `strip` and clear it.
    pub fn new(strip: Arc<dyn PixelStrip>, config: ActivityConfig) -> Self {
        let manager = Self {
            strip,
            config,
            inner: Mutex::new(Channels::default()),
        };
        manager.set_all_leds_off();
        manager
    }

    pub fn channel_state(&self, channel: ActivityChannel) -> ChannelState {
        let inner = lock(&self.inner);
        let slot = &inner.slots[channel.index()];
        match (slot.active, slot.finished) {
            (true, _) => ChannelState::Active,
            (false, true) => ChannelState::Finished,
            (false, false) => ChannelState::Off,
        }
    }

    /// Start blinking `channel`, replacing any blink already on it.
    pub fn set_active(&self, channel: ActivityChannel) {
        let mut inner = lock(&self.inner);
        if let Some(flourish) = inner.flourish.take() {
            flourish.cancel();
        }

        let slot = &mut inner.slots[channel.index()];
        if let Some(old) = slot.blink.take() {
            old.cancel();
        }

        let ChannelConfig { pixel, colour } = self.config.channels[channel.index()];
        let period = self.config.blink;
        let strip = Arc::clone(&self.strip);
        slot.blink = Some(BlinkHandle::spawn(channel.name(), move |stop| {
            loop {
                paint(&*strip, &[pixel], colour);
                if stop.wait_timeout(period) {
                    break;
                }
                paint(&*strip, &[pixel], Rgb::OFF);
                if stop.wait_timeout(period) {
                    break;
                }
            }
        }));
        slot.active = true;
        slot.finished = false;
        log::debug!("activity: {} active", channel.name());
    }

    /// Hold `channel` solid.  Ignored unless the channel is active.
    pub fn set_finished(&self, channel: ActivityChannel) {
        let mut inner = lock(&self.inner);
        let slot = &mut inner.slots[channel.index()];
        if !slot.active {
            return;
        }
        if let Some(blink) = slot.blink.take() {
            blink.cancel();
        }
        slot.active = false;
        slot.finished = true;

        let ChannelConfig { pixel, colour } = self.config.channels[channel.index()];
        paint(&*self.strip, &[pixel], colour);
        log::debug!("activity: {} finished", channel.name());
    }

    pub fn set_asr_active(&self) {
        self.set_active(ActivityChannel::Asr);
    }

    pub fn set_asr_finished(&self) {
        self.set_finished(ActivityChannel::Asr);
    }

    pub fn set_llm_active(&self) {
        self.set_active(ActivityChannel::Llm);
    }

    pub fn set_llm_finished(&self) {
        self.set_finished(ActivityChannel::Llm);
    }

    pub fn set_tts_active(&self) {
        self.set_active(ActivityChannel::Tts);
    }

    pub fn set_tts_finished(&self) {
        self.set_finished(ActivityChannel::Tts);
    }

    /// Stop every blink and the flourish, zero every channel, clear the strip.
    pub fn set_all_leds_off(&self) {
        let mut inner = lock(&self.inner);
        if let Some(flourish) = inner.flourish.take() {
            flourish.cancel();
        }
        for slot in inner.slots.iter_mut() {
            if let Some(blink) = slot.blink.take() {
                blink.cancel();
            }
            slot.active = false;
            slot.finished = false;
        }
        if let Err(e) = self.strip.clear() {
            log::warn!("activity: strip clear failed: {e}");
        }
    }

    /// Flash every channel that took part in this cycle, then leave them off.
    ///
    /// Returns `false` (and spawns nothing) when no channel participated.
    pub fn cycle_complete(&self) -> bool {
        let mut inner = lock(&self.inner);
        let participants: Vec<ActivityChannel> = ActivityChannel::ALL
            .into_iter()
            .filter(|c| {
                let slot = &inner.slots[c.index()];
                slot.active || slot.finished
            })
            .collect();
        if participants.is_empty() {
            return false;
        }

        for channel in &participants {
            let slot = &mut inner.slots[channel.index()];
            if let Some(blink) = slot.blink.take() {
                blink.cancel();
            }
            slot.active = false;
            slot.finished = false;
        }
        if let Some(old) = inner.flourish.take() {
            old.cancel();
        }

        let lit: Vec<(usize, Rgb)> = participants
            .iter()
            .map(|c| {
                let cfg = self.config.channels[c.index()];
                (cfg.pixel, cfg.colour)
            })
            .collect();
        let flashes = self.config.flourish_flashes;
        let period = self.config.flourish;
        let strip = Arc::clone(&self.strip);
        inner.flourish = Some(BlinkHandle::spawn("flourish", move |stop| {
            let pixels: Vec<usize> = lit.iter().map(|(p, _)| *p).collect();
            for _ in 0..flashes {
                for (pixel, colour) in &lit {
                    set_pixel(&*strip, *pixel, *colour);
                }
                latch(&*strip);
                if stop.wait_timeout(period) {
                    break;
                }
                paint(&*strip, &pixels, Rgb::OFF);
                if stop.wait_timeout(period) {
                    break;
                }
            }
            paint(&*strip, &pixels, Rgb::OFF);
        }));

        log::debug!("activity: cycle complete ({} channel(s))", participants.len());
        true
    }

    /// `true` while the cycle-complete flourish is still running.
    pub fn flourish_running(&self) -> bool {
        lock(&self.inner)
            .flourish
            .as_ref()
            .is_some_and(BlinkHandle::is_live)
    }

    /// Move the channels to match a pipeline status, finishing the previous
    /// stage before activating the next.
    pub fn update_from_pipeline_status(&self, status: ActivityStatus) {
        match status {
            ActivityStatus::Listening => self.set_asr_active(),
            ActivityStatus::Transcribing => self.set_asr_finished(),
            ActivityStatus::Thinking => {
                self.set_asr_finished();
                self.set_llm_active();
            }
            ActivityStatus::Speaking => {
                self.set_llm_finished();
                self.set_tts_active();
            }
            ActivityStatus::Playing => self.set_tts_finished(),
            ActivityStatus::Idle => {
                self.cycle_complete();
            }
            ActivityStatus::Interrupted => self.set_all_leds_off(),
        }
    }
}

impl Drop for ActivityIndicatorManager {
    fn drop(&mut self) {
        self.set_all_leds_off();
    }
}

fn set_pixel(strip: &dyn PixelStrip, pixel: usize, colour: Rgb) {
    if let Err(e) = strip.set_pixel(pixel, colour) {
        log::warn!("activity: pixel {pixel} write failed: {e}");
    }
}

fn latch(strip: &dyn PixelStrip) {
    if let Err(e) = strip.show() {
        log::warn!("activity: strip show failed: {e}");
    }
}

fn paint(strip: &dyn PixelStrip, pixels: &[usize], colour: Rgb) {
    for pixel in pixels {
        set_pixel(strip, *pixel, colour);
    }
    latch(strip);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimPixelStrip;

    fn manager() -> (ActivityIndicatorManager, Arc<SimPixelStrip>) {
        let strip = Arc::new(SimPixelStrip::new(7));
        let config = ActivityConfig {
            blink: Duration::from_millis(10),
            flourish: Duration::from_millis(10),
            ..ActivityConfig::default()
        };
        let m = ActivityIndicatorManager::new(Arc::clone(&strip) as Arc<dyn PixelStrip>, config);
        (m, strip)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn finished_only_follows_active() {
        let (m, _strip) = manager();
        m.set_llm_finished();
        assert_eq!(m.channel_state(ActivityChannel::Llm), ChannelState::Off);

        m.set_llm_active();
        m.set_llm_finished();
        assert_eq!(m.channel_state(ActivityChannel::Llm), ChannelState::Finished);
    }

    #[test]
    fn finished_channel_is_solid() {
        let (m, strip) = manager();
        m.set_asr_active();
        m.set_asr_finished();
        let cfg = HardwareConfig::default().asr_channel;
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(strip.pixels()[cfg.pixel], cfg.colour);
    }

    #[test]
    fn cycle_complete_without_participants_is_noop() {
        let (m, strip) = manager();
        let shows = strip.show_count();
        assert!(!m.cycle_complete());
        assert!(!m.flourish_running());
        assert_eq!(strip.show_count(), shows);
        for c in ActivityChannel::ALL {
            assert_eq!(m.channel_state(c), ChannelState::Off);
        }
    }

    #[test]
    fn cycle_complete_flashes_and_ends_dark() {
        let (m, strip) = manager();
        m.update_from_pipeline_status(ActivityStatus::Listening);
        m.update_from_pipeline_status(ActivityStatus::Thinking);
        m.update_from_pipeline_status(ActivityStatus::Speaking);
        m.update_from_pipeline_status(ActivityStatus::Playing);
        assert_eq!(m.channel_state(ActivityChannel::Tts), ChannelState::Finished);

        assert!(m.cycle_complete());
        for c in ActivityChannel::ALL {
            assert_eq!(m.channel_state(c), ChannelState::Off);
        }
        assert!(wait_for(|| !m.flourish_running()));
        assert!(strip.pixels().iter().all(Rgb::is_off));
    }

    #[test]
    fn status_strings_parse() {
        assert_eq!("thinking".parse::<ActivityStatus>().unwrap(), ActivityStatus::Thinking);
        assert_eq!("Playing".parse::<ActivityStatus>().unwrap(), ActivityStatus::Playing);
        assert_eq!("speaking".parse::<ActivityStatus>().unwrap(), ActivityStatus::Speaking);
        assert!("dancing".parse::<ActivityStatus>().is_err());
    }

    #[test]
    fn interrupted_clears_everything() {
        let (m, strip) = manager();
        m.set_asr_active();
        m.set_llm_active();
        m.update_from_pipeline_status(ActivityStatus::Interrupted);
        for c in ActivityChannel::ALL {
            assert_eq!(m.channel_state(c), ChannelState::Off);
        }
        assert!(strip.pixels().iter().all(Rgb::is_off));
    }
}
