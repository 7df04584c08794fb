//! Named on/off indicator LEDs.
//!
//! Each LED name owns at most one [`BlinkHandle`].  The synthetic `"all"`
//! key owns the group blink, which is mutually exclusive with individual
//! blinks.  The handle map stays locked across every stop-then-start, so two
//! callers racing on the same name cannot both leave a thread behind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::HardwareConfig;
use crate::hardware::LedBank;
use crate::sync::lock;

use super::blink::BlinkHandle;

/// Key of the group blink in the handle map.
pub const ALL_KEY: &str = "all";

/// Coarse pipeline progress, as shown on the indicator LEDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStage {
    Recording,
    Asr,
    Llm,
    Tts,
    Playing,
    Idle,
}

/// Blink timings used by [`LedBlinkManager::show_progress`].
#[derive(Debug, Clone, Copy)]
pub struct BlinkTimings {
    pub normal: Duration,
    pub fast: Duration,
}

impl Default for BlinkTimings {
    fn default() -> Self {
        Self {
            normal: Duration::from_millis(300),
            fast: Duration::from_millis(120),
        }
    }
}

impl From<&HardwareConfig> for BlinkTimings {
    fn from(cfg: &HardwareConfig) -> Self {
        Self {
            normal: Duration::from_millis(cfg.blink_ms),
            fast: Duration::from_millis(cfg.fast_blink_ms),
        }
    }
}

pub struct LedBlinkManager {
    leds: Arc<dyn LedBank>,
    blinks: Mutex<HashMap<String, BlinkHandle>>,
    timings: BlinkTimings,
}

impl LedBlinkManager {
    /// Wrap `leds` and force every LED off.
    pub fn new(leds: Arc<dyn LedBank>, timings: BlinkTimings) -> Self {
        let manager = Self {
            leds,
            blinks: Mutex::new(HashMap::new()),
            timings,
        };
        manager.all_off();
        manager
    }

    pub fn names(&self) -> Vec<String> {
        self.leds.names()
    }

    /// Start blinking `name`, replacing any blink already running on it.
    pub fn blink_led(&self, name: &str, on_time: Duration, off_time: Duration) {
        let mut blinks = lock(&self.blinks);
        stop_key(&mut blinks, name);

        let leds = Arc::clone(&self.leds);
        let led = name.to_string();
        let handle = BlinkHandle::spawn(name, move |stop| {
            loop {
                write(&*leds, &led, true);
                if stop.wait_timeout(on_time) {
                    break;
                }
                write(&*leds, &led, false);
                if stop.wait_timeout(off_time) {
                    break;
                }
            }
            write(&*leds, &led, false);
        });
        blinks.insert(name.to_string(), handle);
    }

    /// Blink every LED in unison.  Individual blinks are stopped first.
    pub fn blink_all_leds(&self, on_time: Duration, off_time: Duration) {
        let mut blinks = lock(&self.blinks);
        let keys: Vec<String> = blinks.keys().cloned().collect();
        for key in keys {
            stop_key(&mut blinks, &key);
        }

        let leds = Arc::clone(&self.leds);
        let handle = BlinkHandle::spawn(ALL_KEY, move |stop| {
            let names = leds.names();
            loop {
                names.iter().for_each(|n| write(&*leds, n, true));
                if stop.wait_timeout(on_time) {
                    break;
                }
                names.iter().for_each(|n| write(&*leds, n, false));
                if stop.wait_timeout(off_time) {
                    break;
                }
            }
            names.iter().for_each(|n| write(&*leds, n, false));
        });
        blinks.insert(ALL_KEY.to_string(), handle);
    }

    /// Stop the blink on `name`, if any.  Idempotent.
    pub fn stop_led(&self, name: &str) {
        stop_key(&mut lock(&self.blinks), name);
    }

    /// Stop every blink, then force every LED off.
    pub fn stop_all_leds(&self) {
        let mut blinks = lock(&self.blinks);
        for (_, handle) in blinks.drain() {
            handle.cancel();
        }
        // A thread that timed out on join may have left its LED lit.
        self.all_off();
    }

    /// Stop whatever is blinking on `name` (and any group blink), then set it
    /// solid on or off.
    pub fn set_led(&self, name: &str, on: bool) {
        let mut blinks = lock(&self.blinks);
        stop_key(&mut blinks, name);
        stop_key(&mut blinks, ALL_KEY);
        write(&*self.leds, name, on);
    }

    /// Number of blink threads still running.
    pub fn live_blinks(&self) -> usize {
        lock(&self.blinks).values().filter(|h| h.is_live()).count()
    }

    pub fn is_blinking(&self, name: &str) -> bool {
        lock(&self.blinks).get(name).is_some_and(BlinkHandle::is_live)
    }

    /// Show a pipeline stage on the indicators.
    ///
    /// | Stage     | Pattern           |
    /// |-----------|-------------------|
    /// | Recording | `B` fast blink    |
    /// | Asr       | `A` blink         |
    /// | Llm       | `C` slow blink    |
    /// | Tts       | `C` fast blink    |
    /// | Playing   | all LEDs blink    |
    /// | Idle      | all off           |
    pub fn show_progress(&self, stage: ProgressStage) {
        self.stop_all_leds();
        let BlinkTimings { normal, fast } = self.timings;
        match stage {
            ProgressStage::Recording => self.blink_led("B", fast, fast),
            ProgressStage::Asr => self.blink_led("A", normal, normal),
            ProgressStage::Llm => self.blink_led("C", normal * 2, normal * 2),
            ProgressStage::Tts => self.blink_led("C", fast, fast),
            ProgressStage::Playing => self.blink_all_leds(normal, normal),
            ProgressStage::Idle => {}
        }
        log::debug!("leds: progress {stage:?}");
    }

    fn all_off(&self) {
        for name in self.leds.names() {
            write(&*self.leds, &name, false);
        }
    }
}

impl Drop for LedBlinkManager {
    fn drop(&mut self) {
        self.stop_all_leds();
    }
}

fn stop_key(blinks: &mut HashMap<String, BlinkHandle>, key: &str) {
    if let Some(handle) = blinks.remove(key) {
        handle.cancel();
    }
}

fn write(leds: &dyn LedBank, name: &str, on: bool) {
    if let Err(e) = leds.set(name, on) {
        log::warn!("leds: {name} -> {on} failed: {e}");
    }
}
