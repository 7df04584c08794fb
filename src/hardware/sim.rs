//! In-memory devices.
//!
//! Used when no feedback hardware is attached (development machines, CI) and
//! by the unit tests, which read the recorded state back to assert on what the
//! managers did.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{Buzzer, HardwareError, LedBank, PixelStrip, Rgb};
use crate::sync::lock;

// ---------------------------------------------------------------------------
// SimBuzzer
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct SimBuzzer {
    sounding: Mutex<Option<f32>>,
    played: Mutex<Vec<f32>>,
    stops: AtomicUsize,
    fail_play: AtomicBool,
}

impl SimBuzzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `play` fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.fail_play.store(failing, Ordering::SeqCst);
    }

    /// Every frequency passed to `play`, in order.
    pub fn played(&self) -> Vec<f32> {
        lock(&self.played).clone()
    }

    pub fn sounding(&self) -> Option<f32> {
        *lock(&self.sounding)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Buzzer for SimBuzzer {
    fn play(&self, freq_hz: f32) -> Result<(), HardwareError> {
        if self.fail_play.load(Ordering::SeqCst) {
            return Err(HardwareError::Rejected("simulated buzzer fault".into()));
        }
        log::trace!("sim-buzzer: play {freq_hz:.1} Hz");
        *lock(&self.sounding) = Some(freq_hz);
        lock(&self.played).push(freq_hz);
        Ok(())
    }

    fn stop(&self) -> Result<(), HardwareError> {
        *lock(&self.sounding) = None;
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SimLedBank
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SimLedBank {
    leds: Mutex<BTreeMap<String, bool>>,
    writes: AtomicUsize,
}

impl SimLedBank {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let leds = names.into_iter().map(|n| (n.into(), false)).collect();
        Self {
            leds: Mutex::new(leds),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn is_on(&self, name: &str) -> bool {
        lock(&self.leds).get(name).copied().unwrap_or(false)
    }

    pub fn any_on(&self) -> bool {
        lock(&self.leds).values().any(|on| *on)
    }

    /// Total number of successful writes; lets tests observe blink activity.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl LedBank for SimLedBank {
    fn set(&self, name: &str, on: bool) -> Result<(), HardwareError> {
        let mut leds = lock(&self.leds);
        match leds.get_mut(name) {
            Some(state) => {
                *state = on;
                self.writes.fetch_add(1, Ordering::SeqCst);
                log::trace!("sim-leds: {name} -> {}", if on { "on" } else { "off" });
                Ok(())
            }
            None => Err(HardwareError::UnknownDevice(name.to_string())),
        }
    }

    fn names(&self) -> Vec<String> {
        lock(&self.leds).keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// SimPixelStrip
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SimPixelStrip {
    pending: Mutex<Vec<Rgb>>,
    shown: Mutex<Vec<Rgb>>,
    shows: AtomicUsize,
}

impl SimPixelStrip {
    pub fn new(len: usize) -> Self {
        Self {
            pending: Mutex::new(vec![Rgb::OFF; len]),
            shown: Mutex::new(vec![Rgb::OFF; len]),
            shows: AtomicUsize::new(0),
        }
    }

    /// The colours most recently latched with `show`.
    pub fn pixels(&self) -> Vec<Rgb> {
        lock(&self.shown).clone()
    }

    pub fn show_count(&self) -> usize {
        self.shows.load(Ordering::SeqCst)
    }
}

impl PixelStrip for SimPixelStrip {
    fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    fn set_pixel(&self, index: usize, colour: Rgb) -> Result<(), HardwareError> {
        let mut pending = lock(&self.pending);
        match pending.get_mut(index) {
            Some(px) => {
                *px = colour;
                Ok(())
            }
            None => Err(HardwareError::UnknownDevice(format!("pixel {index}"))),
        }
    }

    fn show(&self) -> Result<(), HardwareError> {
        let pending = lock(&self.pending).clone();
        *lock(&self.shown) = pending;
        self.shows.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
