//! Linux sysfs device backends.
//!
//! * Indicator LEDs use the LED class: writing `1`/`0` to
//!   `/sys/class/leds/<led>/brightness`.
//! * The strip uses multicolour LED class devices, one per pixel, named
//!   `<prefix><index>`; each exposes `multi_intensity` (`"r g b"`) and
//!   `brightness`.
//! * The buzzer is a PWM channel directory
//!   (`/sys/class/pwm/pwmchip0/pwm0`) already exported by the board setup.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{Buzzer, HardwareError, LedBank, PixelStrip, Rgb};
use crate::sync::lock;

fn write_attr(path: &Path, value: &str) -> Result<(), HardwareError> {
    fs::write(path, value).map_err(|e| HardwareError::io(path.display().to_string(), e))
}

// ---------------------------------------------------------------------------
// SysfsLedBank
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SysfsLedBank {
    leds: BTreeMap<String, PathBuf>,
}

impl SysfsLedBank {
    /// `leds` maps indicator name → LED class directory.
    pub fn new(leds: BTreeMap<String, PathBuf>) -> Self {
        Self { leds }
    }
}

impl LedBank for SysfsLedBank {
    fn set(&self, name: &str, on: bool) -> Result<(), HardwareError> {
        let dir = self
            .leds
            .get(name)
            .ok_or_else(|| HardwareError::UnknownDevice(name.to_string()))?;
        write_attr(&dir.join("brightness"), if on { "1" } else { "0" })
    }

    fn names(&self) -> Vec<String> {
        self.leds.keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// SysfsBuzzer
// ---------------------------------------------------------------------------

/// Lowest and highest frequencies the PWM buzzer is driven at.
const MIN_FREQ_HZ: f32 = 20.0;
const MAX_FREQ_HZ: f32 = 20_000.0;

#[derive(Debug)]
pub struct SysfsBuzzer {
    channel: PathBuf,
}

impl SysfsBuzzer {
    /// Open an exported PWM channel and make sure it is silent.
    pub fn open(channel: impl AsRef<Path>) -> Result<Self, HardwareError> {
        let channel = channel.as_ref().to_path_buf();
        if !channel.is_dir() {
            return Err(HardwareError::UnknownDevice(channel.display().to_string()));
        }
        let buzzer = Self { channel };
        buzzer.stop()?;
        Ok(buzzer)
    }
}

impl Buzzer for SysfsBuzzer {
    fn play(&self, freq_hz: f32) -> Result<(), HardwareError> {
        if !(MIN_FREQ_HZ..=MAX_FREQ_HZ).contains(&freq_hz) {
            return Err(HardwareError::Rejected(format!(
                "frequency {freq_hz} Hz out of range"
            )));
        }
        let period_ns = (1_000_000_000.0 / freq_hz) as u64;

        // duty_cycle must never exceed period, so zero it before resizing.
        write_attr(&self.channel.join("duty_cycle"), "0")?;
        write_attr(&self.channel.join("period"), &period_ns.to_string())?;
        write_attr(&self.channel.join("duty_cycle"), &(period_ns / 2).to_string())?;
        write_attr(&self.channel.join("enable"), "1")
    }

    fn stop(&self) -> Result<(), HardwareError> {
        write_attr(&self.channel.join("enable"), "0")
    }
}

// ---------------------------------------------------------------------------
// SysfsPixelStrip
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SysfsPixelStrip {
    prefix: PathBuf,
    pending: Mutex<Vec<Rgb>>,
}

impl SysfsPixelStrip {
    pub fn new(prefix: PathBuf, len: usize) -> Self {
        Self {
            prefix,
            pending: Mutex::new(vec![Rgb::OFF; len]),
        }
    }

    fn pixel_dir(&self, index: usize) -> PathBuf {
        let mut name = self.prefix.as_os_str().to_os_string();
        name.push(index.to_string());
        PathBuf::from(name)
    }
}

impl PixelStrip for SysfsPixelStrip {
    fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    fn set_pixel(&self, index: usize, colour: Rgb) -> Result<(), HardwareError> {
        let mut pending = lock(&self.pending);
        let px = pending
            .get_mut(index)
            .ok_or_else(|| HardwareError::UnknownDevice(format!("pixel {index}")))?;
        *px = colour;
        Ok(())
    }

    fn show(&self) -> Result<(), HardwareError> {
        let pending = lock(&self.pending).clone();
        for (i, Rgb(r, g, b)) in pending.into_iter().enumerate() {
            let dir = self.pixel_dir(i);
            write_attr(&dir.join("multi_intensity"), &format!("{r} {g} {b}"))?;
            let lit = r > 0 || g > 0 || b > 0;
            write_attr(&dir.join("brightness"), if lit { "255" } else { "0" })?;
        }
        Ok(())
    }
}
