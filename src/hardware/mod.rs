//! Hardware abstraction for the feedback devices.
//!
//! The pipeline drives three kinds of device:
//!
//! * a piezo [`Buzzer`] for short tones,
//! * a bank of named on/off indicator LEDs ([`LedBank`]), and
//! * a small RGB [`PixelStrip`] used for the per-stage activity channels.
//!
//! Each device handle is owned by exactly one feedback manager.  Every call is
//! fallible with [`HardwareError`]; callers treat a failure as best-effort
//! feedback that was skipped, never as a pipeline failure.
//!
//! Two backends exist:
//!
//! | Backend     | Devices                                                   |
//! |-------------|-----------------------------------------------------------|
//! | `simulated` | in-memory state, logged at `trace`; no hardware required  |
//! | `sysfs`     | `/sys/class/leds/*/brightness` and a `/sys/class/pwm` pin |

pub mod sim;
pub mod sysfs;

use std::sync::Arc;

use thiserror::Error;

use crate::config::{HardwareBackend, HardwareConfig};

pub use sim::{SimBuzzer, SimLedBank, SimPixelStrip};
pub use sysfs::{SysfsBuzzer, SysfsLedBank, SysfsPixelStrip};

// ---------------------------------------------------------------------------
// HardwareError
// ---------------------------------------------------------------------------

/// Failures reported by a feedback device.
#[derive(Debug, Error)]
pub enum HardwareError {
    /// The device node could not be opened or written.
    #[error("device I/O failed on {device}: {source}")]
    Io {
        device: String,
        #[source]
        source: std::io::Error,
    },

    /// No device is registered under the given name or index.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The device rejected the request (e.g. frequency out of range).
    #[error("device rejected request: {0}")]
    Rejected(String),
}

impl HardwareError {
    pub(crate) fn io(device: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            device: device.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Rgb
// ---------------------------------------------------------------------------

/// A 24-bit colour for one strip pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const OFF: Rgb = Rgb(0, 0, 0);

    pub fn is_off(&self) -> bool {
        *self == Self::OFF
    }
}

// ---------------------------------------------------------------------------
// Device traits
// ---------------------------------------------------------------------------

/// A tone generator.
pub trait Buzzer: Send + Sync {
    /// Start sounding `freq_hz` until [`stop`](Buzzer::stop) is called.
    fn play(&self, freq_hz: f32) -> Result<(), HardwareError>;

    /// Silence the buzzer.  Must be safe to call when already silent.
    fn stop(&self) -> Result<(), HardwareError>;
}

/// A set of independently switchable indicator LEDs addressed by name.
pub trait LedBank: Send + Sync {
    /// Drive the LED called `name` on or off.
    fn set(&self, name: &str, on: bool) -> Result<(), HardwareError>;

    /// Names of every LED in the bank.
    fn names(&self) -> Vec<String>;
}

/// An addressable RGB strip.  Writes are latched by [`show`](PixelStrip::show).
pub trait PixelStrip: Send + Sync {
    fn len(&self) -> usize;

    fn set_pixel(&self, index: usize, colour: Rgb) -> Result<(), HardwareError>;

    fn show(&self) -> Result<(), HardwareError>;

    /// Set every pixel off and latch.
    fn clear(&self) -> Result<(), HardwareError> {
        for i in 0..self.len() {
            self.set_pixel(i, Rgb::OFF)?;
        }
        self.show()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Constructs a fresh buzzer handle.  Used to reinitialise after a fault.
pub type BuzzerFactory = Arc<dyn Fn() -> Result<Arc<dyn Buzzer>, HardwareError> + Send + Sync>;

// ---------------------------------------------------------------------------
// HardwareSet
// ---------------------------------------------------------------------------

/// The three device handles a device context is built from.
pub struct HardwareSet {
    pub buzzer_factory: BuzzerFactory,
    pub leds: Arc<dyn LedBank>,
    pub strip: Arc<dyn PixelStrip>,
}

impl HardwareSet {
    /// Build the backend selected in `config`.
    ///
    /// `force_simulated` overrides the configured backend (CLI `--simulate`).
    pub fn from_config(config: &HardwareConfig, force_simulated: bool) -> Self {
        let backend = if force_simulated {
            HardwareBackend::Simulated
        } else {
            config.backend
        };

        match backend {
            HardwareBackend::Simulated => {
                log::info!("hardware: using simulated devices");
                Self::simulated(config)
            }
            HardwareBackend::Sysfs => {
                log::info!("hardware: using sysfs devices");
                let pwm = config.buzzer_pwm_path.clone();
                let buzzer_factory: BuzzerFactory = Arc::new(move || {
                    SysfsBuzzer::open(&pwm).map(|b| Arc::new(b) as Arc<dyn Buzzer>)
                });
                Self {
                    buzzer_factory,
                    leds: Arc::new(SysfsLedBank::new(config.button_leds.clone())),
                    strip: Arc::new(SysfsPixelStrip::new(
                        config.strip_path.clone(),
                        config.strip_pixels,
                    )),
                }
            }
        }
    }

    /// In-memory devices sized from `config`.
    pub fn simulated(config: &HardwareConfig) -> Self {
        let names: Vec<String> = config.button_leds.keys().cloned().collect();
        let buzzer_factory: BuzzerFactory =
            Arc::new(|| Ok(Arc::new(SimBuzzer::new()) as Arc<dyn Buzzer>));
        Self {
            buzzer_factory,
            leds: Arc::new(SimLedBank::new(names)),
            strip: Arc::new(SimPixelStrip::new(config.strip_pixels)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HardwareConfig;

    #[test]
    fn rgb_off_is_off() {
        assert!(Rgb::OFF.is_off());
        assert!(!Rgb(1, 0, 0).is_off());
    }

    #[test]
    fn simulated_set_matches_config() {
        let cfg = HardwareConfig::default();
        let hw = HardwareSet::simulated(&cfg);
        let mut names = hw.leds.names();
        names.sort();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(hw.strip.len(), cfg.strip_pixels);
        assert!((hw.buzzer_factory)().is_ok());
    }

    #[test]
    fn default_strip_clear_turns_every_pixel_off() {
        let strip = SimPixelStrip::new(3);
        strip.set_pixel(1, Rgb(9, 9, 9)).unwrap();
        strip.clear().unwrap();
        assert!(strip.pixels().iter().all(Rgb::is_off));
    }
}
