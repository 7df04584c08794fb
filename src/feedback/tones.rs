//! Named tone sequences for system sound cues.

use std::time::Duration;

/// Frequency in Hz for a note name such as `"A4"`, `"C#5"` or `"Bb3"`.
///
/// Uses twelve-tone equal temperament with A4 = 440 Hz.  Returns `None` for
/// anything that is not `<letter>[#|b]<octave>`.
pub fn note_hz(name: &str) -> Option<f32> {
    let mut chars = name.chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let base: i32 = match letter {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };

    let rest: String = chars.collect();
    let (accidental, octave) = match rest.as_bytes().first() {
        Some(b'#') => (1, &rest[1..]),
        Some(b'b') => (-1, &rest[1..]),
        _ => (0, rest.as_str()),
    };
    let octave: i32 = octave.parse().ok()?;
    if !(0..=8).contains(&octave) {
        return None;
    }

    let midi = (octave + 1) * 12 + base + accidental;
    Some(440.0 * 2f32.powf((midi - 69) as f32 / 12.0))
}

/// A short recognisable sound played on the buzzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    Startup,
    /// Capture is about to start.
    Confirmation,
    RecordingComplete,
    Transcribe,
    Thinking,
    ReplyReady,
    Error,
}

impl Cue {
    fn notes(self) -> &'static [(&'static str, u64)] {
        match self {
            Cue::Startup => &[
                ("C4", 200),
                ("D4", 180),
                ("E4", 160),
                ("G4", 140),
                ("A4", 120),
                ("C5", 150),
                ("D5", 120),
                ("G5", 350),
            ],
            Cue::Confirmation => &[("A5", 80), ("A5", 80)],
            Cue::RecordingComplete => &[("G5", 80), ("E5", 80), ("C5", 80)],
            Cue::Transcribe => &[("D4", 200), ("G4", 150), ("F4", 150), ("A4", 200), ("G4", 250)],
            Cue::Thinking => &[("C4", 100), ("E4", 100), ("G4", 100), ("C5", 200)],
            Cue::ReplyReady => &[
                ("C4", 100),
                ("E4", 100),
                ("G4", 100),
                ("C5", 150),
                ("E5", 150),
                ("G5", 300),
            ],
            Cue::Error => &[("E4", 200), ("C4", 300)],
        }
    }

    /// Frequencies and hold times, ready for
    /// [`SoundWorker::play_sequence_async`](super::SoundWorker::play_sequence_async).
    pub fn sequence(self) -> (Vec<f32>, Vec<Duration>) {
        self.notes()
            .iter()
            .filter_map(|(note, ms)| note_hz(note).map(|hz| (hz, Duration::from_millis(*ms))))
            .unzip()
    }
}
