//! # Musical Tuning Module
//!
//! Maps detected frequencies onto the 12-tone equal-tempered scale relative to
//! a configurable reference pitch. Every tool with a needle, strobe or note
//! display goes through [`TuningMapper`].
//!
//! Cents are always measured against concert pitch; transposition only changes
//! the note that is *named* (written pitch for transposing instruments).

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Default reference pitch for A4 in Hz.
pub const DEFAULT_A4_HZ: f32 = 440.0;

/// MIDI number of A4.
const A4_MIDI: i32 = 69;

const SHARP_NAMES: [&str; 12] = [
    "C", "C♯", "D", "D♯", "E", "F", "F♯", "G", "G♯", "A", "A♯", "B",
];
const FLAT_NAMES: [&str; 12] = [
    "C", "D♭", "D", "E♭", "E", "F", "G♭", "G", "A♭", "A", "B♭", "B",
];

/// Pitch class of every accepted note spelling (`C#`, `C♯`, `Db`, `D♭`, ...).
static PITCH_CLASSES: Lazy<HashMap<String, i32>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for (pc, name) in SHARP_NAMES.iter().enumerate() {
        map.insert(name.to_string(), pc as i32);
        map.insert(name.replace('♯', "#"), pc as i32);
    }
    for (pc, name) in FLAT_NAMES.iter().enumerate() {
        map.insert(name.to_string(), pc as i32);
        map.insert(name.replace('♭', "b"), pc as i32);
    }
    // Enharmonic edge spellings.
    map.insert("B#".into(), 0);
    map.insert("B♯".into(), 0);
    map.insert("Cb".into(), 11);
    map.insert("C♭".into(), 11);
    map.insert("E#".into(), 5);
    map.insert("E♯".into(), 5);
    map.insert("Fb".into(), 4);
    map.insert("F♭".into(), 4);
    map
});

/// How accidentals are spelled in note names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteSpelling {
    #[default]
    Sharps,
    Flats,
}

impl NoteSpelling {
    fn table(self) -> &'static [&'static str; 12] {
        match self {
            NoteSpelling::Sharps => &SHARP_NAMES,
            NoteSpelling::Flats => &FLAT_NAMES,
        }
    }
}

/// A frequency placed on the chromatic scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuningReading {
    /// Note name without octave, e.g. "A♯".
    pub note_name: String,
    pub octave: i32,
    /// Signed deviation from the nearest concert-pitch note (positive = sharp).
    pub cents: f32,
    pub frequency_hz: f32,
    /// MIDI number of the named (possibly transposed) note.
    pub midi_note: i32,
}

impl TuningReading {
    /// Note name with octave, e.g. "A4".
    pub fn label(&self) -> String {
        format!("{}{}", self.note_name, self.octave)
    }
}

/// Converts frequencies to note names and cents for a fixed reference and transposition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuningMapper {
    pub reference_a4_hz: f32,
    pub transposition_semitones: i32,
    pub spelling: NoteSpelling,
}

impl Default for TuningMapper {
    fn default() -> Self {
        Self::new(DEFAULT_A4_HZ)
    }
}

impl TuningMapper {
    pub fn new(reference_a4_hz: f32) -> Self {
        Self {
            reference_a4_hz,
            transposition_semitones: 0,
            spelling: NoteSpelling::Sharps,
        }
    }

    pub fn with_transposition(mut self, semitones: i32) -> Self {
        self.transposition_semitones = semitones;
        self
    }

    pub fn with_spelling(mut self, spelling: NoteSpelling) -> Self {
        self.spelling = spelling;
        self
    }

    /// Maps `frequency_hz` onto the nearest note.
    ///
    /// # Panics
    /// If the frequency is not finite and positive.
    pub fn map(&self, frequency_hz: f32) -> TuningReading {
        assert!(
            frequency_hz.is_finite() && frequency_hz > 0.0,
            "cannot map frequency {} Hz",
            frequency_hz
        );

        let midi = frequency_to_midi(frequency_hz, self.reference_a4_hz);
        let nearest = midi.round() as i32;
        let cents = cents_between(
            frequency_hz,
            midi_to_frequency(nearest, self.reference_a4_hz),
        );

        let written = nearest + self.transposition_semitones;
        TuningReading {
            note_name: self.spelling.table()[written.rem_euclid(12) as usize].to_string(),
            octave: written.div_euclid(12) - 1,
            cents,
            frequency_hz,
            midi_note: written,
        }
    }

    /// Deviation in cents of `frequency_hz` from a chosen target note
    /// rather than the nearest one.
    pub fn cents_from_target(&self, frequency_hz: f32, target: TargetNote) -> f32 {
        let concert = target.midi_note - self.transposition_semitones;
        cents_between(frequency_hz, midi_to_frequency(concert, self.reference_a4_hz))
    }
}

/// Convenience wrapper around [`TuningMapper::map`].
pub fn map_frequency(
    frequency_hz: f32,
    reference_a4_hz: f32,
    transposition_semitones: i32,
) -> TuningReading {
    TuningMapper::new(reference_a4_hz)
        .with_transposition(transposition_semitones)
        .map(frequency_hz)
}

/// A user-selected note to tune against, in written pitch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetNote {
    pub midi_note: i32,
}

impl TargetNote {
    /// Parses a written note name such as "B♭3" or "F#5".
    pub fn parse(name: &str) -> Option<Self> {
        parse_note_name(name).map(|midi_note| Self { midi_note })
    }
}

/// Fractional MIDI number of a frequency.
pub fn frequency_to_midi(frequency_hz: f32, reference_a4_hz: f32) -> f32 {
    A4_MIDI as f32 + 12.0 * (frequency_hz / reference_a4_hz).log2()
}

/// Equal-tempered frequency of a MIDI note.
pub fn midi_to_frequency(midi_note: i32, reference_a4_hz: f32) -> f32 {
    reference_a4_hz * 2.0_f32.powf((midi_note - A4_MIDI) as f32 / 12.0)
}

/// Calculates the deviation from a target frequency in cents.
///
/// - 100 cents = 1 semitone
/// - Positive values indicate sharpness, negative values flatness
pub fn cents_between(frequency_hz: f32, target_hz: f32) -> f32 {
    1200.0 * (frequency_hz / target_hz).log2()
}

/// MIDI number of a note name like "A4", "C#3", "B♭2" or "Cb-1".
pub fn parse_note_name(name: &str) -> Option<i32> {
    let name = name.trim();
    let split = name
        .char_indices()
        .find(|&(i, c)| i > 0 && (c.is_ascii_digit() || c == '-'))
        .map(|(i, _)| i)?;
    let (pitch, octave) = name.split_at(split);

    let mut chars = pitch.chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let key: String = std::iter::once(letter).chain(chars).collect();

    let pitch_class = *PITCH_CLASSES.get(&key)?;
    let octave: i32 = octave.parse().ok()?;

    // B# and Cb cross the octave boundary.
    let octave_shift = match key.as_str() {
        "B#" | "B♯" => 1,
        "Cb" | "C♭" => -1,
        _ => 0,
    };
    Some((octave + 1 + octave_shift) * 12 + pitch_class)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a440_is_a4() {
        let reading = map_frequency(440.0, 440.0, 0);
        assert_eq!(reading.note_name, "A");
        assert_eq!(reading.octave, 4);
        assert!(reading.cents.abs() < 1e-3);
        assert_eq!(reading.label(), "A4");
    }

    #[test]
    fn a_sharp_four() {
        let reading = map_frequency(466.16, 440.0, 0);
        assert_eq!(reading.note_name, "A♯");
        assert_eq!(reading.octave, 4);
        assert!(reading.cents.abs() < 0.1, "cents = {}", reading.cents);

        let flat = TuningMapper::new(440.0)
            .with_spelling(NoteSpelling::Flats)
            .map(466.16);
        assert_eq!(flat.note_name, "B♭");
    }

    #[test]
    fn cents_sign_follows_deviation() {
        let sharp = map_frequency(445.0, 440.0, 0);
        let flat = map_frequency(435.0, 440.0, 0);
        assert!(sharp.cents > 0.0);
        assert!(flat.cents < 0.0);
        assert!((sharp.cents - 1200.0 * (445.0f32 / 440.0).log2()).abs() < 1e-3);
    }

    #[test]
    fn reference_pitch_shifts_naming() {
        let reading = map_frequency(442.0, 442.0, 0);
        assert_eq!(reading.label(), "A4");
        assert!(reading.cents.abs() < 1e-3);
    }

    #[test]
    fn transposition_changes_name_not_cents() {
        // Concert C4 on a B♭ instrument reads as a written D4.
        let concert = map_frequency(261.63, 440.0, 0);
        let written = map_frequency(261.63, 440.0, 2);
        assert_eq!(concert.label(), "C4");
        assert_eq!(written.label(), "D4");
        assert_eq!(concert.cents, written.cents);
    }

    #[test]
    fn octave_boundaries() {
        assert_eq!(map_frequency(261.63, 440.0, 0).octave, 4);
        assert_eq!(map_frequency(246.94, 440.0, 0).label(), "B3");
        assert_eq!(map_frequency(8.18, 440.0, 0).label(), "C-1");
    }

    #[test]
    fn parses_note_names() {
        assert_eq!(parse_note_name("A4"), Some(69));
        assert_eq!(parse_note_name("C4"), Some(60));
        assert_eq!(parse_note_name("C#4"), Some(61));
        assert_eq!(parse_note_name("D♭4"), Some(61));
        assert_eq!(parse_note_name("bb3"), Some(58));
        assert_eq!(parse_note_name("B#3"), Some(60));
        assert_eq!(parse_note_name("Cb4"), Some(59));
        assert_eq!(parse_note_name("C-1"), Some(0));
        assert_eq!(parse_note_name("H2"), None);
        assert_eq!(parse_note_name("A"), None);
    }

    #[test]
    fn target_note_cents() {
        let mapper = TuningMapper::new(440.0);
        let target = TargetNote::parse("A4").unwrap();
        assert!(mapper.cents_from_target(440.0, target).abs() < 1e-3);
        // A4 played against a G4 target is two semitones sharp.
        let g4 = TargetNote::parse("G4").unwrap();
        assert!((mapper.cents_from_target(440.0, g4) - 200.0).abs() < 1e-2);
    }

    #[test]
    #[should_panic(expected = "cannot map frequency")]
    fn rejects_non_positive_frequency() {
        map_frequency(0.0, 440.0, 0);
    }
}
