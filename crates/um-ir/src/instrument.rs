//! Instrument and envelope types.

use alloc::string::String;
use arrayvec::ArrayVec;

use crate::flags::{EnvelopeFlags, InstrumentFlags};
use crate::module::PAN_CENTER;

/// Number of notes covered by an instrument's sample map.
pub const INSTNOTES: usize = 120;
/// Maximum number of points in an envelope.
pub const ENVPOINTS: usize = 32;

/// An instrument definition.
#[derive(Clone, Debug, PartialEq)]
pub struct Instrument {
    pub name: String,
    pub flags: InstrumentFlags,
    /// Sample index per note (0xffff = none).
    pub sample_number: [u16; INSTNOTES],
    /// Note actually played per note (255 = none).
    pub sample_note: [u8; INSTNOTES],
    pub new_note_action: NewNoteAction,
    pub duplicate_check: DuplicateCheck,
    pub duplicate_action: DuplicateAction,
    /// Global volume (0-64).
    pub global_volume: u8,
    pub fadeout: u16,
    /// Default panning (0-255), only used with `InstrumentFlags::OWN_PAN`.
    pub panning: i16,
    pub pitch_pan_separation: u8,
    pub pitch_pan_center: u8,
    pub random_volume: u8,
    pub random_panning: u8,
    pub volume_envelope: Envelope,
    pub panning_envelope: Envelope,
    pub pitch_envelope: Envelope,
}

impl Instrument {
    /// Instrument `index` with the identity note map: every note plays
    /// sample `index` at its own pitch.
    pub fn with_index(index: u16) -> Self {
        let mut sample_note = [0u8; INSTNOTES];
        for (n, slot) in sample_note.iter_mut().enumerate() {
            *slot = n as u8;
        }
        Self {
            name: String::new(),
            flags: InstrumentFlags::empty(),
            sample_number: [index; INSTNOTES],
            sample_note,
            new_note_action: NewNoteAction::Cut,
            duplicate_check: DuplicateCheck::Off,
            duplicate_action: DuplicateAction::Cut,
            global_volume: 64,
            fadeout: 0,
            panning: PAN_CENTER,
            pitch_pan_separation: 0,
            pitch_pan_center: 0,
            random_volume: 0,
            random_panning: 0,
            volume_envelope: Envelope::default(),
            panning_envelope: Envelope::default(),
            pitch_envelope: Envelope::default(),
        }
    }
}

/// Action when a new note triggers on a channel already playing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NewNoteAction {
    /// Cut the previous note immediately
    #[default]
    Cut,
    /// Let the previous note continue playing
    Continue,
    /// Release the previous note (note off)
    Off,
    /// Fade out the previous note
    Fade,
}

impl NewNoteAction {
    /// Decode the two low bits of a stored NNA byte.
    pub fn from_bits(value: u8) -> Self {
        match value & 3 {
            0 => NewNoteAction::Cut,
            1 => NewNoteAction::Continue,
            2 => NewNoteAction::Off,
            _ => NewNoteAction::Fade,
        }
    }
}

/// Duplicate check type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DuplicateCheck {
    #[default]
    Off,
    Note,
    Sample,
    Instrument,
}

impl DuplicateCheck {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => DuplicateCheck::Note,
            2 => DuplicateCheck::Sample,
            3 => DuplicateCheck::Instrument,
            _ => DuplicateCheck::Off,
        }
    }
}

/// What to do with a duplicate note.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DuplicateAction {
    #[default]
    Cut,
    Off,
    Fade,
}

impl DuplicateAction {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => DuplicateAction::Off,
            2 => DuplicateAction::Fade,
            _ => DuplicateAction::Cut,
        }
    }
}

/// A volume, panning or pitch envelope.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    pub flags: EnvelopeFlags,
    pub points: ArrayVec<EnvPoint, ENVPOINTS>,
    pub sustain_begin: u8,
    pub sustain_end: u8,
    pub loop_begin: u8,
    pub loop_end: u8,
}

impl Envelope {
    /// Append a point, ignoring it once the envelope is full.
    pub fn push(&mut self, pos: i16, val: i16) {
        let _ = self.points.try_push(EnvPoint { pos, val });
    }

    pub fn is_enabled(&self) -> bool {
        self.flags.contains(EnvelopeFlags::ON)
    }

    /// Disable an envelope that has fewer than two points.
    pub fn disable_if_degenerate(&mut self) {
        if self.is_enabled() && self.points.len() < 2 {
            self.flags.remove(EnvelopeFlags::ON);
        }
    }
}

/// A point in an envelope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnvPoint {
    /// Tick position
    pub pos: i16,
    /// Value (0-64 for volume, 0-255 for panning, 0-64 for pitch)
    pub val: i16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_note_map() {
        let inst = Instrument::with_index(5);
        assert!(inst.sample_number.iter().all(|&s| s == 5));
        assert_eq!(inst.sample_note[0], 0);
        assert_eq!(inst.sample_note[119], 119);
        assert_eq!(inst.global_volume, 64);
    }

    #[test]
    fn envelope_caps_points() {
        let mut env = Envelope::default();
        for i in 0..40 {
            env.push(i, 0);
        }
        assert_eq!(env.points.len(), ENVPOINTS);
    }

    #[test]
    fn single_point_envelope_disabled() {
        let mut env = Envelope {
            flags: EnvelopeFlags::ON,
            ..Envelope::default()
        };
        env.push(0, 64);
        env.disable_if_degenerate();
        assert!(!env.is_enabled());
    }
}
