//! The format-independent module representation.

use alloc::string::String;
use alloc::vec::Vec;

use crate::flags::ModuleFlags;
use crate::instrument::Instrument;
use crate::sample::Sample;
use crate::unitrk::Track;

/// Maximum number of channels a module may declare.
pub const MAX_CHANNELS: usize = 64;

/// Order-list sentinel: end of song.
pub const LAST_PATTERN: u16 = 0xffff;
/// Order-list sentinel: skip this position.
pub const POS_SKIP: u16 = 0xfffe;

pub const PAN_LEFT: i16 = 0;
pub const PAN_HALFLEFT: i16 = 64;
pub const PAN_CENTER: i16 = 128;
pub const PAN_HALFRIGHT: i16 = 192;
pub const PAN_RIGHT: i16 = 255;
pub const PAN_SURROUND: i16 = 512;

/// A fully parsed module.
///
/// Patterns are stored column-wise: `patterns[p * num_channels + c]` is the
/// index into `tracks` of channel `c` in pattern `p`, and `pattern_rows[p]`
/// its row count. The pattern table has one spare pattern past
/// `num_patterns` which loaders use as an empty filler.
#[derive(Clone, Debug)]
pub struct Module {
    pub title: String,
    /// Human-readable format description ("Protracker", "Scream Tracker 3.20", ...)
    pub format: String,
    pub comment: Option<String>,
    pub flags: ModuleFlags,

    pub num_channels: u8,
    /// Voice limit embedded in the file, 0 when unspecified.
    pub num_voices: u8,
    /// Voices the mixer should reserve, negotiated at load time.
    pub real_channels: u8,
    pub num_positions: u16,
    pub num_patterns: u16,
    pub num_tracks: u16,
    pub num_instruments: u16,
    pub num_samples: u16,

    pub restart_position: u16,
    pub initial_speed: u8,
    pub initial_tempo: u16,
    /// Global volume (0-128).
    pub initial_volume: u8,
    pub bpm_limit: u16,
    pub panning: [i16; MAX_CHANNELS],
    pub channel_volume: [u8; MAX_CHANNELS],

    /// Order list: pattern numbers, or `LAST_PATTERN` / `POS_SKIP`.
    pub positions: Vec<u16>,
    pub patterns: Vec<u16>,
    pub pattern_rows: Vec<u16>,
    pub tracks: Vec<Option<Track>>,
    pub instruments: Vec<Instrument>,
    pub samples: Vec<Sample>,
}

impl Default for Module {
    fn default() -> Self {
        Self {
            title: String::new(),
            format: String::new(),
            comment: None,
            flags: ModuleFlags::empty(),
            num_channels: 0,
            num_voices: 0,
            real_channels: 0,
            num_positions: 0,
            num_patterns: 0,
            num_tracks: 0,
            num_instruments: 0,
            num_samples: 0,
            restart_position: 0,
            initial_speed: 0,
            initial_tempo: 0,
            initial_volume: 0,
            bpm_limit: 0,
            panning: [0; MAX_CHANNELS],
            channel_volume: [0; MAX_CHANNELS],
            positions: Vec::new(),
            patterns: Vec::new(),
            pattern_rows: Vec::new(),
            tracks: Vec::new(),
            instruments: Vec::new(),
            samples: Vec::new(),
        }
    }
}

impl Module {
    /// Track index for channel `channel` of pattern `pattern`.
    pub fn track_index(&self, pattern: u16, channel: u8) -> Option<u16> {
        let idx = pattern as usize * self.num_channels as usize + channel as usize;
        self.patterns.get(idx).copied()
    }

    /// Track bytecode for channel `channel` of pattern `pattern`.
    pub fn pattern_track(&self, pattern: u16, channel: u8) -> Option<&Track> {
        let idx = self.track_index(pattern, channel)?;
        self.tracks.get(idx as usize)?.as_ref()
    }

    /// Order list trimmed to `num_positions`.
    pub fn order(&self) -> &[u16] {
        let n = (self.num_positions as usize).min(self.positions.len());
        &self.positions[..n]
    }

    /// Total bytes of decoded sample data held by the module.
    pub fn sample_memory(&self) -> usize {
        self.samples.iter().map(|s| s.pcm.len() * 2).sum()
    }
}
