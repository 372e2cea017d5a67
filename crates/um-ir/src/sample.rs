//! Sample definitions.

use alloc::string::String;
use alloc::vec::Vec;

use crate::flags::SampleFlags;
use crate::module::PAN_CENTER;

/// A sample slot in the module.
///
/// Until the sample decoder has run, `pcm` is empty and `in_flags`,
/// `seek_pos` and `length` describe where and how the data is stored.
/// After decoding, `pcm` holds `length` signed 16-bit mono frames
/// followed by a 16-frame unclick margin, and `flags` reflects that
/// encoding.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub name: String,
    /// Length in frames.
    pub length: u32,
    pub loop_start: u32,
    pub loop_end: u32,
    pub sustain_start: u32,
    pub sustain_end: u32,
    /// Playback speed: a C-5 rate in Hz, or a finetune value when the
    /// module uses XM periods.
    pub speed: u32,
    /// Default volume (0-64).
    pub volume: u8,
    /// Global volume (0-64).
    pub global_volume: u8,
    /// Default panning (0-255, or `PAN_SURROUND`).
    pub panning: i16,
    /// Current flags. Encoding bits describe `pcm` once decoded.
    pub flags: SampleFlags,
    /// Flags of the stored data as found in the file.
    pub in_flags: SampleFlags,
    pub vibrato: AutoVibrato,
    /// Absolute stream offset of the sample data, 0 meaning "continue from
    /// the current position".
    pub seek_pos: u64,
    /// Decimation factor applied while decoding (1 when untouched).
    pub div_factor: u8,
    pub pcm: Vec<i16>,
}

impl Default for Sample {
    fn default() -> Self {
        Self {
            name: String::new(),
            length: 0,
            loop_start: 0,
            loop_end: 0,
            sustain_start: 0,
            sustain_end: 0,
            speed: 0,
            volume: 64,
            global_volume: 64,
            panning: PAN_CENTER,
            flags: SampleFlags::empty(),
            in_flags: SampleFlags::empty(),
            vibrato: AutoVibrato::default(),
            seek_pos: 0,
            div_factor: 1,
            pcm: Vec::new(),
        }
    }
}

impl Sample {
    /// Returns true if the sample has a forward or ping-pong loop.
    pub fn has_loop(&self) -> bool {
        self.flags.contains(SampleFlags::LOOP)
    }

    /// Clamp loop and sustain points so that they never reach past the
    /// sample end. Returns true if anything was changed.
    pub fn clamp_loop_points(&mut self) -> bool {
        let before = (self.loop_start, self.loop_end, self.sustain_start, self.sustain_end);
        self.loop_end = self.loop_end.min(self.length);
        self.loop_start = self.loop_start.min(self.loop_end);
        self.sustain_end = self.sustain_end.min(self.length);
        self.sustain_start = self.sustain_start.min(self.sustain_end);
        if self.has_loop() && self.loop_start == self.loop_end {
            self.flags.remove(SampleFlags::LOOP | SampleFlags::BIDI);
        }
        before != (self.loop_start, self.loop_end, self.sustain_start, self.sustain_end)
    }
}

/// Automatic vibrato parameters (XM and IT).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AutoVibrato {
    /// Waveform selector (0=sine, 1=square, 2=ramp down, 3=ramp up, 4=random)
    pub waveform: u8,
    pub sweep: u8,
    pub depth: u8,
    pub rate: u8,
    /// Parameters follow IT semantics instead of XM ones.
    pub it_style: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_end_clamped_to_length() {
        let mut s = Sample {
            length: 100,
            loop_start: 40,
            loop_end: 140,
            flags: SampleFlags::LOOP,
            ..Sample::default()
        };
        assert!(s.clamp_loop_points());
        assert_eq!(s.loop_end, 100);
        assert_eq!(s.loop_start, 40);
        assert!(s.has_loop());
    }

    #[test]
    fn empty_loop_is_dropped() {
        let mut s = Sample {
            length: 10,
            loop_start: 30,
            loop_end: 40,
            flags: SampleFlags::LOOP | SampleFlags::BIDI,
            ..Sample::default()
        };
        s.clamp_loop_points();
        assert_eq!((s.loop_start, s.loop_end), (10, 10));
        assert!(!s.has_loop());
    }
}
