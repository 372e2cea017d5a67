//! Incremental module construction used by the format parsers.

use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};

use crate::error::ModError;
use crate::flags::ModuleFlags;
use crate::instrument::Instrument;
use crate::module::{Module, MAX_CHANNELS};
use crate::periods;
use crate::sample::Sample;
use crate::unitrk::{Track, TrackWriter};

/// Default row count of a freshly allocated pattern.
pub const DEFAULT_ROWS: u16 = 64;

/// A module under construction plus the track writer that fills it.
///
/// Dereferences to the [`Module`] so parsers can set fields directly. The
/// `alloc_*` methods size the tables from the counts set beforehand and
/// fail with [`ModError::NotAModule`] when the count is zero.
#[derive(Debug)]
pub struct ModuleBuilder {
    module: Module,
    pub uni: TrackWriter,
    note_index: Vec<i32>,
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn try_vec<T: Clone>(len: usize, value: T) -> Result<Vec<T>, ModError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| ModError::OutOfMemory)?;
    v.resize(len, value);
    Ok(v)
}

impl ModuleBuilder {
    /// A blank module with the loader defaults applied: tempo limit 33,
    /// global volume 128, channel volume 64, and alternating hard
    /// left/right panning (L R R L ...).
    pub fn new() -> Self {
        let mut module = Module {
            bpm_limit: 33,
            initial_volume: 128,
            channel_volume: [64; MAX_CHANNELS],
            ..Module::default()
        };
        for (t, pan) in module.panning.iter_mut().enumerate() {
            *pan = if (t + 1) & 2 != 0 { 255 } else { 0 };
        }
        Self {
            module,
            uni: TrackWriter::new(),
            note_index: Vec::new(),
        }
    }

    /// Allocate `total` order-list slots, all pointing at pattern 0.
    pub fn alloc_positions(&mut self, total: usize) -> Result<(), ModError> {
        if total == 0 {
            return Err(ModError::NotAModule);
        }
        self.module.positions = try_vec(total, 0)?;
        Ok(())
    }

    /// Allocate the pattern table for `num_patterns + 1` patterns of
    /// `num_channels` tracks each, numbered sequentially, with 64 rows.
    pub fn alloc_patterns(&mut self) -> Result<(), ModError> {
        let m = &mut self.module;
        if m.num_patterns == 0 || m.num_channels == 0 {
            return Err(ModError::NotAModule);
        }
        let slots = (m.num_patterns as usize + 1) * m.num_channels as usize;
        let mut patterns = try_vec(slots, 0u16)?;
        for (i, p) in patterns.iter_mut().enumerate() {
            *p = i as u16;
        }
        m.patterns = patterns;
        m.pattern_rows = try_vec(m.num_patterns as usize + 1, DEFAULT_ROWS)?;
        Ok(())
    }

    /// Set `num_tracks` to one track per channel of every pattern.
    pub fn set_track_count(&mut self) -> Result<(), ModError> {
        let m = &mut self.module;
        m.num_tracks = m
            .num_patterns
            .checked_mul(m.num_channels as u16)
            .ok_or(ModError::LoadingHeader)?;
        Ok(())
    }

    /// Allocate `num_tracks` empty track slots.
    pub fn alloc_tracks(&mut self) -> Result<(), ModError> {
        if self.module.num_tracks == 0 {
            return Err(ModError::NotAModule);
        }
        self.module.tracks = try_vec(self.module.num_tracks as usize, None)?;
        Ok(())
    }

    /// Allocate `num_instruments` instruments with identity note maps.
    pub fn alloc_instruments(&mut self) -> Result<(), ModError> {
        let n = self.module.num_instruments;
        if n == 0 {
            return Err(ModError::NotAModule);
        }
        let mut instruments = Vec::new();
        instruments
            .try_reserve_exact(n as usize)
            .map_err(|_| ModError::OutOfMemory)?;
        instruments.extend((0..n).map(Instrument::with_index));
        self.module.instruments = instruments;
        Ok(())
    }

    /// Allocate `num_samples` samples with default volume and panning.
    pub fn alloc_samples(&mut self) -> Result<(), ModError> {
        let n = self.module.num_samples as usize;
        if n == 0 {
            return Err(ModError::NotAModule);
        }
        self.module.samples = try_vec(n, Sample::default())?;
        Ok(())
    }

    /// Store the track currently held by the writer in slot `index`.
    pub fn store_track(&mut self, index: usize) -> Result<(), ModError> {
        let track = self.uni.finish();
        self.put_track(index, track)
    }

    /// Store an already encoded track in slot `index`.
    pub fn put_track(&mut self, index: usize, track: Track) -> Result<(), ModError> {
        match self.module.tracks.get_mut(index) {
            Some(slot) => {
                *slot = Some(track);
                Ok(())
            }
            None => Err(ModError::LoadingTrack),
        }
    }

    /// Protracker effect, honoring the module's arpeggio memory flag.
    pub fn pt_effect(&mut self, eff: u8, dat: u8) {
        let arpmem = self.module.flags.contains(ModuleFlags::ARPMEM);
        self.uni.pt_effect(eff, dat, arpmem);
    }

    /// Convert the C-5 rate of sample `sample` to a linear finetune,
    /// remembering the note offset for later instrument remapping.
    pub fn speed_to_finetune(&mut self, speed: u32, sample: usize) -> u32 {
        let (fine, offset) = periods::speed_to_finetune(self.module.flags, speed);
        if self.note_index.len() <= sample {
            self.note_index.resize(sample + 1, 0);
        }
        self.note_index[sample] = offset;
        fine as u32
    }

    /// Note offset recorded by [`speed_to_finetune`](Self::speed_to_finetune).
    pub fn note_index(&self, sample: usize) -> i32 {
        self.note_index.get(sample).copied().unwrap_or(0)
    }

    pub fn finish(self) -> Module {
        self.module
    }
}

impl Deref for ModuleBuilder {
    type Target = Module;

    fn deref(&self) -> &Module {
        &self.module
    }
}

impl DerefMut for ModuleBuilder {
    fn deref_mut(&mut self) -> &mut Module {
        &mut self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let b = ModuleBuilder::new();
        assert_eq!(b.bpm_limit, 33);
        assert_eq!(b.initial_volume, 128);
        assert_eq!(&b.panning[..4], &[0, 255, 255, 0]);
        assert!(b.channel_volume.iter().all(|&v| v == 64));
    }

    #[test]
    fn zero_counts_are_not_a_module() {
        let mut b = ModuleBuilder::new();
        assert_eq!(b.alloc_positions(0), Err(ModError::NotAModule));
        assert_eq!(b.alloc_patterns(), Err(ModError::NotAModule));
        assert_eq!(b.alloc_tracks(), Err(ModError::NotAModule));
        assert_eq!(b.alloc_instruments(), Err(ModError::NotAModule));
        assert_eq!(b.alloc_samples(), Err(ModError::NotAModule));
        b.num_patterns = 1;
        assert_eq!(b.alloc_patterns(), Err(ModError::NotAModule));
    }

    #[test]
    fn pattern_table_is_sequential_with_spare_pattern() {
        let mut b = ModuleBuilder::new();
        b.num_patterns = 2;
        b.num_channels = 4;
        b.alloc_patterns().unwrap();
        assert_eq!(b.patterns.len(), 12);
        assert_eq!(b.patterns[5], 5);
        assert_eq!(b.pattern_rows, vec![64, 64, 64]);
    }

    #[test]
    fn instruments_map_to_own_sample() {
        let mut b = ModuleBuilder::new();
        b.num_instruments = 3;
        b.alloc_instruments().unwrap();
        assert_eq!(b.instruments[2].sample_number[10], 2);
        assert_eq!(b.instruments[2].sample_note[10], 10);
    }

    #[test]
    fn track_count_overflow_is_a_header_error() {
        let mut b = ModuleBuilder::new();
        b.num_patterns = 3;
        b.num_channels = 4;
        b.set_track_count().unwrap();
        assert_eq!(b.num_tracks, 12);
        b.num_patterns = 0xffff;
        assert_eq!(b.set_track_count(), Err(ModError::LoadingHeader));
    }

    #[test]
    fn store_track_out_of_range() {
        let mut b = ModuleBuilder::new();
        b.num_tracks = 1;
        b.alloc_tracks().unwrap();
        b.uni.reset();
        b.uni.newline();
        assert!(b.store_track(0).is_ok());
        assert_eq!(b.store_track(1), Err(ModError::LoadingTrack));
        assert_eq!(b.finish().tracks[0].as_ref().unwrap().row_count(), 1);
    }
}
