//! UNIMod (.UNI) parser: the serialized form of the in-memory module as
//! written by MikCvt (`UN04` to `UN06`) and APlayer (`APUN`).
//!
//! Tracks are stored as ready-made bytecode and only need validating.
//! Sample data follows the tracks back to back.

use um_ir::{
    AutoVibrato, DuplicateAction, DuplicateCheck, Envelope, EnvelopeFlags, InstrumentFlags,
    ModError, ModuleBuilder, ModuleFlags, NewNoteAction, Sample, SampleFlags, Track,
    ENVPOINTS, INSTNOTES, LAST_PATTERN,
};

use crate::common::dup_str;
use crate::loader::Loader;
use crate::reader::{read_array, ByteReader};

/// APlayer revisions are numbered from here.
const APLAYER: u16 = 0x100;
const OLD_ENVPOINTS: usize = 12;
const OLD_NOTES: usize = 96;

/// Fields common to both header layouts.
#[derive(Debug, Default)]
struct Header {
    flags: u16,
    channels: u8,
    voices: u8,
    positions: u16,
    patterns: u16,
    tracks: u16,
    instruments: u16,
    samples: u16,
    restart: u16,
    speed: u8,
    tempo: u8,
    volume: u8,
    bpm_limit: u16,
    old_positions: Vec<u8>,
    old_panning: Vec<u8>,
}

/// Sample header of the pre-UN06 layout, kept until the sample table
/// exists.
#[derive(Debug)]
struct OldSample {
    c2spd: u16,
    transpose: i8,
    volume: u8,
    panning: u8,
    length: u32,
    loop_start: u32,
    loop_end: u32,
    flags: u16,
    name: String,
    vibrato: AutoVibrato,
}

/// Length-prefixed string; the length is always little-endian.
fn read_string(r: &mut dyn ByteReader) -> Option<String> {
    let len = r.read_u16_le() as usize;
    if len == 0 {
        return None;
    }
    let raw = r.read_vec(len);
    Some(dup_str(&raw, true))
}

fn version_of(id: &[u8; 4], r: &mut dyn ByteReader) -> u16 {
    if id[3] == b'N' {
        // APUN then a big-endian revision word
        r.read_u16_be()
    } else {
        let v = id[3].wrapping_sub(b'0') as u16;
        if v == 6 {
            r.read_u8();
        }
        v
    }
}

fn sample_flags(version: u16, flags: u16) -> SampleFlags {
    let mut out = SampleFlags::empty();
    let mut set = |bit: u16, flag: SampleFlags| {
        if flags & bit != 0 {
            out |= flag;
        }
    };
    set(0x0004, SampleFlags::STEREO);
    set(0x0002, SampleFlags::SIGNED);
    set(0x0001, SampleFlags::BITS16);
    let table: &[(u16, SampleFlags)] = if version >= 0x104 {
        &[
            (0x2000, SampleFlags::UST_LOOP),
            (0x1000, SampleFlags::OWN_PAN),
            (0x0800, SampleFlags::SUSTAIN),
            (0x0400, SampleFlags::REVERSE),
            (0x0200, SampleFlags::BIDI),
            (0x0100, SampleFlags::LOOP),
            (0x0020, SampleFlags::ITPACKED),
            (0x0010, SampleFlags::DELTA),
            (0x0008, SampleFlags::BIG_ENDIAN),
        ]
    } else if version >= 0x102 {
        &[
            (0x0800, SampleFlags::UST_LOOP),
            (0x0400, SampleFlags::OWN_PAN),
            (0x0200, SampleFlags::SUSTAIN),
            (0x0100, SampleFlags::REVERSE),
            (0x0080, SampleFlags::BIDI),
            (0x0040, SampleFlags::LOOP),
            (0x0020, SampleFlags::ITPACKED),
            (0x0010, SampleFlags::DELTA),
            (0x0008, SampleFlags::BIG_ENDIAN),
        ]
    } else {
        &[
            (0x0400, SampleFlags::UST_LOOP),
            (0x0200, SampleFlags::OWN_PAN),
            (0x0100, SampleFlags::REVERSE),
            (0x0080, SampleFlags::SUSTAIN),
            (0x0040, SampleFlags::BIDI),
            (0x0020, SampleFlags::LOOP),
            (0x0010, SampleFlags::BIG_ENDIAN),
            (0x0008, SampleFlags::DELTA),
        ]
    };
    for &(bit, flag) in table {
        set(bit, flag);
    }
    out
}

fn old_sample_flags(flags: u16) -> SampleFlags {
    [
        (128, SampleFlags::REVERSE),
        (64, SampleFlags::SUSTAIN),
        (32, SampleFlags::BIDI),
        (16, SampleFlags::LOOP),
        (8, SampleFlags::BIG_ENDIAN),
        (4, SampleFlags::DELTA),
        (2, SampleFlags::SIGNED),
        (1, SampleFlags::BITS16),
    ]
    .into_iter()
    .filter(|&(bit, _)| flags & bit != 0)
    .fold(SampleFlags::empty(), |acc, (_, f)| acc | f)
}

fn read_envelope(
    r: &mut dyn ByteReader,
    stored: usize,
    old: bool,
) -> Result<Envelope, ModError> {
    let mut env = Envelope {
        flags: EnvelopeFlags::from_bits_truncate(r.read_u8()),
        ..Envelope::default()
    };
    let points = r.read_u8() as usize;
    env.sustain_begin = r.read_u8();
    env.sustain_end = if old { env.sustain_begin } else { r.read_u8() };
    env.loop_begin = r.read_u8();
    env.loop_end = r.read_u8();
    let limit = if old { OLD_ENVPOINTS } else { ENVPOINTS };
    if points > limit {
        return Err(ModError::LoadingSampleInfo);
    }
    let stored = if stored == 0 { points } else { stored };
    for w in 0..stored {
        let (pos, val) = if old {
            (r.read_u16_le() as i16, r.read_u16_le() as i16)
        } else {
            (r.read_u16_be() as i16, r.read_u16_be() as i16)
        };
        if w < points {
            env.push(pos, val);
        }
    }
    Ok(env)
}

fn read_track(r: &mut dyn ByteReader, version: u16) -> Result<Track, ModError> {
    let len = if version >= 6 {
        r.read_u16_be()
    } else {
        r.read_u16_le()
    } as usize;
    if len == 0 {
        return Err(ModError::LoadingTrack);
    }
    let bytes = r.read_vec(len);
    if r.eof() {
        return Err(ModError::LoadingTrack);
    }
    Track::validated(&bytes).ok_or(ModError::LoadingTrack)
}

#[derive(Debug, Default)]
pub struct UniLoader {
    version: u16,
}

impl UniLoader {
    fn read_header(&mut self, r: &mut dyn ByteReader) -> Header {
        let id = read_array::<4>(r);
        self.version = version_of(&id, r);
        let mut mh = Header::default();
        if self.version >= 6 {
            mh.flags = r.read_u16_be();
            mh.channels = r.read_u8();
            mh.voices = r.read_u8();
            mh.positions = r.read_u16_be();
            mh.patterns = r.read_u16_be();
            mh.tracks = r.read_u16_be();
            mh.instruments = r.read_u16_be();
            mh.samples = r.read_u16_be();
            mh.restart = r.read_u16_be();
            mh.speed = r.read_u8();
            mh.tempo = r.read_u8();
            mh.volume = r.read_u8();
            mh.bpm_limit = if self.version >= 0x106 {
                r.read_u16_be()
            } else {
                32
            };
            let keep = ModuleFlags::XM_PERIODS
                | ModuleFlags::LINEAR
                | ModuleFlags::INST
                | ModuleFlags::NNA;
            mh.flags = (mh.flags & keep.bits()) | ModuleFlags::PANNING.bits();
        } else {
            mh.channels = r.read_u8();
            mh.positions = r.read_u16_le();
            mh.restart = if self.version == 5 { r.read_u16_le() } else { 0 };
            mh.patterns = r.read_u16_le();
            mh.tracks = r.read_u16_le();
            mh.instruments = r.read_u16_le();
            mh.speed = r.read_u8();
            mh.tempo = r.read_u8();
            mh.old_positions = r.read_vec(256);
            mh.old_panning = r.read_vec(32);
            mh.flags = r.read_u8() as u16;
            mh.bpm_limit = 32;
            let keep = ModuleFlags::XM_PERIODS | ModuleFlags::LINEAR;
            mh.flags = (mh.flags & keep.bits())
                | (ModuleFlags::INST | ModuleFlags::NO_WRAP | ModuleFlags::PANNING).bits();
        }
        mh
    }

    fn format_name(&self, old_type: Option<String>) -> String {
        let aplayer = self.version >= APLAYER;
        match old_type {
            Some(old) => format!(
                "{} (was {old})",
                if aplayer { "APlayer" } else { "MikCvt2" }
            ),
            None if aplayer => "APlayer".to_string(),
            None => "MikCvt3".to_string(),
        }
    }

    fn load_samples(
        &self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
    ) -> Result<(), ModError> {
        for s in of.samples.iter_mut() {
            let flags = r.read_u16_be();
            s.flags = sample_flags(self.version, flags);
            s.speed = r.read_u32_be();
            s.volume = r.read_u8();
            s.panning = r.read_u16_be() as i16;
            s.length = r.read_u32_be();
            s.loop_start = r.read_u32_be();
            s.loop_end = r.read_u32_be();
            s.sustain_start = r.read_u32_be();
            s.sustain_end = r.read_u32_be();
            s.global_volume = r.read_u8();
            s.vibrato.it_style = r.read_u8() != 0;
            s.vibrato.waveform = r.read_u8();
            s.vibrato.sweep = r.read_u8();
            s.vibrato.depth = r.read_u8();
            s.vibrato.rate = r.read_u8();
            s.name = read_string(r).unwrap_or_default();
            if r.eof() {
                return Err(ModError::LoadingSampleInfo);
            }
        }
        Ok(())
    }

    fn load_instruments(
        &self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
    ) -> Result<(), ModError> {
        let stored = if self.version >= APLAYER { ENVPOINTS } else { 0 };
        for d in of.instruments.iter_mut() {
            d.flags = InstrumentFlags::from_bits_truncate(r.read_u8());
            d.new_note_action = NewNoteAction::from_bits(r.read_u8());
            d.duplicate_action = DuplicateAction::from_u8(r.read_u8());
            d.duplicate_check = DuplicateCheck::from_u8(r.read_u8());
            d.global_volume = r.read_u8();
            d.panning = r.read_u16_be() as i16;
            d.pitch_pan_separation = r.read_u8();
            d.pitch_pan_center = r.read_u8();
            d.random_volume = r.read_u8();
            d.random_panning = r.read_u8();
            d.fadeout = r.read_u16_be();
            d.volume_envelope = read_envelope(r, stored, false)?;
            d.panning_envelope = read_envelope(r, stored, false)?;
            d.pitch_envelope = read_envelope(r, stored, false)?;
            for n in d.sample_number.iter_mut() {
                *n = if self.version >= 0x103 {
                    r.read_u16_be()
                } else {
                    r.read_u8() as u16
                };
            }
            let notes = r.read_vec(INSTNOTES);
            if notes.len() == INSTNOTES {
                d.sample_note.copy_from_slice(&notes);
            }
            d.name = read_string(r).unwrap_or_default();
            if r.eof() {
                return Err(ModError::LoadingSampleInfo);
            }
        }
        Ok(())
    }

    /// Old layout: samples are nested in their instruments.
    fn load_old_instruments(
        &self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
    ) -> Result<Vec<OldSample>, ModError> {
        let mut samples: Vec<OldSample> = Vec::new();
        for d in of.instruments.iter_mut() {
            d.sample_number = [u16::MAX; INSTNOTES];
            let count = r.read_u8();
            let base = samples.len() as u16;
            for n in d.sample_number.iter_mut().take(OLD_NOTES) {
                *n = base.wrapping_add(r.read_u8() as u16);
            }
            d.volume_envelope = read_envelope(r, OLD_ENVPOINTS, true)?;
            d.panning_envelope = read_envelope(r, OLD_ENVPOINTS, true)?;
            let vibrato = AutoVibrato {
                waveform: r.read_u8(),
                sweep: r.read_u8(),
                depth: r.read_u8(),
                rate: r.read_u8(),
                it_style: false,
            };
            d.fadeout = r.read_u16_le();
            d.name = read_string(r).unwrap_or_default();

            for _ in 0..count {
                let s = OldSample {
                    c2spd: r.read_u16_le(),
                    transpose: r.read_u8() as i8,
                    volume: r.read_u8(),
                    panning: r.read_u8(),
                    length: r.read_u32_le(),
                    loop_start: r.read_u32_le(),
                    loop_end: r.read_u32_le(),
                    flags: r.read_u16_le(),
                    name: read_string(r).unwrap_or_default(),
                    vibrato,
                };
                if r.eof() {
                    return Err(ModError::LoadingSampleInfo);
                }
                samples.push(s);
            }
        }
        if samples.is_empty() {
            return Err(ModError::LoadingSampleInfo);
        }
        Ok(samples)
    }
}

/// Old files always carry instruments; detect ones that are plain
/// one-to-one sample wrappers and fold them away.
fn drop_trivial_instruments(of: &mut ModuleBuilder) {
    if of.num_samples != of.num_instruments {
        return;
    }
    let trivial = of.instruments.iter().enumerate().all(|(t, d)| {
        d.volume_envelope.points.is_empty()
            && d.panning_envelope.points.is_empty()
            && d.global_volume == 64
            && (0..OLD_NOTES)
                .all(|u| d.sample_number[u] == t as u16 && d.sample_note[u] == u as u8)
    });
    if !trivial {
        return;
    }
    of.flags.remove(ModuleFlags::INST | ModuleFlags::NO_WRAP);
    for t in 0..of.instruments.len() {
        let name = std::mem::take(&mut of.instruments[t].name);
        of.samples[t].name = name;
    }
    log::debug!("[UNI] instruments were sample wrappers, dropped");
}

impl Loader for UniLoader {
    fn tag(&self) -> &'static str {
        "UNI"
    }

    fn description(&self) -> &'static str {
        "APlayer and MikCvt UNIMod"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        let id = read_array::<6>(r);
        if r.eof() {
            return false;
        }
        if &id[..3] == b"UN0" {
            return (b'4'..=b'6').contains(&id[3]);
        }
        &id[..5] == b"APUN\x01" && (1..=6).contains(&id[5])
    }

    fn load(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        _curious: bool,
    ) -> Result<(), ModError> {
        let mh = self.read_header(r);
        let version = self.version;

        of.flags = ModuleFlags::from_bits_truncate(mh.flags);
        of.num_channels = mh.channels;
        of.num_positions = mh.positions;
        of.num_patterns = mh.patterns;
        of.num_tracks = mh.tracks;
        of.num_instruments = mh.instruments;
        of.restart_position = mh.restart;
        of.initial_speed = mh.speed;
        of.initial_tempo = mh.tempo as u16;
        of.bpm_limit = if mh.bpm_limit != 0 { mh.bpm_limit } else { 32 };

        of.title = read_string(r).unwrap_or_default();
        let old_type = if version < 0x102 { read_string(r) } else { None };
        of.format = self.format_name(old_type);
        of.comment = read_string(r);
        if version >= 6 {
            of.num_voices = mh.voices;
            of.initial_volume = mh.volume;
        }
        if r.eof() {
            return Err(ModError::LoadingHeader);
        }
        log::debug!("[UNI] revision {version:#x}, {}", of.format);

        let channels = of.num_channels as usize;
        if channels > um_ir::MAX_CHANNELS {
            return Err(ModError::LoadingHeader);
        }
        of.alloc_positions(of.num_positions as usize)?;
        if version >= 6 {
            for t in 0..of.num_positions as usize {
                of.positions[t] = if version >= APLAYER {
                    r.read_u16_be()
                } else {
                    r.read_u8() as u16
                };
            }
            for t in 0..channels {
                of.panning[t] = r.read_u16_be() as i16;
            }
            for t in 0..channels {
                of.channel_volume[t] = r.read_u8();
            }
        } else {
            if mh.positions > 256 || channels > 32 {
                return Err(ModError::LoadingHeader);
            }
            for t in 0..of.num_positions as usize {
                of.positions[t] = mh.old_positions[t] as u16;
            }
            for t in 0..channels {
                of.panning[t] = mh.old_panning[t] as i16;
            }
        }
        if version < 0x106 {
            for p in of.positions.iter_mut().filter(|p| **p == 255) {
                *p = LAST_PATTERN;
            }
        }

        if version >= 6 {
            of.num_samples = mh.samples;
            of.alloc_samples()?;
            self.load_samples(r, of)?;
            if of.flags.contains(ModuleFlags::INST) {
                of.alloc_instruments()?;
                self.load_instruments(r, of)?;
            }
        } else {
            of.alloc_instruments()?;
            let old = self.load_old_instruments(r, of)?;
            of.num_samples = old.len() as u16;
            of.alloc_samples()?;
            for (q, s) in of.samples.iter_mut().zip(&old) {
                *q = Sample {
                    name: s.name.clone(),
                    length: s.length,
                    loop_start: s.loop_start,
                    loop_end: s.loop_end,
                    volume: s.volume,
                    speed: s.c2spd as u32,
                    panning: s.panning as i16,
                    vibrato: s.vibrato,
                    flags: old_sample_flags(s.flags),
                    ..Sample::default()
                };
            }
            let num_samples = old.len();
            for d in of.instruments.iter_mut() {
                for t in 0..INSTNOTES {
                    let n = d.sample_number[t] as usize;
                    d.sample_note[t] = if n >= num_samples {
                        255
                    } else {
                        (t as i32 + old[n].transpose as i32).clamp(0, 255) as u8
                    };
                }
            }
            drop_trivial_instruments(of);
        }

        of.alloc_patterns()?;
        let num_patterns = of.num_patterns as usize;
        let read_word = |r: &mut dyn ByteReader| {
            if version >= 6 {
                r.read_u16_be()
            } else {
                r.read_u16_le()
            }
        };
        for t in 0..num_patterns {
            of.pattern_rows[t] = read_word(r);
        }
        for t in 0..num_patterns * channels {
            of.patterns[t] = read_word(r);
        }

        of.alloc_tracks()?;
        for t in 0..of.num_tracks as usize {
            let track = read_track(r, version)?;
            of.put_track(t, track)?;
        }
        Ok(())
    }

    fn load_title(&self, r: &mut dyn ByteReader) -> Option<String> {
        let mut probe = UniLoader::default();
        probe.read_header(r);
        if r.eof() {
            return None;
        }
        Some(read_string(r).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemReader;

    #[test]
    fn revision_numbers() {
        let mut r = MemReader::new(&[0x01, 0x04]);
        assert_eq!(version_of(b"APUN", &mut r), 0x104);
        let mut r = MemReader::new(&[0]);
        assert_eq!(version_of(b"UN06", &mut r), 6);
        assert_eq!(r.tell(), 1);
        let mut r = MemReader::new(&[]);
        assert_eq!(version_of(b"UN05", &mut r), 5);
    }

    #[test]
    fn flag_layouts_moved_between_revisions() {
        assert_eq!(
            sample_flags(0x104, 0x0102),
            SampleFlags::LOOP | SampleFlags::SIGNED
        );
        assert_eq!(
            sample_flags(0x102, 0x0042),
            SampleFlags::LOOP | SampleFlags::SIGNED
        );
        assert_eq!(sample_flags(6, 0x0020), SampleFlags::LOOP);
        assert_eq!(old_sample_flags(0x11), SampleFlags::LOOP | SampleFlags::BITS16);
    }

    #[test]
    fn strings_are_length_prefixed() {
        let mut r = MemReader::new(&[3, 0, b'a', b'b', b'c', 0, 0]);
        assert_eq!(read_string(&mut r).as_deref(), Some("abc"));
        assert_eq!(read_string(&mut r), None);
    }

    #[test]
    fn tracks_are_checked() {
        let note = um_ir::Opcode::Note as u8;
        let good = [0, 4, 3, note, 48, 0];
        assert!(read_track(&mut MemReader::new(&good), 6).is_ok());
        let unterminated = [3, 0, 3, note, 48];
        assert_eq!(
            read_track(&mut MemReader::new(&unterminated), 5),
            Err(ModError::LoadingTrack)
        );
    }
}
