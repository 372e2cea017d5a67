//! OctaMED (.MED) module parser for the MMD0 and MMD1 layouts.
//!
//! All structures are big-endian and located through absolute file
//! pointers from the header. Synthetic and hybrid instruments are not
//! supported.

use std::io::SeekFrom;

use binrw::BinRead;
use um_ir::{
    periods, ModError, ModuleBuilder, ModuleFlags, Opcode, SampleFlags, MAX_CHANNELS,
};

use crate::common::{dup_str, read_comment};
use crate::loader::Loader;
use crate::reader::{read_array, read_struct, ByteReader};

/// Sample lengths at or above the `MMD0` tag are treated as broken.
const MMD0_TAG: u32 = u32::from_be_bytes(*b"MMD0");
const MAX_LINES: usize = 3200;
const SONG_SAMPLES: usize = 63;

#[derive(BinRead, Debug)]
#[br(big)]
struct Header {
    id: [u8; 4],
    _mod_len: u32,
    song_ptr: u32,
    _psecnum: u16,
    _pseq: u16,
    block_ptrs: u32,
    _reserved1: u32,
    sample_ptrs: u32,
    _reserved2: u32,
    exp_ptr: u32,
}

#[derive(BinRead, Debug, Clone, Copy)]
#[br(big)]
struct SongSample {
    rep: u16,
    rep_len: u16,
    _midi_channel: u8,
    _midi_preset: u8,
    _volume: u8,
    _transpose: i8,
}

#[derive(BinRead, Debug)]
#[br(big)]
struct Song {
    samples: [SongSample; SONG_SAMPLES],
    num_blocks: u16,
    song_len: u16,
    play_seq: [u8; 256],
    def_tempo: u16,
    _play_transpose: i8,
    flags: u8,
    flags2: u8,
    tempo2: u8,
    _track_vol: [u8; 16],
    _master_vol: u8,
    num_samples: u8,
}

#[derive(BinRead, Debug, Default)]
#[br(big)]
struct Expansion {
    _next_mod: u32,
    exp_smp: u32,
    s_ext_entries: u16,
    s_ext_entry_size: u16,
    anno_txt: u32,
    anno_len: u32,
    inst_info: u32,
    i_ext_entries: u16,
    i_ext_entry_size: u16,
    _jump_mask: u32,
    _rgb_table: u32,
    _channel_split: u32,
    _n_info: u32,
    song_name: u32,
    song_name_len: u32,
}

const FLAG_VOLHEX: u8 = 0x10;
const FLAG2_BPM: u8 = 0x20;
const FLAG2_BEAT_MASK: u8 = 0x1f;

/// Cell as decoded from either block layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Note {
    note: u8,
    ins: u8,
    eff: u8,
    dat: u8,
}

impl Note {
    /// MMD0 packs the cell in three bytes, with the top two bits of the
    /// instrument number stored reversed above the note.
    fn from_mmd0(b: [u8; 3]) -> Self {
        let hi = b[0] >> 6;
        let hi = ((hi & 1) << 1) | (hi >> 1);
        Note {
            note: b[0] & 0x3f,
            ins: (b[1] >> 4) | (hi << 4),
            eff: b[1] & 0xf,
            dat: b[2],
        }
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while a != 0 {
        (a, b) = (b % a, a);
    }
    b
}

fn clamp_tempo(t: u32) -> u16 {
    t.min(u16::MAX as u32) as u16
}

/// Initial speed and tempo from the song header.
fn initial_timing(song: &Song) -> (u8, u16, bool) {
    let deftempo = song.def_tempo as u32;
    if song.flags2 & FLAG2_BPM != 0 {
        let beat = (song.flags2 & FLAG2_BEAT_MASK) as u32 + 1;
        if beat == 4 {
            return (song.tempo2, clamp_tempo(deftempo), false);
        }
        let g = gcd(beat, song.tempo2 as u32).max(1);
        let speed = (song.tempo2 as u32 / g) as u8;
        (speed, clamp_tempo(deftempo * beat / (4 * g)), false)
    } else {
        let mut tempo = if deftempo != 0 { deftempo * 125 / 33 } else { 128 };
        if (1..=10).contains(&deftempo) {
            tempo = tempo * 33 / 6;
        }
        (song.tempo2, clamp_tempo(tempo), true)
    }
}

#[derive(Debug, Default)]
pub struct MedLoader {
    decimal_volumes: bool,
    bpm_tempos: bool,
    buf: Vec<Note>,
}

impl MedLoader {
    fn convert_effect(&self, of: &mut ModuleBuilder, eff: u8, dat: u8) {
        match eff {
            // vibrato with swapped nibbles
            0x5 => of.pt_effect(0x4, (dat >> 4) | ((dat & 0xf) << 4)),
            // unused, MIDI hold/decay, synth jump
            0x6 | 0x7 | 0x8 | 0xe => {}
            0x9 => {
                let speed = if dat == 0 { of.initial_speed } else { dat };
                if self.bpm_tempos {
                    of.uni.effect(Opcode::S3mEffectA, speed as u16);
                } else if dat <= 0x20 {
                    let speed = if dat == 0 { speed } else { dat / 4 };
                    of.pt_effect(0xf, speed);
                } else {
                    of.uni.effect(Opcode::MedSpeed, dat as u16 * 125 / (33 * 4));
                }
            }
            0xc => {
                let vol = if self.decimal_volumes {
                    (dat >> 4) * 10 + (dat & 0xf)
                } else {
                    dat
                };
                of.pt_effect(0xc, vol);
            }
            0xd => of.pt_effect(0xa, dat),
            0xf => match dat {
                0 => of.pt_effect(0xd, 0),
                0xf1 => of.uni.effect(Opcode::MedEffectF1, 0),
                0xf2 => of.uni.effect(Opcode::MedEffectF2, 0),
                0xf3 => of.uni.effect(Opcode::MedEffectF3, 0),
                // stop playing
                0xfe => of.pt_effect(0xb, of.num_patterns.min(255) as u8),
                0xff => of.pt_effect(0xc, 0),
                1..=10 => of.pt_effect(0xf, dat),
                11..=240 => {
                    if self.bpm_tempos {
                        of.pt_effect(0xf, dat.max(32));
                    } else {
                        of.uni.effect(Opcode::MedSpeed, dat as u16 * 125 / 33);
                    }
                }
                _ => {}
            },
            _ => of.pt_effect(eff, dat),
        }
    }

    fn convert_track(&self, of: &mut ModuleBuilder, rows: usize, col: usize, channels: usize) {
        of.uni.reset();
        for t in 0..rows {
            let n = self.buf[t * channels + col];
            if n.ins != 0 {
                of.uni.instrument(n.ins - 1);
            }
            if n.note != 0 {
                of.uni.note(n.note.wrapping_add(3 * periods::OCTAVE as u8 - 1));
            }
            self.convert_effect(of, n.eff, n.dat);
            of.uni.newline();
        }
    }

    fn load_patterns(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        blocks: &[u32],
        mmd1: bool,
    ) -> Result<(), ModError> {
        let read_dims = |r: &mut dyn ByteReader| -> (usize, usize) {
            if mmd1 {
                (r.read_u16_be() as usize, r.read_u16_be() as usize + 1)
            } else {
                (r.read_u8() as usize, r.read_u8() as usize + 1)
            }
        };

        // first pass counts channels
        let mut channels = 0;
        for &ptr in blocks {
            r.seek_to(SeekFrom::Start(ptr as u64));
            let (tracks, lines) = read_dims(r);
            if r.eof() || tracks > MAX_CHANNELS || lines > MAX_LINES {
                return Err(ModError::LoadingPattern);
            }
            channels = channels.max(tracks);
        }
        of.num_channels = channels as u8;
        of.set_track_count()?;
        of.alloc_tracks()?;
        of.alloc_patterns()?;

        let mut track = 0;
        for (t, &ptr) in blocks.iter().enumerate() {
            r.seek_to(SeekFrom::Start(ptr as u64));
            let (tracks, lines) = read_dims(r);
            if mmd1 {
                // block info pointer
                r.skip(4);
            }
            of.pattern_rows[t] = lines as u16;
            self.buf.clear();
            self.buf.resize(lines * channels, Note::default());
            for row in 0..lines {
                for col in 0..tracks {
                    self.buf[row * channels + col] = if mmd1 {
                        let b = read_array::<4>(r);
                        Note {
                            note: b[0],
                            ins: b[1],
                            eff: b[2],
                            dat: b[3],
                        }
                    } else {
                        Note::from_mmd0(read_array::<3>(r))
                    };
                }
            }
            if r.eof() {
                return Err(ModError::LoadingPattern);
            }
            for col in 0..channels {
                self.convert_track(of, lines, col, channels);
                of.store_track(track)?;
                track += 1;
            }
        }
        Ok(())
    }
}

impl Loader for MedLoader {
    fn tag(&self) -> &'static str {
        "MED"
    }

    fn description(&self) -> &'static str {
        "OctaMED"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        let id = read_array::<4>(r);
        !r.eof() && (&id == b"MMD0" || &id == b"MMD1")
    }

    fn load(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        curious: bool,
    ) -> Result<(), ModError> {
        let mh: Header = read_struct(r).map_err(|_| ModError::LoadingHeader)?;
        let mmd1 = match &mh.id {
            b"MMD0" => false,
            b"MMD1" => true,
            _ => return Err(ModError::NotAModule),
        };

        r.seek_to(SeekFrom::Start(mh.song_ptr as u64));
        let song: Song = read_struct(r).map_err(|_| ModError::LoadingHeader)?;
        if song.num_samples as usize > SONG_SAMPLES || song.song_len > 256 {
            return Err(ModError::LoadingHeader);
        }

        let exp = if mh.exp_ptr != 0 {
            r.seek_to(SeekFrom::Start(mh.exp_ptr as u64));
            read_struct(r).map_err(|_| ModError::LoadingHeader)?
        } else {
            Expansion::default()
        };

        r.seek_to(SeekFrom::Start(mh.sample_ptrs as u64));
        let sample_ptrs: Vec<u32> = (0..song.num_samples).map(|_| r.read_u32_be()).collect();
        r.seek_to(SeekFrom::Start(mh.block_ptrs as u64));
        let blocks: Vec<u32> = (0..song.num_blocks).map(|_| r.read_u32_be()).collect();
        if r.eof() {
            return Err(ModError::LoadingHeader);
        }

        let song_len = song.song_len as usize;
        of.alloc_positions(song_len)?;
        for (pos, &p) in of.positions.iter_mut().zip(&song.play_seq[..song_len]) {
            *pos = p as u16;
        }

        self.decimal_volumes = song.flags & FLAG_VOLHEX == 0;
        self.bpm_tempos = song.flags2 & FLAG2_BPM != 0;
        let (speed, tempo, high_bpm) = initial_timing(&song);
        of.initial_speed = speed;
        of.initial_tempo = tempo;
        if high_bpm {
            of.flags |= ModuleFlags::HIGH_BPM;
        }

        of.format = format!("OctaMED ({})", String::from_utf8_lossy(&mh.id));
        of.num_channels = 0;
        of.num_patterns = song.num_blocks;
        of.num_positions = song.song_len;
        of.num_instruments = song.num_samples as u16;
        of.num_samples = song.num_samples as u16;
        of.restart_position = 0;

        if exp.song_name != 0 && exp.song_name_len != 0 {
            r.seek_to(SeekFrom::Start(exp.song_name as u64));
            let name = r.read_vec(exp.song_name_len as usize);
            of.title = dup_str(&name, true);
        }
        if exp.anno_txt != 0 && exp.anno_len != 0 {
            r.seek_to(SeekFrom::Start(exp.anno_txt as u64));
            of.comment = read_comment(r, exp.anno_len as usize);
        }

        of.alloc_samples()?;
        for t in 0..of.samples.len() {
            let info = song.samples[t];
            let q = &mut of.samples[t];
            q.flags = SampleFlags::SIGNED;
            q.volume = 64;
            let ptr = sample_ptrs[t];
            if ptr != 0 {
                r.seek_to(SeekFrom::Start(ptr as u64));
                let mut length = r.read_u32_be();
                let kind = r.read_u16_be() as i16;
                if kind != 0 {
                    if !curious {
                        return Err(ModError::NotSupported("MED synthsounds"));
                    }
                    log::warn!("[MED] sample {t} is a synthetic instrument, skipped");
                    length = 0;
                }
                if r.eof() {
                    return Err(ModError::LoadingSampleInfo);
                }
                q.length = if length >= MMD0_TAG { 0 } else { length };
                q.seek_pos = r.tell();
                q.loop_start = (info.rep as u32) << 1;
                q.loop_end = q.loop_start + ((info.rep_len as u32) << 1);
                if info.rep_len > 1 {
                    q.flags |= SampleFlags::LOOP;
                }
            } else {
                q.length = 0;
            }

            q.speed = 8363;
            if exp.exp_smp != 0 && t < exp.s_ext_entries as usize && exp.s_ext_entry_size >= 4 {
                let at = exp.exp_smp as u64 + (t * exp.s_ext_entry_size as usize) as u64;
                r.seek_to(SeekFrom::Start(at + 3));
                let finetune = r.read_u8();
                q.speed = periods::FINETUNE[(finetune & 0xf) as usize] as u32;
            }
            if exp.inst_info != 0 && t < exp.i_ext_entries as usize && exp.i_ext_entry_size >= 40 {
                let at = exp.inst_info as u64 + (t * exp.i_ext_entry_size as usize) as u64;
                r.seek_to(SeekFrom::Start(at));
                q.name = dup_str(&read_array::<40>(r), true);
            }
        }

        self.load_patterns(r, of, &blocks, mmd1)?;
        log::debug!(
            "[MED] {} with {} channels, {} blocks",
            of.format,
            of.num_channels,
            of.num_patterns
        );
        Ok(())
    }

    fn cleanup(&mut self) {
        self.buf = Vec::new();
    }

    fn load_title(&self, r: &mut dyn ByteReader) -> Option<String> {
        let mh: Header = read_struct(r).ok()?;
        if mh.exp_ptr == 0 {
            return None;
        }
        r.seek_to(SeekFrom::Start(mh.exp_ptr as u64));
        let exp: Expansion = read_struct(r).ok()?;
        if exp.song_name == 0 || exp.song_name_len == 0 {
            return None;
        }
        r.seek_to(SeekFrom::Start(exp.song_name as u64));
        let name = r.read_vec(exp.song_name_len as usize);
        (!r.eof()).then(|| dup_str(&name, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(def_tempo: u16, flags2: u8, tempo2: u8) -> Song {
        Song {
            samples: [SongSample {
                rep: 0,
                rep_len: 0,
                _midi_channel: 0,
                _midi_preset: 0,
                _volume: 0,
                _transpose: 0,
            }; SONG_SAMPLES],
            num_blocks: 1,
            song_len: 1,
            play_seq: [0; 256],
            def_tempo,
            _play_transpose: 0,
            flags: 0,
            flags2,
            tempo2,
            _track_vol: [0; 16],
            _master_vol: 64,
            num_samples: 0,
        }
    }

    #[test]
    fn mmd0_instrument_bits() {
        // top bits 01 reversed give instrument bit 5
        let n = Note::from_mmd0([0x40 | 13, 0x2c, 0x20]);
        assert_eq!(n.note, 13);
        assert_eq!(n.ins, 0x22);
        assert_eq!(n.eff, 0xc);
        assert_eq!(n.dat, 0x20);
    }

    #[test]
    fn tempo_modes() {
        assert_eq!(initial_timing(&song(33, 0, 6)), (6, 125, true));
        assert_eq!(initial_timing(&song(0, 0, 6)), (6, 128, true));
        // beat length 4 keeps the raw bpm
        assert_eq!(initial_timing(&song(140, FLAG2_BPM | 3, 6)), (6, 140, false));
        // beat length 8 and speed 6 share a factor of 2
        assert_eq!(initial_timing(&song(100, FLAG2_BPM | 7, 6)), (3, 100, false));
    }

    #[test]
    fn decimal_volume_and_fxx_commands() {
        let loader = MedLoader {
            decimal_volumes: true,
            ..MedLoader::default()
        };
        let mut of = ModuleBuilder::new();
        of.uni.reset();
        loader.convert_effect(&mut of, 0xc, 0x32);
        loader.convert_effect(&mut of, 0xf, 0xf2);
        of.uni.newline();
        loader.convert_effect(&mut of, 0xf, 0x7d);
        of.uni.newline();
        let track = of.uni.finish();
        let rows: Vec<Vec<_>> = track
            .rows()
            .map(|row| row.events().map(|e| (e.opcode, e.operand)).collect())
            .collect();
        assert_eq!(
            rows[0],
            vec![(Opcode::PtEffectC, 32), (Opcode::MedEffectF2, 0)]
        );
        assert_eq!(rows[1], vec![(Opcode::MedSpeed, 125 * 125 / 33)]);
    }
}
