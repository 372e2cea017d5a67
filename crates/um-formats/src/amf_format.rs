//! DSMI Advanced Module Format (.AMF) parser, versions 1.0 to 1.4.
//!
//! Tracks are stored once and shared between patterns through a track
//! table; each is a list of (row, command, argument) triplets.

use binrw::BinRead;
use um_ir::{
    periods, ModError, ModuleBuilder, ModuleFlags, Opcode, SampleFlags, VolEffect,
    PAN_LEFT, PAN_RIGHT, PAN_SURROUND,
};

use crate::common::dup_str;
use crate::loader::Loader;
use crate::reader::{read_array, read_struct, ByteReader};

const ROWS: usize = 64;

#[derive(BinRead, Debug)]
#[br(little, magic = b"AMF")]
struct Header {
    version: u8,
    title: [u8; 32],
    num_samples: u8,
    num_orders: u8,
    num_tracks: u16,
    num_channels: u8,
}

#[derive(BinRead, Debug)]
#[br(little)]
struct SampleHeader {
    kind: u8,
    name: [u8; 32],
    _filename: [u8; 13],
    /// 1-based rank of the sample data, not a file offset.
    offset: u32,
    length: u32,
    c2spd: u16,
    volume: u8,
    rep_pos: u32,
    rep_end: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Note {
    note: u8,
    instr: u8,
    volume: u8,
    fx_count: u8,
    effect: [u8; 3],
    parameter: [i8; 3],
}

/// Unpack one track into `track`. Returns false on a malformed track.
fn unpack_track(r: &mut dyn ByteReader, track: &mut [Note; ROWS]) -> bool {
    *track = [Note::default(); ROWS];
    let mut size = r.read_u16_le() as u32 | (r.read_u8() as u32) << 16;
    while size > 0 {
        size -= 1;
        let row = r.read_u8() as usize;
        let cmd = r.read_u8();
        let arg = r.read_i8();
        if size == 0 && row == 0xff && cmd == 0xff && arg == -1 {
            break;
        }
        if row >= ROWS {
            // truncated row list
            r.skip(size as i64 * 3);
            return true;
        }
        match cmd {
            0..=0x7e => {
                track[row].note = cmd;
                track[row].volume = (arg as u8).wrapping_add(1);
            }
            // repeat an earlier row
            0x7f => {
                let src = row as i32 + arg as i32;
                if arg < 0 && src >= 0 {
                    track[row] = track[src as usize];
                }
            }
            0x80 => track[row].instr = (arg as u8).wrapping_add(1),
            0x83 => track[row].volume = (arg as u8).wrapping_add(1),
            // padding some converters leave behind
            0xff => {}
            0x81..=0x97 => {
                let n = &mut track[row];
                if n.fx_count < 3 {
                    n.effect[n.fx_count as usize] = cmd & 0x7f;
                    n.parameter[n.fx_count as usize] = arg;
                    n.fx_count += 1;
                }
            }
            _ => return false,
        }
    }
    true
}

/// Volume slide parameter: positive slides up, negative down.
fn slide(inf: i8) -> u16 {
    if inf >= 0 {
        ((inf as u8 & 0xf) << 4) as u16
    } else {
        (inf.unsigned_abs() & 0xf) as u16
    }
}

fn convert_track(of: &mut ModuleBuilder, track: &mut [Note; ROWS]) {
    let mut porta_memory: Option<Opcode> = None;
    let mut porta = |of: &mut ModuleBuilder, inf: i8, up: u16, down: u16| {
        if inf > 0 {
            of.uni.effect(Opcode::S3mEffectE, up);
            porta_memory = Some(Opcode::S3mEffectE);
        } else if inf < 0 {
            of.uni.effect(Opcode::S3mEffectF, down);
            porta_memory = Some(Opcode::S3mEffectF);
        } else if let Some(op) = porta_memory {
            of.uni.effect(op, 0);
        }
    };

    of.uni.reset();
    for n in track.iter_mut() {
        if n.instr != 0 {
            of.uni.instrument(n.instr - 1);
        }
        if n.note > periods::OCTAVE as u8 {
            of.uni.note(n.note - periods::OCTAVE as u8);
        }
        for fx in (0..n.fx_count as usize).rev() {
            let inf = n.parameter[fx];
            let neg = inf.unsigned_abs();
            match n.effect[fx] {
                0x01 => of.uni.effect(Opcode::S3mEffectA, inf as u8 as u16),
                0x02 if inf != 0 => of.uni.effect(Opcode::S3mEffectD, slide(inf)),
                0x04 => porta(of, inf, inf as u16, neg as u16),
                0x06 => of.uni.effect(Opcode::ItEffectG, inf as u8 as u16),
                0x07 => of.uni.effect(Opcode::S3mEffectI, inf as u8 as u16),
                0x08 => of.pt_effect(0x0, inf as u8),
                0x09 => of.pt_effect(0x4, inf as u8),
                0x0a | 0x0b => {
                    of.pt_effect(if n.effect[fx] == 0x0a { 0x3 } else { 0x4 }, 0);
                    if inf != 0 {
                        of.uni.effect(Opcode::S3mEffectD, slide(inf));
                    }
                }
                // break row is stored in hex
                0x0c => of.pt_effect(0xd, inf as u8),
                0x0d => of.pt_effect(0xb, inf as u8),
                0x0f => of.uni.effect(Opcode::S3mEffectQ, (inf as u8 & 0xf) as u16),
                0x10 => of.pt_effect(0x9, inf as u8),
                0x11 if inf != 0 => {
                    let dat = if inf > 0 {
                        (((inf as u8) & 0xf) << 4) | 0xf
                    } else {
                        0xf0 | (neg & 0xf)
                    };
                    of.uni.effect(Opcode::S3mEffectD, dat as u16);
                }
                0x12 => porta(
                    of,
                    inf,
                    (0xf0 | (inf as u8 & 0xf)) as u16,
                    (0xf0 | (neg & 0xf)) as u16,
                ),
                0x13 => of.pt_effect(0xe, 0xd0 | (inf as u8 & 0xf)),
                // note cut
                0x14 => {
                    of.pt_effect(0xc, 0);
                    n.volume = 0;
                }
                0x15 => of.uni.effect(Opcode::S3mEffectT, inf as u8 as u16),
                0x16 => porta(
                    of,
                    inf,
                    (0xe0 | ((inf as u8 >> 2) & 0xf)) as u16,
                    (0xe0 | ((neg >> 2) & 0xf)) as u16,
                ),
                0x17 => {
                    if inf > 64 {
                        of.uni.effect(Opcode::ItEffectS0, 0x91);
                    } else {
                        let pan = if inf == 64 { 255 } else { ((inf as i16 + 64) << 1) as u8 };
                        of.pt_effect(0x8, pan);
                    }
                    of.flags |= ModuleFlags::PANNING;
                }
                _ => {}
            }
        }
        if n.volume != 0 {
            of.uni.vol_effect(VolEffect::Volume, n.volume - 1);
        }
        of.uni.newline();
    }
}

/// Channel panning from the signed table; true when the table looks
/// authored rather than a converted MOD's hard left/right layout.
fn apply_panning(of: &mut ModuleBuilder, pan_pos: &[i8; 32]) -> bool {
    let mut authored = true;
    for (pan, &p) in of.panning.iter_mut().zip(pan_pos) {
        *pan = if p > 64 {
            authored = false;
            PAN_SURROUND
        } else if p == 64 {
            PAN_RIGHT
        } else {
            (p as i16 + 64) << 1
        };
    }
    if authored {
        let channels = of.num_channels as usize;
        authored = !of.panning[..channels].iter().enumerate().any(|(t, &p)| {
            p == if (t + 1) & 2 != 0 { PAN_RIGHT } else { PAN_LEFT }
        });
    }
    authored
}

#[derive(Debug, Default)]
pub struct AmfLoader;

impl Loader for AmfLoader {
    fn tag(&self) -> &'static str {
        "AMF"
    }

    fn description(&self) -> &'static str {
        "DSMI Advanced Module Format"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        let id = read_array::<4>(r);
        !r.eof() && &id[..3] == b"AMF" && (10..=14).contains(&id[3])
    }

    fn load(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        _curious: bool,
    ) -> Result<(), ModError> {
        let mh: Header = read_struct(r)?;
        let version = mh.version;
        let max_channels = if version >= 12 { 32 } else { 16 };
        if mh.num_channels == 0 || mh.num_channels > max_channels {
            return Err(ModError::NotAModule);
        }

        let mut pan_pos = [0i8; 32];
        if version >= 11 {
            let count = if version >= 13 { 32 } else { 16 };
            for p in pan_pos.iter_mut().take(count) {
                *p = r.read_i8();
            }
        } else {
            // channel remap table, unused
            r.skip(16);
        }
        let (bpm, speed) = if version >= 13 {
            let bpm = r.read_u8();
            let speed = r.read_u8();
            if bpm < 32 || speed > 32 {
                return Err(ModError::NotAModule);
            }
            (bpm, speed)
        } else {
            (125, 6)
        };
        if r.eof() {
            return Err(ModError::LoadingHeader);
        }

        of.initial_speed = speed;
        of.initial_tempo = bpm as u16;
        of.format = format!("DSMI Module Format {}.{}", version / 10, version % 10);
        of.num_channels = mh.num_channels;
        let channels = mh.num_channels as usize;
        let stored_tracks = mh.num_tracks as usize;
        of.num_tracks = (mh.num_orders as u16 * mh.num_channels as u16)
            .max(mh.num_tracks)
            .checked_add(1)
            .ok_or(ModError::LoadingHeader)?;
        of.title = dup_str(&mh.title, true);
        of.num_positions = mh.num_orders as u16;
        of.num_patterns = mh.num_orders as u16;
        of.restart_position = 0;
        of.flags |= ModuleFlags::S3M_SLIDES;
        of.bpm_limit = 32;
        if apply_panning(of, &pan_pos) {
            of.flags |= ModuleFlags::PANNING;
        }
        of.num_instruments = mh.num_samples as u16;
        of.num_samples = mh.num_samples as u16;

        of.alloc_positions(of.num_positions as usize)?;
        for (t, pos) in of.positions.iter_mut().enumerate() {
            *pos = t as u16;
        }
        of.alloc_tracks()?;
        of.alloc_patterns()?;

        for t in 0..of.num_patterns as usize {
            if version >= 14 {
                of.pattern_rows[t] = r.read_u16_le();
            }
            for u in 0..channels {
                of.patterns[t * channels + u] = r.read_u16_le();
            }
        }
        if r.eof() {
            return Err(ModError::LoadingHeader);
        }

        of.alloc_samples()?;
        for q in of.samples.iter_mut() {
            let s: SampleHeader = read_struct(r).map_err(|_| ModError::LoadingSampleInfo)?;
            q.name = dup_str(&s.name, true);
            q.speed = if s.c2spd == 8368 { 8363 } else { s.c2spd as u32 };
            q.volume = s.volume;
            if s.kind != 0 {
                q.seek_pos = s.offset as u64;
                q.length = s.length;
                q.loop_start = s.rep_pos;
                q.loop_end = s.rep_end;
                if s.rep_end.wrapping_sub(s.rep_pos) > 2 {
                    q.flags |= SampleFlags::LOOP;
                }
            }
        }

        let mut remap = vec![0u16; stored_tracks + 1];
        for slot in remap.iter_mut().skip(1) {
            *slot = r.read_u16_le();
        }
        if r.eof() {
            return Err(ModError::LoadingTrack);
        }
        let real_tracks = remap.iter().copied().max().unwrap_or(0) as usize;
        let table_len = of.num_patterns as usize * channels;
        for p in of.patterns.iter_mut().take(table_len) {
            *p = match remap.get(*p as usize) {
                Some(&t) => t.wrapping_sub(1),
                None => real_tracks as u16,
            };
        }
        if real_tracks + 1 > of.num_tracks as usize {
            return Err(ModError::LoadingTrack);
        }
        log::debug!("[AMF] {} with {real_tracks} distinct tracks", of.format);

        let mut track = [Note::default(); ROWS];
        for t in 0..real_tracks {
            if r.eof() || !unpack_track(r, &mut track) {
                return Err(ModError::LoadingTrack);
            }
            convert_track(of, &mut track);
            of.store_track(t)?;
        }
        // empty track for table entries past the stored ones
        of.uni.reset();
        for _ in 0..ROWS {
            of.uni.newline();
        }
        of.store_track(real_tracks)?;

        // sample data follows in rank order
        let ranks: Vec<u64> = of.samples.iter().map(|s| s.seek_pos).collect();
        let mut pos = r.tell();
        for rank in 1..=ranks.iter().copied().max().unwrap_or(0) {
            let i = ranks
                .iter()
                .position(|&k| k == rank)
                .ok_or(ModError::LoadingSampleInfo)?;
            let q = &mut of.samples[i];
            q.seek_pos = pos;
            pos += q.length as u64;
        }
        Ok(())
    }

    fn load_title(&self, r: &mut dyn ByteReader) -> Option<String> {
        r.skip(4);
        let title = read_array::<32>(r);
        (!r.eof()).then(|| dup_str(&title, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemReader;

    #[test]
    fn unpack_duplicates_and_effects() {
        #[rustfmt::skip]
        let data = [
            6, 0, 0,
            0, 0x30, 31,       // row 0: note 0x30, volume 32
            0, 0x80, 4,        // instrument 5
            0, 0x82, -3i8 as u8, // volume slide down 3
            2, 0x7f, -2i8 as u8, // row 2 copies row 0
            70, 0, 0,          // out of range row ends the track
            0, 0, 0,
        ];
        let mut r = MemReader::new(&data);
        let mut track = [Note::default(); ROWS];
        assert!(unpack_track(&mut r, &mut track));
        assert_eq!(track[0].note, 0x30);
        assert_eq!(track[0].volume, 32);
        assert_eq!(track[0].instr, 5);
        assert_eq!(track[0].fx_count, 1);
        assert_eq!(track[2], track[0]);
        assert_eq!(r.tell(), data.len() as u64);
    }

    #[test]
    fn unknown_command_is_fatal() {
        let data = [1, 0, 0, 0, 0x98, 0];
        let mut r = MemReader::new(&data);
        let mut track = [Note::default(); ROWS];
        assert!(!unpack_track(&mut r, &mut track));
    }

    #[test]
    fn converted_row() {
        let mut of = ModuleBuilder::new();
        let mut track = [Note::default(); ROWS];
        track[0] = Note {
            note: 0x30,
            instr: 5,
            volume: 33,
            fx_count: 1,
            effect: [0x02, 0, 0],
            parameter: [-3, 0, 0],
        };
        convert_track(&mut of, &mut track);
        let t = of.uni.finish();
        let row = t.rows().next().expect("row");
        let events: Vec<_> = row.events().map(|e| (e.opcode, e.operand)).collect();
        assert_eq!(
            events,
            vec![
                (Opcode::Instrument, 4),
                (Opcode::Note, 0x30 - 12),
                (Opcode::S3mEffectD, 3),
                (Opcode::VolEffects, ((VolEffect::Volume as u16) << 8) | 32),
            ]
        );
    }

    #[test]
    fn hard_stereo_is_not_authored() {
        let mut of = ModuleBuilder::new();
        of.num_channels = 4;
        let mut pan = [0i8; 32];
        pan[..4].copy_from_slice(&[-64, 64, 64, -64]);
        assert!(!apply_panning(&mut of, &pan));
        pan[..4].copy_from_slice(&[-32, 32, 32, -32]);
        assert!(apply_panning(&mut of, &pan));
    }
}
