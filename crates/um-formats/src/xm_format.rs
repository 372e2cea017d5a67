//! FastTracker 2 (.XM) module parser.
//!
//! Versions 1.02 and 1.03 store instruments before the patterns and all
//! sample data after them; 1.04 stores patterns first and puts each
//! instrument's sample data right after its headers.

use std::io::SeekFrom;

use binrw::BinRead;
use um_ir::{
    EnvPoint, Envelope, EnvelopeFlags, ModError, ModuleBuilder, ModuleFlags, Opcode, Sample,
    SampleFlags, INSTNOTES,
};

use crate::common::dup_str;
use crate::loader::Loader;
use crate::reader::{read_array, read_struct, ByteReader};

const XM_ID: &[u8; 17] = b"Extended Module: ";
/// Words in a stored envelope: 12 (position, value) pairs.
const ENV_WORDS: usize = 24;
/// Playable notes; anything higher is key off.
const XM_NOTES: u8 = 96;

#[derive(BinRead, Debug)]
#[br(little, magic = b"Extended Module: ")]
struct Header {
    title: [u8; 20],
    _eof_marker: u8,
    tracker: [u8; 20],
    version: u16,
    header_size: u32,
    song_length: u16,
    restart: u16,
    num_channels: u16,
    num_patterns: u16,
    num_instruments: u16,
    flags: u16,
    tempo: u16,
    bpm: u16,
}

#[derive(BinRead, Debug)]
#[br(little)]
struct SampleHeader {
    length: u32,
    loop_start: u32,
    loop_length: u32,
    volume: u8,
    finetune: i8,
    kind: u8,
    panning: u8,
    relative_note: i8,
    _reserved: u8,
    name: [u8; 22],
}

/// Instrument-wide data following the instrument name.
#[derive(BinRead, Debug)]
#[br(little)]
struct PatchHeader {
    sample_map: [u8; 96],
    vol_env: [u16; ENV_WORDS],
    pan_env: [u16; ENV_WORDS],
    vol_points: u8,
    pan_points: u8,
    vol_sustain: u8,
    vol_loop_begin: u8,
    vol_loop_end: u8,
    pan_sustain: u8,
    pan_loop_begin: u8,
    pan_loop_end: u8,
    vol_flags: u8,
    pan_flags: u8,
    vib_type: u8,
    vib_sweep: u8,
    vib_depth: u8,
    vib_rate: u8,
    fadeout: u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Note {
    note: u8,
    ins: u8,
    vol: u8,
    eff: u8,
    dat: u8,
}

/// Read one packed note, returning it and the number of bytes used.
fn read_note(r: &mut dyn ByteReader) -> (Note, i32) {
    let mut n = Note::default();
    let cmp = r.read_u8();
    if cmp & 0x80 == 0 {
        n.note = cmp;
        n.ins = r.read_u8();
        n.vol = r.read_u8();
        n.eff = r.read_u8();
        n.dat = r.read_u8();
        return (n, 5);
    }
    let mut used = 1;
    let mut field = |bit: u8, slot: &mut u8| {
        if cmp & bit != 0 {
            *slot = r.read_u8();
            used += 1;
        }
    };
    field(1, &mut n.note);
    field(2, &mut n.ins);
    field(4, &mut n.vol);
    field(8, &mut n.eff);
    field(16, &mut n.dat);
    (n, used)
}

fn convert_track(of: &mut ModuleBuilder, notes: &[Note]) {
    of.uni.reset();
    for n in notes {
        if n.note != 0 {
            if n.note > XM_NOTES {
                of.uni.effect(Opcode::KeyFade, 0);
            } else {
                of.uni.note(n.note - 1);
            }
        }
        if n.ins != 0 {
            of.uni.instrument(n.ins - 1);
        }

        let vol = n.vol;
        let lo = vol & 0xf;
        match vol >> 4 {
            0x6 if lo != 0 => of.uni.effect(Opcode::XmEffectA, lo as u16),
            0x7 if lo != 0 => of.uni.effect(Opcode::XmEffectA, (lo << 4) as u16),
            // a zero nibble means no slide here, unlike the effect column
            0x8 => of.pt_effect(0xe, 0xb0 | lo),
            0x9 => of.pt_effect(0xe, 0xa0 | lo),
            0xa => of.pt_effect(0x4, lo << 4),
            0xb => of.pt_effect(0x4, lo),
            0xc => of.pt_effect(0x8, lo << 4),
            0xd if lo != 0 => of.uni.effect(Opcode::XmEffectP, lo as u16),
            0xe if lo != 0 => of.uni.effect(Opcode::XmEffectP, (lo << 4) as u16),
            0xf => of.pt_effect(0x3, lo << 4),
            _ if (0x10..=0x50).contains(&vol) => of.pt_effect(0xc, vol - 0x10),
            _ => {}
        }

        let dat = n.dat;
        let op = |op: Opcode| (op, dat as u16);
        let special = match n.eff {
            0x4 => Some(op(Opcode::XmEffect4)),
            0x6 => Some(op(Opcode::XmEffect6)),
            0xa => Some(op(Opcode::XmEffectA)),
            0xe => match dat >> 4 {
                0x1 => Some((Opcode::XmEffectE1, (dat & 0xf) as u16)),
                0x2 => Some((Opcode::XmEffectE2, (dat & 0xf) as u16)),
                0xa => Some((Opcode::XmEffectEA, (dat & 0xf) as u16)),
                0xb => Some((Opcode::XmEffectEB, (dat & 0xf) as u16)),
                _ => {
                    of.pt_effect(0xe, dat);
                    None
                }
            },
            // G: global volume
            16 => Some((Opcode::XmEffectG, if dat > 64 { 128 } else { (dat as u16) << 1 })),
            17 => Some(op(Opcode::XmEffectH)),
            20 => Some(op(Opcode::KeyFade)),
            21 => Some(op(Opcode::XmEffectL)),
            25 => Some(op(Opcode::XmEffectP)),
            27 => Some(op(Opcode::S3mEffectQ)),
            29 => Some(op(Opcode::S3mEffectI)),
            33 => match dat >> 4 {
                1 => Some((Opcode::XmEffectX1, (dat & 0xf) as u16)),
                2 => Some((Opcode::XmEffectX2, (dat & 0xf) as u16)),
                _ => None,
            },
            eff @ 0..=0xf => {
                let mut dat = dat;
                // pattern break targets are decimal unless clearly hex
                if eff == 0xd && dat >> 4 <= 9 && dat & 0xf <= 9 {
                    dat = (dat >> 4) * 10 + (dat & 0xf);
                }
                of.pt_effect(eff, dat);
                None
            }
            _ => None,
        };
        if let Some((op, operand)) = special {
            of.uni.effect(op, operand);
        }
        of.uni.newline();
    }
}

/// Repair envelopes whose editor only stored the low byte of each
/// position, by carrying the high byte over from the previous point.
fn fix_envelope(points: &mut [EnvPoint]) {
    let Some(first) = points.first() else {
        return;
    };
    let mut old = first.pos as i32;
    for u in 1..points.len() {
        let prev = points[u - 1].pos as i32;
        let cur = points[u].pos as i32;
        if cur < prev && cur < 0x100 {
            let fixed = if cur > old {
                cur + (prev - old)
            } else {
                cur | ((prev + 0x100) & 0xff00)
            };
            points[u].pos = fixed as i16;
        }
        old = cur;
    }
}

fn build_envelope(
    words: &[u16; ENV_WORDS],
    count: u8,
    flags: u8,
    sustain: u8,
    begin: u8,
    end: u8,
) -> Envelope {
    let mut env = Envelope::default();
    if flags & 1 != 0 {
        env.flags |= EnvelopeFlags::ON;
    }
    if flags & 2 != 0 {
        env.flags |= EnvelopeFlags::SUSTAIN;
    }
    if flags & 4 != 0 {
        env.flags |= EnvelopeFlags::LOOP;
    }
    env.sustain_begin = sustain;
    env.sustain_end = sustain;
    env.loop_begin = begin;
    env.loop_end = end;
    for pair in words.chunks_exact(2).take(count as usize) {
        env.push(pair[0] as i16, (pair[1] as i16) << 2);
    }
    env.disable_if_degenerate();
    if env.is_enabled() {
        fix_envelope(&mut env.points);
    }
    env
}

fn format_name(tracker: &[u8; 20], version: u16) -> String {
    let mut name = dup_str(tracker, false);
    if name.is_empty() {
        name = "Unknown tracker".to_string();
    }
    format!("{name} (XM format {}.{:02})", version >> 8, version & 0xff)
}

/// A sample header waiting for its data offset to be resolved.
struct PendingSample {
    header: SampleHeader,
    vibrato: (u8, u8, u8, u8),
    offset: u64,
}

#[derive(Debug, Default)]
pub struct XmLoader;

impl XmLoader {
    fn load_patterns(
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        version: u16,
        stored: usize,
        dummy: bool,
    ) -> Result<(), ModError> {
        let channels = of.num_channels as usize;
        let min_size = if version == 0x0102 { 8 } else { 9 };
        let mut track = 0;
        for t in 0..stored {
            let size = r.read_u32_le();
            if size < min_size {
                return Err(ModError::LoadingPattern);
            }
            if r.read_u8() != 0 {
                // packing type
                return Err(ModError::LoadingPattern);
            }
            let rows = if version == 0x0102 {
                r.read_u8() as usize + 1
            } else {
                r.read_u16_le() as usize
            };
            let mut pack_size = r.read_u16_le() as i32;
            r.skip((size - min_size) as i64);
            of.pattern_rows[t] = rows as u16;

            let mut notes = vec![Note::default(); rows * channels];
            if pack_size > 0 {
                'rows: for u in 0..rows {
                    for v in 0..channels {
                        if pack_size == 0 {
                            break 'rows;
                        }
                        let (n, used) = read_note(r);
                        notes[v * rows + u] = n;
                        pack_size -= used;
                        if pack_size < 0 {
                            return Err(ModError::LoadingPattern);
                        }
                    }
                }
                r.skip(pack_size as i64);
            }
            if r.eof() {
                return Err(ModError::LoadingPattern);
            }
            for v in 0..channels {
                convert_track(of, &notes[v * rows..(v + 1) * rows]);
                of.store_track(track)?;
                track += 1;
            }
        }
        if dummy {
            of.pattern_rows[stored] = 64;
            let empty = [Note::default(); 64];
            for _ in 0..channels {
                convert_track(of, &empty);
                of.store_track(track)?;
                track += 1;
            }
        }
        Ok(())
    }

    fn load_instruments(
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        version: u16,
        pending: &mut Vec<PendingSample>,
    ) -> Result<(), ModError> {
        let file_len = r.len();
        let mut next: u64 = 0;
        for t in 0..of.num_instruments as usize {
            let start = r.tell();
            let size = r.read_u32_le() as u64;
            let head_end = start + size;
            if head_end > file_len || size < 4 {
                log::warn!("[XM] instrument {t} header runs past the end of file");
                r.seek_to(SeekFrom::Start(start + 4));
                break;
            }
            let name = read_array::<22>(r);
            let _kind = r.read_u8();
            let num_samples = r.read_u16_le();

            let d = &mut of.instruments[t];
            d.sample_number = [0xffff; INSTNOTES];
            d.name = dup_str(&name, false);

            if size as i16 <= 29 {
                r.seek_to(SeekFrom::Start(head_end));
                if r.eof() && version < 0x0104 {
                    return Err(ModError::LoadingSampleInfo);
                }
                continue;
            }
            let _sample_header_size = r.read_u32_le();
            if num_samples as i16 <= 0 || num_samples as usize > INSTNOTES {
                r.seek_to(SeekFrom::Start(head_end));
                continue;
            }

            let pth: PatchHeader = read_struct(r).map_err(|_| ModError::LoadingSampleInfo)?;
            if head_end >= r.tell() {
                r.seek_to(SeekFrom::Start(head_end));
            }
            if r.eof() {
                return Err(ModError::LoadingSampleInfo);
            }

            let first = pending.len() as u16;
            let d = &mut of.instruments[t];
            for (u, &s) in pth.sample_map.iter().enumerate() {
                d.sample_number[u] = s as u16 + first;
            }
            for u in pth.sample_map.len()..INSTNOTES {
                d.sample_number[u] = first;
            }
            d.fadeout = pth.fadeout;
            // some files claim more points than are stored
            let max_points = (ENV_WORDS / 2) as u8;
            d.volume_envelope = build_envelope(
                &pth.vol_env,
                pth.vol_points.min(max_points),
                pth.vol_flags,
                pth.vol_sustain,
                pth.vol_loop_begin,
                pth.vol_loop_end,
            );
            d.panning_envelope = build_envelope(
                &pth.pan_env,
                pth.pan_points.min(max_points),
                pth.pan_flags,
                pth.pan_sustain,
                pth.pan_loop_begin,
                pth.pan_loop_end,
            );

            if version > 0x0103 {
                next = 0;
            }
            let base = pending.len();
            for _ in 0..num_samples {
                let header: SampleHeader =
                    read_struct(r).map_err(|_| ModError::LoadingSampleInfo)?;
                let length = header.length as u64;
                pending.push(PendingSample {
                    header,
                    vibrato: (
                        pth.vib_type,
                        pth.vib_sweep,
                        pth.vib_depth.wrapping_mul(4),
                        pth.vib_rate,
                    ),
                    offset: next,
                });
                next += length;
            }
            if version > 0x0103 {
                let data_start = r.tell();
                for p in &mut pending[base..] {
                    p.offset += data_start;
                }
                r.seek_to(SeekFrom::Current(next as i64));
            }
        }
        if pending.is_empty() {
            return Err(ModError::LoadingSampleInfo);
        }
        Ok(())
    }
}

impl Loader for XmLoader {
    fn tag(&self) -> &'static str {
        "XM"
    }

    fn description(&self) -> &'static str {
        "FastTracker 2"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        let id = read_array::<17>(r);
        !r.eof() && &id == XM_ID
    }

    fn load(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        _curious: bool,
    ) -> Result<(), ModError> {
        let mh: Header = read_struct(r)?;
        if mh.num_channels == 0 || mh.num_channels as usize > um_ir::MAX_CHANNELS {
            return Err(ModError::NotAModule);
        }
        if mh.song_length > 256 || mh.header_size < 20 {
            return Err(ModError::LoadingHeader);
        }
        let table_len = (mh.header_size as usize - 20).min(256);
        let mut orders = r.read_vec(table_len);
        orders.resize(256, 0);
        r.skip(mh.header_size as i64 - 20 - table_len as i64);
        if r.eof() {
            return Err(ModError::LoadingHeader);
        }

        of.initial_speed = mh.tempo.min(255) as u8;
        of.initial_tempo = mh.bpm;
        of.format = format_name(&mh.tracker, mh.version);
        of.title = dup_str(&mh.title, true);
        of.num_channels = mh.num_channels as u8;
        of.num_patterns = mh.num_patterns;
        of.num_positions = mh.song_length;
        of.restart_position = if mh.restart < mh.song_length { mh.restart } else { 0 };
        of.num_instruments = mh.num_instruments;
        of.flags |= ModuleFlags::XM_PERIODS
            | ModuleFlags::INST
            | ModuleFlags::NO_WRAP
            | ModuleFlags::FT2_QUIRKS
            | ModuleFlags::PANNING;
        if mh.flags & 1 != 0 {
            of.flags |= ModuleFlags::LINEAR;
        }
        of.bpm_limit = 32;
        of.channel_volume = [64; um_ir::MAX_CHANNELS];

        of.alloc_positions(mh.song_length as usize + 1)?;
        // Orders past the last pattern point at an extra empty one.
        let mut dummy = false;
        for t in 0..mh.song_length as usize {
            let mut p = orders[t] as u16;
            if p >= mh.num_patterns {
                p = mh.num_patterns;
                dummy = true;
            }
            of.positions[t] = p;
        }
        if dummy {
            of.num_patterns = of
                .num_patterns
                .checked_add(1)
                .ok_or(ModError::LoadingHeader)?;
        }
        of.set_track_count()?;
        log::debug!("[XM] {} with {} channels", of.format, of.num_channels);

        of.alloc_patterns()?;
        of.alloc_tracks()?;
        of.alloc_instruments()?;

        let stored = mh.num_patterns as usize;
        let mut pending = Vec::new();
        if mh.version < 0x0104 {
            Self::load_instruments(r, of, mh.version, &mut pending)?;
            Self::load_patterns(r, of, mh.version, stored, dummy)?;
            let data_start = r.tell();
            for p in &mut pending {
                p.offset += data_start;
            }
        } else {
            Self::load_patterns(r, of, mh.version, stored, dummy)?;
            Self::load_instruments(r, of, mh.version, &mut pending)?;
        }

        of.num_samples = pending.len() as u16;
        of.alloc_samples()?;
        for (q, p) in of.samples.iter_mut().zip(&pending) {
            let s = &p.header;
            *q = Sample {
                name: dup_str(&s.name, true),
                length: s.length,
                loop_start: s.loop_start,
                loop_end: s.loop_start.saturating_add(s.loop_length),
                volume: s.volume,
                speed: (s.finetune as i32 + 128) as u32,
                panning: s.panning as i16,
                seek_pos: p.offset,
                flags: SampleFlags::OWN_PAN | SampleFlags::DELTA | SampleFlags::SIGNED,
                ..Sample::default()
            };
            (q.vibrato.waveform, q.vibrato.sweep, q.vibrato.depth, q.vibrato.rate) = p.vibrato;
            if s.kind & 0x10 != 0 {
                q.length >>= 1;
                q.loop_start >>= 1;
                q.loop_end >>= 1;
                q.flags |= SampleFlags::BITS16;
            }
            if s.kind & 0x3 != 0 {
                q.flags |= SampleFlags::LOOP;
            }
            if s.kind & 0x2 != 0 {
                q.flags |= SampleFlags::BIDI;
            }
        }

        let num_samples = of.num_samples;
        let rel_notes: Vec<i8> = pending.iter().map(|p| p.header.relative_note).collect();
        for d in of.instruments.iter_mut() {
            for t in 0..INSTNOTES {
                let sample = d.sample_number[t];
                d.sample_note[t] = if sample >= num_samples {
                    255
                } else {
                    (t as i32 + rel_notes[sample as usize] as i32).max(0) as u8
                };
            }
        }
        Ok(())
    }

    fn load_title(&self, r: &mut dyn ByteReader) -> Option<String> {
        r.seek_to(SeekFrom::Start(17));
        let title = read_array::<20>(r);
        (!r.eof()).then(|| dup_str(&title, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemReader;

    #[test]
    fn packed_notes() {
        let data = [0x80 | 0x01 | 0x08, 49, 0x0f, 0x2e, 1, 2, 3, 4];
        let mut r = MemReader::new(&data);
        let (n, used) = read_note(&mut r);
        assert_eq!(used, 3);
        assert_eq!(n, Note { note: 49, eff: 0x0f, ..Note::default() });
        let (n, used) = read_note(&mut r);
        assert_eq!(used, 5);
        assert_eq!(n, Note { note: 0x2e, ins: 1, vol: 2, eff: 3, dat: 4 });
    }

    #[test]
    fn envelope_high_bytes_restored() {
        let mut points = [
            EnvPoint { pos: 0, val: 0 },
            EnvPoint { pos: 0x80, val: 0 },
            EnvPoint { pos: 0x10, val: 0 },
            EnvPoint { pos: 0x20, val: 0 },
        ];
        fix_envelope(&mut points);
        assert_eq!(points[2].pos, 0x110);
        assert_eq!(points[3].pos, 0x120);
    }

    #[test]
    fn tracker_names() {
        let mut tracker = [b' '; 20];
        assert_eq!(format_name(&tracker, 0x0104), "Unknown tracker (XM format 1.04)");
        tracker[..17].copy_from_slice(b"FastTracker v2.00");
        assert_eq!(format_name(&tracker, 0x0104), "FastTracker v2.00 (XM format 1.04)");
    }

    #[test]
    fn volume_column_and_break() {
        let mut of = ModuleBuilder::new();
        let notes = [
            Note { vol: 0x30, eff: 0xd, dat: 0x12, ..Note::default() },
            Note { note: 97, ..Note::default() },
        ];
        convert_track(&mut of, &notes);
        let track = of.uni.finish();
        let rows: Vec<Vec<_>> = track.rows().map(|row| row.events().collect()).collect();
        assert_eq!(rows[0].len(), 2);
        assert_eq!(rows[0][0].opcode, Opcode::PtEffectC);
        assert_eq!(rows[0][0].operand, 0x20);
        assert_eq!(rows[0][1].opcode, Opcode::PtEffectD);
        assert_eq!(rows[0][1].operand, 12);
        assert_eq!(rows[1][0].opcode, Opcode::KeyFade);
    }

    #[test]
    fn notes_past_the_keyboard_are_key_off() {
        let mut of = ModuleBuilder::new();
        let notes = [
            Note { note: 96, ..Note::default() },
            Note { note: 98, ..Note::default() },
            Note { note: 0xff, ..Note::default() },
        ];
        convert_track(&mut of, &notes);
        let track = of.uni.finish();
        let rows: Vec<Vec<_>> = track
            .rows()
            .map(|row| row.events().map(|e| (e.opcode, e.operand)).collect())
            .collect();
        assert_eq!(rows[0], vec![(Opcode::Note, 95)]);
        // both key offs collapse into one repeated row
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], vec![(Opcode::KeyFade, 0)]);
        assert_eq!(track.rows().nth(1).map(|r| r.repeat), Some(1));
    }
}
