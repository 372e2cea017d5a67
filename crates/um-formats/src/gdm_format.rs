//! General DigiMusic (.GDM) module parser, as written by 2GDM.
//!
//! GDM is a conversion target for MOD, S3M, 669, FAR and others, so its
//! effects are a superset of the Scream Tracker ones with up to four
//! effect columns per cell.

use std::io::SeekFrom;

use binrw::BinRead;
use um_ir::{
    periods, ModError, ModuleBuilder, ModuleFlags, Opcode, SampleFlags, LAST_PATTERN,
    PAN_CENTER, PAN_LEFT, PAN_RIGHT, PAN_SURROUND,
};

use crate::common::{dup_str, read_comment};
use crate::loader::Loader;
use crate::reader::{read_array, read_struct, ByteReader};

const CHANNELS: usize = 32;
const ROWS: usize = 64;

#[derive(BinRead, Debug)]
#[br(little, magic = b"GDM\xfe")]
struct Header {
    title: [u8; 32],
    _author: [u8; 32],
    _eof_marker: [u8; 3],
    #[br(magic = b"GMFS")]
    major: u8,
    minor: u8,
    _tracker_id: u16,
    _tracker_major: u8,
    _tracker_minor: u8,
    pan_table: [u8; 32],
    master_vol: u8,
    master_tempo: u8,
    master_bpm: u8,
    _flags: u16,
    order_loc: u32,
    order_num: u8,
    pattern_loc: u32,
    pattern_num: u8,
    sample_head: u32,
    sample_data: u32,
    sample_num: u8,
    message_loc: u32,
    message_len: u32,
    _scrolly_loc: u32,
    _scrolly_len: u16,
    _graphic_loc: u32,
    _graphic_len: u16,
}

#[derive(BinRead, Debug)]
#[br(little)]
struct SampleHeader {
    name: [u8; 32],
    _filename: [u8; 12],
    _ems: u8,
    length: u32,
    loop_begin: u32,
    loop_end: u32,
    flags: u8,
    c4spd: u16,
    volume: u8,
    pan: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Note {
    note: u8,
    sample: u8,
    effects: [(u8, u8); 4],
}

impl Note {
    const EMPTY: Note = Note {
        note: 255,
        sample: 255,
        effects: [(255, 255); 4],
    };
}

fn channel_pan(p: u8) -> i16 {
    match p {
        0 => PAN_LEFT,
        8 => PAN_CENTER,
        15 => PAN_RIGHT,
        16 => PAN_SURROUND,
        255 => 128,
        p => (p as i16) << 3,
    }
}

fn read_pattern(r: &mut dyn ByteReader, buf: &mut [Note]) -> Result<(), ModError> {
    buf.fill(Note::EMPTY);
    let length = r.read_u16_le() as i64 - 2;
    let mut x = 0i64;
    let mut row = 0;
    while x < length {
        let flag = r.read_u8();
        x += 1;
        if r.eof() {
            return Err(ModError::LoadingPattern);
        }
        if flag == 0 {
            row += 1;
            continue;
        }
        let ch = (flag & 31) as usize;
        let mut n = Note::EMPTY;
        if flag & 0x20 != 0 {
            n.note = r.read_u8() & 127;
            n.sample = r.read_u8();
            x += 2;
        }
        if flag & 0x40 != 0 {
            loop {
                let i = r.read_u8();
                n.effects[(i >> 6) as usize] = (i & 31, r.read_u8());
                x += 2;
                if i & 32 == 0 || r.eof() {
                    break;
                }
            }
        }
        if flag & 0x60 != 0 {
            if row >= ROWS {
                return Err(ModError::LoadingPattern);
            }
            buf[ch * ROWS + row] = n;
        }
    }
    Ok(())
}

fn convert_extended(of: &mut ModuleBuilder, inf: u8) {
    let x = inf & 0xf;
    match inf & 0xf0 {
        0x10 => of.uni.effect(Opcode::S3mEffectF, (0xf0 | x) as u16),
        0x20 => of.uni.effect(Opcode::S3mEffectE, (0xf0 | x) as u16),
        // glissando, vibrato waveform, finetune, tremolo waveform
        0x30 => of.uni.effect(Opcode::ItEffectS0, (0x10 | x) as u16),
        0x40 => of.uni.effect(Opcode::ItEffectS0, (0x30 | x) as u16),
        0x50 => of.uni.effect(Opcode::ItEffectS0, (0x20 | x) as u16),
        0x60 => of.uni.effect(Opcode::ItEffectS0, (0xb0 | x) as u16),
        0x70 => of.uni.effect(Opcode::ItEffectS0, (0x40 | x) as u16),
        0x80 => of.uni.effect(Opcode::S3mEffectF, (0xe0 | x) as u16),
        0x90 => of.uni.effect(Opcode::S3mEffectE, (0xe0 | x) as u16),
        0xa0 => of.uni.effect(Opcode::S3mEffectD, ((x << 4) | 0xf) as u16),
        0xb0 => of.uni.effect(Opcode::S3mEffectD, (0xf0 | x) as u16),
        // cut, delay, pattern delay
        0xc0 | 0xd0 | 0xe0 => of.pt_effect(0xe, inf),
        _ => {}
    }
}

fn convert_track(of: &mut ModuleBuilder, cells: &[Note]) {
    of.uni.reset();
    for n in cells {
        if n.sample != 0 && n.sample != 255 {
            of.uni.instrument(n.sample - 1);
        }
        if n.note != 255 {
            of.uni
                .note(((n.note >> 4) * periods::OCTAVE as u8 + (n.note & 0xf)).wrapping_sub(1));
        }
        for &(eff, inf) in &n.effects {
            let op = |op: Opcode| (op, inf as u16);
            let single = match eff {
                0x01 => Some(op(Opcode::S3mEffectF)),
                0x02 => Some(op(Opcode::S3mEffectE)),
                0x03 => Some(op(Opcode::ItEffectG)),
                0x04 => Some(op(Opcode::ItEffectH)),
                0x05 => {
                    of.uni.effect(Opcode::ItEffectG, 0);
                    Some(op(Opcode::S3mEffectD))
                }
                0x06 => {
                    of.uni.effect(Opcode::ItEffectH, 0);
                    Some(op(Opcode::S3mEffectD))
                }
                0x07 => Some(op(Opcode::S3mEffectR)),
                0x08 => Some(op(Opcode::S3mEffectI)),
                0x09 => {
                    of.pt_effect(0x9, inf);
                    None
                }
                0x0a => Some(op(Opcode::S3mEffectD)),
                0x0b | 0x0c | 0x0d => {
                    of.pt_effect(eff, inf);
                    None
                }
                0x0e => {
                    convert_extended(of, inf);
                    None
                }
                0x0f => Some(op(Opcode::S3mEffectA)),
                0x10 => {
                    of.pt_effect(0x0, inf);
                    None
                }
                0x12 => Some(op(Opcode::S3mEffectQ)),
                0x13 => Some((Opcode::XmEffectG, (inf as u16) << 1)),
                0x14 => Some(op(Opcode::ItEffectU)),
                // special: 8x sets the pan position
                0x1e if inf & 0xf0 == 0x80 => {
                    of.pt_effect(0xe, inf);
                    None
                }
                0x1f if inf >= 0x20 => Some(op(Opcode::S3mEffectT)),
                _ => None,
            };
            if let Some((op, operand)) = single {
                of.uni.effect(op, operand);
            }
        }
        of.uni.newline();
    }
}

#[derive(Debug, Default)]
pub struct GdmLoader {
    buf: Vec<Note>,
}

impl Loader for GdmLoader {
    fn tag(&self) -> &'static str {
        "GDM"
    }

    fn description(&self) -> &'static str {
        "General DigiMusic"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        let id = read_array::<4>(r);
        if r.eof() || &id != b"GDM\xfe" {
            return false;
        }
        r.seek_to(SeekFrom::Start(71));
        let id = read_array::<4>(r);
        !r.eof() && &id == b"GMFS"
    }

    fn init(&mut self) -> Result<(), ModError> {
        self.buf = vec![Note::EMPTY; CHANNELS * ROWS];
        Ok(())
    }

    fn load(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        _curious: bool,
    ) -> Result<(), ModError> {
        let mh: Header = read_struct(r).map_err(|_| ModError::NotAModule)?;
        if mh.order_num == 255 {
            return Err(ModError::NotAModule);
        }

        of.format = format!("General DigiMusic {}.{:02}", mh.major, mh.minor);
        of.title = dup_str(&mh.title, false);
        of.num_patterns = mh.pattern_num as u16 + 1;
        of.restart_position = 0;
        of.num_instruments = mh.sample_num as u16 + 1;
        of.num_samples = mh.sample_num as u16 + 1;
        of.initial_speed = mh.master_tempo;
        of.initial_tempo = mh.master_bpm as u16;
        of.initial_volume = mh.master_vol << 1;
        of.flags |= ModuleFlags::S3M_SLIDES | ModuleFlags::PANNING;
        of.bpm_limit = 32;

        let order_count = mh.order_num as usize + 1;
        of.alloc_positions(order_count)?;
        r.seek_to(SeekFrom::Start(mh.order_loc as u64));
        let orders = r.read_vec(order_count);
        if r.eof() {
            return Err(ModError::LoadingHeader);
        }
        of.num_positions = 0;
        for &o in &orders {
            let pos = of.num_positions as usize;
            of.positions[pos] = if o == 255 { LAST_PATTERN } else { o as u16 };
            if o < 254 {
                of.num_positions += 1;
            }
        }

        of.alloc_samples()?;
        r.seek_to(SeekFrom::Start(mh.sample_head as u64));
        let mut position = mh.sample_data as u64;
        for q in of.samples.iter_mut() {
            let s: SampleHeader = read_struct(r).map_err(|_| ModError::LoadingSampleInfo)?;
            q.name = dup_str(&s.name, false);
            q.speed = s.c4spd as u32;
            q.length = s.length;
            q.loop_start = s.loop_begin;
            q.loop_end = s.loop_end;
            q.volume = s.volume;
            q.seek_pos = position;
            position += s.length as u64;
            if s.flags & 1 != 0 {
                q.flags |= SampleFlags::LOOP;
            }
            if s.flags & 2 != 0 {
                q.flags |= SampleFlags::BITS16;
            }
            if s.flags & 8 != 0 && s.pan != 255 {
                q.panning = if s.pan == 16 {
                    PAN_SURROUND
                } else {
                    ((s.pan & 0xf) as i16) << 4
                };
                q.flags |= SampleFlags::OWN_PAN;
            }
            if s.flags & 16 != 0 {
                q.flags |= SampleFlags::STEREO;
            }
        }

        for (pan, &p) in of.panning.iter_mut().zip(&mh.pan_table) {
            *pan = channel_pan(p);
        }
        let last_used = mh.pan_table.iter().rposition(|&p| p != 255).unwrap_or(0);
        of.num_channels = last_used as u8 + 1;
        of.set_track_count()?;

        if mh.message_len > 0 {
            r.seek_to(SeekFrom::Start(mh.message_loc as u64));
            of.comment = read_comment(r, mh.message_len as usize);
        }
        log::debug!("[GDM] {} with {} channels", of.format, of.num_channels);

        r.seek_to(SeekFrom::Start(mh.pattern_loc as u64));
        of.alloc_tracks()?;
        of.alloc_patterns()?;

        let channels = of.num_channels as usize;
        let mut track = 0;
        for _ in 0..of.num_patterns {
            read_pattern(r, &mut self.buf)?;
            for ch in 0..channels {
                convert_track(of, &self.buf[ch * ROWS..(ch + 1) * ROWS]);
                of.store_track(track)?;
                track += 1;
            }
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.buf = Vec::new();
    }

    fn load_title(&self, r: &mut dyn ByteReader) -> Option<String> {
        r.skip(4);
        let title = read_array::<32>(r);
        (!r.eof()).then(|| dup_str(&title, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemReader;

    #[test]
    fn chained_effect_columns() {
        // channel 2: note, sample and two chained effects, then end of row
        let data = [10, 0, 0x62, 0x25, 3, 0x20 | 0x0a, 0x12, 0x40 | 0x0f, 6, 0];
        let mut buf = vec![Note::EMPTY; CHANNELS * ROWS];
        let mut r = MemReader::new(&data);
        read_pattern(&mut r, &mut buf).expect("pattern");
        let n = buf[2 * ROWS];
        assert_eq!(n.note, 0x25);
        assert_eq!(n.sample, 3);
        assert_eq!(n.effects[0], (0x0a, 0x12));
        assert_eq!(n.effects[1], (0x0f, 6));
        assert_eq!(n.effects[2], (255, 255));
    }

    #[test]
    fn pan_table_values() {
        assert_eq!(channel_pan(0), PAN_LEFT);
        assert_eq!(channel_pan(4), 32);
        assert_eq!(channel_pan(16), PAN_SURROUND);
        assert_eq!(channel_pan(255), 128);
    }

    #[test]
    fn fine_slides_use_scream_encoding() {
        let mut of = ModuleBuilder::new();
        of.uni.reset();
        convert_extended(&mut of, 0x13);
        convert_extended(&mut of, 0xa4);
        of.uni.newline();
        let track = of.uni.finish();
        let row = track.rows().next().expect("row");
        let events: Vec<_> = row.events().map(|e| (e.opcode, e.operand)).collect();
        assert_eq!(
            events,
            vec![(Opcode::S3mEffectF, 0xf3), (Opcode::S3mEffectD, 0x4f)]
        );
    }
}
