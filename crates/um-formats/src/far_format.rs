//! Farandole Composer (.FAR) module parser.

use binrw::BinRead;
use um_ir::{periods, ModError, ModuleBuilder, ModuleFlags, SampleFlags};

use crate::common::{dup_str, read_lined_comment};
use crate::loader::Loader;
use crate::reader::{read_array, read_struct, ByteReader};

const MAGIC: &[u8; 4] = b"FAR\xfe";
const CHANNELS: usize = 16;
const MAX_ROWS: usize = 256;
const COMMENT_LINE: usize = 66;
/// Bytes of both fixed header parts, excluding the song text.
const FIXED_HEADER: i64 = 869;

#[derive(BinRead, Debug)]
#[br(little)]
struct Header1 {
    _id: [u8; 4],
    title: [u8; 40],
    _eof: [u8; 3],
    header_len: u16,
    _version: u8,
    _on_off: [u8; 16],
    _edit1: [u8; 9],
    speed: u8,
    panning: [u8; 16],
    _edit2: [u8; 4],
    text_len: u16,
}

#[derive(BinRead, Debug)]
#[br(little)]
struct Header2 {
    orders: [u8; 256],
    _num_patterns: u8,
    song_length: u8,
    loop_to: u8,
    pattern_sizes: [u16; 256],
}

#[derive(BinRead, Debug)]
#[br(little)]
struct SampleHeader {
    name: [u8; 32],
    length: u32,
    _finetune: u8,
    volume: u8,
    rep_pos: u32,
    rep_end: u32,
    kind: u8,
    looping: u8,
}

#[derive(Clone, Copy, Debug, Default)]
struct Note {
    note: u8,
    ins: u8,
    vol: u8,
    eff: u8,
}

fn convert_track(of: &mut ModuleBuilder, cells: &[Note], channel: usize, rows: usize) {
    let mut vib_depth = 1;
    of.uni.reset();
    for n in cells.iter().skip(channel).step_by(CHANNELS).take(rows) {
        if n.note != 0 {
            of.uni.instrument(n.ins);
            of.uni.note(n.note.wrapping_add(3 * periods::OCTAVE as u8 - 1));
        }
        if n.vol & 0xf != 0 {
            of.pt_effect(0xc, (n.vol & 0xf) << 2);
        }
        let val = n.eff & 0xf;
        match n.eff >> 4 {
            _ if n.eff == 0 => {}
            0x3 => of.pt_effect(0x3, val << 4),
            // retrigger
            0x4 => of.pt_effect(0xe, 0x90 | val),
            0x5 => vib_depth = val,
            0x6 => of.pt_effect(0x4, (val << 4) | vib_depth),
            0x7 => of.pt_effect(0xa, val << 4),
            0x8 => of.pt_effect(0xa, val),
            0xb => of.pt_effect(0xe, 0x80 | val),
            0xf => of.pt_effect(0xf, val),
            _ => log::trace!("[FAR] unsupported effect {:02X}", n.eff),
        }
        of.uni.newline();
    }
}

#[derive(Debug, Default)]
pub struct FarLoader {
    pattern: Vec<Note>,
}

impl Loader for FarLoader {
    fn tag(&self) -> &'static str {
        "FAR"
    }

    fn description(&self) -> &'static str {
        "Farandole Composer"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        let id = read_array::<47>(r);
        !r.eof() && &id[..4] == MAGIC && &id[44..47] == b"\x0d\x0a\x1a"
    }

    fn init(&mut self) -> Result<(), ModError> {
        self.pattern = vec![Note::default(); MAX_ROWS * CHANNELS];
        Ok(())
    }

    fn load(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        _curious: bool,
    ) -> Result<(), ModError> {
        let mh1: Header1 = read_struct(r)?;

        of.format = "Farandole".to_string();
        of.title = dup_str(&mh1.title, true);
        of.num_channels = CHANNELS as u8;
        of.initial_speed = mh1.speed;
        of.initial_tempo = 80;
        of.flags |= ModuleFlags::PANNING;
        for (pan, &p) in of.panning.iter_mut().zip(&mh1.panning) {
            *pan = ((p & 0xf) << 4) as i16;
        }
        if mh1.text_len > 0 {
            of.comment = read_lined_comment(r, mh1.text_len as usize, COMMENT_LINE);
        }
        if r.eof() {
            return Err(ModError::LoadingHeader);
        }

        let mh2: Header2 = read_struct(r)?;
        of.num_positions = mh2.song_length as u16;
        of.restart_position = mh2.loop_to as u16;
        of.alloc_positions(of.num_positions as usize)?;
        for (pos, &o) in of.positions.iter_mut().zip(&mh2.orders) {
            if o == 0xff {
                break;
            }
            *pos = o as u16;
        }

        // patterns are counted up to the last one with data
        of.num_patterns = mh2
            .pattern_sizes
            .iter()
            .rposition(|&s| s != 0)
            .map_or(0, |last| last as u16 + 1);
        of.set_track_count()?;
        log::debug!("[FAR] {} patterns", of.num_patterns);

        r.skip(mh1.header_len as i64 - (FIXED_HEADER + mh1.text_len as i64));

        of.alloc_tracks()?;
        of.alloc_patterns()?;

        for t in 0..of.num_patterns as usize {
            let size = mh2.pattern_sizes[t] as usize;
            if size == 0 {
                continue;
            }
            self.pattern.fill(Note::default());
            // the stored break row is two short of the row count
            let rows = r.read_u8() as usize + 2;
            let _tempo = r.read_u8();
            if size < 2 + rows * CHANNELS * 4 || size > 2 + MAX_ROWS * CHANNELS * 4 {
                return Err(ModError::LoadingPattern);
            }
            for n in self.pattern.iter_mut().take((size - 2) / 4) {
                *n = Note {
                    note: r.read_u8(),
                    ins: r.read_u8(),
                    vol: r.read_u8(),
                    eff: r.read_u8(),
                };
            }
            if r.eof() {
                return Err(ModError::LoadingPattern);
            }
            of.pattern_rows[t] = rows as u16;
            for ch in 0..CHANNELS {
                convert_track(of, &self.pattern, ch, rows);
                of.store_track(t * CHANNELS + ch)?;
            }
        }

        let map = read_array::<8>(r);
        if r.eof() {
            return Err(ModError::LoadingHeader);
        }
        let present = |t: usize| map[t >> 3] & (1 << (t & 7)) != 0;
        let count = (0..64).rposition(present).map_or(0, |last| last + 1);
        of.num_instruments = count as u16;
        of.num_samples = count as u16;
        of.alloc_samples()?;

        for (t, q) in of.samples.iter_mut().enumerate() {
            q.speed = 8363;
            q.flags = SampleFlags::SIGNED;
            if !present(t) {
                continue;
            }
            let s: SampleHeader = read_struct(r).map_err(|_| ModError::LoadingSampleInfo)?;
            q.name = dup_str(&s.name, true);
            q.length = s.length;
            q.loop_start = s.rep_pos;
            q.loop_end = s.rep_end;
            q.volume = s.volume << 2;
            if s.kind & 1 != 0 {
                q.flags |= SampleFlags::BITS16;
            }
            if s.looping & 8 != 0 {
                q.flags |= SampleFlags::LOOP;
            }
            q.seek_pos = r.tell();
            r.skip(s.length as i64);
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.pattern = Vec::new();
    }

    fn load_title(&self, r: &mut dyn ByteReader) -> Option<String> {
        r.skip(4);
        let title = read_array::<40>(r);
        (!r.eof()).then(|| dup_str(&title, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use um_ir::Opcode;

    #[test]
    fn vibrato_depth_is_remembered() {
        let mut of = ModuleBuilder::new();
        let mut cells = vec![Note::default(); 3 * CHANNELS];
        cells[1] = Note { note: 1, ins: 2, vol: 0x0f, eff: 0x53 };
        cells[CHANNELS + 1] = Note { eff: 0x62, ..Note::default() };
        convert_track(&mut of, &cells, 1, 2);
        let track = of.uni.finish();
        let rows: Vec<Vec<_>> = track
            .rows()
            .map(|row| row.events().map(|e| (e.opcode, e.operand)).collect())
            .collect();
        assert_eq!(
            rows[0],
            vec![(Opcode::Instrument, 2), (Opcode::Note, 36), (Opcode::PtEffectC, 60)]
        );
        assert_eq!(rows[1], vec![(Opcode::PtEffect4, 0x23)]);
        assert_eq!(track.row_count(), 2);
    }
}
