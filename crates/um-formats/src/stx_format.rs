//! STMIK 0.2 (.STX) module parser.
//!
//! STX is Scream Tracker 2 music repacked by STM2STX into S3M-like
//! structures: paragraph pointers, S3M sample headers and packed
//! patterns, with STM effect numbering and four channels.

use std::io::SeekFrom;

use binrw::BinRead;
use um_ir::{periods, ModError, ModuleBuilder, ModuleFlags, Opcode, SampleFlags};

use crate::common::dup_str;
use crate::effects::S3mItState;
use crate::loader::Loader;
use crate::reader::{read_array, read_struct, ByteReader};
use crate::s3m_format::{Note, SampleHeader};

const CHANNELS: usize = 4;
const ROWS: usize = 64;

/// Signatures STM2STX leaves in the tracker field.
const SIGNATURES: [&[u8; 8]; 3] = [b"!Scream!", b"BMOD2STM", b"WUZAMOD!"];

#[derive(BinRead, Debug)]
#[br(little)]
struct Header {
    title: [u8; 20],
    _tracker: [u8; 8],
    pattern_size: u16,
    _unknown1: u16,
    pattern_ptr: u16,
    ins_ptr: u16,
    chn_ptr: u16,
    _unknown2: u16,
    _unknown3: u16,
    master_mult: u8,
    init_speed: u8,
    _unknown4: u16,
    _unknown5: u16,
    pat_num: u16,
    ins_num: u16,
    ord_num: u16,
    _unknown6: [u16; 3],
    _scrm: [u8; 4],
}

fn read_pattern(r: &mut dyn ByteReader, buf: &mut [Note]) -> Result<(), ModError> {
    buf.fill(Note::EMPTY);
    let mut dummy = Note::EMPTY;
    let mut row = 0;
    while row < ROWS {
        let flag = r.read_u8();
        if r.eof() {
            return Err(ModError::LoadingPattern);
        }
        if flag == 0 {
            row += 1;
            continue;
        }
        let ch = (flag & 31) as usize;
        let n = if ch < CHANNELS {
            &mut buf[ch * ROWS + row]
        } else {
            &mut dummy
        };
        if flag & 32 != 0 {
            n.note = r.read_u8();
            n.ins = r.read_u8();
        }
        if flag & 64 != 0 {
            n.vol = r.read_u8().min(64);
        }
        if flag & 128 != 0 {
            n.cmd = r.read_u8();
            n.inf = r.read_u8();
        }
    }
    Ok(())
}

fn convert_track(of: &mut ModuleBuilder, cells: &[Note]) {
    of.uni.reset();
    for n in cells {
        let mut vol = n.vol;
        let inf = n.inf;
        if n.ins != 0 && n.ins != 255 {
            of.uni.instrument(n.ins - 1);
        }
        match n.note {
            255 => {}
            254 => {
                // note cut
                of.pt_effect(0xc, 0);
                vol = 255;
            }
            note => of.uni.note(
                2 * periods::OCTAVE as u8 + (note >> 4) * periods::OCTAVE as u8 + (note & 0xf),
            ),
        }
        if vol < 255 {
            of.pt_effect(0xc, vol);
        }
        match n.cmd {
            1 => of.pt_effect(0xf, inf >> 4),
            2 => of.pt_effect(0xb, inf),
            3 => of.pt_effect(0xd, (inf >> 4) * 10 + (inf & 0xf)),
            4 => of.uni.effect(Opcode::S3mEffectD, inf as u16),
            5 => of.uni.effect(Opcode::S3mEffectE, inf as u16),
            6 => of.uni.effect(Opcode::S3mEffectF, inf as u16),
            7 => of.pt_effect(0x3, inf),
            8 => of.pt_effect(0x4, inf),
            9 => of.uni.effect(Opcode::S3mEffectI, inf as u16),
            0 | 0xa if inf != 0 => of.pt_effect(0x0, inf),
            0xb => {
                of.pt_effect(0x4, 0);
                of.uni.effect(Opcode::S3mEffectD, inf as u16);
            }
            0xc => {
                of.pt_effect(0x3, 0);
                of.uni.effect(Opcode::S3mEffectD, inf as u16);
            }
            // X: amiga panning
            0x18 => {
                of.pt_effect(0x8, inf);
                of.flags |= ModuleFlags::PANNING;
            }
            _ => {}
        }
        of.uni.newline();
    }
}

#[derive(Debug, Default)]
pub struct StxLoader {
    buf: Vec<Note>,
    state: S3mItState,
}

impl Loader for StxLoader {
    fn tag(&self) -> &'static str {
        "STX"
    }

    fn description(&self) -> &'static str {
        "STMIK 0.2"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        r.seek_to(SeekFrom::Start(0x14));
        let id = read_array::<8>(r);
        if r.eof() || !SIGNATURES.iter().any(|sig| **sig == id) {
            return false;
        }
        r.seek_to(SeekFrom::Start(0x3c));
        let scrm = read_array::<4>(r);
        !r.eof() && &scrm == b"SCRM"
    }

    fn init(&mut self) -> Result<(), ModError> {
        self.buf = vec![Note::EMPTY; CHANNELS * ROWS];
        self.state = S3mItState::new();
        Ok(())
    }

    fn load(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        curious: bool,
    ) -> Result<(), ModError> {
        let mh: Header = read_struct(r)?;

        // STM2STX 1.0 wrote the pattern size into every pattern too
        r.seek_to(SeekFrom::Start((mh.pattern_ptr as u64) << 4));
        let first_pattern = r.read_u16_le();
        r.seek_to(SeekFrom::Start((first_pattern as u64) << 4));
        let stored_size = r.read_u16_le();
        of.format = if stored_size == mh.pattern_size {
            "STMIK 0.2 (STM2STX 1.0)"
        } else {
            "STMIK 0.2 (STM2STX 1.1)"
        }
        .to_string();

        of.title = dup_str(&mh.title, true);
        of.num_patterns = mh.pat_num;
        of.restart_position = 0;
        of.initial_speed = mh.init_speed;
        of.initial_tempo = 125;
        of.initial_volume = mh.master_mult << 1;
        of.flags |= ModuleFlags::S3M_SLIDES;
        of.bpm_limit = 32;
        of.num_channels = CHANNELS as u8;
        of.num_instruments = mh.ins_num;
        of.num_samples = mh.ins_num;

        // orders are spread over 5-byte records
        r.seek_to(SeekFrom::Start(((mh.chn_ptr as u64) << 4) + 32));
        of.alloc_positions(mh.ord_num as usize)?;
        self.state.orig_positions = (0..mh.ord_num)
            .map(|_| {
                let p = r.read_u8();
                r.skip(4);
                p
            })
            .collect();
        if r.eof() {
            return Err(ModError::LoadingHeader);
        }
        self.state.create_orders(of, curious);

        r.seek_to(SeekFrom::Start((mh.ins_ptr as u64) << 4));
        let ins_ptrs: Vec<u16> = (0..mh.ins_num).map(|_| r.read_u16_le()).collect();
        r.seek_to(SeekFrom::Start((mh.pattern_ptr as u64) << 4));
        let pat_ptrs: Vec<u16> = (0..mh.pat_num).map(|_| r.read_u16_le()).collect();
        if r.eof() {
            return Err(ModError::LoadingHeader);
        }

        of.alloc_samples()?;
        for (q, &ptr) in of.samples.iter_mut().zip(&ins_ptrs) {
            r.seek_to(SeekFrom::Start((ptr as u64) << 4));
            let s: SampleHeader = read_struct(r).map_err(|_| ModError::LoadingSampleInfo)?;
            q.name = dup_str(&s.name, true);
            q.speed = (s.c2spd as u64 * 8363 / 8448) as u32;
            q.length = s.length;
            q.loop_start = s.loop_begin;
            q.loop_end = s.loop_end;
            q.volume = s.volume;
            q.seek_pos = s.seek_pos();
            q.flags |= SampleFlags::SIGNED;
            if s.flags & 1 != 0 {
                q.flags |= SampleFlags::LOOP;
            }
            if s.flags & 4 != 0 {
                q.flags |= SampleFlags::BITS16;
            }
        }

        of.set_track_count()?;
        of.alloc_tracks()?;
        of.alloc_patterns()?;
        log::debug!("[STX] {} with {} patterns", of.format, of.num_patterns);

        let mut track = 0;
        for &ptr in &pat_ptrs {
            // skip the pattern length word
            r.seek_to(SeekFrom::Start(((ptr as u64) << 4) + 2));
            read_pattern(r, &mut self.buf)?;
            for ch in 0..CHANNELS {
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
        let title = read_array::<20>(r);
        (!r.eof()).then(|| dup_str(&title, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemReader;

    #[test]
    fn packed_rows_and_foreign_channels() {
        // row 0: channel 1 note+ins, channel 9 volume (dropped); row 1: channel 0 volume 80
        let data = [0x21, 0x40, 3, 0x49, 20, 0, 0x40, 80, 0, 0];
        let mut buf = vec![Note::EMPTY; CHANNELS * ROWS];
        let mut r = MemReader::new(&data);
        // only two rows are present
        assert_eq!(read_pattern(&mut r, &mut buf), Err(ModError::LoadingPattern));
        assert_eq!(buf[ROWS].note, 0x40);
        assert_eq!(buf[ROWS].ins, 3);
        assert_eq!(buf[1].vol, 64);
    }

    #[test]
    fn notes_start_two_octaves_up() {
        let mut of = ModuleBuilder::new();
        let cells = [Note { note: 0x13, ins: 1, ..Note::EMPTY }];
        convert_track(&mut of, &cells);
        let track = of.uni.finish();
        let row = track.rows().next().expect("row");
        let events: Vec<_> = row.events().map(|e| (e.opcode, e.operand)).collect();
        assert_eq!(events, vec![(Opcode::Instrument, 0), (Opcode::Note, 39)]);
    }
}
