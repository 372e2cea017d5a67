//! DSIK (.DSM) module parser.
//!
//! A RIFF file with one SONG chunk followed by INST and PATT chunks in
//! any order. Unknown chunks are skipped.

use std::io::SeekFrom;

use binrw::BinRead;
use um_ir::{
    ModError, ModuleBuilder, ModuleFlags, Opcode, SampleFlags, LAST_PATTERN, PAN_SURROUND,
};

use crate::common::dup_str;
use crate::loader::Loader;
use crate::reader::{read_array, read_struct, ByteReader};

const MAX_CHANNELS: usize = 16;
const ROWS: usize = 64;
const SURROUND: u8 = 0xa4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChunkKind {
    Song,
    Inst,
    Patt,
}

/// Cursor over the RIFF chunk list.
struct Chunks {
    start: u64,
    len: u64,
}

impl Chunks {
    fn new() -> Self {
        Self { start: 12, len: 0 }
    }

    /// Move to the next SONG, INST or PATT chunk.
    fn next(&mut self, r: &mut dyn ByteReader) -> Result<ChunkKind, ModError> {
        r.seek_to(SeekFrom::Start(self.start + self.len));
        loop {
            let id = read_array::<4>(r);
            let len = r.read_u32_le() as u64;
            if r.eof() {
                return Err(ModError::LoadingHeader);
            }
            let kind = match &id {
                b"SONG" => ChunkKind::Song,
                b"INST" => ChunkKind::Inst,
                b"PATT" => ChunkKind::Patt,
                _ => {
                    r.skip(len as i64);
                    continue;
                }
            };
            self.start = r.tell();
            self.len = len;
            return Ok(kind);
        }
    }
}

#[derive(BinRead, Debug)]
#[br(little)]
struct SongHeader {
    title: [u8; 28],
    _version: u16,
    _flags: u16,
    _reserved: u32,
    num_orders: u16,
    num_samples: u16,
    num_patterns: u16,
    num_tracks: u16,
    _global_vol: u8,
    _master_vol: u8,
    speed: u8,
    bpm: u8,
    pan_positions: [u8; 16],
    orders: [u8; 128],
}

#[derive(BinRead, Debug)]
#[br(little)]
struct InstHeader {
    _filename: [u8; 13],
    flags: u16,
    volume: u8,
    length: u32,
    loop_start: u32,
    loop_end: u32,
    _reserved: u32,
    c2spd: u16,
    _period: u16,
    name: [u8; 28],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Note {
    note: u8,
    ins: u8,
    vol: u8,
    cmd: u8,
    inf: u8,
}

impl Note {
    const EMPTY: Note = Note {
        note: 255,
        ins: 255,
        vol: 255,
        cmd: 255,
        inf: 255,
    };
}

fn read_pattern(r: &mut dyn ByteReader, buf: &mut [Note]) -> Result<(), ModError> {
    buf.fill(Note::EMPTY);
    let mut length = r.read_i16_le() as i32;
    let mut row = 0;
    while row < ROWS {
        let flag = r.read_u8();
        length -= 1;
        if r.eof() || length < 0 {
            return Err(ModError::LoadingPattern);
        }
        if flag == 0 {
            row += 1;
            continue;
        }
        let n = &mut buf[(flag & 0xf) as usize * ROWS + row];
        if flag & 0x80 != 0 {
            n.note = r.read_u8();
        }
        if flag & 0x40 != 0 {
            n.ins = r.read_u8();
        }
        if flag & 0x20 != 0 {
            n.vol = r.read_u8();
        }
        if flag & 0x10 != 0 {
            n.cmd = r.read_u8();
            n.inf = r.read_u8();
        }
    }
    Ok(())
}

fn convert_track(of: &mut ModuleBuilder, cells: &[Note]) {
    of.uni.reset();
    for n in cells {
        if n.ins != 0 && n.ins != 255 {
            of.uni.instrument(n.ins - 1);
        }
        if n.note != 255 {
            of.uni.note(n.note.wrapping_sub(1));
        }
        if n.vol < 65 {
            of.pt_effect(0xc, n.vol);
        }
        match (n.cmd, n.inf) {
            (255, _) => {}
            (0x8, SURROUND) => of.uni.effect(Opcode::ItEffectS0, 0x91),
            (0x8, inf) if inf < 0x80 => of.pt_effect(0x8, inf << 1),
            (0x8, 0x80) => of.pt_effect(0x8, 255),
            (0x8, _) => {}
            (0xb, inf) if inf <= 0x7f => of.pt_effect(0xb, inf),
            (0xb, _) => {}
            (0xd, inf) => of.pt_effect(0xd, (inf >> 4) * 10 + (inf & 0xf)),
            (cmd, inf) => of.pt_effect(cmd, inf),
        }
        of.uni.newline();
    }
}

#[derive(Debug, Default)]
pub struct DsmLoader {
    buf: Vec<Note>,
}

impl Loader for DsmLoader {
    fn tag(&self) -> &'static str {
        "DSM"
    }

    fn description(&self) -> &'static str {
        "DSIK internal format"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        let id = read_array::<12>(r);
        !r.eof() && &id[..4] == b"RIFF" && &id[8..] == b"DSMF"
    }

    fn init(&mut self) -> Result<(), ModError> {
        self.buf = vec![Note::EMPTY; MAX_CHANNELS * ROWS];
        Ok(())
    }

    fn load(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        _curious: bool,
    ) -> Result<(), ModError> {
        let mut chunks = Chunks::new();
        if chunks.next(r)? != ChunkKind::Song {
            return Err(ModError::LoadingHeader);
        }
        let mh: SongHeader = read_struct(r)?;
        if mh.num_tracks as usize > MAX_CHANNELS {
            return Err(ModError::LoadingHeader);
        }

        of.initial_speed = mh.speed;
        of.initial_tempo = mh.bpm as u16;
        of.format = "DSIK DSM-format".to_string();
        of.num_channels = mh.num_tracks as u8;
        of.num_patterns = mh.num_patterns;
        of.set_track_count()?;
        of.title = dup_str(&mh.title, true);
        of.restart_position = 0;
        of.flags |= ModuleFlags::PANNING;
        of.bpm_limit = 32;
        for (pan, &p) in of.panning.iter_mut().zip(&mh.pan_positions) {
            *pan = match p {
                SURROUND => PAN_SURROUND,
                0..=0x7f => (p as i16) << 1,
                _ => 255,
            };
        }

        of.alloc_positions(mh.num_orders as usize)?;
        of.num_positions = 0;
        for &o in mh.orders.iter().take(mh.num_orders as usize) {
            let pos = of.num_positions as usize;
            of.positions[pos] = if o == 255 { LAST_PATTERN } else { o as u16 };
            if o < 254 {
                of.num_positions += 1;
            }
        }

        of.num_instruments = mh.num_samples;
        of.num_samples = mh.num_samples;
        of.alloc_samples()?;
        of.alloc_tracks()?;
        of.alloc_patterns()?;
        log::debug!("[DSM] {} channels, {} patterns", of.num_channels, of.num_patterns);

        let channels = of.num_channels as usize;
        let (mut sample, mut pattern, mut track) = (0, 0, 0);
        while sample < of.num_samples as usize || pattern < of.num_patterns as usize {
            match chunks.next(r)? {
                ChunkKind::Inst if sample < of.num_samples as usize => {
                    let s: InstHeader =
                        read_struct(r).map_err(|_| ModError::LoadingSampleInfo)?;
                    let q = &mut of.samples[sample];
                    q.name = dup_str(&s.name, true);
                    q.seek_pos = r.tell();
                    q.speed = s.c2spd as u32;
                    q.length = s.length;
                    q.loop_start = s.loop_start;
                    q.loop_end = s.loop_end;
                    q.volume = s.volume;
                    if s.flags & 1 != 0 {
                        q.flags |= SampleFlags::LOOP;
                    }
                    if s.flags & 2 != 0 {
                        q.flags |= SampleFlags::SIGNED;
                    }
                    sample += 1;
                }
                ChunkKind::Patt if pattern < of.num_patterns as usize => {
                    read_pattern(r, &mut self.buf)?;
                    for ch in 0..channels {
                        convert_track(of, &self.buf[ch * ROWS..(ch + 1) * ROWS]);
                        of.store_track(track)?;
                        track += 1;
                    }
                    pattern += 1;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.buf = Vec::new();
    }

    fn load_title(&self, r: &mut dyn ByteReader) -> Option<String> {
        let mut chunks = Chunks::new();
        match chunks.next(r) {
            Ok(ChunkKind::Song) => {
                let title = read_array::<28>(r);
                (!r.eof()).then(|| dup_str(&title, true))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemReader;

    fn riff(chunks: &[(&[u8; 4], &[u8])]) -> Vec<u8> {
        let mut data = b"RIFF\0\0\0\0DSMF".to_vec();
        for (id, body) in chunks {
            data.extend_from_slice(*id);
            data.extend_from_slice(&(body.len() as u32).to_le_bytes());
            data.extend_from_slice(body);
        }
        data
    }

    #[test]
    fn unknown_chunks_are_skipped() {
        let data = riff(&[
            (b"JUNK", &[1u8, 2, 3][..]),
            (b"PATT", &[9u8][..]),
            (b"INST", &[][..]),
        ]);
        let mut r = MemReader::new(&data);
        let mut chunks = Chunks::new();
        assert_eq!(chunks.next(&mut r), Ok(ChunkKind::Patt));
        assert_eq!(r.read_u8(), 9);
        assert_eq!(chunks.next(&mut r), Ok(ChunkKind::Inst));
        assert_eq!(chunks.next(&mut r), Err(ModError::LoadingHeader));
    }

    #[test]
    fn panning_commands() {
        let mut of = ModuleBuilder::new();
        let cells = [
            Note { cmd: 0x8, inf: SURROUND, ..Note::EMPTY },
            Note { cmd: 0x8, inf: 0x40, ..Note::EMPTY },
            Note { cmd: 0x8, inf: 0x90, ..Note::EMPTY },
        ];
        convert_track(&mut of, &cells);
        let track = of.uni.finish();
        let rows: Vec<Vec<_>> = track
            .rows()
            .map(|row| row.events().map(|e| (e.opcode, e.operand)).collect())
            .collect();
        assert_eq!(rows[0], vec![(Opcode::ItEffectS0, 0x91)]);
        assert_eq!(rows[1], vec![(Opcode::PtEffect8, 0x80)]);
        assert!(rows[2].is_empty());
    }

    #[test]
    fn pattern_length_guard() {
        // declared length 1 cannot hold two row terminators
        let data = [1, 0, 0, 0];
        let mut buf = vec![Note::EMPTY; MAX_CHANNELS * ROWS];
        let mut r = MemReader::new(&data);
        assert_eq!(read_pattern(&mut r, &mut buf), Err(ModError::LoadingPattern));
    }
}
