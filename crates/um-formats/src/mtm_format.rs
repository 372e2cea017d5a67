//! MultiTracker (.MTM) module parser.
//!
//! MTM stores a pool of 64-row tracks and a pattern table of track
//! numbers, which maps directly onto the shared track model. Track 0 is
//! implicit and always empty.

use binrw::BinRead;
use um_ir::{periods, ModError, ModuleBuilder, ModuleFlags, SampleFlags};

use crate::common::{dup_str, read_lined_comment};
use crate::loader::Loader;
use crate::reader::{read_array, read_struct, ByteReader};

const ROWS: usize = 64;
const COMMENT_LINE: usize = 40;

#[derive(BinRead, Debug)]
#[br(little, magic = b"MTM")]
struct Header {
    version: u8,
    title: [u8; 20],
    num_tracks: u16,
    last_pattern: u8,
    last_order: u8,
    comment_size: u16,
    num_samples: u8,
    _attribute: u8,
    _beats_per_track: u8,
    num_channels: u8,
    pan_positions: [u8; 32],
}

#[derive(BinRead, Debug)]
#[br(little)]
struct SampleHeader {
    name: [u8; 22],
    length: u32,
    rep_pos: u32,
    rep_end: u32,
    finetune: u8,
    volume: u8,
    attribute: u8,
}

fn convert_track(of: &mut ModuleBuilder, cells: &[[u8; 3]]) {
    of.uni.reset();
    for &[a, b, c] in cells {
        let inst = ((a & 0x3) << 4) | (b >> 4);
        let note = a >> 2;
        let eff = b & 0xf;
        let mut dat = c;

        if inst != 0 {
            of.uni.instrument(inst - 1);
        }
        if note != 0 {
            of.uni.note(note + 2 * periods::OCTAVE as u8);
        }
        // slide up wins over slide down
        if eff == 0xa && dat & 0xf0 != 0 {
            dat &= 0xf0;
        }
        if eff == 0xd {
            dat = (dat >> 4) * 10 + (dat & 0xf);
        }
        of.pt_effect(eff, dat);
        of.uni.newline();
    }
}

#[derive(Debug, Default)]
pub struct MtmLoader;

impl Loader for MtmLoader {
    fn tag(&self) -> &'static str {
        "MTM"
    }

    fn description(&self) -> &'static str {
        "MultiTracker"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        let id = read_array::<3>(r);
        !r.eof() && &id == b"MTM"
    }

    fn load(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        _curious: bool,
    ) -> Result<(), ModError> {
        let mh: Header = read_struct(r)?;
        if mh.num_channels as usize > mh.pan_positions.len() {
            return Err(ModError::LoadingHeader);
        }

        of.initial_speed = 6;
        of.initial_tempo = 125;
        of.format = format!("MultiTracker {}.{}", mh.version >> 4, mh.version & 0xf);
        of.num_channels = mh.num_channels;
        of.num_tracks = mh
            .num_tracks
            .checked_add(1)
            .ok_or(ModError::LoadingHeader)?;
        of.title = dup_str(&mh.title, true);
        of.num_positions = mh.last_order as u16 + 1;
        of.num_patterns = mh.last_pattern as u16 + 1;
        of.restart_position = 0;
        of.flags |= ModuleFlags::PANNING;
        for (pan, &p) in of.panning.iter_mut().zip(&mh.pan_positions) {
            *pan = ((p & 0xf) << 4) as i16;
        }
        of.num_instruments = mh.num_samples as u16;
        of.num_samples = mh.num_samples as u16;
        log::debug!(
            "[MTM] {} with {} channels, {} tracks",
            of.format,
            of.num_channels,
            of.num_tracks
        );

        of.alloc_samples()?;
        for q in of.samples.iter_mut() {
            let s: SampleHeader = read_struct(r).map_err(|_| ModError::LoadingSampleInfo)?;
            q.name = dup_str(&s.name, true);
            q.speed = periods::FINETUNE[(s.finetune & 0xf) as usize] as u32;
            q.length = s.length;
            q.loop_start = s.rep_pos;
            q.loop_end = s.rep_end;
            q.volume = s.volume;
            if s.rep_end.wrapping_sub(s.rep_pos) > 2 {
                q.flags |= SampleFlags::LOOP;
            }
            if s.attribute & 1 != 0 {
                q.flags |= SampleFlags::BITS16;
                q.length >>= 1;
                q.loop_start >>= 1;
                q.loop_end >>= 1;
            }
        }

        of.alloc_positions(of.num_positions as usize)?;
        let orders = read_array::<128>(r);
        for (t, pos) in of.positions.iter_mut().enumerate() {
            *pos = orders.get(t).copied().unwrap_or(0) as u16;
        }
        if r.eof() {
            return Err(ModError::LoadingHeader);
        }

        of.alloc_tracks()?;
        of.alloc_patterns()?;

        let empty = [[0u8; 3]; ROWS];
        convert_track(of, &empty);
        of.store_track(0)?;
        let mut cells = [[0u8; 3]; ROWS];
        for t in 1..of.num_tracks as usize {
            for cell in cells.iter_mut() {
                *cell = read_array::<3>(r);
            }
            if r.eof() {
                return Err(ModError::LoadingTrack);
            }
            convert_track(of, &cells);
            of.store_track(t)?;
        }

        let channels = of.num_channels as usize;
        for t in 0..of.num_patterns as usize {
            let mut table = [0u16; 32];
            for slot in table.iter_mut() {
                *slot = r.read_u16_le();
            }
            of.patterns[t * channels..(t + 1) * channels].copy_from_slice(&table[..channels]);
        }
        if r.eof() {
            return Err(ModError::LoadingPattern);
        }

        if mh.comment_size > 0 {
            of.comment = read_lined_comment(r, mh.comment_size as usize, COMMENT_LINE);
        }
        Ok(())
    }

    fn load_title(&self, r: &mut dyn ByteReader) -> Option<String> {
        r.skip(4);
        let title = read_array::<20>(r);
        (!r.eof()).then(|| dup_str(&title, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use um_ir::Opcode;

    #[test]
    fn packed_cells() {
        let mut of = ModuleBuilder::new();
        // note 5, instrument 0x12, effect D 0x15, then a volume slide 0x4f
        let cells = [[(5 << 2) | 0x1, 0x2d, 0x15], [0, 0x0a, 0x4f]];
        convert_track(&mut of, &cells);
        let track = of.uni.finish();
        let rows: Vec<Vec<_>> = track
            .rows()
            .map(|row| row.events().map(|e| (e.opcode, e.operand)).collect())
            .collect();
        assert_eq!(
            rows[0],
            vec![
                (Opcode::Instrument, 0x11),
                (Opcode::Note, 29),
                (Opcode::PtEffectD, 15),
            ]
        );
        assert_eq!(rows[1], vec![(Opcode::PtEffectA, 0x40)]);
    }
}
