//! Composer 669 and Extended 669 (UNIS) module parser.
//!
//! Always eight channels. Each pattern carries its own tempo and a break
//! row, and effects other than frequency adjust and speed keep running
//! on following rows until a new note arrives.

use binrw::BinRead;
use um_ir::{periods, ModError, ModuleBuilder, ModuleFlags, Opcode, SampleFlags};

use crate::common::dup_str;
use crate::loader::Loader;
use crate::reader::{read_array, read_struct, ByteReader};

const CHANNELS: usize = 8;
const ROWS: usize = 64;
const MSG_LINE: usize = 36;

#[derive(BinRead, Debug)]
#[br(little)]
struct Header {
    marker: [u8; 2],
    message: [u8; 108],
    num_samples: u8,
    num_patterns: u8,
    loop_order: u8,
    orders: [u8; 0x80],
    tempos: [u8; 0x80],
    breaks: [u8; 0x80],
}

impl Header {
    fn is_valid(&self) -> bool {
        self.orders.iter().all(|&o| o < 0x80 || o == 0xff)
            && self.tempos.iter().all(|&t| (1..=32).contains(&t))
            && self.breaks.iter().all(|&b| b <= 0x3f)
    }

    fn is_extended(&self) -> bool {
        &self.marker == b"JN"
    }
}

#[derive(BinRead, Debug)]
#[br(little)]
struct SampleHeader {
    filename: [u8; 13],
    length: i32,
    loop_begin: i32,
    loop_end: i32,
}

/// The three 36-character message lines, each trimmed of trailing
/// spaces, joined with line breaks.
fn song_message(message: &[u8; 108]) -> Option<String> {
    let lines: Vec<String> = message
        .chunks(MSG_LINE)
        .map(|line| dup_str(line, true))
        .collect();
    if lines.iter().all(|l| l.is_empty()) {
        return None;
    }
    Some(lines.join("\n"))
}

fn convert_track(of: &mut ModuleBuilder, cells: &[[u8; 3]], tempo: u8, extended: bool) {
    of.uni.reset();
    // pattern tempo
    of.pt_effect(0xf, 78);
    of.pt_effect(0xf, tempo);

    let mut last_fx = 0xffu8;
    let mut last_val = 0u8;
    for &[a, b, c] in cells {
        let note = a >> 2;
        let inst = ((a & 0x3) << 4) | (b >> 4);
        let vol = b & 0xf;

        if a < 0xff {
            if a < 0xfe {
                of.uni.instrument(inst);
                of.uni.note(note + 2 * periods::OCTAVE as u8);
                // new note stops the running effect
                last_fx = 0xff;
            }
            of.pt_effect(0xc, vol << 2);
        }

        if c != 0xff || last_fx != 0xff {
            let (fx, val) = if c == 0xff {
                (last_fx, last_val)
            } else {
                (c, c & 0xf)
            };
            match fx >> 4 {
                0 => of.pt_effect(0x1, val),
                1 => of.pt_effect(0x2, val),
                2 => of.pt_effect(0x3, val),
                // frequency adjust, played as a fine slide
                3 => of.uni.effect(Opcode::S3mEffectE, (0xf0 | val) as u16),
                4 => of.pt_effect(0x4, val),
                5 if val != 0 => of.pt_effect(0xf, val),
                5 => {
                    if extended {
                        log::debug!("[669] super fast tempo is not supported");
                    }
                }
                _ => {}
            }
            if matches!(fx >> 4, 0 | 1 | 2 | 4) {
                last_fx = fx;
                last_val = val;
            }
        }
        of.uni.newline();
    }
}

#[derive(Debug, Default)]
pub struct S69Loader;

impl Loader for S69Loader {
    fn tag(&self) -> &'static str {
        "669"
    }

    fn description(&self) -> &'static str {
        "Composer 669 and Extended 669"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        let Ok(mh) = read_struct::<Header>(r) else {
            return false;
        };
        (&mh.marker == b"if" || mh.is_extended())
            && mh.num_samples <= 64
            && mh.num_patterns <= 128
            && mh.loop_order <= 127
            && mh.is_valid()
    }

    fn load(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        _curious: bool,
    ) -> Result<(), ModError> {
        let mh: Header = read_struct(r)?;
        if !mh.is_valid() {
            return Err(ModError::NotAModule);
        }

        of.initial_speed = 4;
        of.initial_tempo = 78;
        of.title = dup_str(&mh.message[..MSG_LINE], true);
        of.format = if mh.is_extended() {
            "Extended 669"
        } else {
            "Composer 669"
        }
        .to_string();
        of.num_channels = CHANNELS as u8;
        of.num_patterns = mh.num_patterns as u16;
        of.num_instruments = mh.num_samples as u16;
        of.num_samples = mh.num_samples as u16;
        of.set_track_count()?;
        of.flags = ModuleFlags::XM_PERIODS | ModuleFlags::LINEAR;
        of.comment = song_message(&mh.message);

        of.alloc_positions(0x80)?;
        let count = mh
            .orders
            .iter()
            .take_while(|&&o| o < mh.num_patterns)
            .count();
        for (pos, &o) in of.positions.iter_mut().zip(&mh.orders[..count]) {
            *pos = o as u16;
        }
        of.num_positions = count as u16;
        of.restart_position = if (mh.loop_order as usize) < count {
            mh.loop_order as u16
        } else {
            0
        };

        of.alloc_samples()?;
        for q in of.samples.iter_mut() {
            let s: SampleHeader = read_struct(r).map_err(|_| ModError::LoadingHeader)?;
            let loop_end = if s.loop_end == 0xfffff { 0 } else { s.loop_end };
            if s.length < 0 || s.loop_begin < -1 || loop_end < -1 {
                return Err(ModError::LoadingHeader);
            }
            q.name = dup_str(&s.filename, true);
            q.speed = 0;
            q.length = s.length as u32;
            q.loop_start = s.loop_begin.max(0) as u32;
            q.loop_end = loop_end.max(0) as u32;
            if s.loop_begin < loop_end {
                q.flags = SampleFlags::LOOP;
            }
            q.volume = 64;
        }
        log::debug!("[669] {} with {} patterns", of.format, of.num_patterns);

        of.alloc_patterns()?;
        of.alloc_tracks()?;

        let extended = mh.is_extended();
        let mut cells = [[0u8; 3]; ROWS * CHANNELS];
        let mut column = Vec::with_capacity(ROWS);
        let mut track = 0;
        for t in 0..of.num_patterns as usize {
            of.pattern_rows[t] = mh.breaks[t] as u16 + 1;
            for cell in cells.iter_mut() {
                *cell = read_array::<3>(r);
            }
            if r.eof() {
                return Err(ModError::LoadingPattern);
            }
            for ch in 0..CHANNELS {
                column.clear();
                column.extend((0..=mh.breaks[t] as usize).map(|row| cells[row * CHANNELS + ch]));
                convert_track(of, &column, mh.tempos[t], extended);
                of.store_track(track)?;
                track += 1;
            }
        }
        Ok(())
    }

    fn load_title(&self, r: &mut dyn ByteReader) -> Option<String> {
        r.skip(2);
        let title = read_array::<MSG_LINE>(r);
        (!r.eof()).then(|| dup_str(&title, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(of: &mut ModuleBuilder) -> Vec<Vec<(Opcode, u16)>> {
        let track = of.uni.finish();
        track
            .rows()
            .map(|row| row.events().map(|e| (e.opcode, e.operand)).collect())
            .collect()
    }

    #[test]
    fn effects_persist_until_next_note() {
        let mut of = ModuleBuilder::new();
        of.flags = ModuleFlags::XM_PERIODS | ModuleFlags::LINEAR;
        let cells = [
            // note 2, instrument 1, volume 15, porta up 3
            [2 << 2, 0x1f, 0x03],
            [0xff, 0x00, 0xff],
            [4 << 2, 0x10, 0xff],
        ];
        convert_track(&mut of, &cells, 6, false);
        let rows = rows(&mut of);
        assert_eq!(
            rows[0],
            vec![
                (Opcode::PtEffectF, 78),
                (Opcode::PtEffectF, 6),
                (Opcode::Instrument, 1),
                (Opcode::Note, 26),
                (Opcode::PtEffectC, 60),
                (Opcode::PtEffect1, 3),
            ]
        );
        assert_eq!(rows[1], vec![(Opcode::PtEffect1, 3)]);
        assert_eq!(
            rows[2],
            vec![(Opcode::Instrument, 1), (Opcode::Note, 28), (Opcode::PtEffectC, 0)]
        );
    }

    #[test]
    fn message_lines() {
        let mut msg = [b' '; 108];
        msg[..5].copy_from_slice(b"hello");
        msg[72..77].copy_from_slice(b"world");
        assert_eq!(song_message(&msg).as_deref(), Some("hello\n\nworld"));
        assert_eq!(song_message(&[b' '; 108]), None);
    }
}
