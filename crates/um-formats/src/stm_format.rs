//! Scream Tracker 2 (.STM) module parser.

use std::io::SeekFrom;

use binrw::BinRead;
use um_ir::{periods, ModError, ModuleBuilder, ModuleFlags, Opcode, SampleFlags};

use crate::common::dup_str;
use crate::loader::Loader;
use crate::reader::{read_array, read_struct, ByteReader};

const CHANNELS: usize = 4;
const ROWS: usize = 64;

/// Tracker signatures and the format names they stand for.
const TRACKERS: [(&[u8; 8], &str); 3] = [
    (b"!Scream!", "Screamtracker 2"),
    (b"BMOD2STM", "Converted by MOD2STM (STM format)"),
    (b"WUZAMOD!", "Wuzamod (STM format)"),
];

#[derive(BinRead, Debug)]
#[br(little)]
struct SampleHeader {
    filename: [u8; 12],
    _unused: u8,
    _disk: u8,
    /// Paragraph offset of the data, when the writer filled it in.
    paragraph: u16,
    length: u16,
    loop_begin: u16,
    loop_end: u16,
    volume: u8,
    _reserved: u8,
    c2spd: u16,
    _reserved2: [u8; 6],
}

#[derive(BinRead, Debug)]
#[br(little)]
struct Header {
    title: [u8; 20],
    tracker: [u8; 8],
    _eof_marker: u8,
    file_type: u8,
    _ver_major: u8,
    _ver_minor: u8,
    init_tempo: u8,
    num_patterns: u8,
    _global_volume: u8,
    _reserved: [u8; 13],
    samples: [SampleHeader; 31],
    orders: [u8; 128],
}

#[derive(Clone, Copy, Debug, Default)]
struct Note {
    note: u8,
    ins_vol: u8,
    vol_cmd: u8,
    cmd_inf: u8,
}

fn convert_note(of: &mut ModuleBuilder, n: Note) {
    let ins = n.ins_vol >> 3;
    let vol = (n.ins_vol & 7) + ((n.vol_cmd & 0x70) >> 1);
    let cmd = n.vol_cmd & 15;
    let inf = n.cmd_inf;
    let mut skip_volume = n.vol_cmd & 0x80 != 0;

    if (1..32).contains(&ins) {
        of.uni.instrument(ins - 1);
    }
    match n.note {
        // note cut
        252 | 254 => {
            of.pt_effect(0xc, 0);
            skip_volume = true;
        }
        note if note < 251 => of.uni.note(((note >> 4) + 2) * periods::OCTAVE as u8 + (note & 0xf)),
        _ => {}
    }
    if !skip_volume && vol < 65 {
        of.pt_effect(0xc, vol);
    }

    match cmd {
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
        // K: vibrato continue + volume slide
        0xb => {
            of.pt_effect(0x4, 0);
            of.uni.effect(Opcode::S3mEffectD, inf as u16);
        }
        // L: porta continue + volume slide
        0xc => {
            of.pt_effect(0x3, 0);
            of.uni.effect(Opcode::S3mEffectD, inf as u16);
        }
        _ => {}
    }
}

fn tracker_index(id: &[u8]) -> Option<usize> {
    TRACKERS.iter().position(|(sig, _)| id == *sig)
}

#[derive(Debug, Default)]
pub struct StmLoader;

impl Loader for StmLoader {
    fn tag(&self) -> &'static str {
        "STM"
    }

    fn description(&self) -> &'static str {
        "Scream Tracker 2"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        r.seek_to(SeekFrom::Start(20));
        let head = read_array::<44>(r);
        if r.eof() || head[9] != 2 {
            return false;
        }
        // S3M files carry their tag at the same distance
        if &head[40..44] == b"SCRM" {
            return false;
        }
        tracker_index(&head[..8]).is_some()
    }

    fn load(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        _curious: bool,
    ) -> Result<(), ModError> {
        let mh: Header = read_struct(r)?;
        if mh.file_type != 2 {
            return Err(ModError::NotAModule);
        }

        let tracker = tracker_index(&mh.tracker).unwrap_or(0);
        of.format = TRACKERS[tracker].1.to_string();
        of.title = dup_str(&mh.title, true);
        of.num_patterns = mh.num_patterns as u16;
        of.initial_tempo = 125;
        of.initial_speed = mh.init_tempo >> 4;
        of.num_channels = CHANNELS as u8;
        of.restart_position = 0;
        of.flags |= ModuleFlags::S3M_SLIDES;
        of.bpm_limit = 32;

        of.alloc_positions(0x80)?;
        // 99 terminates the order list
        let count = mh
            .orders
            .iter()
            .take_while(|&&p| p <= 99 && p < mh.num_patterns)
            .count();
        for (t, &p) in mh.orders[..count].iter().enumerate() {
            of.positions[t] = p as u16;
        }
        of.num_positions = count as u16;
        of.set_track_count()?;
        of.num_instruments = 31;
        of.num_samples = 31;
        log::debug!("[STM] {} with {} patterns", of.format, of.num_patterns);

        of.alloc_samples()?;
        of.alloc_patterns()?;
        of.alloc_tracks()?;

        let mut buf = [Note::default(); ROWS * CHANNELS];
        let mut track = 0;
        for _ in 0..of.num_patterns {
            for n in buf.iter_mut() {
                *n = Note {
                    note: r.read_u8(),
                    ins_vol: r.read_u8(),
                    vol_cmd: r.read_u8(),
                    cmd_inf: r.read_u8(),
                };
            }
            if r.eof() {
                return Err(ModError::LoadingPattern);
            }
            for ch in 0..CHANNELS {
                of.uni.reset();
                for row in 0..ROWS {
                    convert_note(of, buf[row * CHANNELS + ch]);
                    of.uni.newline();
                }
                of.store_track(track)?;
                track += 1;
            }
        }

        // data follows the patterns on paragraph boundaries
        let mut offset = (r.tell() + 15) & !15;
        for (q, s) in of.samples.iter_mut().zip(mh.samples.iter()) {
            q.name = dup_str(&s.filename, true);
            q.speed = s.c2spd as u32 * 8363 / 8448;
            q.volume = s.volume;
            q.length = if s.length == 1 { 0 } else { s.length as u32 };
            q.loop_start = s.loop_begin as u32;
            q.loop_end = s.loop_end as u32;
            q.seek_pos = if s.paragraph != 0 {
                (s.paragraph as u64) << 4
            } else {
                offset
            };
            offset = (offset + q.length as u64 + 15) & !15;
            // stored signed regardless of what the format notes say
            q.flags = SampleFlags::SIGNED;
            if s.loop_end != 0 && s.loop_end != 0xffff {
                q.flags |= SampleFlags::LOOP;
            }
        }
        Ok(())
    }

    fn load_title(&self, r: &mut dyn ByteReader) -> Option<String> {
        let title = read_array::<20>(r);
        (!r.eof()).then(|| dup_str(&title, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(of: &mut ModuleBuilder) -> Vec<(Opcode, u16)> {
        let track = of.uni.finish();
        let row = track.rows().next().expect("one row");
        row.events().map(|e| (e.opcode, e.operand)).collect()
    }

    #[test]
    fn note_and_volume_unpacked() {
        let mut of = ModuleBuilder::new();
        of.uni.reset();
        // C-2, instrument 3, volume 40, speed command A60
        convert_note(
            &mut of,
            Note { note: 0x20, ins_vol: 3 << 3, vol_cmd: 0x50 | 1, cmd_inf: 0x60 },
        );
        of.uni.newline();
        assert_eq!(
            events(&mut of),
            vec![
                (Opcode::Instrument, 2),
                (Opcode::Note, 48),
                (Opcode::PtEffectC, 40),
                (Opcode::PtEffectF, 6),
            ]
        );
    }

    #[test]
    fn cut_suppresses_volume() {
        let mut of = ModuleBuilder::new();
        of.uni.reset();
        convert_note(&mut of, Note { note: 254, ins_vol: 0, vol_cmd: 0x10, cmd_inf: 0 });
        of.uni.newline();
        assert_eq!(events(&mut of), vec![(Opcode::PtEffectC, 0)]);
    }

    #[test]
    fn tracker_signatures() {
        assert_eq!(tracker_index(b"BMOD2STM"), Some(1));
        assert_eq!(tracker_index(b"!SCREAM!"), None);
    }
}
