//! UltraTracker (.ULT) module parser.
//!
//! Tracks are stored channel by channel, run-length packed, and carry two
//! effect columns per event.

use binrw::BinRead;
use um_ir::{periods, ModError, ModuleBuilder, ModuleFlags, Opcode, SampleFlags, LAST_PATTERN};

use crate::common::{dup_str, read_lined_comment};
use crate::loader::Loader;
use crate::reader::{read_array, read_struct, read_struct_args, ByteReader};

const ID: &[u8; 14] = b"MAS_UTrack_V00";
const ROWS: usize = 64;
const MAX_CHANNELS: usize = 32;
/// Event prefix announcing a repeat count.
const REPEAT: u8 = 0xfc;

const FLAG_16BITS: u8 = 4;
const FLAG_LOOP: u8 = 8;

#[derive(BinRead, Debug)]
#[br(little)]
struct Header {
    id: [u8; 15],
    title: [u8; 32],
    text_lines: u8,
}

impl Header {
    fn version(&self) -> u8 {
        self.id[14]
    }
}

#[derive(BinRead, Debug)]
#[br(little, import(version: u8))]
struct SampleHeader {
    name: [u8; 32],
    _dos_name: [u8; 12],
    loop_start: u32,
    loop_end: u32,
    size_start: u32,
    size_end: u32,
    volume: u8,
    flags: u8,
    #[br(if(version >= b'4', 8363))]
    speed: u16,
    finetune: i16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Event {
    note: u8,
    sample: u8,
    eff: u8,
    dat1: u8,
    dat2: u8,
}

/// Read one event and its repeat count.
fn read_event(r: &mut dyn ByteReader) -> (Event, u8) {
    let mut rep = 1;
    let flag = r.read_u8();
    let note = if flag == REPEAT {
        rep = r.read_u8();
        r.read_u8()
    } else {
        flag
    };
    let ev = Event {
        note,
        sample: r.read_u8(),
        eff: r.read_u8(),
        dat1: r.read_u8(),
        dat2: r.read_u8(),
    };
    (ev, rep)
}

/// Translate one of the two effect columns. `offset` is the operand used
/// for a sample offset command.
fn convert_effect(of: &mut ModuleBuilder, eff: u8, dat: u8, offset: u16) {
    match eff {
        0x3 => of.uni.effect(Opcode::ItEffectG, dat as u16),
        0x5 => {}
        0x9 => of.uni.effect(Opcode::UltEffect9, offset),
        0xb => {
            of.pt_effect(0x8, dat.wrapping_mul(0xf));
            of.flags |= ModuleFlags::PANNING;
        }
        0xc => of.pt_effect(0xc, dat >> 2),
        _ => of.pt_effect(eff, dat),
    }
}

fn convert_event(of: &mut ModuleBuilder, ev: &Event) {
    if ev.sample != 0 {
        of.uni.instrument(ev.sample - 1);
    }
    if ev.note != 0 {
        of.uni.note(ev.note.wrapping_add(2 * periods::OCTAVE as u8 - 1));
    }
    let (hi, lo) = (ev.eff >> 4, ev.eff & 0xf);
    // a 9 in both columns makes one 16-bit offset
    let offset = ((ev.dat2 as u16) << 8) | if lo == 9 { ev.dat1 as u16 } else { 0 };
    convert_effect(of, hi, ev.dat2, offset);
    if !(lo == 9 && hi == 9) {
        convert_effect(of, lo, ev.dat1, (ev.dat1 as u16) << 8);
    }
}

/// Approximates `speed * 2^(finetune / 12 / 32768)` to first order.
fn tuned_speed(speed: u16, finetune: i16) -> u32 {
    let speed = speed as i64;
    (speed + speed * finetune as i64 / 567_290).max(0) as u32
}

fn version_name(version: u8) -> &'static str {
    match version {
        b'1' => "Ultra Tracker (<v1.4)",
        b'2' => "Ultra Tracker v1.4",
        b'3' => "Ultra Tracker v1.5",
        _ => "Ultra Tracker v1.6",
    }
}

#[derive(Debug, Default)]
pub struct UltLoader;

impl Loader for UltLoader {
    fn tag(&self) -> &'static str {
        "ULT"
    }

    fn description(&self) -> &'static str {
        "UltraTracker"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        let id = read_array::<15>(r);
        !r.eof() && &id[..14] == ID && (b'1'..=b'4').contains(&id[14])
    }

    fn load(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        _curious: bool,
    ) -> Result<(), ModError> {
        let mh: Header = read_struct(r)?;
        let version = mh.version();

        of.format = version_name(version).to_string();
        of.initial_speed = 6;
        of.initial_tempo = 125;
        of.restart_position = 0;

        if version > b'1' && mh.text_lines > 0 {
            of.comment = read_lined_comment(r, mh.text_lines as usize * 32, 32);
        }

        let nos = r.read_u8();
        if r.eof() {
            return Err(ModError::LoadingHeader);
        }
        of.title = dup_str(&mh.title, true);
        of.num_instruments = nos as u16;
        of.num_samples = nos as u16;

        of.alloc_samples()?;
        for q in of.samples.iter_mut() {
            let s: SampleHeader = read_struct_args(r, (version,))
                .map_err(|_| ModError::LoadingSampleInfo)?;
            q.name = dup_str(&s.name, true);
            q.speed = tuned_speed(s.speed, s.finetune);
            q.length = s.size_end.wrapping_sub(s.size_start);
            q.volume = s.volume >> 2;
            q.loop_start = s.loop_start;
            q.loop_end = s.loop_end;
            q.flags = SampleFlags::SIGNED;
            if s.flags & FLAG_LOOP != 0 {
                q.flags |= SampleFlags::LOOP;
            }
            if s.flags & FLAG_16BITS != 0 {
                q.flags |= SampleFlags::BITS16;
                q.loop_start >>= 1;
                q.loop_end >>= 1;
            }
        }

        of.alloc_positions(256)?;
        let orders = read_array::<256>(r);
        let count = orders.iter().position(|&o| o == 255).unwrap_or(256);
        for (pos, &o) in of.positions.iter_mut().zip(&orders) {
            *pos = o as u16;
        }
        if count < 256 {
            of.positions[count] = LAST_PATTERN;
        }
        of.num_positions = count as u16;

        let channels = r.read_u8() as usize + 1;
        let patterns = r.read_u8() as usize + 1;
        if channels > MAX_CHANNELS {
            return Err(ModError::LoadingHeader);
        }
        of.num_channels = channels as u8;
        of.num_patterns = patterns as u16;
        of.num_tracks = (channels * patterns) as u16;
        of.alloc_tracks()?;
        of.alloc_patterns()?;
        // tracks are stored channel-major
        for u in 0..channels {
            for t in 0..patterns {
                of.patterns[t * channels + u] = (u * patterns + t) as u16;
            }
        }

        if version >= b'3' {
            for pan in of.panning.iter_mut().take(channels) {
                *pan = ((r.read_u8() & 0xf) << 4) as i16;
            }
            of.flags |= ModuleFlags::PANNING;
        }
        log::debug!("[ULT] {} with {channels} channels", of.format);

        for t in 0..of.num_tracks as usize {
            of.uni.reset();
            let mut row = 0;
            while row < ROWS {
                let (ev, rep) = read_event(r);
                if r.eof() {
                    return Err(ModError::LoadingTrack);
                }
                for _ in 0..rep {
                    convert_event(of, &ev);
                    of.uni.newline();
                    row += 1;
                }
            }
            of.store_track(t)?;
        }
        Ok(())
    }

    fn load_title(&self, r: &mut dyn ByteReader) -> Option<String> {
        r.skip(15);
        let title = read_array::<32>(r);
        (!r.eof()).then(|| dup_str(&title, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemReader;

    #[test]
    fn repeated_events() {
        let data = [REPEAT, 3, 37, 1, 0x0c, 0x20, 0x00, 0, 0, 0, 0, 0];
        let mut r = MemReader::new(&data);
        let (ev, rep) = read_event(&mut r);
        assert_eq!(rep, 3);
        assert_eq!(ev, Event { note: 37, sample: 1, eff: 0x0c, dat1: 0x20, dat2: 0 });
        let (_, rep) = read_event(&mut r);
        assert_eq!(rep, 1);
    }

    #[test]
    fn double_offset_merges() {
        let mut of = ModuleBuilder::new();
        of.uni.reset();
        convert_event(&mut of, &Event { eff: 0x99, dat1: 0x34, dat2: 0x12, ..Event::default() });
        of.uni.newline();
        let track = of.uni.finish();
        let row = track.rows().next().expect("row");
        let events: Vec<_> = row.events().map(|e| (e.opcode, e.operand)).collect();
        assert_eq!(events, vec![(Opcode::UltEffect9, 0x1234)]);
    }

    #[test]
    fn finetune_is_first_order() {
        assert_eq!(tuned_speed(8363, 0), 8363);
        assert_eq!(tuned_speed(8363, 32767), 8846);
        assert_eq!(tuned_speed(8363, -32768), 7880);
    }
}
