//! Amiga Oktalyzer (.OKT) module parser.
//!
//! The file is a flat sequence of IFF-style chunks after the `OKTASONG`
//! signature. Pattern bodies need the channel and pattern counts, and
//! sample bodies attach in order to the non-empty sample slots.

use std::io::SeekFrom;

use binrw::BinRead;
use um_ir::{
    periods, ModError, ModuleBuilder, ModuleFlags, Opcode, SampleFlags, PAN_LEFT, PAN_RIGHT,
};

use crate::common::dup_str;
use crate::loader::Loader;
use crate::reader::{read_array, read_struct, ByteReader};

const AMIGA_PAN: [i16; 4] = [PAN_LEFT, PAN_RIGHT, PAN_RIGHT, PAN_LEFT];

#[derive(BinRead, Debug)]
#[br(big)]
struct SampleHeader {
    name: [u8; 20],
    length: u32,
    loop_begin: u16,
    loop_len: u16,
    _pad: u8,
    volume: u8,
    _mode: u16,
}

fn convert_effect(of: &mut ModuleBuilder, eff: u8, dat: u8) {
    match eff {
        1 => of.pt_effect(0x1, dat),
        2 => of.pt_effect(0x2, dat),
        // arpeggio styles 3, 4 and 5
        10 | 11 | 12 => of.uni.effect(Opcode::OktArp, (((eff - 7) as u16) << 8) | dat as u16),
        25 => of.pt_effect(0xb, (dat >> 4) * 10 + (dat & 0xf)),
        28 => of.pt_effect(0xf, dat & 0xf),
        30 => match dat {
            0..=0x40 => of.pt_effect(0xc, dat),
            0x41..=0x50 => of.uni.effect(Opcode::XmEffectA, (dat - 0x40) as u16),
            0x51..=0x60 => of.uni.effect(Opcode::XmEffectA, ((dat - 0x50) as u16) << 4),
            0x61..=0x70 => of.uni.effect(Opcode::XmEffectEB, (dat - 0x60) as u16),
            0x71..=0x80 => of.uni.effect(Opcode::XmEffectEA, (dat - 0x70) as u16),
            _ => {}
        },
        // filter toggle, release
        15 | 27 => {}
        _ => log::trace!("[OKT] unimplemented effect {eff} {dat:02x}"),
    }
}

fn convert_track(of: &mut ModuleBuilder, cells: &[[u8; 4]]) {
    of.uni.reset();
    for &[note, ins, eff, dat] in cells {
        if note != 0 {
            of.uni.note(note.wrapping_add(3 * periods::OCTAVE as u8 - 1));
            of.uni.instrument(ins);
        }
        if eff != 0 {
            convert_effect(of, eff, dat);
        }
        of.uni.newline();
    }
}

/// Which single-use chunks have been seen.
#[derive(Debug, Default)]
struct Seen {
    cmod: bool,
    samp: bool,
    spee: bool,
    slen: bool,
    plen: bool,
    patt: bool,
}

#[derive(Debug, Default)]
pub struct OktLoader {
    cells: Vec<[u8; 4]>,
}

impl OktLoader {
    fn read_channel_modes(r: &mut dyn ByteReader, of: &mut ModuleBuilder) {
        of.num_channels = 0;
        of.flags |= ModuleFlags::PANNING;
        for pan in AMIGA_PAN {
            // a set word doubles the hardware voice
            let voices = if r.read_u16_be() != 0 { 2 } else { 1 };
            for _ in 0..voices {
                let ch = of.num_channels as usize;
                of.panning[ch] = pan;
                of.num_channels += 1;
            }
        }
    }

    fn read_samples(
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        len: u32,
    ) -> Result<(), ModError> {
        of.num_samples = (len / 0x20) as u16;
        of.num_instruments = of.num_samples;
        of.alloc_samples()?;
        for q in of.samples.iter_mut() {
            let s: SampleHeader = read_struct(r).map_err(|_| ModError::LoadingSampleInfo)?;
            if s.length != 0 {
                let len = s.length - 1;
                let loop_begin = (s.loop_begin as u32 * 2).min(len);
                let mut loop_len = (s.loop_len as u32 * 2).min(len - loop_begin);
                if loop_len < 2 {
                    loop_len = 0;
                }
                q.length = len;
                q.loop_start = loop_begin;
                q.loop_end = loop_begin + loop_len;
                q.volume = s.volume;
                q.flags = SampleFlags::SIGNED;
                if loop_len != 0 {
                    q.flags |= SampleFlags::LOOP;
                }
            } else {
                q.length = 0;
                q.flags = SampleFlags::empty();
            }
            q.name = dup_str(&s.name, true);
            q.speed = 8287;
        }
        Ok(())
    }

    fn read_pattern(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        pattern: usize,
    ) -> Result<(), ModError> {
        if pattern == 0 {
            of.set_track_count()?;
            of.alloc_tracks()?;
            of.alloc_patterns()?;
        }
        let rows = r.read_u16_be() as usize;
        of.pattern_rows[pattern] = rows as u16;
        let channels = of.num_channels as usize;
        let raw = r.read_vec(rows * channels * 4);
        if r.eof() {
            return Err(ModError::LoadingPattern);
        }
        for ch in 0..channels {
            self.cells.clear();
            self.cells.extend((0..rows).map(|u| {
                let at = (u * channels + ch) * 4;
                [raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]
            }));
            convert_track(of, &self.cells);
            of.store_track(pattern * channels + ch)?;
        }
        Ok(())
    }
}

impl Loader for OktLoader {
    fn tag(&self) -> &'static str {
        "OKT"
    }

    fn description(&self) -> &'static str {
        "Amiga Oktalyzer"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        let id = read_array::<8>(r);
        !r.eof() && &id == b"OKTASONG"
    }

    fn load(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        _curious: bool,
    ) -> Result<(), ModError> {
        r.seek_to(SeekFrom::Start(8));
        of.title = String::new();
        of.format = "Amiga Oktalyzer".to_string();
        of.num_positions = 0;
        of.restart_position = 0;
        of.initial_speed = 6;
        of.initial_tempo = 125;

        let mut seen = Seen::default();
        let mut pattern = 0usize;
        let mut sample = 0usize;
        loop {
            let id = read_array::<4>(r);
            let len = r.read_u32_be();
            if r.eof() {
                break;
            }
            let start = r.tell();
            match &id {
                b"CMOD" if !seen.cmod => {
                    Self::read_channel_modes(r, of);
                    seen.cmod = true;
                }
                b"SAMP" if !seen.samp => {
                    Self::read_samples(r, of, len)?;
                    seen.samp = true;
                }
                b"SPEE" if !seen.spee => {
                    read_speed(r, of);
                    seen.spee = true;
                }
                b"SLEN" if !seen.slen => {
                    of.num_patterns = r.read_u16_be();
                    seen.slen = true;
                }
                b"PLEN" if !seen.plen => {
                    of.num_positions = r.read_u16_be();
                    seen.plen = true;
                }
                b"PATT" => {
                    if !seen.plen {
                        break;
                    }
                    let count = of.num_positions as usize;
                    if !seen.patt && count != 0 && len as usize >= count {
                        of.alloc_positions(count)?;
                        for pos in of.positions.iter_mut() {
                            *pos = r.read_u8() as u16;
                        }
                        seen.patt = true;
                    }
                }
                b"PBOD" => {
                    if !seen.slen || !seen.cmod || pattern >= of.num_patterns as usize {
                        break;
                    }
                    self.read_pattern(r, of, pattern)?;
                    pattern += 1;
                }
                b"SBOD" => {
                    if !seen.samp {
                        break;
                    }
                    while sample < of.samples.len() && of.samples[sample].length == 0 {
                        sample += 1;
                    }
                    if sample >= of.samples.len() {
                        break;
                    }
                    of.samples[sample].seek_pos = r.tell();
                    sample += 1;
                }
                _ => log::trace!("[OKT] skipping chunk {:?}", String::from_utf8_lossy(&id)),
            }
            r.seek_to(SeekFrom::Start(start + len as u64));
            if r.eof() {
                break;
            }
        }

        if !seen.cmod
            || !seen.samp
            || !seen.patt
            || of.num_channels == 0
            || of.num_positions == 0
            || of.num_patterns == 0
        {
            return Err(ModError::LoadingHeader);
        }
        if pattern < of.num_patterns as usize {
            log::warn!("[OKT] only {pattern} of {} pattern bodies present", of.num_patterns);
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.cells = Vec::new();
    }

    fn load_title(&self, _r: &mut dyn ByteReader) -> Option<String> {
        Some(String::new())
    }
}

/// SPEE chunk. A zero or out-of-range speed keeps the default.
fn read_speed(r: &mut dyn ByteReader, of: &mut ModuleBuilder) {
    match r.read_u16_be() {
        speed @ 1..=255 => of.initial_speed = speed as u8,
        speed => log::warn!("[OKT] ignoring initial speed {speed}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemReader;

    #[test]
    fn doubled_voices_share_panning() {
        let data = [0, 1, 0, 0, 0, 0, 0, 1];
        let mut of = ModuleBuilder::new();
        OktLoader::read_channel_modes(&mut MemReader::new(&data), &mut of);
        assert_eq!(of.num_channels, 6);
        assert_eq!(
            &of.panning[..6],
            &[PAN_LEFT, PAN_LEFT, PAN_RIGHT, PAN_RIGHT, PAN_LEFT, PAN_LEFT]
        );
    }

    #[test]
    fn zero_speed_keeps_default() {
        let mut of = ModuleBuilder::new();
        of.initial_speed = 6;
        read_speed(&mut MemReader::new(&[0, 0]), &mut of);
        assert_eq!(of.initial_speed, 6);
        read_speed(&mut MemReader::new(&[1, 0]), &mut of);
        assert_eq!(of.initial_speed, 6);
        read_speed(&mut MemReader::new(&[0, 3]), &mut of);
        assert_eq!(of.initial_speed, 3);
    }

    #[test]
    fn volume_control_ranges() {
        let mut of = ModuleBuilder::new();
        let cells = [
            [0, 0, 30, 0x30],
            [0, 0, 30, 0x45],
            [0, 0, 30, 0x55],
            [13, 2, 11, 0x37],
        ];
        convert_track(&mut of, &cells);
        let track = of.uni.finish();
        let rows: Vec<Vec<_>> = track
            .rows()
            .map(|row| row.events().map(|e| (e.opcode, e.operand)).collect())
            .collect();
        assert_eq!(rows[0], vec![(Opcode::PtEffectC, 0x30)]);
        assert_eq!(rows[1], vec![(Opcode::XmEffectA, 5)]);
        assert_eq!(rows[2], vec![(Opcode::XmEffectA, 0x50)]);
        assert_eq!(
            rows[3],
            vec![(Opcode::Note, 48), (Opcode::Instrument, 2), (Opcode::OktArp, 0x0437)]
        );
    }

    #[test]
    fn loops_clamped_to_sample() {
        let mut data = vec![0u8; 32];
        data[..4].copy_from_slice(b"kick");
        data[20..24].copy_from_slice(&100u32.to_be_bytes());
        data[24..26].copy_from_slice(&40u16.to_be_bytes());
        data[26..28].copy_from_slice(&20u16.to_be_bytes());
        data[29] = 48;
        let mut of = ModuleBuilder::new();
        OktLoader::read_samples(&mut MemReader::new(&data), &mut of, 32).expect("samples");
        let q = &of.samples[0];
        assert_eq!(q.name, "kick");
        assert_eq!(q.length, 99);
        assert_eq!((q.loop_start, q.loop_end), (80, 99));
        assert!(q.flags.contains(SampleFlags::LOOP));
    }
}
