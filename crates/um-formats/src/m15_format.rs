//! 15-sample Soundtracker modules.
//!
//! These have no signature at all, so the test is a set of plausibility
//! checks on the header. A second heuristic tells Ultimate Soundtracker
//! files (byte loop starts, different effect numbering) from later
//! Soundtracker ones by looking at sample names and effect usage.

use binrw::BinRead;
use um_ir::{periods, ModError, ModuleBuilder, ModuleFlags, SampleFlags};

use crate::common::dup_str;
use crate::effects::pt_param;
use crate::loader::Loader;
use crate::mod_format::{read_cells, Cell, SampleInfo, NO_EFFECT, ROWS};
use crate::reader::{read_array, read_struct, ByteReader};

const CHANNELS: usize = 4;

/// File types whose first bytes can pass the header checks.
const REJECT: [&[u8]; 2] = [b"CAKEWALK", b"SZDD"];

#[derive(BinRead, Debug)]
#[br(big)]
struct Header {
    title: [u8; 20],
    samples: [SampleInfo; 15],
    song_length: u8,
    magic1: u8,
    positions: [u8; 128],
}

/// Printable text followed only by NULs, over the first 20 bytes.
fn plausible_name(name: &[u8], min: u8) -> bool {
    let name = &name[..20];
    if name.iter().any(|&c| c != 0 && !(min..0x80).contains(&c)) {
        return false;
    }
    let end = name.iter().position(|&c| c == 0).unwrap_or(name.len());
    name[end..].iter().all(|&c| c == 0)
}

fn read_header(r: &mut dyn ByteReader) -> Option<Header> {
    let mh: Header = read_struct(r).ok()?;
    if !plausible_name(&mh.title, 32) {
        return None;
    }
    for s in &mh.samples {
        if !plausible_name(&s.name, 14) || s.finetune >> 4 != 0 {
            return None;
        }
    }
    if mh.song_length == 0 || mh.song_length > 128 {
        return None;
    }
    // values seen in the wild are 0x6a and 0x78
    if mh.magic1 & 0xf8 != 0x78 && mh.magic1 != 0x6a && mh.magic1 > mh.song_length {
        return None;
    }
    if mh.positions.iter().any(|&p| p > 63) {
        return None;
    }
    Some(mh)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PatternHint {
    Undecided,
    Ultimate,
    Soundtracker,
}

/// Scan pattern effects: a large `1xx`/`2xx` means Ultimate Soundtracker,
/// anything that only later trackers have means Soundtracker.
fn check_pattern_type(r: &mut dyn ByteReader, num_patterns: usize) -> PatternHint {
    for _ in 0..num_patterns * ROWS * CHANNELS {
        let [_, _, eff, dat] = read_array::<4>(r);
        match eff {
            1 => {
                if dat > 0x1f {
                    return PatternHint::Ultimate;
                }
                if dat < 0x3 {
                    return PatternHint::Soundtracker;
                }
            }
            2 => {
                if dat > 0x1f {
                    return PatternHint::Ultimate;
                }
                return PatternHint::Soundtracker;
            }
            3 => {
                if dat != 0 {
                    return PatternHint::Soundtracker;
                }
            }
            _ => return PatternHint::Soundtracker,
        }
    }
    PatternHint::Undecided
}

/// Returns `Some(is_ultimate)` for a plausible 15-sample module.
fn classify(r: &mut dyn ByteReader) -> Option<bool> {
    let mh = read_header(r)?;
    if REJECT.iter().any(|sig| mh.title.starts_with(sig)) {
        return None;
    }
    if mh.magic1 > 127 || mh.song_length > mh.magic1 {
        return None;
    }

    let mut ust = false;
    for s in &mh.samples {
        if s.finetune != 0 || s.volume > 64 {
            return None;
        }
        match s.name[0] {
            b's' | b'S' => {
                if !s.name.starts_with(b"st-") && !s.name.starts_with(b"ST-") {
                    ust = true;
                }
            }
            c if !c.is_ascii_digit() => ust = true,
            _ => {}
        }
        if s.length > 4999 || s.rep_pos > 9999 {
            ust = false;
            if s.length > 32768 {
                return None;
            }
        }
        // loop fits in bytes but not in words
        let loop_end = s.rep_pos as u32 + s.rep_len as u32;
        if loop_end > s.length as u32 && loop_end < (s.length as u32) << 1 {
            return Some(true);
        }
        if !ust {
            return Some(false);
        }
    }

    let num_patterns = mh.positions[..mh.song_length as usize]
        .iter()
        .copied()
        .max()
        .unwrap_or(0) as usize
        + 1;
    match check_pattern_type(r, num_patterns) {
        PatternHint::Undecided => Some(ust),
        PatternHint::Ultimate => Some(true),
        PatternHint::Soundtracker => Some(false),
    }
}

#[derive(Debug, Default)]
pub struct M15Loader {
    patbuf: Vec<Cell>,
}

impl M15Loader {
    fn convert_note(
        of: &mut ModuleBuilder,
        samples: &[SampleInfo; 15],
        ust: bool,
        n: Cell,
        last_effect: u8,
    ) -> u8 {
        let instrument = n.c >> 4;
        let mut effect = n.c & 0xf;
        let mut dat = n.d;
        let note = periods::period_to_note(n.period());

        if instrument != 0 {
            if instrument > 15 || samples[instrument as usize - 1].length == 0 {
                of.pt_effect(0xc, 0);
                if effect == 0xc {
                    effect = 0;
                    dat = 0;
                }
            } else if note != 0 || effect != 0 || dat != 0 {
                of.uni.instrument(instrument - 1);
            } else {
                let vol = samples[instrument as usize - 1].volume & 0x7f;
                of.pt_effect(0xc, vol);
            }
        }
        if note != 0 {
            of.uni.note(note + 2 * periods::OCTAVE as u8 - 1);
        }

        dat = pt_param(effect, dat);

        if ust {
            match effect {
                0 | 3 => {}
                1 => of.pt_effect(0, dat),
                2 => {
                    if dat & 0xf != 0 {
                        of.pt_effect(1, dat & 0xf);
                    } else if dat >> 2 != 0 {
                        of.pt_effect(2, dat >> 2);
                    }
                }
                _ => of.pt_effect(effect, dat),
            }
        } else {
            if dat == 0
                && matches!(effect, 1..=3)
                && last_effect < NO_EFFECT
                && effect != last_effect
            {
                effect = 0;
            }
            of.pt_effect(effect, dat);
        }
        if effect == 8 {
            of.flags.insert(ModuleFlags::PANNING);
        }
        effect
    }
}

impl Loader for M15Loader {
    fn tag(&self) -> &'static str {
        "M15"
    }

    fn description(&self) -> &'static str {
        "15-instrument (Ultimate) Soundtracker"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        classify(r).is_some()
    }

    fn load(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        curious: bool,
    ) -> Result<(), ModError> {
        let ust = classify(r).unwrap_or(false);
        r.rewind_to_start();
        let mh = read_header(r).ok_or(ModError::LoadingHeader)?;

        of.format = if ust {
            "Ultimate Soundtracker"
        } else {
            "Soundtracker"
        }
        .to_string();
        of.initial_speed = 6;
        of.initial_tempo = 125;
        of.num_channels = CHANNELS as u8;
        of.title = dup_str(&mh.title, true);
        of.num_positions = mh.song_length as u16;
        of.restart_position = 0;

        let song_length = mh.song_length as usize;
        let mut max_pattern = mh.positions[..song_length].iter().copied().max().unwrap_or(0);
        let tail = &mh.positions[song_length..];
        if tail.iter().all(|&p| p < 0x80) {
            for (t, &p) in tail.iter().enumerate() {
                max_pattern = max_pattern.max(p);
                if curious && p != 0 {
                    of.num_positions = (song_length + t + 1) as u16;
                }
            }
        }
        of.num_patterns = max_pattern as u16 + 1;
        of.set_track_count()?;

        let num_positions = of.num_positions as usize;
        of.alloc_positions(num_positions)?;
        for (dst, &p) in of.positions.iter_mut().zip(mh.positions.iter()) {
            *dst = p as u16;
        }

        of.num_instruments = 15;
        of.num_samples = 15;
        of.alloc_samples()?;
        for (q, s) in of.samples.iter_mut().zip(mh.samples.iter()) {
            q.name = dup_str(&s.name, true);
            q.speed = periods::FINETUNE[(s.finetune & 0xf) as usize] as u32;
            q.volume = s.volume;
            q.loop_start = if ust {
                s.rep_pos as u32
            } else {
                (s.rep_pos as u32) << 1
            };
            q.loop_end = q.loop_start + ((s.rep_len as u32) << 1);
            q.length = (s.length as u32) << 1;
            q.flags = SampleFlags::SIGNED;
            if ust {
                q.flags |= SampleFlags::UST_LOOP;
            }
            if s.rep_len > 2 {
                q.flags |= SampleFlags::LOOP;
            }
        }

        of.alloc_patterns()?;
        of.alloc_tracks()?;
        self.patbuf = vec![Cell::default(); ROWS * CHANNELS];
        let mut track = 0;
        for _ in 0..of.num_patterns {
            read_cells(r, &mut self.patbuf);
            for ch in 0..CHANNELS {
                of.uni.reset();
                let mut last_effect = NO_EFFECT;
                for row in 0..ROWS {
                    let cell = self.patbuf[ch + row * CHANNELS];
                    last_effect = Self::convert_note(of, &mh.samples, ust, cell, last_effect);
                    of.uni.newline();
                }
                of.store_track(track)?;
                track += 1;
            }
        }
        if r.eof() {
            return Err(ModError::LoadingPattern);
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.patbuf = Vec::new();
    }

    fn load_title(&self, r: &mut dyn ByteReader) -> Option<String> {
        let title = read_array::<20>(r);
        (!r.eof()).then(|| dup_str(&title, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_must_be_text_then_padding() {
        let mut name = [0u8; 22];
        name[..4].copy_from_slice(b"kick");
        assert!(plausible_name(&name, 32));
        name[6] = b'x';
        assert!(!plausible_name(&name, 32));
        name[6] = 0;
        name[1] = 0x07;
        assert!(!plausible_name(&name, 32));
    }
}
