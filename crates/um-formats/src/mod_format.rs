//! Protracker MOD format parser (31 samples, 4-byte tag at 0x438).
//!
//! Also covers the Startrekker, Fasttracker, TakeTracker and Oktalyzer
//! variants, which differ only in their tag and channel count.

use binrw::BinRead;
use um_ir::{periods, ModError, ModuleBuilder, ModuleFlags, SampleFlags};

use crate::common::dup_str;
use crate::effects::pt_param;
use crate::loader::Loader;
use crate::reader::{read_array, read_struct, ByteReader};

const HEADER_SIZE: u64 = 0x438;
pub(crate) const ROWS: usize = 64;
/// Effect value that no Protracker command uses.
pub(crate) const NO_EFFECT: u8 = 0x10;

/// 30-byte sample record shared with the 15-sample variant.
#[derive(BinRead, Debug)]
#[br(big)]
pub(crate) struct SampleInfo {
    pub name: [u8; 22],
    pub length: u16,
    pub finetune: u8,
    pub volume: u8,
    pub rep_pos: u16,
    pub rep_len: u16,
}

#[derive(BinRead, Debug)]
#[br(big)]
struct Header {
    title: [u8; 20],
    samples: [SampleInfo; 31],
    song_length: u8,
    _magic1: u8,
    positions: [u8; 128],
    magic: [u8; 4],
}

/// How a tag identifies the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Kind {
    channels: u8,
    tracker: &'static str,
    /// 0 = Protracker instrument semantics, 1 = Fasttracker, 2 = Fasttracker
    /// with possible Imago Orpheus 16-bit samples.
    mod_type: u8,
    /// Startrekker; the 8-channel flavor stores each pattern as two
    /// 4-channel halves.
    trekker: bool,
}

fn check_type(id: &[u8; 4]) -> Option<Kind> {
    let kind = |channels, tracker, mod_type| Kind {
        channels,
        tracker,
        mod_type,
        trekker: false,
    };
    match id {
        b"M.K." | b"M!K!" => Some(kind(4, "Protracker", 0)),
        [b'F', b'L', b'T', d] | [b'E', b'X', b'O', d] if d.is_ascii_digit() => {
            let channels = d - b'0';
            (channels == 4 || channels == 8).then_some(Kind {
                trekker: true,
                ..kind(channels, "Startrekker", 1)
            })
        }
        b"OKTA" => Some(kind(8, "Oktalyzer", 1)),
        b"CD81" => Some(kind(8, "Oktalyser", 1)),
        [d, b'C', b'H', b'N'] if d.is_ascii_digit() => Some(kind(d - b'0', "Fasttracker", 1)),
        [d1, d2, b'C', last @ (b'H' | b'N')] if d1.is_ascii_digit() && d2.is_ascii_digit() => {
            let channels = (d1 - b'0') * 10 + (d2 - b'0');
            if channels as usize > um_ir::MAX_CHANNELS {
                None
            } else if *last == b'H' {
                Some(kind(channels, "Fasttracker", 2))
            } else {
                Some(kind(channels, "TakeTracker", 1))
            }
        }
        _ => None,
    }
}

/// One packed 4-byte pattern cell.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Cell {
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
}

impl Cell {
    pub fn period(&self) -> u16 {
        (((self.a & 0xf) as u16) << 8) | self.b as u16
    }
}

pub(crate) fn read_cells(r: &mut dyn ByteReader, buf: &mut [Cell]) {
    for cell in buf {
        let [a, b, c, d] = read_array::<4>(r);
        *cell = Cell { a, b, c, d };
    }
}

#[derive(Debug, Default)]
pub struct ModLoader {
    patbuf: Vec<Cell>,
}

impl ModLoader {
    fn convert_note(
        of: &mut ModuleBuilder,
        samples: &[SampleInfo; 31],
        mod_type: u8,
        n: Cell,
        last_effect: u8,
    ) -> u8 {
        let instrument = (n.a & 0x10) | (n.c >> 4);
        let period = n.period();
        let mut effect = n.c & 0xf;
        let mut dat = n.d;
        let note = periods::period_to_note(period);

        if instrument != 0 {
            let exists = instrument <= 31 && samples[instrument as usize - 1].length != 0;
            if !exists {
                // unknown instrument cuts the note
                of.pt_effect(0xc, 0);
                if effect == 0xc {
                    effect = 0;
                    dat = 0;
                }
            } else if mod_type == 0 {
                if note != 0 || effect != 0 || dat != 0 {
                    of.uni.instrument(instrument - 1);
                } else {
                    let vol = samples[instrument as usize - 1].volume & 0x7f;
                    of.pt_effect(0xc, vol);
                }
            } else {
                of.uni.instrument(instrument - 1);
            }
        }
        if note != 0 {
            of.uni.note(note + 2 * periods::OCTAVE as u8 - 1);
        }

        dat = pt_param(effect, dat);

        // a lone 100, 200 or 300 has no memory to draw on in MOD files
        if dat == 0 && matches!(effect, 1..=3) && last_effect < NO_EFFECT && effect != last_effect {
            effect = 0;
        }

        of.pt_effect(effect, dat);
        if effect == 8 {
            of.flags.insert(ModuleFlags::PANNING);
        }
        effect
    }

    fn convert_track(
        of: &mut ModuleBuilder,
        samples: &[SampleInfo; 31],
        mod_type: u8,
        cells: &[Cell],
        start: usize,
        stride: usize,
        track: usize,
    ) -> Result<(), ModError> {
        of.uni.reset();
        let mut last_effect = NO_EFFECT;
        for row in 0..ROWS {
            let cell = cells[start + row * stride];
            last_effect = Self::convert_note(of, samples, mod_type, cell, last_effect);
            of.uni.newline();
        }
        of.store_track(track)
    }

    fn load_patterns(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        samples: &[SampleInfo; 31],
        kind: Kind,
    ) -> Result<(), ModError> {
        of.alloc_patterns()?;
        of.alloc_tracks()?;

        let channels = of.num_channels as usize;
        let mut track = 0;
        if kind.trekker && channels == 8 {
            self.patbuf = vec![Cell::default(); ROWS * 4];
            for _ in 0..of.num_patterns {
                for _half in 0..2 {
                    read_cells(r, &mut self.patbuf);
                    for s in 0..4 {
                        Self::convert_track(of, samples, kind.mod_type, &self.patbuf, s, 4, track)?;
                        track += 1;
                    }
                }
            }
        } else {
            self.patbuf = vec![Cell::default(); ROWS * channels];
            for _ in 0..of.num_patterns {
                read_cells(r, &mut self.patbuf);
                for s in 0..channels {
                    Self::convert_track(
                        of,
                        samples,
                        kind.mod_type,
                        &self.patbuf,
                        s,
                        channels,
                        track,
                    )?;
                    track += 1;
                }
            }
        }
        if r.eof() {
            return Err(ModError::LoadingPattern);
        }
        Ok(())
    }
}

impl Loader for ModLoader {
    fn tag(&self) -> &'static str {
        "MOD"
    }

    fn description(&self) -> &'static str {
        "Standard module"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        r.seek_to(std::io::SeekFrom::Start(HEADER_SIZE));
        let id = read_array::<4>(r);
        !r.eof() && check_type(&id).is_some()
    }

    fn load(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        curious: bool,
    ) -> Result<(), ModError> {
        let mut mh: Header = read_struct(r)?;
        let song_length = mh.song_length.min(128);

        of.initial_speed = 6;
        of.initial_tempo = 125;
        let Some(mut kind) = check_type(&mh.magic) else {
            return Err(ModError::NotAModule);
        };
        of.num_channels = kind.channels;
        if kind.trekker && kind.channels == 8 && mh.positions.iter().any(|p| p & 1 != 0) {
            // dual patterns come in pairs
            return Err(ModError::LoadingHeader);
        }
        if kind.trekker && kind.channels == 8 {
            for p in mh.positions.iter_mut() {
                *p >>= 1;
            }
        }
        of.title = dup_str(&mh.title, true);
        of.num_positions = song_length as u16;
        of.restart_position = 0;

        let mut max_pattern = mh.positions[..song_length as usize]
            .iter()
            .copied()
            .max()
            .unwrap_or(0);

        // some old modules keep extra patterns past the song end; they
        // must be counted to find the sample data, unless the rest of the
        // list is garbage
        let tail = &mh.positions[song_length as usize..];
        if tail.iter().all(|&p| p < 0x80) {
            for (t, &p) in tail.iter().enumerate() {
                max_pattern = max_pattern.max(p);
                if curious && p != 0 {
                    of.num_positions = (song_length as usize + t + 1) as u16;
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

        of.num_instruments = 31;
        of.num_samples = 31;
        of.alloc_samples()?;
        for (q, s) in of.samples.iter_mut().zip(mh.samples.iter()) {
            q.name = dup_str(&s.name, true);
            q.speed = periods::FINETUNE[(s.finetune & 0xf) as usize] as u32;
            q.volume = s.volume & 0x7f;
            q.loop_start = (s.rep_pos as u32) << 1;
            q.loop_end = q.loop_start + ((s.rep_len as u32) << 1);
            q.length = (s.length as u32) << 1;
            q.flags = SampleFlags::SIGNED;
            if kind.mod_type == 2 && s.volume & 0x80 != 0 {
                // Imago Orpheus writes 16-bit samples this way
                q.flags |= SampleFlags::BITS16;
                kind.tracker = "Imago Orpheus (MOD format)";
            }
            if s.rep_len > 2 {
                q.flags |= SampleFlags::LOOP;
            }
        }
        of.format = kind.tracker.to_string();
        log::debug!(
            "[MOD] {} channels, {} patterns, {}",
            of.num_channels,
            of.num_patterns,
            of.format
        );

        self.load_patterns(r, of, &mh.samples, kind)
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
    fn tags() {
        assert_eq!(check_type(b"M.K.").unwrap().channels, 4);
        assert_eq!(check_type(b"6CHN").unwrap().channels, 6);
        assert_eq!(check_type(b"16CH").unwrap().mod_type, 2);
        assert_eq!(check_type(b"12CN").unwrap().tracker, "TakeTracker");
        assert!(check_type(b"FLT8").unwrap().trekker);
        assert!(check_type(b"FLT6").is_none());
        assert!(check_type(b"XXXX").is_none());
    }

    #[test]
    fn channel_tags_past_the_channel_limit_are_rejected() {
        assert_eq!(check_type(b"64CH").unwrap().channels, 64);
        assert!(check_type(b"65CH").is_none());
        assert!(check_type(b"99CN").is_none());
    }
}
