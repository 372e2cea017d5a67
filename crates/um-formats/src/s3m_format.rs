//! Scream Tracker 3 module parser.
//!
//! Header at 0, "SCRM" at 0x2c. Instruments and patterns are addressed by
//! 16-bit paragraph pointers; patterns are packed per row with a channel
//! byte whose high bits say which fields follow.

use std::io::SeekFrom;

use binrw::BinRead;
use um_ir::{periods, ModError, ModuleBuilder, ModuleFlags, SampleFlags};

use crate::common::dup_str;
use crate::effects::{S3mItState, OLDSTYLE, SCREAM};
use crate::loader::Loader;
use crate::reader::{read_array, read_struct, ByteReader};

const ROWS: usize = 64;
const CHANNELS: usize = 32;

#[derive(BinRead, Debug)]
#[br(little)]
pub(crate) struct Header {
    pub title: [u8; 28],
    _t1a: u8,
    _kind: u8,
    _unused1: [u8; 2],
    pub ord_num: u16,
    pub ins_num: u16,
    pub pat_num: u16,
    pub flags: u16,
    pub tracker: u16,
    pub file_format: u16,
    pub scrm: [u8; 4],
    pub master_vol: u8,
    pub init_speed: u8,
    pub init_tempo: u8,
    _master_mult: u8,
    _ultra_click: u8,
    pub pan_table: u8,
    _unused2: [u8; 8],
    _special: u16,
    pub channels: [u8; 32],
}

#[derive(BinRead, Debug)]
#[br(little)]
pub(crate) struct SampleHeader {
    _kind: u8,
    _filename: [u8; 12],
    pub mem_seg_hi: u8,
    pub mem_seg_lo: u16,
    pub length: u32,
    pub loop_begin: u32,
    pub loop_end: u32,
    pub volume: u8,
    _dsk: u8,
    _pack: u8,
    pub flags: u8,
    pub c2spd: u32,
    _unused: [u8; 12],
    pub name: [u8; 28],
    pub scrs: [u8; 4],
}

impl SampleHeader {
    pub fn seek_pos(&self) -> u64 {
        (((self.mem_seg_hi as u64) << 16) | self.mem_seg_lo as u64) << 4
    }
}

/// One unpacked pattern cell. 255 means "empty" in every field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Note {
    pub note: u8,
    pub ins: u8,
    pub vol: u8,
    pub cmd: u8,
    pub inf: u8,
}

impl Note {
    pub const EMPTY: Note = Note {
        note: 255,
        ins: 255,
        vol: 255,
        cmd: 255,
        inf: 255,
    };
}

/// Tracker name and version string from the `tracker` header field.
fn tracker_name(tracker: u16) -> String {
    const NAMES: [&str; 4] = [
        "Screamtracker",
        "Imago Orpheus",
        "Impulse Tracker",
        "Unknown tracker",
    ];
    let id = (tracker >> 12) as usize;
    let version = format!(
        "{}.{}{}",
        (tracker >> 8) & 0xf,
        (tracker >> 4) & 0xf,
        tracker & 0xf
    );
    match id {
        1 => format!("{} {version}", NAMES[0]),
        2 | 3 if tracker >= 0x3217 => "Impulse Tracker 2.14p4 (S3M format)".to_string(),
        2 | 3 if tracker >= 0x3216 => "Impulse Tracker 2.14p3 (S3M format)".to_string(),
        2 | 3 => format!("{} {version} (S3M format)", NAMES[id - 1]),
        _ => format!("{} {version} (S3M format)", NAMES[3]),
    }
}

/// Mark the channels a packed pattern uses. The reader must sit on the
/// first packed byte.
pub(crate) fn scan_channels(
    r: &mut dyn ByteReader,
    channel_settings: &[u8; 32],
    used: &mut [bool; 32],
) -> Result<(), ModError> {
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
        if channel_settings[ch] < 32 {
            used[ch] = true;
        }
        if flag & 32 != 0 {
            r.skip(2);
        }
        if flag & 64 != 0 {
            r.skip(1);
        }
        if flag & 128 != 0 {
            r.skip(2);
        }
    }
    Ok(())
}

/// Unpack one pattern into `buf` (`CHANNELS * ROWS`, channel-major).
pub(crate) fn read_pattern(
    r: &mut dyn ByteReader,
    remap: &[Option<u8>; 64],
    buf: &mut [Note],
) -> Result<(), ModError> {
    buf.fill(Note::EMPTY);
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
        let mut dummy = Note::EMPTY;
        let n = match remap[(flag & 31) as usize] {
            Some(ch) => &mut buf[ch as usize * ROWS + row],
            None => &mut dummy,
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

#[derive(Debug, Default)]
pub struct S3mLoader {
    buf: Vec<Note>,
    state: S3mItState,
}

impl S3mLoader {
    fn convert_track(&mut self, of: &mut ModuleBuilder, channel: usize, style: u8) {
        of.uni.reset();
        for row in 0..ROWS {
            let n = self.buf[channel * ROWS + row];
            let mut vol = n.vol;
            if n.ins != 0 && n.ins != 255 {
                of.uni.instrument(n.ins - 1);
            }
            if n.note != 255 {
                if n.note == 254 {
                    // note cut
                    of.pt_effect(0xc, 0);
                    vol = 255;
                } else {
                    of.uni
                        .note((n.note >> 4) * periods::OCTAVE as u8 + (n.note & 0xf));
                }
            }
            if vol < 255 {
                of.pt_effect(0xc, vol);
            }
            self.state.process_cmd(of, n.cmd, n.inf, style);
            of.uni.newline();
        }
    }
}

impl Loader for S3mLoader {
    fn tag(&self) -> &'static str {
        "S3M"
    }

    fn description(&self) -> &'static str {
        "Scream Tracker 3"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        r.seek_to(SeekFrom::Start(0x2c));
        let id = read_array::<4>(r);
        !r.eof() && &id == b"SCRM"
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

        of.format = tracker_name(mh.tracker);
        of.title = dup_str(&mh.title, false);
        of.num_patterns = mh.pat_num;
        of.restart_position = 0;
        of.num_instruments = mh.ins_num;
        of.num_samples = mh.ins_num;
        of.initial_speed = mh.init_speed;
        of.initial_tempo = mh.init_tempo as u16;
        of.initial_volume = mh.master_vol << 1;
        of.flags |= ModuleFlags::ARPMEM | ModuleFlags::PANNING;
        if mh.tracker == 0x1300 || mh.flags & 64 != 0 {
            of.flags |= ModuleFlags::S3M_SLIDES;
        }
        of.bpm_limit = 32;

        of.alloc_positions(mh.ord_num as usize)?;
        self.state.orig_positions = r
            .read_vec(mh.ord_num as usize)
            .into_iter()
            .map(|p| if p as u16 >= mh.pat_num && p < 254 { 255 } else { p })
            .collect();
        if r.eof() {
            return Err(ModError::LoadingHeader);
        }
        self.state.create_orders(of, curious);
        if of.num_positions == 0 {
            return Err(ModError::LoadingHeader);
        }

        let para_count = mh.ins_num as usize + mh.pat_num as usize;
        let para: Vec<u16> = (0..para_count).map(|_| r.read_u16_le()).collect();
        let pan = if mh.pan_table == 252 {
            Some(read_array::<32>(r))
        } else {
            None
        };
        if r.eof() {
            return Err(ModError::LoadingHeader);
        }

        of.alloc_samples()?;
        for t in 0..mh.ins_num as usize {
            r.seek_to(SeekFrom::Start((para[t] as u64) << 4));
            let s: SampleHeader =
                read_struct(r).map_err(|_| ModError::LoadingSampleInfo)?;
            let q = &mut of.samples[t];
            q.name = dup_str(&s.name, false);
            q.speed = s.c2spd;
            // Scream Tracker caps samples at 64000 bytes
            q.length = s.length.min(64000);
            q.loop_start = s.loop_begin;
            q.loop_end = s.loop_end;
            q.volume = s.volume;
            q.seek_pos = s.seek_pos();
            if s.flags & 1 != 0 {
                q.flags |= SampleFlags::LOOP;
            }
            if s.flags & 4 != 0 {
                q.flags |= SampleFlags::BITS16;
            }
            if mh.file_format == 1 {
                q.flags |= SampleFlags::SIGNED;
            }
            if &s.scrs != b"SCRS" {
                q.length = 0;
            }
        }

        // Many files declare 16 or more channels but use far fewer.
        let pattern_start = |t: usize| ((para[mh.ins_num as usize + t] as u64) << 4) + 2;
        let mut used = [false; 32];
        for t in 0..mh.pat_num as usize {
            r.seek_to(SeekFrom::Start(pattern_start(t)));
            scan_channels(r, &mh.channels, &mut used)?;
        }
        of.num_channels = 0;
        for (t, &u) in used.iter().enumerate() {
            if u {
                self.state.remap[t] = Some(of.num_channels);
                of.num_channels += 1;
            }
        }

        for t in 0..CHANNELS {
            if let (Some(ch), true) = (self.state.remap[t], mh.channels[t] < 32) {
                of.panning[ch as usize] = if mh.channels[t] < 8 { 0x30 } else { 0xc0 };
            }
        }
        if let Some(pan) = pan {
            for t in 0..CHANNELS {
                if let (Some(ch), true) = (self.state.remap[t], mh.channels[t] < 32) {
                    if pan[t] & 0x20 != 0 {
                        of.panning[ch as usize] = ((pan[t] & 0xf) << 4) as i16;
                    }
                }
            }
        }

        of.set_track_count()?;
        of.alloc_tracks()?;
        of.alloc_patterns()?;
        log::debug!(
            "[S3M] {} ({} channels used)",
            of.format,
            of.num_channels
        );

        let style = if mh.tracker >> 12 == 1 {
            OLDSTYLE | SCREAM
        } else {
            OLDSTYLE
        };
        let mut track = 0;
        for t in 0..mh.pat_num as usize {
            r.seek_to(SeekFrom::Start(pattern_start(t)));
            read_pattern(r, &self.state.remap, &mut self.buf)?;
            for ch in 0..of.num_channels as usize {
                self.convert_track(of, ch, style);
                of.store_track(track)?;
                track += 1;
            }
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.buf = Vec::new();
        self.state = S3mItState::new();
    }

    fn load_title(&self, r: &mut dyn ByteReader) -> Option<String> {
        let title = read_array::<28>(r);
        (!r.eof()).then(|| dup_str(&title, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_names() {
        assert_eq!(tracker_name(0x1320), "Screamtracker 3.20");
        assert_eq!(tracker_name(0x2104), "Imago Orpheus 1.04 (S3M format)");
        assert_eq!(tracker_name(0x3214), "Impulse Tracker 2.14 (S3M format)");
        assert_eq!(tracker_name(0x3217), "Impulse Tracker 2.14p4 (S3M format)");
        assert_eq!(tracker_name(0x0000), "Unknown tracker 0.00 (S3M format)");
    }
}
