//! Impulse Tracker module parser.
//!
//! Instruments, samples and patterns are located through 32-bit absolute
//! pointers following the order list. Patterns use a per-channel mask
//! scheme where a channel can repeat its previous note, instrument,
//! volume or command without storing it again.

use std::io::SeekFrom;

use binrw::BinRead;
use um_ir::{
    DuplicateAction, DuplicateCheck, Envelope, EnvelopeFlags, InstrumentFlags, ModError,
    ModuleBuilder, ModuleFlags, NewNoteAction, SampleFlags, VolEffect, INSTNOTES,
    PAN_CENTER, PAN_SURROUND,
};

use crate::common::{dup_str, read_comment};
use crate::effects::{S3mItState, IT, OLDSTYLE};
use crate::loader::Loader;
use crate::reader::{read_array, read_struct, ByteReader};

const MAX_ROWS: usize = 256;
const MAX_CHANNELS: usize = 64;
const ENV_NODES: usize = 25;

/// Portamento speeds selectable from the volume column.
const PORTA_TABLE: [u8; 10] = [0, 1, 4, 8, 16, 32, 64, 96, 128, 255];

#[derive(BinRead, Debug)]
#[br(little, magic = b"IMPM")]
struct Header {
    title: [u8; 26],
    _blank01: [u8; 2],
    ord_num: u16,
    ins_num: u16,
    smp_num: u16,
    pat_num: u16,
    cwt: u16,
    cmwt: u16,
    flags: u16,
    special: u16,
    global_vol: u8,
    _mix_vol: u8,
    init_speed: u8,
    init_tempo: u8,
    _pan_sep: u8,
    _zero: u8,
    msg_length: u16,
    msg_offset: u32,
    _blank02: [u8; 4],
    pan_table: [u8; 64],
    vol_table: [u8; 64],
}

/// Sample header following the "IMPS" tag.
#[derive(BinRead, Debug)]
#[br(little)]
struct SampleHeader {
    _filename: [u8; 12],
    _zero: u8,
    global_vol: u8,
    flag: u8,
    volume: u8,
    name: [u8; 26],
    convert: u8,
    panning: u8,
    length: u32,
    loop_begin: u32,
    loop_end: u32,
    c5spd: u32,
    sus_begin: u32,
    sus_end: u32,
    offset: u32,
    vib_speed: u8,
    vib_depth: u8,
    vib_rate: u8,
    vib_wave: u8,
}

/// One envelope as stored by IT 2.x.
#[derive(Clone, Debug, Default)]
struct RawEnvelope {
    flags: u8,
    points: u8,
    begin: u8,
    end: u8,
    sus_begin: u8,
    sus_end: u8,
    nodes: [(i16, u16); ENV_NODES],
}

fn read_envelope(r: &mut dyn ByteReader, signed: bool) -> RawEnvelope {
    let mut env = RawEnvelope {
        flags: r.read_u8(),
        points: r.read_u8(),
        begin: r.read_u8(),
        end: r.read_u8(),
        sus_begin: r.read_u8(),
        sus_end: r.read_u8(),
        ..RawEnvelope::default()
    };
    for node in env.nodes.iter_mut() {
        let val = if signed {
            r.read_i8() as i16
        } else {
            r.read_u8() as i16
        };
        *node = (val, r.read_u16_le());
    }
    r.read_u8();
    env
}

/// Convert a stored envelope, mapping node values through `value`.
fn build_envelope(raw: &RawEnvelope, value: impl Fn(i16) -> i16) -> Envelope {
    let mut env = Envelope::default();
    if raw.flags & 1 != 0 {
        env.flags |= EnvelopeFlags::ON;
    }
    if raw.flags & 2 != 0 {
        env.flags |= EnvelopeFlags::LOOP;
    }
    if raw.flags & 4 != 0 {
        env.flags |= EnvelopeFlags::SUSTAIN;
    }
    env.loop_begin = raw.begin;
    env.loop_end = raw.end;
    env.sustain_begin = raw.sus_begin;
    env.sustain_end = raw.sus_end;
    for &(val, tick) in raw.nodes.iter().take(raw.points as usize) {
        env.push(tick as i16, value(val));
    }
    env.disable_if_degenerate();
    env
}

/// Keep the alphanumeric characters of a MIDI macro string, uppercased.
fn midi_string(r: &mut dyn ByteReader) -> Vec<u8> {
    let raw = read_array::<32>(r);
    raw.iter()
        .take_while(|&&c| c != 0)
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Decode a "F0F00n" filter macro: returns the filter type.
fn filter_macro(line: &[u8]) -> Option<u8> {
    if line.len() >= 6 && line.starts_with(b"F0F00") && matches!(line[5], b'0' | b'1') {
        Some((line[5] - b'0') | 0x80)
    } else {
        None
    }
}

/// Read the MIDI configuration embedded after the pointer tables.
fn load_midi_config(r: &mut dyn ByteReader, state: &mut S3mItState) {
    state.filter_macros = [0; 16];
    state.filter_settings = [Default::default(); 256];

    let extra = r.read_u16_le() as i64;
    r.skip(8 * extra + 0x120);
    for i in 0..16 {
        if let Some(filter) = filter_macro(&midi_string(r)) {
            state.filter_macros[i] = filter;
        }
    }
    for i in 0x80..0x100 {
        let line = midi_string(r);
        if let Some(filter) = filter_macro(&line) {
            let digit = |c: Option<&u8>| c.map(|&c| c.wrapping_sub(b'0'));
            let mut dat = digit(line.get(6)).unwrap_or(0);
            if let Some(lo) = digit(line.get(7)) {
                dat = (dat << 4) | lo;
            }
            state.filter_settings[i].filter = filter;
            state.filter_settings[i].inf = dat;
        }
    }
    state.select_first_macro();
}

fn format_name(cwt: u16, cmwt: u16) -> String {
    let prefix = if cmwt < 0x214 { "" } else { "Compressed " };
    if (0x217..=0x219).contains(&cwt) {
        format!("{prefix}ImpulseTracker 2.14p4")
    } else if cwt >= 0x215 {
        format!("{prefix}ImpulseTracker 2.14p3")
    } else {
        format!(
            "{prefix}ImpulseTracker {}.{}{}",
            cwt >> 8,
            (cwt >> 4) & 0xf,
            cwt & 0xf
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Note {
    note: u8,
    ins: u8,
    volpan: u8,
    cmd: u8,
    inf: u8,
}

impl Note {
    const EMPTY: Note = Note {
        note: 255,
        ins: 255,
        volpan: 255,
        cmd: 255,
        inf: 255,
    };
}

#[derive(Debug, Default)]
pub struct ItLoader {
    pattern: Vec<Note>,
    mask: Vec<u8>,
    last: Vec<Note>,
    state: S3mItState,
    old_effect: u8,
}

impl ItLoader {
    /// Mark the channels a pattern of `rows` rows uses.
    fn scan_channels(&mut self, r: &mut dyn ByteReader, rows: usize) -> Result<(), ModError> {
        let mut row = 0;
        while row < rows {
            let flag = r.read_u8();
            if r.eof() {
                return Err(ModError::LoadingPattern);
            }
            if flag == 0 {
                row += 1;
                continue;
            }
            let ch = ((flag - 1) & 63) as usize;
            self.state.remap[ch] = Some(0);
            if flag & 128 != 0 {
                self.mask[ch] = r.read_u8();
            }
            let m = self.mask[ch];
            let skip = (m & 1 != 0) as i64
                + (m & 2 != 0) as i64
                + (m & 4 != 0) as i64
                + 2 * (m & 8 != 0) as i64;
            r.skip(skip);
        }
        Ok(())
    }

    fn read_pattern(
        &mut self,
        r: &mut dyn ByteReader,
        rows: usize,
        channels: usize,
    ) -> Result<(), ModError> {
        self.pattern.fill(Note::EMPTY);
        let mut row = 0;
        while row < rows {
            let flag = r.read_u8();
            if r.eof() {
                return Err(ModError::LoadingPattern);
            }
            if flag == 0 {
                row += 1;
                continue;
            }
            let raw = ((flag - 1) & 63) as usize;
            if flag & 128 != 0 {
                self.mask[raw] = r.read_u8();
            }
            let m = self.mask[raw];

            let mut dummy_n = Note::EMPTY;
            let mut dummy_l = Note::EMPTY;
            let (n, l) = match self.state.remap[raw] {
                Some(ch) => (
                    &mut self.pattern[row * channels + ch as usize],
                    &mut self.last[ch as usize],
                ),
                None => (&mut dummy_n, &mut dummy_l),
            };

            if m & 1 != 0 {
                let mut note = r.read_u8();
                if note == 255 {
                    // IT note off
                    note = 253;
                }
                n.note = note;
                l.note = note;
            }
            if m & 2 != 0 {
                n.ins = r.read_u8();
                l.ins = n.ins;
            }
            if m & 4 != 0 {
                n.volpan = r.read_u8();
                l.volpan = n.volpan;
            }
            if m & 8 != 0 {
                n.cmd = r.read_u8();
                n.inf = r.read_u8();
                l.cmd = n.cmd;
                l.inf = n.inf;
            }
            if m & 16 != 0 {
                n.note = l.note;
            }
            if m & 32 != 0 {
                n.ins = l.ins;
            }
            if m & 64 != 0 {
                n.volpan = l.volpan;
            }
            if m & 128 != 0 {
                n.cmd = l.cmd;
                n.inf = l.inf;
            }
        }
        Ok(())
    }

    fn volume_column(of: &mut ModuleBuilder, volpan: u8) -> Result<(), ModError> {
        let uni = &mut of.uni;
        match volpan {
            0..=64 => uni.vol_effect(VolEffect::Volume, volpan),
            65 | 75 => uni.vol_effect(VolEffect::VolSlide, 0),
            66..=74 => uni.vol_effect(VolEffect::VolSlide, 0x0f + ((volpan - 65) << 4)),
            76..=84 => uni.vol_effect(VolEffect::VolSlide, 0xf0 + (volpan - 75)),
            85..=94 => uni.vol_effect(VolEffect::VolSlide, (volpan - 85) << 4),
            95..=104 => uni.vol_effect(VolEffect::VolSlide, volpan - 95),
            105..=114 => uni.vol_effect(VolEffect::PitchSlideDown, volpan - 105),
            115..=124 => uni.vol_effect(VolEffect::PitchSlideUp, volpan - 115),
            125..=127 => return Err(ModError::LoadingPattern),
            128..=192 => {
                let pan = volpan - 128;
                uni.vol_effect(VolEffect::Panning, if pan == 64 { 255 } else { pan << 2 });
            }
            193..=202 => uni.vol_effect(VolEffect::Portamento, PORTA_TABLE[(volpan - 193) as usize]),
            203..=212 => uni.vol_effect(VolEffect::Vibrato, volpan - 203),
            239 | 255 => {}
            _ => return Err(ModError::LoadingPattern),
        }
        Ok(())
    }

    fn convert_track(
        &mut self,
        of: &mut ModuleBuilder,
        channel: usize,
        channels: usize,
        rows: usize,
    ) -> Result<(), ModError> {
        of.uni.reset();
        for row in 0..rows {
            let n = self.pattern[row * channels + channel];
            let mut volpan = n.volpan;
            match n.note {
                255 => {}
                253 => of.uni.key_off(),
                254 => {
                    of.pt_effect(0xc, 255);
                    volpan = 255;
                }
                note => of.uni.note(note),
            }
            match n.ins {
                1..=99 => of.uni.instrument(n.ins - 1),
                253 => of.uni.key_off(),
                255 => {}
                _ => return Err(ModError::LoadingPattern),
            }
            Self::volume_column(of, volpan)?;
            self.state.process_cmd(of, n.cmd, n.inf, self.old_effect | IT);
            of.uni.newline();
        }
        Ok(())
    }
}

impl Loader for ItLoader {
    fn tag(&self) -> &'static str {
        "IT"
    }

    fn description(&self) -> &'static str {
        "Impulse Tracker"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        let id = read_array::<4>(r);
        !r.eof() && &id == b"IMPM"
    }

    fn init(&mut self) -> Result<(), ModError> {
        self.pattern = vec![Note::EMPTY; MAX_ROWS * MAX_CHANNELS];
        self.last = vec![Note::EMPTY; MAX_CHANNELS];
        self.mask = vec![0; MAX_CHANNELS];
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

        of.title = dup_str(&mh.title, false);
        of.restart_position = 0;
        of.num_patterns = mh.pat_num;
        of.num_instruments = mh.ins_num;
        of.num_samples = mh.smp_num;
        of.initial_speed = mh.init_speed;
        of.initial_tempo = mh.init_tempo as u16;
        of.initial_volume = mh.global_vol;
        of.flags |= ModuleFlags::BG_SLIDES | ModuleFlags::ARPMEM;
        if mh.flags & 1 == 0 {
            of.flags |= ModuleFlags::PANNING;
        }
        of.bpm_limit = 32;

        // the last title byte holds a voice limit
        if mh.title[25] != 0 {
            of.num_voices = mh.title[25].saturating_add(1);
        }
        of.format = format_name(mh.cwt, mh.cmwt);
        if mh.flags & 8 != 0 {
            of.flags |= ModuleFlags::XM_PERIODS | ModuleFlags::LINEAR;
        }
        self.old_effect = if mh.cwt >= 0x106 && mh.flags & 16 != 0 {
            OLDSTYLE
        } else {
            0
        };

        if mh.flags & 1 != 0 {
            for (t, &p) in mh.pan_table.iter().enumerate() {
                of.panning[t] = match p & 0x7f {
                    p @ 0..=63 => (p << 2) as i16,
                    64 => 255,
                    100 => PAN_SURROUND,
                    127 => PAN_CENTER,
                    _ => return Err(ModError::LoadingHeader),
                };
            }
        } else {
            of.panning = [PAN_CENTER; 64];
        }
        of.channel_volume = mh.vol_table;

        of.alloc_positions(mh.ord_num as usize)?;
        self.state.orig_positions = r
            .read_vec(mh.ord_num as usize)
            .into_iter()
            .map(|p| if p as u16 > mh.pat_num && p < 254 { 255 } else { p })
            .collect();
        if r.eof() {
            return Err(ModError::LoadingHeader);
        }
        self.state.create_orders(of, curious);
        if of.num_positions == 0 {
            return Err(ModError::LoadingHeader);
        }

        let ins_num = mh.ins_num as usize;
        let smp_num = mh.smp_num as usize;
        let pat_num = mh.pat_num as usize;
        let para: Vec<u32> = (0..ins_num + smp_num + pat_num)
            .map(|_| r.read_u32_le())
            .collect();
        if r.eof() {
            return Err(ModError::LoadingHeader);
        }

        if mh.cmwt >= 0x216 {
            if mh.special & 8 != 0 {
                load_midi_config(r, &mut self.state);
                if r.eof() {
                    return Err(ModError::LoadingHeader);
                }
            } else {
                self.state.default_filters();
            }
            self.state.filters = true;
        }

        if mh.special & 1 != 0 && mh.cwt >= 0x104 && mh.msg_length > 0 {
            r.seek_to(SeekFrom::Start(mh.msg_offset as u64));
            of.comment = read_comment(r, mh.msg_length as usize);
        }

        if mh.flags & 4 == 0 {
            of.num_instruments = of.num_samples;
        }
        of.alloc_samples()?;

        for t in 0..smp_num {
            r.seek_to(SeekFrom::Start(para[ins_num + t] as u64 + 4));
            let s: SampleHeader = read_struct(r).map_err(|_| ModError::LoadingSampleInfo)?;
            if s.c5spd > 0x7ffff || s.length > 0xfff_ffff {
                return Err(ModError::LoadingSampleInfo);
            }
            if s.flag & 16 != 0 && (s.loop_begin > 0xfff_ffff || s.loop_end > 0xfff_ffff) {
                return Err(ModError::LoadingSampleInfo);
            }

            let speed = if of.flags.contains(ModuleFlags::LINEAR) {
                of.speed_to_finetune(s.c5spd, t)
            } else {
                s.c5spd / 2
            };
            let q = &mut of.samples[t];
            q.name = dup_str(&s.name, false);
            q.speed = speed;
            q.panning = if s.panning & 127 == 64 {
                255
            } else {
                ((s.panning & 127) as i16) << 2
            };
            q.length = s.length;
            q.loop_start = s.loop_begin;
            q.loop_end = s.loop_end;
            q.sustain_start = s.sus_begin;
            q.sustain_end = s.sus_end;
            q.volume = s.volume;
            q.global_volume = s.global_vol;
            q.seek_pos = s.offset as u64;

            if s.panning & 128 != 0 {
                q.flags |= SampleFlags::OWN_PAN;
            }
            if s.vib_rate != 0 {
                q.vibrato.it_style = true;
                q.vibrato.waveform = s.vib_wave;
                q.vibrato.sweep = s.vib_rate.wrapping_mul(2);
                q.vibrato.depth = s.vib_depth;
                q.vibrato.rate = s.vib_speed;
            }
            if s.flag & 2 != 0 {
                q.flags |= SampleFlags::BITS16;
            }
            if s.flag & 8 != 0 && mh.cwt >= 0x214 {
                q.flags |= SampleFlags::ITPACKED;
            }
            if s.flag & 16 != 0 {
                q.flags |= SampleFlags::LOOP;
            }
            if s.flag & 32 != 0 {
                q.flags |= SampleFlags::SUSTAIN;
            }
            if s.flag & 64 != 0 {
                q.flags |= SampleFlags::BIDI;
            }
            if mh.cwt >= 0x200 {
                if s.convert & 1 != 0 {
                    q.flags |= SampleFlags::SIGNED;
                }
                if s.convert & 4 != 0 {
                    q.flags |= SampleFlags::DELTA;
                }
            }
        }

        if mh.flags & 4 != 0 {
            of.alloc_instruments()?;
            of.flags |= ModuleFlags::NNA | ModuleFlags::INST;
            for t in 0..ins_num {
                r.seek_to(SeekFrom::Start(para[t] as u64 + 4));
                self.load_instrument(r, of, t, mh.cwt)?;
            }
        } else if of.flags.contains(ModuleFlags::LINEAR) {
            of.alloc_instruments()?;
            of.flags |= ModuleFlags::INST;
            remap_linear_notes(of);
        }

        // Most files declare 64 channels and use far fewer.
        for t in 0..pat_num {
            let ptr = para[ins_num + smp_num + t];
            if ptr == 0 {
                continue;
            }
            r.seek_to(SeekFrom::Start(ptr as u64));
            r.read_u16_le();
            let rows = r.read_u16_le() as usize;
            if rows > MAX_ROWS {
                return Err(ModError::LoadingPattern);
            }
            r.read_u32_le();
            self.scan_channels(r, rows)?;
        }
        of.num_channels = 0;
        for slot in self.state.remap.iter_mut() {
            if slot.is_some() {
                *slot = Some(of.num_channels);
                of.num_channels += 1;
            }
        }
        of.set_track_count()?;
        if of.num_voices > 0 && of.num_voices < of.num_channels {
            of.num_voices = of.num_channels;
        }
        log::debug!(
            "[IT] {} ({} channels used, {} patterns)",
            of.format,
            of.num_channels,
            of.num_patterns
        );

        of.alloc_patterns()?;
        of.alloc_tracks()?;

        let channels = of.num_channels as usize;
        let mut track = 0;
        for t in 0..pat_num {
            let ptr = para[ins_num + smp_num + t];
            if ptr == 0 {
                // empty 64-row pattern
                of.pattern_rows[t] = 64;
                for _ in 0..channels {
                    of.uni.reset();
                    for _ in 0..64 {
                        of.uni.newline();
                    }
                    of.store_track(track)?;
                    track += 1;
                }
                continue;
            }
            r.seek_to(SeekFrom::Start(ptr as u64));
            r.read_u16_le();
            let rows = (r.read_u16_le() as usize).min(MAX_ROWS);
            of.pattern_rows[t] = rows as u16;
            r.read_u32_le();
            self.read_pattern(r, rows, channels)?;
            for ch in 0..channels {
                self.convert_track(of, ch, channels, rows)?;
                of.store_track(track)?;
                track += 1;
            }
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.pattern = Vec::new();
        self.last = Vec::new();
        self.mask = Vec::new();
        self.state = S3mItState::new();
    }

    fn load_title(&self, r: &mut dyn ByteReader) -> Option<String> {
        r.seek_to(SeekFrom::Start(4));
        let title = read_array::<26>(r);
        (!r.eof()).then(|| dup_str(&title, false))
    }
}

impl ItLoader {
    fn load_instrument(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        index: usize,
        cwt: u16,
    ) -> Result<(), ModError> {
        let old = cwt < 0x200;
        r.skip(12);
        r.read_u8();

        let d = &mut of.instruments[index];
        let mut old_vol_flags = 0;
        let (mut old_loop, mut old_sustain) = ((0, 0), (0, 0));
        let mut fadeout;
        let nna;
        let mut new_fields = [0u8; 8];
        let mut dnc = 0;
        if old {
            old_vol_flags = r.read_u8();
            old_loop = (r.read_u8(), r.read_u8());
            old_sustain = (r.read_u8(), r.read_u8());
            r.read_u16_le();
            fadeout = r.read_u16_le();
            nna = r.read_u8();
            dnc = r.read_u8();
        } else {
            nna = r.read_u8();
            new_fields[0] = r.read_u8(); // dct
            new_fields[1] = r.read_u8(); // dca
            fadeout = r.read_u16_le();
            for f in &mut new_fields[2..8] {
                // ppsep, ppcenter, globvol, chanpan, rvolvar, rpanvar
                *f = r.read_u8();
            }
        }
        r.read_u16_le();
        r.read_u8();
        r.read_u8();
        let name = read_array::<26>(r);
        r.skip(6);
        let mut sample_table = [0u16; INSTNOTES];
        for s in sample_table.iter_mut() {
            *s = r.read_u16_le();
        }

        let mut old_ticks = [0u8; ENV_NODES];
        let mut old_nodes = [0u8; ENV_NODES];
        let mut envs = None;
        if old {
            r.skip(200);
            for i in 0..ENV_NODES {
                old_ticks[i] = r.read_u8();
                old_nodes[i] = r.read_u8();
            }
        } else {
            let vol = read_envelope(r, false);
            let pan = read_envelope(r, true);
            let pit = read_envelope(r, true);
            envs = Some((vol, pan, pit));
        }
        if r.eof() {
            return Err(ModError::LoadingSampleInfo);
        }

        d.name = dup_str(&name, false);
        d.new_note_action = NewNoteAction::from_bits(nna);
        if old {
            fadeout <<= 6;
            d.fadeout = fadeout;
            if dnc != 0 {
                d.duplicate_check = DuplicateCheck::Note;
                d.duplicate_action = DuplicateAction::Cut;
            }
            let env = &mut d.volume_envelope;
            if old_vol_flags & 1 != 0 {
                env.flags |= EnvelopeFlags::ON;
            }
            if old_vol_flags & 2 != 0 {
                env.flags |= EnvelopeFlags::LOOP;
            }
            if old_vol_flags & 4 != 0 {
                env.flags |= EnvelopeFlags::SUSTAIN;
            }
            (env.loop_begin, env.loop_end) = old_loop;
            (env.sustain_begin, env.sustain_end) = old_sustain;
            if old_vol_flags & 1 != 0 {
                for i in 0..ENV_NODES {
                    if old_ticks[i] == 0xff {
                        break;
                    }
                    env.push(old_ticks[i] as i16, (old_nodes[i] as i16) << 2);
                }
            }
        } else if let Some((vol, pan, pit)) = envs {
            let [dct, dca, pp_sep, pp_center, global_vol, chan_pan, rvol, rpan] = new_fields;
            d.panning = if chan_pan & 127 == 64 {
                255
            } else {
                ((chan_pan & 127) as i16) << 2
            };
            if chan_pan & 128 == 0 {
                d.flags |= InstrumentFlags::OWN_PAN;
            }
            if pp_sep & 128 == 0 {
                d.pitch_pan_separation = pp_sep << 2;
                d.pitch_pan_center = pp_center;
                d.flags |= InstrumentFlags::PITCH_PAN;
            }
            d.global_volume = global_vol >> 1;
            d.fadeout = fadeout << 5;
            d.duplicate_check = DuplicateCheck::from_u8(dct);
            d.duplicate_action = DuplicateAction::from_u8(dca);
            if cwt >= 0x204 {
                d.random_volume = rvol;
                d.random_panning = rpan;
            }

            d.volume_envelope = build_envelope(&vol, |v| v << 2);
            d.panning_envelope = build_envelope(&pan, |v| if v == 32 { 255 } else { (v + 32) << 2 });
            d.pitch_envelope = build_envelope(&pit, |v| v + 32);
            if pit.flags & 0x80 != 0 {
                log::warn!("[IT] instrument {index}: filter envelopes are not supported");
                d.pitch_envelope.flags.remove(EnvelopeFlags::ON);
                d.pitch_envelope.points.clear();
                d.pitch_envelope.loop_begin = 0;
                d.pitch_envelope.loop_end = 0;
            }
        }
        d.volume_envelope.flags |= EnvelopeFlags::VOLENV;

        let num_samples = of.num_samples;
        let linear = of.flags.contains(ModuleFlags::LINEAR);
        for (u, &entry) in sample_table.iter().enumerate() {
            let sample = match entry >> 8 {
                0 => 0xffff,
                s => s - 1,
            };
            let mut note = (entry & 0xff) as u8;
            if sample >= num_samples {
                note = 255;
            } else if linear {
                let shifted = note as i32 + of.note_index(sample as usize);
                note = shifted.clamp(0, 255) as u8;
            }
            let d = &mut of.instruments[index];
            d.sample_number[u] = sample;
            d.sample_note[u] = note;
        }
        Ok(())
    }
}

/// Apply the linear finetune note offsets to identity instruments.
fn remap_linear_notes(of: &mut ModuleBuilder) {
    let num_samples = of.num_samples;
    for i in 0..of.instruments.len() {
        for u in 0..INSTNOTES {
            let sample = of.instruments[i].sample_number[u];
            let note = if sample >= num_samples {
                255
            } else {
                let shifted = of.instruments[i].sample_note[u] as i32 + of.note_index(sample as usize);
                shifted.clamp(0, 255) as u8
            };
            of.instruments[i].sample_note[u] = note;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_names() {
        assert_eq!(format_name(0x0214, 0x0200), "ImpulseTracker 2.14");
        assert_eq!(format_name(0x0214, 0x0214), "Compressed ImpulseTracker 2.14");
        assert_eq!(format_name(0x0216, 0x0200), "ImpulseTracker 2.14p3");
        assert_eq!(format_name(0x0217, 0x0214), "Compressed ImpulseTracker 2.14p4");
    }

    #[test]
    fn filter_macro_strings() {
        assert_eq!(filter_macro(b"F0F000Z"), Some(0x80));
        assert_eq!(filter_macro(b"F0F001Z"), Some(0x81));
        assert_eq!(filter_macro(b"F0F002Z"), None);
        assert_eq!(filter_macro(b"F0F0"), None);
    }

    #[test]
    fn volume_column_rejects_reserved_values() {
        let mut of = ModuleBuilder::new();
        of.uni.reset();
        assert_eq!(ItLoader::volume_column(&mut of, 126), Err(ModError::LoadingPattern));
        assert_eq!(ItLoader::volume_column(&mut of, 220), Err(ModError::LoadingPattern));
        assert!(ItLoader::volume_column(&mut of, 239).is_ok());
        assert!(ItLoader::volume_column(&mut of, 200).is_ok());
    }

    #[test]
    fn envelope_needs_two_points() {
        let mut raw = RawEnvelope {
            flags: 1,
            points: 1,
            ..RawEnvelope::default()
        };
        raw.nodes[0] = (32, 0);
        let env = build_envelope(&raw, |v| v << 2);
        assert!(!env.is_enabled());
        raw.points = 2;
        raw.nodes[1] = (64, 10);
        let env = build_envelope(&raw, |v| v << 2);
        assert!(env.is_enabled());
        assert_eq!(env.points[1].val, 256);
    }
}
