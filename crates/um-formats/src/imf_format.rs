//! Imago Orpheus (.IMF) module parser.

use binrw::BinRead;
use um_ir::{
    periods, Envelope, EnvelopeFlags, ModError, ModuleBuilder, ModuleFlags, Opcode, Sample,
    SampleFlags, INSTNOTES,
};

use crate::common::dup_str;
use crate::loader::Loader;
use crate::reader::{read_array, read_struct, ByteReader};

const CHANNELS: usize = 32;
const MAX_ROWS: usize = 256;
const NOTE_OFF: u8 = 0xa0;
const ENV_POINTS: usize = 16;

#[derive(BinRead, Debug)]
#[br(little)]
struct Channel {
    _name: [u8; 12],
    _chorus: u8,
    _reverb: u8,
    pan: u8,
    status: u8,
}

#[derive(BinRead, Debug)]
#[br(little)]
struct Header {
    title: [u8; 32],
    ord_num: u16,
    pat_num: u16,
    ins_num: u16,
    flags: u16,
    _unused1: [u8; 8],
    init_speed: u8,
    init_tempo: u8,
    master_vol: u8,
    _master_mult: u8,
    _unused2: [u8; 8],
    #[br(magic = b"IM10")]
    channels: [Channel; CHANNELS],
    orders: [u8; 256],
}

#[derive(BinRead, Debug)]
#[br(little)]
struct EnvInfo {
    points: u8,
    sustain: u8,
    begin: u8,
    end: u8,
    flags: u8,
    _unused: [u8; 3],
}

#[derive(BinRead, Debug)]
#[br(little)]
struct InstHeader {
    name: [u8; 32],
    note_map: [u8; INSTNOTES],
    _unused: [u8; 8],
    vol_env: [u16; ENV_POINTS * 2],
    pan_env: [u16; ENV_POINTS * 2],
    pitch_env: [u16; ENV_POINTS * 2],
    vol: EnvInfo,
    pan: EnvInfo,
    pitch: EnvInfo,
    fadeout: u16,
    num_samples: u16,
    id: [u8; 4],
}

#[derive(BinRead, Debug)]
#[br(little)]
struct SampleHeader {
    name: [u8; 13],
    _unused1: [u8; 3],
    length: u32,
    loop_start: u32,
    loop_end: u32,
    rate: u32,
    volume: u8,
    pan: u8,
    _unused2: [u8; 14],
    flags: u8,
    _unused3: [u8; 11],
    id: [u8; 4],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Note {
    note: u8,
    ins: u8,
    eff1: u8,
    dat1: u8,
    eff2: u8,
    dat2: u8,
}

impl Note {
    const EMPTY: Note = Note {
        note: 255,
        ins: 255,
        eff1: 255,
        dat1: 255,
        eff2: 255,
        dat2: 255,
    };
}

fn build_envelope(nodes: &[u16; ENV_POINTS * 2], info: &EnvInfo) -> Envelope {
    let mut env = Envelope::default();
    if info.flags & 1 != 0 {
        env.flags |= EnvelopeFlags::ON;
    }
    if info.flags & 2 != 0 {
        env.flags |= EnvelopeFlags::SUSTAIN;
    }
    if info.flags & 4 != 0 {
        env.flags |= EnvelopeFlags::LOOP;
    }
    env.sustain_begin = info.sustain;
    env.sustain_end = info.sustain;
    env.loop_begin = info.begin;
    env.loop_end = info.end;
    for pair in nodes.chunks_exact(2).take(info.points as usize) {
        env.push(pair[0] as i16, pair[1] as i16);
    }
    env.disable_if_degenerate();
    env
}

/// Channel disabled quirk: a lone enabled first channel really means
/// the first sixteen are all on.
fn channel_status(channels: &[Channel; CHANNELS]) -> [u8; CHANNELS] {
    let mut status = [0u8; CHANNELS];
    for (s, c) in status.iter_mut().zip(channels) {
        *s = c.status;
    }
    if status[0] == 0 && status[1..16].iter().all(|&s| s == 1) {
        status[1..16].fill(0);
    }
    status
}

fn read_pattern(
    r: &mut dyn ByteReader,
    remap: &[Option<u8>; CHANNELS],
    buf: &mut [Note],
    mut size: i64,
    rows: usize,
) -> Result<(), ModError> {
    buf.fill(Note::EMPTY);
    let mut dummy = Note::EMPTY;
    let mut row = 0;
    while size > 0 && row < rows {
        let flag = r.read_u8();
        size -= 1;
        if r.eof() {
            return Err(ModError::LoadingPattern);
        }
        if flag == 0 {
            row += 1;
            continue;
        }
        let n = match remap[(flag & 31) as usize] {
            Some(ch) => &mut buf[ch as usize * MAX_ROWS + row],
            None => &mut dummy,
        };
        if flag & 32 != 0 {
            n.note = r.read_u8().min(NOTE_OFF);
            n.ins = r.read_u8();
            size -= 2;
        }
        if flag & 64 != 0 {
            n.eff2 = r.read_u8();
            n.dat2 = r.read_u8();
            size -= 2;
        }
        if flag & 128 != 0 {
            n.eff1 = r.read_u8();
            n.dat1 = r.read_u8();
            size -= 2;
        }
    }
    if size != 0 || row != rows {
        return Err(ModError::LoadingPattern);
    }
    Ok(())
}

fn fine_slide(inf: u8) -> u8 {
    match inf {
        0 => 0,
        1..=0x3f => 0xe0 | (inf >> 2),
        _ => 0xf0 | (inf >> 4),
    }
}

fn process_cmd(of: &mut ModuleBuilder, eff: u8, inf: u8) {
    match eff {
        0x01 => of.uni.effect(Opcode::S3mEffectA, inf as u16),
        0x02 if inf >= 0x20 => of.uni.effect(Opcode::S3mEffectT, inf as u16),
        0x03 => of.uni.effect(Opcode::ItEffectG, inf as u16),
        0x04 => {
            of.uni.effect(Opcode::ItEffectG, inf as u16);
            of.uni.effect(Opcode::S3mEffectD, 0);
        }
        0x05 => of.uni.effect(Opcode::XmEffect4, inf as u16),
        0x06 => of.uni.effect(Opcode::XmEffect6, inf as u16),
        0x07 => of.uni.effect(Opcode::ItEffectU, inf as u16),
        0x08 => of.uni.effect(Opcode::S3mEffectR, inf as u16),
        0x09 => of.pt_effect(0x0, inf),
        0x0a => of.pt_effect(0x8, if inf >= 128 { 255 } else { inf << 1 }),
        0x0b => of.uni.effect(Opcode::XmEffectP, inf as u16),
        0x0c if inf <= 64 => of.pt_effect(0xc, inf),
        0x0d => of.uni.effect(Opcode::S3mEffectD, inf as u16),
        0x0e => {
            let dat = match inf {
                0 => 0,
                0x01..=0x0f => 0xf0 | inf,
                _ => 0x0f | inf,
            };
            of.uni.effect(Opcode::S3mEffectD, dat as u16);
        }
        0x0f => of.pt_effect(0xe, 0x50 | (inf >> 4)),
        0x10 | 0x11 => log::trace!("[IMF] note slide {eff:02X} {inf:02X} ignored"),
        0x12 => of.uni.effect(Opcode::S3mEffectF, inf as u16),
        0x13 => of.uni.effect(Opcode::S3mEffectE, inf as u16),
        0x14 => of.uni.effect(Opcode::S3mEffectF, fine_slide(inf) as u16),
        0x15 => of.uni.effect(Opcode::S3mEffectE, fine_slide(inf) as u16),
        0x18 => of.pt_effect(0x9, inf),
        0x1a => of.uni.key_off(),
        0x1b => of.uni.effect(Opcode::S3mEffectQ, inf as u16),
        0x1c => of.uni.effect(Opcode::S3mEffectI, inf as u16),
        0x1d => of.pt_effect(0xb, inf),
        0x1e => of.pt_effect(0xd, (inf >> 4) * 10 + (inf & 0xf)),
        0x1f if inf <= 64 => of.uni.effect(Opcode::XmEffectG, (inf as u16) << 1),
        0x20 => of.uni.effect(Opcode::XmEffectH, inf as u16),
        0x21 => match inf >> 4 {
            // filter, vibrato and tremolo waveforms
            0x1 | 0x5 | 0x8 => of.pt_effect(0xe, inf - 0x10),
            0xa => of.pt_effect(0xe, 0x60 | (inf & 0xf)),
            0xb => of.pt_effect(0xe, 0xe0 | (inf & 0xf)),
            0x3 | 0xc | 0xd | 0xf => of.pt_effect(0xe, inf),
            0xe => {
                // ignore volume, panning and pitch envelopes
                of.uni.effect(Opcode::ItEffectS0, 0x77);
                of.uni.effect(Opcode::ItEffectS0, 0x79);
                of.uni.effect(Opcode::ItEffectS0, 0x7b);
            }
            _ => {}
        },
        _ => {}
    }
}

fn convert_track(of: &mut ModuleBuilder, cells: &[Note]) {
    of.uni.reset();
    for &cell in cells {
        let mut n = cell;
        if n.ins != 0 && n.ins != 255 {
            of.uni.instrument(n.ins - 1);
        }
        if n.note != 255 {
            if n.note == NOTE_OFF {
                of.pt_effect(0xc, 0);
                if n.eff1 == 0x0c {
                    n.eff1 = 0;
                }
                if n.eff2 == 0x0c {
                    n.eff2 = 0;
                }
            } else {
                of.uni
                    .note((n.note >> 4) * periods::OCTAVE as u8 + (n.note & 0xf));
            }
        }
        process_cmd(of, n.eff1, n.dat1);
        process_cmd(of, n.eff2, n.dat2);
        of.uni.newline();
    }
}

#[derive(Debug, Default)]
pub struct ImfLoader {
    buf: Vec<Note>,
}

impl ImfLoader {
    fn load_instruments(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
    ) -> Result<Vec<Sample>, ModError> {
        let mut samples = Vec::new();
        let mut old_num_samples = 0;
        for index in 0..of.instruments.len() {
            let ih: InstHeader = read_struct(r).map_err(|_| ModError::LoadingSampleInfo)?;
            // empty instruments after a multi-sample one may lack the id
            if &ih.id != b"II10" && old_num_samples != 0 && ih.id != [0; 4] {
                return Err(ModError::LoadingSampleInfo);
            }
            old_num_samples = ih.num_samples;
            if ih.num_samples > 16
                || [ih.vol.points, ih.pan.points, ih.pitch.points]
                    .iter()
                    .any(|&p| p as usize > ENV_POINTS)
            {
                return Err(ModError::LoadingSampleInfo);
            }

            let base = samples.len() as u16;
            let d = &mut of.instruments[index];
            d.name = dup_str(&ih.name, true);
            for (slot, &what) in d.sample_number.iter_mut().zip(&ih.note_map) {
                *slot = if what as u16 > ih.num_samples {
                    u16::MAX
                } else {
                    what as u16 + base
                };
            }
            d.fadeout = ih.fadeout;
            d.volume_envelope = build_envelope(&ih.vol_env, &ih.vol);
            d.panning_envelope = build_envelope(&ih.pan_env, &ih.pan);
            d.pitch_envelope = build_envelope(&ih.pitch_env, &ih.pitch);
            if ih.pitch.flags & 1 != 0 {
                d.pitch_envelope.flags.remove(EnvelopeFlags::ON);
                log::warn!("[IMF] filter envelopes not supported");
            }

            for _ in 0..ih.num_samples {
                let s: SampleHeader = read_struct(r).map_err(|_| ModError::LoadingSampleInfo)?;
                if &s.id != b"IS10" && &s.id != b"IW10" {
                    return Err(ModError::LoadingSampleInfo);
                }
                let mut q = Sample {
                    name: dup_str(&s.name, true),
                    length: s.length,
                    loop_start: s.loop_start,
                    loop_end: s.loop_end,
                    volume: s.volume & 0x7f,
                    speed: s.rate,
                    panning: s.pan as i16,
                    seek_pos: r.tell(),
                    flags: SampleFlags::SIGNED,
                    ..Sample::default()
                };
                if s.flags & 1 != 0 {
                    q.flags |= SampleFlags::LOOP;
                }
                if s.flags & 2 != 0 {
                    q.flags |= SampleFlags::BIDI;
                }
                if s.flags & 8 != 0 {
                    q.flags |= SampleFlags::OWN_PAN;
                }
                if s.flags & 4 != 0 {
                    q.flags |= SampleFlags::BITS16;
                    q.length >>= 1;
                    q.loop_start >>= 1;
                    q.loop_end >>= 1;
                }
                r.skip(s.length as i64);
                samples.push(q);
            }
        }
        Ok(samples)
    }
}

impl Loader for ImfLoader {
    fn tag(&self) -> &'static str {
        "IMF"
    }

    fn description(&self) -> &'static str {
        "Imago Orpheus"
    }

    fn test(&self, r: &mut dyn ByteReader) -> bool {
        r.skip(0x3c);
        let id = read_array::<4>(r);
        !r.eof() && &id == b"IM10"
    }

    fn init(&mut self) -> Result<(), ModError> {
        self.buf = vec![Note::EMPTY; CHANNELS * MAX_ROWS];
        Ok(())
    }

    fn load(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        _curious: bool,
    ) -> Result<(), ModError> {
        let mh: Header = read_struct(r).map_err(|_| ModError::LoadingHeader)?;

        of.title = dup_str(&mh.title, true);
        of.format = "Imago Orpheus".to_string();
        of.num_patterns = mh.pat_num;
        of.num_instruments = mh.ins_num;
        of.restart_position = 0;
        of.initial_speed = mh.init_speed;
        of.initial_tempo = mh.init_tempo as u16;
        of.initial_volume = mh.master_vol << 1;
        of.flags |= ModuleFlags::INST | ModuleFlags::ARPMEM | ModuleFlags::PANNING;
        if mh.flags & 1 != 0 {
            of.flags |= ModuleFlags::LINEAR;
        }
        of.bpm_limit = 32;

        let mut remap = [None; CHANNELS];
        of.num_channels = 0;
        for (t, status) in channel_status(&mh.channels).into_iter().enumerate() {
            if status != 2 {
                let ch = of.num_channels;
                remap[t] = Some(ch);
                of.panning[ch as usize] = mh.channels[t].pan as i16;
                of.num_channels += 1;
            }
        }
        log::debug!("[IMF] {} channels enabled", of.num_channels);

        let orders: Vec<u16> = mh.orders[..(mh.ord_num as usize).min(256)]
            .iter()
            .filter(|&&o| o != 0xff)
            .map(|&o| o as u16)
            .collect();
        of.num_positions = orders.len() as u16;
        of.alloc_positions(orders.len())?;
        of.positions.copy_from_slice(&orders);

        of.set_track_count()?;
        of.alloc_tracks()?;
        of.alloc_patterns()?;

        let channels = of.num_channels as usize;
        let mut track = 0;
        for t in 0..of.num_patterns as usize {
            let size = r.read_u16_le() as i64;
            let rows = r.read_u16_le() as usize;
            if rows > MAX_ROWS || size < 4 {
                return Err(ModError::LoadingPattern);
            }
            of.pattern_rows[t] = rows as u16;
            read_pattern(r, &remap, &mut self.buf, size - 4, rows)?;
            for u in 0..channels {
                convert_track(of, &self.buf[u * MAX_ROWS..u * MAX_ROWS + rows]);
                of.store_track(track)?;
                track += 1;
            }
        }

        of.alloc_instruments()?;
        let samples = self.load_instruments(r, of)?;
        if samples.is_empty() {
            return Err(ModError::LoadingSampleInfo);
        }
        of.num_samples = samples.len() as u16;
        of.alloc_samples()?;
        let linear = of.flags.contains(ModuleFlags::LINEAR);
        for (u, s) in samples.into_iter().enumerate() {
            let rate = s.speed;
            of.samples[u] = s;
            if linear {
                of.samples[u].speed = of.speed_to_finetune(rate << 1, u);
            }
        }

        let num_samples = of.num_samples;
        for i in 0..of.instruments.len() {
            for t in 0..INSTNOTES {
                let sample = of.instruments[i].sample_number[t];
                let note = if sample >= num_samples {
                    255
                } else if linear {
                    let shifted = t as i32 + of.note_index(sample as usize);
                    shifted.clamp(0, 255) as u8
                } else {
                    t as u8
                };
                of.instruments[i].sample_note[t] = note;
            }
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.buf = Vec::new();
    }

    fn load_title(&self, r: &mut dyn ByteReader) -> Option<String> {
        let title = read_array::<32>(r);
        (!r.eof()).then(|| dup_str(&title, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows_of(of: &mut ModuleBuilder) -> Vec<Vec<(Opcode, u16)>> {
        let track = of.uni.finish();
        track
            .rows()
            .map(|row| row.events().map(|e| (e.opcode, e.operand)).collect())
            .collect()
    }

    #[test]
    fn size_must_match_rows() {
        let mut remap = [None; CHANNELS];
        remap[1] = Some(0);
        let mut buf = vec![Note::EMPTY; CHANNELS * MAX_ROWS];
        // channel 1 note and instrument, channel 5 disabled, two row ends
        let data = [0x21, 0x42, 2, 0x85, 0x0d, 0x10, 0, 0];
        let mut r = crate::reader::MemReader::new(&data);
        read_pattern(&mut r, &remap, &mut buf, data.len() as i64, 2).expect("pattern");
        assert_eq!(buf[0].note, 0x42);
        assert_eq!(buf[0].ins, 2);
        assert_eq!(buf[1], Note::EMPTY);

        let mut r = crate::reader::MemReader::new(&data);
        assert_eq!(
            read_pattern(&mut r, &remap, &mut buf, data.len() as i64, 3),
            Err(ModError::LoadingPattern)
        );
    }

    #[test]
    fn note_off_cuts_and_drops_volume() {
        let mut of = ModuleBuilder::new();
        let cells = [
            Note {
                note: NOTE_OFF,
                eff1: 0x0c,
                dat1: 0x20,
                ..Note::EMPTY
            },
            Note {
                eff1: 0x1a,
                ..Note::EMPTY
            },
        ];
        convert_track(&mut of, &cells);
        let rows = rows_of(&mut of);
        assert_eq!(rows[0], vec![(Opcode::PtEffectC, 0)]);
        assert_eq!(rows[1], vec![(Opcode::KeyOff, 0)]);
    }

    #[test]
    fn fine_slides() {
        assert_eq!(fine_slide(0), 0);
        assert_eq!(fine_slide(0x08), 0xe2);
        assert_eq!(fine_slide(0x50), 0xf5);
    }

    #[test]
    fn lone_first_channel_enables_sixteen() {
        let mut raw = [0u8; CHANNELS * 16];
        for t in 1..16 {
            raw[t * 16 + 15] = 1;
        }
        for t in 16..CHANNELS {
            raw[t * 16 + 15] = 2;
        }
        let mut r = crate::reader::MemReader::new(&raw);
        let channels: [Channel; CHANNELS] = read_struct(&mut r).expect("channels");
        let status = channel_status(&channels);
        assert!(status[..16].iter().all(|&s| s == 0));
        assert!(status[16..].iter().all(|&s| s == 2));
    }
}
