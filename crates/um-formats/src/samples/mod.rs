//! Sample data stream decoder.
//!
//! Runs after a loader has filled in the module structure. Every sample
//! with a non-zero length is registered as a [`SampleLoadRequest`]; the
//! requests are then materialized in registration order, reading from the
//! sample's recorded stream offset or, when that is zero, from wherever the
//! previous read left the stream. Output is always signed 16-bit mono with
//! a 16-frame margin past the end (see [`UNCLICK_FRAMES`]).

mod itpack;

use std::io::SeekFrom;

use um_ir::{Module, ModError, Sample, SampleFlags};

use crate::reader::ByteReader;
use itpack::ItPackDecoder;

/// Source values converted per pass.
pub const CHUNK_SIZE: usize = 2048;

/// Frames appended after the sample end so that interpolating mixers can
/// read past a loop boundary.
pub const UNCLICK_FRAMES: usize = 16;

/// What to do when a single sample fails to decode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SamplePolicy {
    /// Any failure aborts the whole module load.
    #[default]
    Fatal,
    /// Leave the failing sample empty and keep going.
    SkipBad,
}

/// Conversion descriptor for one sample, consumed once by [`decode_sample`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleLoadRequest {
    /// Index into the module's sample list.
    pub index: usize,
    pub in_flags: SampleFlags,
    /// Frames stored in the file.
    pub length: u32,
    pub loop_start: u32,
    pub loop_end: u32,
    pub seek_pos: u64,
    /// Decimation factor (1 = none).
    pub scale: u32,
}

impl SampleLoadRequest {
    pub fn new(index: usize, sample: &Sample) -> Self {
        Self {
            index,
            in_flags: sample.in_flags,
            length: sample.length,
            loop_start: sample.loop_start,
            loop_end: sample.loop_end,
            seek_pos: sample.seek_pos,
            scale: 1,
        }
    }

    /// Frames produced after decimation, margin excluded.
    pub fn out_frames(&self) -> usize {
        self.length as usize / self.scale.max(1) as usize
    }

    fn decoded_bytes(&self) -> usize {
        (self.out_frames() + UNCLICK_FRAMES) * 2
    }
}

/// Queue of samples waiting to be decoded.
#[derive(Debug, Default)]
pub struct SampleDecoder {
    requests: Vec<SampleLoadRequest>,
}

impl SampleDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every sample of `module` that has data.
    pub fn register_module(&mut self, module: &Module) {
        for (i, s) in module.samples.iter().enumerate() {
            if s.length > 0 {
                self.requests.push(SampleLoadRequest::new(i, s));
            }
        }
    }

    pub fn requests(&self) -> &[SampleLoadRequest] {
        &self.requests
    }

    /// Total decoded size in bytes of everything registered.
    pub fn total_bytes(&self) -> usize {
        self.requests.iter().map(|r| r.decoded_bytes()).sum()
    }

    /// Halve the largest samples until the decoded total fits in `limit`
    /// bytes. Returns false if it cannot be made to fit.
    pub fn fit_to(&mut self, limit: usize) -> bool {
        while self.total_bytes() > limit {
            let largest = self
                .requests
                .iter_mut()
                .filter(|r| r.out_frames() > 1)
                .max_by_key(|r| r.out_frames());
            match largest {
                Some(req) => {
                    req.scale *= 2;
                    log::debug!("[SAMPLES] sample {} decimated by {}", req.index, req.scale);
                }
                None => return false,
            }
        }
        true
    }

    /// Decode all registered samples into `module`. Returns the indices of
    /// samples skipped under [`SamplePolicy::SkipBad`].
    pub fn decode_all(
        self,
        r: &mut dyn ByteReader,
        module: &mut Module,
        policy: SamplePolicy,
    ) -> Result<Vec<usize>, ModError> {
        let mut skipped = Vec::new();
        for req in self.requests {
            if req.seek_pos != 0 {
                r.seek_to(SeekFrom::Start(req.seek_pos));
            }
            let Some(sample) = module.samples.get_mut(req.index) else {
                continue;
            };
            apply_scale(sample, &req);
            match decode_sample(r, &req) {
                Ok(pcm) => {
                    sample.pcm = pcm;
                    sample.flags = (sample.flags & !SampleFlags::FORMAT_MASK)
                        | SampleFlags::BITS16
                        | SampleFlags::SIGNED;
                }
                Err(e) if policy == SamplePolicy::SkipBad => {
                    log::warn!("[SAMPLES] skipping sample {}: {e}", req.index);
                    sample.pcm = Vec::new();
                    skipped.push(req.index);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(skipped)
    }
}

fn apply_scale(sample: &mut Sample, req: &SampleLoadRequest) {
    if req.scale > 1 {
        sample.div_factor = req.scale.min(u8::MAX as u32) as u8;
        sample.length = req.out_frames() as u32;
        sample.loop_start = req.loop_start / req.scale;
        sample.loop_end = req.loop_end / req.scale;
        sample.sustain_start /= req.scale;
        sample.sustain_end /= req.scale;
    }
}

/// Read raw values for one chunk.
fn read_chunk(
    r: &mut dyn ByteReader,
    flags: SampleFlags,
    itpack: &mut Option<ItPackDecoder>,
    out: &mut [i16],
) -> Result<usize, ModError> {
    if let Some(dec) = itpack {
        if dec.needs_block() {
            dec.start_block(r);
        }
        let n = out.len().min(dec.block_left());
        dec.decode(r, &mut out[..n])?;
        return Ok(n);
    }

    if flags.contains(SampleFlags::BITS16) {
        let mut raw = vec![0u8; out.len() * 2];
        r.read_into(&mut raw);
        let big = flags.contains(SampleFlags::BIG_ENDIAN);
        for (dst, b) in out.iter_mut().zip(raw.chunks_exact(2)) {
            *dst = if big {
                i16::from_be_bytes([b[0], b[1]])
            } else {
                i16::from_le_bytes([b[0], b[1]])
            };
        }
    } else {
        let mut raw = vec![0u8; out.len()];
        r.read_into(&mut raw);
        for (dst, &b) in out.iter_mut().zip(raw.iter()) {
            *dst = ((b as i8) as i16) << 8;
        }
    }
    if r.eof() {
        return Err(ModError::LoadingSamples);
    }
    Ok(out.len())
}

/// Decode one sample into signed 16-bit mono frames plus the unclick
/// margin.
pub fn decode_sample(
    r: &mut dyn ByteReader,
    req: &SampleLoadRequest,
) -> Result<Vec<i16>, ModError> {
    let flags = req.in_flags;
    let stereo = flags.contains(SampleFlags::STEREO);
    let channels = if stereo { 2 } else { 1 };
    let scale = req.scale.max(1) as usize;
    let out_frames = req.out_frames();

    let mut out: Vec<i16> = Vec::new();
    out.try_reserve_exact(out_frames + UNCLICK_FRAMES)
        .map_err(|_| ModError::OutOfMemory)?;

    let mut itpack = flags
        .contains(SampleFlags::ITPACKED)
        .then(|| ItPackDecoder::new(flags.contains(SampleFlags::BITS16)));
    let delta = flags.contains(SampleFlags::DELTA);
    let unsigned = !flags.contains(SampleFlags::SIGNED);

    let mut chunk = vec![0i16; CHUNK_SIZE];
    let mut remaining = req.length as usize * channels;
    let mut old: i16 = 0;
    let mut acc: i32 = 0;
    let mut acc_n = 0usize;

    while remaining > 0 && out.len() < out_frames {
        if delta && itpack.as_ref().is_some_and(|d| d.needs_block()) {
            old = 0;
        }
        let want = remaining.min(CHUNK_SIZE);
        let n = read_chunk(r, flags, &mut itpack, &mut chunk[..want])?;
        if n == 0 {
            return Err(ModError::LoadingSamples);
        }
        remaining -= n;
        let values = &mut chunk[..n];

        if delta {
            for v in values.iter_mut() {
                old = old.wrapping_add(*v);
                *v = old;
            }
        }
        if unsigned {
            for v in values.iter_mut() {
                *v ^= i16::MIN;
            }
        }

        let frames = if stereo {
            let pairs = n / 2;
            for i in 0..pairs {
                values[i] = ((values[2 * i] as i32 + values[2 * i + 1] as i32) >> 1) as i16;
            }
            pairs
        } else {
            n
        };

        for &v in &values[..frames] {
            if scale == 1 {
                out.push(v);
            } else {
                acc += v as i32;
                acc_n += 1;
                if acc_n == scale {
                    out.push((acc / scale as i32) as i16);
                    acc = 0;
                    acc_n = 0;
                }
            }
            if out.len() == out_frames {
                break;
            }
        }
    }

    out.resize(out_frames, 0);
    unclick(&mut out, req, scale as u32);
    Ok(out)
}

/// Append the 16-frame margin: a copy of the loop start (or the mirrored
/// loop end for ping-pong loops), or silence for one-shot samples.
fn unclick(out: &mut Vec<i16>, req: &SampleLoadRequest, scale: u32) {
    let len = out.len();
    out.resize(len + UNCLICK_FRAMES, 0);

    let flags = req.in_flags;
    if !flags.contains(SampleFlags::LOOP) {
        return;
    }
    let loop_end = ((req.loop_end / scale) as usize).min(len);
    let loop_start = ((req.loop_start / scale) as usize).min(loop_end);
    if loop_end == 0 {
        return;
    }
    for t in 0..UNCLICK_FRAMES {
        let src = if flags.contains(SampleFlags::BIDI) {
            loop_end.saturating_sub(t + 1)
        } else {
            loop_start + t
        };
        out[loop_end + t] = out[src];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemReader;

    fn request(flags: SampleFlags, length: u32) -> SampleLoadRequest {
        SampleLoadRequest {
            index: 0,
            in_flags: flags,
            length,
            loop_start: 0,
            loop_end: 0,
            seek_pos: 0,
            scale: 1,
        }
    }

    #[test]
    fn sixteen_bit_one_shot_gets_silent_margin() {
        let data: Vec<u8> = (0..100i16).flat_map(|v| (v * 100 + 1).to_le_bytes()).collect();
        let mut r = MemReader::new(&data);
        let req = request(SampleFlags::BITS16 | SampleFlags::SIGNED, 100);
        let pcm = decode_sample(&mut r, &req).unwrap();
        assert_eq!(pcm.len(), 116);
        assert_eq!(pcm[1], 101);
        assert_eq!(pcm[99], 9901);
        assert!(pcm[100..].iter().all(|&v| v == 0));
    }

    #[test]
    fn unsigned_eight_bit_is_centered() {
        let data = [0x80u8, 0xff, 0x00];
        let mut r = MemReader::new(&data);
        let pcm = decode_sample(&mut r, &request(SampleFlags::empty(), 3)).unwrap();
        assert_eq!(&pcm[..3], &[0, 0x7f00, -0x8000]);
    }

    #[test]
    fn delta_is_a_running_sum() {
        let data = [1u8, 1, 1, 0xff];
        let mut r = MemReader::new(&data);
        let req = request(SampleFlags::SIGNED | SampleFlags::DELTA, 4);
        let pcm = decode_sample(&mut r, &req).unwrap();
        assert_eq!(&pcm[..4], &[0x100, 0x200, 0x300, 0x200]);
    }

    #[test]
    fn big_endian_sixteen_bit() {
        let data = [0x12u8, 0x34];
        let mut r = MemReader::new(&data);
        let req = request(
            SampleFlags::BITS16 | SampleFlags::SIGNED | SampleFlags::BIG_ENDIAN,
            1,
        );
        assert_eq!(decode_sample(&mut r, &req).unwrap()[0], 0x1234);
    }

    #[test]
    fn stereo_is_averaged_to_mono() {
        let data: Vec<u8> = [100i16, 300, -50, 50]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut r = MemReader::new(&data);
        let req = request(
            SampleFlags::BITS16 | SampleFlags::SIGNED | SampleFlags::STEREO,
            2,
        );
        let pcm = decode_sample(&mut r, &req).unwrap();
        assert_eq!(&pcm[..2], &[200, 0]);
        assert_eq!(pcm.len(), 2 + UNCLICK_FRAMES);
    }

    #[test]
    fn forward_loop_margin_copies_loop_start() {
        let data: Vec<u8> = (0..32u8).collect();
        let mut r = MemReader::new(&data);
        let mut req = request(SampleFlags::SIGNED | SampleFlags::LOOP, 32);
        req.loop_start = 4;
        req.loop_end = 32;
        let pcm = decode_sample(&mut r, &req).unwrap();
        for t in 0..UNCLICK_FRAMES {
            assert_eq!(pcm[32 + t], pcm[4 + t]);
        }
    }

    #[test]
    fn bidi_loop_margin_mirrors_loop_end() {
        let data: Vec<u8> = (0..20u8).collect();
        let mut r = MemReader::new(&data);
        let mut req = request(SampleFlags::SIGNED | SampleFlags::LOOP | SampleFlags::BIDI, 20);
        req.loop_end = 20;
        let pcm = decode_sample(&mut r, &req).unwrap();
        assert_eq!(pcm[20], pcm[19]);
        assert_eq!(pcm[21], pcm[18]);
    }

    #[test]
    fn truncated_data_fails() {
        let data = [0u8; 10];
        let mut r = MemReader::new(&data);
        let req = request(SampleFlags::SIGNED, 20);
        assert_eq!(decode_sample(&mut r, &req), Err(ModError::LoadingSamples));
    }

    #[test]
    fn decimation_averages_blocks() {
        let data: Vec<u8> = [10i16, 30, 50, 70, 90]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut r = MemReader::new(&data);
        let mut req = request(SampleFlags::BITS16 | SampleFlags::SIGNED, 5);
        req.scale = 2;
        let pcm = decode_sample(&mut r, &req).unwrap();
        assert_eq!(&pcm[..2], &[20, 60]);
        assert_eq!(pcm.len(), 2 + UNCLICK_FRAMES);
    }

    #[test]
    fn malformed_itpack_sample_is_rejected() {
        let data = [0x02u8, 0x00, 0xff, 0x01];
        let mut r = MemReader::new(&data);
        let req = request(SampleFlags::ITPACKED | SampleFlags::SIGNED, 10);
        assert_eq!(decode_sample(&mut r, &req), Err(ModError::ItPackInvalidData));
    }

    #[test]
    fn fit_to_halves_largest_first() {
        let mut dec = SampleDecoder::new();
        dec.requests.push(request(SampleFlags::empty(), 1000));
        dec.requests.push(SampleLoadRequest {
            index: 1,
            ..request(SampleFlags::empty(), 100)
        });
        assert!(dec.fit_to(1400));
        assert_eq!(dec.requests[0].scale, 2);
        assert_eq!(dec.requests[1].scale, 1);
    }

    #[test]
    fn skip_bad_keeps_loading() {
        let mut module = Module {
            num_samples: 2,
            samples: vec![
                Sample {
                    length: 4,
                    in_flags: SampleFlags::ITPACKED | SampleFlags::SIGNED,
                    seek_pos: 0,
                    ..Sample::default()
                },
                Sample {
                    length: 2,
                    in_flags: SampleFlags::SIGNED,
                    seek_pos: 4,
                    ..Sample::default()
                },
            ],
            ..Module::default()
        };
        let data = [0x02u8, 0x00, 0xff, 0x01, 0x7f, 0x01];
        let mut r = MemReader::new(&data);
        let mut dec = SampleDecoder::new();
        dec.register_module(&module);
        let skipped = dec
            .decode_all(&mut r, &mut module, SamplePolicy::SkipBad)
            .unwrap();
        assert_eq!(skipped, vec![0]);
        assert!(module.samples[0].pcm.is_empty());
        assert_eq!(&module.samples[1].pcm[..2], &[0x7f00, 0x0100]);
    }
}
