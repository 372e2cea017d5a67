//! Impulse Tracker adaptive bit-width sample codec.
//!
//! Data comes in blocks of 0x8000 (8-bit) or 0x4000 (16-bit) samples, each
//! preceded by its compressed byte length. Values are delta coded and the
//! code width changes in-band: small widths use an escape value followed by
//! a short explicit width, medium widths reserve a window of values just
//! below the maximum, and the widest mode switches on any value at or
//! above the sign bit.

use um_ir::ModError;

use crate::reader::ByteReader;

/// Streaming decoder state, kept across chunk boundaries within a block.
#[derive(Clone, Debug)]
pub(crate) struct ItPackDecoder {
    wide: bool,
    bits: u32,
    buf: u32,
    buf_bits: u32,
    last: i32,
    /// Compressed bytes left in the current block.
    in_count: u32,
    /// Output samples left in the current block.
    block_left: usize,
}

impl ItPackDecoder {
    pub(crate) fn new(wide: bool) -> Self {
        Self {
            wide,
            bits: 0,
            buf: 0,
            buf_bits: 0,
            last: 0,
            in_count: 0,
            block_left: 0,
        }
    }

    /// True when the next call must start a new block.
    pub(crate) fn needs_block(&self) -> bool {
        self.block_left == 0
    }

    pub(crate) fn block_left(&self) -> usize {
        self.block_left
    }

    /// Read the block header and reset the code width and predictor.
    pub(crate) fn start_block(&mut self, r: &mut dyn ByteReader) {
        if self.in_count > 0 {
            r.skip(self.in_count as i64);
        }
        self.bits = if self.wide { 17 } else { 9 };
        self.buf = 0;
        self.buf_bits = 0;
        self.last = 0;
        self.in_count = r.read_u16_le() as u32;
        self.block_left = if self.wide { 0x4000 } else { 0x8000 };
    }

    fn read_bits(&mut self, r: &mut dyn ByteReader, mut need: u32) -> u32 {
        let mut value = 0u32;
        let mut have = 0u32;
        while need > 0 {
            if self.buf_bits == 0 {
                self.buf = if self.in_count > 0 {
                    self.in_count -= 1;
                    r.read_u8() as u32
                } else {
                    0
                };
                self.buf_bits = 8;
            }
            let take = need.min(self.buf_bits);
            value |= (self.buf & ((1 << take) - 1)) << have;
            self.buf >>= take;
            self.buf_bits -= take;
            need -= take;
            have += take;
        }
        value
    }

    /// Decode `out.len()` samples, which must not exceed what is left of
    /// the current block. 8-bit output is scaled to 16 bits.
    pub(crate) fn decode(
        &mut self,
        r: &mut dyn ByteReader,
        out: &mut [i16],
    ) -> Result<(), ModError> {
        let (max_bits, escape_bits) = if self.wide { (17, 4) } else { (9, 3) };
        let mut new_width = false;
        let mut i = 0;

        while i < out.len() {
            if self.bits > max_bits || self.bits == 0 {
                return Err(ModError::ItPackInvalidData);
            }
            let mut x = self.read_bits(r, if new_width { escape_bits } else { self.bits });

            if new_width {
                new_width = false;
                x += 1;
                if x >= self.bits {
                    x += 1;
                }
                self.bits = x;
                continue;
            }

            if self.bits < 7 {
                if x == 1 << (self.bits - 1) {
                    new_width = true;
                    continue;
                }
            } else if self.bits < max_bits {
                let y = if self.wide {
                    (0xffff >> (17 - self.bits)) - 8
                } else {
                    (0xff >> (9 - self.bits)) - 4
                };
                let window = if self.wide { 16 } else { 8 };
                if x > y && x <= y + window {
                    x -= y;
                    if x >= self.bits {
                        x += 1;
                    }
                    self.bits = x;
                    continue;
                }
            } else {
                let top = if self.wide { 0x10000 } else { 0x100 };
                if x >= top {
                    self.bits = x - top + 1;
                    continue;
                }
            }

            if self.wide {
                let v = if self.bits < 16 {
                    let shift = 16 - self.bits;
                    ((x << shift) as u16 as i16 >> shift) as i32
                } else {
                    x as u16 as i16 as i32
                };
                self.last = (self.last as i16).wrapping_add(v as i16) as i32;
                out[i] = self.last as i16;
            } else {
                let v = if self.bits < 8 {
                    let shift = 8 - self.bits;
                    ((x << shift) as u8 as i8 >> shift) as i32
                } else {
                    x as u8 as i8 as i32
                };
                self.last = (self.last as i8).wrapping_add(v as i8) as i32;
                out[i] = (self.last as i16) << 8;
            }
            i += 1;
        }

        self.block_left -= out.len().min(self.block_left);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemReader;

    #[test]
    fn decodes_nine_bit_deltas() {
        // two 9-bit codes of value 1, LSB first
        let data = [0x03, 0x00, 0x01, 0x02, 0x00];
        let mut r = MemReader::new(&data);
        let mut dec = ItPackDecoder::new(false);
        dec.start_block(&mut r);
        let mut out = [0i16; 2];
        dec.decode(&mut r, &mut out).unwrap();
        assert_eq!(out, [256, 512]);
        assert_eq!(dec.block_left(), 0x8000 - 2);
    }

    #[test]
    fn oversized_width_is_rejected() {
        // 0x1ff in the widest 8-bit mode asks for a 256-bit code width
        let data = [0x02, 0x00, 0xff, 0x01];
        let mut r = MemReader::new(&data);
        let mut dec = ItPackDecoder::new(false);
        dec.start_block(&mut r);
        let mut out = [0i16; 4];
        assert_eq!(dec.decode(&mut r, &mut out), Err(ModError::ItPackInvalidData));
    }

    #[test]
    fn sixteen_bit_block_size() {
        let data = [0x00, 0x00];
        let mut r = MemReader::new(&data);
        let mut dec = ItPackDecoder::new(true);
        dec.start_block(&mut r);
        assert_eq!(dec.block_left(), 0x4000);
        let mut out = [1i16; 3];
        // exhausted input decodes as zero deltas
        dec.decode(&mut r, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0]);
    }
}
