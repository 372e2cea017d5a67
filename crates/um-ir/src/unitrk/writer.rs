//! Track encoder.

use alloc::vec::Vec;

use super::opcode::{Opcode, VolEffect};
use super::Track;

/// Largest encodable row, header byte included.
pub const MAX_ROW_LEN: usize = 0x1f;
/// Highest repeat count a row header can hold (8 pattern rows).
pub const MAX_ROW_REPEAT: u8 = 7;

/// Builds one track at a time.
///
/// Events are appended to the current row; [`newline`](Self::newline)
/// closes it, merging it into the previous stored row when the bytes are
/// identical and the repeat counter still has room.
#[derive(Clone, Debug)]
pub struct TrackWriter {
    buf: Vec<u8>,
    /// Offset of the current row's header byte.
    row_start: usize,
    /// Offset of the previous stored row's header byte.
    last_row: usize,
    dropped: usize,
}

impl Default for TrackWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackWriter {
    pub fn new() -> Self {
        let mut writer = Self {
            buf: Vec::with_capacity(128),
            row_start: 0,
            last_row: 0,
            dropped: 0,
        };
        writer.reset();
        writer
    }

    /// Start a new, empty track.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.buf.push(0);
        self.row_start = 0;
        self.last_row = 0;
        self.dropped = 0;
    }

    /// Bytes written to the current row so far, header included.
    fn row_len(&self) -> usize {
        self.buf.len() - self.row_start
    }

    /// Append an event. The operand is truncated to the opcode's width.
    /// Events that would overflow the row are dropped.
    pub fn effect(&mut self, op: Opcode, operand: u16) {
        let width = op.operand_width();
        if self.row_len() + 1 + width > MAX_ROW_LEN {
            self.dropped += 1;
            log::warn!("[UNITRK] row overflow, dropping {op:?} {operand:#x}");
            return;
        }
        self.buf.push(op as u8);
        match width {
            0 => {}
            1 => self.buf.push(operand as u8),
            _ => self.buf.extend_from_slice(&operand.to_be_bytes()),
        }
    }

    /// Two-byte operand given as separate bytes, first byte stored first.
    pub fn effect2(&mut self, op: Opcode, hi: u8, lo: u8) {
        self.effect(op, u16::from_be_bytes([hi, lo]));
    }

    pub fn note(&mut self, note: u8) {
        self.effect(Opcode::Note, note as u16);
    }

    pub fn instrument(&mut self, ins: u8) {
        self.effect(Opcode::Instrument, ins as u16);
    }

    pub fn key_off(&mut self) {
        self.effect(Opcode::KeyOff, 0);
    }

    /// Protracker effect `eff` (0-15). An empty `0 00` effect is only kept
    /// when arpeggio memory is active.
    pub fn pt_effect(&mut self, eff: u8, dat: u8, arpmem: bool) {
        if eff == 0 && dat == 0 && !arpmem {
            return;
        }
        match Opcode::pt_effect(eff) {
            Some(op) => self.effect(op, dat as u16),
            None => log::debug!("[UNITRK] ignoring out of range PT effect {eff:#x}"),
        }
    }

    /// IT volume-column command.
    pub fn vol_effect(&mut self, eff: VolEffect, dat: u8) {
        self.effect2(Opcode::VolEffects, eff as u8, dat);
    }

    /// Close the current row.
    pub fn newline(&mut self) {
        let len = self.row_len();
        let header = self.buf[self.last_row];
        let repeat = header >> 5;
        let last_len = (header & 0x1f) as usize;

        if repeat < MAX_ROW_REPEAT
            && len == last_len
            && self.buf[self.last_row + 1..self.last_row + len]
                == self.buf[self.row_start + 1..self.row_start + len]
        {
            self.buf[self.last_row] += 0x20;
            self.buf.truncate(self.row_start + 1);
        } else {
            self.buf[self.row_start] = len as u8;
            self.last_row = self.row_start;
            self.row_start = self.buf.len();
            self.buf.push(0);
        }
    }

    /// Events dropped because of row overflow since the last reset.
    pub fn dropped_events(&self) -> usize {
        self.dropped
    }

    /// Snapshot the finished track. Events after the last `newline` are
    /// not part of it. The writer keeps its state.
    pub fn finish(&mut self) -> Track {
        self.buf[self.row_start] = 0;
        Track::from_bytes(&self.buf[..=self.row_start])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_rows_compress() {
        let mut w = TrackWriter::new();
        for _ in 0..64 {
            w.newline();
        }
        let track = w.finish();
        assert_eq!(track.row_count(), 64);
        // 64 empty rows: 8 headers of (7 << 5) | 1, then the terminator.
        assert_eq!(track.as_bytes().len(), 9);
        assert!(track.as_bytes()[..8].iter().all(|&b| b == 0xe1));
    }

    #[test]
    fn identical_rows_share_storage() {
        let mut w = TrackWriter::new();
        w.note(48);
        w.newline();
        w.note(48);
        w.newline();
        let track = w.finish();
        let rows: Vec<_> = track.rows().collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].repeat, 1);
        assert_eq!(track.as_bytes(), &[0x23, Opcode::Note as u8, 48, 0]);
    }

    #[test]
    fn repeat_ceiling_is_eight_rows() {
        let mut w = TrackWriter::new();
        for _ in 0..9 {
            w.instrument(3);
            w.newline();
        }
        let track = w.finish();
        let rows: Vec<_> = track.rows().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].repeat, 7);
        assert_eq!(rows[1].repeat, 0);
        assert_eq!(track.row_count(), 9);
    }

    #[test]
    fn different_rows_not_merged() {
        let mut w = TrackWriter::new();
        w.note(10);
        w.newline();
        w.note(11);
        w.newline();
        let track = w.finish();
        assert_eq!(track.rows().count(), 2);
    }

    #[test]
    fn reset_clears_previous_track() {
        let mut w = TrackWriter::new();
        w.note(1);
        w.newline();
        let _ = w.finish();
        w.reset();
        w.newline();
        let track = w.finish();
        assert_eq!(track.as_bytes(), &[0x01, 0]);
    }

    #[test]
    fn word_operands_big_endian() {
        let mut w = TrackWriter::new();
        w.effect(Opcode::MedSpeed, 0x1234);
        w.newline();
        let track = w.finish();
        assert_eq!(track.as_bytes(), &[4, Opcode::MedSpeed as u8, 0x12, 0x34, 0]);
    }

    #[test]
    fn empty_pt_effect_needs_arpmem() {
        let mut w = TrackWriter::new();
        w.pt_effect(0, 0, false);
        w.newline();
        w.pt_effect(0, 0, true);
        w.newline();
        let track = w.finish();
        assert_eq!(
            track.as_bytes(),
            &[1, 3, Opcode::PtEffect0 as u8, 0, 0]
        );
    }

    #[test]
    fn overlong_row_drops_events() {
        let mut w = TrackWriter::new();
        for i in 0..20 {
            w.note(i);
        }
        w.newline();
        let track = w.finish();
        let row = track.rows().next().unwrap();
        assert!(row.bytes().len() + 1 <= MAX_ROW_LEN);
        assert_eq!(row.events().count(), 15);
        assert_eq!(w.dropped_events(), 5);
    }

    #[test]
    fn reencoding_reproduces_bytes() {
        let mut w = TrackWriter::new();
        for row in 0..64u8 {
            if row % 4 == 0 {
                w.note(row);
                w.instrument(1);
            }
            if row % 16 == 3 {
                w.effect(Opcode::UltEffect9, 0x0102);
                w.key_off();
            }
            w.newline();
        }
        let original = w.finish();

        let mut again = TrackWriter::new();
        for row in original.rows() {
            for _ in 0..=row.repeat {
                for ev in row.events() {
                    again.effect(ev.opcode, ev.operand);
                }
                again.newline();
            }
        }
        assert_eq!(again.finish(), original);
    }
}
