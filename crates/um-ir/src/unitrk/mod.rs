//! UniTrk: the compact per-channel track bytecode.
//!
//! A track is a sequence of rows terminated by a zero byte. Each row starts
//! with a header byte whose low five bits are the row's total byte length
//! (header included) and whose high three bits are a repeat count: the row
//! applies to `repeat + 1` consecutive pattern rows. The rest of the row is
//! a list of events, each an [`Opcode`] byte followed by 0, 1 or 2 operand
//! bytes. Two-byte operands are stored high byte first.

mod opcode;
mod reader;
mod writer;

pub use opcode::{Opcode, VolEffect};
pub use reader::{Event, Events, Row, RowCursor, Rows};
pub use writer::{TrackWriter, MAX_ROW_LEN, MAX_ROW_REPEAT};

use alloc::boxed::Box;

/// An encoded track. Never empty: always ends with the zero terminator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Track {
    data: Box<[u8]>,
}

impl Track {
    /// Wrap raw bytecode, appending a terminator if it is missing.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = alloc::vec::Vec::with_capacity(bytes.len() + 1);
        data.extend_from_slice(bytes);
        if data.last() != Some(&0) {
            data.push(0);
        }
        Self {
            data: data.into_boxed_slice(),
        }
    }

    /// Check externally supplied bytecode: every row's length byte must
    /// cover exactly its known opcodes and operands, and the terminator
    /// must be present.
    pub fn validated(bytes: &[u8]) -> Option<Self> {
        let mut cur = 0;
        loop {
            let header = *bytes.get(cur)?;
            cur += 1;
            if header == 0 {
                break;
            }
            let end = cur + (header & 0x1f) as usize - 1;
            if header & 0x1f == 0 || end > bytes.len() {
                return None;
            }
            while cur < end {
                let op = Opcode::from_u8(bytes[cur])?;
                cur += 1 + op.operand_width();
            }
            if cur != end {
                return None;
            }
        }
        Some(Self::from_bytes(&bytes[..cur]))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Iterate the stored rows. Each may stand for several pattern rows.
    pub fn rows(&self) -> Rows<'_> {
        Rows::new(&self.data)
    }

    /// Number of pattern rows covered by the track.
    pub fn row_count(&self) -> usize {
        self.rows().map(|r| r.repeat as usize + 1).sum()
    }

    /// Locate the stored row covering pattern row `row`.
    pub fn find_row(&self, row: usize) -> Option<Row<'_>> {
        let mut remaining = row;
        for r in self.rows() {
            let span = r.repeat as usize + 1;
            if span > remaining {
                return Some(r);
            }
            remaining -= span;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validated_bytecode() {
        let note = Opcode::Note as u8;
        assert!(Track::validated(&[3, note, 12, 0]).is_some());
        // operand runs past the row length
        assert!(Track::validated(&[2, note, 12, 0]).is_none());
        // missing terminator
        assert!(Track::validated(&[3, note, 12]).is_none());
        // unknown opcode
        assert!(Track::validated(&[2, 0xf0, 0]).is_none());
    }
}
