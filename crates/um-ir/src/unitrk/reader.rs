//! Track decoding.

use super::opcode::Opcode;

/// A stored row, standing for `repeat + 1` pattern rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Row<'a> {
    pub repeat: u8,
    bytes: &'a [u8],
}

impl<'a> Row<'a> {
    /// Event bytes of the row, without the header.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn cursor(&self) -> RowCursor<'a> {
        RowCursor::new(self.bytes)
    }

    pub fn events(&self) -> Events<'a> {
        Events {
            cursor: self.cursor(),
        }
    }
}

/// Iterator over the stored rows of a track.
#[derive(Clone, Debug)]
pub struct Rows<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Rows<'a> {
    pub(super) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for Rows<'a> {
    type Item = Row<'a>;

    fn next(&mut self) -> Option<Row<'a>> {
        let header = *self.data.get(self.pos)?;
        let len = (header & 0x1f) as usize;
        if len == 0 {
            return None;
        }
        let start = self.pos + 1;
        let end = (self.pos + len).min(self.data.len());
        self.pos += len;
        Some(Row {
            repeat: header >> 5,
            bytes: self.data.get(start..end).unwrap_or(&[]),
        })
    }
}

/// Byte cursor over one row. Reads past the end of the row yield 0.
#[derive(Clone, Debug)]
pub struct RowCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> RowCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    pub fn get_byte(&mut self) -> u8 {
        match self.bytes.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                b
            }
            None => 0,
        }
    }

    pub fn get_word(&mut self) -> u16 {
        let hi = self.get_byte() as u16;
        let lo = self.get_byte() as u16;
        (hi << 8) | lo
    }

    /// Skip the operand of `op`.
    pub fn skip_operand(&mut self, op: Opcode) {
        self.pos = (self.pos + op.operand_width()).min(self.bytes.len());
    }
}

/// A decoded event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    pub opcode: Opcode,
    pub operand: u16,
}

/// Iterator over the events in a row. Stops at the first unknown opcode.
#[derive(Clone, Debug)]
pub struct Events<'a> {
    cursor: RowCursor<'a>,
}

impl<'a> Iterator for Events<'a> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        if self.cursor.at_end() {
            return None;
        }
        let opcode = Opcode::from_u8(self.cursor.get_byte())?;
        let operand = match opcode.operand_width() {
            0 => 0,
            1 => self.cursor.get_byte() as u16,
            _ => self.cursor.get_word(),
        };
        Some(Event { opcode, operand })
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Track, TrackWriter};
    use super::*;

    fn sample_track() -> Track {
        let mut w = TrackWriter::new();
        w.note(36);
        w.instrument(0);
        w.newline();
        w.newline();
        w.newline();
        w.effect(Opcode::S3mEffectA, 6);
        w.newline();
        w.finish()
    }

    #[test]
    fn find_row_walks_repeats() {
        let track = sample_track();
        let first = track.find_row(0).unwrap();
        assert_eq!(first.events().next().unwrap().opcode, Opcode::Note);
        // rows 1 and 2 share one stored row
        let empty = track.find_row(2).unwrap();
        assert_eq!(empty.repeat, 1);
        assert_eq!(empty.events().count(), 0);
        let last = track.find_row(3).unwrap();
        assert_eq!(
            last.events().collect::<Vec<_>>(),
            vec![Event {
                opcode: Opcode::S3mEffectA,
                operand: 6
            }]
        );
        assert!(track.find_row(4).is_none());
    }

    #[test]
    fn cursor_reads_zero_past_row_end() {
        let mut c = RowCursor::new(&[Opcode::Note as u8]);
        assert_eq!(c.get_byte(), Opcode::Note as u8);
        assert_eq!(c.get_byte(), 0);
        assert_eq!(c.get_word(), 0);
        assert!(c.at_end());
    }

    #[test]
    fn skip_operand_by_width() {
        let bytes = [Opcode::OktArp as u8, 1, 2, Opcode::KeyOff as u8, Opcode::Note as u8, 9];
        let mut c = RowCursor::new(&bytes);
        let op = Opcode::from_u8(c.get_byte()).unwrap();
        c.skip_operand(op);
        assert_eq!(c.get_byte(), Opcode::KeyOff as u8);
        c.skip_operand(Opcode::KeyOff);
        assert_eq!(c.get_byte(), Opcode::Note as u8);
        assert_eq!(c.get_byte(), 9);
    }

    #[test]
    fn unknown_opcode_stops_events() {
        let track = Track::from_bytes(&[4, Opcode::Note as u8, 1, 0xfe]);
        let row = track.rows().next().unwrap();
        assert_eq!(row.events().count(), 1);
    }
}
