//! Text helpers shared by the loaders.

use crate::reader::ByteReader;

/// Turn a fixed-size name field into a string.
///
/// Trailing blanks and control bytes are stripped; with `strict` the
/// string also ends at the first NUL. Remaining control bytes become `.`
/// and bytes above 0x7f are taken as Latin-1.
pub fn dup_str(bytes: &[u8], strict: bool) -> String {
    let mut len = bytes.len();
    while len > 0 && bytes[len - 1] <= 0x20 {
        len -= 1;
    }
    if strict {
        if let Some(nul) = bytes[..len].iter().position(|&b| b == 0) {
            len = nul;
        }
    }
    bytes[..len]
        .iter()
        .map(|&b| if b < 0x20 { '.' } else { char::from(b) })
        .collect()
}

/// Read `len` bytes and return them as a name string.
pub fn read_name(r: &mut dyn ByteReader, len: usize, strict: bool) -> String {
    dup_str(&r.read_vec(len), strict)
}

/// Read a free-form song message. Carriage returns become line feeds and
/// the text ends at the first NUL. Returns `None` for an empty message.
pub fn read_comment(r: &mut dyn ByteReader, len: usize) -> Option<String> {
    if len == 0 {
        return None;
    }
    let raw = r.read_vec(len);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    if end == 0 {
        return None;
    }
    Some(
        raw[..end]
            .iter()
            .map(|&b| if b == b'\r' { '\n' } else { char::from(b) })
            .collect(),
    )
}

/// Read a message stored as fixed-width lines padded with spaces or NULs.
/// Returns `None` when every line is blank.
pub fn read_lined_comment(r: &mut dyn ByteReader, len: usize, line_len: usize) -> Option<String> {
    if len == 0 || line_len == 0 {
        return None;
    }
    let raw = r.read_vec(len);
    let lines: Vec<String> = raw
        .chunks(line_len)
        .map(|line| {
            let end = line.iter().position(|&b| b == 0).unwrap_or(line.len());
            let text = &line[..end];
            let trimmed = text.len() - text.iter().rev().take_while(|&&b| b == b' ').count();
            text[..trimmed].iter().map(|&b| char::from(b)).collect()
        })
        .collect();
    if lines.iter().all(|l| l.is_empty()) {
        return None;
    }
    Some(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemReader;

    #[test]
    fn trailing_blanks_and_nuls_are_stripped() {
        assert_eq!(dup_str(b"hello   \0\0", false), "hello");
        assert_eq!(dup_str(b"\0\0\0", false), "");
    }

    #[test]
    fn strict_cuts_at_nul() {
        assert_eq!(dup_str(b"ab\0junk", true), "ab");
        assert_eq!(dup_str(b"ab\0junk", false), "ab.junk");
    }

    #[test]
    fn high_bytes_are_latin1() {
        assert_eq!(dup_str(&[b'c', 0xe9], false), "c\u{e9}");
    }

    #[test]
    fn comment_translates_carriage_returns() {
        let data = b"one\rtwo\0xx";
        let mut r = MemReader::new(data);
        assert_eq!(read_comment(&mut r, data.len()).as_deref(), Some("one\ntwo"));
        let mut r = MemReader::new(b"\0abc");
        assert_eq!(read_comment(&mut r, 4), None);
    }

    #[test]
    fn lined_comment_trims_each_line() {
        let data = b"first   second  \0\0\0\0\0\0\0\0";
        let mut r = MemReader::new(data);
        assert_eq!(
            read_lined_comment(&mut r, data.len(), 8).as_deref(),
            Some("first\nsecond\n")
        );
        let mut r = MemReader::new(b"        ");
        assert_eq!(read_lined_comment(&mut r, 8, 4), None);
    }
}
