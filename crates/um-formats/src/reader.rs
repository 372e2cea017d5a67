//! Random-access byte readers.
//!
//! Loaders read headers first and validate afterwards, so every primitive
//! here fails softly: a short read yields zeros and raises the sticky
//! end-of-file flag, which the caller checks after a batch of reads.
//! Seeking clears the flag.

use std::io::{self, Read, Seek, SeekFrom};

use binrw::{BinRead, Endian};
use um_ir::ModError;

/// Random-access byte source consumed by the loaders.
///
/// Also implements `std::io::Read + Seek` so fixed headers can be read with
/// `binrw`.
pub trait ByteReader: Read + Seek {
    /// Current absolute position.
    fn tell(&self) -> u64;

    /// Total stream length.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move to `pos`, clearing the end-of-file flag. Returns the new
    /// position.
    fn seek_to(&mut self, pos: SeekFrom) -> u64;

    /// True once a read came up short.
    fn eof(&self) -> bool;

    /// Read up to `buf.len()` bytes, zero-filling the remainder on a short
    /// read. Returns the number of bytes actually read.
    fn read_into(&mut self, buf: &mut [u8]) -> usize;

    fn rewind_to_start(&mut self) {
        self.seek_to(SeekFrom::Start(0));
    }

    fn skip(&mut self, n: i64) {
        self.seek_to(SeekFrom::Current(n));
    }

    /// Read exactly `buf.len()` bytes; false on a short read.
    fn read_exact_soft(&mut self, buf: &mut [u8]) -> bool {
        self.read_into(buf) == buf.len()
    }

    fn read_vec(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.read_into(&mut buf);
        buf
    }

    fn read_u8(&mut self) -> u8 {
        let mut b = [0u8; 1];
        self.read_into(&mut b);
        b[0]
    }

    fn read_i8(&mut self) -> i8 {
        self.read_u8() as i8
    }

    fn read_u16_le(&mut self) -> u16 {
        let mut b = [0u8; 2];
        self.read_into(&mut b);
        u16::from_le_bytes(b)
    }

    fn read_u16_be(&mut self) -> u16 {
        let mut b = [0u8; 2];
        self.read_into(&mut b);
        u16::from_be_bytes(b)
    }

    fn read_i16_le(&mut self) -> i16 {
        self.read_u16_le() as i16
    }

    fn read_i16_be(&mut self) -> i16 {
        self.read_u16_be() as i16
    }

    fn read_u32_le(&mut self) -> u32 {
        let mut b = [0u8; 4];
        self.read_into(&mut b);
        u32::from_le_bytes(b)
    }

    fn read_u32_be(&mut self) -> u32 {
        let mut b = [0u8; 4];
        self.read_into(&mut b);
        u32::from_be_bytes(b)
    }

    fn read_i32_le(&mut self) -> i32 {
        self.read_u32_le() as i32
    }

    fn read_i32_be(&mut self) -> i32 {
        self.read_u32_be() as i32
    }
}

// ---------------------------------------------------------------------------
// MemReader: cursor over a byte slice
// ---------------------------------------------------------------------------

/// Reader over an in-memory image.
#[derive(Clone, Debug)]
pub struct MemReader<'a> {
    data: &'a [u8],
    pos: u64,
    eof: bool,
}

impl<'a> MemReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            eof: false,
        }
    }
}

impl ByteReader for MemReader<'_> {
    fn tell(&self) -> u64 {
        self.pos
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn seek_to(&mut self, pos: SeekFrom) -> u64 {
        let target = match pos {
            SeekFrom::Start(p) => p as i128,
            SeekFrom::Current(d) => self.pos as i128 + d as i128,
            SeekFrom::End(d) => self.data.len() as i128 + d as i128,
        };
        self.pos = target.max(0) as u64;
        self.eof = false;
        self.pos
    }

    fn eof(&self) -> bool {
        self.eof
    }

    fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let start = (self.pos as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        buf[n..].fill(0);
        self.pos += buf.len() as u64;
        if n < buf.len() {
            self.eof = true;
        }
        n
    }
}

impl Read for MemReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let start = (self.pos as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        if n < buf.len() {
            self.eof = true;
        }
        Ok(n)
    }
}

impl Seek for MemReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(self.seek_to(pos))
    }
}

// ---------------------------------------------------------------------------
// StreamReader: adapter over any Read + Seek source
// ---------------------------------------------------------------------------

/// Reader over a seekable stream such as a `File`.
///
/// I/O errors are treated like end of file.
#[derive(Debug)]
pub struct StreamReader<R> {
    inner: R,
    pos: u64,
    len: u64,
    eof: bool,
}

impl<R: Read + Seek> StreamReader<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self {
            inner,
            pos: 0,
            len,
            eof: false,
        })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn fill(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.inner.read(&mut buf[n..]) {
                Ok(0) => break,
                Ok(k) => n += k,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("[READER] read error at {}: {e}", self.pos + n as u64);
                    break;
                }
            }
        }
        self.pos += n as u64;
        if n < buf.len() {
            self.eof = true;
        }
        n
    }
}

impl<R: Read + Seek> ByteReader for StreamReader<R> {
    fn tell(&self) -> u64 {
        self.pos
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn seek_to(&mut self, pos: SeekFrom) -> u64 {
        let target = match pos {
            SeekFrom::Start(p) => p as i128,
            SeekFrom::Current(d) => self.pos as i128 + d as i128,
            SeekFrom::End(d) => self.len as i128 + d as i128,
        };
        let target = target.max(0) as u64;
        match self.inner.seek(SeekFrom::Start(target)) {
            Ok(p) => self.pos = p,
            Err(e) => log::debug!("[READER] seek to {target} failed: {e}"),
        }
        self.eof = false;
        self.pos
    }

    fn eof(&self) -> bool {
        self.eof
    }

    fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let n = self.fill(buf);
        buf[n..].fill(0);
        if n < buf.len() {
            // keep position semantics identical to MemReader
            let missing = (buf.len() - n) as u64;
            self.pos += missing;
        }
        n
    }
}

impl<R: Read + Seek> Read for StreamReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.fill(buf))
    }
}

impl<R: Read + Seek> Seek for StreamReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(self.seek_to(pos))
    }
}

/// Read a fixed-size byte array (tags, names, tables).
pub fn read_array<const N: usize>(r: &mut dyn ByteReader) -> [u8; N] {
    let mut buf = [0u8; N];
    r.read_into(&mut buf);
    buf
}

/// Read a fixed-layout `binrw` record at the current position. The
/// record's own `#[br(big)]`/`#[br(little)]` attribute decides the byte
/// order. Any failure, a short read included, is a header error.
pub fn read_struct<T>(r: &mut dyn ByteReader) -> Result<T, ModError>
where
    T: for<'a> BinRead<Args<'a> = ()>,
{
    read_struct_args(r, ())
}

/// [`read_struct`] for records whose layout depends on `args`.
pub fn read_struct_args<T, A>(r: &mut dyn ByteReader, args: A) -> Result<T, ModError>
where
    T: for<'a> BinRead<Args<'a> = A>,
{
    let mut r = r;
    T::read_options(&mut r, Endian::Little, args).map_err(|e| {
        log::debug!("[READER] record read failed: {e}");
        ModError::LoadingHeader
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn scalar_reads_both_orders() {
        let data = [0x34, 0x12, 0x12, 0x34, 0x78, 0x56, 0x34, 0x12];
        let mut r = MemReader::new(&data);
        assert_eq!(r.read_u16_le(), 0x1234);
        assert_eq!(r.read_u16_be(), 0x1234);
        assert_eq!(r.read_u32_le(), 0x12345678);
        assert!(!r.eof());
    }

    #[test]
    fn short_read_sets_eof_and_zero_fills() {
        let data = [0xaa];
        let mut r = MemReader::new(&data);
        assert_eq!(r.read_u16_le(), 0x00aa);
        assert!(r.eof());
        r.seek_to(SeekFrom::Start(0));
        assert!(!r.eof());
        assert_eq!(r.read_u8(), 0xaa);
    }

    #[test]
    fn reading_exactly_to_end_is_not_eof() {
        let data = [1, 2];
        let mut r = MemReader::new(&data);
        r.read_u16_le();
        assert!(!r.eof());
        r.read_u8();
        assert!(r.eof());
    }

    #[test]
    fn stream_reader_matches_mem_reader() {
        let data: Vec<u8> = (0..32).collect();
        let mut s = StreamReader::new(Cursor::new(data.clone())).unwrap();
        let mut m = MemReader::new(&data);
        assert_eq!(s.len(), 32);
        s.seek_to(SeekFrom::Start(30));
        m.seek_to(SeekFrom::Start(30));
        assert_eq!(s.read_u32_be(), m.read_u32_be());
        assert_eq!(s.eof(), m.eof());
        assert_eq!(s.tell(), m.tell());
    }
}
