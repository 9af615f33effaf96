use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::SalvageError;

/// A raw block image opened for in-place repair.
///
/// Generic over the backing stream so tests can run against
/// `Cursor<Vec<u8>>`; production code uses `DiskImage<File>`.
pub struct DiskImage<S> {
    stream: S,
    len: u64,
}

impl DiskImage<File> {
    /// Open an existing image file read-write. Never creates or truncates.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SalvageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self { stream: file, len })
    }
}

impl<S: Read + Write + Seek> DiskImage<S> {
    /// Wrap an already-open stream. The image length is taken from the
    /// current end of the stream.
    pub fn new(mut stream: S) -> Result<Self, SalvageError> {
        let len = stream.seek(SeekFrom::End(0))?;
        Ok(Self { stream, len })
    }

    /// Total image length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Positioned read. Returns the number of bytes actually read; reads
    /// past the end of the image return a short count.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, SalvageError> {
        if offset >= self.len {
            return Ok(0);
        }
        let wanted = (self.len - offset).min(buf.len() as u64) as usize;
        self.stream.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < wanted {
            match self.stream.read(&mut buf[read..wanted]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(read)
    }

    /// Positioned read that treats a short count as a failure.
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), SalvageError> {
        let got = self.read_at(offset, buf)?;
        if got != buf.len() {
            return Err(SalvageError::ShortRead {
                offset,
                wanted: buf.len(),
                got,
            });
        }
        Ok(())
    }

    /// Positioned write followed by a flush, so an external reader observing
    /// the image after the call sees the structure fully written.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), SalvageError> {
        self.stream.seek(SeekFrom::Start(offset))?;
        self.stream.write_all(buf)?;
        self.stream.flush()?;
        self.len = self.len.max(offset + buf.len() as u64);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SalvageError> {
        self.stream.flush()?;
        Ok(())
    }

    /// Consume the handle and return the backing stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn image_of(bytes: Vec<u8>) -> DiskImage<Cursor<Vec<u8>>> {
        DiskImage::new(Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn test_read_at_full() {
        let mut img = image_of(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let mut buf = [0u8; 4];
        assert_eq!(img.read_at(2, &mut buf).unwrap(), 4);
        assert_eq!(buf, [3, 4, 5, 6]);
    }

    #[test]
    fn test_read_past_end_is_short() {
        let mut img = image_of(vec![9; 6]);
        let mut buf = [0u8; 4];
        assert_eq!(img.read_at(4, &mut buf).unwrap(), 2);
        assert_eq!(img.read_at(6, &mut buf).unwrap(), 0);
        assert_eq!(img.read_at(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_read_exact_at_rejects_short() {
        let mut img = image_of(vec![0; 10]);
        let mut buf = [0u8; 8];
        assert!(img.read_exact_at(0, &mut buf).is_ok());
        let err = img.read_exact_at(5, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            SalvageError::ShortRead {
                offset: 5,
                wanted: 8,
                got: 5
            }
        ));
    }

    #[test]
    fn test_write_at_then_read_back() {
        let mut img = image_of(vec![0; 16]);
        img.write_at(4, &[0xAA, 0xBB, 0xCC]).unwrap();
        let mut buf = [0u8; 3];
        img.read_exact_at(4, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB, 0xCC]);
        assert_eq!(img.len(), 16);
    }

    #[test]
    fn test_open_real_file() {
        use std::io::Write as _;
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[7u8; 1024]).unwrap();
        tmp.flush().unwrap();

        let mut img = DiskImage::open(tmp.path()).unwrap();
        assert_eq!(img.len(), 1024);
        img.write_at(512, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        img.read_exact_at(512, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }
}
