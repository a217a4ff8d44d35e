use crate::error::Result;
use std::fs;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Descriptors a file wants the runtime to watch, split by event kind.
#[derive(Debug, Default, Clone)]
pub struct Interest {
    pub read: Vec<RawFd>,
    pub write: Vec<RawFd>,
    pub except: Vec<RawFd>,
}

impl Interest {
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty() && self.except.is_empty()
    }

    pub fn clear(&mut self) {
        self.read.clear();
        self.write.clear();
        self.except.clear();
    }

    /// Every descriptor in any of the three sets, with duplicates.
    pub fn iter_all(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.read
            .iter()
            .chain(self.write.iter())
            .chain(self.except.iter())
            .copied()
    }
}

/// The minimum surface the runtime needs from a byte source/sink.
///
/// A file advertises the descriptors it wants watched via `select_fds`; when
/// one of them signals, the matching event handler runs first and may veto
/// the follow-up `read`/`write` call. After `read` has returned 0 (EOF) the
/// file must stop advertising its read descriptor, and it must advertise its
/// write descriptor only while `writer_has_data` holds, so the runtime is not
/// woken by perpetually-writable descriptors.
pub trait File {
    /// Add the descriptors to watch to `interest`.
    fn select_fds(&self, interest: &mut Interest, writer_has_data: bool);

    /// React to read readiness on `fd`; return false to skip the `read`.
    fn read_event(&mut self, fd: RawFd) -> Result<bool> {
        let _ = fd;
        Ok(true)
    }

    /// React to write readiness on `fd`; return false to skip the `write`.
    fn write_event(&mut self, fd: RawFd) -> Result<bool> {
        let _ = fd;
        Ok(true)
    }

    /// React to an exception condition on `fd`.
    fn except_event(&mut self, fd: RawFd) -> Result<()> {
        let _ = fd;
        Ok(())
    }

    /// Read once; 0 means EOF and latches `eof()`.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write once; may accept a prefix.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Sticky EOF indicator.
    fn eof(&self) -> bool;
}

/// A [`File`] over plain file descriptors: an optional read handle, an
/// optional write handle (which may wrap the same underlying object via
/// `dup`), and a sticky EOF latch.
#[derive(Debug)]
pub struct FdFile {
    reader: Option<fs::File>,
    writer: Option<fs::File>,
    eof: bool,
}

impl FdFile {
    /// Read-only file.
    pub fn reader(fd: impl Into<OwnedFd>) -> Self {
        Self {
            reader: Some(fs::File::from(fd.into())),
            writer: None,
            eof: false,
        }
    }

    /// Write-only file.
    pub fn writer(fd: impl Into<OwnedFd>) -> Self {
        Self {
            reader: None,
            writer: Some(fs::File::from(fd.into())),
            eof: false,
        }
    }

    /// File with separate read and write descriptors.
    pub fn pair(read: impl Into<OwnedFd>, write: impl Into<OwnedFd>) -> Self {
        Self {
            reader: Some(fs::File::from(read.into())),
            writer: Some(fs::File::from(write.into())),
            eof: false,
        }
    }
}

impl File for FdFile {
    fn select_fds(&self, interest: &mut Interest, writer_has_data: bool) {
        if !self.eof {
            if let Some(reader) = &self.reader {
                interest.read.push(reader.as_raw_fd());
            }
        }
        if writer_has_data {
            if let Some(writer) = &self.writer {
                interest.write.push(writer.as_raw_fd());
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(reader) = &mut self.reader else {
            self.eof = true;
            return Ok(0);
        };
        let n = reader.read(buf)?;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let Some(writer) = &mut self.writer else {
            return Ok(0);
        };
        Ok(writer.write(buf)?)
    }

    fn eof(&self) -> bool {
        self.eof
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;

    #[test]
    fn test_fd_file_reads_from_pipe() {
        let (read_end, write_end) = pipe().unwrap();
        let mut file = FdFile::reader(read_end);
        let mut tx = fs::File::from(write_end);

        tx.write_all(b"hello").unwrap();
        drop(tx);

        let mut buf = [0u8; 16];
        assert_eq!(file.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert!(!file.eof());

        assert_eq!(file.read(&mut buf).unwrap(), 0);
        assert!(file.eof());
    }

    #[test]
    fn test_fd_file_write() {
        let (read_end, write_end) = pipe().unwrap();
        let mut file = FdFile::writer(write_end);
        let mut rx = fs::File::from(read_end);

        assert_eq!(file.write(b"ping").unwrap(), 4);
        drop(file);

        let mut buf = Vec::new();
        rx.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"ping");
    }

    #[test]
    fn test_select_fds_suppresses_read_after_eof() {
        let (read_end, write_end) = pipe().unwrap();
        let mut file = FdFile::reader(read_end);
        drop(fs::File::from(write_end));

        let mut interest = Interest::default();
        file.select_fds(&mut interest, false);
        assert_eq!(interest.read.len(), 1);
        assert!(interest.write.is_empty());

        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf).unwrap(), 0);

        interest.clear();
        file.select_fds(&mut interest, false);
        assert!(interest.is_empty());
    }

    #[test]
    fn test_select_fds_gates_write_on_pending_data() {
        let (read_end, write_end) = pipe().unwrap();
        let file = FdFile::pair(read_end, write_end);

        let mut interest = Interest::default();
        file.select_fds(&mut interest, false);
        assert_eq!(interest.read.len(), 1);
        assert!(interest.write.is_empty());

        interest.clear();
        file.select_fds(&mut interest, true);
        assert_eq!(interest.read.len(), 1);
        assert_eq!(interest.write.len(), 1);
    }

    #[test]
    fn test_missing_halves_read_and_write_nothing() {
        let (read_end, write_end) = pipe().unwrap();
        let mut read_only = FdFile::reader(read_end);
        assert_eq!(read_only.write(b"x").unwrap(), 0);

        let mut write_only = FdFile::writer(write_end);
        let mut buf = [0u8; 4];
        assert_eq!(write_only.read(&mut buf).unwrap(), 0);
        // A missing read half looks like EOF, not like data that never comes.
        assert!(write_only.eof());
    }
}
