//! Positional file I/O, grounded in the teacher's `fs/file.rs` `FileExt`
//! trait: every segment read/write is positional (`pread`/`pwrite`) rather
//! than seek-then-read, since many threads share the same open fd.

use std::fs::File;
use std::io::{self, ErrorKind};

pub trait FileExt {
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    fn sync_all(&self) -> io::Result<()>;
    fn set_len(&self, len: u64) -> io::Result<()>;
}

impl FileExt for File {
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut written = 0;
        while written != buf.len() {
            let n = nix::sys::uio::pwrite(self, &buf[written..], (offset + written as u64) as i64)
                .map_err(io::Error::from)?;
            if n == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "pwrite wrote zero bytes"));
            }
            written += n;
        }
        Ok(())
    }

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut read = 0;
        while read != buf.len() {
            let n = nix::sys::uio::pread(self, &mut buf[read..], (offset + read as u64) as i64)
                .map_err(io::Error::from)?;
            if n == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "unexpected end-of-file",
                ));
            }
            read += n;
        }
        Ok(())
    }

    fn sync_all(&self) -> io::Result<()> {
        File::sync_all(self)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}
