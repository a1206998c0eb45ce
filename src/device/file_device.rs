//! File system storage device

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::device::SyncStorageDevice;

/// A file accessed only through positional I/O.
///
/// No lock is taken: `pread`/`pwrite` style calls do not share a cursor, so
/// readers never block the writer.
#[derive(Debug)]
pub struct FileSystemFile {
    path: PathBuf,
    file: File,
    writable: bool,
}

impl FileSystemFile {
    /// Open a file for reading and writing, creating it if `create` is set
    pub fn open(path: impl AsRef<Path>, create: bool) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            writable: true,
        })
    }

    /// Create a new file, failing if it already exists
    pub fn create_new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            writable: true,
        })
    }

    /// Open an existing file read-only
    pub fn open_read_only(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            path,
            file,
            writable: false,
        })
    }

    /// Get the path to the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether writes are permitted
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn check_writable(&self) -> io::Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is open read-only", self.path.display()),
            ))
        }
    }
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}

impl SyncStorageDevice for FileSystemFile {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        read_at(&self.file, offset, buf)
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        self.check_writable()?;
        write_at(&self.file, offset, buf)
    }

    fn flush_sync(&self) -> io::Result<()> {
        if self.writable {
            self.file.sync_all()
        } else {
            Ok(())
        }
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        self.check_writable()?;
        self.file.set_len(size)
    }

    fn size_sync(&self) -> io::Result<u64> {
        self.file.metadata().map(|m| m.len())
    }
}
