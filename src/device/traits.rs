//! Storage device traits

use std::io;

/// Synchronous positional storage device.
///
/// Implementations must allow concurrent `read_sync` calls alongside a single
/// writer. Bytes written by `write_sync` are visible to readers of the same
/// device once the call returns.
pub trait SyncStorageDevice: Send + Sync + 'static {
    /// Read up to `buf.len()` bytes at `offset`
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write up to `buf.len()` bytes at `offset`
    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    /// Flush to stable storage
    fn flush_sync(&self) -> io::Result<()>;

    /// Truncate or extend to `size` bytes
    fn truncate_sync(&self, size: u64) -> io::Result<()>;

    /// Current size in bytes
    fn size_sync(&self) -> io::Result<u64>;

    /// Fill `buf` completely from `offset`.
    ///
    /// Fails with [`io::ErrorKind::UnexpectedEof`] if the device ends first.
    fn read_exact_sync(&self, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_sync(offset, buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("device ended at offset {offset}"),
                    ))
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Write all of `buf` at `offset`.
    fn write_all_sync(&self, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write_sync(offset, buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "device accepted no bytes",
                    ))
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
