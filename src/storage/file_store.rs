//! Block Store
//!
//! Positional file I/O plus the free-space bitmap for the file. The raw byte
//! resource is a [`BlockFile`]: a locked disk file, or a growable buffer for
//! in-memory stores.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt as PositionalExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{AtlasError, ErrorCode, Result};

use super::free_space::FreeSpaceBitSet;

/// Byte-addressable resource the store is kept in
pub trait BlockFile: Send + Sync {
    /// Read into `buf` at `pos`, returning the number of bytes read (short at EOF)
    fn read_at(&self, buf: &mut [u8], pos: u64) -> io::Result<usize>;

    fn write_at(&self, data: &[u8], pos: u64) -> io::Result<()>;

    fn size(&self) -> io::Result<u64>;

    fn truncate(&self, size: u64) -> io::Result<()>;

    fn sync(&self) -> io::Result<()>;

    /// Take an exclusive (or shared) lock, `false` if another process holds it
    fn try_lock(&self, exclusive: bool) -> io::Result<bool>;

    /// Release the lock taken by `try_lock`
    fn unlock(&self) -> io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Disk File
// =============================================================================

/// A file on disk, locked for the lifetime of the handle
pub struct DiskFile {
    file: File,
}

impl DiskFile {
    pub fn open(path: &Path, read_only: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)?;
        Ok(Self { file })
    }
}

impl BlockFile for DiskFile {
    fn read_at(&self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], pos + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    fn write_at(&self, data: &[u8], pos: u64) -> io::Result<()> {
        self.file.write_all_at(data, pos)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn try_lock(&self, exclusive: bool) -> io::Result<bool> {
        let result = if exclusive {
            FileExt::try_lock_exclusive(&self.file)
        } else {
            FileExt::try_lock_shared(&self.file)
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn unlock(&self) -> io::Result<()> {
        FileExt::unlock(&self.file)
    }
}

impl Drop for DiskFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

// =============================================================================
// Memory File
// =============================================================================

/// Growable in-memory buffer
#[derive(Default)]
pub struct MemoryFile {
    data: RwLock<Vec<u8>>,
}

impl MemoryFile {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockFile for MemoryFile {
    fn read_at(&self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        let data = self.data.read();
        let start = (pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, bytes: &[u8], pos: u64) -> io::Result<()> {
        let mut data = self.data.write();
        let end = pos as usize + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[pos as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        self.data.write().resize(size as usize, 0);
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn try_lock(&self, _exclusive: bool) -> io::Result<bool> {
        Ok(true)
    }
}

// =============================================================================
// File Store
// =============================================================================

/// File plus free-space accounting
pub struct FileStore {
    /// Underlying resource
    file: Box<dyn BlockFile>,
    /// Path of the file, `None` in memory
    path: Option<PathBuf>,
    read_only: bool,
    /// Block occupancy
    free_space: Mutex<FreeSpaceBitSet>,
    /// Cached file size
    size: AtomicU64,
    /// I/O counters, compared by auto-compaction to detect idleness
    read_count: AtomicU64,
    read_bytes: AtomicU64,
    write_count: AtomicU64,
    write_bytes: AtomicU64,
}

impl FileStore {
    /// Open (creating if needed) and lock the store file, or an in-memory file
    pub fn open(path: Option<&Path>, read_only: bool) -> Result<Self> {
        let file: Box<dyn BlockFile> = match path {
            Some(path) => {
                if read_only && !path.exists() {
                    return Err(AtlasError::store(
                        ErrorCode::ReadingFailed,
                        format!("File not found: {}", path.display()),
                    ));
                }
                let disk = DiskFile::open(path, read_only).map_err(|e| {
                    AtlasError::io(
                        ErrorCode::ReadingFailed,
                        format!("Could not open file {}", path.display()),
                        e,
                    )
                })?;
                let locked = disk.try_lock(!read_only).map_err(|e| {
                    AtlasError::io(ErrorCode::FileLocked, "Could not lock file", e)
                })?;
                if !locked {
                    return Err(AtlasError::store(
                        ErrorCode::FileLocked,
                        format!("The file is locked: {}", path.display()),
                    ));
                }
                Box::new(disk)
            }
            None => Box::new(MemoryFile::new()),
        };
        Self::with_file(file, path.map(Path::to_path_buf), read_only)
    }

    /// Wrap an already opened block file
    pub fn with_file(
        file: Box<dyn BlockFile>,
        path: Option<PathBuf>,
        read_only: bool,
    ) -> Result<Self> {
        let size = file
            .size()
            .map_err(|e| AtlasError::io(ErrorCode::ReadingFailed, "Could not read file size", e))?;
        debug!(path = ?path, size, read_only, "Opened file store");
        Ok(Self {
            file,
            path,
            read_only,
            free_space: Mutex::new(FreeSpaceBitSet::new()),
            size: AtomicU64::new(size),
            read_count: AtomicU64::new(0),
            read_bytes: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
        })
    }

    // -------------------------------------------------------------------------
    // I/O
    // -------------------------------------------------------------------------

    /// Read exactly `len` bytes at `pos`
    pub fn read_fully(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self.file.read_at(&mut buf, pos).map_err(|e| {
            AtlasError::io(
                ErrorCode::ReadingFailed,
                format!("Reading from file failed at {} (length {})", pos, len),
                e,
            )
        })?;
        self.read_count.fetch_add(1, Ordering::Relaxed);
        self.read_bytes.fetch_add(n as u64, Ordering::Relaxed);
        if n < len {
            return Err(AtlasError::corrupt(format!(
                "Short read at {}: wanted {} bytes, got {}",
                pos, len, n
            )));
        }
        Ok(buf)
    }

    /// Read up to `len` bytes at `pos`, stopping at end of file
    pub fn read_up_to(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let available = self.size().saturating_sub(pos) as usize;
        self.read_fully(pos, len.min(available))
    }

    pub fn write_fully(&self, pos: u64, data: &[u8]) -> Result<()> {
        self.file.write_at(data, pos).map_err(|e| {
            AtlasError::io(
                ErrorCode::WritingFailed,
                format!("Writing to file failed at {} (length {})", pos, data.len()),
                e,
            )
        })?;
        self.size.fetch_max(pos + data.len() as u64, Ordering::AcqRel);
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.write_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Copy `len` bytes inside the file
    pub fn copy(&self, from: u64, to: u64, len: u64) -> Result<()> {
        const PIECE: u64 = 1024 * 1024;
        let mut done = 0;
        while done < len {
            let n = PIECE.min(len - done);
            let data = self.read_fully(from + done, n as usize)?;
            self.write_fully(to + done, &data)?;
            done += n;
        }
        Ok(())
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        self.file.truncate(size).map_err(|e| {
            AtlasError::io(
                ErrorCode::WritingFailed,
                format!("Could not truncate file to size {}", size),
                e,
            )
        })?;
        self.size.store(size, Ordering::Release);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file
            .sync()
            .map_err(|e| AtlasError::io(ErrorCode::WritingFailed, "Could not sync file", e))
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Give up the file lock so the file can be opened again
    pub fn release(&self) {
        if let Err(e) = self.file.unlock() {
            debug!(path = ?self.path, error = %e, "Could not unlock file");
        }
    }

    // -------------------------------------------------------------------------
    // Space Accounting
    // -------------------------------------------------------------------------

    pub fn allocate(&self, length: u64, reserved_low: u64, reserved_high: i64) -> u64 {
        self.free_space.lock().allocate(length, reserved_low, reserved_high)
    }

    pub fn predict_allocation(&self, blocks: u64, reserved_low: u64, reserved_high: i64) -> u64 {
        self.free_space
            .lock()
            .predict_allocation(blocks, reserved_low, reserved_high)
    }

    pub fn mark_used(&self, pos: u64, length: u64) -> Result<()> {
        self.free_space.lock().mark_used(pos, length)
    }

    pub fn free(&self, pos: u64, length: u64) {
        self.free_space.lock().free(pos, length)
    }

    pub fn is_fully_free(&self, pos: u64, length: u64) -> bool {
        self.free_space.lock().is_fully_free(pos, length)
    }

    /// Forget all allocations
    pub fn clear(&self) {
        self.free_space.lock().clear()
    }

    pub fn fill_rate(&self) -> u32 {
        self.free_space.lock().fill_rate()
    }

    pub fn projected_fill_rate(&self, vacated_blocks: i64) -> u32 {
        self.free_space.lock().projected_fill_rate(vacated_blocks)
    }

    pub fn first_free(&self) -> u64 {
        self.free_space.lock().first_free()
    }

    pub fn after_last_block(&self) -> u64 {
        self.free_space.lock().after_last_block()
    }

    pub fn free_block_count(&self) -> u64 {
        self.free_space.lock().free_block_count()
    }

    pub fn move_priority(&self, block: u64) -> u64 {
        self.free_space.lock().move_priority(block)
    }

    /// Bytes up to the end of the last used block
    pub fn file_length_in_use(&self) -> u64 {
        self.free_space.lock().last_byte()
    }

    // -------------------------------------------------------------------------
    // Info
    // -------------------------------------------------------------------------

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn write_bytes(&self) -> u64 {
        self.write_bytes.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("size", &self.size())
            .field("read_only", &self.read_only)
            .finish()
    }
}
