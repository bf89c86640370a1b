//! Platform-specific raw disk I/O
//!
//! Positional reads and writes on a file or block device, optionally
//! bypassing the OS page cache:
//! - Linux: O_DIRECT flag
//! - macOS: F_NOCACHE fcntl
//!
//! With direct I/O enabled, unaligned requests go through an aligned bounce
//! buffer (read-modify-write for unaligned writes).

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tierio_common::{Error, Result};

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Alignment requirement for direct I/O (typically 4KB or 512 bytes)
pub const ALIGNMENT: usize = 4096;

/// Raw file handle with optional direct I/O
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    read_only: bool,
    direct: bool,
    /// Held across direct-I/O writes so a bounce read-modify-write never
    /// interleaves with another write to the same aligned block
    write_lock: Mutex<()>,
}

impl RawFile {
    /// Open an existing file or block device
    pub fn open(path: impl AsRef<Path>, read_only: bool, direct: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true);

        if !read_only {
            options.write(true);
        }

        Self::apply_direct_flag(&mut options, direct);

        let file = options
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to open {path_str}: {e}")))?;

        Self::apply_nocache(&file, &path_str, direct)?;

        let size = if Self::is_block_device(&path) {
            Self::get_block_device_size(&file, &path_str)?
        } else {
            file.metadata()
                .map_err(|e| Error::Storage(format!("failed to get metadata for {path_str}: {e}")))?
                .len()
        };

        Ok(Self {
            file,
            path: path_str,
            size,
            read_only,
            direct,
            write_lock: Mutex::new(()),
        })
    }

    /// Create a regular file of the given size (existing content is kept)
    ///
    /// For block devices the size parameter is ignored and the device is
    /// opened as is.
    pub fn create(path: impl AsRef<Path>, size: u64, direct: bool) -> Result<Self> {
        if Self::is_block_device(&path) {
            return Self::open(path, false, direct);
        }

        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        Self::apply_direct_flag(&mut options, direct);

        let file = options
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to create {path_str}: {e}")))?;

        let current = file
            .metadata()
            .map_err(|e| Error::Storage(format!("failed to get metadata for {path_str}: {e}")))?
            .len();
        if current < size {
            file.set_len(size)
                .map_err(|e| Error::Storage(format!("failed to set size for {path_str}: {e}")))?;
        }

        Self::apply_nocache(&file, &path_str, direct)?;

        Ok(Self {
            file,
            path: path_str,
            size: current.max(size),
            read_only: false,
            direct,
            write_lock: Mutex::new(()),
        })
    }

    #[cfg(target_os = "linux")]
    fn apply_direct_flag(options: &mut OpenOptions, direct: bool) {
        if direct {
            // O_DIRECT bypasses page cache on Linux
            options.custom_flags(libc::O_DIRECT);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_direct_flag(_options: &mut OpenOptions, _direct: bool) {}

    #[cfg(target_os = "macos")]
    #[allow(unsafe_code)]
    fn apply_nocache(file: &File, path: &str, direct: bool) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        if !direct {
            return Ok(());
        }
        // SAFETY: fcntl on a descriptor we own
        if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) } == -1 {
            return Err(Error::Storage(format!(
                "failed to set F_NOCACHE on {path}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    #[allow(clippy::unnecessary_wraps)]
    const fn apply_nocache(_file: &File, _path: &str, _direct: bool) -> Result<()> {
        Ok(())
    }

    /// Check if path is a block device
    fn is_block_device(path: impl AsRef<Path>) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(&path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    /// Get block device size using ioctl
    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn get_block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        // BLKGETSIZE64 ioctl
        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        // SAFETY: BLKGETSIZE64 writes a single u64 into `size`
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };

        if ret == -1 {
            return Err(Error::Storage(format!(
                "failed to get block device size for {path}: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(size)
    }

    /// Get block device size (non-Linux fallback)
    #[cfg(not(target_os = "linux"))]
    fn get_block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::io::{Seek, SeekFrom};
        let mut f = file;
        let size = f
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::Storage(format!("failed to get device size for {path}: {e}")))?;
        Ok(size)
    }

    /// Get the file size
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Get the file path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the file was opened with direct I/O
    pub const fn is_direct(&self) -> bool {
        self.direct
    }

    /// Read exactly `buf.len()` bytes at the given offset
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;

        if self.direct && !is_aligned(offset, buf) {
            let (start, len) = aligned_span(offset, buf.len());
            let mut bounce = AlignedBuffer::new(len);
            self.pread(start, bounce.as_mut_slice())?;
            let skip = usize::try_from(offset - start).unwrap_or(0);
            buf.copy_from_slice(&bounce.as_slice()[skip..skip + buf.len()]);
            return Ok(());
        }

        self.pread(offset, buf)
    }

    /// Write all of `buf` at the given offset
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::Storage(format!("{} is read-only", self.path)));
        }

        self.check_bounds(offset, buf.len())?;

        if !self.direct {
            return self.pwrite(offset, buf);
        }

        let _guard = self.write_lock.lock();
        if !is_aligned(offset, buf) {
            let (start, len) = aligned_span(offset, buf.len());
            let mut bounce = AlignedBuffer::new(len);
            self.pread(start, bounce.as_mut_slice())?;
            let skip = usize::try_from(offset - start).unwrap_or(0);
            bounce.as_mut_slice()[skip..skip + buf.len()].copy_from_slice(buf);
            return self.pwrite(start, bounce.as_slice());
        }

        self.pwrite(offset, buf)
    }

    fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::Storage(format!("read failed on {} at {offset}: {e}", self.path)))
    }

    fn pwrite(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Error::Storage(format!("write failed on {} at {offset}: {e}", self.path)))
    }

    /// Sync data to disk
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::Storage(format!("sync failed on {}: {e}", self.path)))
    }

    /// Sync data only (not metadata) to disk
    pub fn sync_data(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::Storage(format!("sync_data failed on {}: {e}", self.path)))
    }

    /// Punch a hole into the range, keeping the file size
    ///
    /// Filesystems without hole punching report success; the range simply
    /// stays allocated.
    pub fn punch_hole(&self, offset: u64, len: u64) -> Result<()> {
        self.fallocate(offset, len, true)
    }

    /// Make sure the range is backed by allocated blocks
    pub fn preallocate(&self, offset: u64, len: u64) -> Result<()> {
        self.fallocate(offset, len, false)
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn fallocate(&self, offset: u64, len: u64, punch: bool) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        let mode = if punch {
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE
        } else {
            libc::FALLOC_FL_KEEP_SIZE
        };
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| Error::invalid_argument("fallocate offset overflow"))?;
        let len = libc::off_t::try_from(len)
            .map_err(|_| Error::invalid_argument("fallocate length overflow"))?;

        // SAFETY: fallocate on a descriptor we own, no memory is passed
        let ret = unsafe { libc::fallocate(self.file.as_raw_fd(), mode, offset, len) };
        if ret == 0 {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EOPNOTSUPP | libc::EINVAL) => Ok(()),
            _ => Err(Error::Storage(format!(
                "fallocate failed on {}: {err}",
                self.path
            ))),
        }
    }

    #[cfg(not(target_os = "linux"))]
    #[allow(clippy::unnecessary_wraps)]
    fn fallocate(&self, _offset: u64, _len: u64, _punch: bool) -> Result<()> {
        Ok(())
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset.saturating_add(len as u64);
        if end > self.size {
            return Err(Error::Storage(format!(
                "range {offset}..{end} exceeds size {} of {}",
                self.size, self.path
            )));
        }
        Ok(())
    }
}

fn is_aligned(offset: u64, buf: &[u8]) -> bool {
    offset % ALIGNMENT as u64 == 0
        && buf.len() % ALIGNMENT == 0
        && (buf.as_ptr() as usize) % ALIGNMENT == 0
}

/// Smallest aligned `(start, len)` covering `offset..offset + len`
fn aligned_span(offset: u64, len: usize) -> (u64, usize) {
    let align = ALIGNMENT as u64;
    let start = offset / align * align;
    let end = (offset + len as u64).div_ceil(align) * align;
    (start, usize::try_from(end - start).unwrap_or(usize::MAX))
}

/// Aligned buffer for direct I/O operations
///
/// On Linux with O_DIRECT, the buffer must be aligned to the filesystem's
/// block size (typically 512 or 4096 bytes).
#[derive(Debug)]
pub struct AlignedBuffer {
    ptr: std::ptr::NonNull<u8>,
    len: usize,
    layout: std::alloc::Layout,
}

// SAFETY: the buffer exclusively owns its allocation
#[allow(unsafe_code)]
unsafe impl Send for AlignedBuffer {}
// SAFETY: shared access only hands out `&[u8]`
#[allow(unsafe_code)]
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Create a new zeroed aligned buffer, size rounded up to ALIGNMENT
    pub fn new(size: usize) -> Self {
        Self::with_alignment(size, ALIGNMENT)
    }

    /// Create a new zeroed buffer with custom alignment
    #[allow(unsafe_code)]
    pub fn with_alignment(size: usize, alignment: usize) -> Self {
        use std::alloc::{Layout, alloc_zeroed, handle_alloc_error};

        let aligned_size = size.max(1).div_ceil(alignment) * alignment;
        let layout = Layout::from_size_align(aligned_size, alignment)
            .unwrap_or_else(|_| panic!("invalid layout: size {aligned_size}, align {alignment}"));

        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = std::ptr::NonNull::new(raw) else {
            handle_alloc_error(layout)
        };

        Self {
            ptr,
            len: aligned_size,
            layout,
        }
    }

    /// Get the buffer as a slice
    #[allow(unsafe_code)]
    pub const fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialized bytes
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Get the buffer as a mutable slice
    #[allow(unsafe_code)]
    pub const fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len initialized bytes and uniquely borrowed
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Get the buffer size
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check if buffer is empty
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for AlignedBuffer {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: allocated in `with_alignment` with this exact layout
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}
