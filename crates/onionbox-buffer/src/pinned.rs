//! Page-aligned heap regions locked against swap for their whole lifetime.
//!
//! A [`PinnedRegion`] is `mlock`ed as soon as it is allocated and stays
//! locked until [`PinnedRegion::release`] (or `Drop`) wipes every byte of
//! capacity and unlocks it. Allocations are rounded up to whole pages so two
//! regions never share a page; `munlock` on one region can therefore never
//! unpin another region's bytes.
//!
//! Invariant: bytes in `[len, capacity)` are always zero.

use std::alloc::{self, Layout};
use std::io::{self, Seek, SeekFrom, Write};
use std::ptr::NonNull;
use std::sync::OnceLock;

use onionbox_core::{BoxError, BoxResult};
use tracing::{error, warn};
use zeroize::Zeroize;

/// What to do when the OS refuses to lock a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinMode {
    /// `mlock` failure is [`BoxError::PinningFailed`].
    #[default]
    Required,
    /// `mlock` failure is logged and the region stays unpinned.
    BestEffort,
}

impl PinMode {
    pub fn from_required(required: bool) -> Self {
        if required {
            PinMode::Required
        } else {
            PinMode::BestEffort
        }
    }
}

fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        // SAFETY: sysconf has no memory-safety preconditions.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if raw > 0 {
            raw as usize
        } else {
            4096
        }
    })
}

fn round_to_pages(n: usize) -> io::Result<usize> {
    let page = page_size();
    n.checked_add(page - 1)
        .map(|v| v / page * page)
        .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "region size overflow"))
}

/// Owned, zero-on-release byte buffer kept out of swap.
pub struct PinnedRegion {
    ptr: NonNull<u8>,
    capacity: usize,
    len: usize,
    pinned: bool,
    mode: PinMode,
}

// SAFETY: the region exclusively owns its allocation; shared access only
// hands out `&[u8]`, mutation requires `&mut self`.
unsafe impl Send for PinnedRegion {}
unsafe impl Sync for PinnedRegion {}

impl PinnedRegion {
    /// An empty region with no backing allocation.
    pub fn new(mode: PinMode) -> Self {
        Self {
            ptr: NonNull::dangling(),
            capacity: 0,
            len: 0,
            pinned: false,
            mode,
        }
    }

    /// Allocate and pin at least `capacity` bytes.
    pub fn with_capacity(capacity: usize, mode: PinMode) -> BoxResult<Self> {
        if capacity == 0 {
            return Ok(Self::new(mode));
        }
        let capacity = round_to_pages(capacity)?;
        let layout = Layout::from_size_align(capacity, page_size())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout)
        };

        let mut region = Self {
            ptr,
            capacity,
            len: 0,
            pinned: false,
            mode,
        };
        region.pin()?;
        Ok(region)
    }

    /// A pinned region of `len` zero bytes.
    pub fn zeroed(len: usize, mode: PinMode) -> BoxResult<Self> {
        let mut region = Self::with_capacity(len, mode)?;
        region.len = len;
        Ok(region)
    }

    /// A pinned copy of `bytes`.
    pub fn from_slice(bytes: &[u8], mode: PinMode) -> BoxResult<Self> {
        let mut region = Self::with_capacity(bytes.len(), mode)?;
        region.extend_from_slice(bytes)?;
        Ok(region)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn mode(&self) -> PinMode {
        self.mode
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for `capacity >= len` bytes (or dangling with len 0).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    fn whole_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for `capacity` bytes.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }

    /// Ensure room for `additional` more bytes, moving to a larger pinned
    /// allocation if needed. The old allocation is wiped and unpinned.
    pub fn reserve(&mut self, additional: usize) -> BoxResult<()> {
        let needed = self
            .len
            .checked_add(additional)
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "region size overflow"))?;
        if needed <= self.capacity {
            return Ok(());
        }

        let target = needed.max(self.capacity.saturating_mul(2));
        let mut next = Self::with_capacity(target, self.mode)?;
        let len = self.len;
        next.whole_mut()[..len].copy_from_slice(self.as_slice());
        next.len = len;

        let mut old = std::mem::replace(self, next);
        old.release()
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> BoxResult<()> {
        self.reserve(bytes.len())?;
        let start = self.len;
        self.whole_mut()[start..start + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Grow to `new_len` with zero bytes. No-op if already that long.
    pub fn resize_zeroed(&mut self, new_len: usize) -> BoxResult<()> {
        if new_len > self.len {
            self.reserve(new_len - self.len)?;
            self.len = new_len;
        }
        Ok(())
    }

    /// Shorten to `len`, zeroing the discarded tail.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            let old = self.len;
            self.whole_mut()[len..old].zeroize();
            self.len = len;
        }
    }

    /// Zero every byte of capacity and set length to 0. Stays allocated and pinned.
    pub fn wipe(&mut self) {
        self.whole_mut().zeroize();
        self.len = 0;
    }

    /// Wipe, unlock and free the allocation.
    ///
    /// If `munlock` fails the bytes are already zeroed, the allocation is kept
    /// and [`BoxError::PinningFailed`] is returned so the caller can retry.
    pub fn release(&mut self) -> BoxResult<()> {
        if self.capacity == 0 {
            return Ok(());
        }
        self.wipe();
        self.unpin()?;
        self.dealloc();
        Ok(())
    }

    fn pin(&mut self) -> BoxResult<()> {
        // SAFETY: ptr/capacity describe a live allocation owned by self.
        let rc = unsafe { libc::mlock(self.ptr.as_ptr().cast(), self.capacity) };
        if rc == 0 {
            self.pinned = true;
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match self.mode {
            PinMode::Required => Err(BoxError::PinningFailed(err)),
            PinMode::BestEffort => {
                warn!(bytes = self.capacity, error = %err, "mlock failed, region left pageable");
                Ok(())
            }
        }
    }

    fn unpin(&mut self) -> BoxResult<()> {
        if !self.pinned {
            return Ok(());
        }
        // SAFETY: same range that was passed to mlock.
        let rc = unsafe { libc::munlock(self.ptr.as_ptr().cast(), self.capacity) };
        if rc != 0 {
            return Err(BoxError::PinningFailed(io::Error::last_os_error()));
        }
        self.pinned = false;
        Ok(())
    }

    fn dealloc(&mut self) {
        if self.capacity == 0 {
            return;
        }
        // The layout was valid when allocating, so it is valid now.
        if let Ok(layout) = Layout::from_size_align(self.capacity, page_size()) {
            // SAFETY: ptr was returned by alloc_zeroed with this layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
        self.ptr = NonNull::dangling();
        self.capacity = 0;
        self.len = 0;
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        if self.capacity == 0 {
            return;
        }
        self.wipe();
        if let Err(e) = self.unpin() {
            error!(bytes = self.capacity, error = %e, "munlock failed while dropping region");
        }
        self.dealloc();
    }
}

impl AsRef<[u8]> for PinnedRegion {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for PinnedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedRegion")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("pinned", &self.pinned)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Seekable writer over a [`PinnedRegion`], used as the archive sink.
pub struct RegionWriter {
    region: PinnedRegion,
    pos: usize,
}

impl RegionWriter {
    pub fn new(region: PinnedRegion) -> Self {
        Self { region, pos: 0 }
    }

    pub fn into_region(self) -> PinnedRegion {
        self.region
    }
}

impl Write for RegionWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let end = self
            .pos
            .checked_add(buf.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "archive too large"))?;
        self.region.resize_zeroed(end).map_err(|e| match e {
            BoxError::Io(io) => io,
            other => io::Error::other(other),
        })?;
        self.region.as_mut_slice()[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for RegionWriter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, offset) = match pos {
            SeekFrom::Start(n) => (0i128, n as i128),
            SeekFrom::End(n) => (self.region.len() as i128, n as i128),
            SeekFrom::Current(n) => (self.pos as i128, n as i128),
        };
        let target = base + offset;
        if target < 0 || target > usize::MAX as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to an invalid position",
            ));
        }
        self.pos = target as usize;
        Ok(self.pos as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODE: PinMode = PinMode::BestEffort;

    #[test]
    fn capacity_rounds_to_pages() {
        let region = PinnedRegion::with_capacity(1, MODE).unwrap();
        assert_eq!(region.capacity(), page_size());
        assert_eq!(region.capacity() % page_size(), 0);
        assert!(region.is_empty());
    }

    #[test]
    fn empty_region_has_no_allocation() {
        let mut region = PinnedRegion::new(MODE);
        assert_eq!(region.capacity(), 0);
        assert_eq!(region.as_slice(), b"");
        region.release().unwrap();
    }

    #[test]
    fn extend_grows_and_preserves_bytes() {
        let mut region = PinnedRegion::with_capacity(8, MODE).unwrap();
        let first = vec![0xAAu8; page_size()];
        region.extend_from_slice(&first).unwrap();
        region.extend_from_slice(b"tail").unwrap();

        assert_eq!(region.len(), page_size() + 4);
        assert!(region.capacity() >= region.len());
        assert_eq!(&region.as_slice()[..page_size()], first.as_slice());
        assert_eq!(&region.as_slice()[page_size()..], b"tail");
    }

    #[test]
    fn truncate_zeroes_tail() {
        let mut region = PinnedRegion::from_slice(b"abcdef", MODE).unwrap();
        region.truncate(2);
        assert_eq!(region.as_slice(), b"ab");
        region.resize_zeroed(6).unwrap();
        assert_eq!(region.as_slice(), b"ab\0\0\0\0");
    }

    #[test]
    fn release_empties_region_and_is_repeatable() {
        let mut region = PinnedRegion::from_slice(b"secret", MODE).unwrap();
        region.release().unwrap();
        assert!(region.is_empty());
        assert_eq!(region.capacity(), 0);
        assert!(!region.is_pinned());
        region.release().unwrap();
    }

    #[test]
    fn wipe_keeps_allocation() {
        let mut region = PinnedRegion::from_slice(b"secret", MODE).unwrap();
        let cap = region.capacity();
        region.wipe();
        assert!(region.is_empty());
        assert_eq!(region.capacity(), cap);
        region.resize_zeroed(6).unwrap();
        assert_eq!(region.as_slice(), &[0u8; 6]);
    }

    #[test]
    fn debug_redacts_contents() {
        let region = PinnedRegion::from_slice(b"hunter2", MODE).unwrap();
        let dbg = format!("{region:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn writer_supports_seek_back_and_patch() {
        let mut w = RegionWriter::new(PinnedRegion::new(MODE));
        w.write_all(b"hello world").unwrap();
        w.seek(SeekFrom::Start(0)).unwrap();
        w.write_all(b"J").unwrap();
        w.seek(SeekFrom::End(0)).unwrap();
        w.write_all(b"!").unwrap();
        assert_eq!(w.into_region().as_slice(), b"Jello world!");
    }

    #[test]
    fn writer_rejects_negative_seek() {
        let mut w = RegionWriter::new(PinnedRegion::new(MODE));
        assert!(w.seek(SeekFrom::Current(-1)).is_err());
    }

    #[test]
    fn pin_mode_from_config_flag() {
        assert_eq!(PinMode::from_required(true), PinMode::Required);
        assert_eq!(PinMode::from_required(false), PinMode::BestEffort);
    }
}
