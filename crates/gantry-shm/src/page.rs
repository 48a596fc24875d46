//! Creation, mapping and resizing of the shared page backing a segment.
//!
//! The page is a POSIX shared-memory object whose name doubles as the
//! segment key. Creation probes the namespace for a free name; opening an
//! existing page validates the header cookie before handing anything out.

use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use rand::Rng;

use crate::event::EventRing;
use crate::layout::{
    page_bytes, HeaderError, PageHeader, IN_RING_OFFSET, KEY_LEN, OUT_RING_OFFSET, PAGE_MAX_SZ,
    PAGE_PREFIX_SIZE, PAGE_START_SZ,
};

/// Outcome of a resize request that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// The page was remapped at the new size.
    Applied,
    /// The request shrank the page by less than 20%; left as-is.
    Damped,
    /// The request exceeded the maximum page size.
    Refused,
}

/// Errors from opening an existing page by key.
#[derive(Debug)]
pub enum OpenError {
    Io(io::Error),
    Header(HeaderError),
}

impl From<io::Error> for OpenError {
    fn from(e: io::Error) -> Self {
        OpenError::Io(e)
    }
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenError::Io(e) => write!(f, "I/O error: {e}"),
            OpenError::Header(e) => write!(f, "bad page header: {e}"),
        }
    }
}

impl std::error::Error for OpenError {}

/// A mapped segment page plus the shared-memory object behind it.
pub struct PageMap {
    key: String,
    fd: OwnedFd,
    ptr: *mut u8,
    len: usize,
}

// The mapping is shared memory; access discipline is defined by the page
// layout, not by this handle.
unsafe impl Send for PageMap {}

fn map_shared(fd: RawFd, len: usize) -> io::Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}

fn ftruncate(fd: RawFd, len: usize) -> io::Result<()> {
    if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Generate a candidate key: `/`-prefixed, [`KEY_LEN`] printable bytes,
/// ending in a digit so the semaphore-name derivation (last byte replaced)
/// never produces a name colliding with the page itself.
fn gen_key() -> String {
    const ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let mut key = String::with_capacity(KEY_LEN);
    key.push_str("/gantry_");
    while key.len() < KEY_LEN - 1 {
        key.push(ALNUM[rng.gen_range(0..ALNUM.len())] as char);
    }
    key.push(char::from(b'0' + rng.gen_range(0..10u8)));
    debug_assert_eq!(key.len(), KEY_LEN);
    key
}

fn shm_open(key: &str, oflag: libc::c_int) -> io::Result<OwnedFd> {
    let name = CString::new(key).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let fd = unsafe { libc::shm_open(name.as_ptr(), oflag, 0o600 as libc::mode_t) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

impl PageMap {
    /// Allocate a fresh page under a collision-free key.
    ///
    /// The page is truncated to [`PAGE_START_SZ`], zero-filled by the kernel,
    /// and its header initialized with the given initial dimensions.
    pub fn create(w: u16, h: u16) -> io::Result<Self> {
        let (key, fd) = Self::probe_key()?;

        if let Err(e) = ftruncate(fd.as_raw_fd(), PAGE_START_SZ) {
            let _ = Self::unlink_key(&key);
            return Err(e);
        }

        let ptr = match map_shared(fd.as_raw_fd(), PAGE_START_SZ) {
            Ok(p) => p,
            Err(e) => {
                let _ = Self::unlink_key(&key);
                return Err(e);
            }
        };

        let mut page = PageMap {
            key,
            fd,
            ptr,
            len: PAGE_START_SZ,
        };
        page.header_mut()
            .init(std::process::id(), PAGE_START_SZ, w, h);
        page.in_ring().init();
        page.out_ring().init();
        Ok(page)
    }

    /// Map an existing page by key and validate its header.
    ///
    /// This is the client-side entry: the cookie check rejects pages written
    /// by an incompatible build.
    pub fn open(key: &str) -> Result<Self, OpenError> {
        let fd = shm_open(key, libc::O_RDWR)?;

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        let len = stat.st_size as usize;
        if len < PAGE_PREFIX_SIZE {
            return Err(OpenError::Header(HeaderError::BadSize));
        }

        let ptr = map_shared(fd.as_raw_fd(), len)?;
        let page = PageMap {
            key: key.to_owned(),
            fd,
            ptr,
            len,
        };
        if let Err(e) = page.header().validate() {
            return Err(OpenError::Header(e));
        }
        Ok(page)
    }

    fn probe_key() -> io::Result<(String, OwnedFd)> {
        for _ in 0..64 {
            let key = gen_key();
            match shm_open(&key, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL) {
                Ok(fd) => return Ok((key, fd)),
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "could not find a free shared-memory name",
        ))
    }

    /// The segment key (also the shared-memory object name).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// False only after a failed resize left the page without a mapping.
    /// Accessors that touch page memory must not be called in that state.
    pub fn is_mapped(&self) -> bool {
        !self.ptr.is_null()
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn header(&self) -> &PageHeader {
        unsafe { &*(self.ptr as *const PageHeader) }
    }

    fn header_mut(&mut self) -> &mut PageHeader {
        unsafe { &mut *(self.ptr as *mut PageHeader) }
    }

    /// Child-to-host event ring.
    pub fn in_ring(&self) -> &EventRing {
        unsafe { &*(self.ptr.add(IN_RING_OFFSET) as *const EventRing) }
    }

    /// Host-to-child event ring.
    pub fn out_ring(&self) -> &EventRing {
        unsafe { &*(self.ptr.add(OUT_RING_OFFSET) as *const EventRing) }
    }

    /// The video buffer at its current dimensions.
    ///
    /// # Safety
    ///
    /// The other side of the segment writes this concurrently; callers must
    /// only touch it under the video-semaphore protocol.
    pub unsafe fn video_bytes(&self) -> &mut [u8] {
        let header = self.header();
        let vofs = header.vofs as usize;
        let n = header.w as usize * header.h as usize * crate::layout::VCHANNELS;
        std::slice::from_raw_parts_mut(self.ptr.add(vofs), n)
    }

    /// The audio buffer.
    ///
    /// # Safety
    ///
    /// Same concurrent-access caveat as [`Self::video_bytes`].
    pub unsafe fn audio_bytes(&self) -> &mut [u8] {
        let aofs = self.header().aofs as usize;
        std::slice::from_raw_parts_mut(self.ptr.add(aofs), crate::layout::AUDIO_BUF_SZ)
    }

    /// Resize the page to fit `w` x `h` video.
    ///
    /// Requests above [`PAGE_MAX_SZ`] are refused. Shrinks of less than 20%
    /// are damped to a no-op. Otherwise the header is carried across an
    /// unmap/truncate/remap cycle. An `Err` leaves the mapping gone; the
    /// caller must treat the segment as dead.
    pub fn resize(&mut self, w: u16, h: u16) -> io::Result<ResizeOutcome> {
        let sz = page_bytes(w, h);
        if sz > PAGE_MAX_SZ {
            return Ok(ResizeOutcome::Refused);
        }

        // Same size, or a marginal shrink: churn with no payoff.
        if sz <= self.len && sz as f64 > self.len as f64 * 0.8 {
            return Ok(ResizeOutcome::Damped);
        }

        let mut saved: PageHeader = unsafe { std::ptr::read(self.ptr as *const PageHeader) };

        unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
        self.ptr = std::ptr::null_mut();

        ftruncate(self.fd.as_raw_fd(), sz)?;
        self.ptr = map_shared(self.fd.as_raw_fd(), sz)?;
        self.len = sz;

        saved.segment_size = sz as u32;
        saved.update_dimensions(w, h);
        unsafe { std::ptr::write(self.ptr as *mut PageHeader, saved) };

        Ok(ResizeOutcome::Applied)
    }

    /// Remove the shared-memory name. The mapping stays valid until drop.
    pub fn unlink(&self) -> io::Result<()> {
        Self::unlink_key(&self.key)
    }

    fn unlink_key(key: &str) -> io::Result<()> {
        let name = CString::new(key).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        if unsafe { libc::shm_unlink(name.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for PageMap {
    fn drop(&mut self) {
        if !self.ptr.is_null()
            && unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) } != 0
        {
            tracing::warn!(
                key = %self.key,
                error = %io::Error::last_os_error(),
                "munmap failed while dropping segment page"
            );
        }
    }
}
