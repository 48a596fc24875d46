//! Page layout constants and the shared page header.
//!
//! Every frameserver segment starts with a fixed [`PageHeader`], followed by
//! the two event rings, the video buffer and the audio buffer. Both sides of
//! the connection compute the same offsets from the same constants, and the
//! [`cookie`] folded from those constants guards against pairing two builds
//! with incompatible layouts.

use core::mem::size_of;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::event::{Event, EVENT_RING_CAP, RING_HEADER_SIZE};

/// Interface major version. Bumped on layout-breaking changes.
pub const MAJOR: u8 = 0;
/// Interface minor version.
pub const MINOR: u8 = 6;

/// Bytes per video pixel (RGBA).
pub const VCHANNELS: usize = 4;

/// Largest video dimensions a segment will ever be resized to.
pub const MAX_W: usize = 4096;
pub const MAX_H: usize = 2160;

/// Fixed size of the audio staging buffer inside the page.
pub const AUDIO_BUF_SZ: usize = 64 * 1024;

/// Length of a generated segment key, including the leading `/`.
pub const KEY_LEN: usize = 32;

/// Upper bound for handshake keys. The verify buffer and any pre-shared
/// client key are exactly this long (zero padded).
pub const KEY_LIM: usize = 64;

/// Size of the fixed header fields, padded to a cache line.
pub const FIXED_HEADER_SIZE: usize = 64;

const RING_BYTES: usize = RING_HEADER_SIZE + EVENT_RING_CAP * size_of::<Event>();

/// Byte offset of the child-to-host event ring.
pub const IN_RING_OFFSET: usize = FIXED_HEADER_SIZE;
/// Byte offset of the host-to-child event ring.
pub const OUT_RING_OFFSET: usize = IN_RING_OFFSET + RING_BYTES;

/// Total size of header plus rings, i.e. where the data buffers begin.
pub const PAGE_PREFIX_SIZE: usize = align_up(OUT_RING_OFFSET + RING_BYTES, 64);

/// Initial size of a freshly truncated page. Enough for a 1280x720 video
/// frame plus the audio buffer; segments grow from here via resize.
pub const PAGE_START_SZ: usize = page_bytes(1280, 720);

/// Hard ceiling for a segment, derived from the maximum dimensions.
pub const PAGE_MAX_SZ: usize = page_bytes(MAX_W as u16, MAX_H as u16);

/// Align `n` up to a multiple of `align` (power of two).
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Total page size needed for a `w` x `h` video buffer.
///
/// Rounded to 64 KiB so that near-identical dimension hints map to the same
/// backing size instead of churning the mapping.
pub const fn page_bytes(w: u16, h: u16) -> usize {
    align_up(
        PAGE_PREFIX_SIZE + w as usize * h as usize * VCHANNELS + AUDIO_BUF_SZ,
        64 * 1024,
    )
}

/// Offsets of the video and audio buffers for the given dimensions.
///
/// The video buffer always starts right after the rings; the audio buffer
/// floats behind it, so it moves on every resize.
pub const fn buffer_offsets(w: u16, h: u16) -> (usize, usize) {
    let vofs = PAGE_PREFIX_SIZE;
    let aofs = vofs + w as usize * h as usize * VCHANNELS;
    (vofs, aofs)
}

/// ABI cookie folded from every layout-affecting constant.
///
/// Two builds that disagree on any of these would read each other's pages at
/// the wrong offsets, so the fold makes them refuse to pair at open time.
pub const fn cookie() -> u64 {
    let mut c: u64 = 0x67_61_6e_74_72_79_00_00; // "gantry"
    c = c.wrapping_mul(31).wrapping_add(MAJOR as u64);
    c = c.wrapping_mul(31).wrapping_add(MINOR as u64);
    c = c.wrapping_mul(31).wrapping_add(size_of::<Event>() as u64);
    c = c.wrapping_mul(31).wrapping_add(EVENT_RING_CAP as u64);
    c = c.wrapping_mul(31).wrapping_add(PAGE_PREFIX_SIZE as u64);
    c = c.wrapping_mul(31).wrapping_add(VCHANNELS as u64);
    c = c.wrapping_mul(31).wrapping_add(MAX_W as u64);
    c = c.wrapping_mul(31).wrapping_add(MAX_H as u64);
    c
}

/// Header at offset 0 of every segment page.
///
/// Written by the host at allocation time; the `dms` flag is the only field
/// either side writes afterwards.
#[repr(C)]
pub struct PageHeader {
    /// Dead-man switch. Non-zero while the segment is live; either side
    /// clearing it declares the segment dead.
    pub dms: AtomicU32,
    /// Pid of the host process that allocated the page.
    pub parent: u32,
    pub major: u8,
    pub minor: u8,
    _pad0: [u8; 2],
    /// Current size of the backing object in bytes. Updated on resize.
    pub segment_size: u32,
    /// Build cookie, see [`cookie`].
    pub cookie: u64,
    /// Current video dimensions.
    pub w: u16,
    pub h: u16,
    /// Byte offset of the video buffer.
    pub vofs: u32,
    /// Byte offset of the audio buffer.
    pub aofs: u32,
    _pad1: [u8; 28],
}

const _: () = assert!(size_of::<PageHeader>() == FIXED_HEADER_SIZE);

/// Reasons a page header fails validation at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// The build cookie does not match ours: incompatible ABI.
    BadCookie,
    /// Major/minor version mismatch.
    BadVersion,
    /// The recorded segment size is outside sane bounds.
    BadSize,
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderError::BadCookie => write!(f, "page cookie mismatch (incompatible build)"),
            HeaderError::BadVersion => write!(f, "page version mismatch"),
            HeaderError::BadSize => write!(f, "page size field out of range"),
        }
    }
}

impl std::error::Error for HeaderError {}

impl PageHeader {
    /// Initialize the header of a freshly zeroed page.
    pub fn init(&mut self, parent: u32, segment_size: usize, w: u16, h: u16) {
        let (vofs, aofs) = buffer_offsets(w, h);
        self.dms = AtomicU32::new(1);
        self.parent = parent;
        self.major = MAJOR;
        self.minor = MINOR;
        self.segment_size = segment_size as u32;
        self.cookie = cookie();
        self.w = w;
        self.h = h;
        self.vofs = vofs as u32;
        self.aofs = aofs as u32;
    }

    /// Validate a header found in an existing page.
    pub fn validate(&self) -> Result<(), HeaderError> {
        if self.cookie != cookie() {
            return Err(HeaderError::BadCookie);
        }
        if self.major != MAJOR || self.minor != MINOR {
            return Err(HeaderError::BadVersion);
        }
        let size = self.segment_size as usize;
        if size < PAGE_PREFIX_SIZE || size > PAGE_MAX_SZ {
            return Err(HeaderError::BadSize);
        }
        Ok(())
    }

    /// True while neither side has pulled the dead-man switch.
    #[inline]
    pub fn dms(&self) -> bool {
        self.dms.load(Ordering::Acquire) != 0
    }

    /// Pull the dead-man switch, terminating the segment for both sides.
    #[inline]
    pub fn clear_dms(&self) {
        self.dms.store(0, Ordering::Release);
    }

    /// Refresh the derived buffer offsets after a dimension change.
    pub fn update_dimensions(&mut self, w: u16, h: u16) {
        let (vofs, aofs) = buffer_offsets(w, h);
        self.w = w;
        self.h = h;
        self.vofs = vofs as u32;
        self.aofs = aofs as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_one_cache_line() {
        assert_eq!(size_of::<PageHeader>(), 64);
    }

    #[test]
    fn offsets_are_monotonic_and_aligned() {
        assert!(IN_RING_OFFSET < OUT_RING_OFFSET);
        assert!(OUT_RING_OFFSET < PAGE_PREFIX_SIZE);
        assert_eq!(PAGE_PREFIX_SIZE % 64, 0);
        assert_eq!(PAGE_START_SZ % 4096, 0);
        assert!(PAGE_START_SZ < PAGE_MAX_SZ);
    }

    #[test]
    fn audio_floats_behind_video() {
        let (v_small, a_small) = buffer_offsets(32, 32);
        let (v_big, a_big) = buffer_offsets(1920, 1080);
        assert_eq!(v_small, v_big);
        assert!(a_small < a_big);
        assert_eq!(a_big - v_big, 1920 * 1080 * VCHANNELS);
    }

    #[test]
    fn validate_accepts_own_init() {
        let mut header: PageHeader = unsafe { std::mem::zeroed() };
        header.init(1234, PAGE_START_SZ, 32, 32);
        assert!(header.validate().is_ok());
        assert!(header.dms());
        assert_eq!(header.parent, 1234);
    }

    #[test]
    fn validate_rejects_foreign_cookie() {
        let mut header: PageHeader = unsafe { std::mem::zeroed() };
        header.init(1, PAGE_START_SZ, 32, 32);
        header.cookie ^= 1;
        assert_eq!(header.validate(), Err(HeaderError::BadCookie));
    }

    #[test]
    fn clear_dms_is_visible() {
        let mut header: PageHeader = unsafe { std::mem::zeroed() };
        header.init(1, PAGE_START_SZ, 32, 32);
        header.clear_dms();
        assert!(!header.dms());
    }
}
