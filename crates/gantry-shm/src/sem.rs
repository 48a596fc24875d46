//! Named semaphore triple signaling video, audio and event availability.
//!
//! The three names are derived from the segment key by replacing its last
//! byte with `v`, `a` or `e`; key generation guarantees the last byte is a
//! digit, so the derived names never collide with the page or each other.

use std::ffi::CString;
use std::io;

/// The three synchronization channels of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Video,
    Audio,
    Event,
}

impl Channel {
    fn suffix(self) -> u8 {
        match self {
            Channel::Video => b'v',
            Channel::Audio => b'a',
            Channel::Event => b'e',
        }
    }
}

/// Derive the semaphore name for `channel` from a segment key.
pub fn sem_name(key: &str, channel: Channel) -> String {
    let mut name = key.to_owned();
    // Generated keys are ASCII, non-empty and end in a digit.
    (unsafe { name.as_bytes_mut() })[key.len() - 1] = channel.suffix();
    name
}

fn open_one(name: &str, oflag: libc::c_int) -> io::Result<*mut libc::sem_t> {
    let cname = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let sem =
        unsafe { libc::sem_open(cname.as_ptr(), oflag, 0o600 as libc::mode_t, 0 as libc::c_uint) };
    if sem == libc::SEM_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(sem)
}

fn unlink_one(name: &str) -> io::Result<()> {
    let cname = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    if unsafe { libc::sem_unlink(cname.as_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Owned handles to the video/audio/event semaphores of one segment.
#[derive(Debug)]
pub struct SemTriple {
    video: *mut libc::sem_t,
    audio: *mut libc::sem_t,
    event: *mut libc::sem_t,
}

// sem_t handles are process-local tokens for kernel objects; posting and
// waiting from any thread is fine.
unsafe impl Send for SemTriple {}
unsafe impl Sync for SemTriple {}

impl SemTriple {
    /// Create the three semaphores for a freshly allocated segment.
    ///
    /// On failure only the names this call managed to create are unlinked
    /// again; a clash with an existing set leaves that set untouched.
    pub fn create(key: &str) -> io::Result<Self> {
        let oflag = libc::O_CREAT | libc::O_EXCL;
        let mut created: Vec<Channel> = Vec::with_capacity(3);
        let mut handles: Vec<*mut libc::sem_t> = Vec::with_capacity(3);

        for channel in [Channel::Video, Channel::Audio, Channel::Event] {
            match open_one(&sem_name(key, channel), oflag) {
                Ok(sem) => {
                    created.push(channel);
                    handles.push(sem);
                }
                Err(e) => {
                    for (channel, sem) in created.iter().zip(&handles) {
                        unsafe { libc::sem_close(*sem) };
                        let _ = unlink_one(&sem_name(key, *channel));
                    }
                    return Err(e);
                }
            }
        }

        Ok(SemTriple {
            video: handles[0],
            audio: handles[1],
            event: handles[2],
        })
    }

    /// Open the semaphores of an existing segment (client side).
    pub fn open(key: &str) -> io::Result<Self> {
        let video = open_one(&sem_name(key, Channel::Video), 0)?;
        let audio = match open_one(&sem_name(key, Channel::Audio), 0) {
            Ok(s) => s,
            Err(e) => {
                unsafe { libc::sem_close(video) };
                return Err(e);
            }
        };
        let event = match open_one(&sem_name(key, Channel::Event), 0) {
            Ok(s) => s,
            Err(e) => {
                unsafe {
                    libc::sem_close(video);
                    libc::sem_close(audio);
                }
                return Err(e);
            }
        };
        Ok(SemTriple {
            video,
            audio,
            event,
        })
    }

    fn raw(&self, channel: Channel) -> *mut libc::sem_t {
        match channel {
            Channel::Video => self.video,
            Channel::Audio => self.audio,
            Channel::Event => self.event,
        }
    }

    /// Signal availability on `channel`.
    pub fn post(&self, channel: Channel) -> io::Result<()> {
        if unsafe { libc::sem_post(self.raw(channel)) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until `channel` is signalled.
    pub fn wait(&self, channel: Channel) -> io::Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.raw(channel)) } == 0 {
                return Ok(());
            }
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(e);
            }
        }
    }

    /// Consume a pending signal without blocking. Returns `false` when none
    /// is pending.
    pub fn try_wait(&self, channel: Channel) -> io::Result<bool> {
        if unsafe { libc::sem_trywait(self.raw(channel)) } == 0 {
            return Ok(true);
        }
        let e = io::Error::last_os_error();
        match e.raw_os_error() {
            Some(libc::EAGAIN) => Ok(false),
            Some(libc::EINTR) => Ok(false),
            _ => Err(e),
        }
    }

    /// Unlink all three names derived from `key`.
    ///
    /// Returns the first error but attempts every unlink regardless.
    pub fn unlink(key: &str) -> io::Result<()> {
        let mut first = Ok(());
        for channel in [Channel::Video, Channel::Audio, Channel::Event] {
            if let Err(e) = unlink_one(&sem_name(key, channel)) {
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }
}

impl Drop for SemTriple {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.video);
            libc::sem_close(self.audio);
            libc::sem_close(self.event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageMap;

    #[test]
    fn names_differ_only_in_last_byte() {
        let key = "/gantry_abcdefghijklmnopqrstuv0";
        let v = sem_name(key, Channel::Video);
        let a = sem_name(key, Channel::Audio);
        let e = sem_name(key, Channel::Event);

        assert_eq!(&v[..key.len() - 1], &key[..key.len() - 1]);
        assert!(v.ends_with('v'));
        assert!(a.ends_with('a'));
        assert!(e.ends_with('e'));
        assert_ne!(v, a);
        assert_ne!(a, e);
    }

    #[test]
    fn create_post_wait_roundtrip() {
        // Borrow a collision-free key from the page allocator.
        let page = PageMap::create(32, 32).unwrap();
        let sems = SemTriple::create(page.key()).unwrap();

        assert!(!sems.try_wait(Channel::Video).unwrap());
        sems.post(Channel::Video).unwrap();
        assert!(sems.try_wait(Channel::Video).unwrap());
        assert!(!sems.try_wait(Channel::Video).unwrap());

        sems.post(Channel::Event).unwrap();
        sems.wait(Channel::Event).unwrap();

        SemTriple::unlink(page.key()).unwrap();
        page.unlink().unwrap();
    }

    #[test]
    fn create_is_exclusive() {
        let page = PageMap::create(32, 32).unwrap();
        let _sems = SemTriple::create(page.key()).unwrap();

        let err = SemTriple::create(page.key()).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));

        // The failed create must not have unlinked the first set.
        assert!(SemTriple::open(page.key()).is_ok());

        SemTriple::unlink(page.key()).unwrap();
        page.unlink().unwrap();
    }

    #[test]
    fn unlink_removes_all_names() {
        let page = PageMap::create(32, 32).unwrap();
        let sems = SemTriple::create(page.key()).unwrap();
        drop(sems);

        SemTriple::unlink(page.key()).unwrap();
        assert!(SemTriple::open(page.key()).is_err());
        page.unlink().unwrap();
    }
}
