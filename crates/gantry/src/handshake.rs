//! Socket readiness probes, the timing-safe key compare, and the bounded
//! key transfer used by the verify state.
//!
//! All probes are zero-timeout: they run inside the per-frame tick and must
//! never block the host loop.

use std::io;
use std::os::unix::io::RawFd;

use gantry_shm::KEY_LIM;

/// What a zero-timeout poll said about a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// A byte (or a pending connection) can be taken without blocking.
    Data,
    /// Nothing to do this frame.
    Empty,
    /// The descriptor reported `ERR`/`HUP`/`NVAL`; the peer is gone.
    Gone,
}

/// Probe `fd` for readability without blocking.
pub(crate) fn fd_avail(fd: RawFd) -> Readiness {
    let mut fds = libc::pollfd {
        fd,
        events: libc::POLLIN | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL,
        revents: 0,
    };

    let sv = unsafe { libc::poll(&mut fds, 1, 0) };
    if sv == -1 {
        let e = io::Error::last_os_error();
        return if e.kind() == io::ErrorKind::Interrupted {
            Readiness::Empty
        } else {
            Readiness::Gone
        };
    }
    if sv == 0 {
        return Readiness::Empty;
    }

    if fds.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        Readiness::Gone
    } else if fds.revents & libc::POLLIN != 0 {
        Readiness::Data
    } else {
        Readiness::Empty
    }
}

/// True when `fd` reports a terminal condition. Used for liveness hints on
/// connections with no supervised pid.
pub(crate) fn fd_gone(fd: RawFd) -> bool {
    let mask = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;
    let mut fds = libc::pollfd {
        fd,
        events: mask,
        revents: 0,
    };

    let sv = unsafe { libc::poll(&mut fds, 1, 0) };
    if sv == -1 {
        return io::Error::last_os_error().kind() != io::ErrorKind::Interrupted;
    }
    fds.revents & mask != 0
}

/// Compare two equal-length byte strings in time independent of the first
/// differing position.
///
/// The expected client key is long-lived; an early-return compare would let
/// a local attacker racing connects measure how much of a guess matched.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Write `key` plus a terminating LF to `fd`, retrying short/blocked writes
/// a bounded number of times.
///
/// The socket is toggled non-blocking first: a malicious client could
/// otherwise wedge the host loop by never draining its end.
pub(crate) fn send_key(fd: RawFd, key: &str) -> io::Result<()> {
    debug_assert!(key.len() < KEY_LIM);

    let mut buf = [0u8; KEY_LIM];
    buf[..key.len()].copy_from_slice(key.as_bytes());
    buf[key.len()] = b'\n';
    let line = &buf[..key.len() + 1];

    set_nonblocking(fd)?;

    let mut rtc = 10;
    let mut wofs = 0usize;
    while rtc > 0 && wofs < line.len() {
        let rc = unsafe {
            libc::write(
                fd,
                line[wofs..].as_ptr() as *const libc::c_void,
                line.len() - wofs,
            )
        };
        if rc < 0 {
            let e = io::Error::last_os_error();
            rtc = match e.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => rtc - 1,
                _ => 0,
            };
        } else {
            wofs += rc as usize;
        }
    }

    if wofs < line.len() {
        return Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "peer would not accept the segment key",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn ct_eq_basic() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
        assert!(ct_eq(b"", b""));
    }

    #[test]
    fn ct_eq_timing_does_not_track_prefix() {
        // Smoke check, not a benchmark: the time to reject a mismatch in the
        // first byte and in the last byte should be of the same order.
        let expected = [0x41u8; KEY_LIM];
        let mut first = [0x41u8; KEY_LIM];
        first[0] = 0x42;
        let mut last = [0x41u8; KEY_LIM];
        last[KEY_LIM - 1] = 0x42;

        const ROUNDS: usize = 10_000;
        let t0 = Instant::now();
        for _ in 0..ROUNDS {
            assert!(!ct_eq(std::hint::black_box(&first), &expected));
        }
        let early = t0.elapsed();

        let t1 = Instant::now();
        for _ in 0..ROUNDS {
            assert!(!ct_eq(std::hint::black_box(&last), &expected));
        }
        let late = t1.elapsed();

        let ratio = early.as_nanos().max(1) as f64 / late.as_nanos().max(1) as f64;
        assert!(
            (0.2..5.0).contains(&ratio),
            "suspicious timing ratio {ratio}"
        );
    }

    #[test]
    fn fd_avail_reflects_data_and_hup() {
        let (a, mut b) = UnixStream::pair().unwrap();
        assert_eq!(fd_avail(a.as_raw_fd()), Readiness::Empty);

        use std::io::Write;
        b.write_all(b"x").unwrap();
        assert_eq!(fd_avail(a.as_raw_fd()), Readiness::Data);

        let mut one = [0u8; 1];
        (&a).read_exact(&mut one).unwrap();
        drop(b);
        assert_eq!(fd_avail(a.as_raw_fd()), Readiness::Gone);
        assert!(fd_gone(a.as_raw_fd()));
    }

    #[test]
    fn send_key_delivers_line() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let key = "/gantry_sendkeytestaaaaaaaaaaa0";
        send_key(a.as_raw_fd(), key).unwrap();

        let mut got = vec![0u8; key.len() + 1];
        b.read_exact(&mut got).unwrap();
        assert_eq!(&got[..key.len()], key.as_bytes());
        assert_eq!(got[key.len()], b'\n');
    }

    #[test]
    fn send_key_fails_on_closed_peer() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let err = send_key(a.as_raw_fd(), "/gantry_x0").unwrap_err();
        // EPIPE is not in the retry set, so this must fail immediately.
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
