//! Authenticated peer sessions and the byte bridge.
//!
//! The wire protocol proper lives on the other side of this interface; what
//! the proxy needs from it is a hello exchange, an optional pre-shared
//! secret check, and a full-duplex relay between the local segment's control
//! channel and the TCP peer.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use tracing::{debug, warn};

use gantry::ct_eq;
use gantry_shm::KEY_LIM;

pub const WIRE_MAGIC: [u8; 6] = *b"GNTNET";
pub const WIRE_VERSION: u8 = 1;

const HELLO_SECRET: u8 = 1;

fn hello(secret: bool) -> [u8; 8] {
    let mut h = [0u8; 8];
    h[..6].copy_from_slice(&WIRE_MAGIC);
    h[6] = WIRE_VERSION;
    h[7] = if secret { HELLO_SECRET } else { 0 };
    h
}

fn auth_failed(stream: &TcpStream, why: &'static str) -> io::Error {
    // Half-duplex shutdown; the caller closes the descriptor by dropping.
    let _ = stream.shutdown(Shutdown::Write);
    io::Error::new(io::ErrorKind::PermissionDenied, why)
}

/// Read a LF-terminated secret line, bounded to the key limit.
fn read_secret_line(stream: &mut TcpStream) -> io::Result<[u8; KEY_LIM]> {
    let mut buf = [0u8; KEY_LIM];
    let mut ofs = 0;
    loop {
        let mut ch = [0u8; 1];
        stream.read_exact(&mut ch)?;
        if ch[0] == b'\n' {
            return Ok(buf);
        }
        if ofs >= KEY_LIM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized secret line",
            ));
        }
        buf[ofs] = ch[0];
        ofs += 1;
    }
}

fn exchange_hello(stream: &mut TcpStream, have_secret: bool) -> io::Result<u8> {
    stream.write_all(&hello(have_secret))?;
    let mut peer = [0u8; 8];
    stream.read_exact(&mut peer)?;
    if peer[..6] != WIRE_MAGIC || peer[6] != WIRE_VERSION {
        return Err(auth_failed(stream, "peer hello mismatch"));
    }
    Ok(peer[7])
}

/// Client half of the handshake: send hello, then prove the secret if one
/// is configured.
pub fn authenticate_outbound(stream: &mut TcpStream, secret: Option<&[u8]>) -> io::Result<()> {
    stream.set_nodelay(true).ok();
    exchange_hello(stream, secret.is_some())?;

    if let Some(secret) = secret {
        if secret.len() >= KEY_LIM {
            return Err(auth_failed(stream, "secret exceeds key limit"));
        }
        stream.write_all(secret)?;
        stream.write_all(b"\n")?;
    }
    debug!("outbound session authenticated");
    Ok(())
}

/// Server half: exchange hellos, then require a matching secret when one is
/// configured locally.
///
/// Nothing beyond the socket closing is revealed to a failing peer.
pub fn authenticate_inbound(stream: &mut TcpStream, secret: Option<&[u8]>) -> io::Result<()> {
    stream.set_nodelay(true).ok();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .ok();
    let peer_flags = exchange_hello(stream, secret.is_some())?;

    match secret {
        Some(secret) => {
            let line = read_secret_line(stream).map_err(|_| {
                auth_failed(stream, "peer closed during secret exchange")
            })?;
            let mut expected = [0u8; KEY_LIM];
            expected[..secret.len().min(KEY_LIM)]
                .copy_from_slice(&secret[..secret.len().min(KEY_LIM)]);
            if !ct_eq(&line, &expected) {
                warn!("inbound session failed secret verification");
                return Err(auth_failed(stream, "secret mismatch"));
            }
        }
        None => {
            // Drain a secret the peer volunteered so the stream stays in sync.
            if peer_flags & HELLO_SECRET != 0 {
                let _ = read_secret_line(stream)?;
            }
        }
    }

    stream.set_read_timeout(None).ok();
    debug!("inbound session authenticated");
    Ok(())
}

fn write_all_fd(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let rc = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if rc < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        buf = &buf[rc as usize..];
    }
    Ok(())
}

/// Relay one readable chunk. `Ok(true)` means the source reached EOF.
fn pump(from: RawFd, to: RawFd) -> io::Result<bool> {
    let mut buf = [0u8; 4096];
    let rc = unsafe { libc::read(from, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if rc == 0 {
        return Ok(true);
    }
    if rc < 0 {
        let e = io::Error::last_os_error();
        return match e.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => Ok(false),
            _ => Err(e),
        };
    }
    write_all_fd(to, &buf[..rc as usize])?;
    Ok(false)
}

/// Full-duplex relay between the local control channel and the TCP peer.
///
/// Runs until either side closes or errors. This runs in its own process or
/// serves the only connection, so the infinite poll timeout is fine; the
/// host side wakes us through the descriptors themselves.
pub fn bridge(local: RawFd, remote: &TcpStream) -> io::Result<()> {
    let rfd = remote.as_raw_fd();
    let err_mask = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

    loop {
        let mut fds = [
            libc::pollfd {
                fd: local,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: rfd,
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        let pv = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
        if pv < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        if fds[0].revents & libc::POLLIN != 0 && pump(local, rfd)? {
            return Ok(());
        }
        if fds[1].revents & libc::POLLIN != 0 && pump(rfd, local)? {
            return Ok(());
        }

        // Only treat error bits as terminal once no data is pending.
        if fds[0].revents & err_mask != 0 && fds[0].revents & libc::POLLIN == 0 {
            return Ok(());
        }
        if fds[1].revents & err_mask != 0 && fds[1].revents & libc::POLLIN == 0 {
            return Ok(());
        }
    }
}

/// Next linear backoff step: grows by one second per failure, capped at ten.
pub fn next_backoff(cur: u64) -> u64 {
    (cur + 1).min(10)
}

/// Connect to `host:port` with the retry policy: `retry_count` attempts
/// (negative = forever), linearly growing sleeps, early abort when the
/// local client dies.
pub fn connect_retry(
    host: &str,
    port: &str,
    retry_count: i32,
    secret: Option<&[u8]>,
    alive: &mut dyn FnMut() -> bool,
) -> Option<TcpStream> {
    let port: u16 = port.parse().ok()?;
    let mut rc = retry_count;
    let mut backoff = 1u64;

    while rc != 0 && alive() {
        match TcpStream::connect((host, port)) {
            Ok(mut stream) => match authenticate_outbound(&mut stream, secret) {
                Ok(()) => return Some(stream),
                Err(e) => warn!(host, port, error = %e, "authentication failed"),
            },
            Err(e) => warn!(host, port, error = %e, "connection failed"),
        }

        if rc > 0 {
            rc -= 1;
            if rc == 0 {
                break;
            }
        }
        std::thread::sleep(Duration::from_secs(backoff));
        backoff = next_backoff(backoff);
    }
    None
}
