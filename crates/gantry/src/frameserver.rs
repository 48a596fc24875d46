//! The frameserver handle: one segment, its sockets, its child, and the
//! per-frame state machine driving non-authoritative connections from
//! listen to live.

use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use passfd::FdPassingExt;
use tracing::{debug, trace, warn};

use gantry_shm::{category, kind, Channel, Event, PageMap, ResizeOutcome, SemTriple, AUDIO_BUF_SZ, KEY_LIM};

use crate::handshake::{self, Readiness};
use crate::nanny;
use crate::Error;

/// Compile-time prefix for rendezvous socket paths. A relative prefix is
/// resolved under `$HOME`.
pub const SOCK_PREFIX: &str = ".gantry_";

/// Permissions applied to the rendezvous socket path.
pub const SOCK_MODE: u32 = 0o700;

/// Who owns the process behind a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildHandle {
    /// Spawned by us; the pid is a liveness hint, never an identity.
    Process(libc::pid_t),
    /// Connected from outside; there is no process to supervise.
    External,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SegmentFlags {
    pub alive: bool,
    /// Shares its parent's connection; never schedules a nanny.
    pub subsegment: bool,
    /// Peer signals over the socket rather than the semaphores.
    pub socksig: bool,
    /// Renderer hint, carried through to subsegments.
    pub pbo: bool,
}

/// Explicit connection state. The per-frame tick dispatches on this instead
/// of swapping callback pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// Rendezvous socket bound, waiting for a client.
    Listen,
    /// Client accepted, reading the key line.
    Verify,
    /// Segment exchanged and usable.
    Live,
    /// Torn down; resources released.
    Dead,
}

/// Commands the host loop issues to a segment each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedCommand {
    Poll,
    Destroy,
}

/// A live or pending frameserver segment, exclusively owned by the host.
pub struct Frameserver {
    pub(crate) page: PageMap,
    pub(crate) sems: SemTriple,
    /// Listening fd while in `Listen`, the connected/control fd afterwards.
    pub(crate) sock: Option<OwnedFd>,
    /// Rendezvous path, tracked so release can unlink it.
    pub(crate) sock_addr: Option<PathBuf>,
    pub(crate) child: ChildHandle,
    pub(crate) flags: SegmentFlags,
    pub(crate) state: FeedState,
    pub(crate) expected_key: Option<[u8; KEY_LIM]>,
    pub(crate) inbuf: [u8; KEY_LIM],
    pub(crate) in_ofs: usize,
    pub(crate) queue_mask: u32,
    pub(crate) audio_buf: Option<Vec<u8>>,
    pub(crate) source: Option<String>,
}

/// Resolve a connection-point name against the compile-time prefix.
pub fn resolve_sock_path(name: &str) -> Result<PathBuf, Error> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(Error::BadArgument);
    }

    let path = if SOCK_PREFIX.starts_with('/') {
        PathBuf::from(format!("{SOCK_PREFIX}{name}"))
    } else {
        let home = std::env::var_os("HOME").ok_or(Error::BadArgument)?;
        Path::new(&home).join(format!("{SOCK_PREFIX}{name}"))
    };
    Ok(path)
}

/// Bind a CLOEXEC stream socket at `path` with a backlog of one.
///
/// A stale file at the path is unlinked first; only one client ever binds a
/// given rendezvous name.
fn bind_rendezvous(path: &Path) -> Result<OwnedFd, Error> {
    let bytes = path.as_os_str().as_bytes();
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    if bytes.is_empty() {
        return Err(Error::BadArgument);
    }
    if bytes.len() >= addr.sun_path.len() {
        return Err(Error::PathTooLong);
    }

    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };
    handshake::set_cloexec(fd)?;

    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }

    let _ = fs::remove_file(path);
    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }

    fs::set_permissions(path, fs::Permissions::from_mode(SOCK_MODE))?;

    if unsafe { libc::listen(fd, 1) } != 0 {
        let e: Error = io::Error::last_os_error().into();
        let _ = fs::remove_file(path);
        return Err(e);
    }

    Ok(sock)
}

impl Frameserver {
    /// Allocate a page and its semaphore triple, unwinding on partial
    /// failure.
    pub(crate) fn alloc(w: u16, h: u16) -> io::Result<(PageMap, SemTriple)> {
        let page = PageMap::create(w, h)?;
        match SemTriple::create(page.key()) {
            Ok(sems) => Ok((page, sems)),
            Err(e) => {
                let _ = page.unlink();
                Err(e)
            }
        }
    }

    pub(crate) fn from_parts(page: PageMap, sems: SemTriple, state: FeedState) -> Self {
        Frameserver {
            page,
            sems,
            sock: None,
            sock_addr: None,
            child: ChildHandle::External,
            flags: SegmentFlags::default(),
            state,
            expected_key: None,
            inbuf: [0; KEY_LIM],
            in_ofs: 0,
            queue_mask: category::EXTERNAL,
            audio_buf: None,
            source: None,
        }
    }

    /// Open a rendezvous point for an unprivileged external client.
    ///
    /// The segment sits in `Listen` until a client connects, then walks
    /// through `Verify` (echoing `expected_key` if one is set) before the
    /// key is revealed and the segment goes `Live`.
    pub fn listen_external(name: &str, expected_key: Option<&[u8]>) -> Result<Self, Error> {
        let path = resolve_sock_path(name)?;
        Self::listen_at_path(path, expected_key)
    }

    /// [`Self::listen_external`] with an explicit directory instead of the
    /// compile-time prefix. Embedding hosts that relocate the rendezvous
    /// directory use this; so does the test suite.
    pub fn listen_external_at(
        dir: &Path,
        name: &str,
        expected_key: Option<&[u8]>,
    ) -> Result<Self, Error> {
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::BadArgument);
        }
        Self::listen_at_path(dir.join(name), expected_key)
    }

    /// Build a segment over an already-connected client socket.
    ///
    /// Used when the connection primitive is inherited from a parent (the
    /// shmif client library exec'ing into a bridge process). The segment
    /// starts in `Verify` with no expected key, so the next tick transfers
    /// the key and goes live.
    pub fn inherit_connection(fd: std::os::unix::io::RawFd) -> Result<Self, Error> {
        if fd <= 0 {
            return Err(Error::BadArgument);
        }
        handshake::set_cloexec(fd)?;

        let (page, sems) = Self::alloc(32, 32)?;
        let mut fsrv = Self::from_parts(page, sems, FeedState::Verify);
        fsrv.sock = Some(unsafe { OwnedFd::from_raw_fd(fd) });
        fsrv.flags.alive = true;
        Ok(fsrv)
    }

    fn listen_at_path(path: PathBuf, expected_key: Option<&[u8]>) -> Result<Self, Error> {
        let expected = match expected_key {
            None => None,
            Some(k) if k.is_empty() => None,
            Some(k) if k.len() > KEY_LIM => return Err(Error::BadArgument),
            Some(k) => {
                let mut buf = [0u8; KEY_LIM];
                buf[..k.len()].copy_from_slice(k);
                Some(buf)
            }
        };

        let (page, sems) = Self::alloc(32, 32)?;
        let sock = match bind_rendezvous(&path) {
            Ok(s) => s,
            Err(e) => {
                let _ = page.unlink();
                let _ = SemTriple::unlink(page.key());
                return Err(e);
            }
        };

        let mut fsrv = Self::from_parts(page, sems, FeedState::Listen);
        fsrv.sock = Some(sock);
        fsrv.sock_addr = Some(path);
        fsrv.flags.alive = true;
        fsrv.expected_key = expected;
        Ok(fsrv)
    }

    // ── per-frame driving ───────────────────────────────────────────────────

    /// Advance the segment one frame. Never blocks.
    pub fn tick(&mut self, cmd: FeedCommand) -> FeedState {
        match cmd {
            FeedCommand::Destroy => self.destroy(),
            FeedCommand::Poll => match self.state {
                FeedState::Listen => self.poll_listen(),
                FeedState::Verify => self.poll_verify(),
                FeedState::Live => {
                    // Frame transfer belongs to the host renderer; here we
                    // only honor a peer pulling the dead-man switch.
                    if !self.page.header().dms() {
                        debug!(key = %self.page.key(), "peer cleared dead-man switch");
                        self.destroy();
                    }
                }
                FeedState::Dead => {}
            },
        }
        self.state
    }

    fn poll_listen(&mut self) {
        let fd = match &self.sock {
            Some(s) => s.as_raw_fd(),
            None => {
                self.destroy();
                return;
            }
        };

        match handshake::fd_avail(fd) {
            Readiness::Empty => {}
            Readiness::Gone => {
                warn!(key = %self.page.key(), "rendezvous socket terminated while listening");
                self.destroy();
            }
            Readiness::Data => {
                let conn = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
                if conn < 0 {
                    return;
                }
                let conn = unsafe { OwnedFd::from_raw_fd(conn) };
                if handshake::set_cloexec(conn.as_raw_fd()).is_err() {
                    return;
                }

                // Replace the listener with the connection and retire the
                // path: one client per rendezvous point.
                self.sock = Some(conn);
                if let Some(addr) = self.sock_addr.take() {
                    let _ = fs::remove_file(addr);
                }
                self.state = FeedState::Verify;

                // Same-tick fall-through so a keyless connect goes live
                // without waiting a frame.
                self.poll_verify();
            }
        }
    }

    fn poll_verify(&mut self) {
        let expected = match self.expected_key {
            None => {
                self.send_key_and_go_live();
                return;
            }
            Some(k) => k,
        };

        let fd = match &self.sock {
            Some(s) => s.as_raw_fd(),
            None => {
                self.destroy();
                return;
            }
        };

        // One byte at a time: after the LF this socket carries the event
        // channel, and we must not consume a single byte past the key line.
        match handshake::fd_avail(fd) {
            Readiness::Empty => return,
            Readiness::Gone => {
                self.destroy();
                return;
            }
            Readiness::Data => {}
        }

        let mut ch = [0u8; 1];
        let rc = unsafe { libc::read(fd, ch.as_mut_ptr() as *mut libc::c_void, 1) };
        if rc == 0 {
            self.destroy();
            return;
        }
        if rc < 0 {
            return;
        }

        if ch[0] == b'\n' {
            // Zero-pad the tail so short lines compare against the full
            // expected width.
            self.inbuf[self.in_ofs..].fill(0);

            if handshake::ct_eq(&self.inbuf, &expected) {
                self.send_key_and_go_live();
            } else {
                warn!(key = %self.page.key(), "client key verification failed");
                self.destroy();
            }
            return;
        }

        self.inbuf[self.in_ofs] = ch[0];
        self.in_ofs += 1;
        if self.in_ofs >= KEY_LIM {
            warn!(key = %self.page.key(), "oversized key line from client");
            self.destroy();
        }
    }

    fn send_key_and_go_live(&mut self) {
        let fd = match &self.sock {
            Some(s) => s.as_raw_fd(),
            None => {
                self.destroy();
                return;
            }
        };

        debug!(key = %self.page.key(), "connection verified, transferring key");
        match handshake::send_key(fd, self.page.key()) {
            Ok(()) => {
                self.state = FeedState::Live;
                self.attach_audio(AUDIO_BUF_SZ);
            }
            Err(e) => {
                warn!(key = %self.page.key(), error = %e, "connection broken during key transfer");
                self.destroy();
            }
        }
    }

    pub(crate) fn attach_audio(&mut self, size: usize) {
        if self.audio_buf.is_none() {
            self.audio_buf = Some(vec![0u8; size]);
        }
    }

    // ── liveness ────────────────────────────────────────────────────────────

    /// Best-effort liveness check.
    ///
    /// External connections have no pid worth trusting, so the control
    /// socket stands in. For spawned children the pid is polled, but only as
    /// a hint: a child may exec or loop into a new image at any time.
    pub fn is_alive(&self) -> bool {
        if !self.flags.alive {
            return false;
        }

        match self.child {
            ChildHandle::External => match &self.sock {
                Some(s) => !handshake::fd_gone(s.as_raw_fd()),
                None => true,
            },
            ChildHandle::Process(pid) => {
                let mut status: libc::c_int = 0;
                unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) != pid }
            }
        }
    }

    // ── event and descriptor plumbing ───────────────────────────────────────

    /// Enqueue an event for the peer and signal the event semaphore.
    pub fn push_event(&self, ev: Event) -> Result<(), Error> {
        self.page
            .out_ring()
            .try_enqueue(ev)
            .map_err(|_| Error::QueueFull)?;
        self.sems.post(Channel::Event)?;
        Ok(())
    }

    /// Dequeue the next unmasked event from the peer.
    pub fn poll_event(&self) -> Option<Event> {
        while let Some(ev) = self.page.in_ring().try_dequeue() {
            if ev.category & self.queue_mask != 0 {
                return Some(ev);
            }
            trace!(category = ev.category, "dropping masked event");
        }
        None
    }

    /// Push a descriptor to the peer over the control socket, paired with an
    /// `FDTRANSFER` event so the peer knows to collect it.
    pub fn push_fd(&self, fd: std::os::unix::io::RawFd) -> Result<(), Error> {
        if fd <= 0 {
            return Err(Error::BadArgument);
        }
        let sock = self.sock.as_ref().ok_or(Error::BadArgument)?;

        sock.as_raw_fd().send_fd(fd).map_err(|e| {
            warn!(error = %e, "descriptor push failed");
            Error::Io(e)
        })?;

        self.push_event(Event::new(category::TARGET, kind::FDTRANSFER))
    }

    // ── sizing ──────────────────────────────────────────────────────────────

    /// Resize the video dimensions of a live segment.
    ///
    /// Refused while not `Live` or beyond the maximum page size; marginal
    /// shrinks are accepted but left unapplied. A failed remap drops the
    /// segment.
    pub fn resize(&mut self, w: u16, h: u16) -> bool {
        if self.state != FeedState::Live {
            return false;
        }
        match self.page.resize(w, h) {
            Ok(ResizeOutcome::Applied) | Ok(ResizeOutcome::Damped) => true,
            Ok(ResizeOutcome::Refused) => false,
            Err(e) => {
                warn!(key = %self.page.key(), error = %e, "resize failed, dropping segment");
                self.destroy();
                false
            }
        }
    }

    // ── teardown ────────────────────────────────────────────────────────────

    pub(crate) fn destroy(&mut self) {
        if self.state == FeedState::Dead {
            return;
        }
        self.state = FeedState::Dead;
        self.flags.alive = false;

        // Let an attached peer observe the teardown before the names vanish.
        // (A failed resize can leave the page unmapped; the peer then sees
        // the truncated object instead.)
        if self.page.is_mapped() {
            self.page.header().clear_dms();
        }

        if let Err(e) = self.page.unlink() {
            debug!(key = %self.page.key(), error = %e, "shm unlink failed");
        }
        if let Err(e) = SemTriple::unlink(self.page.key()) {
            debug!(key = %self.page.key(), error = %e, "semaphore unlink failed");
        }
        if let Some(addr) = self.sock_addr.take() {
            let _ = fs::remove_file(addr);
        }
        self.sock = None;

        if let ChildHandle::Process(pid) = self.child {
            if !self.flags.subsegment {
                nanny::schedule(pid);
            }
        }
    }

    /// Tear the segment down and release every resource it owns.
    pub fn release(mut self) {
        self.destroy();
    }

    /// Drop only process-local resources: unmap and close, but leave the
    /// shared names, the page contents and the dead-man switch untouched.
    ///
    /// After forking a bridge process the parent's copy must go away without
    /// killing the segment the child is now serving.
    pub fn forget_shared(mut self) {
        self.state = FeedState::Dead;
        self.flags.alive = false;
        self.sock = None;
        self.sock_addr = None;
        // Drop now runs destroy() against the Dead state, which is a no-op;
        // PageMap and SemTriple close their local handles on the way out.
    }

    // ── accessors ───────────────────────────────────────────────────────────

    pub fn key(&self) -> &str {
        self.page.key()
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    pub fn flags(&self) -> SegmentFlags {
        self.flags
    }

    pub fn child(&self) -> ChildHandle {
        self.child
    }

    pub fn page(&self) -> &PageMap {
        &self.page
    }

    pub fn sems(&self) -> &SemTriple {
        &self.sems
    }

    /// The rendezvous path while one is bound.
    pub fn sock_addr(&self) -> Option<&Path> {
        self.sock_addr.as_deref()
    }

    /// Raw control-socket descriptor, for hosts that select over segments.
    pub fn sock_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.sock.as_ref().map(|s| s.as_raw_fd())
    }

    pub(crate) fn audio_buf_len(&self) -> usize {
        self.audio_buf.as_ref().map_or(AUDIO_BUF_SZ, Vec::len)
    }

    /// Resource string this segment was launched with, if any.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}

impl Drop for Frameserver {
    fn drop(&mut self) {
        self.destroy();
    }
}
