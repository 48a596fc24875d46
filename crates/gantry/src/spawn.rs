//! Launching authoritative frameserver children.
//!
//! A spawned child is trusted: it inherits the segment key through its
//! environment and a pre-connected control socket, and the segment starts
//! `Live` with no handshake.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

use gantry_shm::{SemTriple, AUDIO_BUF_SZ};

use crate::frameserver::{ChildHandle, FeedState, Frameserver};
use crate::handshake::set_cloexec;
use crate::Error;

/// Paths the engine resolves for us: where the trusted helper binary lives
/// and what the application-relative resource root is.
#[derive(Debug, Clone)]
pub struct SpawnPaths {
    /// The well-known frameserver helper binary (decode, encode, ...).
    pub helper_bin: PathBuf,
    /// Value passed to the child as `ARCAN_APPLPATH`.
    pub appl_path: PathBuf,
}

/// What to execute in the child.
pub enum LaunchArgs {
    /// A mode of the built-in helper binary, e.g. `decode` with a media
    /// resource. The helper receives the segment key as its second argument.
    Builtin { mode: String, resource: String },
    /// An arbitrary binary with explicit argument and environment vectors.
    /// The segment credentials are added as `ARCAN_SHMKEY`/`ARCAN_SHMSIZE`.
    External {
        path: PathBuf,
        argv: Vec<String>,
        envv: Vec<(String, String)>,
    },
}

pub struct SpawnSetup {
    pub args: LaunchArgs,
    pub init_w: u16,
    pub init_h: u16,
    pub paths: SpawnPaths,
}

/// Create a datagram pair for the control channel.
///
/// The parent end is marked close-on-exec; the child end is left
/// inheritable so its number can be passed through `ARCAN_SOCKIN_FD`.
pub(crate) fn control_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let parent = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let child = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    set_cloexec(parent.as_raw_fd())?;
    Ok((parent, child))
}

/// Allocate a segment and fork/exec a trusted frameserver for it.
pub fn spawn_server(setup: SpawnSetup) -> Result<Frameserver, Error> {
    let (page, sems) = Frameserver::alloc(setup.init_w, setup.init_h)?;
    let (parent_sock, child_sock) = match control_pair() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = page.unlink();
            let _ = SemTriple::unlink(page.key());
            return Err(e.into());
        }
    };

    let mut cmd;
    let source;
    match &setup.args {
        LaunchArgs::Builtin { mode, resource } => {
            cmd = Command::new(&setup.paths.helper_bin);
            cmd.arg(mode).arg(page.key());
            cmd.env("ARCAN_ARG", resource);
            source = Some(resource.clone());
        }
        LaunchArgs::External { path, argv, envv } => {
            cmd = Command::new(path);
            cmd.args(argv);
            for (k, v) in envv {
                cmd.env(k, v);
            }
            cmd.env("ARCAN_SHMKEY", page.key());
            cmd.env("ARCAN_SHMSIZE", page.size().to_string());
            cmd.env("ARCAN_ARG", "");
            source = None;
        }
    }

    cmd.env("ARCAN_SOCKIN_FD", child_sock.as_raw_fd().to_string());
    cmd.env("ARCAN_APPLPATH", &setup.paths.appl_path);

    // SIGINT is masked so a debugger on the host does not reap the child,
    // and the death signal bounds how long an orphan can linger.
    unsafe {
        cmd.pre_exec(|| {
            libc::signal(libc::SIGINT, libc::SIG_IGN);
            #[cfg(target_os = "linux")]
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            let _ = page.unlink();
            let _ = SemTriple::unlink(page.key());
            return Err(e.into());
        }
    };
    let pid = child.id() as libc::pid_t;
    debug!(pid, key = %page.key(), "spawned frameserver child");

    // The child holds its own copy now.
    drop(child_sock);
    // Reaping is the nanny's (or the host sweep's) job, not Drop's.
    drop(child);

    let mut fsrv = Frameserver::from_parts(page, sems, FeedState::Live);
    fsrv.sock = Some(parent_sock);
    fsrv.child = ChildHandle::Process(pid);
    fsrv.flags.alive = true;
    fsrv.source = source;
    fsrv.attach_audio(AUDIO_BUF_SZ);
    Ok(fsrv)
}
