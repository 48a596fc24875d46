//! Kill-after-grace supervision for frameserver children.
//!
//! The host cannot block in its frame loop, and keeping a table of
//! presumed-alive children invites dangling entries when a child exits
//! between lookup and kill. Instead each released child gets its own
//! detached supervisor thread: probe once a second, and after the grace
//! period send an unconditional `SIGKILL`.

use std::time::Duration;

use once_cell::sync::Lazy;

/// Seconds between the release of a segment and the forced kill.
pub const GRACE_SECS: u32 = 10;

// Checked once; flipping the variable mid-run has no effect. Debugging a
// child under a tracer attached to the parent would otherwise race the kill.
static NO_NANNY: Lazy<bool> =
    Lazy::new(|| std::env::var_os("ARCAN_DEBUG_NONANNY").is_some());

/// Schedule `pid` for termination unless it exits within [`GRACE_SECS`].
///
/// `pid` must be a child of this process; the supervisor reaps it either
/// way. A no-op when `ARCAN_DEBUG_NONANNY` is set.
pub fn schedule(pid: libc::pid_t) {
    schedule_with_grace(pid, GRACE_SECS)
}

pub(crate) fn schedule_with_grace(pid: libc::pid_t, grace: u32) {
    if pid <= 1 {
        return;
    }
    if *NO_NANNY {
        tracing::debug!(pid, "nanny disabled by environment");
        return;
    }

    let run = move || {
        let mut status: libc::c_int = 0;
        for _ in 0..grace {
            std::thread::sleep(Duration::from_secs(1));
            let rv = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if rv != 0 {
                // Exited (and is now reaped), or someone else already
                // reaped it; either way there is nothing left to kill.
                return;
            }
        }

        tracing::debug!(pid, "grace period expired, killing child");
        unsafe {
            libc::kill(pid, libc::SIGKILL);
            libc::waitpid(pid, &mut status, 0);
        }
    };

    let spawned = std::thread::Builder::new()
        .name(format!("nanny-{pid}"))
        .spawn(run);

    if spawned.is_err() {
        // No thread, no grace.
        tracing::warn!(pid, "could not spawn nanny thread, killing immediately");
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}
