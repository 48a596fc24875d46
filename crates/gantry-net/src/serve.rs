//! Mode dispatch: who connects where, and what runs the bridge.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use tracing::{debug, warn};

use gantry::{
    resolve_sock_path, spawn_server, FeedCommand, FeedState, Frameserver, LaunchArgs, SpawnPaths,
    SpawnSetup,
};
use gantry_shm::{PageMap, SemTriple, KEY_LIM};

use crate::opts::{Dispatch, Mode, Opts};
use crate::session::{authenticate_inbound, bridge, connect_retry};

/// A minimal local shmif client: rendezvous connect, keyless line, key
/// readback, page and semaphore attach.
pub struct LocalClient {
    pub stream: UnixStream,
    // Held for the lifetime of the bridge so the mapping stays valid.
    _page: PageMap,
    _sems: SemTriple,
}

/// Connect to a local connpoint the way an external client would,
/// proving `key` when the connpoint demands one.
pub fn connect_local(connpath: &str, auth_key: Option<&[u8]>) -> io::Result<LocalClient> {
    let path = resolve_sock_path(connpath)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let mut stream = UnixStream::connect(path)?;
    if let Some(key) = auth_key {
        stream.write_all(key)?;
        stream.write_all(b"\n")?;
    }

    stream
        .set_read_timeout(Some(Duration::from_secs(10)))?;
    let mut key = String::new();
    loop {
        let mut ch = [0u8; 1];
        stream.read_exact(&mut ch)?;
        if ch[0] == b'\n' {
            break;
        }
        if key.len() >= KEY_LIM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized key line from connpoint",
            ));
        }
        key.push(ch[0] as char);
    }
    stream.set_read_timeout(None)?;

    let page = PageMap::open(&key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let sems = SemTriple::open(&key)?;

    debug!(key = %key, "attached to local connpoint");
    Ok(LocalClient {
        stream,
        _page: page,
        _sems: sems,
    })
}

/// Drop privileges a forked bridge does not need.
///
/// Re-exec'ing ourselves would also refresh ASLR; for now the child just
/// pins no-new-privs before touching peer data.
pub fn privsep() {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0);
    }
}

/// Serve one authenticated inbound connection: bring up the local client
/// half and pump until either side goes away. Returns a process exit code.
pub fn handle_inbound(mut stream: TcpStream, opts: &Opts, secret: Option<&[u8]>) -> i32 {
    if let Err(e) = authenticate_inbound(&mut stream, secret) {
        // Failed peers learn nothing beyond the closed socket; there is no
        // local client yet, so nothing to free.
        warn!(error = %e, "inbound authentication failed");
        return 1;
    }

    match opts.mode {
        Mode::Exec => {
            let bin = opts.exec_bin.clone().unwrap_or_default();
            debug!(bin = %bin, "client connected, spawning local client");

            let setup = SpawnSetup {
                args: LaunchArgs::External {
                    path: bin.clone().into(),
                    argv: opts.exec_argv.clone(),
                    envv: Vec::new(),
                },
                init_w: 32,
                init_h: 32,
                paths: SpawnPaths {
                    helper_bin: bin.into(),
                    appl_path: std::env::temp_dir(),
                },
            };

            let fsrv = match spawn_server(setup) {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "exec target failed to launch");
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                    return 1;
                }
            };

            let fd = fsrv.sock_fd().expect("spawned segment has a control socket");
            let rc = bridge(fd, &stream);
            // Full teardown: the segment was ours alone.
            fsrv.release();
            i32::from(rc.is_err())
        }
        _ => {
            let connpath = match opts.devicehint_cp.as_deref() {
                Some(cp) => cp.to_owned(),
                None => {
                    warn!("no local connpoint (set ARCAN_CONNPATH)");
                    return 1;
                }
            };
            let local = match connect_local(&connpath, None) {
                Ok(l) => l,
                Err(e) => {
                    warn!(connpath = %connpath, error = %e, "local connpoint unreachable");
                    return 1;
                }
            };
            let rc = bridge(local.stream.as_raw_fd(), &stream);
            i32::from(rc.is_err())
        }
    }
}

/// `-l` family: accept inbound TCP and dispatch per connection.
pub fn run_listen(opts: &Opts, secret: Option<&[u8]>) -> i32 {
    let host = opts.host.as_deref().unwrap_or("0.0.0.0");
    let port = opts.port.as_deref().unwrap_or_default();
    let listener = match TcpListener::bind(format!("{host}:{port}")) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("couldn't bind {host}:{port}: {e}");
            return 1;
        }
    };

    loop {
        let (conn, peer) = match listener.accept() {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Accept errors are terminal rather than a silent fallback
                // into another dispatch strategy.
                eprintln!("error while waiting for a connection: {e}");
                return 1;
            }
        };
        debug!(peer = %peer, "inbound connection");

        match opts.dispatch {
            Dispatch::Single => {
                let rc = handle_inbound(conn, opts, secret);
                if rc != 0 {
                    warn!(peer = %peer, "connection ended with failure");
                }
            }
            Dispatch::Fork => match unsafe { libc::fork() } {
                0 => {
                    unsafe { libc::close(listener.as_raw_fd()) };
                    privsep();
                    let rc = handle_inbound(conn, opts, secret);
                    std::process::exit(rc);
                }
                -1 => {
                    warn!("couldn't fork/dispatch, ulimits reached?");
                    drop(conn);
                }
                pid => {
                    debug!(pid, "client handed off");
                    drop(conn);
                }
            },
        }
    }
}

/// `-s`: open the connpoint, wait for a local client, then bridge it to a
/// fresh outbound connection.
pub fn run_connect(opts: &Opts, secret: Option<&[u8]>) -> i32 {
    let cp = opts.cp.as_deref().unwrap_or_default();
    let host = opts.host.clone().unwrap_or_default();
    let port = opts.port.clone().unwrap_or_default();

    loop {
        let mut fsrv = match Frameserver::listen_external(cp, None) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("couldn't open connection point '{cp}': {e}");
                return 1;
            }
        };

        // Block until something shows up on the rendezvous socket; we are
        // not inside anyone's frame loop here.
        let fd = fsrv.sock_fd().expect("listening segment has a socket");
        loop {
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN | libc::POLLERR | libc::POLLHUP,
                revents: 0,
            };
            let pv = unsafe { libc::poll(&mut pfd, 1, -1) };
            if pv > 0 {
                break;
            }
            if pv == -1 {
                let e = io::Error::last_os_error();
                if e.kind() != io::ErrorKind::Interrupted {
                    eprintln!("error while waiting for a local connection: {e}");
                    return 1;
                }
            }
        }

        // Drive the accept/key-transfer to completion. Bounded: a client
        // that connects and vanishes before accept would otherwise leave us
        // spinning here instead of back in the blocking poll.
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while matches!(fsrv.state(), FeedState::Listen | FeedState::Verify) {
            fsrv.tick(FeedCommand::Poll);
            if std::time::Instant::now() > deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        if fsrv.state() != FeedState::Live {
            warn!("local client vanished during connection setup");
            continue;
        }

        // Outbound setup happens after the local accept: the remote side is
        // the one likely to be slow or down.
        let stream = match connect_retry(
            &host,
            &port,
            opts.retry_count,
            secret,
            &mut || fsrv.is_alive(),
        ) {
            Some(s) => s,
            None => {
                warn!(host = %host, "could not reach peer, dropping local client");
                // The client is freed without touching the dead-man switch;
                // it can redirect itself to another connpoint.
                fsrv.forget_shared();
                continue;
            }
        };

        debug!("local connection found, forwarding to dispatch");
        let fd = fsrv.sock_fd().expect("live segment has a control socket");
        match opts.dispatch {
            Dispatch::Single => {
                if let Err(e) = bridge(fd, &stream) {
                    warn!(error = %e, "bridge terminated");
                }
                fsrv.release();
            }
            Dispatch::Fork => match unsafe { libc::fork() } {
                0 => {
                    privsep();
                    let rc = bridge(fd, &stream);
                    fsrv.release();
                    std::process::exit(i32::from(rc.is_err()));
                }
                -1 => {
                    warn!("couldn't fork bridge process");
                    fsrv.release();
                }
                pid => {
                    debug!(pid, "client handed off");
                    drop(stream);
                    // The child owns the segment now; only local handles go.
                    fsrv.forget_shared();
                }
            },
        }
    }
}

/// `-S`: the local primitive is an inherited, already-connected socket.
pub fn run_preauth(opts: &Opts, secret: Option<&[u8]>) -> i32 {
    let sockfd = opts.sockfd.unwrap_or(-1);
    let mut fsrv = match Frameserver::inherit_connection(sockfd) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("couldn't build connection from socket ({sockfd}): {e}");
            unsafe {
                libc::shutdown(sockfd, libc::SHUT_RDWR);
                libc::close(sockfd);
            }
            return 1;
        }
    };

    while fsrv.state() == FeedState::Verify {
        fsrv.tick(FeedCommand::Poll);
    }
    if fsrv.state() != FeedState::Live {
        eprintln!("inherited client rejected the segment");
        return 1;
    }

    let host = opts.host.clone().unwrap_or_default();
    let port = opts.port.clone().unwrap_or_default();
    let stream = match connect_retry(
        &host,
        &port,
        opts.retry_count,
        secret,
        &mut || fsrv.is_alive(),
    ) {
        Some(s) => s,
        None => {
            // Same policy as the connpoint path: the inherited client is
            // freed without touching the dead-man switch.
            fsrv.forget_shared();
            return 1;
        }
    };

    let fd = fsrv.sock_fd().expect("live segment has a control socket");
    let rc = bridge(fd, &stream);
    fsrv.release();
    i32::from(rc.is_err())
}

/// Bare `[tag@]host [port]`: one outbound connection, local client side.
pub fn run_outbound(
    target: &str,
    port_arg: Option<&str>,
    opts: &Opts,
    secret: Option<&[u8]>,
) -> i32 {
    let (host, port) = if let Some(tag) = target.strip_suffix('@').or_else(|| {
        target
            .rfind('@')
            .map(|at| &target[..at])
    }) {
        let dir = match crate::keystore::statepath() {
            Some(d) => d,
            None => {
                eprintln!("tag@ target needs a keystore (set ARCAN_STATEPATH)");
                return 1;
            }
        };
        match crate::keystore::lookup(&dir, tag) {
            Ok(Some((host, port))) => (host, port.to_string()),
            Ok(None) => {
                eprintln!("couldn't connect to any host for key {tag}");
                return 1;
            }
            Err(e) => {
                eprintln!("keystore lookup failed: {e}");
                return 1;
            }
        }
    } else {
        let port = match port_arg {
            Some(p) => p.to_owned(),
            None => crate::keystore::DEFAULT_PORT.to_string(),
        };
        (target.to_owned(), port)
    };

    let stream = match connect_retry(&host, &port, opts.retry_count, secret, &mut || true) {
        Some(s) => s,
        None => {
            eprintln!("couldn't connect to {host}");
            return 1;
        }
    };

    let connpath = match opts.devicehint_cp.as_deref() {
        Some(cp) => cp.to_owned(),
        None => {
            eprintln!("no local connpoint (set ARCAN_CONNPATH)");
            return 1;
        }
    };
    let local = match connect_local(&connpath, None) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("local connpoint unreachable: {e}");
            return 1;
        }
    };

    let rc = bridge(local.stream.as_raw_fd(), &stream);
    unsafe { libc::shutdown(stream.as_raw_fd(), libc::SHUT_RDWR) };
    i32::from(rc.is_err())
}
