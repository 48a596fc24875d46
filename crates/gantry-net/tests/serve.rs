//! End-to-end dispatch paths over loopback TCP.

#![cfg(unix)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use gantry::{FeedCommand, FeedState, Frameserver};
use gantry_net::opts::{Dispatch, Mode, Opts};
use gantry_net::serve::handle_inbound;
use gantry_net::session::authenticate_outbound;

fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

fn base_opts(mode: Mode) -> Opts {
    Opts {
        mode,
        dispatch: Dispatch::Single,
        ..Opts::default()
    }
}

#[test]
fn exec_mode_runs_target_after_valid_handshake() {
    let (mut client, server) = tcp_pair();

    let mut opts = base_opts(Mode::Exec);
    opts.exec_bin = Some("/bin/true".into());

    let worker = std::thread::spawn(move || handle_inbound(server, &opts, None));

    authenticate_outbound(&mut client, None).unwrap();
    drop(client);

    assert_eq!(worker.join().unwrap(), 0);
}

#[test]
fn exec_mode_refuses_bad_handshake_without_spawning() {
    let (mut client, server) = tcp_pair();

    let mut opts = base_opts(Mode::Exec);
    opts.exec_bin = Some("/bin/true".into());

    let worker = std::thread::spawn(move || handle_inbound(server, &opts, None));

    // Garbage instead of a hello.
    client.write_all(b"NOTAPROTO").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 64];
    // Server side sends its hello then shuts down on the mismatch; all we
    // are owed is an eventual EOF.
    while client.read(&mut buf).unwrap_or(0) > 0 {}

    assert_eq!(worker.join().unwrap(), 1);
}

#[test]
fn exec_mode_with_secret_gates_the_spawn() {
    let (mut client, server) = tcp_pair();

    let mut opts = base_opts(Mode::Exec);
    opts.exec_bin = Some("/bin/true".into());

    let worker =
        std::thread::spawn(move || handle_inbound(server, &opts, Some(&b"letmein"[..])));

    authenticate_outbound(&mut client, Some(&b"wrong"[..])).unwrap();
    let mut buf = [0u8; 16];
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    assert_eq!(client.read(&mut buf).unwrap(), 0);
    assert_eq!(worker.join().unwrap(), 1);
}

#[test]
fn inbound_bridges_to_local_connpoint() {
    let tmp = tempfile::tempdir().unwrap();
    // The connpoint path resolver roots relative prefixes under HOME.
    std::env::set_var("HOME", tmp.path());

    let mut fsrv = Frameserver::listen_external("nettest", None).unwrap();

    // Host loop: drive the segment live, read the bridged payload off the
    // event channel, echo a reply.
    let host = std::thread::spawn(move || {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while fsrv.tick(FeedCommand::Poll) != FeedState::Live {
            assert!(std::time::Instant::now() < deadline, "client never arrived");
            std::thread::sleep(Duration::from_millis(1));
        }

        let fd = fsrv.sock_fd().unwrap();
        let mut got = Vec::new();
        while got.len() < 2 {
            let mut buf = [0u8; 2];
            let rc = unsafe {
                libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if rc > 0 {
                got.extend_from_slice(&buf[..rc as usize]);
                continue;
            }
            assert!(std::time::Instant::now() < deadline, "payload never arrived");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(&got, b"hi");

        let rc = unsafe { libc::write(fd, b"ok".as_ptr() as *const libc::c_void, 2) };
        assert_eq!(rc, 2);
    });

    let mut opts = base_opts(Mode::Cl);
    opts.devicehint_cp = Some("nettest".into());

    let (mut client, server) = tcp_pair();
    let worker = std::thread::spawn(move || handle_inbound(server, &opts, None));

    authenticate_outbound(&mut client, None).unwrap();
    client.write_all(b"hi").unwrap();

    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ok");

    drop(client);
    host.join().unwrap();
    assert_eq!(worker.join().unwrap(), 0);
}
