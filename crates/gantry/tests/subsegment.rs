//! Subsegment multiplexing over an established connection.

#![cfg(unix)]

use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use passfd::FdPassingExt;

use gantry::{spawn_subsegment, FeedCommand, FeedState, Frameserver};
use gantry_shm::{kind, Channel, KEY_LEN};

/// Bring up a live parent segment with `client` holding the other end of
/// the connection.
fn live_pair(tmp: &std::path::Path, name: &str) -> (Frameserver, UnixStream) {
    let mut fsrv = Frameserver::listen_external_at(tmp, name, None).unwrap();
    let path = fsrv.sock_addr().unwrap().to_path_buf();

    let mut client = UnixStream::connect(&path).unwrap();
    for _ in 0..200 {
        if fsrv.tick(FeedCommand::Poll) == FeedState::Live {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(fsrv.state(), FeedState::Live);

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut line = vec![0u8; KEY_LEN + 1];
    client.read_exact(&mut line).unwrap();
    (fsrv, client)
}

#[test]
fn subsegment_carries_key_event_and_descriptor() {
    let tmp = tempfile::tempdir().unwrap();
    let (mut parent, client) = live_pair(tmp.path(), "sub1");

    let sub = spawn_subsegment(&mut parent, false, 64, 48, 7).unwrap();

    assert!(sub.flags().subsegment);
    assert!(sub.flags().socksig);
    assert_eq!(sub.state(), FeedState::Live);
    assert_eq!(sub.child(), parent.child());
    assert_eq!(sub.page().header().w, 64);
    assert_eq!(sub.page().header().h, 48);

    // The pushed control-socket end is collectable on the client side.
    let pushed = client.as_raw_fd().recv_fd().unwrap();
    assert!(pushed > 0);

    // Two announcements in the parent's outgoing queue, in order.
    let fd_ev = parent.page().out_ring().try_dequeue().unwrap();
    assert_eq!(fd_ev.kind, kind::FDTRANSFER);

    let new_ev = parent.page().out_ring().try_dequeue().unwrap();
    assert_eq!(new_ev.kind, kind::NEWSEGMENT);
    assert_eq!(new_ev.args, [0, 7]);
    assert_eq!(new_ev.message_bytes(), sub.key().as_bytes());

    // Both enqueues signalled the event semaphore.
    assert!(parent.sems().try_wait(Channel::Event).unwrap());
    assert!(parent.sems().try_wait(Channel::Event).unwrap());
    assert!(!parent.sems().try_wait(Channel::Event).unwrap());

    // The pushed descriptor is a usable datagram socket: our end of the
    // pair reaches the subsegment's end.
    let our = sub.sock_fd().unwrap();
    let msg = b"ping";
    let sent = unsafe {
        libc::send(our, msg.as_ptr() as *const libc::c_void, msg.len(), 0)
    };
    assert_eq!(sent, msg.len() as isize);
    let mut buf = [0u8; 8];
    let got = unsafe {
        libc::recv(pushed, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
    };
    assert_eq!(got, msg.len() as isize);
    assert_eq!(&buf[..4], msg);

    unsafe { libc::close(pushed) };
}

#[test]
fn input_subsegment_skips_audio_hints_clamped() {
    let tmp = tempfile::tempdir().unwrap();
    let (mut parent, client) = live_pair(tmp.path(), "sub2");

    let sub = spawn_subsegment(&mut parent, true, -1, 99999, 3).unwrap();
    assert_eq!(sub.page().header().w, 32);
    assert_eq!(sub.page().header().h, 32);

    let _ = client.as_raw_fd().recv_fd().unwrap();
    let fd_ev = parent.page().out_ring().try_dequeue().unwrap();
    assert_eq!(fd_ev.kind, kind::FDTRANSFER);
    let new_ev = parent.page().out_ring().try_dequeue().unwrap();
    assert_eq!(new_ev.args, [1, 3]);
}

#[test]
fn dead_parent_refuses_subsegments() {
    let tmp = tempfile::tempdir().unwrap();
    let (mut parent, _client) = live_pair(tmp.path(), "sub3");
    parent.tick(FeedCommand::Destroy);
    assert!(spawn_subsegment(&mut parent, false, 32, 32, 0).is_err());
}
