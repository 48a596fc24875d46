//! Non-authoritative connection establishment over a real rendezvous socket.

#![cfg(unix)]

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use gantry::{FeedCommand, FeedState, Frameserver};
use gantry_shm::{PageMap, KEY_LEN, KEY_LIM};

/// Drive the per-frame callback until the segment reaches `want` or the
/// tick budget runs out.
fn drive_until(fsrv: &mut Frameserver, want: FeedState, max_ticks: usize) -> FeedState {
    let mut state = fsrv.state();
    for _ in 0..max_ticks {
        state = fsrv.tick(FeedCommand::Poll);
        if state == want {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    state
}

#[test]
fn keyless_client_receives_key_and_goes_live() {
    let tmp = tempfile::tempdir().unwrap();
    let mut fsrv = Frameserver::listen_external_at(tmp.path(), "test1", None).unwrap();
    let path = fsrv.sock_addr().unwrap().to_path_buf();
    assert_eq!(fsrv.state(), FeedState::Listen);
    assert!(path.exists());

    let mut client = UnixStream::connect(&path).unwrap();
    client.write_all(b"k\n").unwrap();

    assert_eq!(drive_until(&mut fsrv, FeedState::Live, 200), FeedState::Live);

    // The path is retired the moment the connection is accepted.
    assert!(!path.exists());

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut line = vec![0u8; KEY_LEN + 1];
    client.read_exact(&mut line).unwrap();
    assert_eq!(&line[..KEY_LEN], fsrv.key().as_bytes());
    assert_eq!(line[KEY_LEN], b'\n');
}

#[test]
fn wrong_key_is_released_without_leaking_the_key() {
    let tmp = tempfile::tempdir().unwrap();
    let expected = [0x41u8; KEY_LIM];
    let mut fsrv =
        Frameserver::listen_external_at(tmp.path(), "test2", Some(expected.as_slice())).unwrap();
    let path = fsrv.sock_addr().unwrap().to_path_buf();
    let key = fsrv.key().to_owned();

    let mut client = UnixStream::connect(&path).unwrap();
    let mut bad = vec![0x41u8; KEY_LIM - 1];
    bad.push(0x42);
    bad.push(b'\n');
    client.write_all(&bad).unwrap();

    // One byte per frame; give it plenty of frames.
    assert_eq!(drive_until(&mut fsrv, FeedState::Dead, 500), FeedState::Dead);

    // No key line: the socket just closes on us.
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; KEY_LIM];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0, "released connection must not send any bytes");

    // The shared-memory name is gone too.
    assert!(PageMap::open(&key).is_err());
    assert!(!path.exists());
}

#[test]
fn matching_prefix_key_goes_live() {
    let tmp = tempfile::tempdir().unwrap();
    // A short expected key, zero padded on both sides.
    let mut expected = [0u8; KEY_LIM];
    expected[..6].copy_from_slice(b"sesame");

    let mut fsrv =
        Frameserver::listen_external_at(tmp.path(), "test3", Some(expected.as_slice())).unwrap();
    let path = fsrv.sock_addr().unwrap().to_path_buf();

    let mut client = UnixStream::connect(&path).unwrap();
    client.write_all(b"sesame\n").unwrap();

    assert_eq!(drive_until(&mut fsrv, FeedState::Live, 200), FeedState::Live);

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut line = vec![0u8; KEY_LEN + 1];
    client.read_exact(&mut line).unwrap();
    assert_eq!(&line[..KEY_LEN], fsrv.key().as_bytes());
}

#[test]
fn client_hangup_while_listening_kills_segment() {
    let tmp = tempfile::tempdir().unwrap();
    let expected = [0x41u8; KEY_LIM];
    let mut fsrv =
        Frameserver::listen_external_at(tmp.path(), "test4", Some(expected.as_slice())).unwrap();
    let path = fsrv.sock_addr().unwrap().to_path_buf();

    let client = UnixStream::connect(&path).unwrap();
    // Accept happens on the first tick; then the client vanishes.
    fsrv.tick(FeedCommand::Poll);
    drop(client);

    assert_eq!(drive_until(&mut fsrv, FeedState::Dead, 200), FeedState::Dead);
}

#[test]
fn release_unlinks_everything() {
    let tmp = tempfile::tempdir().unwrap();
    let fsrv = Frameserver::listen_external_at(tmp.path(), "test5", None).unwrap();
    let path = fsrv.sock_addr().unwrap().to_path_buf();
    let key = fsrv.key().to_owned();
    assert!(path.exists());

    fsrv.release();

    assert!(!path.exists());
    assert!(PageMap::open(&key).is_err());
    assert!(gantry_shm::SemTriple::open(&key).is_err());
}

#[test]
fn destroy_command_is_terminal() {
    let tmp = tempfile::tempdir().unwrap();
    let mut fsrv = Frameserver::listen_external_at(tmp.path(), "test6", None).unwrap();
    assert_eq!(fsrv.tick(FeedCommand::Destroy), FeedState::Dead);
    assert_eq!(fsrv.tick(FeedCommand::Poll), FeedState::Dead);
    assert!(!fsrv.is_alive());
}

#[test]
fn resize_is_damped_within_window() {
    let tmp = tempfile::tempdir().unwrap();
    let mut fsrv = Frameserver::listen_external_at(tmp.path(), "test7", None).unwrap();
    let path = fsrv.sock_addr().unwrap().to_path_buf();

    // Resizing is forbidden before the connection is live.
    assert!(!fsrv.resize(640, 480));

    let _client = UnixStream::connect(&path).unwrap();
    assert_eq!(drive_until(&mut fsrv, FeedState::Live, 200), FeedState::Live);

    assert!(fsrv.resize(1920, 1080));
    let size = fsrv.page().size();

    // Within the damping window: accepted, nothing remapped.
    assert!(fsrv.resize(1919, 1081));
    assert_eq!(fsrv.page().size(), size);
    assert_eq!(fsrv.page().header().w, 1920);
}

#[test]
fn bad_connpoint_names_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    assert!(Frameserver::listen_external_at(tmp.path(), "", None).is_err());
    assert!(Frameserver::listen_external_at(tmp.path(), "has space", None).is_err());
    assert!(Frameserver::listen_external_at(tmp.path(), "has/slash", None).is_err());
}
