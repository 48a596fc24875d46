//! Data-plane round trip: a mock child maps the page by key and the host
//! observes its writes after one semaphore cycle.

#![cfg(unix)]

use std::io::Read;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use gantry::{FeedCommand, FeedState, Frameserver};
use gantry_shm::{category, Channel, Event, PageMap, SemTriple, KEY_LEN};

fn live_segment(tmp: &std::path::Path) -> (Frameserver, UnixStream) {
    let mut fsrv = Frameserver::listen_external_at(tmp, "rt1", None).unwrap();
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
fn video_bytes_cross_the_page_after_one_sem_cycle() {
    let tmp = tempfile::tempdir().unwrap();
    let (fsrv, _client) = live_segment(tmp.path());

    // The mock child attaches with nothing but the key.
    let child_page = PageMap::open(fsrv.key()).unwrap();
    let child_sems = SemTriple::open(fsrv.key()).unwrap();

    let frame: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(7) >> 2) as u8).collect();
    unsafe {
        child_page.video_bytes()[..frame.len()].copy_from_slice(&frame);
    }
    child_sems.post(Channel::Video).unwrap();

    fsrv.sems().wait(Channel::Video).unwrap();
    let seen = unsafe { &fsrv.page().video_bytes()[..frame.len()] };
    assert_eq!(seen, frame.as_slice());
}

#[test]
fn events_cross_the_rings_both_ways() {
    let tmp = tempfile::tempdir().unwrap();
    let (fsrv, _client) = live_segment(tmp.path());

    let child_page = PageMap::open(fsrv.key()).unwrap();
    let child_sems = SemTriple::open(fsrv.key()).unwrap();

    // Child -> host on the in-ring.
    let mut ev = Event::new(category::EXTERNAL, 42);
    ev.set_message(b"ready");
    child_page.in_ring().try_enqueue(ev).unwrap();
    child_sems.post(Channel::Event).unwrap();

    assert!(fsrv.sems().try_wait(Channel::Event).unwrap());
    let got = fsrv.poll_event().unwrap();
    assert_eq!(got.kind, 42);
    assert_eq!(got.message_bytes(), b"ready");
    assert!(fsrv.poll_event().is_none());

    // Host -> child on the out-ring.
    fsrv.push_event(Event::new(category::TARGET, 9)).unwrap();
    let down = child_page.out_ring().try_dequeue().unwrap();
    assert_eq!(down.kind, 9);
}

#[test]
fn masked_categories_are_dropped() {
    let tmp = tempfile::tempdir().unwrap();
    let (fsrv, _client) = live_segment(tmp.path());
    let child_page = PageMap::open(fsrv.key()).unwrap();

    // The default mask admits EXTERNAL only.
    child_page
        .in_ring()
        .try_enqueue(Event::new(category::INPUT, 1))
        .unwrap();
    child_page
        .in_ring()
        .try_enqueue(Event::new(category::EXTERNAL, 2))
        .unwrap();

    let got = fsrv.poll_event().unwrap();
    assert_eq!(got.kind, 2);
    assert!(fsrv.poll_event().is_none());
}

#[test]
fn peer_clearing_dms_kills_live_segment() {
    let tmp = tempfile::tempdir().unwrap();
    let (mut fsrv, _client) = live_segment(tmp.path());
    let child_page = PageMap::open(fsrv.key()).unwrap();

    child_page.header().clear_dms();
    assert_eq!(fsrv.tick(FeedCommand::Poll), FeedState::Dead);
}
