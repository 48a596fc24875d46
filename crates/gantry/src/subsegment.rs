//! Multiplexing additional segments onto an existing connection.
//!
//! A live frameserver can request more segments; the new segment reuses the
//! parent's transport by passing one end of a fresh control socketpair over
//! the parent's control channel, followed by a `NEWSEGMENT` event carrying
//! the new key.

use std::os::unix::io::AsRawFd;

use tracing::debug;

use gantry_shm::{category, kind, Event, SemTriple, AUDIO_BUF_SZ, MAX_H, MAX_W};

use crate::frameserver::{FeedState, Frameserver};
use crate::spawn::control_pair;
use crate::handshake::set_cloexec;
use crate::Error;

fn clamp_hint(v: i32, max: usize) -> u16 {
    if v <= 0 || v as usize > max {
        32
    } else {
        v as u16
    }
}

/// Allocate a subsegment of `parent` and announce it to the child.
///
/// `input` marks an encoder-direction segment (child feeds the host); those
/// skip the audio feed. `tag` is echoed back so the requester can pair the
/// event with its request.
pub fn spawn_subsegment(
    parent: &mut Frameserver,
    input: bool,
    hintw: i32,
    hinth: i32,
    tag: i32,
) -> Result<Frameserver, Error> {
    if !parent.flags.alive {
        return Err(Error::BadArgument);
    }

    let w = clamp_hint(hintw, MAX_W);
    let h = clamp_hint(hinth, MAX_H);

    // Dimensions land in the header before the key is pushed, so the child
    // never observes a half-configured page.
    let (page, sems) = Frameserver::alloc(w, h)?;

    let (our_end, their_end) = match control_pair() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = page.unlink();
            let _ = SemTriple::unlink(page.key());
            return Err(e.into());
        }
    };
    // Both ends stay out of future execs; the child gets its copy through
    // the descriptor transfer, not inheritance.
    if let Err(e) = set_cloexec(their_end.as_raw_fd()) {
        let _ = page.unlink();
        let _ = SemTriple::unlink(page.key());
        return Err(e.into());
    }

    if let Err(e) = parent.push_fd(their_end.as_raw_fd()) {
        let _ = page.unlink();
        let _ = SemTriple::unlink(page.key());
        return Err(e);
    }
    drop(their_end);

    let mut ev = Event::new(category::TARGET, kind::NEWSEGMENT);
    ev.args = [input as i32, tag];
    ev.set_message(page.key().as_bytes());

    let mut seg = Frameserver::from_parts(page, sems, FeedState::Live);
    seg.sock = Some(our_end);
    // Liveness hint only: the subsegment never supervises this pid.
    seg.child = parent.child;
    seg.flags.alive = true;
    seg.flags.subsegment = true;
    seg.flags.socksig = true;
    seg.flags.pbo = parent.flags.pbo;
    seg.queue_mask = category::EXTERNAL;
    seg.source = parent.source.clone();

    if !input {
        // The parent's staging size and the default may drift; the larger
        // of the two can never under-serve either reader.
        seg.attach_audio(parent.audio_buf_len().max(AUDIO_BUF_SZ));
    }

    parent.push_event(ev)?;
    debug!(parent = %parent.key(), key = %seg.key(), input, tag, "subsegment allocated");
    Ok(seg)
}
