//! Frameserver control core.
//!
//! A *frameserver* is a sandboxed child process that produces or consumes
//! audio/video/event streams over a shared-memory segment. This crate
//! manages their lifecycle on the host side:
//!
//! - **authoritative** children are forked and exec'd by [`spawn_server`],
//!   inheriting the segment key through their environment and a connected
//!   control socket;
//! - **non-authoritative** clients connect to a filesystem rendezvous
//!   socket opened by [`Frameserver::listen_external`] and must complete a
//!   bounded key handshake before the segment key is revealed;
//! - **subsegments** multiplex further segments over an existing connection
//!   via [`spawn_subsegment`] and descriptor passing;
//! - misbehaving children are cleaned up by the [`nanny`], which guarantees
//!   termination within a bounded grace period.
//!
//! The host drives each segment with [`Frameserver::tick`] once per frame;
//! nothing in this crate blocks on that path.

pub mod error;
pub mod frameserver;
pub mod handshake;
pub mod nanny;
pub mod spawn;
pub mod subsegment;

pub use error::Error;
pub use frameserver::{
    resolve_sock_path, ChildHandle, FeedCommand, FeedState, Frameserver, SegmentFlags, SOCK_MODE,
    SOCK_PREFIX,
};
pub use handshake::ct_eq;
pub use spawn::{spawn_server, LaunchArgs, SpawnPaths, SpawnSetup};
pub use subsegment::spawn_subsegment;
