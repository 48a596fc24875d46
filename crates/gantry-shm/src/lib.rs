//! Shared-memory substrate for gantry frameserver segments.
//!
//! A *segment* is one shared page plus three named semaphores, keyed by a
//! short printable name. The page starts with a versioned header, carries
//! two event rings, and ends in the video and audio buffers. This crate owns
//! the layout, the page lifecycle (create / open / resize / unlink) and the
//! semaphore plumbing; connection establishment and child supervision live
//! in the `gantry` crate on top.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────┬───────────────┬───────────────┬─────────────┬───────────┐
//! │  PageHeader  │ in EventRing  │ out EventRing │ video (w*h) │   audio   │
//! └──────────────┴───────────────┴───────────────┴─────────────┴───────────┘
//! 0              64                                vofs          aofs
//! ```
//!
//! The header cookie is folded from every layout-affecting constant, so a
//! producer and consumer built with different limits refuse to pair.

pub mod event;
pub mod layout;
pub mod page;
pub mod sem;

pub use event::{category, kind, Event, EventRing, RingFull, EVENT_MSG_LEN, EVENT_RING_CAP};
pub use layout::{
    buffer_offsets, cookie, page_bytes, HeaderError, PageHeader, AUDIO_BUF_SZ, KEY_LEN, KEY_LIM,
    MAJOR, MAX_H, MAX_W, MINOR, PAGE_MAX_SZ, PAGE_START_SZ, VCHANNELS,
};
pub use page::{OpenError, PageMap, ResizeOutcome};
pub use sem::{sem_name, Channel, SemTriple};
