//! Fixed-capacity event rings living inside the shared page.
//!
//! Each segment carries two rings: child-to-host (`in`) and host-to-child
//! (`out`). A ring is written by exactly one side and read by exactly the
//! other, so plain acquire/release on the head/tail indices is enough.

use core::cell::UnsafeCell;
use core::mem::size_of;
use core::sync::atomic::{AtomicU32, Ordering};

/// Number of slots per ring. Must be a power of two.
pub const EVENT_RING_CAP: usize = 64;

/// Payload bytes carried inline in an event (segment keys fit with room to
/// spare).
pub const EVENT_MSG_LEN: usize = 64;

/// Size of the ring bookkeeping that precedes the slots.
pub const RING_HEADER_SIZE: usize = 16;

/// Event categories, used both for tagging and for queue masks.
pub mod category {
    /// Control events from host to child.
    pub const TARGET: u32 = 1;
    /// Status events from an external or spawned client.
    pub const EXTERNAL: u32 = 2;
    /// Input samples routed to the child.
    pub const INPUT: u32 = 4;
}

/// Event kinds within [`category::TARGET`].
pub mod kind {
    /// A descriptor was pushed on the control socket; this event pairs with it.
    pub const FDTRANSFER: u32 = 1;
    /// A new subsegment is available; `message` holds its key.
    pub const NEWSEGMENT: u32 = 2;
    /// The segment is being torn down.
    pub const EXIT: u32 = 3;
}

/// One event record. Fixed size so the ring math is trivial on both sides.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Event {
    pub category: u32,
    pub kind: u32,
    /// Kind-specific small arguments (e.g. input flag and caller tag for
    /// `NEWSEGMENT`).
    pub args: [i32; 2],
    /// Inline payload, NUL padded.
    pub message: [u8; EVENT_MSG_LEN],
}

impl Default for Event {
    fn default() -> Self {
        Event {
            category: 0,
            kind: 0,
            args: [0; 2],
            message: [0; EVENT_MSG_LEN],
        }
    }
}

impl Event {
    pub fn new(category: u32, kind: u32) -> Self {
        Event {
            category,
            kind,
            ..Default::default()
        }
    }

    /// Copy `msg` into the inline payload, truncating to fit. One byte is
    /// always left for NUL termination.
    pub fn set_message(&mut self, msg: &[u8]) {
        let n = msg.len().min(EVENT_MSG_LEN - 1);
        self.message[..n].copy_from_slice(&msg[..n]);
        self.message[n..].fill(0);
    }

    /// The inline payload up to the first NUL.
    pub fn message_bytes(&self) -> &[u8] {
        let end = self
            .message
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(EVENT_MSG_LEN);
        &self.message[..end]
    }
}

/// Ring buffer of [`Event`]s, laid out directly in shared memory.
///
/// Never constructed by value; both sides obtain `&EventRing` views into the
/// mapped page. `head` is only advanced by the producer, `tail` only by the
/// consumer.
#[repr(C)]
pub struct EventRing {
    head: AtomicU32,
    tail: AtomicU32,
    _pad: [u8; RING_HEADER_SIZE - 2 * size_of::<AtomicU32>()],
    slots: [UnsafeCell<Event>; EVENT_RING_CAP],
}

const _: () = assert!(EVENT_RING_CAP.is_power_of_two());

// One producer and one consumer, in different processes; the indices carry
// the synchronization.
unsafe impl Send for EventRing {}
unsafe impl Sync for EventRing {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

impl std::fmt::Display for RingFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event ring full")
    }
}

impl std::error::Error for RingFull {}

impl EventRing {
    /// Reset the indices. Only valid while no peer is attached.
    pub fn init(&self) {
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
    }

    /// Enqueue an event, failing when the ring is full.
    pub fn try_enqueue(&self, ev: Event) -> Result<(), RingFull> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if head.wrapping_sub(tail) as usize >= EVENT_RING_CAP {
            return Err(RingFull);
        }

        let idx = head as usize & (EVENT_RING_CAP - 1);
        unsafe { *self.slots[idx].get() = ev };

        // Publish after the slot write completes.
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Dequeue the oldest event, or `None` when empty.
    pub fn try_dequeue(&self) -> Option<Event> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if tail == head {
            return None;
        }

        let idx = tail as usize & (EVENT_RING_CAP - 1);
        let ev = unsafe { *self.slots[idx].get() };

        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(ev)
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        head.wrapping_sub(tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= EVENT_RING_CAP
    }
}
