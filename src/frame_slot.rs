//! Latest-frame holder for a single camera.
//!
//! A slot never queues: every accepted `push` replaces whatever was there, so memory per
//! camera stays at one frame no matter how fast the producer sends. Readers get a shared
//! `Arc<Frame>` and may read the same frame more than once.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::trace;

/// One encoded image plus where it came from.
#[derive(Debug, Clone)]
pub struct Frame {
    pub producer_id: String,
    pub camera_index: u32,
    /// Sequence number supplied by the producer (informational only).
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
    pub payload: Bytes,
    /// Assigned by the slot on acceptance; strictly increasing per slot.
    pub generation: u64,
}

impl Frame {
    pub fn new(producer_id: impl Into<String>, camera_index: u32, sequence: u64, payload: Bytes) -> Self {
        Self {
            producer_id: producer_id.into(),
            camera_index,
            sequence,
            received_at: Utc::now(),
            payload,
            generation: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Oversized,
    Malformed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The frame is now the slot's latest. `superseded_unread` is set when the frame it
    /// replaced was never read by an attached session.
    Accepted { generation: u64, superseded_unread: bool },
    Dropped(DropReason),
}

impl PushOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PushOutcome::Accepted { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SlotCounters {
    pub accepted: u64,
    pub superseded: u64,
    pub oversized: u64,
    pub malformed: u64,
}

struct SlotEntry {
    frame: Arc<Frame>,
    read: AtomicBool,
}

pub struct FrameSlot {
    cell: watch::Sender<Option<Arc<SlotEntry>>>,
    max_payload_bytes: usize,
    validate_format: bool,
    generation: AtomicU64,
    readers: Arc<AtomicUsize>,
    closed: AtomicBool,
    accepted: AtomicU64,
    superseded: AtomicU64,
    oversized: AtomicU64,
    malformed: AtomicU64,
}

impl FrameSlot {
    pub fn new(max_payload_bytes: usize, validate_format: bool) -> Self {
        let (cell, _) = watch::channel(None);
        Self {
            cell,
            max_payload_bytes,
            validate_format,
            generation: AtomicU64::new(0),
            readers: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            superseded: AtomicU64::new(0),
            oversized: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    /// Store `frame` as the latest one. Never blocks and never grows the slot.
    pub fn push(&self, mut frame: Frame) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Dropped(DropReason::Closed);
        }

        if frame.payload.len() > self.max_payload_bytes {
            self.oversized.fetch_add(1, Ordering::Relaxed);
            return PushOutcome::Dropped(DropReason::Oversized);
        }

        if frame.payload.is_empty()
            || (self.validate_format && image::guess_format(&frame.payload).is_err())
        {
            self.malformed.fetch_add(1, Ordering::Relaxed);
            return PushOutcome::Dropped(DropReason::Malformed);
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        frame.generation = generation;

        let entry = Arc::new(SlotEntry {
            frame: Arc::new(frame),
            read: AtomicBool::new(false),
        });
        let previous = self.cell.send_replace(Some(entry));
        self.accepted.fetch_add(1, Ordering::Relaxed);

        let superseded_unread = match previous {
            Some(prev) => {
                !prev.read.load(Ordering::Acquire) && self.readers.load(Ordering::Acquire) > 0
            }
            None => false,
        };
        if superseded_unread {
            self.superseded.fetch_add(1, Ordering::Relaxed);
            trace!("Superseded unread frame (generation {})", generation - 1);
        }

        PushOutcome::Accepted { generation, superseded_unread }
    }

    /// Count a frame the transport refused before it could be pushed (too large to buffer,
    /// undecodable). The held frame is untouched.
    pub fn reject(&self, reason: DropReason) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Dropped(DropReason::Closed);
        }
        match reason {
            DropReason::Oversized => self.oversized.fetch_add(1, Ordering::Relaxed),
            DropReason::Malformed => self.malformed.fetch_add(1, Ordering::Relaxed),
            DropReason::Closed => 0,
        };
        PushOutcome::Dropped(reason)
    }

    /// Latest frame, marked as read. The slot keeps it until the next push.
    pub fn take_latest(&self) -> Option<Arc<Frame>> {
        self.cell.borrow().as_ref().map(|entry| {
            entry.read.store(true, Ordering::Release);
            entry.frame.clone()
        })
    }

    /// Latest frame without marking it read; for status queries.
    pub fn peek(&self) -> Option<Arc<Frame>> {
        self.cell.borrow().as_ref().map(|entry| entry.frame.clone())
    }

    /// Receiver that wakes on every accepted push (and on close).
    pub fn changes(&self) -> SlotChanges {
        SlotChanges { rx: self.cell.subscribe() }
    }

    /// Count of the most recently accepted frame, 0 if none yet.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Register a session reading from this slot. Unread overwrites only count as drops
    /// while at least one reader is attached.
    pub fn attach_reader(&self) -> ReaderGuard {
        self.readers.fetch_add(1, Ordering::AcqRel);
        ReaderGuard { readers: self.readers.clone() }
    }

    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Release the held frame and refuse further pushes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cell.send_replace(None);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> SlotCounters {
        SlotCounters {
            accepted: self.accepted.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Waits for the next change of a slot.
pub struct SlotChanges {
    rx: watch::Receiver<Option<Arc<SlotEntry>>>,
}

impl SlotChanges {
    /// Resolves once a push or close happened after the last call. Returns false when the
    /// slot itself is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Forget pending notifications; the next `changed` waits for a new push.
    pub fn mark_seen(&mut self) {
        self.rx.borrow_and_update();
    }
}

/// Detaches a reader from its slot when dropped.
pub struct ReaderGuard {
    readers: Arc<AtomicUsize>,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::AcqRel);
    }
}
