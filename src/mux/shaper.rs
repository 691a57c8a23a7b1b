//! Write shaper
//!
//! Every outbound frame is submitted as a [`WriteRequest`] stamped with a
//! session-wide sequence number. The shaper holds pending requests in a
//! bounded min-heap and hands them to the writer one at a time, lowest
//! sequence first, so frames hit the wire in submission order no matter
//! which task submitted them.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::error::Result;

use super::frame::Frame;
use super::signal::Signal;

/// One frame waiting for the writer
#[derive(Debug)]
pub struct WriteRequest {
    pub frame: Frame,
    pub seq: u32,
    /// Receives the plaintext byte count or the write error; `None` for
    /// fire-and-forget submissions.
    pub result: Option<oneshot::Sender<Result<usize>>>,
}

/// `a` was submitted before `b`, tolerating wraparound of the counter
fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

impl PartialEq for WriteRequest {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for WriteRequest {}

impl PartialOrd for WriteRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap: the earliest sequence must compare greatest.
impl Ord for WriteRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.seq == other.seq {
            Ordering::Equal
        } else if seq_before(self.seq, other.seq) {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    }
}

/// Bounded heap of pending requests
#[derive(Debug)]
pub struct ShaperQueue {
    heap: BinaryHeap<WriteRequest>,
    capacity: usize,
}

impl ShaperQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, req: WriteRequest) {
        self.heap.push(req);
    }

    /// Remove the request with the lowest sequence number
    pub fn pop(&mut self) -> Option<WriteRequest> {
        self.heap.pop()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

/// Move requests from `requests` to `writes` in sequence order until the
/// session dies or either channel closes.
pub async fn run(
    mut requests: mpsc::Receiver<WriteRequest>,
    writes: mpsc::Sender<WriteRequest>,
    die: &Signal,
    capacity: usize,
) {
    let mut queue = ShaperQueue::new(capacity);

    loop {
        let full = queue.is_full();
        let empty = queue.is_empty();

        // Drain whatever is already submitted before handing one to the
        // writer, so late arrivals with lower sequence numbers get ahead.
        tokio::select! {
            biased;
            _ = die.fired() => return,
            req = requests.recv(), if !full => match req {
                Some(req) => {
                    trace!("shaper queued seq {} ({} pending)", req.seq, queue.len() + 1);
                    queue.push(req);
                }
                None => return,
            },
            permit = writes.reserve(), if !empty => match (permit, queue.pop()) {
                (Ok(permit), Some(req)) => permit.send(req),
                (Err(_), _) => return,
                (Ok(_), None) => {}
            },
        }
    }
}
