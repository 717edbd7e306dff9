//! Handoff between slurpers and the indexer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::error::{Result, RiverError};
use crate::event::ChangeEvent;

// how often blocked queue operations re-check the active flag.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// FIFO event queue connecting N slurpers to one indexer.
///
/// `throttle_size == -1` selects an unbounded queue where producers never
/// block; any positive capacity gives a bounded queue whose `put` blocks when
/// full. All blocking operations observe the shared `active` flag and return
/// [`RiverError::Interrupted`] once it is cleared.
#[derive(Clone)]
pub struct EventQueue {
    tx: Sender<ChangeEvent>,
    rx: Receiver<ChangeEvent>,
    active: Arc<AtomicBool>,
}

impl EventQueue {
    pub fn new(throttle_size: i64, active: Arc<AtomicBool>) -> EventQueue {
        let (tx, rx) = if throttle_size == -1 {
            channel::unbounded()
        } else {
            channel::bounded(throttle_size.max(1) as usize)
        };
        EventQueue { tx, rx, active }
    }

    /// Enqueue one event, blocking while the queue is full.
    pub fn put(&self, event: ChangeEvent) -> Result<()> {
        let mut event = event;
        loop {
            if !self.active.load(Ordering::Relaxed) {
                return Err(RiverError::Interrupted);
            }
            match self.tx.send_timeout(event, WAIT_SLICE) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(ev)) => event = ev,
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(RiverError::QueueDisconnected)
                }
            }
        }
    }

    /// Dequeue one event, blocking until one is available.
    pub fn take(&self) -> Result<ChangeEvent> {
        loop {
            if !self.active.load(Ordering::Relaxed) {
                return Err(RiverError::Interrupted);
            }
            match self.rx.recv_timeout(WAIT_SLICE) {
                Ok(event) => return Ok(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(RiverError::QueueDisconnected),
            }
        }
    }

    /// Dequeue one event, waiting at most `timeout`. Ok(None) means the
    /// timeout elapsed with nothing to take.
    pub fn poll(&self, timeout: Duration) -> Result<Option<ChangeEvent>> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(RiverError::QueueDisconnected),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
