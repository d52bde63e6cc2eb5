//! Restartable work queue.
//!
//! Wraps the bounded producer channel with consumed-but-unconfirmed
//! memory: every item handed out is remembered until the consumer
//! confirms it durable. After an end-of-medium the consumer flips the
//! queue into restore mode and the unconfirmed tail is replayed,
//! oldest first, against the next volume — no filesystem re-walk, no
//! reordering, no duplicates.
//!
//! The replay deque stays in production order (newest dispensed at the
//! head, oldest unconfirmed at the tail). Restore mode walks it with a
//! cursor rather than rotating items, so `confirm` keeps meaning "the
//! k oldest unconfirmed" even while a replay is in flight.

use std::collections::VecDeque;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, trace};

/// Nothing arrived from the producer within the polling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WouldBlock;

/// FIFO of work items with replay-after-failure memory.
///
/// Lives for the whole backup, across every volume change.
pub struct RestartableQueue<T: Clone> {
    rx: Receiver<T>,
    /// Head = most recently dispensed, tail = oldest unconfirmed.
    replay: VecDeque<T>,
    restoring: bool,
    /// How many replay items (counted from the tail) have been
    /// re-dispensed during the current restore.
    replayed: usize,
}

impl<T: Clone> RestartableQueue<T> {
    pub fn new(rx: Receiver<T>) -> Self {
        Self {
            rx,
            replay: VecDeque::new(),
            restoring: false,
            replayed: 0,
        }
    }

    /// Next item in production order, or `None` once the producer has
    /// disconnected and everything was dispensed. Blocks while the
    /// producer is alive but idle.
    ///
    /// In restore mode the unconfirmed tail is re-yielded oldest-first
    /// before any new item is taken from the producer; re-yielded items
    /// remain unconfirmed.
    pub fn get(&mut self) -> Option<T> {
        loop {
            match self.get_timeout(Duration::from_secs(1)) {
                Ok(item) => return item,
                Err(WouldBlock) => {}
            }
        }
    }

    /// Like [`get`], but gives up after `timeout` so callers can
    /// interleave cancellation checks with the blocking read.
    ///
    /// [`get`]: RestartableQueue::get
    pub fn get_timeout(&mut self, timeout: Duration) -> Result<Option<T>, WouldBlock> {
        if self.restoring {
            if self.replayed < self.replay.len() {
                let index = self.replay.len() - 1 - self.replayed;
                let item = self.replay[index].clone();
                self.replayed += 1;
                trace!(
                    replayed = self.replayed,
                    unconfirmed = self.replay.len(),
                    "re-dispensing unconfirmed item"
                );
                if self.replayed == self.replay.len() {
                    debug!("replay complete, resuming from producer");
                    self.restoring = false;
                }
                return Ok(Some(item));
            }
            self.restoring = false;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(item) => {
                self.replay.push_front(item.clone());
                Ok(Some(item))
            }
            Err(RecvTimeoutError::Timeout) => Err(WouldBlock),
            // Producer gone and channel drained: end of input.
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    /// Confirm the `k` oldest unconfirmed items durable, removing and
    /// returning them in production order.
    pub fn confirm(&mut self, k: usize) -> Vec<T> {
        let mut confirmed = Vec::with_capacity(k);
        for _ in 0..k {
            match self.replay.pop_back() {
                Some(item) => {
                    self.replayed = self.replayed.saturating_sub(1);
                    confirmed.push(item);
                }
                None => break,
            }
        }
        if !confirmed.is_empty() {
            trace!(
                confirmed = confirmed.len(),
                unconfirmed = self.replay.len(),
                "confirmed items"
            );
        }
        confirmed
    }

    /// Enter restore mode: subsequent [`get`]s replay the unconfirmed
    /// tail, oldest first, before reading the producer again.
    ///
    /// [`get`]: RestartableQueue::get
    pub fn begin_restore(&mut self) {
        debug!(unconfirmed = self.replay.len(), "queue entering restore mode");
        self.restoring = true;
        self.replayed = 0;
    }

    pub fn restoring(&self) -> bool {
        self.restoring
    }

    /// Items dispensed but not yet confirmed.
    pub fn unconfirmed(&self) -> usize {
        self.replay.len()
    }

    /// Items still to be dispensed plus items awaiting confirmation.
    pub fn len(&self) -> usize {
        self.rx.len() + self.replay.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
