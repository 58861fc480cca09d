//! Priority mailbox feeding one worker
//!
//! Messages are served priority-major, FIFO-minor. Any number of producers
//! may `send`; exactly one consumer calls `receive`. An empty mailbox on
//! timeout is reported as [`Received::TimedOut`], which is ordinary control
//! flow for both worker heartbeats and coordinator deadlines.

use crate::error::{SopError, SopResult};
use crate::message::{Message, Priority};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Outcome of a receive
#[derive(Debug)]
pub enum Received {
    Message(Message),
    TimedOut,
}

struct Queued {
    priority: Priority,
    seq: u64,
    msg: Message,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // BinaryHeap pops the greatest; the most urgent, oldest entry must compare greatest
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Mailbox {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
}

pub struct Channel {
    name: String,
    mailbox: Mutex<Mailbox>,
    notify: Notify,
    closed: AtomicBool,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mailbox: Mutex::new(Mailbox::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Mailbox> {
        self.mailbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a message. Fails only if the channel has been closed.
    pub fn send(&self, msg: Message) -> SopResult<()> {
        if self.is_closed() {
            return Err(SopError::ChannelClosed(self.name.clone()));
        }
        {
            let mut mailbox = self.lock();
            let seq = mailbox.next_seq;
            mailbox.next_seq += 1;
            mailbox.heap.push(Queued {
                priority: msg.priority,
                seq,
                msg,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<Message> {
        self.lock().heap.pop().map(|q| q.msg)
    }

    /// Wait up to `timeout` for the next message
    pub async fn receive(&self, timeout: Duration) -> Received {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(msg) = self.pop() {
                return Received::Message(msg);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return match self.pop() {
                    Some(msg) => Received::Message(msg),
                    None => Received::TimedOut,
                };
            }
        }
    }

    /// Discard everything queued without blocking; returns the count dropped
    pub fn drain(&self) -> usize {
        let mut mailbox = self.lock();
        let count = mailbox.heap.len();
        mailbox.heap.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further sends. Used on batch reply channels once the batch is over.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
