//! Cross-thread command queue for a single reactor.
//!
//! A bounded `crossbeam_channel` paired with a `mio::Waker` token registered
//! in that reactor's `Poll`: pushing a command always sends on the channel
//! first and only wakes the poller if the send actually enqueued something,
//! so a reactor blocked in `poll` wakes promptly but a reactor already
//! spinning through other events doesn't pay for a redundant wake syscall.

use std::io;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use mio::Waker;

use crate::command::Task;
use crate::error::ErrorCode;

pub struct CommandSender {
    tx: Sender<Task>,
    waker: Arc<Waker>,
}

impl CommandSender {
    /// Enqueues `task`. Fails with `SendQueueLimit` if the bounded channel
    /// is full — the caller is expected to back off and retry, not block.
    pub fn push(&self, task: Task) -> Result<(), ErrorCode> {
        match self.tx.try_send(task) {
            Ok(()) => {
                let _ = self.waker.wake();
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(ErrorCode::SendQueueLimit),
            Err(TrySendError::Disconnected(_)) => Err(ErrorCode::SocketInvalid),
        }
    }
}

impl Clone for CommandSender {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), waker: Arc::clone(&self.waker) }
    }
}

pub struct CommandQueue {
    rx: Receiver<Task>,
}

impl CommandQueue {
    /// Builds a bounded command queue of `capacity` slots, registering a
    /// waker for `token` against `poll` so the owning reactor's `poll.poll`
    /// call returns as soon as a command is pushed from another thread.
    pub fn new(poll: &mio::Poll, token: mio::Token, capacity: usize) -> io::Result<(CommandSender, Self)> {
        let waker = Arc::new(Waker::new(poll.registry(), token)?);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Ok((CommandSender { tx, waker }, Self { rx }))
    }

    /// Drains every currently-queued command without blocking.
    pub fn drain(&self) -> impl Iterator<Item = Task> + '_ {
        self.rx.try_iter()
    }
}
