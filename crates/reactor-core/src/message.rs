//! Shared broadcast payload with cross-thread completion counters.
//!
//! A [`Message`] is produced once by the calling thread and handed to every
//! reactor that owns at least one of its receivers. Bytes are immutable
//! after construction; `success`/`failure` are the only fields touched by
//! more than one reactor, so they're plain atomics. Completion is judged by
//! `success + failure == receivers.len()`; whichever thread observes that
//! equality after its own increment is the one that (conceptually) frees
//! the message — in Rust this is just "the last `Arc` drops", so there is
//! no explicit free step to get wrong.

use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicUsize, Ordering},
};

use crate::sid::Sid;

pub struct Message {
    payload: Vec<u8>,
    receivers: Vec<Sid>,
    success: AtomicU32,
    failure: AtomicU32,
}

impl Message {
    pub fn new(payload: Vec<u8>, receivers: Vec<Sid>) -> Arc<Self> {
        Arc::new(Self { payload, receivers, success: AtomicU32::new(0), failure: AtomicU32::new(0) })
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn receivers(&self) -> &[Sid] {
        &self.receivers
    }

    /// Records one receiver as successfully delivered. Release-ordered so a
    /// subsequent `is_complete` acquire on any thread observes this.
    #[inline]
    pub fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Release);
    }

    /// Records one receiver as failed (unknown sid, queue-limit, closed…).
    #[inline]
    pub fn record_failure(&self) {
        self.failure.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub fn success_count(&self) -> u32 {
        self.success.load(Ordering::Acquire)
    }

    #[inline]
    pub fn failure_count(&self) -> u32 {
        self.failure.load(Ordering::Acquire)
    }

    /// `success + failure == receivers.len()`. Once true, no more
    /// completions are outstanding on any reactor.
    #[inline]
    pub fn is_complete(&self) -> bool {
        let done = self.success.load(Ordering::Acquire) + self.failure.load(Ordering::Acquire);
        done as usize == self.receivers.len()
    }
}

/// Completion counters for `broadcast_all`, which has no fixed receiver
/// list up front (every reactor fans out to whichever sessions are active
/// on it when the task is processed). `pending_threads` starts at the
/// thread count and each reactor decrements it once after recording an
/// outcome for every local session it targeted, so `success + failure`
/// only needs to be read once `is_complete()` is true to equal the total
/// number of sessions actually reached.
pub struct BroadcastAllMessage {
    payload: Vec<u8>,
    success: AtomicU32,
    failure: AtomicU32,
    pending_threads: AtomicUsize,
}

impl BroadcastAllMessage {
    pub fn new(payload: Vec<u8>, thread_count: usize) -> Arc<Self> {
        Arc::new(Self {
            payload,
            success: AtomicU32::new(0),
            failure: AtomicU32::new(0),
            pending_threads: AtomicUsize::new(thread_count),
        })
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub fn record_failure(&self) {
        self.failure.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub fn success_count(&self) -> u32 {
        self.success.load(Ordering::Acquire)
    }

    #[inline]
    pub fn failure_count(&self) -> u32 {
        self.failure.load(Ordering::Acquire)
    }

    /// Called once by a reactor thread after it has recorded an outcome for
    /// every session it targeted. Release-ordered so a subsequent
    /// `is_complete` acquire observes all of this thread's recorded
    /// outcomes, not just the decrement.
    #[inline]
    pub fn thread_done(&self) {
        self.pending_threads.fetch_sub(1, Ordering::Release);
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.pending_threads.load(Ordering::Acquire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_invariant_holds_after_mixed_outcomes() {
        let m = Message::new(b"x".to_vec(), vec![Sid::new(0, 1), Sid::new(1, 2), Sid::new(0, 3)]);
        m.record_success();
        m.record_failure();
        assert!(!m.is_complete());
        m.record_success();
        assert!(m.is_complete());
        assert_eq!(m.success_count(), 2);
        assert_eq!(m.failure_count(), 1);
    }

    #[test]
    fn empty_receiver_list_is_trivially_complete() {
        let m = Message::new(Vec::new(), Vec::new());
        assert!(m.is_complete());
    }

    #[test]
    fn concurrent_increments_from_multiple_threads_converge() {
        use std::thread;

        let receivers: Vec<Sid> = (0..1000u32).map(|i| Sid::new((i % 4) as usize, i)).collect();
        let m = Message::new(b"payload".to_vec(), receivers);

        let mut handles = Vec::new();
        for t in 0..4 {
            let m = Arc::clone(&m);
            handles.push(thread::spawn(move || {
                for i in 0..250u32 {
                    if (t + i) % 7 == 0 {
                        m.record_failure();
                    } else {
                        m.record_success();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.success_count() + m.failure_count(), 1000);
        assert!(m.is_complete());
    }

    #[test]
    fn broadcast_all_completes_only_once_every_thread_checks_in() {
        let m = BroadcastAllMessage::new(b"x".to_vec(), 4);
        for _ in 0..3 {
            m.record_success();
            m.thread_done();
            assert!(!m.is_complete());
        }
        m.record_success();
        m.record_failure();
        m.thread_done();
        assert!(m.is_complete());
        assert_eq!(m.success_count() + m.failure_count(), 4);
    }
}
