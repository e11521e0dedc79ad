//! Session lifecycle and in-flight status flags.
//!
//! `SessionState` is the coarse lifecycle (`IDLE -> ACTIVE ->
//! DRAINING/RECONNECTING -> CLOSED`); `Status` is the set of finer-grained
//! "what is this session doing right now" bits that can be true
//! simultaneously while `ACTIVE`, mirrored from the teacher's
//! single-purpose `ConnState`/`writable_armed` fields but generalized into
//! bitflags since this crate tracks more concurrent concerns per session
//! (keepalive, scheduling, shutdown-in-progress) than the teacher did.

use bitflags::bitflags;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Slot reserved (e.g. via `AssignSession`) but not yet backed by a fd.
    Idle,
    /// Readable/writable and registered with the poller.
    Active,
    /// No longer accepting new sends; draining the backlog before close.
    Draining,
    /// Outbound session whose connect failed or was dropped and is
    /// retrying on a reconnect-backoff timer.
    Reconnecting,
    /// Terminal; the slot is eligible for recycling.
    Closed,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Status: u16 {
        /// A read is currently of interest (normally always set while `Active`).
        const READING      = 1 << 0;
        /// `WRITABLE` interest is armed because the send backlog is non-empty.
        const WRITING      = 1 << 1;
        /// A keepalive timer is scheduled for this session.
        const KEEPALIVING  = 1 << 2;
        /// A read-idle timeout timer is scheduled for this session.
        const SCHEDULING   = 1 << 3;
        /// `shutdown` was requested; finish draining then close.
        const SHUTDOWNING  = 1 << 4;
        /// Close was requested while the send backlog was still non-empty:
        /// reads are unhooked but queued writes are still flushed, bounded
        /// by the drain timeout, before the session actually closes.
        const EXITING      = 1 << 5;
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::READING
    }
}
