//! The callback surface a caller implements to receive session events.
//!
//! Kept as a single small trait — rather than a bag of boxed closures per
//! session, as the teacher's `on_connect_msg`/`telemetry` fields did — so an
//! implementation with no heap state can be a unit struct and an
//! implementation with shared state just wraps an `Arc` internally. Every
//! method has a default no-op body except `on_process`, which is the only
//! one a transport cannot meaningfully proceed without.

use crate::error::ErrorCode;
use crate::sid::Sid;

/// Outcome of inspecting newly-arrived bytes for one session.
pub enum Consumed {
    /// Not enough bytes yet for a full message; leave them buffered.
    NeedMore,
    /// `n` bytes formed zero or more complete messages and may be
    /// discarded from the inbound buffer.
    Used(usize),
}

/// Outcome of the optional pre-send transform.
pub enum Transform {
    /// No transform installed, or nothing to change: send the payload as-is.
    Keep,
    /// Replace the outbound bytes with these before enqueuing.
    Rewrite(Vec<u8>),
    /// Reject this message outright; it is logged and never reaches the
    /// wire.
    Drop,
}

pub trait Service: Send + Sync + 'static {
    /// A session has moved to `Active` and may now send/receive. Fired
    /// again after a successful reconnect, with the same `Sid`.
    fn on_start(&self, _sid: Sid) {}

    /// New bytes are available in the session's inbound buffer. Implementors
    /// inspect `data` and return how many bytes were consumed; anything left
    /// over is preserved for the next call.
    fn on_process(&self, sid: Sid, data: &[u8]) -> Consumed;

    /// Optional pre-send transform, e.g. to add a framing header.
    /// `Transform::Drop` rejects the message outright instead of sending it.
    fn on_transform(&self, _sid: Sid, _payload: &[u8]) -> Transform {
        Transform::Keep
    }

    /// The session's read-idle timer fired. Returning `true` begins draining
    /// the session closed; `false` re-arms the timer for another window.
    fn on_timeout(&self, _sid: Sid) -> bool {
        false
    }

    /// The session's keepalive timer fired; implementors typically enqueue a
    /// ping frame from here. Returning `true` re-arms the timer for another
    /// interval; `false` stops keepalive probing for this session.
    fn on_keepalive(&self, _sid: Sid) -> bool {
        true
    }

    /// A recoverable or terminal error occurred on the session.
    fn on_error(&self, _sid: Sid, _error: ErrorCode) {}

    /// A caller-scheduled (`NetRuntime::perform`) task fired for this
    /// session. For a periodic task (non-zero interval) returning `true`
    /// reschedules it for another interval; `false` stops it, mirroring
    /// the source's "runs until it returns negative" contract. The return
    /// value is ignored for a one-shot task (`interval == 0`), which never
    /// reschedules regardless.
    fn on_perform(&self, _sid: Sid) -> bool {
        false
    }

    /// The session has fully closed and its `Sid` is retired. `way` is `0`
    /// if the session was closed locally via `NetRuntime::shutdown`, `1`
    /// otherwise (peer close, write/read failure, send-queue overrun…).
    fn on_shutdown(&self, _sid: Sid, _way: u8) {}
}
