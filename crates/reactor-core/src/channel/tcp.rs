//! Stream (TCP) read/write/accept paths (C10).
//!
//! Free functions rather than methods on `Session` so the event-dispatch
//! policy (when to call `Service::on_process`, when to arm `WRITABLE`
//! interest, when a read failure becomes `on_error` vs `on_shutdown`) lives
//! in one place a reviewer can read top to bottom, the same shape as the
//! teacher's `TcpStream::poll_with`/`handle_event` pair.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;

use mio::Interest;
use mio::net::{TcpListener, TcpStream};

use tracing::warn;

use crate::acceptor::Acceptor;
use crate::error::ErrorCode;
use crate::service::{Consumed, Service, Transform};
use crate::session::{ReadOutcome, Session, SessionState, Status};
use crate::settings::Settings;

pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nodelay(true).ok();
    Ok(listener)
}

pub fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Applies `SO_SNDBUF`/`SO_RCVBUF` from `settings` if set. Best-effort: a
/// failed `setsockopt` is logged and otherwise ignored, matching the
/// teacher's `set_socket_buf_size` (`flux-network/src/tcp/stream.rs`).
pub fn apply_buf_sizes(stream: &TcpStream, settings: &Settings) {
    let fd = stream.as_raw_fd();
    if let Some(size) = settings.send_buf_size {
        set_buf_size(fd, libc::SO_SNDBUF, size, "SO_SNDBUF");
    }
    if let Some(size) = settings.recv_buf_size {
        set_buf_size(fd, libc::SO_RCVBUF, size, "SO_RCVBUF");
    }
}

fn set_buf_size(fd: std::os::fd::RawFd, opt: libc::c_int, size: usize, name: &str) {
    let value = size as libc::c_int;
    // SAFETY: `fd` is a live stream socket owned by the caller's `Session`.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            (&raw const value).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        warn!(%name, "setsockopt failed, leaving OS default buffer size");
    }
}

/// Accepts every currently-pending connection on `acceptor`'s listener,
/// calling `on_accept` for each. Loops until `WouldBlock`, matching
/// edge-triggered accept semantics.
///
/// On `EMFILE` the process-wide descriptor table is full: this temporarily
/// frees the acceptor's reserved idle fd, accepts (and immediately drops)
/// the connection that triggered the error so the peer at least gets a
/// clean disconnect instead of hanging on a never-accepted backlog entry,
/// then reopens the idle fd and keeps looping.
pub fn accept_all(acceptor: &mut Acceptor, mut on_accept: impl FnMut(TcpStream, SocketAddr)) -> io::Result<()> {
    loop {
        match acceptor.listener.accept() {
            Ok((stream, peer)) => on_accept(stream, peer),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.raw_os_error() == Some(libc::EMFILE) => {
                warn!("accept hit EMFILE, recovering via reserved idle fd");
                acceptor.release_idle_fd();
                if let Ok((stream, _peer)) = acceptor.listener.accept() {
                    drop(stream);
                }
                acceptor.reopen_idle_fd();
            }
            Err(e) => return Err(e),
        }
    }
}

/// Handles a readable-ready event: reads as much as is available, then
/// repeatedly offers the buffered bytes to `Service::on_process` until it
/// reports `NeedMore` or the buffer empties.
///
/// Returns `Ok(false)` on clean EOF (caller should begin close/reconnect).
pub fn on_readable(session: &mut Session, service: &dyn Service) -> Result<bool, ErrorCode> {
    loop {
        match session.read_into_buffer()? {
            ReadOutcome::Eof => return Ok(false),
            ReadOutcome::WouldBlock => break,
            ReadOutcome::Read(_) => continue,
        }
    }
    drain_process(session, service)?;
    Ok(true)
}

fn drain_process(session: &mut Session, service: &dyn Service) -> Result<(), ErrorCode> {
    loop {
        let data = session.inbound.as_slice();
        if data.is_empty() {
            return Ok(());
        }
        match service.on_process(session.sid, data) {
            Consumed::NeedMore => return Ok(()),
            Consumed::Used(0) => return Ok(()),
            Consumed::Used(n) => session.inbound.consume(n.min(data.len())),
        }
    }
}

/// Sends `settings.on_connect_msg` (if any) through the normal send path.
/// Called once, right after a session's first `on_start`, ahead of anything
/// the caller enqueues itself.
pub fn send_on_connect(session: &mut Session, service: &dyn Service) -> Result<(), ErrorCode> {
    if let Some(msg) = session.settings.on_connect_msg.clone() {
        send(session, service, msg)
    } else {
        Ok(())
    }
}

/// Applies `Service::on_transform` (if any) then enqueues the result,
/// flushing the backlog immediately so small sends don't wait for the next
/// writable-ready event.
pub fn send(session: &mut Session, service: &dyn Service, payload: Vec<u8>) -> Result<(), ErrorCode> {
    let payload = match service.on_transform(session.sid, &payload) {
        Transform::Keep => payload,
        Transform::Rewrite(bytes) => bytes,
        Transform::Drop => {
            warn!(sid = %session.sid, "outbound message dropped by transform");
            return Ok(());
        }
    };
    session.enqueue(payload)?;
    flush_and_arm(session)
}

/// Drains as much of the backlog as the socket accepts, arming/disarming
/// `WRITABLE` interest in the caller's registry to match whether anything
/// is left queued.
pub fn flush_and_arm(session: &mut Session) -> Result<(), ErrorCode> {
    let drained = session.flush_backlog()?;
    if drained {
        session.status.remove(Status::WRITING);
    } else {
        session.status.insert(Status::WRITING);
    }
    Ok(())
}

pub fn interest_for(status: Status) -> Interest {
    if status.contains(Status::WRITING) {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

/// Starts a user-requested close: stop accepting new reads, keep writing
/// out whatever is already queued. Marks `EXITING` too when the backlog is
/// non-empty, so the caller knows to wait on a drain timer rather than
/// close immediately.
pub fn begin_close(session: &mut Session) {
    session.state = SessionState::Draining;
    session.status.remove(Status::READING);
    session.status.insert(Status::SHUTDOWNING);
    if !is_drained(session) {
        session.status.insert(Status::EXITING);
    }
}

pub fn is_drained(session: &Session) -> bool {
    session.send_backlog.is_empty()
}

pub fn mark_closed(session: &mut Session) {
    session.state = SessionState::Closed;
}
