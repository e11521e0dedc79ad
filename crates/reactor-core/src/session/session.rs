//! A single TCP or reliable-datagram session: buffers, send backlog, timers
//! and the state machine in [`super::state`]. Generalizes the teacher's
//! `TcpStream` (`flux-network/src/tcp/stream.rs`) by moving the fixed
//! length-prefixed-frame assumption out into [`crate::service::Service`]
//! and by supporting a non-owned-socket transport (UDP-backed sessions
//! share one socket per listener, looked up by peer address).

use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
#[cfg(target_os = "linux")]
use std::os::fd::AsRawFd;

use mio::net::TcpStream;

use crate::associator::Reattach;
use crate::buffer::Buffer;
use crate::error::ErrorCode;
use crate::settings::Settings;
use crate::sid::Sid;
use crate::timer::TimerId;

use super::state::{SessionState, Status};

/// Platform `iov_max`-ish cap on how many queued messages one `writev` call
/// walks in a single gathered write; real `IOV_MAX` is usually 1024 but
/// there is no benefit batching more than a modest handful of small
/// messages before giving the poller a chance to report backpressure.
const IOV_BATCH: usize = 64;

pub enum Transport {
    Stream(TcpStream),
    /// Datagram sessions don't own a socket; sends/receives go through the
    /// shared listener socket in `channel::udp`, keyed by `peer`.
    Datagram { peer: SocketAddr },
}

pub struct Session {
    pub sid: Sid,
    pub transport: Transport,
    pub peer_addr: SocketAddr,
    pub state: SessionState,
    pub status: Status,
    pub settings: Settings,

    pub inbound: Buffer,
    pub send_backlog: VecDeque<Vec<u8>>,
    /// Bytes of `send_backlog`'s head message already written to the
    /// socket, so a partial `writev` can resume mid-message next time.
    pub send_offset: usize,

    pub read_timer: Option<TimerId>,
    pub keepalive_timer: Option<TimerId>,
    pub reconnect_timer: Option<TimerId>,
    /// Armed while `status.SHUTDOWNING`/`EXITING`: forces the close even if
    /// the backlog never fully drains.
    pub drain_timer: Option<TimerId>,
    /// Backs a caller-scheduled `NetRuntime::perform`.
    pub perform_timer: Option<TimerId>,
    pub perform_interval_ms: Option<u64>,
    /// Drives a reliable-datagram session's codec tick; unused by stream
    /// sessions.
    pub driver_timer: Option<TimerId>,

    /// Set while an outbound `connect`/reconnect dial is in flight, i.e.
    /// the socket is registered and writable-armed but `SO_ERROR` hasn't
    /// been checked yet. Cleared (one way or the other) on the first
    /// writable-ready event.
    pub connecting: bool,

    /// Set for dialed outbound sessions so a disconnect can re-dial the
    /// same peer.
    pub is_outbound: bool,
    /// Set for associated sessions that were handed a re-attach function;
    /// makes the session reconnectable the same way an outbound dial is.
    pub reattach: Option<Reattach>,
}

impl Session {
    pub fn new_stream(sid: Sid, stream: TcpStream, peer_addr: SocketAddr, settings: Settings, is_outbound: bool) -> Self {
        let mut inbound = Buffer::new();
        inbound.set_max_len(Some(settings.max_inbound_buffer));
        Self {
            sid,
            transport: Transport::Stream(stream),
            peer_addr,
            state: SessionState::Active,
            status: Status::default(),
            settings,
            inbound,
            send_backlog: VecDeque::new(),
            send_offset: 0,
            read_timer: None,
            keepalive_timer: None,
            reconnect_timer: None,
            drain_timer: None,
            perform_timer: None,
            perform_interval_ms: None,
            driver_timer: None,
            connecting: false,
            is_outbound,
            reattach: None,
        }
    }

    pub fn new_datagram(sid: Sid, peer_addr: SocketAddr, settings: Settings) -> Self {
        let mut inbound = Buffer::new();
        inbound.set_max_len(Some(settings.max_inbound_buffer));
        Self {
            sid,
            transport: Transport::Datagram { peer: peer_addr },
            peer_addr,
            state: SessionState::Active,
            status: Status::default(),
            settings,
            inbound,
            send_backlog: VecDeque::new(),
            send_offset: 0,
            read_timer: None,
            keepalive_timer: None,
            reconnect_timer: None,
            drain_timer: None,
            perform_timer: None,
            perform_interval_ms: None,
            driver_timer: None,
            connecting: false,
            is_outbound: false,
            reattach: None,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Whether a dead fd on this session should be re-dialed instead of
    /// closed for good.
    #[inline]
    pub fn is_reconnectable(&self) -> bool {
        self.is_outbound || self.reattach.is_some()
    }

    /// All outstanding timers this session might have armed, for bulk
    /// cancellation on close.
    pub fn all_timers(&self) -> impl Iterator<Item = TimerId> + '_ {
        [
            self.read_timer,
            self.keepalive_timer,
            self.reconnect_timer,
            self.drain_timer,
            self.perform_timer,
            self.driver_timer,
        ]
        .into_iter()
        .flatten()
    }

    /// Issues one gathered `writev` over as much of the send backlog as
    /// `IOV_BATCH`/the socket's buffer allows, skipping `send_offset` bytes
    /// into the head message. Returns `Ok(true)` if the whole backlog
    /// drained, `Ok(false)` if some remains queued (caller should arm
    /// `WRITABLE` interest). Datagram sessions never buffer past one
    /// payload; callers push straight through `channel::udp` instead of
    /// through this path.
    pub fn flush_backlog(&mut self) -> Result<bool, ErrorCode> {
        let Transport::Stream(stream) = &mut self.transport else {
            return Ok(true);
        };
        if self.send_backlog.is_empty() {
            return Ok(true);
        }

        let slices: Vec<IoSlice<'_>> = self
            .send_backlog
            .iter()
            .enumerate()
            .take(IOV_BATCH)
            .map(|(i, msg)| if i == 0 { IoSlice::new(&msg[self.send_offset..]) } else { IoSlice::new(msg) })
            .collect();

        #[cfg(target_os = "linux")]
        let fd = stream.as_raw_fd();
        #[cfg(target_os = "linux")]
        set_cork(fd, true);
        let result = stream.write_vectored(&slices);
        #[cfg(target_os = "linux")]
        set_cork(fd, false);
        match result {
            Ok(mut written) => {
                while written > 0 {
                    let Some(front) = self.send_backlog.front() else { break };
                    let available = front.len() - self.send_offset;
                    if written >= available {
                        written -= available;
                        self.send_backlog.pop_front();
                        self.send_offset = 0;
                    } else {
                        self.send_offset += written;
                        written = 0;
                    }
                }
                Ok(self.send_backlog.is_empty())
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(_) => Err(ErrorCode::WriteFailure),
        }
    }

    /// Enqueues a payload for send, respecting `send_queue_limit`.
    pub fn enqueue(&mut self, payload: Vec<u8>) -> Result<(), ErrorCode> {
        if self.send_backlog.len() >= self.settings.send_queue_limit {
            return Err(ErrorCode::SendQueueLimit);
        }
        self.send_backlog.push_back(payload);
        Ok(())
    }

    /// Drops the remaining send backlog, e.g. on a write failure or a
    /// send-queue overrun; these bytes are abandoned rather than retried.
    pub fn drop_backlog(&mut self) {
        self.send_backlog.clear();
        self.send_offset = 0;
    }

    /// Reads available bytes from a stream session straight into the
    /// inbound buffer's spare tail.
    pub fn read_into_buffer(&mut self) -> Result<ReadOutcome, ErrorCode> {
        let Transport::Stream(stream) = &mut self.transport else {
            return Ok(ReadOutcome::WouldBlock);
        };
        if self.inbound.would_overflow(64 * 1024) {
            return Err(ErrorCode::InBufferFull);
        }
        let tail = self.inbound.spare_tail(64 * 1024);
        match stream.read(tail) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => {
                self.inbound.commit(n);
                Ok(ReadOutcome::Read(n))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(_) => Err(ErrorCode::ReadFailure),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Read(usize),
    Eof,
    WouldBlock,
}

/// Sets `TCP_CORK` on or off, coalescing every write issued while it's on
/// into as few IP packets as possible; a no-op on platforms without it.
#[cfg(target_os = "linux")]
fn set_cork(fd: std::os::fd::RawFd, on: bool) {
    let value: libc::c_int = on.into();
    // SAFETY: `fd` is a live, non-blocking stream socket owned by `Session`.
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            (&raw const value).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
