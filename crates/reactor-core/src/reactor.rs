//! The per-thread event loop (C7).
//!
//! Each reactor owns exactly one `mio::Poll`, one `SessionManager` shard,
//! one `TimerWheel`, and the acceptors/connectors it was asked to host.
//! Sessions are never migrated between reactors after creation — the
//! encoded thread index in their `Sid` would otherwise go stale — so all
//! routing decisions (which thread a new `listen`/`connect`/`associate`
//! lands on) are made once, by [`crate::io_layer`], before the relevant
//! `Task` is pushed onto a specific reactor's queue.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use tracing::{debug, error, warn};

use crate::acceptor::Acceptor;
use crate::associator::Reattach;
use crate::channel::tcp;
use crate::channel::udp::UdpChannel;
use crate::command::Task;
use crate::connector::Connector;
use crate::driver::{LoopbackCodec, ReliableCodec};
use crate::error::ErrorCode;
use crate::message::BroadcastAllMessage;
use crate::queue::{CommandQueue, CommandSender};
use crate::service::{Consumed, Service};
use crate::session::{Session, SessionManager, SessionState, Status, Transport};
use crate::settings::Settings;
use crate::sid::Sid;
use crate::timer::{TimerId, TimerWheel};

struct DatagramListener {
    channel: UdpChannel,
    settings: Settings,
}

const WAKER_TOKEN: Token = Token(0);
const FIRST_DYNAMIC_TOKEN: usize = 1;

/// How long a `poll` call blocks when nothing else is pending; bounds how
/// late the timer wheel's millisecond ticks can run behind wall clock.
const POLL_GRANULARITY: Duration = Duration::from_millis(1);

/// Backoff between an established session's reconnect attempts.
const RECONNECT_BACKOFF_MS: u64 = 20;

/// How long a draining (`EXITING`) session is given to flush its backlog
/// before the close is forced regardless.
const DRAIN_TIMEOUT_MS: u64 = 10_000;

/// Interval between a reliable-datagram session's driver ticks — the
/// per-session timer that calls `ReliableCodec::update` and drains
/// whatever it queued to (re)transmit.
const DRIVER_TICK_MS: u64 = 20;

pub struct Reactor {
    index: usize,
    poll: Poll,
    events: Events,
    commands: CommandQueue,
    sessions: SessionManager,
    timers: TimerWheel,
    acceptors: HashMap<Token, Acceptor>,
    connectors: HashMap<Token, Connector>,
    datagrams: HashMap<Token, DatagramListener>,
    /// Every token registered for a session's socket maps back to the
    /// owning `Sid`, since the session table itself is keyed by `Sid`, not
    /// by the mio token it happens to be registered under.
    token_to_sid: HashMap<Token, Sid>,
    /// Reverse of the above for stream sessions, so a status change (e.g.
    /// the send backlog draining) can reregister interest without a linear
    /// scan.
    sid_to_token: HashMap<Sid, Token>,
    /// A datagram session's owning listener token, so an outbound send can
    /// find the shared socket it must go out through.
    sid_to_listener: HashMap<Sid, Token>,
    codecs: HashMap<Sid, Box<dyn ReliableCodec>>,
    next_token: usize,
    service: Arc<dyn Service>,
    running: bool,
    start: Instant,
}

enum TimerKind {
    Read,
    Keepalive,
    Reconnect,
    Drain,
    Perform,
    Driver,
}

impl Reactor {
    pub fn new(index: usize, service: Arc<dyn Service>, queue_capacity: usize) -> std::io::Result<(Self, CommandSender)> {
        let poll = Poll::new()?;
        let (sender, commands) = CommandQueue::new(&poll, WAKER_TOKEN, queue_capacity)?;
        Ok((
            Self {
                index,
                poll,
                events: Events::with_capacity(1024),
                commands,
                sessions: SessionManager::new(index),
                timers: TimerWheel::new(),
                acceptors: HashMap::new(),
                connectors: HashMap::new(),
                datagrams: HashMap::new(),
                token_to_sid: HashMap::new(),
                sid_to_token: HashMap::new(),
                sid_to_listener: HashMap::new(),
                codecs: HashMap::new(),
                next_token: FIRST_DYNAMIC_TOKEN,
                service,
                running: true,
                start: Instant::now(),
            },
            sender,
        ))
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Mutable access to a live session on this reactor, for the closures
    /// `NetRuntime`'s per-session setters push via `Task::Invoke`.
    pub fn session_mut(&mut self, sid: Sid) -> Option<&mut Session> {
        self.sessions.get_mut(sid)
    }

    /// Replaces the timer governing `sid`'s keepalive probing with one
    /// matching its (possibly just-changed) settings. Exposed for the
    /// `set_keepalive` setter, which otherwise has no way to make an
    /// in-flight interval change take effect before the old timer fires.
    pub fn rearm_keepalive(&mut self, sid: Sid) {
        self.arm_keepalive(sid);
    }

    /// Same as [`Reactor::rearm_keepalive`] for the read-idle timeout.
    pub fn rearm_read_timeout(&mut self, sid: Sid) {
        self.arm_read_timeout(sid);
    }

    /// Applies a new MTU to `sid`'s reliable-datagram codec, if it has one.
    /// A no-op for stream sessions.
    pub fn apply_mtu(&mut self, sid: Sid, mtu: u32) {
        if let Some(codec) = self.codecs.get_mut(&sid) {
            codec.set_mtu(mtu);
        }
    }

    /// Same as [`Reactor::apply_mtu`] for the codec's minimum RTO.
    pub fn apply_min_rto(&mut self, sid: Sid, min_rto: u32) {
        if let Some(codec) = self.codecs.get_mut(&sid) {
            codec.set_min_rto(min_rto);
        }
    }

    /// Same as [`Reactor::apply_mtu`] for the codec's send/receive windows.
    pub fn apply_windows(&mut self, sid: Sid, send: u32, recv: u32) {
        if let Some(codec) = self.codecs.get_mut(&sid) {
            codec.set_windows(send, recv);
        }
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    /// Runs until [`Reactor::stop`] is called (normally via `Task::Stop`
    /// pushed by `NetRuntime::stop`/`destroy`).
    pub fn run(&mut self) {
        while self.running {
            if let Err(e) = self.poll.poll(&mut self.events, Some(POLL_GRANULARITY)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(thread = self.index, error = %e, "poll failed");
                continue;
            }

            let ready: Vec<(Token, bool, bool)> =
                self.events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();
            for (token, readable, writable) in ready {
                if token == WAKER_TOKEN {
                    self.drain_commands();
                    continue;
                }
                self.dispatch_io(token, readable, writable);
            }

            let fired = self.timers.tick();
            for id in fired {
                self.dispatch_timer(id);
            }
        }
    }

    fn drain_commands(&mut self) {
        let tasks: Vec<Task> = self.commands.drain().collect();
        for task in tasks {
            self.handle_task(task);
        }
    }

    fn handle_task(&mut self, task: Task) {
        match task {
            Task::Listen { addr, settings } => self.do_listen(addr, settings),
            Task::ListenDatagram { addr, settings } => self.do_listen_datagram(addr, settings),
            Task::Connect { addr, settings } => self.do_connect(addr, settings),
            Task::Associate { fd, peer, settings, reattach } => self.do_associate(fd, peer, settings, reattach),
            Task::Send { sid, payload } => self.do_send(sid, payload),
            Task::Broadcast { message } => self.do_broadcast(&message),
            Task::BroadcastAll { message } => self.do_broadcast_all(&message),
            Task::Shutdown { sid } => self.do_shutdown(sid),
            Task::ShutdownMany { sids } => {
                for sid in sids {
                    self.do_shutdown(sid);
                }
            }
            Task::Perform { sid, interval_ms } => self.schedule_perform(sid, interval_ms),
            Task::Invoke(f) => f(self),
            Task::Stop => self.stop(),
        }
    }

    fn do_listen(&mut self, addr: SocketAddr, settings: Settings) {
        match tcp::bind(addr) {
            Ok(mut listener) => {
                let token = self.alloc_token();
                if let Err(e) = self.poll.registry().register(&mut listener, token, Interest::READABLE) {
                    error!(thread = self.index, %addr, error = %e, "failed to register listener");
                    return;
                }
                self.acceptors.insert(token, Acceptor::new(listener, settings));
                debug!(thread = self.index, %addr, "listening");
            }
            Err(e) => error!(thread = self.index, %addr, error = %e, "bind failed"),
        }
    }

    fn do_listen_datagram(&mut self, addr: SocketAddr, settings: Settings) {
        match UdpChannel::bind(addr) {
            Ok(mut channel) => {
                let token = self.alloc_token();
                if let Err(e) = self.poll.registry().register(channel.socket_mut(), token, Interest::READABLE) {
                    error!(thread = self.index, %addr, error = %e, "failed to register datagram listener");
                    return;
                }
                self.datagrams.insert(token, DatagramListener { channel, settings });
                debug!(thread = self.index, %addr, "listening (datagram)");
            }
            Err(e) => error!(thread = self.index, %addr, error = %e, "udp bind failed"),
        }
    }

    fn do_connect(&mut self, addr: SocketAddr, settings: Settings) {
        match tcp::connect(addr) {
            Ok(mut stream) => {
                tcp::apply_buf_sizes(&stream, &settings);
                let token = self.alloc_token();
                if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE | Interest::WRITABLE) {
                    error!(thread = self.index, %addr, error = %e, "failed to register outbound stream");
                    return;
                }
                let sid = self.sessions.reserve_sid();
                self.token_to_sid.insert(token, sid);
                self.sid_to_token.insert(sid, token);
                let mut session = Session::new_stream(sid, stream, addr, settings, true);
                session.connecting = true;
                self.sessions.insert(sid, session);
                // `on_start`/timers wait for the first writable event to
                // confirm the dial actually succeeded (see `finish_connect`).
            }
            Err(e) => {
                warn!(thread = self.index, %addr, error = %e, "connect failed, scheduling retry");
                self.schedule_reconnect(addr, settings);
            }
        }
    }

    /// First writable-ready event on a session mid-dial: resolves whether
    /// the non-blocking `connect` actually succeeded via `SO_ERROR` before
    /// treating the socket as usable. Returns `false` if the session was
    /// torn down (closed or sent to reconnect) as a result.
    fn finish_connect(&mut self, sid: Sid) -> bool {
        let Some(session) = self.sessions.get_mut(sid) else { return false };
        let Transport::Stream(stream) = &session.transport else { return false };
        let outcome = stream.take_error();
        session.connecting = false;
        match outcome {
            Ok(None) => {
                self.service.on_start(sid);
                self.arm_read_timeout(sid);
                self.arm_keepalive(sid);
                if let Some(session) = self.sessions.get_mut(sid) {
                    let _ = tcp::send_on_connect(session, self.service.as_ref());
                    if tcp::flush_and_arm(session).is_ok() {
                        self.sync_interest(sid);
                    }
                }
                true
            }
            _ => {
                self.fail_session(sid, ErrorCode::ConnectFailure);
                false
            }
        }
    }

    fn schedule_reconnect(&mut self, addr: SocketAddr, settings: Settings) {
        let token = self.alloc_token();
        let mut connector = Connector::new(addr, settings, Duration::from_secs(3));
        connector.backoff_timer = Some(self.timers.schedule(connector.reconnect_interval.as_millis() as u64));
        self.connectors.insert(token, connector);
    }

    fn do_associate(&mut self, fd: RawFd, peer: SocketAddr, settings: Settings, reattach: Option<Reattach>) {
        // SAFETY: caller guarantees `fd` is a live, connected, non-blocking-capable
        // socket fd it is handing over exclusive ownership of.
        let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
        let mut stream = TcpStream::from_std(std_stream);
        tcp::apply_buf_sizes(&stream, &settings);
        let token = self.alloc_token();
        if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
            error!(thread = self.index, %peer, error = %e, "failed to register associated fd");
            return;
        }
        let sid = self.sessions.reserve_sid();
        self.token_to_sid.insert(token, sid);
        self.sid_to_token.insert(sid, token);
        let mut session = Session::new_stream(sid, stream, peer, settings, false);
        session.reattach = reattach;
        self.sessions.insert(sid, session);
        self.service.on_start(sid);
        self.arm_read_timeout(sid);
        self.arm_keepalive(sid);
        if let Some(session) = self.sessions.get_mut(sid) {
            let _ = tcp::send_on_connect(session, self.service.as_ref());
        }
    }

    fn do_send(&mut self, sid: Sid, payload: Vec<u8>) {
        if payload.is_empty() {
            return;
        }
        let is_datagram = matches!(self.sessions.get(sid), Some(s) if matches!(s.transport, Transport::Datagram { .. }));
        if is_datagram {
            self.send_datagram(sid, &payload);
            return;
        }
        let Some(session) = self.sessions.get_mut(sid) else {
            return;
        };
        match tcp::send(session, self.service.as_ref(), payload) {
            Ok(()) => self.sync_interest(sid),
            Err(e) => self.fail_session(sid, e),
        }
    }

    fn send_datagram(&mut self, sid: Sid, payload: &[u8]) {
        let Some(&listener_token) = self.sid_to_listener.get(&sid) else {
            self.service.on_error(sid, ErrorCode::SocketInvalid);
            return;
        };
        let Some(peer) = self.sessions.get(sid).map(|s| s.peer_addr) else { return };
        let Some(codec) = self.codecs.get_mut(&sid) else { return };
        codec.send(payload);
        let datagrams = codec.transmit();
        if let Some(listener) = self.datagrams.get(&listener_token) {
            for datagram in datagrams {
                if let Err(e) = listener.channel.send_to(&datagram, peer) {
                    warn!(thread = self.index, %peer, error = %e, "udp send failed");
                    self.service.on_error(sid, ErrorCode::WriteFailure);
                }
            }
        }
    }

    fn do_broadcast(&mut self, message: &Arc<crate::message::Message>) {
        for &sid in message.receivers() {
            if sid.thread_index() != self.index {
                continue;
            }
            match self.sessions.get_mut(sid) {
                Some(session) if session.is_active() => {
                    match tcp::send(session, self.service.as_ref(), message.payload().to_vec()) {
                        Ok(()) => {
                            message.record_success();
                            self.sync_interest(sid);
                        }
                        Err(_) => message.record_failure(),
                    }
                }
                _ => message.record_failure(),
            }
        }
    }

    fn do_broadcast_all(&mut self, message: &Arc<BroadcastAllMessage>) {
        let active: Vec<Sid> = self.sessions.iter().filter(|(_, s)| s.is_active()).map(|(sid, _)| sid).collect();
        for sid in active {
            if let Some(session) = self.sessions.get_mut(sid) {
                match tcp::send(session, self.service.as_ref(), message.payload().to_vec()) {
                    Ok(()) => {
                        message.record_success();
                        self.sync_interest(sid);
                    }
                    Err(_) => message.record_failure(),
                }
            }
        }
        message.thread_done();
    }

    /// Schedules (or re-schedules) the periodic/one-shot task backing
    /// `NetRuntime::perform`.
    fn schedule_perform(&mut self, sid: Sid, interval_ms: Option<u64>) {
        let Some(session) = self.sessions.get_mut(sid) else { return };
        if let Some(t) = session.perform_timer.take() {
            self.timers.cancel(t);
        }
        session.perform_interval_ms = interval_ms;
        let delay = interval_ms.unwrap_or(0).max(1);
        session.perform_timer = Some(self.timers.schedule(delay));
    }

    fn fire_perform(&mut self, sid: Sid) {
        let Some(session) = self.sessions.get_mut(sid) else { return };
        session.perform_timer = None;
        let interval_ms = session.perform_interval_ms;
        let reschedule = self.service.on_perform(sid) && interval_ms.is_some();
        if reschedule {
            self.schedule_perform(sid, interval_ms);
        }
    }

    fn do_shutdown(&mut self, sid: Sid) {
        let Some(session) = self.sessions.get_mut(sid) else { return };
        if matches!(session.state, SessionState::Closed | SessionState::Draining) {
            return; // idempotent: already closed, or already draining toward close
        }
        if let Some(t) = session.reconnect_timer.take() {
            self.timers.cancel(t); // shutting down wins over a pending reconnect attempt
        }
        tcp::begin_close(session);
        if tcp::is_drained(session) {
            self.finish_close(sid);
        } else {
            session.drain_timer = Some(self.timers.schedule(DRAIN_TIMEOUT_MS));
            self.sync_interest(sid);
        }
    }

    /// Abandons the send backlog immediately (write/protocol failure,
    /// send-queue overrun) and closes without waiting to drain.
    fn force_close(&mut self, sid: Sid) {
        if let Some(session) = self.sessions.get_mut(sid) {
            session.drop_backlog();
        }
        self.finish_close(sid);
    }

    fn finish_close(&mut self, sid: Sid) {
        if let Some(mut session) = self.sessions.remove(sid) {
            for id in session.all_timers().collect::<Vec<_>>() {
                self.timers.cancel(id);
            }
            let way = u8::from(!session.status.contains(Status::SHUTDOWNING));
            tcp::mark_closed(&mut session);
            match session.transport {
                Transport::Stream(mut s) => {
                    let _ = self.poll.registry().deregister(&mut s);
                    self.token_to_sid.retain(|_, &mut s| s != sid);
                    self.sid_to_token.remove(&sid);
                }
                Transport::Datagram { peer } => {
                    if let Some(listener_token) = self.sid_to_listener.remove(&sid) {
                        if let Some(listener) = self.datagrams.get_mut(&listener_token) {
                            listener.channel.forget(peer);
                        }
                    }
                    self.codecs.remove(&sid);
                }
            }
            self.service.on_shutdown(sid, way);
            debug!(
                thread = self.index,
                live = self.sessions.len(),
                high_water_mark = self.sessions.high_water_mark(),
                "session closed"
            );
        }
    }

    /// Reregisters poll interest for `sid`'s socket to match its current
    /// status bits (chiefly whether `WRITING` — a non-empty send backlog —
    /// is set). A no-op for datagram sessions, which share their
    /// listener's registration.
    fn sync_interest(&mut self, sid: Sid) {
        let Some(&token) = self.sid_to_token.get(&sid) else { return };
        let Some(session) = self.sessions.get_mut(sid) else { return };
        let interest = tcp::interest_for(session.status);
        if let Transport::Stream(stream) = &mut session.transport {
            let _ = self.poll.registry().reregister(stream, token, interest);
        }
    }

    fn arm_read_timeout(&mut self, sid: Sid) {
        let Some(session) = self.sessions.get_mut(sid) else { return };
        if let Some(t) = session.read_timer.take() {
            self.timers.cancel(t);
        }
        if let Some(dur) = session.settings.read_timeout {
            session.read_timer = Some(self.timers.schedule(dur.as_millis() as u64));
            session.status.insert(Status::SCHEDULING);
        } else {
            session.status.remove(Status::SCHEDULING);
        }
    }

    fn arm_keepalive(&mut self, sid: Sid) {
        let Some(session) = self.sessions.get_mut(sid) else { return };
        if let Some(t) = session.keepalive_timer.take() {
            self.timers.cancel(t);
        }
        if let Some(dur) = session.settings.keepalive_interval {
            session.keepalive_timer = Some(self.timers.schedule(dur.as_millis() as u64));
            session.status.insert(Status::KEEPALIVING);
        } else {
            session.status.remove(Status::KEEPALIVING);
        }
    }

    /// Records the error then either starts a reconnect (for a dialed or
    /// reattach-capable session) or closes the session for good.
    fn fail_session(&mut self, sid: Sid, error: ErrorCode) {
        self.service.on_error(sid, error);
        let reconnectable = self.sessions.get(sid).is_some_and(Session::is_reconnectable);
        if reconnectable {
            self.begin_reconnect(sid);
        } else {
            self.force_close(sid);
        }
    }

    /// Tears down the dead fd but keeps the session (and its `Sid` and
    /// queued-but-unsent backlog) alive in `RECONNECTING`, with a backoff
    /// timer scheduled to retry.
    fn begin_reconnect(&mut self, sid: Sid) {
        let Some(session) = self.sessions.get_mut(sid) else { return };
        if session.state == SessionState::Reconnecting {
            return;
        }
        session.state = SessionState::Reconnecting;
        session.status = Status::empty();
        if let Transport::Stream(stream) = &mut session.transport {
            let _ = self.poll.registry().deregister(stream);
        }
        self.token_to_sid.retain(|_, &mut s| s != sid);
        self.sid_to_token.remove(&sid);
        if let Some(t) = session.read_timer.take() {
            self.timers.cancel(t);
        }
        if let Some(t) = session.keepalive_timer.take() {
            self.timers.cancel(t);
        }
        session.reconnect_timer = Some(self.timers.schedule(RECONNECT_BACKOFF_MS));
        debug!(thread = self.index, sid = %sid, "session entering reconnect backoff");
    }

    fn try_reconnect(&mut self, sid: Sid) {
        let Some(session) = self.sessions.get_mut(sid) else { return };
        session.reconnect_timer = None;
        let peer = session.peer_addr;
        let reattach = session.reattach.clone();

        // A reattach fd is already connected (synchronous handoff); a plain
        // re-dial needs the same SO_ERROR confirmation as a fresh `connect`.
        let already_connected = reattach.is_some();
        let dialed: std::io::Result<TcpStream> = match &reattach {
            Some(reattach) => match reattach() {
                Some(fd) => {
                    // SAFETY: `reattach` returns a live, already-connected fd it
                    // is handing over exclusive ownership of, same contract as
                    // the original `Task::Associate`.
                    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
                    Ok(TcpStream::from_std(std_stream))
                }
                None => Err(std::io::Error::other("reattach produced no fd")),
            },
            None => tcp::connect(peer),
        };

        match dialed {
            Ok(mut stream) => {
                if let Some(session) = self.sessions.get(sid) {
                    tcp::apply_buf_sizes(&stream, &session.settings);
                }
                let token = self.alloc_token();
                if self.poll.registry().register(&mut stream, token, Interest::READABLE | Interest::WRITABLE).is_err() {
                    self.schedule_reconnect_retry(sid);
                    return;
                }
                self.token_to_sid.insert(token, sid);
                self.sid_to_token.insert(sid, token);
                if let Some(session) = self.sessions.get_mut(sid) {
                    session.transport = Transport::Stream(stream);
                    session.state = SessionState::Active;
                    session.status = Status::default();
                    session.connecting = !already_connected;
                }
                if already_connected {
                    self.service.on_start(sid);
                    self.arm_read_timeout(sid);
                    self.arm_keepalive(sid);
                    // Flush whatever was enqueued while reconnecting; the
                    // backlog itself was never touched above.
                    if let Some(session) = self.sessions.get_mut(sid) {
                        let _ = tcp::send_on_connect(session, self.service.as_ref());
                        if tcp::flush_and_arm(session).is_ok() {
                            self.sync_interest(sid);
                        }
                    }
                }
                // Otherwise `finish_connect` picks this up on the first
                // writable-ready event once SO_ERROR can be checked.
            }
            Err(e) => {
                warn!(thread = self.index, sid = %sid, error = %e, "reconnect attempt failed, retrying");
                self.schedule_reconnect_retry(sid);
            }
        }
    }

    fn schedule_reconnect_retry(&mut self, sid: Sid) {
        if let Some(session) = self.sessions.get_mut(sid) {
            session.reconnect_timer = Some(self.timers.schedule(RECONNECT_BACKOFF_MS));
        }
    }

    fn dispatch_io(&mut self, token: Token, readable: bool, writable: bool) {
        if self.acceptors.contains_key(&token) {
            self.accept_connections(token);
            return;
        }

        if self.datagrams.contains_key(&token) {
            self.dispatch_datagram(token);
            return;
        }

        if let Some(&sid) = self.token_to_sid.get(&token) {
            self.dispatch_session_event(sid, readable, writable);
        }
    }

    fn accept_connections(&mut self, token: Token) {
        let Some(acceptor) = self.acceptors.get_mut(&token) else { return };
        let settings = acceptor.settings.clone();
        let mut accepted = Vec::new();
        let _ = tcp::accept_all(acceptor, |stream, peer| accepted.push((stream, peer)));
        for (mut stream, peer) in accepted {
            tcp::apply_buf_sizes(&stream, &settings);
            let token = self.alloc_token();
            if self.poll.registry().register(&mut stream, token, Interest::READABLE).is_ok() {
                let sid = self.sessions.reserve_sid();
                self.token_to_sid.insert(token, sid);
                self.sid_to_token.insert(sid, token);
                self.sessions.insert(sid, Session::new_stream(sid, stream, peer, settings.clone(), false));
                self.service.on_start(sid);
                self.arm_read_timeout(sid);
                self.arm_keepalive(sid);
                if let Some(session) = self.sessions.get_mut(sid) {
                    let _ = tcp::send_on_connect(session, self.service.as_ref());
                }
            }
        }
    }

    /// Ingests every pending datagram for `token`'s listener: bytes from a
    /// peer with an established session are fed straight to that session's
    /// codec; bytes from a new peer queue in the accept queue and are
    /// promoted to a session immediately (there's no handshake to await
    /// without a real ARQ driver — see `crate::driver`), which is also what
    /// lets a burst of many first-contact peers overrun
    /// `udp::ACCEPT_QUEUE_CAP` within one ingest call.
    fn dispatch_datagram(&mut self, token: Token) {
        let Some(listener) = self.datagrams.get_mut(&token) else { return };

        let mut known_payloads: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        let _ = listener.channel.ingest(|peer, data| known_payloads.push((peer, data.to_vec())));

        for (peer, data) in known_payloads {
            if let Some(&sid) = self.sid_to_listener.iter().find_map(|(sid, &t)| {
                (t == token && self.sessions.get(*sid).is_some_and(|s| s.peer_addr == peer)).then_some(sid)
            }) {
                self.feed_datagram(sid, &data);
            }
        }

        let settings = self.datagrams[&token].settings.clone();
        while let Some(pending) = self.datagrams.get_mut(&token).and_then(|l| l.channel.pop_pending()) {
            let sid = self.sessions.reserve_sid();
            self.sessions.insert(sid, Session::new_datagram(sid, pending.peer, settings.clone()));
            self.sid_to_listener.insert(sid, token);
            let mut codec: Box<dyn ReliableCodec> = Box::new(LoopbackCodec::default());
            codec.set_mtu(settings.datagram.mtu);
            codec.set_min_rto(settings.datagram.min_rto);
            codec.set_windows(settings.datagram.send_window, settings.datagram.recv_window);
            self.codecs.insert(sid, codec);
            if let Some(listener) = self.datagrams.get_mut(&token) {
                listener.channel.mark_known(pending.peer);
            }
            self.service.on_start(sid);
            self.arm_driver_timer(sid);
            self.feed_datagram(sid, &pending.first_datagram);
        }
    }

    fn arm_driver_timer(&mut self, sid: Sid) {
        let id = self.timers.schedule(DRIVER_TICK_MS);
        if let Some(session) = self.sessions.get_mut(sid) {
            session.driver_timer = Some(id);
        }
    }

    /// One state refresh of `sid`'s reliable-datagram driver: advances its
    /// RTO/ACK clock and flushes anything it now wants (re)transmitted.
    fn fire_driver(&mut self, sid: Sid) {
        if let Some(session) = self.sessions.get_mut(sid) {
            session.driver_timer = None;
        }
        if !self.sessions.contains(sid) {
            return;
        }
        let now = self.now_ms();
        let Some(&listener_token) = self.sid_to_listener.get(&sid) else { return };
        let Some(peer) = self.sessions.get(sid).map(|s| s.peer_addr) else { return };
        if let Some(codec) = self.codecs.get_mut(&sid) {
            codec.update(now);
            let datagrams = codec.transmit();
            if let Some(listener) = self.datagrams.get(&listener_token) {
                for datagram in datagrams {
                    let _ = listener.channel.send_to(&datagram, peer);
                }
            }
        }
        self.arm_driver_timer(sid);
    }

    fn feed_datagram(&mut self, sid: Sid, data: &[u8]) {
        let Some(codec) = self.codecs.get_mut(&sid) else { return };
        let messages = codec.input(data);
        for message in messages {
            // Datagram messages already arrive whole; only the consumed
            // count from a stream's partial-frame buffer is meaningful.
            let _: Consumed = self.service.on_process(sid, &message);
        }
    }

    fn dispatch_session_event(&mut self, sid: Sid, readable: bool, writable: bool) {
        if writable && self.sessions.get(sid).is_some_and(|s| s.connecting) {
            if !self.finish_connect(sid) {
                return; // session failed and was torn down/sent to reconnect
            }
        }
        if writable {
            if let Some(session) = self.sessions.get_mut(sid) {
                match tcp::flush_and_arm(session) {
                    Ok(()) => {
                        self.sync_interest(sid);
                        if let Some(session) = self.sessions.get(sid) {
                            if session.state == SessionState::Draining && tcp::is_drained(session) {
                                self.finish_close(sid);
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        self.fail_session(sid, e);
                        return;
                    }
                }
            }
        }
        if readable {
            let outcome = self.sessions.get_mut(sid).map(|s| tcp::on_readable(s, self.service.as_ref()));
            match outcome {
                Some(Ok(true)) => self.arm_read_timeout(sid),
                Some(Ok(false)) => self.handle_peer_shutdown(sid),
                Some(Err(e)) => self.fail_session(sid, e),
                None => {}
            }
        }
    }

    /// Clean EOF from the peer: reported via `on_error(PeerShutdown)`, then
    /// either reconnect (dialed/reattach-capable sessions) or close.
    fn handle_peer_shutdown(&mut self, sid: Sid) {
        self.service.on_error(sid, ErrorCode::PeerShutdown);
        let reconnectable = self.sessions.get(sid).is_some_and(Session::is_reconnectable);
        if reconnectable {
            self.begin_reconnect(sid);
        } else {
            self.force_close(sid);
        }
    }

    fn dispatch_timer(&mut self, id: TimerId) {
        let matched: Vec<(Sid, TimerKind)> = self
            .sessions
            .iter()
            .filter_map(|(sid, s)| {
                if s.read_timer == Some(id) {
                    Some((sid, TimerKind::Read))
                } else if s.keepalive_timer == Some(id) {
                    Some((sid, TimerKind::Keepalive))
                } else if s.reconnect_timer == Some(id) {
                    Some((sid, TimerKind::Reconnect))
                } else if s.drain_timer == Some(id) {
                    Some((sid, TimerKind::Drain))
                } else if s.perform_timer == Some(id) {
                    Some((sid, TimerKind::Perform))
                } else if s.driver_timer == Some(id) {
                    Some((sid, TimerKind::Driver))
                } else {
                    None
                }
            })
            .collect();

        for (sid, kind) in matched {
            match kind {
                TimerKind::Read => {
                    if let Some(session) = self.sessions.get_mut(sid) {
                        session.read_timer = None;
                    }
                    if self.service.on_timeout(sid) {
                        self.do_shutdown(sid);
                    } else {
                        self.arm_read_timeout(sid);
                    }
                }
                TimerKind::Keepalive => {
                    if let Some(session) = self.sessions.get_mut(sid) {
                        session.keepalive_timer = None;
                    }
                    if self.service.on_keepalive(sid) {
                        self.arm_keepalive(sid);
                    }
                }
                TimerKind::Reconnect => self.try_reconnect(sid),
                TimerKind::Drain => self.force_close(sid),
                TimerKind::Perform => self.fire_perform(sid),
                TimerKind::Driver => self.fire_driver(sid),
            }
        }

        let due_connectors: Vec<Token> =
            self.connectors.iter().filter(|(_, c)| c.backoff_timer == Some(id)).map(|(&t, _)| t).collect();
        for token in due_connectors {
            if let Some(connector) = self.connectors.remove(&token) {
                self.do_connect(connector.addr, connector.settings);
            }
        }
    }

    pub fn stop(&mut self) {
        self.running = false;
    }
}
