//! Public API (C12): create a multi-threaded runtime, route calls to the
//! owning reactor thread, tear it down.
//!
//! Generalizes the teacher's single-threaded `TcpConnector` façade
//! (`flux-network/src/tcp/connector.rs`) to a pool of independent reactor
//! threads. There is deliberately no cross-thread session migration: once
//! `listen`/`connect`/`associate` picks a thread, every later call
//! addressing that session's `Sid` is routed back to the same thread by
//! decoding `Sid::thread_index`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use reactor_utils::ThreadPriority;

use crate::associator::AssociateRequest;
use crate::command::Task;
use crate::message::{BroadcastAllMessage, Message};
use crate::queue::CommandSender;
use crate::reactor::Reactor;
use crate::service::Service;
use crate::settings::Settings;
use crate::sid::Sid;

const DEFAULT_QUEUE_CAPACITY: usize = 4096;

pub struct RuntimeOptions {
    pub threads: usize,
    pub queue_capacity: usize,
    pub thread_priority: ThreadPriority,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            thread_priority: ThreadPriority::OSDefault,
        }
    }
}

/// A running pool of reactor threads. Dropping does not block on the
/// threads finishing; call [`NetRuntime::stop`] and join explicitly if an
/// orderly shutdown is required.
pub struct NetRuntime {
    senders: Vec<CommandSender>,
    handles: Vec<JoinHandle<()>>,
    next_route: std::sync::atomic::AtomicUsize,
}

impl NetRuntime {
    pub fn create(service: Arc<dyn Service>, options: RuntimeOptions) -> io::Result<Self> {
        assert!(options.threads >= 1, "a runtime needs at least one reactor thread");
        assert!(options.threads <= crate::sid::MAX_THREADS, "thread count exceeds what Sid can address");

        let mut senders = Vec::with_capacity(options.threads);
        let mut handles = Vec::with_capacity(options.threads);

        for index in 0..options.threads {
            let (mut reactor, sender) = Reactor::new(index, Arc::clone(&service), options.queue_capacity)?;
            senders.push(sender);
            let priority = options.thread_priority;
            handles.push(
                thread::Builder::new()
                    .name(format!("reactor-{index}"))
                    .spawn(move || {
                        reactor_utils::thread_boot(None, priority);
                        reactor.run();
                    })
                    .expect("failed to spawn reactor thread"),
            );
        }

        Ok(Self { senders, handles, next_route: std::sync::atomic::AtomicUsize::new(0) })
    }

    fn route_new(&self) -> usize {
        self.next_route.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.senders.len()
    }

    fn route_for(&self, sid: Sid) -> usize {
        sid.thread_index() % self.senders.len()
    }

    pub fn listen(&self, addr: SocketAddr, settings: Settings) -> Result<(), crate::error::ErrorCode> {
        let idx = self.route_new();
        self.senders[idx].push(Task::Listen { addr, settings })
    }

    pub fn listen_datagram(&self, addr: SocketAddr, settings: Settings) -> Result<(), crate::error::ErrorCode> {
        let idx = self.route_new();
        self.senders[idx].push(Task::ListenDatagram { addr, settings })
    }

    pub fn connect(&self, addr: SocketAddr, settings: Settings) -> Result<(), crate::error::ErrorCode> {
        let idx = self.route_new();
        self.senders[idx].push(Task::Connect { addr, settings })
    }

    pub fn associate(&self, request: AssociateRequest) -> Result<(), crate::error::ErrorCode> {
        let idx = self.route_new();
        self.senders[idx].push(Task::Associate {
            fd: request.fd,
            peer: request.peer,
            settings: request.settings,
            reattach: request.reattach,
        })
    }

    pub fn send(&self, sid: Sid, payload: Vec<u8>) -> Result<(), crate::error::ErrorCode> {
        let idx = self.route_for(sid);
        self.senders[idx].push(Task::Send { sid, payload })
    }

    /// Broadcasts to every receiver in `message`, which may span multiple
    /// reactor threads; each thread only ever touches the receivers it
    /// owns, per the completion invariant documented on [`Message`].
    pub fn broadcast(&self, message: Arc<Message>) {
        let mut by_thread: Vec<Vec<Sid>> = vec![Vec::new(); self.senders.len()];
        for &sid in message.receivers() {
            by_thread[self.route_for(sid)].push(sid);
        }
        for (idx, sids) in by_thread.into_iter().enumerate() {
            if !sids.is_empty() {
                let _ = self.senders[idx].push(Task::Broadcast { message: Arc::clone(&message) });
            }
        }
    }

    /// Broadcasts to every active session on every reactor thread. Returns
    /// the completion handle: once `is_complete()` is true,
    /// `success_count() + failure_count()` equals the number of sessions
    /// actually reached.
    pub fn broadcast_all(&self, payload: Vec<u8>) -> Arc<BroadcastAllMessage> {
        let message = BroadcastAllMessage::new(payload, self.senders.len());
        for sender in &self.senders {
            if sender.push(Task::BroadcastAll { message: Arc::clone(&message) }).is_err() {
                // This thread will never drain the task and report in itself,
                // so count it done now rather than stalling completion forever.
                message.thread_done();
            }
        }
        message
    }

    pub fn shutdown(&self, sid: Sid) -> Result<(), crate::error::ErrorCode> {
        let idx = self.route_for(sid);
        self.senders[idx].push(Task::Shutdown { sid })
    }

    pub fn shutdown_many(&self, sids: Vec<Sid>) {
        let mut by_thread: Vec<Vec<Sid>> = vec![Vec::new(); self.senders.len()];
        for sid in sids {
            by_thread[self.route_for(sid)].push(sid);
        }
        for (idx, sids) in by_thread.into_iter().enumerate() {
            if !sids.is_empty() {
                let _ = self.senders[idx].push(Task::ShutdownMany { sids });
            }
        }
    }

    /// Posts `task` to a single round-robin-chosen reactor thread,
    /// fire-and-forget.
    pub fn invoke(&self, task: impl FnOnce(&mut Reactor) + Send + 'static) -> Result<(), crate::error::ErrorCode> {
        let idx = self.route_new();
        self.senders[idx].push(Task::Invoke(Box::new(task)))
    }

    /// Posts `task` to every reactor thread, calling `clone` once per
    /// thread (beyond the first) to produce each thread's own copy —
    /// mirrors `invoke(task, clone, execute)`'s broadcast form, since a
    /// `Box<dyn FnOnce>` itself can't be cloned.
    pub fn invoke_all<T>(&self, seed: T, mut clone: impl FnMut(&T) -> T, execute: impl Fn(&mut Reactor, T) + Send + Sync + 'static)
    where
        T: Send + 'static,
    {
        let execute = Arc::new(execute);
        let mut seed = Some(seed);
        for (i, sender) in self.senders.iter().enumerate() {
            let value = if i + 1 == self.senders.len() { seed.take().unwrap() } else { clone(seed.as_ref().unwrap()) };
            let execute = Arc::clone(&execute);
            let _ = sender.push(Task::Invoke(Box::new(move |reactor: &mut Reactor| execute(reactor, value))));
        }
    }

    /// Backs `perform(sid, …, interval)`: `interval_ms == None` delivers a
    /// single one-shot `on_perform` callback; `Some(ms)` reschedules itself
    /// every time `on_perform` returns `true`, until it returns `false` or
    /// the session closes.
    pub fn perform(&self, sid: Sid, interval_ms: Option<u64>) -> Result<(), crate::error::ErrorCode> {
        let idx = self.route_for(sid);
        self.senders[idx].push(Task::Perform { sid, interval_ms })
    }

    fn set<F>(&self, sid: Sid, f: F) -> Result<(), crate::error::ErrorCode>
    where
        F: FnOnce(&mut Reactor, Sid) + Send + 'static,
    {
        let idx = self.route_for(sid);
        self.senders[idx].push(Task::Invoke(Box::new(move |reactor: &mut Reactor| f(reactor, sid))))
    }

    pub fn set_timeout(&self, sid: Sid, timeout: Option<std::time::Duration>) -> Result<(), crate::error::ErrorCode> {
        self.set(sid, move |reactor, sid| {
            if let Some(session) = reactor.session_mut(sid) {
                session.settings.read_timeout = timeout;
            }
            reactor.rearm_read_timeout(sid);
        })
    }

    pub fn set_keepalive(&self, sid: Sid, interval: Option<std::time::Duration>) -> Result<(), crate::error::ErrorCode> {
        self.set(sid, move |reactor, sid| {
            if let Some(session) = reactor.session_mut(sid) {
                session.settings.keepalive_interval = interval;
            }
            reactor.rearm_keepalive(sid);
        })
    }

    pub fn set_persist(&self, sid: Sid, on: bool) -> Result<(), crate::error::ErrorCode> {
        self.set(sid, move |reactor, sid| {
            if let Some(session) = reactor.session_mut(sid) {
                session.settings.persist_read = on;
            }
        })
    }

    pub fn set_sendqueue_limit(&self, sid: Sid, limit: usize) -> Result<(), crate::error::ErrorCode> {
        self.set(sid, move |reactor, sid| {
            if let Some(session) = reactor.session_mut(sid) {
                session.settings.send_queue_limit = limit;
            }
        })
    }

    pub fn set_mtu(&self, sid: Sid, mtu: u32) -> Result<(), crate::error::ErrorCode> {
        self.set(sid, move |reactor, sid| {
            if let Some(session) = reactor.session_mut(sid) {
                session.settings.datagram.mtu = mtu;
            }
            reactor.apply_mtu(sid, mtu);
        })
    }

    pub fn set_minrto(&self, sid: Sid, min_rto: u32) -> Result<(), crate::error::ErrorCode> {
        self.set(sid, move |reactor, sid| {
            if let Some(session) = reactor.session_mut(sid) {
                session.settings.datagram.min_rto = min_rto;
            }
            reactor.apply_min_rto(sid, min_rto);
        })
    }

    pub fn set_windows(&self, sid: Sid, send: u32, recv: u32) -> Result<(), crate::error::ErrorCode> {
        self.set(sid, move |reactor, sid| {
            if let Some(session) = reactor.session_mut(sid) {
                session.settings.datagram.send_window = send;
                session.settings.datagram.recv_window = recv;
            }
            reactor.apply_windows(sid, send, recv);
        })
    }

    /// Signals every reactor thread to stop its event loop and joins all of
    /// them, blocking until the whole pool has exited.
    pub fn stop(self) {
        for sender in &self.senders {
            let _ = sender.push(Task::Stop);
        }
        drop(self.senders);
        for handle in self.handles {
            let _ = handle.join();
        }
    }

    pub fn thread_count(&self) -> usize {
        self.senders.len()
    }
}
