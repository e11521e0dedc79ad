//! The closed set of cross-thread requests a reactor accepts on its command
//! queue. Every public `NetRuntime` method that must run on a specific
//! reactor thread (because it touches that thread's `mio::Poll` or session
//! table) boils down to pushing one of these.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::associator::Reattach;
use crate::message::{BroadcastAllMessage, Message};
use crate::reactor::Reactor;
use crate::settings::Settings;
use crate::sid::Sid;

pub enum Task {
    Listen { addr: SocketAddr, settings: Settings },
    /// Binds a shared UDP socket that accepts reliable-datagram sessions;
    /// first contact from an unrecognized peer lands in the accept queue
    /// rather than becoming a session immediately (see `channel::udp`).
    ListenDatagram { addr: SocketAddr, settings: Settings },
    Connect { addr: SocketAddr, settings: Settings },
    /// Adopts an externally-created, already-connected fd (e.g. handed off
    /// from another acceptor) as a session on this thread. `reattach`, if
    /// present, is what makes the session reconnectable on disconnect (see
    /// `Reactor::try_reconnect`) instead of closing for good.
    Associate { fd: RawFd, peer: SocketAddr, settings: Settings, reattach: Option<Reattach> },
    Send { sid: Sid, payload: Vec<u8> },
    Broadcast { message: Arc<Message> },
    /// Broadcast to every currently-active session on this thread,
    /// regardless of an explicit receiver list.
    BroadcastAll { message: Arc<BroadcastAllMessage> },
    Shutdown { sid: Sid },
    ShutdownMany { sids: Vec<Sid> },
    /// Backs `NetRuntime::perform`: (re)schedules the periodic or one-shot
    /// task that invokes `Service::on_perform` for `sid`. `interval_ms ==
    /// None` delivers a single one-shot callback; `Some(ms)` reschedules
    /// itself every time `on_perform` returns `true`.
    Perform { sid: Sid, interval_ms: Option<u64> },
    /// Runs an arbitrary closure directly against the owning reactor. Backs
    /// both the public `invoke` operation (fire-and-forget work posted to
    /// one or every thread) and in-crate per-session setters
    /// (`set_timeout`, `set_persist`, …) that need mutable access to a
    /// session living on a specific thread.
    Invoke(Box<dyn FnOnce(&mut Reactor) + Send>),
    /// Stops the reactor's event loop after this drain of the queue.
    Stop,
}
