//! Adoption of an externally-created, already-connected file descriptor as
//! a session, e.g. a fd handed off from another process's accept loop or
//! from a non-reactor listener. Not present in the teacher, which only
//! ever produced its own sockets via `connect`/`listen_at`; added because
//! the fd-handoff pattern is common enough in this domain (see
//! `Task::Associate`) to need first-class support rather than a caller
//! working around the missing API with a loopback proxy.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::settings::Settings;

/// Produces a fresh, already-connected fd to replace one that died, e.g. by
/// re-running whatever out-of-band handshake produced the original fd (a
/// third-party client library's own reconnect routine). Returning `None`
/// means the attempt failed and the reactor should back off and retry.
pub type Reattach = Arc<dyn Fn() -> Option<RawFd> + Send + Sync>;

pub struct AssociateRequest {
    pub fd: RawFd,
    pub peer: SocketAddr,
    pub settings: Settings,
    /// When present, a read/write error on this session triggers the same
    /// reconnect machinery a dialed `connect` session gets, calling this
    /// instead of re-dialing a `SocketAddr`.
    pub reattach: Option<Reattach>,
}

impl AssociateRequest {
    pub fn new(fd: RawFd, peer: SocketAddr, settings: Settings) -> Self {
        Self { fd, peer, settings, reattach: None }
    }

    #[must_use]
    pub fn with_reattach(mut self, reattach: Reattach) -> Self {
        self.reattach = Some(reattach);
        self
    }
}
