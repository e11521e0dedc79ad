//! Listening-socket bookkeeping for one reactor thread.
//!
//! Generalizes the `ConnectionVariant::Listener` arm of the teacher's
//! `ConnectionManager`: a reactor can own several listeners (one per
//! `listen` call routed to it), each carrying its own [`Settings`] so
//! accepted sessions inherit the options the caller asked for at bind
//! time rather than a single global default.

use std::fs::File;

use mio::net::TcpListener;

use crate::settings::Settings;

pub struct Acceptor {
    pub listener: TcpListener,
    pub settings: Settings,
    /// An fd held open purely to be closed-and-reopened around an `EMFILE`:
    /// freeing it gives `accept` one spare descriptor to accept-then-close
    /// the connection the listener can't otherwise take, so the backlog
    /// doesn't wedge a remote peer forever on a full descriptor table.
    idle_fd: Option<File>,
}

impl Acceptor {
    pub fn new(listener: TcpListener, settings: Settings) -> Self {
        Self { listener, settings, idle_fd: File::open("/dev/null").ok() }
    }

    /// Frees the reserved idle fd, returning whether one was actually held
    /// (a platform without `/dev/null`, implausible but not impossible,
    /// just loses this mitigation silently).
    pub fn release_idle_fd(&mut self) -> bool {
        self.idle_fd.take().is_some()
    }

    pub fn reopen_idle_fd(&mut self) {
        if self.idle_fd.is_none() {
            self.idle_fd = File::open("/dev/null").ok();
        }
    }
}
