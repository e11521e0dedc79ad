//! UDP ingest and the pre-session accept queue for the reliable-datagram
//! transport.
//!
//! One `mio::net::UdpSocket` is shared by every session dialed through a
//! given local endpoint (there is no per-peer fd as there is for TCP), so
//! `UdpChannel` owns the socket and sessions only ever hold their peer
//! `SocketAddr`. A peer's first datagram creates an accept-queue entry
//! rather than a session directly, mirroring the teacher's listener/
//! connection split one level down: the reliable-datagram handshake (via
//! `crate::driver::ReliableCodec`) must complete before a `Sid` is minted.

use std::collections::VecDeque;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use mio::net::UdpSocket;

use tracing::warn;

/// Max pending (peer, first-datagram) entries held before a session has
/// been minted for them. Resolves the accept-queue sizing question left
/// open by keeping a fixed, generous default rather than letting a
/// misbehaving peer exhaust memory with connection attempts.
pub const ACCEPT_QUEUE_CAP: usize = 64;

pub struct PendingPeer {
    pub peer: SocketAddr,
    pub first_datagram: Vec<u8>,
}

pub struct UdpChannel {
    socket: UdpSocket,
    /// Known, already-sessionized peers are not re-queued.
    known_peers: HashMap<SocketAddr, ()>,
    accept_queue: VecDeque<PendingPeer>,
}

impl UdpChannel {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self { socket: UdpSocket::bind(addr)?, known_peers: HashMap::new(), accept_queue: VecDeque::new() })
    }

    pub fn socket_mut(&mut self) -> &mut UdpSocket {
        &mut self.socket
    }

    pub fn send_to(&self, payload: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(payload, peer)
    }

    pub fn mark_known(&mut self, peer: SocketAddr) {
        self.known_peers.insert(peer, ());
        self.accept_queue.retain(|p| p.peer != peer);
    }

    pub fn forget(&mut self, peer: SocketAddr) {
        self.known_peers.remove(&peer);
    }

    /// Drains every pending datagram, routing bytes from already-known
    /// peers to `on_known` and first-contact peers into the accept queue
    /// (subject to `ACCEPT_QUEUE_CAP`, dropping the oldest entry with a
    /// warning once full — a slow/absent accept-side consumer must not let
    /// an unbounded number of strangers pin memory).
    pub fn ingest(&mut self, mut on_known: impl FnMut(SocketAddr, &[u8])) -> io::Result<()> {
        let mut buf = [0u8; 65536];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, peer)) => {
                    if self.known_peers.contains_key(&peer) {
                        on_known(peer, &buf[..n]);
                    } else if !self.accept_queue.iter().any(|p| p.peer == peer) {
                        if self.accept_queue.len() >= ACCEPT_QUEUE_CAP {
                            let dropped = self.accept_queue.pop_front();
                            if let Some(d) = dropped {
                                warn!(peer = %d.peer, "udp accept queue full, dropping oldest pending peer");
                            }
                        }
                        self.accept_queue.push_back(PendingPeer { peer, first_datagram: buf[..n].to_vec() });
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn pop_pending(&mut self) -> Option<PendingPeer> {
        self.accept_queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn accept_queue_drops_oldest_once_full() {
        // Exercises the cap/drop bookkeeping directly rather than through a
        // real socket.
        let mut queue: VecDeque<PendingPeer> = VecDeque::new();
        for i in 0..ACCEPT_QUEUE_CAP + 1 {
            if queue.len() >= ACCEPT_QUEUE_CAP {
                queue.pop_front();
            }
            queue.push_back(PendingPeer {
                peer: SocketAddr::from((Ipv4Addr::LOCALHOST, 10_000 + i as u16)),
                first_datagram: vec![],
            });
        }
        assert_eq!(queue.len(), ACCEPT_QUEUE_CAP);
        assert_eq!(queue.front().unwrap().peer.port(), 10_001);
    }
}
