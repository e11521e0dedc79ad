//! Per-thread session table (C8).
//!
//! Backed by `slab` so a session's `Sid` sequence is derived directly from
//! its slab key — `index(sid) == shard.index` holds because both are the
//! same `u32`, which is what makes closing a session and immediately
//! reusing its slot safe: the next session minted in that slot gets a new
//! `Sid` whose sequence is the slab's next generation-free key, not a
//! reused one (slab itself doesn't version keys, so we fold the thread's
//! running [`SequenceGen`] into the encoded `Sid` instead of trusting the
//! raw slab key to stay unique after a vacate/reinsert cycle).

use std::collections::HashMap;

use slab::Slab;

use crate::sid::{Sid, SequenceGen};

use super::session::Session;

pub struct SessionManager {
    thread_index: usize,
    slots: Slab<Session>,
    /// Sid -> slab key, since a Sid's encoded sequence isn't the raw slab
    /// key once slots have been recycled.
    by_sid: HashMap<Sid, usize>,
    seq: SequenceGen,
    /// Largest `len()` this shard has ever reached, for diagnostics/logging
    /// only — never consulted for correctness.
    high_water_mark: usize,
}

impl SessionManager {
    pub fn new(thread_index: usize) -> Self {
        Self { thread_index, slots: Slab::new(), by_sid: HashMap::new(), seq: SequenceGen::default(), high_water_mark: 0 }
    }

    /// Reserves a fresh `Sid` for a session that will be inserted shortly
    /// after (used so callers can learn the `Sid` before the connect/accept
    /// that produces the backing socket has completed).
    pub fn reserve_sid(&mut self) -> Sid {
        Sid::new(self.thread_index, self.seq.next())
    }

    pub fn insert(&mut self, sid: Sid, session: Session) {
        let key = self.slots.insert(session);
        self.by_sid.insert(sid, key);
        self.high_water_mark = self.high_water_mark.max(self.slots.len());
    }

    pub fn get(&self, sid: Sid) -> Option<&Session> {
        self.by_sid.get(&sid).map(|&key| &self.slots[key])
    }

    pub fn get_mut(&mut self, sid: Sid) -> Option<&mut Session> {
        let key = *self.by_sid.get(&sid)?;
        Some(&mut self.slots[key])
    }

    /// Removes and returns the session, freeing its slot for reuse by a
    /// future, differently-`Sid`'d session.
    pub fn remove(&mut self, sid: Sid) -> Option<Session> {
        let key = self.by_sid.remove(&sid)?;
        Some(self.slots.remove(key))
    }

    pub fn contains(&self, sid: Sid) -> bool {
        self.by_sid.contains_key(&sid)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The largest live session count this shard has ever carried.
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub fn iter(&self) -> impl Iterator<Item = (Sid, &Session)> {
        self.slots.iter().map(|(_, session)| (session.sid, session))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Sid, &mut Session)> {
        self.slots.iter_mut().map(|(_, session)| (session.sid, session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use std::net::{SocketAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 9999))
    }

    #[test]
    fn reserve_then_insert_then_lookup() {
        let mut mgr = SessionManager::new(0);
        let sid = mgr.reserve_sid();
        assert_eq!(sid.thread_index(), 0);
        mgr.insert(sid, Session::new_datagram(sid, addr(), Settings::default()));
        assert!(mgr.contains(sid));
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn remove_frees_slot_for_new_distinct_sid() {
        let mut mgr = SessionManager::new(0);
        let sid1 = mgr.reserve_sid();
        mgr.insert(sid1, Session::new_datagram(sid1, addr(), Settings::default()));
        mgr.remove(sid1);
        assert!(mgr.is_empty());

        let sid2 = mgr.reserve_sid();
        assert_ne!(sid1, sid2);
        mgr.insert(sid2, Session::new_datagram(sid2, addr(), Settings::default()));
        assert!(mgr.contains(sid2));
        assert!(!mgr.contains(sid1));
    }
}
