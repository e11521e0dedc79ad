//! Reliable-datagram codec boundary.
//!
//! A real ARQ/congestion-control implementation (KCP or otherwise) is out
//! of scope here; this trait is the seam a caller plugs one into. Only a
//! loopback no-op codec ships, for exercising the UDP accept-queue and
//! session paths in tests without pulling in a fabricated dependency.

pub trait ReliableCodec: Send {
    /// Feeds raw bytes received off the wire into the codec's receive
    /// window. Returns reassembled, in-order application payloads, if any
    /// are now complete.
    fn input(&mut self, raw: &[u8]) -> Vec<Vec<u8>>;

    /// Hands an application payload to the codec for segmentation/ARQ
    /// bookkeeping ahead of `transmit`.
    fn send(&mut self, payload: &[u8]);

    /// Produces wire-ready datagrams the caller should push through the
    /// socket, draining anything the codec has queued to transmit or
    /// retransmit since the last call.
    fn transmit(&mut self) -> Vec<Vec<u8>>;

    /// Called once per timer-wheel tick so the codec can drive its RTO/ACK
    /// clock independent of whether new data arrived this tick.
    fn update(&mut self, now_ms: u64);

    fn set_mtu(&mut self, mtu: u32);
    fn set_min_rto(&mut self, min_rto: u32);
    fn set_windows(&mut self, send: u32, recv: u32);
}

/// Identity codec: every `send`ed payload is transmitted unsegmented and
/// every `input` byte slice is handed back whole. No reliability, ordering
/// or congestion control — useful only for wiring tests that need a
/// `ReliableCodec` impl without taking a dependency on a real ARQ crate.
#[derive(Default)]
pub struct LoopbackCodec {
    outbox: Vec<Vec<u8>>,
}

impl ReliableCodec for LoopbackCodec {
    fn input(&mut self, raw: &[u8]) -> Vec<Vec<u8>> {
        vec![raw.to_vec()]
    }

    fn send(&mut self, payload: &[u8]) {
        self.outbox.push(payload.to_vec());
    }

    fn transmit(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    fn update(&mut self, _now_ms: u64) {}

    fn set_mtu(&mut self, _mtu: u32) {}

    fn set_min_rto(&mut self, _min_rto: u32) {}

    fn set_windows(&mut self, _send: u32, _recv: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_codec_passes_payloads_through_unmodified() {
        let mut codec = LoopbackCodec::default();
        codec.send(b"hello");
        codec.send(b"world");
        assert_eq!(codec.transmit(), vec![b"hello".to_vec(), b"world".to_vec()]);
        assert!(codec.transmit().is_empty());
        assert_eq!(codec.input(b"echo"), vec![b"echo".to_vec()]);
    }
}
