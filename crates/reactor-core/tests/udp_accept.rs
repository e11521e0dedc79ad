use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    sync::{Arc, Mutex, OnceLock, Weak},
    thread,
    time::Duration,
};

use reactor_core::{Consumed, NetRuntime, RuntimeOptions, Service, Settings, Sid};
use reactor_utils::ThreadPriority;

/// Echoes every datagram payload straight back to its session, the same
/// shape as `tcp_echo`'s `EchoService` but exercising the reliable-datagram
/// accept path (§4.6/§4.7): first contact from a new peer must go through
/// the listener's accept queue before a session exists to echo through.
struct EchoService {
    runtime: OnceLock<Weak<NetRuntime>>,
    started: Mutex<Vec<Sid>>,
}

impl Service for EchoService {
    fn on_start(&self, sid: Sid) {
        self.started.lock().unwrap().push(sid);
    }

    fn on_process(&self, sid: Sid, data: &[u8]) -> Consumed {
        if let Some(runtime) = self.runtime.get().and_then(Weak::upgrade) {
            let _ = runtime.send(sid, data.to_vec());
        }
        Consumed::Used(data.len())
    }
}

#[test]
fn first_datagram_from_a_new_peer_promotes_it_through_the_accept_queue() {
    let addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 28821));
    let service = Arc::new(EchoService { runtime: OnceLock::new(), started: Mutex::new(Vec::new()) });
    let options = RuntimeOptions { threads: 1, queue_capacity: 256, thread_priority: ThreadPriority::OSDefault };
    let runtime = Arc::new(NetRuntime::create(service.clone(), options).expect("runtime should start"));
    service.runtime.set(Arc::downgrade(&runtime)).ok();

    runtime.listen_datagram(addr, Settings::default()).expect("listen_datagram should queue");
    thread::sleep(Duration::from_millis(50));

    let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("client socket should bind");
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.send_to(b"first contact", addr).unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = client.recv_from(&mut buf).expect("echo should arrive once the peer is promoted");
    assert_eq!(&buf[..n], b"first contact");

    // A second datagram from the same peer should skip the accept queue and
    // land on the now-established session directly.
    client.send_to(b"second", addr).unwrap();
    let (n, _) = client.recv_from(&mut buf).expect("second echo should arrive");
    assert_eq!(&buf[..n], b"second");

    thread::sleep(Duration::from_millis(20));
    assert_eq!(service.started.lock().unwrap().len(), 1, "one peer should have produced exactly one session");

    Arc::try_unwrap(runtime).unwrap_or_else(|_| panic!("runtime still shared")).stop();
}
