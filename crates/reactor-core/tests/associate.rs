use std::{
    io::{Read, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    os::fd::IntoRawFd,
    sync::{Arc, Mutex, OnceLock, Weak},
    thread,
    time::Duration,
};

use reactor_core::{AssociateRequest, Consumed, NetRuntime, RuntimeOptions, Service, Settings, Sid};
use reactor_utils::ThreadPriority;

/// Echoes bytes back, same shape as `tcp_echo`'s service, reused here to
/// exercise `associate` (adopting an externally-accepted fd) rather than
/// the reactor's own `listen`/accept path.
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
fn associate_adopts_an_externally_accepted_fd_as_a_session() {
    let addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 28831));

    // Accept a connection entirely outside the reactor, as if some other
    // process's listener (or a third-party client library) handed us the
    // fd after its own handshake completed.
    let listener = TcpListener::bind(addr).expect("external listener should bind");
    let client = TcpStream::connect(addr).expect("client should connect");
    client.set_nodelay(true).ok();
    let (accepted, peer) = listener.accept().expect("external accept should succeed");
    accepted.set_nonblocking(true).expect("fd must be non-blocking before handoff");
    let fd = accepted.into_raw_fd();

    let service = Arc::new(EchoService { runtime: OnceLock::new(), started: Mutex::new(Vec::new()) });
    let options = RuntimeOptions { threads: 1, queue_capacity: 256, thread_priority: ThreadPriority::OSDefault };
    let runtime = Arc::new(NetRuntime::create(service.clone(), options).expect("runtime should start"));
    service.runtime.set(Arc::downgrade(&runtime)).ok();

    runtime.associate(AssociateRequest::new(fd, peer, Settings::default())).expect("associate should queue");
    thread::sleep(Duration::from_millis(50));

    let mut client = client;
    client.write_all(b"adopted fd").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).expect("echo should arrive over the associated fd");
    assert_eq!(&buf[..n], b"adopted fd");

    thread::sleep(Duration::from_millis(20));
    assert_eq!(service.started.lock().unwrap().len(), 1);

    Arc::try_unwrap(runtime).unwrap_or_else(|_| panic!("runtime still shared")).stop();
}
