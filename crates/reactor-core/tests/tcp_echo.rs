use std::{
    io::{Read, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream},
    sync::{Arc, Mutex, OnceLock, Weak},
    thread,
    time::Duration,
};

use reactor_core::{Consumed, NetRuntime, RuntimeOptions, Service, Settings, Sid};
use reactor_utils::ThreadPriority;

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

fn single_thread_runtime(service: Arc<EchoService>) -> Arc<NetRuntime> {
    let options = RuntimeOptions { threads: 1, queue_capacity: 256, thread_priority: ThreadPriority::OSDefault };
    let runtime = Arc::new(NetRuntime::create(service.clone(), options).expect("runtime should start"));
    service.runtime.set(Arc::downgrade(&runtime)).ok();
    runtime
}

#[test]
fn echoes_bytes_back_to_sender() {
    let addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 28801));
    let service = Arc::new(EchoService { runtime: OnceLock::new(), started: Mutex::new(Vec::new()) });
    let runtime = single_thread_runtime(service);
    runtime.listen(addr, Settings::default()).expect("listen should queue");
    thread::sleep(Duration::from_millis(50));

    let mut client = TcpStream::connect(addr).expect("client should connect");
    client.set_nodelay(true).ok();
    client.write_all(b"hello reactor").unwrap();

    let mut buf = [0u8; 64];
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let n = client.read(&mut buf).expect("echo should arrive");
    assert_eq!(&buf[..n], b"hello reactor");

    Arc::try_unwrap(runtime).unwrap_or_else(|_| panic!("runtime still shared")).stop();
}

#[test]
fn multiple_sessions_are_independent() {
    let addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 28802));
    let service = Arc::new(EchoService { runtime: OnceLock::new(), started: Mutex::new(Vec::new()) });
    let runtime = single_thread_runtime(service.clone());
    runtime.listen(addr, Settings::default()).expect("listen should queue");
    thread::sleep(Duration::from_millis(50));

    let mut a = TcpStream::connect(addr).unwrap();
    let mut b = TcpStream::connect(addr).unwrap();
    a.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    b.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    a.write_all(b"from-a").unwrap();
    b.write_all(b"from-b").unwrap();

    let mut buf = [0u8; 32];
    let na = a.read(&mut buf).unwrap();
    assert_eq!(&buf[..na], b"from-a");
    let nb = b.read(&mut buf).unwrap();
    assert_eq!(&buf[..nb], b"from-b");

    thread::sleep(Duration::from_millis(20));
    assert_eq!(service.started.lock().unwrap().len(), 2);

    Arc::try_unwrap(runtime).unwrap_or_else(|_| panic!("runtime still shared")).stop();
}
