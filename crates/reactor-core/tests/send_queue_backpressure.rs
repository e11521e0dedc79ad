use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use reactor_core::{Consumed, ErrorCode, NetRuntime, RuntimeOptions, Service, Settings, Sid};
use reactor_utils::ThreadPriority;

/// Records the first accepted session, lets the test drive sends to it
/// directly, and records whatever error/close the overrun produces. A
/// session accepted from a listener is never reconnectable, so overrunning
/// its queue must end in a real close rather than a reconnect attempt.
struct RecordingService {
    sid: Mutex<Option<Sid>>,
    errors: Mutex<Vec<ErrorCode>>,
    closed: AtomicBool,
}

impl Service for RecordingService {
    fn on_start(&self, sid: Sid) {
        *self.sid.lock().unwrap() = Some(sid);
    }

    fn on_process(&self, _sid: Sid, _data: &[u8]) -> Consumed {
        Consumed::Used(0)
    }

    fn on_error(&self, _sid: Sid, error: ErrorCode) {
        self.errors.lock().unwrap().push(error);
    }

    fn on_shutdown(&self, _sid: Sid, _way: u8) {
        self.closed.store(true, Ordering::Release);
    }
}

#[test]
fn overrunning_the_queue_limit_closes_the_session() {
    let addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 28811));
    let service = Arc::new(RecordingService { sid: Mutex::new(None), errors: Mutex::new(Vec::new()), closed: AtomicBool::new(false) });
    let options = RuntimeOptions { threads: 1, queue_capacity: 256, thread_priority: ThreadPriority::OSDefault };
    let runtime = NetRuntime::create(service.clone(), options).expect("runtime should start");

    let settings = Settings { send_queue_limit: 4, ..Settings::default() };
    runtime.listen(addr, settings).expect("listen should queue");
    thread::sleep(Duration::from_millis(50));

    // Connect but never read: forces the server's outbound backlog for this
    // session to keep growing instead of ever draining.
    let client = TcpStream::connect(addr).expect("client should connect");
    client.set_nodelay(true).ok();

    let mut sid = None;
    for _ in 0..100 {
        if let Some(s) = *service.sid.lock().unwrap() {
            sid = Some(s);
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let sid = sid.expect("server should have accepted the connection");

    let big = vec![9_u8; 1024 * 1024];
    for _ in 0..32 {
        let _ = runtime.send(sid, big.clone());
    }

    thread::sleep(Duration::from_secs(1));

    assert!(service.closed.load(Ordering::Acquire), "session should have closed after exceeding its send queue limit");
    assert!(
        service.errors.lock().unwrap().iter().any(|e| matches!(e, ErrorCode::SendQueueLimit)),
        "expected a SendQueueLimit error to have been reported"
    );

    drop(client);
    runtime.stop();
}
