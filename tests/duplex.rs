//! Full-duplex loopback exchange with digest verification.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use flowsock::prelude::*;
use md5::{Digest, Md5};

const TARGET_BYTES: usize = 512 * 1024;
const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Deterministic byte stream, distinct per seed.
struct Rng(u64);

impl Rng {
    fn fill(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            *byte = self.0 as u8;
        }
    }
}

#[derive(Default)]
struct Done {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Done {
    fn signal(&self) {
        *self.flag.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let deadline = Instant::now() + TEST_TIMEOUT;
        let mut done = self.flag.lock().unwrap();
        while !*done {
            let timeout = deadline
                .checked_duration_since(Instant::now())
                .expect("peer did not finish in time");
            let (guard, _) = self.cond.wait_timeout(done, timeout).unwrap();
            done = guard;
        }
    }
}

/// One side of the exchange: writes TARGET_BYTES of pseudo-random data,
/// shuts down, and reads the peer's stream until EOF, hashing both ways.
struct Peer {
    socket: Option<Socket>,
    listener: Option<ListenSocket>,
    own_handler: Option<HandlerRef>,
    rng: Rng,
    sent_hash: Md5,
    received_hash: Md5,
    sent: usize,
    eof: bool,
    shut: bool,
    failed: Option<String>,
    done: Arc<Done>,
}

impl Peer {
    fn new(seed: u64, done: Arc<Done>) -> Self {
        Self {
            socket: None,
            listener: None,
            own_handler: None,
            rng: Rng(seed),
            sent_hash: Md5::new(),
            received_hash: Md5::new(),
            sent: 0,
            eof: false,
            shut: false,
            failed: None,
            done,
        }
    }

    fn fail(&mut self, message: String) {
        if self.failed.is_none() {
            self.failed = Some(message);
        }
        self.done.signal();
    }

    fn check_done(&mut self) {
        if self.eof && self.shut {
            self.done.signal();
        }
    }

    fn drain_reads(&mut self) {
        let socket = self.socket.as_ref().unwrap();
        let mut buf = [0u8; 4096];
        loop {
            match socket.read(&mut buf) {
                Ok(0) => {
                    self.eof = true;
                    self.check_done();
                    return;
                }
                Ok(n) => self.received_hash.update(&buf[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    self.fail(format!("read failed: {err}"));
                    return;
                }
            }
        }
    }

    fn pump_writes(&mut self) {
        while self.sent < TARGET_BYTES {
            let mut chunk = [0u8; 4096];
            self.rng.fill(&mut chunk);
            let len = chunk.len().min(TARGET_BYTES - self.sent);
            let socket = self.socket.as_ref().unwrap();
            match socket.write(&chunk[..len]) {
                Ok(n) => {
                    self.sent += n;
                    self.sent_hash.update(&chunk[..n]);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    self.fail(format!("write failed: {err}"));
                    return;
                }
            }
        }
        if !self.shut {
            let socket = self.socket.as_ref().unwrap();
            match socket.shutdown() {
                Ok(()) => {
                    self.shut = true;
                    self.check_done();
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => self.fail(format!("shutdown failed: {err}")),
            }
        }
    }
}

impl EventHandler for Peer {
    fn on_event(&mut self, event: Event) {
        let ev = match event {
            Event::Socket(ev) => ev,
            _ => return,
        };

        let from_listener = self
            .listener
            .as_ref()
            .is_some_and(|l| l.source() == ev.source);
        if from_listener {
            if let Some(err) = ev.error {
                self.fail(format!("listener error: {err}"));
                return;
            }
            if self.socket.is_some() {
                self.fail("unexpected second connection".to_string());
                return;
            }
            match self.listener.as_ref().unwrap().accept() {
                Ok(socket) => {
                    socket.set_event_handler(self.own_handler.clone());
                    self.socket = Some(socket);
                }
                Err(err) => self.fail(format!("accept failed: {err}")),
            }
            return;
        }

        if let Some(err) = ev.error {
            self.fail(format!("socket error on {:?}: {err}", ev.flag));
            return;
        }
        if self.socket.is_none() {
            return;
        }
        match ev.flag {
            SocketEventFlag::Read => self.drain_reads(),
            SocketEventFlag::Write => self.pump_writes(),
            SocketEventFlag::Connection | SocketEventFlag::ConnectionNext => {}
        }
    }
}

#[test]
fn duplex_streams_arrive_intact() {
    init_tracing();
    let server_done = Arc::new(Done::default());
    let client_done = Arc::new(Done::default());

    let server_loop = EventLoop::new();
    let server = Arc::new(Mutex::new(Peer::new(0x15eed, server_done.clone())));
    let server_handler = server_loop.register(&server);
    {
        let mut guard = server.lock().unwrap();
        guard.own_handler = Some(server_handler.clone());
        let listener = ListenSocket::new(Some(server_handler));
        listener.bind("127.0.0.1".parse().unwrap());
        listener
            .listen(AddressFamily::Ipv4, 0)
            .expect("Failed to listen");
        guard.listener = Some(listener);
    }
    let port = server
        .lock()
        .unwrap()
        .listener
        .as_ref()
        .unwrap()
        .local_addr()
        .expect("Failed to get listener address")
        .port();

    let client_loop = EventLoop::new();
    let client = Arc::new(Mutex::new(Peer::new(0xfeedbeef, client_done.clone())));
    let client_handler = client_loop.register(&client);
    {
        let mut guard = client.lock().unwrap();
        guard.own_handler = Some(client_handler.clone());
        let socket = Socket::new(Some(client_handler));
        socket
            .connect("127.0.0.1", port, AddressFamily::Ipv4)
            .expect("Failed to start connect");
        guard.socket = Some(socket);
    }

    server_done.wait();
    client_done.wait();

    let mut server = server.lock().unwrap();
    let mut client = client.lock().unwrap();
    assert_eq!(server.failed, None);
    assert_eq!(client.failed, None);
    assert_eq!(server.sent, TARGET_BYTES);
    assert_eq!(client.sent, TARGET_BYTES);

    let client_sent = std::mem::take(&mut client.sent_hash).finalize();
    let server_received = std::mem::take(&mut server.received_hash).finalize();
    let server_sent = std::mem::take(&mut server.sent_hash).finalize();
    let client_received = std::mem::take(&mut client.received_hash).finalize();
    assert_eq!(client_sent, server_received);
    assert_eq!(server_sent, client_received);
}

fn spin_until<F: FnMut() -> bool>(what: &str, mut f: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn accept_blocking(listener: &ListenSocket) -> Socket {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match listener.accept() {
            Ok(socket) => return socket,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "timed out waiting for accept");
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(err) => panic!("accept failed: {err}"),
        }
    }
}

#[test]
fn half_close_keeps_reads_alive() {
    let listener = ListenSocket::new(None);
    listener.bind("127.0.0.1".parse().unwrap());
    listener
        .listen(AddressFamily::Ipv4, 0)
        .expect("Failed to listen");
    let port = listener.local_addr().unwrap().port();

    let a = Socket::new(None);
    a.connect("127.0.0.1", port, AddressFamily::Ipv4)
        .expect("Failed to start connect");
    let b = accept_blocking(&listener);
    spin_until("connect", || a.state() == SocketState::Connected);

    // A half-closes its write side.
    a.shutdown().expect("shutdown failed");
    assert_eq!(a.state(), SocketState::ShutDown);

    // B observes EOF but can still send.
    let mut buf = [0u8; 64];
    spin_until("eof on B", || matches!(b.read(&mut buf), Ok(0)));
    assert_eq!(b.write(b"still open").expect("B write failed"), 10);

    // A still reads B's data after its own shutdown.
    let mut received = Vec::new();
    spin_until("data on A", || match a.read(&mut buf) {
        Ok(n) => {
            received.extend_from_slice(&buf[..n]);
            received.len() == 10
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(err) => panic!("A read failed: {err}"),
    });
    assert_eq!(&received, b"still open");

    // Writing on the shut-down side is an error.
    let result = a.write(b"nope");
    assert!(result.is_err(), "write after shutdown succeeded");
}
