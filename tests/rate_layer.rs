//! End-to-end rate limiting over loopback: two greedy readers share one
//! limiter fairly.

use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use flowsock::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn wait_for<F: FnMut() -> bool>(what: &str, mut f: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn accept_blocking(listener: &ListenSocket) -> Socket {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match listener.accept() {
            Ok(socket) => return socket,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "timed out waiting for accept");
                thread::sleep(Duration::from_millis(5));
            }
            Err(err) => panic!("accept failed: {err}"),
        }
    }
}

/// Greedy consumer: drains its layer on every read-flavored event.
struct Reader {
    layer: Option<RateLimitedLayer<Socket>>,
    received: usize,
}

impl EventHandler for Reader {
    fn on_event(&mut self, event: Event) {
        let ev = match event {
            Event::Socket(ev) => ev,
            _ => return,
        };
        if ev.flag != SocketEventFlag::Read && ev.flag != SocketEventFlag::Write {
            return;
        }
        let Some(layer) = self.layer.as_mut() else {
            return;
        };
        let mut buf = [0u8; 8192];
        loop {
            match layer.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => self.received += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                // The peer tearing down can surface as a reset; the byte
                // count up to that point is what matters here.
                Err(_) => return,
            }
        }
    }
}

/// Writes as fast as the socket allows until told to stop.
fn blast(socket: Socket, stop: Arc<Mutex<bool>>) {
    let chunk = [0x5au8; 8192];
    while !*stop.lock().unwrap() {
        match socket.write(&chunk) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(2));
            }
            Err(_) => return,
        }
    }
}

#[test]
fn greedy_readers_share_the_limiter_fairly() {
    init_tracing();
    let event_loop = EventLoop::new();
    let manager = RateLimitManager::new(&event_loop);
    let limiter = RateLimiter::new();
    limiter.set_limits(100_000, UNLIMITED);

    let listener = ListenSocket::new(None);
    listener.bind("127.0.0.1".parse().unwrap());
    listener.listen(AddressFamily::Ipv4, 0).unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut readers = Vec::new();
    let mut writers = Vec::new();
    let stop = Arc::new(Mutex::new(false));

    for seed in 0..2u64 {
        let reader = Arc::new(Mutex::new(Reader {
            layer: None,
            received: 0,
        }));
        let handler = event_loop.register(&reader);

        let socket = Socket::new(None);
        socket
            .connect("127.0.0.1", port, AddressFamily::Ipv4)
            .unwrap_or_else(|err| panic!("connect {seed} failed: {err}"));
        let peer = accept_blocking(&listener);
        wait_for("connect", || socket.state() == SocketState::Connected);

        // Wrapping attaches the bucket; the limiter is not yet under the
        // manager, so budgets start at zero without an eager burst.
        let layer = RateLimitedLayer::new(Some(handler), socket, Some(&limiter));
        reader.lock().unwrap().layer = Some(layer);
        readers.push(reader);

        let stop = stop.clone();
        writers.push(thread::spawn(move || blast(peer, stop)));
    }

    // Now start refilling and let the exchange run.
    manager.add(&limiter);
    let window = Duration::from_millis(2_500);
    thread::sleep(window);
    *stop.lock().unwrap() = true;
    thread::sleep(Duration::from_millis(100));

    let received: Vec<usize> = readers
        .iter()
        .map(|r| r.lock().unwrap().received)
        .collect();
    let total: usize = received.iter().sum();

    // 100 kB/s over a 2.5 s window: about 250 kB in total, split evenly.
    // Bounds are generous to absorb scheduler jitter and tick granularity.
    assert!(
        (150_000..=400_000).contains(&total),
        "total {total} out of range, per-reader {received:?}"
    );
    for (i, bytes) in received.iter().enumerate() {
        assert!(
            *bytes >= total * 3 / 10,
            "reader {i} starved: {received:?}"
        );
    }

    for writer in writers {
        let _ = writer.join();
    }
}

#[test]
fn exhausted_budget_blocks_until_refill_wakes_the_layer() {
    init_tracing();
    let event_loop = EventLoop::new();
    let manager = RateLimitManager::new(&event_loop);
    let limiter = RateLimiter::new();
    limiter.set_limits(20_000, UNLIMITED);

    let listener = ListenSocket::new(None);
    listener.bind("127.0.0.1".parse().unwrap());
    listener.listen(AddressFamily::Ipv4, 0).unwrap();
    let port = listener.local_addr().unwrap().port();

    let reader = Arc::new(Mutex::new(Reader {
        layer: None,
        received: 0,
    }));
    let handler = event_loop.register(&reader);

    let socket = Socket::new(None);
    socket
        .connect("127.0.0.1", port, AddressFamily::Ipv4)
        .unwrap();
    let peer = accept_blocking(&listener);
    wait_for("connect", || socket.state() == SocketState::Connected);

    let layer = RateLimitedLayer::new(Some(handler), socket, Some(&limiter));
    reader.lock().unwrap().layer = Some(layer);
    manager.add(&limiter);

    // More than one tick's budget on the wire.
    let payload = vec![1u8; 30_000];
    let mut written = 0;
    while written < payload.len() {
        match peer.write(&payload[written..]) {
            Ok(n) => written += n,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(2))
            }
            Err(err) => panic!("peer write failed: {err}"),
        }
    }

    // The first tick's budget caps what arrives immediately; the refill
    // wakes the layer and the rest flows without any new socket event.
    wait_for("throttled delivery", || {
        reader.lock().unwrap().received >= 4_000
    });
    wait_for("refill completes the transfer", || {
        reader.lock().unwrap().received == 30_000
    });
}

/// Endless in-memory byte source standing in for a connected socket.
struct ByteSource {
    source: SourceId,
}

impl ByteSource {
    fn new() -> Self {
        Self {
            source: SourceId::next(),
        }
    }
}

impl SocketInterface for ByteSource {
    fn source(&self) -> SourceId {
        self.source
    }

    fn connect(&mut self, _host: &str, _port: u16, _family: AddressFamily) -> Result<(), Error> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        buf.fill(0x42);
        Ok(buf.len())
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(buf.len())
    }

    fn shutdown(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn shutdown_read(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn state(&self) -> SocketState {
        SocketState::Connected
    }

    fn set_event_handler(&mut self, _handler: Option<HandlerRef>) {}

    fn retrigger(&mut self, _flag: SocketEventFlag) {}
}

#[test]
fn compound_layer_is_bounded_by_its_tightest_member() {
    let event_loop = EventLoop::new();
    let manager = RateLimitManager::new(&event_loop);

    let tight = RateLimiter::new();
    tight.set_limits(10_000, UNLIMITED);
    let loose = RateLimiter::new();
    loose.set_limits(30_000, UNLIMITED);

    let mut layer = CompoundRateLimitedLayer::new(None, ByteSource::new());
    layer.add_limiter(&tight);
    layer.add_limiter(&loose);
    // A second join of the same limiter changes nothing.
    layer.add_limiter(&tight);

    // Attaching starts each bucket with one tick's share: 2 kB and 6 kB.
    manager.add(&tight);
    manager.add(&loose);

    let mut buf = [0u8; 4096];
    let mut received = 0;
    loop {
        match layer.read(&mut buf) {
            Ok(n) => received += n,
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) => panic!("compound read failed: {err}"),
        }
    }
    assert_eq!(received, 2_000, "tightest member must bound the transfer");

    // Without the tight member, the remaining budget of the other one
    // becomes drainable.
    layer.remove_limiter(&tight);
    let mut extra = 0;
    loop {
        match layer.read(&mut buf) {
            Ok(n) => extra += n,
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) => panic!("compound read failed: {err}"),
        }
    }
    assert_eq!(extra, 4_000, "remaining member budget after removal");
}
