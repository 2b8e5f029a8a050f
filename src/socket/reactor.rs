//! Per-socket I/O reactor.
//!
//! Every socket owns one reactor: a shared state block and a dedicated
//! worker thread. The worker sleeps on a condition variable while there is
//! nothing to wait for, blocks in `mio::Poll` while readiness is awaited,
//! and converts readiness into typed events posted to the handler currently
//! bound to the socket. A `mio::Waker` registered alongside the descriptor
//! is the cross-thread wakeup primitive; the owning socket signals it
//! whenever it changes the wait mask or closes the descriptor.
//!
//! Teardown crosses the thread boundary: dropping the owning socket flags
//! the shared state as detached and wakes the worker, which exits its loop;
//! the state block is freed when the last `Arc` drops, so destruction is
//! safe even while the worker is blocked in the multiplexer.

use std::io;
use std::mem;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, info, trace, warn};

use crate::config::SocketOptions;
use crate::event_loop::{Event, HandlerRef};
use crate::socket::sys;
use crate::socket::{
    AddressFamily, HostAddressEvent, ListenSocketState, SocketEvent,
    SocketEventFlag, SocketState, SourceId,
};

pub(crate) const WAIT_CONNECT: u8 = 0x01;
pub(crate) const WAIT_READ: u8 = 0x02;
pub(crate) const WAIT_WRITE: u8 = 0x04;
pub(crate) const WAIT_ACCEPT: u8 = 0x08;

const WAKE_TOKEN: Token = Token(0);
const SOCKET_TOKEN: Token = Token(1);

/// The OS endpoint currently owned by the reactor.
pub(crate) enum Endpoint {
    None,
    Stream(TcpStream),
    Listener(TcpListener),
}

impl Endpoint {
    pub(crate) fn is_none(&self) -> bool {
        matches!(self, Endpoint::None)
    }
}

pub(crate) struct ReactorState {
    pub(crate) endpoint: Endpoint,
    pub(crate) registered: bool,
    pub(crate) stream_state: SocketState,
    pub(crate) listen_state: ListenSocketState,
    is_listener: bool,
    pub(crate) handler: Option<HandlerRef>,
    pub(crate) source: SourceId,
    // Pending connect request; cleared once the worker picks it up.
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) bind_addr: Option<IpAddr>,
    pub(crate) family: AddressFamily,
    pub(crate) options: SocketOptions,
    pub(crate) peer_host: String,
    pub(crate) waiting: u8,
    pub(crate) triggered: u8,
    connect_error: Option<io::Error>,
    waker: Option<Arc<Waker>>,
    registry: Option<Registry>,
    thread_running: bool,
    threadwait: bool,
    detached: bool,
}

pub(crate) struct Shared {
    state: Mutex<ReactorState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ReactorState> {
        self.state.lock().expect("reactor state poisoned")
    }
}

pub(crate) struct Reactor {
    shared: Arc<Shared>,
}

impl Reactor {
    pub(crate) fn new(
        handler: Option<HandlerRef>,
        options: SocketOptions,
        source: SourceId,
        is_listener: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ReactorState {
                    endpoint: Endpoint::None,
                    registered: false,
                    stream_state: SocketState::None,
                    listen_state: ListenSocketState::None,
                    is_listener,
                    handler,
                    source,
                    host: String::new(),
                    port: 0,
                    bind_addr: None,
                    family: AddressFamily::Unknown,
                    options,
                    peer_host: String::new(),
                    waiting: 0,
                    triggered: 0,
                    connect_error: None,
                    waker: None,
                    registry: None,
                    thread_running: false,
                    threadwait: false,
                    detached: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ReactorState> {
        self.shared.lock()
    }

    /// Starts the worker, or wakes it if it is already running.
    pub(crate) fn start(&self, st: &mut ReactorState) -> io::Result<()> {
        if st.thread_running {
            self.wakeup(st);
            return Ok(());
        }

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let registry = poll.registry().try_clone()?;
        st.waker = Some(Arc::new(waker));
        st.registry = Some(registry);
        st.thread_running = true;

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("flowsock-reactor".to_string())
            .spawn(move || worker(shared, poll));
        if let Err(err) = spawned {
            st.thread_running = false;
            st.waker = None;
            st.registry = None;
            return Err(err);
        }
        Ok(())
    }

    /// Cancels the multiplexer wait or the idle sleep.
    pub(crate) fn wakeup(&self, st: &mut ReactorState) {
        if !st.thread_running {
            return;
        }
        if st.threadwait {
            st.threadwait = false;
            self.shared.cond.notify_all();
            return;
        }
        if let Some(waker) = &st.waker {
            if let Err(err) = waker.wake() {
                warn!(?err, "Failed to wake reactor");
            }
        }
    }

    /// Flags the worker to self-destruct and stops tracking it.
    ///
    /// Called from the owning socket's drop. If the worker is idle it exits
    /// on the next condvar wake; if it is blocked in the multiplexer the
    /// waker interrupts it. Either way the shared state is freed with the
    /// worker's `Arc`.
    pub(crate) fn detach(&self) {
        let mut st = self.lock();
        st.detached = true;
        self.wakeup(&mut st);
    }
}

fn post_socket_event(st: &ReactorState, flag: SocketEventFlag, error: Option<io::Error>) {
    if let Some(handler) = &st.handler {
        handler.post(Event::Socket(SocketEvent {
            source: st.source,
            flag,
            error,
        }));
    }
}

fn interest_for(waiting: u8) -> Option<Interest> {
    let readable = waiting & (WAIT_READ | WAIT_ACCEPT) != 0;
    let writable = waiting & (WAIT_WRITE | WAIT_CONNECT) != 0;
    match (readable, writable) {
        (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// Brings the mio registration in line with the current wait mask.
fn update_registration(st: &mut ReactorState) -> io::Result<()> {
    let interest = interest_for(st.waiting);
    let ReactorState {
        ref mut endpoint,
        ref registry,
        ref mut registered,
        ..
    } = *st;
    let registry = match registry {
        Some(registry) => registry,
        None => return Ok(()),
    };
    let source: Option<&mut dyn mio::event::Source> = match endpoint {
        Endpoint::Stream(stream) => Some(stream),
        Endpoint::Listener(listener) => Some(listener),
        Endpoint::None => None,
    };
    match (source, interest) {
        (Some(source), Some(interest)) => {
            if *registered {
                registry.reregister(source, SOCKET_TOKEN, interest)?;
            } else {
                registry.register(source, SOCKET_TOKEN, interest)?;
                *registered = true;
            }
        }
        (Some(source), None) => {
            if *registered {
                registry.deregister(source)?;
                *registered = false;
            }
        }
        (None, _) => {}
    }
    Ok(())
}

enum WaitOutcome {
    /// Readiness converted into triggered bits (or nothing left to wait on).
    Triggered,
    /// The endpoint was closed under us.
    Closed,
    /// The owning socket detached; the worker must exit.
    Quit,
}

/// Blocks in the multiplexer until readiness, wakeup or teardown.
///
/// Returns with the lock re-acquired. Triggered directions are removed from
/// the wait mask so they stay edge-triggered until the application re-arms
/// them.
fn wait_for_readiness<'a>(
    shared: &'a Shared,
    mut st: MutexGuard<'a, ReactorState>,
    poll: &mut Poll,
    events: &mut Events,
) -> (MutexGuard<'a, ReactorState>, WaitOutcome) {
    loop {
        if st.detached {
            return (st, WaitOutcome::Quit);
        }
        if st.endpoint.is_none() {
            return (st, WaitOutcome::Closed);
        }
        if let Err(err) = update_registration(&mut st) {
            warn!(?err, "Failed to update reactor registration");
            return (st, WaitOutcome::Closed);
        }

        drop(st);
        let poll_result = poll.poll(events, None);
        st = shared.lock();

        match poll_result {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(?err, "Reactor poll failed");
                return (st, WaitOutcome::Quit);
            }
        }

        if st.detached {
            return (st, WaitOutcome::Quit);
        }
        if st.endpoint.is_none() {
            return (st, WaitOutcome::Closed);
        }

        for event in events.iter() {
            if event.token() != SOCKET_TOKEN {
                continue;
            }
            if st.waiting & WAIT_CONNECT != 0 {
                if event.is_writable()
                    || event.is_error()
                    || event.is_read_closed()
                    || event.is_write_closed()
                {
                    st.connect_error = match &st.endpoint {
                        Endpoint::Stream(stream) => stream.take_error().unwrap_or_else(Some),
                        _ => None,
                    };
                    st.triggered |= WAIT_CONNECT;
                    st.waiting &= !WAIT_CONNECT;
                }
            } else if st.waiting & WAIT_ACCEPT != 0 {
                if event.is_readable() {
                    st.triggered |= WAIT_ACCEPT;
                    st.waiting &= !WAIT_ACCEPT;
                }
            } else {
                if st.waiting & WAIT_READ != 0
                    && (event.is_readable() || event.is_read_closed() || event.is_error())
                {
                    st.triggered |= WAIT_READ;
                    st.waiting &= !WAIT_READ;
                }
                if st.waiting & WAIT_WRITE != 0
                    && (event.is_writable() || event.is_write_closed() || event.is_error())
                {
                    st.triggered |= WAIT_WRITE;
                    st.waiting &= !WAIT_WRITE;
                }
            }
        }

        if st.triggered != 0 || st.waiting == 0 {
            return (st, WaitOutcome::Triggered);
        }
    }
}

/// Converts triggered bits into events posted to the current handler.
///
/// Without a handler the bits stay latched; `set_event_handler` compensates
/// with synthetic events when a handler is bound later.
fn send_events(st: &mut ReactorState) {
    let handler = match st.handler.clone() {
        Some(handler) => handler,
        None => return,
    };
    if st.triggered & WAIT_READ != 0 {
        trace!(source = ?st.source, "read ready");
        handler.post(Event::Socket(SocketEvent {
            source: st.source,
            flag: SocketEventFlag::Read,
            error: None,
        }));
        st.triggered &= !WAIT_READ;
    }
    if st.triggered & WAIT_WRITE != 0 {
        trace!(source = ?st.source, "write ready");
        handler.post(Event::Socket(SocketEvent {
            source: st.source,
            flag: SocketEventFlag::Write,
            error: None,
        }));
        st.triggered &= !WAIT_WRITE;
    }
    if st.triggered & WAIT_ACCEPT != 0 {
        trace!(source = ?st.source, "connection ready to accept");
        handler.post(Event::Socket(SocketEvent {
            source: st.source,
            flag: SocketEventFlag::Connection,
            error: None,
        }));
        st.triggered &= !WAIT_ACCEPT;
    }
}

enum TryConnect {
    Connected,
    NextCandidate,
    Aborted,
}

fn try_connect_host<'a>(
    shared: &'a Shared,
    mut st: MutexGuard<'a, ReactorState>,
    poll: &mut Poll,
    events: &mut Events,
    addr: SocketAddr,
    last_candidate: bool,
    bind_addr: Option<IpAddr>,
) -> (MutexGuard<'a, ReactorState>, TryConnect) {
    if let Some(handler) = &st.handler {
        handler.post(Event::HostAddress(HostAddressEvent {
            source: st.source,
            address: sys::address_to_string(&addr, false),
        }));
    }

    let failure_flag = if last_candidate {
        SocketEventFlag::Connection
    } else {
        SocketEventFlag::ConnectionNext
    };

    let socket = match sys::new_stream_socket(&addr) {
        Ok(socket) => socket,
        Err(err) => {
            debug!(%addr, ?err, "Failed to create socket");
            post_socket_event(&st, failure_flag, Some(err));
            return (st, TryConnect::NextCandidate);
        }
    };

    if let Err(err) = sys::apply_options(&socket, &st.options) {
        debug!(%addr, ?err, "Failed to apply socket options");
    }

    if let Some(ip) = bind_addr {
        if sys::family_of_ip(&ip) == sys::family_of(&addr) {
            // Bind failures are not fatal; the connect decides.
            let _ = socket.bind(&SocketAddr::new(ip, 0).into());
        }
    }

    let in_progress = match sys::start_connect(&socket, &addr) {
        Ok(in_progress) => in_progress,
        Err(err) => {
            debug!(%addr, ?err, "Connect failed immediately");
            post_socket_event(&st, failure_flag, Some(err));
            return (st, TryConnect::NextCandidate);
        }
    };

    let stream = TcpStream::from_std(socket.into());
    st.endpoint = Endpoint::Stream(stream);
    st.registered = false;

    let mut connect_error = None;
    if in_progress {
        st.waiting |= WAIT_CONNECT;
        let (guard, outcome) = wait_for_readiness(shared, st, poll, events);
        st = guard;
        match outcome {
            WaitOutcome::Quit | WaitOutcome::Closed => {
                st.endpoint = Endpoint::None;
                st.registered = false;
                return (st, TryConnect::Aborted);
            }
            WaitOutcome::Triggered => {
                if st.triggered & WAIT_CONNECT != 0 {
                    st.triggered &= !WAIT_CONNECT;
                    connect_error = st.connect_error.take();
                }
            }
        }
    }

    match connect_error {
        Some(err) => {
            debug!(%addr, ?err, "Connection attempt failed");
            post_socket_event(&st, failure_flag, Some(err));
            st.endpoint = Endpoint::None;
            st.registered = false;
            (st, TryConnect::NextCandidate)
        }
        None => {
            st.stream_state = SocketState::Connected;
            if let Endpoint::Stream(stream) = &st.endpoint {
                sys::record_rcv_wscale(stream, st.options.recv_buffer_size.is_some());
            }
            info!(%addr, source = ?st.source, "Connection established");
            post_socket_event(&st, SocketEventFlag::Connection, None);
            st.waiting |= WAIT_READ | WAIT_WRITE;
            (st, TryConnect::Connected)
        }
    }
}

/// Drives a connection attempt through resolution and the candidate list.
///
/// Returns `true` when a connection was established and the worker should
/// fall into the streaming loop.
fn do_connect<'a>(
    shared: &'a Shared,
    mut st: MutexGuard<'a, ReactorState>,
    poll: &mut Poll,
    events: &mut Events,
) -> (MutexGuard<'a, ReactorState>, bool) {
    if st.host.is_empty() || st.port == 0 {
        st.stream_state = SocketState::Failed;
        return (st, false);
    }

    let host = mem::take(&mut st.host);
    let port = mem::replace(&mut st.port, 0);
    let bind_addr = st.bind_addr;
    let family = st.family;

    // Name resolution blocks; release the lock around it.
    drop(st);
    debug!(%host, %port, "Resolving");
    let resolved: io::Result<Vec<SocketAddr>> =
        (host.as_str(), port).to_socket_addrs().map(Iterator::collect);
    st = shared.lock();

    if st.detached {
        return (st, false);
    }
    // If the state left `Connecting`, close() was called. If a new host is
    // stored, close() was followed by another connect(). Either way this
    // resolution result belongs to a cancelled attempt.
    if st.stream_state != SocketState::Connecting || !st.host.is_empty() {
        return (st, false);
    }

    let candidates = match resolved {
        Ok(addrs) => addrs
            .into_iter()
            .filter(|addr| sys::family_matches(addr, family))
            .collect::<Vec<_>>(),
        Err(err) => {
            debug!(%host, ?err, "Resolution failed");
            post_socket_event(&st, SocketEventFlag::Connection, Some(err));
            st.stream_state = SocketState::Failed;
            return (st, false);
        }
    };

    let count = candidates.len();
    for (i, addr) in candidates.into_iter().enumerate() {
        let (guard, outcome) =
            try_connect_host(shared, st, poll, events, addr, i + 1 == count, bind_addr);
        st = guard;
        match outcome {
            TryConnect::Connected => return (st, true),
            TryConnect::NextCandidate => continue,
            TryConnect::Aborted => return (st, false),
        }
    }

    post_socket_event(
        &st,
        SocketEventFlag::Connection,
        Some(sys::connection_aborted()),
    );
    st.stream_state = SocketState::Failed;
    (st, false)
}

fn worker(shared: Arc<Shared>, mut poll: Poll) {
    let mut events = Events::with_capacity(8);
    let mut st = shared.lock();

    'outer: loop {
        // Idle until there is something to do.
        while !st.detached && st.waiting == 0 && st.host.is_empty() {
            st.threadwait = true;
            st = shared.cond.wait(st).expect("reactor state poisoned");
        }
        if st.detached {
            break;
        }

        if !st.is_listener && st.stream_state == SocketState::Connecting {
            let (guard, connected) = do_connect(&shared, st, &mut poll, &mut events);
            st = guard;
            if !connected {
                continue;
            }
        }

        // Readiness loop, shared by listeners (ACCEPT) and streams
        // (READ/WRITE). Runs until the endpoint closes or teardown.
        loop {
            while !st.detached && st.waiting == 0 {
                st.threadwait = true;
                st = shared.cond.wait(st).expect("reactor state poisoned");
            }
            if st.detached {
                break 'outer;
            }
            if st.endpoint.is_none() {
                st.waiting = 0;
                break;
            }
            if !st.is_listener && !st.host.is_empty() {
                // close() followed by a fresh connect(); back to the top.
                break;
            }

            let (guard, outcome) = wait_for_readiness(&shared, st, &mut poll, &mut events);
            st = guard;
            match outcome {
                WaitOutcome::Quit => break 'outer,
                WaitOutcome::Closed => {
                    st.waiting = 0;
                    break;
                }
                WaitOutcome::Triggered => send_events(&mut st),
            }
        }
    }

    st.thread_running = false;
    trace!(source = ?st.source, "Reactor worker exiting");
}
