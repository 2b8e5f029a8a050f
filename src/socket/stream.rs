//! The streaming TCP socket.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use socket2::SockRef;
use tracing::{debug, info};

use crate::config::SocketOptions;
use crate::error::Error;
use crate::event_loop::HandlerRef;
use crate::socket::reactor::{Endpoint, Reactor, WAIT_READ, WAIT_WRITE};
use crate::socket::{
    change_socket_event_handler, has_pending_socket_event, remove_socket_events, sys,
    AddressFamily, SocketEvent, SocketEventFlag, SocketState, SourceId,
};
use crate::event_loop::Event;

/// A non-blocking TCP stream socket with its own reactor thread.
///
/// A socket starts in [`SocketState::None`]. [`connect`](Socket::connect)
/// moves it through `Connecting` to `Connected` (or `Failed`), reported
/// through socket events on the bound handler. `read` and `write` never
/// block; they return `WouldBlock` and arm the reactor, which posts a
/// `Read`/`Write` event once the OS signals readiness again.
///
/// The application owns the socket exclusively. Dropping it closes the
/// descriptor and detaches the reactor, which is safe even from the handler
/// thread while the worker is blocked in the multiplexer.
pub struct Socket {
    reactor: Reactor,
    source: SourceId,
}

impl Socket {
    /// Creates a socket with default options.
    pub fn new(handler: Option<HandlerRef>) -> Self {
        Self::with_options(handler, SocketOptions::default())
    }

    /// Creates a socket with explicit options.
    pub fn with_options(handler: Option<HandlerRef>, options: SocketOptions) -> Self {
        let source = SourceId::next();
        Self {
            reactor: Reactor::new(handler, options, source, false),
            source,
        }
    }

    /// Creates a socket with options read from a configuration namespace.
    pub fn from_config(
        config: &::config::Config,
        name: &str,
        handler: Option<HandlerRef>,
    ) -> Self {
        Self::with_options(handler, SocketOptions::from_config(config, name))
    }

    /// Wraps a freshly accepted descriptor into a connected socket.
    pub(crate) fn from_accepted(
        stream: mio::net::TcpStream,
        options: SocketOptions,
        peer: SocketAddr,
    ) -> io::Result<Self> {
        let socket = Self::with_options(None, options);
        {
            let mut st = socket.reactor.lock();
            st.peer_host = sys::address_to_string(&peer, false);
            st.stream_state = SocketState::Connected;
            st.endpoint = Endpoint::Stream(stream);
            st.waiting = WAIT_READ | WAIT_WRITE;
            socket.reactor.start(&mut st)?;
        }
        Ok(socket)
    }

    /// The identity this socket stamps on its events.
    pub fn source(&self) -> SourceId {
        self.source
    }

    /// Starts an asynchronous connection attempt.
    ///
    /// Resolution and connection run on the reactor thread; progress is
    /// reported through `HostAddress`, `ConnectionNext` and `Connection`
    /// events. An error is returned only for invalid arguments, a socket
    /// that is not in a connectable state, or worker startup failure.
    pub fn connect(&self, host: &str, port: u16, family: AddressFamily) -> Result<(), Error> {
        if host.is_empty() {
            return Err(Error::InvalidArgument("host must not be empty"));
        }
        if port == 0 {
            return Err(Error::InvalidArgument("port must be in 1..=65535"));
        }

        let mut st = self.reactor.lock();
        if !matches!(
            st.stream_state,
            SocketState::None | SocketState::Closed | SocketState::Failed
        ) {
            return Err(Error::AlreadyConnected);
        }

        st.family = family;
        st.stream_state = SocketState::Connecting;
        st.peer_host = host.to_string();
        st.host = host.to_string();
        st.port = port;
        st.waiting = 0;
        st.triggered = 0;

        info!(%host, %port, source = ?self.source, "Connecting");
        if let Err(err) = self.reactor.start(&mut st) {
            st.stream_state = SocketState::Failed;
            return Err(Error::WorkerStart(err));
        }
        Ok(())
    }

    /// Reads available bytes. Never blocks.
    ///
    /// `Ok(0)` is EOF. `WouldBlock` re-arms the reactor: a `Read` event
    /// will be posted when new bytes arrive.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut st = self.reactor.lock();
        let result = loop {
            let stream = match &st.endpoint {
                Endpoint::Stream(stream) => stream,
                _ => return Err(io::ErrorKind::NotConnected.into()),
            };
            let mut stream_ref = stream;
            match stream_ref.read(buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        if let Err(err) = &result {
            if err.kind() == io::ErrorKind::WouldBlock && st.waiting & WAIT_READ == 0 {
                st.waiting |= WAIT_READ;
                self.reactor.wakeup(&mut st);
            }
        }
        result
    }

    /// Writes bytes. Never blocks and never raises SIGPIPE.
    ///
    /// `WouldBlock` re-arms the reactor: a `Write` event will be posted
    /// when the send buffer drains.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut st = self.reactor.lock();
        let result = loop {
            let stream = match &st.endpoint {
                Endpoint::Stream(stream) => stream,
                _ => return Err(io::ErrorKind::NotConnected.into()),
            };
            let mut stream_ref = stream;
            match stream_ref.write(buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        if let Err(err) = &result {
            if err.kind() == io::ErrorKind::WouldBlock && st.waiting & WAIT_WRITE == 0 {
                st.waiting |= WAIT_WRITE;
                self.reactor.wakeup(&mut st);
            }
        }
        result
    }

    /// Half-closes the write side.
    ///
    /// On success the state moves from `Connected` to `ShutDown`: further
    /// writes are an error, reads continue until EOF, and no more `Write`
    /// events are emitted.
    pub fn shutdown(&self) -> io::Result<()> {
        let mut st = self.reactor.lock();
        let result = match &st.endpoint {
            Endpoint::Stream(stream) => stream.shutdown(std::net::Shutdown::Write),
            _ => Err(io::ErrorKind::NotConnected.into()),
        };
        if result.is_ok() {
            if st.stream_state == SocketState::Connected {
                st.stream_state = SocketState::ShutDown;
            }
            st.waiting &= !WAIT_WRITE;
            st.triggered &= !WAIT_WRITE;
            debug!(source = ?self.source, "Write side shut down");
        }
        result
    }

    /// Half-closes the read side.
    pub fn shutdown_read(&self) -> io::Result<()> {
        let mut st = self.reactor.lock();
        let result = match &st.endpoint {
            Endpoint::Stream(stream) => stream.shutdown(std::net::Shutdown::Read),
            _ => Err(io::ErrorKind::NotConnected.into()),
        };
        if result.is_ok() {
            st.waiting &= !WAIT_READ;
            st.triggered &= !WAIT_READ;
        }
        result
    }

    /// Closes the socket, aborting any in-progress connection attempt.
    ///
    /// Pending events for this socket are removed from the event loop and
    /// the handler is unbound. Close never reports failure.
    pub fn close(&self) {
        let mut st = self.reactor.lock();
        st.host.clear();
        st.port = 0;
        let _endpoint = std::mem::replace(&mut st.endpoint, Endpoint::None);
        st.registered = false;
        st.stream_state = SocketState::Closed;
        st.triggered = 0;
        st.waiting = 0;
        self.reactor.wakeup(&mut st);
        if let Some(handler) = st.handler.take() {
            remove_socket_events(&handler, st.source);
        }
    }

    pub fn state(&self) -> SocketState {
        self.reactor.lock().stream_state
    }

    /// Requests a synthetic `Read`/`Write` event.
    ///
    /// Lets a layer with internally buffered data keep the edge-triggered
    /// contract: exactly one event is posted, and only if no such event is
    /// pending and the corresponding wait bit is clear.
    pub fn retrigger(&self, flag: SocketEventFlag) {
        if flag != SocketEventFlag::Read && flag != SocketEventFlag::Write {
            return;
        }
        let st = self.reactor.lock();
        let state = st.stream_state;
        if state != SocketState::Connected
            && (state != SocketState::ShutDown || flag == SocketEventFlag::Write)
        {
            return;
        }
        let handler = match &st.handler {
            Some(handler) => handler.clone(),
            None => return,
        };
        if has_pending_socket_event(&handler, st.source, flag) {
            return;
        }
        let wait_bit = if flag == SocketEventFlag::Read {
            WAIT_READ
        } else {
            WAIT_WRITE
        };
        if st.waiting & wait_bit == 0 {
            handler.post(Event::Socket(SocketEvent {
                source: st.source,
                flag,
                error: None,
            }));
        }
    }

    /// Rebinds the socket to a different handler.
    ///
    /// Pending events for this socket are retargeted to the new handler (or
    /// dropped when unbinding). A newly bound handler receives compensating
    /// `Read`/`Write` events for edges that fired while no handler (or the
    /// old handler) was bound, so it never misses a latched edge.
    pub fn set_event_handler(&self, handler: Option<HandlerRef>) {
        let mut st = self.reactor.lock();
        if st.handler == handler {
            return;
        }
        match (&st.handler, &handler) {
            (Some(old), Some(new)) => change_socket_event_handler(old, new, st.source),
            (Some(old), None) => remove_socket_events(old, st.source),
            (None, _) => {}
        }
        st.handler = handler;

        if let Some(new) = st.handler.clone() {
            if st.stream_state == SocketState::Connected
                && st.waiting & WAIT_WRITE == 0
                && !has_pending_socket_event(&new, st.source, SocketEventFlag::Write)
            {
                new.post(Event::Socket(SocketEvent {
                    source: st.source,
                    flag: SocketEventFlag::Write,
                    error: None,
                }));
            }
            if matches!(
                st.stream_state,
                SocketState::Connected | SocketState::ShutDown
            ) && st.waiting & WAIT_READ == 0
                && !has_pending_socket_event(&new, st.source, SocketEventFlag::Read)
            {
                new.post(Event::Socket(SocketEvent {
                    source: st.source,
                    flag: SocketEventFlag::Read,
                    error: None,
                }));
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.reactor.lock().endpoint {
            Endpoint::Stream(stream) => stream.local_addr(),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match &self.reactor.lock().endpoint {
            Endpoint::Stream(stream) => stream.peer_addr(),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// The host this socket was connected to (or the peer address for
    /// accepted sockets).
    pub fn peer_host(&self) -> String {
        self.reactor.lock().peer_host.clone()
    }

    pub fn address_family(&self) -> AddressFamily {
        match self.local_addr() {
            Ok(addr) => sys::family_of(&addr),
            Err(_) => AddressFamily::Unknown,
        }
    }

    /// Stores a local address to bind before the next connect.
    pub fn bind(&self, addr: std::net::IpAddr) {
        let mut st = self.reactor.lock();
        if st.endpoint.is_none() {
            st.bind_addr = Some(addr);
        }
    }

    /// Enables or disables Nagle's algorithm, live and for reconnects.
    pub fn set_nodelay(&self, nodelay: bool) {
        let mut st = self.reactor.lock();
        st.options.nodelay = nodelay;
        if let Endpoint::Stream(stream) = &st.endpoint {
            let _ = SockRef::from(stream).set_nodelay(nodelay);
        }
    }

    /// Enables TCP keepalive with the given idle interval.
    ///
    /// Intervals below one minute are ignored.
    pub fn set_keepalive(&self, interval: Duration) {
        if interval < Duration::from_secs(60) {
            return;
        }
        let mut st = self.reactor.lock();
        st.options.keepalive = Some(interval);
        if let Endpoint::Stream(stream) = &st.endpoint {
            let sock = SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new().with_time(interval);
            let _ = sock.set_tcp_keepalive(&keepalive);
            let _ = sock.set_keepalive(true);
        }
    }

    /// Requests receive/send buffer sizes, live and for reconnects.
    ///
    /// Receive-buffer changes are subject to the receive-window scale
    /// guard: they are suppressed while they would shrink the window scale
    /// the kernel would otherwise pick.
    pub fn set_buffer_sizes(&self, recv: Option<usize>, send: Option<usize>) -> io::Result<()> {
        let mut st = self.reactor.lock();
        st.options.recv_buffer_size = recv;
        st.options.send_buffer_size = send;
        match &st.endpoint {
            Endpoint::Stream(stream) => sys::set_buffer_sizes(&SockRef::from(stream), recv, send),
            _ => Ok(()),
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
        self.reactor.detach();
    }
}
