//! The listening TCP socket.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::SockRef;
use tracing::{info, warn};

use crate::config::SocketOptions;
use crate::error::Error;
use crate::event_loop::HandlerRef;
use crate::socket::reactor::{Endpoint, Reactor, WAIT_ACCEPT};
use crate::socket::{
    change_socket_event_handler, remove_socket_events, sys, AddressFamily, ListenSocketState,
    Socket, SourceId,
};

/// A listening TCP socket with its own reactor thread.
///
/// Once [`listen`](ListenSocket::listen) succeeds, a `Connection` event is
/// posted to the bound handler whenever a connection is ready to
/// [`accept`](ListenSocket::accept). Accepting re-arms the readiness wait,
/// so acceptance stays edge-triggered like reads and writes on streams.
pub struct ListenSocket {
    reactor: Reactor,
    source: SourceId,
}

impl ListenSocket {
    /// Creates a listener with default options.
    pub fn new(handler: Option<HandlerRef>) -> Self {
        Self::with_options(handler, SocketOptions::default())
    }

    /// Creates a listener with explicit options.
    ///
    /// Buffer sizes and nodelay are inherited by accepted sockets.
    pub fn with_options(handler: Option<HandlerRef>, options: SocketOptions) -> Self {
        let source = SourceId::next();
        Self {
            reactor: Reactor::new(handler, options, source, true),
            source,
        }
    }

    /// Creates a listener with options read from a configuration namespace.
    pub fn from_config(
        config: &::config::Config,
        name: &str,
        handler: Option<HandlerRef>,
    ) -> Self {
        Self::with_options(handler, SocketOptions::from_config(config, name))
    }

    /// The identity this listener stamps on its events.
    pub fn source(&self) -> SourceId {
        self.source
    }

    /// Stores the local address to bind when listening.
    pub fn bind(&self, addr: IpAddr) {
        let mut st = self.reactor.lock();
        if st.endpoint.is_none() {
            st.bind_addr = Some(addr);
        }
    }

    /// Starts listening on `port` (0 picks a free port).
    ///
    /// Without a stored bind address, the family's unspecified address is
    /// used; [`AddressFamily::Unknown`] tries IPv6 first, then IPv4.
    pub fn listen(&self, family: AddressFamily, port: u16) -> Result<(), Error> {
        let mut st = self.reactor.lock();
        if st.listen_state != ListenSocketState::None {
            return Err(Error::AlreadyListening);
        }

        let candidates: Vec<SocketAddr> = match st.bind_addr {
            Some(ip) => {
                if !matches!(
                    (family, &ip),
                    (AddressFamily::Unknown, _)
                        | (AddressFamily::Ipv4, IpAddr::V4(_))
                        | (AddressFamily::Ipv6, IpAddr::V6(_))
                ) {
                    return Err(Error::InvalidArgument(
                        "bind address does not match the requested family",
                    ));
                }
                vec![SocketAddr::new(ip, port)]
            }
            None => match family {
                AddressFamily::Ipv4 => vec![(Ipv4Addr::UNSPECIFIED, port).into()],
                AddressFamily::Ipv6 => vec![(Ipv6Addr::UNSPECIFIED, port).into()],
                AddressFamily::Unknown => vec![
                    (Ipv6Addr::UNSPECIFIED, port).into(),
                    (Ipv4Addr::UNSPECIFIED, port).into(),
                ],
            },
        };

        let backlog = st.options.listen_backlog;
        let mut last_error: Option<io::Error> = None;
        for addr in candidates {
            match sys::new_listener(&addr, backlog) {
                Ok(socket) => {
                    let listener = mio::net::TcpListener::from_std(socket.into());
                    info!(%addr, source = ?self.source, "Listening");
                    st.endpoint = Endpoint::Listener(listener);
                    st.registered = false;
                    break;
                }
                Err(err) => {
                    warn!(%addr, ?err, "Failed to listen");
                    last_error = Some(err);
                }
            }
        }
        if st.endpoint.is_none() {
            return Err(Error::Io(last_error.unwrap_or_else(|| {
                io::ErrorKind::AddrNotAvailable.into()
            })));
        }

        st.listen_state = ListenSocketState::Listening;
        if let Err(err) = self.reactor.start(&mut st) {
            st.listen_state = ListenSocketState::None;
            st.endpoint = Endpoint::None;
            return Err(Error::WorkerStart(err));
        }
        st.waiting |= WAIT_ACCEPT;
        self.reactor.wakeup(&mut st);
        Ok(())
    }

    /// Accepts a pending connection and re-arms accept readiness.
    ///
    /// The returned socket is connected, non-blocking, close-on-exec, has
    /// both directions armed and inherits this listener's options. Bind a
    /// handler on it to start receiving events.
    pub fn accept(&self) -> io::Result<Socket> {
        let mut st = self.reactor.lock();
        st.waiting |= WAIT_ACCEPT;
        self.reactor.wakeup(&mut st);

        let accepted = loop {
            let listener = match &st.endpoint {
                Endpoint::Listener(listener) => listener,
                _ => return Err(io::ErrorKind::NotConnected.into()),
            };
            match listener.accept() {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        let (stream, peer) = accepted?;
        let options = st.options.clone();
        drop(st);

        if let Err(err) = sys::set_buffer_sizes(
            &SockRef::from(&stream),
            options.recv_buffer_size,
            options.send_buffer_size,
        ) {
            warn!(?err, "Failed to apply buffer sizes to accepted socket");
        }
        let _ = SockRef::from(&stream).set_nodelay(options.nodelay);

        info!(%peer, "Accepted connection");
        Socket::from_accepted(stream, options, peer)
    }

    /// Closes the listener. Close never reports failure.
    pub fn close(&self) {
        let mut st = self.reactor.lock();
        let _endpoint = std::mem::replace(&mut st.endpoint, Endpoint::None);
        st.registered = false;
        st.listen_state = ListenSocketState::None;
        st.triggered = 0;
        st.waiting = 0;
        self.reactor.wakeup(&mut st);
        if let Some(handler) = st.handler.take() {
            remove_socket_events(&handler, st.source);
        }
    }

    pub fn state(&self) -> ListenSocketState {
        self.reactor.lock().listen_state
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.reactor.lock().endpoint {
            Endpoint::Listener(listener) => listener.local_addr(),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Rebinds the listener to a different handler.
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
    }
}

impl Drop for ListenSocket {
    fn drop(&mut self) {
        self.close();
        self.reactor.detach();
    }
}
