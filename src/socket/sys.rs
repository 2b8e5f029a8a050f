//! Platform glue: descriptor creation, socket options, address formatting.
//!
//! Everything that touches `socket2`/`libc` directly lives here so the
//! reactor and the public socket types stay platform-neutral.

use std::io;
use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

use crate::config::SocketOptions;
use crate::socket::AddressFamily;

/// Creates a non-blocking, close-on-exec TCP socket for `addr`'s family.
pub(crate) fn new_stream_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    mask_sigpipe(&socket);
    Ok(socket)
}

/// Creates a bound, listening, non-blocking TCP socket.
pub(crate) fn new_listener(addr: &SocketAddr, backlog: i32) -> io::Result<Socket> {
    let socket = new_stream_socket(addr)?;
    socket.bind(&(*addr).into())?;
    socket.listen(backlog)?;
    Ok(socket)
}

/// Applies nodelay, keepalive and buffer sizes to a descriptor.
///
/// Option failures are reported but a connection attempt proceeds without
/// the option; the caller decides whether to log.
pub(crate) fn apply_options(socket: &Socket, options: &SocketOptions) -> io::Result<()> {
    socket.set_nodelay(options.nodelay)?;
    if let Some(interval) = options.keepalive {
        let keepalive = TcpKeepalive::new().with_time(interval);
        socket.set_tcp_keepalive(&keepalive)?;
        socket.set_keepalive(true)?;
    }
    set_buffer_sizes(
        socket,
        options.recv_buffer_size,
        options.send_buffer_size,
    )?;
    Ok(())
}

/// Applies receive/send buffer sizes, honoring the window-scale guard.
pub(crate) fn set_buffer_sizes(
    socket: &Socket,
    recv: Option<usize>,
    send: Option<usize>,
) -> io::Result<()> {
    let mut result = Ok(());
    if let Some(size) = recv {
        if recv_buffer_adjustable() {
            if let Err(err) = socket.set_recv_buffer_size(size) {
                result = Err(err);
            }
        }
    }
    if let Some(size) = send {
        if let Err(err) = socket.set_send_buffer_size(size) {
            result = Err(err);
        }
    }
    result
}

/// Starts a non-blocking connect. Returns `true` when the attempt is in
/// progress and completion must be awaited through write readiness.
pub(crate) fn start_connect(socket: &Socket, addr: &SocketAddr) -> io::Result<bool> {
    match socket.connect(&(*addr).into()) {
        Ok(()) => Ok(false),
        Err(err) if connect_in_progress(&err) => Ok(true),
        Err(err) => Err(err),
    }
}

#[cfg(unix)]
fn connect_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(not(unix))]
fn connect_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// The error reported when every connection candidate has failed.
#[cfg(unix)]
pub(crate) fn connection_aborted() -> io::Error {
    io::Error::from_raw_os_error(libc::ECONNABORTED)
}

#[cfg(not(unix))]
pub(crate) fn connection_aborted() -> io::Error {
    io::ErrorKind::ConnectionAborted.into()
}

pub(crate) fn family_of(addr: &SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::Ipv4,
        SocketAddr::V6(_) => AddressFamily::Ipv6,
    }
}

pub(crate) fn family_of_ip(ip: &IpAddr) -> AddressFamily {
    match ip {
        IpAddr::V4(_) => AddressFamily::Ipv4,
        IpAddr::V6(_) => AddressFamily::Ipv6,
    }
}

pub(crate) fn family_matches(addr: &SocketAddr, family: AddressFamily) -> bool {
    family == AddressFamily::Unknown || family_of(addr) == family
}

/// Renders an address numerically; IPv6 is bracketed when a port is shown.
///
/// The zone index never appears: `IpAddr` does not carry one, which matches
/// the stripped rendering used for host-address events.
pub(crate) fn address_to_string(addr: &SocketAddr, with_port: bool) -> String {
    match addr {
        SocketAddr::V4(v4) => {
            if with_port {
                v4.to_string()
            } else {
                v4.ip().to_string()
            }
        }
        SocketAddr::V6(v6) => {
            if with_port {
                format!("[{}]:{}", v6.ip(), v6.port())
            } else {
                v6.ip().to_string()
            }
        }
    }
}

// ============================================================================
// SIGPIPE
// ============================================================================
//
// Writes must never raise SIGPIPE. On Linux/Android the standard library
// sends with MSG_NOSIGNAL; on Apple platforms SO_NOSIGPIPE is set per
// descriptor. Platforms with neither get a process-wide ignore, installed
// once at first socket creation.

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "tvos", target_os = "watchos"))]
fn mask_sigpipe(socket: &Socket) {
    let _ = socket.set_nosigpipe(true);
}

#[cfg(all(
    unix,
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "tvos",
        target_os = "watchos"
    ))
))]
fn mask_sigpipe(_socket: &Socket) {
    use std::sync::Once;
    static IGNORE_SIGPIPE: Once = Once::new();
    IGNORE_SIGPIPE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

#[cfg(any(target_os = "linux", target_os = "android", not(unix)))]
fn mask_sigpipe(_socket: &Socket) {}

// ============================================================================
// Receive-window scale guard
// ============================================================================
//
// Setting SO_RCVBUF can shrink the TCP receive-window scale factor the
// kernel picks for auto-tuned sockets. The first socket connected with the
// default buffer size records the untouched scale; a socket connected with
// a modified buffer records the resulting scale. SO_RCVBUF stays untouched
// until the baseline is known and whenever the modified scale fell below it.

#[cfg(target_os = "linux")]
mod wscale {
    use std::os::fd::RawFd;
    use std::sync::atomic::AtomicI32;

    pub(super) static UNMODIFIED: AtomicI32 = AtomicI32::new(0);
    pub(super) static MODIFIED: AtomicI32 = AtomicI32::new(0);

    // struct tcp_info packs tcpi_snd_wscale and tcpi_rcv_wscale into the
    // nibbles of its seventh byte; only that prefix is needed here.
    pub(super) fn rcv_wscale(fd: RawFd) -> i32 {
        let mut info = [0u8; 104];
        let mut len = info.len() as libc::socklen_t;
        let res = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                info.as_mut_ptr() as *mut libc::c_void,
                &mut len,
            )
        };
        if res != 0 || (len as usize) < 8 {
            return 0;
        }
        ((info[6] >> 4) & 0x0f) as i32
    }
}

#[cfg(target_os = "linux")]
fn recv_buffer_adjustable() -> bool {
    use std::sync::atomic::Ordering;
    let unmodified = wscale::UNMODIFIED.load(Ordering::Relaxed);
    if unmodified == 0 {
        return false;
    }
    let modified = wscale::MODIFIED.load(Ordering::Relaxed);
    modified == 0 || modified >= unmodified
}

#[cfg(not(target_os = "linux"))]
fn recv_buffer_adjustable() -> bool {
    true
}

/// Records the receive-window scale of a freshly connected socket.
#[cfg(target_os = "linux")]
pub(crate) fn record_rcv_wscale<F: std::os::fd::AsRawFd>(socket: &F, buffer_modified: bool) {
    use std::sync::atomic::Ordering;
    if !buffer_modified && wscale::UNMODIFIED.load(Ordering::Relaxed) == 0 {
        wscale::UNMODIFIED.store(wscale::rcv_wscale(socket.as_raw_fd()), Ordering::Relaxed);
    } else if buffer_modified && wscale::MODIFIED.load(Ordering::Relaxed) == 0 {
        wscale::MODIFIED.store(wscale::rcv_wscale(socket.as_raw_fd()), Ordering::Relaxed);
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) fn record_rcv_wscale<F: std::os::fd::AsRawFd>(_socket: &F, _buffer_modified: bool) {}

#[cfg(not(unix))]
pub(crate) fn record_rcv_wscale<F>(_socket: &F, _buffer_modified: bool) {}
