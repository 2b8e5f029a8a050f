//! Non-blocking TCP sockets with per-socket reactor threads.
//!
//! A [`Socket`] owns one OS descriptor and one reactor worker thread. The
//! worker multiplexes readiness through mio and posts typed
//! [`SocketEvent`]s to the handler currently bound to the socket. Event
//! delivery is edge-triggered: after a `Read` event the application must
//! drain `read()` to `WouldBlock` before another `Read` event is emitted,
//! and symmetrically for writes.

mod layer;
mod listener;
mod reactor;
mod stream;
pub(crate) mod sys;

pub use layer::SocketInterface;
pub use listener::ListenSocket;
pub use stream::Socket;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::event_loop::{Event, HandlerRef};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an entity that emits socket events.
///
/// Every socket and every layer allocates its own source id; events carry
/// it so a handler receiving events from several sources can demultiplex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl SourceId {
    /// Allocates a fresh source identity.
    ///
    /// Needed by custom [`SocketInterface`] implementations; sockets and
    /// the built-in layers allocate theirs internally.
    pub fn next() -> Self {
        SourceId(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Kind of a [`SocketEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEventFlag {
    /// Outcome of a connection attempt, or on a listening socket a
    /// connection ready to [`accept`](ListenSocket::accept).
    Connection,
    /// A connection candidate failed but another will be tried.
    ConnectionNext,
    /// Read readiness, including EOF (`read()` will return `Ok(0)`).
    Read,
    /// Write readiness.
    Write,
}

/// Readiness or connection-lifecycle notification.
///
/// `error` is `None` on success; connection failures carry the OS error of
/// the failed attempt.
#[derive(Debug)]
pub struct SocketEvent {
    pub source: SourceId,
    pub flag: SocketEventFlag,
    pub error: Option<io::Error>,
}

/// Textual address of a connection candidate about to be attempted.
#[derive(Debug)]
pub struct HostAddressEvent {
    pub source: SourceId,
    pub address: String,
}

/// State of a streaming socket.
///
/// `ShutDown` is half-closed: writes are forbidden, reads continue until
/// EOF. `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    None,
    Connecting,
    Connected,
    ShutDown,
    Closed,
    Failed,
}

/// State of a listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenSocketState {
    None,
    Listening,
}

/// Address family used for resolution and listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Unknown,
    Ipv4,
    Ipv6,
}

fn event_source(event: &Event) -> Option<SourceId> {
    match event {
        Event::Socket(ev) => Some(ev.source),
        Event::HostAddress(ev) => Some(ev.source),
        Event::Timer(_) => None,
    }
}

/// Drops every pending event addressed to `handler` that carries `source`.
///
/// Used on close and on handler removal so a handler never observes events
/// from a socket it no longer serves.
pub fn remove_socket_events(handler: &HandlerRef, source: SourceId) {
    let id = handler.id();
    handler.filter_events(|(target, event)| *target == id && event_source(event) == Some(source));
}

/// Retargets pending events carrying `source` from `old` to `new`.
///
/// If the two handlers live on different event loops the events cannot
/// migrate and are dropped instead.
pub fn change_socket_event_handler(old: &HandlerRef, new: &HandlerRef, source: SourceId) {
    if old == new {
        return;
    }
    if !old.same_loop(new) {
        remove_socket_events(old, source);
        return;
    }
    let old_id = old.id();
    let new_id = new.id();
    old.filter_events(|(target, event)| {
        if *target == old_id && event_source(event) == Some(source) {
            *target = new_id;
        }
        false
    });
}

/// Whether an event `(source, flag)` is already queued for `handler`.
pub(crate) fn has_pending_socket_event(
    handler: &HandlerRef,
    source: SourceId,
    flag: SocketEventFlag,
) -> bool {
    let id = handler.id();
    let mut found = false;
    handler.filter_events(|(target, event)| {
        if *target == id {
            if let Event::Socket(ev) = event {
                if ev.source == source && ev.flag == flag {
                    found = true;
                }
            }
        }
        false
    });
    found
}
