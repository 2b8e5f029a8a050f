//! A non-blocking TCP socket engine with a hierarchical, fair token-bucket
//! rate limiter, built on [mio](https://docs.rs/mio).
//!
//! - **Per-socket reactors:** every [`Socket`] owns a dedicated worker
//!   thread that multiplexes readiness and posts typed events to the
//!   handler bound to the socket
//! - **Edge-triggered:** after a `Read` event, drain `read()` to
//!   `WouldBlock` to re-arm; same for writes. No busy polling, no missed
//!   edges
//! - **Layered streams:** sockets and layers share the
//!   [`SocketInterface`] trait; a layer owns the layer below and either
//!   passes events through or synthesizes its own
//! - **Hierarchical rate limiting:** [`RateLimiter`]s nest to arbitrary
//!   depth, dividing bandwidth fairly by weight, recycling unused budget to
//!   siblings with demand and repaying eager grants to late joiners
//! - **Quiet when idle:** the refill timer stops after two idle ticks and
//!   re-arms the moment a consumer waits for budget
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::{Arc, Mutex};
//! use flowsock::prelude::*;
//!
//! struct Echo {
//!     socket: Option<Socket>,
//! }
//!
//! impl EventHandler for Echo {
//!     fn on_event(&mut self, event: Event) {
//!         if let Event::Socket(ev) = event {
//!             match ev.flag {
//!                 SocketEventFlag::Read => {
//!                     let socket = self.socket.as_ref().unwrap();
//!                     let mut buf = [0u8; 4096];
//!                     // Drain to WouldBlock so the next Read event fires.
//!                     while let Ok(n) = socket.read(&mut buf) {
//!                         if n == 0 {
//!                             return; // EOF
//!                         }
//!                         let _ = socket.write(&buf[..n]);
//!                     }
//!                 }
//!                 _ => {}
//!             }
//!         }
//!     }
//! }
//!
//! # fn main() -> Result<(), flowsock::Error> {
//! let event_loop = EventLoop::new();
//! let echo = Arc::new(Mutex::new(Echo { socket: None }));
//! let handler = event_loop.register(&echo);
//!
//! let socket = Socket::new(Some(handler));
//! socket.connect("example.com", 7, AddressFamily::Unknown)?;
//! echo.lock().unwrap().socket = Some(socket);
//! # Ok(())
//! # }
//! ```
//!
//! # Rate limiting
//!
//! Attach a [`RateLimitedLayer`] on top of a socket and add it to a
//! [`RateLimiter`]; nest limiters under a [`RateLimitManager`] for
//! hierarchical ceilings:
//!
//! ```no_run
//! use flowsock::prelude::*;
//!
//! let event_loop = EventLoop::new();
//! let manager = RateLimitManager::new(&event_loop);
//!
//! let root = RateLimiter::new();
//! root.set_limits(1_000_000, UNLIMITED); // 1 MB/s download, uploads free
//! manager.add(&root);
//!
//! let per_connection = RateLimiter::new();
//! per_connection.set_limits(250_000, UNLIMITED);
//! root.add_limiter(&per_connection);
//!
//! let socket = Socket::new(None);
//! let limited = RateLimitedLayer::new(None, socket, Some(&per_connection));
//! // read()/write() on `limited` are now metered.
//! ```
//!
//! # Configuration
//!
//! Socket options can be read from the [`config`](https://docs.rs/config/)
//! crate with `{name}.{key}` / `{key}` lookup priority; see
//! [`SocketOptions`] for the key set.

pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod event_loop;
pub mod rate;
pub mod socket;

pub use config::SocketOptions;
pub use error::Error;
pub use event_loop::{Event, EventHandler, EventLoop, HandlerId, HandlerRef, TimerId};
pub use rate::{
    Bucket, CompoundRateLimitedLayer, Direction, RateLimitManager, RateLimitedLayer, RateLimiter,
    UNLIMITED,
};
pub use socket::{
    change_socket_event_handler, remove_socket_events, AddressFamily, HostAddressEvent,
    ListenSocket, ListenSocketState, Socket, SocketEvent, SocketEventFlag, SocketInterface,
    SocketState, SourceId,
};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::config::SocketOptions;
    pub use crate::error::Error;
    pub use crate::event_loop::{Event, EventHandler, EventLoop, HandlerRef};
    pub use crate::rate::{
        Bucket, CompoundRateLimitedLayer, Direction, RateLimitManager, RateLimitedLayer,
        RateLimiter, UNLIMITED,
    };
    pub use crate::socket::{
        AddressFamily, HostAddressEvent, ListenSocket, ListenSocketState, Socket, SocketEvent,
        SocketEventFlag, SocketInterface, SocketState, SourceId,
    };
}
