//! The duplex stream abstraction layers compose over.

use std::io;

use crate::error::Error;
use crate::event_loop::HandlerRef;
use crate::socket::{AddressFamily, Socket, SocketEventFlag, SocketState, SourceId};

/// Abstract duplex stream.
///
/// [`Socket`] implements this directly; layers wrap another implementor and
/// add behavior on the way through. A layer owns the layer below it, so the
/// upper layer is always destroyed first. Each layer is its own event
/// source: it either lets the underlying events pass through to the shared
/// handler or consumes them and synthesizes events under its own source id.
pub trait SocketInterface: Send {
    /// The identity stamped on events synthesized by this layer.
    fn source(&self) -> SourceId;

    fn connect(&mut self, host: &str, port: u16, family: AddressFamily) -> Result<(), Error>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Half-closes the write side.
    fn shutdown(&mut self) -> io::Result<()>;

    /// Half-closes the read side.
    fn shutdown_read(&mut self) -> io::Result<()>;

    fn state(&self) -> SocketState;

    /// Rebinds to a different handler, retargeting pending events.
    fn set_event_handler(&mut self, handler: Option<HandlerRef>);

    /// Requests a synthetic `Read`/`Write` event if none is pending and the
    /// corresponding readiness wait is not armed.
    fn retrigger(&mut self, flag: SocketEventFlag);
}

impl SocketInterface for Socket {
    fn source(&self) -> SourceId {
        Socket::source(self)
    }

    fn connect(&mut self, host: &str, port: u16, family: AddressFamily) -> Result<(), Error> {
        Socket::connect(self, host, port, family)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Socket::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Socket::write(self, buf)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        Socket::shutdown(self)
    }

    fn shutdown_read(&mut self) -> io::Result<()> {
        Socket::shutdown_read(self)
    }

    fn state(&self) -> SocketState {
        Socket::state(self)
    }

    fn set_event_handler(&mut self, handler: Option<HandlerRef>) {
        Socket::set_event_handler(self, handler)
    }

    fn retrigger(&mut self, flag: SocketEventFlag) {
        Socket::retrigger(self, flag)
    }
}
