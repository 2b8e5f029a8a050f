use thiserror::Error;

/// The error type for flowsock operations.
///
/// This covers errors raised when setting up sockets, listeners and rate
/// limiters. I/O-path operations (`read`, `write`, `shutdown`) return
/// `std::io::Result` instead, with `ErrorKind::WouldBlock` marking the
/// transient case that re-arms the reactor. Errors that occur while a
/// connection attempt is in flight are delivered through socket events, not
/// through return values.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An argument failed validation before any system call was made.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// `connect()` requires the socket to be in its initial state.
    ///
    /// Call [`close()`](crate::Socket::close) first to reuse a socket for a
    /// new connection attempt.
    #[error("Socket is already connected or a connection attempt is in progress")]
    AlreadyConnected,

    /// `listen()` requires the listener to be in its initial state.
    #[error("Listener is already listening")]
    AlreadyListening,

    /// The reactor worker thread could not be started.
    ///
    /// This typically means the process ran out of file descriptors (the
    /// wakeup primitive could not be created) or threads.
    #[error("Failed to start the socket worker: {0}")]
    WorkerStart(std::io::Error),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
