//! Socket layers that meter bytes through the rate-limit tree.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::trace;

use crate::error::Error;
use crate::event_loop::{Event, HandlerRef};
use crate::rate::limiter::Bucket;
use crate::rate::{Direction, RateLimiter, UNLIMITED};
use crate::socket::{
    change_socket_event_handler, remove_socket_events, AddressFamily, SocketEvent,
    SocketEventFlag, SocketInterface, SocketState, SourceId,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("layer handler slot poisoned")
}

fn readiness_flag(d: Direction) -> SocketEventFlag {
    match d {
        Direction::Inbound => SocketEventFlag::Read,
        Direction::Outbound => SocketEventFlag::Write,
    }
}

fn post_readiness(handler: &Mutex<Option<HandlerRef>>, source: SourceId, d: Direction) {
    let guard = lock(handler);
    if let Some(handler) = guard.as_ref() {
        handler.post(Event::Socket(SocketEvent {
            source,
            flag: readiness_flag(d),
            error: None,
        }));
    }
}

/// A socket layer that is a bucket.
///
/// Reads and writes are truncated to the bucket's available budget; the
/// actually transferred byte count is consumed afterwards. When the budget
/// for a direction is exhausted the call returns `WouldBlock` - the bucket
/// is already marked waiting at that point, and once the next refill
/// delivers budget a synthetic `Read`/`Write` event carrying this layer's
/// source is posted to the handler.
///
/// Events from the underlying socket pass through to the same handler
/// untouched.
pub struct RateLimitedLayer<S: SocketInterface> {
    next: S,
    source: SourceId,
    handler: Arc<Mutex<Option<HandlerRef>>>,
    bucket: Bucket,
}

impl<S: SocketInterface> RateLimitedLayer<S> {
    /// Wraps `next`, binding both layers to `handler`, and joins `limiter`.
    pub fn new(handler: Option<HandlerRef>, mut next: S, limiter: Option<&RateLimiter>) -> Self {
        let source = SourceId::next();
        let shared = Arc::new(Mutex::new(handler.clone()));
        next.set_event_handler(handler);

        let bucket = Bucket::new();
        {
            let shared = shared.clone();
            bucket.set_wakeup(move |d| {
                trace!(?d, "Rate budget restored");
                post_readiness(&shared, source, d);
            });
        }
        if let Some(limiter) = limiter {
            limiter.add_bucket(&bucket);
        }

        Self {
            next,
            source,
            handler: shared,
            bucket,
        }
    }

    /// Access to the wrapped layer.
    pub fn next_layer(&self) -> &S {
        &self.next
    }

    pub fn next_layer_mut(&mut self) -> &mut S {
        &mut self.next
    }
}

impl<S: SocketInterface> SocketInterface for RateLimitedLayer<S> {
    fn source(&self) -> SourceId {
        self.source
    }

    fn connect(&mut self, host: &str, port: u16, family: AddressFamily) -> Result<(), Error> {
        self.next.connect(host, port, family)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let max = self.bucket.available(Direction::Inbound);
        if max == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let len = buf.len().min(max);
        let read = self.next.read(&mut buf[..len])?;
        if read > 0 && max != UNLIMITED {
            self.bucket.consume(Direction::Inbound, read);
        }
        Ok(read)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let max = self.bucket.available(Direction::Outbound);
        if max == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let len = buf.len().min(max);
        let written = self.next.write(&buf[..len])?;
        if written > 0 && max != UNLIMITED {
            self.bucket.consume(Direction::Outbound, written);
        }
        Ok(written)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.next.shutdown()
    }

    fn shutdown_read(&mut self) -> io::Result<()> {
        self.next.shutdown_read()
    }

    fn state(&self) -> SocketState {
        self.next.state()
    }

    fn set_event_handler(&mut self, handler: Option<HandlerRef>) {
        {
            let mut slot = lock(&self.handler);
            match (&*slot, &handler) {
                (Some(old), Some(new)) => change_socket_event_handler(old, new, self.source),
                (Some(old), None) => remove_socket_events(old, self.source),
                (None, _) => {}
            }
            *slot = handler.clone();
        }
        self.next.set_event_handler(handler);
    }

    fn retrigger(&mut self, flag: SocketEventFlag) {
        self.next.retrigger(flag)
    }
}

impl<S: SocketInterface> Drop for RateLimitedLayer<S> {
    fn drop(&mut self) {
        self.next.set_event_handler(None);
        if let Some(handler) = lock(&self.handler).take() {
            remove_socket_events(&handler, self.source);
        }
    }
}

// ============================================================================
// Compound layer
// ============================================================================

struct CompoundMember {
    bucket: Bucket,
    limiter: Weak<crate::rate::limiter::LimiterInner>,
    /// Set before querying the bucket, cleared once the verdict is in; a
    /// refill between the two cannot be lost, and a refill after a
    /// `WouldBlock` verdict wakes the consumer exactly once.
    waiting: Arc<[AtomicBool; 2]>,
    last_max: usize,
}

impl CompoundMember {
    fn wake(&self, d: Direction, handler: &Mutex<Option<HandlerRef>>, source: SourceId) {
        if self.waiting[d.idx()].swap(false, Ordering::AcqRel) {
            post_readiness(handler, source, d);
        }
    }
}

/// A socket layer metered by several limiters at once.
///
/// Each transfer is bounded by the minimum available budget across all
/// member buckets and consumed from every one of them. A single direction
/// waiting on any member blocks the transfer; the first member to regain
/// budget posts the readiness event.
pub struct CompoundRateLimitedLayer<S: SocketInterface> {
    next: S,
    source: SourceId,
    handler: Arc<Mutex<Option<HandlerRef>>>,
    members: Vec<CompoundMember>,
}

impl<S: SocketInterface> CompoundRateLimitedLayer<S> {
    pub fn new(handler: Option<HandlerRef>, mut next: S) -> Self {
        let source = SourceId::next();
        let shared = Arc::new(Mutex::new(handler.clone()));
        next.set_event_handler(handler);
        Self {
            next,
            source,
            handler: shared,
            members: Vec::new(),
        }
    }

    /// Joins a limiter; a second join of the same limiter is a no-op.
    pub fn add_limiter(&mut self, limiter: &RateLimiter) {
        if self
            .members
            .iter()
            .any(|m| m.limiter.as_ptr() == Arc::as_ptr(&limiter.inner))
        {
            return;
        }

        let bucket = Bucket::new();
        let waiting: Arc<[AtomicBool; 2]> =
            Arc::new([AtomicBool::new(false), AtomicBool::new(false)]);
        {
            let shared = self.handler.clone();
            let waiting = waiting.clone();
            let source = self.source;
            bucket.set_wakeup(move |d| {
                if !waiting[d.idx()].swap(false, Ordering::AcqRel) {
                    return;
                }
                post_readiness(&shared, source, d);
            });
        }
        limiter.add_bucket(&bucket);
        self.members.push(CompoundMember {
            bucket,
            limiter: Arc::downgrade(&limiter.inner),
            waiting,
            last_max: 0,
        });
    }

    /// Leaves a limiter, waking both directions so no consumer stalls on a
    /// budget that will never be refilled again.
    pub fn remove_limiter(&mut self, limiter: &RateLimiter) {
        let Some(pos) = self
            .members
            .iter()
            .position(|m| m.limiter.as_ptr() == Arc::as_ptr(&limiter.inner))
        else {
            return;
        };
        let member = self.members.swap_remove(pos);
        member.bucket.remove();
        member.wake(Direction::Inbound, &self.handler, self.source);
        member.wake(Direction::Outbound, &self.handler, self.source);
    }

    fn reserve(&mut self, d: Direction, requested: usize) -> io::Result<usize> {
        let mut max = UNLIMITED;
        for member in &mut self.members {
            member.waiting[d.idx()].store(true, Ordering::Release);
            member.last_max = member.bucket.available(d);
            if member.last_max == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            member.waiting[d.idx()].store(false, Ordering::Release);
            max = max.min(member.last_max);
        }
        Ok(requested.min(max))
    }

    fn commit(&self, d: Direction, transferred: usize) {
        for member in &self.members {
            if member.last_max != UNLIMITED {
                member.bucket.consume(d, transferred);
            }
        }
    }
}

impl<S: SocketInterface> SocketInterface for CompoundRateLimitedLayer<S> {
    fn source(&self) -> SourceId {
        self.source
    }

    fn connect(&mut self, host: &str, port: u16, family: AddressFamily) -> Result<(), Error> {
        self.next.connect(host, port, family)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.reserve(Direction::Inbound, buf.len())?;
        let read = self.next.read(&mut buf[..len])?;
        if read > 0 {
            self.commit(Direction::Inbound, read);
        }
        Ok(read)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.reserve(Direction::Outbound, buf.len())?;
        let written = self.next.write(&buf[..len])?;
        if written > 0 {
            self.commit(Direction::Outbound, written);
        }
        Ok(written)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.next.shutdown()
    }

    fn shutdown_read(&mut self) -> io::Result<()> {
        self.next.shutdown_read()
    }

    fn state(&self) -> SocketState {
        self.next.state()
    }

    fn set_event_handler(&mut self, handler: Option<HandlerRef>) {
        {
            let mut slot = lock(&self.handler);
            match (&*slot, &handler) {
                (Some(old), Some(new)) => change_socket_event_handler(old, new, self.source),
                (Some(old), None) => remove_socket_events(old, self.source),
                (None, _) => {}
            }
            *slot = handler.clone();
        }
        self.next.set_event_handler(handler);
    }

    fn retrigger(&mut self, flag: SocketEventFlag) {
        self.next.retrigger(flag)
    }
}

impl<S: SocketInterface> Drop for CompoundRateLimitedLayer<S> {
    fn drop(&mut self) {
        for member in &self.members {
            member.bucket.remove();
        }
        self.next.set_event_handler(None);
        if let Some(handler) = lock(&self.handler).take() {
            remove_socket_events(&handler, self.source);
        }
    }
}
