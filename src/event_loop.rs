//! In-process event loop: typed event delivery and timers.
//!
//! Sockets, layers and the rate-limit manager do not call back into
//! application code directly. They post typed events addressed to a
//! *handler*; a dedicated dispatch thread pops events in FIFO order and
//! invokes the handler they are addressed to. Handlers are never owned by
//! the loop - registration stores a weak reference, and events whose handler
//! has gone away are silently dropped.
//!
//! The loop also provides timers (used by the rate-limit manager for its
//! refill cadence) and [`HandlerRef::filter_events`], the primitive that
//! handler rebinding and socket close use to retarget or drop pending
//! events atomically.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::socket::{HostAddressEvent, SocketEvent};

/// Identifies a handler registered with an [`EventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Identifies a timer created through [`HandlerRef::add_timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// A unit of work delivered to an [`EventHandler`].
#[derive(Debug)]
pub enum Event {
    /// Readiness or connection-lifecycle notification from a socket or layer.
    Socket(SocketEvent),
    /// Textual address of a connection candidate about to be attempted.
    HostAddress(HostAddressEvent),
    /// A timer created with [`HandlerRef::add_timer`] expired.
    Timer(TimerId),
}

/// Consumer of events dispatched by an [`EventLoop`].
///
/// Implementations are registered as `Arc<Mutex<impl EventHandler>>`; the
/// dispatch thread locks the handler for the duration of each `on_event`
/// call, so a handler never observes two events concurrently.
pub trait EventHandler: Send {
    fn on_event(&mut self, event: Event);
}

struct Timer {
    id: TimerId,
    handler: HandlerId,
    deadline: Instant,
    interval: Duration,
    one_shot: bool,
}

struct LoopState {
    queue: VecDeque<(HandlerId, Event)>,
    handlers: HashMap<HandlerId, Weak<Mutex<dyn EventHandler>>>,
    timers: Vec<Timer>,
    next_handler: u64,
    next_timer: u64,
    quit: bool,
}

struct LoopShared {
    state: Mutex<LoopState>,
    cond: Condvar,
}

impl LoopShared {
    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().expect("event loop state poisoned")
    }
}

/// An event loop with its own dispatch thread.
///
/// Dropping the loop stops the dispatch thread; events still queued at that
/// point are discarded.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    pub fn new() -> Self {
        let shared = Arc::new(LoopShared {
            state: Mutex::new(LoopState {
                queue: VecDeque::new(),
                handlers: HashMap::new(),
                timers: Vec::new(),
                next_handler: 1,
                next_timer: 1,
                quit: false,
            }),
            cond: Condvar::new(),
        });

        let dispatch_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("flowsock-events".to_string())
            .spawn(move || dispatch(dispatch_shared))
            .expect("Failed to spawn event loop thread");

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Registers a handler and returns the reference used to address it.
    ///
    /// The loop keeps only a weak reference; the caller remains the owner.
    pub fn register<H: EventHandler + 'static>(&self, handler: &Arc<Mutex<H>>) -> HandlerRef {
        let handler: Arc<Mutex<dyn EventHandler>> = handler.clone();
        let weak: Weak<Mutex<dyn EventHandler>> = Arc::downgrade(&handler);
        let mut st = self.shared.lock();
        let id = HandlerId(st.next_handler);
        st.next_handler += 1;
        st.handlers.insert(id, weak);
        HandlerRef {
            shared: self.shared.clone(),
            id,
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        {
            let mut st = self.shared.lock();
            st.quit = true;
        }
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A non-owning, cloneable reference to a registered handler.
///
/// This is the address sockets and layers post their events to. Equality
/// compares the registration, not the handler object.
#[derive(Clone)]
pub struct HandlerRef {
    shared: Arc<LoopShared>,
    id: HandlerId,
}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandlerRef").field(&self.id).finish()
    }
}

impl PartialEq for HandlerRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl HandlerRef {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub(crate) fn same_loop(&self, other: &HandlerRef) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Posts an event to this handler. FIFO order per loop is guaranteed.
    pub fn post(&self, event: Event) {
        let mut st = self.shared.lock();
        st.queue.push_back((self.id, event));
        drop(st);
        self.shared.cond.notify_all();
    }

    /// Creates a timer delivering [`Event::Timer`] to this handler.
    ///
    /// One-shot timers fire once and remove themselves; recurring timers
    /// fire every `interval` until stopped.
    pub fn add_timer(&self, interval: Duration, one_shot: bool) -> TimerId {
        let mut st = self.shared.lock();
        let id = TimerId(st.next_timer);
        st.next_timer += 1;
        st.timers.push(Timer {
            id,
            handler: self.id,
            deadline: Instant::now() + interval,
            interval,
            one_shot,
        });
        drop(st);
        self.shared.cond.notify_all();
        id
    }

    /// Stops a timer and drops any of its not-yet-dispatched events.
    pub fn stop_timer(&self, id: TimerId) {
        let mut st = self.shared.lock();
        st.timers.retain(|t| t.id != id);
        st.queue
            .retain(|(_, event)| !matches!(event, Event::Timer(t) if *t == id));
    }

    /// Runs `filter` over every pending event under the queue lock.
    ///
    /// The filter may mutate the entry (e.g. retarget it to a different
    /// handler id) and returns `true` to remove it from the queue.
    pub fn filter_events<F>(&self, mut filter: F)
    where
        F: FnMut(&mut (HandlerId, Event)) -> bool,
    {
        let mut st = self.shared.lock();
        st.queue.retain_mut(|entry| !filter(entry));
    }

    /// Removes this handler's registration, pending events and timers.
    pub fn deregister(&self) {
        let mut st = self.shared.lock();
        st.handlers.remove(&self.id);
        st.timers.retain(|t| t.handler != self.id);
        let id = self.id;
        st.queue.retain(|(target, _)| *target != id);
    }
}

fn dispatch(shared: Arc<LoopShared>) {
    loop {
        let mut st = shared.lock();

        let (target, event) = loop {
            if st.quit {
                return;
            }

            fire_due_timers(&mut st);

            if let Some(entry) = st.queue.pop_front() {
                break entry;
            }

            let next_deadline = st.timers.iter().map(|t| t.deadline).min();
            match next_deadline {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    let (guard, _) = shared
                        .cond
                        .wait_timeout(st, timeout)
                        .expect("event loop state poisoned");
                    st = guard;
                }
                None => {
                    st = shared.cond.wait(st).expect("event loop state poisoned");
                }
            }
        };

        let handler = st.handlers.get(&target).and_then(Weak::upgrade);
        drop(st);

        match handler {
            Some(handler) => {
                let mut handler = handler.lock().expect("event handler poisoned");
                handler.on_event(event);
            }
            None => {
                trace!(?target, "Dropping event for vanished handler");
            }
        }
    }
}

fn fire_due_timers(st: &mut LoopState) {
    let now = Instant::now();
    let mut fired = Vec::new();
    st.timers.retain_mut(|timer| {
        if timer.deadline > now {
            return true;
        }
        fired.push((timer.handler, timer.id));
        if timer.one_shot {
            false
        } else {
            timer.deadline = now + timer.interval;
            true
        }
    });
    for (handler, id) in fired {
        st.queue.push_back((handler, Event::Timer(id)));
    }
}
