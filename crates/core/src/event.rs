//! Event primitives and the bounded event pool.
//!
//! Events are small typed records delivered to one or many nanoapps. The
//! payload is opaque to the runtime; ownership transfers to the event loop at
//! post time and is handed to the free callback (or dropped) exactly once,
//! on the loop thread, when the last consumer releases the event.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// 16-bit event type tag.
///
/// Reserved ranges: `0x0000..=0x00FF` runtime/system, `0x0100..=0x01FF`
/// sensor samples (base plus sensor-type ordinal), `0x0200..` wifi and host
/// traffic. Broadcast events reach subscribers only; targeted events bypass
/// subscription.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventType(pub u16);

impl EventType {
    /// Reserved no-op event; never delivered to nanoapps.
    pub const NONE: EventType = EventType(0x0000);
    /// Timer expiry delivered to the timer's creator with its cookie.
    pub const TIMER: EventType = EventType(0x0001);
    /// Deferred runtime work; always targeted at the system instance.
    pub const SYSTEM_CALLBACK: EventType = EventType(0x00F0);
    /// Completion notice for a flushed host-bound message.
    pub const HOST_MESSAGE_FLUSHED: EventType = EventType(0x00F1);
    /// First sensor-sample event; add the sensor-type ordinal.
    pub const SENSOR_DATA_BASE: EventType = EventType(0x0100);
    /// Async result of a wifi scan-monitor configuration.
    pub const WIFI_ASYNC_RESULT: EventType = EventType(0x0200);
    /// Unsolicited wifi scan results for scan-monitoring nanoapps.
    pub const WIFI_SCAN_RESULT: EventType = EventType(0x0201);
    /// Message from a host client, targeted at one nanoapp.
    pub const HOST_MESSAGE: EventType = EventType(0x0280);

    /// True for event types in the runtime/system range.
    pub fn is_system(self) -> bool {
        self.0 <= 0x00FF
    }
}

impl From<u16> for EventType {
    #[inline]
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EVT({:#06x})", self.0)
    }
}

/// Process-local handle for a live nanoapp, assigned at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub u32);

impl InstanceId {
    /// The runtime itself; never matches a nanoapp.
    pub const SYSTEM: InstanceId = InstanceId(0);
    /// Target sentinel for delivery to every subscribed nanoapp.
    pub const BROADCAST: InstanceId = InstanceId(u32::MAX);
    pub const INVALID: InstanceId = InstanceId(u32::MAX);
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique 64-bit nanoapp identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AppId(pub u64);

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Opaque event payload; ownership belongs to the loop after posting.
pub type EventPayload = Box<dyn Any + Send + Sync>;

/// Invoked exactly once, on the loop thread, when the last consumer releases
/// the event.
pub type FreeCallback = Box<dyn FnOnce(EventType, EventPayload) + Send>;

/// Failure modes of posting an event into the loop.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PostError {
    #[error("event loop is stopping")]
    Stopped,
    #[error("event pool exhausted")]
    PoolExhausted,
}

/// A typed, reference-counted record delivered to one or many nanoapps.
///
/// References are only taken and released on the loop thread, but the record
/// itself crosses threads inside the inbound queue, so the count is atomic.
pub struct Event {
    pub event_type: EventType,
    pub sender: InstanceId,
    pub target: InstanceId,
    payload: EventPayload,
    free_callback: Mutex<Option<FreeCallback>>,
    ref_count: AtomicUsize,
    _permit: PoolPermit,
}

impl Event {
    pub fn payload(&self) -> &(dyn Any + Send + Sync) {
        &*self.payload
    }

    pub(crate) fn increment_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement_ref(&self) {
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "event ref count underflow");
    }

    pub(crate) fn is_unreferenced(&self) -> bool {
        self.ref_count.load(Ordering::Acquire) == 0
    }

    /// Tears the event apart for freeing; the pool permit is released here.
    pub(crate) fn into_free_parts(self) -> (EventType, EventPayload, Option<FreeCallback>) {
        let callback = self
            .free_callback
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (self.event_type, self.payload, callback)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("event_type", &self.event_type)
            .field("sender", &self.sender)
            .field("target", &self.target)
            .field("ref_count", &self.ref_count.load(Ordering::Relaxed))
            .finish()
    }
}

/// Bounded allocator for events.
///
/// The pool is a capacity gate: posts may come from any thread, so the
/// outstanding count is internally synchronized. Storage itself lives in the
/// event record and is reclaimed when the permit drops.
#[derive(Clone)]
pub struct EventPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    capacity: usize,
    outstanding: AtomicUsize,
}

impl EventPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    pub fn allocate(
        &self,
        event_type: EventType,
        payload: EventPayload,
        free_callback: Option<FreeCallback>,
        sender: InstanceId,
        target: InstanceId,
    ) -> Result<Event, PostError> {
        let reserved = self
            .inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.inner.capacity).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err(PostError::PoolExhausted);
        }

        Ok(Event {
            event_type,
            sender,
            target,
            payload,
            free_callback: Mutex::new(free_callback),
            ref_count: AtomicUsize::new(0),
            _permit: PoolPermit {
                inner: Arc::clone(&self.inner),
            },
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn in_use(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }
}

struct PoolPermit {
    inner: Arc<PoolInner>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}
