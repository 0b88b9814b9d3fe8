//! The `Nanoapp` trait and per-app runtime bookkeeping.

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::event::{AppId, Event, EventType, InstanceId};
use crate::event_loop::NanoappContext;

/// A loadable unit of application logic running cooperatively under the
/// runtime.
///
/// All entry points execute on the event-loop thread and must return
/// promptly; long work is split across events. The context argument carries
/// the runtime helpers (posting, subscriptions, timers, resource
/// configuration) attributed to this nanoapp.
pub trait Nanoapp: Send {
    /// Globally unique 64-bit identity. At most one live nanoapp per app id.
    fn app_id(&self) -> AppId;

    fn version(&self) -> u32 {
        0
    }

    /// System nanoapps refuse unloading unless the override is set.
    fn is_system(&self) -> bool {
        false
    }

    /// Called once after the instance id is assigned. Returning false aborts
    /// the load; `end` will not be called.
    fn start(&mut self, ctx: &mut NanoappContext<'_>) -> bool;

    fn handle_event(
        &mut self,
        ctx: &mut NanoappContext<'_>,
        sender: InstanceId,
        event_type: EventType,
        payload: &(dyn Any + Send + Sync),
    );

    /// Called exactly once at unload, after every event previously targeted
    /// at this nanoapp has been delivered or dropped.
    fn end(&mut self, ctx: &mut NanoappContext<'_>);
}

/// Snapshot of a live nanoapp, readable from any thread via the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NanoappInfo {
    pub app_id: AppId,
    pub instance_id: InstanceId,
    pub version: u32,
    pub is_system: bool,
}

/// Loop-thread-owned record for one live nanoapp.
pub(crate) struct NanoappRecord {
    pub(crate) app: Box<dyn Nanoapp>,
    pub(crate) app_id: AppId,
    pub(crate) instance_id: InstanceId,
    pub(crate) is_system: bool,
    pub(crate) subscriptions: HashSet<EventType>,
    queue: VecDeque<Arc<Event>>,
    queue_capacity: usize,
}

impl NanoappRecord {
    pub(crate) fn new(app: Box<dyn Nanoapp>, instance_id: InstanceId, queue_capacity: usize) -> Self {
        let app_id = app.app_id();
        let is_system = app.is_system();
        Self {
            app,
            app_id,
            instance_id,
            is_system,
            subscriptions: HashSet::new(),
            queue: VecDeque::new(),
            queue_capacity,
        }
    }

    pub(crate) fn info(&self) -> NanoappInfo {
        NanoappInfo {
            app_id: self.app_id,
            instance_id: self.instance_id,
            version: self.app.version(),
            is_system: self.is_system,
        }
    }

    pub(crate) fn is_subscribed(&self, event_type: EventType) -> bool {
        self.subscriptions.contains(&event_type)
    }

    pub(crate) fn has_pending_event(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Appends the event and takes a reference on it. Fails when the queue is
    /// at capacity; the caller decides what happens to the event then.
    pub(crate) fn post(&mut self, event: Arc<Event>) -> bool {
        if self.queue.len() >= self.queue_capacity {
            return false;
        }
        event.increment_ref();
        self.queue.push_back(event);
        true
    }

    pub(crate) fn pop_event(&mut self) -> Option<Arc<Event>> {
        self.queue.pop_front()
    }

    /// Releases every queued reference; returns events that became
    /// unreferenced so the loop can free them.
    pub(crate) fn drain_queue(&mut self) -> Vec<Arc<Event>> {
        let mut unreferenced = Vec::new();
        for event in self.queue.drain(..) {
            event.decrement_ref();
            if event.is_unreferenced() {
                unreferenced.push(event);
            }
        }
        unreferenced
    }
}
