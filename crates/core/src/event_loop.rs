//! Two-stage event distribution on a single dedicated thread.
//!
//! Producers (platform callbacks, the host bridge, the timer thread) post
//! events into a bounded inbound queue from any thread. The loop thread
//! distributes each inbound event into per-nanoapp queues, then delivers one
//! round of round-robin across apps with pending events. An event's free
//! callback runs on the loop thread when the last reference is released.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::event::{
    AppId, Event, EventPayload, EventPool, EventType, FreeCallback, InstanceId, PostError,
};
use crate::hub::{Services, SystemOp};
use crate::nanoapp::{Nanoapp, NanoappInfo, NanoappRecord};
use crate::sensors::{SensorError, SensorMode, SensorRequest, SensorType};
use crate::timer::TimerId;

/// Failure modes of loading a nanoapp.
#[derive(Debug, Error)]
pub enum StartNanoappError {
    #[error("app {0} is already running")]
    DuplicateAppId(AppId),
    #[error("nanoapp capacity exhausted")]
    Capacity,
    #[error("app {0} start() returned false")]
    StartFailed(AppId),
}

/// Failure modes of runtime helpers called from a nanoapp context.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("nanoapp is stopping")]
    Stopping,
    #[error("host-bound message queue is full")]
    HostQueueFull,
    #[error(transparent)]
    Post(#[from] PostError),
    #[error(transparent)]
    Sensor(#[from] SensorError),
}

pub(crate) enum Inbound {
    Event(Event),
    Wake,
}

pub(crate) struct SharedState {
    running: AtomicBool,
    tx: Sender<Inbound>,
    pool: EventPool,
    next_instance_id: AtomicU32,
    registry: Mutex<Vec<NanoappInfo>>,
}

impl SharedState {
    pub(crate) fn new(pool_capacity: usize) -> (Arc<Self>, Receiver<Inbound>) {
        // One extra slot keeps the wakeup sentinel deliverable when the pool
        // is fully committed.
        let (tx, rx) = crossbeam_channel::bounded(pool_capacity + 1);
        let shared = Arc::new(Self {
            running: AtomicBool::new(true),
            tx,
            pool: EventPool::new(pool_capacity),
            next_instance_id: AtomicU32::new(1),
            registry: Mutex::new(Vec::new()),
        });
        (shared, rx)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn post(
        &self,
        event_type: EventType,
        payload: EventPayload,
        free_callback: Option<FreeCallback>,
        sender: InstanceId,
        target: InstanceId,
    ) -> Result<(), PostError> {
        if !self.is_running() {
            return Err(PostError::Stopped);
        }
        let event = self
            .pool
            .allocate(event_type, payload, free_callback, sender, target)?;
        if self.tx.try_send(Inbound::Event(event)).is_err() {
            // The queue is sized past the pool, so this cannot happen while
            // the capacity gate holds.
            debug_assert!(false, "inbound queue full with a pool permit held");
            error!("inbound event queue full");
            return Err(PostError::PoolExhausted);
        }
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.tx.try_send(Inbound::Wake);
    }

    fn next_instance_id(&self) -> InstanceId {
        InstanceId(self.next_instance_id.fetch_add(1, Ordering::Relaxed))
    }

    fn register(&self, info: NanoappInfo) {
        self.lock_registry().push(info);
    }

    fn unregister(&self, instance_id: InstanceId) {
        self.lock_registry()
            .retain(|info| info.instance_id != instance_id);
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Vec<NanoappInfo>> {
        self.registry.lock().expect("nanoapp registry poisoned")
    }
}

/// Thread-safe handle onto a running event loop.
///
/// Lookups and iteration go through the registry mirror under its lock; the
/// loop thread itself reads its own nanoapp list lock-free via [`EventLoop`]
/// methods instead.
#[derive(Clone)]
pub struct EventLoopHandle {
    shared: Arc<SharedState>,
}

impl EventLoopHandle {
    pub(crate) fn from_shared(shared: Arc<SharedState>) -> Self {
        Self { shared }
    }

    /// Posts an event into the inbound queue. Payload ownership transfers
    /// here; the free callback (when present) runs exactly once on the loop
    /// thread.
    pub fn post_event(
        &self,
        event_type: EventType,
        payload: EventPayload,
        free_callback: Option<FreeCallback>,
        sender: InstanceId,
        target: InstanceId,
    ) -> Result<(), PostError> {
        self.shared
            .post(event_type, payload, free_callback, sender, target)
    }

    /// Initiates shutdown: no further posts are accepted and the loop drains
    /// and unloads once it observes the flag.
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn find_nanoapp_by_app_id(&self, app_id: AppId) -> Option<NanoappInfo> {
        self.shared
            .lock_registry()
            .iter()
            .find(|info| info.app_id == app_id)
            .cloned()
    }

    pub fn find_nanoapp_by_instance_id(&self, instance_id: InstanceId) -> Option<NanoappInfo> {
        self.shared
            .lock_registry()
            .iter()
            .find(|info| info.instance_id == instance_id)
            .cloned()
    }

    pub fn for_each_nanoapp(&self, mut callback: impl FnMut(&NanoappInfo)) {
        for info in self.shared.lock_registry().iter() {
            callback(info);
        }
    }

    pub fn event_pool_in_use(&self) -> usize {
        self.shared.pool.in_use()
    }
}

/// Runtime helpers handed to nanoapp entry points, attributed to the nanoapp
/// being dispatched.
pub struct NanoappContext<'a> {
    pub(crate) instance_id: InstanceId,
    pub(crate) app_id: AppId,
    pub(crate) stopping: bool,
    pub(crate) subscriptions: &'a mut std::collections::HashSet<EventType>,
    pub(crate) services: &'a mut Services,
}

impl NanoappContext<'_> {
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn app_id(&self) -> AppId {
        self.app_id
    }

    /// Posts an event with this nanoapp as the sender. Rejected once the
    /// nanoapp is stopping.
    pub fn post_event(
        &mut self,
        event_type: EventType,
        payload: EventPayload,
        free_callback: Option<FreeCallback>,
        target: InstanceId,
    ) -> Result<(), ApiError> {
        if self.stopping {
            return Err(ApiError::Stopping);
        }
        self.services
            .handle
            .post_event(event_type, payload, free_callback, self.instance_id, target)
            .map_err(ApiError::from)
    }

    /// Registers for a broadcast event type. Returns false when already
    /// subscribed.
    pub fn subscribe(&mut self, event_type: EventType) -> bool {
        self.subscriptions.insert(event_type)
    }

    pub fn unsubscribe(&mut self, event_type: EventType) -> bool {
        self.subscriptions.remove(&event_type)
    }

    pub fn set_timer(&mut self, delay: Duration, one_shot: bool, cookie: u64) -> TimerId {
        self.services
            .timers
            .set_timer(self.instance_id, delay, one_shot, cookie)
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.services.timers.cancel(id)
    }

    /// Applies a sensor request for this nanoapp and keeps its sample-event
    /// subscription in step with the request mode.
    pub fn configure_sensor(
        &mut self,
        sensor: SensorType,
        request: SensorRequest,
    ) -> Result<(), ApiError> {
        if self.stopping {
            return Err(ApiError::Stopping);
        }
        self.services
            .sensors
            .set_request(self.instance_id, sensor, request)?;
        if let Some(sample_type) = sensor.sample_event_type() {
            if request.mode == SensorMode::Off {
                self.subscriptions.remove(&sample_type);
            } else {
                self.subscriptions.insert(sample_type);
            }
        }
        Ok(())
    }

    /// Requests a scan-monitor state change; the outcome arrives as one
    /// async-result event.
    pub fn configure_scan_monitor(&mut self, enable: bool, cookie: u64) -> bool {
        if self.stopping {
            return false;
        }
        let Services { wifi, handle, .. } = self.services;
        wifi.configure_scan_monitor(self.instance_id, enable, cookie, handle)
    }

    /// Queues a message toward the host daemon, attributed to this nanoapp's
    /// app id.
    pub fn send_message_to_host(
        &mut self,
        host_endpoint: u16,
        message_type: u32,
        payload: Vec<u8>,
    ) -> Result<(), ApiError> {
        if self.stopping {
            return Err(ApiError::Stopping);
        }
        let message = crate::host::HostMessage {
            app_id: self.app_id,
            host_endpoint,
            message_type,
            payload,
        };
        if self.services.host.send_message_to_host(message) {
            Ok(())
        } else {
            Err(ApiError::HostQueueFull)
        }
    }
}

/// Owns the nanoapps, the inbound queue consumer, and the runtime services.
/// Everything here runs on one thread; other threads interact through
/// [`EventLoopHandle`].
pub struct EventLoop {
    shared: Arc<SharedState>,
    rx: Receiver<Inbound>,
    apps: Vec<NanoappRecord>,
    pub(crate) services: Services,
    current: Option<InstanceId>,
    stopping: Option<InstanceId>,
    queue_capacity: usize,
    max_nanoapps: usize,
}

impl EventLoop {
    pub(crate) fn new(
        shared: Arc<SharedState>,
        rx: Receiver<Inbound>,
        services: Services,
        queue_capacity: usize,
        max_nanoapps: usize,
    ) -> Self {
        Self {
            shared,
            rx,
            apps: Vec::new(),
            services,
            current: None,
            stopping: None,
            queue_capacity,
            max_nanoapps,
        }
    }

    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// The nanoapp currently being dispatched, if any.
    pub fn current_nanoapp(&self) -> Option<InstanceId> {
        self.current
    }

    pub fn nanoapp_count(&self) -> usize {
        self.apps.len()
    }

    /// Loads and starts a nanoapp. On failure the record is destroyed and
    /// `end` is never called.
    pub fn start_nanoapp(&mut self, app: Box<dyn Nanoapp>) -> Result<InstanceId, StartNanoappError> {
        let app_id = app.app_id();
        if self.lookup_index_by_app_id(app_id).is_some() {
            warn!(%app_id, "app id already running");
            return Err(StartNanoappError::DuplicateAppId(app_id));
        }
        if self.apps.len() >= self.max_nanoapps {
            warn!(%app_id, "no capacity for another nanoapp");
            return Err(StartNanoappError::Capacity);
        }

        let instance_id = self.shared.next_instance_id();
        let record = NanoappRecord::new(app, instance_id, self.queue_capacity);
        self.shared.register(record.info());
        self.apps.push(record);
        let index = self.apps.len() - 1;

        self.current = Some(instance_id);
        let started = self.with_app_context(index, |app, ctx| app.start(ctx));
        self.current = None;

        if started {
            debug!(%app_id, %instance_id, "nanoapp started");
            Ok(instance_id)
        } else {
            let record = self.apps.pop().expect("record pushed above");
            self.shared.unregister(record.instance_id);
            warn!(%app_id, "nanoapp start() returned false");
            Err(StartNanoappError::StartFailed(app_id))
        }
    }

    /// Unloads a nanoapp with the ordered drain: flush its host-bound
    /// messages, distribute the inbound queue, mark it stopping, drain every
    /// per-app queue, then call `end` and erase the record.
    pub fn unload_nanoapp(&mut self, instance_id: InstanceId, allow_system: bool) -> bool {
        let Some(index) = self.lookup_index_by_instance_id(instance_id) else {
            warn!(%instance_id, "unload of unknown instance");
            return false;
        };
        if self.apps[index].is_system && !allow_system {
            error!(%instance_id, "refusing to unload system nanoapp");
            return false;
        }
        let app_id = self.apps[index].app_id;

        {
            let Services { host, handle, .. } = &mut self.services;
            host.flush_messages_sent_by(app_id, handle);
        }
        self.flush_inbound_event_queue();
        self.stopping = Some(instance_id);
        self.flush_nanoapp_event_queues();
        self.unload_nanoapp_at_index(index);
        self.stopping = None;
        debug!(%instance_id, %app_id, "nanoapp unloaded");
        true
    }

    pub fn find_nanoapp_by_app_id(&self, app_id: AppId) -> Option<NanoappInfo> {
        self.lookup_index_by_app_id(app_id)
            .map(|index| self.apps[index].info())
    }

    pub fn find_nanoapp_by_instance_id(&self, instance_id: InstanceId) -> Option<NanoappInfo> {
        self.lookup_index_by_instance_id(instance_id)
            .map(|index| self.apps[index].info())
    }

    /// Runs until [`EventLoopHandle::stop`] is observed, then drains: all
    /// inbound events are distributed, per-app queues delivered, and the
    /// remaining nanoapps unloaded in reverse load order.
    pub fn run(&mut self) {
        info!("event loop start");
        let mut have_pending = false;
        while self.shared.is_running() {
            if !have_pending || !self.rx.is_empty() {
                match self.rx.recv() {
                    Ok(Inbound::Event(event)) => self.distribute_event(Arc::new(event)),
                    Ok(Inbound::Wake) => {}
                    Err(_) => break,
                }
            }
            have_pending = self.deliver_events();
        }

        self.flush_inbound_event_queue();
        self.flush_nanoapp_event_queues();
        while !self.apps.is_empty() {
            let index = self.apps.len() - 1;
            self.unload_nanoapp_at_index(index);
        }
        info!("event loop exit");
    }

    /// Drains the inbound queue and every per-app queue without blocking.
    /// Intended for single-threaded embeddings and tests.
    pub fn run_until_idle(&mut self) {
        loop {
            self.flush_inbound_event_queue();
            let pending = self.deliver_events();
            if !pending && self.rx.is_empty() {
                break;
            }
        }
    }

    // STAGE 1: fan one inbound event out to every interested nanoapp.
    fn distribute_event(&mut self, event: Arc<Event>) {
        if event.target == InstanceId::SYSTEM {
            self.handle_system_event(&event);
        } else {
            for index in 0..self.apps.len() {
                let record = &mut self.apps[index];
                let wants = (event.target == InstanceId::BROADCAST
                    && record.is_subscribed(event.event_type))
                    || event.target == record.instance_id;
                if wants && !record.post(Arc::clone(&event)) {
                    warn!(
                        instance_id = record.instance_id.0,
                        event_type = %event.event_type,
                        "nanoapp queue full, delivery dropped"
                    );
                }
            }
        }

        if event.is_unreferenced() {
            // System-sent events are routinely consumed without a recipient.
            if event.sender != InstanceId::SYSTEM {
                warn!(event_type = %event.event_type, "dropping event with no recipients");
            }
            self.free_event(event);
        }
    }

    // STAGE 2: one round of round-robin; each app with work gets one event.
    fn deliver_events(&mut self) -> bool {
        let mut have_pending = false;
        for index in 0..self.apps.len() {
            if self.apps[index].has_pending_event() {
                have_pending |= self.deliver_next_event(index);
            }
        }
        have_pending
    }

    fn deliver_next_event(&mut self, index: usize) -> bool {
        if let Some(event) = self.apps[index].pop_event() {
            let instance_id = self.apps[index].instance_id;
            self.current = Some(instance_id);
            self.with_app_context(index, |app, ctx| {
                app.handle_event(ctx, event.sender, event.event_type, event.payload());
            });
            self.current = None;
            event.decrement_ref();
            if event.is_unreferenced() {
                self.free_event(event);
            }
        }
        self.apps[index].has_pending_event()
    }

    fn handle_system_event(&mut self, event: &Arc<Event>) {
        match event.event_type {
            EventType::NONE | EventType::HOST_MESSAGE_FLUSHED => {}
            EventType::SYSTEM_CALLBACK => {
                if let Some(op) = event.payload().downcast_ref::<SystemOp>() {
                    self.services.handle_op(op.clone());
                } else {
                    debug_assert!(false, "system callback without a SystemOp payload");
                    error!("system callback event carried an unexpected payload");
                }
            }
            other => {
                debug!(event_type = %other, "ignoring system-targeted event");
            }
        }
    }

    fn flush_inbound_event_queue(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            if let Inbound::Event(event) = message {
                self.distribute_event(Arc::new(event));
            }
        }
    }

    fn flush_nanoapp_event_queues(&mut self) {
        while self.deliver_events() {}
    }

    fn unload_nanoapp_at_index(&mut self, index: usize) {
        let instance_id = self.apps[index].instance_id;

        self.current = Some(instance_id);
        self.with_app_context(index, |app, ctx| app.end(ctx));
        self.current = None;

        // Release whatever the app still holds against the services.
        self.services.sensors.remove_all_requests(instance_id);
        self.services.timers.cancel_all_for(instance_id);
        self.services.wifi.handle_nanoapp_unloaded(instance_id);

        let mut record = self.apps.remove(index);
        self.shared.unregister(instance_id);
        for event in record.drain_queue() {
            self.free_event(event);
        }
    }

    /// Invokes the event's free callback (with the sender as current app)
    /// and returns the pool slot.
    fn free_event(&mut self, event: Arc<Event>) {
        match Arc::try_unwrap(event) {
            Ok(event) => {
                let sender = event.sender;
                let (event_type, payload, callback) = event.into_free_parts();
                if let Some(callback) = callback {
                    let previous = self.current.take();
                    self.current = self
                        .lookup_index_by_instance_id(sender)
                        .map(|index| self.apps[index].instance_id);
                    callback(event_type, payload);
                    self.current = previous;
                }
            }
            Err(event) => {
                debug_assert!(false, "freeing an event that is still referenced");
                error!(event_type = %event.event_type, "attempted to free a referenced event");
            }
        }
    }

    fn with_app_context<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut dyn Nanoapp, &mut NanoappContext<'_>) -> R,
    ) -> R {
        let stopping = {
            let id = self.apps[index].instance_id;
            self.stopping == Some(id) || !self.shared.is_running()
        };
        let Self { apps, services, .. } = self;
        let record = &mut apps[index];
        let mut ctx = NanoappContext {
            instance_id: record.instance_id,
            app_id: record.app_id,
            stopping,
            subscriptions: &mut record.subscriptions,
            services,
        };
        f(record.app.as_mut(), &mut ctx)
    }

    fn lookup_index_by_app_id(&self, app_id: AppId) -> Option<usize> {
        self.apps.iter().position(|record| record.app_id == app_id)
    }

    fn lookup_index_by_instance_id(&self, instance_id: InstanceId) -> Option<usize> {
        if instance_id == InstanceId::SYSTEM {
            return None;
        }
        self.apps
            .iter()
            .position(|record| record.instance_id == instance_id)
    }
}
